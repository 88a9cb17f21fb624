// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Boot command line options for the HVM layer.

/// Enable alternate translation views.
///
/// Accepted forms:
/// * `altp2m`: enable.
/// * `altp2m=<bool>`: `1`, `on`, `yes`, `true` and `enable` enable;
///   `0`, `off`, `no`, `false` and `disable` disable.
/// * `no-altp2m`: disable.
const ALTP2M: &str = "altp2m";

/// Platform-level HVM settings, fixed at boot.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct HvmConfig {
    /// Alternate translation views may be used by any domain. Disabled by
    /// default.
    pub altp2m_supported: bool,
}

impl HvmConfig {
    /// Returns the default configuration.
    pub const fn new() -> Self {
        HvmConfig {
            altp2m_supported: false,
        }
    }

    /// Parse arguments from a command line. Unrecognized arguments are
    /// ignored.
    pub fn parse(&mut self, cmdline: &str) {
        for arg in cmdline.split_whitespace() {
            let (name, value) = match arg.split_once('=') {
                Some((name, value)) => (name, Some(value)),
                None => (arg, None),
            };

            if name == ALTP2M {
                match value.map_or(Some(true), parse_bool) {
                    Some(enable) => self.altp2m_supported = enable,
                    None => tracing::warn!(arg, "ignoring malformed boolean option"),
                }
            } else if value.is_none() && name.strip_prefix("no-") == Some(ALTP2M) {
                self.altp2m_supported = false;
            }
        }
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value {
        "1" | "on" | "yes" | "true" | "enable" => Some(true),
        "0" | "off" | "no" | "false" | "disable" => Some(false),
        _ => None,
    }
}
