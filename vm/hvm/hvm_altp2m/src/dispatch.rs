// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The HVM hypercall entry point.

use crate::config::HvmConfig;
use crate::directory::DomainDirectory;
use crate::guest::GuestHandle;
use crate::policy::VmEventMonitor;
use crate::policy::XsmPolicy;
use hvm_defs::DomainId;
use hvm_defs::HvmError;
use hvm_defs::HvmOp;
use hvm_defs::HvmResult;
use std::sync::Arc;

/// Routes HVM hypercalls to their handlers.
pub struct HvmOps {
    pub(crate) altp2m_supported: bool,
    pub(crate) directory: Arc<dyn DomainDirectory>,
    pub(crate) xsm: Arc<dyn XsmPolicy>,
    monitor: Arc<dyn VmEventMonitor>,
}

impl HvmOps {
    /// Creates a dispatcher. The altp2m feature switch is taken from
    /// `config` now and never re-read.
    pub fn new(
        config: &HvmConfig,
        directory: Arc<dyn DomainDirectory>,
        xsm: Arc<dyn XsmPolicy>,
        monitor: Arc<dyn VmEventMonitor>,
    ) -> Self {
        tracing::info!(altp2m = config.altp2m_supported, "hvm ops initialized");
        Self {
            altp2m_supported: config.altp2m_supported,
            directory,
            xsm,
            monitor,
        }
    }

    /// Executes hypercall `op` on behalf of `caller` and returns its status:
    /// zero on success, a negated errno on failure.
    ///
    /// `arg` is the caller's argument buffer, or `None` if a null pointer was
    /// passed.
    pub fn do_hvm_op(
        &self,
        caller: DomainId,
        op: HvmOp,
        arg: Option<&dyn GuestHandle>,
    ) -> i64 {
        match self.hvm_op(caller, op, arg) {
            Ok(()) => 0,
            Err(err) => {
                tracing::debug!(
                    domain = %caller,
                    ?op,
                    error = &err as &dyn std::error::Error,
                    "hvm op failed"
                );
                err.status()
            }
        }
    }

    fn hvm_op(&self, caller: DomainId, op: HvmOp, arg: Option<&dyn GuestHandle>) -> HvmResult<()> {
        match op {
            HvmOp::SET_PARAM | HvmOp::GET_PARAM => self.hvm_param(caller, op, arg),
            HvmOp::ALTP2M => self.hvm_altp2m_op(caller, arg).map(drop),
            HvmOp::GUEST_REQUEST_VM_EVENT => {
                if arg.is_some() {
                    return Err(HvmError::InvalidArgument("guest request takes no argument"));
                }
                self.monitor.guest_request(caller);
                Ok(())
            }
            _ => {
                tracing::debug!(domain = %caller, ?op, "hvm op not implemented");
                Err(HvmError::NotImplemented(op))
            }
        }
    }
}
