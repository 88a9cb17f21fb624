// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Authorization hooks consulted before an HVM operation touches a domain.

use crate::domain::Domain;
use hvm_defs::DomainId;
use hvm_defs::Errno;
use hvm_defs::HvmOp;

/// Decides whether a caller may perform an HVM operation on a domain.
///
/// A rejection carries the errno that is returned to the caller unchanged.
pub trait XsmPolicy: Send + Sync {
    /// Checks a parameter read or write.
    fn hvm_param(&self, caller: DomainId, domain: &Domain, op: HvmOp) -> Result<(), Errno>;

    /// Checks an altp2m command.
    fn hvm_altp2m_op(&self, caller: DomainId, domain: &Domain) -> Result<(), Errno>;
}

/// The default policy: a domain may act on itself, and the control domain
/// may act on any domain.
#[derive(Debug, Default, Copy, Clone)]
pub struct DummyXsm;

impl DummyXsm {
    fn target(caller: DomainId, domain: &Domain) -> Result<(), Errno> {
        if caller == domain.id() || caller == DomainId::CONTROL {
            Ok(())
        } else {
            Err(Errno::EPERM)
        }
    }
}

impl XsmPolicy for DummyXsm {
    fn hvm_param(&self, caller: DomainId, domain: &Domain, _op: HvmOp) -> Result<(), Errno> {
        Self::target(caller, domain)
    }

    fn hvm_altp2m_op(&self, caller: DomainId, domain: &Domain) -> Result<(), Errno> {
        Self::target(caller, domain)
    }
}

/// Receives guest-raised monitor events.
pub trait VmEventMonitor: Send + Sync {
    /// The calling domain raised a guest request.
    fn guest_request(&self, caller: DomainId);
}

/// A monitor that discards every event.
#[derive(Debug, Default, Copy, Clone)]
pub struct NoMonitor;

impl VmEventMonitor for NoMonitor {
    fn guest_request(&self, _caller: DomainId) {}
}
