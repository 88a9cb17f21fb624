// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Definitions for the HVM hypercall interface: opcodes, argument records,
//! parameter indices, and the error taxonomy returned to callers.

#![forbid(unsafe_code)]
#![no_std]

pub mod altp2m;

use core::fmt;
use thiserror::Error;
use zerocopy::FromBytes;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;

/// Identifies a domain.
#[repr(transparent)]
#[derive(
    Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, IntoBytes, FromBytes, Immutable, KnownLayout,
)]
pub struct DomainId(pub u16);

impl DomainId {
    /// Resolves to the domain issuing the hypercall.
    pub const SELF: Self = Self(0x7ff0);

    /// The first domain, which is trusted to control all others.
    pub const CONTROL: Self = Self(0);
}

impl fmt::Debug for DomainId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if *self == Self::SELF {
            f.pad("DOMID_SELF")
        } else {
            write!(f, "d{}", self.0)
        }
    }
}

impl fmt::Display for DomainId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// An HVM hypercall opcode.
#[repr(transparent)]
#[derive(Copy, Clone, PartialEq, Eq, Hash)]
pub struct HvmOp(pub u64);

impl HvmOp {
    /// Writes one entry of the domain's parameter table.
    pub const SET_PARAM: Self = Self(0);
    /// Reads one entry of the domain's parameter table.
    pub const GET_PARAM: Self = Self(1);
    /// Raises a guest-request event to the attached monitor. Takes no argument.
    pub const GUEST_REQUEST_VM_EVENT: Self = Self(24);
    /// Alternate translation view management, see [`altp2m::AltP2mOp`].
    pub const ALTP2M: Self = Self(25);
}

impl fmt::Debug for HvmOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match *self {
            Self::SET_PARAM => "SET_PARAM",
            Self::GET_PARAM => "GET_PARAM",
            Self::GUEST_REQUEST_VM_EVENT => "GUEST_REQUEST_VM_EVENT",
            Self::ALTP2M => "ALTP2M",
            _ => return write!(f, "HvmOp({})", self.0),
        };
        f.pad(name)
    }
}

/// HVM parameter indices.
pub mod params {
    /// Non-zero if the domain may activate alternate translation views.
    pub const HVM_PARAM_ALTP2M: u32 = 35;

    /// The number of entries in a domain's parameter table.
    pub const HVM_NR_PARAMS: u32 = 36;
}

/// Argument record for [`HvmOp::SET_PARAM`] and [`HvmOp::GET_PARAM`].
#[repr(C)]
#[derive(Debug, Copy, Clone, IntoBytes, FromBytes, Immutable, KnownLayout)]
pub struct HvmParam {
    /// The target domain.
    pub domid: DomainId,
    /// Implicit in the C layout; never interpreted.
    pub _pad: u16,
    /// The parameter index, below [`params::HVM_NR_PARAMS`].
    pub index: u32,
    /// The value written, or the value read back.
    pub value: u64,
}

static_assertions::const_assert_eq!(size_of::<HvmParam>(), 16);

/// A positive errno value, as used by the hypercall ABI.
#[repr(transparent)]
#[derive(Copy, Clone, PartialEq, Eq, Hash)]
pub struct Errno(pub i32);

impl Errno {
    /// Operation not permitted.
    pub const EPERM: Self = Self(1);
    /// No such process (here: no such domain).
    pub const ESRCH: Self = Self(3);
    /// Out of memory.
    pub const ENOMEM: Self = Self(12);
    /// Bad address.
    pub const EFAULT: Self = Self(14);
    /// Device or resource busy.
    pub const EBUSY: Self = Self(16);
    /// Invalid argument.
    pub const EINVAL: Self = Self(22);
    /// Function not implemented.
    pub const ENOSYS: Self = Self(38);
    /// Operation not supported.
    pub const EOPNOTSUPP: Self = Self(95);

    /// Returns the negative status value handed back to the caller.
    pub const fn status(self) -> i64 {
        -(self.0 as i64)
    }
}

impl fmt::Debug for Errno {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match *self {
            Self::EPERM => "EPERM",
            Self::ESRCH => "ESRCH",
            Self::ENOMEM => "ENOMEM",
            Self::EFAULT => "EFAULT",
            Self::EBUSY => "EBUSY",
            Self::EINVAL => "EINVAL",
            Self::ENOSYS => "ENOSYS",
            Self::EOPNOTSUPP => "EOPNOTSUPP",
            _ => return write!(f, "Errno({})", self.0),
        };
        f.pad(name)
    }
}

/// An error returned from an HVM hypercall.
#[derive(Debug, Error, Copy, Clone, PartialEq, Eq)]
pub enum HvmError {
    /// The feature is unavailable on this platform, or has not been activated
    /// for the target domain.
    #[error("operation not supported")]
    NotSupported,
    /// The argument record is malformed.
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
    /// The domain id does not name a live domain.
    #[error("no such domain {0}")]
    NoSuchDomain(DomainId),
    /// The argument buffer could not be read or written.
    #[error("bad guest address")]
    BadAddress,
    /// The security policy rejected the operation.
    #[error("denied by security policy ({0:?})")]
    Denied(Errno),
    /// The opcode is not recognized.
    #[error("hvm op {0:?} not implemented")]
    NotImplemented(HvmOp),
    /// The translation backing store failed the request.
    #[error("translation backing store failed ({0:?})")]
    Backing(Errno),
}

impl HvmError {
    /// Returns the errno reported for this error.
    pub fn errno(&self) -> Errno {
        match *self {
            HvmError::NotSupported => Errno::EOPNOTSUPP,
            HvmError::InvalidArgument(_) => Errno::EINVAL,
            HvmError::NoSuchDomain(_) => Errno::ESRCH,
            HvmError::BadAddress => Errno::EFAULT,
            HvmError::Denied(errno) => errno,
            HvmError::NotImplemented(_) => Errno::ENOSYS,
            HvmError::Backing(errno) => errno,
        }
    }

    /// Returns the negative status value handed back to the caller.
    pub fn status(&self) -> i64 {
        self.errno().status()
    }
}

/// The result of an HVM hypercall.
pub type HvmResult<T> = Result<T, HvmError>;
