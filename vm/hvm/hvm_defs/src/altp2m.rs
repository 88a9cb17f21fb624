// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Argument records for [`HvmOp::ALTP2M`](crate::HvmOp::ALTP2M).
//!
//! Every request is a single fixed-size [`AltP2mOp`]: a versioned header
//! followed by a union whose interpretation depends on the command. The
//! union is carried as raw bytes; use the typed accessors to view it as the
//! record for a specific command.

use crate::DomainId;
use core::fmt;
use zerocopy::FromBytes;
use zerocopy::FromZeros;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;

/// The only supported value of [`AltP2mOp::version`].
pub const HVMOP_ALTP2M_INTERFACE_VERSION: u32 = 1;

/// An altp2m command number.
#[repr(transparent)]
#[derive(Copy, Clone, PartialEq, Eq, Hash, IntoBytes, FromBytes, Immutable, KnownLayout)]
pub struct AltP2mCmd(pub u32);

impl AltP2mCmd {
    /// Query whether alternate views are active for a domain.
    pub const GET_DOMAIN_STATE: Self = Self(0);
    /// Activate or deactivate alternate views for a domain.
    pub const SET_DOMAIN_STATE: Self = Self(1);
    /// Register a per-vCPU notification page. Reserved.
    pub const VCPU_ENABLE_NOTIFY: Self = Self(2);
    /// Allocate a new view.
    pub const CREATE_P2M: Self = Self(3);
    /// Release a view. Reserved.
    pub const DESTROY_P2M: Self = Self(4);
    /// Change the default view of a domain.
    pub const SWITCH_P2M: Self = Self(5);
    /// Set the access permissions of one frame in one view.
    pub const SET_MEM_ACCESS: Self = Self(6);
    /// Remap a frame within a view. Reserved.
    pub const CHANGE_GFN: Self = Self(7);
}

impl fmt::Debug for AltP2mCmd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match *self {
            Self::GET_DOMAIN_STATE => "GET_DOMAIN_STATE",
            Self::SET_DOMAIN_STATE => "SET_DOMAIN_STATE",
            Self::VCPU_ENABLE_NOTIFY => "VCPU_ENABLE_NOTIFY",
            Self::CREATE_P2M => "CREATE_P2M",
            Self::DESTROY_P2M => "DESTROY_P2M",
            Self::SWITCH_P2M => "SWITCH_P2M",
            Self::SET_MEM_ACCESS => "SET_MEM_ACCESS",
            Self::CHANGE_GFN => "CHANGE_GFN",
            _ => return write!(f, "AltP2mCmd({})", self.0),
        };
        f.pad(name)
    }
}

/// Per-frame access permissions. Interpretation, including rejection of
/// unknown values, belongs to the translation backing store.
#[repr(transparent)]
#[derive(
    Debug, Copy, Clone, PartialEq, Eq, Hash, IntoBytes, FromBytes, Immutable, KnownLayout,
)]
pub struct MemAccess(pub u8);

impl MemAccess {
    /// No access.
    pub const N: Self = Self(0);
    /// Read only.
    pub const R: Self = Self(1);
    /// Write only.
    pub const W: Self = Self(2);
    /// Read and write.
    pub const RW: Self = Self(3);
    /// Execute only.
    pub const X: Self = Self(4);
    /// Read and execute.
    pub const RX: Self = Self(5);
    /// Write and execute.
    pub const WX: Self = Self(6);
    /// Full access.
    pub const RWX: Self = Self(7);
    /// Read and execute, upgraded to read/write on the first write fault.
    pub const RX2RW: Self = Self(8);
    /// No access, upgraded to full access on the first fault.
    pub const N2RWX: Self = Self(9);
    /// The default access of the view.
    pub const DEFAULT: Self = Self(10);
}

/// The argument record for [`HvmOp::ALTP2M`](crate::HvmOp::ALTP2M).
#[repr(C)]
#[derive(Debug, Copy, Clone, IntoBytes, FromBytes, Immutable, KnownLayout)]
pub struct AltP2mOp {
    /// Must be [`HVMOP_ALTP2M_INTERFACE_VERSION`].
    pub version: u32,
    /// The command.
    pub cmd: AltP2mCmd,
    /// The target domain, or [`DomainId::SELF`].
    pub domain: DomainId,
    /// Must be zero.
    pub pad1: u16,
    /// Must be zero.
    pub pad2: u32,
    /// Command-specific data.
    pub u: AltP2mPayload,
}

static_assertions::const_assert_eq!(size_of::<AltP2mOp>(), 40);

impl AltP2mOp {
    /// Builds a request for `cmd` against `domain` with an all-zero payload.
    pub fn new(domain: DomainId, cmd: AltP2mCmd) -> Self {
        Self {
            version: HVMOP_ALTP2M_INTERFACE_VERSION,
            cmd,
            domain,
            pad1: 0,
            pad2: 0,
            u: AltP2mPayload::new_zeroed(),
        }
    }

    /// Replaces the payload.
    pub fn with_payload(mut self, payload: impl Into<AltP2mPayload>) -> Self {
        self.u = payload.into();
        self
    }
}

/// The command-specific union of an [`AltP2mOp`], sized to its largest
/// member.
#[repr(C, align(8))]
#[derive(Copy, Clone, PartialEq, Eq, IntoBytes, FromBytes, Immutable, KnownLayout)]
pub struct AltP2mPayload([u8; 24]);

impl fmt::Debug for AltP2mPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02x?}", self.0)
    }
}

impl AltP2mPayload {
    /// Views the payload as a domain state record.
    pub fn domain_state(&self) -> DomainState {
        zerocopy::transmute!(self.0)
    }

    /// Views the payload as a vCPU notification record.
    pub fn vcpu_enable_notify(&self) -> VcpuEnableNotify {
        zerocopy::transmute!(self.0)
    }

    /// Views the payload as a view record.
    pub fn view(&self) -> View {
        zerocopy::transmute!(self.0)
    }

    /// Views the payload as a memory access record.
    pub fn set_mem_access(&self) -> SetMemAccess {
        zerocopy::transmute!(self.0)
    }

    /// Views the payload as a frame remapping record.
    pub fn change_gfn(&self) -> ChangeGfn {
        zerocopy::transmute!(self.0)
    }
}

macro_rules! payload_from {
    ($($ty:ty),* $(,)?) => {
        $(
            impl From<$ty> for AltP2mPayload {
                fn from(value: $ty) -> Self {
                    Self(zerocopy::transmute!(value))
                }
            }
        )*
    };
}

payload_from!(DomainState, VcpuEnableNotify, View, SetMemAccess, ChangeGfn);

/// Payload of get/set domain state.
#[repr(C)]
#[derive(Debug, Copy, Clone, IntoBytes, FromBytes, Immutable, KnownLayout)]
pub struct DomainState {
    /// Non-zero if alternate views are (to be) active.
    pub state: u8,
    /// Unused remainder of the union.
    pub _rsvd: [u8; 23],
}

impl DomainState {
    /// Builds a domain state payload.
    pub fn new(active: bool) -> Self {
        Self {
            state: active.into(),
            _rsvd: [0; 23],
        }
    }
}

/// Payload of vcpu-enable-notify.
#[repr(C)]
#[derive(Debug, Copy, Clone, IntoBytes, FromBytes, Immutable, KnownLayout)]
pub struct VcpuEnableNotify {
    /// The vCPU to notify.
    pub vcpu_id: u32,
    /// Must be zero.
    pub pad: u32,
    /// The notification frame.
    pub gfn: u64,
    /// Unused remainder of the union.
    pub _rsvd: u64,
}

/// Payload of create, destroy, and switch view.
#[repr(C)]
#[derive(Debug, Copy, Clone, IntoBytes, FromBytes, Immutable, KnownLayout)]
pub struct View {
    /// The view id. Written back by create.
    pub view: u16,
    /// The default access for frames of a newly created view.
    pub hvmmem_default_access: u16,
    /// Unused remainder of the union.
    pub _rsvd: [u8; 20],
}

impl View {
    /// Builds a view payload.
    pub fn new(view: u16) -> Self {
        Self {
            view,
            hvmmem_default_access: 0,
            _rsvd: [0; 20],
        }
    }
}

/// Payload of set-memory-access.
#[repr(C)]
#[derive(Debug, Copy, Clone, IntoBytes, FromBytes, Immutable, KnownLayout)]
pub struct SetMemAccess {
    /// The view to modify.
    pub view: u16,
    /// Must be zero.
    pub pad: u16,
    /// Implicit in the C layout; never interpreted.
    pub _rsvd0: u32,
    /// The guest frame to modify.
    pub gfn: u64,
    /// The new access permissions.
    pub access: MemAccess,
    /// Unused remainder of the union.
    pub _rsvd1: [u8; 7],
}

impl SetMemAccess {
    /// Builds a memory access payload.
    pub fn new(view: u16, gfn: u64, access: MemAccess) -> Self {
        Self {
            view,
            pad: 0,
            _rsvd0: 0,
            gfn,
            access,
            _rsvd1: [0; 7],
        }
    }
}

/// Payload of change-gfn.
#[repr(C)]
#[derive(Debug, Copy, Clone, IntoBytes, FromBytes, Immutable, KnownLayout)]
pub struct ChangeGfn {
    /// The view to modify.
    pub view: u16,
    /// Must be zero.
    pub pad1: u16,
    /// Must be zero.
    pub pad2: u32,
    /// The frame to remap.
    pub old_gfn: u64,
    /// The frame it should translate to.
    pub new_gfn: u64,
}

static_assertions::const_assert_eq!(size_of::<DomainState>(), 24);
static_assertions::const_assert_eq!(size_of::<VcpuEnableNotify>(), 24);
static_assertions::const_assert_eq!(size_of::<View>(), 24);
static_assertions::const_assert_eq!(size_of::<SetMemAccess>(), 24);
static_assertions::const_assert_eq!(size_of::<ChangeGfn>(), 24);
