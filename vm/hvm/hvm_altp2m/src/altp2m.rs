// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The altp2m hypercall: decoding, validation and command execution.

use crate::directory::DomainHandle;
use crate::dispatch::HvmOps;
use crate::guest::GuestHandle;
use crate::guest::copy_from_guest;
use crate::guest::copy_to_guest;
use hvm_defs::DomainId;
use hvm_defs::HvmError;
use hvm_defs::HvmResult;
use hvm_defs::altp2m::AltP2mCmd;
use hvm_defs::altp2m::AltP2mOp;
use hvm_defs::altp2m::ChangeGfn;
use hvm_defs::altp2m::DomainState;
use hvm_defs::altp2m::HVMOP_ALTP2M_INTERFACE_VERSION;
use hvm_defs::altp2m::SetMemAccess;
use hvm_defs::altp2m::VcpuEnableNotify;
use hvm_defs::altp2m::View;

/// A structurally valid altp2m command with its typed payload.
#[derive(Debug, Copy, Clone)]
pub enum Altp2mCommand {
    /// Report whether alternate views are active.
    GetDomainState,
    /// Activate or deactivate alternate views.
    SetDomainState {
        /// The requested state.
        active: bool,
    },
    /// Register a notification frame for a vCPU of the calling domain.
    VcpuEnableNotify(VcpuEnableNotify),
    /// Allocate a new view.
    CreateP2m(View),
    /// Release a view.
    DestroyP2m(View),
    /// Make a view the domain default.
    SwitchP2m(View),
    /// Change the access permissions of one frame in one view.
    SetMemAccess(SetMemAccess),
    /// Remap a frame within a view.
    ChangeGfn(ChangeGfn),
}

impl Altp2mCommand {
    /// Validates the header of `op` and decodes its payload.
    ///
    /// Reserved header fields must be zero and the version must match. The
    /// payload's own reserved fields are checked when the command runs.
    pub fn decode(op: &AltP2mOp) -> HvmResult<Self> {
        if op.pad1 != 0 || op.pad2 != 0 {
            return Err(HvmError::InvalidArgument("nonzero altp2m padding"));
        }
        if op.version != HVMOP_ALTP2M_INTERFACE_VERSION {
            return Err(HvmError::InvalidArgument("unsupported altp2m version"));
        }

        let cmd = match op.cmd {
            AltP2mCmd::GET_DOMAIN_STATE => Self::GetDomainState,
            AltP2mCmd::SET_DOMAIN_STATE => Self::SetDomainState {
                active: op.u.domain_state().state != 0,
            },
            AltP2mCmd::VCPU_ENABLE_NOTIFY => Self::VcpuEnableNotify(op.u.vcpu_enable_notify()),
            AltP2mCmd::CREATE_P2M => Self::CreateP2m(op.u.view()),
            AltP2mCmd::DESTROY_P2M => Self::DestroyP2m(op.u.view()),
            AltP2mCmd::SWITCH_P2M => Self::SwitchP2m(op.u.view()),
            AltP2mCmd::SET_MEM_ACCESS => Self::SetMemAccess(op.u.set_mem_access()),
            AltP2mCmd::CHANGE_GFN => Self::ChangeGfn(op.u.change_gfn()),
            _ => return Err(HvmError::InvalidArgument("unknown altp2m command")),
        };
        Ok(cmd)
    }

    /// The wire command number.
    pub fn cmd(&self) -> AltP2mCmd {
        match self {
            Self::GetDomainState => AltP2mCmd::GET_DOMAIN_STATE,
            Self::SetDomainState { .. } => AltP2mCmd::SET_DOMAIN_STATE,
            Self::VcpuEnableNotify(_) => AltP2mCmd::VCPU_ENABLE_NOTIFY,
            Self::CreateP2m(_) => AltP2mCmd::CREATE_P2M,
            Self::DestroyP2m(_) => AltP2mCmd::DESTROY_P2M,
            Self::SwitchP2m(_) => AltP2mCmd::SWITCH_P2M,
            Self::SetMemAccess(_) => AltP2mCmd::SET_MEM_ACCESS,
            Self::ChangeGfn(_) => AltP2mCmd::CHANGE_GFN,
        }
    }

    /// Returns true if the command may only run once alternate views are
    /// active.
    pub fn requires_active(&self) -> bool {
        !matches!(self, Self::GetDomainState | Self::SetDomainState { .. })
    }

    /// Returns true if the command always targets the calling domain.
    fn targets_caller(&self) -> bool {
        matches!(self, Self::VcpuEnableNotify(_))
    }
}

/// How an accepted altp2m command finished.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Altp2mOutcome {
    /// The command took effect.
    Completed,
    /// The command is part of the interface but has no effect yet. Callers
    /// see success.
    Reserved,
}

impl HvmOps {
    /// Handles [`HvmOp::ALTP2M`](hvm_defs::HvmOp::ALTP2M).
    pub(crate) fn hvm_altp2m_op(
        &self,
        caller: DomainId,
        arg: Option<&dyn GuestHandle>,
    ) -> HvmResult<Altp2mOutcome> {
        if !self.altp2m_supported {
            return Err(HvmError::NotSupported);
        }

        let mut a: AltP2mOp = copy_from_guest(arg)?;
        let cmd = Altp2mCommand::decode(&a)?;

        let d = if cmd.targets_caller() {
            DomainHandle::lock_current(self.directory.as_ref(), caller)?
        } else {
            DomainHandle::lock_by_any_id(self.directory.as_ref(), a.domain, caller)?
        };

        if cmd.requires_active() && !d.altp2m_active() {
            return Err(HvmError::NotSupported);
        }

        self.xsm
            .hvm_altp2m_op(caller, &d)
            .map_err(HvmError::Denied)?;

        let outcome = match cmd {
            Altp2mCommand::GetDomainState => {
                if !d.altp2m_enabled() {
                    return Err(HvmError::InvalidArgument("altp2m not enabled"));
                }
                a.u = DomainState::new(d.altp2m_active()).into();
                copy_to_guest(arg, &a)?;
                Altp2mOutcome::Completed
            }
            Altp2mCommand::SetDomainState { active } => {
                if !d.altp2m_enabled() {
                    return Err(HvmError::InvalidArgument("altp2m not enabled"));
                }
                d.set_altp2m_active(active)?;
                Altp2mOutcome::Completed
            }
            Altp2mCommand::CreateP2m(mut view) => {
                view.view = d.create_view()?.get();
                a.u = view.into();
                copy_to_guest(arg, &a)?;
                Altp2mOutcome::Completed
            }
            Altp2mCommand::SwitchP2m(view) => {
                d.switch_default_view(view.view)?;
                Altp2mOutcome::Completed
            }
            Altp2mCommand::SetMemAccess(access) => {
                if access.pad != 0 {
                    return Err(HvmError::InvalidArgument("nonzero set_mem_access padding"));
                }
                d.set_mem_access(access.view, access.gfn, access.access)?;
                Altp2mOutcome::Completed
            }
            Altp2mCommand::VcpuEnableNotify(_)
            | Altp2mCommand::DestroyP2m(_)
            | Altp2mCommand::ChangeGfn(_) => {
                tracing::debug!(
                    domain = %d.id(),
                    cmd = ?cmd.cmd(),
                    "reserved altp2m command accepted"
                );
                Altp2mOutcome::Reserved
            }
        };
        Ok(outcome)
    }
}
