// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! HVM hypercall handling and the alternate translation view ("altp2m")
//! control plane.
//!
//! A domain normally runs with a single guest-physical to machine
//! translation, the host view. Once a privileged monitor enables the
//! `HVM_PARAM_ALTP2M` parameter and activates alternate views, each vCPU of
//! the domain is bound to one of up to [`MAX_ALTP2M`] independently
//! permissioned views, and [`altp2m_vcpu_update_p2m`] installs that view's
//! translation context every time the vCPU resumes.
//!
//! Hypercalls enter through [`HvmOps::do_hvm_op`]. Everything outside this
//! crate is reached through traits: domains are resolved by a
//! [`DomainDirectory`], authorization is decided by an [`XsmPolicy`],
//! translation tables are owned by an [`AltP2mBacking`], and the hardware
//! translation register is a [`TranslationRegister`].

#![forbid(unsafe_code)]

mod altp2m;
mod backing;
mod config;
mod directory;
mod dispatch;
mod domain;
mod guest;
mod param;
mod policy;
mod resume;
mod view;

#[cfg(test)]
mod tests;

/// Mock collaborators for exercising the control plane.
pub mod test_helpers;

pub use altp2m::Altp2mCommand;
pub use altp2m::Altp2mOutcome;
pub use backing::AltP2mBacking;
pub use backing::TranslationContext;
pub use backing::TranslationRegister;
pub use config::HvmConfig;
pub use directory::DomainDirectory;
pub use directory::DomainHandle;
pub use directory::DomainTable;
pub use dispatch::HvmOps;
pub use domain::Altp2mSnapshot;
pub use domain::Domain;
pub use domain::InvariantViolation;
pub use domain::Vcpu;
pub use guest::GuestAccessFault;
pub use guest::GuestBuffer;
pub use guest::GuestHandle;
pub use policy::DummyXsm;
pub use policy::NoMonitor;
pub use policy::VmEventMonitor;
pub use policy::XsmPolicy;
pub use resume::altp2m_vcpu_update_p2m;
pub use view::MAX_ALTP2M;
pub use view::ViewId;
pub use view::ViewSet;
