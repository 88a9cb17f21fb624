// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Interfaces to the translation table manager and to the hardware register
//! that selects the active translation context.

use crate::view::ViewId;
use hvm_defs::Errno;
use hvm_defs::altp2m::MemAccess;

/// The value the translation unit consults to find the root of the active
/// translation tables for a vCPU.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct TranslationContext(pub u64);

/// Owns the translation tables of a domain's host view and of its alternate
/// views.
///
/// The control plane guarantees that a view is only passed to
/// [`destroy_view`](Self::destroy_view), [`switch_default_view`](Self::switch_default_view)
/// and [`set_mem_access`](Self::set_mem_access) after a successful
/// [`init_view`](Self::init_view), and that no vCPU is bound to a view once
/// `destroy_view` has been called for it.
pub trait AltP2mBacking: Send + Sync {
    /// Constructs the translation tables for `view`.
    fn init_view(&self, view: ViewId) -> Result<(), Errno>;

    /// Flushes and releases the translation tables for `view`.
    fn destroy_view(&self, view: ViewId);

    /// Makes `view` the default view of the domain.
    fn switch_default_view(&self, view: ViewId) -> Result<(), Errno>;

    /// Sets the access permissions of guest frame `gfn` in `view`.
    fn set_mem_access(&self, view: ViewId, gfn: u64, access: MemAccess) -> Result<(), Errno>;

    /// Returns the translation context of the host view.
    fn host_context(&self) -> TranslationContext;

    /// Returns the translation context of `view`, or `None` if it has no
    /// valid tables.
    ///
    /// Called on every vCPU resume; must not block or allocate.
    fn view_context(&self, view: ViewId) -> Option<TranslationContext>;
}

/// The per-vCPU hardware register naming the active translation context.
pub trait TranslationRegister {
    /// Installs `context` for the vCPU that is about to resume.
    fn install(&mut self, context: TranslationContext);
}
