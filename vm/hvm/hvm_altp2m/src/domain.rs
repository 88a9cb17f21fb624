// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Per-domain and per-vCPU alternate translation state.
//!
//! The altp2m fields of a [`Domain`] are guarded by their own lock, separate
//! from whatever keeps the domain alive. Activation and deactivation hold it
//! exclusively for their whole duration. View creation holds it upgradable
//! and only upgrades to publish the view. Operations that only need the views
//! to stay alive, including the vCPU resume path, hold it shared.

use crate::backing::AltP2mBacking;
use crate::view::ViewId;
use crate::view::ViewSet;
use hvm_defs::DomainId;
use hvm_defs::HvmError;
use hvm_defs::HvmResult;
use hvm_defs::altp2m::MemAccess;
use hvm_defs::params::HVM_NR_PARAMS;
use hvm_defs::params::HVM_PARAM_ALTP2M;
use parking_lot::Mutex;
use parking_lot::RwLock;
use parking_lot::RwLockReadGuard;
use parking_lot::RwLockUpgradableReadGuard;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::AtomicU16;
use std::sync::atomic::Ordering;
use thiserror::Error;

/// Binding value meaning "use the host view".
const NO_VIEW: u16 = u16::MAX;

/// A virtual processor of a [`Domain`].
pub struct Vcpu {
    index: u32,
    domain: DomainId,
    /// Only written with the owning domain's altp2m lock held exclusively.
    view: AtomicU16,
}

impl Vcpu {
    fn new(domain: DomainId, index: u32) -> Self {
        Self {
            index,
            domain,
            view: AtomicU16::new(NO_VIEW),
        }
    }

    /// The index of this vCPU within its domain.
    pub fn index(&self) -> u32 {
        self.index
    }

    /// The domain this vCPU belongs to.
    pub fn domain_id(&self) -> DomainId {
        self.domain
    }

    /// The view this vCPU is bound to, or `None` for the host view.
    pub fn altp2m_view(&self) -> Option<ViewId> {
        ViewId::new(self.view.load(Ordering::Acquire))
    }

    fn bind(&self, view: Option<ViewId>) {
        self.view
            .store(view.map_or(NO_VIEW, ViewId::get), Ordering::Release);
    }
}

impl fmt::Debug for Vcpu {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Vcpu")
            .field("index", &self.index)
            .field("domain", &self.domain)
            .field("view", &self.altp2m_view())
            .finish()
    }
}

#[derive(Debug, Default)]
pub(crate) struct Altp2mState {
    pub active: bool,
    pub views: ViewSet,
}

/// A domain, as seen by the HVM hypercall layer.
pub struct Domain {
    id: DomainId,
    params: Mutex<[u64; HVM_NR_PARAMS as usize]>,
    altp2m: RwLock<Altp2mState>,
    vcpus: Vec<Vcpu>,
    backing: Arc<dyn AltP2mBacking>,
}

impl fmt::Debug for Domain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Domain")
            .field("id", &self.id)
            .field("altp2m", &*self.altp2m.read())
            .field("vcpus", &self.vcpus)
            .finish()
    }
}

impl Domain {
    /// Creates a domain with `vcpu_count` vCPUs whose translation tables are
    /// owned by `backing`. Alternate views start disabled and inactive.
    pub fn new(id: DomainId, vcpu_count: u32, backing: Arc<dyn AltP2mBacking>) -> Self {
        Self {
            id,
            params: Mutex::new([0; HVM_NR_PARAMS as usize]),
            altp2m: RwLock::new(Altp2mState::default()),
            vcpus: (0..vcpu_count).map(|index| Vcpu::new(id, index)).collect(),
            backing,
        }
    }

    /// The domain id.
    pub fn id(&self) -> DomainId {
        self.id
    }

    /// The domain's vCPUs.
    pub fn vcpus(&self) -> &[Vcpu] {
        &self.vcpus
    }

    /// Reads an entry of the parameter table.
    pub fn param(&self, index: u32) -> HvmResult<u64> {
        self.params
            .lock()
            .get(index as usize)
            .copied()
            .ok_or(HvmError::InvalidArgument("parameter index out of range"))
    }

    /// Writes an entry of the parameter table. The value is not interpreted.
    pub fn set_param(&self, index: u32, value: u64) -> HvmResult<()> {
        let mut params = self.params.lock();
        let slot = params
            .get_mut(index as usize)
            .ok_or(HvmError::InvalidArgument("parameter index out of range"))?;
        *slot = value;
        Ok(())
    }

    /// Returns true if the parameter table allows alternate views.
    pub fn altp2m_enabled(&self) -> bool {
        self.params.lock()[HVM_PARAM_ALTP2M as usize] != 0
    }

    /// Returns true if alternate views are in effect.
    pub fn altp2m_active(&self) -> bool {
        self.altp2m.read().active
    }

    /// Captures a consistent view of the domain's altp2m state.
    pub fn altp2m_snapshot(&self) -> Altp2mSnapshot {
        let state = self.altp2m.read();
        Altp2mSnapshot {
            enabled: self.altp2m_enabled(),
            active: state.active,
            views: state.views,
            bindings: self.vcpus.iter().map(Vcpu::altp2m_view).collect(),
        }
    }

    pub(crate) fn backing(&self) -> &dyn AltP2mBacking {
        self.backing.as_ref()
    }

    pub(crate) fn altp2m_state(&self) -> RwLockReadGuard<'_, Altp2mState> {
        self.altp2m.read()
    }

    /// Activates or deactivates alternate views. Returns false if the domain
    /// was already in the requested state.
    ///
    /// Activation creates the default view before any vCPU is bound to it;
    /// deactivation unbinds every vCPU before any view is destroyed.
    pub(crate) fn set_altp2m_active(&self, requested: bool) -> HvmResult<bool> {
        let mut state = self.altp2m.write();
        if state.active == requested {
            return Ok(false);
        }

        if requested {
            self.backing
                .init_view(ViewId::DEFAULT)
                .map_err(|errno| self.backing_failed("init default view", errno))?;

            state.views.insert(ViewId::DEFAULT);
            state.active = true;
            for vcpu in &self.vcpus {
                vcpu.bind(Some(ViewId::DEFAULT));
            }
            tracing::info!(domain = %self.id, vcpus = self.vcpus.len(), "altp2m activated");
        } else {
            let views = state.views;
            self.teardown(&mut state);
            tracing::info!(domain = %self.id, ?views, "altp2m deactivated");
        }
        Ok(true)
    }

    /// Allocates the lowest free view id and has the backing store construct
    /// it.
    ///
    /// The tables are built under an upgradable read, which excludes
    /// activation changes and other creations but not vCPU resume. The
    /// exclusive lock is only taken to publish the new view.
    pub(crate) fn create_view(&self) -> HvmResult<ViewId> {
        let state = self.altp2m.upgradable_read();
        if !state.active {
            return Err(HvmError::NotSupported);
        }

        let view = state
            .views
            .first_free()
            .ok_or(HvmError::InvalidArgument("no free altp2m view"))?;

        self.backing
            .init_view(view)
            .map_err(|errno| self.backing_failed("init view", errno))?;

        RwLockUpgradableReadGuard::upgrade(state).views.insert(view);
        tracing::debug!(domain = %self.id, %view, "altp2m view created");
        Ok(view)
    }

    pub(crate) fn switch_default_view(&self, view: u16) -> HvmResult<()> {
        let state = self.altp2m.read();
        let view = Self::lookup_view(&state, view)?;
        self.backing
            .switch_default_view(view)
            .map_err(|errno| self.backing_failed("switch default view", errno))
    }

    pub(crate) fn set_mem_access(&self, view: u16, gfn: u64, access: MemAccess) -> HvmResult<()> {
        let state = self.altp2m.read();
        let view = Self::lookup_view(&state, view)?;
        self.backing
            .set_mem_access(view, gfn, access)
            .map_err(|errno| self.backing_failed("set mem access", errno))
    }

    fn lookup_view(state: &Altp2mState, view: u16) -> HvmResult<ViewId> {
        if !state.active {
            return Err(HvmError::NotSupported);
        }
        ViewId::new(view)
            .filter(|&view| state.views.contains(view))
            .ok_or(HvmError::InvalidArgument("unknown altp2m view"))
    }

    fn teardown(&self, state: &mut Altp2mState) {
        for vcpu in &self.vcpus {
            vcpu.bind(None);
        }
        for view in state.views.iter() {
            self.backing.destroy_view(view);
        }
        state.views.clear();
        state.active = false;
    }

    fn backing_failed(&self, operation: &str, errno: hvm_defs::Errno) -> HvmError {
        tracing::warn!(domain = %self.id, operation, ?errno, "altp2m backing store failed");
        HvmError::Backing(errno)
    }
}

impl Drop for Domain {
    fn drop(&mut self) {
        let mut state = std::mem::take(self.altp2m.get_mut());
        if state.active {
            self.teardown(&mut state);
        }
    }
}

/// A point-in-time copy of a domain's altp2m state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Altp2mSnapshot {
    /// The feature-enable parameter is set.
    pub enabled: bool,
    /// Alternate views are in effect.
    pub active: bool,
    /// The allocated views.
    pub views: ViewSet,
    /// The view bound to each vCPU, by index.
    pub bindings: Vec<Option<ViewId>>,
}

/// A violated altp2m consistency rule.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum InvariantViolation {
    /// Active without the feature-enable parameter.
    #[error("altp2m active but not enabled")]
    ActiveNotEnabled,
    /// Active without the default view.
    #[error("altp2m active with no views")]
    ActiveWithoutViews,
    /// Inactive but views remain allocated.
    #[error("altp2m inactive with views {0:?}")]
    InactiveWithViews(ViewSet),
    /// A vCPU is bound to a view that is not allocated, or while inactive.
    #[error("vcpu {vp} bound to {view}, which is not live")]
    DanglingBinding {
        /// The vCPU index.
        vp: u32,
        /// The view it is bound to.
        view: ViewId,
    },
}

impl Altp2mSnapshot {
    /// Checks the rules linking activation, allocated views and vCPU
    /// bindings.
    pub fn check(&self) -> Result<(), InvariantViolation> {
        if self.active && !self.enabled {
            return Err(InvariantViolation::ActiveNotEnabled);
        }
        if self.active && self.views.is_empty() {
            return Err(InvariantViolation::ActiveWithoutViews);
        }
        if !self.active && !self.views.is_empty() {
            return Err(InvariantViolation::InactiveWithViews(self.views));
        }
        for (vp, view) in self.bindings.iter().enumerate() {
            if let Some(view) = *view {
                if !self.active || !self.views.contains(view) {
                    return Err(InvariantViolation::DanglingBinding {
                        vp: vp as u32,
                        view,
                    });
                }
            }
        }
        Ok(())
    }
}
