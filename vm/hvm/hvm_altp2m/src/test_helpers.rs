// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use crate::backing::AltP2mBacking;
use crate::backing::TranslationContext;
use crate::backing::TranslationRegister;
use crate::config::HvmConfig;
use crate::directory::DomainTable;
use crate::dispatch::HvmOps;
use crate::domain::Domain;
use crate::guest::GuestBuffer;
use crate::policy::DummyXsm;
use crate::policy::VmEventMonitor;
use crate::policy::XsmPolicy;
use crate::view::ViewId;
use crate::view::ViewSet;
use hvm_defs::DomainId;
use hvm_defs::Errno;
use hvm_defs::HvmOp;
use hvm_defs::altp2m::AltP2mOp;
use hvm_defs::altp2m::MemAccess;
use parking_lot::Mutex;
use std::sync::Arc;
use zerocopy::Immutable;
use zerocopy::IntoBytes;

/// The translation context [`TestBacking`] reports for the host view.
pub const HOST_CONTEXT: TranslationContext = TranslationContext(0x8000_0000);

/// The translation context [`TestBacking`] reports for `view`.
pub fn view_context(view: ViewId) -> TranslationContext {
    TranslationContext(0x1_0000_0000 + ((view.get() as u64) << 12))
}

#[derive(Debug, Default)]
struct BackingState {
    live: ViewSet,
    /// Views whose tables were lost behind the control plane's back.
    lost: ViewSet,
    default_view: Option<ViewId>,
    init_count: usize,
    destroyed: Vec<ViewId>,
    access_log: Vec<(ViewId, u64, MemAccess)>,
    fail_init: Option<Errno>,
    fail_access: Option<Errno>,
}

/// An in-memory translation backing store that records every request.
///
/// Panics if the control plane initializes a live view twice, or touches or
/// resolves the context of a view that is not initialized.
#[derive(Debug, Default)]
pub struct TestBacking {
    state: Mutex<BackingState>,
}

impl TestBacking {
    /// Creates a backing store with no views.
    pub fn new() -> Self {
        Self::default()
    }

    /// Fails every subsequent view initialization with `errno`.
    pub fn fail_init(&self, errno: Errno) {
        self.state.lock().fail_init = Some(errno);
    }

    /// Fails every subsequent access change with `errno`.
    pub fn fail_access(&self, errno: Errno) {
        self.state.lock().fail_access = Some(errno);
    }

    /// Stops injecting failures.
    pub fn clear_failures(&self) {
        let mut state = self.state.lock();
        state.fail_init = None;
        state.fail_access = None;
    }

    /// Drops the tables of `view` without telling the control plane.
    pub fn lose_tables(&self, view: ViewId) {
        self.state.lock().lost.insert(view);
    }

    /// The views currently initialized.
    pub fn live_views(&self) -> ViewSet {
        self.state.lock().live
    }

    /// The number of successful view initializations.
    pub fn init_count(&self) -> usize {
        self.state.lock().init_count
    }

    /// Every destroyed view, in order.
    pub fn destroyed(&self) -> Vec<ViewId> {
        self.state.lock().destroyed.clone()
    }

    /// Every successful access change, in order.
    pub fn access_log(&self) -> Vec<(ViewId, u64, MemAccess)> {
        self.state.lock().access_log.clone()
    }

    /// The view last made the default.
    pub fn default_view(&self) -> Option<ViewId> {
        self.state.lock().default_view
    }

    fn assert_live(state: &BackingState, view: ViewId) {
        assert!(state.live.contains(view), "{view} is not initialized");
    }
}

impl AltP2mBacking for TestBacking {
    fn init_view(&self, view: ViewId) -> Result<(), Errno> {
        let mut state = self.state.lock();
        if let Some(errno) = state.fail_init {
            return Err(errno);
        }
        assert!(state.live.insert(view), "{view} initialized twice");
        state.lost.remove(view);
        state.init_count += 1;
        Ok(())
    }

    fn destroy_view(&self, view: ViewId) {
        let mut state = self.state.lock();
        Self::assert_live(&state, view);
        state.live.remove(view);
        if state.default_view == Some(view) {
            state.default_view = None;
        }
        state.destroyed.push(view);
    }

    fn switch_default_view(&self, view: ViewId) -> Result<(), Errno> {
        let mut state = self.state.lock();
        Self::assert_live(&state, view);
        state.default_view = Some(view);
        Ok(())
    }

    fn set_mem_access(&self, view: ViewId, gfn: u64, access: MemAccess) -> Result<(), Errno> {
        let mut state = self.state.lock();
        Self::assert_live(&state, view);
        if let Some(errno) = state.fail_access {
            return Err(errno);
        }
        state.access_log.push((view, gfn, access));
        Ok(())
    }

    fn host_context(&self) -> TranslationContext {
        HOST_CONTEXT
    }

    fn view_context(&self, view: ViewId) -> Option<TranslationContext> {
        let state = self.state.lock();
        Self::assert_live(&state, view);
        (!state.lost.contains(view)).then(|| view_context(view))
    }
}

/// Records every installed translation context.
#[derive(Debug, Default)]
pub struct RecordingRegister {
    /// Installed contexts, oldest first.
    pub installed: Vec<TranslationContext>,
}

impl TranslationRegister for RecordingRegister {
    fn install(&mut self, context: TranslationContext) {
        self.installed.push(context);
    }
}

/// Records every guest request.
#[derive(Debug, Default)]
pub struct RecordingMonitor {
    requests: Mutex<Vec<DomainId>>,
}

impl RecordingMonitor {
    /// The domains that raised a guest request, in order.
    pub fn requests(&self) -> Vec<DomainId> {
        self.requests.lock().clone()
    }
}

impl VmEventMonitor for RecordingMonitor {
    fn guest_request(&self, caller: DomainId) {
        self.requests.lock().push(caller);
    }
}

/// A policy that rejects everything with a fixed errno.
#[derive(Debug, Copy, Clone)]
pub struct DenyXsm(pub Errno);

impl XsmPolicy for DenyXsm {
    fn hvm_param(&self, _caller: DomainId, _domain: &Domain, _op: HvmOp) -> Result<(), Errno> {
        Err(self.0)
    }

    fn hvm_altp2m_op(&self, _caller: DomainId, _domain: &Domain) -> Result<(), Errno> {
        Err(self.0)
    }
}

/// A dispatcher wired to an in-memory domain table.
pub struct TestEnv {
    /// The dispatcher under test.
    pub ops: HvmOps,
    /// The domains it resolves.
    pub table: Arc<DomainTable>,
    /// The monitor it reports guest requests to.
    pub monitor: Arc<RecordingMonitor>,
}

impl TestEnv {
    /// Creates an environment with the default policy.
    pub fn new(altp2m_supported: bool) -> Self {
        Self::with_xsm(altp2m_supported, Arc::new(DummyXsm))
    }

    /// Creates an environment with the given policy.
    pub fn with_xsm(altp2m_supported: bool, xsm: Arc<dyn XsmPolicy>) -> Self {
        let table = Arc::new(DomainTable::new());
        let monitor = Arc::new(RecordingMonitor::default());
        let config = HvmConfig { altp2m_supported };
        let ops = HvmOps::new(&config, table.clone(), xsm, monitor.clone());
        Self {
            ops,
            table,
            monitor,
        }
    }

    /// Adds a domain backed by a fresh [`TestBacking`].
    pub fn add_domain(&self, id: DomainId, vcpus: u32) -> Arc<Domain> {
        self.add_domain_with_backing(id, vcpus).0
    }

    /// Adds a domain and returns its backing store too.
    pub fn add_domain_with_backing(
        &self,
        id: DomainId,
        vcpus: u32,
    ) -> (Arc<Domain>, Arc<TestBacking>) {
        let backing = Arc::new(TestBacking::new());
        let domain = Arc::new(Domain::new(id, vcpus, backing.clone()));
        assert!(
            self.table.insert(domain.clone()).is_ok(),
            "duplicate domain {id}"
        );
        (domain, backing)
    }

    /// Issues `op` with `arg` copied into a fresh buffer, returning the
    /// status and the buffer.
    pub fn call<T: IntoBytes + Immutable>(
        &self,
        caller: DomainId,
        op: HvmOp,
        arg: &T,
    ) -> (i64, GuestBuffer) {
        let buf = GuestBuffer::from_obj(arg);
        let rc = self.ops.do_hvm_op(caller, op, Some(&buf));
        (rc, buf)
    }

    /// Issues an altp2m command, returning the status and the record as
    /// left in the buffer.
    pub fn altp2m(&self, caller: DomainId, op: AltP2mOp) -> (i64, AltP2mOp) {
        let (rc, buf) = self.call(caller, HvmOp::ALTP2M, &op);
        let op = buf.read_obj().expect("buffer holds a full record");
        (rc, op)
    }
}
