// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use crate::Domain;
use crate::GuestBuffer;
use crate::InvariantViolation;
use crate::TranslationContext;
use crate::TranslationRegister;
use crate::ViewId;
use crate::ViewSet;
use crate::altp2m_vcpu_update_p2m;
use crate::test_helpers::DenyXsm;
use crate::test_helpers::HOST_CONTEXT;
use crate::test_helpers::TestBacking;
use crate::test_helpers::TestEnv;
use crate::test_helpers::view_context;
use hvm_defs::DomainId;
use hvm_defs::Errno;
use hvm_defs::HvmOp;
use hvm_defs::HvmParam;
use hvm_defs::altp2m::AltP2mCmd;
use hvm_defs::altp2m::AltP2mOp;
use hvm_defs::altp2m::ChangeGfn;
use hvm_defs::altp2m::DomainState;
use hvm_defs::altp2m::MemAccess;
use hvm_defs::altp2m::SetMemAccess;
use hvm_defs::altp2m::View;
use hvm_defs::params::HVM_PARAM_ALTP2M;
use std::sync::Arc;
use std::sync::Barrier;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use tracing_subscriber::EnvFilter;

const D1: DomainId = DomainId(1);

fn setup_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env().add_directive(tracing::Level::DEBUG.into()),
        )
        .with_test_writer()
        .try_init();
}

/// Sets the feature-enable parameter through the hypercall interface.
fn enable_altp2m(env: &TestEnv, domain: DomainId, value: u64) {
    let param = HvmParam {
        domid: domain,
        _pad: 0,
        index: HVM_PARAM_ALTP2M,
        value,
    };
    let (rc, _) = env.call(domain, HvmOp::SET_PARAM, &param);
    assert_eq!(rc, 0);
}

fn set_state(env: &TestEnv, domain: DomainId, active: bool) -> i64 {
    let op = AltP2mOp::new(domain, AltP2mCmd::SET_DOMAIN_STATE)
        .with_payload(DomainState::new(active));
    env.altp2m(domain, op).0
}

fn get_state(env: &TestEnv, domain: DomainId) -> (i64, bool) {
    let (rc, op) = env.altp2m(domain, AltP2mOp::new(domain, AltP2mCmd::GET_DOMAIN_STATE));
    (rc, op.u.domain_state().state != 0)
}

fn create_view(env: &TestEnv, domain: DomainId) -> (i64, u16) {
    let (rc, op) = env.altp2m(domain, AltP2mOp::new(domain, AltP2mCmd::CREATE_P2M));
    (rc, op.u.view().view)
}

/// An environment with one domain that has the feature parameter set.
fn enabled_env(vcpus: u32) -> (TestEnv, Arc<Domain>, Arc<TestBacking>) {
    setup_logging();
    let env = TestEnv::new(true);
    let (domain, backing) = env.add_domain_with_backing(D1, vcpus);
    enable_altp2m(&env, D1, 1);
    (env, domain, backing)
}

#[test]
fn activate_binds_every_vcpu() {
    let (env, domain, _) = enabled_env(2);
    assert_eq!(get_state(&env, D1), (0, false));

    assert_eq!(set_state(&env, D1, true), 0);
    assert_eq!(get_state(&env, D1), (0, true));
    for vcpu in domain.vcpus() {
        assert_eq!(vcpu.altp2m_view(), Some(ViewId::DEFAULT));
    }
    domain.altp2m_snapshot().check().unwrap();
    assert_eq!(env.table.outstanding_handles(), 0);
}

#[test]
fn deactivate_unbinds_and_frees_views() {
    let (env, domain, backing) = enabled_env(2);
    assert_eq!(set_state(&env, D1, true), 0);

    assert_eq!(set_state(&env, D1, false), 0);
    for vcpu in domain.vcpus() {
        assert_eq!(vcpu.altp2m_view(), None);
    }
    let snapshot = domain.altp2m_snapshot();
    assert!(snapshot.views.is_empty());
    snapshot.check().unwrap();
    assert!(backing.live_views().is_empty());
    assert_eq!(get_state(&env, D1), (0, false));
}

#[test]
fn activation_requires_enable_param() {
    setup_logging();
    let env = TestEnv::new(true);
    let (domain, backing) = env.add_domain_with_backing(D1, 2);
    enable_altp2m(&env, D1, 0);

    assert_eq!(set_state(&env, D1, true), Errno::EINVAL.status());
    assert!(!domain.altp2m_active());
    assert_eq!(get_state(&env, D1).0, Errno::EINVAL.status());
    assert_eq!(backing.init_count(), 0);
    domain.altp2m_snapshot().check().unwrap();
    assert_eq!(env.table.outstanding_handles(), 0);
}

#[test]
fn create_view_returns_fresh_id() {
    let (env, domain, backing) = enabled_env(1);
    assert_eq!(set_state(&env, D1, true), 0);

    let before = domain.altp2m_snapshot().views;
    let (rc, view) = create_view(&env, D1);
    assert_eq!(rc, 0);
    let view = ViewId::new(view).unwrap();
    assert!(!before.contains(view));
    assert!(domain.altp2m_snapshot().views.contains(view));
    assert!(backing.live_views().contains(view));

    // Creating a view does not rebind any vCPU.
    assert_eq!(domain.vcpus()[0].altp2m_view(), Some(ViewId::DEFAULT));
}

#[test]
fn set_mem_access_rejects_padding() {
    let (env, domain, backing) = enabled_env(1);
    assert_eq!(set_state(&env, D1, true), 0);

    let mut access = SetMemAccess::new(0, 0x42, MemAccess::R);
    access.pad = 1;
    let op = AltP2mOp::new(D1, AltP2mCmd::SET_MEM_ACCESS).with_payload(access);
    assert_eq!(env.altp2m(D1, op).0, Errno::EINVAL.status());
    assert!(backing.access_log().is_empty());
    domain.altp2m_snapshot().check().unwrap();
}

#[test]
fn set_mem_access_and_switch_reach_backing() {
    let (env, _domain, backing) = enabled_env(1);
    assert_eq!(set_state(&env, D1, true), 0);
    let (_, view) = create_view(&env, D1);

    let op = AltP2mOp::new(D1, AltP2mCmd::SET_MEM_ACCESS)
        .with_payload(SetMemAccess::new(view, 0x42, MemAccess::RX));
    assert_eq!(env.altp2m(D1, op).0, 0);
    let view = ViewId::new(view).unwrap();
    assert_eq!(backing.access_log(), [(view, 0x42, MemAccess::RX)]);

    let op = AltP2mOp::new(D1, AltP2mCmd::SWITCH_P2M).with_payload(View::new(view.get()));
    assert_eq!(env.altp2m(D1, op).0, 0);
    assert_eq!(backing.default_view(), Some(view));

    // Backing store failures are passed through.
    backing.fail_access(Errno(28));
    let op = AltP2mOp::new(D1, AltP2mCmd::SET_MEM_ACCESS)
        .with_payload(SetMemAccess::new(view.get(), 0x43, MemAccess::N));
    assert_eq!(env.altp2m(D1, op).0, -28);
    assert_eq!(backing.access_log().len(), 1);
}

#[test]
fn idempotent_set_state() {
    let (env, domain, backing) = enabled_env(2);
    assert_eq!(set_state(&env, D1, false), 0);
    assert_eq!(backing.init_count(), 0);

    assert_eq!(set_state(&env, D1, true), 0);
    let (_, view) = create_view(&env, D1);
    let before = domain.altp2m_snapshot();

    assert_eq!(set_state(&env, D1, true), 0);
    assert_eq!(domain.altp2m_snapshot(), before);
    assert!(before.views.contains(ViewId::new(view).unwrap()));
    assert_eq!(backing.init_count(), 2);
}

#[test]
fn malformed_record_rejected_before_lookup() {
    setup_logging();
    let env = TestEnv::new(true);

    // The target domain does not exist, so reaching the lookup would
    // produce ESRCH instead.
    let target = DomainId(9);
    let mut op = AltP2mOp::new(target, AltP2mCmd::GET_DOMAIN_STATE);
    op.version = 0;
    assert_eq!(env.altp2m(D1, op).0, Errno::EINVAL.status());

    let mut op = AltP2mOp::new(target, AltP2mCmd::GET_DOMAIN_STATE);
    op.pad1 = 1;
    assert_eq!(env.altp2m(D1, op).0, Errno::EINVAL.status());

    let op = AltP2mOp::new(target, AltP2mCmd(8));
    assert_eq!(env.altp2m(D1, op).0, Errno::EINVAL.status());

    let op = AltP2mOp::new(target, AltP2mCmd::GET_DOMAIN_STATE);
    assert_eq!(env.altp2m(D1, op).0, Errno::ESRCH.status());
    assert_eq!(env.table.outstanding_handles(), 0);
}

#[test]
fn feature_unsupported_ignores_argument() {
    setup_logging();
    let env = TestEnv::new(false);
    env.add_domain(D1, 1);
    assert_eq!(
        env.ops.do_hvm_op(D1, HvmOp::ALTP2M, None),
        Errno::EOPNOTSUPP.status()
    );
    let mut op = AltP2mOp::new(D1, AltP2mCmd::GET_DOMAIN_STATE);
    op.version = 7;
    assert_eq!(env.altp2m(D1, op).0, Errno::EOPNOTSUPP.status());
}

#[test]
fn null_argument_is_bad_address() {
    let (env, _, _) = enabled_env(1);
    assert_eq!(
        env.ops.do_hvm_op(D1, HvmOp::ALTP2M, None),
        Errno::EFAULT.status()
    );
    let buf = GuestBuffer::new(vec![0; 40]);
    buf.fail_reads();
    assert_eq!(
        env.ops.do_hvm_op(D1, HvmOp::ALTP2M, Some(&buf)),
        Errno::EFAULT.status()
    );
}

#[test]
fn commands_gated_on_activation() {
    let (env, domain, backing) = enabled_env(1);

    let ops = [
        AltP2mOp::new(D1, AltP2mCmd::CREATE_P2M),
        AltP2mOp::new(D1, AltP2mCmd::SWITCH_P2M).with_payload(View::new(0)),
        AltP2mOp::new(D1, AltP2mCmd::SET_MEM_ACCESS)
            .with_payload(SetMemAccess::new(0, 1, MemAccess::RWX)),
        AltP2mOp::new(D1, AltP2mCmd::DESTROY_P2M),
        AltP2mOp::new(D1, AltP2mCmd::CHANGE_GFN),
        AltP2mOp::new(DomainId::SELF, AltP2mCmd::VCPU_ENABLE_NOTIFY),
    ];
    for op in ops {
        assert_eq!(env.altp2m(D1, op).0, Errno::EOPNOTSUPP.status(), "{:?}", op.cmd);
    }
    assert_eq!(backing.init_count(), 0);
    assert!(backing.access_log().is_empty());
    assert_eq!(backing.default_view(), None);
    domain.altp2m_snapshot().check().unwrap();
    assert_eq!(env.table.outstanding_handles(), 0);
}

#[test]
fn reserved_commands_succeed_without_effect() {
    let (env, domain, backing) = enabled_env(1);
    assert_eq!(set_state(&env, D1, true), 0);
    let (_, view) = create_view(&env, D1);
    let before = domain.altp2m_snapshot();

    let change = ChangeGfn {
        view,
        pad1: 0,
        pad2: 0,
        old_gfn: 0x10,
        new_gfn: 0x20,
    };
    let ops = [
        AltP2mOp::new(D1, AltP2mCmd::DESTROY_P2M).with_payload(View::new(view)),
        AltP2mOp::new(D1, AltP2mCmd::CHANGE_GFN).with_payload(change),
        AltP2mOp::new(DomainId(77), AltP2mCmd::VCPU_ENABLE_NOTIFY),
    ];
    for op in ops {
        assert_eq!(env.altp2m(D1, op).0, 0, "{:?}", op.cmd);
    }
    assert_eq!(domain.altp2m_snapshot(), before);
    assert!(backing.destroyed().is_empty());
    assert_eq!(env.table.outstanding_handles(), 0);
}

#[test]
fn vcpu_enable_notify_targets_caller() {
    setup_logging();
    let env = TestEnv::new(true);
    env.add_domain(D1, 1);
    enable_altp2m(&env, D1, 1);
    let d2 = DomainId(2);
    env.add_domain(d2, 1);
    enable_altp2m(&env, d2, 1);
    assert_eq!(set_state(&env, d2, true), 0);

    // The record names the active domain, but the command resolves the
    // caller, which is inactive.
    let op = AltP2mOp::new(d2, AltP2mCmd::VCPU_ENABLE_NOTIFY);
    assert_eq!(env.altp2m(D1, op).0, Errno::EOPNOTSUPP.status());
    assert_eq!(env.altp2m(d2, op).0, 0);
}

#[test]
fn policy_denial_is_propagated() {
    setup_logging();
    let env = TestEnv::with_xsm(true, Arc::new(DenyXsm(Errno::EBUSY)));
    let domain = env.add_domain(D1, 1);
    domain.set_param(HVM_PARAM_ALTP2M, 1).unwrap();

    assert_eq!(set_state(&env, D1, true), Errno::EBUSY.status());
    assert!(!domain.altp2m_active());
    assert_eq!(env.table.outstanding_handles(), 0);
}

#[test]
fn foreign_domain_needs_privilege() {
    let (env, domain, _) = enabled_env(1);
    let op = AltP2mOp::new(D1, AltP2mCmd::SET_DOMAIN_STATE).with_payload(DomainState::new(true));
    assert_eq!(env.altp2m(DomainId(3), op).0, Errno::EPERM.status());
    assert!(!domain.altp2m_active());

    assert_eq!(env.altp2m(DomainId::CONTROL, op).0, 0);
    assert!(domain.altp2m_active());
}

#[test]
fn backing_failure_leaves_domain_inactive() {
    let (env, domain, backing) = enabled_env(2);
    backing.fail_init(Errno::ENOMEM);
    assert_eq!(set_state(&env, D1, true), Errno::ENOMEM.status());
    let snapshot = domain.altp2m_snapshot();
    assert!(!snapshot.active);
    assert_eq!(snapshot.bindings, [None, None]);
    snapshot.check().unwrap();
}

#[test]
fn create_view_copy_back_fault() {
    let (env, domain, _) = enabled_env(1);
    assert_eq!(set_state(&env, D1, true), 0);

    let buf = GuestBuffer::from_obj(&AltP2mOp::new(D1, AltP2mCmd::CREATE_P2M));
    buf.fail_writes();
    assert_eq!(
        env.ops.do_hvm_op(D1, HvmOp::ALTP2M, Some(&buf)),
        Errno::EFAULT.status()
    );
    // The view was allocated before the copy-back failed.
    assert_eq!(domain.altp2m_snapshot().views.len(), 2);
    assert_eq!(env.table.outstanding_handles(), 0);
}

#[test]
fn concurrent_activation_creates_one_view() {
    let (env, domain, backing) = enabled_env(4);
    let barrier = &Barrier::new(2);
    let env = &env;

    let results: Vec<i64> = std::thread::scope(|s| {
        let threads: Vec<_> = (0..2)
            .map(|_| {
                s.spawn(move || {
                    barrier.wait();
                    set_state(env, D1, true)
                })
            })
            .collect();
        threads.into_iter().map(|t| t.join().unwrap()).collect()
    });

    assert_eq!(results, [0, 0]);
    assert_eq!(backing.init_count(), 1);
    let snapshot = domain.altp2m_snapshot();
    assert_eq!(snapshot.views, [ViewId::DEFAULT].into_iter().collect::<ViewSet>());
    assert!(snapshot.bindings.iter().all(|&v| v == Some(ViewId::DEFAULT)));
    snapshot.check().unwrap();
    assert_eq!(env.table.outstanding_handles(), 0);
}

/// Checks, at the moment a view is installed, that its tables still exist.
struct LiveViewRegister<'a> {
    backing: &'a TestBacking,
}

impl TranslationRegister for LiveViewRegister<'_> {
    fn install(&mut self, context: TranslationContext) {
        if context == HOST_CONTEXT {
            return;
        }
        assert_eq!(context, view_context(ViewId::DEFAULT));
        assert!(
            self.backing.live_views().contains(ViewId::DEFAULT),
            "installed a destroyed view"
        );
    }
}

#[test]
fn resume_races_with_toggling() {
    let (env, domain, backing) = enabled_env(2);
    let barrier = Barrier::new(2);
    let done = AtomicBool::new(false);

    std::thread::scope(|s| {
        s.spawn(|| {
            barrier.wait();
            for i in 0..500 {
                assert_eq!(set_state(&env, D1, i % 2 == 0), 0);
            }
            done.store(true, Ordering::Release);
        });
        s.spawn(|| {
            barrier.wait();
            let mut reg = LiveViewRegister { backing: &backing };
            while !done.load(Ordering::Acquire) {
                for vcpu in domain.vcpus() {
                    altp2m_vcpu_update_p2m(&domain, vcpu, &mut reg);
                }
            }
        });
    });

    // An even number of toggles starting with activation leaves the domain
    // inactive.
    let snapshot = domain.altp2m_snapshot();
    assert!(!snapshot.active);
    snapshot.check().unwrap();
}

#[derive(Debug, Copy, Clone)]
enum Step {
    SetState(bool),
    Create,
    Destroy(u16),
    Switch(u16),
    SetAccess(u16),
    FailInit,
    FailAccess,
    ClearFailures,
}

/// The expected altp2m state of a single domain.
#[derive(Debug, Default)]
struct Model {
    active: bool,
    views: ViewSet,
    fail_init: bool,
    fail_access: bool,
}

impl Model {
    /// Applies `step` and returns the status it should produce.
    fn apply(&mut self, step: Step) -> i64 {
        let lookup = |views: ViewSet, view: u16| ViewId::new(view).filter(|&v| views.contains(v));
        match step {
            Step::SetState(true) if !self.active => {
                if self.fail_init {
                    return Errno::ENOMEM.status();
                }
                self.active = true;
                self.views = [ViewId::DEFAULT].into_iter().collect();
                0
            }
            Step::SetState(false) => {
                self.active = false;
                self.views = ViewSet::new();
                0
            }
            Step::SetState(true) => 0,
            Step::FailInit => {
                self.fail_init = true;
                0
            }
            Step::FailAccess => {
                self.fail_access = true;
                0
            }
            Step::ClearFailures => {
                self.fail_init = false;
                self.fail_access = false;
                0
            }
            _ if !self.active => Errno::EOPNOTSUPP.status(),
            Step::Create => match self.views.first_free() {
                None => Errno::EINVAL.status(),
                Some(_) if self.fail_init => Errno::ENOMEM.status(),
                Some(view) => {
                    self.views.insert(view);
                    0
                }
            },
            Step::Destroy(_) => 0,
            Step::Switch(view) => match lookup(self.views, view) {
                None => Errno::EINVAL.status(),
                Some(_) => 0,
            },
            Step::SetAccess(view) => match lookup(self.views, view) {
                None => Errno::EINVAL.status(),
                Some(_) if self.fail_access => Errno::EBUSY.status(),
                Some(_) => 0,
            },
        }
    }
}

fn run_step(env: &TestEnv, backing: &TestBacking, step: Step) -> i64 {
    let view_op = |cmd, view| AltP2mOp::new(D1, cmd).with_payload(View::new(view));
    match step {
        Step::SetState(active) => set_state(env, D1, active),
        Step::Create => create_view(env, D1).0,
        Step::Destroy(view) => env.altp2m(D1, view_op(AltP2mCmd::DESTROY_P2M, view)).0,
        Step::Switch(view) => env.altp2m(D1, view_op(AltP2mCmd::SWITCH_P2M, view)).0,
        Step::SetAccess(view) => {
            let op = AltP2mOp::new(D1, AltP2mCmd::SET_MEM_ACCESS).with_payload(
                SetMemAccess::new(view, 0x100 + u64::from(view), MemAccess::RW),
            );
            env.altp2m(D1, op).0
        }
        Step::FailInit => {
            backing.fail_init(Errno::ENOMEM);
            0
        }
        Step::FailAccess => {
            backing.fail_access(Errno::EBUSY);
            0
        }
        Step::ClearFailures => {
            backing.clear_failures();
            0
        }
    }
}

/// Runs `steps` against one domain, checking the status of each call and
/// the domain's consistency after every one of them.
fn run_sequence(steps: impl IntoIterator<Item = Step>) {
    let (env, domain, backing) = enabled_env(3);
    let mut model = Model::default();
    for (i, step) in steps.into_iter().enumerate() {
        let rc = run_step(&env, &backing, step);
        assert_eq!(rc, model.apply(step), "step {i}: {step:?}");

        let snapshot = domain.altp2m_snapshot();
        if let Err(err) = snapshot.check() {
            panic!("step {i}: {step:?}: {err}");
        }
        assert_eq!(snapshot.active, model.active, "step {i}: {step:?}");
        assert_eq!(snapshot.views, model.views, "step {i}: {step:?}");
        assert_eq!(backing.live_views(), snapshot.views, "step {i}: {step:?}");
        assert_eq!(env.table.outstanding_handles(), 0, "step {i}: {step:?}");
    }
}

#[test]
fn scripted_sequence_preserves_invariants() {
    let max = crate::MAX_ALTP2M;
    let mut steps = vec![Step::SetState(true)];
    // One more than fits, since view 0 is already taken.
    steps.extend((0..max).map(|_| Step::Create));
    steps.extend([
        Step::SetAccess(max - 1),
        Step::SetAccess(max),
        Step::SetAccess(u16::MAX),
        Step::Switch(3),
        Step::Destroy(3),
        Step::Switch(3),
        Step::FailAccess,
        Step::SetAccess(2),
        Step::ClearFailures,
        Step::SetState(true),
        Step::SetState(false),
        Step::Create,
        Step::Switch(0),
        Step::Destroy(0),
        Step::FailInit,
        Step::SetState(true),
        Step::ClearFailures,
        Step::SetState(true),
        Step::FailInit,
        Step::Create,
        Step::ClearFailures,
        Step::Create,
        Step::SetState(false),
        Step::SetState(false),
    ]);
    run_sequence(steps);
}

#[test]
fn seeded_sequence_preserves_invariants() {
    let mut seed: u64 = 0x5eed_a17b_2d00_0001;
    let steps = (0..2000).map(move |_| {
        seed = seed
            .wrapping_mul(6364136223846793005)
            .wrapping_add(1442695040888963407);
        let r = seed >> 33;
        let view = ((r >> 8) % u64::from(crate::MAX_ALTP2M + 2)) as u16;
        match r % 10 {
            0 => Step::SetState(true),
            1 => Step::SetState(false),
            2..=4 => Step::Create,
            5 => Step::Destroy(view),
            6 => Step::Switch(view),
            7 => Step::SetAccess(view),
            8 if r & 0x10000 != 0 => Step::FailInit,
            8 => Step::FailAccess,
            _ => Step::ClearFailures,
        }
    });
    run_sequence(steps);
}

#[test]
fn clearing_enable_param_leaves_domain_active() {
    let (env, domain, backing) = enabled_env(2);
    assert_eq!(set_state(&env, D1, true), 0);

    // The parameter is stored without interpretation, so clearing it does
    // not deactivate. It does lock out both state commands.
    enable_altp2m(&env, D1, 0);
    assert!(domain.altp2m_active());
    assert_eq!(
        domain.altp2m_snapshot().check(),
        Err(InvariantViolation::ActiveNotEnabled)
    );
    assert_eq!(set_state(&env, D1, false), Errno::EINVAL.status());
    assert_eq!(get_state(&env, D1).0, Errno::EINVAL.status());
    assert!(domain.altp2m_active());

    // Commands gated only on activation keep working.
    assert_eq!(create_view(&env, D1).0, 0);

    // Only dropping the domain releases its views.
    drop(env.table.remove(D1));
    drop(domain);
    assert!(backing.live_views().is_empty());
    assert_eq!(env.table.outstanding_handles(), 0);
}
