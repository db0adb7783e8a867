// IOCORE ADAPTIVE CONTROL TESTS
// DEBOUNCE ARITHMETIC, REGRET PENALTIES, TELEMETRY GATING AND FULL
// EXECUTE / MEASURE / COMMIT-OR-REVERT CYCLES ON THE SIMULATED HOST.
//
// NO SYSFS, NO ROOT. RUN OFFLINE.

use iocore::adaptive::Controller;
use iocore::balance::GroupingBalancer;
use iocore::cpumask::CpuMask;
use iocore::engine::{DecisionEngine, EngineConfig, Move, MoveKind, Verdict};
use iocore::estimator::{LoadEstimator, LoadRatios};
use iocore::model::{Mode, Model};
use iocore::sim::SimHost;
use iocore::topology;
use iocore::tuning::{
    compute_stability_score, cooldown_epochs, debounce_threshold, escalate_penalty,
    outcome_improved, should_print_telemetry, start_worker_count, BackingDeviceConfig,
    BackingKindConfig, Config, VmConfig,
    DEFAULT_INITIAL_PENALTY, DEFAULT_PENALTY_CAP, DEFAULT_REGRET_FACTOR,
    DEFAULT_REQUEST_RATIO, DEFAULT_REQUEST_WINDOW, STABILITY_THRESHOLD,
};

// === DEBOUNCE ===

#[test]
fn debounce_needs_twelve_of_twenty() {
    assert_eq!(debounce_threshold(DEFAULT_REQUEST_WINDOW, DEFAULT_REQUEST_RATIO), 12);
}

#[test]
fn debounce_threshold_never_zero() {
    assert_eq!(debounce_threshold(20, 0.0), 1);
    assert_eq!(debounce_threshold(1, 0.6), 1);
}

#[test]
fn cooldown_is_two_windows() {
    assert_eq!(cooldown_epochs(DEFAULT_REQUEST_WINDOW), 40);
}

// === STARTUP SIZING ===

#[test]
fn start_count_rounds_effective_load_up() {
    assert_eq!(start_worker_count(2.3, 0, 4), 3);
    assert_eq!(start_worker_count(1.0, 0, 4), 1);
}

#[test]
fn start_count_clamped_to_bounds() {
    assert_eq!(start_worker_count(0.0, 0, 4), 1);
    assert_eq!(start_worker_count(f64::NAN, 0, 4), 1);
    assert_eq!(start_worker_count(9.0, 0, 4), 4);
    assert_eq!(start_worker_count(0.5, 2, 4), 2);
}

// === REGRET ===

#[test]
fn penalty_escalates_then_caps() {
    let i = DEFAULT_INITIAL_PENALTY;
    let f = DEFAULT_REGRET_FACTOR;
    let cap = DEFAULT_PENALTY_CAP;
    let p1 = escalate_penalty(i, i, f, cap);
    let p2 = escalate_penalty(p1, i, f, cap);
    let p3 = escalate_penalty(p2, i, f, cap);
    assert_eq!(p1, 100);
    assert_eq!(p2, 500);
    assert_eq!(p3, 500);
}

#[test]
fn improvement_must_exceed_epsilon() {
    assert!(outcome_improved(1.0, 1.06, 0.05));
    assert!(!outcome_improved(1.0, 1.05, 0.05));
    assert!(!outcome_improved(1.0, 0.9, 0.05));
}

// === TELEMETRY GATING ===

#[test]
fn stability_resets_on_activity() {
    assert_eq!(compute_stability_score(7, true, false), 0);
    assert_eq!(compute_stability_score(7, false, true), 0);
    assert_eq!(compute_stability_score(7, false, false), 8);
    assert_eq!(compute_stability_score(STABILITY_THRESHOLD, false, false), STABILITY_THRESHOLD);
}

#[test]
fn stable_loop_prints_every_other_epoch() {
    assert!(should_print_telemetry(3, STABILITY_THRESHOLD - 1));
    assert!(!should_print_telemetry(3, STABILITY_THRESHOLD));
    assert!(should_print_telemetry(4, STABILITY_THRESHOLD));
}

// === FULL CYCLES ===

// 11 CPUS, 6 SINGLE-QUEUE DEVICES, SHARED ON CPUS 8-10, add_ratio 0.10 AT 3 WORKERS
fn controller() -> (SimHost, Controller) {
    controller_with(|_| {})
}

fn controller_with(tweak: impl FnOnce(&mut Config)) -> (SimHost, Controller) {
    let mut host = SimHost::new(11);
    for _ in 0..6 {
        host.add_device(1, true);
    }
    let mut cfg = Config {
        io_cores: vec![8, 9, 10],
        min_io_cores: 0,
        max_io_cores: 4,
        ..Config::default()
    };
    cfg.thresholds[3].add_ratio = 0.10;
    tweak(&mut cfg);
    cfg.validate().unwrap();
    let cpus = topology::managed_cpus(&topology::flat(11), &[], &cfg.io_cores).unwrap();
    let model = Model::discover(&mut host, &cfg, cpus).unwrap();
    let engine = DecisionEngine::new(EngineConfig::from_config(&cfg), Box::new(GroupingBalancer));
    let estimator = LoadEstimator::new(cfg.thresholds.clone(), cfg.history_reset_epochs);
    let mut ctrl = Controller::with_byte_rate_classifier(model, engine, estimator, 1 << 20);
    ctrl.start(&mut host, &cfg.io_cores).unwrap();
    (host, ctrl)
}

// IDLE BELOW THE 3-WORKER add_ratio (0.10)
fn saturated(throughput: f64) -> LoadRatios {
    LoadRatios {
        idle: 0.05,
        throughput,
        avg_bytes_per_packet: 1500.0,
        ..LoadRatios::default()
    }
}

// DRIVE UNTIL THE FIRST ADD EXECUTES. RETURNS ITS EPOCH.
fn run_until_add(host: &mut SimHost, ctrl: &mut Controller) -> u64 {
    for _ in 0..20 {
        let rep = ctrl.decide(host, saturated(2.0)).unwrap();
        if rep.executed == Some(Move::AddIoCore) {
            return rep.epoch;
        }
    }
    panic!("no add within one request window");
}

#[test]
fn startup_is_shared_on_io_cores() {
    let (_host, ctrl) = controller();
    assert_eq!(ctrl.model.mode, Mode::Shared);
    assert_eq!(ctrl.model.shared_count(), 3);
    assert_eq!(ctrl.model.pool.vm_cpus().len(), 8);
    ctrl.model.check_invariants().unwrap();
}

#[test]
fn add_fires_once_debounce_is_met() {
    let (mut host, mut ctrl) = controller();
    let epoch = run_until_add(&mut host, &mut ctrl);
    assert_eq!(epoch, 12);
    assert_eq!(ctrl.model.shared_count(), 4);
    assert_eq!(ctrl.model.pool.vm_cpus().len(), 7);
    assert!(ctrl.model.pool.worker_cpus().contains(&7));
    assert!(ctrl.engine.in_flight().is_some());
    ctrl.model.check_invariants().unwrap();
}

#[test]
fn flat_throughput_reverts_with_penalty() {
    let (mut host, mut ctrl) = controller();
    let before = ctrl.model.assignment();
    run_until_add(&mut host, &mut ctrl);

    // 10 MEASURED EPOCHS + 2 GRACE: NOTHING ELSE HAPPENS UNTIL EPOCH 24
    let mut outcome = None;
    for _ in 0..12 {
        let rep = ctrl.decide(&mut host, saturated(1.4)).unwrap();
        assert!(rep.executed.is_none());
        if let Some(o) = rep.outcome {
            assert_eq!(rep.epoch, 24);
            outcome = Some(o);
        }
    }
    let o = outcome.expect("outcome at deadline");
    assert_eq!(o.verdict, Verdict::Reverted);
    assert_eq!(o.penalty, 100);
    assert!((o.before - 2.0).abs() < 1e-9);
    assert!((o.after - 1.4).abs() < 1e-9);

    assert_eq!(ctrl.model.shared_count(), 3);
    assert_eq!(ctrl.model.pool.vm_cpus().len(), 8);
    assert_eq!(ctrl.model.assignment().len(), before.len());
    assert_eq!(ctrl.engine.counts(), (0, 1, 0));
    let st = ctrl.engine.kind_state(MoveKind::AddIoCore).unwrap();
    assert_eq!(st.last_failure, Some(24));
    ctrl.model.check_invariants().unwrap();
}

#[test]
fn reverted_move_blocked_for_penalty() {
    let (mut host, mut ctrl) = controller();
    run_until_add(&mut host, &mut ctrl);
    for _ in 0..12 {
        ctrl.decide(&mut host, saturated(1.4)).unwrap();
    }
    assert_eq!(ctrl.engine.epoch(), 24);

    // STILL WANTED EVERY EPOCH, BUT BLOCKED THROUGH 24 + 100
    while ctrl.engine.epoch() < 124 {
        let rep = ctrl.decide(&mut host, saturated(2.0)).unwrap();
        assert_ne!(rep.executed, Some(Move::AddIoCore), "epoch {}", rep.epoch);
    }
    let rep = ctrl.decide(&mut host, saturated(2.0)).unwrap();
    assert_eq!(rep.epoch, 125);
    assert_eq!(rep.executed, Some(Move::AddIoCore));
}

#[test]
fn improved_throughput_commits() {
    let (mut host, mut ctrl) = controller();
    run_until_add(&mut host, &mut ctrl);
    let mut verdict = None;
    for _ in 0..12 {
        if let Some(o) = ctrl.decide(&mut host, saturated(3.0)).unwrap().outcome {
            verdict = Some(o.verdict);
        }
    }
    assert_eq!(verdict, Some(Verdict::Committed));
    assert_eq!(ctrl.engine.last_good(), Some(24));
    assert_eq!(ctrl.engine.counts().0, 1);
    assert_eq!(ctrl.model.shared_count(), 4);

    // COMMIT CLEARS EVERY REQUEST WINDOW
    for k in [MoveKind::AddIoCore, MoveKind::RemoveIoCore, MoveKind::StopShared] {
        assert_eq!(ctrl.engine.kind_state(k).unwrap().request_count(), 0);
    }
    ctrl.model.check_invariants().unwrap();
}

#[test]
fn cooldown_holds_after_commit() {
    let (mut host, mut ctrl) = controller();
    run_until_add(&mut host, &mut ctrl);
    for _ in 0..12 {
        ctrl.decide(&mut host, saturated(3.0)).unwrap();
    }

    // FULLY IDLE: REMOVE IS FORCED PAST THE REQUEST COUNT, NOT PAST COOLDOWN
    let idle = LoadRatios {
        idle: 1.0,
        empty_cores: 4.0,
        throughput: 3.0,
        avg_bytes_per_packet: 1500.0,
        ..LoadRatios::default()
    };
    while ctrl.engine.epoch() < 24 + 39 {
        let rep = ctrl.decide(&mut host, idle).unwrap();
        assert!(rep.executed.is_none(), "epoch {}", rep.epoch);
    }
    let rep = ctrl.decide(&mut host, idle).unwrap();
    assert_eq!(rep.epoch, 64);
    assert_eq!(rep.executed, Some(Move::RemoveIoCore));
    assert_eq!(ctrl.model.shared_count(), 3);
}

#[test]
fn event_log_tracks_the_cycle() {
    let (mut host, mut ctrl) = controller();
    run_until_add(&mut host, &mut ctrl);
    for _ in 0..12 {
        ctrl.decide(&mut host, saturated(1.4)).unwrap();
    }
    assert_eq!(ctrl.log.len(), 24);
    ctrl.log.summary();
    ctrl.print_pool_summary();
}

#[test]
fn measured_epochs_produce_ratios() {
    let (mut host, mut ctrl) = controller();
    host.advance(1_000_000, 0.5, 1 << 21);
    ctrl.tick(&mut host).unwrap();
    host.advance(1_000_000, 0.5, 1 << 21);
    let rep = ctrl.tick(&mut host).unwrap();
    assert_eq!(rep.epoch, 2);

    let r = ctrl.last_ratios();
    assert!(r.throughput > 0.0);
    assert!(r.idle >= 0.0);
    assert!(r.avg_bytes_per_packet > 0.0);
    assert_eq!(ctrl.log.len(), 2);
}

#[test]
fn idle_workers_force_a_remove_from_measured_counters() {
    let (mut host, mut ctrl) = controller();
    // FIRST SNAPSHOT HAS NO DELTAS, SO NOTHING LOOKS EMPTY YET
    let rep = ctrl.tick(&mut host).unwrap();
    assert!(rep.executed.is_none());
    assert_eq!(ctrl.last_ratios().empty_cores, 0.0);

    // 3 WORKERS DOING NOTHING: 3 EMPTY CORES, FAR PAST THE HARD BOUND
    host.advance(1_000_000, 0.0, 0);
    let rep = ctrl.tick(&mut host).unwrap();
    let r = ctrl.last_ratios();
    assert!((r.idle - 1.0).abs() < 1e-9);
    assert!((r.empty_cores - 3.0).abs() < 1e-9);
    assert_eq!(rep.epoch, 2);
    assert_eq!(rep.executed, Some(Move::RemoveIoCore));
    assert_eq!(ctrl.model.shared_count(), 2);
    ctrl.model.check_invariants().unwrap();
}

// ONE NIC THREAD BACKS EVERY DEVICE. ITS AFFINITY WRITE FAILS ONCE, RIGHT
// WHEN THE FIRST ADD MOVES A DEVICE ONTO THE NEW WORKER.
#[test]
fn backing_affinity_failure_mid_add_leaves_layout_intact() {
    let (mut host, mut ctrl) = controller_with(|cfg| {
        cfg.backing_devices = vec![BackingDeviceConfig {
            id: "bd.1".into(),
            kind: BackingKindConfig::Software { threads: vec![900] },
            devices: (1..=6).collect(),
        }];
    });
    let assignment = ctrl.model.assignment();
    let nic = host.affinity_of(900);
    assert_eq!(nic, Some(CpuMask::from_cpus([8, 9, 10])));

    host.fail_affinity(900);
    for _ in 0..11 {
        let rep = ctrl.decide(&mut host, saturated(2.0)).unwrap();
        assert!(rep.executed.is_none());
    }
    let err = ctrl.decide(&mut host, saturated(2.0)).unwrap_err();
    assert!(matches!(err, iocore::error::Error::Host(_)), "{}", err);
    assert_eq!(ctrl.failed_epochs(), 1);
    assert!(ctrl.engine.in_flight().is_none());

    assert_eq!(ctrl.model.assignment(), assignment);
    assert_eq!(ctrl.model.shared_count(), 3);
    assert_eq!(ctrl.model.pool.vm_cpus().len(), 8);
    assert_eq!(host.workers().len(), 3);
    assert_eq!(host.affinity_of(900), nic);
    ctrl.model.check_invariants().unwrap();

    // THE LOOP KEEPS GOING ON THE RESTORED LAYOUT, BUSY ENOUGH THAT NOTHING FIRES
    for _ in 0..2 {
        host.advance(1_000_000, 0.8, 1 << 21);
        ctrl.tick(&mut host).unwrap();
        ctrl.model.check_invariants().unwrap();
    }
    assert_eq!(host.affinity_of(900), nic);
}

#[test]
fn vm_affinity_failure_mid_add_is_unwound() {
    let (mut host, mut ctrl) = controller_with(|cfg| {
        cfg.vms = vec![VmConfig { id: 1, pid: 1001, threads: vec![], devices: vec![1, 2, 3] }];
    });
    let assignment = ctrl.model.assignment();
    let vm_mask = CpuMask::from_cpus(0..8);
    assert_eq!(host.affinity_of(1001), Some(vm_mask));

    host.fail_affinity(1001);
    for _ in 0..11 {
        ctrl.decide(&mut host, saturated(2.0)).unwrap();
    }
    assert!(ctrl.decide(&mut host, saturated(2.0)).is_err());
    assert_eq!(ctrl.model.assignment(), assignment);
    assert_eq!(ctrl.model.shared_count(), 3);
    assert_eq!(ctrl.model.pool.vm_cpus().len(), 8);
    assert_eq!(ctrl.model.vms.affinity_union(), vm_mask);
    assert_eq!(host.affinity_of(1001), Some(vm_mask));
    ctrl.model.check_invariants().unwrap();

    for _ in 0..2 {
        host.advance(1_000_000, 0.8, 1 << 21);
        ctrl.tick(&mut host).unwrap();
        ctrl.model.check_invariants().unwrap();
    }
}
