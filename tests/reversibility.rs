// Property tests: every structural move can be undone.
// Random add / remove / undo sequences on the simulated host must keep the
// pools disjoint, the worker count in bounds and, once fully unwound, leave
// every device served from the CPU it started on.

use proptest::prelude::*;

use iocore::balance::GroupingBalancer;
use iocore::cpumask::CpuMask;
use iocore::engine::{DecisionEngine, EngineConfig, Move, Undo};
use iocore::host::DeviceId;
use iocore::model::Model;
use iocore::sim::SimHost;
use iocore::topology;
use iocore::tuning::Config;

#[derive(Clone, Copy, Debug)]
enum Op {
    Add,
    Remove,
    Undo,
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![Just(Op::Add), Just(Op::Remove), Just(Op::Undo)]
}

// 8 CPUS, 4 DEVICES, SHARED ON CPUS 6 AND 7
fn setup(max_io_cores: usize) -> (SimHost, Model, DecisionEngine) {
    let mut host = SimHost::new(8);
    for _ in 0..4 {
        host.add_device(1, true);
    }
    let cfg = Config { io_cores: vec![6, 7], min_io_cores: 0, max_io_cores, ..Config::default() };
    let cpus = topology::managed_cpus(&topology::flat(8), &[], &cfg.io_cores).unwrap();
    let mut model = Model::discover(&mut host, &cfg, cpus).unwrap();
    let mut engine = DecisionEngine::new(EngineConfig::from_config(&cfg), Box::new(GroupingBalancer));
    engine.start(&mut host, &mut model, &cfg.io_cores).unwrap();
    (host, model, engine)
}

fn serving(model: &Model) -> Vec<(DeviceId, CpuMask)> {
    model.devices.keys().map(|&d| (d, model.serving_mask(d))).collect()
}

fn sorted(cpus: &[usize]) -> Vec<usize> {
    let mut v = cpus.to_vec();
    v.sort_unstable();
    v
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn random_moves_keep_invariants(
        ops in prop::collection::vec(op_strategy(), 1..40),
        max_io_cores in 2usize..=5,
    ) {
        let (mut host, mut model, mut engine) = setup(max_io_cores);
        let start_serving = serving(&model);
        let start_vm = sorted(model.pool.vm_cpus());
        let mut undos: Vec<Undo> = Vec::new();

        for op in ops {
            match op {
                Op::Add | Op::Remove => {
                    let mv = if matches!(op, Op::Add) { Move::AddIoCore } else { Move::RemoveIoCore };
                    if engine.allowed(&model, &mv) {
                        undos.push(engine.execute(&mut host, &mut model, mv).unwrap());
                    }
                }
                Op::Undo => {
                    if let Some(u) = undos.pop() {
                        engine.undo(&mut host, &mut model, u).unwrap();
                    }
                }
            }
            model.check_invariants().unwrap();
            let n = model.pool.worker_cpus().len();
            prop_assert!(n >= 1 && n <= max_io_cores, "{} workers", n);
            prop_assert_eq!(model.workers.len(), n);
        }

        while let Some(u) = undos.pop() {
            engine.undo(&mut host, &mut model, u).unwrap();
            model.check_invariants().unwrap();
        }
        prop_assert_eq!(serving(&model), start_serving);
        prop_assert_eq!(sorted(model.pool.vm_cpus()), start_vm);
    }
}

#[test]
fn refused_move_changes_nothing() {
    let (mut host, mut model, mut engine) = setup(2);
    let before = serving(&model);
    assert!(!engine.allowed(&model, &Move::AddIoCore));
    assert!(engine.execute(&mut host, &mut model, Move::AddIoCore).is_err());
    assert_eq!(serving(&model), before);
    model.check_invariants().unwrap();
}
