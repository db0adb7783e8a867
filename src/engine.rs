// IOCORE REGRET-GUARDED DECISION ENGINE
//
// EVERY EPOCH, WITH NO MOVE IN FLIGHT:
//   1. EVALUATE: WHICH SIZING MOVES DO THE RATIOS WANT RIGHT NOW
//   2. DEBOUNCE: A MOVE EXECUTES ONLY ONCE WANTED IN ENOUGH OF THE LAST W
//      EPOCHS, OUTSIDE THE COOLDOWN OF THE LAST GOOD MOVE AND OUTSIDE ITS
//      OWN REGRET PENALTY
//   3. EXECUTE AT MOST ONE SIZING MOVE. IF NONE RAN, REBALANCE.
//
// AN EXECUTED SIZING MOVE GOES IN FLIGHT. NOTHING ELSE IS EVALUATED UNTIL ITS
// DEADLINE: history_length + grace_period EPOCHS LATER. THE FIRST grace
// SAMPLES ARE DROPPED AND THE REST AVERAGED. BETTER THAN BEFORE + EPS:
// COMMIT, EVERY MOVE KIND STARTS CLEAN. OTHERWISE REVERT WITH THE EXACT
// INVERSE AND ESCALATE THAT KIND'S PENALTY.

use std::collections::{BTreeMap, VecDeque};
use std::fmt;

use log::{debug, info, warn};

use crate::balance::{ChangeSet, DeviceBalanceStrategy, WorkerSlot};
use crate::cpumask::CpuMask;
use crate::error::{Error, Result};
use crate::estimator::LoadRatios;
use crate::host::{HostInterface, WorkerId};
use crate::model::{Mode, Model};
use crate::tuning::{self, Config, Thresholds};

// --- MOVES ---

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub enum MoveKind {
    StartShared,
    StopShared,
    AddIoCore,
    RemoveIoCore,
    BatchReduce,
    Rebalance,
}

pub const ALL_KINDS: [MoveKind; 6] = [
    MoveKind::StartShared,
    MoveKind::StopShared,
    MoveKind::AddIoCore,
    MoveKind::RemoveIoCore,
    MoveKind::BatchReduce,
    MoveKind::Rebalance,
];

impl MoveKind {
    pub fn label(self) -> &'static str {
        match self {
            MoveKind::StartShared => "START_SHARED",
            MoveKind::StopShared => "STOP_SHARED",
            MoveKind::AddIoCore => "ADD_IO_CORE",
            MoveKind::RemoveIoCore => "REMOVE_IO_CORE",
            MoveKind::BatchReduce => "BATCH_REDUCE",
            MoveKind::Rebalance => "REBALANCE",
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Move {
    StartSharedWorkers(usize),
    StopSharedWorkers,
    AddIoCore,
    RemoveIoCore,
    BatchReduceCores,
    Rebalance,
}

impl Move {
    pub fn kind(&self) -> MoveKind {
        match self {
            Move::StartSharedWorkers(_) => MoveKind::StartShared,
            Move::StopSharedWorkers => MoveKind::StopShared,
            Move::AddIoCore => MoveKind::AddIoCore,
            Move::RemoveIoCore => MoveKind::RemoveIoCore,
            Move::BatchReduceCores => MoveKind::BatchReduce,
            Move::Rebalance => MoveKind::Rebalance,
        }
    }
}

impl fmt::Display for Move {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Move::StartSharedWorkers(k) => write!(f, "{}({})", self.kind().label(), k),
            _ => write!(f, "{}", self.kind().label()),
        }
    }
}

// WHAT IT TAKES TO PUT THE HOST BACK EXACTLY AS IT WAS BEFORE A MOVE
#[derive(Clone, Debug)]
pub enum Undo {
    AddIoCore { worker: WorkerId, cpu: usize, changes: ChangeSet },
    RemoveIoCore { removed: WorkerId, cpu: usize, changes: ChangeSet },
    StartShared { cpus: Vec<usize> },
    StopShared { cpu: usize },
    Rebalance { changes: ChangeSet },
}

impl Undo {
    pub fn cpus(&self) -> Vec<usize> {
        match self {
            Undo::AddIoCore { cpu, .. } | Undo::RemoveIoCore { cpu, .. } | Undo::StopShared { cpu } => {
                vec![*cpu]
            }
            Undo::StartShared { cpus } => cpus.clone(),
            Undo::Rebalance { .. } => Vec::new(),
        }
    }

    pub fn changes(&self) -> Option<&ChangeSet> {
        match self {
            Undo::AddIoCore { changes, .. }
            | Undo::RemoveIoCore { changes, .. }
            | Undo::Rebalance { changes } => Some(changes),
            _ => None,
        }
    }
}

// --- ENGINE STATE ---

#[derive(Clone, Copy, Debug)]
pub struct EngineConfig {
    pub min_io_cores: usize,
    pub max_io_cores: usize,
    pub start_shared_ratio: f64,
    pub stop_shared_ratio: f64,
    pub hard_remove_ratio: f64,
    pub vm_can_remove_ratio: f64,
    pub request_window: usize,
    pub request_ratio: f64,
    pub history_length: usize,
    pub grace_period: usize,
    pub improvement_epsilon: f64,
    pub initial_penalty: u64,
    pub regret_factor: u64,
    pub penalty_cap: u64,
}

impl EngineConfig {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            min_io_cores: cfg.min_io_cores,
            max_io_cores: cfg.max_io_cores,
            start_shared_ratio: cfg.start_shared_ratio(),
            stop_shared_ratio: cfg.stop_shared_ratio,
            hard_remove_ratio: cfg.hard_remove_ratio,
            vm_can_remove_ratio: cfg.vm_can_remove_ratio,
            request_window: cfg.request_window,
            request_ratio: cfg.request_ratio,
            history_length: cfg.history_length,
            grace_period: cfg.grace_period,
            improvement_epsilon: cfg.improvement_epsilon,
            initial_penalty: cfg.initial_penalty,
            regret_factor: cfg.regret_factor,
            penalty_cap: cfg.penalty_cap,
        }
    }

    fn floor(&self) -> usize {
        self.min_io_cores.max(1)
    }
}

#[derive(Clone, Debug)]
pub struct KindState {
    requests: VecDeque<bool>,
    pub penalty: u64,
    pub last_failure: Option<u64>,
}

impl KindState {
    fn new(initial_penalty: u64) -> Self {
        Self {
            requests: VecDeque::new(),
            penalty: initial_penalty,
            last_failure: None,
        }
    }

    pub fn request_count(&self) -> usize {
        self.requests.iter().filter(|&&r| r).count()
    }
}

pub struct MoveInFlight {
    pub mv: Move,
    pub undo: Undo,
    pub executed: u64,
    pub deadline: u64,
    pub before: f64,
    samples: Vec<f64>,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Verdict {
    Committed,
    Reverted,
}

#[derive(Clone, Debug)]
pub struct Outcome {
    pub mv: Move,
    pub verdict: Verdict,
    pub before: f64,
    pub after: f64,
    pub penalty: u64,
    pub cpus: Vec<usize>,
}

#[derive(Clone, Debug, Default)]
pub struct StepReport {
    pub epoch: u64,
    pub wanted: Vec<MoveKind>,
    pub executed: Option<Move>,
    pub changes: Option<ChangeSet>,
    pub cpus: Vec<usize>,
    pub outcome: Option<Outcome>,
    pub in_flight: bool,
    pub skipped: Option<String>,
}

#[derive(Clone, Copy, Debug)]
struct Want {
    mv: Move,
    forced: bool,
}

pub struct DecisionEngine {
    cfg: EngineConfig,
    balancer: Box<dyn DeviceBalanceStrategy>,
    epoch: u64,
    kinds: BTreeMap<MoveKind, KindState>,
    last_good: Option<u64>,
    history: VecDeque<f64>,
    in_flight: Option<MoveInFlight>,
    commits: u64,
    reverts: u64,
    rebalances: u64,
}

fn mean(v: &[f64]) -> f64 {
    if v.is_empty() {
        0.0
    } else {
        v.iter().sum::<f64>() / v.len() as f64
    }
}

impl DecisionEngine {
    pub fn new(cfg: EngineConfig, balancer: Box<dyn DeviceBalanceStrategy>) -> Self {
        let kinds = ALL_KINDS
            .iter()
            .map(|&k| (k, KindState::new(cfg.initial_penalty)))
            .collect();
        Self {
            cfg,
            balancer,
            epoch: 0,
            kinds,
            last_good: None,
            history: VecDeque::new(),
            in_flight: None,
            commits: 0,
            reverts: 0,
            rebalances: 0,
        }
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn in_flight(&self) -> Option<&MoveInFlight> {
        self.in_flight.as_ref()
    }

    pub fn kind_state(&self, kind: MoveKind) -> Option<&KindState> {
        self.kinds.get(&kind)
    }

    pub fn last_good(&self) -> Option<u64> {
        self.last_good
    }

    pub fn balancer_name(&self) -> &'static str {
        self.balancer.name()
    }

    // (COMMITS, REVERTS, REBALANCES)
    pub fn counts(&self) -> (u64, u64, u64) {
        (self.commits, self.reverts, self.rebalances)
    }

    // --- STARTUP ---

    // io_cores NON-EMPTY: THOSE CPUS ALREADY SIT IN THE WORKER POOL, GO
    // STRAIGHT TO SHARED MODE ON THEM. OTHERWISE PIN THE DEDICATED WORKERS
    // TO THE VM POOL.
    pub fn start<H: HostInterface + ?Sized>(&mut self, host: &mut H, model: &mut Model, io_cores: &[usize]) -> Result<()> {
        if !io_cores.is_empty() {
            self.enter_shared_on(host, model, io_cores)?;
            info!("STARTED SHARED ON {:?}", io_cores);
            return Ok(());
        }
        let vm_mask = model.pool.vm_mask();
        let ids: Vec<WorkerId> = model.workers.keys().copied().collect();
        for id in ids {
            model.retarget_worker(host, id, vm_mask)?;
        }
        model.mode = Mode::Dedicated;
        model.set_polling(host, false)?;
        model.reset_affinity(host)?;
        model.place_vms(host)?;
        info!("STARTED DEDICATED, {} WORKERS ON {}", model.workers.len(), vm_mask);
        Ok(())
    }

    // --- PER-EPOCH STEP ---

    pub fn step<H: HostInterface + ?Sized>(
        &mut self,
        host: &mut H,
        model: &mut Model,
        ratios: &LoadRatios,
        th: Thresholds,
    ) -> Result<StepReport> {
        self.epoch += 1;
        let mut report = StepReport { epoch: self.epoch, ..StepReport::default() };

        if let Some(mut f) = self.in_flight.take() {
            f.samples.push(ratios.throughput);
            if self.epoch < f.deadline {
                self.in_flight = Some(f);
                report.in_flight = true;
                return Ok(report);
            }
            report.outcome = Some(self.resolve(host, model, f)?);
            self.push_history(ratios.throughput);
            return Ok(report);
        }

        self.push_history(ratios.throughput);
        let wants = self.evaluate(model, ratios, th);
        for kind in ALL_KINDS.iter().filter(|&&k| k != MoveKind::Rebalance) {
            let wanted = wants.iter().any(|w| w.mv.kind() == *kind);
            self.record_request(*kind, wanted);
        }
        report.wanted = wants.iter().map(|w| w.mv.kind()).collect();

        let pick = wants.iter().copied().find(|w| self.can_do_move(w.mv.kind(), w.forced));
        if let Some(want) = pick {
            self.clear_requests(want.mv.kind());
            let before = mean(self.history.make_contiguous());
            match self.execute(host, model, want.mv) {
                Ok(undo) => {
                    info!(
                        "EXECUTE {}{} BEFORE={:.4} CPUS={:?}",
                        want.mv,
                        if want.forced { " (FORCED)" } else { "" },
                        before,
                        undo.cpus()
                    );
                    report.executed = Some(want.mv);
                    report.changes = undo.changes().cloned();
                    report.cpus = undo.cpus();
                    let deadline = self.epoch + (self.cfg.history_length + self.cfg.grace_period) as u64;
                    self.in_flight = Some(MoveInFlight {
                        mv: want.mv,
                        undo,
                        executed: self.epoch,
                        deadline,
                        before,
                        samples: Vec::new(),
                    });
                    report.in_flight = true;
                    return Ok(report);
                }
                Err(e @ Error::InsufficientCapacity { .. }) => {
                    warn!("{} ABORTED: {}", want.mv, e);
                    report.skipped = Some(e.to_string());
                    return Ok(report);
                }
                Err(e) => return Err(e),
            }
        }

        // NO SIZING MOVE RAN: TRY A REBALANCE OF THE CURRENT WORKER SET
        if model.mode == Mode::Shared {
            let plan = self.balancer.plan(&model.device_infos(), &model.worker_slots())?;
            self.record_request(MoveKind::Rebalance, !plan.is_empty());
            if !plan.is_empty() {
                report.wanted.push(MoveKind::Rebalance);
                if self.can_do_move(MoveKind::Rebalance, false) {
                    self.clear_requests(MoveKind::Rebalance);
                    model.apply_change_set(host, &plan)?;
                    info!("REBALANCE {}", plan);
                    self.rebalances += 1;
                    report.executed = Some(Move::Rebalance);
                    report.changes = Some(plan);
                }
            }
        }
        Ok(report)
    }

    fn push_history(&mut self, throughput: f64) {
        self.history.push_back(throughput);
        while self.history.len() > self.cfg.history_length {
            self.history.pop_front();
        }
    }

    fn record_request(&mut self, kind: MoveKind, wanted: bool) {
        let window = self.cfg.request_window;
        if let Some(st) = self.kinds.get_mut(&kind) {
            st.requests.push_back(wanted);
            while st.requests.len() > window {
                st.requests.pop_front();
            }
        }
    }

    fn clear_requests(&mut self, kind: MoveKind) {
        if let Some(st) = self.kinds.get_mut(&kind) {
            st.requests.clear();
        }
    }

    // DEBOUNCE GATE. FORCED MOVES SKIP ONLY THE REQUEST COUNT.
    pub fn can_do_move(&self, kind: MoveKind, forced: bool) -> bool {
        let Some(st) = self.kinds.get(&kind) else {
            return false;
        };
        if !forced
            && st.request_count() < tuning::debounce_threshold(self.cfg.request_window, self.cfg.request_ratio)
        {
            return false;
        }
        if let Some(good) = self.last_good {
            if self.epoch.saturating_sub(good) < tuning::cooldown_epochs(self.cfg.request_window) {
                return false;
            }
        }
        if let Some(failed) = st.last_failure {
            if self.epoch <= failed + st.penalty {
                return false;
            }
        }
        true
    }

    // IN PRIORITY ORDER. ADD AND REMOVE NEVER FIRE TOGETHER: THE CONFIG
    // KEEPS add_ratio <= can_remove_ratio.
    fn evaluate(&self, model: &Model, r: &LoadRatios, th: Thresholds) -> Vec<Want> {
        let c = &self.cfg;
        let n = model.shared_count();
        let vm_cpus = model.pool.vm_cpus().len();
        let mut wants = Vec::new();

        match model.mode {
            Mode::Dedicated => {
                let forced = c.min_io_cores > 0;
                if r.overall_io > c.start_shared_ratio || forced {
                    let k = tuning::start_worker_count(r.effective_io, c.min_io_cores, c.max_io_cores);
                    if vm_cpus > k {
                        wants.push(Want { mv: Move::StartSharedWorkers(k), forced });
                    }
                }
            }
            Mode::Shared => {
                if n == 1 && c.min_io_cores == 0 && (1.0 - r.idle) < c.stop_shared_ratio {
                    wants.push(Want { mv: Move::StopSharedWorkers, forced: false });
                }
                if n < c.max_io_cores && vm_cpus > 1 {
                    if n < c.min_io_cores {
                        wants.push(Want { mv: Move::AddIoCore, forced: true });
                    } else if r.idle < th.add_ratio && r.vm_idle_cores >= c.vm_can_remove_ratio {
                        wants.push(Want { mv: Move::AddIoCore, forced: false });
                    }
                }
                if n > c.floor() {
                    if r.empty_cores > c.hard_remove_ratio {
                        wants.push(Want { mv: Move::RemoveIoCore, forced: true });
                    } else if r.idle > th.can_remove_ratio {
                        wants.push(Want { mv: Move::RemoveIoCore, forced: false });
                    }
                    if r.avg_bytes_per_packet < th.min_avg_bytes_per_packet {
                        wants.push(Want { mv: Move::BatchReduceCores, forced: false });
                    }
                }
            }
        }
        wants
    }

    // --- OUTCOME CHECK ---

    fn resolve<H: HostInterface + ?Sized>(&mut self, host: &mut H, model: &mut Model, f: MoveInFlight) -> Result<Outcome> {
        let grace = self.cfg.grace_period.min(f.samples.len());
        let after = mean(&f.samples[grace..]);
        let cpus = f.undo.cpus();

        if tuning::outcome_improved(f.before, after, self.cfg.improvement_epsilon) {
            for st in self.kinds.values_mut() {
                *st = KindState::new(self.cfg.initial_penalty);
            }
            self.last_good = Some(self.epoch);
            self.commits += 1;
            info!("COMMIT {} BEFORE={:.4} AFTER={:.4}", f.mv, f.before, after);
            return Ok(Outcome {
                mv: f.mv,
                verdict: Verdict::Committed,
                before: f.before,
                after,
                penalty: 0,
                cpus,
            });
        }

        let kind = f.mv.kind();
        let penalty = match self.kinds.get_mut(&kind) {
            Some(st) => {
                st.penalty = tuning::escalate_penalty(
                    st.penalty,
                    self.cfg.initial_penalty,
                    self.cfg.regret_factor,
                    self.cfg.penalty_cap,
                );
                st.last_failure = Some(self.epoch);
                st.penalty
            }
            None => 0,
        };
        self.reverts += 1;
        warn!(
            "REVERT {} BEFORE={:.4} AFTER={:.4} PENALTY={}",
            f.mv, f.before, after, penalty
        );
        self.undo(host, model, f.undo)?;
        Ok(Outcome {
            mv: f.mv,
            verdict: Verdict::Reverted,
            before: f.before,
            after,
            penalty,
            cpus,
        })
    }

    // --- STRUCTURAL ACTIONS ---

    pub fn allowed(&self, model: &Model, mv: &Move) -> bool {
        let c = &self.cfg;
        let n = model.shared_count();
        let vm_cpus = model.pool.vm_cpus().len();
        match (model.mode, mv) {
            (Mode::Dedicated, Move::StartSharedWorkers(k)) => {
                *k >= c.floor() && *k <= c.max_io_cores && vm_cpus > *k
            }
            (Mode::Shared, Move::StopSharedWorkers) => n == 1 && c.min_io_cores == 0,
            (Mode::Shared, Move::AddIoCore) => n < c.max_io_cores && vm_cpus > 1,
            (Mode::Shared, Move::RemoveIoCore | Move::BatchReduceCores) => n > c.floor(),
            (Mode::Shared, Move::Rebalance) => true,
            _ => false,
        }
    }

    pub fn execute<H: HostInterface + ?Sized>(&mut self, host: &mut H, model: &mut Model, mv: Move) -> Result<Undo> {
        if !self.allowed(model, &mv) {
            return Err(Error::invariant(format!(
                "{} not allowed in {} mode with {} workers",
                mv,
                model.mode,
                model.workers.len()
            )));
        }
        match mv {
            Move::AddIoCore => self.add_io_core(host, model),
            Move::RemoveIoCore | Move::BatchReduceCores => self.remove_io_core(host, model),
            Move::StartSharedWorkers(k) => {
                let cpus = model.pool.take_from_vm_pool(k)?;
                if let Err(e) = self.enter_shared_on(host, model, &cpus) {
                    give_back(model, &cpus);
                    return Err(e);
                }
                Ok(Undo::StartShared { cpus })
            }
            Move::StopSharedWorkers => {
                let cpu = first(model.pool.take_from_worker_pool(1)?)?;
                if let Err(e) = self.enter_dedicated(host, model) {
                    if let Err(re) = model.pool.return_to_worker_pool(cpu) {
                        warn!("cpu {}: return to worker pool failed: {}", cpu, re);
                    }
                    return Err(e);
                }
                Ok(Undo::StopShared { cpu })
            }
            Move::Rebalance => {
                let plan = self.balancer.plan(&model.device_infos(), &model.worker_slots())?;
                model.apply_change_set(host, &plan)?;
                Ok(Undo::Rebalance { changes: plan })
            }
        }
    }

    pub fn undo<H: HostInterface + ?Sized>(&mut self, host: &mut H, model: &mut Model, undo: Undo) -> Result<()> {
        match undo {
            Undo::AddIoCore { worker, cpu, changes } => {
                model.apply_change_set(host, &changes.inverse())?;
                model.destroy_worker(host, worker)?;
                model.pool.return_to_vm_pool(cpu)?;
                model.place_vms(host)
            }
            Undo::RemoveIoCore { removed, cpu, changes } => {
                model.pool.return_to_worker_pool(cpu)?;
                let fresh = match model.create_worker(host, CpuMask::single(cpu)) {
                    Ok(w) => w,
                    Err(e) => {
                        give_back(model, &[cpu]);
                        return Err(e);
                    }
                };
                model.apply_change_set(host, &changes.inverse().remap_worker(removed, fresh))?;
                model.place_vms(host)
            }
            Undo::StartShared { .. } => self.enter_dedicated(host, model),
            Undo::StopShared { cpu } => {
                model.pool.return_to_worker_pool(cpu)?;
                self.enter_shared_on(host, model, &[cpu])
            }
            Undo::Rebalance { changes } => model.apply_change_set(host, &changes.inverse()),
        }
    }

    fn add_io_core<H: HostInterface + ?Sized>(&mut self, host: &mut H, model: &mut Model) -> Result<Undo> {
        let cpu = first(model.pool.take_from_vm_pool(1)?)?;
        let worker = match model.create_worker(host, CpuMask::single(cpu)) {
            Ok(w) => w,
            Err(e) => {
                give_back(model, &[cpu]);
                return Err(e);
            }
        };
        let added = WorkerSlot { id: worker, cpu };
        let changes = match self
            .balancer
            .plan_after_addition(&model.device_infos(), &model.worker_slots(), &[added])
            .and_then(|cs| model.apply_change_set(host, &cs).map(|_| cs))
        {
            Ok(cs) => cs,
            Err(e) => {
                if let Err(de) = model.destroy_worker(host, worker) {
                    warn!("{}: cleanup after failed add: {}", worker, de);
                }
                give_back(model, &[cpu]);
                return Err(e);
            }
        };
        let undo = Undo::AddIoCore { worker, cpu, changes };
        if let Err(e) = model.place_vms(host) {
            self.unwind(host, model, undo);
            return Err(e);
        }
        Ok(undo)
    }

    fn remove_io_core<H: HostInterface + ?Sized>(&mut self, host: &mut H, model: &mut Model) -> Result<Undo> {
        let served = model.served_per_cpu();
        model.pool.update_served(served);
        let cpu = first(model.pool.select_from_worker_pool(1)?)?;
        let removed = model
            .worker_on(cpu)
            .ok_or_else(|| Error::invariant(format!("no shared worker on cpu {}", cpu)))?;
        let changes = self
            .balancer
            .plan_before_removal(&model.device_infos(), &model.worker_slots(), removed)?;
        model.apply_change_set(host, &changes)?;
        if let Err(e) = model.destroy_worker(host, removed) {
            if let Err(re) = model.apply_change_set(host, &changes.inverse()) {
                warn!("{}: restoring devices failed: {}", removed, re);
            }
            return Err(e);
        }
        model.pool.return_to_vm_pool(cpu)?;
        let undo = Undo::RemoveIoCore { removed, cpu, changes };
        if let Err(e) = model.place_vms(host) {
            self.unwind(host, model, undo);
            return Err(e);
        }
        Ok(undo)
    }

    // A LATE STEP OF A MOVE FAILED: PUT EVERYTHING BACK, KEEP THE FIRST ERROR
    fn unwind<H: HostInterface + ?Sized>(&mut self, host: &mut H, model: &mut Model, undo: Undo) {
        let label = format!("{:?}", undo.cpus());
        if let Err(e) = self.undo(host, model, undo) {
            warn!("unwinding move on cpus {} failed: {}", label, e);
        }
    }

    // `cpus` ARE ALREADY IN THE WORKER POOL. ONE NEW WORKER PER CPU TAKES
    // OVER EVERY DEVICE, THEN THE OLD WORKERS GO.
    fn enter_shared_on<H: HostInterface + ?Sized>(&mut self, host: &mut H, model: &mut Model, cpus: &[usize]) -> Result<()> {
        let old: Vec<WorkerId> = model.workers.keys().copied().collect();
        let mut fresh: Vec<WorkerSlot> = Vec::with_capacity(cpus.len());
        for &cpu in cpus {
            match model.create_worker(host, CpuMask::single(cpu)) {
                Ok(id) => fresh.push(WorkerSlot { id, cpu }),
                Err(e) => {
                    discard_workers(host, model, &fresh);
                    return Err(e);
                }
            }
        }

        let applied = self
            .balancer
            .plan_for_worker_count(&model.device_infos(), &fresh)
            .and_then(|cs| model.apply_change_set(host, &cs));
        if let Err(e) = applied {
            discard_workers(host, model, &fresh);
            return Err(e);
        }

        for id in old {
            model.destroy_worker(host, id)?;
        }
        model.mode = Mode::Shared;
        model.set_polling(host, true)?;
        model.reset_affinity(host)?;
        model.place_vms(host)?;
        debug!("SHARED ON {:?}", cpus);
        Ok(())
    }

    // EVERY SHARED WORKER KEEPS ITS FIRST DEVICE AND IS RE-PINNED WIDE. EVERY
    // OTHER DEVICE GETS A NEW DEDICATED WORKER. THE WORKER POOL EMPTIES INTO
    // THE VM POOL IN REVERSE ORDER SO A LAST-ADDED POOL REPLAYS EXACTLY.
    fn enter_dedicated<H: HostInterface + ?Sized>(&mut self, host: &mut H, model: &mut Model) -> Result<()> {
        let wide = model.pool.vm_mask().union(&model.pool.worker_mask());
        let shared: Vec<WorkerId> = model.workers.keys().copied().collect();

        let mut changes = ChangeSet::new();
        for id in &shared {
            let devices: Vec<_> = model
                .workers
                .get(id)
                .map(|w| w.devices.iter().copied().collect())
                .unwrap_or_default();
            model.retarget_worker(host, *id, wide)?;
            for &dev in devices.iter().skip(1) {
                let dedicated = model.create_worker(host, wide)?;
                changes.insert(dev, *id, dedicated)?;
            }
        }
        model.apply_change_set(host, &changes)?;

        for id in shared {
            if model.workers.get(&id).is_some_and(|w| w.devices.is_empty()) {
                model.destroy_worker(host, id)?;
            }
        }
        model.mode = Mode::Dedicated;
        let back: Vec<usize> = model.pool.worker_cpus().iter().rev().copied().collect();
        for cpu in back {
            model.pool.return_to_vm_pool(cpu)?;
        }
        model.set_polling(host, false)?;
        model.reset_affinity(host)?;
        model.place_vms(host)?;
        debug!("DEDICATED, {} WORKERS ON {}", model.workers.len(), wide);
        Ok(())
    }
}

fn first(cpus: Vec<usize>) -> Result<usize> {
    cpus.first()
        .copied()
        .ok_or_else(|| Error::invariant("pool handed out no cpu"))
}

// RETURN FRESHLY TAKEN CPUS, NEWEST FIRST
fn give_back(model: &mut Model, cpus: &[usize]) {
    for &cpu in cpus.iter().rev() {
        if let Err(e) = model.pool.return_to_vm_pool(cpu) {
            warn!("cpu {}: return to vm pool failed: {}", cpu, e);
        }
    }
}

fn discard_workers<H: HostInterface + ?Sized>(host: &mut H, model: &mut Model, slots: &[WorkerSlot]) {
    for s in slots {
        if let Err(e) = model.destroy_worker(host, s.id) {
            warn!("{}: cleanup failed: {}", s.id, e);
        }
    }
}
