// IOCORE ADAPTIVE CONTROL LOOP
// ONE THREAD, ONE EPOCH AT A TIME:
//
//   REFRESH  -> COUNTER SNAPSHOT DELTAS
//   ESTIMATE -> NORMALIZED LOAD RATIOS FOR THE CURRENT WORKER COUNT
//   CLASSIFY -> LOW/HIGH USAGE PER DEVICE (FROZEN WHILE A MOVE IS IN FLIGHT)
//   DECIDE   -> DECISION ENGINE: DEBOUNCE, EXECUTE, MEASURE, COMMIT OR REVERT
//   VERIFY   -> OWNERSHIP, ASSIGNMENT AND AFFINITY INVARIANTS
//
// A HOST ERROR COSTS ONE EPOCH. AN INVARIANT VIOLATION STOPS THE LOOP.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use log::{error, warn};

use crate::classifier::{ByteRateClassifier, TrafficClassifier};
use crate::engine::{DecisionEngine, StepReport};
use crate::error::Result;
use crate::estimator::{LoadEstimator, LoadRatios};
use crate::event::{EpochEvent, EpochRecord, EventLog};
use crate::host::HostInterface;
use crate::model::Model;
use crate::snapshot::CounterSnapshot;
use crate::tuning;

pub struct Controller {
    pub snapshot: CounterSnapshot,
    pub estimator: LoadEstimator,
    pub classifier: Box<dyn TrafficClassifier>,
    pub model: Model,
    pub engine: DecisionEngine,
    pub log: EventLog,
    last: LoadRatios,
    failed_epochs: u64,
}

impl Controller {
    pub fn new(
        model: Model,
        engine: DecisionEngine,
        estimator: LoadEstimator,
        classifier: Box<dyn TrafficClassifier>,
    ) -> Self {
        Self {
            snapshot: CounterSnapshot::new(),
            estimator,
            classifier,
            model,
            engine,
            log: EventLog::new(),
            last: LoadRatios::default(),
            failed_epochs: 0,
        }
    }

    pub fn with_byte_rate_classifier(
        model: Model,
        engine: DecisionEngine,
        estimator: LoadEstimator,
        active_threshold: u64,
    ) -> Self {
        Self::new(model, engine, estimator, Box::new(ByteRateClassifier::new(active_threshold)))
    }

    pub fn last_ratios(&self) -> &LoadRatios {
        &self.last
    }

    pub fn failed_epochs(&self) -> u64 {
        self.failed_epochs
    }

    pub fn start<H: HostInterface + ?Sized>(&mut self, host: &mut H, io_cores: &[usize]) -> Result<()> {
        self.engine.start(host, &mut self.model, io_cores)?;
        self.model.check_invariants()
    }

    // ONE FULL EPOCH AGAINST THE LIVE HOST
    pub fn tick<H: HostInterface + ?Sized>(&mut self, host: &mut H) -> Result<StepReport> {
        let snap = self.snapshot.refresh(host)?;
        let n = self.model.shared_count();
        let ratios = self.estimator.estimate(
            n,
            &snap,
            &self.model.pool.worker_mask(),
            &self.model.pool.vm_mask(),
        );
        if self.engine.in_flight().is_none() {
            self.classifier.update(&snap);
            self.model.update_classes(self.classifier.as_ref());
        }
        self.model.pool.update_usage(snap.cpu_usage());
        self.decide(host, ratios)
    }

    // DECIDE + VERIFY ON RATIOS SUPPLIED BY THE CALLER
    pub fn decide<H: HostInterface + ?Sized>(&mut self, host: &mut H, ratios: LoadRatios) -> Result<StepReport> {
        self.last = ratios;
        let th = self.estimator.thresholds(self.model.shared_count());
        let report = match self.engine.step(host, &mut self.model, &ratios, th) {
            Ok(r) => r,
            Err(e) => {
                self.failed_epochs += 1;
                self.record(&ratios, EpochEvent::Failed);
                return Err(e);
            }
        };
        self.model.check_invariants()?;

        let event = match (&report.outcome, report.executed) {
            (Some(o), _) => EpochEvent::from_verdict(o.mv.kind(), o.verdict),
            (None, Some(mv)) => EpochEvent::Executed(mv.kind()),
            (None, None) => EpochEvent::None,
        };
        self.record(&ratios, event);
        Ok(report)
    }

    fn record(&mut self, r: &LoadRatios, event: EpochEvent) {
        self.log.record(EpochRecord {
            ts_ns: 0,
            epoch: self.engine.epoch(),
            io_cores: self.model.shared_count() as u32,
            vm_cpus: self.model.pool.vm_cpus().len() as u32,
            idle: r.idle,
            effective_io: r.effective_io,
            overall_io: r.overall_io,
            throughput: r.throughput,
            event,
        });
    }

    pub fn print_pool_summary(&self) {
        let (commits, reverts, rebalances) = self.engine.counts();
        let (vm_strategy, worker_strategy) = self.model.pool.strategy_names();
        let hist = self.estimator.history();
        println!(
            "[POOL] mode={} io_cores={} vm_cpus={} worker_cpus={:?} commits={} reverts={} rebalances={} failed={} clamps={} rebaselines={} idle=min:{:.2}/avg:{:.2}/max:{:.2} select={}/{} balance={}",
            self.model.mode,
            self.model.shared_count(),
            self.model.pool.vm_cpus().len(),
            self.model.pool.worker_cpus(),
            commits, reverts, rebalances,
            self.failed_epochs,
            self.estimator.clamp_events(),
            self.snapshot.rebaselines(),
            if hist.idle.count() > 0 { hist.idle.min } else { 0.0 },
            hist.idle.avg(),
            if hist.idle.count() > 0 { hist.idle.max } else { 0.0 },
            vm_strategy, worker_strategy,
            self.engine.balancer_name(),
        );
    }
}

// --- CONTROL LOOP ---

// RUNS ON THE MAIN THREAD UNTIL SHUTDOWN. `advance` IS CALLED BEFORE EVERY
// EPOCH WITH THE HOST (THE SIMULATOR USES IT TO MOVE TIME FORWARD).
pub fn control_loop<H, F>(
    host: &mut H,
    ctrl: &mut Controller,
    shutdown: &'static AtomicBool,
    interval: Duration,
    verbose: bool,
    mut advance: F,
) -> Result<()>
where
    H: HostInterface + ?Sized,
    F: FnMut(&mut H),
{
    let mut stability_score: u32 = 0;
    let mut next = Instant::now() + interval;

    while !shutdown.load(Ordering::Relaxed) {
        let now = Instant::now();
        if next > now {
            std::thread::sleep(next - now);
        }
        next += interval;

        advance(host);
        let report = match ctrl.tick(host) {
            Ok(r) => r,
            Err(e) if e.is_invariant_violation() => {
                error!("INVARIANT VIOLATION: {}", e);
                return Err(e);
            }
            Err(e) => {
                warn!("EPOCH {} FAILED: {}", ctrl.engine.epoch(), e);
                continue;
            }
        };

        let anything_wanted = !report.wanted.is_empty();
        stability_score =
            tuning::compute_stability_score(stability_score, anything_wanted, report.in_flight);

        if verbose || tuning::should_print_telemetry(report.epoch, stability_score) {
            let r = ctrl.last_ratios();
            let wanted: Vec<&str> = report.wanted.iter().map(|k| k.label()).collect();
            println!(
                "epoch: {:<6} io: {:<2} vm: {:<3} idle: {:.3} eff: {:.3} all: {:.3} bpp: {:<6.0} tput: {:.4} vm_idle: {:.2} want: [{}]{}{} [{}]",
                report.epoch,
                ctrl.model.shared_count(),
                ctrl.model.pool.vm_cpus().len(),
                r.idle, r.effective_io, r.overall_io,
                r.avg_bytes_per_packet, r.throughput, r.vm_idle_cores,
                wanted.join(","),
                report.executed.map(|m| format!(" exec: {}", m)).unwrap_or_default(),
                report
                    .outcome
                    .as_ref()
                    .map(|o| format!(" {:?}: {:.4}->{:.4}", o.verdict, o.before, o.after))
                    .unwrap_or_default(),
                if report.in_flight { "IN_FLIGHT".to_string() } else { ctrl.model.mode.to_string() },
            );
        }
    }

    ctrl.print_pool_summary();
    Ok(())
}
