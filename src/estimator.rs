// IOCORE LOAD ESTIMATOR
// SNAPSHOT DELTAS -> NORMALIZED RATIOS. PURE ARITHMETIC PLUS A SMALL
// ROLLING HISTORY FOR TELEMETRY. NO HOST ACCESS.
//
// N = SHARED WORKER COUNT, 0 MEANS DEDICATED (ONE THREAD PER DEVICE).
//
// idle        = 1 - work / (cycles * max(N,1)) - softirq_adj, CLAMPED >= 0
// empty_cores = max(N,1) - work / cycles - softirq_adj, CLAMPED >= 0
//               (NOT NORMALIZED: 1.0 IS ONE WHOLE CORE WASTED)
// effective   = work / cycles + softirq_adj
// overall     = worker process ticks / host ticks per cpu
// throughput  = handled bytes / cycles (THE OUTCOME-CHECK METRIC)
//
// softirq_adj: A KSOFTIRQD THREAD PREEMPTING A WORKER STEALS TIME THE WORKER'S
// CYCLE COUNTER NEVER SEES AS WORK. s = SOFTIRQ SHARE ON WORKER CPUS, THE
// PART ALREADY ACCOUNTED FOR AS INTERFERENCE IS SUBTRACTED BACK OUT.

use crate::cpumask::CpuMask;
use crate::snapshot::EpochSnapshot;
use crate::tuning::Thresholds;

const OVERALL_EPSILON: f64 = 1e-6;

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct LoadRatios {
    pub idle: f64,
    pub empty_cores: f64,
    pub effective_io: f64,
    pub overall_io: f64,
    pub avg_bytes_per_packet: f64,
    pub throughput: f64,
    pub softirq_adj: f64,
    pub vm_idle_cores: f64,
}

// RETURNS (RATIOS, CLAMPED)
pub fn compute(
    n: usize,
    snap: &EpochSnapshot,
    worker_cpus: &CpuMask,
    vm_cpus: &CpuMask,
) -> (LoadRatios, bool) {
    let cycles = snap.cycles as f64;
    let work = snap.work_cycles() as f64;

    let mut softirq_adj = 0.0;
    if n > 0 {
        let interrupts = snap.interrupts_on(worker_cpus);
        if interrupts > 0 {
            let s = snap.softirq_cpu(worker_cpus);
            softirq_adj = s - s * snap.softirq_interference() as f64 / interrupts as f64;
        }
    }

    let (busy, work_ratio, throughput) = if cycles > 0.0 {
        (
            work / (cycles * n.max(1) as f64),
            work / cycles,
            snap.handled_bytes() as f64 / cycles,
        )
    } else {
        (0.0, 0.0, 0.0)
    };

    let raw_idle = 1.0 - busy - softirq_adj;
    // NO CYCLES, NO MEASUREMENT: NOTHING IS PROVABLY EMPTY
    let empty_cores = if cycles > 0.0 {
        (n.max(1) as f64 - work_ratio - softirq_adj).max(0.0)
    } else {
        0.0
    };
    let clamped = raw_idle < 0.0;

    let packets = snap.handled_packets();
    let avg_bytes_per_packet = if packets > 0 {
        snap.handled_bytes() as f64 / packets as f64
    } else {
        1.0
    };

    let host_ticks = snap.host_ticks_per_cpu().max(OVERALL_EPSILON);

    let ratios = LoadRatios {
        idle: raw_idle.max(0.0),
        empty_cores,
        effective_io: work_ratio + softirq_adj,
        overall_io: snap.worker_ticks() as f64 / host_ticks,
        avg_bytes_per_packet,
        throughput,
        softirq_adj,
        vm_idle_cores: snap.idle_cpu(vm_cpus),
    };
    (ratios, clamped)
}

// --- ROLLING HISTORY ---

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Rolling {
    pub min: f64,
    pub max: f64,
    sum: f64,
    count: u64,
}

impl Rolling {
    fn new() -> Self {
        Self {
            min: f64::INFINITY,
            max: f64::NEG_INFINITY,
            sum: 0.0,
            count: 0,
        }
    }

    fn push(&mut self, v: f64) {
        self.min = self.min.min(v);
        self.max = self.max.max(v);
        self.sum += v;
        self.count += 1;
    }

    pub fn avg(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.sum / self.count as f64
        }
    }

    pub fn count(&self) -> u64 {
        self.count
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RatioHistory {
    pub idle: Rolling,
    pub effective_io: Rolling,
    pub overall_io: Rolling,
    pub throughput: Rolling,
}

impl RatioHistory {
    fn new() -> Self {
        Self {
            idle: Rolling::new(),
            effective_io: Rolling::new(),
            overall_io: Rolling::new(),
            throughput: Rolling::new(),
        }
    }
}

pub struct LoadEstimator {
    table: Vec<Thresholds>,
    reset_every: u64,
    since_reset: u64,
    clamp_events: u64,
    history: RatioHistory,
}

impl LoadEstimator {
    pub fn new(table: Vec<Thresholds>, reset_every: u64) -> Self {
        Self {
            table,
            reset_every: reset_every.max(1),
            since_reset: 0,
            clamp_events: 0,
            history: RatioHistory::new(),
        }
    }

    pub fn estimate(
        &mut self,
        n: usize,
        snap: &EpochSnapshot,
        worker_cpus: &CpuMask,
        vm_cpus: &CpuMask,
    ) -> LoadRatios {
        let (r, clamped) = compute(n, snap, worker_cpus, vm_cpus);
        if clamped {
            self.clamp_events += 1;
        }
        self.record(&r);
        r
    }

    // HISTORY ONLY. USED WHEN RATIOS ARE INJECTED INSTEAD OF MEASURED.
    pub fn record(&mut self, r: &LoadRatios) {
        if self.since_reset >= self.reset_every {
            self.history = RatioHistory::new();
            self.since_reset = 0;
        }
        self.history.idle.push(r.idle);
        self.history.effective_io.push(r.effective_io);
        self.history.overall_io.push(r.overall_io);
        self.history.throughput.push(r.throughput);
        self.since_reset += 1;
    }

    // ENTRY N, OR THE LAST ENTRY FOR ANY LARGER POOL
    pub fn thresholds(&self, n: usize) -> Thresholds {
        self.table
            .get(n)
            .or_else(|| self.table.last())
            .copied()
            .unwrap_or_default()
    }

    pub fn clamp_events(&self) -> u64 {
        self.clamp_events
    }

    pub fn history(&self) -> &RatioHistory {
        &self.history
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::{CpuDelta, QueueDelta, WorkerDelta};
    use crate::host::{QueueId, WorkerId};

    fn snap(cycles: u64, work: &[u64]) -> EpochSnapshot {
        let mut s = EpochSnapshot { cycles, ..EpochSnapshot::default() };
        for (i, &w) in work.iter().enumerate() {
            s.workers.insert(
                WorkerId(i as u32),
                WorkerDelta { work_cycles: w, cpu_ticks: w / 10, ..WorkerDelta::default() },
            );
        }
        s
    }

    #[test]
    fn idle_normalized_by_worker_count() {
        let s = snap(1000, &[900, 900]);
        let (r, clamped) = compute(2, &s, &CpuMask::new(), &CpuMask::new());
        assert!((r.idle - 0.1).abs() < 1e-9);
        assert!((r.effective_io - 1.8).abs() < 1e-9);
        assert!((r.empty_cores - 0.2).abs() < 1e-9);
        assert!(!clamped);
    }

    #[test]
    fn empty_cores_not_normalized() {
        // THREE IDLE WORKERS: NORMALIZED IDLE TOPS OUT AT 1, EMPTY CORES DO NOT
        let s = snap(1000, &[0, 0, 0]);
        let (r, _) = compute(3, &s, &CpuMask::new(), &CpuMask::new());
        assert_eq!(r.idle, 1.0);
        assert!((r.empty_cores - 3.0).abs() < 1e-9);
        assert!(r.empty_cores > crate::tuning::DEFAULT_HARD_REMOVE_RATIO);

        let s = snap(1000, &[600, 0]);
        let (r, _) = compute(2, &s, &CpuMask::new(), &CpuMask::new());
        assert!((r.idle - 0.7).abs() < 1e-9);
        assert!((r.empty_cores - 1.4).abs() < 1e-9);
    }

    #[test]
    fn idle_clamps_at_zero() {
        let s = snap(1000, &[1500]);
        let mut est = LoadEstimator::new(vec![Thresholds::default()], 100);
        let r = est.estimate(1, &s, &CpuMask::new(), &CpuMask::new());
        assert_eq!(r.idle, 0.0);
        assert_eq!(est.clamp_events(), 1);
    }

    #[test]
    fn softirq_adjustment_only_with_shared_workers() {
        let mut s = snap(1000, &[500]);
        s.workers.get_mut(&WorkerId(0)).unwrap().softirq_interference = 25;
        s.cpus.insert(2, CpuDelta { ticks: 100, idle: 0, softirq: 20, interrupts: 100 });
        let worker = CpuMask::single(2);

        // s = 0.2, ADJ = 0.2 - 0.2 * 25/100 = 0.15
        let (r, _) = compute(1, &s, &worker, &CpuMask::new());
        assert!((r.softirq_adj - 0.15).abs() < 1e-9);
        assert!((r.idle - 0.35).abs() < 1e-9);
        assert!((r.effective_io - 0.65).abs() < 1e-9);

        let (r, _) = compute(0, &s, &worker, &CpuMask::new());
        assert_eq!(r.softirq_adj, 0.0);
    }

    #[test]
    fn empty_epoch_is_safe() {
        let s = EpochSnapshot::default();
        let (r, clamped) = compute(3, &s, &CpuMask::new(), &CpuMask::new());
        assert_eq!(r.idle, 1.0);
        assert_eq!(r.empty_cores, 0.0);
        assert_eq!(r.avg_bytes_per_packet, 1.0);
        assert_eq!(r.throughput, 0.0);
        assert!(r.overall_io.is_finite());
        assert!(!clamped);
    }

    #[test]
    fn bytes_per_packet_and_throughput() {
        let mut s = snap(2000, &[0]);
        s.queues.insert(
            QueueId { dev: 0, idx: 0 },
            QueueDelta { handled_bytes: 3000, handled_packets: 2 },
        );
        let (r, _) = compute(1, &s, &CpuMask::new(), &CpuMask::new());
        assert_eq!(r.avg_bytes_per_packet, 1500.0);
        assert_eq!(r.throughput, 1.5);
    }

    #[test]
    fn thresholds_fall_back_to_last_entry() {
        let a = Thresholds { add_ratio: 0.4, can_remove_ratio: 1.0, min_avg_bytes_per_packet: 0.0 };
        let b = Thresholds { add_ratio: 0.05, can_remove_ratio: 0.25, min_avg_bytes_per_packet: 0.0 };
        let est = LoadEstimator::new(vec![a, b], 10);
        assert_eq!(est.thresholds(0), a);
        assert_eq!(est.thresholds(7), b);
    }

    #[test]
    fn history_resets_after_window() {
        let mut est = LoadEstimator::new(vec![], 3);
        for i in 0..3 {
            est.record(&LoadRatios { idle: i as f64, ..LoadRatios::default() });
        }
        assert_eq!(est.history().idle.count(), 3);
        assert_eq!(est.history().idle.max, 2.0);
        est.record(&LoadRatios { idle: 9.0, ..LoadRatios::default() });
        assert_eq!(est.history().idle.count(), 1);
        assert_eq!(est.history().idle.min, 9.0);
    }
}
