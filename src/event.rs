// IOCORE EVENT LOG
// RECORDS ONE ENTRY PER EPOCH DURING CONTROLLER EXECUTION
// PRE-ALLOCATED RING BUFFER. NO HEAP ALLOCATION DURING MONITORING.
// WRAPS AROUND AT CAPACITY -- OLDEST ENTRIES OVERWRITTEN.

use crate::engine::{MoveKind, Verdict};

const MAX_RECORDS: usize = 8192;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum EpochEvent {
    None,
    Executed(MoveKind),
    Committed(MoveKind),
    Reverted(MoveKind),
    Failed,
}

impl EpochEvent {
    pub fn from_verdict(kind: MoveKind, verdict: Verdict) -> Self {
        match verdict {
            Verdict::Committed => EpochEvent::Committed(kind),
            Verdict::Reverted => EpochEvent::Reverted(kind),
        }
    }

    fn label(&self) -> String {
        match self {
            EpochEvent::None => "-".to_string(),
            EpochEvent::Executed(k) => k.label().to_string(),
            EpochEvent::Committed(k) => format!("COMMIT:{}", k.label()),
            EpochEvent::Reverted(k) => format!("REVERT:{}", k.label()),
            EpochEvent::Failed => "FAILED".to_string(),
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub struct EpochRecord {
    pub ts_ns:        u64,
    pub epoch:        u64,
    pub io_cores:     u32,
    pub vm_cpus:      u32,
    pub idle:         f64,
    pub effective_io: f64,
    pub overall_io:   f64,
    pub throughput:   f64,
    pub event:        EpochEvent,
}

const EMPTY: EpochRecord = EpochRecord {
    ts_ns: 0, epoch: 0, io_cores: 0, vm_cpus: 0,
    idle: 0.0, effective_io: 0.0, overall_io: 0.0, throughput: 0.0,
    event: EpochEvent::None,
};

pub struct EventLog {
    records: Vec<EpochRecord>,
    head:    usize,
    len:     usize,
}

impl EventLog {
    pub fn new() -> Self {
        Self {
            records: vec![EMPTY; MAX_RECORDS],
            head: 0,
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    // RECORD ONE EPOCH. OVERWRITES OLDEST ENTRY WHEN FULL.
    pub fn record(&mut self, mut rec: EpochRecord) {
        rec.ts_ns = now_ns();
        self.records[self.head] = rec;
        self.head = (self.head + 1) % MAX_RECORDS;
        if self.len < MAX_RECORDS {
            self.len += 1;
        }
    }

    // ITERATE RECORDS IN CHRONOLOGICAL ORDER
    fn iter_chronological(&self) -> impl Iterator<Item = &EpochRecord> {
        let start = if self.len < MAX_RECORDS { 0 } else { self.head };
        (0..self.len).map(move |i| {
            &self.records[(start + i) % MAX_RECORDS]
        })
    }

    // DUMP THE TIME SERIES AFTER EXECUTION
    pub fn dump(&self) {
        let mut iter = self.iter_chronological();
        let Some(first) = iter.next() else {
            return;
        };
        let base_ts = first.ts_ns;

        println!("\n{:<10} {:<8} {:<6} {:<6} {:<8} {:<8} {:<8} {:<10} {}",
            "TIME_S", "EPOCH", "IO", "VM", "IDLE", "EFF_IO", "ALL_IO", "TPUT", "EVENT");
        println!("{}", "-".repeat(84));

        for r in std::iter::once(first).chain(iter) {
            let elapsed_s = r.ts_ns.saturating_sub(base_ts) as f64 / 1_000_000_000.0;
            println!("{:<10.1} {:<8} {:<6} {:<6} {:<8.3} {:<8.3} {:<8.3} {:<10.4} {}",
                elapsed_s, r.epoch, r.io_cores, r.vm_cpus,
                r.idle, r.effective_io, r.overall_io, r.throughput, r.event.label());
        }

        if self.len == MAX_RECORDS {
            println!("\n(RING BUFFER WRAPPED -- SHOWING MOST RECENT {} EPOCHS)", MAX_RECORDS);
        }
        println!("TOTAL EPOCHS: {}", self.len);
    }

    // SUMMARY STATISTICS
    pub fn summary(&self) {
        if self.len < 2 {
            return;
        }

        let records: Vec<&EpochRecord> = self.iter_chronological().collect();
        let count = |pred: fn(&EpochEvent) -> bool| records.iter().filter(|r| pred(&r.event)).count();

        let executed = count(|e| matches!(e, EpochEvent::Executed(k) if *k != MoveKind::Rebalance));
        let rebalances = count(|e| matches!(e, EpochEvent::Executed(MoveKind::Rebalance)));
        let commits = count(|e| matches!(e, EpochEvent::Committed(_)));
        let reverts = count(|e| matches!(e, EpochEvent::Reverted(_)));
        let failures = count(|e| matches!(e, EpochEvent::Failed));

        let peak_io = records.iter().map(|r| r.io_cores).max().unwrap_or(0);
        let avg_io = records.iter().map(|r| r.io_cores as f64).sum::<f64>() / records.len() as f64;
        let avg_tput = records.iter().map(|r| r.throughput).sum::<f64>() / records.len() as f64;

        let elapsed_ns = match (records.first(), records.last()) {
            (Some(a), Some(b)) => b.ts_ns.saturating_sub(a.ts_ns),
            _ => 0,
        };
        let elapsed_s = elapsed_ns as f64 / 1_000_000_000.0;

        println!("\n{}", "=".repeat(50));
        println!("IOCORE SUMMARY");
        println!("{}", "=".repeat(50));
        println!("  MOVES EXECUTED:    {}", executed);
        println!("  COMMITTED:         {}", commits);
        println!("  REVERTED:          {}", reverts);
        println!("  REBALANCES:        {}", rebalances);
        println!("  FAILED EPOCHS:     {}", failures);
        println!("  PEAK IO CORES:     {}", peak_io);
        println!("  AVG IO CORES:      {:.2}", avg_io);
        println!("  AVG THROUGHPUT:    {:.4} B/CYCLE", avg_tput);
        println!("  ELAPSED:           {:.1}s", elapsed_s);
        println!("  EPOCHS:            {}", self.len);
    }
}

impl Default for EventLog {
    fn default() -> Self {
        Self::new()
    }
}

fn now_ns() -> u64 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    unsafe {
        libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts);
    }
    (ts.tv_sec as u64) * 1_000_000_000 + (ts.tv_nsec as u64)
}
