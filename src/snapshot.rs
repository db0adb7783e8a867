// IOCORE COUNTER SNAPSHOT
// THE ONLY READER OF HOST COUNTERS. EVERY EPOCH: RESCAN THE INVENTORY,
// RE-READ EVERY TRACKED COUNTER, EMIT current - previous.
//
// A COUNTER SEEN FOR THE FIRST TIME, OR ONE THAT WENT BACKWARDS (WORKER
// DESTROYED AND RECREATED UNDER THE SAME NAME), IS RE-BASELINED: DELTA 0.
// ELEMENTS THAT VANISH FROM THE INVENTORY DROP THEIR BASELINES SO A LATER
// ELEMENT WITH THE SAME NAME STARTS CLEAN.

use std::collections::{BTreeMap, BTreeSet};

use crate::cpumask::CpuMask;
use crate::error::Result;
use crate::host::{self, counter, Element, HostInterface, Inventory, QueueId, WorkerId};

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct WorkerDelta {
    pub pid: i32,
    pub work_cycles: u64,
    pub softirq_interference: u64,
    pub loops: u64,
    pub empty_polls: u64,
    pub empty_works: u64,
    pub cpu_ticks: u64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct QueueDelta {
    pub handled_bytes: u64,
    pub handled_packets: u64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct CpuDelta {
    pub ticks: u64,
    pub idle: u64,
    pub softirq: u64,
    pub interrupts: u64,
}

#[derive(Clone, Debug, Default)]
pub struct EpochSnapshot {
    pub epoch: u64,
    pub cycles: u64,
    pub workers: BTreeMap<WorkerId, WorkerDelta>,
    pub queues: BTreeMap<QueueId, QueueDelta>,
    pub cpus: BTreeMap<usize, CpuDelta>,
}

impl EpochSnapshot {
    pub fn work_cycles(&self) -> u64 {
        self.workers.values().map(|w| w.work_cycles).sum()
    }

    pub fn softirq_interference(&self) -> u64 {
        self.workers.values().map(|w| w.softirq_interference).sum()
    }

    pub fn worker_ticks(&self) -> u64 {
        self.workers.values().map(|w| w.cpu_ticks).sum()
    }

    pub fn handled_bytes(&self) -> u64 {
        self.queues.values().map(|q| q.handled_bytes).sum()
    }

    pub fn handled_packets(&self) -> u64 {
        self.queues.values().map(|q| q.handled_packets).sum()
    }

    // AVERAGE TICKS ONE CPU ACCUMULATED THIS EPOCH
    pub fn host_ticks_per_cpu(&self) -> f64 {
        if self.cpus.is_empty() {
            return 0.0;
        }
        let total: u64 = self.cpus.values().map(|c| c.ticks).sum();
        total as f64 / self.cpus.len() as f64
    }

    // SOFTIRQ TIME ON `mask`, IN CPUS (0.5 = HALF A CORE)
    pub fn softirq_cpu(&self, mask: &CpuMask) -> f64 {
        self.share_on(mask, |c| c.softirq)
    }

    // IDLE TIME ON `mask`, IN CPUS
    pub fn idle_cpu(&self, mask: &CpuMask) -> f64 {
        self.share_on(mask, |c| c.idle)
    }

    pub fn interrupts_on(&self, mask: &CpuMask) -> u64 {
        self.cpus
            .iter()
            .filter(|(cpu, _)| mask.test(**cpu))
            .map(|(_, c)| c.interrupts)
            .sum()
    }

    // BUSY SHARE PER CPU, FOR THE MinUsage SELECTION STRATEGY
    pub fn cpu_usage(&self) -> BTreeMap<usize, f64> {
        self.cpus
            .iter()
            .map(|(&cpu, c)| {
                let busy = if c.ticks > 0 {
                    1.0 - c.idle as f64 / c.ticks as f64
                } else {
                    0.0
                };
                (cpu, busy.clamp(0.0, 1.0))
            })
            .collect()
    }

    fn share_on(&self, mask: &CpuMask, field: impl Fn(&CpuDelta) -> u64) -> f64 {
        self.cpus
            .iter()
            .filter(|(cpu, c)| mask.test(**cpu) && c.ticks > 0)
            .map(|(_, c)| field(c) as f64 / c.ticks as f64)
            .sum()
    }
}

pub struct CounterSnapshot {
    prev: BTreeMap<(Element, &'static str), u64>,
    epoch: u64,
    rebaselines: u64,
    inventory: Inventory,
}

const WORKER_COUNTERS: [&str; 5] = [
    host::WORK_CYCLES,
    host::KSOFTIRQS,
    host::LOOPS,
    host::EMPTY_POLLS,
    host::EMPTY_WORKS,
];
const QUEUE_COUNTERS: [&str; 2] = [host::HANDLED_BYTES, host::HANDLED_PACKETS];
const CPU_COUNTERS: [&str; 4] = [host::TICKS, host::IDLE, host::SOFTIRQ, host::INTERRUPTS];

impl CounterSnapshot {
    pub fn new() -> Self {
        Self {
            prev: BTreeMap::new(),
            epoch: 0,
            rebaselines: 0,
            inventory: Inventory::default(),
        }
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    // FIRST SIGHTINGS ARE NOT COUNTED. ONLY BACKWARDS COUNTERS ARE.
    pub fn rebaselines(&self) -> u64 {
        self.rebaselines
    }

    pub fn inventory(&self) -> &Inventory {
        &self.inventory
    }

    pub fn refresh<H: HostInterface + ?Sized>(&mut self, host: &mut H) -> Result<EpochSnapshot> {
        let inventory = host.inventory()?;
        let mut live: BTreeSet<Element> = BTreeSet::new();
        let mut snap = EpochSnapshot {
            epoch: self.epoch + 1,
            ..EpochSnapshot::default()
        };

        live.insert(Element::Global);
        let global = host.read_counters(&Element::Global)?;
        snap.cycles = self.delta(Element::Global, host::CYCLES, counter(&global, host::CYCLES));

        for &w in &inventory.workers {
            let el = Element::Worker(w);
            live.insert(el);
            let raw = host.read_counters(&el)?;
            let mut d = WorkerDelta {
                pid: counter(&raw, host::PID) as i32,
                ..WorkerDelta::default()
            };
            let mut vals = [0u64; 5];
            for (i, &name) in WORKER_COUNTERS.iter().enumerate() {
                vals[i] = self.delta(el, name, counter(&raw, name));
            }
            d.work_cycles = vals[0];
            d.softirq_interference = vals[1];
            d.loops = vals[2];
            d.empty_polls = vals[3];
            d.empty_works = vals[4];

            if d.pid > 0 {
                let proc_el = Element::Process(d.pid);
                live.insert(proc_el);
                let praw = host.read_counters(&proc_el)?;
                d.cpu_ticks = self.delta(proc_el, host::TICKS, counter(&praw, host::TICKS));
            }
            snap.workers.insert(w, d);
        }

        for &q in &inventory.queues {
            let el = Element::Queue(q);
            live.insert(el);
            let raw = host.read_counters(&el)?;
            snap.queues.insert(
                q,
                QueueDelta {
                    handled_bytes: self.delta(el, QUEUE_COUNTERS[0], counter(&raw, QUEUE_COUNTERS[0])),
                    handled_packets: self.delta(el, QUEUE_COUNTERS[1], counter(&raw, QUEUE_COUNTERS[1])),
                },
            );
        }

        for cpu in 0..inventory.nr_cpus {
            let el = Element::Cpu(cpu);
            live.insert(el);
            let raw = host.read_counters(&el)?;
            let mut vals = [0u64; 4];
            for (i, &name) in CPU_COUNTERS.iter().enumerate() {
                vals[i] = self.delta(el, name, counter(&raw, name));
            }
            snap.cpus.insert(
                cpu,
                CpuDelta {
                    ticks: vals[0],
                    idle: vals[1],
                    softirq: vals[2],
                    interrupts: vals[3],
                },
            );
        }

        self.prev.retain(|(el, _), _| live.contains(el));
        self.inventory = inventory;
        self.epoch = snap.epoch;
        Ok(snap)
    }

    fn delta(&mut self, el: Element, name: &'static str, current: u64) -> u64 {
        match self.prev.insert((el, name), current) {
            Some(prev) if current >= prev => current - prev,
            Some(_) => {
                self.rebaselines += 1;
                0
            }
            None => 0,
        }
    }
}

impl Default for CounterSnapshot {
    fn default() -> Self {
        Self::new()
    }
}
