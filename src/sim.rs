// IOCORE SIMULATED HOST
// DETERMINISTIC IN-MEMORY HostInterface. BACKS THE UNIT TESTS, THE
// PROPERTY TESTS IN tests/ AND `iocore --simulate` DRY RUNS.
//
// advance() MOVES TIME FORWARD: EVERY WORKER BURNS `busy` OF THE ELAPSED
// CYCLES, EVERY QUEUE MOVES `bytes_per_queue`, EVERY CPU ACCUMULATES
// TICKS_PER_ADVANCE TICKS. CPUS HOSTING A WORKER ARE BUSY IN PROPORTION.

use std::collections::{BTreeMap, BTreeSet};

use crate::cpumask::CpuMask;
use crate::error::{Error, Result};
use crate::host::{self, DeviceId, Element, HostInterface, Inventory, QueueId, RawCounters, WorkerId};

pub const TICKS_PER_ADVANCE: u64 = 100;
const MTU: u64 = 1500;
const PID_BASE: i32 = 10_000;

#[derive(Clone, Debug, Default)]
struct SimWorker {
    pid: i32,
    work_cycles: u64,
    ksoftirqs: u64,
    loops: u64,
    empty_polls: u64,
    empty_works: u64,
}

#[derive(Clone, Debug)]
struct SimDevice {
    worker: WorkerId,
}

#[derive(Clone, Debug, Default)]
struct SimQueue {
    bytes: u64,
    packets: u64,
    can_poll: bool,
    poll: bool,
}

#[derive(Clone, Copy, Debug, Default)]
struct SimCpu {
    ticks: u64,
    idle: u64,
    softirq: u64,
    interrupts: u64,
}

pub struct SimHost {
    nr_cpus: usize,
    cycles: u64,
    next_worker: u32,
    next_device: u32,
    workers: BTreeMap<WorkerId, SimWorker>,
    devices: BTreeMap<DeviceId, SimDevice>,
    queues: BTreeMap<QueueId, SimQueue>,
    cpus: Vec<SimCpu>,
    proc_ticks: BTreeMap<i32, u64>,
    affinity: BTreeMap<i32, CpuMask>,
    irqs: BTreeMap<u32, usize>,
    failing_devices: BTreeSet<DeviceId>,
    failing_pids: BTreeSet<i32>,
    failing_irqs: BTreeSet<u32>,
    fail_create: bool,
    writes: Vec<(Element, String, u64)>,
}

impl SimHost {
    pub fn new(nr_cpus: usize) -> Self {
        Self {
            nr_cpus,
            cycles: 0,
            next_worker: 1,
            next_device: 1,
            workers: BTreeMap::new(),
            devices: BTreeMap::new(),
            queues: BTreeMap::new(),
            cpus: vec![SimCpu::default(); nr_cpus],
            proc_ticks: BTreeMap::new(),
            affinity: BTreeMap::new(),
            irqs: BTreeMap::new(),
            failing_devices: BTreeSet::new(),
            failing_pids: BTreeSet::new(),
            failing_irqs: BTreeSet::new(),
            fail_create: false,
            writes: Vec::new(),
        }
    }

    pub fn nr_cpus(&self) -> usize {
        self.nr_cpus
    }

    // NEW DEVICE SERVED BY ITS OWN DEDICATED WORKER, CREATED ON CPU 0
    pub fn add_device(&mut self, queues: u32, can_poll: bool) -> DeviceId {
        let id = DeviceId(self.next_device);
        self.next_device += 1;
        let worker = self.spawn_worker(0);
        self.devices.insert(id, SimDevice { worker });
        for idx in 0..queues {
            self.queues.insert(
                QueueId { dev: id.0, idx },
                SimQueue { can_poll, ..SimQueue::default() },
            );
        }
        id
    }

    pub fn advance(&mut self, cycles: u64, busy: f64, bytes_per_queue: u64) {
        let busy = busy.clamp(0.0, 1.0);
        self.cycles += cycles;

        let work = (busy * cycles as f64) as u64;
        let busy_ticks = (busy * TICKS_PER_ADVANCE as f64) as u64;
        let mut hot = CpuMask::new();
        for w in self.workers.values_mut() {
            w.work_cycles += work;
            w.loops += 1;
            if work == 0 {
                w.empty_works += 1;
            }
            *self.proc_ticks.entry(w.pid).or_insert(0) += busy_ticks;
            if let Some(mask) = self.affinity.get(&w.pid) {
                hot = hot.union(mask);
            }
        }

        for (cpu, c) in self.cpus.iter_mut().enumerate() {
            c.ticks += TICKS_PER_ADVANCE;
            c.idle += if hot.test(cpu) {
                TICKS_PER_ADVANCE - busy_ticks
            } else {
                TICKS_PER_ADVANCE
            };
        }

        for q in self.queues.values_mut() {
            q.bytes += bytes_per_queue;
            q.packets += bytes_per_queue.div_ceil(MTU);
        }
    }

    pub fn add_softirq(&mut self, cpu: usize, softirq_ticks: u64, interrupts: u64) {
        if let Some(c) = self.cpus.get_mut(cpu) {
            c.softirq += softirq_ticks;
            c.interrupts += interrupts;
        }
    }

    pub fn worker_of(&self, dev: DeviceId) -> Option<WorkerId> {
        self.devices.get(&dev).map(|d| d.worker)
    }

    pub fn workers(&self) -> Vec<WorkerId> {
        self.workers.keys().copied().collect()
    }

    pub fn worker_pid(&self, id: WorkerId) -> Option<i32> {
        self.workers.get(&id).map(|w| w.pid)
    }

    // WORKER COUNTERS RESTART FROM ZERO, AS AFTER A DESTROY/CREATE UNDER THE SAME NAME
    pub fn reset_worker_counters(&mut self, id: WorkerId) {
        if let Some(w) = self.workers.get_mut(&id) {
            let pid = w.pid;
            *w = SimWorker { pid, ..SimWorker::default() };
        }
    }

    pub fn affinity_of(&self, pid: i32) -> Option<CpuMask> {
        self.affinity.get(&pid).copied()
    }

    pub fn irq_cpu(&self, irq: u32) -> Option<usize> {
        self.irqs.get(&irq).copied()
    }

    pub fn is_polling(&self, q: QueueId) -> bool {
        self.queues.get(&q).map(|q| q.poll).unwrap_or(false)
    }

    // NEXT WORKER-ASSIGNMENT WRITE TO `dev` FAILS
    pub fn fail_device_writes(&mut self, dev: DeviceId) {
        self.failing_devices.insert(dev);
    }

    // NEXT AFFINITY WRITE TO `pid` FAILS
    pub fn fail_affinity(&mut self, pid: i32) {
        self.failing_pids.insert(pid);
    }

    pub fn fail_irq_affinity(&mut self, irq: u32) {
        self.failing_irqs.insert(irq);
    }

    pub fn fail_worker_creation(&mut self, fail: bool) {
        self.fail_create = fail;
    }

    pub fn writes(&self) -> &[(Element, String, u64)] {
        &self.writes
    }

    fn spawn_worker(&mut self, cpu: usize) -> WorkerId {
        let id = WorkerId(self.next_worker);
        self.next_worker += 1;
        let pid = PID_BASE + id.0 as i32;
        self.workers.insert(id, SimWorker { pid, ..SimWorker::default() });
        self.affinity.insert(pid, CpuMask::single(cpu));
        self.proc_ticks.insert(pid, 0);
        id
    }

    fn all_cpus(&self) -> CpuMask {
        (0..self.nr_cpus).collect()
    }
}

impl HostInterface for SimHost {
    fn inventory(&mut self) -> Result<Inventory> {
        Ok(Inventory {
            workers: self.workers.keys().copied().collect(),
            devices: self.devices.keys().copied().collect(),
            queues: self.queues.keys().copied().collect(),
            nr_cpus: self.nr_cpus,
        })
    }

    fn read_counters(&mut self, element: &Element) -> Result<RawCounters> {
        let mut c = RawCounters::new();
        let mut put = |name: &str, v: u64| {
            c.insert(name.to_string(), v);
        };
        match element {
            Element::Global => put(host::CYCLES, self.cycles),
            Element::Worker(id) => {
                let w = self
                    .workers
                    .get(id)
                    .ok_or_else(|| Error::host(format!("{} does not exist", id)))?;
                put(host::PID, w.pid as u64);
                let cpu = self.affinity.get(&w.pid).and_then(|m| m.first()).unwrap_or(0);
                put(host::CPU, cpu as u64);
                put(host::WORK_CYCLES, w.work_cycles);
                put(host::KSOFTIRQS, w.ksoftirqs);
                put(host::LOOPS, w.loops);
                put(host::EMPTY_POLLS, w.empty_polls);
                put(host::EMPTY_WORKS, w.empty_works);
            }
            Element::Device(id) => {
                let d = self
                    .devices
                    .get(id)
                    .ok_or_else(|| Error::host(format!("{} does not exist", id)))?;
                put(host::WORKER, d.worker.0 as u64);
            }
            Element::Queue(id) => {
                let q = self
                    .queues
                    .get(id)
                    .ok_or_else(|| Error::host(format!("{} does not exist", id)))?;
                put(host::HANDLED_BYTES, q.bytes);
                put(host::HANDLED_PACKETS, q.packets);
                put(host::CAN_POLL, q.can_poll as u64);
                put(host::POLL, q.poll as u64);
            }
            Element::Process(pid) => {
                let t = self
                    .proc_ticks
                    .get(pid)
                    .ok_or_else(|| Error::host(format!("no process {}", pid)))?;
                put(host::TICKS, *t);
            }
            Element::Cpu(cpu) => {
                let s = self
                    .cpus
                    .get(*cpu)
                    .ok_or_else(|| Error::host(format!("no cpu {}", cpu)))?;
                put(host::TICKS, s.ticks);
                put(host::IDLE, s.idle);
                put(host::SOFTIRQ, s.softirq);
                put(host::INTERRUPTS, s.interrupts);
            }
        }
        Ok(c)
    }

    fn write_attribute(&mut self, element: &Element, name: &str, value: u64) -> Result<()> {
        match (element, name) {
            (Element::Device(id), host::WORKER) => {
                if self.failing_devices.remove(id) {
                    return Err(Error::host(format!("{}: write {} failed", id, name)));
                }
                let target = WorkerId(value as u32);
                if !self.workers.contains_key(&target) {
                    return Err(Error::host(format!("{}: no such worker {}", id, target)));
                }
                let d = self
                    .devices
                    .get_mut(id)
                    .ok_or_else(|| Error::host(format!("{} does not exist", id)))?;
                d.worker = target;
            }
            (Element::Queue(id), host::POLL) => {
                let q = self
                    .queues
                    .get_mut(id)
                    .ok_or_else(|| Error::host(format!("{} does not exist", id)))?;
                if !q.can_poll {
                    return Err(Error::host(format!("{} cannot poll", id)));
                }
                q.poll = value != 0;
            }
            _ => {
                return Err(Error::host(format!("{}: attribute {} is read-only", element, name)));
            }
        }
        self.writes.push((*element, name.to_string(), value));
        Ok(())
    }

    fn create_worker(&mut self, cpu: usize) -> Result<WorkerId> {
        if self.fail_create {
            return Err(Error::host("worker create failed"));
        }
        if cpu >= self.nr_cpus {
            return Err(Error::host(format!("cpu {} out of range", cpu)));
        }
        Ok(self.spawn_worker(cpu))
    }

    fn destroy_worker(&mut self, id: WorkerId) -> Result<()> {
        if self.devices.values().any(|d| d.worker == id) {
            return Err(Error::host(format!("{} still has devices attached", id)));
        }
        let w = self
            .workers
            .remove(&id)
            .ok_or_else(|| Error::host(format!("{} does not exist", id)))?;
        self.affinity.remove(&w.pid);
        self.proc_ticks.remove(&w.pid);
        Ok(())
    }

    fn set_cpu_affinity(&mut self, pid: i32, mask: &CpuMask) -> Result<()> {
        if self.failing_pids.remove(&pid) {
            return Err(Error::host(format!("pid {}: sched_setaffinity failed", pid)));
        }
        if mask.is_empty() || !mask.is_subset(&self.all_cpus()) {
            return Err(Error::host(format!("pid {}: invalid affinity {}", pid, mask)));
        }
        self.affinity.insert(pid, *mask);
        Ok(())
    }

    fn get_cpu_affinity(&mut self, pid: i32) -> Result<CpuMask> {
        Ok(self.affinity.get(&pid).copied().unwrap_or_else(|| self.all_cpus()))
    }

    fn set_irq_affinity(&mut self, irq: u32, cpu: usize) -> Result<()> {
        if self.failing_irqs.remove(&irq) {
            return Err(Error::host(format!("irq {}: smp_affinity write failed", irq)));
        }
        if cpu >= self.nr_cpus {
            return Err(Error::host(format!("irq {}: cpu {} out of range", irq, cpu)));
        }
        self.irqs.insert(irq, cpu);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn devices_start_on_dedicated_workers() {
        let mut h = SimHost::new(4);
        let a = h.add_device(2, true);
        let b = h.add_device(1, false);
        assert_ne!(h.worker_of(a), h.worker_of(b));
        let inv = h.inventory().unwrap();
        assert_eq!(inv.workers.len(), 2);
        assert_eq!(inv.queues_of(a).len(), 2);
    }

    #[test]
    fn destroy_refuses_attached_worker() {
        let mut h = SimHost::new(4);
        let d = h.add_device(1, false);
        let w = h.worker_of(d).unwrap();
        assert!(h.destroy_worker(w).is_err());
        let w2 = h.create_worker(2).unwrap();
        h.write_attribute(&Element::Device(d), host::WORKER, w2.0 as u64).unwrap();
        h.destroy_worker(w).unwrap();
        assert_eq!(h.worker_of(d), Some(w2));
    }

    #[test]
    fn injected_write_failure_fires_once() {
        let mut h = SimHost::new(2);
        let d = h.add_device(1, false);
        let w = h.create_worker(1).unwrap();
        h.fail_device_writes(d);
        assert!(h.write_attribute(&Element::Device(d), host::WORKER, w.0 as u64).is_err());
        h.write_attribute(&Element::Device(d), host::WORKER, w.0 as u64).unwrap();
        assert_eq!(h.writes().len(), 1);
    }

    #[test]
    fn softirq_shows_up_in_cpu_deltas() {
        let mut h = SimHost::new(2);
        h.add_device(1, false);
        let mut snap = crate::snapshot::CounterSnapshot::new();
        snap.refresh(&mut h).unwrap();
        h.add_softirq(1, 30, 5);
        let s = snap.refresh(&mut h).unwrap();
        assert_eq!(s.cpus[&1].softirq, 30);
        assert_eq!(s.cpus[&1].interrupts, 5);
        assert_eq!(s.cpus[&0].softirq, 0);
    }

    #[test]
    fn injected_affinity_failure_fires_once() {
        let mut h = SimHost::new(4);
        h.fail_affinity(900);
        h.fail_irq_affinity(40);
        assert!(h.set_cpu_affinity(900, &CpuMask::single(1)).is_err());
        assert_eq!(h.affinity_of(900), None);
        h.set_cpu_affinity(900, &CpuMask::single(1)).unwrap();
        assert!(h.set_irq_affinity(40, 2).is_err());
        h.set_irq_affinity(40, 2).unwrap();
        assert_eq!(h.irq_cpu(40), Some(2));
    }

    #[test]
    fn poll_needs_can_poll() {
        let mut h = SimHost::new(2);
        let d = h.add_device(1, false);
        let q = QueueId { dev: d.0, idx: 0 };
        assert!(h.write_attribute(&Element::Queue(q), host::POLL, 1).is_err());
        assert!(!h.is_polling(q));
    }

    #[test]
    fn hot_cpus_lose_idle() {
        let mut h = SimHost::new(2);
        h.add_device(1, false);
        h.advance(1000, 0.5, 0);
        let c0 = h.read_counters(&Element::Cpu(0)).unwrap();
        let c1 = h.read_counters(&Element::Cpu(1)).unwrap();
        assert_eq!(host::counter(&c0, host::IDLE), 50);
        assert_eq!(host::counter(&c1, host::IDLE), 100);
    }
}
