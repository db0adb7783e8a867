// IOCORE HOST INTERFACE
// THE ONLY SEAM BETWEEN THE CONTROLLER AND LIVE HARDWARE/KERNEL STATE.
// sysfs.rs IMPLEMENTS IT OVER /sys/class/vhost AND /proc, sim.rs OVER A
// DETERMINISTIC IN-MEMORY MODEL FOR TESTS AND DRY RUNS.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::cpumask::CpuMask;
use crate::error::{Error, Result};

// --- ELEMENT IDS ---

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct WorkerId(pub u32);

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct DeviceId(pub u32);

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct QueueId {
    pub dev: u32,
    pub idx: u32,
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "w.{}", self.0)
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "d.{}", self.0)
    }
}

impl fmt::Display for QueueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "vq.{}.{}", self.dev, self.idx)
    }
}

fn parse_prefixed(s: &str, prefix: &str) -> Result<u32> {
    s.trim()
        .strip_prefix(prefix)
        .and_then(|n| n.parse().ok())
        .ok_or_else(|| Error::host(format!("malformed element id '{}'", s)))
}

impl FromStr for WorkerId {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self> {
        parse_prefixed(s, "w.").map(WorkerId)
    }
}

impl FromStr for DeviceId {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self> {
        parse_prefixed(s, "d.").map(DeviceId)
    }
}

impl FromStr for QueueId {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self> {
        let rest = s
            .trim()
            .strip_prefix("vq.")
            .ok_or_else(|| Error::host(format!("malformed queue id '{}'", s)))?;
        let (dev, idx) = rest
            .split_once('.')
            .ok_or_else(|| Error::host(format!("malformed queue id '{}'", s)))?;
        let bad = || Error::host(format!("malformed queue id '{}'", s));
        Ok(QueueId {
            dev: dev.parse().map_err(|_| bad())?,
            idx: idx.parse().map_err(|_| bad())?,
        })
    }
}

// --- ELEMENTS AND COUNTERS ---

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub enum Element {
    Global,
    Worker(WorkerId),
    Device(DeviceId),
    Queue(QueueId),
    Process(i32),
    Cpu(usize),
}

impl fmt::Display for Element {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Element::Global => write!(f, "vhost"),
            Element::Worker(w) => write!(f, "{}", w),
            Element::Device(d) => write!(f, "{}", d),
            Element::Queue(q) => write!(f, "{}", q),
            Element::Process(pid) => write!(f, "pid {}", pid),
            Element::Cpu(cpu) => write!(f, "cpu{}", cpu),
        }
    }
}

pub type RawCounters = BTreeMap<String, u64>;

// COUNTER NAMES. MATCH THE vhost SYSFS FILE NAMES.
pub const CYCLES: &str = "cycles";
pub const PID: &str = "pid";
pub const CPU: &str = "cpu";
pub const WORK_CYCLES: &str = "total_work_cycles";
pub const KSOFTIRQS: &str = "ksoftirqs";
pub const LOOPS: &str = "loops";
pub const EMPTY_POLLS: &str = "empty_polls";
pub const EMPTY_WORKS: &str = "empty_works";
pub const WORKER: &str = "worker";
pub const HANDLED_BYTES: &str = "handled_bytes";
pub const HANDLED_PACKETS: &str = "handled_packets";
pub const POLL: &str = "poll";
pub const CAN_POLL: &str = "can_poll";
pub const TICKS: &str = "ticks";
pub const IDLE: &str = "idle";
pub const SOFTIRQ: &str = "softirq";
pub const INTERRUPTS: &str = "interrupts";

pub fn counter(c: &RawCounters, name: &str) -> u64 {
    c.get(name).copied().unwrap_or(0)
}

// WHAT EXISTS ON THE HOST RIGHT NOW. REBUILT ON EVERY RESCAN.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Inventory {
    pub workers: Vec<WorkerId>,
    pub devices: Vec<DeviceId>,
    pub queues: Vec<QueueId>,
    pub nr_cpus: usize,
}

impl Inventory {
    pub fn queues_of(&self, dev: DeviceId) -> Vec<QueueId> {
        self.queues.iter().copied().filter(|q| q.dev == dev.0).collect()
    }
}

pub trait HostInterface {
    fn inventory(&mut self) -> Result<Inventory>;

    fn read_counters(&mut self, element: &Element) -> Result<RawCounters>;

    fn write_attribute(&mut self, element: &Element, name: &str, value: u64) -> Result<()>;

    fn create_worker(&mut self, cpu: usize) -> Result<WorkerId>;

    // FAILS WHILE DEVICES ARE STILL ATTACHED TO THE WORKER
    fn destroy_worker(&mut self, id: WorkerId) -> Result<()>;

    fn set_cpu_affinity(&mut self, pid: i32, mask: &CpuMask) -> Result<()>;

    fn get_cpu_affinity(&mut self, pid: i32) -> Result<CpuMask>;

    // IRQS TAKE ONE CPU AT A TIME
    fn set_irq_affinity(&mut self, irq: u32, cpu: usize) -> Result<()>;
}

pub fn worker_pid<H: HostInterface + ?Sized>(host: &mut H, id: WorkerId) -> Result<i32> {
    let c = host.read_counters(&Element::Worker(id))?;
    match c.get(PID) {
        Some(&pid) if pid > 0 => Ok(pid as i32),
        _ => Err(Error::host(format!("{} has no pid", id))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn element_ids_round_trip_through_sysfs_names() {
        assert_eq!("w.3".parse::<WorkerId>().unwrap(), WorkerId(3));
        assert_eq!("d.12".parse::<DeviceId>().unwrap(), DeviceId(12));
        assert_eq!(
            "vq.2.1".parse::<QueueId>().unwrap(),
            QueueId { dev: 2, idx: 1 }
        );
        assert_eq!(QueueId { dev: 2, idx: 1 }.to_string(), "vq.2.1");
    }

    #[test]
    fn malformed_ids_are_host_errors() {
        assert!("worker".parse::<WorkerId>().is_err());
        assert!("vq.2".parse::<QueueId>().is_err());
        assert!("d.x".parse::<DeviceId>().is_err());
    }

    #[test]
    fn missing_counter_reads_zero() {
        let mut c = RawCounters::new();
        c.insert(CYCLES.to_string(), 7);
        assert_eq!(counter(&c, CYCLES), 7);
        assert_eq!(counter(&c, LOOPS), 0);
    }
}
