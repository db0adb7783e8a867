// IOCORE LIVE MODEL
// THE CONTROLLER'S VIEW OF THE HOST: DEVICES, WORKERS, CPU POOLS, BACKING
// DEVICES AND VMS. EVERY STRUCTURAL WRITE GOES THROUGH HERE SO THE VIEW AND
// THE HOST NEVER DIVERGE BY MORE THAN ONE FAILED CALL.
//
// DEDICATED: ONE WORKER PER DEVICE, ALL PINNED TO THE VM POOL. WORKER POOL EMPTY.
// SHARED:    ONE WORKER PER WORKER-POOL CPU, EACH PINNED TO ITS CPU.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use log::{debug, warn};

use crate::affinity::{AffinitySynchronizer, BackingDevice, BackingKind};
use crate::balance::{ChangeSet, DeviceInfo, WorkerSlot};
use crate::classifier::{Classification, TrafficClassifier};
use crate::cpumask::CpuMask;
use crate::error::{Error, Result};
use crate::host::{self, counter, worker_pid, DeviceId, Element, HostInterface, QueueId, WorkerId};
use crate::pool::{build_strategy, Cpu, CpuPoolAllocator};
use crate::tuning::{BackingKindConfig, Config};
use crate::vm::{Vm, VmPlacement, VmSet};

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Mode {
    Dedicated,
    Shared,
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mode::Dedicated => write!(f, "DEDICATED"),
            Mode::Shared => write!(f, "SHARED"),
        }
    }
}

#[derive(Clone, Debug)]
pub struct Device {
    pub id: DeviceId,
    pub vm: Option<u32>,
    pub backing: Option<String>,
    pub worker: WorkerId,
    pub queues: Vec<QueueId>,
    pub class: Classification,
}

#[derive(Clone, Debug)]
pub struct IoWorker {
    pub id: WorkerId,
    pub pid: i32,
    pub cpus: CpuMask,
    pub devices: BTreeSet<DeviceId>,
}

pub struct Model {
    pub devices: BTreeMap<DeviceId, Device>,
    pub workers: BTreeMap<WorkerId, IoWorker>,
    pub mode: Mode,
    pub pool: CpuPoolAllocator,
    pub affinity: AffinitySynchronizer,
    pub vms: VmSet,
    pollable: BTreeSet<QueueId>,
    polling_enabled: bool,
    polling: bool,
}

fn serving_of(
    devices: &BTreeMap<DeviceId, Device>,
    workers: &BTreeMap<WorkerId, IoWorker>,
    dev: DeviceId,
) -> CpuMask {
    devices
        .get(&dev)
        .and_then(|d| workers.get(&d.worker))
        .map(|w| w.cpus)
        .unwrap_or_default()
}

// PUT BACK `(device, previous worker)` WRITES, NEWEST FIRST
fn unwind_device_writes<H: HostInterface + ?Sized>(host: &mut H, written: &[(DeviceId, WorkerId)]) {
    for &(d, from) in written.iter().rev() {
        if let Err(e) = host.write_attribute(&Element::Device(d), host::WORKER, from.0 as u64) {
            warn!("{}: rollback to {} failed: {}", d, from, e);
        }
    }
}

impl Model {
    // READ WHAT THE HOST HAS RIGHT NOW. EVERY EXISTING WORKER IS TREATED AS
    // DEDICATED; THE ENGINE'S STARTUP DECIDES WHERE THINGS GO FROM HERE.
    pub fn discover<H: HostInterface + ?Sized>(host: &mut H, cfg: &Config, cpus: Vec<Cpu>) -> Result<Model> {
        let inventory = host.inventory()?;

        let mut workers = BTreeMap::new();
        for &id in &inventory.workers {
            let pid = worker_pid(host, id)?;
            let cpus = host.get_cpu_affinity(pid)?;
            workers.insert(id, IoWorker { id, pid, cpus, devices: BTreeSet::new() });
        }

        let backing: Vec<BackingDevice> = cfg
            .backing_devices
            .iter()
            .map(|b| {
                let kind = match &b.kind {
                    BackingKindConfig::Physical { irqs, .. } => BackingKind::Physical { irqs: irqs.clone() },
                    BackingKindConfig::Software { threads } => BackingKind::Software { threads: threads.clone() },
                };
                BackingDevice::new(b.id.clone(), kind, b.devices.iter().map(|&d| DeviceId(d)))
            })
            .collect();
        let affinity = AffinitySynchronizer::new(backing)?;

        let vms = VmSet::new(
            cfg.vms.iter().map(Vm::from_config).collect(),
            VmPlacement::from_config(&cfg.vm_placement),
        );

        let mut devices = BTreeMap::new();
        let mut pollable = BTreeSet::new();
        for &id in &inventory.devices {
            let raw = host.read_counters(&Element::Device(id))?;
            let worker = WorkerId(counter(&raw, host::WORKER) as u32);
            let w = workers
                .get_mut(&worker)
                .ok_or_else(|| Error::invariant(format!("{} served by unknown {}", id, worker)))?;
            w.devices.insert(id);

            let queues = inventory.queues_of(id);
            for &q in &queues {
                let qraw = host.read_counters(&Element::Queue(q))?;
                if counter(&qraw, host::CAN_POLL) != 0 {
                    pollable.insert(q);
                }
            }
            devices.insert(
                id,
                Device {
                    id,
                    vm: vms.owner_of(id),
                    backing: affinity.backing_of(id).map(str::to_string),
                    worker,
                    queues,
                    class: Classification::LowUsage,
                },
            );
        }

        let pool = CpuPoolAllocator::new(
            cpus,
            build_strategy(cfg.cpu_selection, &cfg.cpu_order),
            build_strategy(cfg.worker_selection(), &cfg.cpu_order),
        )?;

        Ok(Model {
            devices,
            workers,
            mode: Mode::Dedicated,
            pool,
            affinity,
            vms,
            pollable,
            polling_enabled: cfg.polling,
            polling: false,
        })
    }

    // --- VIEWS ---

    // N: SHARED WORKER COUNT, 0 IN DEDICATED MODE
    pub fn shared_count(&self) -> usize {
        match self.mode {
            Mode::Dedicated => 0,
            Mode::Shared => self.workers.len(),
        }
    }

    pub fn serving_mask(&self, dev: DeviceId) -> CpuMask {
        serving_of(&self.devices, &self.workers, dev)
    }

    pub fn worker_on(&self, cpu: usize) -> Option<WorkerId> {
        self.workers
            .values()
            .find(|w| w.cpus == CpuMask::single(cpu))
            .map(|w| w.id)
    }

    pub fn worker_slots(&self) -> Vec<WorkerSlot> {
        self.workers
            .values()
            .map(|w| WorkerSlot { id: w.id, cpu: w.cpus.first().unwrap_or(0) })
            .collect()
    }

    pub fn device_infos(&self) -> Vec<DeviceInfo> {
        self.devices
            .values()
            .map(|d| DeviceInfo {
                id: d.id,
                worker: d.worker,
                backing: d.backing.clone(),
                class: d.class,
            })
            .collect()
    }

    // DEVICES SERVED PER CPU, A WORKER ON k CPUS CONTRIBUTING 1/k PER DEVICE
    pub fn served_per_cpu(&self) -> BTreeMap<usize, f64> {
        let mut served = BTreeMap::new();
        for d in self.devices.values() {
            let mask = self.serving_mask(d.id);
            let share = 1.0 / mask.weight().max(1) as f64;
            for cpu in mask.iter() {
                *served.entry(cpu).or_insert(0.0) += share;
            }
        }
        served
    }

    pub fn assignment(&self) -> BTreeMap<DeviceId, WorkerId> {
        self.devices.values().map(|d| (d.id, d.worker)).collect()
    }

    pub fn polling(&self) -> bool {
        self.polling
    }

    pub fn update_classes(&mut self, classifier: &dyn TrafficClassifier) {
        for d in self.devices.values_mut() {
            d.class = classifier.classification(d.id);
        }
    }

    // --- STRUCTURAL WRITES ---

    // ALL OR NOTHING. VALIDATE EVERYTHING, WRITE EVERYTHING, SWAP IN THE NEW
    // MAPS, THEN FOLLOW WITH THE BACKING AFFINITY. A FAILURE AT ANY STEP PUTS
    // THE DEVICE WRITES, THE MAPS AND THE BACKING MASKS BACK AS THEY WERE.
    pub fn apply_change_set<H: HostInterface + ?Sized>(&mut self, host: &mut H, cs: &ChangeSet) -> Result<()> {
        if cs.is_empty() {
            return Ok(());
        }
        for (dev, ch) in cs.iter() {
            let d = self
                .devices
                .get(&dev)
                .ok_or_else(|| Error::invariant(format!("change-set names unknown {}", dev)))?;
            if d.worker != ch.from {
                return Err(Error::invariant(format!(
                    "{} is on {}, change-set expects {}",
                    dev, d.worker, ch.from
                )));
            }
            if !self.workers.contains_key(&ch.to) {
                return Err(Error::invariant(format!("{} target {} does not exist", dev, ch.to)));
            }
        }

        let mut written: Vec<(DeviceId, WorkerId)> = Vec::new();
        for (dev, ch) in cs.iter() {
            if let Err(e) = host.write_attribute(&Element::Device(dev), host::WORKER, ch.to.0 as u64) {
                unwind_device_writes(host, &written);
                return Err(e);
            }
            written.push((dev, ch.from));
        }

        let mut devices = self.devices.clone();
        let mut workers = self.workers.clone();
        for (dev, ch) in cs.iter() {
            if let Some(d) = devices.get_mut(&dev) {
                d.worker = ch.to;
            }
            if let Some(w) = workers.get_mut(&ch.from) {
                w.devices.remove(&dev);
            }
            if let Some(w) = workers.get_mut(&ch.to) {
                w.devices.insert(dev);
            }
        }
        let moved: Vec<(DeviceId, CpuMask, CpuMask)> = cs
            .iter()
            .map(|(dev, ch)| {
                let old = self.workers.get(&ch.from).map(|w| w.cpus).unwrap_or_default();
                let new = workers.get(&ch.to).map(|w| w.cpus).unwrap_or_default();
                (dev, old, new)
            })
            .collect();
        let saved_devices = std::mem::replace(&mut self.devices, devices);
        let saved_workers = std::mem::replace(&mut self.workers, workers);
        let saved_affinity = self.affinity.clone();

        let mut failed = None;
        {
            let devices = &self.devices;
            let workers = &self.workers;
            for (dev, old, new) in moved {
                if let Err(e) = self
                    .affinity
                    .on_device_moved(host, dev, &old, &new, |m| serving_of(devices, workers, m))
                {
                    failed = Some(e);
                    break;
                }
            }
        }
        if let Some(e) = failed {
            warn!("BACKING AFFINITY FAILED, UNWINDING {}: {}", cs, e);
            self.devices = saved_devices;
            self.workers = saved_workers;
            unwind_device_writes(host, &written);
            self.affinity = saved_affinity;
            self.affinity.push_tracked(host);
            return Err(e);
        }
        debug!("APPLIED {}", cs);
        Ok(())
    }

    pub fn create_worker<H: HostInterface + ?Sized>(&mut self, host: &mut H, mask: CpuMask) -> Result<WorkerId> {
        let cpu = mask
            .first()
            .ok_or_else(|| Error::invariant("worker requested on an empty cpu mask"))?;
        let id = host.create_worker(cpu)?;
        let pinned = worker_pid(host, id).and_then(|pid| {
            if mask.weight() > 1 {
                host.set_cpu_affinity(pid, &mask)?;
            }
            Ok(pid)
        });
        let pid = match pinned {
            Ok(pid) => pid,
            Err(e) => {
                if let Err(de) = host.destroy_worker(id) {
                    warn!("{}: cleanup after failed create: {}", id, de);
                }
                return Err(e);
            }
        };
        self.workers.insert(id, IoWorker { id, pid, cpus: mask, devices: BTreeSet::new() });
        debug!("CREATED {} PID {} ON {}", id, pid, mask);
        Ok(id)
    }

    pub fn destroy_worker<H: HostInterface + ?Sized>(&mut self, host: &mut H, id: WorkerId) -> Result<()> {
        let w = self
            .workers
            .get(&id)
            .ok_or_else(|| Error::invariant(format!("destroy of unknown {}", id)))?;
        if !w.devices.is_empty() {
            return Err(Error::invariant(format!(
                "{} still serves {} devices",
                id,
                w.devices.len()
            )));
        }
        host.destroy_worker(id)?;
        self.workers.remove(&id);
        debug!("DESTROYED {}", id);
        Ok(())
    }

    pub fn retarget_worker<H: HostInterface + ?Sized>(
        &mut self,
        host: &mut H,
        id: WorkerId,
        mask: CpuMask,
    ) -> Result<()> {
        let w = self
            .workers
            .get_mut(&id)
            .ok_or_else(|| Error::invariant(format!("retarget of unknown {}", id)))?;
        if w.cpus != mask {
            host.set_cpu_affinity(w.pid, &mask)?;
            w.cpus = mask;
        }
        Ok(())
    }

    // NO-OP WHEN POLLING IS DISABLED IN THE CONFIGURATION
    pub fn set_polling<H: HostInterface + ?Sized>(&mut self, host: &mut H, on: bool) -> Result<()> {
        if !self.polling_enabled {
            return Ok(());
        }
        for &q in &self.pollable {
            host.write_attribute(&Element::Queue(q), host::POLL, on as u64)?;
        }
        self.polling = on;
        Ok(())
    }

    pub fn place_vms<H: HostInterface + ?Sized>(&mut self, host: &mut H) -> Result<()> {
        if self.vms.vms().is_empty() {
            return Ok(());
        }
        let vm_cpus = self.pool.vm_cpus().to_vec();
        self.vms.place(host, &vm_cpus)
    }

    // ZERO EVERY BACKING MASK, THEN REBUILD FROM THE CURRENT ASSIGNMENT
    pub fn reset_affinity<H: HostInterface + ?Sized>(&mut self, host: &mut H) -> Result<()> {
        self.affinity.zero_affinity();
        let devices = &self.devices;
        let workers = &self.workers;
        self.affinity.reconcile(host, |m| serving_of(devices, workers, m))
    }

    // --- INVARIANTS ---

    pub fn check_invariants(&self) -> Result<()> {
        self.pool.check_ownership()?;

        for d in self.devices.values() {
            let w = self
                .workers
                .get(&d.worker)
                .ok_or_else(|| Error::invariant(format!("{} has no worker ({} is gone)", d.id, d.worker)))?;
            if !w.devices.contains(&d.id) {
                return Err(Error::invariant(format!("{} missing from {} membership", d.id, w.id)));
            }
        }
        for w in self.workers.values() {
            for dev in &w.devices {
                match self.devices.get(dev) {
                    Some(d) if d.worker == w.id => {}
                    _ => {
                        return Err(Error::invariant(format!("{} lists {} it does not serve", w.id, dev)));
                    }
                }
            }
        }

        let worker_mask = self.pool.worker_mask();
        match self.mode {
            Mode::Dedicated => {
                if !worker_mask.is_empty() {
                    return Err(Error::invariant(format!(
                        "dedicated mode with worker pool {}",
                        worker_mask
                    )));
                }
            }
            Mode::Shared => {
                if self.workers.len() != self.pool.worker_cpus().len() {
                    return Err(Error::invariant(format!(
                        "{} shared workers for {} worker cpus",
                        self.workers.len(),
                        self.pool.worker_cpus().len()
                    )));
                }
                for w in self.workers.values() {
                    if w.cpus.weight() != 1 || !w.cpus.is_subset(&worker_mask) {
                        return Err(Error::invariant(format!(
                            "shared {} pinned to {} outside worker pool {}",
                            w.id, w.cpus, worker_mask
                        )));
                    }
                }
                let vm_union = self.vms.affinity_union();
                if !vm_union.intersection(&worker_mask).is_empty() {
                    return Err(Error::invariant(format!(
                        "vm affinity {} reaches worker cpus {}",
                        vm_union, worker_mask
                    )));
                }
            }
        }

        self.affinity
            .check_subset(|m| serving_of(&self.devices, &self.workers, m))
    }
}
