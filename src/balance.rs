// IOCORE DEVICE BALANCER
// COMPUTES device -> worker CHANGE-SETS FOR A TARGET WORKER SET. NEVER
// TOUCHES THE HOST: model.rs APPLIES THE CHANGE-SET.
//
// THREE STRATEGIES:
//   STATIC TABLE: AUTHORED PER WORKER COUNT, SLOTS MAPPED ONTO LIVE WORKERS
//   GROUPING:     DEVICES SHARING A BACKING DEVICE STAY TOGETHER WHEN THEY
//                 FIT, SO ONE NIC's IRQS LAND ON AS FEW CPUS AS POSSIBLE
//   DEVICE COUNT: THE SAME NUMBER OF DEVICES ON EVERY WORKER, MOVING ONLY
//                 WHAT IS ABOVE THE CAP

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use crate::classifier::Classification;
use crate::error::{Error, Result};
use crate::host::{DeviceId, WorkerId};
use crate::tuning::{BalancerConfig, StaticLayout};

#[derive(Clone, Debug, PartialEq)]
pub struct DeviceInfo {
    pub id: DeviceId,
    pub worker: WorkerId,
    pub backing: Option<String>,
    pub class: Classification,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WorkerSlot {
    pub id: WorkerId,
    pub cpu: usize,
}

// --- CHANGE-SET ---

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Change {
    pub from: WorkerId,
    pub to: WorkerId,
}

// ONE ENTRY PER DEVICE. NO-OP MOVES ARE NEVER STORED.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ChangeSet {
    entries: BTreeMap<DeviceId, Change>,
}

impl ChangeSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, dev: DeviceId, from: WorkerId, to: WorkerId) -> Result<()> {
        if from == to {
            return Ok(());
        }
        match self.entries.get(&dev) {
            Some(c) if c.to != to || c.from != from => Err(Error::invariant(format!(
                "{} planned twice: {}->{} and {}->{}",
                dev, c.from, c.to, from, to
            ))),
            _ => {
                self.entries.insert(dev, Change { from, to });
                Ok(())
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn get(&self, dev: DeviceId) -> Option<Change> {
        self.entries.get(&dev).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (DeviceId, Change)> + '_ {
        self.entries.iter().map(|(&d, &c)| (d, c))
    }

    pub fn inverse(&self) -> ChangeSet {
        ChangeSet {
            entries: self
                .entries
                .iter()
                .map(|(&d, c)| (d, Change { from: c.to, to: c.from }))
                .collect(),
        }
    }

    // A DESTROYED WORKER COMES BACK UNDER A NEW ID
    pub fn remap_worker(&self, old: WorkerId, new: WorkerId) -> ChangeSet {
        let swap = |w: WorkerId| if w == old { new } else { w };
        ChangeSet {
            entries: self
                .entries
                .iter()
                .map(|(&d, c)| (d, Change { from: swap(c.from), to: swap(c.to) }))
                .collect(),
        }
    }
}

impl fmt::Display for ChangeSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.entries.is_empty() {
            return write!(f, "-");
        }
        let parts: Vec<String> = self
            .entries
            .iter()
            .map(|(d, c)| format!("{}:{}->{}", d, c.from, c.to))
            .collect();
        write!(f, "{}", parts.join(" "))
    }
}

// --- STRATEGY ---

pub trait DeviceBalanceStrategy {
    fn name(&self) -> &'static str;

    // `workers` IS EXACTLY THE SET EXPECTED TO EXIST AFTER THE MOVE
    fn plan_for_worker_count(&self, devices: &[DeviceInfo], workers: &[WorkerSlot])
        -> Result<ChangeSet>;

    fn plan_after_addition(
        &self,
        devices: &[DeviceInfo],
        workers: &[WorkerSlot],
        added: &[WorkerSlot],
    ) -> Result<ChangeSet> {
        let mut target = workers.to_vec();
        for a in added {
            if !target.iter().any(|w| w.id == a.id) {
                target.push(*a);
            }
        }
        self.plan_for_worker_count(devices, &target)
    }

    fn plan_before_removal(
        &self,
        devices: &[DeviceInfo],
        workers: &[WorkerSlot],
        removed: WorkerId,
    ) -> Result<ChangeSet> {
        let target: Vec<WorkerSlot> = workers.iter().filter(|w| w.id != removed).copied().collect();
        if target.len() == workers.len() {
            return Err(Error::invariant(format!("{} is not a current worker", removed)));
        }
        self.plan_for_worker_count(devices, &target)
    }

    fn plan(&self, devices: &[DeviceInfo], workers: &[WorkerSlot]) -> Result<ChangeSet> {
        self.plan_for_worker_count(devices, workers)
    }
}

pub fn build_balancer(cfg: &BalancerConfig) -> Box<dyn DeviceBalanceStrategy> {
    match cfg {
        BalancerConfig::Grouping => Box::new(GroupingBalancer),
        BalancerConfig::DeviceCount => Box::new(DeviceCountBalancer),
        BalancerConfig::StaticTable { layouts } => Box::new(StaticTableBalancer::new(layouts)),
    }
}

fn no_workers() -> Error {
    Error::invariant("balance requested for an empty worker set")
}

fn change_set_for(
    devices: &[DeviceInfo],
    workers: &[WorkerSlot],
    assign: &BTreeMap<DeviceId, WorkerId>,
) -> Result<ChangeSet> {
    let target: BTreeSet<WorkerId> = workers.iter().map(|w| w.id).collect();
    let mut cs = ChangeSet::new();
    for d in devices {
        let to = assign
            .get(&d.id)
            .copied()
            .ok_or_else(|| Error::invariant(format!("{} left unplaced", d.id)))?;
        if !target.contains(&to) {
            return Err(Error::invariant(format!("{} planned onto foreign {}", d.id, to)));
        }
        cs.insert(d.id, d.worker, to)?;
    }
    Ok(cs)
}

fn ceil_div(a: usize, b: usize) -> usize {
    a.div_ceil(b.max(1))
}

// --- STATIC TABLE ---

/// Slot `i` goes to the worker pinned on `slot_cpus[i]` when one exists.
/// Workers on no table CPU then fill the empty slots in the order given.
/// CPU matches always win over position.
pub struct StaticTableBalancer {
    layouts: BTreeMap<usize, StaticLayout>,
}

impl StaticTableBalancer {
    pub fn new(layouts: &[StaticLayout]) -> Self {
        Self {
            layouts: layouts.iter().map(|l| (l.workers, l.clone())).collect(),
        }
    }

    // WORKERS ON A TABLE CPU TAKE THAT SLOT, THE REST FILL THE GAPS IN ORDER
    fn slot_workers(layout: &StaticLayout, workers: &[WorkerSlot]) -> Vec<WorkerId> {
        let mut slots: Vec<Option<WorkerId>> = vec![None; layout.slot_cpus.len()];
        let mut unplaced = Vec::new();
        for w in workers {
            match layout.slot_cpus.iter().position(|&c| c == w.cpu) {
                Some(i) if slots[i].is_none() => slots[i] = Some(w.id),
                _ => unplaced.push(w.id),
            }
        }
        let mut rest = unplaced.into_iter();
        slots
            .into_iter()
            .filter_map(|s| s.or_else(|| rest.next()))
            .collect()
    }
}

impl DeviceBalanceStrategy for StaticTableBalancer {
    fn name(&self) -> &'static str {
        "static_table"
    }

    fn plan_for_worker_count(&self, devices: &[DeviceInfo], workers: &[WorkerSlot]) -> Result<ChangeSet> {
        if workers.is_empty() {
            return Err(no_workers());
        }
        let layout = self.layouts.get(&workers.len()).ok_or_else(|| {
            Error::Config(format!("no static layout for {} workers", workers.len()))
        })?;
        let slots = Self::slot_workers(layout, workers);
        if slots.len() != workers.len() {
            return Err(Error::invariant(format!(
                "static layout mapped {} of {} workers",
                slots.len(),
                workers.len()
            )));
        }

        let mut cs = ChangeSet::new();
        for d in devices {
            let to = match layout.devices.get(&d.id.0) {
                Some(&slot) => slots[slot],
                None if slots.contains(&d.worker) => d.worker,
                None => slots[d.id.0 as usize % slots.len()],
            };
            cs.insert(d.id, d.worker, to)?;
        }
        Ok(cs)
    }
}

// --- GROUPING ---

pub struct GroupingBalancer;

#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Debug)]
enum GroupKey {
    Backing(String),
    Solo(DeviceId),
}

fn group_devices<'a>(devices: &[&'a DeviceInfo]) -> Vec<Vec<&'a DeviceInfo>> {
    let mut groups: BTreeMap<GroupKey, Vec<&'a DeviceInfo>> = BTreeMap::new();
    for &d in devices {
        let key = match &d.backing {
            Some(b) => GroupKey::Backing(b.clone()),
            None => GroupKey::Solo(d.id),
        };
        groups.entry(key).or_default().push(d);
    }
    groups
        .into_values()
        .map(|mut g| {
            g.sort_by_key(|d| d.id);
            g
        })
        .collect()
}

// total SPLIT OVER workers: THE FIRST total % workers GET ONE EXTRA
fn capacities(total: usize, workers: usize) -> Vec<usize> {
    let base = total / workers;
    let rem = total % workers;
    (0..workers).map(|i| if i < rem { base + 1 } else { base }).collect()
}

impl GroupingBalancer {
    // EXTRA CAPACITY GOES TO THE WORKERS ALREADY HOLDING THE MOST, SO A
    // BALANCED ASSIGNMENT REPLANS TO ITSELF. RETURNS (WORKER, CAPACITY)
    // IN VISIT ORDER: MOST VACANT FIRST.
    fn visit_order(workers: &[WorkerSlot], held: &BTreeMap<WorkerId, usize>, total: usize) -> Vec<(WorkerId, usize)> {
        let mut by_load: Vec<WorkerId> = workers.iter().map(|w| w.id).collect();
        by_load.sort_by(|a, b| held[b].cmp(&held[a]).then(a.cmp(b)));
        let caps = capacities(total, workers.len());
        let mut order: Vec<(WorkerId, usize)> = by_load.into_iter().zip(caps).collect();
        order.sort_by(|(a, ca), (b, cb)| {
            let va = *ca as i64 - held[a] as i64;
            let vb = *cb as i64 - held[b] as i64;
            vb.cmp(&va).then(a.cmp(b))
        });
        order
    }

    fn place_active(
        devices: &[&DeviceInfo],
        workers: &[WorkerSlot],
        assign: &mut BTreeMap<DeviceId, WorkerId>,
    ) {
        let mut held: BTreeMap<WorkerId, usize> = workers.iter().map(|w| (w.id, 0)).collect();
        for d in devices {
            if let Some(n) = held.get_mut(&d.worker) {
                *n += 1;
            }
        }
        let order = Self::visit_order(workers, &held, devices.len());
        let mut groups = group_devices(devices);

        for (w, cap) in order {
            let on_w = |g: &Vec<&DeviceInfo>| g.iter().filter(|d| d.worker == w).count();
            let mut left = cap;
            while left > 0 && !groups.is_empty() {
                // (a) A WHOLE GROUP THAT FILLS THE WORKER EXACTLY
                let exact = groups
                    .iter()
                    .enumerate()
                    .filter(|(_, g)| g.len() == left)
                    .max_by(|(ia, a), (ib, b)| on_w(a).cmp(&on_w(b)).then(ib.cmp(ia)))
                    .map(|(i, _)| i);
                if let Some(i) = exact {
                    for d in groups.remove(i) {
                        assign.insert(d.id, w);
                    }
                    left = 0;
                    continue;
                }

                // (b) SLICE THE SMALLEST LARGER GROUP, DEVICES ALREADY HERE FIRST
                let larger = groups
                    .iter()
                    .enumerate()
                    .filter(|(_, g)| g.len() > left)
                    .min_by_key(|(i, g)| (g.len(), *i))
                    .map(|(i, _)| i);
                if let Some(i) = larger {
                    let mut g = groups.remove(i);
                    g.sort_by_key(|d| (d.worker != w, d.id));
                    let rest = g.split_off(left);
                    for d in g {
                        assign.insert(d.id, w);
                    }
                    groups.insert(i, rest);
                    left = 0;
                    continue;
                }

                // (c) LARGEST REMAINING GROUP, WHOLE
                let largest = groups
                    .iter()
                    .enumerate()
                    .max_by(|(ia, a), (ib, b)| a.len().cmp(&b.len()).then(ib.cmp(ia)))
                    .map(|(i, _)| i);
                if let Some(i) = largest {
                    let g = groups.remove(i);
                    left = left.saturating_sub(g.len());
                    for d in g {
                        assign.insert(d.id, w);
                    }
                }
            }
        }

        // CAPACITIES SUM TO THE DEVICE COUNT, SO THIS ONLY CATCHES ROUNDING
        let mut load: BTreeMap<WorkerId, usize> = workers.iter().map(|w| (w.id, 0)).collect();
        for w in assign.values() {
            if let Some(n) = load.get_mut(w) {
                *n += 1;
            }
        }
        for g in groups {
            for d in g {
                let least = load
                    .iter()
                    .min_by(|(a, la), (b, lb)| la.cmp(lb).then(a.cmp(b)))
                    .map(|(&w, _)| w);
                if let Some(w) = least {
                    assign.insert(d.id, w);
                    if let Some(n) = load.get_mut(&w) {
                        *n += 1;
                    }
                }
            }
        }
    }

    // INACTIVE DEVICES: REMAINDER-AWARE ROUNDS. LIGHTLY LOADED WORKERS GET THE
    // EXTRA SLOT. A DEVICE STAYS PUT WHILE ITS WORKER HAS ROOM.
    fn place_inactive(
        devices: &[&DeviceInfo],
        workers: &[WorkerSlot],
        assign: &mut BTreeMap<DeviceId, WorkerId>,
    ) {
        let mut active_load: BTreeMap<WorkerId, usize> = workers.iter().map(|w| (w.id, 0)).collect();
        for w in assign.values() {
            if let Some(n) = active_load.get_mut(w) {
                *n += 1;
            }
        }
        let mut order: Vec<WorkerId> = workers.iter().map(|w| w.id).collect();
        order.sort_by(|a, b| active_load[a].cmp(&active_load[b]).then(a.cmp(b)));

        let caps = capacities(devices.len(), workers.len());
        let mut room: BTreeMap<WorkerId, usize> = order.iter().copied().zip(caps).collect();

        let mut pending = Vec::new();
        for d in devices {
            match room.get_mut(&d.worker) {
                Some(r) if *r > 0 => {
                    *r -= 1;
                    assign.insert(d.id, d.worker);
                }
                _ => pending.push(*d),
            }
        }
        for d in pending {
            let mut best = order[0];
            for &w in &order {
                if room[&w] > room[&best] {
                    best = w;
                }
            }
            if let Some(r) = room.get_mut(&best) {
                *r = r.saturating_sub(1);
            }
            assign.insert(d.id, best);
        }
    }
}

impl DeviceBalanceStrategy for GroupingBalancer {
    fn name(&self) -> &'static str {
        "grouping"
    }

    fn plan_for_worker_count(&self, devices: &[DeviceInfo], workers: &[WorkerSlot]) -> Result<ChangeSet> {
        if workers.is_empty() {
            return Err(no_workers());
        }
        let mut sorted: Vec<&DeviceInfo> = devices.iter().collect();
        sorted.sort_by_key(|d| d.id);
        let (active, inactive): (Vec<&DeviceInfo>, Vec<&DeviceInfo>) = sorted
            .into_iter()
            .partition(|d| d.class != Classification::LowUsage);

        let mut assign: BTreeMap<DeviceId, WorkerId> = BTreeMap::new();
        Self::place_active(&active, workers, &mut assign);
        Self::place_inactive(&inactive, workers, &mut assign);
        change_set_for(devices, workers, &assign)
    }
}

// --- DEVICE COUNT ---

// CLASS AND BACKING ARE IGNORED. CAP = ceil(devices / workers).
pub struct DeviceCountBalancer;

impl DeviceCountBalancer {
    fn held(devices: &[DeviceInfo], workers: &[WorkerSlot]) -> BTreeMap<WorkerId, Vec<DeviceId>> {
        let mut held: BTreeMap<WorkerId, Vec<DeviceId>> = workers.iter().map(|w| (w.id, Vec::new())).collect();
        let mut sorted: Vec<&DeviceInfo> = devices.iter().collect();
        sorted.sort_by_key(|d| d.id);
        for d in sorted {
            if let Some(v) = held.get_mut(&d.worker) {
                v.push(d.id);
            }
        }
        held
    }

    fn all_on(devices: &[DeviceInfo], workers: &[WorkerSlot]) -> bool {
        devices.iter().all(|d| workers.iter().any(|w| w.id == d.worker))
    }
}

impl DeviceBalanceStrategy for DeviceCountBalancer {
    fn name(&self) -> &'static str {
        "device_count"
    }

    // A DEVICE STAYS WHILE ITS WORKER IS UNDER THE CAP. THE REST GO TO THE
    // LEAST LOADED WORKER. AN ASSIGNMENT WITHIN THE CAP REPLANS TO ITSELF.
    fn plan_for_worker_count(&self, devices: &[DeviceInfo], workers: &[WorkerSlot]) -> Result<ChangeSet> {
        if workers.is_empty() {
            return Err(no_workers());
        }
        let cap = ceil_div(devices.len(), workers.len());
        let mut sorted: Vec<&DeviceInfo> = devices.iter().collect();
        sorted.sort_by_key(|d| d.id);

        let mut load: BTreeMap<WorkerId, usize> = workers.iter().map(|w| (w.id, 0)).collect();
        let mut assign: BTreeMap<DeviceId, WorkerId> = BTreeMap::new();
        let mut pending = Vec::new();
        for d in sorted {
            match load.get_mut(&d.worker) {
                Some(n) if *n < cap => {
                    *n += 1;
                    assign.insert(d.id, d.worker);
                }
                _ => pending.push(d),
            }
        }
        for d in pending {
            let least = load
                .iter_mut()
                .min_by(|(a, la), (b, lb)| la.cmp(lb).then(a.cmp(b)))
                .ok_or_else(no_workers)?;
            *least.1 += 1;
            assign.insert(d.id, *least.0);
        }
        change_set_for(devices, workers, &assign)
    }

    // EVERY WORKER ABOVE THE CAP SHEDS ITS SURPLUS ONTO THE NEW WORKERS,
    // MOST LOADED FIRST. DEVICES ALREADY UNDER THE CAP NEVER MOVE.
    fn plan_after_addition(
        &self,
        devices: &[DeviceInfo],
        workers: &[WorkerSlot],
        added: &[WorkerSlot],
    ) -> Result<ChangeSet> {
        let mut target = workers.to_vec();
        for a in added {
            if !target.iter().any(|w| w.id == a.id) {
                target.push(*a);
            }
        }
        if added.is_empty() || !Self::all_on(devices, &target) {
            return self.plan_for_worker_count(devices, &target);
        }
        let held = Self::held(devices, &target);
        let cap = ceil_div(devices.len(), target.len());

        let fresh: BTreeSet<WorkerId> = added.iter().map(|a| a.id).collect();
        let mut room: Vec<(WorkerId, usize)> = added
            .iter()
            .map(|a| (a.id, cap.saturating_sub(held.get(&a.id).map_or(0, Vec::len))))
            .collect();

        let mut donors: Vec<(&WorkerId, &Vec<DeviceId>)> =
            held.iter().filter(|(w, _)| !fresh.contains(*w)).collect();
        donors.sort_by(|(a, da), (b, db)| db.len().cmp(&da.len()).then(a.cmp(b)));

        let mut cs = ChangeSet::new();
        for (&from, devs) in donors {
            for &dev in devs.iter().skip(cap) {
                let slot = room
                    .iter_mut()
                    .max_by(|(a, ra), (b, rb)| ra.cmp(rb).then(b.cmp(a)))
                    .ok_or_else(no_workers)?;
                slot.1 = slot.1.saturating_sub(1);
                cs.insert(dev, from, slot.0)?;
            }
        }
        Ok(cs)
    }

    // THE REMOVED WORKER'S DEVICES TOP UP THE SURVIVORS TO THE CAP, IN ORDER
    fn plan_before_removal(
        &self,
        devices: &[DeviceInfo],
        workers: &[WorkerSlot],
        removed: WorkerId,
    ) -> Result<ChangeSet> {
        let rest: Vec<WorkerSlot> = workers.iter().filter(|w| w.id != removed).copied().collect();
        if rest.len() == workers.len() {
            return Err(Error::invariant(format!("{} is not a current worker", removed)));
        }
        if rest.is_empty() {
            return Err(no_workers());
        }
        if !Self::all_on(devices, workers) {
            return self.plan_for_worker_count(devices, &rest);
        }
        let held = Self::held(devices, workers);
        let cap = ceil_div(devices.len(), rest.len());
        let mut orphans = held.get(&removed).cloned().unwrap_or_default().into_iter();

        let mut cs = ChangeSet::new();
        for w in &rest {
            let have = held.get(&w.id).map_or(0, Vec::len);
            for dev in orphans.by_ref().take(cap.saturating_sub(have)) {
                cs.insert(dev, removed, w.id)?;
            }
        }
        // rest.len() * cap >= devices, SO EVERY ORPHAN FOUND A SEAT
        if let Some(dev) = orphans.next() {
            return Err(Error::invariant(format!("{} left on removed {}", dev, removed)));
        }
        Ok(cs)
    }
}
