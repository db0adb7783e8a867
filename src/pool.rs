// IOCORE CPU POOL ALLOCATOR
// EVERY MANAGED CPU IS OWNED BY EXACTLY ONE POOL: THE VM POOL (GUEST VCPUS RUN
// THERE) OR THE WORKER POOL (ONE SHARED I/O WORKER PINNED PER CPU).
// ONLY THIS MODULE FLIPS OWNERSHIP. EACH POOL KEEPS ITS CPUS IN INSERTION
// ORDER AND DELEGATES "WHICH CPU LEAVES NEXT" TO A SELECTION STRATEGY.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::cpumask::CpuMask;
use crate::error::{Error, Result};

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum PoolKind {
    Vm,
    Worker,
}

impl fmt::Display for PoolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PoolKind::Vm => write!(f, "vm"),
            PoolKind::Worker => write!(f, "worker"),
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct Cpu {
    pub id: usize,
    pub socket: usize,
    pub owner: PoolKind,
}

// --- SELECTION STRATEGIES ---

// WHAT THE CONTROLLER LAST MEASURED PER CPU
#[derive(Clone, Debug, Default)]
pub struct PoolStats {
    // BUSY SHARE OVER THE LAST EPOCH
    pub usage: BTreeMap<usize, f64>,
    // DEVICES SERVED FROM EACH CPU. A WORKER SPANNING k CPUS COUNTS 1/k PER DEVICE.
    pub served: BTreeMap<usize, f64>,
}

// PICK `n` CPUS TO LEAVE `members` (POOL INSERTION ORDER). MUST BE A PURE
// FUNCTION OF ITS INPUTS SO ADD/REMOVE PAIRS REPLAY IDENTICALLY.
pub trait CpuSelectionStrategy {
    fn name(&self) -> &'static str;

    fn select(&self, members: &[usize], n: usize, stats: &PoolStats) -> Vec<usize>;
}

// STACK: LAST ADDED, FIRST REMOVED
pub struct LastAdded;

impl CpuSelectionStrategy for LastAdded {
    fn name(&self) -> &'static str {
        "last_added"
    }

    fn select(&self, members: &[usize], n: usize, _stats: &PoolStats) -> Vec<usize> {
        members.iter().rev().take(n).copied().collect()
    }
}

// FIXED RANK. THE CPU LATEST IN THE CONFIGURED ORDER LEAVES FIRST.
// UNRANKED CPUS RANK BELOW EVERY RANKED ONE, HIGHER ID FIRST.
pub struct Preconfigured {
    order: Vec<usize>,
}

impl Preconfigured {
    pub fn new(order: Vec<usize>) -> Self {
        Self { order }
    }

    fn rank(&self, cpu: usize) -> usize {
        self.order
            .iter()
            .position(|&c| c == cpu)
            .unwrap_or(self.order.len())
    }
}

impl CpuSelectionStrategy for Preconfigured {
    fn name(&self) -> &'static str {
        "preconfigured"
    }

    fn select(&self, members: &[usize], n: usize, _stats: &PoolStats) -> Vec<usize> {
        let mut ranked: Vec<usize> = members.to_vec();
        ranked.sort_by(|&a, &b| self.rank(b).cmp(&self.rank(a)).then(b.cmp(&a)));
        ranked.truncate(n);
        ranked
    }
}

fn lowest_first(members: &[usize], n: usize, score: &BTreeMap<usize, f64>) -> Vec<usize> {
    let mut ranked: Vec<usize> = members.to_vec();
    ranked.sort_by(|a, b| {
        let sa = score.get(a).copied().unwrap_or(0.0);
        let sb = score.get(b).copied().unwrap_or(0.0);
        sa.total_cmp(&sb).then(a.cmp(b))
    });
    ranked.truncate(n);
    ranked
}

// LEAST MEASURED USAGE LEAVES FIRST. TIES BY LOWER ID.
pub struct MinUsage;

impl CpuSelectionStrategy for MinUsage {
    fn name(&self) -> &'static str {
        "min_usage"
    }

    fn select(&self, members: &[usize], n: usize, stats: &PoolStats) -> Vec<usize> {
        lowest_first(members, n, &stats.usage)
    }
}

// WORKER POOL ONLY: THE CPU SERVING THE FEWEST DEVICES LEAVES FIRST, SO A
// REMOVAL MOVES AS FEW DEVICES AS POSSIBLE. TIES BY LOWER ID.
pub struct MinDevicesServed;

impl CpuSelectionStrategy for MinDevicesServed {
    fn name(&self) -> &'static str {
        "min_devices_served"
    }

    fn select(&self, members: &[usize], n: usize, stats: &PoolStats) -> Vec<usize> {
        lowest_first(members, n, &stats.served)
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionKind {
    #[default]
    LastAdded,
    Preconfigured,
    MinUsage,
    MinDevicesServed,
}

pub fn build_strategy(kind: SelectionKind, order: &[usize]) -> Box<dyn CpuSelectionStrategy> {
    match kind {
        SelectionKind::LastAdded => Box::new(LastAdded),
        SelectionKind::Preconfigured => Box::new(Preconfigured::new(order.to_vec())),
        SelectionKind::MinUsage => Box::new(MinUsage),
        SelectionKind::MinDevicesServed => Box::new(MinDevicesServed),
    }
}

// --- ALLOCATOR ---

pub struct CpuPoolAllocator {
    cpus: BTreeMap<usize, Cpu>,
    vm_pool: Vec<usize>,
    worker_pool: Vec<usize>,
    vm_strategy: Box<dyn CpuSelectionStrategy>,
    worker_strategy: Box<dyn CpuSelectionStrategy>,
    stats: PoolStats,
}

impl CpuPoolAllocator {
    pub fn new(
        cpus: Vec<Cpu>,
        vm_strategy: Box<dyn CpuSelectionStrategy>,
        worker_strategy: Box<dyn CpuSelectionStrategy>,
    ) -> Result<Self> {
        if cpus.is_empty() {
            return Err(Error::Config("no managed cpus".into()));
        }
        let mut map = BTreeMap::new();
        let mut vm_pool = Vec::new();
        let mut worker_pool = Vec::new();
        for cpu in cpus {
            if map.insert(cpu.id, cpu).is_some() {
                return Err(Error::Config(format!("cpu {} listed twice", cpu.id)));
            }
            match cpu.owner {
                PoolKind::Vm => vm_pool.push(cpu.id),
                PoolKind::Worker => worker_pool.push(cpu.id),
            }
        }
        Ok(Self {
            cpus: map,
            vm_pool,
            worker_pool,
            vm_strategy,
            worker_strategy,
            stats: PoolStats::default(),
        })
    }

    pub fn total(&self) -> usize {
        self.cpus.len()
    }

    pub fn vm_cpus(&self) -> &[usize] {
        &self.vm_pool
    }

    pub fn worker_cpus(&self) -> &[usize] {
        &self.worker_pool
    }

    pub fn vm_mask(&self) -> CpuMask {
        self.vm_pool.iter().copied().collect()
    }

    pub fn worker_mask(&self) -> CpuMask {
        self.worker_pool.iter().copied().collect()
    }

    pub fn owner(&self, cpu: usize) -> Option<PoolKind> {
        self.cpus.get(&cpu).map(|c| c.owner)
    }

    pub fn socket(&self, cpu: usize) -> Option<usize> {
        self.cpus.get(&cpu).map(|c| c.socket)
    }

    pub fn strategy_names(&self) -> (&'static str, &'static str) {
        (self.vm_strategy.name(), self.worker_strategy.name())
    }

    // PER-CPU BUSY SHARE FROM THE LAST EPOCH. FEEDS MinUsage.
    pub fn update_usage(&mut self, usage: BTreeMap<usize, f64>) {
        self.stats.usage = usage;
    }

    // FEEDS MinDevicesServed. REFRESHED BEFORE EVERY WORKER-POOL PICK.
    pub fn update_served(&mut self, served: BTreeMap<usize, f64>) {
        self.stats.served = served;
    }

    pub fn take_from_vm_pool(&mut self, n: usize) -> Result<Vec<usize>> {
        let picked = self.pick(PoolKind::Vm, n)?;
        for &cpu in &picked {
            self.transfer(cpu, PoolKind::Vm, PoolKind::Worker)?;
        }
        Ok(picked)
    }

    pub fn take_from_worker_pool(&mut self, n: usize) -> Result<Vec<usize>> {
        let picked = self.pick(PoolKind::Worker, n)?;
        for &cpu in &picked {
            self.transfer(cpu, PoolKind::Worker, PoolKind::Vm)?;
        }
        Ok(picked)
    }

    // CALLER GUARANTEES NO WORKER IS STILL PINNED TO `cpu`
    pub fn return_to_vm_pool(&mut self, cpu: usize) -> Result<()> {
        self.transfer(cpu, PoolKind::Worker, PoolKind::Vm)
    }

    pub fn return_to_worker_pool(&mut self, cpu: usize) -> Result<()> {
        self.transfer(cpu, PoolKind::Vm, PoolKind::Worker)
    }

    // PREVIEW OF take_from_worker_pool. NO MUTATION.
    pub fn select_from_worker_pool(&self, n: usize) -> Result<Vec<usize>> {
        self.pick(PoolKind::Worker, n)
    }

    fn pick(&self, pool: PoolKind, n: usize) -> Result<Vec<usize>> {
        let (members, strategy) = match pool {
            PoolKind::Vm => (&self.vm_pool, &self.vm_strategy),
            PoolKind::Worker => (&self.worker_pool, &self.worker_strategy),
        };
        if n > members.len() {
            return Err(Error::InsufficientCapacity {
                pool,
                requested: n,
                available: members.len(),
            });
        }
        let picked = strategy.select(members, n, &self.stats);
        if picked.len() != n || picked.iter().any(|c| !members.contains(c)) {
            return Err(Error::invariant(format!(
                "{} strategy picked {:?} from {} pool {:?}",
                strategy.name(),
                picked,
                pool,
                members
            )));
        }
        Ok(picked)
    }

    fn transfer(&mut self, cpu: usize, from: PoolKind, to: PoolKind) -> Result<()> {
        let entry = self
            .cpus
            .get_mut(&cpu)
            .ok_or_else(|| Error::invariant(format!("cpu {} is not managed", cpu)))?;
        if entry.owner != from {
            return Err(Error::invariant(format!(
                "cpu {} owned by {} pool, expected {}",
                cpu, entry.owner, from
            )));
        }
        let (src, dst) = match from {
            PoolKind::Vm => (&mut self.vm_pool, &mut self.worker_pool),
            PoolKind::Worker => (&mut self.worker_pool, &mut self.vm_pool),
        };
        let pos = src
            .iter()
            .position(|&c| c == cpu)
            .ok_or_else(|| Error::invariant(format!("cpu {} missing from {} pool", cpu, from)))?;
        src.remove(pos);
        dst.push(cpu);
        entry.owner = to;
        Ok(())
    }

    // DISJOINT POOLS, UNION IS THE MANAGED SET, OWNER TAGS AGREE WITH MEMBERSHIP
    pub fn check_ownership(&self) -> Result<()> {
        let vm = self.vm_mask();
        let worker = self.worker_mask();
        if !vm.intersection(&worker).is_empty() {
            return Err(Error::invariant(format!(
                "cpus {} owned by both pools",
                vm.intersection(&worker)
            )));
        }
        if self.vm_pool.len() + self.worker_pool.len() != self.cpus.len()
            || vm.weight() != self.vm_pool.len()
            || worker.weight() != self.worker_pool.len()
        {
            return Err(Error::invariant(format!(
                "pool sizes {}+{} do not cover {} managed cpus",
                self.vm_pool.len(),
                self.worker_pool.len(),
                self.cpus.len()
            )));
        }
        for cpu in self.cpus.values() {
            let member = match cpu.owner {
                PoolKind::Vm => vm.test(cpu.id),
                PoolKind::Worker => worker.test(cpu.id),
            };
            if !member {
                return Err(Error::invariant(format!(
                    "cpu {} tagged {} but not in that pool",
                    cpu.id, cpu.owner
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cpus(vm: &[usize], worker: &[usize]) -> Vec<Cpu> {
        let mut out: Vec<Cpu> = vm
            .iter()
            .map(|&id| Cpu { id, socket: 0, owner: PoolKind::Vm })
            .collect();
        out.extend(worker.iter().map(|&id| Cpu { id, socket: 0, owner: PoolKind::Worker }));
        out
    }

    fn stack_alloc(vm: &[usize], worker: &[usize]) -> CpuPoolAllocator {
        CpuPoolAllocator::new(cpus(vm, worker), Box::new(LastAdded), Box::new(LastAdded)).unwrap()
    }

    #[test]
    fn take_marks_worker_owned() {
        let mut a = stack_alloc(&[0, 1, 2, 3], &[]);
        let got = a.take_from_vm_pool(2).unwrap();
        assert_eq!(got, vec![3, 2]);
        assert_eq!(a.owner(3), Some(PoolKind::Worker));
        assert_eq!(a.vm_cpus(), &[0, 1]);
        assert_eq!(a.worker_cpus(), &[3, 2]);
        a.check_ownership().unwrap();
    }

    #[test]
    fn take_then_return_restores_order() {
        let mut a = stack_alloc(&[0, 1, 2, 3], &[6, 7]);
        let before_vm = a.vm_cpus().to_vec();
        let before_w = a.worker_cpus().to_vec();
        let got = a.take_from_vm_pool(1).unwrap();
        a.return_to_vm_pool(got[0]).unwrap();
        assert_eq!(a.vm_cpus(), before_vm.as_slice());
        assert_eq!(a.worker_cpus(), before_w.as_slice());
    }

    #[test]
    fn insufficient_capacity_does_not_mutate() {
        let mut a = stack_alloc(&[0, 1], &[5]);
        let err = a.take_from_vm_pool(3).unwrap_err();
        assert!(matches!(
            err,
            Error::InsufficientCapacity { pool: PoolKind::Vm, requested: 3, available: 2 }
        ));
        assert_eq!(a.vm_cpus(), &[0, 1]);
        assert!(a.take_from_worker_pool(2).is_err());
        assert_eq!(a.worker_cpus(), &[5]);
    }

    #[test]
    fn return_of_foreign_cpu_is_invariant_violation() {
        let mut a = stack_alloc(&[0, 1], &[5]);
        assert!(a.return_to_vm_pool(0).unwrap_err().is_invariant_violation());
        assert!(a.return_to_vm_pool(42).unwrap_err().is_invariant_violation());
    }

    #[test]
    fn select_preview_matches_take() {
        let mut a = stack_alloc(&[0], &[4, 5, 6]);
        let preview = a.select_from_worker_pool(1).unwrap();
        assert_eq!(a.worker_cpus(), &[4, 5, 6]);
        let taken = a.take_from_worker_pool(1).unwrap();
        assert_eq!(preview, taken);
    }

    #[test]
    fn preconfigured_takes_lowest_ranked() {
        let s = Preconfigured::new(vec![3, 1, 2]);
        let stats = PoolStats::default();
        assert_eq!(s.select(&[1, 2, 3], 1, &stats), vec![2]);
        // UNRANKED CPU GOES BEFORE ANY RANKED ONE
        assert_eq!(s.select(&[1, 2, 3, 9], 2, &stats), vec![9, 2]);
    }

    #[test]
    fn min_usage_breaks_ties_by_id() {
        let s = MinUsage;
        let mut stats = PoolStats::default();
        stats.usage.insert(1, 0.5);
        stats.usage.insert(2, 0.1);
        stats.usage.insert(3, 0.1);
        assert_eq!(s.select(&[1, 3, 2], 2, &stats), vec![2, 3]);
    }

    #[test]
    fn min_devices_served_picks_lightest_worker_cpu() {
        let mut a = CpuPoolAllocator::new(
            cpus(&[0, 1], &[5, 6, 7]),
            Box::new(LastAdded),
            Box::new(MinDevicesServed),
        )
        .unwrap();
        let mut served = BTreeMap::new();
        served.insert(5, 3.0);
        served.insert(6, 1.0);
        served.insert(7, 2.0);
        a.update_served(served);
        assert_eq!(a.select_from_worker_pool(1).unwrap(), vec![6]);

        // A CPU WITH NO ENTRY SERVES NOTHING AND GOES FIRST
        a.update_served([(5, 3.0), (7, 2.0)].into_iter().collect());
        assert_eq!(a.take_from_worker_pool(1).unwrap(), vec![6]);
        assert_eq!(a.strategy_names(), ("last_added", "min_devices_served"));
    }

    #[test]
    fn duplicate_cpu_rejected() {
        let mut list = cpus(&[0, 1], &[]);
        list.push(Cpu { id: 1, socket: 0, owner: PoolKind::Worker });
        assert!(CpuPoolAllocator::new(list, Box::new(LastAdded), Box::new(LastAdded)).is_err());
    }
}
