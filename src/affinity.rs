// IOCORE BACKING-DEVICE AFFINITY
// A NIC'S IRQS (OR A SOFTWARE BACKEND'S THREADS) SHOULD RUN WHERE THE
// WORKERS SERVING ITS DEVICES RUN. THE MASK IS DERIVED FROM THOSE WORKERS'
// CPUS AND NEVER SET BY HAND, EXCEPT CLEARED TO ZERO ON MODE CHANGES.
//
// PHYSICAL: EACH IRQ TAKES ONE CPU. IRQS ROUND-ROBIN OVER THE MASK.
// SOFTWARE: EVERY THREAD GETS THE WHOLE MASK.

use std::collections::{BTreeMap, BTreeSet};

use log::{debug, warn};

use crate::cpumask::CpuMask;
use crate::error::{Error, Result};
use crate::host::{DeviceId, HostInterface};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BackingKind {
    Physical { irqs: Vec<u32> },
    Software { threads: Vec<i32> },
}

#[derive(Clone, Debug)]
pub struct BackingDevice {
    pub id: String,
    pub kind: BackingKind,
    pub members: BTreeSet<DeviceId>,
    mask: CpuMask,
    next_cpu: usize,
    applied_from: usize,
}

impl BackingDevice {
    pub fn new(id: impl Into<String>, kind: BackingKind, members: impl IntoIterator<Item = DeviceId>) -> Self {
        Self {
            id: id.into(),
            kind,
            members: members.into_iter().collect(),
            mask: CpuMask::new(),
            next_cpu: 0,
            applied_from: 0,
        }
    }

    pub fn mask(&self) -> CpuMask {
        self.mask
    }

    // NEXT CPU OF THE MASK AFTER THE LAST ONE HANDED OUT, WRAPPING
    pub fn next_rotation(&mut self) -> Option<usize> {
        rotate(&self.mask, &mut self.next_cpu)
    }

    // PUSH `mask` TO THE HOST. THE TRACKED MASK AND THE IRQ CURSOR MOVE ONLY
    // ONCE EVERY WRITE WENT THROUGH. AN EMPTY MASK IS TRACKED, NEVER WRITTEN.
    fn apply<H: HostInterface + ?Sized>(&mut self, host: &mut H, mask: CpuMask) -> Result<()> {
        if mask.is_empty() {
            self.mask = mask;
            return Ok(());
        }
        let start = self.next_cpu;
        let mut cursor = start;
        match &self.kind {
            BackingKind::Physical { irqs } => {
                for &irq in irqs {
                    if let Some(cpu) = rotate(&mask, &mut cursor) {
                        host.set_irq_affinity(irq, cpu)?;
                    }
                }
            }
            BackingKind::Software { threads } => {
                for &tid in threads {
                    host.set_cpu_affinity(tid, &mask)?;
                }
            }
        }
        self.mask = mask;
        self.next_cpu = cursor;
        self.applied_from = start;
        debug!("BACKING {}: AFFINITY {}", self.id, self.mask);
        Ok(())
    }
}

fn rotate(mask: &CpuMask, cursor: &mut usize) -> Option<usize> {
    let cpus = mask.to_vec();
    let pick = cpus
        .iter()
        .copied()
        .find(|&c| c >= *cursor)
        .or_else(|| cpus.first().copied())?;
    *cursor = pick + 1;
    Some(pick)
}

#[derive(Clone)]
pub struct AffinitySynchronizer {
    backing: Vec<BackingDevice>,
    by_device: BTreeMap<DeviceId, usize>,
}

impl AffinitySynchronizer {
    pub fn new(backing: Vec<BackingDevice>) -> Result<Self> {
        let mut by_device = BTreeMap::new();
        for (i, bd) in backing.iter().enumerate() {
            for &d in &bd.members {
                if let Some(prev) = by_device.insert(d, i) {
                    return Err(Error::Config(format!(
                        "{} routed through both {} and {}",
                        d, backing[prev].id, bd.id
                    )));
                }
            }
        }
        Ok(Self { backing, by_device })
    }

    pub fn backing_of(&self, dev: DeviceId) -> Option<&str> {
        self.by_device.get(&dev).map(|&i| self.backing[i].id.as_str())
    }

    pub fn get(&self, id: &str) -> Option<&BackingDevice> {
        self.backing.iter().find(|b| b.id == id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &BackingDevice> {
        self.backing.iter()
    }

    pub fn on_device_added<H: HostInterface + ?Sized>(
        &mut self,
        host: &mut H,
        dev: DeviceId,
        serving: &CpuMask,
    ) -> Result<()> {
        let Some(&i) = self.by_device.get(&dev) else {
            return Ok(());
        };
        let bd = &mut self.backing[i];
        let mask = bd.mask.union(serving);
        bd.apply(host, mask)
    }

    // `serving(d)` IS THE CPU SET OF THE WORKER SERVING d AFTER THE MOVE.
    // `new` IS ADDED UNCONDITIONALLY; A CPU OF `old` IS DROPPED ONLY IF NO
    // OTHER MEMBER DEVICE IS STILL SERVED THERE.
    pub fn on_device_moved<H, F>(
        &mut self,
        host: &mut H,
        dev: DeviceId,
        old: &CpuMask,
        new: &CpuMask,
        serving: F,
    ) -> Result<()>
    where
        H: HostInterface + ?Sized,
        F: Fn(DeviceId) -> CpuMask,
    {
        let Some(&i) = self.by_device.get(&dev) else {
            return Ok(());
        };
        let bd = &mut self.backing[i];
        let mut mask = bd.mask.union(new);
        for cpu in old.iter() {
            if new.test(cpu) {
                continue;
            }
            let still_used = bd
                .members
                .iter()
                .filter(|&&m| m != dev)
                .any(|&m| serving(m).test(cpu));
            if !still_used {
                mask.clear(cpu);
            }
        }
        bd.apply(host, mask)
    }

    // CLEAR TRACKED MASKS. THE KERNEL STATE IS LEFT ALONE UNTIL THE NEXT
    // RECONCILE: AN EMPTY AFFINITY CANNOT BE WRITTEN.
    pub fn zero_affinity(&mut self) {
        for bd in &mut self.backing {
            bd.mask = CpuMask::new();
            bd.next_cpu = 0;
            bd.applied_from = 0;
        }
    }

    // REBUILD EVERY MASK FROM SCRATCH AND PUSH IT
    pub fn reconcile<H, F>(&mut self, host: &mut H, serving: F) -> Result<()>
    where
        H: HostInterface + ?Sized,
        F: Fn(DeviceId) -> CpuMask,
    {
        for bd in &mut self.backing {
            let mask = bd
                .members
                .iter()
                .fold(CpuMask::new(), |acc, &m| acc.union(&serving(m)));
            bd.apply(host, mask)?;
        }
        Ok(())
    }

    // AFTER A FAILED MOVE: WRITE EVERY TRACKED MASK BACK SO THE KERNEL MATCHES
    // WHAT IS TRACKED AGAIN. FAILURES ARE LOGGED, NOT RETURNED.
    pub fn push_tracked<H: HostInterface + ?Sized>(&mut self, host: &mut H) {
        for bd in &mut self.backing {
            let mask = bd.mask;
            // SAME IRQ -> CPU SPREAD AS THE LAST GOOD WRITE
            bd.next_cpu = bd.applied_from;
            if let Err(e) = bd.apply(host, mask) {
                warn!("backing {}: restoring affinity {} failed: {}", bd.id, mask, e);
            }
        }
    }

    pub fn check_subset<F: Fn(DeviceId) -> CpuMask>(&self, serving: F) -> Result<()> {
        for bd in &self.backing {
            let union = bd
                .members
                .iter()
                .fold(CpuMask::new(), |acc, &m| acc.union(&serving(m)));
            if !bd.mask.is_subset(&union) {
                return Err(Error::invariant(format!(
                    "backing {} affinity {} outside serving cpus {}",
                    bd.id, bd.mask, union
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimHost;

    fn bd1() -> AffinitySynchronizer {
        let bd = BackingDevice::new(
            "bd.1",
            BackingKind::Physical { irqs: vec![40, 41] },
            [DeviceId(1), DeviceId(2)],
        );
        AffinitySynchronizer::new(vec![bd]).unwrap()
    }

    #[test]
    fn moved_device_drops_unused_cpu() {
        let mut host = SimHost::new(8);
        let mut sync = bd1();
        let mut serving: BTreeMap<DeviceId, CpuMask> = BTreeMap::new();
        serving.insert(DeviceId(1), CpuMask::single(2));
        serving.insert(DeviceId(2), CpuMask::single(3));
        sync.reconcile(&mut host, |d| serving[&d]).unwrap();
        assert_eq!(sync.get("bd.1").unwrap().mask(), CpuMask::from_cpus([2, 3]));

        serving.insert(DeviceId(1), CpuMask::single(4));
        sync.on_device_moved(&mut host, DeviceId(1), &CpuMask::single(2), &CpuMask::single(4), |d| serving[&d])
            .unwrap();
        assert_eq!(sync.get("bd.1").unwrap().mask(), CpuMask::from_cpus([3, 4]));
        sync.check_subset(|d| serving[&d]).unwrap();
    }

    #[test]
    fn moved_device_keeps_cpu_still_in_use() {
        let mut host = SimHost::new(8);
        let bd = BackingDevice::new(
            "bd.1",
            BackingKind::Software { threads: vec![77] },
            [DeviceId(1), DeviceId(2), DeviceId(3)],
        );
        let mut sync = AffinitySynchronizer::new(vec![bd]).unwrap();
        let mut serving: BTreeMap<DeviceId, CpuMask> = BTreeMap::new();
        serving.insert(DeviceId(1), CpuMask::single(2));
        serving.insert(DeviceId(2), CpuMask::single(3));
        serving.insert(DeviceId(3), CpuMask::single(2));
        sync.reconcile(&mut host, |d| serving[&d]).unwrap();

        serving.insert(DeviceId(1), CpuMask::single(4));
        sync.on_device_moved(&mut host, DeviceId(1), &CpuMask::single(2), &CpuMask::single(4), |d| serving[&d])
            .unwrap();
        assert_eq!(sync.get("bd.1").unwrap().mask(), CpuMask::from_cpus([2, 3, 4]));
        assert_eq!(host.affinity_of(77), Some(CpuMask::from_cpus([2, 3, 4])));
    }

    #[test]
    fn irqs_rotate_over_mask() {
        let mut host = SimHost::new(8);
        let mut sync = bd1();
        sync.on_device_added(&mut host, DeviceId(1), &CpuMask::from_cpus([5, 6])).unwrap();
        assert_eq!(host.irq_cpu(40), Some(5));
        assert_eq!(host.irq_cpu(41), Some(6));
    }

    #[test]
    fn failed_write_keeps_tracked_mask() {
        let mut host = SimHost::new(8);
        let mut sync = bd1();
        let mut serving: BTreeMap<DeviceId, CpuMask> = BTreeMap::new();
        serving.insert(DeviceId(1), CpuMask::single(2));
        serving.insert(DeviceId(2), CpuMask::single(3));
        sync.reconcile(&mut host, |d| serving[&d]).unwrap();
        assert_eq!((host.irq_cpu(40), host.irq_cpu(41)), (Some(2), Some(3)));

        serving.insert(DeviceId(1), CpuMask::single(4));
        host.fail_irq_affinity(41);
        assert!(sync
            .on_device_moved(&mut host, DeviceId(1), &CpuMask::single(2), &CpuMask::single(4), |d| serving[&d])
            .is_err());
        assert_eq!(sync.get("bd.1").unwrap().mask(), CpuMask::from_cpus([2, 3]));
        // IRQ 40 WAS ALREADY REWRITTEN BEFORE 41 FAILED
        assert_eq!(host.irq_cpu(40), Some(4));

        sync.push_tracked(&mut host);
        assert_eq!((host.irq_cpu(40), host.irq_cpu(41)), (Some(2), Some(3)));
    }

    #[test]
    fn rotation_wraps() {
        let mut bd = BackingDevice::new("x", BackingKind::Physical { irqs: vec![] }, []);
        bd.mask = CpuMask::from_cpus([1, 3]);
        assert_eq!(bd.next_rotation(), Some(1));
        assert_eq!(bd.next_rotation(), Some(3));
        assert_eq!(bd.next_rotation(), Some(1));
    }

    #[test]
    fn zero_then_empty_mask_is_not_written() {
        let mut host = SimHost::new(4);
        let mut sync = bd1();
        sync.zero_affinity();
        assert!(sync.get("bd.1").unwrap().mask().is_empty());
        sync.reconcile(&mut host, |_| CpuMask::new()).unwrap();
        assert_eq!(host.irq_cpu(40), None);
    }

    #[test]
    fn device_in_two_backings_rejected() {
        let a = BackingDevice::new("a", BackingKind::Software { threads: vec![] }, [DeviceId(1)]);
        let b = BackingDevice::new("b", BackingKind::Software { threads: vec![] }, [DeviceId(1)]);
        assert!(AffinitySynchronizer::new(vec![a, b]).is_err());
    }

    #[test]
    fn unrouted_device_is_ignored() {
        let mut host = SimHost::new(4);
        let mut sync = bd1();
        sync.on_device_added(&mut host, DeviceId(9), &CpuMask::single(1)).unwrap();
        assert!(sync.get("bd.1").unwrap().mask().is_empty());
        assert_eq!(sync.backing_of(DeviceId(2)), Some("bd.1"));
    }
}
