// IOCORE VM PLACEMENT
// GUEST VCPUS FOLLOW THE VM POOL. EVERY TIME THE POOL GROWS OR SHRINKS THE
// PLACEMENT POLICY RECOMPUTES EACH VM'S MASK AND PUSHES IT TO ITS THREADS.

use std::collections::{BTreeMap, BTreeSet};

use log::{debug, warn};

use crate::cpumask::CpuMask;
use crate::error::{Error, Result};
use crate::host::{DeviceId, HostInterface};
use crate::tuning::{VmConfig, VmLayout, VmPlacementConfig};

#[derive(Clone, Debug)]
pub struct Vm {
    pub id: u32,
    pub pid: i32,
    // EMPTY: AFFINITY GOES TO THE PID (EVERY TASK OF THE PROCESS)
    pub threads: Vec<i32>,
    pub affinity: CpuMask,
    pub devices: Vec<DeviceId>,
}

impl Vm {
    pub fn from_config(cfg: &VmConfig) -> Self {
        Self {
            id: cfg.id,
            pid: cfg.pid,
            threads: cfg.threads.clone(),
            affinity: CpuMask::new(),
            devices: cfg.devices.iter().map(|&d| DeviceId(d)).collect(),
        }
    }

    fn set_affinity<H: HostInterface + ?Sized>(&mut self, host: &mut H, mask: CpuMask) -> Result<()> {
        if mask == self.affinity {
            return Ok(());
        }
        let tids = if self.threads.is_empty() { vec![self.pid] } else { self.threads.clone() };
        for (i, &tid) in tids.iter().enumerate() {
            if let Err(e) = host.set_cpu_affinity(tid, &mask) {
                // THREADS ALREADY MOVED GO BACK TO THE TRACKED MASK
                if !self.affinity.is_empty() {
                    for &done in &tids[..i] {
                        if let Err(re) = host.set_cpu_affinity(done, &self.affinity) {
                            warn!("vm {} tid {}: restore {} failed: {}", self.id, done, self.affinity, re);
                        }
                    }
                }
                return Err(e);
            }
        }
        debug!("VM {}: AFFINITY {} -> {}", self.id, self.affinity, mask);
        self.affinity = mask;
        Ok(())
    }
}

pub enum VmPlacement {
    // EVERY VCPU MAY RUN ON ANY VM CPU
    RunEverywhere,
    // PER POOL SIZE: VM -> CONFIGURED CPU LABELS
    Preconfigured { layouts: BTreeMap<usize, BTreeMap<u32, Vec<usize>>> },
}

impl VmPlacement {
    pub fn from_config(cfg: &VmPlacementConfig) -> Self {
        match cfg {
            VmPlacementConfig::RunEverywhere => VmPlacement::RunEverywhere,
            VmPlacementConfig::Preconfigured { layouts } => VmPlacement::Preconfigured {
                layouts: layouts
                    .iter()
                    .map(|l: &VmLayout| (l.cores, l.vms.clone()))
                    .collect(),
            },
        }
    }

    // vm_cpus IN POOL ORDER
    pub fn masks(&self, vms: &[Vm], vm_cpus: &[usize]) -> Result<BTreeMap<u32, CpuMask>> {
        match self {
            VmPlacement::RunEverywhere => {
                let all: CpuMask = vm_cpus.iter().copied().collect();
                Ok(vms.iter().map(|vm| (vm.id, all)).collect())
            }
            VmPlacement::Preconfigured { layouts } => {
                let layout = layouts.get(&vm_cpus.len()).ok_or_else(|| {
                    Error::Config(format!("no vm layout for {} cores", vm_cpus.len()))
                })?;
                let labels: BTreeSet<usize> = layout.values().flatten().copied().collect();
                let mapping: BTreeMap<usize, usize> =
                    labels.into_iter().zip(vm_cpus.iter().copied()).collect();

                let mut out = BTreeMap::new();
                for vm in vms {
                    let configured = layout.get(&vm.id).ok_or_else(|| {
                        Error::Config(format!("vm {} missing from {}-core layout", vm.id, vm_cpus.len()))
                    })?;
                    let mut mask = CpuMask::new();
                    for label in configured {
                        let cpu = mapping.get(label).ok_or_else(|| {
                            Error::Config(format!(
                                "{}-core layout uses more labels than cores",
                                vm_cpus.len()
                            ))
                        })?;
                        mask.set(*cpu);
                    }
                    out.insert(vm.id, mask);
                }
                Ok(out)
            }
        }
    }
}

pub struct VmSet {
    vms: Vec<Vm>,
    placement: VmPlacement,
}

impl VmSet {
    pub fn new(vms: Vec<Vm>, placement: VmPlacement) -> Self {
        Self { vms, placement }
    }

    pub fn vms(&self) -> &[Vm] {
        &self.vms
    }

    pub fn owner_of(&self, dev: DeviceId) -> Option<u32> {
        self.vms.iter().find(|vm| vm.devices.contains(&dev)).map(|vm| vm.id)
    }

    // UNION OF EVERY VM'S CURRENT AFFINITY
    pub fn affinity_union(&self) -> CpuMask {
        self.vms
            .iter()
            .fold(CpuMask::new(), |acc, vm| acc.union(&vm.affinity))
    }

    pub fn place<H: HostInterface + ?Sized>(&mut self, host: &mut H, vm_cpus: &[usize]) -> Result<()> {
        if vm_cpus.is_empty() {
            return Err(Error::invariant("vm pool is empty"));
        }
        let masks = self.placement.masks(&self.vms, vm_cpus)?;
        for vm in &mut self.vms {
            if let Some(&mask) = masks.get(&vm.id) {
                vm.set_affinity(host, mask)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimHost;

    fn vm(id: u32, pid: i32) -> Vm {
        Vm { id, pid, threads: vec![], affinity: CpuMask::new(), devices: vec![DeviceId(id)] }
    }

    #[test]
    fn run_everywhere_follows_pool() {
        let mut host = SimHost::new(8);
        let mut set = VmSet::new(vec![vm(1, 1001), vm(2, 1002)], VmPlacement::RunEverywhere);
        set.place(&mut host, &[0, 1, 2]).unwrap();
        assert_eq!(host.affinity_of(1001), Some(CpuMask::from_cpus([0, 1, 2])));
        set.place(&mut host, &[0, 1]).unwrap();
        assert_eq!(host.affinity_of(1002), Some(CpuMask::from_cpus([0, 1])));
        assert_eq!(set.affinity_union(), CpuMask::from_cpus([0, 1]));
    }

    #[test]
    fn preconfigured_maps_labels_by_position() {
        let mut two = BTreeMap::new();
        two.insert(1, vec![10]);
        two.insert(2, vec![11]);
        let mut layouts = BTreeMap::new();
        layouts.insert(2, two);
        let placement = VmPlacement::Preconfigured { layouts };

        let masks = placement.masks(&[vm(1, 1), vm(2, 2)], &[4, 5]).unwrap();
        assert_eq!(masks[&1], CpuMask::single(4));
        assert_eq!(masks[&2], CpuMask::single(5));
        assert!(matches!(placement.masks(&[vm(1, 1)], &[4, 5, 6]), Err(Error::Config(_))));
    }

    #[test]
    fn failed_thread_write_restores_the_others() {
        let mut host = SimHost::new(4);
        let mut v = vm(1, 500);
        v.threads = vec![501, 502];
        let mut set = VmSet::new(vec![v], VmPlacement::RunEverywhere);
        set.place(&mut host, &[0, 1, 2]).unwrap();

        host.fail_affinity(502);
        assert!(set.place(&mut host, &[0, 1]).is_err());
        assert_eq!(host.affinity_of(501), Some(CpuMask::from_cpus([0, 1, 2])));
        assert_eq!(set.affinity_union(), CpuMask::from_cpus([0, 1, 2]));
    }

    #[test]
    fn threads_get_affinity_instead_of_pid() {
        let mut host = SimHost::new(4);
        let mut v = vm(1, 500);
        v.threads = vec![501, 502];
        let mut set = VmSet::new(vec![v], VmPlacement::RunEverywhere);
        set.place(&mut host, &[1, 2]).unwrap();
        assert_eq!(host.affinity_of(501), Some(CpuMask::from_cpus([1, 2])));
        assert_eq!(host.affinity_of(500), None);
        assert_eq!(set.owner_of(DeviceId(1)), Some(1));
    }
}
