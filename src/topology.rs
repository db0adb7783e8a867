// IOCORE HOST TOPOLOGY
// CPU -> SOCKET PAIRS FROM /proc/cpuinfo. THE ALLOCATOR IS BUILT FROM THIS
// LIST ONCE AT STARTUP; CPUS NEVER APPEAR OR DISAPPEAR AFTERWARDS.

use regex::Regex;

use crate::cpumask::CpuMask;
use crate::error::{Error, Result};
use crate::pool::{Cpu, PoolKind};

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct CpuTopo {
    pub id: usize,
    pub socket: usize,
}

// EACH "processor" LINE OPENS A NEW RECORD. A RECORD WITHOUT "physical id"
// (SOME VMS, SOME ARM BOARDS) LANDS ON SOCKET 0.
pub fn parse_cpuinfo(text: &str) -> Result<Vec<CpuTopo>> {
    let line_re = Regex::new(r"^(processor|physical id)\s*:\s*(\d+)\s*$")
        .map_err(|e| Error::Config(e.to_string()))?;

    let mut out: Vec<CpuTopo> = Vec::new();
    for line in text.lines() {
        let caps = match line_re.captures(line.trim_end()) {
            Some(c) => c,
            None => continue,
        };
        let value: usize = caps[2]
            .parse()
            .map_err(|_| Error::host(format!("bad cpuinfo line '{}'", line)))?;
        match &caps[1] {
            "processor" => out.push(CpuTopo { id: value, socket: 0 }),
            _ => {
                if let Some(last) = out.last_mut() {
                    last.socket = value;
                }
            }
        }
    }
    Ok(out)
}

pub fn read_topology() -> Result<Vec<CpuTopo>> {
    let text = std::fs::read_to_string("/proc/cpuinfo")?;
    parse_cpuinfo(&text)
}

// BUILD THE ALLOCATOR'S CPU LIST. `managed` EMPTY MEANS EVERY HOST CPU.
// CPUS IN `io_cores` START IN THE WORKER POOL, THE REST IN THE VM POOL.
pub fn managed_cpus(topo: &[CpuTopo], managed: &[usize], io_cores: &[usize]) -> Result<Vec<Cpu>> {
    let managed_mask: CpuMask = if managed.is_empty() {
        topo.iter().map(|t| t.id).collect()
    } else {
        managed.iter().copied().collect()
    };
    let io_mask: CpuMask = io_cores.iter().copied().collect();

    if !io_mask.is_subset(&managed_mask) {
        return Err(Error::Config(format!(
            "io cores {} outside managed cpus {}",
            io_mask, managed_mask
        )));
    }

    let mut out = Vec::new();
    for cpu in managed_mask.iter() {
        let socket = topo
            .iter()
            .find(|t| t.id == cpu)
            .map(|t| t.socket)
            .ok_or_else(|| Error::Config(format!("cpu {} not present on this host", cpu)))?;
        let owner = if io_mask.test(cpu) {
            PoolKind::Worker
        } else {
            PoolKind::Vm
        };
        out.push(Cpu { id: cpu, socket, owner });
    }
    Ok(out)
}

// SYNTHETIC SINGLE-SOCKET TOPOLOGY FOR THE SIMULATED HOST
pub fn flat(nr_cpus: usize) -> Vec<CpuTopo> {
    (0..nr_cpus).map(|id| CpuTopo { id, socket: 0 }).collect()
}
