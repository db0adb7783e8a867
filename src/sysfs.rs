// IOCORE LINUX BACKEND
// HostInterface OVER THE VHOST SYSFS TREE AND /proc
//
//   /sys/class/vhost/            GLOBAL COUNTERS (cycles, ...)
//   /sys/class/vhost/worker/     w.N DIRS + create / remove CONTROL FILES
//   /sys/class/vhost/dev/        d.N DIRS (worker)
//   /sys/class/vhost/vq/         vq.N.M DIRS (handled_bytes, poll, ...)
//
// AN ELEMENT DIR EITHER HOLDS ONE FILE PER KEY OR A SINGLE `status` FILE OF
// key:value LINES. BOTH ARE READ THE SAME WAY.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use anyhow::{bail, Context, Result};
use regex::Regex;

use iocore::cpumask::{CpuMask, MAX_CPUS};
use iocore::host::{self, DeviceId, Element, HostInterface, Inventory, QueueId, RawCounters, WorkerId};
use iocore::tuning::{BackingKindConfig, Config};

const PROC_STAT: &str = "/proc/stat";
const PROC_INTERRUPTS: &str = "/proc/interrupts";

pub struct VhostSysfs {
    root: PathBuf,
    nr_cpus: usize,
}

impl VhostSysfs {
    pub fn open(root: &Path) -> Result<Self> {
        for sub in ["worker", "dev", "vq"] {
            let p = root.join(sub);
            if !p.is_dir() {
                bail!("{} missing (vhost module not loaded?)", p.display());
            }
        }
        let nr_cpus = unsafe { libc::sysconf(libc::_SC_NPROCESSORS_CONF) };
        if nr_cpus <= 0 {
            bail!("sysconf(_SC_NPROCESSORS_CONF) failed");
        }
        Ok(Self {
            root: root.to_path_buf(),
            nr_cpus: (nr_cpus as usize).min(MAX_CPUS),
        })
    }

    fn element_dir(&self, element: &Element) -> Option<PathBuf> {
        match element {
            Element::Global => Some(self.root.clone()),
            Element::Worker(id) => Some(self.root.join("worker").join(id.to_string())),
            Element::Device(id) => Some(self.root.join("dev").join(id.to_string())),
            Element::Queue(id) => Some(self.root.join("vq").join(id.to_string())),
            Element::Process(_) | Element::Cpu(_) => None,
        }
    }

    fn list_ids<T: FromStr>(&self, sub: &str) -> Result<Vec<T>> {
        let mut out = Vec::new();
        let dir = self.root.join(sub);
        for entry in fs::read_dir(&dir).with_context(|| format!("read_dir {}", dir.display()))? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            if let Some(id) = entry.file_name().to_str().and_then(|n| n.parse().ok()) {
                out.push(id);
            }
        }
        Ok(out)
    }

    fn read_element(&self, dir: &Path) -> Result<RawCounters> {
        let mut c = RawCounters::new();
        let status = dir.join("status");
        if status.is_file() {
            let text = fs::read_to_string(&status)
                .with_context(|| format!("read {}", status.display()))?;
            for line in text.lines() {
                if let Some((k, v)) = line.split_once(':') {
                    put_value(&mut c, k.trim(), v);
                }
            }
            return Ok(c);
        }

        for entry in fs::read_dir(dir).with_context(|| format!("read_dir {}", dir.display()))? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            // WRITE-ONLY CONTROL FILES FAIL TO READ. SKIP THEM.
            let Ok(text) = fs::read_to_string(entry.path()) else {
                continue;
            };
            put_value(&mut c, &name, &text);
        }
        Ok(c)
    }

    fn write_file(path: &Path, value: &str) -> Result<()> {
        fs::write(path, value).with_context(|| format!("write '{}' to {}", value, path.display()))
    }

    // --- /proc ---

    fn process_ticks(pid: i32) -> Result<u64> {
        let path = format!("/proc/{}/stat", pid);
        let text = fs::read_to_string(&path).with_context(|| format!("read {}", path))?;
        // comm MAY CONTAIN SPACES. FIELDS RESTART AFTER THE LAST ')'.
        let rest = text
            .rsplit_once(')')
            .map(|(_, r)| r)
            .with_context(|| format!("malformed {}", path))?;
        let fields: Vec<&str> = rest.split_whitespace().collect();
        // utime / stime ARE FIELDS 14 AND 15 OF THE FULL LINE
        let field = |i: usize| -> Result<u64> {
            fields
                .get(i)
                .and_then(|s| s.parse().ok())
                .with_context(|| format!("{}: field {} missing", path, i))
        };
        Ok(field(11)? + field(12)?)
    }

    fn cpu_counters(&self, cpu: usize) -> Result<RawCounters> {
        let text = fs::read_to_string(PROC_STAT).context("read /proc/stat")?;
        let tag = format!("cpu{}", cpu);
        let line = text
            .lines()
            .find(|l| l.split_whitespace().next() == Some(tag.as_str()))
            .with_context(|| format!("{} not in /proc/stat", tag))?;
        let v: Vec<u64> = line
            .split_whitespace()
            .skip(1)
            .map(|s| s.parse().unwrap_or(0))
            .collect();
        let get = |i: usize| v.get(i).copied().unwrap_or(0);

        // user nice system idle iowait irq softirq steal
        let mut c = RawCounters::new();
        c.insert(host::TICKS.to_string(), v.iter().take(8).sum());
        c.insert(host::IDLE.to_string(), get(3) + get(4));
        c.insert(host::SOFTIRQ.to_string(), get(6));
        c.insert(host::INTERRUPTS.to_string(), interrupts_on(cpu)?);
        Ok(c)
    }
}

fn put_value(c: &mut RawCounters, key: &str, value: &str) {
    let value = value.trim();
    if key.ends_with("_list") {
        return;
    }
    if let Ok(n) = value.parse::<u64>() {
        c.insert(key.to_string(), n);
    } else if let Ok(w) = value.parse::<WorkerId>() {
        // dev/worker HOLDS THE WORKER NAME, NOT ITS NUMBER
        c.insert(key.to_string(), w.0 as u64);
    }
}

// SUM OF THE PER-CPU COLUMN ACROSS ALL IRQ LINES
fn interrupts_on(cpu: usize) -> Result<u64> {
    let text = fs::read_to_string(PROC_INTERRUPTS).context("read /proc/interrupts")?;
    let mut lines = text.lines();
    let header = lines.next().unwrap_or_default();
    let Some(col) = header
        .split_whitespace()
        .position(|h| h == format!("CPU{}", cpu))
    else {
        return Ok(0);
    };
    let mut total = 0u64;
    for line in lines {
        let mut it = line.split_whitespace();
        if it.next().is_none() {
            continue;
        }
        if let Some(n) = it.nth(col).and_then(|s| s.parse::<u64>().ok()) {
            total += n;
        }
    }
    Ok(total)
}

// IRQ NUMBERS WHOSE ACTION NAME STARTS WITH `prefix` (E.G. "eth1-TxRx")
pub fn resolve_irq_prefix(text: &str, prefix: &str) -> Result<Vec<u32>> {
    let re = Regex::new(r"^\s*(\d+):.*\s(\S+)\s*$")?;
    let mut irqs = Vec::new();
    for line in text.lines() {
        if let Some(caps) = re.captures(line) {
            if caps[2].starts_with(prefix) {
                irqs.push(caps[1].parse()?);
            }
        }
    }
    Ok(irqs)
}

// FILL `irqs` FOR EVERY PHYSICAL BACKING DEVICE CONFIGURED BY PREFIX
pub fn resolve_backing_irqs(cfg: &mut Config) -> Result<()> {
    let mut text: Option<String> = None;
    for b in cfg.backing_devices.iter_mut() {
        if let BackingKindConfig::Physical { irqs, irq_prefix: Some(prefix) } = &mut b.kind {
            if text.is_none() {
                text = Some(fs::read_to_string(PROC_INTERRUPTS).context("read /proc/interrupts")?);
            }
            let found = resolve_irq_prefix(text.as_deref().unwrap_or_default(), prefix)?;
            if found.is_empty() {
                log::warn!("{}: no irqs match prefix '{}'", b.id, prefix);
            }
            for irq in found {
                if !irqs.contains(&irq) {
                    irqs.push(irq);
                }
            }
        }
    }
    Ok(())
}

// --- AFFINITY SYSCALLS ---

fn to_cpu_set(mask: &CpuMask) -> libc::cpu_set_t {
    let mut set: libc::cpu_set_t = unsafe { std::mem::zeroed() };
    for cpu in mask.iter() {
        unsafe { libc::CPU_SET(cpu, &mut set) };
    }
    set
}

fn task_ids(pid: i32) -> Vec<i32> {
    let dir = format!("/proc/{}/task", pid);
    let mut tids: Vec<i32> = fs::read_dir(&dir)
        .map(|rd| {
            rd.filter_map(|e| e.ok())
                .filter_map(|e| e.file_name().to_str().and_then(|n| n.parse().ok()))
                .collect()
        })
        .unwrap_or_default();
    if tids.is_empty() {
        tids.push(pid);
    }
    tids
}

fn sched_setaffinity(tid: i32, mask: &CpuMask) -> Result<()> {
    let set = to_cpu_set(mask);
    let rc = unsafe { libc::sched_setaffinity(tid, std::mem::size_of::<libc::cpu_set_t>(), &set) };
    if rc != 0 {
        bail!("sched_setaffinity({}, {}): {}", tid, mask, std::io::Error::last_os_error());
    }
    Ok(())
}

fn sched_getaffinity(pid: i32) -> Result<CpuMask> {
    let mut set: libc::cpu_set_t = unsafe { std::mem::zeroed() };
    let rc = unsafe { libc::sched_getaffinity(pid, std::mem::size_of::<libc::cpu_set_t>(), &mut set) };
    if rc != 0 {
        bail!("sched_getaffinity({}): {}", pid, std::io::Error::last_os_error());
    }
    Ok((0..MAX_CPUS).filter(|&c| unsafe { libc::CPU_ISSET(c, &set) }).collect())
}

// --- TRAIT BOUNDARY ---

fn host_err(e: anyhow::Error) -> iocore::Error {
    iocore::Error::host(format!("{:#}", e))
}

impl VhostSysfs {
    fn inventory_inner(&self) -> Result<Inventory> {
        let mut workers: Vec<WorkerId> = self.list_ids("worker")?;
        let mut devices: Vec<DeviceId> = self.list_ids("dev")?;
        let mut queues: Vec<QueueId> = self.list_ids("vq")?;
        workers.sort();
        devices.sort();
        queues.sort();
        Ok(Inventory { workers, devices, queues, nr_cpus: self.nr_cpus })
    }

    fn read_counters_inner(&self, element: &Element) -> Result<RawCounters> {
        match element {
            Element::Process(pid) => {
                let mut c = RawCounters::new();
                c.insert(host::TICKS.to_string(), Self::process_ticks(*pid)?);
                Ok(c)
            }
            Element::Cpu(cpu) => self.cpu_counters(*cpu),
            _ => match self.element_dir(element) {
                Some(dir) => self.read_element(&dir),
                None => bail!("{} has no sysfs dir", element),
            },
        }
    }

    fn write_attribute_inner(&self, element: &Element, name: &str, value: u64) -> Result<()> {
        let dir = self
            .element_dir(element)
            .with_context(|| format!("{} is not writable", element))?;
        let text = match (element, name) {
            (Element::Device(_), host::WORKER) => WorkerId(value as u32).to_string(),
            _ => value.to_string(),
        };
        Self::write_file(&dir.join(name), &text)
    }

    // WRITE THE CPU TO worker/create, READ BACK THE NEW WORKER'S NAME
    fn create_worker_inner(&self, cpu: usize) -> Result<WorkerId> {
        let ctl = self.root.join("worker").join("create");
        Self::write_file(&ctl, &cpu.to_string())?;
        let name = fs::read_to_string(&ctl).with_context(|| format!("read {}", ctl.display()))?;
        name.trim()
            .parse::<WorkerId>()
            .map_err(|e| anyhow::anyhow!("worker/create returned '{}': {}", name.trim(), e))
    }

    // LOCK FIRST SO NO DEVICE CAN ATTACH BETWEEN THE CHECK AND THE REMOVE
    fn destroy_worker_inner(&self, id: WorkerId) -> Result<()> {
        let dir = self.root.join("worker").join(id.to_string());
        for dev in self.list_ids::<DeviceId>("dev")? {
            let c = self.read_element(&self.root.join("dev").join(dev.to_string()))?;
            if c.get(host::WORKER) == Some(&(id.0 as u64)) {
                bail!("{} still has {} attached", id, dev);
            }
        }
        Self::write_file(&dir.join("locked"), "1")?;
        Self::write_file(&self.root.join("worker").join("remove"), &id.to_string())
    }
}

impl HostInterface for VhostSysfs {
    fn inventory(&mut self) -> iocore::Result<Inventory> {
        self.inventory_inner().map_err(host_err)
    }

    fn read_counters(&mut self, element: &Element) -> iocore::Result<RawCounters> {
        self.read_counters_inner(element).map_err(host_err)
    }

    fn write_attribute(&mut self, element: &Element, name: &str, value: u64) -> iocore::Result<()> {
        self.write_attribute_inner(element, name, value).map_err(host_err)
    }

    fn create_worker(&mut self, cpu: usize) -> iocore::Result<WorkerId> {
        self.create_worker_inner(cpu).map_err(host_err)
    }

    fn destroy_worker(&mut self, id: WorkerId) -> iocore::Result<()> {
        self.destroy_worker_inner(id).map_err(host_err)
    }

    // EVERY THREAD OF THE PROCESS, NOT JUST THE LEADER
    fn set_cpu_affinity(&mut self, pid: i32, mask: &CpuMask) -> iocore::Result<()> {
        if mask.is_empty() {
            return Err(iocore::Error::host(format!("empty affinity for pid {}", pid)));
        }
        for tid in task_ids(pid) {
            sched_setaffinity(tid, mask).map_err(host_err)?;
        }
        Ok(())
    }

    fn get_cpu_affinity(&mut self, pid: i32) -> iocore::Result<CpuMask> {
        sched_getaffinity(pid).map_err(host_err)
    }

    fn set_irq_affinity(&mut self, irq: u32, cpu: usize) -> iocore::Result<()> {
        let path = format!("/proc/irq/{}/smp_affinity_list", irq);
        Self::write_file(Path::new(&path), &cpu.to_string()).map_err(host_err)
    }
}

// PER-ELEMENT KEY DUMP FOR `iocore check`
pub fn describe(sysfs: &mut VhostSysfs) -> Result<BTreeMap<String, usize>> {
    let inv = sysfs.inventory_inner()?;
    let mut out = BTreeMap::new();
    out.insert("workers".to_string(), inv.workers.len());
    out.insert("devices".to_string(), inv.devices.len());
    out.insert("queues".to_string(), inv.queues.len());
    out.insert("cpus".to_string(), inv.nr_cpus);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    const INTERRUPTS: &str = "\
           CPU0       CPU1
  0:         36          0   IO-APIC    2-edge      timer
 40:      12000        300   PCI-MSI 524288-edge      eth1-TxRx-0
 41:        500      90000   PCI-MSI 524289-edge      eth1-TxRx-1
 42:          1          0   PCI-MSI 524290-edge      eth1
NMI:          0          0   Non-maskable interrupts
";

    #[test]
    fn irq_prefix_matches_action_names() {
        let irqs = resolve_irq_prefix(INTERRUPTS, "eth1-TxRx").unwrap();
        assert_eq!(irqs, vec![40, 41]);
        let all = resolve_irq_prefix(INTERRUPTS, "eth1").unwrap();
        assert_eq!(all, vec![40, 41, 42]);
        assert!(resolve_irq_prefix(INTERRUPTS, "eth9").unwrap().is_empty());
    }

    #[test]
    fn status_values_parse() {
        let mut c = RawCounters::new();
        put_value(&mut c, "cycles", " 12345\n");
        put_value(&mut c, "worker", "w.7\n");
        put_value(&mut c, "dev_list", "d.1\td.2");
        put_value(&mut c, "name", "vhost-1234");
        assert_eq!(host::counter(&c, "cycles"), 12345);
        assert_eq!(host::counter(&c, "worker"), 7);
        assert!(!c.contains_key("dev_list"));
        assert!(!c.contains_key("name"));
    }
}
