// `iocore check`: CAN THIS HOST RUN THE CONTROLLER?
// EVERY CHECK IS READ-ONLY. NOTHING IS PINNED OR WRITTEN.

use std::io::Read;
use std::path::Path;
use std::process::Command;

use anyhow::{bail, Result};

use crate::sysfs::{self, VhostSysfs};

#[derive(Debug, PartialEq)]
enum Status {
    Ok(String),
    // MISSING, BUT THE CONTROLLER RUNS WITHOUT IT
    Optional(String),
    Failed(String),
}

struct Finding {
    what: &'static str,
    status: Status,
}

// --- KERNEL ---

// vhost-net BUILT IN OR AS A MODULE
fn vhost_kernel_config(config: &str) -> Status {
    let built = |opt: &str| {
        config
            .lines()
            .any(|l| l == format!("{}=y", opt) || l == format!("{}=m", opt))
    };
    match (built("CONFIG_VHOST"), built("CONFIG_VHOST_NET")) {
        (_, true) => Status::Ok("CONFIG_VHOST_NET".into()),
        (true, false) => Status::Failed("CONFIG_VHOST WITHOUT CONFIG_VHOST_NET".into()),
        (false, false) => Status::Failed("NO VHOST SUPPORT".into()),
    }
}

fn kernel_config() -> Status {
    let Ok(file) = std::fs::File::open("/proc/config.gz") else {
        return Status::Optional("/proc/config.gz NOT FOUND, SKIPPED".into());
    };
    let mut config = String::new();
    if flate2::read::GzDecoder::new(file).read_to_string(&mut config).is_err() {
        return Status::Optional("/proc/config.gz UNREADABLE, SKIPPED".into());
    }
    vhost_kernel_config(&config)
}

// --- AFFINITY ---

// WORKERS, VM THREADS AND NIC THREADS ARE ALL PINNED THROUGH THIS SYSCALL.
// SOME SECCOMP SANDBOXES REJECT IT.
fn affinity_syscall() -> Status {
    let mut set: libc::cpu_set_t = unsafe { std::mem::zeroed() };
    let (rc, cpus) = unsafe {
        let rc = libc::sched_getaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &mut set);
        (rc, libc::CPU_COUNT(&set))
    };
    if rc == 0 {
        Status::Ok(format!("{} CPUS VISIBLE", cpus))
    } else {
        Status::Failed(std::io::Error::last_os_error().to_string())
    }
}

// PHYSICAL BACKING DEVICES ARE STEERED THROUGH /proc/irq/<n>/smp_affinity
fn irq_affinity() -> Status {
    match std::fs::read_to_string("/proc/irq/default_smp_affinity") {
        Ok(mask) => Status::Ok(format!("DEFAULT {}", mask.trim())),
        Err(e) => Status::Optional(format!("{} (PHYSICAL BACKING UNAVAILABLE)", e)),
    }
}

// --- VHOST SYSFS ---

fn vhost_sysfs(root: &Path) -> Status {
    let mut s = match VhostSysfs::open(root) {
        Ok(s) => s,
        Err(e) => return Status::Failed(format!("NOT AVAILABLE ({:#})", e)),
    };
    match sysfs::describe(&mut s) {
        Ok(counts) if counts.get("devices").copied().unwrap_or(0) == 0 => {
            Status::Optional("NO DEVICES YET, START A VM FIRST".into())
        }
        Ok(counts) => {
            let parts: Vec<String> = counts.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
            Status::Ok(parts.join(" "))
        }
        Err(e) => Status::Failed(format!("UNREADABLE ({:#})", e)),
    }
}

// --- TOOLS ---

fn user_tool(name: &str) -> Status {
    let found = Command::new("which")
        .arg(name)
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false);
    if found {
        Status::Ok(String::new())
    } else {
        Status::Optional("MISSING".into())
    }
}

pub fn run_check(vhost_root: &str) -> Result<()> {
    let root = Path::new(vhost_root);
    let findings = [
        Finding { what: "kernel vhost", status: kernel_config() },
        Finding { what: "sched_getaffinity", status: affinity_syscall() },
        Finding { what: "irq affinity", status: irq_affinity() },
        Finding { what: "vhost sysfs", status: vhost_sysfs(root) },
        Finding { what: "taskset", status: user_tool("taskset") },
        Finding { what: "virsh", status: user_tool("virsh") },
    ];

    println!("IOCORE HOST CHECK ({})", root.display());
    println!();
    for f in &findings {
        match &f.status {
            Status::Ok(note) => println!("  {:<20}OK {}", f.what, note),
            Status::Optional(note) => println!("  {:<20}OPTIONAL: {}", f.what, note),
            Status::Failed(note) => println!("  {:<20}FAILED: {}", f.what, note),
        }
    }
    println!();

    let failed = findings.iter().filter(|f| matches!(f.status, Status::Failed(_))).count();
    if failed == 0 {
        println!("READY TO MANAGE {}", root.display());
        return Ok(());
    }
    if !root.exists() {
        println!("  Load the elastic vhost module: modprobe vhost_net");
    }
    bail!("{} of {} checks failed", failed, findings.len())
}
