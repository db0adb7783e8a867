// IOCORE TUNING
// PURE-RUST MODULE: ZERO HOST DEPENDENCIES
// DEFAULT CONSTANTS, THE JSON CONFIGURATION AND THE SMALL PURE FUNCTIONS THE
// DECISION ENGINE IS BUILT FROM. SHARED BETWEEN THE BINARY AND tests/.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::pool::SelectionKind;

// EPOCH

pub const DEFAULT_EPOCH_MS: u64 = 1000;

// DEBOUNCE: A MOVE MUST BE WANTED IN 60% OF THE LAST 20 EPOCHS.
// AFTER ANY COMMITTED MOVE, NOTHING MOVES FOR 2 WINDOWS.

pub const DEFAULT_REQUEST_WINDOW: usize = 20;
pub const DEFAULT_REQUEST_RATIO: f64    = 0.6;
pub const COOLDOWN_WINDOWS: u64         = 2;

// OUTCOME CHECK: 10 EPOCHS BEFORE VS 10 EPOCHS AFTER, SKIPPING 2 EPOCHS OF
// SETTLE TIME. THROUGHPUT MUST GAIN MORE THAN EPSILON (BYTES PER CYCLE).

pub const DEFAULT_HISTORY_LENGTH: usize = 10;
pub const DEFAULT_GRACE_PERIOD: usize   = 2;
pub const DEFAULT_IMPROVEMENT_EPS: f64  = 0.05;

// REGRET: FIRST FAILURE BLOCKS THE MOVE KIND FOR 100 EPOCHS, THEN x10 PER
// FAILURE, NEVER MORE THAN 50x THE INITIAL PENALTY.

pub const DEFAULT_INITIAL_PENALTY: u64 = 10;
pub const DEFAULT_REGRET_FACTOR: u64   = 10;
pub const DEFAULT_PENALTY_CAP: u64     = 50;

// MODE SWITCH AND HARD LIMITS

pub const DEFAULT_STOP_SHARED_RATIO: f64 = 0.3;   // LEAVE SHARED: BUSY < 30% OF ONE CORE
pub const DEFAULT_HARD_REMOVE_RATIO: f64 = 1.3;   // EMPTY CORES: CERTAINLY OVERSUBSCRIBED
pub const DEFAULT_MAX_IO_CORES: usize    = 4;

// CLASSIFIER: 1MB PER EPOCH MAKES A QUEUE ACTIVE

pub const DEFAULT_ACTIVE_THRESHOLD: u64 = 1 << 20;

// ESTIMATOR HISTORY: MIN/AVG/MAX ROLL OVER EVERY 10 MINUTES AT 1S EPOCHS

pub const HISTORY_RESET_EPOCHS: u64 = 600;

pub const DEFAULT_VHOST_ROOT: &str = "/sys/class/vhost";

// --- THRESHOLD TABLE ---

// ONE ENTRY PER SHARED WORKER COUNT. INDEX 0 IS DEDICATED MODE.
// IDLE IS NORMALIZED PER WORKER, SO REMOVING ONE OF N WORKERS IS SAFE ONLY
// ABOVE 1/N IDLE. can_remove SITS A LITTLE ABOVE THAT LINE.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Thresholds {
    pub add_ratio: f64,
    pub can_remove_ratio: f64,
    #[serde(default)]
    pub min_avg_bytes_per_packet: f64,
}

pub fn default_thresholds() -> Vec<Thresholds> {
    let row = |add_ratio, can_remove_ratio| Thresholds {
        add_ratio,
        can_remove_ratio,
        min_avg_bytes_per_packet: 0.0,
    };
    vec![
        row(0.40, 1.00),   // DEDICATED
        row(0.05, 1.00),   // 1 WORKER: NEVER SHRINK, ONLY STOP
        row(0.05, 0.55),
        row(0.05, 0.40),
        row(0.05, 0.30),
        row(0.05, 0.25),   // 5+
    ]
}

// --- CONFIGURATION ---

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum BalancerConfig {
    #[default]
    Grouping,
    DeviceCount,
    StaticTable { layouts: Vec<StaticLayout> },
}

// SLOT i IS SERVED BY THE WORKER ON slot_cpus[i] WHEN ONE EXISTS.
// devices MAPS DEVICE NUMBER -> SLOT INDEX.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StaticLayout {
    pub workers: usize,
    pub slot_cpus: Vec<usize>,
    pub devices: BTreeMap<u32, usize>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct VmConfig {
    pub id: u32,
    pub pid: i32,
    #[serde(default)]
    pub threads: Vec<i32>,
    #[serde(default)]
    pub devices: Vec<u32>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum VmPlacementConfig {
    #[default]
    RunEverywhere,
    Preconfigured { layouts: Vec<VmLayout> },
}

// FOR A VM POOL OF `cores` CPUS: VM ID -> CONFIGURED CPU LABELS. THE SORTED
// UNION OF ALL LABELS IS MAPPED ONTO THE LIVE VM POOL BY POSITION.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct VmLayout {
    pub cores: usize,
    pub vms: BTreeMap<u32, Vec<usize>>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BackingKindConfig {
    Physical {
        #[serde(default)]
        irqs: Vec<u32>,
        #[serde(default)]
        irq_prefix: Option<String>,
    },
    Software {
        threads: Vec<i32>,
    },
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BackingDeviceConfig {
    pub id: String,
    pub kind: BackingKindConfig,
    pub devices: Vec<u32>,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassifierConfig {
    pub active_threshold: u64,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            active_threshold: DEFAULT_ACTIVE_THRESHOLD,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub epoch_ms: u64,
    pub vhost_root: String,

    // CPUS THE CONTROLLER MAY HAND OUT. EMPTY = ALL HOST CPUS.
    pub managed_cpus: Vec<usize>,
    // INITIAL WORKER POOL. EMPTY = START DEDICATED.
    pub io_cores: Vec<usize>,
    pub min_io_cores: usize,
    pub max_io_cores: usize,

    pub thresholds: Vec<Thresholds>,
    // NONE = 1 - thresholds[0].add_ratio
    pub start_shared_ratio: Option<f64>,
    pub stop_shared_ratio: f64,
    pub hard_remove_ratio: f64,
    pub vm_can_remove_ratio: f64,

    pub request_window: usize,
    pub request_ratio: f64,
    pub history_length: usize,
    pub grace_period: usize,
    pub improvement_epsilon: f64,
    pub initial_penalty: u64,
    pub regret_factor: u64,
    pub penalty_cap: u64,
    pub history_reset_epochs: u64,

    pub cpu_selection: SelectionKind,
    // NONE = cpu_selection
    pub worker_selection: Option<SelectionKind>,
    pub cpu_order: Vec<usize>,
    pub balancer: BalancerConfig,
    pub classifier: ClassifierConfig,
    pub polling: bool,

    pub vms: Vec<VmConfig>,
    pub vm_placement: VmPlacementConfig,
    pub backing_devices: Vec<BackingDeviceConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            epoch_ms: DEFAULT_EPOCH_MS,
            vhost_root: DEFAULT_VHOST_ROOT.to_string(),
            managed_cpus: Vec::new(),
            io_cores: Vec::new(),
            min_io_cores: 0,
            max_io_cores: DEFAULT_MAX_IO_CORES,
            thresholds: default_thresholds(),
            start_shared_ratio: None,
            stop_shared_ratio: DEFAULT_STOP_SHARED_RATIO,
            hard_remove_ratio: DEFAULT_HARD_REMOVE_RATIO,
            vm_can_remove_ratio: 0.0,
            request_window: DEFAULT_REQUEST_WINDOW,
            request_ratio: DEFAULT_REQUEST_RATIO,
            history_length: DEFAULT_HISTORY_LENGTH,
            grace_period: DEFAULT_GRACE_PERIOD,
            improvement_epsilon: DEFAULT_IMPROVEMENT_EPS,
            initial_penalty: DEFAULT_INITIAL_PENALTY,
            regret_factor: DEFAULT_REGRET_FACTOR,
            penalty_cap: DEFAULT_PENALTY_CAP,
            history_reset_epochs: HISTORY_RESET_EPOCHS,
            cpu_selection: SelectionKind::default(),
            worker_selection: None,
            cpu_order: Vec::new(),
            balancer: BalancerConfig::default(),
            classifier: ClassifierConfig::default(),
            polling: true,
            vms: Vec::new(),
            vm_placement: VmPlacementConfig::default(),
            backing_devices: Vec::new(),
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Config> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;
        Self::from_json(&text)
    }

    pub fn from_json(text: &str) -> Result<Config> {
        let cfg: Config =
            serde_json::from_str(text).map_err(|e| Error::Config(e.to_string()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn start_shared_ratio(&self) -> f64 {
        self.start_shared_ratio.unwrap_or_else(|| {
            1.0 - self.thresholds.first().map(|t| t.add_ratio).unwrap_or(0.0)
        })
    }

    pub fn worker_selection(&self) -> SelectionKind {
        self.worker_selection.unwrap_or(self.cpu_selection)
    }

    pub fn validate(&self) -> Result<()> {
        let bad = |msg: String| Err(Error::Config(msg));

        if self.epoch_ms == 0 {
            return bad("epoch_ms must be > 0".into());
        }
        if self.max_io_cores == 0 || self.min_io_cores > self.max_io_cores {
            return bad(format!(
                "io core bounds [{}, {}] are empty",
                self.min_io_cores, self.max_io_cores
            ));
        }
        if !self.io_cores.is_empty()
            && (self.io_cores.len() < self.min_io_cores.max(1)
                || self.io_cores.len() > self.max_io_cores)
        {
            return bad(format!(
                "{} initial io cores outside [{}, {}]",
                self.io_cores.len(),
                self.min_io_cores.max(1),
                self.max_io_cores
            ));
        }
        if self.request_window == 0 || !(self.request_ratio > 0.0 && self.request_ratio <= 1.0) {
            return bad("request_window must be > 0 and request_ratio in (0, 1]".into());
        }
        if self.history_length == 0 {
            return bad("history_length must be > 0".into());
        }
        if self.initial_penalty == 0 || self.regret_factor == 0 || self.penalty_cap == 0 {
            return bad("regret penalty, factor and cap must be > 0".into());
        }
        if self.thresholds.is_empty() {
            return bad("threshold table is empty".into());
        }
        for (n, t) in self.thresholds.iter().enumerate() {
            if t.add_ratio > t.can_remove_ratio {
                return bad(format!(
                    "thresholds[{}]: add_ratio {} above can_remove_ratio {}",
                    n, t.add_ratio, t.can_remove_ratio
                ));
            }
        }
        if let BalancerConfig::StaticTable { layouts } = &self.balancer {
            for l in layouts {
                if l.slot_cpus.len() != l.workers {
                    return bad(format!(
                        "static layout for {} workers has {} slots",
                        l.workers,
                        l.slot_cpus.len()
                    ));
                }
                if let Some((d, s)) = l.devices.iter().find(|(_, &s)| s >= l.workers) {
                    return bad(format!(
                        "static layout for {} workers maps d.{} to slot {}",
                        l.workers, d, s
                    ));
                }
            }
        }
        let kinds = [self.cpu_selection, self.worker_selection()];
        if kinds.contains(&SelectionKind::Preconfigured) && self.cpu_order.is_empty() {
            return bad("preconfigured cpu selection needs cpu_order".into());
        }
        if self.cpu_selection == SelectionKind::MinDevicesServed {
            return bad("min_devices_served only applies to worker_selection".into());
        }
        Ok(())
    }
}

// --- PURE DECISION HELPERS ---

// REQUESTS NEEDED IN THE TRAILING WINDOW. 0.6 x 20 = 12.
pub fn debounce_threshold(window: usize, ratio: f64) -> usize {
    ((window as f64 * ratio).ceil() as usize).max(1)
}

pub fn cooldown_epochs(window: usize) -> u64 {
    window as u64 * COOLDOWN_WINDOWS
}

// WORKERS TO START WHEN LEAVING DEDICATED MODE
pub fn start_worker_count(effective_io: f64, min_io_cores: usize, max_io_cores: usize) -> usize {
    let wanted = if effective_io.is_finite() && effective_io > 0.0 {
        effective_io.ceil() as usize
    } else {
        0
    };
    wanted.max(1).clamp(min_io_cores.max(1), max_io_cores.max(1))
}

pub fn escalate_penalty(current: u64, initial: u64, factor: u64, cap: u64) -> u64 {
    current
        .saturating_mul(factor)
        .min(initial.saturating_mul(cap))
}

pub fn outcome_improved(before: f64, after: f64, epsilon: f64) -> bool {
    after > before + epsilon
}

// TELEMETRY GATING
// EPOCHS WITHOUT ANY MOVE WANTED BUILD STABILITY. STABLE LOOPS PRINT HALF
// AS OFTEN.

pub const STABILITY_THRESHOLD: u32 = 10;

pub fn compute_stability_score(prev_score: u32, anything_wanted: bool, in_flight: bool) -> u32 {
    if anything_wanted || in_flight {
        return 0;
    }
    (prev_score + 1).min(STABILITY_THRESHOLD)
}

pub fn should_print_telemetry(epoch: u64, stability_score: u32) -> bool {
    if stability_score >= STABILITY_THRESHOLD {
        epoch % 2 == 0
    } else {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_validates() {
        Config::default().validate().unwrap();
        assert!((Config::default().start_shared_ratio() - 0.6).abs() < 1e-9);
    }

    #[test]
    fn json_defaults_fill_missing_fields() {
        let cfg = Config::from_json(r#"{ "max_io_cores": 3, "io_cores": [6, 7] }"#).unwrap();
        assert_eq!(cfg.max_io_cores, 3);
        assert_eq!(cfg.io_cores, vec![6, 7]);
        assert_eq!(cfg.request_window, DEFAULT_REQUEST_WINDOW);
        assert_eq!(cfg.thresholds.len(), default_thresholds().len());
        assert!(matches!(cfg.balancer, BalancerConfig::Grouping));
    }

    #[test]
    fn tagged_policies_parse() {
        let cfg = Config::from_json(
            r#"{
                "balancer": { "policy": "static_table", "layouts": [
                    { "workers": 2, "slot_cpus": [6, 7], "devices": { "1": 0, "2": 1 } }
                ]},
                "vm_placement": { "policy": "preconfigured", "layouts": [
                    { "cores": 2, "vms": { "1": [0], "2": [1] } }
                ]},
                "backing_devices": [
                    { "id": "bd.1", "kind": { "type": "physical", "irq_prefix": "eth0" }, "devices": [1, 2] },
                    { "id": "bd.2", "kind": { "type": "software", "threads": [99] }, "devices": [3] }
                ]
            }"#,
        )
        .unwrap();
        match cfg.balancer {
            BalancerConfig::StaticTable { layouts } => assert_eq!(layouts[0].devices[&2], 1),
            _ => panic!("expected static table"),
        }
        assert_eq!(cfg.backing_devices.len(), 2);
    }

    #[test]
    fn inconsistent_values_rejected() {
        assert!(Config::from_json(r#"{ "min_io_cores": 5, "max_io_cores": 2 }"#).is_err());
        assert!(Config::from_json(r#"{ "request_ratio": 1.5 }"#).is_err());
        assert!(Config::from_json(r#"{ "io_cores": [1, 2, 3], "max_io_cores": 2 }"#).is_err());
        assert!(Config::from_json(
            r#"{ "thresholds": [ { "add_ratio": 0.5, "can_remove_ratio": 0.1 } ] }"#
        )
        .is_err());
        assert!(Config::from_json(r#"{ "cpu_selection": "preconfigured" }"#).is_err());
        assert!(Config::from_json("{ not json").is_err());
    }

    #[test]
    fn worker_selection_falls_back_to_cpu_selection() {
        let cfg = Config::from_json(r#"{ "cpu_selection": "min_usage" }"#).unwrap();
        assert_eq!(cfg.worker_selection(), SelectionKind::MinUsage);

        let cfg = Config::from_json(
            r#"{ "worker_selection": "min_devices_served", "balancer": { "policy": "device_count" } }"#,
        )
        .unwrap();
        assert_eq!(cfg.cpu_selection, SelectionKind::LastAdded);
        assert_eq!(cfg.worker_selection(), SelectionKind::MinDevicesServed);
        assert!(matches!(cfg.balancer, BalancerConfig::DeviceCount));

        // THE VM POOL SERVES NO DEVICES
        assert!(Config::from_json(r#"{ "cpu_selection": "min_devices_served" }"#).is_err());
        assert!(Config::from_json(r#"{ "worker_selection": "preconfigured" }"#).is_err());
    }

    #[test]
    fn static_layout_slot_count_checked() {
        let bad = r#"{ "balancer": { "policy": "static_table", "layouts": [
            { "workers": 2, "slot_cpus": [6], "devices": {} } ] } }"#;
        assert!(Config::from_json(bad).is_err());
    }
}
