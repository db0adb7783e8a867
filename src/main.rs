// IOCORE v1.0.0 -- ELASTIC I/O CORE CONTROLLER
// SIZES A POOL OF DEDICATED VHOST WORKER CORES TO THE LIVE I/O LOAD
//
// DECISIONS ARE PURE RUST OVER A HOST INTERFACE (src/lib.rs)
// THIS BINARY HANDLES: CONFIGURATION, THE LINUX BACKEND, MONITORING, REPORTING

mod cli;
mod sysfs;

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use iocore::adaptive::{control_loop, Controller};
use iocore::balance::build_balancer;
use iocore::engine::{DecisionEngine, EngineConfig};
use iocore::estimator::LoadEstimator;
use iocore::host::HostInterface;
use iocore::model::Model;
use iocore::sim::SimHost;
use iocore::topology::{self, CpuTopo};
use iocore::tuning::Config;

use sysfs::VhostSysfs;

static SHUTDOWN: AtomicBool = AtomicBool::new(false);

#[derive(Parser)]
#[command(name = "iocore")]
#[command(about = "IOCORE -- ELASTIC I/O CORE CONTROLLER FOR VHOST")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,

    // JSON CONFIGURATION FILE (DEFAULTS FOR EVERY MISSING FIELD)
    #[arg(long, short)]
    config: Option<PathBuf>,

    // EPOCH LENGTH IN MILLISECONDS (OVERRIDES epoch_ms)
    #[arg(long)]
    interval_ms: Option<u64>,

    #[arg(long)]
    min_io_cores: Option<usize>,

    #[arg(long)]
    max_io_cores: Option<usize>,

    // PRINT EVERY EPOCH AND DEBUG LOGS
    #[arg(long, short)]
    verbose: bool,

    // DUMP FULL EVENT LOG ON EXIT
    #[arg(long)]
    dump_log: bool,

    // DRY RUN AGAINST THE SIMULATED HOST INSTEAD OF /sys/class/vhost
    #[arg(long)]
    simulate: bool,

    // SIMULATED HOST SIZE
    #[arg(long, default_value_t = 8)]
    sim_cpus: usize,

    #[arg(long, default_value_t = 4)]
    sim_devices: u32,
}

#[derive(Subcommand)]
enum Command {
    // VERIFY VHOST SYSFS, KERNEL CONFIG AND AFFINITY SYSCALLS
    Check,
}

fn init_logging(verbose: bool) -> Result<()> {
    let level = if verbose {
        simplelog::LevelFilter::Debug
    } else {
        simplelog::LevelFilter::Info
    };
    let mut lcfg = simplelog::ConfigBuilder::new();
    lcfg.set_time_level(simplelog::LevelFilter::Error)
        .set_location_level(simplelog::LevelFilter::Off)
        .set_target_level(simplelog::LevelFilter::Off)
        .set_thread_level(simplelog::LevelFilter::Off);
    simplelog::TermLogger::init(
        level,
        lcfg.build(),
        simplelog::TerminalMode::Stderr,
        simplelog::ColorChoice::Auto,
    )?;
    Ok(())
}

fn load_config(cli: &Cli) -> Result<Config> {
    let mut cfg = match &cli.config {
        Some(p) => Config::load(p)?,
        None => Config::default(),
    };
    if let Some(ms) = cli.interval_ms {
        cfg.epoch_ms = ms;
    }
    if let Some(n) = cli.min_io_cores {
        cfg.min_io_cores = n;
    }
    if let Some(n) = cli.max_io_cores {
        cfg.max_io_cores = n;
    }
    cfg.validate()?;
    Ok(cfg)
}

fn build_controller<H: HostInterface + ?Sized>(
    host: &mut H,
    cfg: &Config,
    topo: &[CpuTopo],
) -> Result<Controller> {
    let cpus = topology::managed_cpus(topo, &cfg.managed_cpus, &cfg.io_cores)?;
    let model = Model::discover(host, cfg, cpus)?;
    let engine = DecisionEngine::new(EngineConfig::from_config(cfg), build_balancer(&cfg.balancer));
    let estimator = LoadEstimator::new(cfg.thresholds.clone(), cfg.history_reset_epochs);
    let mut ctrl = Controller::with_byte_rate_classifier(
        model,
        engine,
        estimator,
        cfg.classifier.active_threshold,
    );
    ctrl.start(host, &cfg.io_cores).context("startup")?;
    Ok(ctrl)
}

// SYNTHETIC LOAD FOR --simulate: A SLOW RAMP UP TO SATURATION AND BACK
fn sim_load(tick: u64) -> (f64, u64) {
    let phase = (tick % 240) as f64 / 240.0;
    let level = if phase < 0.5 { phase * 2.0 } else { (1.0 - phase) * 2.0 };
    let busy = 0.2 + 0.8 * level;
    let bytes = (busy * 4.0 * (1u64 << 20) as f64) as u64;
    (busy, bytes)
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logging(cli.verbose)?;

    let mut cfg = load_config(&cli)?;

    if let Some(Command::Check) = cli.command {
        return cli::check::run_check(&cfg.vhost_root);
    }

    ctrlc::set_handler(move || {
        SHUTDOWN.store(true, Ordering::Relaxed);
    })?;

    let interval = Duration::from_millis(cfg.epoch_ms);

    println!("IOCORE v1.0.0");
    println!("BACKEND:         {}", if cli.simulate { "SIMULATED" } else { cfg.vhost_root.as_str() });
    println!("EPOCH:           {} ms", cfg.epoch_ms);
    println!("IO CORES:        {:?} (min={}, max={})", cfg.io_cores, cfg.min_io_cores, cfg.max_io_cores);
    println!("BALANCER:        {:?}", cfg.balancer);
    println!("CPU SELECTION:   {:?}", cfg.cpu_selection);
    println!("WORKER SELECT:   {:?}", cfg.worker_selection());
    println!("VMS:             {}", cfg.vms.len());
    println!("VERBOSE:         {}", cli.verbose);
    println!();

    let ctrl = if cli.simulate {
        let mut host = SimHost::new(cli.sim_cpus);
        for _ in 0..cli.sim_devices {
            host.add_device(2, true);
        }
        let topo = topology::flat(cli.sim_cpus);
        let mut ctrl = build_controller(&mut host, &cfg, &topo)?;

        println!("IOCORE IS ACTIVE (SIMULATED, CTRL+C TO EXIT)");
        let mut tick = 0u64;
        control_loop(&mut host, &mut ctrl, &SHUTDOWN, interval, cli.verbose, |h: &mut SimHost| {
            let (busy, bytes) = sim_load(tick);
            tick += 1;
            h.advance(1_000_000_000, busy, bytes);
        })?;
        ctrl
    } else {
        sysfs::resolve_backing_irqs(&mut cfg)?;
        let mut host = VhostSysfs::open(std::path::Path::new(&cfg.vhost_root))?;
        let topo = topology::read_topology()?;
        let mut ctrl = build_controller(&mut host, &cfg, &topo)?;

        println!("IOCORE IS ACTIVE (CTRL+C TO EXIT)");
        control_loop(&mut host, &mut ctrl, &SHUTDOWN, interval, cli.verbose, |_: &mut VhostSysfs| {})?;
        ctrl
    };

    println!("IOCORE IS SHUTTING DOWN");

    if cli.dump_log {
        ctrl.log.dump();
    }
    ctrl.log.summary();

    // AN UNRESOLVED MOVE STAYS AS EXECUTED
    if ctrl.engine.in_flight().is_some() {
        log::warn!("EXITING WITH A MOVE IN FLIGHT, KEEPING CURRENT LAYOUT");
    }
    ctrl.model.check_invariants()?;

    println!("IOCORE OUT.");
    Ok(())
}
