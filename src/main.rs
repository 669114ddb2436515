#![allow(dead_code)]

mod actuator;
mod app;
mod audit;
mod config;
mod control;
mod errors;
mod ports;
mod safety;
mod scheduler;
mod sensors;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration as StdDuration;

use clap::Parser;
use tracing_subscriber::FmtSubscriber;

use actuator::{ActuatorFacade, MemoryRelayBackend};
use app::{Paths, Ripple};
use audit::FileAuditSink;
use config::relay_assignments::RelayAssignments;
use config::Config;
use ports::{OsFileStore, SystemClock};
use scheduler::Scheduler;

#[cfg(unix)]
const CONFIG_FILE_PATH: &str = "/etc/opt/ripple/device.conf";

#[cfg(not(unix))]
const CONFIG_FILE_PATH: &str = "./device.conf";

#[cfg(unix)]
const DATA_DIR: &str = "/var/lib/ripple";

#[cfg(not(unix))]
const DATA_DIR: &str = "./data";

#[cfg(unix)]
const AUDIT_LOG_PATH: &str = "/var/log/ripple/audit.jsonl";

#[cfg(not(unix))]
const AUDIT_LOG_PATH: &str = "./audit.jsonl";

const MAIN_LOOP_SLEEP: StdDuration = StdDuration::from_secs(app::MAIN_LOOP_TICK_SECONDS as u64);

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Args {
    /// INI config file path (dual-value `server_default, operational` tunables).
    #[clap(short = 'c', long = "config", default_value = CONFIG_FILE_PATH, parse(from_os_str))]
    config: std::path::PathBuf,

    /// Directory holding the durable job store, sensor snapshot, dosing
    /// runtime history, and the emergency-shutdown flag.
    #[clap(long = "data-dir", default_value = DATA_DIR, parse(from_os_str))]
    data_dir: std::path::PathBuf,

    /// JSON-lines audit trail path.
    #[clap(long = "audit-log", default_value = AUDIT_LOG_PATH, parse(from_os_str))]
    audit_log: std::path::PathBuf,
}

fn setup_tracing() {
    let subscriber = FmtSubscriber::builder().with_max_level(tracing::Level::TRACE).finish();
    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");
}

fn build_actuator(config: &Config) -> ActuatorFacade {
    let assignments = RelayAssignments::new(config.clone());

    #[cfg(feature = "station-gpio")]
    {
        match actuator::gpio::GpioRelayBackend::new() {
            Ok(backend) => return ActuatorFacade::new(assignments, Box::new(backend)),
            Err(err) => {
                tracing::error!(error = %err, "failed to initialize GPIO relay backend, falling back to an in-memory backend");
            }
        }
    }

    ActuatorFacade::new(assignments, Box::new(MemoryRelayBackend::new()))
}

fn main() {
    let args = Args::parse();

    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    ctrlc::set_handler(move || {
        r.store(false, Ordering::SeqCst);
    })
    .expect("Error setting Ctrl-C handler");

    setup_tracing();

    #[cfg(feature = "demo")]
    tracing::info!("DEMO MODE");

    tracing::info!("Using config file: {}", args.config.display());
    tracing::info!("Using data directory: {}", args.data_dir.display());

    let config = Config::new(args.config);
    let actuator = build_actuator(&config);
    let scheduler = Scheduler::open(&args.data_dir.join("scheduler.sqlite"));
    let file_store = Box::new(OsFileStore);
    let clock = Box::new(SystemClock);
    let audit = Box::new(FileAuditSink::new(args.audit_log));

    let paths = Paths {
        snapshot: args.data_dir.join("sensor_snapshot.json").to_string_lossy().into_owned(),
        runtime_tracker: args.data_dir.join("dosing_runtime.json").to_string_lossy().into_owned(),
        emergency_flag: args.data_dir.join("emergency.flag").to_string_lossy().into_owned(),
    };

    // No sensor drivers are wired up by default; a deployment with live
    // Modbus hardware supplies `Sensor` implementations here, backed by a
    // `ports::SensorBus` the host process owns.
    let sensors = Vec::new();

    let ripple = Ripple::new(config, actuator, scheduler, file_store, clock, audit, sensors, paths);

    tracing::trace!("booting controller");
    ripple.boot();

    tracing::info!("entering main loop");
    while running.load(Ordering::SeqCst) {
        ripple.tick();
        thread::sleep(MAIN_LOOP_SLEEP);
    }

    tracing::info!("Got Ctrl-C, exiting...");
}
