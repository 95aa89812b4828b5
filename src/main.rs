//! CLI entry point: loads configuration, restores on-disk sets, and runs the
//! vacuum, background sweeps, and TCP server until a shutdown signal arrives.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use clap::Parser;
use hlld::config::GlobalConfig;
use hlld::error::HlldError;
use hlld::manager::SetManager;
use hlld::{server, workers};
use log::{error, info};
use nix::sys::signal::{self, SigHandler, Signal};

/// hlld: a networked HyperLogLog sketch server.
#[derive(Parser, Debug)]
#[command(version, about = "Networked server exposing named HyperLogLog sketches")]
struct Args {
    /// Path to the INI configuration file.
    #[arg(short = 'f', long = "config")]
    config: PathBuf,
    /// Override the configured number of connection-handler worker threads.
    #[arg(short = 'w', long = "workers")]
    workers: Option<usize>,
}

const SHUTDOWN_POLL_INTERVAL: Duration = Duration::from_millis(200);

static SHUTDOWN_REQUESTED: AtomicBool = AtomicBool::new(false);

extern "C" fn request_shutdown(_signal: i32) {
    SHUTDOWN_REQUESTED.store(true, Ordering::Release);
}

// Flush-sweep and cold-sweep register as checkpoint "clients" under fixed
// high IDs, well out of range of the per-connection counter in `server.rs`
// (which starts at 1 and counts up), so the two id spaces never collide.
const FLUSH_SWEEP_CLIENT_ID: u64 = u64::MAX - 1;
const COLD_SWEEP_CLIENT_ID: u64 = u64::MAX - 2;

fn main() -> ExitCode {
    let args = Args::parse();

    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("hlld: {err}");
            ExitCode::FAILURE
        }
    }
}

fn run(args: Args) -> Result<(), HlldError> {
    let mut cfg = GlobalConfig::load_from_file(&args.config)?;
    if let Some(workers) = args.workers {
        cfg.workers = workers;
    }

    env_logger::Builder::new()
        .filter_level(cfg.log_level_filter())
        .init();

    info!("starting hlld, data_dir={}", cfg.data_dir);
    let manager = Arc::new(SetManager::new(cfg));
    manager.list_restore()?;

    // SAFETY: installs a process-wide signal handler before any other
    // thread is spawned; the handler only performs an atomic store.
    unsafe {
        signal::signal(Signal::SIGINT, SigHandler::Handler(request_shutdown))
            .map_err(|errno| HlldError::Io(std::io::Error::from(errno)))?;
        signal::signal(Signal::SIGTERM, SigHandler::Handler(request_shutdown))
            .map_err(|errno| HlldError::Io(std::io::Error::from(errno)))?;
    }

    let vacuum_manager = manager.clone();
    let vacuum_handle = thread::Builder::new()
        .name("hlld-vacuum".to_string())
        .spawn(move || vacuum_manager.run_vacuum())
        .expect("failed to spawn vacuum thread");

    let flush_manager = manager.clone();
    let flush_interval = manager.config().flush_interval;
    let flush_handle = thread::Builder::new()
        .name("hlld-flush-sweep".to_string())
        .spawn(move || workers::run_flush_sweep(&flush_manager, FLUSH_SWEEP_CLIENT_ID, flush_interval))
        .expect("failed to spawn flush sweep thread");

    let cold_manager = manager.clone();
    let cold_interval = manager.config().cold_interval;
    let cold_handle = thread::Builder::new()
        .name("hlld-cold-sweep".to_string())
        .spawn(move || workers::run_cold_sweep(&cold_manager, COLD_SWEEP_CLIENT_ID, cold_interval))
        .expect("failed to spawn cold sweep thread");

    let bind_address = manager.config().bind_address.clone();
    let tcp_port = manager.config().tcp_port;
    let server_workers = manager.config().workers;
    let server = server::run(manager.clone(), &bind_address, tcp_port, server_workers).map_err(|source| {
        HlldError::Bind {
            addr: format!("{bind_address}:{tcp_port}"),
            source,
        }
    })?;

    while !SHUTDOWN_REQUESTED.load(Ordering::Acquire) {
        thread::sleep(SHUTDOWN_POLL_INTERVAL);
    }
    info!("shutdown requested, draining connections and background workers");
    manager.stop();

    server.join();
    if let Err(err) = vacuum_handle.join() {
        error!("vacuum thread panicked: {err:?}");
    }
    if let Err(err) = flush_handle.join() {
        error!("flush sweep thread panicked: {err:?}");
    }
    if let Err(err) = cold_handle.join() {
        error!("cold sweep thread panicked: {err:?}");
    }

    info!("hlld stopped cleanly");
    Ok(())
}
