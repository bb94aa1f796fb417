// SPDX-License-Identifier: Apache-2.0

//! `urm` — the resource tuner daemon.
//!
//! Startup order: CLI parsing, config load, logging, safe-state restore,
//! core construction, then the worker threads (timer wheel, dispatcher,
//! listener) and the periodic daemons. The main thread parks in a signal
//! loop: SIGINT/SIGTERM shut the daemon down cleanly, SIGUSR1/SIGUSR2 stand
//! in for the platform display notifier and drive the mode controller.

use clap::{CommandFactory, Parser};
use restune_common::Mode;
use restune_config::{ConfigPaths, ConfigSet};
use restune_engine::core::PERSISTENCE_FILE;
use restune_engine::timers::TimerWheel;
use restune_engine::{Core, CoreBuilder};
use restune_server::spawn_listener;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tokio::signal::unix::{SignalKind, signal};
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

/// PID file guarding against a second instance.
const PID_FILE: &str = "/run/resource-tuner/urm.pid";

#[derive(Parser, Debug)]
#[command(name = "urm", version, about = "Resource tuner server")]
struct Cli {
    /// Start the resource tuner server.
    #[arg(long)]
    start: bool,

    /// Read config files from this directory instead of /etc/resource-tuner.
    #[arg(long, value_name = "DIR")]
    config_dir: Option<PathBuf>,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    if !cli.start {
        let _ = Cli::command().print_help();
        return ExitCode::SUCCESS;
    }
    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(details) => {
            error!(%details, "resource tuner failed to start");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: &Cli) -> Result<(), String> {
    let paths = match &cli.config_dir {
        Some(dir) => ConfigPaths::rooted_at(dir),
        None => ConfigPaths::installed(),
    };
    let config = match ConfigSet::load(&paths) {
        Ok(config) => config,
        Err(err) => {
            init_tracing("info");
            return Err(format!("config load failed: {err}"));
        }
    };

    let level = config
        .properties
        .tuner_settings()
        .map(|s| s.log_level.as_filter())
        .unwrap_or("info");
    init_tracing(level);
    info!(pid = std::process::id(), "resource tuner starting");

    acquire_pid_file(Path::new(PID_FILE))?;

    // A previous crash may have left nodes dirty; put them back first.
    restune_engine::core::restore_safe_state_from(Path::new(PERSISTENCE_FILE));

    let (wheel, wheel_join) = TimerWheel::spawn();
    let core = CoreBuilder::new(config)
        .build(wheel.clone())
        .map_err(|err| format!("core init failed: {err}"))?;
    let core = Arc::new(core);
    dump_resource_table(&core);

    let _daemons = core.start_daemons();
    let dispatcher_join = core.spawn_dispatcher();
    let listener = spawn_listener(core.clone(), core.settings.socket_path.clone())
        .map_err(|err| format!("listener init failed: {err}"))?;

    wait_for_signals(&core).map_err(|err| format!("signal loop failed: {err}"))?;

    info!("shutting down");
    core.request_shutdown();
    if let Err(err) = listener.shutdown_and_join() {
        error!(%err, "listener shutdown failed");
    }
    if dispatcher_join.join().is_err() {
        error!("dispatcher thread panicked");
    }
    wheel.shutdown();
    if wheel_join.join().is_err() {
        error!("timer thread panicked");
    }

    // Leave every node the daemon ever touched at its default.
    core.restore_all_defaults();
    let _ = std::fs::remove_file(PID_FILE);
    info!("shutdown complete");
    Ok(())
}

fn init_tracing(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// Refuses to start when another instance holds the pid file and is alive.
/// A stale file from a crashed run is taken over.
fn acquire_pid_file(path: &Path) -> Result<(), String> {
    if let Some(parent) = path.parent() {
        let _ = std::fs::create_dir_all(parent);
    }
    if let Ok(existing) = std::fs::read_to_string(path) {
        if let Ok(pid) = existing.trim().parse::<u32>() {
            if Path::new(&format!("/proc/{pid}")).exists() {
                return Err(format!("another instance is running with pid {pid}"));
            }
        }
    }
    std::fs::write(path, std::process::id().to_string())
        .map_err(|err| format!("could not write pid file {}: {err}", path.display()))
}

fn dump_resource_table(core: &Core) {
    for config in core.resources.catalog_entries() {
        debug!(
            opcode = %config.opcode,
            name = %config.name,
            policy = ?config.policy,
            scope = ?config.apply_scope,
            supported = config.supported,
            "registered resource"
        );
    }
}

/// Parks until SIGINT/SIGTERM. SIGUSR1 enters suspend, SIGUSR2 resume.
fn wait_for_signals(core: &Arc<Core>) -> Result<(), std::io::Error> {
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    let modes = core.mode_controller();
    rt.block_on(async move {
        let mut term = signal(SignalKind::terminate())?;
        let mut usr1 = signal(SignalKind::user_defined1())?;
        let mut usr2 = signal(SignalKind::user_defined2())?;
        loop {
            tokio::select! {
                result = tokio::signal::ctrl_c() => {
                    result?;
                    return Ok(());
                }
                _ = term.recv() => return Ok(()),
                _ = usr1.recv() => modes.enter_sleep(Mode::SUSPEND),
                _ = usr2.recv() => modes.enter_resume(),
            }
        }
    })
}
