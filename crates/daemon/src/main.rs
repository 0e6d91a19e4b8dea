//! jobwatch - Main Entry Point
//! Watches a pending folder and supervises one worker per descriptor

mod config;
mod console;
mod logging;

use anyhow::{Context, Result};
use clap::Parser;
use config::Args;
use console::{Console, ConsoleExit};
use directories::BaseDirs;
use jobwatch_core::application::{Supervisor, WatchController};
use jobwatch_core::port::time_provider::SystemTimeProvider;
use jobwatch_infra_system::{FsDescriptorStore, ManifestProbe};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> Result<()> {
    // 1. Configuration and logging
    let args = Args::parse();
    let _log_guard = logging::init(args.log_dir().as_deref())?;

    info!("jobwatch v{} starting...", jobwatch_core::VERSION);

    // 2. Adapters (DI wiring)
    let backend_kind = args.backend_kind();
    let backend = backend_kind.build();
    let store = Arc::new(FsDescriptorStore::new());
    let time_provider = Arc::new(SystemTimeProvider);

    let supervisor = Supervisor::new(
        args.supervisor_config(),
        args.worker_command()?,
        backend,
        store.clone(),
        time_provider,
    )
    .context("Invalid supervisor configuration")?;

    let watcher_config = args.watcher_config();
    info!(
        watch_dir = %watcher_config.dir.display(),
        worker = %args.worker,
        backend = %backend_kind,
        capacity = args.capacity,
        auto_process = supervisor.auto_process(),
        "Configuration loaded"
    );

    // 3. Startup diagnostic, never fatal
    match BaseDirs::new() {
        Some(dirs) => {
            ManifestProbe::new(dirs.home_dir(), args.manifest_host.as_str()).report();
        }
        None => warn!("No home directory; skipping browser manifest check"),
    }

    // 4. Watcher
    let watch = Arc::new(WatchController::new(
        supervisor.clone(),
        store,
        watcher_config,
    ));
    if args.paused {
        info!("Watching paused; use `watch start` to begin");
    } else {
        watch.start().await;
    }

    // 5. Console
    tokio::spawn(console::print_events(supervisor.clone()));
    let console = Console::new(supervisor.clone(), Arc::clone(&watch));
    println!("Type `help` for commands");

    tokio::select! {
        exit = console.run() => {
            if exit == ConsoleExit::InputClosed {
                info!("Console input closed. Press Ctrl+C to shutdown");
                tokio::signal::ctrl_c().await?;
            }
        }
        signal = tokio::signal::ctrl_c() => signal?,
    }

    info!("Shutdown requested. Stopping jobs...");

    // 6. Graceful shutdown: no new discoveries, then stop every job
    watch.stop().await;
    match tokio::time::timeout(SHUTDOWN_TIMEOUT, supervisor.stop_all()).await {
        Ok(stopped) => info!(stopped, "All jobs stopped"),
        Err(_) => warn!("Timed out stopping jobs"),
    }

    info!("Shutdown complete.");
    Ok(())
}
