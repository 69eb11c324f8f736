//! Shot engine runner.
//!
//! Drives a batch of shot files through the full pipeline against simulated
//! device workers, then shuts everything down. Hardware deployments replace
//! the simulated workers with real drivers behind the same worker method
//! surface.

use clap::Parser;
use shot_engine::callbacks::CallbackRegistry;
use shot_engine::config::Settings;
use shot_engine::controller::{Device, DeviceController, SharedState};
use shot_engine::pipeline::ShotPipeline;
use shot_engine::shot::Shot;
use shot_engine::sim::SimWorker;
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{info, warn};

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[derive(Parser)]
#[command(name = "shot_engine", about = "Buffered-shot orchestration engine")]
struct Cli {
    /// Optional TOML configuration file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Device whose run trigger times the whole shot. Defaults to the first
    /// device of the first shot.
    #[arg(long)]
    timing_master: Option<String>,

    /// Shot files to execute, in order.
    #[arg(required = true)]
    shots: Vec<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let cli = Cli::parse();
    let settings = Settings::load_from(cli.config.as_deref())?;

    // One controller per device named by any of the shots.
    let mut device_names = BTreeSet::new();
    let mut first_device = None;
    for path in &cli.shots {
        for name in Shot::new(path).device_list()? {
            first_device.get_or_insert_with(|| name.clone());
            device_names.insert(name);
        }
    }
    let timing_master = match cli.timing_master.or(first_device) {
        Some(name) => name,
        None => anyhow::bail!("no devices found in the given shots"),
    };
    info!(devices = device_names.len(), %timing_master, "starting shot engine");

    let shared = SharedState::new();
    let (event_tx, event_rx) = mpsc::channel(settings.pipeline.event_channel_capacity);
    let mut controllers = Vec::new();
    for name in &device_names {
        let controller = DeviceController::spawn(
            name.clone(),
            Box::new(SimWorker::new(name)),
            shared.clone(),
            event_tx.clone(),
            settings.worker.clone(),
        )?;
        controllers.push(Arc::new(controller));
    }

    let devices: Vec<Arc<dyn Device>> = controllers
        .iter()
        .map(|c| Arc::clone(c) as Arc<dyn Device>)
        .collect();
    let (handle, mut analysis_rx) = ShotPipeline::spawn(
        devices,
        timing_master,
        CallbackRegistry::new(),
        settings.pipeline.clone(),
        (event_tx, event_rx),
    )?;

    for path in &cli.shots {
        let queued = handle.submit(Shot::new(path))?;
        info!(shot = %queued.path().display(), "shot queued");
    }

    loop {
        tokio::select! {
            Some(path) = analysis_rx.recv() => {
                info!(shot = %path.display(), "shot ready for analysis");
            }
            _ = tokio::signal::ctrl_c() => {
                info!("interrupt received, shutting down");
                handle.abort();
                break;
            }
            _ = tokio::time::sleep(Duration::from_millis(500)) => {
                let status = handle.status();
                if status.paused {
                    warn!(message = status.last_message.as_deref().unwrap_or(""), "pipeline paused, exiting");
                    break;
                }
                if status.pending == 0 && status.current_shot.is_none() {
                    break;
                }
            }
        }
    }

    handle.shutdown().await;
    for controller in controllers {
        match Arc::try_unwrap(controller) {
            Ok(controller) => controller.shutdown(Duration::from_secs(5)).await,
            Err(controller) => {
                controller.shutdown_workers();
                controller.quit();
            }
        }
    }
    info!("shot engine stopped");
    Ok(())
}
