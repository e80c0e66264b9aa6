//! gavat-runtime - standalone execution core process.
//!
//! Loads configuration, starts the coordinator (workers, scheduler and
//! configured endpoints) and runs until Ctrl-C, then shuts down gracefully.

use clap::Parser;
use gavat_core::kernel::Coordinator;
use gavat_core::Config;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Parser)]
#[command(name = "gavat-runtime", version, about = "Gavat task execution core")]
struct Args {
    /// JSON configuration file. Defaults apply when omitted.
    #[arg(short, long, env = "GAVAT_CONFIG")]
    config: Option<PathBuf>,

    /// Override the number of worker loops.
    #[arg(long)]
    workers: Option<usize>,

    /// Seconds between status log lines (0 disables).
    #[arg(long, default_value_t = 60)]
    status_interval: u64,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Load configuration
    let mut config = match &args.config {
        Some(path) => Config::from_file(path)?,
        None => Config::default(),
    };
    if let Some(workers) = args.workers {
        config.workers.workers = workers;
    }

    // Initialize observability
    gavat_core::observability::init_tracing_with(&config.observability);

    let coordinator = Arc::new(Coordinator::new(config)?);
    coordinator.start().await?;

    let reporter = (args.status_interval > 0).then(|| {
        let coordinator = coordinator.clone();
        let period = Duration::from_secs(args.status_interval);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let status = coordinator.get_manager_status().await;
                tracing::info!(
                    queued = status.queued,
                    active = status.active,
                    completed = status.completed,
                    failed = status.failed,
                    resource_pressure = status.resource_status.resource_pressure,
                    "runtime_status"
                );
            }
        })
    });

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutdown_requested");

    if let Some(reporter) = reporter {
        reporter.abort();
    }
    coordinator.shutdown().await;
    Ok(())
}
