//! hourvaultd - UDP log collector writing hourly SQLite files

mod cli;

use anyhow::Context;
use clap::Parser;
use cli::{Args, LogFormat};
use hourvault_core::daemon::Daemon;
use hourvault_core::{SystemClock, VERSION};
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging(args.verbose, args.log_format);

    info!(version = VERSION, "Starting hourvaultd");

    let config = args.into_config();
    info!(config = %serde_json::to_string(&config)?, "Configuration loaded");

    let daemon = match Daemon::start(config, Arc::new(SystemClock)) {
        Ok(daemon) => daemon,
        Err(e) => {
            error!(error = %e, fatal = e.is_fatal_at_startup(), "Failed to start pipeline");
            return Err(e).context("startup failed");
        }
    };
    info!(addr = %daemon.local_addr(), "hourvaultd ready");

    shutdown_signal().await;

    let report = daemon.shutdown().await.context("shutdown failed")?;
    info!(report = %serde_json::to_string(&report)?, "hourvaultd stopped");

    Ok(())
}

fn init_logging(verbose: bool, format: LogFormat) {
    let level = if verbose { LevelFilter::DEBUG } else { LevelFilter::INFO };
    let filter = EnvFilter::builder()
        .with_default_directive(level.into())
        .from_env_lossy();

    let builder = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_names(true);

    match format {
        LogFormat::Pretty => builder.pretty().init(),
        LogFormat::Compact => builder.compact().init(),
        LogFormat::Json => builder.json().init(),
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for SIGINT");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT"),
        _ = terminate => info!("Received SIGTERM"),
    }
}
