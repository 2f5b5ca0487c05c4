//! CLI entry point for the Library Optimizer
//!
//! Parses command line arguments, loads the configuration and runs the
//! optimizer until SIGINT or SIGTERM.

use clap::Parser;
use library_optimizer::{Config, Optimizer};
use std::path::PathBuf;
use std::process::ExitCode;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Library Optimizer - Dolby Vision Profile 7 to 8 conversion and hardware re-encoding
#[derive(Parser, Debug)]
#[command(name = "library-optimizer")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file (config.toml); created with defaults if missing
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    /// Start the first pass immediately instead of waiting for the start hour
    #[arg(long)]
    force_start: bool,

    /// Run a single pass over every file and exit
    #[arg(long)]
    once: bool,

    /// Skip startup checks (ffmpeg, dovi_tool, mkvmerge). For testing only.
    #[arg(long)]
    skip_checks: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "library_optimizer=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    info!("Config file: {}", args.config.display());

    let mut config = match Config::load_or_init(&args.config) {
        Ok((config, created)) => {
            if created {
                info!("Wrote default configuration to {}", args.config.display());
            }
            config
        }
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            return ExitCode::FAILURE;
        }
    };
    config.schedule.force_start |= args.force_start;

    let cancel = CancellationToken::new();
    let optimizer = if args.skip_checks {
        warn!("Skipping startup checks (--skip-checks enabled)");
        Optimizer::new_without_checks(config, cancel.clone())
    } else {
        match Optimizer::new(config, cancel.clone()) {
            Ok(optimizer) => optimizer,
            Err(e) => {
                error!("Failed to initialize: {}", e);
                return ExitCode::FAILURE;
            }
        }
    };

    tokio::spawn(async move {
        shutdown_signal().await;
        info!("Shutdown requested, stopping");
        cancel.cancel();
    });

    let result = if args.once {
        optimizer.run_once().await.map(|stats| {
            info!(
                "Pass complete: {} converted, {} failed, {} skipped",
                stats.converted,
                stats.failed,
                stats.skipped()
            );
        })
    } else {
        optimizer.run().await
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) if e.is_cancelled() => {
            info!("Stopped");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("Optimizer error: {}", e);
            ExitCode::FAILURE
        }
    }
}

/// Wait for Ctrl+C or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
