//! # beaconsync
//!
//! Beacon relay daemon.
//!
//! Runs the scan/relay scheduler and serves the local control API.
//!
//! ## Running
//!
//! ```bash
//! # Development, with the simulated radio
//! cargo run -p beaconsync-server --features mock-bluetooth
//!
//! # Production
//! beaconsync --config /etc/beaconsync/beaconsync.toml --production
//! ```

#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]

use std::path::PathBuf;

use beaconsync_core::Settings;
use beaconsync_server::backend::RadioBackend;
use beaconsync_server::state::AppState;
use beaconsync_server::{api, logging};
use clap::Parser;
use tokio::net::TcpListener;
use tracing::{error, info, warn};

/// Command line arguments.
#[derive(Debug, Parser)]
#[command(name = "beaconsync", version, about = "Periodic BLE beacon relay")]
struct Args {
    /// Settings file (defaults to the platform config path if it exists).
    #[arg(short, long, env = "BEACONSYNC_CONFIG")]
    config: Option<PathBuf>,

    /// Production logging regardless of the settings file.
    #[arg(long)]
    production: bool,

    /// Print the default settings as TOML and exit.
    #[arg(long)]
    print_default_config: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    if args.print_default_config {
        print!("{}", Settings::default().to_toml()?);
        return Ok(());
    }

    let mut settings = Settings::load(args.config.as_deref())?;
    settings.production |= args.production;

    logging::init(settings.production)?;
    info!(version = env!("CARGO_PKG_VERSION"), "Starting beaconsync");

    let radio = RadioBackend::open().await?;
    let state = AppState::launch(&settings, radio)?;

    if settings.resume_on_start {
        match state.scheduler().resume().await {
            Ok(true) => info!("Relay resumed"),
            Ok(false) => {}
            Err(e) => warn!(error = %e, "Could not resume relay"),
        }
    }

    let app = api::create_router(state.clone());
    let listener = TcpListener::bind(settings.listen_addr).await?;
    info!(addr = %settings.listen_addr, "Listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    if let Err(e) = state.scheduler().shutdown().await {
        error!(error = %e, "Scheduler did not shut down cleanly");
    }
    info!("beaconsync stopped");
    Ok(())
}

/// Resolves on SIGINT or SIGTERM.
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let (Ok(mut sigint), Ok(mut sigterm)) =
            (signal(SignalKind::interrupt()), signal(SignalKind::terminate()))
        else {
            warn!("Could not install signal handlers; falling back to Ctrl+C");
            let _ = tokio::signal::ctrl_c().await;
            return;
        };

        tokio::select! {
            _ = sigint.recv() => info!("Received SIGINT, shutting down"),
            _ = sigterm.recv() => info!("Received SIGTERM, shutting down"),
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        info!("Received Ctrl+C, shutting down");
    }
}
