#![forbid(unsafe_code)]

use anyhow::Result;
use clap::Parser;
use rdvs::config::{Args, ServerConfig};
use rdvs::{http, run_with_shutdown, ServerState};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let config: ServerConfig = Args::parse().into();

    // Validate configuration before starting
    if let Err(e) = config.validate() {
        anyhow::bail!("configuration error: {}", e);
    }

    let state = Arc::new(ServerState::new(config.clone())?);
    if !config.rooms.is_empty() {
        info!(rooms = ?config.rooms, "reserved rooms");
    }

    let listener = TcpListener::bind(config.listen).await?;
    info!("bound to {}", config.listen);

    tokio::spawn({
        let state = state.clone();
        async move {
            if let Err(e) = http::serve(config.http_addr, state).await {
                warn!("http server error: {}", e);
            }
        }
    });

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        shutdown_signal().await;
        let _ = shutdown_tx.send(true);
    });

    run_with_shutdown(listener, state, shutdown_rx).await?;
    Ok(())
}

/// Resolves on ctrl-c, or SIGTERM on unix.
async fn shutdown_signal() {
    let ctrl_c = async {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("received SIGINT"),
            Err(e) => {
                warn!("failed to listen for ctrl-c: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
                info!("received SIGTERM");
            }
            Err(e) => {
                warn!("failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}
