// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Shadowlink Contributors

// Shadowlink - Daemon
// Core service driving the proxy client connection

mod api;
mod bridge;
mod client;
mod clipboard;
mod config;
mod pidfile;
mod qr;
mod service;
mod tunnel;

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::broadcast;
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use api::{create_router, AppState};
use client::ClientManager;
use clipboard::ArboardClipboard;
use config::DaemonConfig;
use pidfile::PidFile;
use qr::SvgQrRenderer;
use service::MainService;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "shadowlink_daemon=info,shadowlink_common=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = DaemonConfig::load().context("failed to load the daemon configuration")?;
    config.validate()?;

    let _pid_file = PidFile::acquire(config.pid_file_path()?)?;

    let manager = Arc::new(ClientManager::new());
    spawn_event_logger(&manager);

    let service = Arc::new(MainService::new(
        manager.clone(),
        Arc::new(ArboardClipboard),
        Arc::new(SvgQrRenderer),
    ));
    let router = create_router(AppState {
        manager: manager.clone(),
        service,
    });

    let listener = tokio::net::TcpListener::bind(&config.bind_address)
        .await
        .with_context(|| format!("failed to bind {}", config.bind_address))?;
    info!(address = %config.bind_address, "daemon listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(wait_for_shutdown())
        .await
        .context("API server failed")?;

    // Wind the active client down before the runtime goes away.
    if let Err(err) = manager.stop().await {
        warn!(%err, "failed to stop the client during shutdown");
    }
    info!("daemon stopped");
    Ok(())
}

fn spawn_event_logger(manager: &Arc<ClientManager>) {
    let mut events = manager.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => info!(?event, "client event"),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "event logger lagged behind");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });
}

async fn wait_for_shutdown() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!(%err, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                warn!(%err, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    info!("shutdown signal received");
}
