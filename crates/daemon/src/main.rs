// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Tunnel Bridge Contributors

// Tunnel Bridge - Daemon
// Bridges a MySQL server behind SSH and a local serial port to HTTP consumers

mod api;
mod controller;
mod database;
mod events;
mod known_hosts;
mod rendezvous;
mod serial;
mod session;
mod stream;

#[cfg(test)]
mod testing;

use std::sync::Arc;

use anyhow::{Context, Result};
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use tunnel_bridge_common::{BridgeConfig, BridgeEvent};

use api::{create_router, AppState};
use controller::BridgeController;
use database::MySqlDatabase;
use events::EventSink;
use serial::TokioSerialBackend;
use session::SshConnector;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tunnel_bridge_daemon=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Tunnel Bridge Daemon starting...");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let config = BridgeConfig::from_env().context("Invalid bridge configuration")?;
    debug!("Configuration: {:?}", config);
    info!("Rendezvous port: {}", config.rendezvous_port);
    info!(
        "Host key policy: {:?} ({})",
        config.host_key_policy,
        config.known_hosts_path.display()
    );

    let events = EventSink::new();
    spawn_event_logger(&events);

    let connector = SshConnector::new(
        config.known_hosts_path.clone(),
        config.host_key_policy,
        config.connect_timeout,
    );
    let controller = BridgeController::new(
        &config,
        Arc::new(connector),
        Arc::new(MySqlDatabase::new()),
        Arc::new(TokioSerialBackend::new()),
        events,
    );

    let (shutdown_tx, _) = tokio::sync::broadcast::channel(1);
    let state = Arc::new(AppState {
        controller: controller.clone(),
        shutdown_tx: shutdown_tx.clone(),
    });
    let app = create_router(state).layer(TraceLayer::new_for_http());

    serve_tcp_http(app, &config.listen_address, controller, shutdown_tx).await?;

    info!("Daemon stopped");
    Ok(())
}

/// Mirror every bridge event into the log
fn spawn_event_logger(events: &EventSink) {
    let mut rx = events.subscribe();
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(BridgeEvent::Data { source, payload }) => {
                    debug!("[{}] data: {:?}", source, payload)
                }
                Ok(BridgeEvent::Error { source, message }) => warn!("[{}] error: {}", source, message),
                Ok(BridgeEvent::Closed { source }) => info!("[{}] closed", source),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!("Event logger skipped {} events", skipped)
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });
}

/// Serve on TCP with plain HTTP (loopback only)
async fn serve_tcp_http(
    app: axum::Router,
    bind_address: &str,
    controller: BridgeController,
    shutdown_tx: tokio::sync::broadcast::Sender<()>,
) -> Result<()> {
    info!("Daemon listening on TCP (HTTP): {}", bind_address);
    info!("HTTP mode has no encryption - the API is bound to loopback only");

    let listener = tokio::net::TcpListener::bind(bind_address)
        .await
        .context(format!("Failed to bind to {}", bind_address))?;

    info!("Daemon started successfully");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(controller, shutdown_tx))
        .await
        .context("TCP HTTP server error")?;

    Ok(())
}

/// Graceful shutdown signal handler
async fn shutdown_signal(
    controller: BridgeController,
    shutdown_tx: tokio::sync::broadcast::Sender<()>,
) {
    wait_for_shutdown().await;
    controller.shutdown().await;
    info!("Tunnel and serial port released");
    // Signal all SSE streams to close
    let _ = shutdown_tx.send(());
}

/// Wait for Ctrl+C or SIGTERM
async fn wait_for_shutdown() {
    #[cfg(unix)]
    {
        let sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate());
        match sigterm {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {
                        info!("Received Ctrl+C, shutting down");
                    }
                    _ = sigterm.recv() => {
                        info!("Received SIGTERM, shutting down");
                    }
                };
                return;
            }
            Err(e) => warn!("Failed to install SIGTERM handler: {}", e),
        }
    }

    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Received Ctrl+C, shutting down"),
        Err(e) => {
            warn!("Failed to listen for Ctrl+C, running until killed: {}", e);
            std::future::pending::<()>().await;
        }
    }
}
