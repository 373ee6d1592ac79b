mod config;
mod host;
mod minigame;
mod reconcile;
mod registry;
mod scrape;
mod snapshot;
mod telemetry;
mod ws;

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{
    extract::State, http::header, response::IntoResponse, routing::get, Json, Router,
};
use clap::Parser;
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Serialize;
use serde_json::json;
use tokio::{
    signal,
    sync::{mpsc, watch},
};
use tracing::info;

use crate::config::{BridgeConfig, Cli};
use crate::host::{rpc::HostChannel, GameChat, HostEvent};
use crate::reconcile::LastKnownCache;
use crate::registry::SessionRegistry;
use crate::snapshot::Ticker;
use crate::ws::WsState;

#[tokio::main]
async fn main() -> Result<()> {
    let telemetry = telemetry::Telemetry::init()?;

    let cli = Cli::parse();
    let config = BridgeConfig::try_from(cli)?;
    info!(
        listen_addr = %config.listen_addr,
        poll_interval_ms = config.poll_interval.as_millis() as u64,
        "starting earshot bridge"
    );

    run(config, telemetry.metrics_handle()).await
}

struct AppState {
    registry: SessionRegistry,
    cache: LastKnownCache,
    metrics: PrometheusHandle,
}

async fn run(config: BridgeConfig, metrics: PrometheusHandle) -> Result<()> {
    let channel = HostChannel::spawn_stdio(config.console_timeout);
    let host = Arc::clone(&channel.host);

    let cache = LastKnownCache::default();
    let chat: Arc<dyn GameChat> = host.clone();
    let registry = SessionRegistry::new(chat, cache.clone());

    let (stop_tx, stop_rx) = watch::channel(false);
    let relay_chat = config.net.show_chat || config.net.chat_tts;
    let pump = tokio::spawn(pump_host_events(
        channel.events,
        registry.clone(),
        relay_chat,
        stop_tx,
    ));

    let ticker = Ticker {
        console: host.clone(),
        directory: host.clone(),
        registry: registry.clone(),
        cache: cache.clone(),
        poll_interval: config.poll_interval,
    }
    .spawn();

    let ws_state = Arc::new(WsState {
        registry: registry.clone(),
        directory: host.clone(),
        net_config: config.net.clone(),
        handshake_timeout: config.handshake_timeout,
        server_name: config.server_name.clone(),
        host_name: config.host_name.clone(),
    });
    let app_state = Arc::new(AppState {
        registry: registry.clone(),
        cache,
        metrics,
    });

    let http_routes = Router::new()
        .route("/healthz", get(health_handler))
        .route("/debug/stats", get(stats_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(app_state);
    let ws_routes = Router::new()
        .route("/ws", get(ws::ws_handler))
        .with_state(ws_state);
    let router = http_routes.merge(ws_routes);

    let listener = tokio::net::TcpListener::bind(config.listen_addr)
        .await
        .context("failed to bind listener")?;
    info!("earshot bridge listening on {}", config.listen_addr);

    let shutdown = {
        let registry = registry.clone();
        async move {
            shutdown_signal(stop_rx).await;
            info!("shutdown requested, disconnecting voice clients");
            registry.shutdown().await;
        }
    };
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown)
        .await
        .context("server shutdown with error")?;

    ticker.abort();
    pump.abort();
    info!("earshot bridge stopped");
    Ok(())
}

async fn shutdown_signal(mut stop_rx: watch::Receiver<bool>) {
    tokio::select! {
        _ = signal::ctrl_c() => {}
        _ = stop_rx.changed() => {}
    }
}

/// Applies wrapper push events to the session registry as they arrive,
/// interleaved with tick broadcasts.
async fn pump_host_events(
    mut events: mpsc::UnboundedReceiver<HostEvent>,
    registry: SessionRegistry,
    relay_chat: bool,
    stop: watch::Sender<bool>,
) {
    while let Some(event) = events.recv().await {
        match event {
            HostEvent::AuthCommand { player, code } => {
                registry.authenticate(&player, &code).await;
            }
            HostEvent::PlayerLeft(player) => registry.player_left(&player).await,
            HostEvent::Chat { name, message } => {
                if relay_chat {
                    registry.broadcast_chat(name, message).await;
                }
            }
            HostEvent::Stop => break,
        }
    }
    // Stop request or wrapper EOF; either way the bridge winds down.
    let _ = stop.send(true);
}

#[derive(Serialize)]
struct StatsResponse {
    connections: usize,
    authenticated: usize,
    tracked_positions: usize,
}

async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let telemetry = if state.cache.is_empty() { "idle" } else { "active" };
    Json(json!({ "status": "ok", "telemetry": telemetry }))
}

async fn stats_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let stats = state.registry.stats().await;
    Json(StatsResponse {
        connections: stats.connections,
        authenticated: stats.authenticated,
        tracked_positions: state.cache.len(),
    })
}

async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.metrics.render(),
    )
}
