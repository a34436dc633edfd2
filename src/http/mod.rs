//! HTTP surface for the router.
//!
//! A thin axum layer mapping routes onto the core operations: server CRUD
//! and lifecycle, JSON-RPC proxy dispatch, prompt enhancement, and stats.
//! Permissive CORS for local desktop clients.

use axum::extract::{Path, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::enhancement::{EnhancementResult, EnhancementService};
use crate::error::{Error, Result};
use crate::proxy::Dispatcher;
use crate::registry::{ServerConfig, ServerRegistry, ServerState};
use crate::resilience::CircuitBreakerRegistry;
use crate::supervisor::{StatusSummary, Supervisor};
use crate::types::JsonRpcRequest;

/// Shared application state passed to all handlers.
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<ServerRegistry>,
    pub supervisor: Arc<Supervisor>,
    pub dispatcher: Arc<Dispatcher>,
    pub breakers: Arc<CircuitBreakerRegistry>,
    pub enhancement: Arc<EnhancementService>,
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/status", get(status))
        .route("/servers", get(list_servers).post(add_server))
        .route("/servers/:name", get(get_server).delete(remove_server))
        .route("/servers/:name/start", post(start_server))
        .route("/servers/:name/stop", post(stop_server))
        .route("/servers/:name/restart", post(restart_server))
        .route("/mcp/:server", post(dispatch))
        .route("/enhance", post(enhance))
        .route("/stats", get(stats))
        .route("/circuit-breakers/:name/reset", post(reset_breaker))
        .route("/cache/clear", post(clear_cache))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive()),
        )
        .with_state(state)
}

/// Bind and serve until ctrl-c.
pub async fn serve(state: AppState, host: &str, port: u16) -> Result<()> {
    let router = build_router(state);

    let addr: SocketAddr = format!("{}:{}", host, port)
        .parse()
        .map_err(|e| Error::Config(format!("Invalid address: {}", e)))?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| Error::Server(format!("Failed to bind: {}", e)))?;

    info!("Server listening on {}", addr);

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|e| Error::Server(format!("Server error: {}", e)))
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("Shutting down gracefully...");
}

async fn health(State(state): State<AppState>) -> Json<Value> {
    let summary = state.supervisor.get_status_summary();
    Json(json!({"status": "ok", "servers": summary}))
}

async fn status(State(state): State<AppState>) -> Json<StatusSummary> {
    Json(state.supervisor.get_status_summary())
}

async fn list_servers(State(state): State<AppState>) -> Json<Vec<ServerState>> {
    Json(state.registry.list_all())
}

async fn add_server(
    State(state): State<AppState>,
    Json(config): Json<ServerConfig>,
) -> Result<Json<Value>> {
    if config.name.is_empty() {
        return Err(Error::Config("Server name is required".to_string()));
    }

    let name = config.name.clone();
    state.registry.add(config)?;
    Ok(Json(json!({"status": "added", "name": name})))
}

async fn get_server(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<ServerState>> {
    state
        .registry
        .get_state(&name)
        .map(Json)
        .ok_or(Error::ServerNotFound(name))
}

async fn remove_server(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<Value>> {
    state.registry.remove(&name)?;
    Ok(Json(json!({"status": "removed", "name": name})))
}

async fn start_server(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<Value>> {
    state.supervisor.start_server(&name).await?;
    Ok(Json(json!({"status": "started", "name": name})))
}

async fn stop_server(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<Value>> {
    state.supervisor.stop_server(&name).await?;
    Ok(Json(json!({"status": "stopped", "name": name})))
}

async fn restart_server(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<Value>> {
    state.supervisor.restart_server(&name).await?;
    Ok(Json(json!({"status": "restarted", "name": name})))
}

async fn dispatch(
    State(state): State<AppState>,
    Path(server): Path<String>,
    Json(request): Json<JsonRpcRequest>,
) -> Result<Json<Value>> {
    let response = state.dispatcher.dispatch(&server, request).await?;
    Ok(Json(response))
}

#[derive(Deserialize)]
struct EnhanceRequest {
    prompt: String,
    client_name: Option<String>,
    #[serde(default)]
    bypass_cache: bool,
}

async fn enhance(
    State(state): State<AppState>,
    Json(request): Json<EnhanceRequest>,
) -> Json<EnhancementResult> {
    Json(
        state
            .enhancement
            .enhance(
                &request.prompt,
                request.client_name.as_deref(),
                request.bypass_cache,
            )
            .await,
    )
}

async fn stats(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "enhancement": state.enhancement.get_stats().await,
        "circuit_breakers": state.breakers.all_stats(),
    }))
}

async fn reset_breaker(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<Value>> {
    let reset = if name == "llm" {
        state.enhancement.reset_circuit_breaker();
        true
    } else {
        state.breakers.reset(&name)
    };

    if reset {
        Ok(Json(json!({"status": "reset", "name": name})))
    } else {
        Err(Error::ServerNotFound(name))
    }
}

async fn clear_cache(State(state): State<AppState>) -> Json<Value> {
    state.enhancement.clear_cache().await;
    Json(json!({"status": "cleared"}))
}
