//! Router assembly and server runtime.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    response::Json,
    routing::{get, patch, post},
    Router,
};
use tracing::info;

use crate::error::{BrokerError, BrokerResult};
use crate::handlers;
use crate::registry::ContextRegistry;
use crate::request::RequestWrapper;

/// Invoked after a successful create or attribute update with the entity
/// type, the entity ID and the originating request.
pub type CompletionCallback = Arc<dyn Fn(&str, &str, &RequestWrapper) + Send + Sync>;

/// Shared state handed to every handler.
pub struct AppState {
    pub registry: Arc<ContextRegistry>,
    pub on_entity_created: Option<CompletionCallback>,
    pub on_attributes_updated: Option<CompletionCallback>,
}

impl AppState {
    pub fn new(registry: Arc<ContextRegistry>) -> Self {
        AppState {
            registry,
            on_entity_created: None,
            on_attributes_updated: None,
        }
    }
}

/// Builds the NGSI-LD v1 router.
pub fn broker_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route(
            "/ngsi-ld/v1/entities",
            get(handlers::query_entities).post(handlers::create_entity),
        )
        .route("/ngsi-ld/v1/entities/{entity_id}", get(handlers::retrieve_entity))
        .route(
            "/ngsi-ld/v1/entities/{entity_id}/attrs/",
            patch(handlers::update_entity_attributes),
        )
        .route(
            "/ngsi-ld/v1/csourceRegistration",
            post(handlers::register_context_source),
        )
        .route("/health", get(health_handler))
        .with_state(state)
}

/// Liveness probe.
async fn health_handler() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// Owns the listener and drives the router until shutdown.
pub struct Runtime {
    addr: SocketAddr,
    state: Arc<AppState>,
}

impl Runtime {
    pub fn new(addr: SocketAddr, state: Arc<AppState>) -> Self {
        Runtime { addr, state }
    }

    pub async fn run(self) -> BrokerResult<()> {
        let listener = tokio::net::TcpListener::bind(self.addr)
            .await
            .map_err(|e| BrokerError::internal(format!("failed to bind {}: {e}", self.addr)))?;

        info!(addr = %self.addr, "NGSI-LD context broker listening");

        axum::serve(listener, broker_router(self.state))
            .with_graceful_shutdown(shutdown_signal())
            .await
            .map_err(|e| BrokerError::internal(e.to_string()))
    }
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("shutdown signal received");
}
