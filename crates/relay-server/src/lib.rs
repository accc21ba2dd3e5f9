//! Voice relay server library logic.

pub mod api_ws;
pub mod config;
pub mod events;
pub mod registry;
pub mod session;

use axum::{routing::get, Extension, Json, Router};
use registry::ConnectionRegistry;
use relay_db::DbPool;
use relay_store::{upsert_agent, StoreError};
use relay_types::Agent;
use relay_voice::{ResponseGenerator, SpeechSynthesizer, TranscriptionProvider};
use serde_json::{json, Value};
use session::SessionSettings;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// The three external services every session talks to.
#[derive(Clone)]
pub struct Providers {
    pub transcriber: Arc<dyn TranscriptionProvider>,
    pub synthesizer: Arc<dyn SpeechSynthesizer>,
    pub generator: Arc<dyn ResponseGenerator>,
}

/// Application state shared across all request handlers.
#[derive(Clone)]
pub struct AppState {
    /// Database connection pool.
    pub pool: DbPool,
    /// Live sessions by connection id.
    pub registry: ConnectionRegistry,
    pub providers: Providers,
    pub settings: SessionSettings,
}

impl AppState {
    pub fn new(pool: DbPool, providers: Providers, settings: SessionSettings) -> Self {
        Self {
            pool,
            registry: ConnectionRegistry::new(),
            providers,
            settings,
        }
    }
}

/// Upserts configured agents so a fresh database has something to serve.
pub fn seed_agents(conn: &rusqlite::Connection, agents: &[Agent]) -> Result<usize, StoreError> {
    for agent in agents {
        upsert_agent(conn, agent)?;
    }
    Ok(agents.len())
}

/// Health check handler.
async fn health(Extension(state): Extension<Arc<AppState>>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "activeSessions": state.registry.len(),
    }))
}

/// Builds the application router with all routes.
pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/ws", get(api_ws::ws_handler))
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(Extension(Arc::new(state)))
}
