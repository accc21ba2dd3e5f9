//! Voice relay server binary.
//!
//! Starts an axum HTTP/WebSocket server with structured logging, database
//! initialization, provider wiring, and graceful shutdown on SIGTERM/SIGINT.

use relay_server::config::{self, Config};
use relay_server::session::SessionSettings;
use relay_server::{app, seed_agents, AppState, Providers};
use relay_voice::{ChatCompletionsGenerator, DeepgramSpeech, DeepgramTranscriber};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

fn resolve_config_path() -> (Option<String>, &'static str) {
    if let Some(path) = std::env::args()
        .nth(1)
        .filter(|value| !value.trim().is_empty())
    {
        return (Some(path), "cli-arg");
    }

    if let Ok(path) = std::env::var("RELAY_CONFIG_PATH") {
        if !path.trim().is_empty() {
            return (Some(path), "env-var");
        }
    }

    (None, "default")
}

fn build_providers(config: &Config) -> Providers {
    let deepgram = config.providers.deepgram.clone();
    let openai = config.providers.openai.clone();

    let providers = Providers {
        transcriber: Arc::new(DeepgramTranscriber::new(deepgram.clone())),
        synthesizer: Arc::new(
            DeepgramSpeech::new(deepgram, config.audio.format())
                .expect("failed to build speech synthesis client"),
        ),
        generator: Arc::new(
            ChatCompletionsGenerator::new(openai, config.session.history_limit)
                .expect("failed to build chat completions client"),
        ),
    };

    // Sessions refuse to start without credentials; say so once up front.
    for (name, check) in [
        ("deepgram", providers.transcriber.check_credentials()),
        ("openai", providers.generator.check_credentials()),
    ] {
        if let Err(e) = check {
            tracing::warn!(provider = name, "provider not usable, sessions will be refused: {}", e);
        }
    }

    providers
}

#[tokio::main]
async fn main() {
    let (resolved_config_path, config_source) = resolve_config_path();
    let selected_config_path = resolved_config_path.as_deref().or(Some("config.toml"));

    // Load configuration
    let config = config::load_config(selected_config_path)
        .expect("failed to load configuration; the server cannot start without valid config");

    // Initialize tracing
    let filter =
        EnvFilter::try_new(&config.logging.level).unwrap_or_else(|_| EnvFilter::new("info"));

    if config.logging.json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    tracing::info!(
        source = config_source,
        path = selected_config_path.unwrap_or("<none>"),
        "resolved startup configuration path"
    );

    // Initialize database
    let pool = relay_db::create_pool(
        &config.database.path,
        relay_db::DbRuntimeSettings {
            busy_timeout_ms: config.database.busy_timeout_ms,
            pool_max_size: config.database.pool_max_size,
        },
    )
    .expect("failed to create database pool; check database.path in config");

    {
        let conn = pool
            .get()
            .expect("failed to get database connection for migrations");
        let applied = relay_db::run_migrations(&conn).expect("failed to run database migrations");
        if applied > 0 {
            tracing::info!(count = applied, "applied database migrations");
        }
        let seeded = seed_agents(&conn, &config.agents).expect("failed to seed configured agents");
        if seeded > 0 {
            tracing::info!(count = seeded, "seeded agents from config");
        }
    }

    let providers = build_providers(&config);
    let state = AppState::new(pool, providers, SessionSettings::from_config(&config));

    // Build application
    let app = app(state);
    let addr = SocketAddr::new(config.server.host, config.server.port);

    tracing::info!(%addr, "starting voice relay");

    let listener = TcpListener::bind(addr)
        .await
        .expect("failed to bind to address; is another process using this port?");

    // Serve with graceful shutdown
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .expect("server error");

    tracing::info!("voice relay shut down");
}

/// Waits for a SIGINT (Ctrl+C) or SIGTERM signal for graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => { tracing::info!("received SIGINT, initiating graceful shutdown"); }
        () = terminate => { tracing::info!("received SIGTERM, initiating graceful shutdown"); }
    }
}
