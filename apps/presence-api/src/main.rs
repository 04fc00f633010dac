use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use presence_api::collab::memory::{MemoryChatStore, MemoryDirectory, MemoryPreferences};
use presence_api::config::Config;
use presence_api::gateway::presence::{spawn_sweeper, PresenceMap};
use presence_api::gateway::registry::ConnectionRegistry;
use presence_api::gateway::router::NotificationRouter;
use presence_api::gateway::heartbeat;
use presence_api::AppState;

#[tokio::main]
async fn main() {
    // Load .env file (silently skip if missing; env vars may be set externally)
    let _ = dotenvy::dotenv();

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Arc::new(Config::from_env());

    // In-memory collaborators. Replace with clients for the workspace
    // service once it exposes membership/preference APIs over the network.
    let directory = Arc::new(MemoryDirectory::new());
    let preferences = Arc::new(MemoryPreferences::new());
    let chat = Arc::new(MemoryChatStore::new());

    let registry = Arc::new(ConnectionRegistry::new(config.max_connections));
    let presence = Arc::new(PresenceMap::new());
    let router = Arc::new(NotificationRouter::new(
        registry.clone(),
        directory.clone(),
        preferences.clone(),
        Duration::from_millis(config.replay_retention_ms),
    ));

    heartbeat::spawn(
        registry.clone(),
        presence.clone(),
        router.clone(),
        Duration::from_millis(config.heartbeat_interval_ms),
        Duration::from_millis(config.heartbeat_timeout_ms),
    );
    spawn_sweeper(
        presence.clone(),
        router.clone(),
        preferences.clone(),
        Duration::from_millis(config.presence_sweep_interval_ms),
        Duration::from_millis(config.away_timeout_ms),
        Duration::from_millis(config.afk_timeout_ms),
        Duration::from_millis(config.presence_retention_ms),
    );

    tracing::info!(
        max_connections = config.max_connections,
        heartbeat_interval_ms = config.heartbeat_interval_ms,
        "presence-api configured"
    );

    let state = AppState {
        config: config.clone(),
        registry,
        presence,
        router,
        identity: directory.clone(),
        preferences,
        chat,
    };

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        .merge(presence_api::routes::router())
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    tracing::info!(%addr, "presence-api listening");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .expect("failed to bind");
    axum::serve(listener, app).await.expect("server error");
}
