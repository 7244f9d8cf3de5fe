// [[AXON]]/apps/kernel-server/src/main.rs
// Purpose: Entry point. Wires settings, bus, store, and engine into the router.
// Architecture: Application Boot
// Dependencies: Axum, Tower, Tokio, Redis

mod bus;
mod cancel;
mod config;
mod dag;
mod engine;
mod events;
mod models;
mod providers;
mod server;
mod store;

use axum::{
    http::Method,
    routing::{get, post},
    Router,
};
use redis::aio::ConnectionManager;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::bus::{EventBus, MemoryBus, RedisBus};
use crate::cancel::CancellationRegistry;
use crate::config::Settings;
use crate::engine::ExecutionEngine;
use crate::providers::registry::ProviderRegistry;
use crate::server::handlers;
use crate::store::ExecutionStore;

/// Connect the bus and the store checkpointer. Redis being down is a
/// degraded mode, not a boot failure.
async fn connect_redis(settings: &Settings) -> (Arc<dyn EventBus>, Option<ConnectionManager>) {
    let Some(url) = &settings.redis_url else {
        tracing::warn!("REDIS_URL not set, using in-memory bus without checkpointing");
        return (Arc::new(MemoryBus::new()), None);
    };

    let client = match redis::Client::open(url.as_str()) {
        Ok(client) => client,
        Err(e) => {
            tracing::warn!("invalid REDIS_URL ({}), using in-memory bus", e);
            return (Arc::new(MemoryBus::new()), None);
        }
    };

    match RedisBus::connect(client.clone()).await {
        Ok(bus) => {
            // The store gets its own connection; run tasks and streaming
            // connections never share one.
            let manager = ConnectionManager::new(client).await.ok();
            tracing::info!("redis connected, checkpointing enabled");
            (Arc::new(bus), manager)
        }
        Err(e) => {
            tracing::warn!("redis unreachable ({}), using in-memory bus", e);
            (Arc::new(MemoryBus::new()), None)
        }
    }
}

#[tokio::main]
async fn main() {
    let settings = Settings::from_env();

    let crate_level = if settings.debug {
        "axon_kernel=debug"
    } else {
        "axon_kernel=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(crate_level.parse().unwrap())
                .add_directive("tower_http=info".parse().unwrap()),
        )
        .init();

    tracing::info!("initializing Axon kernel: {}", settings.summary());

    let (bus, redis_manager) = connect_redis(&settings).await;

    let engine = Arc::new(ExecutionEngine::new(
        Arc::new(ExecutionStore::new(redis_manager)),
        bus,
        ProviderRegistry::with_defaults(),
        Arc::new(CancellationRegistry::new()),
        settings.clone(),
    ));

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::DELETE])
        .allow_headers(Any);

    let app = Router::new()
        .route("/health", get(handlers::health))
        .route(
            "/api/v1/workflows",
            post(handlers::create_workflow).get(handlers::list_workflows),
        )
        .route(
            "/api/v1/workflows/:workflow_id",
            get(handlers::get_workflow).delete(handlers::delete_workflow),
        )
        .route(
            "/api/v1/workflows/:workflow_id/execute",
            post(handlers::start_execution),
        )
        .route(
            "/api/v1/executions/:execution_id",
            get(handlers::get_execution),
        )
        .route(
            "/api/v1/executions/:execution_id/agents",
            get(handlers::list_agent_runs),
        )
        .route(
            "/api/v1/executions/:execution_id/cancel",
            post(handlers::cancel_execution),
        )
        .route(
            "/ws/executions/:execution_id",
            get(handlers::ws_execution_stream),
        )
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(engine);

    let addr = format!("0.0.0.0:{}", settings.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .expect("Failed to bind to port");

    tracing::info!("Axon kernel server listening on http://{}", addr);

    axum::serve(listener, app).await.expect("Server error");
}
