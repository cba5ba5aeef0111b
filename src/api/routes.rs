//! HTTP route assembly and service wiring.

use std::sync::Arc;

use axum::{
    routing::{delete, get, post},
    Router,
};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use super::{health, profiles, proxies};
use crate::config::Config;
use crate::connections::ConnectionStore;
use crate::cooldowns::CooldownStore;
use crate::dispatcher::Dispatcher;
use crate::ingest::IngestClient;
use crate::queue::QueueStore;
use crate::scheduler::Scheduler;
use crate::validator::Validator;

/// Shared application state.
pub struct AppState {
    /// Outbound connection registry
    pub registry: Arc<ConnectionStore>,
    /// Cooldown matrix
    pub cooldowns: Arc<CooldownStore>,
    /// Durable profile queue
    pub queue: Arc<QueueStore>,
    /// Check scheduler (for health introspection)
    pub scheduler: Arc<Scheduler>,
}

/// Start the HTTP server and the scheduler loops.
pub async fn serve(config: Config) -> anyhow::Result<()> {
    let registry = Arc::new(ConnectionStore::new(config.proxies_path()).await);
    let snapshot = registry.list().await;
    let cooldowns = Arc::new(
        CooldownStore::new(
            config.cooldowns_path(),
            config.backoff_sequence.clone(),
            config.cooldowns.clone(),
            snapshot,
        )
        .await,
    );
    let queue = Arc::new(QueueStore::new(config.queue_path()));
    let dispatcher = Arc::new(Dispatcher::new(
        Arc::clone(&registry),
        Arc::clone(&cooldowns),
        config.request_gap,
    ));
    let validator = Arc::new(Validator::new(dispatcher, &config));
    let ingest = Arc::new(IngestClient::new(
        config.ingest_api_url.clone(),
        config.ingest_api_key.clone(),
    ));
    let scheduler = Arc::new(Scheduler::new(
        Arc::clone(&queue),
        Arc::clone(&cooldowns),
        validator,
        ingest,
        &config,
    ));

    // Deferred checks are persisted as queue statuses; rebuild the
    // in-memory set before the loops start.
    scheduler.seed_deferred().await;

    tokio::spawn(Arc::clone(&scheduler).run_main_loop());
    tokio::spawn(Arc::clone(&scheduler).run_reactivation_loop());

    let state = Arc::new(AppState {
        registry,
        cooldowns,
        queue,
        scheduler,
    });

    let app = Router::new()
        .route("/health", get(health::liveness))
        .route("/health/cooldowns", get(health::cooldowns))
        .route("/profiles", post(profiles::enqueue))
        .route("/profiles/queue", get(profiles::queue_snapshot))
        .route("/profiles/:steam_id", delete(profiles::remove))
        .route(
            "/proxies",
            get(proxies::list).post(proxies::add).delete(proxies::remove),
        )
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state);

    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| anyhow::anyhow!("failed to bind {addr}: {e}"))?;
    tracing::info!("Listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

/// Resolves on SIGINT. The in-flight dispatch finishes (bounded by its own
/// timeout) before the process exits.
async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to install shutdown handler");
        return;
    }
    tracing::info!("Shutdown signal received, draining");
}
