// HTTP handler modules
mod routes_plan;          // Focus window + plant planning APIs
mod routes_tasks;         // Task lifecycle, readings, overdue sweep
mod routes_notifications; // Notification feed APIs

use std::net::SocketAddr;
use std::sync::Arc;

// Import axum routing utilities and Router
use axum::{
    routing::{delete, get, post},
    Router,
};
use anyhow::Context;
use grow_scheduler::clock::SystemClock;
use grow_scheduler::config::EngineConfig;
use grow_scheduler::sink::LogSink;
use grow_scheduler::store::JsonStore;
use grow_scheduler::{Collaborators, Engine};
use tower_http::trace::TraceLayer;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = EngineConfig::from_env().context("loading config")?;
    let profiles = config.load_profiles().context("loading growth profiles")?;
    let addr: SocketAddr = config
        .bind_addr
        .parse()
        .with_context(|| format!("invalid bind address {}", config.bind_addr))?;

    let store = Arc::new(JsonStore::new(config.db_path.clone()));
    let clock = Arc::new(SystemClock);
    let sink = Arc::new(LogSink::new(clock.clone()));
    let parts = Collaborators::json(store, sink, clock);
    let engine = Arc::new(Engine::new(config, profiles, parts));
    engine.start();

    let api = Router::new()
        // focus window / planning
        .route("/focus", get(routes_plan::get_focus).post(routes_plan::update_focus))
        .route("/plants/:id/schedule", post(routes_plan::schedule_plant))
        // tasks
        .route("/tasks/:id/complete", post(routes_tasks::complete_task))
        .route("/tasks/:id", delete(routes_tasks::delete_task))
        .route("/readings", post(routes_tasks::record_readings))
        .route("/overdue", post(routes_tasks::process_overdue))
        // notifications
        .route("/notifications", get(routes_notifications::get_notifications))
        .route("/notifications/read-all", post(routes_notifications::mark_all_read))
        .route("/notifications/:id/read", post(routes_notifications::mark_read))
        .route("/deliveries", post(routes_notifications::mark_delivered))
        .with_state(Arc::clone(&engine));

    let app = Router::new()
        .nest("/api", api)
        .layer(TraceLayer::new_for_http());

    info!(%addr, db = %engine.config().db_path.display(), "server running, API base /api");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("bind {addr} failed"))?;

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await
        .context("server error")?;

    engine.stop().await;
    info!("shut down");
    Ok(())
}
