//! Long-running service: watcher + pipeline + HTTP.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET`  | `/health` | Health check (status, version, live task count) |
//! | `POST` | `<GOOGLE_WEBHOOK_URL path>` | Drive push notifications (`google_drive` only) |
//!
//! The service stops on Ctrl-C, or on its own when the pipeline is cancelled
//! by a fatal cause. In the latter case [`run_service`] returns an error so
//! the process exits non-zero.

use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use axum::{extract::State, routing::get, Json, Router};
use serde::Serialize;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::config::{Config, Secrets};
use crate::db;
use crate::migrate;
use crate::pipeline::{Pipeline, PipelineBuilder, PipelineSettings};
use crate::stage::build_stages;
use crate::store::SqliteStore;
use crate::watcher::{build_watcher, Watcher};

#[derive(Clone)]
struct AppState {
    pipeline: Pipeline,
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    active_tasks: usize,
}

async fn handle_health(State(state): State<AppState>) -> Json<HealthResponse> {
    let status = if state.pipeline.is_cancelled() {
        "stopping"
    } else {
        "ok"
    };
    Json(HealthResponse {
        status,
        version: env!("CARGO_PKG_VERSION"),
        active_tasks: state.pipeline.active_tasks(),
    })
}

/// Health route, the watcher's routes, and request tracing.
pub fn build_router(watcher: &dyn Watcher, pipeline: Pipeline) -> Router {
    let mut app = Router::new()
        .route("/health", get(handle_health))
        .with_state(AppState { pipeline });
    if let Some(routes) = watcher.router() {
        app = app.merge(routes);
    }
    app.layer(TraceLayer::new_for_http())
}

/// Runs the service until interrupted or until the pipeline fails.
pub async fn run_service(config: &Config) -> Result<()> {
    let secrets = Secrets::from_env(config)?;

    let pool = db::connect(config).await?;
    migrate::apply(&pool).await?;
    let store = Arc::new(SqliteStore::new(pool.clone()));

    let watcher = build_watcher(config, &secrets, store.clone())?;
    let stages = build_stages(config, &secrets)?;
    let pipeline = PipelineBuilder::new(
        store,
        watcher.clone(),
        PipelineSettings::from(&config.pipeline),
    )
    .add_stages(stages)
    .build()
    .await?;
    info!(stages = ?pipeline.stage_names(), "pipeline ready");

    let app = build_router(watcher.as_ref(), pipeline.clone());
    let listener = tokio::net::TcpListener::bind(&config.server.bind)
        .await
        .with_context(|| format!("Failed to bind {}", config.server.bind))?;
    info!(bind = %config.server.bind, "listening");

    let served = async {
        let documents = watcher.start_watching().await?;
        pipeline.start_monitoring(documents);

        let stop = pipeline.clone();
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => info!("interrupt received, shutting down"),
                    _ = stop.cancelled() => warn!("pipeline cancelled, shutting down"),
                }
            })
            .await
            .context("HTTP server failed")
    }
    .await;

    watcher.shutdown().await;
    let stopped = pipeline.shutdown().await;
    pool.close().await;

    served?;
    stopped.map_err(|cause| anyhow!("pipeline stopped: {}", cause))
}
