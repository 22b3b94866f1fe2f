use crate::backends::Backends;
use crate::routes;
use axum::routing::get;
use axum::{Extension, Router};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tidewater_core::audit::AuditLog;
use tidewater_core::catalog::TableCatalog;
use tidewater_core::checkpoint::CheckpointStore;
use tidewater_core::config::SyncSettings;
use tidewater_core::orchestrator::{RefreshOrchestrator, RefreshScheduler};
use tidewater_core::registry::RefreshConfigStore;
use tidewater_core::webhooks::WebhookQueue;
use tidewater_core::worker::{ContinuationWorkerPool, TableRefreshWorker};
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::request_id::{MakeRequestUuid, SetRequestIdLayer};
use tower_http::trace::TraceLayer;

#[derive(Clone)]
pub struct AppState {
    pub settings: Arc<SyncSettings>,
    pub registry: Arc<dyn RefreshConfigStore>,
    pub checkpoints: Arc<dyn CheckpointStore>,
    pub audit: Arc<dyn AuditLog>,
    pub catalog: Arc<TableCatalog>,
    pub worker: Arc<TableRefreshWorker>,
    pub orchestrator: Arc<RefreshOrchestrator>,
    pub webhooks: Arc<WebhookQueue>,
    pub started_at: Instant,
}

impl AppState {
    #[allow(clippy::too_many_arguments)]
    #[tracing::instrument(level = "debug", skip_all)]
    pub fn new(
        settings: Arc<SyncSettings>,
        registry: Arc<dyn RefreshConfigStore>,
        checkpoints: Arc<dyn CheckpointStore>,
        audit: Arc<dyn AuditLog>,
        catalog: Arc<TableCatalog>,
        worker: Arc<TableRefreshWorker>,
        orchestrator: Arc<RefreshOrchestrator>,
        webhooks: Arc<WebhookQueue>,
    ) -> Self {
        Self {
            settings,
            registry,
            checkpoints,
            audit,
            catalog,
            worker,
            orchestrator,
            webhooks,
            started_at: Instant::now(),
        }
    }
}

#[tracing::instrument(level = "debug", skip_all)]
pub fn router(state: AppState) -> Router {
    let state = Arc::new(state);
    Router::new()
        .merge(routes::router())
        .route("/health", get(routes::health::get_health))
        .layer(Extension(state))
        .layer(SetRequestIdLayer::new(
            axum::http::HeaderName::from_static("x-request-id"),
            MakeRequestUuid,
        ))
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
}

/// Serve HTTP and run the continuation pool plus the scheduler (or a bare webhook
/// drain loop when scheduling is disabled) until Ctrl-C.
#[tracing::instrument(level = "info", skip_all)]
pub async fn serve(addr: SocketAddr, backends: Backends) -> anyhow::Result<()> {
    let Backends {
        state,
        continuations,
    } = backends;
    let cancel = CancellationToken::new();

    let pool = ContinuationWorkerPool::new(state.worker.clone(), state.settings.worker_concurrency);
    let pool_cancel = cancel.clone();
    tokio::spawn(async move {
        pool.run(continuations, pool_cancel).await;
    });

    let tick = state.settings.scheduler.tick;
    if state.settings.scheduler.enabled {
        let scheduler = RefreshScheduler::new(
            state.orchestrator.clone(),
            state.checkpoints.clone(),
            tick,
        )?
        .with_webhooks(state.webhooks.clone());
        let scheduler_cancel = cancel.clone();
        tokio::spawn(async move {
            tracing::info!(tick_ms = tick.as_millis() as u64, "refresh scheduler started");
            scheduler.run_loop(scheduler_cancel).await;
        });
    } else {
        tracing::info!("refresh scheduler disabled (TIDEWATER_SCHEDULER_ENABLED=false)");
        let webhooks = state.webhooks.clone();
        let drain_cancel = cancel.clone();
        tokio::spawn(async move {
            webhooks.run_loop(tick, drain_cancel).await;
        });
    }

    let app = router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "listening");
    let shutdown = cancel.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::warn!(error = %e, "ctrl-c handler failed; shutdown only on process exit");
                std::future::pending::<()>().await;
            }
            tracing::info!("shutting down");
            shutdown.cancel();
        })
        .await?;
    cancel.cancel();
    Ok(())
}
