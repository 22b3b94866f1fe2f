use std::sync::Arc;

use tidewater_core::Result as CoreResult;
use tidewater_core::audit::AuditLog;
use tidewater_core::catalog::TableCatalog;
use tidewater_core::checkpoint::CheckpointStore;
use tidewater_core::config::SyncSettings;
use tidewater_core::orchestrator::RefreshOrchestrator;
use tidewater_core::registry::{RefreshConfig, RefreshConfigStore};
use tidewater_core::source::{BigQueryWarehouse, MemoryWarehouse, SourceWarehouse};
use tidewater_core::store::{MemoryStore, PgStore};
use tidewater_core::target::{MemoryTargetStore, PgTargetStore, TargetStore};
use tidewater_core::webhooks::{HttpWebhookSender, WebhookQueue, WebhookStore};
use tidewater_core::worker::{
    ChannelContinuationQueue, ContinuationTask, TableRefreshWorker, WorkerSettings,
};
use tokio::sync::mpsc;

use crate::server::AppState;

/// Pending continuations the channel can hold before `enqueue` waits.
const CONTINUATION_CAPACITY: usize = 256;
const SEED_FREQUENCY_HOURS: u32 = 24;

/// Everything `serve` and `run-all` need. The receiver is consumed by whoever runs
/// continuations.
pub struct Backends {
    pub state: AppState,
    pub continuations: mpsc::Receiver<ContinuationTask>,
}

struct Bookkeeping {
    registry: Arc<dyn RefreshConfigStore>,
    checkpoints: Arc<dyn CheckpointStore>,
    audit: Arc<dyn AuditLog>,
    webhooks: Arc<dyn WebhookStore>,
    target: Arc<dyn TargetStore>,
}

/// Wire stores, clients, worker and orchestrator from settings.
///
/// Postgres backs bookkeeping and target tables when a database URL is configured,
/// otherwise everything runs in memory. The warehouse client needs a project id.
#[tracing::instrument(level = "info", skip_all)]
pub async fn build_state(settings: SyncSettings) -> anyhow::Result<Backends> {
    let mut catalog = TableCatalog::with_builtin()?;
    if let Some(path) = &settings.tables_file {
        let loaded = catalog.load_yaml_file(path)?;
        tracing::info!(path = %path.display(), loaded, "table specs loaded");
    }
    let catalog = Arc::new(catalog);

    let books = match &settings.database {
        Some(db) => {
            let store = PgStore::connect(db).await?;
            store.migrate().await?;
            let target = PgTargetStore::new(store.pool().clone(), settings.upsert_timeout);
            let store = Arc::new(store);
            tracing::info!("using postgres bookkeeping and target store");
            Bookkeeping {
                registry: store.clone(),
                checkpoints: store.clone(),
                audit: store.clone(),
                webhooks: store,
                target: Arc::new(target),
            }
        }
        None => {
            let store = Arc::new(MemoryStore::new());
            tracing::warn!("no database configured; using in-memory stores");
            Bookkeeping {
                registry: store.clone(),
                checkpoints: store.clone(),
                audit: store.clone(),
                webhooks: store,
                target: Arc::new(MemoryTargetStore::new()),
            }
        }
    };

    let source: Arc<dyn SourceWarehouse> = match &settings.source {
        Some(src) => Arc::new(BigQueryWarehouse::new(src)?),
        None => {
            tracing::warn!("no warehouse project configured; using in-memory warehouse");
            Arc::new(MemoryWarehouse::new())
        }
    };

    seed_registry(books.registry.as_ref(), &catalog).await?;

    let webhooks = Arc::new(WebhookQueue::new(
        books.webhooks.clone(),
        Arc::new(HttpWebhookSender::new()?),
        &settings.webhook,
    ));
    let (queue, continuations) = ChannelContinuationQueue::new(CONTINUATION_CAPACITY);
    let worker = Arc::new(
        TableRefreshWorker::new(
            books.registry.clone(),
            books.checkpoints.clone(),
            books.audit.clone(),
            catalog.clone(),
            source,
            books.target,
            Arc::new(queue),
            WorkerSettings::from_settings(&settings),
        )
        .with_webhooks(webhooks.clone()),
    );
    let orchestrator = Arc::new(RefreshOrchestrator::new(
        books.registry.clone(),
        books.audit.clone(),
        worker.clone(),
        settings.min_refresh_interval,
    )?);

    let state = AppState::new(
        Arc::new(settings),
        books.registry,
        books.checkpoints,
        books.audit,
        catalog,
        worker,
        orchestrator,
        webhooks,
    );
    Ok(Backends {
        state,
        continuations,
    })
}

/// Register a config for every catalog function that has none yet.
#[tracing::instrument(level = "debug", skip_all)]
pub async fn seed_registry(
    registry: &dyn RefreshConfigStore,
    catalog: &TableCatalog,
) -> CoreResult<usize> {
    let existing = registry.list_configs().await?;
    let mut seeded = 0;
    for function_name in catalog.function_names() {
        let spec = catalog.get(&function_name)?;
        if existing
            .iter()
            .any(|c| c.function_name == spec.function_name || c.table_name == spec.target_table)
        {
            continue;
        }
        let config = RefreshConfig::new(
            spec.target_schema.clone(),
            spec.target_table.clone(),
            spec.function_name.clone(),
            SEED_FREQUENCY_HOURS,
            0,
            None,
        )?;
        registry.upsert_config(&config).await?;
        seeded += 1;
    }
    if seeded > 0 {
        tracing::info!(seeded, "refresh configs seeded from catalog");
    }
    Ok(seeded)
}
