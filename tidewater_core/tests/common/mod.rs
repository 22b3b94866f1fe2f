#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use tidewater_core::catalog::TableCatalog;
use tidewater_core::orchestrator::RefreshOrchestrator;
use tidewater_core::registry::{RefreshConfig, RefreshConfigStore};
use tidewater_core::source::{MemoryWarehouse, SourceRow};
use tidewater_core::store::MemoryStore;
use tidewater_core::target::MemoryTargetStore;
use tidewater_core::webhooks::WebhookQueue;
use tidewater_core::worker::{MemoryContinuationQueue, TableRefreshWorker, WorkerSettings};

pub const ASIN_TABLE: &str = "asin_performance";
pub const ASIN_FUNCTION: &str = "asin_performance_data";
pub const ASIN_TARGET: &str = "public.asin_performance";

pub struct Harness {
    pub store: MemoryStore,
    pub warehouse: MemoryWarehouse,
    pub target: MemoryTargetStore,
    pub continuations: MemoryContinuationQueue,
    pub worker: Arc<TableRefreshWorker>,
    pub orchestrator: RefreshOrchestrator,
}

pub fn harness(batch_size: usize, time_budget: Duration) -> Harness {
    build(batch_size, time_budget, None)
}

pub fn harness_with_webhooks(
    batch_size: usize,
    time_budget: Duration,
    webhooks: Arc<WebhookQueue>,
    store: MemoryStore,
) -> Harness {
    build_with_store(batch_size, time_budget, Some(webhooks), store)
}

fn build(batch_size: usize, time_budget: Duration, webhooks: Option<Arc<WebhookQueue>>) -> Harness {
    build_with_store(batch_size, time_budget, webhooks, MemoryStore::new())
}

fn build_with_store(
    batch_size: usize,
    time_budget: Duration,
    webhooks: Option<Arc<WebhookQueue>>,
    store: MemoryStore,
) -> Harness {
    let warehouse = MemoryWarehouse::new();
    let target = MemoryTargetStore::new();
    let continuations = MemoryContinuationQueue::new();
    let catalog = Arc::new(TableCatalog::with_builtin().expect("builtin catalog"));

    let mut worker = TableRefreshWorker::new(
        Arc::new(store.clone()),
        Arc::new(store.clone()),
        Arc::new(store.clone()),
        catalog,
        Arc::new(warehouse.clone()),
        Arc::new(target.clone()),
        Arc::new(continuations.clone()),
        WorkerSettings {
            batch_size,
            time_budget,
            lease_ttl: Duration::from_secs(600),
        },
    );
    if let Some(queue) = webhooks {
        worker = worker.with_webhooks(queue);
    }
    let worker = Arc::new(worker);
    let orchestrator = RefreshOrchestrator::new(
        Arc::new(store.clone()),
        Arc::new(store.clone()),
        worker.clone(),
        Duration::from_secs(3_600),
    )
    .expect("orchestrator");

    Harness {
        store,
        warehouse,
        target,
        continuations,
        worker,
        orchestrator,
    }
}

pub fn asin_config() -> RefreshConfig {
    RefreshConfig::new("public", ASIN_TABLE, ASIN_FUNCTION, 24, 10, None).expect("config")
}

pub async fn seed_asin_config(h: &Harness) -> RefreshConfig {
    let config = asin_config();
    h.store.upsert_config(&config).await.expect("seed config");
    config
}

pub fn asin_row(asin: &str, date: &str, sessions: i64) -> SourceRow {
    serde_json::json!({
        "asin": asin,
        "date": date,
        "parent_asin": "P-1",
        "marketplace": "US",
        "sessions": sessions,
        "page_views": sessions * 2,
        "units_ordered": 3,
        "ordered_product_sales": "41.97",
        "ad_spend": 12.5,
        "updated_at": "2024-05-04T06:00:00Z",
    })
    .as_object()
    .cloned()
    .expect("object")
}

/// Five rows over three days; two rows share each of the first two dates.
pub fn five_asin_rows() -> Vec<SourceRow> {
    vec![
        asin_row("B001", "2024-05-01", 10),
        asin_row("B002", "2024-05-01", 20),
        asin_row("B001", "2024-05-02", 30),
        asin_row("B002", "2024-05-02", 40),
        asin_row("B001", "2024-05-03", 50),
    ]
}
