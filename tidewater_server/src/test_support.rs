use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::response::Response;
use tidewater_core::catalog::TableCatalog;
use tidewater_core::config::{SyncSettings, WebhookSettings};
use tidewater_core::orchestrator::RefreshOrchestrator;
use tidewater_core::source::{MemoryWarehouse, SourceRow};
use tidewater_core::store::MemoryStore;
use tidewater_core::target::MemoryTargetStore;
use tidewater_core::webhooks::{HttpWebhookSender, WebhookQueue};
use tidewater_core::worker::{MemoryContinuationQueue, TableRefreshWorker, WorkerSettings};

use crate::backends::seed_registry;
use crate::server::{AppState, router};

pub struct TestApp {
    pub store: MemoryStore,
    pub warehouse: MemoryWarehouse,
    pub state: AppState,
}

impl TestApp {
    /// Memory backends with the builtin catalog seeded and three source rows.
    pub async fn new() -> Self {
        let settings = SyncSettings::default();
        let store = MemoryStore::new();
        let warehouse = MemoryWarehouse::new();
        let catalog = Arc::new(TableCatalog::with_builtin().unwrap());
        seed_registry(&store, &catalog).await.unwrap();
        warehouse
            .insert_rows(
                "asin_performance",
                vec![
                    row("B001", "2024-05-01"),
                    row("B002", "2024-05-01"),
                    row("B001", "2024-05-02"),
                ],
            )
            .await;

        let webhooks = Arc::new(WebhookQueue::new(
            Arc::new(store.clone()),
            Arc::new(HttpWebhookSender::new().unwrap()),
            &WebhookSettings::default(),
        ));
        let worker = Arc::new(
            TableRefreshWorker::new(
                Arc::new(store.clone()),
                Arc::new(store.clone()),
                Arc::new(store.clone()),
                catalog.clone(),
                Arc::new(warehouse.clone()),
                Arc::new(MemoryTargetStore::new()),
                Arc::new(MemoryContinuationQueue::new()),
                WorkerSettings {
                    batch_size: 100,
                    time_budget: Duration::from_secs(60),
                    lease_ttl: Duration::from_secs(600),
                },
            )
            .with_webhooks(webhooks.clone()),
        );
        let orchestrator = Arc::new(
            RefreshOrchestrator::new(
                Arc::new(store.clone()),
                Arc::new(store.clone()),
                worker.clone(),
                settings.min_refresh_interval,
            )
            .unwrap(),
        );
        let state = AppState::new(
            Arc::new(settings),
            Arc::new(store.clone()),
            Arc::new(store.clone()),
            Arc::new(store.clone()),
            catalog,
            worker,
            orchestrator,
            webhooks,
        );
        Self {
            store,
            warehouse,
            state,
        }
    }

    pub fn router(&self) -> Router {
        router(self.state.clone())
    }
}

fn row(asin: &str, date: &str) -> SourceRow {
    serde_json::json!({
        "asin": asin,
        "date": date,
        "parent_asin": "P-1",
        "marketplace": "US",
        "sessions": 12,
        "page_views": 30,
        "units_ordered": 2,
        "ordered_product_sales": "19.98",
        "ad_spend": 4.5,
        "updated_at": "2024-05-03T06:00:00Z",
    })
    .as_object()
    .cloned()
    .unwrap()
}

pub async fn read_json(resp: Response) -> serde_json::Value {
    let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}
