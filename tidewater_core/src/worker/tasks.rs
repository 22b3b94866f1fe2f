use std::sync::Arc;

use crate::worker::engine::TableRefreshWorker;
use crate::{Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, Semaphore, mpsc};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Remaining work for an attempt that ran out of time budget.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContinuationTask {
    pub table_name: String,
    pub audit_log_id: Uuid,
    pub checkpoint_id: Uuid,
    /// 1 for the first invocation of an attempt.
    pub invocation: u32,
    pub enqueued_at: DateTime<Utc>,
}

#[async_trait]
pub trait ContinuationQueue: Send + Sync {
    async fn enqueue(&self, task: ContinuationTask) -> Result<()>;
}

/// Bounded in-process queue drained by a `ContinuationWorkerPool`.
#[derive(Debug, Clone)]
pub struct ChannelContinuationQueue {
    tx: mpsc::Sender<ContinuationTask>,
}

impl ChannelContinuationQueue {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<ContinuationTask>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }
}

#[async_trait]
impl ContinuationQueue for ChannelContinuationQueue {
    #[tracing::instrument(level = "debug", skip_all, fields(table = %task.table_name, invocation = task.invocation))]
    async fn enqueue(&self, task: ContinuationTask) -> Result<()> {
        self.tx
            .send(task)
            .await
            .map_err(|_| Error::BackendMessage("continuation queue is closed".to_string()))
    }
}

/// Collects tasks without running them. Tests drive continuations by hand.
#[derive(Debug, Clone, Default)]
pub struct MemoryContinuationQueue {
    tasks: Arc<Mutex<Vec<ContinuationTask>>>,
}

impl MemoryContinuationQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn take_all(&self) -> Vec<ContinuationTask> {
        std::mem::take(&mut *self.tasks.lock().await)
    }

    pub async fn len(&self) -> usize {
        self.tasks.lock().await.len()
    }
}

#[async_trait]
impl ContinuationQueue for MemoryContinuationQueue {
    async fn enqueue(&self, task: ContinuationTask) -> Result<()> {
        self.tasks.lock().await.push(task);
        Ok(())
    }
}

/// Runs queued continuations with bounded parallelism.
pub struct ContinuationWorkerPool {
    worker: Arc<TableRefreshWorker>,
    permits: Arc<Semaphore>,
}

impl ContinuationWorkerPool {
    pub fn new(worker: Arc<TableRefreshWorker>, concurrency: usize) -> Self {
        Self {
            worker,
            permits: Arc::new(Semaphore::new(concurrency.max(1))),
        }
    }

    /// Consume tasks until the channel closes or `cancel` fires. In-flight tasks are
    /// allowed to finish.
    #[tracing::instrument(level = "info", skip_all)]
    pub async fn run(&self, mut rx: mpsc::Receiver<ContinuationTask>, cancel: CancellationToken) {
        loop {
            let task = tokio::select! {
                _ = cancel.cancelled() => break,
                task = rx.recv() => match task {
                    Some(task) => task,
                    None => break,
                },
            };
            let permit = tokio::select! {
                _ = cancel.cancelled() => break,
                permit = self.permits.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };
            let worker = self.worker.clone();
            tokio::spawn(async move {
                let _permit = permit;
                if let Err(e) = worker.continue_task(&task).await {
                    tracing::warn!(
                        table = %task.table_name,
                        audit_log_id = %task.audit_log_id,
                        error = %e,
                        "continuation failed"
                    );
                }
            });
        }
        tracing::info!("continuation pool stopped");
    }
}
