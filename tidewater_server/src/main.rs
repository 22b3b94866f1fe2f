use clap::Parser;
use std::net::SocketAddr;
use tidewater_core::config::SyncSettings;
use tidewater_core::store::PgStore;
use tidewater_server::cli::{Cli, Commands};

#[tokio::main]
#[tracing::instrument(level = "info")]
async fn main() -> anyhow::Result<()> {
    tidewater_core::o11y::init_from_env()?;
    let cli = Cli::parse();

    let cmd = cli.command.unwrap_or(Commands::Serve {
        host: "0.0.0.0".to_string(),
        port: 8000,
    });

    match cmd {
        Commands::Serve { host, port } => {
            let addr: SocketAddr = format!("{host}:{port}").parse()?;
            let settings = SyncSettings::from_env()?;
            let backends = tidewater_server::backends::build_state(settings).await?;
            tidewater_server::server::serve(addr, backends).await?;
        }
        Commands::Migrate { database_url } => {
            let mut settings = SyncSettings::from_env()?;
            if let Some(url) = database_url {
                let mut db = settings.database.take().unwrap_or_else(|| {
                    tidewater_core::config::DatabaseSettings {
                        url: String::new(),
                        max_connections: 5,
                        acquire_timeout: std::time::Duration::from_secs(10),
                    }
                });
                db.url = url;
                settings.database = Some(db);
            }
            match &settings.database {
                Some(db) => {
                    let store = PgStore::connect(db).await?;
                    store.migrate().await?;
                    tracing::info!("bookkeeping migrations applied");
                }
                None => tracing::info!("no database configured; skipping migrations"),
            }
        }
        Commands::RunAll { force } => {
            let settings = SyncSettings::from_env()?;
            let tidewater_server::backends::Backends {
                state,
                mut continuations,
            } = tidewater_server::backends::build_state(settings).await?;

            let summary = state.orchestrator.run_all(force).await?;
            // Continuations may enqueue further continuations; run until the channel is empty.
            let mut continued = 0usize;
            while let Ok(task) = continuations.try_recv() {
                if let Err(e) = state.worker.continue_task(&task).await {
                    tracing::warn!(table = %task.table_name, error = %e, "continuation failed");
                }
                continued += 1;
            }
            let report = state.webhooks.drain(chrono::Utc::now()).await?;
            tracing::info!(
                continued,
                webhooks_delivered = report.delivered,
                "run-all finished"
            );
            println!("{}", serde_json::to_string_pretty(&summary)?);
            if summary.failed > 0 {
                anyhow::bail!("{} of {} tables failed", summary.failed, summary.total);
            }
        }
        Commands::Config => {
            fn redact(s: &str) -> String {
                if s.len() <= 8 || !s.is_ascii() {
                    return "***".to_string();
                }
                format!("{}***{}", &s[..4], &s[s.len() - 4..])
            }

            let s = SyncSettings::from_env()?;
            let cfg = serde_json::json!({
                "database_url": s.database.as_ref().map(|d| redact(&d.url)),
                "db_max_connections": s.database.as_ref().map(|d| d.max_connections),
                "source_project_id": s.source.as_ref().map(|src| src.project_id.clone()),
                "source_dataset": s.source.as_ref().map(|src| src.dataset.clone()),
                "source_access_token": s.source.as_ref().and_then(|src| src.access_token.as_deref()).map(|_| "<set>"),
                "source_api_base": s.source.as_ref().map(|src| src.api_base.clone()),
                "min_refresh_interval_secs": s.min_refresh_interval.as_secs(),
                "batch_size": s.batch_size,
                "platform_time_limit_secs": s.platform_time_limit.as_secs(),
                "time_safety_margin_secs": s.time_safety_margin.as_secs(),
                "time_budget_secs": s.time_budget().as_secs(),
                "upsert_timeout_ms": s.upsert_timeout.as_millis() as u64,
                "checkpoint_lease_secs": s.checkpoint_lease.as_secs(),
                "worker_concurrency": s.worker_concurrency,
                "webhook_backoff_seconds": s.webhook.backoff_seconds,
                "webhook_max_attempts": s.webhook.max_attempts,
                "webhook_timeout_ms": s.webhook.timeout.as_millis() as u64,
                "scheduler_enabled": s.scheduler.enabled,
                "scheduler_tick_ms": s.scheduler.tick.as_millis() as u64,
                "tables_file": s.tables_file.as_ref().map(|p| p.display().to_string()),
            });
            println!("{}", serde_json::to_string_pretty(&cfg)?);
        }
    }

    Ok(())
}
