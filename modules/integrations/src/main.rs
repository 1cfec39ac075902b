use anyhow::Context;
use sqlx::postgres::PgPoolOptions;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use job_queue::{InMemoryQueue, JobQueue, NatsQueue, RetryConfig};

use integrations_rs::config::IntegrationsConfig;
use integrations_rs::credentials::CredentialVault;
use integrations_rs::metrics::Metrics;
use integrations_rs::models::{RecordType, SyncRunReport};
use integrations_rs::pg::{
    PgFailedWriteStore, PgMappingStore, PgRecordStore, PgSyncProfileStore, PgTenantDirectory,
    PgWebhookAudit,
};
use integrations_rs::pipeline::{adapters_for, SyncRunner};
use integrations_rs::qbo::QboSettings;
use integrations_rs::repos::{MappingStore, RecordStore, SyncProfileStore, TenantDirectory};
use integrations_rs::worker::{start_webhook_worker, WriteWorker};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let config = IntegrationsConfig::from_env()
        .map_err(|e| anyhow::anyhow!("invalid configuration: {e}"))?;

    tracing::info!("Connecting to database...");
    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&config.database_url)
        .await
        .context("failed to connect to database")?;

    tracing::info!("Running migrations...");
    sqlx::migrate!("./db/migrations")
        .run(&pool)
        .await
        .context("failed to run migrations")?;

    let queue: Arc<dyn JobQueue> = match config.queue_kind.to_lowercase().as_str() {
        "inmemory" => {
            tracing::info!("Using in-memory job queue");
            Arc::new(InMemoryQueue::new())
        }
        "nats" => {
            tracing::info!("Connecting to NATS at {}", config.nats_url);
            let client = async_nats::connect(&config.nats_url)
                .await
                .context("failed to connect to NATS")?;
            Arc::new(NatsQueue::new(client))
        }
        other => anyhow::bail!("invalid QUEUE_KIND: {other}. Must be 'inmemory' or 'nats'"),
    };

    let vault = CredentialVault::from_base64_key(&config.credentials_key_b64)
        .context("invalid CREDENTIALS_KEY")?;
    let metrics = Arc::new(Metrics::new());
    let qbo_settings = QboSettings::from_env();

    let profiles: Arc<dyn SyncProfileStore> = Arc::new(PgSyncProfileStore::new(pool.clone()));
    let mappings: Arc<dyn MappingStore> = Arc::new(PgMappingStore::new(pool.clone()));
    let records: Arc<dyn RecordStore> = Arc::new(PgRecordStore::new(pool.clone()));
    let tenants: Arc<dyn TenantDirectory> =
        Arc::new(PgTenantDirectory::new(pool.clone(), vault));

    // Outbound write worker
    let write_worker = Arc::new(WriteWorker::new(
        queue.clone(),
        profiles.clone(),
        mappings.clone(),
        records.clone(),
        tenants.clone(),
        Arc::new(PgFailedWriteStore::new(pool.clone())),
        qbo_settings.clone(),
        RetryConfig::default(),
        metrics.clone(),
    ));
    write_worker.start();

    // Webhook job worker
    start_webhook_worker(queue.clone(), Arc::new(PgWebhookAudit::new(pool.clone())));

    // Profile scheduler: sweep enabled profiles and run the inbound pipeline.
    let scheduler_cancel = Arc::new(AtomicBool::new(false));
    {
        let profiles = profiles.clone();
        let mappings = mappings.clone();
        let records = records.clone();
        let tenants = tenants.clone();
        let metrics = metrics.clone();
        let qbo_settings = qbo_settings.clone();
        let cancel = scheduler_cancel.clone();
        let interval = std::time::Duration::from_secs(config.scheduler_interval_secs);
        let page_size = config.page_size;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;

                let enabled = match profiles.list_enabled().await {
                    Ok(enabled) => enabled,
                    Err(e) => {
                        tracing::error!(error = %e, "failed to list sync profiles");
                        continue;
                    }
                };

                for profile in enabled {
                    let Some(adapters) = adapters_for(
                        profile.system,
                        &qbo_settings,
                        tenants.clone(),
                        records.clone(),
                        mappings.clone(),
                    ) else {
                        tracing::warn!(
                            system = %profile.system,
                            tenant_id = %profile.tenant_id,
                            "no sync adapter registered; skipping profile"
                        );
                        continue;
                    };

                    let mut runner = SyncRunner::new(
                        profile.system,
                        adapters,
                        profiles.clone(),
                        metrics.clone(),
                    );
                    if let Err(e) = runner.initialize(&profile).await {
                        tracing::error!(
                            tenant_id = %profile.tenant_id,
                            system = %profile.system,
                            error = %e,
                            "sync initialization failed; scheduler will retry next sweep"
                        );
                        metrics
                            .sync_runs_total
                            .with_label_values(&[profile.system.slug(), "failed"])
                            .inc();
                        continue;
                    }

                    let mut profile_report = SyncRunReport::default();
                    let mut run_failed = false;

                    for record_type in RecordType::inbound() {
                        // Each sweep re-reads the profile so every run sees
                        // the cursor the previous run committed.
                        let current = match profiles
                            .get(&profile.tenant_id, profile.system)
                            .await
                        {
                            Ok(Some(current)) => current,
                            Ok(None) => break,
                            Err(e) => {
                                tracing::error!(error = %e, "failed to reload profile");
                                run_failed = true;
                                break;
                            }
                        };

                        match runner.run(&current, record_type, page_size, &cancel).await {
                            Ok(report) => profile_report.merge(report),
                            Err(e) => {
                                tracing::error!(
                                    tenant_id = %current.tenant_id,
                                    record_type = %record_type,
                                    error = %e,
                                    "sync run failed; scheduler will retry next sweep"
                                );
                                run_failed = true;
                                break;
                            }
                        }
                    }

                    metrics
                        .sync_runs_total
                        .with_label_values(&[
                            profile.system.slug(),
                            if run_failed { "failed" } else { "completed" },
                        ])
                        .inc();
                    tracing::info!(
                        tenant_id = %profile.tenant_id,
                        system = %profile.system,
                        created = profile_report.created,
                        updated = profile_report.updated,
                        deleted = profile_report.deleted,
                        unchanged = profile_report.unchanged,
                        skipped = profile_report.skipped,
                        failed = profile_report.failed(),
                        "profile sweep finished"
                    );
                }
            }
        });
    }

    tracing::info!(
        environment = %config.environment,
        queue = %config.queue_kind,
        "integrations module running"
    );

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    scheduler_cancel.store(true, std::sync::atomic::Ordering::Relaxed);
    tracing::info!("integrations module shutting down");
    Ok(())
}
