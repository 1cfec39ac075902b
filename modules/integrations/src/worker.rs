//! Queue consumers: the outbound write worker and the webhook worker.
//!
//! Jobs arrive as [`JobEnvelope`]s. The write worker re-resolves the live
//! record by id + type (the spool never serializes records) and applies
//! the mapping-based skip rules before calling the per-system writer.
//! Transient failures retry with backoff and exhausted jobs land in the
//! dead-letter store; configuration failures go to the DLQ immediately
//! because retrying cannot fix them.

use chrono::Utc;
use futures::StreamExt;
use std::sync::Arc;
use tracing::Instrument;

use async_trait::async_trait;
use job_queue::{retry_with_backoff, JobEnvelope, JobQueue, RetryConfig};

use crate::error::SyncError;
use crate::metrics::Metrics;
use crate::models::{Mapping, MappingSource, WebhookJob, WriteEvent, WriteJob};
use crate::qbo::QboSettings;
use crate::repos::{
    FailedWriteStore, MappingStore, RecordStore, SyncProfileStore, TenantDirectory,
};
use crate::writer::writer_for;

/// What one write job amounted to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteDisposition {
    Written,
    /// Nothing to do; the reason is a metric label, not an error
    Skipped(&'static str),
}

pub struct WriteWorker {
    queue: Arc<dyn JobQueue>,
    profiles: Arc<dyn SyncProfileStore>,
    mappings: Arc<dyn MappingStore>,
    records: Arc<dyn RecordStore>,
    tenants: Arc<dyn TenantDirectory>,
    failed: Arc<dyn FailedWriteStore>,
    qbo_settings: QboSettings,
    retry: RetryConfig,
    metrics: Arc<Metrics>,
}

impl WriteWorker {
    pub fn new(
        queue: Arc<dyn JobQueue>,
        profiles: Arc<dyn SyncProfileStore>,
        mappings: Arc<dyn MappingStore>,
        records: Arc<dyn RecordStore>,
        tenants: Arc<dyn TenantDirectory>,
        failed: Arc<dyn FailedWriteStore>,
        qbo_settings: QboSettings,
        retry: RetryConfig,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            queue,
            profiles,
            mappings,
            records,
            tenants,
            failed,
            qbo_settings,
            retry,
            metrics,
        }
    }

    /// Spawn the consume loop for `integrations.write.>`.
    pub fn start(self: &Arc<Self>) {
        let worker = self.clone();
        tokio::spawn(async move {
            let mut stream = match worker.queue.consume("integrations.write.>").await {
                Ok(stream) => stream,
                Err(e) => {
                    tracing::error!(error = %e, "write worker failed to consume");
                    return;
                }
            };
            tracing::info!("write worker consuming integrations.write.>");

            while let Some(job) = stream.next().await {
                let envelope: JobEnvelope<WriteJob> =
                    match JobEnvelope::from_bytes(&job.payload) {
                        Ok(envelope) => envelope,
                        Err(e) => {
                            tracing::error!(
                                subject = %job.subject,
                                error = %e,
                                "undecodable write job dropped"
                            );
                            continue;
                        }
                    };

                let span = tracing::info_span!(
                    "write_job",
                    job_id = %envelope.job_id,
                    tenant_id = %envelope.tenant_id,
                    subject = %job.subject,
                    record_type = %envelope.body.record_type,
                    event = envelope.body.event.as_str()
                );
                worker
                    .handle_job(&job.subject, &envelope)
                    .instrument(span)
                    .await;
            }

            tracing::warn!("write worker stopped");
        });
    }

    async fn handle_job(&self, subject: &str, envelope: &JobEnvelope<WriteJob>) {
        let system = envelope.body.target_system.slug();

        let result = match self.apply(&envelope.body).await {
            // Operator action is needed; retrying cannot fix it.
            Err(e) if e.is_configuration() => Err(e),
            Err(first_err) => {
                tracing::warn!(error = %first_err, "write attempt failed, retrying");
                retry_with_backoff(
                    || self.apply(&envelope.body),
                    &self.retry,
                    "integrations_write_worker",
                )
                .await
            }
            ok => ok,
        };

        match result {
            Ok(WriteDisposition::Written) => {
                self.metrics
                    .write_jobs_total
                    .with_label_values(&[system, "written"])
                    .inc();
            }
            Ok(WriteDisposition::Skipped(reason)) => {
                tracing::debug!(reason, "write job skipped");
                self.metrics
                    .write_jobs_total
                    .with_label_values(&[system, "skipped"])
                    .inc();
            }
            Err(e) => {
                self.metrics
                    .write_jobs_total
                    .with_label_values(&[system, "failed"])
                    .inc();
                self.dead_letter(subject, envelope, &e).await;
            }
        }
    }

    /// One attempt at one write job.
    pub async fn apply(&self, job: &WriteJob) -> Result<WriteDisposition, SyncError> {
        let Some(profile) = self
            .profiles
            .get(&job.tenant_id, job.target_system)
            .await?
        else {
            return Ok(WriteDisposition::Skipped("no_profile"));
        };
        if !profile.enabled {
            return Ok(WriteDisposition::Skipped("profile_disabled"));
        }

        let Some(writer) = writer_for(
            job.target_system,
            &self.qbo_settings,
            self.tenants.clone(),
            self.mappings.clone(),
        ) else {
            tracing::warn!(system = %job.target_system, "no writer adapter registered");
            return Ok(WriteDisposition::Skipped("no_adapter"));
        };

        let mapping = self
            .mappings
            .find_by_internal(job.target_system, job.record_type, job.record_id)
            .await?;

        match job.event {
            WriteEvent::Deleted => {
                let Some(mapping) = mapping else {
                    return Ok(WriteDisposition::Skipped("never_linked"));
                };
                writer.delete(&mapping, &profile).await?;
                self.mappings
                    .delete(job.target_system, job.record_type, job.record_id)
                    .await?;
            }
            WriteEvent::Created | WriteEvent::Updated => {
                let Some(snapshot) = self
                    .records
                    .snapshot(&job.tenant_id, job.record_type, job.record_id)
                    .await?
                else {
                    return Ok(WriteDisposition::Skipped("record_missing"));
                };

                match mapping {
                    // An existing link, ours or externally sourced, always
                    // means update; creating again would fork the record and
                    // clobber a link the external side originated.
                    Some(mapping) => {
                        writer.update(&snapshot, &mapping, &profile).await?;
                        self.mappings
                            .upsert(&Mapping {
                                synced_at: Utc::now(),
                                ..mapping
                            })
                            .await?;
                    }
                    None => {
                        let external_id = writer.create(&snapshot, &profile).await?;
                        self.mappings
                            .upsert(&Mapping {
                                internal_id: job.record_id,
                                system: job.target_system,
                                record_type: job.record_type,
                                external_id,
                                source: MappingSource::Platform,
                                fingerprint: None,
                                synced_at: Utc::now(),
                            })
                            .await?;
                    }
                }
            }
        }

        self.profiles
            .touch_last_write(profile.id, Utc::now())
            .await?;
        Ok(WriteDisposition::Written)
    }

    async fn dead_letter(
        &self,
        subject: &str,
        envelope: &JobEnvelope<WriteJob>,
        error: &SyncError,
    ) {
        tracing::error!(
            error = %error,
            configuration = error.is_configuration(),
            "write job moved to DLQ"
        );
        let payload = serde_json::to_value(envelope).unwrap_or_default();
        let attempts = if error.is_configuration() {
            1
        } else {
            self.retry.max_attempts as i32 + 1
        };
        if let Err(e) = self
            .failed
            .insert_failed(envelope.job_id, subject, &payload, &error.to_string(), attempts)
            .await
        {
            tracing::error!(error = %e, "failed to record DLQ entry");
        }
    }
}

/// Tenant-scoped processing of a webhook job, invoked after any delay.
#[async_trait]
pub trait WebhookProcessor: Send + Sync {
    async fn process(&self, tenant_id: &str, event: &serde_json::Value)
        -> Result<(), SyncError>;
}

/// Spawn the consume loop for `integrations.webhook.>`.
pub fn start_webhook_worker(
    queue: Arc<dyn JobQueue>,
    processor: Arc<dyn WebhookProcessor>,
) {
    tokio::spawn(async move {
        let mut stream = match queue.consume("integrations.webhook.>").await {
            Ok(stream) => stream,
            Err(e) => {
                tracing::error!(error = %e, "webhook worker failed to consume");
                return;
            }
        };
        tracing::info!("webhook worker consuming integrations.webhook.>");

        while let Some(job) = stream.next().await {
            let envelope: JobEnvelope<WebhookJob> = match JobEnvelope::from_bytes(&job.payload)
            {
                Ok(envelope) => envelope,
                Err(e) => {
                    tracing::error!(
                        subject = %job.subject,
                        error = %e,
                        "undecodable webhook job dropped"
                    );
                    continue;
                }
            };

            // Gives the gateway's own read path time to settle before the
            // tenant-scoped handlers query it back.
            if let Some(delay) = envelope.body.delay_seconds {
                tokio::time::sleep(std::time::Duration::from_secs(delay)).await;
            }

            let span = tracing::info_span!(
                "webhook_job",
                job_id = %envelope.job_id,
                tenant_id = %envelope.body.tenant_id
            );
            async {
                if let Err(e) = processor
                    .process(&envelope.body.tenant_id, &envelope.body.event)
                    .await
                {
                    tracing::error!(error = %e, "webhook job processing failed");
                }
            }
            .instrument(span)
            .await;
        }

        tracing::warn!("webhook worker stopped");
    });
}
