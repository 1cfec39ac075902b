//! Gateway webhook intake: verification, deduplication, tenant resolution,
//! and handoff to the job queue.
//!
//! Deliveries are at-least-once and carry no tenant context. The dispatcher
//! verifies the payload signature, drops events from the other environment,
//! claims a long-lived idempotency lease derived from the event content, and
//! resolves the owning tenant by a deliberately tenant-unscoped lookup of
//! the object the event references. Only then does the event become a
//! tenant-scoped queue job, optionally delayed so the gateway's own reads
//! have settled by the time the worker runs.

pub mod handlers;

use chrono::{DateTime, Duration, Utc};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::sync::Arc;
use uuid::Uuid;

use job_queue::{JobEnvelope, JobQueue};

use crate::config::Environment;
use crate::error::SyncError;
use crate::locks::LeaseStore;
use crate::metrics::Metrics;
use crate::models::{webhook_subject, WebhookJob};
use crate::repos::GatewayRecordFinder;
use handlers::handler_for;

pub const GATEWAY: &str = "tilled";

const PRODUCER: &str = "integrations";

type HmacSha256 = Hmac<Sha256>;

/// One parsed gateway delivery.
#[derive(Debug, Clone)]
pub struct GatewayEvent {
    /// Event-type code, e.g. `payment_intent.succeeded`
    pub kind: String,
    pub environment: Environment,
    pub occurred_at: Option<DateTime<Utc>>,
    /// Full delivery payload, forwarded untouched to the processing job
    pub payload: serde_json::Value,
}

impl GatewayEvent {
    pub fn parse(raw: &[u8]) -> Result<Self, SyncError> {
        let payload: serde_json::Value = serde_json::from_slice(raw)
            .map_err(|e| SyncError::InvalidWebhook(format!("payload is not JSON: {e}")))?;

        let kind = payload
            .get("type")
            .and_then(|v| v.as_str())
            .ok_or_else(|| SyncError::InvalidWebhook("missing type".into()))?
            .to_string();

        let environment = payload
            .get("environment")
            .and_then(|v| v.as_str())
            .ok_or_else(|| SyncError::InvalidWebhook("missing environment".into()))?;
        let environment = Environment::parse(environment).ok_or_else(|| {
            SyncError::InvalidWebhook(format!("unknown environment '{environment}'"))
        })?;

        let occurred_at = payload
            .get("created_at")
            .and_then(|v| v.as_str())
            .and_then(|v| DateTime::parse_from_rfc3339(v).ok())
            .map(|dt| dt.with_timezone(&Utc));

        Ok(Self {
            kind,
            environment,
            occurred_at,
            payload,
        })
    }

    /// Id of the object the event is about (`data.id`).
    pub fn resource_id(&self) -> Option<&str> {
        self.payload
            .get("data")
            .and_then(|d| d.get("id"))
            .and_then(|v| v.as_str())
    }

    /// Idempotency id derived from fields the gateway does not guarantee to
    /// be globally unique; the same delivery always derives the same id.
    pub fn derived_id(&self) -> Uuid {
        let occurred = self
            .occurred_at
            .map(|dt| dt.to_rfc3339())
            .unwrap_or_default();
        let material = format!(
            "{}|{}|{}",
            self.kind,
            self.resource_id().unwrap_or_default(),
            occurred
        );
        Uuid::new_v5(&Uuid::NAMESPACE_OID, material.as_bytes())
    }
}

/// Verify the gateway's HMAC-SHA256 signature over the raw body.
pub fn verify_signature(raw: &[u8], signature_hex: &str, secret: &str) -> Result<(), SyncError> {
    let expected =
        hex::decode(signature_hex).map_err(|_| SyncError::SignatureMismatch)?;

    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|_| SyncError::SignatureMismatch)?;
    mac.update(raw);
    mac.verify_slice(&expected)
        .map_err(|_| SyncError::SignatureMismatch)
}

/// Lease key for one delivery: `{env}:{gateway}_ipn.{derived_id}`.
pub fn lease_key(environment: Environment, derived_id: Uuid) -> String {
    format!("{}:{}_ipn.{}", environment.as_str(), GATEWAY, derived_id.simple())
}

/// Terminal state of one delivery. Everything except `Enqueued` is absorbed
/// silently and only counted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Handed to the queue for tenant-scoped processing
    Enqueued { tenant_id: String },
    /// Idempotency lease already held: a duplicate delivery
    Duplicate,
    /// Event belongs to the other environment
    EnvironmentMismatch,
    /// Event type has no handler
    Ignored,
    /// No platform record owns the referenced object; nothing to retry
    /// against
    Orphaned,
}

impl DispatchOutcome {
    fn metric_label(&self) -> &'static str {
        match self {
            DispatchOutcome::Enqueued { .. } => "enqueued",
            DispatchOutcome::Duplicate => "duplicate",
            DispatchOutcome::EnvironmentMismatch => "env_mismatch",
            DispatchOutcome::Ignored => "ignored",
            DispatchOutcome::Orphaned => "orphaned",
        }
    }
}

pub struct WebhookDispatcher {
    environment: Environment,
    webhook_secret: String,
    lease_ttl: Duration,
    leases: Arc<dyn LeaseStore>,
    finder: Arc<dyn GatewayRecordFinder>,
    queue: Arc<dyn JobQueue>,
    metrics: Arc<Metrics>,
}

impl WebhookDispatcher {
    pub fn new(
        environment: Environment,
        webhook_secret: String,
        lease_ttl_days: i64,
        leases: Arc<dyn LeaseStore>,
        finder: Arc<dyn GatewayRecordFinder>,
        queue: Arc<dyn JobQueue>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            environment,
            webhook_secret,
            lease_ttl: Duration::days(lease_ttl_days),
            leases,
            finder,
            queue,
            metrics,
        }
    }

    /// Full intake path for one delivery. Signature and payload problems are
    /// errors back to the gateway (it will redeliver); every other non-happy
    /// path is a counted, absorbed outcome.
    pub async fn dispatch(
        &self,
        raw: &[u8],
        signature_hex: &str,
    ) -> Result<DispatchOutcome, SyncError> {
        if let Err(e) = verify_signature(raw, signature_hex, &self.webhook_secret) {
            self.count("rejected");
            return Err(e);
        }

        let event = GatewayEvent::parse(raw)?;

        if !self.should_process(&event).await? {
            let outcome = if event.environment != self.environment {
                DispatchOutcome::EnvironmentMismatch
            } else {
                DispatchOutcome::Duplicate
            };
            self.count(outcome.metric_label());
            return Ok(outcome);
        }

        let outcome = self.process(event).await?;
        self.count(outcome.metric_label());
        Ok(outcome)
    }

    /// Environment gate plus idempotency lease. `false` means drop without
    /// processing; the lease is never released, its expiry *is* the dedup
    /// window.
    async fn should_process(&self, event: &GatewayEvent) -> Result<bool, SyncError> {
        if event.environment != self.environment {
            tracing::debug!(
                kind = %event.kind,
                event_env = %event.environment,
                "dropping event from other environment"
            );
            return Ok(false);
        }

        let key = lease_key(self.environment, event.derived_id());
        let acquired = self.leases.try_acquire(&key, self.lease_ttl).await?;
        if !acquired {
            tracing::debug!(kind = %event.kind, lease = %key, "duplicate delivery dropped");
        }
        Ok(acquired)
    }

    /// Resolve the owning tenant and enqueue the processing job.
    async fn process(&self, event: GatewayEvent) -> Result<DispatchOutcome, SyncError> {
        let handler = handler_for(&event.kind);

        let Some(reference) = handler.reference(&event) else {
            tracing::debug!(kind = %event.kind, handler = handler.name(), "event ignored");
            return Ok(DispatchOutcome::Ignored);
        };

        // The event arrives with no tenant context, so this lookup is
        // global by design; everything after it is scoped to the tenant
        // found.
        let Some(tenant_id) = self.finder.find_owner(&reference).await? else {
            tracing::warn!(
                kind = %event.kind,
                reference = ?reference,
                "no owning tenant for gateway event; dropping"
            );
            return Ok(DispatchOutcome::Orphaned);
        };

        let job = WebhookJob {
            event: event.payload,
            tenant_id: tenant_id.clone(),
            delay_seconds: handler.processing_delay().map(|d| d.as_secs()),
        };
        let envelope = JobEnvelope::new(tenant_id.clone(), PRODUCER, job);
        self.queue
            .enqueue(&webhook_subject(GATEWAY), envelope.to_bytes()?)
            .await?;

        tracing::info!(
            kind = %event.kind,
            tenant_id = %tenant_id,
            handler = handler.name(),
            "webhook enqueued for processing"
        );
        Ok(DispatchOutcome::Enqueued { tenant_id })
    }

    fn count(&self, outcome: &str) {
        self.metrics
            .webhook_events_total
            .with_label_values(&[GATEWAY, outcome])
            .inc();
    }
}
