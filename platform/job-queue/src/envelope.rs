//! Typed job envelope shared by producers and workers.
//!
//! Every job payload on the queue is a serialized `JobEnvelope<T>` where `T`
//! is the job-specific body. The envelope carries what a worker needs before
//! it deserializes the body: identity for idempotency and logging, the owning
//! tenant, and when the job was enqueued.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{QueueError, QueueResult};

/// Wrapper around a job body with queue-level metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobEnvelope<T> {
    /// Unique job identifier (also the consumer-side idempotency key)
    pub job_id: Uuid,

    /// When the producer enqueued the job
    pub enqueued_at: DateTime<Utc>,

    /// Tenant the job belongs to; workers scope all work to it
    pub tenant_id: String,

    /// Module that produced the job (e.g. "integrations")
    pub producer: String,

    /// Job-specific body
    pub body: T,
}

impl<T: Serialize> JobEnvelope<T> {
    /// Wrap a body with a fresh job id and the current timestamp.
    pub fn new(tenant_id: impl Into<String>, producer: impl Into<String>, body: T) -> Self {
        Self {
            job_id: Uuid::new_v4(),
            enqueued_at: Utc::now(),
            tenant_id: tenant_id.into(),
            producer: producer.into(),
            body,
        }
    }

    /// Serialize for `JobQueue::enqueue`.
    pub fn to_bytes(&self) -> QueueResult<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| QueueError::Serialization(e.to_string()))
    }
}

impl<T: DeserializeOwned> JobEnvelope<T> {
    /// Deserialize a delivered payload.
    pub fn from_bytes(bytes: &[u8]) -> QueueResult<Self> {
        serde_json::from_slice(bytes).map_err(|e| QueueError::Serialization(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_envelope_round_trip() {
        let envelope = JobEnvelope::new("tenant-1", "integrations", json!({"record_id": "abc"}));
        let bytes = envelope.to_bytes().unwrap();

        let decoded: JobEnvelope<serde_json::Value> = JobEnvelope::from_bytes(&bytes).unwrap();
        assert_eq!(decoded.job_id, envelope.job_id);
        assert_eq!(decoded.tenant_id, "tenant-1");
        assert_eq!(decoded.producer, "integrations");
        assert_eq!(decoded.body["record_id"], "abc");
    }

    #[test]
    fn test_from_bytes_rejects_garbage() {
        let result: QueueResult<JobEnvelope<serde_json::Value>> =
            JobEnvelope::from_bytes(b"not json");
        assert!(matches!(result, Err(QueueError::Serialization(_))));
    }
}
