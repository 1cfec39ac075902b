//! # JobQueue Abstraction
//!
//! A platform-level abstraction for asynchronous background jobs.
//!
//! ## Why This Lives in Tier 1
//!
//! Modules hand work to the queue (outbound accounting writes, webhook
//! processing, projection rebuilds) without knowing which transport carries
//! it. Placing the contract in `platform/` (Tier 1) allows:
//! - Modules to depend on platform crates without circular dependencies
//! - Config-driven swap between NATS (production) and InMemory (dev/test)
//! - Workers and producers to agree on one envelope shape
//!
//! ## Implementations
//!
//! - **NatsQueue**: production transport over NATS
//! - **InMemoryQueue**: in-process transport for dev and tests
//!
//! A producer enqueues raw bytes on a dotted subject
//! (e.g. `integrations.write.quickbooks`); a worker consumes a subject
//! pattern (`integrations.write.>`) as a stream. [`JobEnvelope`] is the
//! typed wrapper both sides use for the payload bytes.

mod consumer_retry;
mod envelope;
mod inmemory_queue;
mod nats_queue;

pub use consumer_retry::{retry_with_backoff, RetryConfig};
pub use envelope::JobEnvelope;
pub use inmemory_queue::InMemoryQueue;
pub use nats_queue::NatsQueue;

use async_trait::async_trait;
use futures::stream::BoxStream;
use std::fmt;

/// A job delivered to a consumer.
#[derive(Debug, Clone)]
pub struct QueuedJob {
    /// The subject the job was enqueued on
    pub subject: String,
    /// The job payload (raw bytes; typically a serialized [`JobEnvelope`])
    pub payload: Vec<u8>,
}

impl QueuedJob {
    pub fn new(subject: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            subject: subject.into(),
            payload,
        }
    }
}

/// Errors that can occur when using the job queue
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("failed to enqueue job: {0}")]
    Enqueue(String),

    #[error("failed to consume subject: {0}")]
    Consume(String),

    #[error("connection error: {0}")]
    Connection(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

pub type QueueResult<T> = Result<T, QueueError>;

/// Core queue abstraction shared by producers and workers.
///
/// `enqueue` is the only contract producers rely on; `consume` is the worker
/// side. Both are subject-addressed with NATS-style wildcards on the consume
/// side (`*` one token, `>` one or more trailing tokens).
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Enqueue a job on a subject. Returns once the transport accepted it.
    async fn enqueue(&self, subject: &str, payload: Vec<u8>) -> QueueResult<()>;

    /// Consume jobs matching a subject pattern as an unbounded stream.
    ///
    /// The stream ends only when the transport shuts down; consumers are
    /// expected to run for the lifetime of the worker.
    async fn consume(&self, pattern: &str) -> QueueResult<BoxStream<'static, QueuedJob>>;
}

impl fmt::Debug for dyn JobQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "JobQueue")
    }
}
