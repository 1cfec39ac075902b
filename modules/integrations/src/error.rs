//! Error taxonomy for the integration engine.
//!
//! Each pipeline boundary gets its own type so the scheduler and the job
//! queue can apply a different retry policy per kind: transport/auth
//! failures are run-fatal and retried by the outer scheduler, record-level
//! failures are aggregated on the run report, configuration failures are
//! fatal for one record's write and never defaulted.

use thiserror::Error;

use crate::models::{ExternalSystem, RecordType};

/// Storage-layer failures, shared by every repository trait.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("stored document could not be decoded: {0}")]
    Decode(String),

    #[error("credential error: {0}")]
    Credential(String),
}

/// Fatal-for-the-run failures while reading from an external system.
#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("authentication with {system} rejected: {reason}")]
    Auth { system: ExternalSystem, reason: String },

    #[error("transport failure talking to {system}: {reason}")]
    Transport { system: ExternalSystem, reason: String },

    #[error("{record_type} {external_id} not found in {system}")]
    NotFound {
        system: ExternalSystem,
        record_type: RecordType,
        external_id: String,
    },

    #[error("{system} API error (status {status}): {message}")]
    Api {
        system: ExternalSystem,
        status: u16,
        message: String,
    },

    #[error("response from {system} could not be decoded: {reason}")]
    Decode { system: ExternalSystem, reason: String },

    #[error("extractor used before initialize() bound an account")]
    Uninitialized,
}

/// Per-record failures while normalizing an external record.
#[derive(Debug, Error)]
pub enum TransformError {
    #[error("unsupported record type {0}")]
    UnsupportedType(RecordType),

    #[error("missing required field {field}")]
    MissingField { field: &'static str },

    #[error("malformed {field}: {reason}")]
    Malformed { field: &'static str, reason: String },
}

/// Per-record failures while upserting into the platform.
#[derive(Debug, Error)]
pub enum LoadError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error(transparent)]
    Storage(#[from] StoreError),
}

/// Outbound sync and dispatch failures.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("no routing rule matches payment route (currency={currency}, method={method}, merchant_account={merchant_account})")]
    NoMatchingRoute {
        currency: String,
        method: String,
        merchant_account: String,
    },

    #[error("no {record_type} mapping for record {internal_id} in {system}")]
    MissingMapping {
        system: ExternalSystem,
        record_type: RecordType,
        internal_id: uuid::Uuid,
    },

    #[error("sync profile for tenant {tenant_id} and {system} is missing or disabled")]
    ProfileUnavailable {
        tenant_id: String,
        system: ExternalSystem,
    },

    #[error("{system} write rejected: {reason}")]
    WriteRejected { system: ExternalSystem, reason: String },

    #[error("webhook payload rejected: {0}")]
    InvalidWebhook(String),

    #[error("webhook signature verification failed")]
    SignatureMismatch,

    #[error(transparent)]
    Extract(#[from] ExtractError),

    #[error(transparent)]
    Transform(#[from] TransformError),

    #[error(transparent)]
    Load(#[from] LoadError),

    #[error(transparent)]
    Storage(#[from] StoreError),

    #[error("queue error: {0}")]
    Queue(#[from] job_queue::QueueError),
}

impl SyncError {
    /// Configuration errors need operator action; retrying cannot fix them.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            SyncError::NoMatchingRoute { .. }
                | SyncError::MissingMapping { .. }
                | SyncError::ProfileUnavailable { .. }
        )
    }
}
