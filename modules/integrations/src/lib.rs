//! Accounting integration engine.
//!
//! Keeps the platform consistent with external accounting systems and with
//! payment-gateway webhook deliveries: the inbound Extract → Transform →
//! Load pipeline, the outbound write spool and write worker, payment-to-
//! ledger-account routing, and webhook idempotency/dispatch. The HTTP
//! surface, job execution engine, and domain modules consume this crate
//! through its traits; persistence is Postgres and job transport is the
//! platform queue.

pub mod config;
pub mod credentials;
pub mod error;
pub mod loader;
pub mod locks;
pub mod metrics;
pub mod models;
pub mod pg;
pub mod pipeline;
pub mod qbo;
pub mod repos;
pub mod routing;
pub mod spool;
pub mod webhooks;
pub mod worker;
pub mod writer;

pub use config::{Environment, IntegrationsConfig};
pub use error::{ExtractError, LoadError, StoreError, SyncError, TransformError};
pub use loader::PlatformLoader;
pub use metrics::Metrics;
pub use models::{
    AccountingRecord, ExternalRecord, ExternalSystem, ImportOutcome, Mapping, MappingSource,
    PaymentRoute, ReadCursor, ReadQuery, RecordType, RoutingRule, SyncProfile, SyncRunReport,
    WebhookJob, WriteEvent, WriteJob,
};
pub use pipeline::{adapters_for, Extractor, Loader, SyncRunner, Transformer};
pub use routing::select_account;
pub use spool::AccountingWriteSpool;
pub use webhooks::{DispatchOutcome, GatewayEvent, WebhookDispatcher};
pub use worker::{start_webhook_worker, WriteWorker};
pub use writer::{writer_for, Writer};
