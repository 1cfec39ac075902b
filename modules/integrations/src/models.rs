use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

// ============================================================================
// EXTERNAL SYSTEMS AND RECORD TYPES
// ============================================================================

/// Accounting systems the platform can connect to.
///
/// One adapter set (extractor/transformer/writer) exists per variant; the
/// factory in `pipeline` resolves it from the slug stored on connections and
/// sync profiles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExternalSystem {
    Quickbooks,
    Xero,
}

impl ExternalSystem {
    pub fn slug(&self) -> &'static str {
        match self {
            ExternalSystem::Quickbooks => "quickbooks",
            ExternalSystem::Xero => "xero",
        }
    }

    pub fn from_slug(slug: &str) -> Option<Self> {
        match slug {
            "quickbooks" => Some(ExternalSystem::Quickbooks),
            "xero" => Some(ExternalSystem::Xero),
            _ => None,
        }
    }
}

impl std::fmt::Display for ExternalSystem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.slug())
    }
}

/// Platform record types the integration engine syncs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordType {
    Customer,
    Invoice,
    Payment,
    LedgerTransaction,
}

impl RecordType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordType::Customer => "customer",
            RecordType::Invoice => "invoice",
            RecordType::Payment => "payment",
            RecordType::LedgerTransaction => "ledger_transaction",
        }
    }

    pub fn from_str_opt(value: &str) -> Option<Self> {
        match value {
            "customer" => Some(RecordType::Customer),
            "invoice" => Some(RecordType::Invoice),
            "payment" => Some(RecordType::Payment),
            "ledger_transaction" => Some(RecordType::LedgerTransaction),
            _ => None,
        }
    }

    /// Record types read from the external system during a sync run, in the
    /// order dependencies require (customers before the records that
    /// reference them).
    pub fn inbound() -> [RecordType; 3] {
        [RecordType::Customer, RecordType::Invoice, RecordType::Payment]
    }
}

impl std::fmt::Display for RecordType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// SYNC PROFILE AND CURSORS
// ============================================================================

/// Resumable read position for one sync profile.
///
/// `updated_after` narrows the remote query to records changed since the
/// last committed page; `page_token` is the opaque in-window position.
/// Both advance together and only after a page fully commits.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReadCursor {
    pub updated_after: Option<DateTime<Utc>>,
    pub page_token: Option<String>,
}

/// Per-tenant configuration for one external accounting system.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncProfile {
    pub id: Uuid,
    pub tenant_id: String,
    pub system: ExternalSystem,
    pub enabled: bool,
    /// External account the profile is bound to (QuickBooks realm id)
    pub external_account_id: String,
    /// Field-mapping document managed by the settings UI
    pub field_mappings: serde_json::Value,
    /// Ordered payment routing rules; first listed wins ties
    pub routing_rules: Vec<RoutingRule>,
    pub read_cursor: ReadCursor,
    pub write_cursor: Option<DateTime<Utc>>,
    pub last_read_at: Option<DateTime<Utc>>,
    pub last_write_at: Option<DateTime<Utc>>,
}

/// Immutable description of one bounded extraction request.
///
/// Built per run from the profile's committed cursor; restarting a stream
/// means issuing a new query with an updated cursor, never resuming a
/// suspended one.
#[derive(Debug, Clone)]
pub struct ReadQuery {
    pub record_type: RecordType,
    pub updated_after: Option<DateTime<Utc>>,
    pub updated_before: Option<DateTime<Utc>>,
    pub page_token: Option<String>,
    pub page_size: u32,
}

impl ReadQuery {
    pub fn from_profile(profile: &SyncProfile, record_type: RecordType, page_size: u32) -> Self {
        Self {
            record_type,
            updated_after: profile.read_cursor.updated_after,
            updated_before: None,
            page_token: profile.read_cursor.page_token.clone(),
            page_size,
        }
    }
}

// ============================================================================
// PIPELINE RECORDS
// ============================================================================

/// One record as read from the external system, before normalization.
#[derive(Debug, Clone)]
pub struct ExternalRecord {
    pub external_id: String,
    pub record_type: RecordType,
    pub payload: serde_json::Value,
    pub remote_updated_at: Option<DateTime<Utc>>,
}

/// Normalized customer ready for the loader.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CustomerRecord {
    pub external_id: String,
    pub display_name: String,
    pub email: Option<String>,
    pub currency: Option<String>,
    pub archived: bool,
}

/// Normalized invoice ready for the loader.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvoiceRecord {
    pub external_id: String,
    pub customer_external_id: Option<String>,
    pub number: Option<String>,
    pub amount_minor: i64,
    pub balance_minor: i64,
    pub currency: String,
    pub issued_on: Option<NaiveDate>,
    pub due_on: Option<NaiveDate>,
    pub voided: bool,
}

/// Normalized payment ready for the loader.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentRecord {
    pub external_id: String,
    pub customer_external_id: Option<String>,
    pub amount_minor: i64,
    pub currency: String,
    pub received_on: Option<NaiveDate>,
    pub deposit_account: Option<String>,
}

/// Output of a transformer: one typed platform-side value object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AccountingRecord {
    Customer(CustomerRecord),
    Invoice(InvoiceRecord),
    Payment(PaymentRecord),
}

impl AccountingRecord {
    pub fn record_type(&self) -> RecordType {
        match self {
            AccountingRecord::Customer(_) => RecordType::Customer,
            AccountingRecord::Invoice(_) => RecordType::Invoice,
            AccountingRecord::Payment(_) => RecordType::Payment,
        }
    }

    pub fn external_id(&self) -> &str {
        match self {
            AccountingRecord::Customer(c) => &c.external_id,
            AccountingRecord::Invoice(i) => &i.external_id,
            AccountingRecord::Payment(p) => &p.external_id,
        }
    }

    /// Whether the remote side retired this record (void/archive); the
    /// loader turns these into tombstones instead of upserts.
    pub fn is_tombstone(&self) -> bool {
        match self {
            AccountingRecord::Customer(c) => c.archived,
            AccountingRecord::Invoice(i) => i.voided,
            AccountingRecord::Payment(_) => false,
        }
    }

    /// Content fingerprint used for the loader's no-op short-circuit:
    /// loading a record whose fingerprint matches the mapping's stored one
    /// produces no write at all.
    pub fn fingerprint(&self) -> String {
        let canonical =
            serde_json::to_vec(self).expect("accounting records always serialize");
        hex::encode(Sha256::digest(&canonical))
    }
}

/// Net effect of one `Loader::load` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImportOutcome {
    Created,
    Updated,
    Deleted,
    Unchanged,
}

// ============================================================================
// RUN REPORTING
// ============================================================================

/// Pipeline stage a record-level failure occurred in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureStage {
    Transform,
    Load,
}

impl FailureStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureStage::Transform => "transform",
            FailureStage::Load => "load",
        }
    }
}

/// One record that failed during a run, with the reason kept for the report.
#[derive(Debug, Clone)]
pub struct RecordFailure {
    pub external_id: String,
    pub record_type: RecordType,
    pub stage: FailureStage,
    pub reason: String,
}

/// Aggregated result of one sync run. Partial success is the normal case:
/// failed records are listed, not raised.
#[derive(Debug, Clone, Default)]
pub struct SyncRunReport {
    pub created: usize,
    pub updated: usize,
    pub deleted: usize,
    pub unchanged: usize,
    pub skipped: usize,
    pub pages: usize,
    pub failures: Vec<RecordFailure>,
}

impl SyncRunReport {
    pub fn count(&mut self, outcome: ImportOutcome) {
        match outcome {
            ImportOutcome::Created => self.created += 1,
            ImportOutcome::Updated => self.updated += 1,
            ImportOutcome::Deleted => self.deleted += 1,
            ImportOutcome::Unchanged => self.unchanged += 1,
        }
    }

    pub fn failed(&self) -> usize {
        self.failures.len()
    }

    pub fn merge(&mut self, other: SyncRunReport) {
        self.created += other.created;
        self.updated += other.updated;
        self.deleted += other.deleted;
        self.unchanged += other.unchanged;
        self.skipped += other.skipped;
        self.pages += other.pages;
        self.failures.extend(other.failures);
    }
}

// ============================================================================
// MAPPINGS
// ============================================================================

/// Which side of the integration created the link.
///
/// An externally-sourced mapping must never be silently replaced by an
/// internally-initiated write; the writer consults this before creating.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MappingSource {
    Platform,
    External,
}

impl MappingSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            MappingSource::Platform => "platform",
            MappingSource::External => "external",
        }
    }

    pub fn from_str_opt(value: &str) -> Option<Self> {
        match value {
            "platform" => Some(MappingSource::Platform),
            "external" => Some(MappingSource::External),
            _ => None,
        }
    }
}

/// Durable link between a platform record and its external counterpart.
///
/// At most one mapping exists per `(internal_id, system)`; the store
/// enforces this with a unique index and upsert semantics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Mapping {
    pub internal_id: Uuid,
    pub system: ExternalSystem,
    pub record_type: RecordType,
    pub external_id: String,
    pub source: MappingSource,
    /// Fingerprint of the record content at the last confirmed sync
    pub fingerprint: Option<String>,
    pub synced_at: DateTime<Utc>,
}

// ============================================================================
// PAYMENT ROUTING
// ============================================================================

/// One scored routing rule from a sync profile. `None` (or `"*"` from the
/// settings UI) wildcards a dimension.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutingRule {
    #[serde(default)]
    pub currency: Option<String>,
    #[serde(default)]
    pub payment_method: Option<String>,
    #[serde(default)]
    pub merchant_account: Option<String>,
    /// Ledger account payments matching this rule post to
    pub target_account: String,
    /// Post through the undeposited-funds holding account first
    #[serde(default)]
    pub undeposited_funds: bool,
}

/// The dimensions of one payment that routing scores rules against.
#[derive(Debug, Clone, PartialEq)]
pub struct PaymentRoute {
    pub currency: String,
    pub payment_method: String,
    pub merchant_account: String,
}

// ============================================================================
// QUEUE JOB PAYLOADS
// ============================================================================

/// Mutation kind observed on a platform record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteEvent {
    Created,
    Updated,
    Deleted,
}

impl WriteEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            WriteEvent::Created => "created",
            WriteEvent::Updated => "updated",
            WriteEvent::Deleted => "deleted",
        }
    }
}

/// Body of one outbound write job. The worker re-resolves the live record
/// by id + type; the spool never serializes the record itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WriteJob {
    pub record_id: Uuid,
    pub record_type: RecordType,
    pub event: WriteEvent,
    pub tenant_id: String,
    pub target_system: ExternalSystem,
}

/// Body of one webhook processing job: the raw gateway payload plus the
/// resolved tenant and an optional delay to absorb gateway-side lag.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookJob {
    pub event: serde_json::Value,
    pub tenant_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delay_seconds: Option<u64>,
}

/// Queue subject for outbound writes to one system.
pub fn write_subject(system: ExternalSystem) -> String {
    format!("integrations.write.{}", system.slug())
}

/// Queue subject for tenant-scoped webhook processing jobs.
pub fn webhook_subject(gateway: &str) -> String {
    format!("integrations.webhook.{gateway}")
}
