//! Repository traits the engine is written against.
//!
//! Each trait has a Postgres implementation in `pg`; tests substitute
//! in-memory fakes. The engine never touches a pool directly.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::StoreError;
use crate::models::{
    CustomerRecord, ExternalSystem, InvoiceRecord, Mapping, PaymentRecord, ReadCursor,
    RecordType, SyncProfile,
};

/// Sync profile persistence, including cursor advancement.
#[async_trait]
pub trait SyncProfileStore: Send + Sync {
    async fn get(
        &self,
        tenant_id: &str,
        system: ExternalSystem,
    ) -> Result<Option<SyncProfile>, StoreError>;

    /// Profiles eligible for the scheduler sweep.
    async fn list_enabled(&self) -> Result<Vec<SyncProfile>, StoreError>;

    /// Commit a fully-processed page: the cursor only ever moves here.
    async fn advance_read_cursor(
        &self,
        profile_id: Uuid,
        cursor: &ReadCursor,
    ) -> Result<(), StoreError>;

    async fn touch_last_write(
        &self,
        profile_id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError>;
}

/// Durable external-id links.
#[async_trait]
pub trait MappingStore: Send + Sync {
    async fn find_by_external(
        &self,
        system: ExternalSystem,
        record_type: RecordType,
        external_id: &str,
    ) -> Result<Option<Mapping>, StoreError>;

    async fn find_by_internal(
        &self,
        system: ExternalSystem,
        record_type: RecordType,
        internal_id: Uuid,
    ) -> Result<Option<Mapping>, StoreError>;

    /// Insert or replace the mapping for `(internal_id, system)`.
    async fn upsert(&self, mapping: &Mapping) -> Result<(), StoreError>;

    async fn delete(
        &self,
        system: ExternalSystem,
        record_type: RecordType,
        internal_id: Uuid,
    ) -> Result<(), StoreError>;
}

/// Resolve a domain record's type name to its mapping kind, or `None` when
/// the type is not accounting-integration-eligible (the caller drops the
/// work instead of erroring).
pub fn mapping_kind_for(type_name: &str) -> Option<RecordType> {
    RecordType::from_str_opt(type_name)
}

/// A live platform record resolved for the write worker.
#[derive(Debug, Clone)]
pub struct RecordSnapshot {
    pub record_id: Uuid,
    pub record_type: RecordType,
    pub tenant_id: String,
    pub data: serde_json::Value,
}

/// Platform-side persistence of the domain records the pipeline loads.
///
/// `existing` carries the internal id from the mapping lookup so an upsert
/// can target the already-linked row instead of matching on natural keys.
#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn upsert_customer(
        &self,
        tenant_id: &str,
        record: &CustomerRecord,
        existing: Option<Uuid>,
    ) -> Result<Uuid, StoreError>;

    async fn upsert_invoice(
        &self,
        tenant_id: &str,
        record: &InvoiceRecord,
        existing: Option<Uuid>,
        customer_id: Option<Uuid>,
    ) -> Result<Uuid, StoreError>;

    async fn upsert_payment(
        &self,
        tenant_id: &str,
        record: &PaymentRecord,
        existing: Option<Uuid>,
        customer_id: Option<Uuid>,
    ) -> Result<Uuid, StoreError>;

    /// Soft-delete a record the external system voided or archived.
    async fn tombstone(
        &self,
        tenant_id: &str,
        record_type: RecordType,
        internal_id: Uuid,
    ) -> Result<(), StoreError>;

    /// Re-resolve a live record by id + type for an outbound write.
    async fn snapshot(
        &self,
        tenant_id: &str,
        record_type: RecordType,
        record_id: Uuid,
    ) -> Result<Option<RecordSnapshot>, StoreError>;
}

/// Tenant capability flags, connected external systems, and their
/// credentials.
#[async_trait]
pub trait TenantDirectory: Send + Sync {
    async fn accounting_sync_enabled(&self, tenant_id: &str) -> Result<bool, StoreError>;

    async fn connected_systems(
        &self,
        tenant_id: &str,
    ) -> Result<Vec<ExternalSystem>, StoreError>;

    /// Decrypted credential document for one connection, or `None` when the
    /// system is not connected for this tenant.
    async fn credentials(
        &self,
        tenant_id: &str,
        system: ExternalSystem,
    ) -> Result<Option<serde_json::Value>, StoreError>;
}

/// Reference a webhook handler extracted from an event payload; the owning
/// tenant is found by looking this up without tenant scoping (the event
/// arrives with no tenant context).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EventReference {
    Charge(String),
    Dispute(String),
    PaymentFlow(String),
}

/// Global lookup of the tenant owning a gateway object.
#[async_trait]
pub trait GatewayRecordFinder: Send + Sync {
    async fn find_owner(
        &self,
        reference: &EventReference,
    ) -> Result<Option<String>, StoreError>;
}

/// Dead-letter persistence for write jobs that exhausted their retries.
#[async_trait]
pub trait FailedWriteStore: Send + Sync {
    async fn insert_failed(
        &self,
        job_id: Uuid,
        subject: &str,
        payload: &serde_json::Value,
        error: &str,
        attempts: i32,
    ) -> Result<(), StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mapping_kind_resolution() {
        assert_eq!(mapping_kind_for("invoice"), Some(RecordType::Invoice));
        assert_eq!(
            mapping_kind_for("ledger_transaction"),
            Some(RecordType::LedgerTransaction)
        );
        // Types outside the integration surface resolve to nothing and the
        // caller drops the work.
        assert_eq!(mapping_kind_for("webhook_log"), None);
    }
}
