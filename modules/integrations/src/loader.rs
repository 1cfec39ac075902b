//! Platform-side loader shared by every external system.
//!
//! Loading is an upsert against the record store plus a mapping write. The
//! fingerprint stored on the mapping short-circuits reloads: a record whose
//! content matches the last confirmed sync produces no write at all, which
//! is what makes at-least-once extraction safe to repeat.

use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use uuid::Uuid;

use crate::error::LoadError;
use crate::models::{
    AccountingRecord, ExternalSystem, ImportOutcome, Mapping, MappingSource, RecordType,
};
use crate::pipeline::Loader;
use crate::repos::{MappingStore, RecordStore};

pub struct PlatformLoader {
    system: ExternalSystem,
    records: Arc<dyn RecordStore>,
    mappings: Arc<dyn MappingStore>,
}

impl PlatformLoader {
    pub fn new(
        system: ExternalSystem,
        records: Arc<dyn RecordStore>,
        mappings: Arc<dyn MappingStore>,
    ) -> Self {
        Self {
            system,
            records,
            mappings,
        }
    }

    fn validate(record: &AccountingRecord) -> Result<(), LoadError> {
        match record {
            AccountingRecord::Customer(c) => {
                if c.display_name.trim().is_empty() {
                    return Err(LoadError::Validation(
                        "customer display_name is empty".into(),
                    ));
                }
            }
            AccountingRecord::Invoice(i) => {
                if i.currency.trim().is_empty() {
                    return Err(LoadError::Validation("invoice currency is empty".into()));
                }
                if i.amount_minor < 0 {
                    return Err(LoadError::Validation(format!(
                        "invoice amount is negative: {}",
                        i.amount_minor
                    )));
                }
            }
            AccountingRecord::Payment(p) => {
                if p.currency.trim().is_empty() {
                    return Err(LoadError::Validation("payment currency is empty".into()));
                }
                if p.amount_minor < 0 {
                    return Err(LoadError::Validation(format!(
                        "payment amount is negative: {}",
                        p.amount_minor
                    )));
                }
            }
        }
        Ok(())
    }

    /// Internal id of the already-linked customer a record references, when
    /// both the reference and its mapping exist.
    async fn linked_customer(
        &self,
        customer_external_id: Option<&str>,
    ) -> Result<Option<Uuid>, LoadError> {
        let Some(external_id) = customer_external_id else {
            return Ok(None);
        };
        let mapping = self
            .mappings
            .find_by_external(self.system, RecordType::Customer, external_id)
            .await?;
        Ok(mapping.map(|m| m.internal_id))
    }

    async fn upsert_record(
        &self,
        tenant_id: &str,
        record: &AccountingRecord,
        existing: Option<Uuid>,
    ) -> Result<Uuid, LoadError> {
        let id = match record {
            AccountingRecord::Customer(c) => {
                self.records.upsert_customer(tenant_id, c, existing).await?
            }
            AccountingRecord::Invoice(i) => {
                let customer = self
                    .linked_customer(i.customer_external_id.as_deref())
                    .await?;
                self.records
                    .upsert_invoice(tenant_id, i, existing, customer)
                    .await?
            }
            AccountingRecord::Payment(p) => {
                let customer = self
                    .linked_customer(p.customer_external_id.as_deref())
                    .await?;
                self.records
                    .upsert_payment(tenant_id, p, existing, customer)
                    .await?
            }
        };
        Ok(id)
    }
}

#[async_trait]
impl Loader for PlatformLoader {
    async fn load(
        &self,
        tenant_id: &str,
        record: &AccountingRecord,
    ) -> Result<ImportOutcome, LoadError> {
        Self::validate(record)?;

        let record_type = record.record_type();
        let fingerprint = record.fingerprint();

        let existing = self
            .mappings
            .find_by_external(self.system, record_type, record.external_id())
            .await?;

        // Same content as the last confirmed sync: nothing to do, and the
        // mapping stays untouched.
        if let Some(mapping) = &existing {
            if mapping.fingerprint.as_deref() == Some(fingerprint.as_str()) {
                return Ok(ImportOutcome::Unchanged);
            }
        }

        if record.is_tombstone() {
            let Some(mapping) = existing else {
                // Retired remotely and never imported here; nothing to undo.
                return Ok(ImportOutcome::Unchanged);
            };
            self.records
                .tombstone(tenant_id, record_type, mapping.internal_id)
                .await?;
            self.mappings
                .upsert(&Mapping {
                    fingerprint: Some(fingerprint),
                    synced_at: Utc::now(),
                    ..mapping
                })
                .await?;
            return Ok(ImportOutcome::Deleted);
        }

        let outcome = if existing.is_some() {
            ImportOutcome::Updated
        } else {
            ImportOutcome::Created
        };

        let internal_id = self
            .upsert_record(tenant_id, record, existing.as_ref().map(|m| m.internal_id))
            .await?;

        // A pre-existing link keeps its original source; only a brand-new
        // link is recorded as externally originated.
        let source = existing
            .as_ref()
            .map(|m| m.source)
            .unwrap_or(MappingSource::External);

        self.mappings
            .upsert(&Mapping {
                internal_id,
                system: self.system,
                record_type,
                external_id: record.external_id().to_string(),
                source,
                fingerprint: Some(fingerprint),
                synced_at: Utc::now(),
            })
            .await?;

        Ok(outcome)
    }
}
