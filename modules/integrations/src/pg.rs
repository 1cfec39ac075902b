//! Postgres implementations of the repository traits.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::credentials::CredentialVault;
use crate::error::{StoreError, SyncError};
use crate::models::{
    ExternalSystem, Mapping, MappingSource, ReadCursor, RecordType, SyncProfile,
};
use crate::models::{CustomerRecord, InvoiceRecord, PaymentRecord};
use crate::repos::{
    EventReference, FailedWriteStore, GatewayRecordFinder, MappingStore, RecordSnapshot,
    RecordStore, SyncProfileStore, TenantDirectory,
};
use crate::worker::WebhookProcessor;

fn decode_system(slug: &str) -> Result<ExternalSystem, StoreError> {
    ExternalSystem::from_slug(slug)
        .ok_or_else(|| StoreError::Decode(format!("unknown external system '{slug}'")))
}

fn decode_record_type(value: &str) -> Result<RecordType, StoreError> {
    RecordType::from_str_opt(value)
        .ok_or_else(|| StoreError::Decode(format!("unknown record type '{value}'")))
}

fn decode_source(value: &str) -> Result<MappingSource, StoreError> {
    MappingSource::from_str_opt(value)
        .ok_or_else(|| StoreError::Decode(format!("unknown mapping source '{value}'")))
}

// ============================================================================
// SYNC PROFILES
// ============================================================================

pub struct PgSyncProfileStore {
    pool: PgPool,
}

impl PgSyncProfileStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn from_row(row: &sqlx::postgres::PgRow) -> Result<SyncProfile, StoreError> {
        let system: String = row.try_get("system")?;
        let routing_rules: serde_json::Value = row.try_get("routing_rules")?;
        let routing_rules = serde_json::from_value(routing_rules)
            .map_err(|e| StoreError::Decode(format!("routing_rules: {e}")))?;

        Ok(SyncProfile {
            id: row.try_get("id")?,
            tenant_id: row.try_get("tenant_id")?,
            system: decode_system(&system)?,
            enabled: row.try_get("enabled")?,
            external_account_id: row.try_get("external_account_id")?,
            field_mappings: row.try_get("field_mappings")?,
            routing_rules,
            read_cursor: ReadCursor {
                updated_after: row.try_get("read_updated_after")?,
                page_token: row.try_get("read_page_token")?,
            },
            write_cursor: row.try_get("write_cursor")?,
            last_read_at: row.try_get("last_read_at")?,
            last_write_at: row.try_get("last_write_at")?,
        })
    }
}

const PROFILE_COLUMNS: &str = "id, tenant_id, system, enabled, external_account_id, \
     field_mappings, routing_rules, read_updated_after, read_page_token, write_cursor, \
     last_read_at, last_write_at";

#[async_trait]
impl SyncProfileStore for PgSyncProfileStore {
    async fn get(
        &self,
        tenant_id: &str,
        system: ExternalSystem,
    ) -> Result<Option<SyncProfile>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {PROFILE_COLUMNS} FROM integrations_sync_profiles \
             WHERE tenant_id = $1 AND system = $2"
        ))
        .bind(tenant_id)
        .bind(system.slug())
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(Self::from_row).transpose()
    }

    async fn list_enabled(&self) -> Result<Vec<SyncProfile>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {PROFILE_COLUMNS} FROM integrations_sync_profiles \
             WHERE enabled ORDER BY tenant_id, system"
        ))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::from_row).collect()
    }

    async fn advance_read_cursor(
        &self,
        profile_id: Uuid,
        cursor: &ReadCursor,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE integrations_sync_profiles
            SET read_updated_after = $2,
                read_page_token = $3,
                last_read_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(profile_id)
        .bind(cursor.updated_after)
        .bind(&cursor.page_token)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn touch_last_write(
        &self,
        profile_id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE integrations_sync_profiles
            SET last_write_at = $2,
                write_cursor = GREATEST(COALESCE(write_cursor, $2), $2)
            WHERE id = $1
            "#,
        )
        .bind(profile_id)
        .bind(at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

// ============================================================================
// MAPPINGS
// ============================================================================

pub struct PgMappingStore {
    pool: PgPool,
}

impl PgMappingStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn from_row(row: &sqlx::postgres::PgRow) -> Result<Mapping, StoreError> {
        let system: String = row.try_get("system")?;
        let record_type: String = row.try_get("record_type")?;
        let source: String = row.try_get("source")?;

        Ok(Mapping {
            internal_id: row.try_get("internal_id")?,
            system: decode_system(&system)?,
            record_type: decode_record_type(&record_type)?,
            external_id: row.try_get("external_id")?,
            source: decode_source(&source)?,
            fingerprint: row.try_get("fingerprint")?,
            synced_at: row.try_get("synced_at")?,
        })
    }
}

const MAPPING_COLUMNS: &str =
    "internal_id, system, record_type, external_id, source, fingerprint, synced_at";

#[async_trait]
impl MappingStore for PgMappingStore {
    async fn find_by_external(
        &self,
        system: ExternalSystem,
        record_type: RecordType,
        external_id: &str,
    ) -> Result<Option<Mapping>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {MAPPING_COLUMNS} FROM integrations_record_mappings \
             WHERE system = $1 AND record_type = $2 AND external_id = $3"
        ))
        .bind(system.slug())
        .bind(record_type.as_str())
        .bind(external_id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(Self::from_row).transpose()
    }

    async fn find_by_internal(
        &self,
        system: ExternalSystem,
        record_type: RecordType,
        internal_id: Uuid,
    ) -> Result<Option<Mapping>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {MAPPING_COLUMNS} FROM integrations_record_mappings \
             WHERE system = $1 AND record_type = $2 AND internal_id = $3"
        ))
        .bind(system.slug())
        .bind(record_type.as_str())
        .bind(internal_id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(Self::from_row).transpose()
    }

    async fn upsert(&self, mapping: &Mapping) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO integrations_record_mappings
                (internal_id, system, record_type, external_id, source, fingerprint, synced_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (internal_id, system) DO UPDATE
            SET external_id = EXCLUDED.external_id,
                source = EXCLUDED.source,
                fingerprint = EXCLUDED.fingerprint,
                synced_at = EXCLUDED.synced_at
            "#,
        )
        .bind(mapping.internal_id)
        .bind(mapping.system.slug())
        .bind(mapping.record_type.as_str())
        .bind(&mapping.external_id)
        .bind(mapping.source.as_str())
        .bind(&mapping.fingerprint)
        .bind(mapping.synced_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete(
        &self,
        system: ExternalSystem,
        record_type: RecordType,
        internal_id: Uuid,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "DELETE FROM integrations_record_mappings \
             WHERE system = $1 AND record_type = $2 AND internal_id = $3",
        )
        .bind(system.slug())
        .bind(record_type.as_str())
        .bind(internal_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

// ============================================================================
// DOMAIN RECORDS
// ============================================================================

pub struct PgRecordStore {
    pool: PgPool,
}

impl PgRecordStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RecordStore for PgRecordStore {
    async fn upsert_customer(
        &self,
        tenant_id: &str,
        record: &CustomerRecord,
        existing: Option<Uuid>,
    ) -> Result<Uuid, StoreError> {
        let id = existing.unwrap_or_else(Uuid::new_v4);
        sqlx::query(
            r#"
            INSERT INTO billing_customers
                (id, tenant_id, display_name, email, currency, archived, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, NOW())
            ON CONFLICT (id) DO UPDATE
            SET display_name = EXCLUDED.display_name,
                email = EXCLUDED.email,
                currency = EXCLUDED.currency,
                archived = EXCLUDED.archived,
                updated_at = NOW()
            "#,
        )
        .bind(id)
        .bind(tenant_id)
        .bind(&record.display_name)
        .bind(&record.email)
        .bind(&record.currency)
        .bind(record.archived)
        .execute(&self.pool)
        .await?;
        Ok(id)
    }

    async fn upsert_invoice(
        &self,
        tenant_id: &str,
        record: &InvoiceRecord,
        existing: Option<Uuid>,
        customer_id: Option<Uuid>,
    ) -> Result<Uuid, StoreError> {
        let id = existing.unwrap_or_else(Uuid::new_v4);
        sqlx::query(
            r#"
            INSERT INTO billing_invoices
                (id, tenant_id, customer_id, number, amount_minor, balance_minor, currency,
                 issued_on, due_on, voided, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, NOW())
            ON CONFLICT (id) DO UPDATE
            SET customer_id = COALESCE(EXCLUDED.customer_id, billing_invoices.customer_id),
                number = EXCLUDED.number,
                amount_minor = EXCLUDED.amount_minor,
                balance_minor = EXCLUDED.balance_minor,
                currency = EXCLUDED.currency,
                issued_on = EXCLUDED.issued_on,
                due_on = EXCLUDED.due_on,
                voided = EXCLUDED.voided,
                updated_at = NOW()
            "#,
        )
        .bind(id)
        .bind(tenant_id)
        .bind(customer_id)
        .bind(&record.number)
        .bind(record.amount_minor)
        .bind(record.balance_minor)
        .bind(&record.currency)
        .bind(record.issued_on)
        .bind(record.due_on)
        .bind(record.voided)
        .execute(&self.pool)
        .await?;
        Ok(id)
    }

    async fn upsert_payment(
        &self,
        tenant_id: &str,
        record: &PaymentRecord,
        existing: Option<Uuid>,
        customer_id: Option<Uuid>,
    ) -> Result<Uuid, StoreError> {
        let id = existing.unwrap_or_else(Uuid::new_v4);
        sqlx::query(
            r#"
            INSERT INTO billing_payments
                (id, tenant_id, customer_id, amount_minor, currency, received_on, voided, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, false, NOW())
            ON CONFLICT (id) DO UPDATE
            SET customer_id = COALESCE(EXCLUDED.customer_id, billing_payments.customer_id),
                amount_minor = EXCLUDED.amount_minor,
                currency = EXCLUDED.currency,
                received_on = EXCLUDED.received_on,
                updated_at = NOW()
            "#,
        )
        .bind(id)
        .bind(tenant_id)
        .bind(customer_id)
        .bind(record.amount_minor)
        .bind(&record.currency)
        .bind(record.received_on)
        .execute(&self.pool)
        .await?;
        Ok(id)
    }

    async fn tombstone(
        &self,
        tenant_id: &str,
        record_type: RecordType,
        internal_id: Uuid,
    ) -> Result<(), StoreError> {
        let statement = match record_type {
            RecordType::Customer => {
                "UPDATE billing_customers SET archived = true, updated_at = NOW() \
                 WHERE id = $1 AND tenant_id = $2"
            }
            RecordType::Invoice => {
                "UPDATE billing_invoices SET voided = true, updated_at = NOW() \
                 WHERE id = $1 AND tenant_id = $2"
            }
            RecordType::Payment => {
                "UPDATE billing_payments SET voided = true, updated_at = NOW() \
                 WHERE id = $1 AND tenant_id = $2"
            }
            // Ledger transactions are never tombstoned from the inbound side.
            RecordType::LedgerTransaction => return Ok(()),
        };

        sqlx::query(statement)
            .bind(internal_id)
            .bind(tenant_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn snapshot(
        &self,
        tenant_id: &str,
        record_type: RecordType,
        record_id: Uuid,
    ) -> Result<Option<RecordSnapshot>, StoreError> {
        let data = match record_type {
            RecordType::Customer => {
                let row = sqlx::query(
                    "SELECT display_name, email, currency FROM billing_customers \
                     WHERE id = $1 AND tenant_id = $2",
                )
                .bind(record_id)
                .bind(tenant_id)
                .fetch_optional(&self.pool)
                .await?;
                row.map(|row| -> Result<serde_json::Value, StoreError> {
                    Ok(serde_json::json!({
                        "display_name": row.try_get::<String, _>("display_name")?,
                        "email": row.try_get::<Option<String>, _>("email")?,
                        "currency": row.try_get::<Option<String>, _>("currency")?,
                    }))
                })
                .transpose()?
            }
            RecordType::Invoice => {
                let row = sqlx::query(
                    "SELECT number, amount_minor, balance_minor, currency, customer_id, \
                            issued_on, due_on \
                     FROM billing_invoices WHERE id = $1 AND tenant_id = $2",
                )
                .bind(record_id)
                .bind(tenant_id)
                .fetch_optional(&self.pool)
                .await?;
                row.map(|row| -> Result<serde_json::Value, StoreError> {
                    Ok(serde_json::json!({
                        "number": row.try_get::<Option<String>, _>("number")?,
                        "amount_minor": row.try_get::<i64, _>("amount_minor")?,
                        "balance_minor": row.try_get::<i64, _>("balance_minor")?,
                        "currency": row.try_get::<String, _>("currency")?,
                        "customer_id": row.try_get::<Option<Uuid>, _>("customer_id")?,
                        "issued_on": row.try_get::<Option<NaiveDate>, _>("issued_on")?,
                        "due_on": row.try_get::<Option<NaiveDate>, _>("due_on")?,
                    }))
                })
                .transpose()?
            }
            RecordType::Payment => {
                let row = sqlx::query(
                    "SELECT amount_minor, currency, customer_id, payment_method, \
                            merchant_account, received_on \
                     FROM billing_payments WHERE id = $1 AND tenant_id = $2",
                )
                .bind(record_id)
                .bind(tenant_id)
                .fetch_optional(&self.pool)
                .await?;
                row.map(|row| -> Result<serde_json::Value, StoreError> {
                    Ok(serde_json::json!({
                        "amount_minor": row.try_get::<i64, _>("amount_minor")?,
                        "currency": row.try_get::<String, _>("currency")?,
                        "customer_id": row.try_get::<Option<Uuid>, _>("customer_id")?,
                        "payment_method": row.try_get::<Option<String>, _>("payment_method")?,
                        "merchant_account": row.try_get::<Option<String>, _>("merchant_account")?,
                        "received_on": row.try_get::<Option<NaiveDate>, _>("received_on")?,
                    }))
                })
                .transpose()?
            }
            RecordType::LedgerTransaction => {
                let row = sqlx::query(
                    "SELECT memo, lines FROM billing_ledger_transactions \
                     WHERE id = $1 AND tenant_id = $2",
                )
                .bind(record_id)
                .bind(tenant_id)
                .fetch_optional(&self.pool)
                .await?;
                row.map(|row| -> Result<serde_json::Value, StoreError> {
                    Ok(serde_json::json!({
                        "memo": row.try_get::<Option<String>, _>("memo")?,
                        "lines": row.try_get::<serde_json::Value, _>("lines")?,
                    }))
                })
                .transpose()?
            }
        };

        Ok(data.map(|data| RecordSnapshot {
            record_id,
            record_type,
            tenant_id: tenant_id.to_string(),
            data,
        }))
    }
}

// ============================================================================
// TENANT DIRECTORY
// ============================================================================

pub struct PgTenantDirectory {
    pool: PgPool,
    vault: CredentialVault,
}

impl PgTenantDirectory {
    pub fn new(pool: PgPool, vault: CredentialVault) -> Self {
        Self { pool, vault }
    }
}

#[async_trait]
impl TenantDirectory for PgTenantDirectory {
    async fn accounting_sync_enabled(&self, tenant_id: &str) -> Result<bool, StoreError> {
        let row =
            sqlx::query("SELECT accounting_sync_enabled FROM tenants WHERE id = $1")
                .bind(tenant_id)
                .fetch_optional(&self.pool)
                .await?;

        Ok(row
            .map(|row| row.try_get("accounting_sync_enabled"))
            .transpose()?
            .unwrap_or(false))
    }

    async fn connected_systems(
        &self,
        tenant_id: &str,
    ) -> Result<Vec<ExternalSystem>, StoreError> {
        let rows = sqlx::query(
            "SELECT system FROM integrations_connections \
             WHERE tenant_id = $1 AND status = 'connected' ORDER BY system",
        )
        .bind(tenant_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                let slug: String = row.try_get("system")?;
                decode_system(&slug)
            })
            .collect()
    }

    async fn credentials(
        &self,
        tenant_id: &str,
        system: ExternalSystem,
    ) -> Result<Option<serde_json::Value>, StoreError> {
        let row = sqlx::query(
            "SELECT credentials FROM integrations_connections \
             WHERE tenant_id = $1 AND system = $2 AND status = 'connected'",
        )
        .bind(tenant_id)
        .bind(system.slug())
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => {
                let sealed: String = row.try_get("credentials")?;
                Ok(Some(self.vault.open(&sealed)?))
            }
            None => Ok(None),
        }
    }
}

// ============================================================================
// GATEWAY OWNER LOOKUP
// ============================================================================

/// Tenant resolution for inbound gateway events. Deliberately unscoped: the
/// event arrives with no tenant context, so the lookup spans all tenants and
/// the caller scopes everything afterwards to the tenant returned.
pub struct PgGatewayRecordFinder {
    pool: PgPool,
}

impl PgGatewayRecordFinder {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl GatewayRecordFinder for PgGatewayRecordFinder {
    async fn find_owner(
        &self,
        reference: &EventReference,
    ) -> Result<Option<String>, StoreError> {
        let (statement, id) = match reference {
            EventReference::Charge(id) => (
                "SELECT tenant_id FROM billing_payments WHERE processor_charge_id = $1",
                id,
            ),
            EventReference::Dispute(id) => (
                "SELECT tenant_id FROM billing_disputes WHERE processor_dispute_id = $1",
                id,
            ),
            EventReference::PaymentFlow(id) => (
                "SELECT tenant_id FROM billing_payment_flows WHERE processor_ref = $1",
                id,
            ),
        };

        let row = sqlx::query(statement)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|row| row.try_get("tenant_id"))
            .transpose()
            .map_err(StoreError::from)
    }
}

// ============================================================================
// DEAD LETTERS AND WEBHOOK AUDIT
// ============================================================================

pub struct PgFailedWriteStore {
    pool: PgPool,
}

impl PgFailedWriteStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl FailedWriteStore for PgFailedWriteStore {
    async fn insert_failed(
        &self,
        job_id: Uuid,
        subject: &str,
        payload: &serde_json::Value,
        error: &str,
        attempts: i32,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO integrations_failed_writes (job_id, subject, payload, error, attempts)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (job_id) DO UPDATE
            SET error = EXCLUDED.error,
                attempts = EXCLUDED.attempts,
                failed_at = NOW()
            "#,
        )
        .bind(job_id)
        .bind(subject)
        .bind(payload)
        .bind(error)
        .bind(attempts)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

/// Default webhook job processing: record the event for the tenant's audit
/// trail. Module-specific consumers subscribe to the same subject for the
/// actual domain effects.
pub struct PgWebhookAudit {
    pool: PgPool,
}

impl PgWebhookAudit {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl WebhookProcessor for PgWebhookAudit {
    async fn process(
        &self,
        tenant_id: &str,
        event: &serde_json::Value,
    ) -> Result<(), SyncError> {
        let event_type = event
            .get("type")
            .and_then(|v| v.as_str())
            .unwrap_or("unknown");

        sqlx::query(
            r#"
            INSERT INTO integrations_webhook_audit (tenant_id, event_type, payload)
            VALUES ($1, $2, $3)
            "#,
        )
        .bind(tenant_id)
        .bind(event_type)
        .bind(event)
        .execute(&self.pool)
        .await
        .map_err(StoreError::from)?;
        Ok(())
    }
}
