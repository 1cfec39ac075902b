//! TTL leases for cross-process deduplication.
//!
//! Idempotency via lease, not mutex: a lease is acquired non-blockingly and
//! never released. Holding the row *is* the dedup record; expiry reopens the
//! key long after any duplicate delivery window has passed. An occupied
//! lease means someone already claimed the event, and the correct response
//! is to drop, not wait.

use async_trait::async_trait;
use chrono::{Duration, Utc};
use sqlx::PgPool;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Instant;

use crate::error::StoreError;

/// Composite key for entity-level operation leases used elsewhere in the
/// module (webhook dedup keys are built by the dispatcher).
pub fn entity_lease_key(tenant_id: &str, entity_id: &str) -> String {
    format!("{tenant_id}_{entity_id}")
}

#[async_trait]
pub trait LeaseStore: Send + Sync {
    /// Try to claim `key` for `ttl`. `Ok(true)` means this caller owns the
    /// key; `Ok(false)` means it is already held (a duplicate).
    async fn try_acquire(&self, key: &str, ttl: Duration) -> Result<bool, StoreError>;
}

/// Postgres-backed leases. A row is taken over only once it has expired;
/// there is deliberately no delete path.
pub struct PgLeaseStore {
    pool: PgPool,
}

impl PgLeaseStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl LeaseStore for PgLeaseStore {
    async fn try_acquire(&self, key: &str, ttl: Duration) -> Result<bool, StoreError> {
        let expires_at = Utc::now() + ttl;

        let result = sqlx::query(
            r#"
            INSERT INTO integrations_leases (lease_key, expires_at)
            VALUES ($1, $2)
            ON CONFLICT (lease_key) DO UPDATE
            SET expires_at = EXCLUDED.expires_at,
                acquired_at = NOW()
            WHERE integrations_leases.expires_at < NOW()
            "#,
        )
        .bind(key)
        .bind(expires_at)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }
}

/// In-memory leases for tests and single-process development.
#[derive(Default)]
pub struct InMemoryLeaseStore {
    held: Mutex<HashMap<String, Instant>>,
}

impl InMemoryLeaseStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LeaseStore for InMemoryLeaseStore {
    async fn try_acquire(&self, key: &str, ttl: Duration) -> Result<bool, StoreError> {
        let ttl = std::time::Duration::from_millis(ttl.num_milliseconds().max(0) as u64);
        let now = Instant::now();
        let mut held = self.held.lock().expect("lease map poisoned");

        match held.get(key) {
            Some(expires) if *expires > now => Ok(false),
            _ => {
                held.insert(key.to_string(), now + ttl);
                Ok(true)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_second_acquire_is_refused() {
        let store = InMemoryLeaseStore::new();
        assert!(store.try_acquire("k", Duration::days(30)).await.unwrap());
        assert!(!store.try_acquire("k", Duration::days(30)).await.unwrap());
    }

    #[tokio::test]
    async fn test_expired_lease_can_be_retaken() {
        let store = InMemoryLeaseStore::new();
        assert!(store.try_acquire("k", Duration::milliseconds(0)).await.unwrap());
        assert!(store.try_acquire("k", Duration::days(1)).await.unwrap());
    }

    #[test]
    fn test_entity_lease_key_format() {
        assert_eq!(entity_lease_key("tenant-1", "inv-9"), "tenant-1_inv-9");
    }
}
