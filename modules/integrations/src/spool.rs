//! Coalescing buffer for outbound accounting writes.
//!
//! Domain events land here as `(record type, id, event, tenant)`; the spool
//! fans each one out to the tenant's connected systems and keeps at most one
//! pending entry per `type/id/system` key, always reflecting the latest
//! observed event. Entries leave as write jobs on the queue at the flush
//! threshold, on an explicit `flush()`, or on drop.
//!
//! A spool is scoped to one request/worker invocation and is not shared
//! across concurrent scopes. The connected-systems cache is instance state:
//! a connection revoked mid-scope can still receive one final job, which the
//! write worker then drops when the profile is gone.

use std::collections::HashMap;
use std::sync::Arc;

use job_queue::{JobEnvelope, JobQueue};

use crate::error::SyncError;
use crate::metrics::Metrics;
use crate::models::{
    write_subject, ExternalSystem, RecordType, WriteEvent, WriteJob,
};
use crate::repos::{mapping_kind_for, TenantDirectory};

const PRODUCER: &str = "integrations";

#[derive(Debug, Clone)]
struct PendingEntry {
    record_type: RecordType,
    record_id: uuid::Uuid,
    event: WriteEvent,
    tenant_id: String,
    system: ExternalSystem,
}

impl PendingEntry {
    fn key(&self) -> String {
        format!(
            "{}/{}/{}",
            self.record_type.as_str(),
            self.record_id,
            self.system.slug()
        )
    }
}

pub struct AccountingWriteSpool {
    queue: Arc<dyn JobQueue>,
    tenants: Arc<dyn TenantDirectory>,
    metrics: Arc<Metrics>,
    /// Kill switch from config; when false every enqueue is a no-op
    enabled: bool,
    flush_threshold: usize,
    /// Insertion-ordered pending entries; `index` maps key → position so a
    /// re-enqueue overwrites in place and keeps the original order
    pending: Vec<PendingEntry>,
    index: HashMap<String, usize>,
    /// Connected systems resolved once per tenant for this spool's lifetime
    connected: HashMap<String, Arc<Vec<ExternalSystem>>>,
}

impl AccountingWriteSpool {
    pub fn new(
        queue: Arc<dyn JobQueue>,
        tenants: Arc<dyn TenantDirectory>,
        metrics: Arc<Metrics>,
        enabled: bool,
        flush_threshold: usize,
    ) -> Self {
        Self {
            queue,
            tenants,
            metrics,
            enabled,
            flush_threshold: flush_threshold.max(1),
            pending: Vec::new(),
            index: HashMap::new(),
            connected: HashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Record a platform-side mutation for outbound sync. `type_name` is
    /// the domain record's type as emitted by the event system.
    ///
    /// No-ops when the type is not accounting-eligible, outbound sync is
    /// off, or the tenant lacks the capability. Flushes automatically once
    /// the pending count reaches the threshold.
    pub async fn enqueue(
        &mut self,
        type_name: &str,
        record_id: uuid::Uuid,
        event: WriteEvent,
        tenant_id: &str,
    ) -> Result<(), SyncError> {
        let Some(record_type) = mapping_kind_for(type_name) else {
            return Ok(());
        };
        if !self.enabled {
            return Ok(());
        }
        if !self.tenants.accounting_sync_enabled(tenant_id).await? {
            return Ok(());
        }

        let targets = self.targets_for(record_type, tenant_id).await?;
        for system in targets.iter() {
            let entry = PendingEntry {
                record_type,
                record_id,
                event,
                tenant_id: tenant_id.to_string(),
                system: *system,
            };
            let key = entry.key();

            match self.index.get(&key) {
                // Latest event wins; position (and therefore flush order)
                // stays where the key first appeared.
                Some(&pos) => self.pending[pos] = entry,
                None => {
                    self.index.insert(key, self.pending.len());
                    self.pending.push(entry);
                }
            }
        }

        if self.pending.len() >= self.flush_threshold {
            self.metrics
                .spool_flush_total
                .with_label_values(&["threshold"])
                .inc();
            self.flush_pending().await?;
        }

        Ok(())
    }

    /// Drain every pending entry, enqueueing one write job per entry in
    /// insertion order. Returns the number of jobs enqueued.
    pub async fn flush(&mut self) -> Result<usize, SyncError> {
        self.metrics
            .spool_flush_total
            .with_label_values(&["explicit"])
            .inc();
        self.flush_pending().await
    }

    async fn flush_pending(&mut self) -> Result<usize, SyncError> {
        let entries = std::mem::take(&mut self.pending);
        self.index.clear();

        let count = entries.len();
        for entry in entries {
            enqueue_write_job(&self.queue, &entry).await?;
        }

        if count > 0 {
            tracing::debug!(jobs = count, "write spool flushed");
        }
        Ok(count)
    }

    /// Target systems for one record type: normally the tenant's connected
    /// systems; ledger transactions post to QuickBooks only, no matter what
    /// is connected.
    async fn targets_for(
        &mut self,
        record_type: RecordType,
        tenant_id: &str,
    ) -> Result<Arc<Vec<ExternalSystem>>, SyncError> {
        if record_type == RecordType::LedgerTransaction {
            return Ok(Arc::new(vec![ExternalSystem::Quickbooks]));
        }

        if let Some(systems) = self.connected.get(tenant_id) {
            return Ok(systems.clone());
        }

        let systems = Arc::new(self.tenants.connected_systems(tenant_id).await?);
        self.connected
            .insert(tenant_id.to_string(), systems.clone());
        Ok(systems)
    }
}

async fn enqueue_write_job(
    queue: &Arc<dyn JobQueue>,
    entry: &PendingEntry,
) -> Result<(), SyncError> {
    let job = WriteJob {
        record_id: entry.record_id,
        record_type: entry.record_type,
        event: entry.event,
        tenant_id: entry.tenant_id.clone(),
        target_system: entry.system,
    };
    let envelope = JobEnvelope::new(entry.tenant_id.clone(), PRODUCER, job);
    queue
        .enqueue(&write_subject(entry.system), envelope.to_bytes()?)
        .await?;
    Ok(())
}

impl Drop for AccountingWriteSpool {
    /// Scoped-resource guarantee: leftovers are flushed, not dropped.
    ///
    /// Drop cannot await, so the drained entries ride a fire-and-forget
    /// task. Outside a runtime (or if that task dies with the process) the
    /// entries are lost and logged; callers on the happy path flush
    /// explicitly before the scope ends.
    fn drop(&mut self) {
        if self.pending.is_empty() {
            return;
        }

        let entries = std::mem::take(&mut self.pending);
        self.metrics
            .spool_flush_total
            .with_label_values(&["drop"])
            .inc();

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let queue = self.queue.clone();
                let count = entries.len();
                handle.spawn(async move {
                    for entry in entries {
                        if let Err(e) = enqueue_write_job(&queue, &entry).await {
                            tracing::error!(
                                key = %entry.key(),
                                error = %e,
                                "failed to flush spool entry on drop"
                            );
                        }
                    }
                    tracing::debug!(jobs = count, "write spool flushed on drop");
                });
            }
            Err(_) => {
                tracing::error!(
                    dropped = entries.len(),
                    "write spool dropped outside a runtime; pending writes lost"
                );
            }
        }
    }
}
