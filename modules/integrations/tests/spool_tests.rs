//! Write spool behavior: coalescing, threshold flush, capability gates, the
//! ledger-transaction exemption, and flush-on-drop.

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use job_queue::{InMemoryQueue, JobEnvelope, JobQueue};

use integrations_rs::error::StoreError;
use integrations_rs::metrics::Metrics;
use integrations_rs::models::{ExternalSystem, WriteEvent, WriteJob};
use integrations_rs::repos::TenantDirectory;
use integrations_rs::spool::AccountingWriteSpool;

struct FakeDirectory {
    capability: bool,
    systems: Vec<ExternalSystem>,
    lookups: AtomicUsize,
}

impl FakeDirectory {
    fn new(capability: bool, systems: Vec<ExternalSystem>) -> Self {
        Self {
            capability,
            systems,
            lookups: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl TenantDirectory for FakeDirectory {
    async fn accounting_sync_enabled(&self, _tenant_id: &str) -> Result<bool, StoreError> {
        Ok(self.capability)
    }

    async fn connected_systems(
        &self,
        _tenant_id: &str,
    ) -> Result<Vec<ExternalSystem>, StoreError> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        Ok(self.systems.clone())
    }

    async fn credentials(
        &self,
        _tenant_id: &str,
        _system: ExternalSystem,
    ) -> Result<Option<serde_json::Value>, StoreError> {
        Ok(None)
    }
}

fn spool_with(
    queue: Arc<InMemoryQueue>,
    directory: Arc<FakeDirectory>,
    enabled: bool,
    threshold: usize,
) -> AccountingWriteSpool {
    AccountingWriteSpool::new(
        queue,
        directory,
        Arc::new(Metrics::new()),
        enabled,
        threshold,
    )
}

async fn drain_jobs(
    stream: &mut BoxStream<'static, job_queue::QueuedJob>,
) -> Vec<(String, WriteJob)> {
    let mut jobs = Vec::new();
    while let Ok(Some(job)) =
        tokio::time::timeout(Duration::from_millis(200), stream.next()).await
    {
        let envelope: JobEnvelope<WriteJob> = JobEnvelope::from_bytes(&job.payload).unwrap();
        jobs.push((job.subject, envelope.body));
    }
    jobs
}

#[tokio::test]
async fn same_key_coalesces_to_one_job_with_the_latest_event() {
    let queue = Arc::new(InMemoryQueue::new());
    let directory = Arc::new(FakeDirectory::new(true, vec![ExternalSystem::Quickbooks]));
    let mut stream = queue.consume("integrations.write.>").await.unwrap();

    let mut spool = spool_with(queue.clone(), directory, true, 100);
    let record_id = Uuid::new_v4();

    spool
        .enqueue("invoice", record_id, WriteEvent::Created, "tenant-1")
        .await
        .unwrap();
    spool
        .enqueue("invoice", record_id, WriteEvent::Updated, "tenant-1")
        .await
        .unwrap();
    assert_eq!(spool.len(), 1);

    let flushed = spool.flush().await.unwrap();
    assert_eq!(flushed, 1);

    let jobs = drain_jobs(&mut stream).await;
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].1.event, WriteEvent::Updated, "latest event wins");
}

#[tokio::test]
async fn reaching_the_threshold_flushes_automatically() {
    let queue = Arc::new(InMemoryQueue::new());
    let directory = Arc::new(FakeDirectory::new(true, vec![ExternalSystem::Quickbooks]));
    let mut stream = queue.consume("integrations.write.>").await.unwrap();

    let mut spool = spool_with(queue.clone(), directory, true, 3);
    for _ in 0..2 {
        spool
            .enqueue(
                "customer",
                Uuid::new_v4(),
                WriteEvent::Updated,
                "tenant-1",
            )
            .await
            .unwrap();
    }
    assert_eq!(spool.len(), 2, "below threshold, nothing flushed");

    spool
        .enqueue(
            "customer",
            Uuid::new_v4(),
            WriteEvent::Updated,
            "tenant-1",
        )
        .await
        .unwrap();
    assert!(spool.is_empty(), "threshold flush drained the spool");

    let jobs = drain_jobs(&mut stream).await;
    assert_eq!(jobs.len(), 3);
}

#[tokio::test]
async fn flush_preserves_first_insertion_order() {
    let queue = Arc::new(InMemoryQueue::new());
    let directory = Arc::new(FakeDirectory::new(true, vec![ExternalSystem::Quickbooks]));
    let mut stream = queue.consume("integrations.write.>").await.unwrap();

    let mut spool = spool_with(queue.clone(), directory, true, 100);
    let first = Uuid::new_v4();
    let second = Uuid::new_v4();

    spool
        .enqueue("customer", first, WriteEvent::Created, "tenant-1")
        .await
        .unwrap();
    spool
        .enqueue("customer", second, WriteEvent::Created, "tenant-1")
        .await
        .unwrap();
    // Re-enqueue of the first key must not move it to the back.
    spool
        .enqueue("customer", first, WriteEvent::Updated, "tenant-1")
        .await
        .unwrap();
    spool.flush().await.unwrap();

    let jobs = drain_jobs(&mut stream).await;
    assert_eq!(jobs.len(), 2);
    assert_eq!(jobs[0].1.record_id, first);
    assert_eq!(jobs[1].1.record_id, second);
}

#[tokio::test]
async fn missing_capability_makes_enqueue_a_no_op() {
    let queue = Arc::new(InMemoryQueue::new());
    let directory = Arc::new(FakeDirectory::new(false, vec![ExternalSystem::Quickbooks]));

    let mut spool = spool_with(queue, directory, true, 100);
    spool
        .enqueue(
            "customer",
            Uuid::new_v4(),
            WriteEvent::Created,
            "tenant-1",
        )
        .await
        .unwrap();
    assert!(spool.is_empty());
}

#[tokio::test]
async fn disabled_outbound_sync_makes_enqueue_a_no_op() {
    let queue = Arc::new(InMemoryQueue::new());
    let directory = Arc::new(FakeDirectory::new(true, vec![ExternalSystem::Quickbooks]));

    let mut spool = spool_with(queue, directory.clone(), false, 100);
    spool
        .enqueue(
            "customer",
            Uuid::new_v4(),
            WriteEvent::Created,
            "tenant-1",
        )
        .await
        .unwrap();
    assert!(spool.is_empty());
    assert_eq!(
        directory.lookups.load(Ordering::SeqCst),
        0,
        "disabled spool never resolves connections"
    );
}

#[tokio::test]
async fn one_event_fans_out_to_every_connected_system() {
    let queue = Arc::new(InMemoryQueue::new());
    let directory = Arc::new(FakeDirectory::new(
        true,
        vec![ExternalSystem::Quickbooks, ExternalSystem::Xero],
    ));
    let mut stream = queue.consume("integrations.write.>").await.unwrap();

    let mut spool = spool_with(queue.clone(), directory, true, 100);
    spool
        .enqueue(
            "customer",
            Uuid::new_v4(),
            WriteEvent::Created,
            "tenant-1",
        )
        .await
        .unwrap();
    spool.flush().await.unwrap();

    let jobs = drain_jobs(&mut stream).await;
    let mut subjects: Vec<_> = jobs.iter().map(|(s, _)| s.as_str()).collect();
    subjects.sort_unstable();
    assert_eq!(
        subjects,
        vec!["integrations.write.quickbooks", "integrations.write.xero"]
    );
}

#[tokio::test]
async fn ledger_transactions_target_quickbooks_regardless_of_connections() {
    let queue = Arc::new(InMemoryQueue::new());
    let directory = Arc::new(FakeDirectory::new(true, vec![ExternalSystem::Xero]));
    let mut stream = queue.consume("integrations.write.>").await.unwrap();

    let mut spool = spool_with(queue.clone(), directory, true, 100);
    spool
        .enqueue(
            "ledger_transaction",
            Uuid::new_v4(),
            WriteEvent::Created,
            "tenant-1",
        )
        .await
        .unwrap();
    spool.flush().await.unwrap();

    let jobs = drain_jobs(&mut stream).await;
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].0, "integrations.write.quickbooks");
    assert_eq!(jobs[0].1.target_system, ExternalSystem::Quickbooks);
}

#[tokio::test]
async fn connected_systems_resolve_once_per_tenant_per_spool() {
    let queue = Arc::new(InMemoryQueue::new());
    let directory = Arc::new(FakeDirectory::new(true, vec![ExternalSystem::Quickbooks]));

    let mut spool = spool_with(queue, directory.clone(), true, 100);
    for _ in 0..4 {
        spool
            .enqueue(
                "customer",
                Uuid::new_v4(),
                WriteEvent::Updated,
                "tenant-1",
            )
            .await
            .unwrap();
    }
    spool
        .enqueue(
            "customer",
            Uuid::new_v4(),
            WriteEvent::Updated,
            "tenant-2",
        )
        .await
        .unwrap();

    assert_eq!(directory.lookups.load(Ordering::SeqCst), 2, "one per tenant");
}

#[tokio::test]
async fn dropping_a_spool_flushes_its_leftovers() {
    let queue = Arc::new(InMemoryQueue::new());
    let directory = Arc::new(FakeDirectory::new(true, vec![ExternalSystem::Quickbooks]));
    let mut stream = queue.consume("integrations.write.>").await.unwrap();

    let mut spool = spool_with(queue.clone(), directory, true, 100);
    spool
        .enqueue(
            "invoice",
            Uuid::new_v4(),
            WriteEvent::Updated,
            "tenant-1",
        )
        .await
        .unwrap();
    drop(spool);

    let job = tokio::time::timeout(Duration::from_secs(1), stream.next())
        .await
        .expect("drop-flush job should arrive")
        .expect("stream open");
    let envelope: JobEnvelope<WriteJob> = JobEnvelope::from_bytes(&job.payload).unwrap();
    assert_eq!(envelope.body.event, WriteEvent::Updated);
}

#[tokio::test]
async fn ineligible_record_types_are_ignored() {
    let queue = Arc::new(InMemoryQueue::new());
    let directory = Arc::new(FakeDirectory::new(true, vec![ExternalSystem::Quickbooks]));

    let mut spool = spool_with(queue, directory.clone(), true, 100);
    spool
        .enqueue(
            "webhook_log",
            Uuid::new_v4(),
            WriteEvent::Created,
            "tenant-1",
        )
        .await
        .unwrap();
    assert!(spool.is_empty());
    assert_eq!(directory.lookups.load(Ordering::SeqCst), 0);
}
