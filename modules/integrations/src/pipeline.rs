//! The inbound sync pipeline: Extract → Transform → Load.
//!
//! One adapter set per external system, resolved through [`adapters_for`].
//! Extraction is a pull-based page stream; nothing buffers the full remote
//! result set. The runner owns the run-level algorithm: per-record failures
//! are aggregated, skips are counted separately from failures, and the
//! profile's read cursor is committed only after a page fully processes, so
//! a crashed run resumes from the last committed page (at-least-once).

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::{ExtractError, LoadError, SyncError, TransformError};
use crate::loader::PlatformLoader;
use crate::metrics::Metrics;
use crate::models::{
    AccountingRecord, ExternalRecord, ExternalSystem, FailureStage, ImportOutcome, ReadCursor,
    ReadQuery, RecordFailure, RecordType, SyncProfile, SyncRunReport,
};
use crate::qbo::{QboExtractor, QboSettings, QboTransformer};
use crate::repos::{MappingStore, RecordStore, SyncProfileStore, TenantDirectory};

/// One extracted page plus the cursor that becomes durable once the page
/// fully commits.
pub struct ExternalPage {
    pub records: Vec<ExternalRecord>,
    pub cursor_after: ReadCursor,
}

pub type PageStream<'a> = BoxStream<'a, Result<ExternalPage, ExtractError>>;

/// Reads records out of one external system.
#[async_trait]
pub trait Extractor: Send + Sync {
    /// Bind a client session to one external account. Must be called again
    /// whenever the account context changes.
    async fn initialize(
        &mut self,
        external_account_id: &str,
        profile: &SyncProfile,
    ) -> Result<(), ExtractError>;

    /// Stream matching records page by page. Restarting means issuing a new
    /// [`ReadQuery`] with an updated cursor, never resuming mid-stream.
    fn get_objects(&self, profile: &SyncProfile, query: ReadQuery) -> PageStream<'_>;

    /// Point lookup for on-demand resync of a single record.
    async fn get_object(
        &self,
        record_type: RecordType,
        external_id: &str,
    ) -> Result<ExternalRecord, ExtractError>;
}

/// Normalizes external records into platform value objects.
#[async_trait]
pub trait Transformer: Send + Sync {
    /// Same contract as [`Extractor::initialize`].
    async fn initialize(
        &mut self,
        external_account_id: &str,
        profile: &SyncProfile,
    ) -> Result<(), ExtractError>;

    /// Pure mapping. `Ok(None)` is an intentional skip, not an error;
    /// `Err` is a per-record failure the caller records and moves past.
    fn transform(
        &self,
        record: &ExternalRecord,
    ) -> Result<Option<AccountingRecord>, TransformError>;
}

/// Upserts normalized records into the platform.
#[async_trait]
pub trait Loader: Send + Sync {
    /// Idempotent: loading the same record twice has no second side effect
    /// (detected via mapping lookup + fingerprint short-circuit).
    async fn load(
        &self,
        tenant_id: &str,
        record: &AccountingRecord,
    ) -> Result<ImportOutcome, LoadError>;
}

/// Adapter set for one external system.
pub struct PipelineAdapters {
    pub extractor: Box<dyn Extractor>,
    pub transformer: Box<dyn Transformer>,
    pub loader: Box<dyn Loader>,
}

/// Resolve the adapter set for a system, or `None` when no adapter is
/// registered (the caller logs and skips that system).
pub fn adapters_for(
    system: ExternalSystem,
    qbo_settings: &QboSettings,
    tenants: Arc<dyn TenantDirectory>,
    records: Arc<dyn RecordStore>,
    mappings: Arc<dyn MappingStore>,
) -> Option<PipelineAdapters> {
    match system {
        ExternalSystem::Quickbooks => Some(PipelineAdapters {
            extractor: Box::new(QboExtractor::new(qbo_settings.clone(), tenants)),
            transformer: Box::new(QboTransformer::new()),
            loader: Box::new(PlatformLoader::new(system, records, mappings)),
        }),
        // Connected in the directory but no adapter shipped yet.
        ExternalSystem::Xero => None,
    }
}

/// Drives one profile's inbound sync.
pub struct SyncRunner {
    system: ExternalSystem,
    extractor: Box<dyn Extractor>,
    transformer: Box<dyn Transformer>,
    loader: Box<dyn Loader>,
    profiles: Arc<dyn SyncProfileStore>,
    metrics: Arc<Metrics>,
}

impl SyncRunner {
    pub fn new(
        system: ExternalSystem,
        adapters: PipelineAdapters,
        profiles: Arc<dyn SyncProfileStore>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            system,
            extractor: adapters.extractor,
            transformer: adapters.transformer,
            loader: adapters.loader,
            profiles,
            metrics,
        }
    }

    /// Bind both stateful adapters to the profile's external account.
    pub async fn initialize(&mut self, profile: &SyncProfile) -> Result<(), ExtractError> {
        self.extractor
            .initialize(&profile.external_account_id, profile)
            .await?;
        self.transformer
            .initialize(&profile.external_account_id, profile)
            .await
    }

    /// Run one record type for one profile.
    ///
    /// Transport failures abort the run and bubble up for the outer
    /// scheduler to retry later; everything record-level lands on the
    /// report. `cancel` is honored between pages only; an in-flight page
    /// always finishes or is lost whole.
    pub async fn run(
        &mut self,
        profile: &SyncProfile,
        record_type: RecordType,
        page_size: u32,
        cancel: &AtomicBool,
    ) -> Result<SyncRunReport, SyncError> {
        let mut report = SyncRunReport::default();
        let query = ReadQuery::from_profile(profile, record_type, page_size);

        tracing::info!(
            tenant_id = %profile.tenant_id,
            system = %self.system,
            record_type = %record_type,
            updated_after = ?query.updated_after,
            "starting sync run"
        );

        let mut pages = self.extractor.get_objects(profile, query);

        while let Some(page) = pages.next().await {
            let page = page?;

            for record in &page.records {
                match self.transformer.transform(record) {
                    Ok(Some(normalized)) => {
                        match self.loader.load(&profile.tenant_id, &normalized).await {
                            Ok(outcome) => {
                                self.count_outcome(record_type, outcome, &mut report);
                            }
                            Err(e) => {
                                self.count_failure(record, FailureStage::Load, e, &mut report);
                            }
                        }
                    }
                    Ok(None) => {
                        report.skipped += 1;
                        self.metrics
                            .sync_records_total
                            .with_label_values(&[record_type.as_str(), "skipped"])
                            .inc();
                    }
                    Err(e) => {
                        self.count_failure(record, FailureStage::Transform, e, &mut report);
                    }
                }
            }

            // The page is done; only now does the cursor become durable.
            self.profiles
                .advance_read_cursor(profile.id, &page.cursor_after)
                .await?;
            report.pages += 1;

            if cancel.load(Ordering::Relaxed) {
                tracing::info!(
                    tenant_id = %profile.tenant_id,
                    pages = report.pages,
                    "sync run cancelled between pages"
                );
                break;
            }
        }

        tracing::info!(
            tenant_id = %profile.tenant_id,
            system = %self.system,
            record_type = %record_type,
            created = report.created,
            updated = report.updated,
            unchanged = report.unchanged,
            skipped = report.skipped,
            failed = report.failed(),
            "sync run finished"
        );

        Ok(report)
    }

    /// Re-extract and reload one record outside the paged flow.
    pub async fn resync_record(
        &self,
        profile: &SyncProfile,
        record_type: RecordType,
        external_id: &str,
    ) -> Result<Option<ImportOutcome>, SyncError> {
        let record = self.extractor.get_object(record_type, external_id).await?;
        match self.transformer.transform(&record)? {
            Some(normalized) => {
                let outcome = self.loader.load(&profile.tenant_id, &normalized).await?;
                Ok(Some(outcome))
            }
            None => Ok(None),
        }
    }

    fn count_outcome(
        &self,
        record_type: RecordType,
        outcome: ImportOutcome,
        report: &mut SyncRunReport,
    ) {
        report.count(outcome);
        let label = match outcome {
            ImportOutcome::Created => "created",
            ImportOutcome::Updated => "updated",
            ImportOutcome::Deleted => "deleted",
            ImportOutcome::Unchanged => "unchanged",
        };
        self.metrics
            .sync_records_total
            .with_label_values(&[record_type.as_str(), label])
            .inc();
    }

    fn count_failure(
        &self,
        record: &ExternalRecord,
        stage: FailureStage,
        error: impl std::fmt::Display,
        report: &mut SyncRunReport,
    ) {
        tracing::warn!(
            external_id = %record.external_id,
            record_type = %record.record_type,
            stage = stage.as_str(),
            error = %error,
            "record failed during sync run"
        );
        self.metrics
            .sync_records_total
            .with_label_values(&[record.record_type.as_str(), "failed"])
            .inc();
        report.failures.push(RecordFailure {
            external_id: record.external_id.clone(),
            record_type: record.record_type,
            stage,
            reason: error.to_string(),
        });
    }
}
