//! Outbound write seam.
//!
//! One writer per external system, resolved by system slug. Every write is
//! independent: a failed record neither rolls back nor blocks the others;
//! the queue's retry policy owns redelivery.

use async_trait::async_trait;
use std::sync::Arc;

use crate::error::SyncError;
use crate::models::{ExternalSystem, Mapping, SyncProfile};
use crate::qbo::{QboSettings, QboWriter};
use crate::repos::{MappingStore, RecordSnapshot, TenantDirectory};

#[async_trait]
pub trait Writer: Send + Sync {
    /// Create the record remotely; returns the new external id.
    async fn create(
        &self,
        snapshot: &RecordSnapshot,
        profile: &SyncProfile,
    ) -> Result<String, SyncError>;

    /// Push the current platform state over the mapped external record.
    async fn update(
        &self,
        snapshot: &RecordSnapshot,
        mapping: &Mapping,
        profile: &SyncProfile,
    ) -> Result<(), SyncError>;

    /// Retire the mapped external record.
    async fn delete(&self, mapping: &Mapping, profile: &SyncProfile) -> Result<(), SyncError>;
}

/// Resolve the writer for a system, or `None` when no adapter is registered.
pub fn writer_for(
    system: ExternalSystem,
    qbo_settings: &QboSettings,
    tenants: Arc<dyn TenantDirectory>,
    mappings: Arc<dyn MappingStore>,
) -> Option<Arc<dyn Writer>> {
    match system {
        ExternalSystem::Quickbooks => Some(Arc::new(QboWriter::new(
            qbo_settings.clone(),
            tenants,
            mappings,
        ))),
        ExternalSystem::Xero => None,
    }
}
