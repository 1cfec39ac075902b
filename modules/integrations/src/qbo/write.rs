//! QuickBooks writer: outbound create/update/delete.
//!
//! QuickBooks updates are optimistic-locked by SyncToken, so update and
//! delete are read-modify-write. Payments route to a ledger account through
//! the profile's routing rules; an unroutable payment is a configuration
//! error surfaced as-is, never posted to a guessed account.

use async_trait::async_trait;
use serde_json::json;
use std::sync::Arc;
use uuid::Uuid;

use crate::error::SyncError;
use crate::models::{ExternalSystem, Mapping, PaymentRoute, RecordType, SyncProfile};
use crate::repos::{MappingStore, RecordSnapshot, TenantDirectory};
use crate::routing;
use crate::writer::Writer;

use super::{entity_name, QboClient, QboSettings};

pub struct QboWriter {
    settings: QboSettings,
    tenants: Arc<dyn TenantDirectory>,
    mappings: Arc<dyn MappingStore>,
}

impl QboWriter {
    pub fn new(
        settings: QboSettings,
        tenants: Arc<dyn TenantDirectory>,
        mappings: Arc<dyn MappingStore>,
    ) -> Self {
        Self {
            settings,
            tenants,
            mappings,
        }
    }

    async fn client_for(&self, profile: &SyncProfile) -> Result<QboClient, SyncError> {
        let credentials = self
            .tenants
            .credentials(&profile.tenant_id, ExternalSystem::Quickbooks)
            .await?
            .ok_or_else(|| SyncError::ProfileUnavailable {
                tenant_id: profile.tenant_id.clone(),
                system: ExternalSystem::Quickbooks,
            })?;
        let access_token = credentials
            .get("access_token")
            .and_then(|v| v.as_str())
            .ok_or_else(|| SyncError::WriteRejected {
                system: ExternalSystem::Quickbooks,
                reason: "connection credentials have no access_token".to_string(),
            })?;

        QboClient::new(&self.settings, &profile.external_account_id, access_token).map_err(|e| {
            SyncError::WriteRejected {
                system: ExternalSystem::Quickbooks,
                reason: e.to_string(),
            }
        })
    }

    /// External reference for the customer a record belongs to. A record
    /// that names a customer the integration has never linked cannot be
    /// written coherently; that is a configuration failure, not a retry.
    async fn customer_ref(
        &self,
        data: &serde_json::Value,
    ) -> Result<Option<serde_json::Value>, SyncError> {
        let Some(customer_id) = data
            .get("customer_id")
            .and_then(|v| v.as_str())
            .and_then(|v| Uuid::parse_str(v).ok())
        else {
            return Ok(None);
        };

        let mapping = self
            .mappings
            .find_by_internal(ExternalSystem::Quickbooks, RecordType::Customer, customer_id)
            .await?
            .ok_or(SyncError::MissingMapping {
                system: ExternalSystem::Quickbooks,
                record_type: RecordType::Customer,
                internal_id: customer_id,
            })?;

        Ok(Some(json!({"value": mapping.external_id})))
    }

    async fn outbound_body(
        &self,
        snapshot: &RecordSnapshot,
        profile: &SyncProfile,
    ) -> Result<serde_json::Value, SyncError> {
        let data = &snapshot.data;
        match snapshot.record_type {
            RecordType::Customer => {
                let mut body = json!({
                    "DisplayName": data.get("display_name").cloned().unwrap_or_default(),
                });
                if let Some(email) = data.get("email").and_then(|v| v.as_str()) {
                    body["PrimaryEmailAddr"] = json!({"Address": email});
                }
                Ok(body)
            }

            RecordType::Invoice => {
                let amount = minor_to_major(data, "amount_minor");
                let mut body = json!({
                    "DocNumber": data.get("number").cloned().unwrap_or_default(),
                    "TxnDate": data.get("issued_on").cloned().unwrap_or_default(),
                    "DueDate": data.get("due_on").cloned().unwrap_or_default(),
                    "Line": [{
                        "Amount": amount,
                        "DetailType": "SalesItemLineDetail",
                        "SalesItemLineDetail": {}
                    }]
                });
                if let Some(customer) = self.customer_ref(data).await? {
                    body["CustomerRef"] = customer;
                }
                Ok(body)
            }

            RecordType::Payment => {
                let route = PaymentRoute {
                    currency: data
                        .get("currency")
                        .and_then(|v| v.as_str())
                        .unwrap_or_default()
                        .to_string(),
                    payment_method: data
                        .get("payment_method")
                        .and_then(|v| v.as_str())
                        .unwrap_or_default()
                        .to_string(),
                    merchant_account: data
                        .get("merchant_account")
                        .and_then(|v| v.as_str())
                        .unwrap_or_default()
                        .to_string(),
                };
                let rule = routing::select_account(&route, &profile.routing_rules)?;

                let mut body = json!({
                    "TotalAmt": minor_to_major(data, "amount_minor"),
                    "TxnDate": data.get("received_on").cloned().unwrap_or_default(),
                });
                if let Some(customer) = self.customer_ref(data).await? {
                    body["CustomerRef"] = customer;
                }
                // Undeposited-funds rules omit the deposit account so the
                // payment lands in the holding account.
                if !rule.undeposited_funds {
                    body["DepositToAccountRef"] = json!({"value": rule.target_account});
                }
                Ok(body)
            }

            RecordType::LedgerTransaction => Ok(json!({
                "PrivateNote": data.get("memo").cloned().unwrap_or_default(),
                "Line": data.get("lines").cloned().unwrap_or_else(|| json!([])),
            })),
        }
    }
}

fn minor_to_major(data: &serde_json::Value, field: &str) -> f64 {
    data.get(field)
        .and_then(|v| v.as_i64())
        .map(|minor| minor as f64 / 100.0)
        .unwrap_or(0.0)
}

fn write_rejected(e: super::QboError) -> SyncError {
    SyncError::WriteRejected {
        system: ExternalSystem::Quickbooks,
        reason: e.to_string(),
    }
}

#[async_trait]
impl Writer for QboWriter {
    async fn create(
        &self,
        snapshot: &RecordSnapshot,
        profile: &SyncProfile,
    ) -> Result<String, SyncError> {
        let client = self.client_for(profile).await?;
        let entity = entity_name(snapshot.record_type);
        let body = self.outbound_body(snapshot, profile).await?;

        let created = client
            .post_entity(entity, &body, None)
            .await
            .map_err(write_rejected)?;

        created
            .get("Id")
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .ok_or_else(|| SyncError::WriteRejected {
                system: ExternalSystem::Quickbooks,
                reason: format!("created {entity} has no Id"),
            })
    }

    async fn update(
        &self,
        snapshot: &RecordSnapshot,
        mapping: &Mapping,
        profile: &SyncProfile,
    ) -> Result<(), SyncError> {
        let client = self.client_for(profile).await?;
        let entity = entity_name(snapshot.record_type);

        let current = client
            .get_entity(entity, &mapping.external_id)
            .await
            .map_err(write_rejected)?;
        let sync_token = current
            .get("SyncToken")
            .cloned()
            .unwrap_or_else(|| json!("0"));

        let mut body = self.outbound_body(snapshot, profile).await?;
        body["Id"] = json!(mapping.external_id);
        body["SyncToken"] = sync_token;
        body["sparse"] = json!(true);

        client
            .post_entity(entity, &body, None)
            .await
            .map_err(write_rejected)?;
        Ok(())
    }

    async fn delete(&self, mapping: &Mapping, profile: &SyncProfile) -> Result<(), SyncError> {
        let client = self.client_for(profile).await?;
        let entity = entity_name(mapping.record_type);

        let current = client
            .get_entity(entity, &mapping.external_id)
            .await
            .map_err(write_rejected)?;
        let sync_token = current
            .get("SyncToken")
            .cloned()
            .unwrap_or_else(|| json!("0"));

        let body = json!({
            "Id": mapping.external_id,
            "SyncToken": sync_token,
        });
        client
            .post_entity(entity, &body, Some("delete"))
            .await
            .map_err(write_rejected)?;
        Ok(())
    }
}
