//! QuickBooks extractor: paginated query-endpoint reads.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use std::sync::Arc;

use crate::error::ExtractError;
use crate::models::{
    ExternalRecord, ExternalSystem, ReadCursor, ReadQuery, RecordType, SyncProfile,
};
use crate::pipeline::{Extractor, ExternalPage, PageStream};
use crate::repos::TenantDirectory;

use super::{entity_name, QboClient, QboSettings};

pub struct QboExtractor {
    settings: QboSettings,
    tenants: Arc<dyn TenantDirectory>,
    client: Option<QboClient>,
}

impl QboExtractor {
    pub fn new(settings: QboSettings, tenants: Arc<dyn TenantDirectory>) -> Self {
        Self {
            settings,
            tenants,
            client: None,
        }
    }

    /// Query statement for one page of one record type.
    fn statement(query: &ReadQuery, start_position: u32) -> String {
        let entity = entity_name(query.record_type);
        let mut clauses = Vec::new();
        if let Some(after) = query.updated_after {
            clauses.push(format!(
                "Metadata.LastUpdatedTime > '{}'",
                after.to_rfc3339()
            ));
        }
        if let Some(before) = query.updated_before {
            clauses.push(format!(
                "Metadata.LastUpdatedTime <= '{}'",
                before.to_rfc3339()
            ));
        }

        let mut statement = format!("SELECT * FROM {entity}");
        if !clauses.is_empty() {
            statement.push_str(" WHERE ");
            statement.push_str(&clauses.join(" AND "));
        }
        statement.push_str(&format!(
            " ORDERBY Metadata.LastUpdatedTime STARTPOSITION {start_position} MAXRESULTS {}",
            query.page_size
        ));
        statement
    }

    fn to_external(record_type: RecordType, row: serde_json::Value) -> ExternalRecord {
        let external_id = row
            .get("Id")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        let remote_updated_at = row
            .get("MetaData")
            .and_then(|m| m.get("LastUpdatedTime"))
            .and_then(|v| v.as_str())
            .and_then(|v| DateTime::parse_from_rfc3339(v).ok())
            .map(|dt| dt.with_timezone(&Utc));

        ExternalRecord {
            external_id,
            record_type,
            payload: row,
            remote_updated_at,
        }
    }
}

#[async_trait]
impl Extractor for QboExtractor {
    async fn initialize(
        &mut self,
        external_account_id: &str,
        profile: &SyncProfile,
    ) -> Result<(), ExtractError> {
        let credentials = self
            .tenants
            .credentials(&profile.tenant_id, ExternalSystem::Quickbooks)
            .await
            .map_err(|e| ExtractError::Transport {
                system: ExternalSystem::Quickbooks,
                reason: e.to_string(),
            })?
            .ok_or_else(|| ExtractError::Auth {
                system: ExternalSystem::Quickbooks,
                reason: format!("tenant {} has no QuickBooks connection", profile.tenant_id),
            })?;

        let access_token = credentials
            .get("access_token")
            .and_then(|v| v.as_str())
            .ok_or_else(|| ExtractError::Auth {
                system: ExternalSystem::Quickbooks,
                reason: "connection credentials have no access_token".to_string(),
            })?;

        self.client = Some(
            QboClient::new(&self.settings, external_account_id, access_token)
                .map_err(super::QboError::into_extract)?,
        );
        Ok(())
    }

    fn get_objects(&self, _profile: &SyncProfile, query: ReadQuery) -> PageStream<'_> {
        let stream = async_stream::stream! {
            let Some(client) = self.client.as_ref() else {
                yield Err(ExtractError::Uninitialized);
                return;
            };

            let mut start_position: u32 = query
                .page_token
                .as_deref()
                .and_then(|token| token.parse().ok())
                .unwrap_or(1);
            let mut window_max: Option<DateTime<Utc>> = None;
            let entity = entity_name(query.record_type);

            loop {
                let statement = Self::statement(&query, start_position);
                let response = match client.query(&statement).await {
                    Ok(response) => response,
                    Err(e) => {
                        yield Err(e.into_extract());
                        return;
                    }
                };

                let rows = response
                    .get(entity)
                    .and_then(|v| v.as_array())
                    .cloned()
                    .unwrap_or_default();

                let records: Vec<ExternalRecord> = rows
                    .into_iter()
                    .map(|row| Self::to_external(query.record_type, row))
                    .collect();

                for record in &records {
                    if let Some(at) = record.remote_updated_at {
                        window_max = Some(window_max.map_or(at, |m| m.max(at)));
                    }
                }

                let count = records.len() as u32;
                let has_more = count == query.page_size && count > 0;

                // Mid-window pages keep the query's time bound and record
                // the next start position; the final page rolls the time
                // bound forward and clears the position.
                let cursor_after = if has_more {
                    ReadCursor {
                        updated_after: query.updated_after,
                        page_token: Some((start_position + count).to_string()),
                    }
                } else {
                    ReadCursor {
                        updated_after: window_max.or(query.updated_after),
                        page_token: None,
                    }
                };

                yield Ok(ExternalPage {
                    records,
                    cursor_after,
                });

                if !has_more {
                    return;
                }
                start_position += count;
            }
        };
        stream.boxed()
    }

    async fn get_object(
        &self,
        record_type: RecordType,
        external_id: &str,
    ) -> Result<ExternalRecord, ExtractError> {
        let client = self.client.as_ref().ok_or(ExtractError::Uninitialized)?;
        let entity = entity_name(record_type);

        match client.get_entity(entity, external_id).await {
            Ok(row) => Ok(Self::to_external(record_type, row)),
            Err(e) if e.is_client_error() && !e.is_auth() => Err(ExtractError::NotFound {
                system: ExternalSystem::Quickbooks,
                record_type,
                external_id: external_id.to_string(),
            }),
            Err(e) => Err(e.into_extract()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StoreError;
    use futures::StreamExt;
    use serde_json::json;
    use wiremock::matchers::{method, path, query_param_contains};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    struct StaticDirectory;

    #[async_trait]
    impl TenantDirectory for StaticDirectory {
        async fn accounting_sync_enabled(&self, _tenant_id: &str) -> Result<bool, StoreError> {
            Ok(true)
        }

        async fn connected_systems(
            &self,
            _tenant_id: &str,
        ) -> Result<Vec<ExternalSystem>, StoreError> {
            Ok(vec![ExternalSystem::Quickbooks])
        }

        async fn credentials(
            &self,
            _tenant_id: &str,
            _system: ExternalSystem,
        ) -> Result<Option<serde_json::Value>, StoreError> {
            Ok(Some(json!({"access_token": "tok_test"})))
        }
    }

    fn profile() -> SyncProfile {
        SyncProfile {
            id: uuid::Uuid::new_v4(),
            tenant_id: "tenant-1".to_string(),
            system: ExternalSystem::Quickbooks,
            enabled: true,
            external_account_id: "realm-1".to_string(),
            field_mappings: json!({}),
            routing_rules: vec![],
            read_cursor: ReadCursor::default(),
            write_cursor: None,
            last_read_at: None,
            last_write_at: None,
        }
    }

    fn customer_rows(ids: std::ops::Range<u32>) -> Vec<serde_json::Value> {
        ids.map(|i| {
            json!({
                "Id": i.to_string(),
                "DisplayName": format!("Customer {i}"),
                "Active": true,
                "MetaData": {"LastUpdatedTime": format!("2026-03-01T00:00:{:02}Z", i % 60)}
            })
        })
        .collect()
    }

    async fn initialized_extractor(server: &MockServer) -> QboExtractor {
        let settings = QboSettings {
            base_url: Some(server.uri()),
            ..QboSettings::default()
        };
        let mut extractor = QboExtractor::new(settings, Arc::new(StaticDirectory));
        extractor.initialize("realm-1", &profile()).await.unwrap();
        extractor
    }

    #[tokio::test]
    async fn test_paginates_until_short_page() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/v3/company/realm-1/query"))
            .and(query_param_contains("query", "STARTPOSITION 1 "))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "QueryResponse": {"Customer": customer_rows(0..2)}
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v3/company/realm-1/query"))
            .and(query_param_contains("query", "STARTPOSITION 3 "))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "QueryResponse": {"Customer": customer_rows(2..3)}
            })))
            .mount(&server)
            .await;

        let extractor = initialized_extractor(&server).await;
        let p = profile();
        let query = ReadQuery {
            record_type: RecordType::Customer,
            updated_after: None,
            updated_before: None,
            page_token: None,
            page_size: 2,
        };

        let pages: Vec<_> = extractor.get_objects(&p, query).collect().await;
        assert_eq!(pages.len(), 2);

        let first = pages[0].as_ref().unwrap();
        assert_eq!(first.records.len(), 2);
        assert_eq!(first.cursor_after.page_token.as_deref(), Some("3"));

        let last = pages[1].as_ref().unwrap();
        assert_eq!(last.records.len(), 1);
        assert!(last.cursor_after.page_token.is_none());
        assert!(last.cursor_after.updated_after.is_some());
    }

    #[tokio::test]
    async fn test_resumes_from_page_token() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v3/company/realm-1/query"))
            .and(query_param_contains("query", "STARTPOSITION 5 "))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "QueryResponse": {"Customer": customer_rows(0..1)}
            })))
            .mount(&server)
            .await;

        let extractor = initialized_extractor(&server).await;
        let p = profile();
        let query = ReadQuery {
            record_type: RecordType::Customer,
            updated_after: None,
            updated_before: None,
            page_token: Some("5".to_string()),
            page_size: 2,
        };

        let pages: Vec<_> = extractor.get_objects(&p, query).collect().await;
        assert_eq!(pages.len(), 1);
        assert!(pages[0].is_ok());
    }

    #[tokio::test]
    async fn test_uninitialized_extractor_fails_fast() {
        let settings = QboSettings::default();
        let extractor = QboExtractor::new(settings, Arc::new(StaticDirectory));
        let p = profile();
        let query = ReadQuery {
            record_type: RecordType::Customer,
            updated_after: None,
            updated_before: None,
            page_token: None,
            page_size: 10,
        };

        let pages: Vec<_> = extractor.get_objects(&p, query).collect().await;
        assert_eq!(pages.len(), 1);
        assert!(matches!(pages[0], Err(ExtractError::Uninitialized)));
    }

    #[tokio::test]
    async fn test_missing_record_is_not_found() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v3/company/realm-1/customer/404"))
            .respond_with(ResponseTemplate::new(400).set_body_string("Object Not Found"))
            .mount(&server)
            .await;

        let extractor = initialized_extractor(&server).await;
        let err = extractor
            .get_object(RecordType::Customer, "404")
            .await
            .unwrap_err();
        assert!(matches!(err, ExtractError::NotFound { .. }));
    }
}
