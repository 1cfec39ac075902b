//! QuickBooks Online API client.
//!
//! One client instance is bound to one realm (company file) with one access
//! token; the extractor and writer construct clients per account via the
//! tenant directory's decrypted connection credentials.

pub mod extract;
pub mod transform;
pub mod write;

pub use extract::QboExtractor;
pub use transform::QboTransformer;
pub use write::QboWriter;

use reqwest::Client;
use std::time::Duration;
use thiserror::Error;

use crate::error::ExtractError;
use crate::models::{ExternalSystem, RecordType};

/// Deployment-level QuickBooks settings shared by every client instance.
#[derive(Debug, Clone)]
pub struct QboSettings {
    pub sandbox: bool,
    /// Explicit base URL override (tests point this at a mock server)
    pub base_url: Option<String>,
    pub timeout_secs: u64,
    /// `minorversion` query parameter sent on every call
    pub minor_version: u32,
}

impl Default for QboSettings {
    fn default() -> Self {
        Self {
            sandbox: true,
            base_url: None,
            timeout_secs: 30,
            minor_version: 70,
        }
    }
}

impl QboSettings {
    pub fn from_env() -> Self {
        let sandbox = std::env::var("QBO_SANDBOX")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(true);
        Self {
            sandbox,
            base_url: std::env::var("QBO_BASE_URL").ok(),
            ..Self::default()
        }
    }

    fn resolved_base_url(&self) -> String {
        if let Some(url) = &self.base_url {
            return url.trim_end_matches('/').to_string();
        }
        if self.sandbox {
            "https://sandbox-quickbooks.api.intuit.com".to_string()
        } else {
            "https://quickbooks.api.intuit.com".to_string()
        }
    }
}

#[derive(Debug, Error)]
pub enum QboError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("http error: {0}")]
    Http(String),

    #[error("API error (status {status}): {message}")]
    Api { status: u16, message: String },

    #[error("parse error: {0}")]
    Parse(String),
}

impl QboError {
    pub fn is_auth(&self) -> bool {
        matches!(self, QboError::Api { status, .. } if *status == 401 || *status == 403)
    }

    pub fn is_client_error(&self) -> bool {
        matches!(self, QboError::Api { status, .. } if (400..500).contains(status))
    }

    pub fn is_server_error(&self) -> bool {
        matches!(self, QboError::Api { status, .. } if (500..600).contains(status))
    }

    /// Reclassify at the extraction boundary.
    pub fn into_extract(self) -> ExtractError {
        let system = ExternalSystem::Quickbooks;
        match self {
            e if e.is_auth() => ExtractError::Auth {
                system,
                reason: e.to_string(),
            },
            QboError::Api { status, message } => ExtractError::Api {
                system,
                status,
                message,
            },
            QboError::Parse(reason) => ExtractError::Decode { system, reason },
            e => ExtractError::Transport {
                system,
                reason: e.to_string(),
            },
        }
    }
}

/// QuickBooks entity name for a platform record type.
pub fn entity_name(record_type: RecordType) -> &'static str {
    match record_type {
        RecordType::Customer => "Customer",
        RecordType::Invoice => "Invoice",
        RecordType::Payment => "Payment",
        RecordType::LedgerTransaction => "JournalEntry",
    }
}

/// Client bound to one realm.
#[derive(Clone)]
pub struct QboClient {
    http: Client,
    base_url: String,
    realm_id: String,
    access_token: String,
    minor_version: u32,
}

impl QboClient {
    pub fn new(
        settings: &QboSettings,
        realm_id: &str,
        access_token: &str,
    ) -> Result<Self, QboError> {
        if realm_id.is_empty() {
            return Err(QboError::Config("realm id is empty".to_string()));
        }
        let http = Client::builder()
            .timeout(Duration::from_secs(settings.timeout_secs))
            .build()
            .map_err(|e| QboError::Http(e.to_string()))?;

        Ok(Self {
            http,
            base_url: settings.resolved_base_url(),
            realm_id: realm_id.to_string(),
            access_token: access_token.to_string(),
            minor_version: settings.minor_version,
        })
    }

    pub fn realm_id(&self) -> &str {
        &self.realm_id
    }

    /// Run a QuickBooks query statement and return the raw `QueryResponse`
    /// object.
    pub async fn query(&self, statement: &str) -> Result<serde_json::Value, QboError> {
        let url = format!(
            "{}/v3/company/{}/query?query={}&minorversion={}",
            self.base_url,
            self.realm_id,
            urlencoding::encode(statement),
            self.minor_version
        );

        let response = self
            .http
            .get(&url)
            .header("Authorization", format!("Bearer {}", self.access_token))
            .header("Accept", "application/json")
            .send()
            .await
            .map_err(|e| QboError::Http(e.to_string()))?;

        let body = Self::handle_response(response).await?;
        body.get("QueryResponse")
            .cloned()
            .ok_or_else(|| QboError::Parse("response has no QueryResponse".to_string()))
    }

    /// Fetch one entity by id.
    pub async fn get_entity(
        &self,
        entity: &str,
        id: &str,
    ) -> Result<serde_json::Value, QboError> {
        let url = format!(
            "{}/v3/company/{}/{}/{}?minorversion={}",
            self.base_url,
            self.realm_id,
            entity.to_lowercase(),
            id,
            self.minor_version
        );

        let response = self
            .http
            .get(&url)
            .header("Authorization", format!("Bearer {}", self.access_token))
            .header("Accept", "application/json")
            .send()
            .await
            .map_err(|e| QboError::Http(e.to_string()))?;

        let body = Self::handle_response(response).await?;
        body.get(entity)
            .cloned()
            .ok_or_else(|| QboError::Parse(format!("response has no {entity} object")))
    }

    /// Create or sparse-update an entity; `operation` carries the special
    /// verbs QuickBooks models as query parameters (e.g. `delete`).
    pub async fn post_entity(
        &self,
        entity: &str,
        body: &serde_json::Value,
        operation: Option<&str>,
    ) -> Result<serde_json::Value, QboError> {
        let mut url = format!(
            "{}/v3/company/{}/{}?minorversion={}",
            self.base_url,
            self.realm_id,
            entity.to_lowercase(),
            self.minor_version
        );
        if let Some(op) = operation {
            url.push_str(&format!("&operation={op}"));
        }

        let response = self
            .http
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.access_token))
            .header("Accept", "application/json")
            .json(body)
            .send()
            .await
            .map_err(|e| QboError::Http(e.to_string()))?;

        let result = Self::handle_response(response).await?;
        result
            .get(entity)
            .cloned()
            .ok_or_else(|| QboError::Parse(format!("response has no {entity} object")))
    }

    async fn handle_response(
        response: reqwest::Response,
    ) -> Result<serde_json::Value, QboError> {
        let status = response.status();

        if status.is_success() {
            response
                .json::<serde_json::Value>()
                .await
                .map_err(|e| QboError::Parse(e.to_string()))
        } else {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "unable to read error response".to_string());
            Err(QboError::Api {
                status: status.as_u16(),
                message: body,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{method, path, query_param_contains};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn settings_for(server: &MockServer) -> QboSettings {
        QboSettings {
            base_url: Some(server.uri()),
            ..QboSettings::default()
        }
    }

    #[tokio::test]
    async fn test_query_unwraps_query_response() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v3/company/realm-1/query"))
            .and(query_param_contains("query", "SELECT * FROM Customer"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "QueryResponse": {"Customer": [{"Id": "1"}], "startPosition": 1},
                "time": "2026-03-01T00:00:00Z"
            })))
            .mount(&server)
            .await;

        let client = QboClient::new(&settings_for(&server), "realm-1", "tok").unwrap();
        let response = client.query("SELECT * FROM Customer").await.unwrap();
        assert_eq!(response["Customer"][0]["Id"], "1");
    }

    #[tokio::test]
    async fn test_auth_failure_is_classified() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(401).set_body_string("token expired"))
            .mount(&server)
            .await;

        let client = QboClient::new(&settings_for(&server), "realm-1", "bad").unwrap();
        let err = client.query("SELECT * FROM Customer").await.unwrap_err();
        assert!(err.is_auth());
        assert!(matches!(err.into_extract(), ExtractError::Auth { .. }));
    }

    #[tokio::test]
    async fn test_get_entity_unwraps_named_object() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v3/company/realm-1/customer/42"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "Customer": {"Id": "42", "DisplayName": "Acme"}
            })))
            .mount(&server)
            .await;

        let client = QboClient::new(&settings_for(&server), "realm-1", "tok").unwrap();
        let customer = client.get_entity("Customer", "42").await.unwrap();
        assert_eq!(customer["DisplayName"], "Acme");
    }

    #[test]
    fn test_empty_realm_is_a_config_error() {
        let result = QboClient::new(&QboSettings::default(), "", "tok");
        assert!(matches!(result, Err(QboError::Config(_))));
    }
}
