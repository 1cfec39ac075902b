use serde::Deserialize;
use std::env;

/// Which gateway/accounting environment this deployment talks to.
///
/// Webhook deliveries carry their own environment marker; events from the
/// other environment are dropped silently rather than errored, so a sandbox
/// deployment can share an endpoint URL with production.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Environment {
    Sandbox,
    Production,
}

impl Environment {
    pub fn as_str(&self) -> &'static str {
        match self {
            Environment::Sandbox => "sandbox",
            Environment::Production => "production",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "sandbox" => Some(Environment::Sandbox),
            "production" => Some(Environment::Production),
            _ => None,
        }
    }
}

impl std::fmt::Display for Environment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct IntegrationsConfig {
    pub database_url: String,
    /// "inmemory" or "nats"
    pub queue_kind: String,
    pub nats_url: String,

    pub environment: Environment,

    /// Kill switch for all outbound accounting writes. Explicit constructor
    /// input to the spool; there is no mutable global equivalent.
    pub outbound_sync_enabled: bool,
    /// Pending-entry count at which the write spool flushes itself
    pub spool_flush_threshold: usize,
    /// Page size for extraction queries
    pub page_size: u32,
    /// Webhook idempotency lease lifetime
    pub webhook_lease_ttl_days: i64,
    /// Seconds between profile scheduler sweeps
    pub scheduler_interval_secs: u64,

    /// HMAC secret for gateway webhook signatures
    pub gateway_webhook_secret: String,
    /// Base64 key for credential blobs at rest (32 bytes once decoded)
    pub credentials_key_b64: String,
}

impl IntegrationsConfig {
    pub fn from_env() -> Result<Self, Box<dyn std::error::Error>> {
        dotenvy::dotenv().ok();

        let environment = env::var("INTEGRATIONS_ENVIRONMENT")
            .unwrap_or_else(|_| "sandbox".to_string());
        let environment = Environment::parse(&environment)
            .ok_or_else(|| format!("INTEGRATIONS_ENVIRONMENT must be sandbox or production, got '{environment}'"))?;

        Ok(Self {
            database_url: env::var("DATABASE_URL")?,
            queue_kind: env::var("QUEUE_KIND").unwrap_or_else(|_| "inmemory".to_string()),
            nats_url: env::var("NATS_URL").unwrap_or_else(|_| "nats://localhost:4222".to_string()),

            environment,

            outbound_sync_enabled: env::var("OUTBOUND_SYNC_ENABLED")
                .unwrap_or_else(|_| "true".to_string())
                .parse()?,
            spool_flush_threshold: env::var("SPOOL_FLUSH_THRESHOLD")
                .unwrap_or_else(|_| "50".to_string())
                .parse()?,
            page_size: env::var("SYNC_PAGE_SIZE")
                .unwrap_or_else(|_| "100".to_string())
                .parse()?,
            webhook_lease_ttl_days: env::var("WEBHOOK_LEASE_TTL_DAYS")
                .unwrap_or_else(|_| "30".to_string())
                .parse()?,
            scheduler_interval_secs: env::var("SCHEDULER_INTERVAL_SECS")
                .unwrap_or_else(|_| "300".to_string())
                .parse()?,

            gateway_webhook_secret: env::var("GATEWAY_WEBHOOK_SECRET")?,
            credentials_key_b64: env::var("CREDENTIALS_KEY")?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_environment_parse() {
        assert_eq!(Environment::parse("sandbox"), Some(Environment::Sandbox));
        assert_eq!(Environment::parse("production"), Some(Environment::Production));
        assert_eq!(Environment::parse("staging"), None);
    }
}
