//! QuickBooks → platform record normalization.
//!
//! Pure JSON mapping. Sub-customers (jobs) are intentionally skipped since
//! the platform models them as projects, not customers; a skip is not a
//! failure. Structural problems raise per-record transform errors.

use async_trait::async_trait;
use chrono::NaiveDate;

use crate::error::{ExtractError, TransformError};
use crate::models::{
    AccountingRecord, CustomerRecord, ExternalRecord, InvoiceRecord, PaymentRecord,
    RecordType, SyncProfile,
};
use crate::pipeline::Transformer;

pub struct QboTransformer {
    default_currency: Option<String>,
}

impl QboTransformer {
    pub fn new() -> Self {
        Self {
            default_currency: None,
        }
    }
}

impl Default for QboTransformer {
    fn default() -> Self {
        Self::new()
    }
}

fn required_str(
    payload: &serde_json::Value,
    field: &'static str,
) -> Result<String, TransformError> {
    payload
        .get(field)
        .and_then(|v| v.as_str())
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .ok_or(TransformError::MissingField { field })
}

fn optional_str(payload: &serde_json::Value, field: &str) -> Option<String> {
    payload
        .get(field)
        .and_then(|v| v.as_str())
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

fn reference_value(payload: &serde_json::Value, field: &str) -> Option<String> {
    payload
        .get(field)
        .and_then(|r| r.get("value"))
        .and_then(|v| v.as_str())
        .map(str::to_string)
}

fn amount_minor(
    payload: &serde_json::Value,
    field: &'static str,
) -> Result<i64, TransformError> {
    let amount = payload
        .get(field)
        .and_then(|v| v.as_f64())
        .ok_or(TransformError::MissingField { field })?;
    if !amount.is_finite() {
        return Err(TransformError::Malformed {
            field,
            reason: "amount is not finite".to_string(),
        });
    }
    Ok((amount * 100.0).round() as i64)
}

fn date_field(payload: &serde_json::Value, field: &'static str) -> Option<NaiveDate> {
    payload
        .get(field)
        .and_then(|v| v.as_str())
        .and_then(|v| NaiveDate::parse_from_str(v, "%Y-%m-%d").ok())
}

#[async_trait]
impl Transformer for QboTransformer {
    async fn initialize(
        &mut self,
        _external_account_id: &str,
        profile: &SyncProfile,
    ) -> Result<(), ExtractError> {
        self.default_currency = profile
            .field_mappings
            .get("default_currency")
            .and_then(|v| v.as_str())
            .map(str::to_string);
        Ok(())
    }

    fn transform(
        &self,
        record: &ExternalRecord,
    ) -> Result<Option<AccountingRecord>, TransformError> {
        let payload = &record.payload;

        match record.record_type {
            RecordType::Customer => {
                // Jobs are sub-customers; the platform does not import them.
                if payload.get("Job").and_then(|v| v.as_bool()) == Some(true) {
                    return Ok(None);
                }

                Ok(Some(AccountingRecord::Customer(CustomerRecord {
                    external_id: required_str(payload, "Id")?,
                    display_name: required_str(payload, "DisplayName")?,
                    email: payload
                        .get("PrimaryEmailAddr")
                        .and_then(|e| e.get("Address"))
                        .and_then(|v| v.as_str())
                        .map(str::to_string),
                    currency: reference_value(payload, "CurrencyRef")
                        .or_else(|| self.default_currency.clone()),
                    archived: payload.get("Active").and_then(|v| v.as_bool()) == Some(false),
                })))
            }

            RecordType::Invoice => {
                let currency = reference_value(payload, "CurrencyRef")
                    .or_else(|| self.default_currency.clone())
                    .ok_or(TransformError::MissingField {
                        field: "CurrencyRef",
                    })?;
                let voided = optional_str(payload, "PrivateNote")
                    .is_some_and(|note| note.contains("Voided"));

                Ok(Some(AccountingRecord::Invoice(InvoiceRecord {
                    external_id: required_str(payload, "Id")?,
                    customer_external_id: reference_value(payload, "CustomerRef"),
                    number: optional_str(payload, "DocNumber"),
                    amount_minor: amount_minor(payload, "TotalAmt")?,
                    balance_minor: amount_minor(payload, "Balance")?,
                    currency,
                    issued_on: date_field(payload, "TxnDate"),
                    due_on: date_field(payload, "DueDate"),
                    voided,
                })))
            }

            RecordType::Payment => {
                let currency = reference_value(payload, "CurrencyRef")
                    .or_else(|| self.default_currency.clone())
                    .ok_or(TransformError::MissingField {
                        field: "CurrencyRef",
                    })?;

                Ok(Some(AccountingRecord::Payment(PaymentRecord {
                    external_id: required_str(payload, "Id")?,
                    customer_external_id: reference_value(payload, "CustomerRef"),
                    amount_minor: amount_minor(payload, "TotalAmt")?,
                    currency,
                    received_on: date_field(payload, "TxnDate"),
                    deposit_account: reference_value(payload, "DepositToAccountRef"),
                })))
            }

            RecordType::LedgerTransaction => {
                Err(TransformError::UnsupportedType(record.record_type))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn external(record_type: RecordType, payload: serde_json::Value) -> ExternalRecord {
        ExternalRecord {
            external_id: payload
                .get("Id")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string(),
            record_type,
            payload,
            remote_updated_at: None,
        }
    }

    #[test]
    fn test_customer_maps_core_fields() {
        let transformer = QboTransformer::new();
        let record = external(
            RecordType::Customer,
            json!({
                "Id": "42",
                "DisplayName": "Acme Co",
                "Active": true,
                "PrimaryEmailAddr": {"Address": "ap@acme.test"},
                "CurrencyRef": {"value": "USD"}
            }),
        );

        let Some(AccountingRecord::Customer(customer)) =
            transformer.transform(&record).unwrap()
        else {
            panic!("expected customer");
        };
        assert_eq!(customer.external_id, "42");
        assert_eq!(customer.display_name, "Acme Co");
        assert_eq!(customer.email.as_deref(), Some("ap@acme.test"));
        assert_eq!(customer.currency.as_deref(), Some("USD"));
        assert!(!customer.archived);
    }

    #[test]
    fn test_sub_customer_is_skipped_not_failed() {
        let transformer = QboTransformer::new();
        let record = external(
            RecordType::Customer,
            json!({"Id": "43", "DisplayName": "Acme:Site A", "Job": true}),
        );
        assert_eq!(transformer.transform(&record).unwrap(), None);
    }

    #[test]
    fn test_missing_display_name_is_a_failure() {
        let transformer = QboTransformer::new();
        let record = external(RecordType::Customer, json!({"Id": "44"}));
        assert!(matches!(
            transformer.transform(&record),
            Err(TransformError::MissingField {
                field: "DisplayName"
            })
        ));
    }

    #[test]
    fn test_invoice_amounts_become_minor_units() {
        let transformer = QboTransformer::new();
        let record = external(
            RecordType::Invoice,
            json!({
                "Id": "7",
                "DocNumber": "INV-1007",
                "TotalAmt": 150.25,
                "Balance": 50.0,
                "CurrencyRef": {"value": "USD"},
                "CustomerRef": {"value": "42"},
                "TxnDate": "2026-02-01",
                "DueDate": "2026-03-01"
            }),
        );

        let Some(AccountingRecord::Invoice(invoice)) = transformer.transform(&record).unwrap()
        else {
            panic!("expected invoice");
        };
        assert_eq!(invoice.amount_minor, 15025);
        assert_eq!(invoice.balance_minor, 5000);
        assert_eq!(invoice.customer_external_id.as_deref(), Some("42"));
        assert_eq!(
            invoice.issued_on,
            NaiveDate::from_ymd_opt(2026, 2, 1)
        );
        assert!(!invoice.voided);
    }

    #[test]
    fn test_voided_note_marks_invoice_voided() {
        let transformer = QboTransformer::new();
        let record = external(
            RecordType::Invoice,
            json!({
                "Id": "8",
                "TotalAmt": 0.0,
                "Balance": 0.0,
                "CurrencyRef": {"value": "USD"},
                "PrivateNote": "Voided."
            }),
        );

        let Some(AccountingRecord::Invoice(invoice)) = transformer.transform(&record).unwrap()
        else {
            panic!("expected invoice");
        };
        assert!(invoice.voided);
    }

    #[tokio::test]
    async fn test_profile_default_currency_fills_gap() {
        let mut transformer = QboTransformer::new();
        let profile = SyncProfile {
            id: uuid::Uuid::new_v4(),
            tenant_id: "t".into(),
            system: crate::models::ExternalSystem::Quickbooks,
            enabled: true,
            external_account_id: "realm".into(),
            field_mappings: json!({"default_currency": "CAD"}),
            routing_rules: vec![],
            read_cursor: Default::default(),
            write_cursor: None,
            last_read_at: None,
            last_write_at: None,
        };
        transformer.initialize("realm", &profile).await.unwrap();

        let record = external(
            RecordType::Payment,
            json!({"Id": "9", "TotalAmt": 20.0}),
        );
        let Some(AccountingRecord::Payment(payment)) = transformer.transform(&record).unwrap()
        else {
            panic!("expected payment");
        };
        assert_eq!(payment.currency, "CAD");
    }
}
