//! Per-event-type webhook handlers.
//!
//! Classification is a factory keyed on the gateway's event-type code; every
//! code resolves to exactly one handler. A handler names the gateway object
//! used for tenant resolution and how long the async job should wait before
//! processing. Unrecognized codes fall through to the no-op handler.

use std::time::Duration;

use crate::repos::EventReference;

use super::GatewayEvent;

pub trait WebhookHandler: Send + Sync {
    fn name(&self) -> &'static str;

    /// Gateway object whose owner is the event's tenant, or `None` when the
    /// event needs no processing.
    fn reference(&self, event: &GatewayEvent) -> Option<EventReference>;

    /// Delay before the queued job runs, for events the gateway emits ahead
    /// of its own read path settling.
    fn processing_delay(&self) -> Option<Duration> {
        None
    }
}

/// Payment intent outcomes: succeeded, failed, canceled.
pub struct PaymentHandler;

impl WebhookHandler for PaymentHandler {
    fn name(&self) -> &'static str {
        "payment"
    }

    fn reference(&self, event: &GatewayEvent) -> Option<EventReference> {
        event
            .resource_id()
            .map(|id| EventReference::Charge(id.to_string()))
    }
}

/// Dispute lifecycle events.
pub struct ChargebackHandler;

impl WebhookHandler for ChargebackHandler {
    fn name(&self) -> &'static str {
        "chargeback"
    }

    fn reference(&self, event: &GatewayEvent) -> Option<EventReference> {
        event
            .resource_id()
            .map(|id| EventReference::Dispute(id.to_string()))
    }

    fn processing_delay(&self) -> Option<Duration> {
        // Dispute objects lag their webhook on the gateway side.
        Some(Duration::from_secs(60))
    }
}

/// Refund lifecycle events; tenant resolution goes through the refunded
/// payment intent.
pub struct RefundHandler;

impl WebhookHandler for RefundHandler {
    fn name(&self) -> &'static str {
        "refund"
    }

    fn reference(&self, event: &GatewayEvent) -> Option<EventReference> {
        event
            .payload
            .get("data")
            .and_then(|d| d.get("payment_intent_id"))
            .and_then(|v| v.as_str())
            .map(|id| EventReference::Charge(id.to_string()))
    }
}

/// Payment-method tokenization completed during a checkout flow.
pub struct TokenizationHandler;

impl WebhookHandler for TokenizationHandler {
    fn name(&self) -> &'static str {
        "tokenization"
    }

    fn reference(&self, event: &GatewayEvent) -> Option<EventReference> {
        event
            .resource_id()
            .map(|id| EventReference::PaymentFlow(id.to_string()))
    }
}

/// Fallback for event types the module does not process.
pub struct NoopHandler;

impl WebhookHandler for NoopHandler {
    fn name(&self) -> &'static str {
        "noop"
    }

    fn reference(&self, _event: &GatewayEvent) -> Option<EventReference> {
        None
    }
}

static PAYMENT: PaymentHandler = PaymentHandler;
static CHARGEBACK: ChargebackHandler = ChargebackHandler;
static REFUND: RefundHandler = RefundHandler;
static TOKENIZATION: TokenizationHandler = TokenizationHandler;
static NOOP: NoopHandler = NoopHandler;

/// Resolve the handler for an event-type code.
pub fn handler_for(kind: &str) -> &'static dyn WebhookHandler {
    match kind {
        "payment_intent.succeeded"
        | "payment_intent.payment_failed"
        | "payment_intent.canceled" => &PAYMENT,
        "dispute.created" | "dispute.updated" | "dispute.closed" => &CHARGEBACK,
        "refund.created" | "refund.updated" => &REFUND,
        "payment_method.attached" => &TOKENIZATION,
        _ => &NOOP,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn parse(payload: serde_json::Value) -> GatewayEvent {
        GatewayEvent::parse(payload.to_string().as_bytes()).unwrap()
    }

    #[test]
    fn test_classification_by_event_code() {
        assert_eq!(handler_for("payment_intent.succeeded").name(), "payment");
        assert_eq!(handler_for("dispute.created").name(), "chargeback");
        assert_eq!(handler_for("refund.updated").name(), "refund");
        assert_eq!(handler_for("payment_method.attached").name(), "tokenization");
        assert_eq!(handler_for("account.updated").name(), "noop");
    }

    #[test]
    fn test_refund_reference_uses_payment_intent() {
        let event = parse(json!({
            "type": "refund.created",
            "environment": "production",
            "data": {"id": "re_1", "payment_intent_id": "pi_9"}
        }));
        assert_eq!(
            handler_for(&event.kind).reference(&event),
            Some(EventReference::Charge("pi_9".to_string()))
        );
    }

    #[test]
    fn test_chargeback_jobs_are_delayed() {
        assert!(handler_for("dispute.created").processing_delay().is_some());
        assert!(handler_for("payment_intent.succeeded")
            .processing_delay()
            .is_none());
    }

    #[test]
    fn test_noop_has_no_reference() {
        let event = parse(json!({
            "type": "account.updated",
            "environment": "production",
            "data": {"id": "acct_1"}
        }));
        assert_eq!(handler_for(&event.kind).reference(&event), None);
    }
}
