use merch_catalog::AccountUpdate;
use merch_shared::Money;
use serde::Deserialize;
use serde_json::Value;
use uuid::Uuid;

pub const PAYMENT_SUCCEEDED: &str = "payment_intent.succeeded";
pub const PAYMENT_FAILED: &str = "payment_intent.payment_failed";
pub const ACCOUNT_UPDATED: &str = "account.updated";

/// A verified gateway notification
#[derive(Debug, Clone, PartialEq)]
pub struct WebhookEvent {
    pub id: String,
    pub event_type: String,
    pub kind: GatewayEvent,
}

/// The closed set of notifications the engine acts on
#[derive(Debug, Clone, PartialEq)]
pub enum GatewayEvent {
    PaymentSucceeded(PaymentUpdate),
    PaymentFailed(PaymentUpdate),
    AccountUpdated(AccountUpdate),
    /// Acknowledged and otherwise ignored
    Unsupported,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PaymentUpdate {
    pub intent_id: String,
    /// From intent metadata; absent for intents this engine did not create
    pub order_id: Option<Uuid>,
    pub amount: Money,
    pub currency: String,
    pub failure_message: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum EventParseError {
    #[error("Malformed event payload: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Malformed {event_type} object: {source}")]
    Object {
        event_type: String,
        source: serde_json::Error,
    },
}

// Envelope first, then the object by type
#[derive(Deserialize)]
struct RawEvent {
    id: String,
    #[serde(rename = "type")]
    event_type: String,
    #[serde(default)]
    data: RawData,
}

#[derive(Deserialize, Default)]
struct RawData {
    #[serde(default)]
    object: Value,
}

#[derive(Deserialize)]
struct RawIntent {
    id: String,
    amount: i64,
    currency: String,
    #[serde(default)]
    metadata: RawIntentMetadata,
    #[serde(default)]
    last_payment_error: Option<RawPaymentError>,
}

#[derive(Deserialize, Default)]
struct RawIntentMetadata {
    #[serde(default)]
    order_id: Option<String>,
}

#[derive(Deserialize)]
struct RawPaymentError {
    #[serde(default)]
    message: Option<String>,
}

#[derive(Deserialize)]
struct RawAccount {
    id: String,
    #[serde(default)]
    charges_enabled: bool,
    #[serde(default)]
    payouts_enabled: bool,
    #[serde(default)]
    details_submitted: bool,
}

impl WebhookEvent {
    pub fn parse(payload: &[u8]) -> Result<Self, EventParseError> {
        let raw: RawEvent = serde_json::from_slice(payload)?;

        let object_error = |source: serde_json::Error| EventParseError::Object {
            event_type: raw.event_type.clone(),
            source,
        };

        let kind = match raw.event_type.as_str() {
            PAYMENT_SUCCEEDED | PAYMENT_FAILED => {
                let intent: RawIntent = serde_json::from_value(raw.data.object).map_err(object_error)?;
                let update = PaymentUpdate {
                    order_id: intent
                        .metadata
                        .order_id
                        .as_deref()
                        .and_then(|id| Uuid::parse_str(id).ok()),
                    intent_id: intent.id,
                    amount: Money::from_minor(intent.amount),
                    currency: intent.currency.to_lowercase(),
                    failure_message: intent.last_payment_error.and_then(|e| e.message),
                };
                if raw.event_type == PAYMENT_SUCCEEDED {
                    GatewayEvent::PaymentSucceeded(update)
                } else {
                    GatewayEvent::PaymentFailed(update)
                }
            }
            ACCOUNT_UPDATED => {
                let account: RawAccount = serde_json::from_value(raw.data.object).map_err(object_error)?;
                GatewayEvent::AccountUpdated(AccountUpdate {
                    external_account_id: account.id,
                    charges_enabled: account.charges_enabled,
                    payouts_enabled: account.payouts_enabled,
                    details_submitted: account.details_submitted,
                })
            }
            _ => GatewayEvent::Unsupported,
        };

        Ok(Self {
            id: raw.id,
            event_type: raw.event_type,
            kind,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_payment_succeeded() {
        let order_id = Uuid::new_v4();
        let payload = json!({
            "id": "evt_1",
            "type": "payment_intent.succeeded",
            "data": { "object": {
                "id": "pi_1",
                "amount": 5474,
                "currency": "EUR",
                "metadata": { "order_id": order_id.to_string(), "order_number": "ORD-1" }
            }}
        });

        let event = WebhookEvent::parse(payload.to_string().as_bytes()).unwrap();
        assert_eq!(event.id, "evt_1");
        assert_eq!(
            event.kind,
            GatewayEvent::PaymentSucceeded(PaymentUpdate {
                intent_id: "pi_1".into(),
                order_id: Some(order_id),
                amount: Money::from_minor(5474),
                currency: "eur".into(),
                failure_message: None,
            })
        );
    }

    #[test]
    fn test_parse_payment_failed_message() {
        let payload = json!({
            "id": "evt_2",
            "type": "payment_intent.payment_failed",
            "data": { "object": {
                "id": "pi_2", "amount": 100, "currency": "eur",
                "last_payment_error": { "message": "Your card was declined." }
            }}
        });

        let event = WebhookEvent::parse(payload.to_string().as_bytes()).unwrap();
        let GatewayEvent::PaymentFailed(update) = event.kind else {
            panic!("expected payment failure");
        };
        assert_eq!(update.order_id, None);
        assert_eq!(update.failure_message.as_deref(), Some("Your card was declined."));
    }

    #[test]
    fn test_parse_account_updated() {
        let payload = json!({
            "id": "evt_3",
            "type": "account.updated",
            "data": { "object": { "id": "acct_9", "charges_enabled": true, "details_submitted": true }}
        });

        let event = WebhookEvent::parse(payload.to_string().as_bytes()).unwrap();
        assert_eq!(
            event.kind,
            GatewayEvent::AccountUpdated(AccountUpdate {
                external_account_id: "acct_9".into(),
                charges_enabled: true,
                payouts_enabled: false,
                details_submitted: true,
            })
        );
    }

    #[test]
    fn test_unknown_type_is_unsupported() {
        let payload = json!({ "id": "evt_4", "type": "charge.refunded", "data": { "object": {} }});
        let event = WebhookEvent::parse(payload.to_string().as_bytes()).unwrap();
        assert_eq!(event.kind, GatewayEvent::Unsupported);
    }

    #[test]
    fn test_malformed_object_is_rejected() {
        let payload = json!({ "id": "evt_5", "type": "payment_intent.succeeded", "data": { "object": { "id": 7 }}});
        assert!(matches!(
            WebhookEvent::parse(payload.to_string().as_bytes()),
            Err(EventParseError::Object { .. })
        ));
        assert!(matches!(WebhookEvent::parse(b"not json"), Err(EventParseError::Json(_))));
    }
}
