use async_trait::async_trait;
use merch_shared::Money;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use uuid::Uuid;

use crate::retry::IsTransient;

/// Metadata attached to a payment intent so webhook events can be routed back
/// to the order.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IntentMetadata {
    pub order_id: Uuid,
    pub order_number: String,
    pub customer_email: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct IntentRequest {
    pub amount: Money,
    pub currency: String,
    pub metadata: IntentMetadata,
    pub idempotency_key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PaymentIntent {
    pub intent_id: String, // Provider's ID (e.g., pi_123)
    pub client_secret: String,
    pub amount: Money,
    pub currency: String,
}

/// A transfer of a vendor's share to its connected account.
#[derive(Debug, Clone, PartialEq)]
pub struct TransferRequest {
    pub amount: Money,
    pub currency: String,
    pub destination: String,
    pub idempotency_key: String,
    pub order_id: Uuid,
    pub vendor_id: Uuid,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TransferReceipt {
    pub transfer_id: String,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum GatewayError {
    /// Network failures, timeouts, rate limiting, provider 5xx.
    #[error("Transient gateway failure: {0}")]
    Transient(String),

    #[error("Gateway rejected request: {0}")]
    Rejected(String),
}

impl IsTransient for GatewayError {
    fn is_transient(&self) -> bool {
        matches!(self, GatewayError::Transient(_))
    }
}

#[async_trait]
pub trait PaymentGateway: Send + Sync {
    /// Create a payment intent for the order total
    async fn create_payment_intent(&self, request: &IntentRequest) -> Result<PaymentIntent, GatewayError>;

    /// Move funds to a connected vendor account. Repeating a request with the
    /// same idempotency key must not move funds twice.
    async fn create_transfer(&self, request: &TransferRequest) -> Result<TransferReceipt, GatewayError>;
}

#[derive(Default)]
struct MockState {
    intents: HashMap<String, PaymentIntent>,
    intent_requests: Vec<IntentRequest>,
    intent_failures: VecDeque<GatewayError>,
    transfers: HashMap<String, (TransferRequest, TransferReceipt)>,
    transfer_attempts: usize,
    transfer_failures: HashMap<String, VecDeque<GatewayError>>,
}

/// In-memory gateway. Deduplicates by idempotency key like the real provider and
/// can be scripted to fail.
#[derive(Default)]
pub struct MockPaymentGateway {
    state: Mutex<MockState>,
}

impl MockPaymentGateway {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Queue failures for the next transfers to `destination`, consumed in order
    pub fn fail_transfers_to(&self, destination: &str, errors: impl IntoIterator<Item = GatewayError>) {
        self.state()
            .transfer_failures
            .entry(destination.to_string())
            .or_default()
            .extend(errors);
    }

    pub fn fail_next_intent(&self, error: GatewayError) {
        self.state().intent_failures.push_back(error);
    }

    /// Transfers that went through, one per idempotency key
    pub fn completed_transfers(&self) -> Vec<TransferRequest> {
        self.state().transfers.values().map(|(req, _)| req.clone()).collect()
    }

    /// Every call to `create_transfer`, failed or not
    pub fn transfer_attempts(&self) -> usize {
        self.state().transfer_attempts
    }

    pub fn intent_requests(&self) -> Vec<IntentRequest> {
        self.state().intent_requests.clone()
    }
}

#[async_trait]
impl PaymentGateway for MockPaymentGateway {
    async fn create_payment_intent(&self, request: &IntentRequest) -> Result<PaymentIntent, GatewayError> {
        let mut state = self.state();
        state.intent_requests.push(request.clone());

        if let Some(error) = state.intent_failures.pop_front() {
            tracing::warn!(order_id = %request.metadata.order_id, %error, "Mock gateway failing intent as scripted");
            return Err(error);
        }

        if let Some(existing) = state.intents.get(&request.idempotency_key) {
            return Ok(existing.clone());
        }

        let intent_id = format!("mock_pi_{}", request.metadata.order_id.simple());
        let intent = PaymentIntent {
            client_secret: format!("{}_secret_{}", intent_id, Uuid::new_v4().simple()),
            intent_id,
            amount: request.amount,
            currency: request.currency.clone(),
        };
        state.intents.insert(request.idempotency_key.clone(), intent.clone());
        tracing::debug!(intent_id = %intent.intent_id, amount = %intent.amount, "Mock payment intent created");
        Ok(intent)
    }

    async fn create_transfer(&self, request: &TransferRequest) -> Result<TransferReceipt, GatewayError> {
        let mut state = self.state();
        state.transfer_attempts += 1;

        if let Some(error) = state
            .transfer_failures
            .get_mut(&request.destination)
            .and_then(|queue| queue.pop_front())
        {
            tracing::warn!(destination = %request.destination, %error, "Mock gateway failing transfer as scripted");
            return Err(error);
        }

        if let Some((_, receipt)) = state.transfers.get(&request.idempotency_key) {
            tracing::debug!(idempotency_key = %request.idempotency_key, "Mock transfer replayed");
            return Ok(receipt.clone());
        }

        let receipt = TransferReceipt {
            transfer_id: format!("mock_tr_{}", Uuid::new_v4().simple()),
        };
        state
            .transfers
            .insert(request.idempotency_key.clone(), (request.clone(), receipt.clone()));
        tracing::info!(
            transfer_id = %receipt.transfer_id,
            destination = %request.destination,
            amount = %request.amount,
            "Mock transfer completed"
        );
        Ok(receipt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transfer(key: &str, destination: &str) -> TransferRequest {
        TransferRequest {
            amount: Money::from_minor(1700),
            currency: "eur".to_string(),
            destination: destination.to_string(),
            idempotency_key: key.to_string(),
            order_id: Uuid::new_v4(),
            vendor_id: Uuid::new_v4(),
        }
    }

    #[tokio::test]
    async fn test_transfer_is_idempotent_by_key() {
        let gateway = MockPaymentGateway::new();
        let req = transfer("payout:a:b", "acct_1");

        let first = gateway.create_transfer(&req).await.unwrap();
        let second = gateway.create_transfer(&req).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(gateway.completed_transfers().len(), 1);
        assert_eq!(gateway.transfer_attempts(), 2);
    }

    #[tokio::test]
    async fn test_scripted_transfer_failures() {
        let gateway = MockPaymentGateway::new();
        gateway.fail_transfers_to("acct_1", [GatewayError::Transient("timeout".into())]);

        let err = gateway.create_transfer(&transfer("k1", "acct_1")).await.unwrap_err();
        assert!(err.is_transient());

        // Other destinations are unaffected
        assert!(gateway.create_transfer(&transfer("k2", "acct_2")).await.is_ok());
        // Queue drained
        assert!(gateway.create_transfer(&transfer("k1", "acct_1")).await.is_ok());
    }

    #[tokio::test]
    async fn test_intent_creation() {
        let gateway = MockPaymentGateway::new();
        let order_id = Uuid::new_v4();
        let req = IntentRequest {
            amount: Money::from_minor(5474),
            currency: "eur".to_string(),
            metadata: IntentMetadata {
                order_id,
                order_number: "ORD-1".to_string(),
                customer_email: "fan@example.com".to_string(),
            },
            idempotency_key: format!("intent:{}", order_id),
        };

        let intent = gateway.create_payment_intent(&req).await.unwrap();
        assert_eq!(intent.intent_id, format!("mock_pi_{}", order_id.simple()));
        assert_eq!(intent.amount, Money::from_minor(5474));

        gateway.fail_next_intent(GatewayError::Rejected("card_declined".into()));
        let other = IntentRequest { idempotency_key: "other".into(), ..req };
        assert!(matches!(
            gateway.create_payment_intent(&other).await,
            Err(GatewayError::Rejected(_))
        ));
    }
}
