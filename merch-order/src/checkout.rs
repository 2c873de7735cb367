use merch_core::{GatewayError, IntentMetadata, IntentRequest, PaymentGateway};
use serde::Serialize;
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::calculator::{CalculationError, CheckoutRequest, OrderBreakdown, OrderCalculator};
use crate::models::Order;
use crate::repository::RepoError;
use crate::store::{OrderError, OrderStore};

#[derive(Debug, thiserror::Error)]
pub enum CheckoutError {
    #[error(transparent)]
    Calculation(#[from] CalculationError),

    #[error("Checkout {0} is already in progress")]
    InProgress(String),

    #[error("Payment provider error: {0}")]
    Gateway(GatewayError),

    #[error(transparent)]
    Order(#[from] OrderError),
}

/// What the storefront needs to collect payment
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct CheckoutReceipt {
    pub order_id: Uuid,
    pub order_number: String,
    pub client_secret: String,
    pub breakdown: OrderBreakdown,
    /// The same checkout key was seen before and this is the stored result
    pub replayed: bool,
}

impl CheckoutReceipt {
    fn from_order(order: &Order, client_secret: String, replayed: bool) -> Self {
        Self {
            order_id: order.id,
            order_number: order.order_number.clone(),
            client_secret,
            breakdown: OrderBreakdown::from(order),
            replayed,
        }
    }
}

/// Turns a cart into a pending order with a payment intent
pub struct CheckoutService {
    calculator: OrderCalculator,
    orders: Arc<OrderStore>,
    gateway: Arc<dyn PaymentGateway>,
}

impl CheckoutService {
    pub fn new(calculator: OrderCalculator, orders: Arc<OrderStore>, gateway: Arc<dyn PaymentGateway>) -> Self {
        Self {
            calculator,
            orders,
            gateway,
        }
    }

    pub async fn checkout(&self, request: CheckoutRequest) -> Result<CheckoutReceipt, CheckoutError> {
        // 1. Replays of a client checkout key get the stored result
        if let Some(key) = request.checkout_key.as_deref() {
            if let Some(existing) = self.orders.find_by_checkout_key(key).await? {
                return match existing.client_secret.clone() {
                    Some(secret) => {
                        info!(order_id = %existing.id, checkout_key = %key, "Checkout replayed");
                        Ok(CheckoutReceipt::from_order(&existing, secret, true))
                    }
                    None => Err(CheckoutError::InProgress(key.to_string())),
                };
            }
        }

        // 2. Price against the live catalog
        let priced = self.calculator.price(&request).await?;

        // 3. Persist the pending order before talking to the gateway
        let order = match self.orders.create_pending(&request, priced).await {
            Ok(order) => order,
            Err(OrderError::Repository(RepoError::Conflict(_))) => {
                let key = request.checkout_key.clone().unwrap_or_default();
                return Err(CheckoutError::InProgress(key));
            }
            Err(e) => return Err(e.into()),
        };

        // 4. Intent, outside any unit of work
        let intent_request = IntentRequest {
            amount: order.total_amount,
            currency: order.currency.clone(),
            metadata: IntentMetadata {
                order_id: order.id,
                order_number: order.order_number.clone(),
                customer_email: order.customer.email.expose().clone(),
            },
            idempotency_key: format!("intent:{}", order.id),
        };

        let intent = match self.gateway.create_payment_intent(&intent_request).await {
            Ok(intent) => intent,
            Err(gateway_error) => {
                error!(order_id = %order.id, error = %gateway_error, "Payment intent creation failed");
                if let Err(e) = self.orders.cancel(order.id).await {
                    warn!(order_id = %order.id, error = %e, "Could not cancel order after intent failure");
                }
                return Err(CheckoutError::Gateway(gateway_error));
            }
        };

        self.orders.attach_payment_intent(order.id, &intent).await?;

        info!(
            order_id = %order.id,
            order_number = %order.order_number,
            intent_id = %intent.intent_id,
            total = %order.total_amount,
            "Checkout created"
        );
        Ok(CheckoutReceipt::from_order(&order, intent.client_secret, false))
    }
}
