use chrono::{DateTime, Utc};
use merch_catalog::{InventoryError, InventoryReconciler};
use merch_core::{SignatureError, WebhookVerifier};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::escalation::{CaptureIssue, Escalation};
use crate::events::{GatewayEvent, PaymentUpdate, WebhookEvent};
use crate::models::{Order, OrderStatus, PaymentStatus};
use crate::reducer::{decide, Decision, Effect, IgnoreReason};
use crate::repository::{OrderRepository, OrderTransaction, RepoError};
use crate::settlement;
use crate::store::OrderError;

#[derive(Debug, thiserror::Error)]
pub enum WebhookError {
    #[error("Webhook signature rejected: {0}")]
    Signature(#[from] SignatureError),

    #[error(transparent)]
    Payload(#[from] crate::events::EventParseError),

    #[error(transparent)]
    Order(#[from] OrderError),

    #[error(transparent)]
    Inventory(#[from] InventoryError),

    #[error(transparent)]
    Repository(#[from] RepoError),
}

/// How an accepted event was handled. Every variant is acknowledged to the
/// gateway with a 2xx.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum WebhookAck {
    Applied {
        event_id: String,
        order_id: Uuid,
        status: OrderStatus,
        /// Payouts planned in this unit, to be dispatched after the response
        payouts: Vec<Uuid>,
    },
    AccountUpdated {
        event_id: String,
        matched: bool,
    },
    Escalated {
        event_id: String,
        order_id: Uuid,
        escalation_id: Uuid,
    },
    Ignored {
        event_id: String,
        reason: IgnoreReason,
    },
    Duplicate {
        event_id: String,
    },
}

/// Verifies, deduplicates and applies gateway notifications.
///
/// Each event is applied in exactly one unit of work together with its entry
/// in the processed-event ledger, so redeliveries are no-ops.
pub struct WebhookProcessor {
    orders: Arc<dyn OrderRepository>,
    verifier: WebhookVerifier,
}

impl WebhookProcessor {
    pub fn new(orders: Arc<dyn OrderRepository>, verifier: WebhookVerifier) -> Self {
        Self { orders, verifier }
    }

    /// Entry point for a raw delivery
    pub async fn handle(
        &self,
        payload: &[u8],
        signature: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<WebhookAck, WebhookError> {
        let header = signature.ok_or(SignatureError::Missing)?;
        self.verifier.verify(payload, header, now.timestamp())?;

        let event = WebhookEvent::parse(payload)?;
        debug!(event_id = %event.id, event_type = %event.event_type, "Webhook verified");
        self.process(event, now).await
    }

    pub async fn process(&self, event: WebhookEvent, now: DateTime<Utc>) -> Result<WebhookAck, WebhookError> {
        let update = match &event.kind {
            GatewayEvent::PaymentSucceeded(update) | GatewayEvent::PaymentFailed(update) => update,
            GatewayEvent::AccountUpdated(_) => return self.process_account(&event).await,
            GatewayEvent::Unsupported => {
                debug!(event_id = %event.id, event_type = %event.event_type, "Unhandled event type");
                return Ok(WebhookAck::Ignored {
                    event_id: event.id,
                    reason: IgnoreReason::Unsupported,
                });
            }
        };

        let mut tx = self.orders.begin().await?;
        if !tx.record_event(&event.id, &event.event_type).await? {
            tx.rollback().await?;
            info!(event_id = %event.id, "Duplicate webhook delivery");
            return Ok(WebhookAck::Duplicate { event_id: event.id });
        }

        let order = match update.order_id {
            Some(order_id) => tx.lock_order(order_id).await?,
            None => None,
        };

        let decision = decide(&event.kind, order.as_ref());
        match (decision, order) {
            (
                Decision::Transition {
                    to,
                    payment_status,
                    effects,
                },
                Some(order),
            ) => self.apply(tx, &event, update, order, to, payment_status, effects, now).await,
            (Decision::Escalate(issue), Some(order)) => {
                let escalation = Escalation::captured_without_order(order.id, &update.intent_id, issue, now);
                tx.insert_escalation(&escalation).await?;
                tx.commit().await?;
                error!(
                    event_id = %event.id,
                    order_id = %order.id,
                    intent_id = %update.intent_id,
                    issue = ?escalation.kind,
                    "Captured payment cannot be fulfilled, escalated"
                );
                Ok(WebhookAck::Escalated {
                    event_id: event.id.clone(),
                    order_id: order.id,
                    escalation_id: escalation.id,
                })
            }
            (decision, _) => {
                let reason = match decision {
                    Decision::Ignore(reason) => reason,
                    _ => IgnoreReason::UnknownOrder,
                };
                // The ledger entry commits even when nothing else changes
                tx.commit().await?;
                info!(event_id = %event.id, intent_id = %update.intent_id, ?reason, "Payment event ignored");
                Ok(WebhookAck::Ignored {
                    event_id: event.id.clone(),
                    reason,
                })
            }
        }
    }

    async fn process_account(&self, event: &WebhookEvent) -> Result<WebhookAck, WebhookError> {
        let Decision::UpdateAccount(account) = decide(&event.kind, None) else {
            return Ok(WebhookAck::Ignored {
                event_id: event.id.clone(),
                reason: IgnoreReason::Unsupported,
            });
        };

        let mut tx = self.orders.begin().await?;
        if !tx.record_event(&event.id, &event.event_type).await? {
            tx.rollback().await?;
            return Ok(WebhookAck::Duplicate {
                event_id: event.id.clone(),
            });
        }
        let matched = tx.apply_account_update(&account).await?;
        tx.commit().await?;

        if matched {
            info!(account = %account.external_account_id, charges_enabled = account.charges_enabled, "Vendor account refreshed");
        } else {
            warn!(account = %account.external_account_id, "Account update for unknown vendor");
        }
        Ok(WebhookAck::AccountUpdated {
            event_id: event.id.clone(),
            matched,
        })
    }

    #[allow(clippy::too_many_arguments)]
    async fn apply(
        &self,
        mut tx: Box<dyn OrderTransaction>,
        event: &WebhookEvent,
        update: &PaymentUpdate,
        mut order: Order,
        to: OrderStatus,
        payment_status: PaymentStatus,
        effects: Vec<Effect>,
        now: DateTime<Utc>,
    ) -> Result<WebhookAck, WebhookError> {
        order.transition(to, now)?;
        order.payment_status = payment_status;
        if order.payment_intent_id.is_none() {
            order.payment_intent_id = Some(update.intent_id.clone());
        }

        let mut payouts = Vec::new();
        for effect in effects {
            match effect {
                Effect::DecrementStock(lines) => {
                    for line in &lines {
                        match InventoryReconciler::try_decrement(tx.as_mut(), line).await {
                            Ok(()) => {}
                            Err(InventoryError::InsufficientStock { product_id, requested }) => {
                                // Nothing from this unit may survive, not even the ledger entry
                                tx.rollback().await?;
                                let issue = CaptureIssue::StockShortfall { product_id, requested };
                                return self.escalate_shortfall(event, update, order.id, issue, now).await;
                            }
                            Err(e) => return Err(e.into()),
                        }
                    }
                }
                Effect::ClearCart(owner) => {
                    let cleared = tx.clear_cart(&owner).await?;
                    debug!(order_id = %order.id, cleared, "Cart cleared");
                }
                Effect::PlanSettlement => {
                    payouts = settlement::plan(&order, now);
                    tx.insert_payouts(&payouts).await?;
                }
            }
        }

        tx.update_order(&order).await?;
        tx.commit().await?;

        info!(
            event_id = %event.id,
            order_id = %order.id,
            order_number = %order.order_number,
            status = %order.status,
            payouts = payouts.len(),
            "Payment event applied"
        );
        Ok(WebhookAck::Applied {
            event_id: event.id.clone(),
            order_id: order.id,
            status: order.status,
            payouts: payouts.into_iter().map(|p| p.id).collect(),
        })
    }

    /// Record the event and the escalation in a fresh unit, leaving the order
    /// as it was
    async fn escalate_shortfall(
        &self,
        event: &WebhookEvent,
        update: &PaymentUpdate,
        order_id: Uuid,
        issue: CaptureIssue,
        now: DateTime<Utc>,
    ) -> Result<WebhookAck, WebhookError> {
        let mut tx = self.orders.begin().await?;
        if !tx.record_event(&event.id, &event.event_type).await? {
            tx.rollback().await?;
            return Ok(WebhookAck::Duplicate {
                event_id: event.id.clone(),
            });
        }

        let escalation = Escalation::captured_without_order(order_id, &update.intent_id, issue, now);
        tx.insert_escalation(&escalation).await?;
        tx.commit().await?;

        error!(
            event_id = %event.id,
            order_id = %order_id,
            intent_id = %update.intent_id,
            issue = ?escalation.kind,
            "Payment captured but stock is short, escalated"
        );
        Ok(WebhookAck::Escalated {
            event_id: event.id.clone(),
            order_id,
            escalation_id: escalation.id,
        })
    }
}
