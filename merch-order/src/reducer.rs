use merch_catalog::{AccountUpdate, StockLine};
use serde::Serialize;

use crate::escalation::CaptureIssue;
use crate::events::{GatewayEvent, PaymentUpdate};
use crate::models::{Order, OrderStatus, PaymentStatus};

/// Side effects a confirmed payment carries, applied in the same unit as the
/// status change
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    DecrementStock(Vec<StockLine>),
    ClearCart(String),
    PlanSettlement,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IgnoreReason {
    UnknownOrder,
    IntentMismatch,
    AlreadyApplied,
    Stale,
    Unsupported,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    Transition {
        to: OrderStatus,
        payment_status: PaymentStatus,
        effects: Vec<Effect>,
    },
    UpdateAccount(AccountUpdate),
    /// Money was captured for an order that cannot be fulfilled
    Escalate(CaptureIssue),
    Ignore(IgnoreReason),
}

/// What to do with a gateway event given the order as it is now stored.
///
/// Pure: the caller holds the order's row lock and applies the decision.
pub fn decide(event: &GatewayEvent, order: Option<&Order>) -> Decision {
    match event {
        GatewayEvent::PaymentSucceeded(update) => match matching_order(update, order) {
            Ok(order) => payment_succeeded(update, order),
            Err(reason) => Decision::Ignore(reason),
        },
        GatewayEvent::PaymentFailed(update) => match matching_order(update, order) {
            Ok(order) if order.status == OrderStatus::PendingPayment => Decision::Transition {
                to: OrderStatus::PaymentFailed,
                payment_status: PaymentStatus::Failed,
                effects: Vec::new(),
            },
            Ok(_) => Decision::Ignore(IgnoreReason::Stale),
            Err(reason) => Decision::Ignore(reason),
        },
        GatewayEvent::AccountUpdated(update) => Decision::UpdateAccount(update.clone()),
        GatewayEvent::Unsupported => Decision::Ignore(IgnoreReason::Unsupported),
    }
}

fn matching_order<'a>(update: &PaymentUpdate, order: Option<&'a Order>) -> Result<&'a Order, IgnoreReason> {
    let order = order.ok_or(IgnoreReason::UnknownOrder)?;
    match order.payment_intent_id.as_deref() {
        Some(intent_id) if intent_id != update.intent_id => Err(IgnoreReason::IntentMismatch),
        _ => Ok(order),
    }
}

fn payment_succeeded(update: &PaymentUpdate, order: &Order) -> Decision {
    match order.status {
        OrderStatus::PendingPayment => {}
        OrderStatus::Confirmed | OrderStatus::Processing | OrderStatus::Shipped | OrderStatus::Delivered => {
            return Decision::Ignore(IgnoreReason::AlreadyApplied);
        }
        OrderStatus::PaymentFailed | OrderStatus::Cancelled => {
            return Decision::Escalate(CaptureIssue::OrderNotPayable { status: order.status });
        }
    }

    if update.amount != order.total_amount || !update.currency.eq_ignore_ascii_case(&order.currency) {
        return Decision::Escalate(CaptureIssue::AmountMismatch {
            expected: order.total_amount,
            received: update.amount,
            currency: update.currency.clone(),
        });
    }

    let mut effects = Vec::new();
    let stock = order.stock_lines();
    if !stock.is_empty() {
        effects.push(Effect::DecrementStock(stock));
    }
    if let Some(owner) = &order.customer.user_id {
        effects.push(Effect::ClearCart(owner.clone()));
    }
    effects.push(Effect::PlanSettlement);

    Decision::Transition {
        to: OrderStatus::Confirmed,
        payment_status: PaymentStatus::Paid,
        effects,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::fixtures;
    use merch_shared::Money;

    fn update(order: &Order) -> PaymentUpdate {
        PaymentUpdate {
            intent_id: "pi_1".into(),
            order_id: Some(order.id),
            amount: order.total_amount,
            currency: order.currency.clone(),
            failure_message: None,
        }
    }

    fn pending() -> Order {
        let mut order = fixtures::order(OrderStatus::PendingPayment);
        order.payment_intent_id = Some("pi_1".into());
        order
    }

    #[test]
    fn test_success_confirms_with_effects() {
        let order = pending();
        let decision = decide(&GatewayEvent::PaymentSucceeded(update(&order)), Some(&order));

        let Decision::Transition { to, payment_status, effects } = decision else {
            panic!("expected transition");
        };
        assert_eq!(to, OrderStatus::Confirmed);
        assert_eq!(payment_status, PaymentStatus::Paid);
        assert_eq!(
            effects,
            vec![
                Effect::DecrementStock(order.stock_lines()),
                Effect::ClearCart("user-1".into()),
                Effect::PlanSettlement,
            ]
        );
    }

    #[test]
    fn test_guest_order_has_no_cart_to_clear() {
        let mut order = pending();
        order.customer.user_id = None;
        let decision = decide(&GatewayEvent::PaymentSucceeded(update(&order)), Some(&order));
        let Decision::Transition { effects, .. } = decision else {
            panic!("expected transition");
        };
        assert!(!effects.iter().any(|e| matches!(e, Effect::ClearCart(_))));
    }

    #[test]
    fn test_success_is_idempotent_once_confirmed() {
        let mut order = pending();
        for status in [
            OrderStatus::Confirmed,
            OrderStatus::Processing,
            OrderStatus::Shipped,
            OrderStatus::Delivered,
        ] {
            order.status = status;
            assert_eq!(
                decide(&GatewayEvent::PaymentSucceeded(update(&order)), Some(&order)),
                Decision::Ignore(IgnoreReason::AlreadyApplied)
            );
        }
    }

    #[test]
    fn test_success_on_dead_order_escalates() {
        let mut order = pending();
        order.status = OrderStatus::Cancelled;
        assert_eq!(
            decide(&GatewayEvent::PaymentSucceeded(update(&order)), Some(&order)),
            Decision::Escalate(CaptureIssue::OrderNotPayable {
                status: OrderStatus::Cancelled
            })
        );
    }

    #[test]
    fn test_amount_mismatch_escalates() {
        let order = pending();
        let mut update = update(&order);
        update.amount = Money::from_minor(1);
        assert!(matches!(
            decide(&GatewayEvent::PaymentSucceeded(update), Some(&order)),
            Decision::Escalate(CaptureIssue::AmountMismatch { .. })
        ));
    }

    #[test]
    fn test_foreign_intent_and_unknown_order_ignored() {
        let order = pending();
        let mut foreign = update(&order);
        foreign.intent_id = "pi_other".into();
        assert_eq!(
            decide(&GatewayEvent::PaymentSucceeded(foreign), Some(&order)),
            Decision::Ignore(IgnoreReason::IntentMismatch)
        );
        assert_eq!(
            decide(&GatewayEvent::PaymentFailed(update(&order)), None),
            Decision::Ignore(IgnoreReason::UnknownOrder)
        );
    }

    #[test]
    fn test_failure_only_moves_pending_orders() {
        let mut order = pending();
        assert_eq!(
            decide(&GatewayEvent::PaymentFailed(update(&order)), Some(&order)),
            Decision::Transition {
                to: OrderStatus::PaymentFailed,
                payment_status: PaymentStatus::Failed,
                effects: Vec::new(),
            }
        );

        order.status = OrderStatus::Confirmed;
        assert_eq!(
            decide(&GatewayEvent::PaymentFailed(update(&order)), Some(&order)),
            Decision::Ignore(IgnoreReason::Stale)
        );
    }
}
