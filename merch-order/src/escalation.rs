use chrono::{DateTime, Utc};
use merch_shared::Money;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::OrderStatus;
use crate::settlement::Payout;

/// Why a captured payment has no order it can fulfil
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "issue", rename_all = "snake_case")]
pub enum CaptureIssue {
    StockShortfall { product_id: Uuid, requested: u32 },
    OrderNotPayable { status: OrderStatus },
    AmountMismatch { expected: Money, received: Money, currency: String },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EscalationKind {
    CapturedWithoutFulfillableOrder {
        order_id: Uuid,
        intent_id: String,
        issue: CaptureIssue,
    },
    UnsettledPayout {
        payout_id: Uuid,
        order_id: Uuid,
        vendor_id: Uuid,
        amount: Money,
        attempts: u32,
        last_error: String,
    },
    /// A paid order was cancelled and the customer needs a refund
    RefundRequired { order_id: Uuid, amount: Money },
}

/// A case the engine will not resolve on its own
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Escalation {
    pub id: Uuid,
    pub dedupe_key: String,
    pub kind: EscalationKind,
    pub created_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub resolution_note: Option<String>,
}

impl Escalation {
    fn open(dedupe_key: String, kind: EscalationKind, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            dedupe_key,
            kind,
            created_at: now,
            resolved_at: None,
            resolution_note: None,
        }
    }

    pub fn captured_without_order(order_id: Uuid, intent_id: &str, issue: CaptureIssue, now: DateTime<Utc>) -> Self {
        Self::open(
            format!("capture:{}:{}", order_id, intent_id),
            EscalationKind::CapturedWithoutFulfillableOrder {
                order_id,
                intent_id: intent_id.to_string(),
                issue,
            },
            now,
        )
    }

    pub fn unsettled_payout(payout: &Payout, last_error: &str, now: DateTime<Utc>) -> Self {
        Self::open(
            format!("payout:{}", payout.id),
            EscalationKind::UnsettledPayout {
                payout_id: payout.id,
                order_id: payout.order_id,
                vendor_id: payout.vendor_id,
                amount: payout.amount,
                attempts: payout.attempts,
                last_error: last_error.to_string(),
            },
            now,
        )
    }

    pub fn refund_required(order_id: Uuid, amount: Money, now: DateTime<Utc>) -> Self {
        Self::open(
            format!("refund:{}", order_id),
            EscalationKind::RefundRequired { order_id, amount },
            now,
        )
    }

    pub fn is_open(&self) -> bool {
        self.resolved_at.is_none()
    }

    pub fn kind_name(&self) -> &'static str {
        match self.kind {
            EscalationKind::CapturedWithoutFulfillableOrder { .. } => "captured_without_fulfillable_order",
            EscalationKind::UnsettledPayout { .. } => "unsettled_payout",
            EscalationKind::RefundRequired { .. } => "refund_required",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_escalation_wire_shape() {
        let order_id = Uuid::nil();
        let escalation = Escalation::captured_without_order(
            order_id,
            "pi_1",
            CaptureIssue::StockShortfall { product_id: Uuid::nil(), requested: 2 },
            Utc::now(),
        );
        assert_eq!(escalation.dedupe_key, format!("capture:{}:pi_1", order_id));
        assert_eq!(escalation.kind_name(), "captured_without_fulfillable_order");

        let json = serde_json::to_value(&escalation.kind).unwrap();
        assert_eq!(json["kind"], "captured_without_fulfillable_order");
        assert_eq!(json["issue"]["issue"], "stock_shortfall");
        assert_eq!(json["issue"]["requested"], 2);

        let back: EscalationKind = serde_json::from_value(json).unwrap();
        assert_eq!(back, escalation.kind);
    }
}
