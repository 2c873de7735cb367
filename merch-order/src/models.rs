use chrono::{DateTime, Utc};
use merch_catalog::{ProductCategory, StockLine, VariantSelection};
use merch_shared::{Masked, Money, Rate};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use uuid::Uuid;

use crate::store::OrderError;

/// Order status in the lifecycle
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    PendingPayment,
    Confirmed,
    PaymentFailed,
    Processing,
    Shipped,
    Delivered,
    Cancelled,
}

impl OrderStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            OrderStatus::PendingPayment => "pending_payment",
            OrderStatus::Confirmed => "confirmed",
            OrderStatus::PaymentFailed => "payment_failed",
            OrderStatus::Processing => "processing",
            OrderStatus::Shipped => "shipped",
            OrderStatus::Delivered => "delivered",
            OrderStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending_payment" => Some(OrderStatus::PendingPayment),
            "confirmed" => Some(OrderStatus::Confirmed),
            "payment_failed" => Some(OrderStatus::PaymentFailed),
            "processing" => Some(OrderStatus::Processing),
            "shipped" => Some(OrderStatus::Shipped),
            "delivered" => Some(OrderStatus::Delivered),
            "cancelled" => Some(OrderStatus::Cancelled),
            _ => None,
        }
    }

    /// The complete transition table. Anything not listed here is rejected.
    pub fn can_transition_to(self, next: OrderStatus) -> bool {
        use OrderStatus::*;
        matches!(
            (self, next),
            (PendingPayment, Confirmed)
                | (PendingPayment, PaymentFailed)
                | (PendingPayment, Cancelled)
                | (Confirmed, Processing)
                | (Confirmed, Cancelled)
                | (Processing, Shipped)
                | (Processing, Cancelled)
                | (Shipped, Delivered)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            OrderStatus::Delivered | OrderStatus::Cancelled | OrderStatus::PaymentFailed
        )
    }

    /// Stock was decremented when this order was confirmed
    pub fn holds_stock(self) -> bool {
        matches!(
            self,
            OrderStatus::Confirmed | OrderStatus::Processing | OrderStatus::Shipped | OrderStatus::Delivered
        )
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    Pending,
    Paid,
    Failed,
}

impl PaymentStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            PaymentStatus::Pending => "pending",
            PaymentStatus::Paid => "paid",
            PaymentStatus::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(PaymentStatus::Pending),
            "paid" => Some(PaymentStatus::Paid),
            "failed" => Some(PaymentStatus::Failed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ShippingAddress {
    pub name: String,
    pub line1: String,
    #[serde(default)]
    pub line2: Option<String>,
    pub city: String,
    #[serde(default)]
    pub county: Option<String>,
    #[serde(default)]
    pub postal_code: Option<String>,
    /// ISO 3166-1 alpha-2
    pub country: String,
}

impl ShippingAddress {
    pub fn problems(&self) -> Vec<String> {
        let mut problems = Vec::new();
        for (field, value) in [("name", &self.name), ("line1", &self.line1), ("city", &self.city)] {
            if value.trim().is_empty() {
                problems.push(format!("{} is required", field));
            }
        }
        if self.country.len() != 2 || !self.country.chars().all(|c| c.is_ascii_alphabetic()) {
            problems.push(format!("country '{}' is not a two-letter code", self.country));
        }
        problems
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CustomerContact {
    pub email: Masked<String>,
    #[serde(default)]
    pub name: Option<String>,
    /// Owner of the cart this order was built from
    #[serde(default)]
    pub user_id: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Shipment {
    pub carrier: Option<String>,
    pub tracking_number: Option<String>,
}

/// An individual product within an order
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OrderItem {
    pub id: Uuid,
    pub order_id: Uuid,
    pub product_id: Uuid,
    pub vendor_id: Uuid,
    pub product_title: String,
    pub category: ProductCategory,
    pub variant: VariantSelection,
    pub quantity: u32,
    pub unit_price: Money,
    pub total_price: Money,
    pub vendor_payout: Money,
}

/// A vendor's share of the order, fixed at checkout
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VendorSplit {
    pub vendor_id: Uuid,
    pub destination_account: String,
    pub commission_rate: Rate,
    pub subtotal: Money,
    pub platform_fee: Money,
    pub vendor_payout: Money,
}

/// The persisted record of a purchase
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Order {
    pub id: Uuid,
    pub order_number: String,
    pub customer: CustomerContact,
    pub shipping_address: ShippingAddress,
    pub subtotal: Money,
    pub shipping_cost: Money,
    pub shipping_method: String,
    pub tax_amount: Money,
    pub platform_fee: Money,
    pub total_amount: Money,
    pub currency: String,
    pub status: OrderStatus,
    pub payment_status: PaymentStatus,
    pub payment_intent_id: Option<String>,
    #[serde(skip_serializing)]
    pub client_secret: Option<String>,
    pub checkout_key: Option<String>,
    pub version: i64,
    pub items: Vec<OrderItem>,
    pub vendor_splits: Vec<VendorSplit>,
    pub shipment: Option<Shipment>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub confirmed_at: Option<DateTime<Utc>>,
    pub shipped_at: Option<DateTime<Utc>>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,
}

/// `ORD-20261016-1A2B3C4D`
pub fn generate_order_number(id: Uuid, now: DateTime<Utc>) -> String {
    let suffix = id.simple().to_string();
    format!("ORD-{}-{}", now.format("%Y%m%d"), suffix[..8].to_uppercase())
}

impl Order {
    /// Move to `next`, stamping the matching timestamp
    pub fn transition(&mut self, next: OrderStatus, now: DateTime<Utc>) -> Result<(), OrderError> {
        if !self.status.can_transition_to(next) {
            return Err(OrderError::InvalidTransition {
                from: self.status,
                to: next,
            });
        }

        self.status = next;
        self.updated_at = now;
        match next {
            OrderStatus::Confirmed => self.confirmed_at = Some(now),
            OrderStatus::Shipped => self.shipped_at = Some(now),
            OrderStatus::Delivered => self.delivered_at = Some(now),
            OrderStatus::Cancelled => self.cancelled_at = Some(now),
            _ => {}
        }
        Ok(())
    }

    /// Physical stock this order takes, one line per product
    pub fn stock_lines(&self) -> Vec<StockLine> {
        StockLine::consolidate(
            self.items
                .iter()
                .filter_map(|item| StockLine::physical(item.product_id, item.category, item.quantity)),
        )
    }

    /// Money invariants every persisted order must satisfy
    pub fn check_invariants(&self) -> Result<(), OrderError> {
        let items_total: Money = self.items.iter().map(|i| i.total_price).sum();
        if items_total != self.subtotal {
            return Err(OrderError::InvariantViolation(format!(
                "items total {} != subtotal {}",
                items_total, self.subtotal
            )));
        }

        if self.total_amount != self.subtotal + self.shipping_cost + self.tax_amount {
            return Err(OrderError::InvariantViolation(format!(
                "total {} != subtotal + shipping + tax",
                self.total_amount
            )));
        }

        let fees: Money = self.vendor_splits.iter().map(|s| s.platform_fee).sum();
        if fees != self.platform_fee {
            return Err(OrderError::InvariantViolation(format!(
                "platform fee {} != sum of vendor fees {}",
                self.platform_fee, fees
            )));
        }

        let payouts: Money = self.items.iter().map(|i| i.vendor_payout).sum();
        if payouts + fees != self.subtotal {
            return Err(OrderError::InvariantViolation(format!(
                "payouts {} + fees {} != subtotal {}",
                payouts, fees, self.subtotal
            )));
        }

        let mut per_vendor: HashMap<Uuid, Money> = HashMap::new();
        for item in &self.items {
            *per_vendor.entry(item.vendor_id).or_default() += item.vendor_payout;
        }
        for split in &self.vendor_splits {
            let items_payout = per_vendor.remove(&split.vendor_id).unwrap_or_default();
            if items_payout != split.vendor_payout || split.subtotal - split.platform_fee != split.vendor_payout {
                return Err(OrderError::InvariantViolation(format!(
                    "vendor {} payout does not match its items",
                    split.vendor_id
                )));
            }
        }
        if let Some(vendor_id) = per_vendor.keys().next() {
            return Err(OrderError::InvariantViolation(format!(
                "vendor {} has items but no split",
                vendor_id
            )));
        }

        Ok(())
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [OrderStatus; 7] = [
        OrderStatus::PendingPayment,
        OrderStatus::Confirmed,
        OrderStatus::PaymentFailed,
        OrderStatus::Processing,
        OrderStatus::Shipped,
        OrderStatus::Delivered,
        OrderStatus::Cancelled,
    ];

    #[test]
    fn test_order_lifecycle() {
        let mut order = fixtures::order(OrderStatus::PendingPayment);
        let now = Utc::now();

        order.transition(OrderStatus::Confirmed, now).unwrap();
        assert_eq!(order.confirmed_at, Some(now));
        order.transition(OrderStatus::Processing, now).unwrap();
        order.transition(OrderStatus::Shipped, now).unwrap();
        assert!(order.shipped_at.is_some());
        order.transition(OrderStatus::Delivered, now).unwrap();
        assert!(order.status.is_terminal());
    }

    #[test]
    fn test_invalid_transition() {
        let mut order = fixtures::order(OrderStatus::Shipped);
        let err = order.transition(OrderStatus::Cancelled, Utc::now()).unwrap_err();
        assert!(matches!(
            err,
            OrderError::InvalidTransition { from: OrderStatus::Shipped, to: OrderStatus::Cancelled }
        ));
        assert_eq!(order.status, OrderStatus::Shipped);
    }

    #[test]
    fn test_cancel_only_from_unshipped_states() {
        for status in ALL {
            let allowed = status.can_transition_to(OrderStatus::Cancelled);
            let expected = matches!(
                status,
                OrderStatus::PendingPayment | OrderStatus::Confirmed | OrderStatus::Processing
            );
            assert_eq!(allowed, expected, "cancel from {}", status);
        }
    }

    #[test]
    fn test_terminal_states_have_no_exits() {
        for from in ALL.into_iter().filter(|s| s.is_terminal()) {
            for to in ALL {
                assert!(!from.can_transition_to(to), "{} -> {}", from, to);
            }
        }
    }

    #[test]
    fn test_status_names() {
        for status in ALL {
            assert_eq!(OrderStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(
            serde_json::to_string(&OrderStatus::PendingPayment).unwrap(),
            "\"pending_payment\""
        );
    }

    #[test]
    fn test_stock_lines_skip_digital() {
        let order = fixtures::order(OrderStatus::Confirmed);
        let lines = order.stock_lines();
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0].quantity(), 2);
    }

    #[test]
    fn test_invariants() {
        let mut order = fixtures::order(OrderStatus::Confirmed);
        order.check_invariants().unwrap();

        order.items[0].vendor_payout = Money::from_minor(1701);
        assert!(matches!(order.check_invariants(), Err(OrderError::InvariantViolation(_))));
    }

    #[test]
    fn test_address_problems() {
        assert!(fixtures::address().problems().is_empty());
        let mut bad = fixtures::address();
        bad.country = "Ireland".into();
        bad.city = " ".into();
        assert_eq!(bad.problems().len(), 2);
    }

    #[test]
    fn test_order_number_format() {
        let id = Uuid::parse_str("1a2b3c4d-0000-0000-0000-000000000000").unwrap();
        let now = DateTime::parse_from_rfc3339("2026-10-16T10:00:00Z").unwrap().with_timezone(&Utc);
        assert_eq!(generate_order_number(id, now), "ORD-20261016-1A2B3C4D");
    }
}
