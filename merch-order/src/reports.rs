use chrono::{DateTime, Utc};
use merch_shared::Money;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use uuid::Uuid;

use crate::models::{Order, OrderStatus, PaymentStatus};
use crate::settlement::{Payout, PayoutStatus};

// ============================================================================
// Read models over orders and payouts
// ============================================================================

pub const DEFAULT_PAGE_SIZE: u32 = 20;
pub const MAX_PAGE_SIZE: u32 = 100;
pub const TOP_PRODUCTS: usize = 10;

/// Listing filter, newest orders first
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct OrderFilter {
    pub status: Option<OrderStatus>,
    pub payment_status: Option<PaymentStatus>,
    #[serde(default = "first_page")]
    pub page: u32,
    #[serde(default = "default_page_size")]
    pub limit: u32,
}

fn first_page() -> u32 {
    1
}

fn default_page_size() -> u32 {
    DEFAULT_PAGE_SIZE
}

impl Default for OrderFilter {
    fn default() -> Self {
        Self {
            status: None,
            payment_status: None,
            page: first_page(),
            limit: default_page_size(),
        }
    }
}

impl OrderFilter {
    pub fn page_size(&self) -> u32 {
        self.limit.clamp(1, MAX_PAGE_SIZE)
    }

    pub fn offset(&self) -> u64 {
        u64::from(self.page.max(1) - 1) * u64::from(self.page_size())
    }

    pub fn matches(&self, order: &Order) -> bool {
        self.status.map_or(true, |s| s == order.status)
            && self.payment_status.map_or(true, |s| s == order.payment_status)
    }

    /// Apply filter, newest-first ordering and paging to an in-memory set
    pub fn select<'a>(&self, orders: impl Iterator<Item = &'a Order>) -> Vec<&'a Order> {
        let mut matching: Vec<&Order> = orders.filter(|o| self.matches(o)).collect();
        matching.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        matching
            .into_iter()
            .skip(usize::try_from(self.offset()).unwrap_or(usize::MAX))
            .take(self.page_size() as usize)
            .collect()
    }
}

/// One row of a customer's order history
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OrderSummary {
    pub order_id: Uuid,
    pub order_number: String,
    pub status: OrderStatus,
    pub payment_status: PaymentStatus,
    pub total_amount: Money,
    pub currency: String,
    pub item_count: u32,
    pub created_at: DateTime<Utc>,
}

impl From<&Order> for OrderSummary {
    fn from(order: &Order) -> Self {
        Self {
            order_id: order.id,
            order_number: order.order_number.clone(),
            status: order.status,
            payment_status: order.payment_status,
            total_amount: order.total_amount,
            currency: order.currency.clone(),
            item_count: order.items.len() as u32,
            created_at: order.created_at,
        }
    }
}

/// A vendor's share of one order
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VendorOrderSummary {
    pub order_id: Uuid,
    pub order_number: String,
    pub status: OrderStatus,
    pub payment_status: PaymentStatus,
    pub item_count: u32,
    pub quantity: u32,
    pub subtotal: Money,
    pub vendor_payout: Money,
    pub created_at: DateTime<Utc>,
}

impl VendorOrderSummary {
    /// `None` when the order has nothing from `vendor_id`
    pub fn for_vendor(order: &Order, vendor_id: Uuid) -> Option<Self> {
        let items: Vec<_> = order.items.iter().filter(|i| i.vendor_id == vendor_id).collect();
        if items.is_empty() {
            return None;
        }
        Some(Self {
            order_id: order.id,
            order_number: order.order_number.clone(),
            status: order.status,
            payment_status: order.payment_status,
            item_count: items.len() as u32,
            quantity: items.iter().map(|i| i.quantity).sum(),
            subtotal: items.iter().map(|i| i.total_price).sum(),
            vendor_payout: items.iter().map(|i| i.vendor_payout).sum(),
            created_at: order.created_at,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProductSales {
    pub product_id: Uuid,
    pub product_title: String,
    pub quantity: u64,
    pub revenue: Money,
    pub orders: u64,
}

/// Sales of one vendor across paid orders that were not cancelled
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VendorSales {
    pub vendor_id: Uuid,
    pub orders: u64,
    pub items_sold: u64,
    pub revenue: Money,
    pub vendor_payout: Money,
    pub first_sale_at: Option<DateTime<Utc>>,
    pub last_sale_at: Option<DateTime<Utc>>,
    pub top_products: Vec<ProductSales>,
}

impl VendorSales {
    pub fn empty(vendor_id: Uuid) -> Self {
        Self {
            vendor_id,
            orders: 0,
            items_sold: 0,
            revenue: Money::ZERO,
            vendor_payout: Money::ZERO,
            first_sale_at: None,
            last_sale_at: None,
            top_products: Vec::new(),
        }
    }

    /// Whether an order counts as a sale
    pub fn counts(order: &Order) -> bool {
        order.payment_status == PaymentStatus::Paid && order.status != OrderStatus::Cancelled
    }

    pub fn from_orders<'a>(vendor_id: Uuid, orders: impl Iterator<Item = &'a Order>) -> Self {
        let mut sales = Self::empty(vendor_id);
        let mut products: HashMap<Uuid, ProductSales> = HashMap::new();

        for order in orders.filter(|o| Self::counts(o)) {
            let mut seen = HashSet::new();
            for item in order.items.iter().filter(|i| i.vendor_id == vendor_id) {
                sales.items_sold += u64::from(item.quantity);
                sales.revenue += item.total_price;
                sales.vendor_payout += item.vendor_payout;

                let product = products.entry(item.product_id).or_insert_with(|| ProductSales {
                    product_id: item.product_id,
                    product_title: item.product_title.clone(),
                    quantity: 0,
                    revenue: Money::ZERO,
                    orders: 0,
                });
                product.quantity += u64::from(item.quantity);
                product.revenue += item.total_price;
                if seen.insert(item.product_id) {
                    product.orders += 1;
                }
            }
            if !seen.is_empty() {
                sales.orders += 1;
                sales.first_sale_at = Some(sales.first_sale_at.map_or(order.created_at, |t| t.min(order.created_at)));
                sales.last_sale_at = Some(sales.last_sale_at.map_or(order.created_at, |t| t.max(order.created_at)));
            }
        }

        sales.top_products = products.into_values().collect();
        sales.top_products.sort_by(|a, b| {
            b.quantity
                .cmp(&a.quantity)
                .then(b.revenue.cmp(&a.revenue))
                .then(a.product_title.cmp(&b.product_title))
        });
        sales.top_products.truncate(TOP_PRODUCTS);
        sales
    }
}

/// Where a vendor's money stands
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PayoutBalance {
    pub vendor_id: Uuid,
    pub payouts: u64,
    pub settled: Money,
    /// Pending, in flight or waiting for a retry
    pub outstanding: Money,
    pub unsettled: Money,
    pub voided: Money,
}

impl PayoutBalance {
    pub fn empty(vendor_id: Uuid) -> Self {
        Self {
            vendor_id,
            payouts: 0,
            settled: Money::ZERO,
            outstanding: Money::ZERO,
            unsettled: Money::ZERO,
            voided: Money::ZERO,
        }
    }

    /// Fold in `count` payouts in `status` totalling `amount`
    pub fn add(&mut self, status: PayoutStatus, count: u64, amount: Money) {
        self.payouts += count;
        let bucket = match status {
            PayoutStatus::Settled => &mut self.settled,
            PayoutStatus::Pending | PayoutStatus::InFlight | PayoutStatus::RetryScheduled => &mut self.outstanding,
            PayoutStatus::Unsettled => &mut self.unsettled,
            PayoutStatus::Voided => &mut self.voided,
        };
        *bucket += amount;
    }

    pub fn from_payouts<'a>(vendor_id: Uuid, payouts: impl Iterator<Item = &'a Payout>) -> Self {
        let mut balance = Self::empty(vendor_id);
        for payout in payouts.filter(|p| p.vendor_id == vendor_id) {
            balance.add(payout.status, 1, payout.amount);
        }
        balance
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::fixtures;
    use chrono::Duration;

    #[test]
    fn test_filter_pages_newest_first() {
        let now = Utc::now();
        let orders: Vec<Order> = (0..5)
            .map(|i| {
                let mut order = fixtures::order(OrderStatus::Confirmed);
                order.created_at = now + Duration::minutes(i);
                order
            })
            .collect();

        let filter = OrderFilter {
            page: 2,
            limit: 2,
            ..OrderFilter::default()
        };
        let page = filter.select(orders.iter());
        assert_eq!(page.len(), 2);
        assert_eq!(page[0].id, orders[2].id);
        assert_eq!(page[1].id, orders[1].id);

        let oversized = OrderFilter {
            limit: 10_000,
            ..OrderFilter::default()
        };
        assert_eq!(oversized.page_size(), MAX_PAGE_SIZE);

        let cancelled = OrderFilter {
            status: Some(OrderStatus::Cancelled),
            ..OrderFilter::default()
        };
        assert!(cancelled.select(orders.iter()).is_empty());
    }

    #[test]
    fn test_filter_reads_query_defaults() {
        let filter: OrderFilter = serde_json::from_str(r#"{"status": "confirmed"}"#).unwrap();
        assert_eq!(filter.status, Some(OrderStatus::Confirmed));
        assert_eq!((filter.page, filter.limit), (1, DEFAULT_PAGE_SIZE));
        assert_eq!(filter.offset(), 0);
    }

    #[test]
    fn test_vendor_sales_count_paid_orders_only() {
        let mut paid = fixtures::order(OrderStatus::Confirmed);
        paid.payment_status = PaymentStatus::Paid;
        let vendor_id = paid.items[0].vendor_id;

        let mut second = paid.clone();
        second.id = Uuid::new_v4();
        second.created_at = paid.created_at + Duration::days(1);

        let mut cancelled = paid.clone();
        cancelled.id = Uuid::new_v4();
        cancelled.status = OrderStatus::Cancelled;

        let mut unpaid = paid.clone();
        unpaid.id = Uuid::new_v4();
        unpaid.payment_status = PaymentStatus::Pending;

        let orders = [paid.clone(), second.clone(), cancelled, unpaid];
        let sales = VendorSales::from_orders(vendor_id, orders.iter());

        assert_eq!(sales.orders, 2);
        assert_eq!(sales.items_sold, 6);
        assert_eq!(sales.revenue, Money::from_minor(6000));
        assert_eq!(sales.vendor_payout, Money::from_minor(5100));
        assert_eq!(sales.first_sale_at, Some(paid.created_at));
        assert_eq!(sales.last_sale_at, Some(second.created_at));
        assert_eq!(sales.top_products[0].product_id, paid.items[0].product_id);
        assert_eq!(sales.top_products[0].quantity, 4);

        let stranger = VendorSales::from_orders(Uuid::new_v4(), orders.iter());
        assert_eq!(stranger, VendorSales::empty(stranger.vendor_id));
    }

    #[test]
    fn test_vendor_order_summary_only_counts_own_items() {
        let order = fixtures::order(OrderStatus::Confirmed);
        let vendor_id = order.items[0].vendor_id;

        let summary = VendorOrderSummary::for_vendor(&order, vendor_id).unwrap();
        assert_eq!(summary.item_count, 2);
        assert_eq!(summary.quantity, 3);
        assert_eq!(summary.subtotal, Money::from_minor(3000));
        assert_eq!(summary.vendor_payout, Money::from_minor(2550));

        assert!(VendorOrderSummary::for_vendor(&order, Uuid::new_v4()).is_none());
    }

    #[test]
    fn test_payout_balance_buckets() {
        let mut order = fixtures::order(OrderStatus::Confirmed);
        order.payment_status = PaymentStatus::Paid;
        let vendor_id = order.vendor_splits[0].vendor_id;
        let now = Utc::now();

        let statuses = [
            PayoutStatus::Settled,
            PayoutStatus::InFlight,
            PayoutStatus::RetryScheduled,
            PayoutStatus::Unsettled,
            PayoutStatus::Voided,
        ];
        let payouts: Vec<Payout> = statuses
            .iter()
            .map(|status| {
                let mut payout = crate::settlement::plan(&order, now).remove(0);
                payout.status = *status;
                payout
            })
            .collect();

        let balance = PayoutBalance::from_payouts(vendor_id, payouts.iter());
        assert_eq!(balance.payouts, 5);
        assert_eq!(balance.settled, Money::from_minor(2550));
        assert_eq!(balance.outstanding, Money::from_minor(5100));
        assert_eq!(balance.unsettled, Money::from_minor(2550));
        assert_eq!(balance.voided, Money::from_minor(2550));
    }
}
