use chrono::{DateTime, Utc};
use merch_catalog::{InventoryError, InventoryReconciler};
use merch_core::PaymentIntent;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::calculator::{CheckoutRequest, PricedOrder};
use crate::escalation::Escalation;
use crate::models::{generate_order_number, Order, OrderItem, OrderStatus, PaymentStatus, Shipment, VendorSplit};
use crate::reports::{OrderFilter, OrderSummary, VendorOrderSummary, VendorSales};
use crate::repository::{OrderRepository, RepoError};

#[derive(Debug, thiserror::Error)]
pub enum OrderError {
    #[error("Order not found: {0}")]
    NotFound(Uuid),

    #[error("Invalid state transition from {from} to {to}")]
    InvalidTransition { from: OrderStatus, to: OrderStatus },

    #[error("Order invariant violated: {0}")]
    InvariantViolation(String),

    #[error(transparent)]
    Inventory(#[from] InventoryError),

    #[error(transparent)]
    Repository(#[from] RepoError),
}

/// Operator-driven fulfilment steps after confirmation
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FulfilmentStep {
    Processing,
    Shipped,
    Delivered,
}

impl From<FulfilmentStep> for OrderStatus {
    fn from(step: FulfilmentStep) -> Self {
        match step {
            FulfilmentStep::Processing => OrderStatus::Processing,
            FulfilmentStep::Shipped => OrderStatus::Shipped,
            FulfilmentStep::Delivered => OrderStatus::Delivered,
        }
    }
}

/// Persistent order lifecycle. Every transition runs inside one unit of work
/// holding the order's row lock.
pub struct OrderStore {
    orders: Arc<dyn OrderRepository>,
}

impl OrderStore {
    pub fn new(orders: Arc<dyn OrderRepository>) -> Self {
        Self { orders }
    }

    /// Build the pending order from the calculator output
    pub fn build_pending(request: &CheckoutRequest, priced: PricedOrder, now: DateTime<Utc>) -> Order {
        let id = Uuid::new_v4();
        let breakdown = priced.breakdown;

        let items = priced
            .items
            .into_iter()
            .map(|item| OrderItem {
                id: Uuid::new_v4(),
                order_id: id,
                product_id: item.product_id,
                vendor_id: item.vendor_id,
                product_title: item.product_title,
                category: item.category,
                variant: item.variant,
                quantity: item.quantity,
                unit_price: item.unit_price,
                total_price: item.total_price,
                vendor_payout: item.vendor_payout,
            })
            .collect();

        let vendor_splits = breakdown
            .vendors
            .into_iter()
            .map(|v| VendorSplit {
                vendor_id: v.vendor_id,
                destination_account: v.destination_account,
                commission_rate: v.commission_rate,
                subtotal: v.subtotal,
                platform_fee: v.platform_fee,
                vendor_payout: v.vendor_payout,
            })
            .collect();

        Order {
            id,
            order_number: generate_order_number(id, now),
            customer: request.customer.clone(),
            shipping_address: request.shipping_address.clone(),
            subtotal: breakdown.subtotal,
            shipping_cost: breakdown.shipping.cost,
            shipping_method: breakdown.shipping.name,
            tax_amount: breakdown.tax_amount,
            platform_fee: breakdown.platform_fee,
            total_amount: breakdown.total_amount,
            currency: breakdown.currency,
            status: OrderStatus::PendingPayment,
            payment_status: PaymentStatus::Pending,
            payment_intent_id: None,
            client_secret: None,
            checkout_key: request.checkout_key.clone(),
            version: 0,
            items,
            vendor_splits,
            shipment: None,
            created_at: now,
            updated_at: now,
            confirmed_at: None,
            shipped_at: None,
            delivered_at: None,
            cancelled_at: None,
        }
    }

    /// Persist a new order in `pending_payment`
    pub async fn create_pending(&self, request: &CheckoutRequest, priced: PricedOrder) -> Result<Order, OrderError> {
        let order = Self::build_pending(request, priced, Utc::now());
        order.check_invariants()?;

        let mut tx = self.orders.begin().await?;
        tx.insert_order(&order).await?;
        tx.commit().await?;

        info!(order_id = %order.id, order_number = %order.order_number, total = %order.total_amount, "Order created");
        Ok(order)
    }

    pub async fn attach_payment_intent(&self, order_id: Uuid, intent: &PaymentIntent) -> Result<(), OrderError> {
        self.orders
            .attach_payment_intent(order_id, &intent.intent_id, &intent.client_secret)
            .await
            .map_err(|e| match e {
                RepoError::NotFound(_) => OrderError::NotFound(order_id),
                other => other.into(),
            })
    }

    pub async fn get(&self, order_id: Uuid) -> Result<Order, OrderError> {
        self.orders.get_order(order_id).await?.ok_or(OrderError::NotFound(order_id))
    }

    pub async fn find_by_checkout_key(&self, checkout_key: &str) -> Result<Option<Order>, OrderError> {
        Ok(self.orders.find_by_checkout_key(checkout_key).await?)
    }

    /// Order history of a signed-in customer
    pub async fn customer_orders(&self, user_id: &str, filter: &OrderFilter) -> Result<Vec<OrderSummary>, OrderError> {
        Ok(self.orders.customer_orders(user_id, filter).await?)
    }

    pub async fn vendor_orders(
        &self,
        vendor_id: Uuid,
        filter: &OrderFilter,
    ) -> Result<Vec<VendorOrderSummary>, OrderError> {
        Ok(self.orders.vendor_orders(vendor_id, filter).await?)
    }

    pub async fn vendor_sales(&self, vendor_id: Uuid) -> Result<VendorSales, OrderError> {
        Ok(self.orders.vendor_sales(vendor_id).await?)
    }

    /// Cancel an unshipped order.
    ///
    /// Stock is restored only if it was taken, and payouts that have not settled
    /// are voided, in the same unit. A transfer already on the wire keeps its
    /// claim only long enough to record a success. A concurrent second cancel
    /// sees `cancelled` and fails.
    pub async fn cancel(&self, order_id: Uuid) -> Result<Order, OrderError> {
        let now = Utc::now();
        let mut tx = self.orders.begin().await?;
        let mut order = tx.lock_order(order_id).await?.ok_or(OrderError::NotFound(order_id))?;

        let held_stock = order.status.holds_stock();
        order.transition(OrderStatus::Cancelled, now)?;

        if held_stock {
            for line in order.stock_lines() {
                InventoryReconciler::restore(tx.as_mut(), &line).await?;
            }
        }

        let voided = tx.void_pending_payouts(order.id, now).await?;
        if order.payment_status == PaymentStatus::Paid {
            tx.insert_escalation(&Escalation::refund_required(order.id, order.total_amount, now))
                .await?;
        }

        tx.update_order(&order).await?;
        order.version += 1;
        tx.commit().await?;

        info!(order_id = %order.id, restored_stock = held_stock, voided_payouts = voided, "Order cancelled");
        if order.payment_status == PaymentStatus::Paid {
            warn!(order_id = %order.id, amount = %order.total_amount, "Paid order cancelled, refund escalated");
        }
        Ok(order)
    }

    /// Move a confirmed order through fulfilment
    pub async fn advance(
        &self,
        order_id: Uuid,
        step: FulfilmentStep,
        shipment: Option<Shipment>,
    ) -> Result<Order, OrderError> {
        let now = Utc::now();
        let mut tx = self.orders.begin().await?;
        let mut order = tx.lock_order(order_id).await?.ok_or(OrderError::NotFound(order_id))?;

        order.transition(step.into(), now)?;
        if step == FulfilmentStep::Shipped {
            order.shipment = shipment;
        }

        tx.update_order(&order).await?;
        order.version += 1;
        tx.commit().await?;

        info!(order_id = %order.id, status = %order.status, "Order advanced");
        Ok(order)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::escalation::EscalationKind;
    use crate::memory::InMemoryStore;
    use crate::models::fixtures;
    use crate::repository::EscalationRepository;
    use merch_catalog::{Product, ProductCategory, VariantOptions};
    use merch_shared::Money;

    async fn persisted(store: &InMemoryStore, status: OrderStatus, stock: i32) -> Order {
        let mut order = fixtures::order(status);
        if status.holds_stock() {
            order.payment_status = PaymentStatus::Paid;
        }
        for item in &order.items {
            store
                .insert_product(Product {
                    id: item.product_id,
                    vendor_id: item.vendor_id,
                    title: item.product_title.clone(),
                    price: item.unit_price,
                    category: item.category,
                    inventory_count: stock,
                    weight_grams: 100,
                    is_active: true,
                    variant_options: VariantOptions::default(),
                })
                .await;
        }
        let mut tx = store.begin().await.unwrap();
        tx.insert_order(&order).await.unwrap();
        tx.commit().await.unwrap();
        order
    }

    #[tokio::test]
    async fn test_cancel_confirmed_restores_physical_stock() {
        let store = InMemoryStore::new();
        let order = persisted(&store, OrderStatus::Confirmed, 5).await;
        let orders = OrderStore::new(Arc::new(store.clone()));

        let cancelled = orders.cancel(order.id).await.unwrap();
        assert_eq!(cancelled.status, OrderStatus::Cancelled);
        assert!(cancelled.cancelled_at.is_some());

        let tee = &order.items[0];
        let download = &order.items[1];
        assert_eq!(download.category, ProductCategory::Digital);
        assert_eq!(store.inventory(tee.product_id).await, Some(7));
        assert_eq!(store.inventory(download.product_id).await, Some(5));

        let escalations = store.list_escalations(false).await.unwrap();
        assert_eq!(escalations.len(), 1);
        assert!(matches!(
            escalations[0].kind,
            EscalationKind::RefundRequired { amount, .. } if amount == Money::from_minor(4244)
        ));
    }

    #[tokio::test]
    async fn test_cancel_pending_leaves_stock() {
        let store = InMemoryStore::new();
        let order = persisted(&store, OrderStatus::PendingPayment, 5).await;
        let orders = OrderStore::new(Arc::new(store.clone()));

        orders.cancel(order.id).await.unwrap();
        assert_eq!(store.inventory(order.items[0].product_id).await, Some(5));
        assert!(store.list_escalations(false).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_cancel_twice_fails_second_time() {
        let store = InMemoryStore::new();
        let order = persisted(&store, OrderStatus::Processing, 1).await;
        let orders = OrderStore::new(Arc::new(store.clone()));

        orders.cancel(order.id).await.unwrap();
        let err = orders.cancel(order.id).await.unwrap_err();
        assert!(matches!(
            err,
            OrderError::InvalidTransition { from: OrderStatus::Cancelled, to: OrderStatus::Cancelled }
        ));
        assert_eq!(store.inventory(order.items[0].product_id).await, Some(3));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_cancels_restore_once() {
        let store = InMemoryStore::new();
        let order = persisted(&store, OrderStatus::Confirmed, 0).await;
        let orders = Arc::new(OrderStore::new(Arc::new(store.clone())));

        let handles: Vec<_> = (0..2)
            .map(|_| {
                let orders = orders.clone();
                tokio::spawn(async move { orders.cancel(order.id).await })
            })
            .collect();

        let mut succeeded = 0;
        for handle in handles {
            if handle.await.unwrap().is_ok() {
                succeeded += 1;
            }
        }
        assert_eq!(succeeded, 1);
        assert_eq!(store.inventory(order.items[0].product_id).await, Some(2));
    }

    #[tokio::test]
    async fn test_cancel_rejected_after_shipping() {
        let store = InMemoryStore::new();
        let order = persisted(&store, OrderStatus::Shipped, 1).await;
        let orders = OrderStore::new(Arc::new(store.clone()));

        assert!(matches!(
            orders.cancel(order.id).await,
            Err(OrderError::InvalidTransition { from: OrderStatus::Shipped, .. })
        ));
        assert_eq!(store.inventory(order.items[0].product_id).await, Some(1));
    }

    #[tokio::test]
    async fn test_advance_records_shipment() {
        let store = InMemoryStore::new();
        let order = persisted(&store, OrderStatus::Confirmed, 1).await;
        let orders = OrderStore::new(Arc::new(store.clone()));

        orders.advance(order.id, FulfilmentStep::Processing, None).await.unwrap();
        let shipment = Shipment {
            carrier: Some("An Post".into()),
            tracking_number: Some("CP123456789IE".into()),
        };
        let shipped = orders
            .advance(order.id, FulfilmentStep::Shipped, Some(shipment.clone()))
            .await
            .unwrap();
        assert_eq!(shipped.shipment, Some(shipment));
        assert!(shipped.shipped_at.is_some());

        let stored = orders.get(order.id).await.unwrap();
        assert_eq!(stored.status, OrderStatus::Shipped);
        assert_eq!(stored.version, 2);

        assert!(matches!(
            orders.advance(order.id, FulfilmentStep::Processing, None).await,
            Err(OrderError::InvalidTransition { .. })
        ));
    }

    #[tokio::test]
    async fn test_unknown_order() {
        let orders = OrderStore::new(Arc::new(InMemoryStore::new()));
        assert!(matches!(orders.cancel(Uuid::new_v4()).await, Err(OrderError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_cancelled_order_leaves_vendor_sales() {
        let store = InMemoryStore::new();
        let order = persisted(&store, OrderStatus::Confirmed, 5).await;
        let vendor_id = order.items[0].vendor_id;
        let orders = OrderStore::new(Arc::new(store.clone()));

        let sales = orders.vendor_sales(vendor_id).await.unwrap();
        assert_eq!(sales.orders, 1);
        assert_eq!(sales.revenue, order.subtotal);

        orders.cancel(order.id).await.unwrap();

        let sales = orders.vendor_sales(vendor_id).await.unwrap();
        assert_eq!(sales.orders, 0);
        assert_eq!(sales.revenue, Money::ZERO);

        let listed = orders.vendor_orders(vendor_id, &OrderFilter::default()).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].status, OrderStatus::Cancelled);

        let history = orders.customer_orders("user-1", &OrderFilter::default()).await.unwrap();
        assert_eq!(history.len(), 1);
        assert!(orders.customer_orders("user-2", &OrderFilter::default()).await.unwrap().is_empty());
    }
}
