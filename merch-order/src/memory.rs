use async_trait::async_trait;
use chrono::{DateTime, Utc};
use merch_catalog::{
    AccountUpdate, CatalogError, CatalogListing, CatalogRepository, InventoryError, InventoryLedger, Product,
    ShippingRate, VendorAccount,
};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

use crate::calculator::CartLine;
use crate::escalation::Escalation;
use crate::models::Order;
use crate::reports::{OrderFilter, OrderSummary, PayoutBalance, VendorOrderSummary, VendorSales};
use crate::repository::{
    EscalationRepository, OrderRepository, OrderTransaction, PayoutRepository, RepoError, RepoResult,
};
use crate::settlement::{Payout, PayoutStatus};

#[derive(Debug, Clone, Default)]
struct MemoryState {
    products: HashMap<Uuid, Product>,
    vendors: HashMap<Uuid, VendorAccount>,
    shipping_rates: Vec<ShippingRate>,
    carts: HashMap<String, Vec<CartLine>>,
    orders: HashMap<Uuid, Order>,
    checkout_keys: HashMap<String, Uuid>,
    processed_events: HashMap<String, String>,
    payouts: HashMap<Uuid, Payout>,
    escalations: Vec<Escalation>,
}

impl MemoryState {
    /// Insert, or reopen a resolved escalation with the same dedupe key
    fn upsert_escalation(&mut self, escalation: &Escalation) -> bool {
        match self
            .escalations
            .iter_mut()
            .find(|e| e.dedupe_key == escalation.dedupe_key)
        {
            Some(existing) if existing.is_open() => false,
            Some(existing) => {
                existing.kind = escalation.kind.clone();
                existing.resolved_at = None;
                existing.resolution_note = None;
                true
            }
            None => {
                self.escalations.push(escalation.clone());
                true
            }
        }
    }

    /// The payout, if `attempt` is still the live claim on it
    fn claimed_payout(
        &mut self,
        payout_id: Uuid,
        attempt: u32,
        also: Option<PayoutStatus>,
    ) -> RepoResult<Option<&mut Payout>> {
        let payout = self
            .payouts
            .get_mut(&payout_id)
            .ok_or_else(|| RepoError::NotFound(format!("payout {}", payout_id)))?;
        let live = payout.attempts == attempt
            && (payout.status == PayoutStatus::InFlight || Some(payout.status) == also);
        Ok(live.then_some(payout))
    }
}

/// Process-local store behind every repository port.
///
/// A unit of work holds the single state lock from `begin` until it ends, which
/// serializes writers the way row locks do. Do not call the non-transactional
/// methods of the same store while holding a unit open: they wait for the lock.
#[derive(Clone, Default)]
pub struct InMemoryStore {
    state: Arc<Mutex<MemoryState>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert_product(&self, product: Product) {
        self.state.lock().await.products.insert(product.id, product);
    }

    pub async fn upsert_vendor(&self, vendor: VendorAccount) {
        self.state.lock().await.vendors.insert(vendor.vendor_id, vendor);
    }

    pub async fn add_shipping_rate(&self, rate: ShippingRate) {
        self.state.lock().await.shipping_rates.push(rate);
    }

    pub async fn set_cart(&self, owner: &str, lines: Vec<CartLine>) {
        self.state.lock().await.carts.insert(owner.to_string(), lines);
    }

    pub async fn cart(&self, owner: &str) -> Vec<CartLine> {
        self.state.lock().await.carts.get(owner).cloned().unwrap_or_default()
    }

    pub async fn inventory(&self, product_id: Uuid) -> Option<i32> {
        self.state
            .lock()
            .await
            .products
            .get(&product_id)
            .map(|p| p.inventory_count)
    }
}

#[async_trait]
impl CatalogRepository for InMemoryStore {
    async fn listing(&self, product_id: Uuid) -> Result<Option<CatalogListing>, CatalogError> {
        let state = self.state.lock().await;
        Ok(state.products.get(&product_id).map(|product| CatalogListing {
            product: product.clone(),
            vendor: state.vendors.get(&product.vendor_id).cloned(),
        }))
    }

    async fn shipping_rates(&self, country: &str) -> Result<Vec<ShippingRate>, CatalogError> {
        let state = self.state.lock().await;
        Ok(state
            .shipping_rates
            .iter()
            .filter(|r| r.country.eq_ignore_ascii_case(country))
            .cloned()
            .collect())
    }

    async fn vendor_account(&self, vendor_id: Uuid) -> Result<Option<VendorAccount>, CatalogError> {
        Ok(self.state.lock().await.vendors.get(&vendor_id).cloned())
    }
}

#[async_trait]
impl OrderRepository for InMemoryStore {
    async fn begin(&self) -> RepoResult<Box<dyn OrderTransaction>> {
        let guard = self.state.clone().lock_owned().await;
        let staged = guard.clone();
        Ok(Box::new(MemoryTransaction { guard, staged }))
    }

    async fn get_order(&self, order_id: Uuid) -> RepoResult<Option<Order>> {
        Ok(self.state.lock().await.orders.get(&order_id).cloned())
    }

    async fn find_by_checkout_key(&self, checkout_key: &str) -> RepoResult<Option<Order>> {
        let state = self.state.lock().await;
        Ok(state
            .checkout_keys
            .get(checkout_key)
            .and_then(|id| state.orders.get(id))
            .cloned())
    }

    async fn attach_payment_intent(&self, order_id: Uuid, intent_id: &str, client_secret: &str) -> RepoResult<()> {
        let mut state = self.state.lock().await;
        let order = state
            .orders
            .get_mut(&order_id)
            .ok_or_else(|| RepoError::NotFound(format!("order {}", order_id)))?;
        order.payment_intent_id = Some(intent_id.to_string());
        order.client_secret = Some(client_secret.to_string());
        order.version += 1;
        order.updated_at = Utc::now();
        Ok(())
    }

    async fn customer_orders(&self, user_id: &str, filter: &OrderFilter) -> RepoResult<Vec<OrderSummary>> {
        let state = self.state.lock().await;
        let owned = state
            .orders
            .values()
            .filter(|o| o.customer.user_id.as_deref() == Some(user_id));
        Ok(filter.select(owned).into_iter().map(OrderSummary::from).collect())
    }

    async fn vendor_orders(&self, vendor_id: Uuid, filter: &OrderFilter) -> RepoResult<Vec<VendorOrderSummary>> {
        let state = self.state.lock().await;
        let selling = state
            .orders
            .values()
            .filter(|o| o.items.iter().any(|i| i.vendor_id == vendor_id));
        Ok(filter
            .select(selling)
            .into_iter()
            .filter_map(|o| VendorOrderSummary::for_vendor(o, vendor_id))
            .collect())
    }

    async fn vendor_sales(&self, vendor_id: Uuid) -> RepoResult<VendorSales> {
        let state = self.state.lock().await;
        Ok(VendorSales::from_orders(vendor_id, state.orders.values()))
    }
}

/// Writes go to a private copy that replaces the shared state on commit
pub struct MemoryTransaction {
    guard: OwnedMutexGuard<MemoryState>,
    staged: MemoryState,
}

#[async_trait]
impl InventoryLedger for MemoryTransaction {
    async fn conditional_decrement(&mut self, product_id: Uuid, quantity: u32) -> Result<bool, InventoryError> {
        let Some(product) = self.staged.products.get_mut(&product_id) else {
            return Ok(false);
        };
        if i64::from(product.inventory_count) < i64::from(quantity) {
            return Ok(false);
        }
        product.inventory_count -= quantity as i32;
        Ok(true)
    }

    async fn increment(&mut self, product_id: Uuid, quantity: u32) -> Result<(), InventoryError> {
        let product = self
            .staged
            .products
            .get_mut(&product_id)
            .ok_or(InventoryError::NotFound(product_id))?;
        product.inventory_count = product.inventory_count.saturating_add_unsigned(quantity);
        Ok(())
    }
}

#[async_trait]
impl OrderTransaction for MemoryTransaction {
    async fn insert_order(&mut self, order: &Order) -> RepoResult<()> {
        if self.staged.orders.contains_key(&order.id) {
            return Err(RepoError::Conflict(format!("order {} exists", order.id)));
        }
        if let Some(key) = &order.checkout_key {
            if self.staged.checkout_keys.contains_key(key) {
                return Err(RepoError::Conflict(format!("checkout key {} in use", key)));
            }
            self.staged.checkout_keys.insert(key.clone(), order.id);
        }
        self.staged.orders.insert(order.id, order.clone());
        Ok(())
    }

    async fn lock_order(&mut self, order_id: Uuid) -> RepoResult<Option<Order>> {
        Ok(self.staged.orders.get(&order_id).cloned())
    }

    async fn update_order(&mut self, order: &Order) -> RepoResult<()> {
        let stored = self
            .staged
            .orders
            .get_mut(&order.id)
            .ok_or_else(|| RepoError::NotFound(format!("order {}", order.id)))?;
        if stored.version != order.version {
            return Err(RepoError::Conflict(format!(
                "order {} is at version {}, not {}",
                order.id, stored.version, order.version
            )));
        }
        *stored = order.clone();
        stored.version += 1;
        Ok(())
    }

    async fn clear_cart(&mut self, owner: &str) -> RepoResult<u64> {
        Ok(self.staged.carts.remove(owner).map_or(0, |lines| lines.len() as u64))
    }

    async fn record_event(&mut self, event_id: &str, event_type: &str) -> RepoResult<bool> {
        if self.staged.processed_events.contains_key(event_id) {
            return Ok(false);
        }
        self.staged
            .processed_events
            .insert(event_id.to_string(), event_type.to_string());
        Ok(true)
    }

    async fn insert_payouts(&mut self, payouts: &[Payout]) -> RepoResult<()> {
        for payout in payouts {
            let clash = self
                .staged
                .payouts
                .values()
                .any(|p| p.order_id == payout.order_id && p.vendor_id == payout.vendor_id);
            if clash {
                return Err(RepoError::Conflict(payout.idempotency_key.clone()));
            }
            self.staged.payouts.insert(payout.id, payout.clone());
        }
        Ok(())
    }

    async fn void_pending_payouts(&mut self, order_id: Uuid, now: DateTime<Utc>) -> RepoResult<u64> {
        let mut voided = 0;
        for payout in self.staged.payouts.values_mut() {
            if payout.order_id == order_id && payout.status.is_voidable() {
                payout.status = PayoutStatus::Voided;
                payout.next_attempt_at = None;
                payout.lease_expires_at = None;
                payout.updated_at = now;
                voided += 1;
            }
        }
        Ok(voided)
    }

    async fn insert_escalation(&mut self, escalation: &Escalation) -> RepoResult<bool> {
        Ok(self.staged.upsert_escalation(escalation))
    }

    async fn apply_account_update(&mut self, update: &AccountUpdate) -> RepoResult<bool> {
        let vendor = self
            .staged
            .vendors
            .values_mut()
            .find(|v| v.external_account_id.as_deref() == Some(update.external_account_id.as_str()));
        match vendor {
            Some(vendor) => {
                vendor.apply(update);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn commit(self: Box<Self>) -> RepoResult<()> {
        let MemoryTransaction { mut guard, staged } = *self;
        *guard = staged;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> RepoResult<()> {
        Ok(())
    }
}

#[async_trait]
impl PayoutRepository for InMemoryStore {
    async fn get_payout(&self, payout_id: Uuid) -> RepoResult<Option<Payout>> {
        Ok(self.state.lock().await.payouts.get(&payout_id).cloned())
    }

    async fn payouts_for_order(&self, order_id: Uuid) -> RepoResult<Vec<Payout>> {
        let state = self.state.lock().await;
        let mut payouts: Vec<Payout> = state
            .payouts
            .values()
            .filter(|p| p.order_id == order_id)
            .cloned()
            .collect();
        payouts.sort_by_key(|p| (p.created_at, p.idempotency_key.clone()));
        Ok(payouts)
    }

    async fn vendor_payout_balance(&self, vendor_id: Uuid) -> RepoResult<PayoutBalance> {
        let state = self.state.lock().await;
        Ok(PayoutBalance::from_payouts(vendor_id, state.payouts.values()))
    }

    async fn claim_payout(
        &self,
        payout_id: Uuid,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
    ) -> RepoResult<Option<Payout>> {
        let mut state = self.state.lock().await;
        let Some(payout) = state.payouts.get_mut(&payout_id) else {
            return Ok(None);
        };
        if !payout.is_claimable(now) {
            return Ok(None);
        }
        payout.status = PayoutStatus::InFlight;
        payout.attempts += 1;
        payout.lease_expires_at = Some(lease_until);
        payout.next_attempt_at = None;
        payout.updated_at = now;
        Ok(Some(payout.clone()))
    }

    async fn mark_settled(
        &self,
        payout_id: Uuid,
        attempt: u32,
        transfer_id: &str,
        now: DateTime<Utc>,
    ) -> RepoResult<bool> {
        let mut state = self.state.lock().await;
        let Some(payout) = state.claimed_payout(payout_id, attempt, Some(PayoutStatus::Voided))? else {
            return Ok(false);
        };
        payout.status = PayoutStatus::Settled;
        payout.transfer_id = Some(transfer_id.to_string());
        payout.lease_expires_at = None;
        payout.last_error = None;
        payout.settled_at = Some(now);
        payout.updated_at = now;
        Ok(true)
    }

    async fn schedule_retry(
        &self,
        payout_id: Uuid,
        attempt: u32,
        next_attempt_at: DateTime<Utc>,
        error: &str,
        now: DateTime<Utc>,
    ) -> RepoResult<bool> {
        let mut state = self.state.lock().await;
        let Some(payout) = state.claimed_payout(payout_id, attempt, None)? else {
            return Ok(false);
        };
        payout.status = PayoutStatus::RetryScheduled;
        payout.next_attempt_at = Some(next_attempt_at);
        payout.lease_expires_at = None;
        payout.last_error = Some(error.to_string());
        payout.updated_at = now;
        Ok(true)
    }

    async fn mark_unsettled(
        &self,
        payout_id: Uuid,
        attempt: u32,
        error: &str,
        escalation: &Escalation,
        now: DateTime<Utc>,
    ) -> RepoResult<bool> {
        let mut state = self.state.lock().await;
        let Some(payout) = state.claimed_payout(payout_id, attempt, None)? else {
            return Ok(false);
        };
        payout.status = PayoutStatus::Unsettled;
        payout.lease_expires_at = None;
        payout.next_attempt_at = None;
        payout.last_error = Some(error.to_string());
        payout.updated_at = now;
        state.upsert_escalation(escalation);
        Ok(true)
    }

    async fn requeue_unsettled(&self, payout_id: Uuid, now: DateTime<Utc>) -> RepoResult<bool> {
        let mut state = self.state.lock().await;
        let Some(payout) = state.payouts.get_mut(&payout_id) else {
            return Ok(false);
        };
        if payout.status != PayoutStatus::Unsettled {
            return Ok(false);
        }
        payout.status = PayoutStatus::Pending;
        payout.attempts = 0;
        payout.updated_at = now;

        let dedupe_key = format!("payout:{}", payout_id);
        for escalation in state.escalations.iter_mut() {
            if escalation.dedupe_key == dedupe_key && escalation.is_open() {
                escalation.resolved_at = Some(now);
                escalation.resolution_note = Some("Requeued for settlement".to_string());
            }
        }
        Ok(true)
    }

    async fn due_payouts(&self, now: DateTime<Utc>, limit: i64) -> RepoResult<Vec<Uuid>> {
        let state = self.state.lock().await;
        let mut due: Vec<&Payout> = state.payouts.values().filter(|p| p.is_claimable(now)).collect();
        due.sort_by_key(|p| p.created_at);
        Ok(due
            .into_iter()
            .take(usize::try_from(limit).unwrap_or(0))
            .map(|p| p.id)
            .collect())
    }
}

#[async_trait]
impl EscalationRepository for InMemoryStore {
    async fn list_escalations(&self, include_resolved: bool) -> RepoResult<Vec<Escalation>> {
        let state = self.state.lock().await;
        let mut escalations: Vec<Escalation> = state
            .escalations
            .iter()
            .filter(|e| include_resolved || e.is_open())
            .cloned()
            .collect();
        escalations.sort_by_key(|e| e.created_at);
        Ok(escalations)
    }

    async fn resolve_escalation(&self, escalation_id: Uuid, note: &str, now: DateTime<Utc>) -> RepoResult<bool> {
        let mut state = self.state.lock().await;
        let escalation = state
            .escalations
            .iter_mut()
            .find(|e| e.id == escalation_id)
            .ok_or_else(|| RepoError::NotFound(format!("escalation {}", escalation_id)))?;
        if !escalation.is_open() {
            return Ok(false);
        }
        escalation.resolved_at = Some(now);
        escalation.resolution_note = Some(note.to_string());
        Ok(true)
    }
}
