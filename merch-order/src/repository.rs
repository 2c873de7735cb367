use async_trait::async_trait;
use chrono::{DateTime, Utc};
use merch_catalog::{AccountUpdate, InventoryLedger};
use uuid::Uuid;

use crate::escalation::Escalation;
use crate::models::Order;
use crate::reports::{OrderFilter, OrderSummary, PayoutBalance, VendorOrderSummary, VendorSales};
use crate::settlement::Payout;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RepoError {
    #[error("Record not found: {0}")]
    NotFound(String),

    /// Unique key or optimistic version clash
    #[error("Conflicting write: {0}")]
    Conflict(String),

    #[error("Storage error: {0}")]
    Storage(String),
}

pub type RepoResult<T> = Result<T, RepoError>;

#[async_trait]
pub trait OrderRepository: Send + Sync {
    /// Open a unit of work. Dropping it without `commit` rolls everything back.
    async fn begin(&self) -> RepoResult<Box<dyn OrderTransaction>>;

    async fn get_order(&self, order_id: Uuid) -> RepoResult<Option<Order>>;

    async fn find_by_checkout_key(&self, checkout_key: &str) -> RepoResult<Option<Order>>;

    async fn attach_payment_intent(&self, order_id: Uuid, intent_id: &str, client_secret: &str) -> RepoResult<()>;

    /// Orders placed by `user_id`, newest first
    async fn customer_orders(&self, user_id: &str, filter: &OrderFilter) -> RepoResult<Vec<OrderSummary>>;

    /// Orders containing at least one item from `vendor_id`, newest first
    async fn vendor_orders(&self, vendor_id: Uuid, filter: &OrderFilter) -> RepoResult<Vec<VendorOrderSummary>>;

    async fn vendor_sales(&self, vendor_id: Uuid) -> RepoResult<VendorSales>;
}

/// One atomic unit of work over orders, stock, carts and the event ledger
#[async_trait]
pub trait OrderTransaction: InventoryLedger {
    /// Insert order, items and vendor splits. A reused checkout key is a `Conflict`.
    async fn insert_order(&mut self, order: &Order) -> RepoResult<()>;

    /// Read the order and hold its row lock until the unit ends
    async fn lock_order(&mut self, order_id: Uuid) -> RepoResult<Option<Order>>;

    /// Write the mutable order fields if the stored version still equals
    /// `order.version`, bumping it by one
    async fn update_order(&mut self, order: &Order) -> RepoResult<()>;

    async fn clear_cart(&mut self, owner: &str) -> RepoResult<u64>;

    /// Insert into the processed-event ledger. `false` means it was already there.
    async fn record_event(&mut self, event_id: &str, event_type: &str) -> RepoResult<bool>;

    async fn insert_payouts(&mut self, payouts: &[Payout]) -> RepoResult<()>;

    /// Void payouts of `order_id` that have not settled, including one whose
    /// transfer is in flight. The in-flight attempt's failure is then dropped.
    async fn void_pending_payouts(&mut self, order_id: Uuid, now: DateTime<Utc>) -> RepoResult<u64>;

    /// Insert, or reopen an escalation with the same dedupe key. Returns whether
    /// anything changed.
    async fn insert_escalation(&mut self, escalation: &Escalation) -> RepoResult<bool>;

    /// Refresh the vendor projection. Returns whether an account matched.
    async fn apply_account_update(&mut self, update: &AccountUpdate) -> RepoResult<bool>;

    async fn commit(self: Box<Self>) -> RepoResult<()>;

    async fn rollback(self: Box<Self>) -> RepoResult<()>;
}

#[async_trait]
pub trait PayoutRepository: Send + Sync {
    async fn get_payout(&self, payout_id: Uuid) -> RepoResult<Option<Payout>>;

    async fn payouts_for_order(&self, order_id: Uuid) -> RepoResult<Vec<Payout>>;

    async fn vendor_payout_balance(&self, vendor_id: Uuid) -> RepoResult<PayoutBalance>;

    /// Take the payout for one attempt if it is pending, due for retry, or
    /// in flight with an expired lease. Increments `attempts` and records
    /// `in_flight` before returning it.
    async fn claim_payout(
        &self,
        payout_id: Uuid,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
    ) -> RepoResult<Option<Payout>>;

    // The result writes below apply only while the payout is still the one
    // claimed: `in_flight` with `attempts == attempt`. They return `false` when
    // a newer claim or a cancellation got there first.

    /// Record a completed transfer. A payout voided while its transfer was in
    /// flight is still marked settled, since the money moved.
    async fn mark_settled(
        &self,
        payout_id: Uuid,
        attempt: u32,
        transfer_id: &str,
        now: DateTime<Utc>,
    ) -> RepoResult<bool>;

    async fn schedule_retry(
        &self,
        payout_id: Uuid,
        attempt: u32,
        next_attempt_at: DateTime<Utc>,
        error: &str,
        now: DateTime<Utc>,
    ) -> RepoResult<bool>;

    /// Mark unsettled and record the escalation in the same write
    async fn mark_unsettled(
        &self,
        payout_id: Uuid,
        attempt: u32,
        error: &str,
        escalation: &Escalation,
        now: DateTime<Utc>,
    ) -> RepoResult<bool>;

    /// Move an unsettled payout back to pending with a fresh attempt budget
    async fn requeue_unsettled(&self, payout_id: Uuid, now: DateTime<Utc>) -> RepoResult<bool>;

    /// Ids of payouts `claim_payout` would accept at `now`, oldest first
    async fn due_payouts(&self, now: DateTime<Utc>, limit: i64) -> RepoResult<Vec<Uuid>>;
}

#[async_trait]
pub trait EscalationRepository: Send + Sync {
    async fn list_escalations(&self, include_resolved: bool) -> RepoResult<Vec<Escalation>>;

    async fn resolve_escalation(&self, escalation_id: Uuid, note: &str, now: DateTime<Utc>) -> RepoResult<bool>;
}
