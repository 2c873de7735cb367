use chrono::{DateTime, Duration, Utc};
use merch_core::{IsTransient, PaymentGateway, RetryPolicy, TransferRequest};
use merch_shared::Money;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::escalation::Escalation;
use crate::models::Order;
use crate::repository::{PayoutRepository, RepoError};

// ============================================================================
// Vendor Settlement
// ============================================================================
//
// One payout per vendor per confirmed order. A payout row is written in the
// same unit that confirms the order; the transfer itself happens afterwards
// and is retried from the persisted state, never from memory.
//
//   pending -> in_flight -> settled
//                        -> retry_scheduled -> in_flight ...
//                        -> unsettled (escalated)
//   pending | retry_scheduled | in_flight -> voided (order cancelled)
//
// Result writes are tied to the claim that produced them, so a late answer
// from an expired lease or a cancelled order cannot move the payout again.
//
// ============================================================================

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PayoutStatus {
    Pending,
    InFlight,
    RetryScheduled,
    Settled,
    Unsettled,
    Voided,
}

impl PayoutStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            PayoutStatus::Pending => "pending",
            PayoutStatus::InFlight => "in_flight",
            PayoutStatus::RetryScheduled => "retry_scheduled",
            PayoutStatus::Settled => "settled",
            PayoutStatus::Unsettled => "unsettled",
            PayoutStatus::Voided => "voided",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(PayoutStatus::Pending),
            "in_flight" => Some(PayoutStatus::InFlight),
            "retry_scheduled" => Some(PayoutStatus::RetryScheduled),
            "settled" => Some(PayoutStatus::Settled),
            "unsettled" => Some(PayoutStatus::Unsettled),
            "voided" => Some(PayoutStatus::Voided),
            _ => None,
        }
    }

    /// Not settled and not given up on
    pub fn is_voidable(self) -> bool {
        matches!(
            self,
            PayoutStatus::Pending | PayoutStatus::RetryScheduled | PayoutStatus::InFlight
        )
    }
}

impl fmt::Display for PayoutStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A planned transfer of one vendor's share of an order
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Payout {
    pub id: Uuid,
    pub order_id: Uuid,
    pub vendor_id: Uuid,
    pub destination_account: String,
    pub amount: Money,
    pub currency: String,
    /// `payout:{order_id}:{vendor_id}`, sent with every transfer attempt
    pub idempotency_key: String,
    pub status: PayoutStatus,
    pub attempts: u32,
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub transfer_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub settled_at: Option<DateTime<Utc>>,
}

impl Payout {
    /// Whether `claim_payout` may take this payout at `now`
    pub fn is_claimable(&self, now: DateTime<Utc>) -> bool {
        match self.status {
            PayoutStatus::Pending => true,
            PayoutStatus::RetryScheduled => self.next_attempt_at.map_or(true, |at| at <= now),
            PayoutStatus::InFlight => self.lease_expires_at.map_or(true, |at| at <= now),
            _ => false,
        }
    }
}

pub fn payout_idempotency_key(order_id: Uuid, vendor_id: Uuid) -> String {
    format!("payout:{}:{}", order_id, vendor_id)
}

/// Payouts for a freshly confirmed order, one per vendor split with something to pay
pub fn plan(order: &Order, now: DateTime<Utc>) -> Vec<Payout> {
    order
        .vendor_splits
        .iter()
        .filter(|split| split.vendor_payout.is_positive())
        .map(|split| Payout {
            id: Uuid::new_v4(),
            order_id: order.id,
            vendor_id: split.vendor_id,
            destination_account: split.destination_account.clone(),
            amount: split.vendor_payout,
            currency: order.currency.clone(),
            idempotency_key: payout_idempotency_key(order.id, split.vendor_id),
            status: PayoutStatus::Pending,
            attempts: 0,
            next_attempt_at: None,
            lease_expires_at: None,
            last_error: None,
            transfer_id: None,
            created_at: now,
            updated_at: now,
            settled_at: None,
        })
        .collect()
}

#[derive(Debug, thiserror::Error)]
pub enum SettlementError {
    #[error("Payout not found: {0}")]
    NotFound(Uuid),

    #[error("Payout {payout_id} is {status}, only unsettled payouts can be retried")]
    NotRetryable { payout_id: Uuid, status: PayoutStatus },

    #[error(transparent)]
    Repository(#[from] RepoError),
}

/// Result of one dispatch attempt
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum PayoutOutcome {
    Settled { transfer_id: String },
    RetryScheduled { attempts: u32, next_attempt_at: DateTime<Utc> },
    Unsettled { attempts: u32, error: String },
    /// Another worker holds it, or it is no longer due
    Skipped { status: PayoutStatus },
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SettlementReport {
    pub settled: usize,
    pub retry_scheduled: usize,
    pub unsettled: usize,
    pub skipped: usize,
    pub failed: usize,
}

impl SettlementReport {
    fn record(&mut self, outcome: &Result<PayoutOutcome, SettlementError>) {
        match outcome {
            Ok(PayoutOutcome::Settled { .. }) => self.settled += 1,
            Ok(PayoutOutcome::RetryScheduled { .. }) => self.retry_scheduled += 1,
            Ok(PayoutOutcome::Unsettled { .. }) => self.unsettled += 1,
            Ok(PayoutOutcome::Skipped { .. }) => self.skipped += 1,
            Err(_) => self.failed += 1,
        }
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

pub const DEFAULT_LEASE_SECONDS: i64 = 300;

pub struct SettlementEngine {
    payouts: Arc<dyn PayoutRepository>,
    gateway: Arc<dyn PaymentGateway>,
    policy: RetryPolicy,
    lease: Duration,
}

impl SettlementEngine {
    pub fn new(payouts: Arc<dyn PayoutRepository>, gateway: Arc<dyn PaymentGateway>, policy: RetryPolicy) -> Self {
        Self {
            payouts,
            gateway,
            policy,
            lease: Duration::seconds(DEFAULT_LEASE_SECONDS),
        }
    }

    /// How long a claimed payout stays reserved for the claiming worker
    pub fn with_lease(mut self, lease: Duration) -> Self {
        self.lease = lease;
        self
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Make one transfer attempt for `payout_id`
    pub async fn dispatch(&self, payout_id: Uuid, now: DateTime<Utc>) -> Result<PayoutOutcome, SettlementError> {
        // 1. Claim. The attempt is counted before any money moves.
        let Some(payout) = self.payouts.claim_payout(payout_id, now, now + self.lease).await? else {
            return self.skipped(payout_id).await;
        };

        // 2. Transfer under the stable key so a crash between here and step 3
        //    cannot pay twice
        let request = TransferRequest {
            amount: payout.amount,
            currency: payout.currency.clone(),
            destination: payout.destination_account.clone(),
            idempotency_key: payout.idempotency_key.clone(),
            order_id: payout.order_id,
            vendor_id: payout.vendor_id,
        };

        // 3. Record the outcome
        match self.gateway.create_transfer(&request).await {
            Ok(receipt) => {
                let recorded = self
                    .payouts
                    .mark_settled(payout.id, payout.attempts, &receipt.transfer_id, now)
                    .await?;
                if !recorded {
                    return self.superseded(&payout, "settled").await;
                }
                info!(
                    payout_id = %payout.id,
                    order_id = %payout.order_id,
                    vendor_id = %payout.vendor_id,
                    amount = %payout.amount,
                    transfer_id = %receipt.transfer_id,
                    "Payout settled"
                );
                Ok(PayoutOutcome::Settled {
                    transfer_id: receipt.transfer_id,
                })
            }
            Err(err) if err.is_transient() && !self.policy.is_exhausted(payout.attempts) => {
                let delay = self.policy.delay_for(payout.attempts);
                let next_attempt_at = now + Duration::milliseconds(delay.as_millis() as i64);
                let message = err.to_string();
                let recorded = self
                    .payouts
                    .schedule_retry(payout.id, payout.attempts, next_attempt_at, &message, now)
                    .await?;
                if !recorded {
                    return self.superseded(&payout, "retry").await;
                }
                warn!(
                    payout_id = %payout.id,
                    attempts = payout.attempts,
                    next_attempt_at = %next_attempt_at,
                    error = %message,
                    "Payout transfer failed, retry scheduled"
                );
                Ok(PayoutOutcome::RetryScheduled {
                    attempts: payout.attempts,
                    next_attempt_at,
                })
            }
            Err(err) => {
                let message = err.to_string();
                let escalation = Escalation::unsettled_payout(&payout, &message, now);
                let recorded = self
                    .payouts
                    .mark_unsettled(payout.id, payout.attempts, &message, &escalation, now)
                    .await?;
                if !recorded {
                    return self.superseded(&payout, "unsettled").await;
                }
                error!(
                    payout_id = %payout.id,
                    order_id = %payout.order_id,
                    vendor_id = %payout.vendor_id,
                    attempts = payout.attempts,
                    error = %message,
                    "Payout unsettled, escalated"
                );
                Ok(PayoutOutcome::Unsettled {
                    attempts: payout.attempts,
                    error: message,
                })
            }
        }
    }

    async fn skipped(&self, payout_id: Uuid) -> Result<PayoutOutcome, SettlementError> {
        let current = self
            .payouts
            .get_payout(payout_id)
            .await?
            .ok_or(SettlementError::NotFound(payout_id))?;
        Ok(PayoutOutcome::Skipped { status: current.status })
    }

    /// The claim was overtaken while the transfer call ran
    async fn superseded(&self, claimed: &Payout, result: &str) -> Result<PayoutOutcome, SettlementError> {
        let outcome = self.skipped(claimed.id).await?;
        warn!(
            payout_id = %claimed.id,
            order_id = %claimed.order_id,
            attempts = claimed.attempts,
            result,
            current = ?outcome,
            "Payout changed during transfer, attempt result dropped"
        );
        Ok(outcome)
    }

    /// Dispatch every payout of a just-confirmed order. Vendors are independent:
    /// one failing never holds back another.
    pub async fn dispatch_order(&self, order_id: Uuid, now: DateTime<Utc>) -> Result<SettlementReport, SettlementError> {
        let payouts = self.payouts.payouts_for_order(order_id).await?;
        let mut report = SettlementReport::default();
        for payout in payouts.iter().filter(|p| p.is_claimable(now)) {
            let outcome = self.dispatch(payout.id, now).await;
            if let Err(e) = &outcome {
                error!(payout_id = %payout.id, error = %e, "Payout dispatch failed");
            }
            report.record(&outcome);
        }
        Ok(report)
    }

    /// Dispatch up to `limit` payouts that are due at `now`
    pub async fn run_due(&self, now: DateTime<Utc>, limit: i64) -> Result<SettlementReport, SettlementError> {
        let due = self.payouts.due_payouts(now, limit).await?;
        let mut report = SettlementReport::default();
        for payout_id in due {
            let outcome = self.dispatch(payout_id, now).await;
            if let Err(e) = &outcome {
                error!(payout_id = %payout_id, error = %e, "Payout dispatch failed");
            }
            report.record(&outcome);
        }
        if !report.is_empty() {
            info!(?report, "Settlement pass finished");
        }
        Ok(report)
    }

    /// Operator action: give an unsettled payout a fresh budget and try again now
    pub async fn retry_unsettled(&self, payout_id: Uuid, now: DateTime<Utc>) -> Result<PayoutOutcome, SettlementError> {
        if !self.payouts.requeue_unsettled(payout_id, now).await? {
            let current = self
                .payouts
                .get_payout(payout_id)
                .await?
                .ok_or(SettlementError::NotFound(payout_id))?;
            return Err(SettlementError::NotRetryable {
                payout_id,
                status: current.status,
            });
        }
        info!(payout_id = %payout_id, "Unsettled payout requeued");
        self.dispatch(payout_id, now).await
    }
}
