use async_trait::async_trait;
use chrono::{DateTime, Utc};
use merch_order::{
    Escalation, EscalationKind, EscalationRepository, Payout, PayoutBalance, PayoutRepository, PayoutStatus,
    RepoError, RepoResult,
};
use merch_shared::Money;
use sqlx::types::Json;
use sqlx::{PgConnection, PgPool};
use uuid::Uuid;

use crate::database::storage_error;

/// Payout ledger and escalation queue
pub struct PgSettlementRepository {
    pool: PgPool,
}

impl PgSettlementRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

const PAYOUT_COLUMNS: &str = r#"
    id, order_id, vendor_id, destination_account, amount, currency, idempotency_key,
    status, attempts, next_attempt_at, lease_expires_at, last_error, transfer_id,
    created_at, updated_at, settled_at
"#;

/// Mirrors `Payout::is_claimable`, with `now` bound at `now_param`
fn claimable(now_param: &str) -> String {
    format!(
        r#"(status = 'pending'
            OR (status = 'retry_scheduled' AND (next_attempt_at IS NULL OR next_attempt_at <= {now}))
            OR (status = 'in_flight' AND (lease_expires_at IS NULL OR lease_expires_at <= {now})))"#,
        now = now_param
    )
}

#[derive(sqlx::FromRow)]
struct PayoutRow {
    id: Uuid,
    order_id: Uuid,
    vendor_id: Uuid,
    destination_account: String,
    amount: i64,
    currency: String,
    idempotency_key: String,
    status: String,
    attempts: i32,
    next_attempt_at: Option<DateTime<Utc>>,
    lease_expires_at: Option<DateTime<Utc>>,
    last_error: Option<String>,
    transfer_id: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    settled_at: Option<DateTime<Utc>>,
}

impl TryFrom<PayoutRow> for Payout {
    type Error = RepoError;

    fn try_from(row: PayoutRow) -> Result<Self, Self::Error> {
        let status = PayoutStatus::parse(&row.status)
            .ok_or_else(|| RepoError::Storage(format!("unreadable payout status '{}'", row.status)))?;
        Ok(Payout {
            id: row.id,
            order_id: row.order_id,
            vendor_id: row.vendor_id,
            destination_account: row.destination_account,
            amount: Money::from_minor(row.amount),
            currency: row.currency,
            idempotency_key: row.idempotency_key,
            status,
            attempts: row.attempts.max(0) as u32,
            next_attempt_at: row.next_attempt_at,
            lease_expires_at: row.lease_expires_at,
            last_error: row.last_error,
            transfer_id: row.transfer_id,
            created_at: row.created_at,
            updated_at: row.updated_at,
            settled_at: row.settled_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct EscalationRow {
    id: Uuid,
    dedupe_key: String,
    kind: Json<EscalationKind>,
    created_at: DateTime<Utc>,
    resolved_at: Option<DateTime<Utc>>,
    resolution_note: Option<String>,
}

impl From<EscalationRow> for Escalation {
    fn from(row: EscalationRow) -> Self {
        Escalation {
            id: row.id,
            dedupe_key: row.dedupe_key,
            kind: row.kind.0,
            created_at: row.created_at,
            resolved_at: row.resolved_at,
            resolution_note: row.resolution_note,
        }
    }
}

pub(crate) async fn insert_payout(conn: &mut PgConnection, payout: &Payout) -> RepoResult<()> {
    sqlx::query(
        r#"
        INSERT INTO payouts (
            id, order_id, vendor_id, destination_account, amount, currency, idempotency_key,
            status, attempts, next_attempt_at, created_at, updated_at
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
        "#,
    )
    .bind(payout.id)
    .bind(payout.order_id)
    .bind(payout.vendor_id)
    .bind(&payout.destination_account)
    .bind(payout.amount.minor_units())
    .bind(&payout.currency)
    .bind(&payout.idempotency_key)
    .bind(payout.status.as_str())
    .bind(payout.attempts as i32)
    .bind(payout.next_attempt_at)
    .bind(payout.created_at)
    .bind(payout.updated_at)
    .execute(&mut *conn)
    .await
    .map_err(storage_error)?;
    Ok(())
}

/// Open an escalation, or reopen a resolved one with the same dedupe key.
/// Returns false when an open escalation already covers it.
pub(crate) async fn upsert_escalation(conn: &mut PgConnection, escalation: &Escalation) -> RepoResult<bool> {
    let result = sqlx::query(
        r#"
        INSERT INTO escalations (id, dedupe_key, kind, created_at)
        VALUES ($1, $2, $3, $4)
        ON CONFLICT (dedupe_key) DO UPDATE
        SET kind = EXCLUDED.kind, resolved_at = NULL, resolution_note = NULL
        WHERE escalations.resolved_at IS NOT NULL
        "#,
    )
    .bind(escalation.id)
    .bind(&escalation.dedupe_key)
    .bind(Json(&escalation.kind))
    .bind(escalation.created_at)
    .execute(&mut *conn)
    .await
    .map_err(storage_error)?;
    Ok(result.rows_affected() == 1)
}

/// Zero rows from a guarded result write: either the payout is gone or the
/// claim was overtaken
async fn overtaken(conn: &mut PgConnection, payout_id: Uuid) -> RepoResult<bool> {
    let exists: Option<Uuid> = sqlx::query_scalar("SELECT id FROM payouts WHERE id = $1")
        .bind(payout_id)
        .fetch_optional(&mut *conn)
        .await
        .map_err(storage_error)?;
    match exists {
        Some(_) => Ok(false),
        None => Err(RepoError::NotFound(format!("payout {}", payout_id))),
    }
}

#[async_trait]
impl PayoutRepository for PgSettlementRepository {
    async fn get_payout(&self, payout_id: Uuid) -> RepoResult<Option<Payout>> {
        let sql = format!("SELECT {} FROM payouts WHERE id = $1", PAYOUT_COLUMNS);
        let row = sqlx::query_as::<_, PayoutRow>(&sql)
            .bind(payout_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(storage_error)?;
        row.map(Payout::try_from).transpose()
    }

    async fn payouts_for_order(&self, order_id: Uuid) -> RepoResult<Vec<Payout>> {
        let sql = format!(
            "SELECT {} FROM payouts WHERE order_id = $1 ORDER BY created_at, vendor_id",
            PAYOUT_COLUMNS
        );
        let rows = sqlx::query_as::<_, PayoutRow>(&sql)
            .bind(order_id)
            .fetch_all(&self.pool)
            .await
            .map_err(storage_error)?;
        rows.into_iter().map(Payout::try_from).collect()
    }

    async fn vendor_payout_balance(&self, vendor_id: Uuid) -> RepoResult<PayoutBalance> {
        let rows: Vec<(String, i64, i64)> = sqlx::query_as(
            r#"
            SELECT status, COUNT(*), COALESCE(SUM(amount), 0)::BIGINT
            FROM payouts
            WHERE vendor_id = $1
            GROUP BY status
            "#,
        )
        .bind(vendor_id)
        .fetch_all(&self.pool)
        .await
        .map_err(storage_error)?;

        let mut balance = PayoutBalance::empty(vendor_id);
        for (status, count, amount) in rows {
            let status = PayoutStatus::parse(&status)
                .ok_or_else(|| RepoError::Storage(format!("unreadable payout status '{}'", status)))?;
            balance.add(status, count.max(0) as u64, Money::from_minor(amount));
        }
        Ok(balance)
    }

    async fn claim_payout(
        &self,
        payout_id: Uuid,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
    ) -> RepoResult<Option<Payout>> {
        // The conditional update is the claim; a concurrent worker matches zero rows.
        let sql = format!(
            r#"
            UPDATE payouts
            SET status = 'in_flight', attempts = attempts + 1, lease_expires_at = $3,
                next_attempt_at = NULL, updated_at = $2
            WHERE id = $1 AND {}
            RETURNING {}
            "#,
            claimable("$2"),
            PAYOUT_COLUMNS
        );
        let row = sqlx::query_as::<_, PayoutRow>(&sql)
            .bind(payout_id)
            .bind(now)
            .bind(lease_until)
            .fetch_optional(&self.pool)
            .await
            .map_err(storage_error)?;
        row.map(Payout::try_from).transpose()
    }

    async fn mark_settled(
        &self,
        payout_id: Uuid,
        attempt: u32,
        transfer_id: &str,
        now: DateTime<Utc>,
    ) -> RepoResult<bool> {
        let mut conn = self.pool.acquire().await.map_err(storage_error)?;
        let result = sqlx::query(
            r#"
            UPDATE payouts
            SET status = 'settled', transfer_id = $3, lease_expires_at = NULL, last_error = NULL,
                settled_at = $4, updated_at = $4
            WHERE id = $1 AND attempts = $2 AND status IN ('in_flight', 'voided')
            "#,
        )
        .bind(payout_id)
        .bind(attempt as i32)
        .bind(transfer_id)
        .bind(now)
        .execute(&mut *conn)
        .await
        .map_err(storage_error)?;

        if result.rows_affected() == 0 {
            return overtaken(&mut conn, payout_id).await;
        }
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
        let mut conn = self.pool.acquire().await.map_err(storage_error)?;
        let result = sqlx::query(
            r#"
            UPDATE payouts
            SET status = 'retry_scheduled', next_attempt_at = $3, lease_expires_at = NULL,
                last_error = $4, updated_at = $5
            WHERE id = $1 AND attempts = $2 AND status = 'in_flight'
            "#,
        )
        .bind(payout_id)
        .bind(attempt as i32)
        .bind(next_attempt_at)
        .bind(error)
        .bind(now)
        .execute(&mut *conn)
        .await
        .map_err(storage_error)?;

        if result.rows_affected() == 0 {
            return overtaken(&mut conn, payout_id).await;
        }
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
        let mut tx = self.pool.begin().await.map_err(storage_error)?;

        let result = sqlx::query(
            r#"
            UPDATE payouts
            SET status = 'unsettled', next_attempt_at = NULL, lease_expires_at = NULL,
                last_error = $3, updated_at = $4
            WHERE id = $1 AND attempts = $2 AND status = 'in_flight'
            "#,
        )
        .bind(payout_id)
        .bind(attempt as i32)
        .bind(error)
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(storage_error)?;

        if result.rows_affected() == 0 {
            return overtaken(&mut tx, payout_id).await;
        }

        upsert_escalation(&mut tx, escalation).await?;
        tx.commit().await.map_err(storage_error)?;
        Ok(true)
    }

    async fn requeue_unsettled(&self, payout_id: Uuid, now: DateTime<Utc>) -> RepoResult<bool> {
        let mut tx = self.pool.begin().await.map_err(storage_error)?;

        let result = sqlx::query(
            r#"
            UPDATE payouts
            SET status = 'pending', attempts = 0, updated_at = $2
            WHERE id = $1 AND status = 'unsettled'
            "#,
        )
        .bind(payout_id)
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(storage_error)?;

        if result.rows_affected() == 0 {
            return Ok(false);
        }

        sqlx::query(
            r#"
            UPDATE escalations
            SET resolved_at = $2, resolution_note = 'Requeued for settlement'
            WHERE dedupe_key = $1 AND resolved_at IS NULL
            "#,
        )
        .bind(format!("payout:{}", payout_id))
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(storage_error)?;

        tx.commit().await.map_err(storage_error)?;
        Ok(true)
    }

    async fn due_payouts(&self, now: DateTime<Utc>, limit: i64) -> RepoResult<Vec<Uuid>> {
        let sql = format!(
            "SELECT id FROM payouts WHERE {} ORDER BY created_at LIMIT $2",
            claimable("$1")
        );
        sqlx::query_scalar::<_, Uuid>(&sql)
            .bind(now)
            .bind(limit)
            .fetch_all(&self.pool)
            .await
            .map_err(storage_error)
    }
}

#[async_trait]
impl EscalationRepository for PgSettlementRepository {
    async fn list_escalations(&self, include_resolved: bool) -> RepoResult<Vec<Escalation>> {
        let rows = sqlx::query_as::<_, EscalationRow>(
            r#"
            SELECT id, dedupe_key, kind, created_at, resolved_at, resolution_note
            FROM escalations
            WHERE $1 OR resolved_at IS NULL
            ORDER BY created_at
            "#,
        )
        .bind(include_resolved)
        .fetch_all(&self.pool)
        .await
        .map_err(storage_error)?;
        Ok(rows.into_iter().map(Escalation::from).collect())
    }

    async fn resolve_escalation(&self, escalation_id: Uuid, note: &str, now: DateTime<Utc>) -> RepoResult<bool> {
        let resolved_at: Option<Option<DateTime<Utc>>> =
            sqlx::query_scalar("SELECT resolved_at FROM escalations WHERE id = $1")
                .bind(escalation_id)
                .fetch_optional(&self.pool)
                .await
                .map_err(storage_error)?;

        match resolved_at {
            None => Err(RepoError::NotFound(format!("escalation {}", escalation_id))),
            Some(Some(_)) => Ok(false),
            Some(None) => {
                let result = sqlx::query(
                    r#"
                    UPDATE escalations
                    SET resolved_at = $2, resolution_note = $3
                    WHERE id = $1 AND resolved_at IS NULL
                    "#,
                )
                .bind(escalation_id)
                .bind(now)
                .bind(note)
                .execute(&self.pool)
                .await
                .map_err(storage_error)?;
                Ok(result.rows_affected() == 1)
            }
        }
    }
}
