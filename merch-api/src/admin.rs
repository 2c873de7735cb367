use axum::{
    extract::{Path, Query, State},
    routing::{get, post},
    Extension, Json, Router,
};
use chrono::Utc;
use merch_order::{
    Escalation, FulfilmentStep, Order, OrderFilter, Payout, PayoutBalance, PayoutOutcome, Shipment, VendorOrderSummary,
    VendorSales,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::AppError;
use crate::middleware::AdminClaims;
use crate::state::AppState;

// ============================================================================
// Request/Response Types
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct FulfilmentRequest {
    pub step: FulfilmentStep,
    pub carrier: Option<String>,
    pub tracking_number: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
pub struct EscalationQuery {
    #[serde(default)]
    pub include_resolved: bool,
}

#[derive(Debug, Deserialize)]
pub struct ResolveRequest {
    pub note: String,
}

#[derive(Debug, Serialize)]
pub struct ResolveResponse {
    pub escalation_id: Uuid,
    pub resolved: bool,
}

/// Sales next to where the vendor's money stands
#[derive(Debug, Serialize)]
pub struct VendorSummary {
    pub sales: VendorSales,
    pub payouts: PayoutBalance,
}

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/admin/orders/{id}/fulfilment", post(advance_fulfilment))
        .route("/admin/orders/{id}/payouts", get(list_order_payouts))
        .route("/admin/payouts/{id}/dispatch", post(dispatch_payout))
        .route("/admin/vendors/{id}/orders", get(list_vendor_orders))
        .route("/admin/vendors/{id}/summary", get(vendor_summary))
        .route("/admin/escalations", get(list_escalations))
        .route("/admin/escalations/{id}/resolve", post(resolve_escalation))
}

// ============================================================================
// Handlers
// ============================================================================

/// POST /admin/orders/{id}/fulfilment
pub async fn advance_fulfilment(
    State(state): State<AppState>,
    Extension(claims): Extension<AdminClaims>,
    Path(order_id): Path<Uuid>,
    Json(req): Json<FulfilmentRequest>,
) -> Result<Json<Order>, AppError> {
    let shipment = (req.carrier.is_some() || req.tracking_number.is_some()).then(|| Shipment {
        carrier: req.carrier,
        tracking_number: req.tracking_number,
    });

    let order = state.orders.advance(order_id, req.step, shipment).await?;
    tracing::info!(%order_id, admin = %claims.sub, status = %order.status, "Fulfilment advanced");
    Ok(Json(order))
}

/// GET /admin/orders/{id}/payouts
pub async fn list_order_payouts(
    State(state): State<AppState>,
    Path(order_id): Path<Uuid>,
) -> Result<Json<Vec<Payout>>, AppError> {
    // 404 rather than an empty list for an unknown order
    state.orders.get(order_id).await?;
    let payouts = state.payouts.payouts_for_order(order_id).await?;
    Ok(Json(payouts))
}

/// POST /admin/payouts/{id}/dispatch
/// Retry an unsettled payout with a fresh attempt budget
pub async fn dispatch_payout(
    State(state): State<AppState>,
    Extension(claims): Extension<AdminClaims>,
    Path(payout_id): Path<Uuid>,
) -> Result<Json<PayoutOutcome>, AppError> {
    let outcome = state.settlement.retry_unsettled(payout_id, Utc::now()).await?;
    tracing::info!(%payout_id, admin = %claims.sub, ?outcome, "Manual payout dispatch");
    Ok(Json(outcome))
}

/// GET /admin/vendors/{id}/orders
pub async fn list_vendor_orders(
    State(state): State<AppState>,
    Path(vendor_id): Path<Uuid>,
    Query(filter): Query<OrderFilter>,
) -> Result<Json<Vec<VendorOrderSummary>>, AppError> {
    let orders = state.orders.vendor_orders(vendor_id, &filter).await?;
    Ok(Json(orders))
}

/// GET /admin/vendors/{id}/summary
pub async fn vendor_summary(
    State(state): State<AppState>,
    Path(vendor_id): Path<Uuid>,
) -> Result<Json<VendorSummary>, AppError> {
    let (sales, payouts) = tokio::try_join!(
        async { state.orders.vendor_sales(vendor_id).await.map_err(AppError::from) },
        async { state.payouts.vendor_payout_balance(vendor_id).await.map_err(AppError::from) },
    )?;
    Ok(Json(VendorSummary { sales, payouts }))
}

/// GET /admin/escalations
pub async fn list_escalations(
    State(state): State<AppState>,
    Query(query): Query<EscalationQuery>,
) -> Result<Json<Vec<Escalation>>, AppError> {
    let escalations = state.escalations.list_escalations(query.include_resolved).await?;
    Ok(Json(escalations))
}

/// POST /admin/escalations/{id}/resolve
pub async fn resolve_escalation(
    State(state): State<AppState>,
    Extension(claims): Extension<AdminClaims>,
    Path(escalation_id): Path<Uuid>,
    Json(req): Json<ResolveRequest>,
) -> Result<Json<ResolveResponse>, AppError> {
    let note = req.note.trim();
    if note.is_empty() {
        return Err(AppError::BadRequest("A resolution note is required".to_string()));
    }

    let note = format!("{} (by {})", note, claims.sub);
    if !state.escalations.resolve_escalation(escalation_id, &note, Utc::now()).await? {
        return Err(AppError::Conflict(format!("Escalation {} is already resolved", escalation_id)));
    }

    tracing::info!(%escalation_id, admin = %claims.sub, "Escalation resolved");
    Ok(Json(ResolveResponse {
        escalation_id,
        resolved: true,
    }))
}
