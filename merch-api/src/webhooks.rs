use axum::{
    body::Bytes,
    extract::State,
    http::HeaderMap,
    routing::post,
    Json, Router,
};
use chrono::Utc;
use merch_core::SIGNATURE_HEADER;
use merch_order::{WebhookAck, WebhookError};
use serde::Serialize;

use crate::error::AppError;
use crate::state::AppState;

#[derive(Debug, Serialize)]
pub struct WebhookResponse {
    pub received: bool,
    pub outcome: WebhookAck,
}

pub fn routes() -> Router<AppState> {
    Router::new().route("/webhooks/payments", post(handle_payment_webhook))
}

/// POST /webhooks/payments
/// Every verified delivery is acknowledged, including replays and ignored events.
pub async fn handle_payment_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<WebhookResponse>, AppError> {
    let signature = headers.get(SIGNATURE_HEADER).and_then(|h| h.to_str().ok());

    let outcome = match state.webhooks.handle(&body, signature, Utc::now()).await {
        Ok(outcome) => outcome,
        Err(WebhookError::Signature(e)) => {
            tracing::warn!(target: "security", "Webhook signature rejected: {}", e);
            return Err(WebhookError::Signature(e).into());
        }
        Err(e) => return Err(e.into()),
    };

    if let WebhookAck::Applied { order_id, payouts, .. } = &outcome {
        if !payouts.is_empty() {
            let settlement = state.settlement.clone();
            let order_id = *order_id;
            tokio::spawn(async move {
                match settlement.dispatch_order(order_id, Utc::now()).await {
                    Ok(report) => tracing::info!(%order_id, ?report, "Payouts dispatched"),
                    // The worker picks up whatever is still due
                    Err(e) => tracing::error!(%order_id, "Payout dispatch failed: {}", e),
                }
            });
        }
    }

    Ok(Json(WebhookResponse { received: true, outcome }))
}
