use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    routing::{get, post},
    Extension, Json, Router,
};
use merch_order::{CheckoutReceipt, CheckoutRequest, Order, OrderFilter, OrderSummary};
use uuid::Uuid;

use crate::error::AppError;
use crate::middleware::Caller;
use crate::state::AppState;

pub const IDEMPOTENCY_HEADER: &str = "idempotency-key";

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/orders", post(create_order).get(list_my_orders))
        .route("/orders/{id}", get(get_order))
        .route("/orders/{id}/cancel", post(cancel_order))
}

/// POST /orders
/// Price the cart, persist a pending order and open a payment intent
pub async fn create_order(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    headers: HeaderMap,
    Json(mut request): Json<CheckoutRequest>,
) -> Result<(StatusCode, Json<CheckoutReceipt>), AppError> {
    // A signed-in customer always owns what they buy
    if let Caller::Customer(sub) = &caller {
        request.customer.user_id = Some(sub.clone());
    }

    if let Some(value) = headers.get(IDEMPOTENCY_HEADER) {
        let key = value
            .to_str()
            .map_err(|_| AppError::BadRequest("Idempotency-Key must be visible ASCII".to_string()))?
            .trim();
        if key.is_empty() || key.len() > 255 {
            return Err(AppError::BadRequest("Idempotency-Key must be 1 to 255 characters".to_string()));
        }
        request.checkout_key = Some(key.to_string());
    }

    let receipt = state.checkout.checkout(request).await?;
    let status = if receipt.replayed { StatusCode::OK } else { StatusCode::CREATED };

    tracing::info!(order_id = %receipt.order_id, replayed = receipt.replayed, "Checkout accepted");
    Ok((status, Json(receipt)))
}

/// GET /orders
/// Order history of the signed-in customer
pub async fn list_my_orders(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    Query(filter): Query<OrderFilter>,
) -> Result<Json<Vec<OrderSummary>>, AppError> {
    let Caller::Customer(user_id) = caller else {
        return Err(AppError::Authentication("Sign in as a customer to list orders".to_string()));
    };
    let orders = state.orders.customer_orders(&user_id, &filter).await?;
    Ok(Json(orders))
}

/// GET /orders/{id}
pub async fn get_order(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    Path(order_id): Path<Uuid>,
) -> Result<Json<Order>, AppError> {
    let order = state.orders.get(order_id).await?;
    caller.may_access(order.customer.user_id.as_deref())?;
    Ok(Json(order))
}

/// POST /orders/{id}/cancel
pub async fn cancel_order(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    Path(order_id): Path<Uuid>,
) -> Result<Json<Order>, AppError> {
    // The owner never changes, so checking before the locked cancel is enough
    let owner = state.orders.get(order_id).await?.customer.user_id;
    if let Err(e) = caller.may_access(owner.as_deref()) {
        tracing::warn!(target: "security", %order_id, caller = ?caller, "Cancel refused");
        return Err(e);
    }

    let order = state.orders.cancel(order_id).await?;
    Ok(Json(order))
}
