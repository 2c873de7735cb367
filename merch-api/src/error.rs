use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use merch_order::{
    CalculationError, CheckoutError, OrderError, RepoError, SettlementError, WebhookError,
};
use serde_json::{json, Value};

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    Authentication(String),
    #[error("{0}")]
    Authorization(String),
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Conflict(String),
    #[error("{message}")]
    Unprocessable { message: String, details: Option<Value> },
    #[error("{0}")]
    BadGateway(String),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_message, details) = match self {
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg, None),
            AppError::Authentication(msg) => (StatusCode::UNAUTHORIZED, msg, None),
            AppError::Authorization(msg) => (StatusCode::FORBIDDEN, msg, None),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg, None),
            AppError::Conflict(msg) => (StatusCode::CONFLICT, msg, None),
            AppError::Unprocessable { message, details } => (StatusCode::UNPROCESSABLE_ENTITY, message, details),
            AppError::BadGateway(msg) => {
                tracing::warn!("Payment provider failure: {}", msg);
                (StatusCode::BAD_GATEWAY, "Payment provider unavailable".to_string(), None)
            }
            AppError::Internal(err) => {
                tracing::error!("Internal Server Error: {:#}", err);
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error".to_string(), None)
            }
        };

        let body = match details {
            Some(details) => json!({ "error": error_message, "details": details }),
            None => json!({ "error": error_message }),
        };

        (status, Json(body)).into_response()
    }
}

impl From<RepoError> for AppError {
    fn from(err: RepoError) -> Self {
        match err {
            RepoError::NotFound(what) => AppError::NotFound(format!("{} not found", what)),
            RepoError::Conflict(msg) => AppError::Conflict(msg),
            RepoError::Storage(_) => AppError::Internal(err.into()),
        }
    }
}

impl From<OrderError> for AppError {
    fn from(err: OrderError) -> Self {
        match err {
            OrderError::NotFound(_) => AppError::NotFound(err.to_string()),
            OrderError::InvalidTransition { .. } => AppError::Conflict(err.to_string()),
            OrderError::Repository(repo) => repo.into(),
            OrderError::InvariantViolation(_) | OrderError::Inventory(_) => AppError::Internal(err.into()),
        }
    }
}

impl From<CalculationError> for AppError {
    fn from(err: CalculationError) -> Self {
        match err {
            CalculationError::EmptyCart | CalculationError::InvalidAddress(_) => AppError::Unprocessable {
                message: err.to_string(),
                details: None,
            },
            CalculationError::Rejected(ref lines) => AppError::Unprocessable {
                message: err.to_string(),
                details: serde_json::to_value(lines).ok(),
            },
            CalculationError::Catalog(_) => AppError::Internal(err.into()),
        }
    }
}

impl From<CheckoutError> for AppError {
    fn from(err: CheckoutError) -> Self {
        match err {
            CheckoutError::Calculation(e) => e.into(),
            CheckoutError::InProgress(_) => AppError::Conflict(err.to_string()),
            CheckoutError::Gateway(e) => AppError::BadGateway(e.to_string()),
            CheckoutError::Order(e) => e.into(),
        }
    }
}

impl From<WebhookError> for AppError {
    fn from(err: WebhookError) -> Self {
        match err {
            WebhookError::Signature(_) => AppError::BadRequest("Invalid webhook signature".to_string()),
            WebhookError::Payload(e) => AppError::BadRequest(e.to_string()),
            WebhookError::Order(e) => e.into(),
            WebhookError::Repository(e) => e.into(),
            WebhookError::Inventory(_) => AppError::Internal(err.into()),
        }
    }
}

impl From<SettlementError> for AppError {
    fn from(err: SettlementError) -> Self {
        match err {
            SettlementError::NotFound(_) => AppError::NotFound(err.to_string()),
            SettlementError::NotRetryable { .. } => AppError::Conflict(err.to_string()),
            SettlementError::Repository(e) => e.into(),
        }
    }
}
