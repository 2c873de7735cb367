use async_trait::async_trait;
use merch_core::{GatewayError, IntentRequest, PaymentGateway, PaymentIntent, TransferReceipt, TransferRequest};
use merch_shared::Money;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, warn};

const IDEMPOTENCY_HEADER: &str = "Idempotency-Key";

/// Payment provider client speaking the Stripe REST API with form-encoded bodies.
pub struct StripeGateway {
    client: reqwest::Client,
    api_base: String,
    secret_key: String,
}

#[derive(Deserialize)]
struct IntentBody {
    id: String,
    client_secret: String,
    amount: i64,
    currency: String,
}

#[derive(Deserialize)]
struct TransferBody {
    id: String,
}

#[derive(Deserialize)]
struct ErrorEnvelope {
    error: ErrorDetail,
}

#[derive(Deserialize)]
struct ErrorDetail {
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    code: Option<String>,
}

impl StripeGateway {
    pub fn new(api_base: &str, secret_key: &str, timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            api_base: api_base.trim_end_matches('/').to_string(),
            secret_key: secret_key.to_string(),
        })
    }

    async fn post_form<T: DeserializeOwned>(
        &self,
        path: &str,
        idempotency_key: &str,
        form: &[(&str, String)],
    ) -> Result<T, GatewayError> {
        let url = format!("{}{}", self.api_base, path);
        debug!("POST {} (idempotency key {})", url, idempotency_key);

        let resp = self
            .client
            .post(&url)
            .bearer_auth(&self.secret_key)
            .header(IDEMPOTENCY_HEADER, idempotency_key)
            .form(form)
            .send()
            .await
            .map_err(|e| GatewayError::Transient(format!("request to {} failed: {}", path, e)))?;

        let status = resp.status();
        let body = resp
            .text()
            .await
            .map_err(|e| GatewayError::Transient(format!("reading response from {} failed: {}", path, e)))?;

        if !status.is_success() {
            let error = classify(status, &body);
            warn!("Payment provider {} returned {}: {}", path, status, error);
            return Err(error);
        }

        read_success(path, &body)
    }
}

/// A 2xx the client cannot read may still have moved money. Report it as
/// transient so the retry replays the same idempotency key.
pub fn read_success<T: DeserializeOwned>(path: &str, body: &str) -> Result<T, GatewayError> {
    serde_json::from_str(body).map_err(|e| {
        warn!("Unreadable success response from {}: {}", path, e);
        GatewayError::Transient(format!("unreadable response from {}: {}", path, e))
    })
}

/// 429 and 5xx are worth retrying; any other failure will fail again.
pub fn classify(status: StatusCode, body: &str) -> GatewayError {
    let detail = serde_json::from_str::<ErrorEnvelope>(body)
        .ok()
        .and_then(|env| match (env.error.message, env.error.code) {
            (Some(message), Some(code)) => Some(format!("{} ({})", message, code)),
            (Some(message), None) => Some(message),
            (None, code) => code,
        })
        .unwrap_or_else(|| format!("HTTP {}", status.as_u16()));

    if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        GatewayError::Transient(detail)
    } else {
        GatewayError::Rejected(detail)
    }
}

#[async_trait]
impl PaymentGateway for StripeGateway {
    async fn create_payment_intent(&self, request: &IntentRequest) -> Result<PaymentIntent, GatewayError> {
        let form = [
            ("amount", request.amount.minor_units().to_string()),
            ("currency", request.currency.clone()),
            ("automatic_payment_methods[enabled]", "true".to_string()),
            ("metadata[order_id]", request.metadata.order_id.to_string()),
            ("metadata[order_number]", request.metadata.order_number.clone()),
            ("metadata[customer_email]", request.metadata.customer_email.clone()),
            ("receipt_email", request.metadata.customer_email.clone()),
        ];

        let body: IntentBody = self
            .post_form("/v1/payment_intents", &request.idempotency_key, &form)
            .await?;

        Ok(PaymentIntent {
            intent_id: body.id,
            client_secret: body.client_secret,
            amount: Money::from_minor(body.amount),
            currency: body.currency,
        })
    }

    async fn create_transfer(&self, request: &TransferRequest) -> Result<TransferReceipt, GatewayError> {
        let form = [
            ("amount", request.amount.minor_units().to_string()),
            ("currency", request.currency.clone()),
            ("destination", request.destination.clone()),
            ("transfer_group", request.order_id.to_string()),
            ("metadata[order_id]", request.order_id.to_string()),
            ("metadata[vendor_id]", request.vendor_id.to_string()),
        ];

        let body: TransferBody = self
            .post_form("/v1/transfers", &request.idempotency_key, &form)
            .await?;

        Ok(TransferReceipt { transfer_id: body.id })
    }
}
