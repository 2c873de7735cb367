use async_trait::async_trait;
use merch_core::{
    GatewayError, IntentRequest, IsTransient, PaymentGateway, PaymentIntent, TransferReceipt, TransferRequest,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CircuitState {
    Closed,   // Normal operation
    Open,     // Failure detected, failing fast
    HalfOpen, // Testing if the provider is back
}

pub struct CircuitBreaker {
    pub name: String,
    state: RwLock<CircuitState>,
    failure_count: AtomicUsize,
    failure_threshold: usize,
    reset_timeout: Duration,
    last_failure: RwLock<Option<Instant>>,
}

impl CircuitBreaker {
    pub fn new(name: &str, threshold: usize, timeout: Duration) -> Self {
        Self {
            name: name.to_string(),
            state: RwLock::new(CircuitState::Closed),
            failure_count: AtomicUsize::new(0),
            failure_threshold: threshold,
            reset_timeout: timeout,
            last_failure: RwLock::new(None),
        }
    }

    pub async fn state(&self) -> CircuitState {
        *self.state.read().await
    }

    /// Whether a call may go through now
    pub async fn check(&self) -> bool {
        let state = *self.state.read().await;
        if state == CircuitState::Closed {
            return true;
        }

        if state == CircuitState::Open {
            let last_fail = *self.last_failure.read().await;
            if let Some(instant) = last_fail {
                if instant.elapsed() > self.reset_timeout {
                    let mut s = self.state.write().await;
                    *s = CircuitState::HalfOpen;
                    tracing::info!("Circuit Breaker [{}] moving to Half-Open", self.name);
                    return true;
                }
            }
            return false;
        }

        // Half-Open allows one request through
        true
    }

    pub async fn record_success(&self) {
        let mut state = self.state.write().await;
        if *state == CircuitState::HalfOpen {
            *state = CircuitState::Closed;
            self.failure_count.store(0, Ordering::SeqCst);
            tracing::info!("Circuit Breaker [{}] recovered to Closed", self.name);
        } else if *state == CircuitState::Closed {
            self.failure_count.store(0, Ordering::SeqCst);
        }
    }

    pub async fn record_failure(&self) {
        let count = self.failure_count.fetch_add(1, Ordering::SeqCst) + 1;
        let mut state = self.state.write().await;

        if count >= self.failure_threshold || *state == CircuitState::HalfOpen {
            *state = CircuitState::Open;
            let mut last = self.last_failure.write().await;
            *last = Some(Instant::now());
            tracing::error!("Circuit Breaker [{}] TRIPPED to Open. Failures: {}", self.name, count);
        }
    }
}

/// A gateway that fails fast with a transient error while the provider is down.
///
/// Only transient failures count against the breaker; a rejected request means
/// the provider is up.
pub struct GuardedGateway<G> {
    inner: G,
    breaker: CircuitBreaker,
}

impl<G: PaymentGateway> GuardedGateway<G> {
    pub fn new(inner: G, breaker: CircuitBreaker) -> Self {
        Self { inner, breaker }
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    async fn guard<T>(&self, result: Result<T, GatewayError>) -> Result<T, GatewayError> {
        match &result {
            Ok(_) => self.breaker.record_success().await,
            Err(e) if e.is_transient() => self.breaker.record_failure().await,
            Err(_) => self.breaker.record_success().await,
        }
        result
    }

    fn open_error(&self) -> GatewayError {
        GatewayError::Transient(format!("Circuit Breaker [{}] is OPEN", self.breaker.name))
    }
}

#[async_trait]
impl<G: PaymentGateway> PaymentGateway for GuardedGateway<G> {
    async fn create_payment_intent(&self, request: &IntentRequest) -> Result<PaymentIntent, GatewayError> {
        if !self.breaker.check().await {
            return Err(self.open_error());
        }
        let result = self.inner.create_payment_intent(request).await;
        self.guard(result).await
    }

    async fn create_transfer(&self, request: &TransferRequest) -> Result<TransferReceipt, GatewayError> {
        if !self.breaker.check().await {
            return Err(self.open_error());
        }
        let result = self.inner.create_transfer(request).await;
        self.guard(result).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use merch_core::MockPaymentGateway;
    use merch_shared::Money;
    use uuid::Uuid;

    fn transfer(destination: &str) -> TransferRequest {
        TransferRequest {
            amount: Money::from_minor(1700),
            currency: "eur".into(),
            destination: destination.into(),
            idempotency_key: format!("payout:{}", Uuid::new_v4()),
            order_id: Uuid::new_v4(),
            vendor_id: Uuid::new_v4(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_breaker_opens_and_recovers() {
        let mock = MockPaymentGateway::new();
        mock.fail_transfers_to(
            "acct_a",
            [
                GatewayError::Transient("503".into()),
                GatewayError::Transient("503".into()),
            ],
        );
        let gateway = GuardedGateway::new(mock, CircuitBreaker::new("payments", 2, Duration::from_secs(30)));

        assert!(gateway.create_transfer(&transfer("acct_a")).await.is_err());
        assert!(gateway.create_transfer(&transfer("acct_a")).await.is_err());
        assert_eq!(gateway.breaker().state().await, CircuitState::Open);

        // Fails fast without reaching the provider
        let err = gateway.create_transfer(&transfer("acct_b")).await.unwrap_err();
        assert!(err.is_transient());
        assert!(err.to_string().contains("OPEN"));

        tokio::time::advance(Duration::from_secs(31)).await;
        assert!(gateway.create_transfer(&transfer("acct_b")).await.is_ok());
        assert_eq!(gateway.breaker().state().await, CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_rejections_do_not_trip() {
        let mock = MockPaymentGateway::new();
        mock.fail_transfers_to(
            "acct_a",
            [
                GatewayError::Rejected("no account".into()),
                GatewayError::Rejected("no account".into()),
            ],
        );
        let gateway = GuardedGateway::new(mock, CircuitBreaker::new("payments", 1, Duration::from_secs(30)));

        gateway.create_transfer(&transfer("acct_a")).await.unwrap_err();
        gateway.create_transfer(&transfer("acct_a")).await.unwrap_err();
        assert_eq!(gateway.breaker().state().await, CircuitState::Closed);
    }
}
