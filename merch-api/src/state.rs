use merch_catalog::CatalogRepository;
use merch_core::{PaymentGateway, RetryPolicy, WebhookVerifier};
use merch_order::{
    CheckoutService, CheckoutSettings, EscalationRepository, InMemoryStore, OrderCalculator, OrderRepository,
    OrderStore, PayoutRepository, SettlementEngine, WebhookProcessor,
};
use merch_store::{DbClient, RedisClient};
use std::sync::Arc;

#[derive(Clone)]
pub struct AuthConfig {
    pub secret: String,
}

/// Storage ports and the payment provider the services run against
pub struct Backends {
    pub catalog: Arc<dyn CatalogRepository>,
    pub orders: Arc<dyn OrderRepository>,
    pub payouts: Arc<dyn PayoutRepository>,
    pub escalations: Arc<dyn EscalationRepository>,
    pub gateway: Arc<dyn PaymentGateway>,
}

impl Backends {
    pub fn in_memory(store: &InMemoryStore, gateway: Arc<dyn PaymentGateway>) -> Self {
        Self {
            catalog: Arc::new(store.clone()),
            orders: Arc::new(store.clone()),
            payouts: Arc::new(store.clone()),
            escalations: Arc::new(store.clone()),
            gateway,
        }
    }
}

pub struct EngineSettings {
    pub checkout: CheckoutSettings,
    pub verifier: WebhookVerifier,
    pub retry: RetryPolicy,
    pub lease: chrono::Duration,
}

#[derive(Clone)]
pub struct AppState {
    pub checkout: Arc<CheckoutService>,
    pub orders: Arc<OrderStore>,
    pub webhooks: Arc<WebhookProcessor>,
    pub settlement: Arc<SettlementEngine>,
    pub payouts: Arc<dyn PayoutRepository>,
    pub escalations: Arc<dyn EscalationRepository>,
    /// Reported by `/health` when present
    pub db: Option<Arc<DbClient>>,
    /// Rate limiting is skipped without it
    pub redis: Option<Arc<RedisClient>>,
    pub rate_limit_per_minute: i64,
    pub auth: AuthConfig,
}

impl AppState {
    pub fn new(backends: Backends, settings: EngineSettings, auth: AuthConfig) -> Self {
        let orders = Arc::new(OrderStore::new(backends.orders.clone()));
        let calculator = OrderCalculator::new(backends.catalog, settings.checkout);
        let checkout = CheckoutService::new(calculator, orders.clone(), backends.gateway.clone());
        let webhooks = WebhookProcessor::new(backends.orders, settings.verifier);
        let settlement =
            SettlementEngine::new(backends.payouts.clone(), backends.gateway, settings.retry).with_lease(settings.lease);

        Self {
            checkout: Arc::new(checkout),
            orders,
            webhooks: Arc::new(webhooks),
            settlement: Arc::new(settlement),
            payouts: backends.payouts,
            escalations: backends.escalations,
            db: None,
            redis: None,
            rate_limit_per_minute: 120,
            auth,
        }
    }

    pub fn with_db(mut self, db: Arc<DbClient>) -> Self {
        self.db = Some(db);
        self
    }

    pub fn with_rate_limit(mut self, redis: Arc<RedisClient>, per_minute: i64) -> Self {
        self.redis = Some(redis);
        self.rate_limit_per_minute = per_minute;
        self
    }
}
