use anyhow::Context;
use merch_api::{app, worker, AppState, AuthConfig, Backends, EngineSettings};
use merch_core::{MockPaymentGateway, PaymentGateway, WebhookVerifier};
use merch_store::app_config::{Config, PaymentProvider};
use merch_store::{
    CircuitBreaker, DbClient, GuardedGateway, PgCatalogRepository, PgOrderRepository, PgSettlementRepository,
    RedisClient, StripeGateway,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "merch_api=debug,merch_order=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::load().context("Failed to load config")?;
    tracing::info!("Starting Merch API on port {}", config.server.port);

    // Postgres
    let db = DbClient::new(&config.database)
        .await
        .context("Failed to connect to Postgres")?;
    db.migrate().await.context("Failed to run migrations")?;
    let db = Arc::new(db);

    let payments = &config.payments;
    let gateway: Arc<dyn PaymentGateway> = match payments.provider {
        PaymentProvider::Mock => {
            tracing::warn!("Using the in-memory payment gateway, no money will move");
            Arc::new(MockPaymentGateway::new())
        }
        PaymentProvider::Stripe => {
            let stripe = StripeGateway::new(
                &payments.api_base,
                &payments.secret_key,
                Duration::from_secs(payments.request_timeout_seconds),
            )
            .context("Failed to build payment client")?;
            let breaker = CircuitBreaker::new(
                "payments",
                payments.breaker_threshold,
                Duration::from_secs(payments.breaker_reset_seconds),
            );
            Arc::new(GuardedGateway::new(stripe, breaker))
        }
    };

    let backends = Backends {
        catalog: Arc::new(PgCatalogRepository::new(db.pool.clone())),
        orders: Arc::new(PgOrderRepository::new(db.pool.clone())),
        payouts: Arc::new(PgSettlementRepository::new(db.pool.clone())),
        escalations: Arc::new(PgSettlementRepository::new(db.pool.clone())),
        gateway,
    };

    let settings = EngineSettings {
        checkout: config.checkout.settings().context("Invalid checkout settings")?,
        verifier: WebhookVerifier::new(payments.webhook_secret.clone(), payments.webhook_tolerance_seconds),
        retry: config.settlement.retry_policy(),
        lease: chrono::Duration::seconds(config.settlement.lease_seconds),
    };

    let mut app_state = AppState::new(
        backends,
        settings,
        AuthConfig {
            secret: config.auth.jwt_secret.clone(),
        },
    )
    .with_db(db);

    // Redis is optional and only backs rate limiting
    if let Some(redis) = &config.redis {
        let client = RedisClient::new(&redis.url)
            .await
            .context("Failed to create Redis client")?;
        app_state = app_state.with_rate_limit(Arc::new(client), config.server.rate_limit_per_minute);
    }

    tokio::spawn(worker::start_settlement_worker(
        app_state.settlement.clone(),
        Duration::from_secs(config.settlement.poll_interval_seconds),
        config.settlement.batch_size,
    ));

    let app = app(app_state);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.server.port));
    tracing::info!("Listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>()).await?;
    Ok(())
}
