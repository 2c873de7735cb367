pub mod app_config;
pub mod breaker;
pub mod catalog_repo;
pub mod database;
pub mod order_repo;
pub mod redis_repo;
pub mod settlement_repo;
pub mod stripe_gateway;

pub use breaker::{CircuitBreaker, CircuitState, GuardedGateway};
pub use catalog_repo::PgCatalogRepository;
pub use database::DbClient;
pub use order_repo::{PgOrderRepository, PgOrderTransaction};
pub use redis_repo::RedisClient;
pub use settlement_repo::PgSettlementRepository;
pub use stripe_gateway::StripeGateway;
