use merch_catalog::ShippingQuote;
use merch_core::RetryPolicy;
use merch_order::CheckoutSettings;
use merch_shared::{Money, Rate};
use serde::Deserialize;
use std::env;
use std::time::Duration;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    /// Rate limiting is off without a redis url
    #[serde(default)]
    pub redis: Option<RedisConfig>,
    pub auth: AuthConfig,
    pub checkout: CheckoutConfig,
    pub payments: PaymentsConfig,
    pub settlement: SettlementConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub port: u16,
    #[serde(default = "default_rate_limit")]
    pub rate_limit_per_minute: i64,
}

fn default_rate_limit() -> i64 {
    120
}

#[derive(Debug, Deserialize, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_max_connections() -> u32 {
    5
}

#[derive(Debug, Deserialize, Clone)]
pub struct RedisConfig {
    pub url: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct AuthConfig {
    pub jwt_secret: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct CheckoutConfig {
    pub currency: String,
    /// Fraction, e.g. 0.23
    pub vat_rate: f64,
    pub default_shipping_name: String,
    /// Minor units
    pub default_shipping_cost: i64,
    #[serde(default)]
    pub default_shipping_days_min: Option<i32>,
    #[serde(default)]
    pub default_shipping_days_max: Option<i32>,
    pub max_line_quantity: u32,
}

impl CheckoutConfig {
    pub fn settings(&self) -> Result<CheckoutSettings, merch_shared::RateError> {
        Ok(CheckoutSettings {
            currency: self.currency.to_lowercase(),
            vat_rate: Rate::from_fraction(self.vat_rate)?,
            default_shipping: ShippingQuote {
                name: self.default_shipping_name.clone(),
                cost: Money::from_minor(self.default_shipping_cost),
                estimated_days_min: self.default_shipping_days_min,
                estimated_days_max: self.default_shipping_days_max,
            },
            max_line_quantity: self.max_line_quantity,
        })
    }
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum PaymentProvider {
    Mock,
    Stripe,
}

#[derive(Debug, Deserialize, Clone)]
pub struct PaymentsConfig {
    pub provider: PaymentProvider,
    pub api_base: String,
    #[serde(default)]
    pub secret_key: String,
    pub webhook_secret: String,
    pub webhook_tolerance_seconds: u64,
    pub request_timeout_seconds: u64,
    pub breaker_threshold: usize,
    pub breaker_reset_seconds: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SettlementConfig {
    pub max_attempts: u32,
    pub initial_delay_seconds: u64,
    pub max_delay_seconds: u64,
    pub multiplier: f64,
    pub poll_interval_seconds: u64,
    pub batch_size: i64,
    pub lease_seconds: i64,
}

impl SettlementConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            initial_delay: Duration::from_secs(self.initial_delay_seconds),
            max_delay: Duration::from_secs(self.max_delay_seconds),
            multiplier: self.multiplier,
        }
    }
}

impl Config {
    pub fn load() -> Result<Self, config::ConfigError> {
        let run_mode = env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

        let s = config::Config::builder()
            // Start off by merging in the "default" configuration file
            .add_source(config::File::with_name("config/default"))
            // Per-environment overrides, optional
            .add_source(config::File::with_name(&format!("config/{}", run_mode)).required(false))
            // Local overrides, never checked in
            .add_source(config::File::with_name("config/local").required(false))
            // Eg. `MERCH__PAYMENTS__WEBHOOK_SECRET=whsec_...`
            .add_source(config::Environment::with_prefix("MERCH").separator("__"))
            .build()?;

        s.try_deserialize()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DEFAULTS: &str = include_str!("../../config/default.toml");

    fn from_str(toml: &str) -> Config {
        config::Config::builder()
            .add_source(config::File::from_str(toml, config::FileFormat::Toml))
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap()
    }

    #[test]
    fn test_default_config_parses() {
        let cfg = from_str(DEFAULTS);
        assert_eq!(cfg.payments.provider, PaymentProvider::Mock);
        assert!(cfg.redis.is_none());

        let settings = cfg.checkout.settings().unwrap();
        assert_eq!(settings.vat_rate, Rate::from_basis_points(2300));
        assert_eq!(settings.default_shipping.cost, Money::from_minor(450));

        let policy = cfg.settlement.retry_policy();
        assert_eq!(policy.max_attempts, 5);
        assert_eq!(policy.initial_delay, Duration::from_secs(30));
    }
}
