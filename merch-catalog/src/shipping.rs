use merch_shared::Money;
use serde::{Deserialize, Serialize};

/// One weight band for a destination country
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ShippingRate {
    pub name: String,
    /// ISO 3166-1 alpha-2
    pub country: String,
    /// `None` means the band has no upper bound
    pub max_weight_grams: Option<i32>,
    pub rate: Money,
    pub estimated_days_min: Option<i32>,
    pub estimated_days_max: Option<i32>,
    pub is_active: bool,
}

/// The shipping line chosen for an order
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ShippingQuote {
    pub name: String,
    pub cost: Money,
    pub estimated_days_min: Option<i32>,
    pub estimated_days_max: Option<i32>,
}

impl ShippingQuote {
    pub fn flat(name: impl Into<String>, cost: Money) -> Self {
        Self {
            name: name.into(),
            cost,
            estimated_days_min: None,
            estimated_days_max: None,
        }
    }
}

impl Default for ShippingQuote {
    fn default() -> Self {
        Self::flat("Standard Shipping", Money::from_minor(450))
    }
}

/// Weight-banded shipping table with a flat fallback
#[derive(Debug, Clone)]
pub struct ShippingRateTable {
    rates: Vec<ShippingRate>,
    fallback: ShippingQuote,
}

impl ShippingRateTable {
    pub fn new(rates: Vec<ShippingRate>, fallback: ShippingQuote) -> Self {
        Self { rates, fallback }
    }

    /// Cheapest active band for `country` that can carry `weight_grams`,
    /// or the fallback when none does
    pub fn quote(&self, country: &str, weight_grams: i64) -> ShippingQuote {
        self.rates
            .iter()
            .filter(|r| r.is_active && r.country.eq_ignore_ascii_case(country))
            .filter(|r| r.max_weight_grams.is_none_or(|max| i64::from(max) >= weight_grams))
            .min_by_key(|r| r.rate)
            .map(|r| ShippingQuote {
                name: r.name.clone(),
                cost: r.rate,
                estimated_days_min: r.estimated_days_min,
                estimated_days_max: r.estimated_days_max,
            })
            .unwrap_or_else(|| self.fallback.clone())
    }
}
