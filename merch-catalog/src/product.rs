use merch_shared::Money;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Product categories in the catalog
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ProductCategory {
    Cd,
    Vinyl,
    Tshirt,
    Hoodie,
    Poster,
    Sticker,
    Digital,
    Other,
}

impl ProductCategory {
    /// Digital goods carry no stock and never touch `inventory_count`.
    pub fn is_digital(self) -> bool {
        matches!(self, ProductCategory::Digital)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ProductCategory::Cd => "cd",
            ProductCategory::Vinyl => "vinyl",
            ProductCategory::Tshirt => "tshirt",
            ProductCategory::Hoodie => "hoodie",
            ProductCategory::Poster => "poster",
            ProductCategory::Sticker => "sticker",
            ProductCategory::Digital => "digital",
            ProductCategory::Other => "other",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "cd" => Some(ProductCategory::Cd),
            "vinyl" => Some(ProductCategory::Vinyl),
            "tshirt" => Some(ProductCategory::Tshirt),
            "hoodie" => Some(ProductCategory::Hoodie),
            "poster" => Some(ProductCategory::Poster),
            "sticker" => Some(ProductCategory::Sticker),
            "digital" => Some(ProductCategory::Digital),
            "other" => Some(ProductCategory::Other),
            _ => None,
        }
    }
}

/// The sizes and colours a product is sold in. Empty lists mean "no choice".
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct VariantOptions {
    #[serde(default)]
    pub sizes: Vec<String>,
    #[serde(default)]
    pub colors: Vec<String>,
}

/// What the customer picked for one cart line.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(deny_unknown_fields)]
pub struct VariantSelection {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum VariantError {
    #[error("{dimension} is required, one of {offered:?}")]
    Missing { dimension: &'static str, offered: Vec<String> },

    #[error("{dimension} '{value}' is not offered")]
    NotOffered { dimension: &'static str, value: String },

    #[error("product has no {dimension} options")]
    Unexpected { dimension: &'static str },
}

impl VariantOptions {
    pub fn validate(&self, selection: &VariantSelection) -> Result<(), VariantError> {
        check_dimension("size", &self.sizes, selection.size.as_deref())?;
        check_dimension("color", &self.colors, selection.color.as_deref())
    }
}

fn check_dimension(dimension: &'static str, offered: &[String], chosen: Option<&str>) -> Result<(), VariantError> {
    match (offered.is_empty(), chosen) {
        (true, None) => Ok(()),
        (true, Some(_)) => Err(VariantError::Unexpected { dimension }),
        (false, None) => Err(VariantError::Missing {
            dimension,
            offered: offered.to_vec(),
        }),
        (false, Some(value)) if offered.iter().any(|o| o == value) => Ok(()),
        (false, Some(value)) => Err(VariantError::NotOffered {
            dimension,
            value: value.to_string(),
        }),
    }
}

/// Read projection of a catalog product
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Product {
    pub id: Uuid,
    pub vendor_id: Uuid,
    pub title: String,
    pub price: Money,
    pub category: ProductCategory,
    pub inventory_count: i32,
    pub weight_grams: i32,
    pub is_active: bool,
    #[serde(default)]
    pub variant_options: VariantOptions,
}

impl Product {
    /// Stock available for `requested` units; digital products are always in stock.
    pub fn has_stock_for(&self, requested: u32) -> bool {
        self.category.is_digital() || i64::from(self.inventory_count) >= i64::from(requested)
    }
}
