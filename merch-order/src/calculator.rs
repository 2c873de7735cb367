use merch_catalog::{
    CatalogError, CatalogRepository, Product, ProductCategory, ShippingQuote, ShippingRateTable, VariantSelection,
    VendorAccount,
};
use merch_shared::{Money, Rate};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

use crate::models::{CustomerContact, Order, ShippingAddress};

// ============================================================================
// Request/Response Types
// ============================================================================

/// One cart line as submitted by the customer. Nothing here is trusted beyond
/// the product id, quantity and chosen variant.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CartLine {
    pub product_id: Uuid,
    pub quantity: u32,
    #[serde(default)]
    pub variant: VariantSelection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckoutRequest {
    pub items: Vec<CartLine>,
    pub shipping_address: ShippingAddress,
    pub customer: CustomerContact,
    /// Client-chosen key making order creation idempotent
    #[serde(default)]
    pub checkout_key: Option<String>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum LineIssue {
    ProductUnavailable,
    VendorNotPaymentCapable,
    InsufficientStock { requested: u32, available: i32 },
    InvalidQuantity { quantity: u32, max: u32 },
    InvalidVariant { detail: String },
}

/// Why one cart line cannot be ordered
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct LineError {
    pub line: usize,
    pub product_id: Uuid,
    #[serde(flatten)]
    pub issue: LineIssue,
}

#[derive(Debug, thiserror::Error)]
pub enum CalculationError {
    #[error("Cart is empty")]
    EmptyCart,

    #[error("Invalid shipping address: {}", .0.join(", "))]
    InvalidAddress(Vec<String>),

    #[error("{} cart line(s) cannot be ordered", .0.len())]
    Rejected(Vec<LineError>),

    #[error(transparent)]
    Catalog(#[from] CatalogError),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VendorBreakdown {
    pub vendor_id: Uuid,
    pub destination_account: String,
    pub commission_rate: Rate,
    pub subtotal: Money,
    pub platform_fee: Money,
    pub vendor_payout: Money,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OrderBreakdown {
    pub subtotal: Money,
    pub shipping: ShippingQuote,
    pub tax_amount: Money,
    pub platform_fee: Money,
    pub total_amount: Money,
    pub currency: String,
    pub vendors: Vec<VendorBreakdown>,
}

impl From<&Order> for OrderBreakdown {
    fn from(order: &Order) -> Self {
        Self {
            subtotal: order.subtotal,
            shipping: ShippingQuote::flat(order.shipping_method.clone(), order.shipping_cost),
            tax_amount: order.tax_amount,
            platform_fee: order.platform_fee,
            total_amount: order.total_amount,
            currency: order.currency.clone(),
            vendors: order
                .vendor_splits
                .iter()
                .map(|s| VendorBreakdown {
                    vendor_id: s.vendor_id,
                    destination_account: s.destination_account.clone(),
                    commission_rate: s.commission_rate,
                    subtotal: s.subtotal,
                    platform_fee: s.platform_fee,
                    vendor_payout: s.vendor_payout,
                })
                .collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PricedItem {
    pub product_id: Uuid,
    pub vendor_id: Uuid,
    pub product_title: String,
    pub category: ProductCategory,
    pub variant: VariantSelection,
    pub quantity: u32,
    pub unit_price: Money,
    pub total_price: Money,
    pub vendor_payout: Money,
}

/// Calculator output; this, not the cart, is what gets persisted
#[derive(Debug, Clone, PartialEq)]
pub struct PricedOrder {
    pub breakdown: OrderBreakdown,
    pub items: Vec<PricedItem>,
}

#[derive(Debug, Clone)]
pub struct CheckoutSettings {
    pub currency: String,
    pub vat_rate: Rate,
    pub default_shipping: ShippingQuote,
    pub max_line_quantity: u32,
}

impl Default for CheckoutSettings {
    fn default() -> Self {
        Self {
            currency: "eur".to_string(),
            vat_rate: Rate::from_basis_points(2300),
            default_shipping: ShippingQuote::default(),
            max_line_quantity: 100,
        }
    }
}

/// A cart line after validation, with the authoritative catalog data
#[derive(Debug, Clone)]
pub struct ValidatedLine {
    pub line: CartLine,
    pub product: Product,
    pub vendor: VendorAccount,
}

// ============================================================================
// Calculator
// ============================================================================

/// Turns a cart into a priced, per-vendor breakdown
pub struct OrderCalculator {
    catalog: Arc<dyn CatalogRepository>,
    settings: CheckoutSettings,
}

impl OrderCalculator {
    pub fn new(catalog: Arc<dyn CatalogRepository>, settings: CheckoutSettings) -> Self {
        Self { catalog, settings }
    }

    pub fn settings(&self) -> &CheckoutSettings {
        &self.settings
    }

    /// Validate every line against the catalog and price the order.
    /// All line problems are reported together.
    pub async fn price(&self, request: &CheckoutRequest) -> Result<PricedOrder, CalculationError> {
        if request.items.is_empty() {
            return Err(CalculationError::EmptyCart);
        }

        let problems = request.shipping_address.problems();
        if !problems.is_empty() {
            return Err(CalculationError::InvalidAddress(problems));
        }

        let validated = self.validate(&request.items).await?;

        let weight_grams: i64 = validated
            .iter()
            .map(|v| i64::from(v.product.weight_grams.max(0)) * i64::from(v.line.quantity))
            .sum();
        let country = request.shipping_address.country.to_uppercase();
        let rates = self.catalog.shipping_rates(&country).await?;
        let shipping = ShippingRateTable::new(rates, self.settings.default_shipping.clone()).quote(&country, weight_grams);

        Ok(Self::compose(&validated, shipping, self.settings.vat_rate, &self.settings.currency))
    }

    async fn validate(&self, lines: &[CartLine]) -> Result<Vec<ValidatedLine>, CalculationError> {
        // Stock is checked against the total asked for each product, across lines
        let mut requested: HashMap<Uuid, u32> = HashMap::new();
        for line in lines {
            let entry = requested.entry(line.product_id).or_default();
            *entry = entry.saturating_add(line.quantity);
        }

        let mut errors = Vec::new();
        let mut validated = Vec::with_capacity(lines.len());

        for (index, line) in lines.iter().enumerate() {
            let reject = |issue| LineError {
                line: index,
                product_id: line.product_id,
                issue,
            };

            if line.quantity == 0 || line.quantity > self.settings.max_line_quantity {
                errors.push(reject(LineIssue::InvalidQuantity {
                    quantity: line.quantity,
                    max: self.settings.max_line_quantity,
                }));
                continue;
            }

            let listing = match self.catalog.listing(line.product_id).await? {
                Some(listing) if listing.product.is_active => listing,
                _ => {
                    errors.push(reject(LineIssue::ProductUnavailable));
                    continue;
                }
            };

            let vendor = match listing.vendor {
                Some(vendor) if vendor.is_payment_capable() => vendor,
                _ => {
                    errors.push(reject(LineIssue::VendorNotPaymentCapable));
                    continue;
                }
            };

            if let Err(e) = listing.product.variant_options.validate(&line.variant) {
                errors.push(reject(LineIssue::InvalidVariant { detail: e.to_string() }));
                continue;
            }

            let total_requested = requested.get(&line.product_id).copied().unwrap_or(line.quantity);
            if !listing.product.has_stock_for(total_requested) {
                errors.push(reject(LineIssue::InsufficientStock {
                    requested: total_requested,
                    available: listing.product.inventory_count,
                }));
                continue;
            }

            validated.push(ValidatedLine {
                line: line.clone(),
                product: listing.product,
                vendor,
            });
        }

        if !errors.is_empty() {
            return Err(CalculationError::Rejected(errors));
        }
        Ok(validated)
    }

    /// Pure pricing over already-validated lines.
    ///
    /// Each vendor's fee is rounded once on the vendor subtotal, then spread
    /// over that vendor's items so item payouts add up to the vendor payout.
    pub fn compose(lines: &[ValidatedLine], shipping: ShippingQuote, vat_rate: Rate, currency: &str) -> PricedOrder {
        let mut items: Vec<PricedItem> = lines
            .iter()
            .map(|v| {
                let total_price = v.product.price.times(v.line.quantity);
                PricedItem {
                    product_id: v.product.id,
                    vendor_id: v.product.vendor_id,
                    product_title: v.product.title.clone(),
                    category: v.product.category,
                    variant: v.line.variant.clone(),
                    quantity: v.line.quantity,
                    unit_price: v.product.price,
                    total_price,
                    vendor_payout: total_price,
                }
            })
            .collect();

        // Vendors in order of first appearance
        let mut vendor_order: Vec<&VendorAccount> = Vec::new();
        for v in lines {
            if !vendor_order.iter().any(|a| a.vendor_id == v.product.vendor_id) {
                vendor_order.push(&v.vendor);
            }
        }

        let mut vendors = Vec::with_capacity(vendor_order.len());
        for account in vendor_order {
            let indices: Vec<usize> = (0..items.len())
                .filter(|&i| items[i].vendor_id == account.vendor_id)
                .collect();
            let weights: Vec<Money> = indices.iter().map(|&i| items[i].total_price).collect();
            let subtotal: Money = weights.iter().sum();
            let platform_fee = account.commission_rate.apply(subtotal);

            for (&i, item_fee) in indices.iter().zip(platform_fee.apportion(&weights)) {
                items[i].vendor_payout = items[i].total_price - item_fee;
            }

            vendors.push(VendorBreakdown {
                vendor_id: account.vendor_id,
                destination_account: account.external_account_id.clone().unwrap_or_default(),
                commission_rate: account.commission_rate,
                subtotal,
                platform_fee,
                vendor_payout: subtotal - platform_fee,
            });
        }

        let subtotal: Money = items.iter().map(|i| i.total_price).sum();
        let platform_fee: Money = vendors.iter().map(|v| v.platform_fee).sum();
        let tax_amount = vat_rate.apply(subtotal + shipping.cost);
        let total_amount = subtotal + shipping.cost + tax_amount;

        PricedOrder {
            breakdown: OrderBreakdown {
                subtotal,
                shipping,
                tax_amount,
                platform_fee,
                total_amount,
                currency: currency.to_string(),
                vendors,
            },
            items,
        }
    }
}
