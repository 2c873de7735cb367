use async_trait::async_trait;
use merch_catalog::{
    CatalogError, CatalogListing, CatalogRepository, Product, ProductCategory, ShippingRate, VariantOptions,
    VendorAccount,
};
use merch_shared::{Money, Rate};
use sqlx::types::Json;
use sqlx::PgPool;
use uuid::Uuid;

pub struct PgCatalogRepository {
    pool: PgPool,
}

impl PgCatalogRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

// Internal structs for type-safe querying
#[derive(sqlx::FromRow)]
struct ListingRow {
    id: Uuid,
    vendor_id: Uuid,
    title: String,
    price: i64,
    category: String,
    inventory_count: i32,
    weight_grams: i32,
    is_active: bool,
    variant_options: Json<VariantOptions>,
    has_vendor: bool,
    external_account_id: Option<String>,
    commission_rate_bps: Option<i32>,
    charges_enabled: Option<bool>,
    payouts_enabled: Option<bool>,
    details_submitted: Option<bool>,
}

#[derive(sqlx::FromRow)]
pub(crate) struct VendorRow {
    pub vendor_id: Uuid,
    pub external_account_id: Option<String>,
    pub commission_rate_bps: i32,
    pub charges_enabled: bool,
    pub payouts_enabled: bool,
    pub details_submitted: bool,
}

impl From<VendorRow> for VendorAccount {
    fn from(row: VendorRow) -> Self {
        VendorAccount {
            vendor_id: row.vendor_id,
            external_account_id: row.external_account_id,
            commission_rate: Rate::from_basis_points(row.commission_rate_bps.max(0) as u32),
            charges_enabled: row.charges_enabled,
            payouts_enabled: row.payouts_enabled,
            details_submitted: row.details_submitted,
        }
    }
}

#[derive(sqlx::FromRow)]
struct ShippingRateRow {
    name: String,
    country: String,
    max_weight_grams: Option<i32>,
    rate: i64,
    estimated_days_min: i32,
    estimated_days_max: i32,
    is_active: bool,
}

fn storage(e: sqlx::Error) -> CatalogError {
    CatalogError::Storage(e.to_string())
}

impl ListingRow {
    fn into_listing(self) -> Result<CatalogListing, CatalogError> {
        let category = ProductCategory::parse(&self.category)
            .ok_or_else(|| CatalogError::Storage(format!("unknown category '{}'", self.category)))?;

        let vendor = self.has_vendor.then(|| VendorAccount {
            vendor_id: self.vendor_id,
            external_account_id: self.external_account_id.clone(),
            commission_rate: Rate::from_basis_points(self.commission_rate_bps.unwrap_or(0).max(0) as u32),
            charges_enabled: self.charges_enabled.unwrap_or(false),
            payouts_enabled: self.payouts_enabled.unwrap_or(false),
            details_submitted: self.details_submitted.unwrap_or(false),
        });

        Ok(CatalogListing {
            product: Product {
                id: self.id,
                vendor_id: self.vendor_id,
                title: self.title,
                price: Money::from_minor(self.price),
                category,
                inventory_count: self.inventory_count,
                weight_grams: self.weight_grams,
                is_active: self.is_active,
                variant_options: self.variant_options.0,
            },
            vendor,
        })
    }
}

#[async_trait]
impl CatalogRepository for PgCatalogRepository {
    async fn listing(&self, product_id: Uuid) -> Result<Option<CatalogListing>, CatalogError> {
        let row = sqlx::query_as::<_, ListingRow>(
            r#"
            SELECT p.id, p.vendor_id, p.title, p.price, p.category, p.inventory_count,
                   p.weight_grams, p.is_active, p.variant_options,
                   (v.vendor_id IS NOT NULL) AS has_vendor,
                   v.external_account_id, v.commission_rate_bps,
                   v.charges_enabled, v.payouts_enabled, v.details_submitted
            FROM products p
            LEFT JOIN vendors v ON v.vendor_id = p.vendor_id
            WHERE p.id = $1
            "#,
        )
        .bind(product_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(storage)?;

        row.map(ListingRow::into_listing).transpose()
    }

    async fn shipping_rates(&self, country: &str) -> Result<Vec<ShippingRate>, CatalogError> {
        let rows = sqlx::query_as::<_, ShippingRateRow>(
            r#"
            SELECT name, country, max_weight_grams, rate, estimated_days_min, estimated_days_max, is_active
            FROM shipping_rates
            WHERE country = UPPER($1)
            ORDER BY max_weight_grams ASC NULLS LAST
            "#,
        )
        .bind(country)
        .fetch_all(&self.pool)
        .await
        .map_err(storage)?;

        Ok(rows
            .into_iter()
            .map(|row| ShippingRate {
                name: row.name,
                country: row.country,
                max_weight_grams: row.max_weight_grams,
                rate: Money::from_minor(row.rate),
                estimated_days_min: Some(row.estimated_days_min),
                estimated_days_max: Some(row.estimated_days_max),
                is_active: row.is_active,
            })
            .collect())
    }

    async fn vendor_account(&self, vendor_id: Uuid) -> Result<Option<VendorAccount>, CatalogError> {
        let row = sqlx::query_as::<_, VendorRow>(
            r#"
            SELECT vendor_id, external_account_id, commission_rate_bps,
                   charges_enabled, payouts_enabled, details_submitted
            FROM vendors
            WHERE vendor_id = $1
            "#,
        )
        .bind(vendor_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(storage)?;

        Ok(row.map(VendorAccount::from))
    }
}
