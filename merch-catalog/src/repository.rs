use async_trait::async_trait;
use uuid::Uuid;

use crate::product::Product;
use crate::shipping::ShippingRate;
use crate::vendor::VendorAccount;

/// A product together with the account of the vendor selling it
#[derive(Debug, Clone)]
pub struct CatalogListing {
    pub product: Product,
    pub vendor: Option<VendorAccount>,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CatalogError {
    #[error("Catalog storage error: {0}")]
    Storage(String),
}

/// Read access to the catalog owned by the product collaborator
#[async_trait]
pub trait CatalogRepository: Send + Sync {
    async fn listing(&self, product_id: Uuid) -> Result<Option<CatalogListing>, CatalogError>;

    /// Active and inactive bands for `country`
    async fn shipping_rates(&self, country: &str) -> Result<Vec<ShippingRate>, CatalogError>;

    async fn vendor_account(&self, vendor_id: Uuid) -> Result<Option<VendorAccount>, CatalogError>;
}
