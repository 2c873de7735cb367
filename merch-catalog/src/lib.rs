pub mod inventory;
pub mod product;
pub mod repository;
pub mod shipping;
pub mod vendor;

pub use inventory::{InventoryError, InventoryLedger, InventoryReconciler, StockLine};
pub use product::{Product, ProductCategory, VariantError, VariantOptions, VariantSelection};
pub use repository::{CatalogError, CatalogListing, CatalogRepository};
pub use shipping::{ShippingQuote, ShippingRate, ShippingRateTable};
pub use vendor::{AccountUpdate, VendorAccount, DEFAULT_COMMISSION};
