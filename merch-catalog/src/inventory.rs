use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::product::ProductCategory;

/// A stock movement for one physical product.
///
/// There is no way to build one for a digital product, so digital goods can
/// never reach the inventory ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockLine {
    product_id: Uuid,
    quantity: u32,
}

impl StockLine {
    pub fn physical(product_id: Uuid, category: ProductCategory, quantity: u32) -> Option<Self> {
        if category.is_digital() || quantity == 0 {
            return None;
        }
        Some(Self { product_id, quantity })
    }

    pub fn product_id(&self) -> Uuid {
        self.product_id
    }

    pub fn quantity(&self) -> u32 {
        self.quantity
    }

    /// One line per product, ordered by product id so concurrent writers lock
    /// rows in the same order.
    pub fn consolidate(lines: impl IntoIterator<Item = StockLine>) -> Vec<StockLine> {
        let mut merged: BTreeMap<Uuid, u32> = BTreeMap::new();
        for line in lines {
            *merged.entry(line.product_id).or_default() += line.quantity;
        }
        merged
            .into_iter()
            .map(|(product_id, quantity)| StockLine { product_id, quantity })
            .collect()
    }
}

/// The store-side primitive the reconciler runs on. Implemented by a
/// transactional unit of work, so a failed decrement can be rolled back together
/// with everything else in the unit.
#[async_trait]
pub trait InventoryLedger: Send {
    /// Atomically `inventory_count -= quantity` if and only if the result stays
    /// non-negative. Returns whether the row was updated.
    async fn conditional_decrement(&mut self, product_id: Uuid, quantity: u32) -> Result<bool, InventoryError>;

    async fn increment(&mut self, product_id: Uuid, quantity: u32) -> Result<(), InventoryError>;
}

/// The only writer of `inventory_count`
pub struct InventoryReconciler;

impl InventoryReconciler {
    /// Decrement stock for a paid order line, failing without side effect when
    /// stock is short
    pub async fn try_decrement<L>(ledger: &mut L, line: &StockLine) -> Result<(), InventoryError>
    where
        L: InventoryLedger + ?Sized,
    {
        if ledger.conditional_decrement(line.product_id, line.quantity).await? {
            tracing::debug!(product_id = %line.product_id, quantity = line.quantity, "Stock decremented");
            Ok(())
        } else {
            Err(InventoryError::InsufficientStock {
                product_id: line.product_id,
                requested: line.quantity,
            })
        }
    }

    /// Put stock back when an unshipped order is cancelled
    pub async fn restore<L>(ledger: &mut L, line: &StockLine) -> Result<(), InventoryError>
    where
        L: InventoryLedger + ?Sized,
    {
        ledger.increment(line.product_id, line.quantity).await?;
        tracing::debug!(product_id = %line.product_id, quantity = line.quantity, "Stock restored");
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum InventoryError {
    #[error("Product not found: {0}")]
    NotFound(Uuid),

    #[error("Insufficient stock for product {product_id}: requested {requested}")]
    InsufficientStock { product_id: Uuid, requested: u32 },

    #[error("Inventory storage error: {0}")]
    Storage(String),
}
