use std::collections::HashMap;

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use settle_core::{ItemType, SettlementError};
use thiserror::Error;
use tokio::sync::RwLock;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StockDecrement {
    Applied { remaining: Decimal },
    Insufficient { available: Decimal },
}

#[derive(Debug, Error)]
pub enum CatalogError {
    /// Lock or connection contention inside the catalog. Retryable.
    #[error("catalog busy: {0}")]
    Busy(String),
    #[error(transparent)]
    Unavailable(#[from] anyhow::Error),
}

impl CatalogError {
    /// Busy catalogs surface as a retryable conflict, anything else as a
    /// dependency failure.
    pub fn into_settlement(self, context: &str) -> SettlementError {
        match self {
            CatalogError::Busy(reason) => {
                SettlementError::StorageConflict(format!("{context}: {reason}"))
            }
            CatalogError::Unavailable(err) => {
                SettlementError::Dependency(format!("{context}: {err:#}"))
            }
        }
    }
}

/// Stock keeping owned by the catalog, outside the ledger transaction.
/// Transport failures are `Err`; a refused decrement is not.
#[async_trait]
pub trait CatalogClient: Send + Sync {
    /// The catalogued type of an item, `None` when the catalog does not know it.
    async fn item_type(&self, item_id: Uuid) -> Result<Option<ItemType>, CatalogError>;
    async fn decrement_stock(
        &self,
        item_id: Uuid,
        quantity: Decimal,
    ) -> Result<StockDecrement, CatalogError>;
    async fn increment_stock(&self, item_id: Uuid, quantity: Decimal) -> Result<(), CatalogError>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InventoryPosition {
    pub item_id: Uuid,
    pub item_type: ItemType,
    pub quantity_on_hand: Decimal,
}

impl InventoryPosition {
    pub fn receive(&mut self, quantity: Decimal) {
        self.quantity_on_hand += quantity;
    }

    pub fn issue(&mut self, quantity: Decimal) -> StockDecrement {
        if self.quantity_on_hand < quantity {
            return StockDecrement::Insufficient {
                available: self.quantity_on_hand,
            };
        }
        self.quantity_on_hand -= quantity;
        StockDecrement::Applied {
            remaining: self.quantity_on_hand,
        }
    }
}

#[derive(Default)]
pub struct InMemoryCatalog {
    positions: RwLock<HashMap<Uuid, InventoryPosition>>,
}

impl InMemoryCatalog {
    pub async fn stock(&self, item_id: Uuid, item_type: ItemType, quantity_on_hand: Decimal) {
        let mut positions = self.positions.write().await;
        positions.insert(
            item_id,
            InventoryPosition {
                item_id,
                item_type,
                quantity_on_hand,
            },
        );
    }

    pub async fn quantity_on_hand(&self, item_id: Uuid) -> Decimal {
        let positions = self.positions.read().await;
        positions
            .get(&item_id)
            .map(|position| position.quantity_on_hand)
            .unwrap_or(Decimal::ZERO)
    }
}

#[async_trait]
impl CatalogClient for InMemoryCatalog {
    async fn item_type(&self, item_id: Uuid) -> Result<Option<ItemType>, CatalogError> {
        let positions = self.positions.read().await;
        Ok(positions.get(&item_id).map(|position| position.item_type))
    }

    async fn decrement_stock(
        &self,
        item_id: Uuid,
        quantity: Decimal,
    ) -> Result<StockDecrement, CatalogError> {
        let mut positions = self.positions.write().await;
        match positions.get_mut(&item_id) {
            Some(position) => Ok(position.issue(quantity)),
            None => Ok(StockDecrement::Insufficient {
                available: Decimal::ZERO,
            }),
        }
    }

    async fn increment_stock(&self, item_id: Uuid, quantity: Decimal) -> Result<(), CatalogError> {
        let mut positions = self.positions.write().await;
        let position = positions
            .get_mut(&item_id)
            .ok_or_else(|| anyhow::anyhow!("catalog item {item_id} not found"))?;
        position.receive(quantity);
        Ok(())
    }
}
