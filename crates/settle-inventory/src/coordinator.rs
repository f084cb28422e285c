use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    sync::Arc,
};

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use settle_core::{InvoiceLine, ItemType, SettlementError, SettlementResult};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::catalog::{CatalogClient, CatalogError, StockDecrement};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MovementDirection {
    Deducted,
    Restored,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockMovement {
    pub item_id: Uuid,
    pub quantity: Decimal,
    pub direction: MovementDirection,
}

/// Applies stock side-effects of invoice Issue/Cancel transitions.
///
/// Each call is all-or-nothing: when one item fails, movements already
/// applied by the same call are reversed before the error is returned.
pub struct InventoryCoordinator<C> {
    catalog: Arc<C>,
}

impl<C> Clone for InventoryCoordinator<C> {
    fn clone(&self) -> Self {
        Self {
            catalog: Arc::clone(&self.catalog),
        }
    }
}

impl<C: CatalogClient> InventoryCoordinator<C> {
    pub fn new(catalog: Arc<C>) -> Self {
        Self { catalog }
    }

    pub async fn on_issue(
        &self,
        invoice_id: Uuid,
        lines: &[InvoiceLine],
    ) -> SettlementResult<Vec<StockMovement>> {
        let required = self.requirements(lines).await?;
        let mut applied = Vec::new();

        for (item_id, quantity) in required {
            let outcome = match self.catalog.decrement_stock(item_id, quantity).await {
                Ok(outcome) => outcome,
                Err(err) => {
                    self.revert(&applied).await;
                    return Err(err.into_settlement(&format!("decrement of item {item_id} failed")));
                }
            };

            match outcome {
                StockDecrement::Applied { .. } => applied.push(StockMovement {
                    item_id,
                    quantity,
                    direction: MovementDirection::Deducted,
                }),
                StockDecrement::Insufficient { available } => {
                    warn!(
                        "invoice {} cannot be issued: item {} has {} on hand, needs {}",
                        invoice_id, item_id, available, quantity
                    );
                    self.revert(&applied).await;
                    return Err(SettlementError::InsufficientStock {
                        item_id,
                        requested: quantity,
                        available,
                    });
                }
            }
        }

        if !applied.is_empty() {
            info!("invoice {} deducted stock for {} item(s)", invoice_id, applied.len());
        }
        Ok(applied)
    }

    /// With `restore_inventory == false` nothing is touched: the goods are
    /// treated as physically consumed.
    pub async fn on_cancel(
        &self,
        invoice_id: Uuid,
        lines: &[InvoiceLine],
        restore_inventory: bool,
    ) -> SettlementResult<Vec<StockMovement>> {
        if !restore_inventory {
            return Ok(Vec::new());
        }

        let required = self.requirements(lines).await?;
        let mut applied = Vec::new();
        for (item_id, quantity) in required {
            if let Err(err) = self.catalog.increment_stock(item_id, quantity).await {
                self.revert(&applied).await;
                return Err(err.into_settlement(&format!("restock of item {item_id} failed")));
            }
            applied.push(StockMovement {
                item_id,
                quantity,
                direction: MovementDirection::Restored,
            });
        }

        if !applied.is_empty() {
            info!("invoice {} restored stock for {} item(s)", invoice_id, applied.len());
        }
        Ok(applied)
    }

    /// Undoes movements in reverse order. Failures are logged, not returned:
    /// the caller is already on an error path.
    pub async fn revert(&self, movements: &[StockMovement]) {
        for movement in movements.iter().rev() {
            let result = match movement.direction {
                MovementDirection::Deducted => self
                    .catalog
                    .increment_stock(movement.item_id, movement.quantity)
                    .await,
                MovementDirection::Restored => self
                    .catalog
                    .decrement_stock(movement.item_id, movement.quantity)
                    .await
                    .and_then(|outcome| match outcome {
                        StockDecrement::Applied { .. } => Ok(()),
                        StockDecrement::Insufficient { available } => Err(
                            CatalogError::Unavailable(anyhow::anyhow!("only {available} on hand")),
                        ),
                    }),
            };

            if let Err(err) = result {
                error!(
                    "failed to revert stock movement {:?} for item {}: {err:#}",
                    movement.direction, movement.item_id
                );
            }
        }
    }

    /// Looks up the catalogued type of every referenced item, then sums the
    /// product quantities.
    async fn requirements(&self, lines: &[InvoiceLine]) -> SettlementResult<BTreeMap<Uuid, Decimal>> {
        let item_ids: BTreeSet<Uuid> = lines.iter().filter_map(|line| line.item_id).collect();
        let mut catalog_types = HashMap::new();
        for item_id in item_ids {
            let item_type = self
                .catalog
                .item_type(item_id)
                .await
                .map_err(|err| err.into_settlement(&format!("lookup of item {item_id} failed")))?;
            if let Some(item_type) = item_type {
                catalog_types.insert(item_id, item_type);
            }
        }
        Ok(stock_requirements(lines, &catalog_types))
    }
}

/// Product quantities per catalog item, ascending by item id.
///
/// The catalogued type wins over the type recorded on the line; items the
/// catalog does not know fall back to the line's type.
pub fn stock_requirements(
    lines: &[InvoiceLine],
    catalog_types: &HashMap<Uuid, ItemType>,
) -> BTreeMap<Uuid, Decimal> {
    let mut required = BTreeMap::new();
    for line in lines {
        let Some(item_id) = line.item_id else {
            continue;
        };
        let item_type = catalog_types.get(&item_id).copied().unwrap_or(line.item_type);
        if item_type == ItemType::Product {
            *required.entry(item_id).or_insert(Decimal::ZERO) += line.quantity;
        }
    }
    required
}
