pub mod catalog;
pub mod coordinator;

pub use catalog::{CatalogClient, CatalogError, InMemoryCatalog, InventoryPosition, StockDecrement};
pub use coordinator::{InventoryCoordinator, MovementDirection, StockMovement, stock_requirements};
