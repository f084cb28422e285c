use std::{str::FromStr, time::Duration};

use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;
use settle_core::{ItemType, SettlementError};
use settle_inventory::{CatalogClient, CatalogError, MovementDirection, StockDecrement};
use sqlx::{PgPool, Postgres, Row, Transaction};
use uuid::Uuid;

use crate::db::db_error;

/// Stock positions kept in `inventory_positions`. Each change runs in its own
/// short transaction, independent of the ledger transaction that asked for it.
///
/// The pool must not be shared with the ledger: Issue and Cancel hold a ledger
/// connection while they wait on the catalog.
#[derive(Clone)]
pub struct PgCatalog {
    pool: PgPool,
    lock_timeout: Duration,
}

impl PgCatalog {
    pub fn new(pool: PgPool, lock_timeout: Duration) -> Self {
        Self { pool, lock_timeout }
    }

    async fn begin(&self) -> sqlx::Result<Transaction<'static, Postgres>> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("SELECT set_config('lock_timeout', $1, true)")
            .bind(format!("{}ms", self.lock_timeout.as_millis()))
            .execute(&mut *tx)
            .await?;
        Ok(tx)
    }

    async fn try_decrement(&self, item_id: Uuid, quantity: Decimal) -> sqlx::Result<StockDecrement> {
        let mut tx = self.begin().await?;
        let row = sqlx::query(
            "SELECT quantity_on_hand FROM inventory_positions WHERE item_id = $1 FOR UPDATE",
        )
        .bind(item_id)
        .fetch_optional(&mut *tx)
        .await?;

        let on_hand: Decimal = match row {
            Some(row) => row.try_get("quantity_on_hand")?,
            None => Decimal::ZERO,
        };
        if on_hand < quantity {
            tx.rollback().await?;
            return Ok(StockDecrement::Insufficient { available: on_hand });
        }

        let remaining = on_hand - quantity;
        sqlx::query(
            "UPDATE inventory_positions SET quantity_on_hand = $2, updated_at = $3 WHERE item_id = $1",
        )
        .bind(item_id)
        .bind(remaining)
        .bind(Utc::now())
        .execute(&mut *tx)
        .await?;
        record_movement(&mut tx, item_id, quantity, MovementDirection::Deducted).await?;

        tx.commit().await?;
        Ok(StockDecrement::Applied { remaining })
    }

    /// Returns false when the item has no position.
    async fn try_increment(&self, item_id: Uuid, quantity: Decimal) -> sqlx::Result<bool> {
        let mut tx = self.begin().await?;
        let updated = sqlx::query(
            r#"
            UPDATE inventory_positions
            SET quantity_on_hand = quantity_on_hand + $2, updated_at = $3
            WHERE item_id = $1
            "#,
        )
        .bind(item_id)
        .bind(quantity)
        .bind(Utc::now())
        .execute(&mut *tx)
        .await?;
        if updated.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(false);
        }
        record_movement(&mut tx, item_id, quantity, MovementDirection::Restored).await?;

        tx.commit().await?;
        Ok(true)
    }
}

#[async_trait]
impl CatalogClient for PgCatalog {
    async fn item_type(&self, item_id: Uuid) -> Result<Option<ItemType>, CatalogError> {
        let raw: Option<String> =
            sqlx::query_scalar("SELECT item_type FROM inventory_positions WHERE item_id = $1")
                .bind(item_id)
                .fetch_optional(&self.pool)
                .await
                .map_err(catalog_error)?;

        raw.map(|value| ItemType::from_str(&value))
            .transpose()
            .map_err(|err| CatalogError::Unavailable(anyhow::Error::new(err)))
    }

    async fn decrement_stock(
        &self,
        item_id: Uuid,
        quantity: Decimal,
    ) -> Result<StockDecrement, CatalogError> {
        self.try_decrement(item_id, quantity)
            .await
            .map_err(catalog_error)
    }

    async fn increment_stock(&self, item_id: Uuid, quantity: Decimal) -> Result<(), CatalogError> {
        if !self
            .try_increment(item_id, quantity)
            .await
            .map_err(catalog_error)?
        {
            return Err(CatalogError::Unavailable(anyhow::anyhow!(
                "inventory position {item_id} not found"
            )));
        }
        Ok(())
    }
}

/// Pool exhaustion and lock contention are retryable, as on the ledger side.
pub fn catalog_error(err: sqlx::Error) -> CatalogError {
    match db_error(err) {
        SettlementError::StorageConflict(reason) => CatalogError::Busy(reason),
        other => CatalogError::Unavailable(anyhow::Error::new(other)),
    }
}

async fn record_movement(
    tx: &mut Transaction<'_, Postgres>,
    item_id: Uuid,
    quantity: Decimal,
    direction: MovementDirection,
) -> sqlx::Result<()> {
    let movement_type = match direction {
        MovementDirection::Deducted => "deducted",
        MovementDirection::Restored => "restored",
    };
    sqlx::query(
        r#"
        INSERT INTO inventory_movements (id, item_id, movement_type, quantity, occurred_at)
        VALUES ($1, $2, $3, $4, $5)
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(item_id)
    .bind(movement_type)
    .bind(quantity)
    .bind(Utc::now())
    .execute(&mut **tx)
    .await?;

    Ok(())
}
