//! Activity Log Writer. Entries are written through the caller's transaction
//! so they commit or vanish together with the change they describe.

use chrono::Utc;
use settle_core::{ActivityLogEntry, ActivityType, ActorId, LedgerTx, SettlementResult};
use uuid::Uuid;

pub async fn append<T: LedgerTx>(
    tx: &mut T,
    invoice_id: Uuid,
    activity_type: ActivityType,
    description: impl Into<String>,
    details: serde_json::Value,
    actor: &ActorId,
) -> SettlementResult<ActivityLogEntry> {
    write(tx, Some(invoice_id), None, activity_type, description.into(), details, actor).await
}

pub async fn append_for_payment<T: LedgerTx>(
    tx: &mut T,
    payment_id: Uuid,
    activity_type: ActivityType,
    description: impl Into<String>,
    details: serde_json::Value,
    actor: &ActorId,
) -> SettlementResult<ActivityLogEntry> {
    write(tx, None, Some(payment_id), activity_type, description.into(), details, actor).await
}

async fn write<T: LedgerTx>(
    tx: &mut T,
    invoice_id: Option<Uuid>,
    payment_id: Option<Uuid>,
    activity_type: ActivityType,
    description: String,
    details: serde_json::Value,
    actor: &ActorId,
) -> SettlementResult<ActivityLogEntry> {
    let entry = ActivityLogEntry {
        id: Uuid::new_v4(),
        invoice_id,
        payment_id,
        activity_type,
        description,
        details,
        actor: actor.clone(),
        occurred_at: Utc::now(),
    };
    tx.append_activity(&entry).await?;
    Ok(entry)
}
