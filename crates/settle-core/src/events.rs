use std::{fmt, str::FromStr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::SettlementError;
use crate::models::ActorId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityType {
    Created,
    Issued,
    Allocated,
    Deallocated,
    StatusChanged,
    Cancelled,
    Deleted,
}

impl ActivityType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActivityType::Created => "created",
            ActivityType::Issued => "issued",
            ActivityType::Allocated => "allocated",
            ActivityType::Deallocated => "deallocated",
            ActivityType::StatusChanged => "status_changed",
            ActivityType::Cancelled => "cancelled",
            ActivityType::Deleted => "deleted",
        }
    }
}

impl fmt::Display for ActivityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ActivityType {
    type Err = SettlementError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "created" => Ok(ActivityType::Created),
            "issued" => Ok(ActivityType::Issued),
            "allocated" => Ok(ActivityType::Allocated),
            "deallocated" => Ok(ActivityType::Deallocated),
            "status_changed" => Ok(ActivityType::StatusChanged),
            "cancelled" => Ok(ActivityType::Cancelled),
            "deleted" => Ok(ActivityType::Deleted),
            other => Err(SettlementError::invalid_input(format!(
                "unknown activity type {other}"
            ))),
        }
    }
}

/// Append-only audit record. Entries about a payment that touches no invoice
/// (recording, deleting) carry only `payment_id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivityLogEntry {
    pub id: Uuid,
    pub invoice_id: Option<Uuid>,
    pub payment_id: Option<Uuid>,
    pub activity_type: ActivityType,
    pub description: String,
    pub details: serde_json::Value,
    pub actor: ActorId,
    pub occurred_at: DateTime<Utc>,
}
