use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::models::InvoiceStatus;

/// Coarse classification callers use to translate failures without knowing
/// storage internals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    NotFound,
    InvalidInput,
    CapacityExceeded,
    InvalidStateTransition,
    DependencyFailure,
    Conflict,
    PaymentHasAllocations,
    Fatal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::NotFound => "not_found",
            ErrorKind::InvalidInput => "invalid_input",
            ErrorKind::CapacityExceeded => "capacity_exceeded",
            ErrorKind::InvalidStateTransition => "invalid_state_transition",
            ErrorKind::DependencyFailure => "dependency_failure",
            ErrorKind::Conflict => "conflict",
            ErrorKind::PaymentHasAllocations => "payment_has_allocations",
            ErrorKind::Fatal => "fatal",
        }
    }
}

#[derive(Debug, Error)]
pub enum SettlementError {
    #[error("payment {0} not found")]
    PaymentNotFound(Uuid),

    #[error("invoice {0} not found")]
    InvoiceNotFound(Uuid),

    #[error("allocation {0} not found")]
    AllocationNotFound(Uuid),

    #[error("{0}")]
    InvalidInput(String),

    #[error("invoice {0} is cancelled and cannot receive allocations")]
    InvoiceCancelled(Uuid),

    #[error("cannot {action} invoice {invoice_id} while it is {status}")]
    InvalidTransition {
        invoice_id: Uuid,
        status: InvoiceStatus,
        action: &'static str,
    },

    #[error(
        "allocation of {requested} against {target} exceeds remaining capacity of {remaining}"
    )]
    AllocationExceedsCapacity {
        target: CapacityTarget,
        requested: Decimal,
        remaining: Decimal,
    },

    #[error("insufficient stock for item {item_id}: requested {requested}, available {available}")]
    InsufficientStock {
        item_id: Uuid,
        requested: Decimal,
        available: Decimal,
    },

    #[error("inventory collaborator failed: {0}")]
    Dependency(String),

    #[error("payment {payment_id} has {allocated} allocated and cannot be deleted")]
    PaymentHasAllocations { payment_id: Uuid, allocated: Decimal },

    #[error("storage conflict, retry the operation: {0}")]
    StorageConflict(String),

    #[error("ledger consistency violation: {0}")]
    ConsistencyViolation(String),

    #[error("storage failure: {0:#}")]
    Storage(#[from] anyhow::Error),
}

/// Which side of an allocation ran out of room.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CapacityTarget {
    Payment(Uuid),
    Invoice(Uuid),
}

impl std::fmt::Display for CapacityTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CapacityTarget::Payment(id) => write!(f, "payment {id}"),
            CapacityTarget::Invoice(id) => write!(f, "invoice {id}"),
        }
    }
}

impl SettlementError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SettlementError::PaymentNotFound(_)
            | SettlementError::InvoiceNotFound(_)
            | SettlementError::AllocationNotFound(_) => ErrorKind::NotFound,
            SettlementError::InvalidInput(_) => ErrorKind::InvalidInput,
            SettlementError::InvoiceCancelled(_) | SettlementError::InvalidTransition { .. } => {
                ErrorKind::InvalidStateTransition
            }
            SettlementError::AllocationExceedsCapacity { .. } => ErrorKind::CapacityExceeded,
            SettlementError::InsufficientStock { .. } | SettlementError::Dependency(_) => {
                ErrorKind::DependencyFailure
            }
            SettlementError::PaymentHasAllocations { .. } => ErrorKind::PaymentHasAllocations,
            SettlementError::StorageConflict(_) => ErrorKind::Conflict,
            SettlementError::ConsistencyViolation(_) | SettlementError::Storage(_) => {
                ErrorKind::Fatal
            }
        }
    }

    /// Only lock timeouts and deadlocks are safe to retry as a whole.
    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::Conflict
    }

    pub fn invalid_input(reason: impl Into<String>) -> Self {
        SettlementError::InvalidInput(reason.into())
    }
}

pub type SettlementResult<T> = Result<T, SettlementError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_conflicts_are_retryable() {
        let conflict = SettlementError::StorageConflict("deadlock detected".to_string());
        assert!(conflict.is_retryable());

        let capacity = SettlementError::AllocationExceedsCapacity {
            target: CapacityTarget::Payment(Uuid::nil()),
            requested: Decimal::new(70000, 2),
            remaining: Decimal::new(60000, 2),
        };
        assert_eq!(capacity.kind(), ErrorKind::CapacityExceeded);
        assert!(!capacity.is_retryable());
    }

    #[test]
    fn storage_failures_are_fatal() {
        let err = SettlementError::from(anyhow::anyhow!("connection refused"));
        assert_eq!(err.kind(), ErrorKind::Fatal);
        assert!(err.to_string().contains("connection refused"));
    }

    #[test]
    fn capacity_reason_names_the_target() {
        let invoice_id = Uuid::new_v4();
        let err = SettlementError::AllocationExceedsCapacity {
            target: CapacityTarget::Invoice(invoice_id),
            requested: Decimal::new(100, 0),
            remaining: Decimal::new(40, 0),
        };
        assert!(err.to_string().contains(&format!("invoice {invoice_id}")));
    }
}
