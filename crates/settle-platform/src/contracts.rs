use serde::{Deserialize, Serialize};
use settle_core::{ActivityLogEntry, NewPayment, SettlementError};
use settle_finance::{AllocationReport, AllocationRequest, PaymentReceipt, PendingInvoice};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreatePaymentRequest {
    #[serde(flatten)]
    pub payment: NewPayment,
    /// Applied after the payment is saved; a failure here leaves the payment recorded.
    #[serde(default)]
    pub allocations: Vec<AllocationRequest>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreatePaymentResponse {
    pub payment: PaymentReceipt,
    pub allocation: Option<AllocationReport>,
    pub allocation_error: Option<ErrorBody>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AllocatePaymentRequest {
    pub allocations: Vec<AllocationRequest>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CancelInvoiceRequest {
    pub restore_inventory: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingInvoicesResponse {
    pub client_id: Uuid,
    pub invoices: Vec<PendingInvoice>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvoiceActivityResponse {
    pub invoice_id: Uuid,
    pub entries: Vec<ActivityLogEntry>,
}

/// Error payload: a stable machine-readable kind plus a human reason.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub kind: String,
    pub reason: String,
}

impl From<&SettlementError> for ErrorBody {
    fn from(err: &SettlementError) -> Self {
        Self {
            kind: err.kind().as_str().to_string(),
            reason: err.to_string(),
        }
    }
}
