use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use uuid::Uuid;

use crate::error::SettlementResult;
use crate::events::ActivityLogEntry;
use crate::models::{Allocation, Invoice, InvoiceLine, InvoiceStatus, Payment};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentKind {
    Invoice,
    Payment,
}

impl DocumentKind {
    pub fn prefix(&self) -> &'static str {
        match self {
            DocumentKind::Invoice => "INV",
            DocumentKind::Payment => "PAY",
        }
    }

    pub fn format_number(&self, sequence: i64) -> String {
        format!("{}-{sequence:06}", self.prefix())
    }
}

/// Cached settlement columns written back after a status derivation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvoiceSettlement {
    pub status: InvoiceStatus,
    pub paid_amount: Decimal,
    pub pending_amount: Decimal,
    pub updated_at: DateTime<Utc>,
}

/// Opens ledger transactions. Implementations own atomicity and row locking.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    type Tx: LedgerTx;

    /// Starts a transaction. Lock waits inside it must be bounded; a timeout
    /// or deadlock surfaces as `SettlementError::StorageConflict`.
    async fn begin(&self) -> SettlementResult<Self::Tx>;
}

/// A single unit of work. Dropping it without `commit` discards every write.
///
/// `lock_*` methods take a row lock held until commit or rollback. Callers
/// lock payments before invoices and invoices in ascending id order.
/// `find_*` methods read without locking.
#[async_trait]
pub trait LedgerTx: Send {
    async fn next_document_number(&mut self, kind: DocumentKind) -> SettlementResult<String>;

    async fn insert_invoice(&mut self, invoice: &Invoice, lines: &[InvoiceLine]) -> SettlementResult<()>;
    async fn lock_invoice(&mut self, invoice_id: Uuid) -> SettlementResult<Option<Invoice>>;
    async fn find_invoice(&mut self, invoice_id: Uuid) -> SettlementResult<Option<Invoice>>;
    async fn invoice_lines(&mut self, invoice_id: Uuid) -> SettlementResult<Vec<InvoiceLine>>;
    async fn update_invoice_settlement(
        &mut self,
        invoice_id: Uuid,
        settlement: InvoiceSettlement,
    ) -> SettlementResult<()>;
    async fn client_invoices(&mut self, client_id: Uuid) -> SettlementResult<Vec<Invoice>>;
    /// Ids of issued, partially paid or overdue invoices with a due date
    /// before `today`, ascending. Paid invoices are never candidates.
    async fn invoices_due_before(&mut self, today: NaiveDate) -> SettlementResult<Vec<Uuid>>;

    async fn insert_payment(&mut self, payment: &Payment) -> SettlementResult<()>;
    async fn lock_payment(&mut self, payment_id: Uuid) -> SettlementResult<Option<Payment>>;
    async fn find_payment(&mut self, payment_id: Uuid) -> SettlementResult<Option<Payment>>;
    async fn update_payment(&mut self, payment: &Payment) -> SettlementResult<()>;
    async fn delete_payment(&mut self, payment_id: Uuid) -> SettlementResult<()>;

    async fn insert_allocation(&mut self, allocation: &Allocation) -> SettlementResult<()>;
    async fn find_allocation(&mut self, allocation_id: Uuid) -> SettlementResult<Option<Allocation>>;
    async fn delete_allocation(&mut self, allocation_id: Uuid) -> SettlementResult<()>;
    async fn invoice_allocations(&mut self, invoice_id: Uuid) -> SettlementResult<Vec<Allocation>>;
    async fn payment_allocations(&mut self, payment_id: Uuid) -> SettlementResult<Vec<Allocation>>;

    async fn append_activity(&mut self, entry: &ActivityLogEntry) -> SettlementResult<()>;
    async fn invoice_activity(&mut self, invoice_id: Uuid) -> SettlementResult<Vec<ActivityLogEntry>>;

    async fn commit(self) -> SettlementResult<()>;
    async fn rollback(self) -> SettlementResult<()>;
}
