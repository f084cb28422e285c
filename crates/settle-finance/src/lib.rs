pub mod activity;
pub mod allocation;
pub mod invoices;
pub mod payments;
pub mod status;

use std::sync::Arc;

use settle_core::LedgerStore;
use settle_inventory::{CatalogClient, InventoryCoordinator};

pub use allocation::{AllocationReport, AllocationRequest, AllocationService, InvoiceSettlementView};
pub use invoices::{InvoiceService, InvoiceSummary, PendingInvoice, RecomputeOutcome, TransitionOutcome};
pub use payments::{AllocationOutcome, PaymentReceipt, PaymentService, PaymentSummary, RecordOutcome};
pub use status::{InvoiceBalance, derive_status, display_balance};

/// The settlement services wired over one store and one catalog.
pub struct Settlement<S, C> {
    pub payments: PaymentService<S>,
    pub allocations: AllocationService<S>,
    pub invoices: InvoiceService<S, C>,
}

impl<S, C> Clone for Settlement<S, C> {
    fn clone(&self) -> Self {
        Self {
            payments: self.payments.clone(),
            allocations: self.allocations.clone(),
            invoices: self.invoices.clone(),
        }
    }
}

impl<S: LedgerStore, C: CatalogClient> Settlement<S, C> {
    pub fn new(store: Arc<S>, catalog: Arc<C>) -> Self {
        let payments = PaymentService::new(Arc::clone(&store));
        let allocations = payments.allocations().clone();
        let invoices = InvoiceService::new(store, InventoryCoordinator::new(catalog));

        Self {
            payments,
            allocations,
            invoices,
        }
    }
}
