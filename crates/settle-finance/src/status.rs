//! Invoice status derivation. Pure: no storage, no clock, no logging.

use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use settle_core::{
    Allocation, Invoice, InvoiceStatus, SettlementError, SettlementResult, round_money, sum_money,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvoiceBalance {
    pub paid_amount: Decimal,
    pub pending_amount: Decimal,
    pub status: InvoiceStatus,
}

pub fn paid_amount(invoice: &Invoice, allocations: &[Allocation]) -> SettlementResult<Decimal> {
    sum_money(
        allocations
            .iter()
            .filter(|allocation| allocation.invoice_id == invoice.id)
            .map(|allocation| allocation.amount),
    )
}

/// Derives paid/pending amounts and status from the allocation set.
///
/// An allocation total above the invoice total is a ledger bug and is
/// returned as `ConsistencyViolation` rather than clamped.
pub fn derive_status(
    invoice: &Invoice,
    allocations: &[Allocation],
    today: NaiveDate,
) -> SettlementResult<InvoiceBalance> {
    let paid_amount = paid_amount(invoice, allocations)?;
    let pending_amount = round_money(invoice.total_amount - paid_amount);
    if pending_amount < Decimal::ZERO {
        return Err(SettlementError::ConsistencyViolation(format!(
            "invoice {} has {} allocated against a total of {}",
            invoice.invoice_number, paid_amount, invoice.total_amount
        )));
    }

    Ok(InvoiceBalance {
        paid_amount,
        pending_amount,
        status: next_status(invoice, paid_amount, pending_amount, today),
    })
}

/// Display-only variant: pending is floored at zero. Never persist its result.
pub fn display_balance(
    invoice: &Invoice,
    allocations: &[Allocation],
    today: NaiveDate,
) -> SettlementResult<InvoiceBalance> {
    let paid_amount = paid_amount(invoice, allocations)?;
    let pending_amount = round_money((invoice.total_amount - paid_amount).max(Decimal::ZERO));

    Ok(InvoiceBalance {
        paid_amount,
        pending_amount,
        status: next_status(invoice, paid_amount, pending_amount, today),
    })
}

fn next_status(
    invoice: &Invoice,
    paid_amount: Decimal,
    pending_amount: Decimal,
    today: NaiveDate,
) -> InvoiceStatus {
    match invoice.status {
        InvoiceStatus::Cancelled | InvoiceStatus::Draft => invoice.status,
        _ if pending_amount.is_zero() => InvoiceStatus::Paid,
        _ if paid_amount > Decimal::ZERO => InvoiceStatus::PartiallyPaid,
        _ if invoice.due_date.is_some_and(|due| due < today) => InvoiceStatus::Overdue,
        _ => InvoiceStatus::Issued,
    }
}
