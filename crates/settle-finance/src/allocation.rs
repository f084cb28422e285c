use std::{
    collections::{BTreeMap, BTreeSet},
    sync::Arc,
};

use chrono::{NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::json;
use settle_core::{
    ActivityType, ActorId, Allocation, CapacityTarget, Invoice, InvoiceSettlement, InvoiceStatus,
    LedgerStore, LedgerTx, Payment, SettlementError, SettlementResult, positive_money, round_money,
    sum_money,
};
use tracing::{error, info};
use uuid::Uuid;

use crate::activity;
use crate::status::{InvoiceBalance, derive_status};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocationRequest {
    pub invoice_id: Uuid,
    pub amount: Decimal,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvoiceSettlementView {
    pub invoice_id: Uuid,
    pub invoice_number: String,
    pub paid_amount: Decimal,
    pub pending_amount: Decimal,
    pub status: InvoiceStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AllocationReport {
    pub payment_id: Uuid,
    pub allocation_ids: Vec<Uuid>,
    pub allocated_amount: Decimal,
    pub unallocated_amount: Decimal,
    pub invoices: Vec<InvoiceSettlementView>,
}

/// Applies payments to invoices under row locks, all-or-nothing per batch.
pub struct AllocationService<S> {
    store: Arc<S>,
}

impl<S> Clone for AllocationService<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
        }
    }
}

impl<S: LedgerStore> AllocationService<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    pub async fn allocate(
        &self,
        payment_id: Uuid,
        requests: &[AllocationRequest],
        actor: &ActorId,
    ) -> SettlementResult<AllocationReport> {
        if requests.is_empty() {
            return Err(SettlementError::invalid_input(
                "at least one invoice allocation is required",
            ));
        }
        let requests = requests
            .iter()
            .map(|request| {
                Ok(AllocationRequest {
                    invoice_id: request.invoice_id,
                    amount: positive_money(request.amount, "allocation amount")?,
                })
            })
            .collect::<SettlementResult<Vec<_>>>()?;

        let now = Utc::now();
        let today = now.date_naive();
        let mut tx = self.store.begin().await?;

        let payment = tx
            .lock_payment(payment_id)
            .await?
            .ok_or(SettlementError::PaymentNotFound(payment_id))?;

        let invoice_ids: BTreeSet<Uuid> = requests.iter().map(|request| request.invoice_id).collect();
        let mut invoices = BTreeMap::new();
        for invoice_id in invoice_ids {
            let invoice = tx
                .lock_invoice(invoice_id)
                .await?
                .ok_or(SettlementError::InvoiceNotFound(invoice_id))?;
            ensure_allocatable(&invoice, &payment)?;
            invoices.insert(invoice_id, invoice);
        }

        let mut payment_remaining = unallocated_amount(&mut tx, &payment).await?;
        let mut invoice_remaining = BTreeMap::new();
        for invoice in invoices.values() {
            let allocations = tx.invoice_allocations(invoice.id).await?;
            let balance = checked_balance(invoice, &allocations, today)?;
            invoice_remaining.insert(invoice.id, balance.pending_amount);
        }

        let mut batch = Vec::with_capacity(requests.len());
        for request in &requests {
            if request.amount > payment_remaining {
                return Err(SettlementError::AllocationExceedsCapacity {
                    target: CapacityTarget::Payment(payment.id),
                    requested: request.amount,
                    remaining: payment_remaining,
                });
            }
            let remaining = invoice_remaining
                .get_mut(&request.invoice_id)
                .ok_or(SettlementError::InvoiceNotFound(request.invoice_id))?;
            if request.amount > *remaining {
                return Err(SettlementError::AllocationExceedsCapacity {
                    target: CapacityTarget::Invoice(request.invoice_id),
                    requested: request.amount,
                    remaining: *remaining,
                });
            }

            payment_remaining -= request.amount;
            *remaining -= request.amount;
            batch.push(Allocation::new(payment.id, request.invoice_id, request.amount, actor, now)?);
        }

        for allocation in &batch {
            tx.insert_allocation(allocation).await?;
        }

        let mut views = Vec::with_capacity(invoices.len());
        for invoice in invoices.values() {
            let applied: Vec<&Allocation> = batch
                .iter()
                .filter(|allocation| allocation.invoice_id == invoice.id)
                .collect();
            let applied_amount = sum_money(applied.iter().map(|allocation| allocation.amount))?;
            let balance = persist_balance(&mut tx, invoice, today).await?;

            activity::append(
                &mut tx,
                invoice.id,
                ActivityType::Allocated,
                format!(
                    "Allocated {} from payment {}",
                    applied_amount, payment.payment_number
                ),
                json!({
                    "payment_id": payment.id,
                    "payment_number": payment.payment_number,
                    "amount": applied_amount,
                    "allocation_ids": applied.iter().map(|allocation| allocation.id).collect::<Vec<_>>(),
                    "previous_status": invoice.status,
                    "status": balance.status,
                    "pending_amount": balance.pending_amount,
                }),
                actor,
            )
            .await?;

            views.push(settlement_view(invoice, balance));
        }

        let allocated_amount = sum_money(batch.iter().map(|allocation| allocation.amount))?;
        tx.commit().await?;

        info!(
            "payment {} allocated {} across {} invoice(s)",
            payment.payment_number,
            allocated_amount,
            views.len()
        );

        Ok(AllocationReport {
            payment_id: payment.id,
            allocation_ids: batch.iter().map(|allocation| allocation.id).collect(),
            allocated_amount,
            unallocated_amount: round_money(payment_remaining),
            invoices: views,
        })
    }

    /// Removes one allocation and re-derives its invoice. Used to correct a
    /// mistaken allocation before re-allocating; allocations are never edited.
    pub async fn remove_allocation(
        &self,
        allocation_id: Uuid,
        actor: &ActorId,
    ) -> SettlementResult<InvoiceSettlementView> {
        let today = Utc::now().date_naive();
        let mut tx = self.store.begin().await?;

        let allocation = tx
            .find_allocation(allocation_id)
            .await?
            .ok_or(SettlementError::AllocationNotFound(allocation_id))?;
        let payment = tx
            .lock_payment(allocation.payment_id)
            .await?
            .ok_or(SettlementError::PaymentNotFound(allocation.payment_id))?;
        let invoice = tx
            .lock_invoice(allocation.invoice_id)
            .await?
            .ok_or(SettlementError::InvoiceNotFound(allocation.invoice_id))?;
        // a concurrent removal may have won the locks first
        if tx.find_allocation(allocation_id).await?.is_none() {
            return Err(SettlementError::AllocationNotFound(allocation_id));
        }

        tx.delete_allocation(allocation.id).await?;
        let balance = persist_balance(&mut tx, &invoice, today).await?;

        activity::append(
            &mut tx,
            invoice.id,
            ActivityType::Deallocated,
            format!(
                "Removed allocation of {} from payment {}",
                allocation.amount, payment.payment_number
            ),
            json!({
                "allocation_id": allocation.id,
                "payment_id": payment.id,
                "amount": allocation.amount,
                "previous_status": invoice.status,
                "status": balance.status,
                "pending_amount": balance.pending_amount,
            }),
            actor,
        )
        .await?;

        tx.commit().await?;
        info!(
            "allocation {} of {} removed from invoice {}",
            allocation.id, allocation.amount, invoice.invoice_number
        );

        Ok(settlement_view(&invoice, balance))
    }
}

fn ensure_allocatable(invoice: &Invoice, payment: &Payment) -> SettlementResult<()> {
    match invoice.status {
        InvoiceStatus::Cancelled => return Err(SettlementError::InvoiceCancelled(invoice.id)),
        InvoiceStatus::Draft => {
            return Err(SettlementError::InvalidTransition {
                invoice_id: invoice.id,
                status: invoice.status,
                action: "allocate to",
            });
        }
        _ => {}
    }
    if invoice.client_id != payment.client_id {
        return Err(SettlementError::invalid_input(format!(
            "invoice {} belongs to a different client than payment {}",
            invoice.invoice_number, payment.payment_number
        )));
    }
    Ok(())
}

pub(crate) async fn unallocated_amount<T: LedgerTx>(
    tx: &mut T,
    payment: &Payment,
) -> SettlementResult<Decimal> {
    let allocated = sum_money(
        tx.payment_allocations(payment.id)
            .await?
            .iter()
            .map(|allocation| allocation.amount),
    )?;
    let remaining = round_money(payment.amount_received - allocated);
    if remaining < Decimal::ZERO {
        error!(
            "payment {} is over-allocated: {} allocated of {}",
            payment.payment_number, allocated, payment.amount_received
        );
        return Err(SettlementError::ConsistencyViolation(format!(
            "payment {} has {} allocated against {} received",
            payment.payment_number, allocated, payment.amount_received
        )));
    }
    Ok(remaining)
}

pub(crate) fn checked_balance(
    invoice: &Invoice,
    allocations: &[Allocation],
    today: NaiveDate,
) -> SettlementResult<InvoiceBalance> {
    derive_status(invoice, allocations, today).inspect_err(|err| {
        if let SettlementError::ConsistencyViolation(reason) = err {
            error!("fatal ledger inconsistency: {reason}");
        }
    })
}

/// Re-derives the invoice from its current allocations and writes the cached
/// settlement columns.
pub(crate) async fn persist_balance<T: LedgerTx>(
    tx: &mut T,
    invoice: &Invoice,
    today: NaiveDate,
) -> SettlementResult<InvoiceBalance> {
    let allocations = tx.invoice_allocations(invoice.id).await?;
    let balance = checked_balance(invoice, &allocations, today)?;

    tx.update_invoice_settlement(
        invoice.id,
        InvoiceSettlement {
            status: balance.status,
            paid_amount: balance.paid_amount,
            pending_amount: balance.pending_amount,
            updated_at: Utc::now(),
        },
    )
    .await?;

    Ok(balance)
}

pub(crate) fn settlement_view(invoice: &Invoice, balance: InvoiceBalance) -> InvoiceSettlementView {
    InvoiceSettlementView {
        invoice_id: invoice.id,
        invoice_number: invoice.invoice_number.clone(),
        paid_amount: balance.paid_amount,
        pending_amount: balance.pending_amount,
        status: balance.status,
    }
}
