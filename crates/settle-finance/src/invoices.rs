use std::sync::Arc;

use chrono::{NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::json;
use settle_core::{
    ActivityLogEntry, ActivityType, ActorId, DocumentKind, Invoice, InvoiceLine,
    InvoiceSettlement, InvoiceStatus, LedgerStore, LedgerTx, NewInvoice, SettlementError,
    SettlementResult,
};
use settle_inventory::{CatalogClient, InventoryCoordinator, StockMovement};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::activity;
use crate::allocation::{InvoiceSettlementView, checked_balance, persist_balance, settlement_view};
use crate::status::{InvoiceBalance, display_balance};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransitionOutcome {
    pub invoice_id: Uuid,
    pub status: InvoiceStatus,
    /// True when the invoice was already in the target state and nothing ran.
    pub already_applied: bool,
    pub stock_movements: Vec<StockMovement>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingInvoice {
    pub invoice_id: Uuid,
    pub invoice_number: String,
    pub total_amount: Decimal,
    pub pending_amount: Decimal,
    pub due_date: Option<NaiveDate>,
    pub status: InvoiceStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvoiceSummary {
    pub invoice: Invoice,
    pub lines: Vec<InvoiceLine>,
    pub balance: InvoiceBalance,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecomputeOutcome {
    pub settlement: InvoiceSettlementView,
    pub changed: bool,
}

/// Invoice lifecycle: Draft creation, Issue/Cancel with stock side-effects,
/// and status recomputation.
pub struct InvoiceService<S, C> {
    store: Arc<S>,
    inventory: InventoryCoordinator<C>,
}

impl<S, C> Clone for InvoiceService<S, C> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            inventory: self.inventory.clone(),
        }
    }
}

impl<S: LedgerStore, C: CatalogClient> InvoiceService<S, C> {
    pub fn new(store: Arc<S>, inventory: InventoryCoordinator<C>) -> Self {
        Self { store, inventory }
    }

    pub async fn create_draft(&self, input: NewInvoice, actor: &ActorId) -> SettlementResult<Invoice> {
        let now = Utc::now();
        let mut tx = self.store.begin().await?;

        let invoice_number = tx.next_document_number(DocumentKind::Invoice).await?;
        let (invoice, lines) = Invoice::draft(input, invoice_number, actor, now)?;
        tx.insert_invoice(&invoice, &lines).await?;

        activity::append(
            &mut tx,
            invoice.id,
            ActivityType::Created,
            format!(
                "Invoice {} drafted for {} {}",
                invoice.invoice_number, invoice.total_amount, invoice.currency
            ),
            json!({
                "total_amount": invoice.total_amount,
                "line_count": lines.len(),
            }),
            actor,
        )
        .await?;

        tx.commit().await?;
        info!("invoice {} drafted", invoice.invoice_number);
        Ok(invoice)
    }

    pub async fn get_invoice(&self, invoice_id: Uuid, today: NaiveDate) -> SettlementResult<InvoiceSummary> {
        let mut tx = self.store.begin().await?;
        let invoice = tx
            .find_invoice(invoice_id)
            .await?
            .ok_or(SettlementError::InvoiceNotFound(invoice_id))?;
        let lines = tx.invoice_lines(invoice_id).await?;
        let allocations = tx.invoice_allocations(invoice_id).await?;
        tx.rollback().await?;

        let balance = checked_balance(&invoice, &allocations, today)?;
        Ok(InvoiceSummary {
            invoice,
            lines,
            balance,
        })
    }

    /// Draft -> Issued. Product lines are deducted from stock first; if any
    /// item is short the invoice stays Draft and nothing is deducted.
    pub async fn issue(&self, invoice_id: Uuid, actor: &ActorId) -> SettlementResult<TransitionOutcome> {
        let mut tx = self.store.begin().await?;
        let invoice = tx
            .lock_invoice(invoice_id)
            .await?
            .ok_or(SettlementError::InvoiceNotFound(invoice_id))?;

        match invoice.status {
            InvoiceStatus::Draft => {}
            InvoiceStatus::Cancelled => {
                return Err(SettlementError::InvalidTransition {
                    invoice_id,
                    status: invoice.status,
                    action: "issue",
                });
            }
            status => {
                tx.rollback().await?;
                info!("invoice {} already issued, nothing to do", invoice.invoice_number);
                return Ok(TransitionOutcome {
                    invoice_id,
                    status,
                    already_applied: true,
                    stock_movements: Vec::new(),
                });
            }
        }

        let lines = tx.invoice_lines(invoice_id).await?;
        let movements = self.inventory.on_issue(invoice_id, &lines).await?;

        let issued = Invoice {
            status: InvoiceStatus::Issued,
            ..invoice
        };
        match self.finish_issue(tx, &issued, &movements, actor).await {
            Ok(balance) => {
                info!("invoice {} issued as {}", issued.invoice_number, balance.status);
                Ok(TransitionOutcome {
                    invoice_id,
                    status: balance.status,
                    already_applied: false,
                    stock_movements: movements,
                })
            }
            Err(err) => {
                warn!(
                    "issuing invoice {} failed after stock deduction, reverting: {}",
                    issued.invoice_number, err
                );
                self.inventory.revert(&movements).await;
                Err(err)
            }
        }
    }

    async fn finish_issue(
        &self,
        mut tx: S::Tx,
        issued: &Invoice,
        movements: &[StockMovement],
        actor: &ActorId,
    ) -> SettlementResult<InvoiceBalance> {
        let balance = persist_balance(&mut tx, issued, Utc::now().date_naive()).await?;
        activity::append(
            &mut tx,
            issued.id,
            ActivityType::Issued,
            format!("Invoice {} issued", issued.invoice_number),
            json!({
                "status": balance.status,
                "total_amount": issued.total_amount,
                "stock_movements": movements,
            }),
            actor,
        )
        .await?;
        tx.commit().await?;
        Ok(balance)
    }

    /// Draft/Issued -> Cancelled. `restore_inventory` must be chosen by the
    /// caller; it only matters when stock was deducted at issue.
    pub async fn cancel(
        &self,
        invoice_id: Uuid,
        restore_inventory: bool,
        actor: &ActorId,
    ) -> SettlementResult<TransitionOutcome> {
        let mut tx = self.store.begin().await?;
        let invoice = tx
            .lock_invoice(invoice_id)
            .await?
            .ok_or(SettlementError::InvoiceNotFound(invoice_id))?;

        let stock_was_deducted = match invoice.status {
            InvoiceStatus::Cancelled => {
                tx.rollback().await?;
                info!("invoice {} already cancelled, nothing to do", invoice.invoice_number);
                return Ok(TransitionOutcome {
                    invoice_id,
                    status: InvoiceStatus::Cancelled,
                    already_applied: true,
                    stock_movements: Vec::new(),
                });
            }
            InvoiceStatus::PartiallyPaid | InvoiceStatus::Paid => {
                return Err(SettlementError::InvalidTransition {
                    invoice_id,
                    status: invoice.status,
                    action: "cancel",
                });
            }
            InvoiceStatus::Draft => false,
            InvoiceStatus::Issued | InvoiceStatus::Overdue => true,
        };

        let lines = tx.invoice_lines(invoice_id).await?;
        let movements = if stock_was_deducted {
            self.inventory
                .on_cancel(invoice_id, &lines, restore_inventory)
                .await?
        } else {
            Vec::new()
        };

        let cancelled = Invoice {
            status: InvoiceStatus::Cancelled,
            ..invoice
        };
        match self
            .finish_cancel(tx, &cancelled, restore_inventory, &movements, actor)
            .await
        {
            Ok(()) => {
                info!(
                    "invoice {} cancelled (restore_inventory={})",
                    cancelled.invoice_number, restore_inventory
                );
                Ok(TransitionOutcome {
                    invoice_id,
                    status: InvoiceStatus::Cancelled,
                    already_applied: false,
                    stock_movements: movements,
                })
            }
            Err(err) => {
                warn!(
                    "cancelling invoice {} failed after restocking, reverting: {}",
                    cancelled.invoice_number, err
                );
                self.inventory.revert(&movements).await;
                Err(err)
            }
        }
    }

    async fn finish_cancel(
        &self,
        mut tx: S::Tx,
        cancelled: &Invoice,
        restore_inventory: bool,
        movements: &[StockMovement],
        actor: &ActorId,
    ) -> SettlementResult<()> {
        persist_balance(&mut tx, cancelled, Utc::now().date_naive()).await?;
        activity::append(
            &mut tx,
            cancelled.id,
            ActivityType::Cancelled,
            format!("Invoice {} cancelled", cancelled.invoice_number),
            json!({
                "restore_inventory": restore_inventory,
                "stock_movements": movements,
            }),
            actor,
        )
        .await?;
        tx.commit().await
    }

    /// Open invoices of a client with something left to pay, for allocation
    /// screens. Read-only; statuses are derived as of `today`.
    pub async fn pending_invoices(
        &self,
        client_id: Uuid,
        today: NaiveDate,
    ) -> SettlementResult<Vec<PendingInvoice>> {
        let mut tx = self.store.begin().await?;
        let invoices = tx.client_invoices(client_id).await?;

        let mut pending = Vec::new();
        for invoice in invoices.into_iter().filter(|invoice| invoice.status.is_issued()) {
            let allocations = tx.invoice_allocations(invoice.id).await?;
            let balance = match checked_balance(&invoice, &allocations, today) {
                Ok(balance) => balance,
                Err(SettlementError::ConsistencyViolation(_)) => {
                    error!(
                        "showing clamped balance for inconsistent invoice {}",
                        invoice.invoice_number
                    );
                    display_balance(&invoice, &allocations, today)?
                }
                Err(err) => return Err(err),
            };
            if balance.pending_amount > Decimal::ZERO {
                pending.push(PendingInvoice {
                    invoice_id: invoice.id,
                    invoice_number: invoice.invoice_number,
                    total_amount: invoice.total_amount,
                    pending_amount: balance.pending_amount,
                    due_date: invoice.due_date,
                    status: balance.status,
                });
            }
        }
        tx.rollback().await?;

        Ok(pending)
    }

    /// Re-derives one invoice as of `today`, persisting and logging only when
    /// something changed.
    pub async fn recompute(
        &self,
        invoice_id: Uuid,
        today: NaiveDate,
        actor: &ActorId,
    ) -> SettlementResult<RecomputeOutcome> {
        let mut tx = self.store.begin().await?;
        let invoice = tx
            .lock_invoice(invoice_id)
            .await?
            .ok_or(SettlementError::InvoiceNotFound(invoice_id))?;
        let allocations = tx.invoice_allocations(invoice_id).await?;
        let balance = checked_balance(&invoice, &allocations, today)?;

        let changed = balance.status != invoice.status
            || balance.paid_amount != invoice.paid_amount
            || balance.pending_amount != invoice.pending_amount;
        if !changed {
            tx.rollback().await?;
            return Ok(RecomputeOutcome {
                settlement: settlement_view(&invoice, balance),
                changed,
            });
        }

        tx.update_invoice_settlement(
            invoice_id,
            InvoiceSettlement {
                status: balance.status,
                paid_amount: balance.paid_amount,
                pending_amount: balance.pending_amount,
                updated_at: Utc::now(),
            },
        )
        .await?;
        activity::append(
            &mut tx,
            invoice_id,
            ActivityType::StatusChanged,
            format!(
                "Invoice {} moved from {} to {}",
                invoice.invoice_number, invoice.status, balance.status
            ),
            json!({
                "previous_status": invoice.status,
                "status": balance.status,
                "pending_amount": balance.pending_amount,
                "as_of": today,
            }),
            actor,
        )
        .await?;
        tx.commit().await?;

        Ok(RecomputeOutcome {
            settlement: settlement_view(&invoice, balance),
            changed,
        })
    }

    /// Recomputes every issued invoice past its due date, one short
    /// transaction each. Returns the invoices whose status changed.
    pub async fn sweep_overdue(&self, today: NaiveDate, actor: &ActorId) -> SettlementResult<Vec<Uuid>> {
        let candidates = {
            let mut tx = self.store.begin().await?;
            let ids = tx.invoices_due_before(today).await?;
            tx.rollback().await?;
            ids
        };

        let mut changed = Vec::new();
        for invoice_id in candidates {
            match self.recompute(invoice_id, today, actor).await {
                Ok(outcome) if outcome.changed => changed.push(invoice_id),
                Ok(_) => {}
                Err(err) if err.is_retryable() => {
                    warn!("overdue sweep skipped invoice {}: {}", invoice_id, err);
                }
                Err(err) => return Err(err),
            }
        }

        if !changed.is_empty() {
            info!("overdue sweep updated {} invoice(s)", changed.len());
        }
        Ok(changed)
    }

    pub async fn invoice_activity(&self, invoice_id: Uuid) -> SettlementResult<Vec<ActivityLogEntry>> {
        let mut tx = self.store.begin().await?;
        let entries = tx.invoice_activity(invoice_id).await?;
        tx.rollback().await?;
        Ok(entries)
    }
}
