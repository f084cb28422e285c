use std::sync::Arc;

use chrono::Utc;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::json;
use settle_core::{
    ActivityType, ActorId, CapacityTarget, DocumentKind, LedgerStore, LedgerTx, NewPayment,
    Payment, PaymentPatch, SettlementError, SettlementResult, round_money,
};
use tracing::{info, warn};
use uuid::Uuid;

use crate::activity;
use crate::allocation::{AllocationReport, AllocationRequest, AllocationService, unallocated_amount};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentReceipt {
    pub payment_id: Uuid,
    pub payment_number: String,
    pub amount_received: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentSummary {
    pub payment: Payment,
    pub allocated_amount: Decimal,
    pub unallocated_amount: Decimal,
}

/// Allocation half of a record-and-allocate call. The payment is persisted
/// regardless of which variant this is.
#[derive(Debug)]
pub enum AllocationOutcome {
    NotRequested,
    Allocated(AllocationReport),
    Failed(SettlementError),
}

#[derive(Debug)]
pub struct RecordOutcome {
    pub payment: PaymentReceipt,
    pub allocation: AllocationOutcome,
}

pub struct PaymentService<S> {
    store: Arc<S>,
    allocations: AllocationService<S>,
}

impl<S> Clone for PaymentService<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            allocations: self.allocations.clone(),
        }
    }
}

impl<S: LedgerStore> PaymentService<S> {
    pub fn new(store: Arc<S>) -> Self {
        let allocations = AllocationService::new(Arc::clone(&store));
        Self { store, allocations }
    }

    pub fn allocations(&self) -> &AllocationService<S> {
        &self.allocations
    }

    pub async fn create_payment(
        &self,
        input: NewPayment,
        actor: &ActorId,
    ) -> SettlementResult<PaymentReceipt> {
        let now = Utc::now();
        let mut tx = self.store.begin().await?;

        let payment_number = tx.next_document_number(DocumentKind::Payment).await?;
        let payment = Payment::record(input, payment_number, actor, now)?;
        tx.insert_payment(&payment).await?;

        activity::append_for_payment(
            &mut tx,
            payment.id,
            ActivityType::Created,
            format!(
                "Payment {} of {} recorded via {}",
                payment.payment_number,
                payment.amount_received,
                payment.mode.as_str()
            ),
            json!({
                "client_id": payment.client_id,
                "amount_received": payment.amount_received,
                "mode": payment.mode,
                "reference_no": payment.reference_no,
            }),
            actor,
        )
        .await?;

        tx.commit().await?;
        info!(
            "payment {} recorded for client {} ({})",
            payment.payment_number, payment.client_id, payment.amount_received
        );

        Ok(PaymentReceipt {
            payment_id: payment.id,
            payment_number: payment.payment_number,
            amount_received: payment.amount_received,
        })
    }

    /// Records a payment, then allocates it in a separate transaction. A
    /// failed allocation never rolls back the payment.
    pub async fn record_and_allocate(
        &self,
        input: NewPayment,
        requests: &[AllocationRequest],
        actor: &ActorId,
    ) -> SettlementResult<RecordOutcome> {
        let payment = self.create_payment(input, actor).await?;
        if requests.is_empty() {
            return Ok(RecordOutcome {
                payment,
                allocation: AllocationOutcome::NotRequested,
            });
        }

        let allocation = match self
            .allocations
            .allocate(payment.payment_id, requests, actor)
            .await
        {
            Ok(report) => AllocationOutcome::Allocated(report),
            Err(err) => {
                warn!(
                    "payment {} saved but allocation failed: {}",
                    payment.payment_number, err
                );
                AllocationOutcome::Failed(err)
            }
        };

        Ok(RecordOutcome { payment, allocation })
    }

    pub async fn update_payment(
        &self,
        payment_id: Uuid,
        patch: &PaymentPatch,
        actor: &ActorId,
    ) -> SettlementResult<Payment> {
        if patch.is_empty() {
            return Err(SettlementError::invalid_input("no fields to update"));
        }

        let mut tx = self.store.begin().await?;
        let current = tx
            .lock_payment(payment_id)
            .await?
            .ok_or(SettlementError::PaymentNotFound(payment_id))?;
        let next = patch.apply(&current, Utc::now())?;

        let allocated = round_money(current.amount_received - unallocated_amount(&mut tx, &current).await?);
        if allocated > Decimal::ZERO {
            if next.client_id != current.client_id {
                return Err(SettlementError::invalid_input(format!(
                    "payment {} has allocations; its client cannot change",
                    current.payment_number
                )));
            }
            if next.amount_received < allocated {
                return Err(SettlementError::AllocationExceedsCapacity {
                    target: CapacityTarget::Payment(payment_id),
                    requested: allocated,
                    remaining: next.amount_received,
                });
            }
        }

        tx.update_payment(&next).await?;
        tx.commit().await?;
        info!("payment {} updated by {}", next.payment_number, actor);

        Ok(next)
    }

    /// Only unallocated payments can be deleted, including payments whose
    /// allocations point at since-cancelled invoices.
    pub async fn delete_payment(&self, payment_id: Uuid, actor: &ActorId) -> SettlementResult<()> {
        let mut tx = self.store.begin().await?;
        let payment = tx
            .lock_payment(payment_id)
            .await?
            .ok_or(SettlementError::PaymentNotFound(payment_id))?;

        let allocated = round_money(payment.amount_received - unallocated_amount(&mut tx, &payment).await?);
        if allocated > Decimal::ZERO {
            return Err(SettlementError::PaymentHasAllocations {
                payment_id,
                allocated,
            });
        }

        tx.delete_payment(payment_id).await?;
        activity::append_for_payment(
            &mut tx,
            payment_id,
            ActivityType::Deleted,
            format!("Payment {} deleted", payment.payment_number),
            json!({
                "payment_number": payment.payment_number,
                "amount_received": payment.amount_received,
            }),
            actor,
        )
        .await?;

        tx.commit().await?;
        info!("payment {} deleted by {}", payment.payment_number, actor);
        Ok(())
    }

    pub async fn get_payment(&self, payment_id: Uuid) -> SettlementResult<PaymentSummary> {
        let mut tx = self.store.begin().await?;
        let payment = tx
            .find_payment(payment_id)
            .await?
            .ok_or(SettlementError::PaymentNotFound(payment_id))?;
        let unallocated = unallocated_amount(&mut tx, &payment).await?;
        tx.rollback().await?;

        Ok(PaymentSummary {
            allocated_amount: round_money(payment.amount_received - unallocated),
            unallocated_amount: unallocated,
            payment,
        })
    }
}
