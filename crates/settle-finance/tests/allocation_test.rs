//! Allocation scenarios against the in-memory ledger.

mod common;

use std::sync::Arc;

use common::{TestLedger, dec, today};
use settle_core::{
    ActivityType, CapacityTarget, ErrorKind, InvoiceStatus, LedgerStore, LedgerTx,
    SettlementError,
};
use settle_finance::AllocationRequest;

fn request(invoice_id: uuid::Uuid, amount: &str) -> AllocationRequest {
    AllocationRequest {
        invoice_id,
        amount: dec(amount),
    }
}

#[tokio::test]
async fn full_payment_settles_invoice() {
    let ledger = TestLedger::new();
    let invoice = ledger.issued_invoice("1000.00", None).await;
    let payment = ledger.payment("1000.00").await;

    let report = ledger
        .settlement
        .allocations
        .allocate(payment.payment_id, &[request(invoice.id, "1000.00")], &ledger.actor)
        .await
        .unwrap();

    assert_eq!(report.invoices.len(), 1);
    assert_eq!(report.invoices[0].status, InvoiceStatus::Paid);
    assert_eq!(report.invoices[0].pending_amount, dec("0.00"));
    assert_eq!(report.unallocated_amount, dec("0.00"));

    let summary = ledger.settlement.invoices.get_invoice(invoice.id, today()).await.unwrap();
    assert_eq!(summary.invoice.status, InvoiceStatus::Paid);
    assert_eq!(summary.invoice.pending_amount, dec("0.00"));
}

#[tokio::test]
async fn two_payments_settle_in_steps() {
    let ledger = TestLedger::new();
    let invoice = ledger.issued_invoice("1000.00", None).await;

    let first = ledger.payment("400.00").await;
    let report = ledger
        .settlement
        .allocations
        .allocate(first.payment_id, &[request(invoice.id, "400.00")], &ledger.actor)
        .await
        .unwrap();
    assert_eq!(report.invoices[0].status, InvoiceStatus::PartiallyPaid);
    assert_eq!(report.invoices[0].pending_amount, dec("600.00"));

    let second = ledger.payment("600.00").await;
    let report = ledger
        .settlement
        .allocations
        .allocate(second.payment_id, &[request(invoice.id, "600.00")], &ledger.actor)
        .await
        .unwrap();
    assert_eq!(report.invoices[0].status, InvoiceStatus::Paid);
    assert_eq!(report.invoices[0].pending_amount, dec("0.00"));
}

#[tokio::test]
async fn allocation_beyond_payment_is_rejected_without_changes() {
    let ledger = TestLedger::new();
    let invoice = ledger.issued_invoice("1000.00", None).await;
    let payment = ledger.payment("600.00").await;

    let err = ledger
        .settlement
        .allocations
        .allocate(payment.payment_id, &[request(invoice.id, "700.00")], &ledger.actor)
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::CapacityExceeded);
    assert!(matches!(
        err,
        SettlementError::AllocationExceedsCapacity {
            target: CapacityTarget::Payment(_),
            ..
        }
    ));

    let summary = ledger.settlement.invoices.get_invoice(invoice.id, today()).await.unwrap();
    assert_eq!(summary.invoice.status, InvoiceStatus::Issued);
    assert_eq!(summary.invoice.pending_amount, dec("1000.00"));
    let payment = ledger.settlement.payments.get_payment(payment.payment_id).await.unwrap();
    assert_eq!(payment.unallocated_amount, dec("600.00"));
}

#[tokio::test]
async fn failing_pair_discards_the_whole_batch() {
    let ledger = TestLedger::new();
    let a = ledger.issued_invoice("100.00", None).await;
    let b = ledger.issued_invoice("100.00", None).await;
    let c = ledger.issued_invoice("100.00", None).await;
    let payment = ledger.payment("1000.00").await;

    let err = ledger
        .settlement
        .allocations
        .allocate(
            payment.payment_id,
            &[
                request(a.id, "100.00"),
                request(b.id, "50.00"),
                request(c.id, "150.00"),
            ],
            &ledger.actor,
        )
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        SettlementError::AllocationExceedsCapacity {
            target: CapacityTarget::Invoice(id),
            ..
        } if id == c.id
    ));

    let mut tx = ledger.store.begin().await.unwrap();
    assert!(tx.payment_allocations(payment.payment_id).await.unwrap().is_empty());
    for invoice in [&a, &b, &c] {
        assert!(tx.invoice_allocations(invoice.id).await.unwrap().is_empty());
        let stored = tx.lock_invoice(invoice.id).await.unwrap().unwrap();
        assert_eq!(stored.status, InvoiceStatus::Issued);
        assert!(
            tx.invoice_activity(invoice.id)
                .await
                .unwrap()
                .iter()
                .all(|entry| entry.activity_type != ActivityType::Allocated)
        );
    }
}

#[tokio::test]
async fn duplicate_invoice_in_batch_uses_running_remainder() {
    let ledger = TestLedger::new();
    let invoice = ledger.issued_invoice("500.00", None).await;
    let payment = ledger.payment("800.00").await;

    let err = ledger
        .settlement
        .allocations
        .allocate(
            payment.payment_id,
            &[request(invoice.id, "300.00"), request(invoice.id, "300.00")],
            &ledger.actor,
        )
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::CapacityExceeded);

    let report = ledger
        .settlement
        .allocations
        .allocate(
            payment.payment_id,
            &[request(invoice.id, "300.00"), request(invoice.id, "200.00")],
            &ledger.actor,
        )
        .await
        .unwrap();
    assert_eq!(report.allocation_ids.len(), 2);
    assert_eq!(report.invoices.len(), 1);
    assert_eq!(report.invoices[0].status, InvoiceStatus::Paid);
    assert_eq!(report.unallocated_amount, dec("300.00"));
}

#[tokio::test]
async fn one_payment_spread_over_several_invoices() {
    let ledger = TestLedger::new();
    let a = ledger.issued_invoice("250.00", None).await;
    let b = ledger.issued_invoice("750.00", None).await;
    let payment = ledger.payment("600.00").await;

    let report = ledger
        .settlement
        .allocations
        .allocate(
            payment.payment_id,
            &[request(b.id, "350.00"), request(a.id, "250.00")],
            &ledger.actor,
        )
        .await
        .unwrap();

    let status_of = |id| {
        report
            .invoices
            .iter()
            .find(|view| view.invoice_id == id)
            .map(|view| (view.status, view.pending_amount))
            .unwrap()
    };
    assert_eq!(status_of(a.id), (InvoiceStatus::Paid, dec("0.00")));
    assert_eq!(status_of(b.id), (InvoiceStatus::PartiallyPaid, dec("400.00")));
    assert_eq!(report.unallocated_amount, dec("0.00"));

    let entries = ledger.settlement.invoices.invoice_activity(b.id).await.unwrap();
    let allocated: Vec<_> = entries
        .iter()
        .filter(|entry| entry.activity_type == ActivityType::Allocated)
        .collect();
    assert_eq!(allocated.len(), 1);
    assert_eq!(allocated[0].actor, ledger.actor);
}

#[tokio::test]
async fn cancelled_and_draft_invoices_refuse_allocations() {
    let ledger = TestLedger::new();
    let cancelled = ledger.issued_invoice("100.00", None).await;
    ledger
        .settlement
        .invoices
        .cancel(cancelled.id, false, &ledger.actor)
        .await
        .unwrap();
    let draft = ledger.draft(ledger.service_invoice("100.00", None)).await;
    let payment = ledger.payment("500.00").await;

    let err = ledger
        .settlement
        .allocations
        .allocate(payment.payment_id, &[request(cancelled.id, "10.00")], &ledger.actor)
        .await
        .unwrap_err();
    assert!(matches!(err, SettlementError::InvoiceCancelled(id) if id == cancelled.id));
    assert_eq!(err.kind(), ErrorKind::InvalidStateTransition);

    let err = ledger
        .settlement
        .allocations
        .allocate(payment.payment_id, &[request(draft.id, "10.00")], &ledger.actor)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidStateTransition);
}

#[tokio::test]
async fn overdue_invoices_still_accept_allocations() {
    let ledger = TestLedger::new();
    let invoice = ledger
        .issued_invoice("500.00", Some(today() - chrono::Duration::days(1)))
        .await;
    let payment = ledger.payment("200.00").await;

    let report = ledger
        .settlement
        .allocations
        .allocate(payment.payment_id, &[request(invoice.id, "200.00")], &ledger.actor)
        .await
        .unwrap();
    assert_eq!(report.invoices[0].status, InvoiceStatus::PartiallyPaid);
    assert_eq!(report.invoices[0].pending_amount, dec("300.00"));
}

#[tokio::test]
async fn precondition_failures_are_reported_by_kind() {
    let ledger = TestLedger::new();
    let invoice = ledger.issued_invoice("100.00", None).await;
    let payment = ledger.payment("100.00").await;
    let allocations = &ledger.settlement.allocations;

    let err = allocations
        .allocate(uuid::Uuid::new_v4(), &[request(invoice.id, "10.00")], &ledger.actor)
        .await
        .unwrap_err();
    assert!(matches!(err, SettlementError::PaymentNotFound(_)));

    let err = allocations
        .allocate(payment.payment_id, &[request(uuid::Uuid::new_v4(), "10.00")], &ledger.actor)
        .await
        .unwrap_err();
    assert!(matches!(err, SettlementError::InvoiceNotFound(_)));

    let err = allocations
        .allocate(payment.payment_id, &[request(invoice.id, "0.00")], &ledger.actor)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidInput);

    let err = allocations
        .allocate(payment.payment_id, &[request(invoice.id, "10.001")], &ledger.actor)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidInput);

    let err = allocations
        .allocate(payment.payment_id, &[], &ledger.actor)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidInput);
}

#[tokio::test]
async fn invoices_of_another_client_are_rejected() {
    let ledger = TestLedger::new();
    let mut other_client = ledger.service_invoice("100.00", None);
    other_client.client_id = uuid::Uuid::new_v4();
    let foreign = ledger.draft(other_client).await;
    ledger
        .settlement
        .invoices
        .issue(foreign.id, &ledger.actor)
        .await
        .unwrap();
    let payment = ledger.payment("100.00").await;

    let err = ledger
        .settlement
        .allocations
        .allocate(payment.payment_id, &[request(foreign.id, "100.00")], &ledger.actor)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidInput);
}

#[tokio::test]
async fn removing_an_allocation_reopens_the_invoice() {
    let ledger = TestLedger::new();
    let invoice = ledger.issued_invoice("300.00", None).await;
    let payment = ledger.payment("300.00").await;
    let report = ledger
        .settlement
        .allocations
        .allocate(payment.payment_id, &[request(invoice.id, "300.00")], &ledger.actor)
        .await
        .unwrap();

    let view = ledger
        .settlement
        .allocations
        .remove_allocation(report.allocation_ids[0], &ledger.actor)
        .await
        .unwrap();
    assert_eq!(view.status, InvoiceStatus::Issued);
    assert_eq!(view.pending_amount, dec("300.00"));

    let err = ledger
        .settlement
        .allocations
        .remove_allocation(report.allocation_ids[0], &ledger.actor)
        .await
        .unwrap_err();
    assert!(matches!(err, SettlementError::AllocationNotFound(_)));

    let entries = ledger.settlement.invoices.invoice_activity(invoice.id).await.unwrap();
    assert!(entries.iter().any(|entry| entry.activity_type == ActivityType::Deallocated));

    // the freed capacity can be allocated again
    let again = ledger
        .settlement
        .allocations
        .allocate(payment.payment_id, &[request(invoice.id, "300.00")], &ledger.actor)
        .await
        .unwrap();
    assert_eq!(again.invoices[0].status, InvoiceStatus::Paid);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_allocations_never_overdraw_an_invoice() {
    let ledger = Arc::new(TestLedger::new());
    let invoice = ledger.issued_invoice("1000.00", None).await;

    let mut payments = Vec::new();
    for _ in 0..8 {
        payments.push(ledger.payment("300.00").await);
    }

    let mut handles = Vec::new();
    for payment in payments {
        let ledger = Arc::clone(&ledger);
        let invoice_id = invoice.id;
        handles.push(tokio::spawn(async move {
            ledger
                .settlement
                .allocations
                .allocate(payment.payment_id, &[request(invoice_id, "300.00")], &ledger.actor)
                .await
        }));
    }

    let mut succeeded = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => succeeded += 1,
            Err(err) => assert_eq!(err.kind(), ErrorKind::CapacityExceeded),
        }
    }
    assert_eq!(succeeded, 3);

    let summary = ledger.settlement.invoices.get_invoice(invoice.id, today()).await.unwrap();
    assert_eq!(summary.balance.paid_amount, dec("900.00"));
    assert_eq!(summary.balance.pending_amount, dec("100.00"));
    assert_eq!(summary.invoice.status, InvoiceStatus::PartiallyPaid);
}
