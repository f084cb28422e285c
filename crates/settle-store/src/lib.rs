use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use chrono::NaiveDate;
use settle_core::{
    ActivityLogEntry, Allocation, DocumentKind, Invoice, InvoiceLine, InvoiceSettlement,
    InvoiceStatus, LedgerStore, LedgerTx, Payment, SettlementError, SettlementResult,
};
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Default)]
struct LedgerState {
    invoices: BTreeMap<Uuid, Invoice>,
    invoice_lines: HashMap<Uuid, Vec<InvoiceLine>>,
    payments: BTreeMap<Uuid, Payment>,
    allocations: Vec<Allocation>,
    activity: Vec<ActivityLogEntry>,
    invoice_sequence: i64,
    payment_sequence: i64,
}

/// In-process ledger. A transaction holds the whole ledger exclusively and
/// works on a private copy that replaces the shared state on commit, which is
/// stricter than the row locks the Postgres store takes.
#[derive(Clone)]
pub struct InMemoryLedgerStore {
    state: Arc<Mutex<LedgerState>>,
    lock_timeout: Duration,
}

impl Default for InMemoryLedgerStore {
    fn default() -> Self {
        Self::with_lock_timeout(DEFAULT_LOCK_TIMEOUT)
    }
}

impl InMemoryLedgerStore {
    pub fn with_lock_timeout(lock_timeout: Duration) -> Self {
        Self {
            state: Arc::new(Mutex::new(LedgerState::default())),
            lock_timeout,
        }
    }
}

pub struct InMemoryLedgerTx {
    guard: OwnedMutexGuard<LedgerState>,
    working: LedgerState,
}

#[async_trait]
impl LedgerStore for InMemoryLedgerStore {
    type Tx = InMemoryLedgerTx;

    async fn begin(&self) -> SettlementResult<Self::Tx> {
        let guard = tokio::time::timeout(self.lock_timeout, self.state.clone().lock_owned())
            .await
            .map_err(|_| {
                SettlementError::StorageConflict(format!(
                    "ledger lock not acquired within {}ms",
                    self.lock_timeout.as_millis()
                ))
            })?;
        let working = guard.clone();

        Ok(InMemoryLedgerTx { guard, working })
    }
}

impl InMemoryLedgerTx {
    fn missing(what: &str, id: Uuid) -> SettlementError {
        SettlementError::Storage(anyhow::anyhow!("{what} {id} does not exist"))
    }
}

#[async_trait]
impl LedgerTx for InMemoryLedgerTx {
    async fn next_document_number(&mut self, kind: DocumentKind) -> SettlementResult<String> {
        let sequence = match kind {
            DocumentKind::Invoice => &mut self.working.invoice_sequence,
            DocumentKind::Payment => &mut self.working.payment_sequence,
        };
        *sequence += 1;
        Ok(kind.format_number(*sequence))
    }

    async fn insert_invoice(&mut self, invoice: &Invoice, lines: &[InvoiceLine]) -> SettlementResult<()> {
        if self
            .working
            .invoices
            .values()
            .any(|existing| existing.invoice_number == invoice.invoice_number)
        {
            return Err(SettlementError::invalid_input(format!(
                "invoice number {} already exists",
                invoice.invoice_number
            )));
        }
        self.working.invoices.insert(invoice.id, invoice.clone());
        self.working.invoice_lines.insert(invoice.id, lines.to_vec());
        Ok(())
    }

    async fn lock_invoice(&mut self, invoice_id: Uuid) -> SettlementResult<Option<Invoice>> {
        Ok(self.working.invoices.get(&invoice_id).cloned())
    }

    async fn find_invoice(&mut self, invoice_id: Uuid) -> SettlementResult<Option<Invoice>> {
        Ok(self.working.invoices.get(&invoice_id).cloned())
    }

    async fn invoice_lines(&mut self, invoice_id: Uuid) -> SettlementResult<Vec<InvoiceLine>> {
        let mut lines = self
            .working
            .invoice_lines
            .get(&invoice_id)
            .cloned()
            .unwrap_or_default();
        lines.sort_by_key(|line| line.line_no);
        Ok(lines)
    }

    async fn update_invoice_settlement(
        &mut self,
        invoice_id: Uuid,
        settlement: InvoiceSettlement,
    ) -> SettlementResult<()> {
        let invoice = self
            .working
            .invoices
            .get_mut(&invoice_id)
            .ok_or_else(|| Self::missing("invoice", invoice_id))?;
        invoice.status = settlement.status;
        invoice.paid_amount = settlement.paid_amount;
        invoice.pending_amount = settlement.pending_amount;
        invoice.updated_at = settlement.updated_at;
        Ok(())
    }

    async fn client_invoices(&mut self, client_id: Uuid) -> SettlementResult<Vec<Invoice>> {
        let mut invoices: Vec<Invoice> = self
            .working
            .invoices
            .values()
            .filter(|invoice| invoice.client_id == client_id)
            .cloned()
            .collect();
        invoices.sort_by(|a, b| a.issue_date.cmp(&b.issue_date).then(a.invoice_number.cmp(&b.invoice_number)));
        Ok(invoices)
    }

    async fn invoices_due_before(&mut self, today: NaiveDate) -> SettlementResult<Vec<Uuid>> {
        Ok(self
            .working
            .invoices
            .values()
            .filter(|invoice| {
                matches!(
                    invoice.status,
                    InvoiceStatus::Issued | InvoiceStatus::PartiallyPaid | InvoiceStatus::Overdue
                )
            })
            .filter(|invoice| invoice.due_date.is_some_and(|due| due < today))
            .map(|invoice| invoice.id)
            .collect())
    }

    async fn insert_payment(&mut self, payment: &Payment) -> SettlementResult<()> {
        self.working.payments.insert(payment.id, payment.clone());
        Ok(())
    }

    async fn lock_payment(&mut self, payment_id: Uuid) -> SettlementResult<Option<Payment>> {
        Ok(self.working.payments.get(&payment_id).cloned())
    }

    async fn find_payment(&mut self, payment_id: Uuid) -> SettlementResult<Option<Payment>> {
        Ok(self.working.payments.get(&payment_id).cloned())
    }

    async fn update_payment(&mut self, payment: &Payment) -> SettlementResult<()> {
        let existing = self
            .working
            .payments
            .get_mut(&payment.id)
            .ok_or_else(|| Self::missing("payment", payment.id))?;
        *existing = payment.clone();
        Ok(())
    }

    async fn delete_payment(&mut self, payment_id: Uuid) -> SettlementResult<()> {
        self.working
            .payments
            .remove(&payment_id)
            .ok_or_else(|| Self::missing("payment", payment_id))?;
        Ok(())
    }

    async fn insert_allocation(&mut self, allocation: &Allocation) -> SettlementResult<()> {
        if !self.working.payments.contains_key(&allocation.payment_id) {
            return Err(Self::missing("payment", allocation.payment_id));
        }
        if !self.working.invoices.contains_key(&allocation.invoice_id) {
            return Err(Self::missing("invoice", allocation.invoice_id));
        }
        self.working.allocations.push(allocation.clone());
        Ok(())
    }

    async fn find_allocation(&mut self, allocation_id: Uuid) -> SettlementResult<Option<Allocation>> {
        Ok(self
            .working
            .allocations
            .iter()
            .find(|allocation| allocation.id == allocation_id)
            .cloned())
    }

    async fn delete_allocation(&mut self, allocation_id: Uuid) -> SettlementResult<()> {
        let before = self.working.allocations.len();
        self.working
            .allocations
            .retain(|allocation| allocation.id != allocation_id);
        if self.working.allocations.len() == before {
            return Err(Self::missing("allocation", allocation_id));
        }
        Ok(())
    }

    async fn invoice_allocations(&mut self, invoice_id: Uuid) -> SettlementResult<Vec<Allocation>> {
        Ok(self
            .working
            .allocations
            .iter()
            .filter(|allocation| allocation.invoice_id == invoice_id)
            .cloned()
            .collect())
    }

    async fn payment_allocations(&mut self, payment_id: Uuid) -> SettlementResult<Vec<Allocation>> {
        Ok(self
            .working
            .allocations
            .iter()
            .filter(|allocation| allocation.payment_id == payment_id)
            .cloned()
            .collect())
    }

    async fn append_activity(&mut self, entry: &ActivityLogEntry) -> SettlementResult<()> {
        self.working.activity.push(entry.clone());
        Ok(())
    }

    async fn invoice_activity(&mut self, invoice_id: Uuid) -> SettlementResult<Vec<ActivityLogEntry>> {
        Ok(self
            .working
            .activity
            .iter()
            .filter(|entry| entry.invoice_id == Some(invoice_id))
            .cloned()
            .collect())
    }

    async fn commit(self) -> SettlementResult<()> {
        let InMemoryLedgerTx { mut guard, working } = self;
        *guard = working;
        Ok(())
    }

    async fn rollback(self) -> SettlementResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use rust_decimal::Decimal;
    use chrono::TimeDelta;
    use settle_core::{
        ActivityType, ActorId, ItemType, NewInvoice, NewInvoiceLine, NewPayment, PaymentMode,
    };

    fn payment(amount: i64) -> Payment {
        let input = NewPayment {
            client_id: Uuid::new_v4(),
            project_id: None,
            payment_date: Utc::now().date_naive(),
            mode: PaymentMode::Cash,
            reference_no: None,
            amount_received: Decimal::new(amount, 0),
            remarks: None,
            attachment_ref: None,
        };
        Payment::record(input, "PAY-000001".to_string(), &ActorId::parse("tester").unwrap(), Utc::now())
            .unwrap()
    }

    fn invoice(status: InvoiceStatus, due: NaiveDate) -> (Invoice, Vec<InvoiceLine>) {
        let input = NewInvoice {
            client_id: Uuid::new_v4(),
            project_id: None,
            issue_date: due - TimeDelta::days(30),
            due_date: Some(due),
            currency: "INR".to_string(),
            payment_terms: None,
            round_off: Decimal::ZERO,
            attachment_ref: None,
            lines: vec![NewInvoiceLine {
                item_id: None,
                item_type: ItemType::Service,
                description: "Consulting".to_string(),
                quantity: Decimal::ONE,
                unit_price: Decimal::new(10000, 2),
                discount_amount: Decimal::ZERO,
                tax_rate: Decimal::ZERO,
            }],
        };
        let number = format!("INV-{}", Uuid::new_v4().simple());
        let (mut invoice, lines) =
            Invoice::draft(input, number, &ActorId::parse("tester").unwrap(), Utc::now()).unwrap();
        invoice.status = status;
        (invoice, lines)
    }

    #[tokio::test]
    async fn due_candidates_exclude_paid_and_closed_invoices() {
        let store = InMemoryLedgerStore::default();
        let due = NaiveDate::from_ymd_opt(2026, 3, 1).unwrap();
        let statuses = [
            InvoiceStatus::Draft,
            InvoiceStatus::Issued,
            InvoiceStatus::PartiallyPaid,
            InvoiceStatus::Paid,
            InvoiceStatus::Overdue,
            InvoiceStatus::Cancelled,
        ];

        let mut tx = store.begin().await.unwrap();
        let mut ids = HashMap::new();
        for status in statuses {
            let (invoice, lines) = invoice(status, due);
            tx.insert_invoice(&invoice, &lines).await.unwrap();
            ids.insert(status, invoice.id);
        }
        let (not_yet_due, lines) = invoice(InvoiceStatus::Issued, due + TimeDelta::days(10));
        tx.insert_invoice(&not_yet_due, &lines).await.unwrap();

        let candidates = tx.invoices_due_before(due + TimeDelta::days(1)).await.unwrap();
        let mut expected = vec![
            ids[&InvoiceStatus::Issued],
            ids[&InvoiceStatus::PartiallyPaid],
            ids[&InvoiceStatus::Overdue],
        ];
        expected.sort();
        assert_eq!(candidates, expected);
    }

    #[tokio::test]
    async fn find_reads_see_committed_rows() {
        let store = InMemoryLedgerStore::default();
        let recorded = payment(250);
        let (drafted, lines) = invoice(InvoiceStatus::Draft, NaiveDate::from_ymd_opt(2026, 3, 1).unwrap());

        let mut tx = store.begin().await.unwrap();
        assert!(tx.find_payment(recorded.id).await.unwrap().is_none());
        tx.insert_payment(&recorded).await.unwrap();
        tx.insert_invoice(&drafted, &lines).await.unwrap();
        tx.commit().await.unwrap();

        let mut tx = store.begin().await.unwrap();
        let found = tx.find_payment(recorded.id).await.unwrap().unwrap();
        assert_eq!(found.amount_received, recorded.amount_received);
        let found = tx.find_invoice(drafted.id).await.unwrap().unwrap();
        assert_eq!(found.invoice_number, drafted.invoice_number);
        assert!(tx.find_invoice(Uuid::new_v4()).await.unwrap().is_none());
        tx.rollback().await.unwrap();
    }

    #[tokio::test]
    async fn uncommitted_writes_are_discarded() {
        let store = InMemoryLedgerStore::default();
        let recorded = payment(100);

        let mut tx = store.begin().await.unwrap();
        tx.insert_payment(&recorded).await.unwrap();
        tx.rollback().await.unwrap();

        let mut tx = store.begin().await.unwrap();
        assert!(tx.lock_payment(recorded.id).await.unwrap().is_none());

        tx.insert_payment(&recorded).await.unwrap();
        tx.append_activity(&ActivityLogEntry {
            id: Uuid::new_v4(),
            invoice_id: None,
            payment_id: Some(recorded.id),
            activity_type: ActivityType::Created,
            description: "payment recorded".to_string(),
            details: serde_json::Value::Null,
            actor: recorded.created_by.clone(),
            occurred_at: Utc::now(),
        })
        .await
        .unwrap();
        tx.commit().await.unwrap();

        let mut tx = store.begin().await.unwrap();
        assert!(tx.lock_payment(recorded.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn second_transaction_times_out_as_conflict() {
        let store = InMemoryLedgerStore::with_lock_timeout(Duration::from_millis(20));
        let _held = store.begin().await.unwrap();

        let err = match store.begin().await {
            Ok(_) => panic!("second transaction should not acquire the ledger"),
            Err(err) => err,
        };
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn document_numbers_are_sequential_per_kind() {
        let store = InMemoryLedgerStore::default();
        let mut tx = store.begin().await.unwrap();

        assert_eq!(tx.next_document_number(DocumentKind::Payment).await.unwrap(), "PAY-000001");
        assert_eq!(tx.next_document_number(DocumentKind::Payment).await.unwrap(), "PAY-000002");
        assert_eq!(tx.next_document_number(DocumentKind::Invoice).await.unwrap(), "INV-000001");
    }
}
