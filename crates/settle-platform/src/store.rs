use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;
use settle_core::{
    ActivityLogEntry, ActorId, Allocation, DocumentKind, Invoice, InvoiceLine, InvoiceSettlement,
    LedgerStore, LedgerTx, Payment, SettlementError, SettlementResult,
};
use sqlx::{PgPool, Postgres, Row, Transaction, postgres::PgRow};
use uuid::Uuid;

use crate::db::db_error;

const INVOICE_COLUMNS: &str = r#"
    id, invoice_number, client_id, project_id, issue_date, due_date, currency, payment_terms,
    subtotal, discount_amount, tax_amount, round_off, total_amount, paid_amount, pending_amount,
    status, attachment_ref, created_by, created_at, updated_at
"#;

const PAYMENT_COLUMNS: &str = r#"
    id, payment_number, client_id, project_id, payment_date, mode, reference_no,
    amount_received, remarks, attachment_ref, created_by, created_at, updated_at
"#;

const ALLOCATION_COLUMNS: &str = "id, payment_id, invoice_id, amount, created_by, created_at";

/// Ledger backed by Postgres row locks. Every transaction carries a
/// `lock_timeout` so a blocked allocation fails as a retryable conflict.
#[derive(Clone)]
pub struct PgLedgerStore {
    pool: PgPool,
    lock_timeout: Duration,
}

impl PgLedgerStore {
    pub fn new(pool: PgPool, lock_timeout: Duration) -> Self {
        Self { pool, lock_timeout }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl LedgerStore for PgLedgerStore {
    type Tx = PgLedgerTx;

    async fn begin(&self) -> SettlementResult<PgLedgerTx> {
        let mut tx = self.pool.begin().await.map_err(db_error)?;
        sqlx::query("SELECT set_config('lock_timeout', $1, true)")
            .bind(format!("{}ms", self.lock_timeout.as_millis()))
            .execute(&mut *tx)
            .await
            .map_err(db_error)?;

        Ok(PgLedgerTx { tx })
    }
}

pub struct PgLedgerTx {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl LedgerTx for PgLedgerTx {
    async fn next_document_number(&mut self, kind: DocumentKind) -> SettlementResult<String> {
        let sequence = match kind {
            DocumentKind::Invoice => "invoice_number_seq",
            DocumentKind::Payment => "payment_number_seq",
        };
        let value: i64 = sqlx::query_scalar("SELECT nextval($1::regclass)")
            .bind(sequence)
            .fetch_one(&mut *self.tx)
            .await
            .map_err(db_error)?;

        Ok(kind.format_number(value))
    }

    async fn insert_invoice(&mut self, invoice: &Invoice, lines: &[InvoiceLine]) -> SettlementResult<()> {
        sqlx::query(
            r#"
            INSERT INTO invoices (
                id, invoice_number, client_id, project_id, issue_date, due_date, currency,
                payment_terms, subtotal, discount_amount, tax_amount, round_off, total_amount,
                paid_amount, pending_amount, status, attachment_ref, created_by, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19, $20)
            "#,
        )
        .bind(invoice.id)
        .bind(&invoice.invoice_number)
        .bind(invoice.client_id)
        .bind(invoice.project_id)
        .bind(invoice.issue_date)
        .bind(invoice.due_date)
        .bind(&invoice.currency)
        .bind(&invoice.payment_terms)
        .bind(invoice.subtotal)
        .bind(invoice.discount_amount)
        .bind(invoice.tax_amount)
        .bind(invoice.round_off)
        .bind(invoice.total_amount)
        .bind(invoice.paid_amount)
        .bind(invoice.pending_amount)
        .bind(invoice.status.as_str())
        .bind(&invoice.attachment_ref)
        .bind(invoice.created_by.as_str())
        .bind(invoice.created_at)
        .bind(invoice.updated_at)
        .execute(&mut *self.tx)
        .await
        .map_err(|err| unique_violation(err, || format!("invoice number {} already exists", invoice.invoice_number)))?;

        for line in lines {
            sqlx::query(
                r#"
                INSERT INTO invoice_lines (
                    id, invoice_id, line_no, item_id, item_type, description, quantity,
                    unit_price, discount_amount, tax_rate, tax_amount, line_total
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
                "#,
            )
            .bind(line.id)
            .bind(line.invoice_id)
            .bind(line.line_no)
            .bind(line.item_id)
            .bind(line.item_type.as_str())
            .bind(&line.description)
            .bind(line.quantity)
            .bind(line.unit_price)
            .bind(line.discount_amount)
            .bind(line.tax_rate)
            .bind(line.tax_amount)
            .bind(line.line_total)
            .execute(&mut *self.tx)
            .await
            .map_err(db_error)?;
        }

        Ok(())
    }

    async fn lock_invoice(&mut self, invoice_id: Uuid) -> SettlementResult<Option<Invoice>> {
        let row = sqlx::query(&format!(
            "SELECT {INVOICE_COLUMNS} FROM invoices WHERE id = $1 FOR UPDATE"
        ))
        .bind(invoice_id)
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(db_error)?;

        row.as_ref().map(invoice_from_row).transpose()
    }

    async fn find_invoice(&mut self, invoice_id: Uuid) -> SettlementResult<Option<Invoice>> {
        let row = sqlx::query(&format!("SELECT {INVOICE_COLUMNS} FROM invoices WHERE id = $1"))
            .bind(invoice_id)
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(db_error)?;

        row.as_ref().map(invoice_from_row).transpose()
    }

    async fn invoice_lines(&mut self, invoice_id: Uuid) -> SettlementResult<Vec<InvoiceLine>> {
        let rows = sqlx::query(
            r#"
            SELECT id, invoice_id, line_no, item_id, item_type, description, quantity,
                   unit_price, discount_amount, tax_rate, tax_amount, line_total
            FROM invoice_lines
            WHERE invoice_id = $1
            ORDER BY line_no
            "#,
        )
        .bind(invoice_id)
        .fetch_all(&mut *self.tx)
        .await
        .map_err(db_error)?;

        rows.iter().map(line_from_row).collect()
    }

    async fn update_invoice_settlement(
        &mut self,
        invoice_id: Uuid,
        settlement: InvoiceSettlement,
    ) -> SettlementResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE invoices
            SET status = $2, paid_amount = $3, pending_amount = $4, updated_at = $5
            WHERE id = $1
            "#,
        )
        .bind(invoice_id)
        .bind(settlement.status.as_str())
        .bind(settlement.paid_amount)
        .bind(settlement.pending_amount)
        .bind(settlement.updated_at)
        .execute(&mut *self.tx)
        .await
        .map_err(db_error)?;

        if result.rows_affected() == 0 {
            return Err(SettlementError::InvoiceNotFound(invoice_id));
        }
        Ok(())
    }

    async fn client_invoices(&mut self, client_id: Uuid) -> SettlementResult<Vec<Invoice>> {
        let rows = sqlx::query(&format!(
            "SELECT {INVOICE_COLUMNS} FROM invoices WHERE client_id = $1 ORDER BY issue_date, invoice_number"
        ))
        .bind(client_id)
        .fetch_all(&mut *self.tx)
        .await
        .map_err(db_error)?;

        rows.iter().map(invoice_from_row).collect()
    }

    async fn invoices_due_before(&mut self, today: NaiveDate) -> SettlementResult<Vec<Uuid>> {
        let ids: Vec<Uuid> = sqlx::query_scalar(
            r#"
            SELECT id
            FROM invoices
            WHERE status IN ('issued', 'partially_paid', 'overdue')
              AND due_date < $1
            ORDER BY id
            "#,
        )
        .bind(today)
        .fetch_all(&mut *self.tx)
        .await
        .map_err(db_error)?;

        Ok(ids)
    }

    async fn insert_payment(&mut self, payment: &Payment) -> SettlementResult<()> {
        sqlx::query(
            r#"
            INSERT INTO payments (
                id, payment_number, client_id, project_id, payment_date, mode, reference_no,
                amount_received, remarks, attachment_ref, created_by, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            "#,
        )
        .bind(payment.id)
        .bind(&payment.payment_number)
        .bind(payment.client_id)
        .bind(payment.project_id)
        .bind(payment.payment_date)
        .bind(payment.mode.as_str())
        .bind(&payment.reference_no)
        .bind(payment.amount_received)
        .bind(&payment.remarks)
        .bind(&payment.attachment_ref)
        .bind(payment.created_by.as_str())
        .bind(payment.created_at)
        .bind(payment.updated_at)
        .execute(&mut *self.tx)
        .await
        .map_err(|err| unique_violation(err, || format!("payment number {} already exists", payment.payment_number)))?;

        Ok(())
    }

    async fn lock_payment(&mut self, payment_id: Uuid) -> SettlementResult<Option<Payment>> {
        let row = sqlx::query(&format!(
            "SELECT {PAYMENT_COLUMNS} FROM payments WHERE id = $1 FOR UPDATE"
        ))
        .bind(payment_id)
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(db_error)?;

        row.as_ref().map(payment_from_row).transpose()
    }

    async fn find_payment(&mut self, payment_id: Uuid) -> SettlementResult<Option<Payment>> {
        let row = sqlx::query(&format!("SELECT {PAYMENT_COLUMNS} FROM payments WHERE id = $1"))
            .bind(payment_id)
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(db_error)?;

        row.as_ref().map(payment_from_row).transpose()
    }

    async fn update_payment(&mut self, payment: &Payment) -> SettlementResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE payments
            SET client_id = $2, project_id = $3, payment_date = $4, mode = $5, reference_no = $6,
                amount_received = $7, remarks = $8, attachment_ref = $9, updated_at = $10
            WHERE id = $1
            "#,
        )
        .bind(payment.id)
        .bind(payment.client_id)
        .bind(payment.project_id)
        .bind(payment.payment_date)
        .bind(payment.mode.as_str())
        .bind(&payment.reference_no)
        .bind(payment.amount_received)
        .bind(&payment.remarks)
        .bind(&payment.attachment_ref)
        .bind(payment.updated_at)
        .execute(&mut *self.tx)
        .await
        .map_err(db_error)?;

        if result.rows_affected() == 0 {
            return Err(SettlementError::PaymentNotFound(payment.id));
        }
        Ok(())
    }

    async fn delete_payment(&mut self, payment_id: Uuid) -> SettlementResult<()> {
        let result = sqlx::query("DELETE FROM payments WHERE id = $1")
            .bind(payment_id)
            .execute(&mut *self.tx)
            .await
            .map_err(db_error)?;

        if result.rows_affected() == 0 {
            return Err(SettlementError::PaymentNotFound(payment_id));
        }
        Ok(())
    }

    async fn insert_allocation(&mut self, allocation: &Allocation) -> SettlementResult<()> {
        sqlx::query(
            r#"
            INSERT INTO payment_invoice_allocations (id, payment_id, invoice_id, amount, created_by, created_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(allocation.id)
        .bind(allocation.payment_id)
        .bind(allocation.invoice_id)
        .bind(allocation.amount)
        .bind(allocation.created_by.as_str())
        .bind(allocation.created_at)
        .execute(&mut *self.tx)
        .await
        .map_err(db_error)?;

        Ok(())
    }

    async fn find_allocation(&mut self, allocation_id: Uuid) -> SettlementResult<Option<Allocation>> {
        let row = sqlx::query(&format!(
            "SELECT {ALLOCATION_COLUMNS} FROM payment_invoice_allocations WHERE id = $1"
        ))
        .bind(allocation_id)
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(db_error)?;

        row.as_ref().map(allocation_from_row).transpose()
    }

    async fn delete_allocation(&mut self, allocation_id: Uuid) -> SettlementResult<()> {
        let result = sqlx::query("DELETE FROM payment_invoice_allocations WHERE id = $1")
            .bind(allocation_id)
            .execute(&mut *self.tx)
            .await
            .map_err(db_error)?;

        if result.rows_affected() == 0 {
            return Err(SettlementError::AllocationNotFound(allocation_id));
        }
        Ok(())
    }

    async fn invoice_allocations(&mut self, invoice_id: Uuid) -> SettlementResult<Vec<Allocation>> {
        let rows = sqlx::query(&format!(
            "SELECT {ALLOCATION_COLUMNS} FROM payment_invoice_allocations WHERE invoice_id = $1 ORDER BY created_at, id"
        ))
        .bind(invoice_id)
        .fetch_all(&mut *self.tx)
        .await
        .map_err(db_error)?;

        rows.iter().map(allocation_from_row).collect()
    }

    async fn payment_allocations(&mut self, payment_id: Uuid) -> SettlementResult<Vec<Allocation>> {
        let rows = sqlx::query(&format!(
            "SELECT {ALLOCATION_COLUMNS} FROM payment_invoice_allocations WHERE payment_id = $1 ORDER BY created_at, id"
        ))
        .bind(payment_id)
        .fetch_all(&mut *self.tx)
        .await
        .map_err(db_error)?;

        rows.iter().map(allocation_from_row).collect()
    }

    async fn append_activity(&mut self, entry: &ActivityLogEntry) -> SettlementResult<()> {
        sqlx::query(
            r#"
            INSERT INTO invoice_activity_log (
                id, invoice_id, payment_id, activity_type, description, details, actor, occurred_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(entry.id)
        .bind(entry.invoice_id)
        .bind(entry.payment_id)
        .bind(entry.activity_type.as_str())
        .bind(&entry.description)
        .bind(&entry.details)
        .bind(entry.actor.as_str())
        .bind(entry.occurred_at)
        .execute(&mut *self.tx)
        .await
        .map_err(db_error)?;

        Ok(())
    }

    async fn invoice_activity(&mut self, invoice_id: Uuid) -> SettlementResult<Vec<ActivityLogEntry>> {
        let rows = sqlx::query(
            r#"
            SELECT id, invoice_id, payment_id, activity_type, description, details, actor, occurred_at
            FROM invoice_activity_log
            WHERE invoice_id = $1
            ORDER BY occurred_at, id
            "#,
        )
        .bind(invoice_id)
        .fetch_all(&mut *self.tx)
        .await
        .map_err(db_error)?;

        rows.iter().map(activity_from_row).collect()
    }

    async fn commit(self) -> SettlementResult<()> {
        self.tx.commit().await.map_err(db_error)
    }

    async fn rollback(self) -> SettlementResult<()> {
        self.tx.rollback().await.map_err(db_error)
    }
}

fn unique_violation(err: sqlx::Error, message: impl FnOnce() -> String) -> SettlementError {
    match err {
        sqlx::Error::Database(ref db_err) if db_err.is_unique_violation() => {
            SettlementError::invalid_input(message())
        }
        other => db_error(other),
    }
}

fn text<T>(row: &PgRow, column: &str) -> SettlementResult<T>
where
    T: std::str::FromStr<Err = SettlementError>,
{
    let raw: String = row.try_get(column).map_err(db_error)?;
    raw.parse::<T>().map_err(|err| {
        SettlementError::ConsistencyViolation(format!("column {column} holds {raw:?}: {err}"))
    })
}

fn actor(row: &PgRow, column: &str) -> SettlementResult<ActorId> {
    let raw: String = row.try_get(column).map_err(db_error)?;
    ActorId::parse(&raw)
}

fn invoice_from_row(row: &PgRow) -> SettlementResult<Invoice> {
    Ok(Invoice {
        id: row.try_get("id").map_err(db_error)?,
        invoice_number: row.try_get("invoice_number").map_err(db_error)?,
        client_id: row.try_get("client_id").map_err(db_error)?,
        project_id: row.try_get("project_id").map_err(db_error)?,
        issue_date: row.try_get("issue_date").map_err(db_error)?,
        due_date: row.try_get("due_date").map_err(db_error)?,
        currency: row.try_get("currency").map_err(db_error)?,
        payment_terms: row.try_get("payment_terms").map_err(db_error)?,
        subtotal: row.try_get("subtotal").map_err(db_error)?,
        discount_amount: row.try_get("discount_amount").map_err(db_error)?,
        tax_amount: row.try_get("tax_amount").map_err(db_error)?,
        round_off: row.try_get("round_off").map_err(db_error)?,
        total_amount: row.try_get("total_amount").map_err(db_error)?,
        paid_amount: row.try_get("paid_amount").map_err(db_error)?,
        pending_amount: row.try_get("pending_amount").map_err(db_error)?,
        status: text(row, "status")?,
        attachment_ref: row.try_get("attachment_ref").map_err(db_error)?,
        created_by: actor(row, "created_by")?,
        created_at: row.try_get("created_at").map_err(db_error)?,
        updated_at: row.try_get("updated_at").map_err(db_error)?,
    })
}

fn line_from_row(row: &PgRow) -> SettlementResult<InvoiceLine> {
    Ok(InvoiceLine {
        id: row.try_get("id").map_err(db_error)?,
        invoice_id: row.try_get("invoice_id").map_err(db_error)?,
        line_no: row.try_get("line_no").map_err(db_error)?,
        item_id: row.try_get("item_id").map_err(db_error)?,
        item_type: text(row, "item_type")?,
        description: row.try_get("description").map_err(db_error)?,
        quantity: row.try_get("quantity").map_err(db_error)?,
        unit_price: row.try_get("unit_price").map_err(db_error)?,
        discount_amount: row.try_get("discount_amount").map_err(db_error)?,
        tax_rate: row.try_get("tax_rate").map_err(db_error)?,
        tax_amount: row.try_get("tax_amount").map_err(db_error)?,
        line_total: row.try_get("line_total").map_err(db_error)?,
    })
}

fn payment_from_row(row: &PgRow) -> SettlementResult<Payment> {
    Ok(Payment {
        id: row.try_get("id").map_err(db_error)?,
        payment_number: row.try_get("payment_number").map_err(db_error)?,
        client_id: row.try_get("client_id").map_err(db_error)?,
        project_id: row.try_get("project_id").map_err(db_error)?,
        payment_date: row.try_get("payment_date").map_err(db_error)?,
        mode: text(row, "mode")?,
        reference_no: row.try_get("reference_no").map_err(db_error)?,
        amount_received: row.try_get("amount_received").map_err(db_error)?,
        remarks: row.try_get("remarks").map_err(db_error)?,
        attachment_ref: row.try_get("attachment_ref").map_err(db_error)?,
        created_by: actor(row, "created_by")?,
        created_at: row.try_get("created_at").map_err(db_error)?,
        updated_at: row.try_get("updated_at").map_err(db_error)?,
    })
}

fn allocation_from_row(row: &PgRow) -> SettlementResult<Allocation> {
    Ok(Allocation {
        id: row.try_get("id").map_err(db_error)?,
        payment_id: row.try_get("payment_id").map_err(db_error)?,
        invoice_id: row.try_get("invoice_id").map_err(db_error)?,
        amount: row.try_get("amount").map_err(db_error)?,
        created_by: actor(row, "created_by")?,
        created_at: row.try_get("created_at").map_err(db_error)?,
    })
}

fn activity_from_row(row: &PgRow) -> SettlementResult<ActivityLogEntry> {
    Ok(ActivityLogEntry {
        id: row.try_get("id").map_err(db_error)?,
        invoice_id: row.try_get("invoice_id").map_err(db_error)?,
        payment_id: row.try_get("payment_id").map_err(db_error)?,
        activity_type: text(row, "activity_type")?,
        description: row.try_get("description").map_err(db_error)?,
        details: row.try_get("details").map_err(db_error)?,
        actor: actor(row, "actor")?,
        occurred_at: row.try_get("occurred_at").map_err(db_error)?,
    })
}
