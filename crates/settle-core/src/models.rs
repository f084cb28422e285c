use std::{fmt, str::FromStr};

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{SettlementError, SettlementResult};
use crate::money::{line_amount, money, positive_money, quantity, round_money, sum_money, tax_rate};

/// Opaque id of the user performing a mutation. Used for audit only.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ActorId(String);

impl ActorId {
    pub fn parse(value: &str) -> SettlementResult<Self> {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            return Err(SettlementError::invalid_input("actor id is required"));
        }
        if trimmed.len() > 128 {
            return Err(SettlementError::invalid_input("actor id is too long"));
        }
        Ok(Self(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ActorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvoiceStatus {
    Draft,
    Issued,
    PartiallyPaid,
    Paid,
    Overdue,
    Cancelled,
}

impl InvoiceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InvoiceStatus::Draft => "draft",
            InvoiceStatus::Issued => "issued",
            InvoiceStatus::PartiallyPaid => "partially_paid",
            InvoiceStatus::Paid => "paid",
            InvoiceStatus::Overdue => "overdue",
            InvoiceStatus::Cancelled => "cancelled",
        }
    }

    /// True once the invoice has left Draft and has not been cancelled.
    /// Overdue counts as issued: it is a derived display state, not a block.
    pub fn is_issued(&self) -> bool {
        matches!(
            self,
            InvoiceStatus::Issued
                | InvoiceStatus::PartiallyPaid
                | InvoiceStatus::Paid
                | InvoiceStatus::Overdue
        )
    }
}

impl fmt::Display for InvoiceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for InvoiceStatus {
    type Err = SettlementError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "draft" => Ok(InvoiceStatus::Draft),
            "issued" => Ok(InvoiceStatus::Issued),
            "partially_paid" => Ok(InvoiceStatus::PartiallyPaid),
            "paid" => Ok(InvoiceStatus::Paid),
            "overdue" => Ok(InvoiceStatus::Overdue),
            "cancelled" => Ok(InvoiceStatus::Cancelled),
            other => Err(SettlementError::invalid_input(format!(
                "unknown invoice status {other}"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemType {
    Product,
    Service,
}

impl ItemType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ItemType::Product => "product",
            ItemType::Service => "service",
        }
    }
}

impl FromStr for ItemType {
    type Err = SettlementError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "product" => Ok(ItemType::Product),
            "service" => Ok(ItemType::Service),
            other => Err(SettlementError::invalid_input(format!(
                "unknown item type {other}"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentMode {
    Cash,
    BankTransfer,
    Cheque,
    Upi,
    Card,
    Other,
}

impl PaymentMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentMode::Cash => "cash",
            PaymentMode::BankTransfer => "bank_transfer",
            PaymentMode::Cheque => "cheque",
            PaymentMode::Upi => "upi",
            PaymentMode::Card => "card",
            PaymentMode::Other => "other",
        }
    }
}

impl FromStr for PaymentMode {
    type Err = SettlementError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "cash" => Ok(PaymentMode::Cash),
            "bank_transfer" => Ok(PaymentMode::BankTransfer),
            "cheque" => Ok(PaymentMode::Cheque),
            "upi" => Ok(PaymentMode::Upi),
            "card" => Ok(PaymentMode::Card),
            "other" => Ok(PaymentMode::Other),
            other => Err(SettlementError::invalid_input(format!(
                "unknown payment mode {other}"
            ))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Invoice {
    pub id: Uuid,
    pub invoice_number: String,
    pub client_id: Uuid,
    pub project_id: Option<Uuid>,
    pub issue_date: NaiveDate,
    pub due_date: Option<NaiveDate>,
    pub currency: String,
    pub payment_terms: Option<String>,
    pub subtotal: Decimal,
    pub discount_amount: Decimal,
    pub tax_amount: Decimal,
    pub round_off: Decimal,
    pub total_amount: Decimal,
    /// Cached from the allocation set; recomputed on every allocation change.
    pub paid_amount: Decimal,
    pub pending_amount: Decimal,
    pub status: InvoiceStatus,
    pub attachment_ref: Option<String>,
    pub created_by: ActorId,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvoiceLine {
    pub id: Uuid,
    pub invoice_id: Uuid,
    pub line_no: i32,
    pub item_id: Option<Uuid>,
    pub item_type: ItemType,
    pub description: String,
    pub quantity: Decimal,
    pub unit_price: Decimal,
    pub discount_amount: Decimal,
    /// Percentage, 0..=100.
    pub tax_rate: Decimal,
    pub tax_amount: Decimal,
    pub line_total: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewInvoiceLine {
    pub item_id: Option<Uuid>,
    pub item_type: ItemType,
    pub description: String,
    pub quantity: Decimal,
    pub unit_price: Decimal,
    #[serde(default)]
    pub discount_amount: Decimal,
    #[serde(default)]
    pub tax_rate: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewInvoice {
    pub client_id: Uuid,
    pub project_id: Option<Uuid>,
    pub issue_date: NaiveDate,
    pub due_date: Option<NaiveDate>,
    pub currency: String,
    pub payment_terms: Option<String>,
    #[serde(default)]
    pub round_off: Decimal,
    pub attachment_ref: Option<String>,
    pub lines: Vec<NewInvoiceLine>,
}

impl Invoice {
    /// Builds a Draft invoice and its priced lines, rejecting malformed input.
    pub fn draft(
        input: NewInvoice,
        invoice_number: String,
        actor: &ActorId,
        now: DateTime<Utc>,
    ) -> SettlementResult<(Invoice, Vec<InvoiceLine>)> {
        if input.lines.is_empty() {
            return Err(SettlementError::invalid_input(
                "invoice requires at least one line item",
            ));
        }
        if let Some(due) = input.due_date {
            if due < input.issue_date {
                return Err(SettlementError::invalid_input(
                    "due_date cannot be before issue_date",
                ));
            }
        }
        let currency = normalize_currency(&input.currency)?;
        let round_off = money(input.round_off, "round_off")?;
        if round_off.abs() >= Decimal::ONE {
            return Err(SettlementError::invalid_input(
                "round_off must be less than 1.00 in magnitude",
            ));
        }

        let invoice_id = Uuid::new_v4();
        let mut lines = Vec::with_capacity(input.lines.len());
        for (index, line) in input.lines.into_iter().enumerate() {
            lines.push(price_line(invoice_id, index as i32 + 1, line)?);
        }

        let subtotal = sum_money(
            lines
                .iter()
                .map(|line| line_amount(line.quantity, line.unit_price))
                .collect::<SettlementResult<Vec<_>>>()?,
        )?;
        let discount_amount = sum_money(lines.iter().map(|line| line.discount_amount))?;
        let tax_amount = sum_money(lines.iter().map(|line| line.tax_amount))?;
        let total_amount = sum_money([subtotal, -discount_amount, tax_amount, round_off])?;
        if total_amount <= Decimal::ZERO {
            return Err(SettlementError::invalid_input(
                "invoice total must be greater than zero",
            ));
        }

        let invoice = Invoice {
            id: invoice_id,
            invoice_number,
            client_id: input.client_id,
            project_id: input.project_id,
            issue_date: input.issue_date,
            due_date: input.due_date,
            currency,
            payment_terms: trimmed(input.payment_terms),
            subtotal,
            discount_amount,
            tax_amount,
            round_off,
            total_amount,
            paid_amount: round_money(Decimal::ZERO),
            pending_amount: total_amount,
            status: InvoiceStatus::Draft,
            attachment_ref: trimmed(input.attachment_ref),
            created_by: actor.clone(),
            created_at: now,
            updated_at: now,
        };

        Ok((invoice, lines))
    }
}

fn price_line(invoice_id: Uuid, line_no: i32, line: NewInvoiceLine) -> SettlementResult<InvoiceLine> {
    let quantity = quantity(line.quantity, &format!("line {line_no}: quantity"))?;
    if line.item_type == ItemType::Product && line.item_id.is_none() {
        return Err(SettlementError::invalid_input(format!(
            "line {line_no}: product lines require an item_id"
        )));
    }
    let unit_price = money(line.unit_price, "unit_price")?;
    if unit_price < Decimal::ZERO {
        return Err(SettlementError::invalid_input(format!(
            "line {line_no}: unit_price cannot be negative"
        )));
    }
    let discount_amount = money(line.discount_amount, "discount_amount")?;
    let gross = line_amount(quantity, unit_price)?;
    if discount_amount < Decimal::ZERO || discount_amount > gross {
        return Err(SettlementError::invalid_input(format!(
            "line {line_no}: discount must be between 0 and the line amount"
        )));
    }
    let tax_rate = tax_rate(line.tax_rate, &format!("line {line_no}: tax_rate"))?;

    let net = gross - discount_amount;
    let tax_amount = round_money(net * tax_rate / Decimal::ONE_HUNDRED);
    let line_total = sum_money([net, tax_amount])?;

    Ok(InvoiceLine {
        id: Uuid::new_v4(),
        invoice_id,
        line_no,
        item_id: line.item_id,
        item_type: line.item_type,
        description: line.description.trim().to_string(),
        quantity,
        unit_price,
        discount_amount,
        tax_rate,
        tax_amount,
        line_total,
    })
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Payment {
    pub id: Uuid,
    pub payment_number: String,
    pub client_id: Uuid,
    pub project_id: Option<Uuid>,
    pub payment_date: NaiveDate,
    pub mode: PaymentMode,
    pub reference_no: Option<String>,
    pub amount_received: Decimal,
    pub remarks: Option<String>,
    pub attachment_ref: Option<String>,
    pub created_by: ActorId,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewPayment {
    pub client_id: Uuid,
    pub project_id: Option<Uuid>,
    pub payment_date: NaiveDate,
    pub mode: PaymentMode,
    pub reference_no: Option<String>,
    pub amount_received: Decimal,
    pub remarks: Option<String>,
    pub attachment_ref: Option<String>,
}

impl Payment {
    pub fn record(
        input: NewPayment,
        payment_number: String,
        actor: &ActorId,
        now: DateTime<Utc>,
    ) -> SettlementResult<Payment> {
        let amount_received = positive_money(input.amount_received, "amount_received")?;
        if input.client_id.is_nil() {
            return Err(SettlementError::invalid_input("client_id is required"));
        }
        if input.mode != PaymentMode::Cash && trimmed(input.reference_no.clone()).is_none() {
            return Err(SettlementError::invalid_input(format!(
                "reference_no is required for {} payments",
                input.mode.as_str()
            )));
        }

        Ok(Payment {
            id: Uuid::new_v4(),
            payment_number,
            client_id: input.client_id,
            project_id: input.project_id,
            payment_date: input.payment_date,
            mode: input.mode,
            reference_no: trimmed(input.reference_no),
            amount_received,
            remarks: trimmed(input.remarks),
            attachment_ref: trimmed(input.attachment_ref),
            created_by: actor.clone(),
            created_at: now,
            updated_at: now,
        })
    }
}

/// Field-level patch for a recorded payment. `None` leaves the field as-is.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PaymentPatch {
    pub client_id: Option<Uuid>,
    pub project_id: Option<Uuid>,
    pub payment_date: Option<NaiveDate>,
    pub mode: Option<PaymentMode>,
    pub reference_no: Option<String>,
    pub amount_received: Option<Decimal>,
    pub remarks: Option<String>,
    pub attachment_ref: Option<String>,
}

impl PaymentPatch {
    pub fn is_empty(&self) -> bool {
        self.client_id.is_none()
            && self.project_id.is_none()
            && self.payment_date.is_none()
            && self.mode.is_none()
            && self.reference_no.is_none()
            && self.amount_received.is_none()
            && self.remarks.is_none()
            && self.attachment_ref.is_none()
    }

    /// Applies the patch to a copy of `payment`. Allocation-dependent guards
    /// are the caller's concern.
    pub fn apply(&self, payment: &Payment, now: DateTime<Utc>) -> SettlementResult<Payment> {
        let mut next = payment.clone();
        if let Some(client_id) = self.client_id {
            if client_id.is_nil() {
                return Err(SettlementError::invalid_input("client_id is required"));
            }
            next.client_id = client_id;
        }
        if self.project_id.is_some() {
            next.project_id = self.project_id;
        }
        if let Some(payment_date) = self.payment_date {
            next.payment_date = payment_date;
        }
        if let Some(mode) = self.mode {
            next.mode = mode;
        }
        if self.reference_no.is_some() {
            next.reference_no = trimmed(self.reference_no.clone());
        }
        if let Some(amount) = self.amount_received {
            next.amount_received = positive_money(amount, "amount_received")?;
        }
        if self.remarks.is_some() {
            next.remarks = trimmed(self.remarks.clone());
        }
        if self.attachment_ref.is_some() {
            next.attachment_ref = trimmed(self.attachment_ref.clone());
        }
        if next.mode != PaymentMode::Cash && next.reference_no.is_none() {
            return Err(SettlementError::invalid_input(format!(
                "reference_no is required for {} payments",
                next.mode.as_str()
            )));
        }
        next.updated_at = now;
        Ok(next)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Allocation {
    pub id: Uuid,
    pub payment_id: Uuid,
    pub invoice_id: Uuid,
    pub amount: Decimal,
    pub created_by: ActorId,
    pub created_at: DateTime<Utc>,
}

impl Allocation {
    pub fn new(
        payment_id: Uuid,
        invoice_id: Uuid,
        amount: Decimal,
        actor: &ActorId,
        now: DateTime<Utc>,
    ) -> SettlementResult<Allocation> {
        Ok(Allocation {
            id: Uuid::new_v4(),
            payment_id,
            invoice_id,
            amount: positive_money(amount, "allocation amount")?,
            created_by: actor.clone(),
            created_at: now,
        })
    }
}

fn normalize_currency(value: &str) -> SettlementResult<String> {
    let currency = value.trim().to_ascii_uppercase();
    if currency.len() != 3 || !currency.chars().all(|ch| ch.is_ascii_alphabetic()) {
        return Err(SettlementError::invalid_input(
            "currency must be a 3-letter ISO code",
        ));
    }
    Ok(currency)
}

fn trimmed(value: Option<String>) -> Option<String> {
    value
        .map(|raw| raw.trim().to_string())
        .filter(|raw| !raw.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn actor() -> ActorId {
        ActorId::parse("ar-clerk").unwrap()
    }

    fn line(quantity: i64, unit_price: &str) -> NewInvoiceLine {
        NewInvoiceLine {
            item_id: Some(Uuid::new_v4()),
            item_type: ItemType::Product,
            description: "Widget".to_string(),
            quantity: Decimal::new(quantity, 0),
            unit_price: unit_price.parse().unwrap(),
            discount_amount: Decimal::ZERO,
            tax_rate: Decimal::ZERO,
        }
    }

    fn new_invoice(lines: Vec<NewInvoiceLine>) -> NewInvoice {
        NewInvoice {
            client_id: Uuid::new_v4(),
            project_id: None,
            issue_date: NaiveDate::from_ymd_opt(2026, 1, 10).unwrap(),
            due_date: NaiveDate::from_ymd_opt(2026, 2, 10),
            currency: "inr".to_string(),
            payment_terms: Some("Net 30".to_string()),
            round_off: Decimal::ZERO,
            attachment_ref: None,
            lines,
        }
    }

    #[test]
    fn draft_computes_totals_from_lines() {
        let mut taxed = line(2, "250.00");
        taxed.discount_amount = "50.00".parse().unwrap();
        taxed.tax_rate = Decimal::new(18, 0);
        let input = new_invoice(vec![taxed, line(1, "100.00")]);

        let (invoice, lines) = Invoice::draft(input, "INV-000001".to_string(), &actor(), Utc::now()).unwrap();

        assert_eq!(invoice.status, InvoiceStatus::Draft);
        assert_eq!(invoice.currency, "INR");
        assert_eq!(invoice.subtotal.to_string(), "600.00");
        assert_eq!(invoice.discount_amount.to_string(), "50.00");
        assert_eq!(invoice.tax_amount.to_string(), "81.00");
        assert_eq!(invoice.total_amount.to_string(), "631.00");
        assert_eq!(invoice.pending_amount, invoice.total_amount);
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0].line_total.to_string(), "531.00");
        assert!(lines.iter().all(|l| l.invoice_id == invoice.id));
    }

    #[test]
    fn draft_rejects_product_line_without_item() {
        let mut bad = line(1, "10.00");
        bad.item_id = None;
        let err = Invoice::draft(new_invoice(vec![bad]), "INV-1".to_string(), &actor(), Utc::now())
            .unwrap_err();
        assert!(matches!(err, SettlementError::InvalidInput(_)));
    }

    #[test]
    fn draft_rejects_large_round_off() {
        let mut input = new_invoice(vec![line(1, "10.00")]);
        input.round_off = Decimal::new(150, 2);
        assert!(Invoice::draft(input, "INV-1".to_string(), &actor(), Utc::now()).is_err());
    }

    #[test]
    fn draft_rejects_overflowing_lines_without_panicking() {
        let mut huge = line(1, "2.00");
        huge.quantity = Decimal::MAX;
        let err = Invoice::draft(new_invoice(vec![huge]), "INV-1".to_string(), &actor(), Utc::now())
            .unwrap_err();
        assert!(matches!(err, SettlementError::InvalidInput(_)));

        let near_limit = line(99_999_999_999, "99999.99");
        let err = Invoice::draft(
            new_invoice(vec![near_limit.clone(), near_limit]),
            "INV-2".to_string(),
            &actor(),
            Utc::now(),
        )
        .unwrap_err();
        assert!(matches!(err, SettlementError::InvalidInput(_)));
    }

    #[test]
    fn draft_rejects_over_precise_quantity_and_tax_rate() {
        let mut fine_quantity = line(1, "10.00");
        fine_quantity.quantity = "0.00001".parse().unwrap();
        let err = Invoice::draft(
            new_invoice(vec![fine_quantity]),
            "INV-1".to_string(),
            &actor(),
            Utc::now(),
        )
        .unwrap_err();
        assert!(matches!(err, SettlementError::InvalidInput(_)));

        let mut fine_rate = line(1, "10.00");
        fine_rate.tax_rate = "18.125".parse().unwrap();
        let err = Invoice::draft(new_invoice(vec![fine_rate]), "INV-2".to_string(), &actor(), Utc::now())
            .unwrap_err();
        assert!(matches!(err, SettlementError::InvalidInput(_)));

        let mut fractional = line(1, "10.00");
        fractional.quantity = "1.2500".parse().unwrap();
        fractional.tax_rate = "12.50".parse().unwrap();
        let (invoice, _) =
            Invoice::draft(new_invoice(vec![fractional]), "INV-3".to_string(), &actor(), Utc::now())
                .unwrap();
        assert_eq!(invoice.total_amount.to_string(), "14.06");
    }

    #[test]
    fn payment_rejects_amounts_beyond_the_storage_range() {
        let input = NewPayment {
            client_id: Uuid::new_v4(),
            project_id: None,
            payment_date: NaiveDate::from_ymd_opt(2026, 1, 12).unwrap(),
            mode: PaymentMode::Cash,
            reference_no: None,
            amount_received: "10000000000000000".parse().unwrap(),
            remarks: None,
            attachment_ref: None,
        };
        let err = Payment::record(input, "PAY-1".to_string(), &actor(), Utc::now()).unwrap_err();
        assert!(matches!(err, SettlementError::InvalidInput(_)));
    }

    #[test]
    fn payment_requires_positive_amount_and_reference() {
        let input = NewPayment {
            client_id: Uuid::new_v4(),
            project_id: None,
            payment_date: NaiveDate::from_ymd_opt(2026, 1, 12).unwrap(),
            mode: PaymentMode::BankTransfer,
            reference_no: None,
            amount_received: Decimal::new(40000, 2),
            remarks: None,
            attachment_ref: None,
        };
        assert!(Payment::record(input.clone(), "PAY-1".to_string(), &actor(), Utc::now()).is_err());

        let with_ref = NewPayment {
            reference_no: Some(" UTR123 ".to_string()),
            ..input.clone()
        };
        let payment = Payment::record(with_ref, "PAY-1".to_string(), &actor(), Utc::now()).unwrap();
        assert_eq!(payment.reference_no.as_deref(), Some("UTR123"));

        let zero = NewPayment {
            mode: PaymentMode::Cash,
            amount_received: Decimal::ZERO,
            ..input
        };
        assert!(Payment::record(zero, "PAY-2".to_string(), &actor(), Utc::now()).is_err());
    }

    #[test]
    fn allocation_rejects_non_positive_amount() {
        let err = Allocation::new(Uuid::new_v4(), Uuid::new_v4(), Decimal::ZERO, &actor(), Utc::now())
            .unwrap_err();
        assert!(matches!(err, SettlementError::InvalidInput(_)));
    }

    #[test]
    fn overdue_counts_as_issued() {
        assert_eq!("partially_paid".parse::<InvoiceStatus>().unwrap(), InvoiceStatus::PartiallyPaid);
        assert!(InvoiceStatus::Overdue.is_issued());
        assert!(!InvoiceStatus::Draft.is_issued());
        assert!(!InvoiceStatus::Cancelled.is_issued());
    }

    #[test]
    fn actor_id_must_not_be_blank() {
        assert!(ActorId::parse("   ").is_err());
        assert_eq!(ActorId::parse(" alice ").unwrap().as_str(), "alice");
    }
}
