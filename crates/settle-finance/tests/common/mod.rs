#![allow(dead_code)]

use std::sync::Arc;

use chrono::{NaiveDate, Utc};
use rust_decimal::Decimal;
use settle_core::{ActorId, Invoice, ItemType, NewInvoice, NewInvoiceLine, NewPayment, PaymentMode};
use settle_finance::{PaymentReceipt, Settlement};
use settle_inventory::InMemoryCatalog;
use settle_store::InMemoryLedgerStore;
use uuid::Uuid;

pub struct TestLedger {
    pub store: Arc<InMemoryLedgerStore>,
    pub catalog: Arc<InMemoryCatalog>,
    pub settlement: Settlement<InMemoryLedgerStore, InMemoryCatalog>,
    pub actor: ActorId,
    pub client_id: Uuid,
}

pub fn dec(value: &str) -> Decimal {
    value.parse().expect("valid decimal literal")
}

pub fn today() -> NaiveDate {
    Utc::now().date_naive()
}

impl TestLedger {
    pub fn new() -> Self {
        let store = Arc::new(InMemoryLedgerStore::default());
        let catalog = Arc::new(InMemoryCatalog::default());
        let settlement = Settlement::new(Arc::clone(&store), Arc::clone(&catalog));

        Self {
            store,
            catalog,
            settlement,
            actor: ActorId::parse("ar-clerk").unwrap(),
            client_id: Uuid::new_v4(),
        }
    }

    pub fn service_invoice(&self, total: &str, due_date: Option<NaiveDate>) -> NewInvoice {
        NewInvoice {
            client_id: self.client_id,
            project_id: None,
            issue_date: today() - chrono::Duration::days(30),
            due_date,
            currency: "INR".to_string(),
            payment_terms: Some("Net 30".to_string()),
            round_off: Decimal::ZERO,
            attachment_ref: None,
            lines: vec![NewInvoiceLine {
                item_id: None,
                item_type: ItemType::Service,
                description: "Consulting".to_string(),
                quantity: Decimal::ONE,
                unit_price: dec(total),
                discount_amount: Decimal::ZERO,
                tax_rate: Decimal::ZERO,
            }],
        }
    }

    pub fn product_invoice(&self, lines: &[(Uuid, i64, &str)]) -> NewInvoice {
        NewInvoice {
            lines: lines
                .iter()
                .map(|(item_id, quantity, unit_price)| NewInvoiceLine {
                    item_id: Some(*item_id),
                    item_type: ItemType::Product,
                    description: "Widget".to_string(),
                    quantity: Decimal::new(*quantity, 0),
                    unit_price: dec(unit_price),
                    discount_amount: Decimal::ZERO,
                    tax_rate: Decimal::ZERO,
                })
                .collect(),
            ..self.service_invoice("1.00", None)
        }
    }

    pub async fn draft(&self, input: NewInvoice) -> Invoice {
        self.settlement
            .invoices
            .create_draft(input, &self.actor)
            .await
            .expect("draft invoice")
    }

    pub async fn issued_invoice(&self, total: &str, due_date: Option<NaiveDate>) -> Invoice {
        let invoice = self.draft(self.service_invoice(total, due_date)).await;
        self.settlement
            .invoices
            .issue(invoice.id, &self.actor)
            .await
            .expect("issue invoice");
        invoice
    }

    pub async fn payment(&self, amount: &str) -> PaymentReceipt {
        self.settlement
            .payments
            .create_payment(self.new_payment(amount), &self.actor)
            .await
            .expect("record payment")
    }

    pub fn new_payment(&self, amount: &str) -> NewPayment {
        NewPayment {
            client_id: self.client_id,
            project_id: None,
            payment_date: today(),
            mode: PaymentMode::BankTransfer,
            reference_no: Some(format!("UTR-{}", Uuid::new_v4().simple())),
            amount_received: dec(amount),
            remarks: None,
            attachment_ref: None,
        }
    }
}
