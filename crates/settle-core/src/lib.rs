pub mod error;
pub mod events;
pub mod models;
pub mod money;
pub mod storage;

pub use error::{CapacityTarget, ErrorKind, SettlementError, SettlementResult};
pub use events::{ActivityLogEntry, ActivityType};
pub use models::{
    ActorId, Allocation, Invoice, InvoiceLine, InvoiceStatus, ItemType, NewInvoice,
    NewInvoiceLine, NewPayment, Payment, PaymentMode, PaymentPatch,
};
pub use money::{
    MONEY_LIMIT, MONEY_SCALE, QUANTITY_LIMIT, QUANTITY_SCALE, TAX_RATE_SCALE, line_amount, money,
    positive_money, quantity, round_money, sum_money, tax_rate,
};
pub use storage::{DocumentKind, InvoiceSettlement, LedgerStore, LedgerTx};
