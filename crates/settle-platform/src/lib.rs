pub mod catalog;
pub mod config;
pub mod contracts;
pub mod db;
pub mod store;

pub use catalog::PgCatalog;
pub use config::ServiceConfig;
pub use contracts::{
    AllocatePaymentRequest, CancelInvoiceRequest, CreatePaymentRequest, CreatePaymentResponse,
    ErrorBody, InvoiceActivityResponse, PendingInvoicesResponse,
};
pub use db::{connect_database, db_error, run_migrations};
pub use store::{PgLedgerStore, PgLedgerTx};
