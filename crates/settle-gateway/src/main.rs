use std::{net::SocketAddr, sync::Arc, time::Duration};

use anyhow::Result as AnyResult;
use axum::{
    Json, Router,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    routing::{get, post},
};
use chrono::{NaiveDate, Utc};
use settle_core::{
    ActorId, ErrorKind, Invoice, NewInvoice, Payment, PaymentPatch, SettlementError,
};
use settle_finance::{
    AllocationOutcome, AllocationReport, InvoiceSummary, PaymentSummary, Settlement,
    TransitionOutcome,
};
use settle_platform::{
    AllocatePaymentRequest, CancelInvoiceRequest, CreatePaymentRequest, CreatePaymentResponse,
    ErrorBody, InvoiceActivityResponse, PendingInvoicesResponse, PgCatalog, PgLedgerStore,
    ServiceConfig, connect_database, run_migrations,
};
use tracing::{error, info, warn};
use uuid::Uuid;

const ACTOR_HEADER: &str = "x-actor-id";
const OVERDUE_SWEEP_ACTOR: &str = "system-overdue-sweep";

type ApiError = (StatusCode, Json<ErrorBody>);

#[derive(Clone)]
struct AppState {
    settlement: Settlement<PgLedgerStore, PgCatalog>,
}

#[tokio::main]
async fn main() -> AnyResult<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "settle_gateway=info,settle_finance=info".to_string()),
        )
        .init();

    let config = ServiceConfig::from_env("0.0.0.0:8080")?;
    let pool = connect_database(&config.database_url, config.max_connections).await?;
    run_migrations(&pool).await?;

    let catalog_pool =
        connect_database(&config.database_url, config.catalog_max_connections).await?;

    let store = Arc::new(PgLedgerStore::new(pool, config.lock_timeout));
    let catalog = Arc::new(PgCatalog::new(catalog_pool, config.lock_timeout));
    let settlement = Settlement::new(store, catalog);

    if let Some(period) = config.overdue_sweep_interval {
        tokio::spawn(run_overdue_sweep(settlement.clone(), period));
    }

    let state = AppState { settlement };
    let router = Router::new()
        .route("/healthz", get(healthz))
        .route("/invoices", post(create_invoice))
        .route("/invoices/{invoice_id}", get(get_invoice))
        .route("/invoices/{invoice_id}/issue", post(issue_invoice))
        .route("/invoices/{invoice_id}/cancel", post(cancel_invoice))
        .route("/invoices/{invoice_id}/activity", get(invoice_activity))
        .route(
            "/clients/{client_id}/pending-invoices",
            get(pending_invoices),
        )
        .route("/payments", post(create_payment))
        .route(
            "/payments/{payment_id}",
            get(get_payment).patch(update_payment).delete(delete_payment),
        )
        .route("/payments/{payment_id}/allocations", post(allocate_payment))
        .with_state(state);

    let addr: SocketAddr = config.http_addr.parse()?;
    info!("settlement gateway listening on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router).await?;

    Ok(())
}

async fn run_overdue_sweep(settlement: Settlement<PgLedgerStore, PgCatalog>, period: Duration) {
    let actor = match ActorId::parse(OVERDUE_SWEEP_ACTOR) {
        Ok(actor) => actor,
        Err(err) => {
            error!("overdue sweep disabled: {}", err);
            return;
        }
    };
    let mut ticker = tokio::time::interval(period);
    loop {
        ticker.tick().await;
        if let Err(err) = settlement.invoices.sweep_overdue(today(), &actor).await {
            warn!("overdue sweep failed: {}", err);
        }
    }
}

async fn healthz() -> &'static str {
    "ok"
}

async fn create_invoice(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<NewInvoice>,
) -> Result<(StatusCode, Json<Invoice>), ApiError> {
    let actor = actor_from_headers(&headers)?;
    let invoice = state
        .settlement
        .invoices
        .create_draft(payload, &actor)
        .await
        .map_err(api_error)?;

    Ok((StatusCode::CREATED, Json(invoice)))
}

async fn get_invoice(
    State(state): State<AppState>,
    Path(invoice_id): Path<Uuid>,
) -> Result<Json<InvoiceSummary>, ApiError> {
    let summary = state
        .settlement
        .invoices
        .get_invoice(invoice_id, today())
        .await
        .map_err(api_error)?;

    Ok(Json(summary))
}

async fn issue_invoice(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(invoice_id): Path<Uuid>,
) -> Result<Json<TransitionOutcome>, ApiError> {
    let actor = actor_from_headers(&headers)?;
    let outcome = state
        .settlement
        .invoices
        .issue(invoice_id, &actor)
        .await
        .map_err(api_error)?;

    Ok(Json(outcome))
}

async fn cancel_invoice(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(invoice_id): Path<Uuid>,
    Json(payload): Json<CancelInvoiceRequest>,
) -> Result<Json<TransitionOutcome>, ApiError> {
    let actor = actor_from_headers(&headers)?;
    let outcome = state
        .settlement
        .invoices
        .cancel(invoice_id, payload.restore_inventory, &actor)
        .await
        .map_err(api_error)?;

    Ok(Json(outcome))
}

async fn invoice_activity(
    State(state): State<AppState>,
    Path(invoice_id): Path<Uuid>,
) -> Result<Json<InvoiceActivityResponse>, ApiError> {
    let entries = state
        .settlement
        .invoices
        .invoice_activity(invoice_id)
        .await
        .map_err(api_error)?;

    Ok(Json(InvoiceActivityResponse {
        invoice_id,
        entries,
    }))
}

async fn pending_invoices(
    State(state): State<AppState>,
    Path(client_id): Path<Uuid>,
) -> Result<Json<PendingInvoicesResponse>, ApiError> {
    let invoices = state
        .settlement
        .invoices
        .pending_invoices(client_id, today())
        .await
        .map_err(api_error)?;

    Ok(Json(PendingInvoicesResponse {
        client_id,
        invoices,
    }))
}

async fn create_payment(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<CreatePaymentRequest>,
) -> Result<(StatusCode, Json<CreatePaymentResponse>), ApiError> {
    let actor = actor_from_headers(&headers)?;
    let outcome = state
        .settlement
        .payments
        .record_and_allocate(payload.payment, &payload.allocations, &actor)
        .await
        .map_err(api_error)?;

    let (allocation, allocation_error) = match outcome.allocation {
        AllocationOutcome::NotRequested => (None, None),
        AllocationOutcome::Allocated(report) => (Some(report), None),
        AllocationOutcome::Failed(err) => (None, Some(ErrorBody::from(&err))),
    };

    Ok((
        StatusCode::CREATED,
        Json(CreatePaymentResponse {
            payment: outcome.payment,
            allocation,
            allocation_error,
        }),
    ))
}

async fn get_payment(
    State(state): State<AppState>,
    Path(payment_id): Path<Uuid>,
) -> Result<Json<PaymentSummary>, ApiError> {
    let summary = state
        .settlement
        .payments
        .get_payment(payment_id)
        .await
        .map_err(api_error)?;

    Ok(Json(summary))
}

async fn update_payment(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(payment_id): Path<Uuid>,
    Json(patch): Json<PaymentPatch>,
) -> Result<Json<Payment>, ApiError> {
    let actor = actor_from_headers(&headers)?;
    let payment = state
        .settlement
        .payments
        .update_payment(payment_id, &patch, &actor)
        .await
        .map_err(api_error)?;

    Ok(Json(payment))
}

async fn delete_payment(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(payment_id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    let actor = actor_from_headers(&headers)?;
    state
        .settlement
        .payments
        .delete_payment(payment_id, &actor)
        .await
        .map_err(api_error)?;

    Ok(StatusCode::NO_CONTENT)
}

async fn allocate_payment(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(payment_id): Path<Uuid>,
    Json(payload): Json<AllocatePaymentRequest>,
) -> Result<Json<AllocationReport>, ApiError> {
    let actor = actor_from_headers(&headers)?;
    let report = state
        .settlement
        .allocations
        .allocate(payment_id, &payload.allocations, &actor)
        .await
        .map_err(api_error)?;

    Ok(Json(report))
}

fn today() -> NaiveDate {
    Utc::now().date_naive()
}

fn actor_from_headers(headers: &HeaderMap) -> Result<ActorId, ApiError> {
    let raw = headers
        .get(ACTOR_HEADER)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default();

    ActorId::parse(raw).map_err(|_| {
        (
            StatusCode::BAD_REQUEST,
            Json(ErrorBody {
                kind: ErrorKind::InvalidInput.as_str().to_string(),
                reason: format!("{ACTOR_HEADER} header is required"),
            }),
        )
    })
}

fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::InvalidInput => StatusCode::BAD_REQUEST,
        ErrorKind::CapacityExceeded => StatusCode::UNPROCESSABLE_ENTITY,
        ErrorKind::InvalidStateTransition | ErrorKind::PaymentHasAllocations => {
            StatusCode::CONFLICT
        }
        ErrorKind::DependencyFailure => StatusCode::FAILED_DEPENDENCY,
        ErrorKind::Conflict => StatusCode::SERVICE_UNAVAILABLE,
        ErrorKind::Fatal => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn api_error(err: SettlementError) -> ApiError {
    let kind = err.kind();
    if kind == ErrorKind::Fatal {
        error!("settlement request failed: {:#}", err);
        return (
            status_for(kind),
            Json(ErrorBody {
                kind: kind.as_str().to_string(),
                reason: "internal error".to_string(),
            }),
        );
    }

    (status_for(kind), Json(ErrorBody::from(&err)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn missing_actor_header_is_a_bad_request() {
        let (status, Json(body)) = actor_from_headers(&HeaderMap::new()).unwrap_err();
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body.kind, "invalid_input");

        let mut headers = HeaderMap::new();
        headers.insert(ACTOR_HEADER, HeaderValue::from_static("ar-clerk"));
        assert_eq!(actor_from_headers(&headers).unwrap().as_str(), "ar-clerk");
    }

    #[test]
    fn retryable_conflicts_map_to_service_unavailable() {
        let (status, Json(body)) =
            api_error(SettlementError::StorageConflict("lock timeout".to_string()));
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body.kind, "conflict");
    }

    #[test]
    fn fatal_errors_hide_their_reason() {
        let (status, Json(body)) = api_error(SettlementError::ConsistencyViolation(
            "allocations exceed invoice total".to_string(),
        ));
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body.reason, "internal error");
    }

    #[test]
    fn deleting_an_allocated_payment_is_a_conflict() {
        let (status, Json(body)) = api_error(SettlementError::PaymentHasAllocations {
            payment_id: Uuid::nil(),
            allocated: rust_decimal::Decimal::new(25000, 2),
        });
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body.kind, "payment_has_allocations");
    }
}
