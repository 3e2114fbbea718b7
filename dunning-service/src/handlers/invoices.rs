//! Invoice ledger handlers: upserts, dispatch registration, and payment
//! events.

use crate::models::{DispatchRequest, PaymentRequest, UpsertInvoice};
use crate::startup::AppState;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use chrono::Utc;
use serde_json::json;
use service_core::error::AppError;

/// Batch upsert. Idempotent per invoice id: replaying the same batch leaves
/// the ledger unchanged.
pub async fn upsert_invoices(
    State(state): State<AppState>,
    Json(body): Json<Vec<UpsertInvoice>>,
) -> Result<impl IntoResponse, AppError> {
    let invoices = state.engine.upsert_invoices(body, Utc::now()).await?;
    Ok((StatusCode::OK, Json(invoices)))
}

pub async fn list_invoices(
    State(state): State<AppState>,
) -> Result<impl IntoResponse, AppError> {
    let invoices = state.engine.list_invoices(Utc::now()).await?;
    Ok(Json(invoices))
}

pub async fn get_invoice(
    State(state): State<AppState>,
    Path(invoice_id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let invoice = state.engine.get_invoice(&invoice_id, Utc::now()).await?;
    Ok(Json(invoice))
}

/// Register the contact channels for an invoice, unlocking reminders for it.
pub async fn create_dispatch(
    State(state): State<AppState>,
    Json(body): Json<DispatchRequest>,
) -> Result<impl IntoResponse, AppError> {
    let dispatch = state.engine.dispatch(body, Utc::now()).await?;
    Ok((StatusCode::CREATED, Json(dispatch)))
}

/// Apply a payment event. Duplicate event ids return 200 with
/// `applied: false` instead of an error, so webhook retries stay cheap.
pub async fn apply_payment(
    State(state): State<AppState>,
    Json(body): Json<PaymentRequest>,
) -> Result<impl IntoResponse, AppError> {
    let (invoice, applied) = state.engine.apply_payment(body, Utc::now()).await?;
    Ok((
        StatusCode::OK,
        Json(json!({
            "applied": applied,
            "invoice": invoice,
        })),
    ))
}
