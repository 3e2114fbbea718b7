//! Reminder run handlers.

use crate::models::StartRunRequest;
use crate::startup::AppState;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use service_core::error::AppError;
use uuid::Uuid;

#[derive(Debug, Deserialize)]
pub struct SendRunParams {
    pub budget: Option<usize>,
    pub now: Option<DateTime<Utc>>,
}

/// Plan and drain in one synchronous call. With `dry_run: true` this is a
/// pure what-if: nothing is enqueued and no invoice changes.
pub async fn run_once(
    State(state): State<AppState>,
    Json(body): Json<StartRunRequest>,
) -> Result<impl IntoResponse, AppError> {
    let response = state.engine.run_once(body).await?;
    Ok((StatusCode::CREATED, Json(response)))
}

/// Evaluate and enqueue without sending; drain later via `send_run`.
pub async fn evaluate_run(
    State(state): State<AppState>,
    Json(body): Json<StartRunRequest>,
) -> Result<impl IntoResponse, AppError> {
    let response = state.engine.evaluate_run(body).await?;
    Ok((StatusCode::CREATED, Json(response)))
}

pub async fn send_run(
    State(state): State<AppState>,
    Path(run_id): Path<Uuid>,
    Query(params): Query<SendRunParams>,
) -> Result<impl IntoResponse, AppError> {
    let now = params.now.unwrap_or_else(Utc::now);
    let response = state.engine.send_run(run_id, params.budget, now).await?;
    Ok(Json(response))
}

pub async fn get_run(
    State(state): State<AppState>,
    Path(run_id): Path<Uuid>,
) -> Result<impl IntoResponse, AppError> {
    let response = state.engine.get_run(run_id).await?;
    Ok(Json(response))
}
