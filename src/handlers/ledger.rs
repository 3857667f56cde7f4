use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use serde::{Deserialize, Serialize};

use crate::domain::LedgerTransaction;
use crate::error::AppError;
use crate::services::ledger::{AdjustRequest, DepositRequest, EntryRequest, GameRequest, RefundRequest};
use crate::AppState;

#[derive(Debug, Serialize)]
pub struct LedgerReceipt {
    pub transactions: Vec<LedgerTransaction>,
}

fn receipt(transactions: Vec<LedgerTransaction>) -> impl IntoResponse {
    (StatusCode::CREATED, Json(LedgerReceipt { transactions }))
}

#[derive(Debug, Deserialize)]
pub struct HistoryParams {
    pub currency: Option<String>,
    pub page: Option<u32>,
    pub limit: Option<u32>,
}

pub async fn deposit(
    State(state): State<AppState>,
    Json(req): Json<DepositRequest>,
) -> Result<impl IntoResponse, AppError> {
    Ok(receipt(state.ledger.deposit(req).await?))
}

pub async fn withdraw(
    State(state): State<AppState>,
    Json(req): Json<EntryRequest>,
) -> Result<impl IntoResponse, AppError> {
    Ok(receipt(state.ledger.withdraw(req).await?))
}

pub async fn bet(
    State(state): State<AppState>,
    Json(req): Json<GameRequest>,
) -> Result<impl IntoResponse, AppError> {
    Ok(receipt(state.ledger.bet(req).await?))
}

pub async fn win(
    State(state): State<AppState>,
    Json(req): Json<GameRequest>,
) -> Result<impl IntoResponse, AppError> {
    Ok(receipt(state.ledger.win(req).await?))
}

pub async fn refund(
    State(state): State<AppState>,
    Json(req): Json<RefundRequest>,
) -> Result<impl IntoResponse, AppError> {
    Ok(receipt(state.ledger.refund(req).await?))
}

pub async fn lock(
    State(state): State<AppState>,
    Json(req): Json<EntryRequest>,
) -> Result<impl IntoResponse, AppError> {
    Ok(receipt(state.ledger.lock_balance(req).await?))
}

pub async fn unlock(
    State(state): State<AppState>,
    Json(req): Json<EntryRequest>,
) -> Result<impl IntoResponse, AppError> {
    Ok(receipt(state.ledger.unlock_balance(req).await?))
}

pub async fn adjust(
    State(state): State<AppState>,
    Json(req): Json<AdjustRequest>,
) -> Result<impl IntoResponse, AppError> {
    Ok(receipt(state.ledger.adjust(req).await?))
}

pub async fn list_balances(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    Ok(Json(state.ledger.list_balances(&user_id).await?))
}

pub async fn get_balance(
    State(state): State<AppState>,
    Path((user_id, currency)): Path<(String, String)>,
) -> Result<impl IntoResponse, AppError> {
    Ok(Json(state.ledger.get_balance(&user_id, &currency).await?))
}

pub async fn transaction_history(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
    Query(params): Query<HistoryParams>,
) -> Result<impl IntoResponse, AppError> {
    let page = state
        .ledger
        .transaction_history(&user_id, params.currency.as_deref(), params.page, params.limit)
        .await?;
    Ok(Json(page))
}
