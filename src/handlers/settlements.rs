use axum::{
    extract::{Path, State},
    response::IntoResponse,
    Json,
};

use crate::error::AppError;
use crate::services::settlement::AuthorizationParams;
use crate::AppState;

pub async fn request_deposit(
    State(state): State<AppState>,
    Json(params): Json<AuthorizationParams>,
) -> Result<impl IntoResponse, AppError> {
    Ok(Json(state.settlements.request_deposit(params).await?))
}

pub async fn request_withdraw(
    State(state): State<AppState>,
    Json(params): Json<AuthorizationParams>,
) -> Result<impl IntoResponse, AppError> {
    Ok(Json(state.settlements.request_withdraw(params).await?))
}

pub async fn get_order(
    State(state): State<AppState>,
    Path(order_id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    Ok(Json(state.settlements.get_order(&order_id).await?))
}
