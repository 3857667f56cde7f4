use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use serde_json::json;

use crate::error::AppError;
use crate::services::request_queue::EnqueueRequest;
use crate::AppState;

pub async fn status(State(state): State<AppState>) -> Result<impl IntoResponse, AppError> {
    Ok(Json(state.queue.status().await?))
}

pub async fn items(State(state): State<AppState>) -> Result<impl IntoResponse, AppError> {
    Ok(Json(state.queue.items().await?))
}

pub async fn enqueue(
    State(state): State<AppState>,
    Json(request): Json<EnqueueRequest>,
) -> Result<impl IntoResponse, AppError> {
    let outcome = state.queue.enqueue(request).await?;
    Ok((StatusCode::ACCEPTED, Json(outcome)))
}

pub async fn clear(State(state): State<AppState>) -> Result<impl IntoResponse, AppError> {
    let cleared = state.queue.clear().await?;
    Ok(Json(json!({ "cleared": cleared })))
}
