use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use thiserror::Error;

use crate::domain::{LedgerError, SettlementError};
use crate::services::request_queue::QueueError;
use crate::validation::ValidationError;

#[derive(Error, Debug)]
pub enum AppError {
    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error(transparent)]
    Settlement(#[from] SettlementError),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Internal server error: {0}")]
    Internal(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),
}

fn ledger_status(err: &LedgerError) -> StatusCode {
    match err {
        LedgerError::InvalidAmount(_) | LedgerError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
        LedgerError::InsufficientBalance { .. }
        | LedgerError::InsufficientWithdrawableBalance { .. }
        | LedgerError::InvalidUnlockAmount { .. }
        | LedgerError::InvariantViolation(_) => StatusCode::UNPROCESSABLE_ENTITY,
        LedgerError::BetNotFound(_) => StatusCode::NOT_FOUND,
        LedgerError::LockTimeout => StatusCode::SERVICE_UNAVAILABLE,
        LedgerError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl AppError {
    fn status_code(&self) -> StatusCode {
        match self {
            AppError::Ledger(e) => ledger_status(e),
            AppError::Settlement(e) => match e {
                SettlementError::OrderNotFound(_) => StatusCode::NOT_FOUND,
                SettlementError::DuplicateOrder(_) | SettlementError::OrderConflict { .. } => StatusCode::CONFLICT,
                SettlementError::UnsupportedToken { .. } => StatusCode::BAD_REQUEST,
                SettlementError::RequestInProgress(_) => StatusCode::TOO_MANY_REQUESTS,
                SettlementError::Signing(_) => StatusCode::INTERNAL_SERVER_ERROR,
                SettlementError::Ledger(inner) => ledger_status(inner),
            },
            AppError::Queue(e) => match e {
                QueueError::UnknownHandler { .. } | QueueError::Invalid(_) => StatusCode::BAD_REQUEST,
                QueueError::Store(_) => StatusCode::SERVICE_UNAVAILABLE,
            },
            AppError::Validation(_) => StatusCode::BAD_REQUEST,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            AppError::Ledger(e) => e.code(),
            AppError::Settlement(e) => e.code(),
            AppError::Queue(e) => e.code(),
            AppError::Validation(_) => "VALIDATION_ERROR",
            AppError::NotFound(_) => "NOT_FOUND",
            AppError::Internal(_) => "INTERNAL_ERROR",
            AppError::BadRequest(_) => "BAD_REQUEST",
            AppError::Unauthorized(_) => "UNAUTHORIZED",
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(code = self.code(), "request failed: {}", self);
        }
        let body = Json(json!({
            "error": self.to_string(),
            "code": self.code(),
            "status": status.as_u16(),
        }));

        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bigdecimal::BigDecimal;

    #[test]
    fn test_validation_error_status_code() {
        let error = AppError::Validation(ValidationError::new("wallet", "must start with '0x'"));
        assert_eq!(error.status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(error.code(), "VALIDATION_ERROR");
    }

    #[test]
    fn test_insufficient_funds_maps_to_unprocessable() {
        let error = AppError::from(LedgerError::InsufficientBalance {
            available: BigDecimal::from(1),
            requested: BigDecimal::from(5),
        });
        assert_eq!(error.status_code(), StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(error.code(), "INSUFFICIENT_BALANCE");
    }

    #[test]
    fn test_settlement_error_status_codes() {
        let cases = [
            (SettlementError::OrderNotFound("o".into()), StatusCode::NOT_FOUND),
            (
                SettlementError::OrderConflict { order_id: "o".into(), reason: "finished".into() },
                StatusCode::CONFLICT,
            ),
            (SettlementError::RequestInProgress("o".into()), StatusCode::TOO_MANY_REQUESTS),
            (SettlementError::Ledger(LedgerError::LockTimeout), StatusCode::SERVICE_UNAVAILABLE),
        ];
        for (err, status) in cases {
            assert_eq!(AppError::from(err).status_code(), status);
        }
    }

    #[test]
    fn test_unauthorized_error_status_code() {
        let error = AppError::Unauthorized("Unauthorized access".to_string());
        assert_eq!(error.status_code(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_error_body_carries_code_and_status() {
        let response = AppError::from(LedgerError::InvalidAmount("0".into())).into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["code"], "INVALID_AMOUNT");
        assert_eq!(json["status"], 400);
    }
}
