use bigdecimal::BigDecimal;
use thiserror::Error;

/// Failures of a ledger operation. Every variant except `LockTimeout` and
/// `Storage` is a business outcome that leaves the balance row untouched.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum LedgerError {
    #[error("invalid amount: {0}")]
    InvalidAmount(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("insufficient balance: available {available}, requested {requested}")]
    InsufficientBalance {
        available: BigDecimal,
        requested: BigDecimal,
    },

    #[error("insufficient withdrawable balance: withdrawable {withdrawable}, requested {requested}")]
    InsufficientWithdrawableBalance {
        withdrawable: BigDecimal,
        requested: BigDecimal,
    },

    #[error("invalid unlock amount: locked {locked}, requested {requested}")]
    InvalidUnlockAmount {
        locked: BigDecimal,
        requested: BigDecimal,
    },

    #[error("no refundable bet found for game {0}")]
    BetNotFound(String),

    #[error("operation would violate balance invariants: {0}")]
    InvariantViolation(String),

    #[error("timed out waiting for balance row lock")]
    LockTimeout,

    #[error("storage error: {0}")]
    Storage(String),
}

impl LedgerError {
    /// Stable machine-readable code surfaced to API callers.
    pub fn code(&self) -> &'static str {
        match self {
            LedgerError::InvalidAmount(_) => "INVALID_AMOUNT",
            LedgerError::InvalidRequest(_) => "INVALID_REQUEST",
            LedgerError::InsufficientBalance { .. } => "INSUFFICIENT_BALANCE",
            LedgerError::InsufficientWithdrawableBalance { .. } => "INSUFFICIENT_WITHDRAWABLE_BALANCE",
            LedgerError::InvalidUnlockAmount { .. } => "INVALID_UNLOCK_AMOUNT",
            LedgerError::BetNotFound(_) => "BET_NOT_FOUND",
            LedgerError::InvariantViolation(_) => "INVARIANT_VIOLATION",
            LedgerError::LockTimeout => "LOCK_TIMEOUT",
            LedgerError::Storage(_) => "STORAGE_ERROR",
        }
    }

    /// True for "not enough funds" outcomes, as opposed to bad input.
    pub fn is_insufficient_funds(&self) -> bool {
        matches!(
            self,
            LedgerError::InsufficientBalance { .. }
                | LedgerError::InsufficientWithdrawableBalance { .. }
                | LedgerError::InvalidUnlockAmount { .. }
        )
    }
}

/// Failures of the settlement order lifecycle.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SettlementError {
    #[error("settlement order {0} not found")]
    OrderNotFound(String),

    #[error("settlement order {0} already exists")]
    DuplicateOrder(String),

    #[error("settlement order {order_id} cannot be re-requested: {reason}")]
    OrderConflict { order_id: String, reason: String },

    #[error("token {token} is not supported on chain {chain_id}")]
    UnsupportedToken { chain_id: i64, token: String },

    #[error("a request for order {0} is already in progress")]
    RequestInProgress(String),

    #[error("failed to sign authorization: {0}")]
    Signing(String),

    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

impl SettlementError {
    pub fn code(&self) -> &'static str {
        match self {
            SettlementError::OrderNotFound(_) => "ORDER_NOT_FOUND",
            SettlementError::DuplicateOrder(_) => "DUPLICATE_ORDER",
            SettlementError::OrderConflict { .. } => "ORDER_CONFLICT",
            SettlementError::UnsupportedToken { .. } => "UNSUPPORTED_TOKEN",
            SettlementError::RequestInProgress(_) => "REQUEST_IN_PROGRESS",
            SettlementError::Signing(_) => "SIGNING_FAILED",
            SettlementError::Ledger(inner) => inner.code(),
        }
    }
}
