//! Storage ports for the ledger and settlement orders.
//!
//! Services depend on these traits only; `adapters/` provides the Postgres
//! and in-memory implementations.

use async_trait::async_trait;
use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::domain::{
    AssetKey, LedgerError, LedgerOperation, LedgerTransaction, SettlementError, SettlementOrder,
    UserAsset,
};

pub const HISTORY_DEFAULT_LIMIT: u32 = 20;
pub const HISTORY_MAX_LIMIT: u32 = 100;

/// Paginated history read, newest first. `page` starts at 1.
#[derive(Debug, Clone)]
pub struct HistoryQuery {
    pub user_id: String,
    pub currency: Option<String>,
    pub page: u32,
    pub limit: u32,
}

impl HistoryQuery {
    pub fn offset(&self) -> i64 {
        i64::from(self.page.saturating_sub(1)) * i64::from(self.limit)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HistoryPage {
    pub items: Vec<LedgerTransaction>,
    pub total: i64,
    pub page: u32,
    pub limit: u32,
}

#[derive(Debug, Clone)]
pub enum SettleOutcome {
    /// The ledger effect was booked and the order marked processed.
    Settled {
        order: SettlementOrder,
        transactions: Vec<LedgerTransaction>,
    },
    /// The order was already processed when its row lock was taken.
    AlreadyProcessed(SettlementOrder),
}

/// Per-(user, currency) balance rows plus the append-only transaction log.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Applies `ops` in order under one exclusive lock on the row for `key`
    /// and persists the resulting entries. Either all ops commit or none do.
    /// The row is created on first use.
    async fn execute(
        &self,
        key: &AssetKey,
        ops: Vec<LedgerOperation>,
    ) -> Result<Vec<LedgerTransaction>, LedgerError>;

    async fn get_asset(&self, key: &AssetKey) -> Result<Option<UserAsset>, LedgerError>;

    async fn list_assets(&self, user_id: &str) -> Result<Vec<UserAsset>, LedgerError>;

    async fn transaction_history(&self, query: &HistoryQuery) -> Result<HistoryPage, LedgerError>;

    /// Full history of one row in creation order.
    async fn history_for_replay(&self, key: &AssetKey) -> Result<Vec<LedgerTransaction>, LedgerError>;
}

#[async_trait]
pub trait SettlementStore: Send + Sync {
    async fn find_order(&self, order_id: &str) -> Result<Option<SettlementOrder>, SettlementError>;

    /// Inserts a new order. When `hold` is given it is applied to the order's
    /// balance row in the same atomic unit; a hold failure leaves no order
    /// behind. A second order with the same `order_id` fails with
    /// `DuplicateOrder`.
    async fn create_order(
        &self,
        order: SettlementOrder,
        hold: Option<LedgerOperation>,
    ) -> Result<SettlementOrder, SettlementError>;

    /// Moves the expiry of an open order. Returns `None` when the order is
    /// missing or no longer open.
    async fn refresh_expiry(
        &self,
        order_id: &str,
        expire_at: DateTime<Utc>,
    ) -> Result<Option<SettlementOrder>, SettlementError>;

    /// Locks the order row, re-checks `processed` and, if still false, books
    /// the order's ledger effect and marks it processed in the same unit.
    async fn settle(
        &self,
        order_id: &str,
        bonus_rate: Option<&BigDecimal>,
    ) -> Result<SettleOutcome, SettlementError>;

    /// Cancels up to `limit` unprocessed withdraw orders whose expiry is
    /// before `cutoff`, releasing each order's hold. Rows locked by another
    /// worker are skipped.
    async fn cancel_expired_withdrawals(
        &self,
        cutoff: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<SettlementOrder>, SettlementError>;
}
