//! In-process implementation of the ledger and settlement stores.
//!
//! Each balance row and each order sits behind its own `tokio::sync::Mutex`,
//! so operations on one row serialize while different rows proceed in
//! parallel. Mutations work on a clone and commit only on success. Lock order
//! is always order row, then balance row.

use async_trait::async_trait;
use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{Mutex as RowMutex, OwnedMutexGuard};
use uuid::Uuid;

use crate::domain::{
    AssetKey, BetLookup, GameContext, LedgerError, LedgerOperation, LedgerTransaction, OrderStatus, OrderType,
    SettlementError, SettlementOrder, TransactionMetadata, TransactionType, UserAsset,
};
use crate::ports::{HistoryPage, HistoryQuery, LedgerStore, SettleOutcome, SettlementStore};

type SharedRow<T> = Arc<RowMutex<T>>;

pub struct MemoryStore {
    assets: Mutex<HashMap<AssetKey, SharedRow<UserAsset>>>,
    log: Mutex<Vec<LedgerTransaction>>,
    orders: Mutex<HashMap<String, SharedRow<SettlementOrder>>>,
    next_order_id: Mutex<i64>,
    lock_wait: Duration,
}

fn guard<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl MemoryStore {
    pub fn new(lock_wait: Duration) -> Self {
        Self {
            assets: Mutex::new(HashMap::new()),
            log: Mutex::new(Vec::new()),
            orders: Mutex::new(HashMap::new()),
            next_order_id: Mutex::new(0),
            lock_wait,
        }
    }

    fn row(&self, key: &AssetKey) -> SharedRow<UserAsset> {
        guard(&self.assets)
            .entry(key.clone())
            .or_insert_with(|| Arc::new(RowMutex::new(UserAsset::new(key))))
            .clone()
    }

    async fn lock_row<T>(&self, row: SharedRow<T>) -> Result<OwnedMutexGuard<T>, LedgerError> {
        tokio::time::timeout(self.lock_wait, row.lock_owned())
            .await
            .map_err(|_| LedgerError::LockTimeout)
    }

    fn order_row(&self, order_id: &str) -> Option<SharedRow<SettlementOrder>> {
        guard(&self.orders).get(order_id).cloned()
    }

    /// Applies `ops` to a copy of the locked row. Nothing is visible until
    /// [`commit`](Self::commit) is called with the result.
    fn stage(
        &self,
        asset: &UserAsset,
        ops: &[LedgerOperation],
    ) -> Result<(UserAsset, Vec<crate::domain::Posting>), LedgerError> {
        let key = asset.key();
        let mut next = asset.clone();
        let mut postings = Vec::new();
        for op in ops {
            let game = op.bet_lookup().and_then(|lookup| self.game_context(&key, lookup));
            postings.extend(next.apply(op, game.as_ref())?);
        }
        Ok((next, postings))
    }

    fn commit(
        &self,
        row: &mut UserAsset,
        next: UserAsset,
        postings: Vec<crate::domain::Posting>,
    ) -> Vec<LedgerTransaction> {
        let key = next.key();
        let now = Utc::now();
        let mut log = guard(&self.log);
        let mut written = Vec::with_capacity(postings.len());
        for posting in postings {
            let seq = log.len() as i64 + 1;
            let tx = posting.into_transaction(&key, seq, now);
            log.push(tx.clone());
            written.push(tx);
        }
        *row = next;
        written
    }

    /// Bet a win or refund resolves against on this row, newest first.
    fn game_context(&self, key: &AssetKey, lookup: BetLookup<'_>) -> Option<GameContext> {
        let log = guard(&self.log);
        let on_row = |tx: &&LedgerTransaction| tx.user_id == key.user_id && tx.currency == key.currency;
        let is_refunded = |bet_id: Uuid| {
            log.iter().filter(on_row).any(|tx| {
                matches!(
                    &tx.metadata,
                    Some(TransactionMetadata::Refund { bet_transaction_id, .. }) if *bet_transaction_id == bet_id
                )
            })
        };

        let bet = log
            .iter()
            .rev()
            .filter(on_row)
            .filter(|tx| tx.tx_type == TransactionType::GameBet && tx.reference_id.as_deref() == Some(lookup.game_id))
            .find(|tx| !lookup.unrefunded_only || !is_refunded(tx.id))?;
        let split = bet.metadata.as_ref().and_then(TransactionMetadata::as_bet)?.clone();

        Some(GameContext {
            bet_transaction_id: bet.id,
            bet: split,
            refunded: is_refunded(bet.id),
        })
    }

    fn allocate_order_id(&self) -> i64 {
        let mut next = guard(&self.next_order_id);
        *next += 1;
        *next
    }
}

#[async_trait]
impl LedgerStore for MemoryStore {
    async fn execute(
        &self,
        key: &AssetKey,
        ops: Vec<LedgerOperation>,
    ) -> Result<Vec<LedgerTransaction>, LedgerError> {
        let mut row = self.lock_row(self.row(key)).await?;
        let (next, postings) = self.stage(&row, &ops)?;
        Ok(self.commit(&mut row, next, postings))
    }

    async fn get_asset(&self, key: &AssetKey) -> Result<Option<UserAsset>, LedgerError> {
        let row = guard(&self.assets).get(key).cloned();
        match row {
            Some(row) => Ok(Some(self.lock_row(row).await?.clone())),
            None => Ok(None),
        }
    }

    async fn list_assets(&self, user_id: &str) -> Result<Vec<UserAsset>, LedgerError> {
        let rows: Vec<_> = guard(&self.assets)
            .iter()
            .filter(|(key, _)| key.user_id == user_id)
            .map(|(_, row)| row.clone())
            .collect();

        let mut assets = Vec::with_capacity(rows.len());
        for row in rows {
            assets.push(self.lock_row(row).await?.clone());
        }
        assets.sort_by(|a, b| a.currency.cmp(&b.currency));
        Ok(assets)
    }

    async fn transaction_history(&self, query: &HistoryQuery) -> Result<HistoryPage, LedgerError> {
        let log = guard(&self.log);
        let matching: Vec<&LedgerTransaction> = log
            .iter()
            .rev()
            .filter(|tx| tx.user_id == query.user_id)
            .filter(|tx| query.currency.as_ref().map_or(true, |c| &tx.currency == c))
            .collect();

        let items = matching
            .iter()
            .skip(query.offset() as usize)
            .take(query.limit as usize)
            .map(|tx| (*tx).clone())
            .collect();

        Ok(HistoryPage {
            items,
            total: matching.len() as i64,
            page: query.page,
            limit: query.limit,
        })
    }

    async fn history_for_replay(&self, key: &AssetKey) -> Result<Vec<LedgerTransaction>, LedgerError> {
        Ok(guard(&self.log)
            .iter()
            .filter(|tx| tx.user_id == key.user_id && tx.currency == key.currency)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl SettlementStore for MemoryStore {
    async fn find_order(&self, order_id: &str) -> Result<Option<SettlementOrder>, SettlementError> {
        match self.order_row(order_id) {
            Some(row) => Ok(Some(self.lock_row(row).await?.clone())),
            None => Ok(None),
        }
    }

    async fn create_order(
        &self,
        mut order: SettlementOrder,
        hold: Option<LedgerOperation>,
    ) -> Result<SettlementOrder, SettlementError> {
        let key = order.asset_key();
        let mut row = self.lock_row(self.row(&key)).await?;
        let (next, postings) = self.stage(&row, hold.as_slice())?;

        let mut orders = guard(&self.orders);
        if orders.contains_key(&order.order_id) {
            return Err(SettlementError::DuplicateOrder(order.order_id));
        }
        order.id = self.allocate_order_id();
        orders.insert(order.order_id.clone(), Arc::new(RowMutex::new(order.clone())));
        drop(orders);

        self.commit(&mut row, next, postings);
        Ok(order)
    }

    async fn refresh_expiry(
        &self,
        order_id: &str,
        expire_at: DateTime<Utc>,
    ) -> Result<Option<SettlementOrder>, SettlementError> {
        let Some(row) = self.order_row(order_id) else {
            return Ok(None);
        };
        let mut order = self.lock_row(row).await?;
        if !order.is_open() {
            return Ok(None);
        }
        order.expire_at = expire_at;
        Ok(Some(order.clone()))
    }

    async fn settle(
        &self,
        order_id: &str,
        bonus_rate: Option<&BigDecimal>,
    ) -> Result<SettleOutcome, SettlementError> {
        let row = self
            .order_row(order_id)
            .ok_or_else(|| SettlementError::OrderNotFound(order_id.to_string()))?;
        let mut order = self.lock_row(row).await?;
        if order.processed {
            return Ok(SettleOutcome::AlreadyProcessed(order.clone()));
        }

        let ops = order.settlement_operations(bonus_rate);
        let mut asset = self.lock_row(self.row(&order.asset_key())).await?;
        let (next, postings) = self.stage(&asset, &ops)?;
        let transactions = self.commit(&mut asset, next, postings);

        let now = Utc::now();
        order.processed = true;
        order.processed_at = Some(now);
        order.status = OrderStatus::Finish;

        Ok(SettleOutcome::Settled {
            order: order.clone(),
            transactions,
        })
    }

    async fn cancel_expired_withdrawals(
        &self,
        cutoff: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<SettlementOrder>, SettlementError> {
        let rows: Vec<_> = guard(&self.orders).values().cloned().collect();
        let mut cancelled = Vec::new();

        for row in rows {
            if cancelled.len() as i64 >= limit {
                break;
            }
            // skip rows another worker holds
            let Ok(mut order) = row.try_lock_owned() else {
                continue;
            };
            if order.order_type != OrderType::Withdraw || !order.is_open() || order.expire_at >= cutoff {
                continue;
            }

            let mut asset = self.lock_row(self.row(&order.asset_key())).await?;
            match self.stage(&asset, &[order.release_operation()]) {
                Ok((next, postings)) => {
                    self.commit(&mut asset, next, postings);
                    order.status = OrderStatus::Cancel;
                    cancelled.push(order.clone());
                }
                Err(e) => {
                    tracing::error!(order_id = %order.order_id, error = %e, "failed to release withdraw hold");
                }
            }
        }

        Ok(cancelled)
    }
}
