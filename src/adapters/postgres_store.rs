//! Postgres implementation of the ledger and settlement stores.
//!
//! Every mutation runs in one transaction that takes `SELECT ... FOR UPDATE`
//! on exactly one `user_assets` row (and, for settlement, first on the
//! `settlement_orders` row). `lock_timeout` bounds the wait.

use async_trait::async_trait;
use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use sqlx::{PgConnection, PgPool, Postgres, Transaction};
use std::str::FromStr;
use std::time::Duration;
use uuid::Uuid;

use crate::domain::{
    AssetKey, BalanceSource, BetLookup, GameContext, LedgerError, LedgerOperation, LedgerTransaction,
    OrderStatus, OrderType, Posting, SettlementError, SettlementOrder, TransactionMetadata,
    TransactionStatus, TransactionType, UserAsset,
};
use crate::ports::{HistoryPage, HistoryQuery, LedgerStore, SettleOutcome, SettlementStore};

const LOCK_NOT_AVAILABLE: &str = "55P03";
const UNIQUE_VIOLATION: &str = "23505";

impl From<sqlx::Error> for LedgerError {
    fn from(err: sqlx::Error) -> Self {
        if let sqlx::Error::Database(db) = &err {
            if db.code().as_deref() == Some(LOCK_NOT_AVAILABLE) {
                return LedgerError::LockTimeout;
            }
        }
        LedgerError::Storage(err.to_string())
    }
}

impl From<sqlx::Error> for SettlementError {
    fn from(err: sqlx::Error) -> Self {
        SettlementError::Ledger(err.into())
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.code().as_deref() == Some(UNIQUE_VIOLATION))
}

fn storage(err: impl std::fmt::Display) -> LedgerError {
    LedgerError::Storage(err.to_string())
}

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
    lock_wait: Duration,
}

impl PgStore {
    pub fn new(pool: PgPool, lock_wait: Duration) -> Self {
        Self { pool, lock_wait }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn begin(&self) -> Result<Transaction<'static, Postgres>, LedgerError> {
        let mut tx = self.pool.begin().await?;
        // SET does not take bind parameters
        sqlx::query(&format!(
            "SET LOCAL lock_timeout = '{}ms'",
            self.lock_wait.as_millis()
        ))
        .execute(&mut *tx)
        .await?;
        Ok(tx)
    }
}

/// Locks the balance row for `key`, creating it first if needed.
async fn lock_asset(conn: &mut PgConnection, key: &AssetKey) -> Result<UserAsset, LedgerError> {
    sqlx::query(
        r#"
        INSERT INTO user_assets (user_id, currency)
        VALUES ($1, $2)
        ON CONFLICT (user_id, currency) DO NOTHING
        "#,
    )
    .bind(&key.user_id)
    .bind(&key.currency)
    .execute(&mut *conn)
    .await?;

    let row = sqlx::query_as::<_, AssetRow>(
        r#"
        SELECT user_id, currency, balance_real, balance_bonus, balance_locked, created_at, updated_at
        FROM user_assets
        WHERE user_id = $1 AND currency = $2
        FOR UPDATE
        "#,
    )
    .bind(&key.user_id)
    .bind(&key.currency)
    .fetch_one(&mut *conn)
    .await?;

    Ok(row.into_domain())
}

async fn game_context(
    conn: &mut PgConnection,
    key: &AssetKey,
    lookup: BetLookup<'_>,
) -> Result<Option<GameContext>, LedgerError> {
    let bet = sqlx::query_as::<_, TransactionRow>(
        r#"
        SELECT b.* FROM ledger_transactions b
        WHERE b.user_id = $1 AND b.currency = $2 AND b.tx_type = 'GAME_BET' AND b.reference_id = $3
          AND (NOT $4 OR NOT EXISTS (
              SELECT 1 FROM ledger_transactions r
              WHERE r.user_id = b.user_id AND r.currency = b.currency AND r.tx_type = 'GAME_REFUND'
                AND r.metadata->>'bet_transaction_id' = b.id::text
          ))
        ORDER BY b.seq DESC
        LIMIT 1
        "#,
    )
    .bind(&key.user_id)
    .bind(&key.currency)
    .bind(lookup.game_id)
    .bind(lookup.unrefunded_only)
    .fetch_optional(&mut *conn)
    .await?;

    let Some(bet) = bet else {
        return Ok(None);
    };
    let bet = bet.into_domain()?;
    let Some(split) = bet.metadata.as_ref().and_then(TransactionMetadata::as_bet).cloned() else {
        return Ok(None);
    };

    let refunded: bool = sqlx::query_scalar(
        r#"
        SELECT EXISTS (
            SELECT 1 FROM ledger_transactions
            WHERE user_id = $1 AND currency = $2 AND tx_type = 'GAME_REFUND'
              AND metadata->>'bet_transaction_id' = $3
        )
        "#,
    )
    .bind(&key.user_id)
    .bind(&key.currency)
    .bind(bet.id.to_string())
    .fetch_one(&mut *conn)
    .await?;

    Ok(Some(GameContext {
        bet_transaction_id: bet.id,
        bet: split,
        refunded,
    }))
}

/// Applies `ops` to the already locked row and writes the balance and entries.
async fn apply_locked(
    conn: &mut PgConnection,
    asset: &mut UserAsset,
    ops: &[LedgerOperation],
) -> Result<Vec<LedgerTransaction>, LedgerError> {
    let key = asset.key();
    let mut postings = Vec::new();
    for op in ops {
        let game = match op.bet_lookup() {
            Some(lookup) => game_context(conn, &key, lookup).await?,
            None => None,
        };
        postings.extend(asset.apply(op, game.as_ref())?);
    }

    sqlx::query(
        r#"
        UPDATE user_assets
        SET balance_real = $3, balance_bonus = $4, balance_locked = $5, updated_at = $6
        WHERE user_id = $1 AND currency = $2
        "#,
    )
    .bind(&key.user_id)
    .bind(&key.currency)
    .bind(&asset.balance_real)
    .bind(&asset.balance_bonus)
    .bind(&asset.balance_locked)
    .bind(asset.updated_at)
    .execute(&mut *conn)
    .await?;

    let mut written = Vec::with_capacity(postings.len());
    for posting in postings {
        written.push(insert_posting(conn, &key, posting).await?);
    }
    Ok(written)
}

async fn insert_posting(
    conn: &mut PgConnection,
    key: &AssetKey,
    posting: Posting,
) -> Result<LedgerTransaction, LedgerError> {
    let now = Utc::now();
    let metadata = posting
        .metadata
        .as_ref()
        .map(serde_json::to_value)
        .transpose()
        .map_err(storage)?;

    let seq: i64 = sqlx::query_scalar(
        r#"
        INSERT INTO ledger_transactions (
            id, user_id, currency, tx_type, source, status, amount,
            balance_before, balance_after, reference_id, description, metadata,
            operator_id, created_at, processed_at
        ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $14)
        RETURNING seq
        "#,
    )
    .bind(posting.id)
    .bind(&key.user_id)
    .bind(&key.currency)
    .bind(posting.tx_type.as_str())
    .bind(posting.source.map(|s| s.as_str()))
    .bind(TransactionStatus::Success.as_str())
    .bind(&posting.amount)
    .bind(&posting.balance_before)
    .bind(&posting.balance_after)
    .bind(&posting.context.reference_id)
    .bind(&posting.context.description)
    .bind(metadata)
    .bind(&posting.context.operator_id)
    .bind(now)
    .fetch_one(&mut *conn)
    .await?;

    Ok(posting.into_transaction(key, seq, now))
}

async fn lock_order(
    conn: &mut PgConnection,
    order_id: &str,
) -> Result<Option<SettlementOrder>, SettlementError> {
    let row = sqlx::query_as::<_, OrderRow>(
        "SELECT * FROM settlement_orders WHERE order_id = $1 FOR UPDATE",
    )
    .bind(order_id)
    .fetch_optional(&mut *conn)
    .await?;

    row.map(OrderRow::into_domain).transpose()
}

async fn update_order_state(conn: &mut PgConnection, order: &SettlementOrder) -> Result<(), SettlementError> {
    sqlx::query(
        r#"
        UPDATE settlement_orders
        SET processed = $2, processed_at = $3, status = $4, expire_at = $5
        WHERE id = $1
        "#,
    )
    .bind(order.id)
    .bind(order.processed)
    .bind(order.processed_at)
    .bind(order.status.as_str())
    .bind(order.expire_at)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

#[async_trait]
impl LedgerStore for PgStore {
    async fn execute(
        &self,
        key: &AssetKey,
        ops: Vec<LedgerOperation>,
    ) -> Result<Vec<LedgerTransaction>, LedgerError> {
        let mut tx = self.begin().await?;
        let mut asset = lock_asset(&mut tx, key).await?;
        // dropping `tx` on error rolls back
        let written = apply_locked(&mut tx, &mut asset, &ops).await?;
        tx.commit().await?;
        Ok(written)
    }

    async fn get_asset(&self, key: &AssetKey) -> Result<Option<UserAsset>, LedgerError> {
        let row = sqlx::query_as::<_, AssetRow>(
            "SELECT * FROM user_assets WHERE user_id = $1 AND currency = $2",
        )
        .bind(&key.user_id)
        .bind(&key.currency)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(AssetRow::into_domain))
    }

    async fn list_assets(&self, user_id: &str) -> Result<Vec<UserAsset>, LedgerError> {
        let rows = sqlx::query_as::<_, AssetRow>(
            "SELECT * FROM user_assets WHERE user_id = $1 ORDER BY currency",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(AssetRow::into_domain).collect())
    }

    async fn transaction_history(&self, query: &HistoryQuery) -> Result<HistoryPage, LedgerError> {
        let rows = sqlx::query_as::<_, TransactionRow>(
            r#"
            SELECT * FROM ledger_transactions
            WHERE user_id = $1 AND ($2::TEXT IS NULL OR currency = $2)
            ORDER BY seq DESC
            LIMIT $3 OFFSET $4
            "#,
        )
        .bind(&query.user_id)
        .bind(&query.currency)
        .bind(i64::from(query.limit))
        .bind(query.offset())
        .fetch_all(&self.pool)
        .await?;

        let total: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM ledger_transactions WHERE user_id = $1 AND ($2::TEXT IS NULL OR currency = $2)",
        )
        .bind(&query.user_id)
        .bind(&query.currency)
        .fetch_one(&self.pool)
        .await?;

        Ok(HistoryPage {
            items: rows
                .into_iter()
                .map(TransactionRow::into_domain)
                .collect::<Result<_, _>>()?,
            total,
            page: query.page,
            limit: query.limit,
        })
    }

    async fn history_for_replay(&self, key: &AssetKey) -> Result<Vec<LedgerTransaction>, LedgerError> {
        sqlx::query_as::<_, TransactionRow>(
            "SELECT * FROM ledger_transactions WHERE user_id = $1 AND currency = $2 ORDER BY seq ASC",
        )
        .bind(&key.user_id)
        .bind(&key.currency)
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .map(TransactionRow::into_domain)
        .collect()
    }
}

#[async_trait]
impl SettlementStore for PgStore {
    async fn find_order(&self, order_id: &str) -> Result<Option<SettlementOrder>, SettlementError> {
        let row = sqlx::query_as::<_, OrderRow>("SELECT * FROM settlement_orders WHERE order_id = $1")
            .bind(order_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(OrderRow::into_domain).transpose()
    }

    async fn create_order(
        &self,
        order: SettlementOrder,
        hold: Option<LedgerOperation>,
    ) -> Result<SettlementOrder, SettlementError> {
        let mut tx = self.begin().await?;

        if let Some(hold) = hold {
            let mut asset = lock_asset(&mut tx, &order.asset_key()).await?;
            apply_locked(&mut tx, &mut asset, &[hold]).await?;
        }

        let inserted = sqlx::query_as::<_, OrderRow>(
            r#"
            INSERT INTO settlement_orders (
                order_id, uid, amount, currency, token, chain_id, wallet, order_type,
                channel, notify_url, created_at, expire_at, processed, processed_at, status
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
            RETURNING *
            "#,
        )
        .bind(&order.order_id)
        .bind(&order.uid)
        .bind(&order.amount)
        .bind(&order.currency)
        .bind(&order.token)
        .bind(order.chain_id)
        .bind(&order.wallet)
        .bind(order.order_type.as_str())
        .bind(&order.channel)
        .bind(&order.notify_url)
        .bind(order.created_at)
        .bind(order.expire_at)
        .bind(order.processed)
        .bind(order.processed_at)
        .bind(order.status.as_str())
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                SettlementError::DuplicateOrder(order.order_id.clone())
            } else {
                e.into()
            }
        })?;

        tx.commit().await?;
        inserted.into_domain()
    }

    async fn refresh_expiry(
        &self,
        order_id: &str,
        expire_at: DateTime<Utc>,
    ) -> Result<Option<SettlementOrder>, SettlementError> {
        let row = sqlx::query_as::<_, OrderRow>(
            r#"
            UPDATE settlement_orders
            SET expire_at = $2
            WHERE order_id = $1 AND processed = FALSE AND status IN ('pending', 'approved')
            RETURNING *
            "#,
        )
        .bind(order_id)
        .bind(expire_at)
        .fetch_optional(&self.pool)
        .await?;
        row.map(OrderRow::into_domain).transpose()
    }

    async fn settle(
        &self,
        order_id: &str,
        bonus_rate: Option<&BigDecimal>,
    ) -> Result<SettleOutcome, SettlementError> {
        let mut tx = self.begin().await?;
        let mut order = lock_order(&mut tx, order_id)
            .await?
            .ok_or_else(|| SettlementError::OrderNotFound(order_id.to_string()))?;

        if order.processed {
            tx.rollback().await?;
            return Ok(SettleOutcome::AlreadyProcessed(order));
        }

        let ops = order.settlement_operations(bonus_rate);
        let mut asset = lock_asset(&mut tx, &order.asset_key()).await?;
        let transactions = apply_locked(&mut tx, &mut asset, &ops).await?;

        order.processed = true;
        order.processed_at = Some(Utc::now());
        order.status = OrderStatus::Finish;
        update_order_state(&mut tx, &order).await?;

        tx.commit().await?;
        Ok(SettleOutcome::Settled { order, transactions })
    }

    async fn cancel_expired_withdrawals(
        &self,
        cutoff: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<SettlementOrder>, SettlementError> {
        let mut tx = self.begin().await?;

        let candidates = sqlx::query_as::<_, OrderRow>(
            r#"
            SELECT * FROM settlement_orders
            WHERE order_type = 'withdraw' AND processed = FALSE
              AND status IN ('pending', 'approved') AND expire_at < $1
            ORDER BY expire_at ASC
            LIMIT $2
            FOR UPDATE SKIP LOCKED
            "#,
        )
        .bind(cutoff)
        .bind(limit)
        .fetch_all(&mut *tx)
        .await?;

        let mut cancelled = Vec::with_capacity(candidates.len());
        for row in candidates {
            let mut order = row.into_domain()?;

            // a failed release, including a lock timeout on a busy balance
            // row, only skips this order; the batch still commits
            sqlx::query("SAVEPOINT release_hold").execute(&mut *tx).await?;
            match release_hold(&mut tx, &mut order).await {
                Ok(()) => {
                    sqlx::query("RELEASE SAVEPOINT release_hold").execute(&mut *tx).await?;
                    cancelled.push(order);
                }
                Err(e) => {
                    sqlx::query("ROLLBACK TO SAVEPOINT release_hold").execute(&mut *tx).await?;
                    tracing::error!(order_id = %order.order_id, error = %e, "failed to release withdraw hold");
                }
            }
        }

        tx.commit().await?;
        Ok(cancelled)
    }
}

/// Cancels one expired withdraw order and unlocks its hold.
async fn release_hold(conn: &mut PgConnection, order: &mut SettlementOrder) -> Result<(), SettlementError> {
    let mut asset = lock_asset(conn, &order.asset_key()).await?;
    apply_locked(conn, &mut asset, &[order.release_operation()]).await?;
    order.status = OrderStatus::Cancel;
    update_order_state(conn, order).await
}

#[derive(Debug, sqlx::FromRow)]
struct AssetRow {
    user_id: String,
    currency: String,
    balance_real: BigDecimal,
    balance_bonus: BigDecimal,
    balance_locked: BigDecimal,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl AssetRow {
    fn into_domain(self) -> UserAsset {
        UserAsset {
            user_id: self.user_id,
            currency: self.currency,
            balance_real: self.balance_real,
            balance_bonus: self.balance_bonus,
            balance_locked: self.balance_locked,
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct TransactionRow {
    seq: i64,
    id: Uuid,
    user_id: String,
    currency: String,
    tx_type: String,
    source: Option<String>,
    status: String,
    amount: BigDecimal,
    balance_before: BigDecimal,
    balance_after: BigDecimal,
    reference_id: Option<String>,
    description: Option<String>,
    metadata: Option<serde_json::Value>,
    operator_id: Option<String>,
    created_at: DateTime<Utc>,
    processed_at: Option<DateTime<Utc>>,
}

impl TransactionRow {
    fn into_domain(self) -> Result<LedgerTransaction, LedgerError> {
        Ok(LedgerTransaction {
            id: self.id,
            seq: self.seq,
            user_id: self.user_id,
            currency: self.currency,
            tx_type: TransactionType::from_str(&self.tx_type)?,
            source: self.source.as_deref().map(BalanceSource::from_str).transpose()?,
            status: TransactionStatus::from_str(&self.status)?,
            amount: self.amount,
            balance_before: self.balance_before,
            balance_after: self.balance_after,
            reference_id: self.reference_id,
            description: self.description,
            metadata: self.metadata.map(serde_json::from_value).transpose().map_err(storage)?,
            operator_id: self.operator_id,
            created_at: self.created_at,
            processed_at: self.processed_at,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct OrderRow {
    id: i64,
    order_id: String,
    uid: String,
    amount: BigDecimal,
    currency: String,
    token: String,
    chain_id: i64,
    wallet: String,
    order_type: String,
    channel: Option<String>,
    notify_url: Option<String>,
    created_at: DateTime<Utc>,
    expire_at: DateTime<Utc>,
    processed: bool,
    processed_at: Option<DateTime<Utc>>,
    status: String,
}

impl OrderRow {
    fn into_domain(self) -> Result<SettlementOrder, SettlementError> {
        Ok(SettlementOrder {
            id: self.id,
            order_id: self.order_id,
            uid: self.uid,
            amount: self.amount,
            currency: self.currency,
            token: self.token,
            chain_id: self.chain_id,
            wallet: self.wallet,
            order_type: OrderType::from_str(&self.order_type)?,
            channel: self.channel,
            notify_url: self.notify_url,
            created_at: self.created_at,
            expire_at: self.expire_at,
            processed: self.processed,
            processed_at: self.processed_at,
            status: OrderStatus::from_str(&self.status)?,
        })
    }
}
