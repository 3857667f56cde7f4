//! Asset Ledger Service: the only entry point for balance mutations.
//!
//! Inputs are validated and parsed before the store takes any row lock;
//! every mutation is then a single atomic `LedgerStore::execute` call.

use bigdecimal::{BigDecimal, Zero};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::Arc;

use crate::domain::money::{self, MONEY_SCALE};
use crate::domain::{
    AssetKey, EntryContext, LedgerCommand, LedgerError, LedgerOperation, LedgerTransaction,
    TransactionMetadata, UserAsset,
};
use crate::ports::{HistoryPage, HistoryQuery, LedgerStore, HISTORY_DEFAULT_LIMIT, HISTORY_MAX_LIMIT};

#[derive(Debug, Clone, Deserialize)]
pub struct EntryRequest {
    pub user_id: String,
    pub currency: String,
    pub amount: String,
    #[serde(default)]
    pub reference_id: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub metadata: Option<BTreeMap<String, String>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DepositRequest {
    #[serde(flatten)]
    pub entry: EntryRequest,
    /// Fraction of `amount` granted as a separate BONUS_GRANT entry.
    #[serde(default)]
    pub bonus_rate: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GameRequest {
    pub user_id: String,
    pub currency: String,
    pub amount: String,
    pub game_id: String,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RefundRequest {
    pub user_id: String,
    pub currency: String,
    pub game_id: String,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AdjustRequest {
    pub user_id: String,
    pub currency: String,
    /// Signed decimal: positive credits, negative debits.
    pub amount: String,
    pub operator_id: String,
    #[serde(default)]
    pub description: Option<String>,
}

/// Balance read model. All amounts are decimal strings at storage scale.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BalanceView {
    pub user_id: String,
    pub currency: String,
    pub real: String,
    pub bonus: String,
    pub locked: String,
    pub total: String,
    pub withdrawable: String,
    pub available: String,
}

impl From<&UserAsset> for BalanceView {
    fn from(asset: &UserAsset) -> Self {
        let fmt = |value: BigDecimal| value.with_scale(MONEY_SCALE).to_string();
        Self {
            user_id: asset.user_id.clone(),
            currency: asset.currency.clone(),
            real: fmt(asset.balance_real.clone()),
            bonus: fmt(asset.balance_bonus.clone()),
            locked: fmt(asset.balance_locked.clone()),
            total: fmt(asset.total()),
            withdrawable: fmt(asset.withdrawable()),
            available: fmt(asset.available()),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ReconcileReport {
    pub stored: Option<BalanceView>,
    pub replayed: BalanceView,
    pub transactions: usize,
    pub matches: bool,
}

#[derive(Clone)]
pub struct AssetLedgerService {
    store: Arc<dyn LedgerStore>,
}

fn attributes(metadata: Option<BTreeMap<String, String>>) -> Result<Option<TransactionMetadata>, LedgerError> {
    metadata
        .filter(|entries| !entries.is_empty())
        .map(TransactionMetadata::attributes)
        .transpose()
}

fn parse_rate(raw: &str) -> Result<BigDecimal, LedgerError> {
    let rate = BigDecimal::from_str(raw.trim())
        .map_err(|_| LedgerError::InvalidRequest(format!("malformed bonus rate '{}'", raw)))?;
    if rate < BigDecimal::zero() {
        return Err(LedgerError::InvalidRequest("bonus rate must not be negative".to_string()));
    }
    Ok(rate)
}

fn game_id(raw: &str) -> Result<String, LedgerError> {
    let game_id = raw.trim();
    if game_id.is_empty() {
        return Err(LedgerError::InvalidRequest("game_id must not be empty".to_string()));
    }
    Ok(game_id.to_string())
}

impl AssetLedgerService {
    pub fn new(store: Arc<dyn LedgerStore>) -> Self {
        Self { store }
    }

    async fn run(&self, key: AssetKey, op: LedgerOperation) -> Result<Vec<LedgerTransaction>, LedgerError> {
        match self.store.execute(&key, vec![op]).await {
            Ok(written) => {
                for tx in &written {
                    tracing::info!(
                        user_id = %key.user_id,
                        currency = %key.currency,
                        tx_id = %tx.id,
                        tx_type = %tx.tx_type,
                        amount = %tx.amount,
                        balance_after = %tx.balance_after,
                        "ledger entry recorded"
                    );
                }
                Ok(written)
            }
            Err(e) => {
                tracing::info!(
                    user_id = %key.user_id,
                    currency = %key.currency,
                    code = e.code(),
                    "ledger operation rejected: {}",
                    e
                );
                Err(e)
            }
        }
    }

    pub async fn deposit(&self, req: DepositRequest) -> Result<Vec<LedgerTransaction>, LedgerError> {
        let DepositRequest { entry, bonus_rate } = req;
        let key = AssetKey::new(entry.user_id, entry.currency)?;
        let amount = money::parse_amount(&entry.amount)?;
        let bonus_rate = bonus_rate.as_deref().map(parse_rate).transpose()?;
        let metadata = attributes(entry.metadata)?;
        let context = EntryContext::new(entry.reference_id, entry.description)?;

        self.run(
            key,
            LedgerOperation::new(LedgerCommand::Deposit { amount, bonus_rate, metadata }, context),
        )
        .await
    }

    pub async fn withdraw(&self, req: EntryRequest) -> Result<Vec<LedgerTransaction>, LedgerError> {
        let key = AssetKey::new(req.user_id, req.currency)?;
        let amount = money::parse_amount(&req.amount)?;
        let metadata = attributes(req.metadata)?;
        let context = EntryContext::new(req.reference_id, req.description)?;

        self.run(key, LedgerOperation::new(LedgerCommand::Withdraw { amount, metadata }, context))
            .await
    }

    pub async fn bet(&self, req: GameRequest) -> Result<Vec<LedgerTransaction>, LedgerError> {
        let key = AssetKey::new(req.user_id, req.currency)?;
        let amount = money::parse_amount(&req.amount)?;
        let game_id = game_id(&req.game_id)?;
        let context = EntryContext::new(Some(game_id.clone()), req.description)?;

        self.run(key, LedgerOperation::new(LedgerCommand::Bet { amount, game_id }, context))
            .await
    }

    pub async fn win(&self, req: GameRequest) -> Result<Vec<LedgerTransaction>, LedgerError> {
        let key = AssetKey::new(req.user_id, req.currency)?;
        let amount = money::parse_amount(&req.amount)?;
        let game_id = game_id(&req.game_id)?;
        let context = EntryContext::new(Some(game_id.clone()), req.description)?;

        self.run(key, LedgerOperation::new(LedgerCommand::Win { amount, game_id }, context))
            .await
    }

    pub async fn refund(&self, req: RefundRequest) -> Result<Vec<LedgerTransaction>, LedgerError> {
        let key = AssetKey::new(req.user_id, req.currency)?;
        let game_id = game_id(&req.game_id)?;
        let context = EntryContext::new(Some(game_id.clone()), req.description)?;

        self.run(key, LedgerOperation::new(LedgerCommand::Refund { game_id }, context))
            .await
    }

    pub async fn lock_balance(&self, req: EntryRequest) -> Result<Vec<LedgerTransaction>, LedgerError> {
        let key = AssetKey::new(req.user_id, req.currency)?;
        let amount = money::parse_amount(&req.amount)?;
        let metadata = attributes(req.metadata)?;
        let context = EntryContext::new(req.reference_id, req.description)?;

        self.run(key, LedgerOperation::new(LedgerCommand::Lock { amount, metadata }, context))
            .await
    }

    pub async fn unlock_balance(&self, req: EntryRequest) -> Result<Vec<LedgerTransaction>, LedgerError> {
        let key = AssetKey::new(req.user_id, req.currency)?;
        let amount = money::parse_amount(&req.amount)?;
        let metadata = attributes(req.metadata)?;
        let context = EntryContext::new(req.reference_id, req.description)?;

        self.run(key, LedgerOperation::new(LedgerCommand::Unlock { amount, metadata }, context))
            .await
    }

    /// Administrative correction. Skips sufficiency checks; invariants still hold.
    pub async fn adjust(&self, req: AdjustRequest) -> Result<Vec<LedgerTransaction>, LedgerError> {
        let key = AssetKey::new(req.user_id, req.currency)?;
        let signed_amount = money::parse_signed_amount(&req.amount)?;
        let operator_id = req.operator_id.trim();
        if operator_id.is_empty() {
            return Err(LedgerError::InvalidRequest("operator_id must not be empty".to_string()));
        }
        let context = EntryContext::new(None, req.description)?.with_operator(operator_id);

        tracing::warn!(
            user_id = %key.user_id,
            currency = %key.currency,
            operator_id = %operator_id,
            amount = %signed_amount,
            "manual balance adjustment"
        );
        self.run(key, LedgerOperation::new(LedgerCommand::Adjust { signed_amount }, context))
            .await
    }

    pub async fn get_balance(&self, user_id: &str, currency: &str) -> Result<BalanceView, LedgerError> {
        let key = AssetKey::new(user_id, currency)?;
        let asset = self
            .store
            .get_asset(&key)
            .await?
            .unwrap_or_else(|| UserAsset::new(&key));
        Ok(BalanceView::from(&asset))
    }

    pub async fn list_balances(&self, user_id: &str) -> Result<Vec<BalanceView>, LedgerError> {
        let user_id = user_id.trim();
        if user_id.is_empty() {
            return Err(LedgerError::InvalidRequest("user_id must not be empty".to_string()));
        }
        let assets = self.store.list_assets(user_id).await?;
        Ok(assets.iter().map(BalanceView::from).collect())
    }

    pub async fn transaction_history(
        &self,
        user_id: &str,
        currency: Option<&str>,
        page: Option<u32>,
        limit: Option<u32>,
    ) -> Result<HistoryPage, LedgerError> {
        let currency = match currency.filter(|c| !c.trim().is_empty()) {
            Some(c) => Some(AssetKey::new(user_id, c)?.currency),
            None => None,
        };
        let user_id = user_id.trim();
        if user_id.is_empty() {
            return Err(LedgerError::InvalidRequest("user_id must not be empty".to_string()));
        }

        let query = HistoryQuery {
            user_id: user_id.to_string(),
            currency,
            page: page.unwrap_or(1).max(1),
            limit: limit.unwrap_or(HISTORY_DEFAULT_LIMIT).clamp(1, HISTORY_MAX_LIMIT),
        };
        self.store.transaction_history(&query).await
    }

    /// Rebuilds the row from its history and compares with the stored balances.
    pub async fn reconcile(&self, user_id: &str, currency: &str) -> Result<ReconcileReport, LedgerError> {
        let key = AssetKey::new(user_id, currency)?;
        let history = self.store.history_for_replay(&key).await?;
        let replayed = UserAsset::replay(&key, &history)?;
        let stored = self.store.get_asset(&key).await?;

        let matches = match &stored {
            Some(asset) => {
                asset.balance_real == replayed.balance_real
                    && asset.balance_bonus == replayed.balance_bonus
                    && asset.balance_locked == replayed.balance_locked
            }
            None => history.is_empty(),
        };
        if !matches {
            tracing::error!(user_id = %key.user_id, currency = %key.currency, "ledger replay does not match stored balance");
        }

        Ok(ReconcileReport {
            stored: stored.as_ref().map(BalanceView::from),
            replayed: BalanceView::from(&replayed),
            transactions: history.len(),
            matches,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::MemoryStore;
    use std::time::Duration;

    fn service() -> AssetLedgerService {
        AssetLedgerService::new(Arc::new(MemoryStore::new(Duration::from_secs(1))))
    }

    fn entry(amount: &str) -> EntryRequest {
        EntryRequest {
            user_id: "u1".into(),
            currency: "usdt".into(),
            amount: amount.into(),
            reference_id: None,
            description: None,
            metadata: None,
        }
    }

    #[tokio::test]
    async fn test_invalid_amount_is_rejected_before_touching_store() {
        let svc = service();
        for raw in ["0", "-1", "abc", "1.123456789"] {
            let err = svc.withdraw(entry(raw)).await.unwrap_err();
            assert!(matches!(err, LedgerError::InvalidAmount(_)), "{}", raw);
        }
        assert!(svc.list_balances("u1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_deposit_with_bonus_rate_and_balance_view() {
        let svc = service();
        let written = svc
            .deposit(DepositRequest {
                entry: entry("100"),
                bonus_rate: Some("0.1".into()),
            })
            .await
            .unwrap();
        assert_eq!(written.len(), 2);

        let balance = svc.get_balance("u1", "USDT").await.unwrap();
        assert_eq!(balance.real, "100.00000000");
        assert_eq!(balance.bonus, "10.00000000");
        assert_eq!(balance.withdrawable, "100.00000000");
        assert_eq!(balance.available, "110.00000000");
    }

    #[tokio::test]
    async fn test_adjust_requires_operator() {
        let svc = service();
        let err = svc
            .adjust(AdjustRequest {
                user_id: "u1".into(),
                currency: "USDT".into(),
                amount: "5".into(),
                operator_id: " ".into(),
                description: None,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::InvalidRequest(_)));

        let written = svc
            .adjust(AdjustRequest {
                user_id: "u1".into(),
                currency: "USDT".into(),
                amount: "5".into(),
                operator_id: "ops-7".into(),
                description: Some("goodwill".into()),
            })
            .await
            .unwrap();
        assert_eq!(written[0].operator_id.as_deref(), Some("ops-7"));
    }

    #[tokio::test]
    async fn test_history_limit_is_capped() {
        let svc = service();
        svc.deposit(DepositRequest { entry: entry("1"), bonus_rate: None }).await.unwrap();
        let page = svc.transaction_history("u1", Some("usdt"), None, Some(1000)).await.unwrap();
        assert_eq!(page.limit, HISTORY_MAX_LIMIT);
        assert_eq!(page.items.len(), 1);
    }

    #[tokio::test]
    async fn test_reconcile_matches_after_activity() {
        let svc = service();
        svc.deposit(DepositRequest { entry: entry("50"), bonus_rate: Some("0.2".into()) })
            .await
            .unwrap();
        svc.bet(GameRequest {
            user_id: "u1".into(),
            currency: "USDT".into(),
            amount: "15".into(),
            game_id: "g-1".into(),
            description: None,
        })
        .await
        .unwrap();
        svc.lock_balance(entry("5")).await.unwrap();

        let report = svc.reconcile("u1", "USDT").await.unwrap();
        assert!(report.matches);
        assert_eq!(report.transactions, 4);
    }
}
