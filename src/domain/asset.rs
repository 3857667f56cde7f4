//! Per-user, per-currency balance record and the ledger commands that mutate it.
//!
//! [`UserAsset::apply`] is the single place where balances change. Stores call
//! it while holding the row lock and persist the returned [`Posting`]s in the
//! same atomic unit; on error nothing is written.

use bigdecimal::{BigDecimal, Zero};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::money::{self, MONEY_SCALE};
use super::transaction::{
    AdjustmentDirection, BalanceSource, BetMetadata, LedgerTransaction, TransactionMetadata,
    TransactionStatus, TransactionType,
};
use super::LedgerError;

pub const USER_ID_MAX_LEN: usize = 64;
pub const CURRENCY_MAX_LEN: usize = 16;
pub const REFERENCE_MAX_LEN: usize = 128;
pub const DESCRIPTION_MAX_LEN: usize = 512;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AssetKey {
    pub user_id: String,
    pub currency: String,
}

impl AssetKey {
    /// Validates the pair. Currency codes are case-insensitive and stored upper-case.
    pub fn new(user_id: impl Into<String>, currency: impl Into<String>) -> Result<Self, LedgerError> {
        let user_id: String = user_id.into();
        let currency: String = currency.into();
        let user_id = user_id.trim().to_string();
        let currency = currency.trim().to_ascii_uppercase();

        if user_id.is_empty() || user_id.len() > USER_ID_MAX_LEN {
            return Err(LedgerError::InvalidRequest(format!(
                "user_id must be 1-{} characters",
                USER_ID_MAX_LEN
            )));
        }
        if currency.is_empty()
            || currency.len() > CURRENCY_MAX_LEN
            || !currency.chars().all(|ch| ch.is_ascii_alphanumeric())
        {
            return Err(LedgerError::InvalidRequest(format!(
                "currency must be 1-{} alphanumeric characters",
                CURRENCY_MAX_LEN
            )));
        }

        Ok(Self { user_id, currency })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserAsset {
    pub user_id: String,
    pub currency: String,
    pub balance_real: BigDecimal,
    pub balance_bonus: BigDecimal,
    pub balance_locked: BigDecimal,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Reference, description and operator shared by every entry a command emits.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EntryContext {
    pub reference_id: Option<String>,
    pub description: Option<String>,
    pub operator_id: Option<String>,
}

impl EntryContext {
    pub fn new(reference_id: Option<String>, description: Option<String>) -> Result<Self, LedgerError> {
        if reference_id.as_ref().is_some_and(|r| r.len() > REFERENCE_MAX_LEN) {
            return Err(LedgerError::InvalidRequest(format!(
                "reference_id must be at most {} characters",
                REFERENCE_MAX_LEN
            )));
        }
        let description = description
            .map(|d| crate::validation::sanitize_string(&d))
            .filter(|d| !d.is_empty());
        if description.as_ref().is_some_and(|d| d.len() > DESCRIPTION_MAX_LEN) {
            return Err(LedgerError::InvalidRequest(format!(
                "description must be at most {} characters",
                DESCRIPTION_MAX_LEN
            )));
        }
        Ok(Self {
            reference_id,
            description,
            operator_id: None,
        })
    }

    pub fn with_operator(mut self, operator_id: impl Into<String>) -> Self {
        self.operator_id = Some(operator_id.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum LedgerCommand {
    Deposit {
        amount: BigDecimal,
        bonus_rate: Option<BigDecimal>,
        metadata: Option<TransactionMetadata>,
    },
    Withdraw {
        amount: BigDecimal,
        metadata: Option<TransactionMetadata>,
    },
    Bet {
        amount: BigDecimal,
        game_id: String,
    },
    Win {
        amount: BigDecimal,
        game_id: String,
    },
    Refund {
        game_id: String,
    },
    Lock {
        amount: BigDecimal,
        metadata: Option<TransactionMetadata>,
    },
    Unlock {
        amount: BigDecimal,
        metadata: Option<TransactionMetadata>,
    },
    Adjust {
        signed_amount: BigDecimal,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct LedgerOperation {
    pub command: LedgerCommand,
    pub context: EntryContext,
}

impl LedgerOperation {
    pub fn new(command: LedgerCommand, context: EntryContext) -> Self {
        Self { command, context }
    }

    /// Bet that must be loaded before applying this operation.
    pub fn bet_lookup(&self) -> Option<BetLookup<'_>> {
        match &self.command {
            LedgerCommand::Win { game_id, .. } => Some(BetLookup {
                game_id,
                unrefunded_only: false,
            }),
            LedgerCommand::Refund { game_id } => Some(BetLookup {
                game_id,
                unrefunded_only: true,
            }),
            _ => None,
        }
    }
}

/// Which GAME_BET a win or refund resolves against.
///
/// Wins look at the latest bet for the game. Refunds skip bets that already
/// have a GAME_REFUND pointing at them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BetLookup<'a> {
    pub game_id: &'a str,
    pub unrefunded_only: bool,
}

/// The bet a win or refund resolves against on this balance row.
#[derive(Debug, Clone, PartialEq)]
pub struct GameContext {
    pub bet_transaction_id: Uuid,
    pub bet: BetMetadata,
    pub refunded: bool,
}

/// Where a win is credited.
///
/// Bets that consumed any bonus funds pay out to bonus; bets funded purely
/// from real funds pay out to real; a win with no recorded bet pays to bonus.
pub fn win_credit_source(game: Option<&GameContext>) -> BalanceSource {
    match game {
        Some(ctx) if ctx.bet.bonus_portion > BigDecimal::zero() => BalanceSource::Bonus,
        Some(_) => BalanceSource::Real,
        None => BalanceSource::Bonus,
    }
}

/// A ledger entry produced by [`UserAsset::apply`], not yet persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct Posting {
    pub id: Uuid,
    pub tx_type: TransactionType,
    pub source: Option<BalanceSource>,
    pub amount: BigDecimal,
    pub balance_before: BigDecimal,
    pub balance_after: BigDecimal,
    pub metadata: Option<TransactionMetadata>,
    pub context: EntryContext,
}

impl Posting {
    pub fn into_transaction(self, key: &AssetKey, seq: i64, now: DateTime<Utc>) -> LedgerTransaction {
        LedgerTransaction {
            id: self.id,
            seq,
            user_id: key.user_id.clone(),
            currency: key.currency.clone(),
            tx_type: self.tx_type,
            source: self.source,
            status: TransactionStatus::Success,
            amount: self.amount,
            balance_before: self.balance_before,
            balance_after: self.balance_after,
            reference_id: self.context.reference_id,
            description: self.context.description,
            metadata: self.metadata,
            operator_id: self.context.operator_id,
            created_at: now,
            processed_at: Some(now),
        }
    }
}

impl UserAsset {
    pub fn new(key: &AssetKey) -> Self {
        let now = Utc::now();
        Self {
            user_id: key.user_id.clone(),
            currency: key.currency.clone(),
            balance_real: money::zero(),
            balance_bonus: money::zero(),
            balance_locked: money::zero(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn key(&self) -> AssetKey {
        AssetKey {
            user_id: self.user_id.clone(),
            currency: self.currency.clone(),
        }
    }

    pub fn total(&self) -> BigDecimal {
        &self.balance_real + &self.balance_bonus
    }

    pub fn withdrawable(&self) -> BigDecimal {
        self.balance_real.clone()
    }

    pub fn available(&self) -> BigDecimal {
        self.total() - &self.balance_locked
    }

    pub fn check_invariants(&self) -> Result<(), LedgerError> {
        let zero = BigDecimal::zero();
        if self.balance_real < zero || self.balance_bonus < zero || self.balance_locked < zero {
            return Err(LedgerError::InvariantViolation(format!(
                "negative component (real {}, bonus {}, locked {})",
                self.balance_real, self.balance_bonus, self.balance_locked
            )));
        }
        if self.balance_locked > self.total() {
            return Err(LedgerError::InvariantViolation(format!(
                "locked {} exceeds total {}",
                self.balance_locked,
                self.total()
            )));
        }
        Ok(())
    }

    /// Applies one operation. On success the balances are updated and the
    /// resulting entries returned; on error `self` is left unchanged.
    pub fn apply(
        &mut self,
        op: &LedgerOperation,
        game: Option<&GameContext>,
    ) -> Result<Vec<Posting>, LedgerError> {
        let mut next = self.clone();
        let mut postings = Vec::with_capacity(2);

        match &op.command {
            LedgerCommand::Deposit {
                amount,
                bonus_rate,
                metadata,
            } => {
                let deposit = next.post(
                    TransactionType::Deposit,
                    BalanceSource::Real,
                    amount,
                    metadata.clone(),
                    &op.context,
                    |asset, amt| asset.balance_real += amt,
                );
                let deposit_id = deposit.id;
                postings.push(deposit);

                if let Some(rate) = bonus_rate.as_ref().filter(|r| **r > BigDecimal::zero()) {
                    let bonus = money::to_storage_scale(&(amount * rate));
                    if bonus > BigDecimal::zero() {
                        postings.push(next.post(
                            TransactionType::BonusGrant,
                            BalanceSource::Bonus,
                            &bonus,
                            Some(TransactionMetadata::BonusGrant {
                                rate: rate.clone(),
                                deposit_transaction_id: deposit_id,
                            }),
                            &op.context,
                            |asset, amt| asset.balance_bonus += amt,
                        ));
                    }
                }
            }

            LedgerCommand::Withdraw { amount, metadata } => {
                next.require_withdrawable(amount)?;
                next.require_available(amount)?;
                postings.push(next.post(
                    TransactionType::Withdraw,
                    BalanceSource::Real,
                    amount,
                    metadata.clone(),
                    &op.context,
                    |asset, amt| asset.balance_real -= amt,
                ));
            }

            LedgerCommand::Bet { amount, .. } => {
                next.require_available(amount)?;

                let bonus_portion = if next.balance_bonus < *amount {
                    next.balance_bonus.clone()
                } else {
                    amount.clone()
                };
                let real_portion = amount - &bonus_portion;
                let source = if bonus_portion > BigDecimal::zero() {
                    BalanceSource::Bonus
                } else {
                    BalanceSource::Real
                };
                let split = BetMetadata {
                    bonus_portion: bonus_portion.clone(),
                    real_portion: real_portion.clone(),
                };

                postings.push(next.post(
                    TransactionType::GameBet,
                    source,
                    amount,
                    Some(TransactionMetadata::Bet(split)),
                    &op.context,
                    |asset, _| {
                        asset.balance_bonus -= &bonus_portion;
                        asset.balance_real -= &real_portion;
                    },
                ));
            }

            LedgerCommand::Win { amount, .. } => {
                let credited_to = win_credit_source(game);
                postings.push(next.post(
                    TransactionType::GameWin,
                    credited_to,
                    amount,
                    Some(TransactionMetadata::Win {
                        credited_to,
                        bet_transaction_id: game.map(|g| g.bet_transaction_id),
                    }),
                    &op.context,
                    |asset, amt| match credited_to {
                        BalanceSource::Bonus => asset.balance_bonus += amt,
                        _ => asset.balance_real += amt,
                    },
                ));
            }

            LedgerCommand::Refund { game_id } => {
                let ctx = game
                    .filter(|g| !g.refunded)
                    .ok_or_else(|| LedgerError::BetNotFound(game_id.clone()))?;
                let bonus_portion = ctx.bet.bonus_portion.clone();
                let real_portion = ctx.bet.real_portion.clone();
                let amount = &bonus_portion + &real_portion;
                let source = if bonus_portion > BigDecimal::zero() {
                    BalanceSource::Bonus
                } else {
                    BalanceSource::Real
                };

                postings.push(next.post(
                    TransactionType::GameRefund,
                    source,
                    &amount,
                    Some(TransactionMetadata::Refund {
                        bet_transaction_id: ctx.bet_transaction_id,
                        bonus_portion: bonus_portion.clone(),
                        real_portion: real_portion.clone(),
                    }),
                    &op.context,
                    |asset, _| {
                        asset.balance_bonus += &bonus_portion;
                        asset.balance_real += &real_portion;
                    },
                ));
            }

            LedgerCommand::Lock { amount, metadata } => {
                // a withdraw hold reserves funds that must later leave as REAL
                if metadata.as_ref().is_some_and(TransactionMetadata::is_withdraw_hold) {
                    next.require_withdrawable(amount)?;
                }
                next.require_available(amount)?;
                postings.push(next.post(
                    TransactionType::Lock,
                    BalanceSource::Locked,
                    amount,
                    metadata.clone(),
                    &op.context,
                    |asset, amt| asset.balance_locked += amt,
                ));
            }

            LedgerCommand::Unlock { amount, metadata } => {
                if next.balance_locked < *amount {
                    return Err(LedgerError::InvalidUnlockAmount {
                        locked: next.balance_locked.clone(),
                        requested: amount.clone(),
                    });
                }
                postings.push(next.post(
                    TransactionType::Unlock,
                    BalanceSource::Locked,
                    amount,
                    metadata.clone(),
                    &op.context,
                    |asset, amt| asset.balance_locked -= amt,
                ));
            }

            LedgerCommand::Adjust { signed_amount } => {
                let direction = if *signed_amount < BigDecimal::zero() {
                    AdjustmentDirection::Debit
                } else {
                    AdjustmentDirection::Credit
                };
                let magnitude = signed_amount.abs();
                postings.push(next.post(
                    TransactionType::Adjustment,
                    BalanceSource::Real,
                    &magnitude,
                    Some(TransactionMetadata::Adjustment { direction }),
                    &op.context,
                    |asset, _| asset.balance_real += signed_amount,
                ));
            }
        }

        next.check_invariants()?;
        next.updated_at = Utc::now();
        *self = next;
        Ok(postings)
    }

    fn require_withdrawable(&self, amount: &BigDecimal) -> Result<(), LedgerError> {
        let withdrawable = self.withdrawable();
        if withdrawable < *amount {
            return Err(LedgerError::InsufficientWithdrawableBalance {
                withdrawable,
                requested: amount.clone(),
            });
        }
        Ok(())
    }

    fn require_available(&self, amount: &BigDecimal) -> Result<(), LedgerError> {
        let available = self.available();
        if available < *amount {
            return Err(LedgerError::InsufficientBalance {
                available,
                requested: amount.clone(),
            });
        }
        Ok(())
    }

    fn post(
        &mut self,
        tx_type: TransactionType,
        source: BalanceSource,
        amount: &BigDecimal,
        metadata: Option<TransactionMetadata>,
        context: &EntryContext,
        mutate: impl FnOnce(&mut UserAsset, &BigDecimal),
    ) -> Posting {
        let balance_before = self.available().with_scale(MONEY_SCALE);
        mutate(self, amount);
        self.normalize();
        let balance_after = self.available().with_scale(MONEY_SCALE);

        Posting {
            id: Uuid::new_v4(),
            tx_type,
            source: Some(source),
            amount: amount.with_scale(MONEY_SCALE),
            balance_before,
            balance_after,
            metadata,
            context: context.clone(),
        }
    }

    fn normalize(&mut self) {
        self.balance_real = self.balance_real.with_scale(MONEY_SCALE);
        self.balance_bonus = self.balance_bonus.with_scale(MONEY_SCALE);
        self.balance_locked = self.balance_locked.with_scale(MONEY_SCALE);
    }

    /// Rebuilds the balance triple from a row's history in creation order.
    pub fn replay<'a>(
        key: &AssetKey,
        history: impl IntoIterator<Item = &'a LedgerTransaction>,
    ) -> Result<UserAsset, LedgerError> {
        let mut asset = UserAsset::new(key);

        for tx in history {
            let amount = &tx.amount;
            match tx.tx_type {
                TransactionType::Deposit => asset.balance_real += amount,
                TransactionType::BonusGrant => asset.balance_bonus += amount,
                TransactionType::GameWin => match tx.source {
                    Some(BalanceSource::Bonus) => asset.balance_bonus += amount,
                    _ => asset.balance_real += amount,
                },
                TransactionType::GameBet => {
                    let split = tx
                        .metadata
                        .as_ref()
                        .and_then(TransactionMetadata::as_bet)
                        .ok_or_else(|| {
                            LedgerError::Storage(format!("bet {} is missing its funding split", tx.id))
                        })?;
                    asset.balance_bonus -= &split.bonus_portion;
                    asset.balance_real -= &split.real_portion;
                }
                TransactionType::GameRefund => match &tx.metadata {
                    Some(TransactionMetadata::Refund {
                        bonus_portion,
                        real_portion,
                        ..
                    }) => {
                        asset.balance_bonus += bonus_portion;
                        asset.balance_real += real_portion;
                    }
                    _ => asset.balance_real += amount,
                },
                TransactionType::Withdraw | TransactionType::Transfer => asset.balance_real -= amount,
                TransactionType::Lock => asset.balance_locked += amount,
                TransactionType::Unlock => asset.balance_locked -= amount,
                TransactionType::Adjustment => asset.balance_real += tx.signed_amount(),
            }
            asset.normalize();
        }

        Ok(asset)
    }
}
