//! Immutable ledger entries.
//!
//! A [`LedgerTransaction`] is written in the same atomic unit as the balance
//! change it describes and is never updated afterwards. The economic sign of
//! an entry is derived from its type; `amount` is always positive.

use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use super::LedgerError;

pub const METADATA_MAX_ENTRIES: usize = 32;
pub const METADATA_KEY_MAX_LEN: usize = 64;
pub const METADATA_VALUE_MAX_LEN: usize = 256;
pub const WITHDRAW_HOLD_PURPOSE: &str = "withdraw";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionType {
    Deposit,
    BonusGrant,
    GameBet,
    GameWin,
    GameRefund,
    Withdraw,
    Transfer,
    Lock,
    Unlock,
    Adjustment,
}

impl TransactionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionType::Deposit => "DEPOSIT",
            TransactionType::BonusGrant => "BONUS_GRANT",
            TransactionType::GameBet => "GAME_BET",
            TransactionType::GameWin => "GAME_WIN",
            TransactionType::GameRefund => "GAME_REFUND",
            TransactionType::Withdraw => "WITHDRAW",
            TransactionType::Transfer => "TRANSFER",
            TransactionType::Lock => "LOCK",
            TransactionType::Unlock => "UNLOCK",
            TransactionType::Adjustment => "ADJUSTMENT",
        }
    }

    /// Types that reduce the available balance.
    pub fn is_outflow(&self) -> bool {
        matches!(
            self,
            TransactionType::GameBet
                | TransactionType::Withdraw
                | TransactionType::Lock
                | TransactionType::Transfer
        )
    }
}

impl fmt::Display for TransactionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransactionType {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "DEPOSIT" => Ok(TransactionType::Deposit),
            "BONUS_GRANT" => Ok(TransactionType::BonusGrant),
            "GAME_BET" => Ok(TransactionType::GameBet),
            "GAME_WIN" => Ok(TransactionType::GameWin),
            "GAME_REFUND" => Ok(TransactionType::GameRefund),
            "WITHDRAW" => Ok(TransactionType::Withdraw),
            "TRANSFER" => Ok(TransactionType::Transfer),
            "LOCK" => Ok(TransactionType::Lock),
            "UNLOCK" => Ok(TransactionType::Unlock),
            "ADJUSTMENT" => Ok(TransactionType::Adjustment),
            other => Err(LedgerError::Storage(format!("unknown transaction type '{}'", other))),
        }
    }
}

/// Balance component moved by an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BalanceSource {
    Real,
    Bonus,
    Locked,
}

impl BalanceSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            BalanceSource::Real => "REAL",
            BalanceSource::Bonus => "BONUS",
            BalanceSource::Locked => "LOCKED",
        }
    }
}

impl FromStr for BalanceSource {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "REAL" => Ok(BalanceSource::Real),
            "BONUS" => Ok(BalanceSource::Bonus),
            "LOCKED" => Ok(BalanceSource::Locked),
            other => Err(LedgerError::Storage(format!("unknown balance source '{}'", other))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionStatus {
    Pending,
    Success,
    Failed,
    Cancelled,
}

impl TransactionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionStatus::Pending => "PENDING",
            TransactionStatus::Success => "SUCCESS",
            TransactionStatus::Failed => "FAILED",
            TransactionStatus::Cancelled => "CANCELLED",
        }
    }
}

impl FromStr for TransactionStatus {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(TransactionStatus::Pending),
            "SUCCESS" => Ok(TransactionStatus::Success),
            "FAILED" => Ok(TransactionStatus::Failed),
            "CANCELLED" => Ok(TransactionStatus::Cancelled),
            other => Err(LedgerError::Storage(format!("unknown transaction status '{}'", other))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdjustmentDirection {
    Credit,
    Debit,
}

/// How a bet was funded. Wins and refunds read this back.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BetMetadata {
    pub bonus_portion: BigDecimal,
    pub real_portion: BigDecimal,
}

/// Typed metadata attached to a ledger entry, stored as tagged JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TransactionMetadata {
    Bet(BetMetadata),
    Win {
        credited_to: BalanceSource,
        bet_transaction_id: Option<Uuid>,
    },
    Refund {
        bet_transaction_id: Uuid,
        bonus_portion: BigDecimal,
        real_portion: BigDecimal,
    },
    Deposit {
        order_id: Option<String>,
        chain_id: Option<i64>,
        wallet: Option<String>,
    },
    BonusGrant {
        rate: BigDecimal,
        deposit_transaction_id: Uuid,
    },
    Withdraw {
        order_id: Option<String>,
        chain_id: Option<i64>,
        wallet: Option<String>,
    },
    Hold {
        order_id: Option<String>,
        purpose: String,
    },
    Adjustment {
        direction: AdjustmentDirection,
    },
    Attributes {
        entries: BTreeMap<String, String>,
    },
}

impl TransactionMetadata {
    /// Builds caller-supplied free-form attributes, enforcing size limits.
    pub fn attributes(entries: BTreeMap<String, String>) -> Result<Self, LedgerError> {
        if entries.len() > METADATA_MAX_ENTRIES {
            return Err(LedgerError::InvalidRequest(format!(
                "metadata must have at most {} entries",
                METADATA_MAX_ENTRIES
            )));
        }
        for (key, value) in &entries {
            if key.trim().is_empty() || key.len() > METADATA_KEY_MAX_LEN {
                return Err(LedgerError::InvalidRequest(format!(
                    "metadata key '{}' must be 1-{} characters",
                    key, METADATA_KEY_MAX_LEN
                )));
            }
            if value.len() > METADATA_VALUE_MAX_LEN {
                return Err(LedgerError::InvalidRequest(format!(
                    "metadata value for '{}' exceeds {} characters",
                    key, METADATA_VALUE_MAX_LEN
                )));
            }
        }
        Ok(TransactionMetadata::Attributes { entries })
    }

    pub fn as_bet(&self) -> Option<&BetMetadata> {
        match self {
            TransactionMetadata::Bet(bet) => Some(bet),
            _ => None,
        }
    }

    pub fn is_withdraw_hold(&self) -> bool {
        matches!(self, TransactionMetadata::Hold { purpose, .. } if purpose == WITHDRAW_HOLD_PURPOSE)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerTransaction {
    pub id: Uuid,
    /// Creation order within the store.
    pub seq: i64,
    pub user_id: String,
    pub currency: String,
    #[serde(rename = "type")]
    pub tx_type: TransactionType,
    pub source: Option<BalanceSource>,
    pub status: TransactionStatus,
    pub amount: BigDecimal,
    pub balance_before: BigDecimal,
    pub balance_after: BigDecimal,
    pub reference_id: Option<String>,
    pub description: Option<String>,
    pub metadata: Option<TransactionMetadata>,
    pub operator_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
}

impl LedgerTransaction {
    /// Effect of this entry on the available balance.
    pub fn signed_amount(&self) -> BigDecimal {
        let negative = match (&self.tx_type, &self.metadata) {
            (
                TransactionType::Adjustment,
                Some(TransactionMetadata::Adjustment { direction }),
            ) => *direction == AdjustmentDirection::Debit,
            (tx_type, _) => tx_type.is_outflow(),
        };

        if negative {
            -self.amount.clone()
        } else {
            self.amount.clone()
        }
    }
}
