//! Settlement orders: one record per on-chain deposit or withdraw intent.

use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::asset::{AssetKey, EntryContext, LedgerCommand, LedgerOperation};
use super::transaction::{TransactionMetadata, WITHDRAW_HOLD_PURPOSE};
use super::LedgerError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderType {
    Deposit,
    Withdraw,
}

impl OrderType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderType::Deposit => "deposit",
            OrderType::Withdraw => "withdraw",
        }
    }
}

impl fmt::Display for OrderType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OrderType {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "deposit" => Ok(OrderType::Deposit),
            "withdraw" => Ok(OrderType::Withdraw),
            other => Err(LedgerError::Storage(format!("unknown order type '{}'", other))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderStatus {
    Pending,
    Approved,
    Cancel,
    Finish,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Pending => "pending",
            OrderStatus::Approved => "approved",
            OrderStatus::Cancel => "cancel",
            OrderStatus::Finish => "finish",
        }
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OrderStatus {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(OrderStatus::Pending),
            "approved" => Ok(OrderStatus::Approved),
            "cancel" => Ok(OrderStatus::Cancel),
            "finish" => Ok(OrderStatus::Finish),
            other => Err(LedgerError::Storage(format!("unknown order status '{}'", other))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SettlementOrder {
    /// Internal identity assigned by the store.
    pub id: i64,
    /// Client-supplied identifier, unique per intent. Signed as `systemId`.
    pub order_id: String,
    pub uid: String,
    pub amount: BigDecimal,
    pub currency: String,
    pub token: String,
    pub chain_id: i64,
    pub wallet: String,
    pub order_type: OrderType,
    pub channel: Option<String>,
    pub notify_url: Option<String>,
    pub created_at: DateTime<Utc>,
    pub expire_at: DateTime<Utc>,
    pub processed: bool,
    pub processed_at: Option<DateTime<Utc>>,
    pub status: OrderStatus,
}

impl SettlementOrder {
    /// Unprocessed and still awaiting confirmation; expiry may be refreshed.
    pub fn is_open(&self) -> bool {
        !self.processed && matches!(self.status, OrderStatus::Pending | OrderStatus::Approved)
    }

    pub fn asset_key(&self) -> AssetKey {
        AssetKey {
            user_id: self.uid.clone(),
            currency: self.currency.clone(),
        }
    }

    fn context(&self) -> EntryContext {
        EntryContext {
            reference_id: Some(self.order_id.clone()),
            description: Some(format!("on-chain {} on chain {}", self.order_type, self.chain_id)),
            operator_id: None,
        }
    }

    fn hold_metadata(&self) -> Option<TransactionMetadata> {
        Some(TransactionMetadata::Hold {
            order_id: Some(self.order_id.clone()),
            purpose: WITHDRAW_HOLD_PURPOSE.to_string(),
        })
    }

    /// Lock taken when a withdraw authorization is issued.
    pub fn hold_operation(&self) -> LedgerOperation {
        LedgerOperation::new(
            LedgerCommand::Lock {
                amount: self.amount.clone(),
                metadata: self.hold_metadata(),
            },
            self.context(),
        )
    }

    /// Releases the withdraw hold when the order is cancelled.
    pub fn release_operation(&self) -> LedgerOperation {
        LedgerOperation::new(
            LedgerCommand::Unlock {
                amount: self.amount.clone(),
                metadata: self.hold_metadata(),
            },
            self.context(),
        )
    }

    /// Ledger effect of a confirmed on-chain transfer, applied atomically
    /// together with marking the order processed.
    pub fn settlement_operations(&self, bonus_rate: Option<&BigDecimal>) -> Vec<LedgerOperation> {
        match self.order_type {
            OrderType::Deposit => vec![LedgerOperation::new(
                LedgerCommand::Deposit {
                    amount: self.amount.clone(),
                    bonus_rate: bonus_rate.cloned(),
                    metadata: Some(TransactionMetadata::Deposit {
                        order_id: Some(self.order_id.clone()),
                        chain_id: Some(self.chain_id),
                        wallet: Some(self.wallet.clone()),
                    }),
                },
                self.context(),
            )],
            OrderType::Withdraw => {
                let withdraw = LedgerOperation::new(
                    LedgerCommand::Withdraw {
                        amount: self.amount.clone(),
                        metadata: Some(TransactionMetadata::Withdraw {
                            order_id: Some(self.order_id.clone()),
                            chain_id: Some(self.chain_id),
                            wallet: Some(self.wallet.clone()),
                        }),
                    },
                    self.context(),
                );
                // a cancelled order already had its hold released by the sweeper
                if self.status == OrderStatus::Cancel {
                    vec![withdraw]
                } else {
                    vec![self.release_operation(), withdraw]
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn order(order_type: OrderType, status: OrderStatus) -> SettlementOrder {
        let now = Utc::now();
        SettlementOrder {
            id: 1,
            order_id: "ord-1".to_string(),
            uid: "user-1".to_string(),
            amount: BigDecimal::from(25),
            currency: "USDT".to_string(),
            token: "0x00000000000000000000000000000000000000aa".to_string(),
            chain_id: 56,
            wallet: "0x00000000000000000000000000000000000000bb".to_string(),
            order_type,
            channel: None,
            notify_url: None,
            created_at: now,
            expire_at: now + Duration::minutes(5),
            processed: false,
            processed_at: None,
            status,
        }
    }

    #[test]
    fn test_deposit_settles_as_single_deposit() {
        let ops = order(OrderType::Deposit, OrderStatus::Pending).settlement_operations(None);
        assert_eq!(ops.len(), 1);
        assert!(matches!(ops[0].command, LedgerCommand::Deposit { .. }));
        assert_eq!(ops[0].context.reference_id.as_deref(), Some("ord-1"));
    }

    #[test]
    fn test_withdraw_releases_hold_then_debits() {
        let ops = order(OrderType::Withdraw, OrderStatus::Pending).settlement_operations(None);
        assert_eq!(ops.len(), 2);
        assert!(matches!(ops[0].command, LedgerCommand::Unlock { .. }));
        assert!(matches!(ops[1].command, LedgerCommand::Withdraw { .. }));
    }

    #[test]
    fn test_cancelled_withdraw_debits_without_release() {
        let ops = order(OrderType::Withdraw, OrderStatus::Cancel).settlement_operations(None);
        assert_eq!(ops.len(), 1);
        assert!(matches!(ops[0].command, LedgerCommand::Withdraw { .. }));
    }

    #[test]
    fn test_is_open() {
        assert!(order(OrderType::Deposit, OrderStatus::Pending).is_open());
        assert!(order(OrderType::Deposit, OrderStatus::Approved).is_open());
        assert!(!order(OrderType::Deposit, OrderStatus::Cancel).is_open());

        let mut processed = order(OrderType::Deposit, OrderStatus::Pending);
        processed.processed = true;
        assert!(!processed.is_open());
    }
}
