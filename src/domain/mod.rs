//! Domain model for the balance ledger and on-chain settlement orders.
//! Framework-agnostic: nothing in here performs I/O.

pub mod asset;
pub mod error;
pub mod money;
pub mod order;
pub mod transaction;

pub use asset::{AssetKey, BetLookup, EntryContext, GameContext, LedgerCommand, LedgerOperation, Posting, UserAsset};
pub use error::{LedgerError, SettlementError};
pub use order::{OrderStatus, OrderType, SettlementOrder};
pub use transaction::{
    AdjustmentDirection, BalanceSource, BetMetadata, LedgerTransaction, TransactionMetadata,
    TransactionStatus, TransactionType,
};
