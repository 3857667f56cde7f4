pub mod ledger;
pub mod mutex;
pub mod order_sweeper;
pub mod request_queue;
pub mod settlement;
pub mod signer;

pub use ledger::AssetLedgerService;
pub use mutex::{DistributedMutex, LocalMutex, RedisMutex};
pub use order_sweeper::run_sweeper;
pub use request_queue::{run_dispatcher, RequestQueue};
pub use settlement::{ConfirmationOutcome, SettlementService};
pub use signer::TypedDataSigner;
