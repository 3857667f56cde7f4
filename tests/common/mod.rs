#![allow(dead_code)]

use async_trait::async_trait;
use std::sync::Arc;
use std::time::{Duration, Instant};

use ledger_core::adapters::MemoryStore;
use ledger_core::config::tokens::{SupportedToken, TokenRegistry};
use ledger_core::health::DependencyChecker;
use ledger_core::middleware::{AdminKey, RequestLogSettings, WebhookSecret};
use ledger_core::services::mutex::{Lease, MutexError};
use ledger_core::services::request_queue::registry::HandlerRegistry;
use ledger_core::services::request_queue::store::MemoryQueueStore;
use ledger_core::services::settlement::{AuthorizationParams, SettlementSettings};
use ledger_core::services::{
    AssetLedgerService, DistributedMutex, LocalMutex, RequestQueue, SettlementService, TypedDataSigner,
};
use ledger_core::AppState;

pub const SIGNER_KEY: &str = "0xac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80";
pub const TOKEN: &str = "0xdAC17F958D2ee523a2206206994597C13D831ec7";
pub const VAULT: &str = "0x5FbDB2315678afecb367f032d93F642f64180aa3";
pub const WALLET: &str = "0x70997970C51812dc3A010C7d01b50e0d17dc79C8";
pub const CHAIN_ID: i64 = 56;
pub const WEBHOOK_SECRET: &str = "whsec_test_secret";
pub const ADMIN_KEY: &str = "admin-test-key";

pub fn tokens() -> Arc<TokenRegistry> {
    TokenRegistry::from_entries(vec![SupportedToken {
        chain_id: CHAIN_ID,
        token_address: TOKEN.to_string(),
        currency: "usdt".to_string(),
        decimals: 6,
        vault_contract: VAULT.to_string(),
        enabled: true,
    }])
}

pub fn store() -> Arc<MemoryStore> {
    Arc::new(MemoryStore::new(Duration::from_secs(2)))
}

pub fn settlement_service(
    store: Arc<MemoryStore>,
    mutex: Arc<dyn DistributedMutex>,
    deposit_bonus_rate: Option<bigdecimal::BigDecimal>,
) -> SettlementService {
    SettlementService::new(
        store,
        mutex,
        Arc::new(TypedDataSigner::new(SIGNER_KEY, "AssetVault", "1").unwrap()),
        tokens(),
        SettlementSettings {
            order_ttl: Duration::from_secs(300),
            mutex_ttl: Duration::from_secs(30),
            deposit_bonus_rate,
        },
    )
}

pub fn params(order_id: &str, uid: &str, amount: &str) -> AuthorizationParams {
    AuthorizationParams {
        order_id: order_id.to_string(),
        uid: uid.to_string(),
        amount: amount.to_string(),
        wallet: WALLET.to_string(),
        chain_id: CHAIN_ID,
        token: TOKEN.to_string(),
        channel: None,
        notify_url: None,
    }
}

pub struct TestApp {
    pub state: AppState,
    pub store: Arc<MemoryStore>,
}

pub fn test_app(registry: HandlerRegistry) -> TestApp {
    let store = store();
    let queue = RequestQueue::new(Arc::new(MemoryQueueStore::new()), Arc::new(registry));
    let health_checks: Vec<Arc<dyn DependencyChecker>> = Vec::new();

    let state = AppState {
        ledger: AssetLedgerService::new(store.clone()),
        settlements: settlement_service(store.clone(), Arc::new(LocalMutex::new()), None),
        queue,
        health_checks: Arc::new(health_checks),
        admin_key: AdminKey::new(ADMIN_KEY),
        webhook_secret: WebhookSecret::new(WEBHOOK_SECRET),
        log_settings: RequestLogSettings::default(),
        start_time: Instant::now(),
    };

    TestApp { state, store }
}

/// Mutex whose backing store is always down.
pub struct UnreachableMutex;

#[async_trait]
impl DistributedMutex for UnreachableMutex {
    async fn try_acquire(&self, _key: &str, _ttl: Duration) -> Result<Option<Lease>, MutexError> {
        Err(MutexError::Unavailable("connection refused".to_string()))
    }

    async fn release(&self, _lease: &Lease) -> Result<(), MutexError> {
        Err(MutexError::Unavailable("connection refused".to_string()))
    }
}
