pub mod adapters;
pub mod cli;
pub mod config;
pub mod db;
pub mod domain;
pub mod error;
pub mod handlers;
pub mod health;
pub mod middleware;
pub mod ports;
pub mod services;
pub mod startup;
pub mod telemetry;
pub mod utils;
pub mod validation;

use std::sync::Arc;
use std::time::Instant;

use axum::{
    extract::FromRef,
    middleware::from_fn_with_state,
    routing::{delete, get, post},
    Router,
};

use crate::health::DependencyChecker;
use crate::middleware::{admin_auth, request_logger_middleware, AdminKey, RequestLogSettings, WebhookSecret};
use crate::services::{AssetLedgerService, RequestQueue, SettlementService};

#[derive(Clone)]
pub struct AppState {
    pub ledger: AssetLedgerService,
    pub settlements: SettlementService,
    pub queue: RequestQueue,
    pub health_checks: Arc<Vec<Arc<dyn DependencyChecker>>>,
    pub admin_key: AdminKey,
    pub webhook_secret: WebhookSecret,
    pub log_settings: RequestLogSettings,
    pub start_time: Instant,
}

impl FromRef<AppState> for WebhookSecret {
    fn from_ref(state: &AppState) -> Self {
        state.webhook_secret.clone()
    }
}

impl FromRef<AppState> for AdminKey {
    fn from_ref(state: &AppState) -> Self {
        state.admin_key.clone()
    }
}

pub fn create_app(state: AppState) -> Router {
    let admin = Router::new()
        .route("/ledger/adjust", post(handlers::ledger::adjust))
        .route("/queue/status", get(handlers::queue::status))
        .route("/queue/items", get(handlers::queue::items))
        .route("/queue/requests", post(handlers::queue::enqueue))
        .route("/queue", delete(handlers::queue::clear))
        .route_layer(from_fn_with_state(state.admin_key.clone(), admin_auth));

    Router::new()
        .route("/health", get(handlers::health))
        .route("/ledger/deposit", post(handlers::ledger::deposit))
        .route("/ledger/withdraw", post(handlers::ledger::withdraw))
        .route("/ledger/bet", post(handlers::ledger::bet))
        .route("/ledger/win", post(handlers::ledger::win))
        .route("/ledger/refund", post(handlers::ledger::refund))
        .route("/ledger/lock", post(handlers::ledger::lock))
        .route("/ledger/unlock", post(handlers::ledger::unlock))
        .route("/ledger/:user_id/balances", get(handlers::ledger::list_balances))
        .route("/ledger/:user_id/balances/:currency", get(handlers::ledger::get_balance))
        .route("/ledger/:user_id/transactions", get(handlers::ledger::transaction_history))
        .route("/settlements/deposit", post(handlers::settlements::request_deposit))
        .route("/settlements/withdraw", post(handlers::settlements::request_withdraw))
        .route("/settlements/:order_id", get(handlers::settlements::get_order))
        .route("/webhooks/chain", post(handlers::webhook::chain_events))
        .merge(admin)
        .layer(from_fn_with_state(state.log_settings, request_logger_middleware))
        .with_state(state)
}
