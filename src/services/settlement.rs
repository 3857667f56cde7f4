//! Deposit/withdraw settlement: signed authorizations on request and
//! exactly-once booking on webhook confirmation.
//!
//! Two lock tiers guard every order. The distributed mutex only avoids
//! duplicate work between instances; the order row lock plus the `processed`
//! flag inside `SettlementStore::settle` is what makes settlement exactly-once.

use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;

use crate::config::tokens::{SupportedToken, TokenRegistry};
use crate::domain::money;
use crate::domain::{
    LedgerError, LedgerTransaction, OrderStatus, OrderType, SettlementError, SettlementOrder,
};
use crate::ports::{SettleOutcome, SettlementStore};
use crate::services::mutex::{DistributedMutex, Lease};
use crate::services::signer::{AuthorizationRequest, SignedAuthorization, SignerError, TypedDataSigner};
use crate::validation::{self, ValidationError};

const REQUEST_LOCK_PREFIX: &str = "settlement:request:";
const CONFIRM_LOCK_PREFIX: &str = "settlement:confirm:";

/// Client input for a deposit or withdraw authorization.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthorizationParams {
    pub order_id: String,
    pub uid: String,
    pub amount: String,
    pub wallet: String,
    pub chain_id: i64,
    pub token: String,
    #[serde(default)]
    pub channel: Option<String>,
    #[serde(default)]
    pub notify_url: Option<String>,
}

#[derive(Debug, Clone)]
pub enum ConfirmationOutcome {
    Settled {
        order: SettlementOrder,
        transactions: Vec<LedgerTransaction>,
    },
    AlreadyProcessed(SettlementOrder),
    /// Another worker holds the confirmation mutex for this order.
    ConcurrentSettlementInProgress,
}

#[derive(Debug, Clone)]
pub struct SettlementSettings {
    pub order_ttl: Duration,
    pub mutex_ttl: Duration,
    pub deposit_bonus_rate: Option<BigDecimal>,
}

impl From<ValidationError> for SettlementError {
    fn from(err: ValidationError) -> Self {
        SettlementError::Ledger(LedgerError::InvalidRequest(err.to_string()))
    }
}

impl From<SignerError> for SettlementError {
    fn from(err: SignerError) -> Self {
        match err {
            SignerError::InvalidAddress { .. } | SignerError::AmountPrecision { .. } => {
                SettlementError::Ledger(LedgerError::InvalidRequest(err.to_string()))
            }
            other => SettlementError::Signing(other.to_string()),
        }
    }
}

#[derive(Clone)]
pub struct SettlementService {
    store: Arc<dyn SettlementStore>,
    mutex: Arc<dyn DistributedMutex>,
    signer: Arc<TypedDataSigner>,
    tokens: Arc<TokenRegistry>,
    settings: SettlementSettings,
}

impl SettlementService {
    pub fn new(
        store: Arc<dyn SettlementStore>,
        mutex: Arc<dyn DistributedMutex>,
        signer: Arc<TypedDataSigner>,
        tokens: Arc<TokenRegistry>,
        settings: SettlementSettings,
    ) -> Self {
        Self {
            store,
            mutex,
            signer,
            tokens,
            settings,
        }
    }

    pub async fn request_deposit(&self, params: AuthorizationParams) -> Result<SignedAuthorization, SettlementError> {
        self.request_authorization(OrderType::Deposit, params).await
    }

    /// Like a deposit, but the order's amount is locked on the user's balance
    /// in the same unit that creates the order.
    pub async fn request_withdraw(&self, params: AuthorizationParams) -> Result<SignedAuthorization, SettlementError> {
        self.request_authorization(OrderType::Withdraw, params).await
    }

    pub async fn get_order(&self, order_id: &str) -> Result<SettlementOrder, SettlementError> {
        self.store
            .find_order(order_id)
            .await?
            .ok_or_else(|| SettlementError::OrderNotFound(order_id.to_string()))
    }

    async fn request_authorization(
        &self,
        kind: OrderType,
        params: AuthorizationParams,
    ) -> Result<SignedAuthorization, SettlementError> {
        validate_params(&params)?;
        let amount = money::parse_amount(&params.amount)?;
        let token = self.supported_token(params.chain_id, &params.token)?;

        let key = format!("{}{}", REQUEST_LOCK_PREFIX, params.order_id);
        let lease = match self.mutex.try_acquire(&key, self.settings.mutex_ttl).await {
            Ok(Some(lease)) => Some(lease),
            Ok(None) => return Err(SettlementError::RequestInProgress(params.order_id)),
            Err(e) => {
                tracing::warn!(order_id = %params.order_id, error = %e, "mutex store unavailable, continuing without request lock");
                None
            }
        };

        let result = self.issue(kind, params, amount, &token).await;
        self.release(lease).await;
        result
    }

    async fn issue(
        &self,
        kind: OrderType,
        params: AuthorizationParams,
        amount: BigDecimal,
        token: &SupportedToken,
    ) -> Result<SignedAuthorization, SettlementError> {
        if let Some(existing) = self.store.find_order(&params.order_id).await? {
            return self.reissue(kind, existing, &params).await;
        }

        let now = Utc::now();
        let order = SettlementOrder {
            id: 0,
            order_id: params.order_id.clone(),
            uid: params.uid.trim().to_string(),
            amount,
            currency: token.currency.to_ascii_uppercase(),
            token: params.token.clone(),
            chain_id: params.chain_id,
            wallet: params.wallet.clone(),
            order_type: kind,
            channel: params.channel.clone(),
            notify_url: params.notify_url.clone(),
            created_at: now,
            expire_at: self.next_expiry(now),
            processed: false,
            processed_at: None,
            status: OrderStatus::Pending,
        };

        // signed before the insert so a bad amount or address never leaves a hold behind
        let authorization = self.sign(&order, token)?;
        let hold = match kind {
            OrderType::Withdraw => Some(order.hold_operation()),
            OrderType::Deposit => None,
        };

        match self.store.create_order(order, hold).await {
            Ok(order) => {
                tracing::info!(
                    order_id = %order.order_id,
                    order_type = %order.order_type,
                    user_id = %order.uid,
                    currency = %order.currency,
                    amount = %order.amount,
                    chain_id = order.chain_id,
                    "settlement order created"
                );
                Ok(authorization)
            }
            Err(SettlementError::DuplicateOrder(order_id)) => {
                tracing::info!(order_id = %order_id, "order inserted concurrently, re-issuing existing order");
                let existing = self.get_order(&order_id).await?;
                self.reissue(kind, existing, &params).await
            }
            Err(e) => {
                tracing::info!(order_id = %params.order_id, code = e.code(), "settlement order rejected: {}", e);
                Err(e)
            }
        }
    }

    /// Repeat request for a known order id: refresh the expiry and re-sign
    /// the stored parameters.
    async fn reissue(
        &self,
        kind: OrderType,
        existing: SettlementOrder,
        params: &AuthorizationParams,
    ) -> Result<SignedAuthorization, SettlementError> {
        if existing.order_type != kind {
            return Err(SettlementError::OrderConflict {
                order_id: existing.order_id,
                reason: format!("order is a {}", existing.order_type),
            });
        }
        if !existing.is_open() {
            return Err(SettlementError::OrderConflict {
                reason: format!("order is {}", existing.status),
                order_id: existing.order_id,
            });
        }
        if existing.uid != params.uid.trim()
            || existing.wallet != params.wallet
            || existing.chain_id != params.chain_id
            || !existing.token.eq_ignore_ascii_case(&params.token)
        {
            tracing::warn!(order_id = %existing.order_id, "repeat request differs from stored order, re-signing stored parameters");
        }

        let refreshed = self
            .store
            .refresh_expiry(&existing.order_id, self.next_expiry(Utc::now()))
            .await?
            .ok_or_else(|| SettlementError::OrderConflict {
                order_id: existing.order_id.clone(),
                reason: "order is no longer open".to_string(),
            })?;

        let token = self.supported_token(refreshed.chain_id, &refreshed.token)?;
        tracing::info!(order_id = %refreshed.order_id, expire_at = %refreshed.expire_at, "settlement order expiry refreshed");
        self.sign(&refreshed, &token)
    }

    /// Books a confirmed on-chain transfer at most once.
    pub async fn handle_settlement_confirmation(&self, order_id: &str) -> Result<ConfirmationOutcome, SettlementError> {
        let key = format!("{}{}", CONFIRM_LOCK_PREFIX, order_id);
        let lease = match self.mutex.try_acquire(&key, self.settings.mutex_ttl).await {
            Ok(Some(lease)) => Some(lease),
            Ok(None) => {
                tracing::info!(order_id = %order_id, "settlement already in progress elsewhere");
                return Ok(ConfirmationOutcome::ConcurrentSettlementInProgress);
            }
            Err(e) => {
                tracing::warn!(order_id = %order_id, error = %e, "mutex store unavailable, relying on row lock");
                None
            }
        };

        let result = self
            .store
            .settle(order_id, self.settings.deposit_bonus_rate.as_ref())
            .await;
        self.release(lease).await;

        match result {
            Ok(SettleOutcome::Settled { order, transactions }) => {
                tracing::info!(
                    order_id = %order.order_id,
                    order_type = %order.order_type,
                    user_id = %order.uid,
                    currency = %order.currency,
                    amount = %order.amount,
                    entries = transactions.len(),
                    "settlement applied"
                );
                Ok(ConfirmationOutcome::Settled { order, transactions })
            }
            Ok(SettleOutcome::AlreadyProcessed(order)) => {
                tracing::info!(order_id = %order.order_id, "settlement order already processed, ignoring");
                Ok(ConfirmationOutcome::AlreadyProcessed(order))
            }
            Err(e) => {
                tracing::error!(order_id = %order_id, code = e.code(), "settlement rolled back: {}", e);
                Err(e)
            }
        }
    }

    fn supported_token(&self, chain_id: i64, token: &str) -> Result<SupportedToken, SettlementError> {
        self.tokens
            .get(chain_id, token)
            .ok_or_else(|| SettlementError::UnsupportedToken {
                chain_id,
                token: token.to_string(),
            })
    }

    fn next_expiry(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let ttl = chrono::Duration::from_std(self.settings.order_ttl)
            .unwrap_or_else(|_| chrono::Duration::minutes(5));
        now + ttl
    }

    fn sign(&self, order: &SettlementOrder, token: &SupportedToken) -> Result<SignedAuthorization, SettlementError> {
        let request = AuthorizationRequest {
            kind: order.order_type,
            order_id: &order.order_id,
            deadline: order.expire_at.timestamp(),
            wallet: &order.wallet,
            token: &order.token,
            amount: &order.amount,
            decimals: token.token_decimals(),
            chain_id: order.chain_id,
            vault_contract: &token.vault_contract,
        };
        Ok(self.signer.sign(&request)?)
    }

    async fn release(&self, lease: Option<Lease>) {
        if let Some(lease) = lease {
            if let Err(e) = self.mutex.release(&lease).await {
                tracing::warn!(key = %lease.key, error = %e, "failed to release mutex lease, it will expire");
            }
        }
    }
}

fn validate_params(params: &AuthorizationParams) -> Result<(), ValidationError> {
    validation::validate_order_id(&params.order_id)?;
    validation::validate_required("uid", &params.uid)?;
    validation::validate_max_len("uid", params.uid.trim(), crate::domain::asset::USER_ID_MAX_LEN)?;
    validation::validate_evm_address("wallet", &params.wallet)?;
    validation::validate_evm_address("token", &params.token)?;
    validation::validate_chain_id(params.chain_id)?;
    if let Some(channel) = &params.channel {
        validation::validate_channel(channel)?;
    }
    if let Some(notify_url) = &params.notify_url {
        validation::validate_notify_url(notify_url)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::MemoryStore;
    use crate::services::mutex::LocalMutex;

    const KEY: &str = "0xac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80";
    const TOKEN: &str = "0xdAC17F958D2ee523a2206206994597C13D831ec7";
    const WALLET: &str = "0x70997970C51812dc3A010C7d01b50e0d17dc79C8";

    fn service(mutex: Arc<dyn DistributedMutex>) -> SettlementService {
        let tokens = TokenRegistry::from_entries(vec![SupportedToken {
            chain_id: 56,
            token_address: TOKEN.to_string(),
            currency: "usdt".to_string(),
            decimals: 6,
            vault_contract: "0x5FbDB2315678afecb367f032d93F642f64180aa3".to_string(),
            enabled: true,
        }]);
        SettlementService::new(
            Arc::new(MemoryStore::new(Duration::from_secs(1))),
            mutex,
            Arc::new(TypedDataSigner::new(KEY, "AssetVault", "1").unwrap()),
            tokens,
            SettlementSettings {
                order_ttl: Duration::from_secs(300),
                mutex_ttl: Duration::from_secs(30),
                deposit_bonus_rate: None,
            },
        )
    }

    fn params(order_id: &str) -> AuthorizationParams {
        AuthorizationParams {
            order_id: order_id.to_string(),
            uid: "u1".to_string(),
            amount: "25".to_string(),
            wallet: WALLET.to_string(),
            chain_id: 56,
            token: TOKEN.to_string(),
            channel: None,
            notify_url: None,
        }
    }

    #[tokio::test]
    async fn test_unsupported_token_is_rejected() {
        let svc = service(Arc::new(LocalMutex::new()));
        let mut p = params("dep-1");
        p.chain_id = 1;
        let err = svc.request_deposit(p).await.unwrap_err();
        assert!(matches!(err, SettlementError::UnsupportedToken { chain_id: 1, .. }));
    }

    #[tokio::test]
    async fn test_request_in_progress_when_request_lock_is_held() {
        let mutex = Arc::new(LocalMutex::new());
        let svc = service(mutex.clone());
        let _held = mutex
            .try_acquire("settlement:request:dep-2", Duration::from_secs(30))
            .await
            .unwrap()
            .unwrap();

        let err = svc.request_deposit(params("dep-2")).await.unwrap_err();
        assert_eq!(err.code(), "REQUEST_IN_PROGRESS");
    }

    #[tokio::test]
    async fn test_order_type_mismatch_is_a_conflict() {
        let svc = service(Arc::new(LocalMutex::new()));
        svc.request_deposit(params("dep-3")).await.unwrap();
        let err = svc.request_withdraw(params("dep-3")).await.unwrap_err();
        assert!(matches!(err, SettlementError::OrderConflict { .. }));
    }

    #[tokio::test]
    async fn test_sub_unit_amount_leaves_no_order() {
        let svc = service(Arc::new(LocalMutex::new()));
        let mut p = params("dep-4");
        p.amount = "1.0000001".to_string();
        let err = svc.request_deposit(p).await.unwrap_err();
        assert_eq!(err.code(), "INVALID_REQUEST");
        assert!(matches!(
            svc.get_order("dep-4").await,
            Err(SettlementError::OrderNotFound(_))
        ));
    }
}
