use arc_swap::ArcSwap;
use serde::Serialize;
use sqlx::PgPool;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;

/// A token accepted for on-chain deposits and withdrawals on one chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, sqlx::FromRow)]
pub struct SupportedToken {
    pub chain_id: i64,
    pub token_address: String,
    pub currency: String,
    pub decimals: i16,
    pub vault_contract: String,
    pub enabled: bool,
}

impl SupportedToken {
    pub async fn fetch_enabled(pool: &PgPool) -> Result<Vec<Self>, sqlx::Error> {
        sqlx::query_as::<_, SupportedToken>(
            r#"
            SELECT chain_id, token_address, currency, decimals, vault_contract, enabled
            FROM supported_tokens
            WHERE enabled = TRUE
            "#,
        )
        .fetch_all(pool)
        .await
    }

    pub fn token_decimals(&self) -> u8 {
        self.decimals.clamp(0, u8::MAX as i16) as u8
    }
}

type TokenMap = HashMap<(i64, String), SupportedToken>;

fn index(tokens: impl IntoIterator<Item = SupportedToken>) -> TokenMap {
    tokens
        .into_iter()
        .filter(|t| t.enabled)
        .map(|t| ((t.chain_id, t.token_address.to_ascii_lowercase()), t))
        .collect()
}

/// Lock-free read view of `supported_tokens`, swapped wholesale on refresh.
pub struct TokenRegistry {
    inner: ArcSwap<TokenMap>,
}

impl TokenRegistry {
    pub fn from_entries(tokens: impl IntoIterator<Item = SupportedToken>) -> Arc<Self> {
        Arc::new(Self {
            inner: ArcSwap::from_pointee(index(tokens)),
        })
    }

    /// Loads the table and keeps it fresh in a background task.
    pub async fn start(pool: PgPool, refresh_interval: Duration) -> anyhow::Result<Arc<Self>> {
        let registry = Self::from_entries(SupportedToken::fetch_enabled(&pool).await?);
        tracing::info!(tokens = registry.len(), "supported token registry loaded");

        let refresher = registry.clone();
        tokio::spawn(async move {
            loop {
                sleep(refresh_interval).await;
                if let Err(e) = refresher.reload_once(&pool).await {
                    tracing::warn!(error = %e, "failed to refresh supported tokens");
                }
            }
        });

        Ok(registry)
    }

    pub async fn reload_once(&self, pool: &PgPool) -> anyhow::Result<()> {
        let tokens = SupportedToken::fetch_enabled(pool).await?;
        self.inner.store(Arc::new(index(tokens)));
        Ok(())
    }

    pub fn get(&self, chain_id: i64, token_address: &str) -> Option<SupportedToken> {
        self.inner
            .load()
            .get(&(chain_id, token_address.trim().to_ascii_lowercase()))
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.inner.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
