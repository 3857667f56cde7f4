use anyhow::{Context, Result};
use bigdecimal::BigDecimal;
use dotenvy::dotenv;
use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::utils::sanitize::mask_secret;

pub mod tokens;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub server_port: u16,
    pub database_url: String,
    pub database_max_connections: u32,
    pub redis_url: Option<String>,
    pub signer_private_key: String,
    pub eip712_domain_name: String,
    pub eip712_domain_version: String,
    pub order_ttl: Duration,
    pub order_cancel_grace: Duration,
    pub sweep_interval: Duration,
    pub mutex_ttl: Duration,
    pub lock_wait_timeout: Duration,
    pub deposit_bonus_rate: Option<BigDecimal>,
    pub webhook_secret: String,
    pub admin_api_key: String,
    pub dex_api_base_url: String,
    pub dex_api_key: Option<String>,
    pub dex_success_code: i64,
    pub queue_requests_per_second: u32,
    pub queue_request_timeout: Duration,
    pub queue_poll_interval: Duration,
    pub log_format: LogFormat,
    pub log_request_body: bool,
}

fn var_or<T: FromStr>(name: &str, default: T) -> Result<T>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("{} has an invalid value '{}'", name, raw)),
        Err(_) => Ok(default),
    }
}

fn required(name: &str) -> Result<String> {
    env::var(name).with_context(|| format!("{} must be set", name))
}

fn optional(name: &str) -> Option<String> {
    env::var(name).ok().filter(|v| !v.trim().is_empty())
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenv().ok(); // Load .env file if present

        let deposit_bonus_rate = optional("DEPOSIT_BONUS_RATE")
            .map(|raw| {
                BigDecimal::from_str(raw.trim())
                    .with_context(|| format!("DEPOSIT_BONUS_RATE has an invalid value '{}'", raw))
            })
            .transpose()?;

        let log_format = match optional("LOG_FORMAT").as_deref() {
            None | Some("text") => LogFormat::Text,
            Some("json") => LogFormat::Json,
            Some(other) => anyhow::bail!("LOG_FORMAT must be 'text' or 'json', got '{}'", other),
        };

        Ok(Config {
            server_port: var_or("SERVER_PORT", 3000)?,
            database_url: required("DATABASE_URL")?,
            database_max_connections: var_or("DATABASE_MAX_CONNECTIONS", 10)?,
            redis_url: optional("REDIS_URL"),
            signer_private_key: required("SIGNER_PRIVATE_KEY")?,
            eip712_domain_name: optional("EIP712_DOMAIN_NAME").unwrap_or_else(|| "AssetVault".to_string()),
            eip712_domain_version: optional("EIP712_DOMAIN_VERSION").unwrap_or_else(|| "1".to_string()),
            order_ttl: Duration::from_secs(var_or("ORDER_TTL_SECS", 300)?),
            order_cancel_grace: Duration::from_secs(var_or("ORDER_CANCEL_GRACE_SECS", 3600)?),
            sweep_interval: Duration::from_secs(var_or("SWEEP_INTERVAL_SECS", 60)?),
            mutex_ttl: Duration::from_millis(var_or("MUTEX_TTL_MS", 30_000)?),
            lock_wait_timeout: Duration::from_millis(var_or("LOCK_WAIT_TIMEOUT_MS", 5_000)?),
            deposit_bonus_rate,
            webhook_secret: required("WEBHOOK_SECRET")?,
            admin_api_key: required("ADMIN_API_KEY")?,
            dex_api_base_url: required("DEX_API_BASE_URL")?,
            dex_api_key: optional("DEX_API_KEY"),
            dex_success_code: var_or("DEX_SUCCESS_CODE", 0)?,
            queue_requests_per_second: var_or("QUEUE_REQUESTS_PER_SECOND", 1)?,
            queue_request_timeout: Duration::from_secs(var_or("QUEUE_REQUEST_TIMEOUT_SECS", 30)?),
            queue_poll_interval: Duration::from_millis(var_or("QUEUE_POLL_INTERVAL_MS", 1_000)?),
            log_format,
            log_request_body: var_or("LOG_REQUEST_BODY", false)?,
        })
    }

    /// Printable summary with every secret masked.
    pub fn masked_summary(&self) -> Vec<(&'static str, String)> {
        vec![
            ("SERVER_PORT", self.server_port.to_string()),
            ("DATABASE_URL", mask_secret(&self.database_url)),
            ("DATABASE_MAX_CONNECTIONS", self.database_max_connections.to_string()),
            ("REDIS_URL", self.redis_url.as_deref().map(mask_secret).unwrap_or_else(|| "-".into())),
            ("SIGNER_PRIVATE_KEY", mask_secret(&self.signer_private_key)),
            ("EIP712_DOMAIN_NAME", self.eip712_domain_name.clone()),
            ("EIP712_DOMAIN_VERSION", self.eip712_domain_version.clone()),
            ("ORDER_TTL_SECS", self.order_ttl.as_secs().to_string()),
            ("ORDER_CANCEL_GRACE_SECS", self.order_cancel_grace.as_secs().to_string()),
            ("SWEEP_INTERVAL_SECS", self.sweep_interval.as_secs().to_string()),
            ("MUTEX_TTL_MS", self.mutex_ttl.as_millis().to_string()),
            ("LOCK_WAIT_TIMEOUT_MS", self.lock_wait_timeout.as_millis().to_string()),
            (
                "DEPOSIT_BONUS_RATE",
                self.deposit_bonus_rate.as_ref().map(|r| r.to_string()).unwrap_or_else(|| "-".into()),
            ),
            ("WEBHOOK_SECRET", mask_secret(&self.webhook_secret)),
            ("ADMIN_API_KEY", mask_secret(&self.admin_api_key)),
            ("DEX_API_BASE_URL", self.dex_api_base_url.clone()),
            ("DEX_API_KEY", self.dex_api_key.as_deref().map(mask_secret).unwrap_or_else(|| "-".into())),
            ("DEX_SUCCESS_CODE", self.dex_success_code.to_string()),
            ("QUEUE_REQUESTS_PER_SECOND", self.queue_requests_per_second.to_string()),
            ("QUEUE_REQUEST_TIMEOUT_SECS", self.queue_request_timeout.as_secs().to_string()),
            ("QUEUE_POLL_INTERVAL_MS", self.queue_poll_interval.as_millis().to_string()),
            ("LOG_FORMAT", format!("{:?}", self.log_format).to_lowercase()),
            ("LOG_REQUEST_BODY", self.log_request_body.to_string()),
        ]
    }
}
