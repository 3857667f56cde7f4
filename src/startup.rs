use crate::config::Config;
use crate::services::request_queue::http::DexHttpClient;
use crate::services::signer::TypedDataSigner;
use anyhow::{Context, Result};
use sqlx::PgPool;
use std::time::Duration;

pub struct ValidationReport {
    pub environment: bool,
    pub database: bool,
    pub redis: Option<bool>,
    pub dex: bool,
    pub errors: Vec<String>,
}

impl ValidationReport {
    pub fn is_valid(&self) -> bool {
        self.environment && self.database && self.redis.unwrap_or(true) && self.dex
    }

    pub fn print(&self) {
        println!("\n=== Startup Validation Report ===");
        println!("Environment Variables: {}", status(self.environment));
        println!("Database Connectivity: {}", status(self.database));
        match self.redis {
            Some(ok) => println!("Redis Connectivity:    {}", status(ok)),
            None => println!("Redis Connectivity:    ➖ not configured (in-process mutex and queue)"),
        }
        println!("DEX API Connectivity:  {}", status(self.dex));

        if !self.errors.is_empty() {
            println!("\nErrors:");
            for error in &self.errors {
                println!("  ❌ {}", error);
            }
        }

        println!("\nOverall Status: {}", if self.is_valid() { "✅ PASS" } else { "❌ FAIL" });
        println!("=================================\n");
    }
}

fn status(ok: bool) -> &'static str {
    if ok { "✅ OK" } else { "❌ FAIL" }
}

pub async fn validate_environment(config: &Config, pool: &PgPool) -> Result<ValidationReport> {
    let mut report = ValidationReport {
        environment: true,
        database: true,
        redis: config.redis_url.as_ref().map(|_| true),
        dex: true,
        errors: Vec::new(),
    };

    if let Err(e) = validate_env_vars(config) {
        report.environment = false;
        report.errors.push(format!("Environment: {:#}", e));
    }

    if let Err(e) = validate_database(pool).await {
        report.database = false;
        report.errors.push(format!("Database: {:#}", e));
    }

    if let Some(redis_url) = &config.redis_url {
        if let Err(e) = validate_redis(redis_url).await {
            report.redis = Some(false);
            report.errors.push(format!("Redis: {:#}", e));
        }
    }

    if let Err(e) = validate_dex(config).await {
        report.dex = false;
        report.errors.push(format!("DEX API: {:#}", e));
    }

    Ok(report)
}

pub fn validate_env_vars(config: &Config) -> Result<()> {
    if config.database_url.is_empty() {
        anyhow::bail!("DATABASE_URL is empty");
    }
    if config.webhook_secret.trim().is_empty() {
        anyhow::bail!("WEBHOOK_SECRET is empty");
    }
    if config.admin_api_key.trim().is_empty() {
        anyhow::bail!("ADMIN_API_KEY is empty");
    }
    if config.server_port == 0 {
        anyhow::bail!("SERVER_PORT must be greater than 0");
    }
    if config.queue_requests_per_second == 0 {
        anyhow::bail!("QUEUE_REQUESTS_PER_SECOND must be greater than 0");
    }
    if config.order_ttl.is_zero() {
        anyhow::bail!("ORDER_TTL_SECS must be greater than 0");
    }

    url::Url::parse(&config.dex_api_base_url).context("DEX_API_BASE_URL is not a valid URL")?;
    if let Some(redis_url) = &config.redis_url {
        url::Url::parse(redis_url).context("REDIS_URL is not a valid URL")?;
    }

    TypedDataSigner::new(
        &config.signer_private_key,
        &config.eip712_domain_name,
        &config.eip712_domain_version,
    )
    .context("SIGNER_PRIVATE_KEY is not a valid secp256k1 key")?;

    Ok(())
}

async fn validate_database(pool: &PgPool) -> Result<()> {
    sqlx::query("SELECT 1")
        .fetch_one(pool)
        .await
        .context("Failed to connect to database")?;

    let applied: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM _sqlx_migrations")
        .fetch_one(pool)
        .await
        .context("Failed to check migrations table")?;

    if applied == 0 {
        anyhow::bail!("No migrations applied");
    }

    let tokens: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM supported_tokens WHERE enabled = TRUE")
        .fetch_one(pool)
        .await
        .context("Failed to read supported_tokens")?;
    if tokens == 0 {
        tracing::warn!("supported_tokens has no enabled rows; every settlement request will be rejected");
    }

    Ok(())
}

async fn validate_redis(redis_url: &str) -> Result<()> {
    let client = redis::Client::open(redis_url).context("Invalid Redis URL")?;

    let mut conn = client
        .get_multiplexed_async_connection()
        .await
        .context("Failed to connect to Redis")?;

    redis::cmd("PING")
        .query_async::<_, String>(&mut conn)
        .await
        .context("Redis PING failed")?;

    Ok(())
}

async fn validate_dex(config: &Config) -> Result<()> {
    let client = DexHttpClient::new(
        config.dex_api_base_url.clone(),
        config.dex_api_key.clone(),
        config.dex_success_code,
        Duration::from_secs(10),
    );

    let status = client.probe().await.context("Failed to connect to DEX API")?;
    if status >= 500 {
        anyhow::bail!("DEX API returned status: {}", status);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LogFormat;

    fn config() -> Config {
        Config {
            server_port: 3000,
            database_url: "postgres://localhost:5432/ledger".to_string(),
            database_max_connections: 10,
            redis_url: None,
            signer_private_key: "0xac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80".to_string(),
            eip712_domain_name: "AssetVault".to_string(),
            eip712_domain_version: "1".to_string(),
            order_ttl: Duration::from_secs(300),
            order_cancel_grace: Duration::from_secs(3600),
            sweep_interval: Duration::from_secs(60),
            mutex_ttl: Duration::from_secs(30),
            lock_wait_timeout: Duration::from_secs(5),
            deposit_bonus_rate: None,
            webhook_secret: "whsec".to_string(),
            admin_api_key: "admin".to_string(),
            dex_api_base_url: "https://dex.example.com".to_string(),
            dex_api_key: None,
            dex_success_code: 0,
            queue_requests_per_second: 1,
            queue_request_timeout: Duration::from_secs(30),
            queue_poll_interval: Duration::from_secs(1),
            log_format: LogFormat::Text,
            log_request_body: false,
        }
    }

    #[test]
    fn test_validate_env_vars_accepts_complete_config() {
        assert!(validate_env_vars(&config()).is_ok());
    }

    #[test]
    fn test_validate_env_vars_empty_database_url() {
        let config = Config {
            database_url: String::new(),
            ..config()
        };
        assert!(validate_env_vars(&config).is_err());
    }

    #[test]
    fn test_validate_env_vars_invalid_dex_url() {
        let config = Config {
            dex_api_base_url: "not-a-url".to_string(),
            ..config()
        };
        assert!(validate_env_vars(&config).is_err());
    }

    #[test]
    fn test_validate_env_vars_bad_signer_key() {
        let config = Config {
            signer_private_key: "0x1234".to_string(),
            ..config()
        };
        assert!(validate_env_vars(&config).is_err());
    }

    #[test]
    fn test_redis_is_optional_in_report() {
        let report = ValidationReport {
            environment: true,
            database: true,
            redis: None,
            dex: true,
            errors: vec![],
        };
        assert!(report.is_valid());

        let report = ValidationReport {
            redis: Some(false),
            ..report
        };
        assert!(!report.is_valid());
    }
}
