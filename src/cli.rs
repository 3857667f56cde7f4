use chrono::Utc;
use clap::{Parser, Subcommand};
use std::sync::Arc;

use crate::adapters::PgStore;
use crate::config::Config;
use crate::services::{order_sweeper, AssetLedgerService};

#[derive(Parser)]
#[command(name = "ledger-core")]
#[command(about = "Ledger Core - user asset ledger, on-chain settlement and request queue", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the HTTP server (default)
    Serve,

    /// Database management commands
    #[command(subcommand)]
    Db(DbCommands),

    /// Configuration validation
    Config,

    /// Settlement order maintenance
    #[command(subcommand)]
    Orders(OrderCommands),

    /// Ledger maintenance
    #[command(subcommand)]
    Ledger(LedgerCommands),
}

#[derive(Subcommand)]
pub enum DbCommands {
    /// Run database migrations
    Migrate,
}

#[derive(Subcommand)]
pub enum OrderCommands {
    /// Cancel expired withdraw orders once and release their holds
    Sweep,
}

#[derive(Subcommand)]
pub enum LedgerCommands {
    /// Replay a balance row from its history and compare with the stored values
    Reconcile {
        #[arg(value_name = "USER_ID")]
        user_id: String,
        #[arg(value_name = "CURRENCY")]
        currency: String,
    },
}

pub async fn handle_db_migrate(config: &Config) -> anyhow::Result<()> {
    let pool = crate::db::create_pool(config).await?;

    tracing::info!("running database migrations");
    crate::db::run_migrations(&pool).await?;

    println!("✓ Database migrations completed");
    Ok(())
}

pub async fn handle_config_validate(config: &Config) -> anyhow::Result<()> {
    tracing::info!("validating configuration");

    println!("Configuration:");
    for (name, value) in config.masked_summary() {
        println!("  {:<28} {}", name, value);
    }

    crate::startup::validate_env_vars(config)?;

    let pool = crate::db::create_pool(config).await?;
    let report = crate::startup::validate_environment(config, &pool).await?;
    report.print();

    if !report.is_valid() {
        anyhow::bail!("startup validation failed");
    }

    tracing::info!("configuration is valid");
    println!("✓ Configuration is valid");
    Ok(())
}

pub async fn handle_orders_sweep(config: &Config) -> anyhow::Result<()> {
    let pool = crate::db::create_pool(config).await?;
    let store = PgStore::new(pool, config.lock_wait_timeout);

    let cancelled = order_sweeper::process_batch(&store, config.order_cancel_grace, Utc::now()).await?;
    if cancelled.is_empty() {
        println!("No expired withdraw orders");
        return Ok(());
    }

    println!("✓ Cancelled {} withdraw order(s):", cancelled.len());
    for order in cancelled {
        println!("  {} {} {} {}", order.order_id, order.uid, order.amount, order.currency);
    }
    Ok(())
}

pub async fn handle_ledger_reconcile(config: &Config, user_id: &str, currency: &str) -> anyhow::Result<()> {
    let pool = crate::db::create_pool(config).await?;
    let ledger = AssetLedgerService::new(Arc::new(PgStore::new(pool, config.lock_wait_timeout)));

    let report = ledger.reconcile(user_id, currency).await?;
    println!("Transactions replayed: {}", report.transactions);
    match &report.stored {
        Some(stored) => println!(
            "Stored:   real={} bonus={} locked={}",
            stored.real, stored.bonus, stored.locked
        ),
        None => println!("Stored:   (no balance row)"),
    }
    println!(
        "Replayed: real={} bonus={} locked={}",
        report.replayed.real, report.replayed.bonus, report.replayed.locked
    );

    if !report.matches {
        anyhow::bail!("ledger for {}/{} does not match its history", user_id, currency);
    }
    println!("✓ Ledger matches its history");
    Ok(())
}
