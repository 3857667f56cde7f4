use clap::Parser;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;

use ledger_core::adapters::PgStore;
use ledger_core::cli::{self, Cli, Commands, DbCommands, LedgerCommands, OrderCommands};
use ledger_core::config::tokens::TokenRegistry;
use ledger_core::config::Config;
use ledger_core::health::{DependencyChecker, DexChecker, PostgresChecker, RedisChecker};
use ledger_core::middleware::{AdminKey, RequestLogSettings, WebhookSecret};
use ledger_core::services::request_queue::http::{DexHttpClient, DEX_HTTP_REQUEST_ID};
use ledger_core::services::request_queue::registry::with_builtin_callbacks;
use ledger_core::services::request_queue::store::{MemoryQueueStore, QueueStore, RedisQueueStore};
use ledger_core::services::request_queue::{run_dispatcher, DispatcherSettings};
use ledger_core::services::settlement::SettlementSettings;
use ledger_core::services::{
    run_sweeper, AssetLedgerService, DistributedMutex, LocalMutex, RedisMutex, RequestQueue,
    SettlementService, TypedDataSigner,
};
use ledger_core::{create_app, db, telemetry, AppState};

const TOKEN_REFRESH_INTERVAL: Duration = Duration::from_secs(60);
const QUEUE_MAX_ATTEMPTS: u32 = 3;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Cli::parse();
    let config = Config::from_env()?;
    telemetry::init(config.log_format);

    match args.command.unwrap_or(Commands::Serve) {
        Commands::Serve => serve(config).await,
        Commands::Db(DbCommands::Migrate) => cli::handle_db_migrate(&config).await,
        Commands::Config => cli::handle_config_validate(&config).await,
        Commands::Orders(OrderCommands::Sweep) => cli::handle_orders_sweep(&config).await,
        Commands::Ledger(LedgerCommands::Reconcile { user_id, currency }) => {
            cli::handle_ledger_reconcile(&config, &user_id, &currency).await
        }
    }
}

async fn serve(config: Config) -> anyhow::Result<()> {
    let pool = db::create_pool(&config).await?;
    db::run_migrations(&pool).await?;

    let tokens = TokenRegistry::start(pool.clone(), TOKEN_REFRESH_INTERVAL).await?;
    let signer = Arc::new(TypedDataSigner::new(
        &config.signer_private_key,
        &config.eip712_domain_name,
        &config.eip712_domain_version,
    )?);
    tracing::info!(signer = %signer.address(), "typed-data signer initialized");

    let store = Arc::new(PgStore::new(pool.clone(), config.lock_wait_timeout));

    let (mutex, queue_store): (Arc<dyn DistributedMutex>, Arc<dyn QueueStore>) = match &config.redis_url {
        Some(url) => {
            tracing::info!("using redis for the settlement mutex and request queue");
            (Arc::new(RedisMutex::new(url)?), Arc::new(RedisQueueStore::new(url)?))
        }
        None => {
            tracing::warn!("REDIS_URL not set; settlement mutex and request queue are process-local");
            (Arc::new(LocalMutex::new()), Arc::new(MemoryQueueStore::new()))
        }
    };

    let dex = DexHttpClient::new(
        config.dex_api_base_url.clone(),
        config.dex_api_key.clone(),
        config.dex_success_code,
        config.queue_request_timeout,
    );
    tracing::info!(base_url = dex.base_url(), "DEX client configured");
    let mut registry = with_builtin_callbacks(QUEUE_MAX_ATTEMPTS);
    registry.register_request_function(DEX_HTTP_REQUEST_ID, Arc::new(dex.clone()));
    let queue = RequestQueue::new(queue_store, Arc::new(registry));

    let settlements = SettlementService::new(
        store.clone(),
        mutex,
        signer,
        tokens,
        SettlementSettings {
            order_ttl: config.order_ttl,
            mutex_ttl: config.mutex_ttl,
            deposit_bonus_rate: config.deposit_bonus_rate.clone(),
        },
    );

    let mut health_checks: Vec<Arc<dyn DependencyChecker>> = vec![Arc::new(PostgresChecker::new(pool.clone()))];
    if let Some(url) = &config.redis_url {
        health_checks.push(Arc::new(RedisChecker::new(url.clone())));
    }
    health_checks.push(Arc::new(DexChecker::new(dex)));

    tokio::spawn(run_dispatcher(
        queue.clone(),
        DispatcherSettings {
            requests_per_second: config.queue_requests_per_second,
            request_timeout: config.queue_request_timeout,
            poll_interval: config.queue_poll_interval,
        },
    ));
    tokio::spawn(run_sweeper(store.clone(), config.order_cancel_grace, config.sweep_interval));

    let app_state = AppState {
        ledger: AssetLedgerService::new(store),
        settlements,
        queue,
        health_checks: Arc::new(health_checks),
        admin_key: AdminKey::new(config.admin_api_key.clone()),
        webhook_secret: WebhookSecret::new(config.webhook_secret.clone()),
        log_settings: RequestLogSettings {
            log_body: config.log_request_body,
        },
        start_time: Instant::now(),
    };
    let app = create_app(app_state);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.server_port));
    tracing::info!("listening on {}", addr);

    let listener = TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
