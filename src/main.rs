//! MoltiArena backend: competitive trading agents on live token arenas.
//!
//! Long-running process with three loops (market tick, engine tick, epoch
//! scheduler) plus the token stream ingest. SIGINT/SIGTERM stop all loops
//! before exit.

use moltiarena_backend::chain::abi::to_wei18;
use moltiarena_backend::chain::{
    ArenaReader, BundlerClient, ChainReader, KeyVault, OperatorGateway, OperatorWallet, RpcClient,
    StaticKeyVault, TradeSubmitter, WalletServiceVault,
};
use moltiarena_backend::engine::{EngineConfig, TickEngine};
use moltiarena_backend::epoch::{EpochConfig, EpochController};
use moltiarena_backend::llm::{ModelGateway, OpenRouterClient};
use moltiarena_backend::market::{MarketAggregator, TokenStream};
use moltiarena_backend::memory;
use moltiarena_backend::models::Config;
use moltiarena_backend::store::{ArenaDb, EventStore};
use alloy::primitives::Address;
use anyhow::{Context, Result};
use dotenv::dotenv;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    load_env();
    init_tracing();

    info!("🏟️  MoltiArena engine starting");
    let config = Config::from_env()?;
    info!(
        chain_id = config.chain_id,
        tick_seconds = config.tick_seconds,
        demo = config.demo_mode(),
        arenas = config.arena_tokens.len(),
        "configuration loaded"
    );

    // Stores.
    let events = Arc::new(EventStore::new(&config.events_db_path)?);
    let db = Arc::new(ArenaDb::new(&config.arena_db_path)?);

    // Arena seeding from configuration: tokens may exist off-chain before
    // on-chain activation.
    for token in &config.arena_tokens {
        let id = db.upsert_arena(token, None)?;
        info!(arena = id, token = %token, "arena seeded");
    }

    // Chain clients.
    let arena_addr: Address = config
        .arena_contract_address
        .parse()
        .context("ARENA_CONTRACT_ADDRESS parse")?;
    let molti_addr: Address = config
        .molti_token_address
        .parse()
        .context("MOLTI_TOKEN_ADDRESS parse")?;
    let entry_point: Address = config
        .entry_point_address
        .parse()
        .context("ENTRY_POINT_ADDRESS parse")?;

    let rpc = RpcClient::new(config.rpc_url.clone())?;
    let indexer_rpc = RpcClient::new(config.indexer_rpc_url.clone())?;
    let reader: Arc<dyn ChainReader> =
        Arc::new(ArenaReader::new(indexer_rpc, arena_addr, molti_addr));

    let vault: Arc<dyn KeyVault> = match &config.wallet_service_url {
        Some(url) => {
            info!(url = %url, "wallet service vault enabled");
            Arc::new(WalletServiceVault::new(url.clone())?)
        }
        None => {
            warn!("WALLET_SERVICE_URL unset; using static key vault (dev only)");
            Arc::new(StaticKeyVault)
        }
    };
    let submitter: Arc<dyn TradeSubmitter> = Arc::new(BundlerClient::new(
        config.bundler_url.clone(),
        config.bundler_api_key.clone(),
        rpc.clone(),
        vault,
        config.chain_id,
        entry_point,
        arena_addr,
        molti_addr,
    )?);
    let operator: Arc<dyn OperatorGateway> = Arc::new(OperatorWallet::new(
        rpc,
        &config.operator_private_key,
        config.chain_id,
        arena_addr,
    )?);

    // Model gateway.
    let backend = OpenRouterClient::new(config.llm_api_key.clone(), config.llm_model.clone())?;
    let gateway = Arc::new(ModelGateway::new(Arc::new(backend)));
    info!(model = %config.llm_model, "🤖 Model gateway ready");

    // Shutdown fan-out: flipping the sender stops every loop.
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Market side: aggregator tick + token stream ingest.
    let aggregator = Arc::new(MarketAggregator::new(
        events.clone(),
        config.arena_tokens.clone(),
    ));
    let mut tasks = Vec::new();
    tasks.push(
        aggregator
            .clone()
            .spawn(config.tick_seconds, shutdown_rx.clone()),
    );

    if config.use_dex_stream {
        match &config.ws_url {
            Some(ws_url) => {
                let stream = TokenStream::new(
                    ws_url.clone(),
                    config.arena_tokens.clone(),
                    events.clone(),
                    aggregator.clone(),
                );
                tasks.push(stream.spawn(shutdown_rx.clone()));
            }
            None => warn!("USE_DEX_STREAM set but WS_URL missing; stream disabled"),
        }
    }

    // Epoch controller + scheduler.
    let epochs = EpochController::new(
        db.clone(),
        reader.clone(),
        operator,
        submitter.clone(),
        EpochConfig {
            duration_minutes: config.epoch_duration_minutes,
            renewal_fee_wei: to_wei18(config.renewal_fee_molti),
            demo_mode: config.demo_mode(),
        },
    );
    tasks.push(epochs.clone().spawn_scheduler(shutdown_rx.clone()));

    // Tick engine.
    let engine = TickEngine::new(
        db.clone(),
        aggregator,
        reader,
        submitter,
        gateway,
        epochs,
        EngineConfig {
            tick_seconds: config.tick_seconds,
            ..EngineConfig::default()
        },
    );
    tasks.push(engine.spawn(shutdown_rx.clone()));

    // Housekeeping: event cleanup + memory compaction.
    tasks.push(spawn_event_cleanup(
        events,
        config.cleanup_hours,
        shutdown_rx.clone(),
    ));
    tasks.push(memory::spawn_summarizer(
        db,
        config.memory_summarization_interval_hours,
        shutdown_rx,
    ));

    wait_for_shutdown().await;
    info!("shutdown signal received, stopping loops");
    let _ = shutdown_tx.send(true);

    for task in tasks {
        let _ = task.await;
    }
    info!("👋 MoltiArena engine stopped");
    Ok(())
}

fn spawn_event_cleanup(
    events: Arc<EventStore>,
    retention_hours: i64,
    mut shutdown: watch::Receiver<bool>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let period = Duration::from_secs(3_600);
        loop {
            tokio::select! {
                _ = tokio::time::sleep(period) => {}
                _ = shutdown.changed() => return,
            }
            let cutoff = chrono::Utc::now().timestamp() - retention_hours * 3_600;
            let deleted = events.cleanup_older_than(cutoff);
            if deleted > 0 {
                info!(deleted, retention_hours, "🧹 Pruned old market events");
            }
        }
    })
}

async fn wait_for_shutdown() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut term = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("sigterm handler");
        tokio::select! {
            _ = ctrl_c => {}
            _ = term.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
    }
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "moltiarena_backend=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn load_env() {
    let _ = dotenv();
    // Also try the crate directory when running with --manifest-path from
    // elsewhere.
    let manifest_dir = Path::new(env!("CARGO_MANIFEST_DIR"));
    let candidate = manifest_dir.join(".env");
    if candidate.exists() {
        let _ = dotenv::from_path(&candidate);
    }
}
