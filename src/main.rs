use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use dotenv::dotenv;
use tokio::sync::watch;

use subledger::admission::AdmissionService;
use subledger::api::{self, AppState};
use subledger::breaker::CircuitBreaker;
use subledger::configure;
use subledger::consistency::ConsistencyEngine;
use subledger::counter::{PendingCounter, RedisPendingCounter};
use subledger::health::CounterHealthProbe;
use subledger::logger;
use subledger::settlement::{SettlementConfig, SettlementWorker};
use subledger::store::{LedgerStore, PostgresLedgerStore};

#[derive(Parser)]
#[clap(author, version, about, long_about = None)]
struct Args {
    /// Path to a config file (without extension), overriding config/config
    #[clap(long)]
    config: Option<String>,
    /// Listen address override, e.g. 0.0.0.0:8080
    #[clap(long)]
    listen: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();
    let args = Args::parse();

    let mut config = configure::load_config(args.config.as_deref()).context("load config")?;
    if let Some(listen) = args.listen {
        config.listen_addr = listen;
    }

    logger::setup_logger(&config).map_err(|e| anyhow!("failed to set up logging: {}", e))?;
    log::info!("{} v{} starting", config.app_name, config.app_version);

    // Durable store.
    let postgres = PostgresLedgerStore::connect(&config.database_url).await?;
    postgres.ensure_schema().await?;
    let store: Arc<dyn LedgerStore> = Arc::new(postgres);
    log::info!("connected to postgres");

    // Volatile counter.
    let counter: Arc<dyn PendingCounter> = Arc::new(
        RedisPendingCounter::connect(
            &config.redis_url,
            &config.redis_key_prefix,
            config.redis_key_ttl_secs,
        )
        .await?,
    );
    log::info!("connected to redis");

    // Core components, wired once here and shared behind Arcs.
    let probe = Arc::new(CounterHealthProbe::new(
        counter.clone(),
        Duration::from_secs(config.health_check_interval_secs),
        Duration::from_secs(config.health_check_timeout_secs),
    ));
    let breaker = Arc::new(CircuitBreaker::new(
        config.breaker_failure_threshold,
        Duration::from_secs(config.breaker_cooldown_secs),
    ));
    let consistency = Arc::new(ConsistencyEngine::new(
        store.clone(),
        counter.clone(),
        Duration::from_secs(config.consistency_check_interval_secs),
    ));
    let admission = Arc::new(AdmissionService::new(
        store.clone(),
        counter.clone(),
        probe.clone(),
        breaker,
    ));
    let settlement = Arc::new(SettlementWorker::new(
        store,
        counter,
        probe.clone(),
        consistency.clone(),
        SettlementConfig {
            interval: Duration::from_secs(config.settlement_interval_secs),
            batch_size: config.settlement_batch_size,
        },
    ));

    // Background workers share one shutdown signal and observe it between
    // units of work.
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let probe_task = {
        let probe = probe.clone();
        let rx = shutdown_rx.clone();
        tokio::spawn(async move { probe.run_with_shutdown(rx).await })
    };
    let settlement_task = {
        let rx = shutdown_rx.clone();
        tokio::spawn(async move { settlement.run_with_shutdown(rx).await })
    };
    let consistency_task = {
        let rx = shutdown_rx;
        tokio::spawn(async move { consistency.run_with_shutdown(rx).await })
    };

    let state = AppState {
        admission,
        probe,
        app_name: config.app_name.clone(),
        app_version: config.app_version.clone(),
    };
    let app = api::create_router(state);

    let listener = tokio::net::TcpListener::bind(&config.listen_addr)
        .await
        .with_context(|| format!("bind {}", config.listen_addr))?;
    log::info!("listening on {}", config.listen_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("http server")?;

    log::info!("shutting down workers");
    let _ = shutdown_tx.send(true);
    let _ = tokio::join!(probe_task, settlement_task, consistency_task);

    log::info!("shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        log::error!("failed to listen for shutdown signal: {}", e);
        return;
    }
    log::info!("shutdown signal received");
}
