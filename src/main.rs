use expirybot::auth::{ClobApiClient, L2Credentials, OrderSigner};
use expirybot::config::{ClockKind, Config};
use expirybot::execution::{build_winner_source, ClobVenue, ExecutionEngine, ExecutionVenue};
use expirybot::market::{discovery, GammaFeed, MarketFeed, MarketRegistry};
use expirybot::onchain::{ChainClient, HeadWatcher, SettlementChain};
use expirybot::pipeline::{self, Pipeline};
use expirybot::settlement::{SettlementEngine, SettlementSettings};
use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};

const CONFIG_PATH: &str = "expirybot.toml";

/// Resolves on ctrl-c or SIGTERM. SIGTERM is registered before this
/// returns so a stop sent right after startup is not lost.
fn shutdown_signal() -> std::io::Result<impl Future<Output = &'static str>> {
    let mut sigterm = signal(SignalKind::terminate())?;
    Ok(async move {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => "SIGINT",
            _ = sigterm.recv() => "SIGTERM",
        }
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Install rustls crypto provider before any TLS usage (reqwest, WS RPC).
    let _ = rustls::crypto::ring::default_provider().install_default();

    // Load .env if present
    let _ = dotenvy::dotenv();

    let config = Config::load_or_env(Path::new(CONFIG_PATH))?;

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.logging.level));
    if config.logging.json {
        tracing_subscriber::fmt().json().with_env_filter(env_filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(env_filter).init();
    }

    info!("expirybot v{} starting", env!("CARGO_PKG_VERSION"));
    if !Path::new(CONFIG_PATH).exists() {
        info!("no {} found, using env-only config", CONFIG_PATH);
    }

    if let Err(e) = config.validate() {
        error!(error = %e, "invalid configuration");
        return Err(e.into());
    }

    // --- CLOB venue ---
    let creds = L2Credentials::from_config(
        &config.polymarket.api_key,
        &config.polymarket.api_secret,
        &config.polymarket.api_passphrase,
    )
    .ok_or_else(|| {
        anyhow::anyhow!("POLYMARKET_API_KEY, POLYMARKET_SECRET and POLYMARKET_PASSPHRASE are required")
    })?;
    let signer = OrderSigner::from_private_key(&config.chain.private_key)?;
    info!(address = %signer.address(), "order signer ready");
    let api = Arc::new(ClobApiClient::new(
        config.polymarket.clob_url.clone(),
        creds,
        signer.address(),
    ));
    let venue: Arc<dyn ExecutionVenue> = Arc::new(ClobVenue::new(api, signer));

    let winner = build_winner_source(
        config.execution.winner_strategy,
        venue.clone(),
        expirybot::config::to_decimal(config.execution.skew_threshold),
    );
    let execution = Arc::new(ExecutionEngine::new(
        venue,
        winner,
        config.target_price(),
        config.order_size(),
    ));
    if config.execution.enabled {
        execution.start();
    } else {
        warn!("execution disabled, running settlement only");
    }

    // --- Chain ---
    let chain: Arc<dyn SettlementChain> = Arc::new(ChainClient::connect(&config.chain).await?);
    let settlement = SettlementEngine::new(chain, SettlementSettings::from_config(&config));

    // --- Discovery ---
    let registry = MarketRegistry::new();
    let feed: Arc<dyn MarketFeed> = Arc::new(GammaFeed::new(
        config.polymarket.gamma_url.clone(),
        config.discovery.page_size,
        config.discovery.max_markets,
    ));
    let discovery_task = discovery::spawn_refresh_loop(
        feed,
        registry.clone(),
        Duration::from_secs(config.discovery.poll_interval_secs),
        config.horizon(),
    );

    // --- Clock ---
    let (tick_tx, tick_rx) = mpsc::unbounded_channel();
    let clock_task = match config.pipeline.clock {
        ClockKind::Blocks => HeadWatcher::new(&config.chain, tick_tx).start(),
        ClockKind::Timer => pipeline::spawn_timer_clock(
            Duration::from_secs(config.pipeline.timer_interval_secs),
            tick_tx,
        ),
    };

    // --- Pipeline ---
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut driver = Pipeline::new(registry, execution.clone(), settlement);
    let mut pipeline_task = tokio::spawn(async move {
        driver.run(tick_rx, shutdown_rx).await;
    });

    info!(clock = ?config.pipeline.clock, "expirybot running, ctrl-c to stop");

    let shutdown = shutdown_signal()?;
    tokio::select! {
        name = shutdown => {
            info!(signal = name, "shutdown signal received");
        }
        res = &mut pipeline_task => {
            if let Err(e) = res {
                error!(error = %e, "pipeline task failed");
            }
        }
    }

    execution.stop();
    let _ = shutdown_tx.send(true);
    discovery_task.abort();
    clock_task.abort();
    if !pipeline_task.is_finished() {
        // Let an in-flight tick finish its transaction bookkeeping.
        if tokio::time::timeout(Duration::from_secs(30), &mut pipeline_task).await.is_err() {
            warn!("pipeline did not stop in time");
        }
    }

    info!("expirybot stopped");
    Ok(())
}
