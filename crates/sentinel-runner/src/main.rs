//! # sentinel-runner
//!
//! Process entry point for the execution engine.
//!
//! Loads a JSON configuration file, builds the engine context (store,
//! breakers, feed supervisor, gateway), restores pending orders and active
//! alerts, and runs until Ctrl+C.
//!
//! # Usage
//!
//! ```bash
//! sentinel-runner config.json --log-level info
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use sentinel_core::breaker::BreakerRegistry;
use sentinel_core::config::load_config;
use sentinel_core::health::LogHealthSink;
use sentinel_core::logging::{LogFormat, init_logging};
use sentinel_core::store::JsonFileStore;
use sentinel_exec::context::{Engine, EngineContext};
use sentinel_exec::event::{ExecEvent, ExecEventReceiver};
use sentinel_exec::rest::RestGateway;
use sentinel_feed::{PriceFeedSupervisor, WsTransport};
use tokio::sync::mpsc;
use tracing::{info, warn};

/// Conditional and time-triggered order execution engine.
#[derive(Parser)]
#[command(name = "sentinel-runner", about = "Conditional order and price alert execution engine")]
struct Cli {
    /// Configuration file path (JSON).
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Log directory for file output. Overrides `engine.log_path`.
    #[arg(long)]
    log_dir: Option<String>,

    /// Emit JSON log lines. Overrides `engine.log_format`.
    #[arg(long)]
    log_json: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // 1. Configuration
    let config = load_config(&cli.config).with_context(|| format!("failed to load {}", cli.config.display()))?;
    config.validate()?;

    // 2. Logging
    let format = if cli.log_json { LogFormat::Json } else { config.engine.log_format.unwrap_or_default() };
    let log_dir = cli.log_dir.clone().or_else(|| config.engine.log_path.clone());
    let module_name = config.engine.module_name();
    init_logging(&cli.log_level, log_dir.as_deref(), &module_name, format);
    info!("sentinel-runner starting: config={}, log_level={}", cli.config.display(), cli.log_level);

    // 3. Context
    let store = Arc::new(JsonFileStore::open(config.engine.store_path()).await?);
    let gateway = Arc::new(RestGateway::new(&config.gateway.gateway_config())?);
    let health = Arc::new(LogHealthSink);
    let breakers = Arc::new(
        BreakerRegistry::new(config.breaker.default_config(), health.clone())
            .with_overrides(config.breaker.override_configs()),
    );
    let feed_config = config.feed.feed_config();
    let transport = Arc::new(WsTransport::new(&feed_config));
    let feeds = PriceFeedSupervisor::new(feed_config, transport, health);
    let (events_tx, events_rx) = mpsc::unbounded_channel();

    let ctx = EngineContext {
        store,
        breakers,
        feeds,
        broker: gateway.clone(),
        quotes: gateway.clone(),
        wallets: gateway,
        events: events_tx,
    };
    let engine = Engine::new(ctx, config.scheduler.scheduler_config());

    // 4. Restore and run
    let (orders, alerts) = engine.start(config.breaker.effective_status_interval()).await?;
    info!("engine running with {orders} scheduled orders and {alerts} active alerts, press Ctrl+C to stop");
    let reporter = tokio::spawn(log_events(events_rx));

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");

    // 5. Stop
    engine.stop().await;
    reporter.abort();
    info!("sentinel-runner stopped");
    Ok(())
}

async fn log_events(mut events: ExecEventReceiver) {
    while let Some(event) = events.recv().await {
        match event {
            ExecEvent::OrderExecuted { order_id, settlement } => {
                info!(order = %order_id, tx = %settlement.tx_hash, price = settlement.price, "[runner] order executed");
            }
            ExecEvent::OrderFailed { order_id, error } => {
                warn!(order = %order_id, error = %error, "[runner] order failed");
            }
            ExecEvent::OrderPostponed { order_id, reason, retry_in } => {
                warn!(order = %order_id, reason = %reason, retry_in = ?retry_in, "[runner] order postponed");
            }
            ExecEvent::AlertTriggered { alert_id, price, outcome } => {
                info!(alert = %alert_id, price, outcome = ?outcome, "[runner] alert triggered");
            }
            ExecEvent::AlertDeferred { alert_id, reason } => {
                warn!(alert = %alert_id, reason = %reason, "[runner] alert deferred");
            }
            other => tracing::debug!("[runner] {other:?}"),
        }
    }
}
