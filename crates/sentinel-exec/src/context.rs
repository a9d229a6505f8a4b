//! Explicitly constructed engine context and the engine lifecycle.

use std::sync::Arc;
use std::time::Duration;

use sentinel_core::breaker::{BROKER, BreakerRegistry, PRICE_QUOTE, WALLET};
use sentinel_core::config::SchedulerConfig;
use sentinel_core::error::Result;
use sentinel_core::store::Store;
use sentinel_core::types::{FeedKey, PriceTick, Settlement};
use sentinel_feed::PriceFeedSupervisor;
use tracing::info;

use crate::alerts::AlertEngine;
use crate::event::{ExecEvent, ExecEventSender};
use crate::scheduler::OrderScheduler;
use crate::{Broker, PriceQuote, TradeRequest, Wallets};

/// Shared dependencies of the scheduler and alert engine.
///
/// Every external call goes through [`BreakerRegistry`] under one of the
/// dependency names `price-quote`, `broker` and `wallet`.
#[derive(Clone)]
pub struct EngineContext {
    pub store: Arc<dyn Store>,
    pub breakers: Arc<BreakerRegistry>,
    pub feeds: PriceFeedSupervisor,
    pub broker: Arc<dyn Broker>,
    pub quotes: Arc<dyn PriceQuote>,
    pub wallets: Arc<dyn Wallets>,
    pub events: ExecEventSender,
}

impl EngineContext {
    pub fn emit(&self, event: ExecEvent) {
        let _ = self.events.send(event);
    }

    pub async fn quote(&self, key: &FeedKey) -> Result<f64> {
        let price = self
            .breakers
            .run(PRICE_QUOTE, || self.quotes.current_price(&key.network, &key.token_address))
            .await?;
        Ok(price)
    }

    /// Latest feed tick for `key`, else a quoted point price.
    pub async fn freshest_tick(&self, key: &FeedKey) -> Result<PriceTick> {
        if let Some(tick) = self.feeds.last_price(key) {
            return Ok(tick);
        }
        Ok(PriceTick::new(key.clone(), self.quote(key).await?))
    }

    pub async fn submit_trade(&self, request: &TradeRequest) -> Result<Settlement> {
        let settlement = self.breakers.run(BROKER, || self.broker.execute_trade(request)).await?;
        Ok(settlement)
    }

    pub async fn balance(&self, network: &str, token_address: &str, wallet_address: &str) -> Result<f64> {
        let balance = self
            .breakers
            .run(WALLET, || self.wallets.balance(network, token_address, wallet_address))
            .await?;
        Ok(balance)
    }

    pub async fn request_approval(&self, token_address: &str, wallet_address: &str, amount: f64) -> Result<bool> {
        let approved = self
            .breakers
            .run(WALLET, || self.wallets.check_and_request_approval(token_address, wallet_address, amount))
            .await?;
        Ok(approved)
    }
}

/// Scheduler plus alert engine over one context. Owned by the process entry
/// point, which drives `start` and `stop`.
pub struct Engine {
    ctx: EngineContext,
    pub scheduler: OrderScheduler,
    pub alerts: AlertEngine,
}

impl Engine {
    pub fn new(ctx: EngineContext, config: SchedulerConfig) -> Self {
        Self {
            scheduler: OrderScheduler::new(ctx.clone(), config),
            alerts: AlertEngine::new(ctx.clone()),
            ctx,
        }
    }

    pub fn context(&self) -> &EngineContext {
        &self.ctx
    }

    /// Rebuild in-memory state from the store and start health reporting.
    /// Returns `(orders rescheduled, alerts restored)`.
    pub async fn start(&self, status_interval: Duration) -> Result<(usize, usize)> {
        self.ctx.breakers.start(status_interval);
        let orders = self.scheduler.restore().await?;
        let alerts = self.alerts.restore().await?;
        info!("[engine] started: {orders} pending orders rescheduled, {alerts} active alerts restored");
        Ok((orders, alerts))
    }

    pub async fn stop(&self) {
        self.scheduler.stop();
        self.alerts.stop();
        self.ctx.breakers.stop();
        self.ctx.feeds.stop().await;
        info!("[engine] stopped");
    }
}
