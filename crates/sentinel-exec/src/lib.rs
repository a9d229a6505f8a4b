//! # sentinel-exec
//!
//! Order scheduling and alert triggering on top of the feed supervisor and
//! breaker registry.
//!
//! External services the engine drives are reached through the collaborator
//! traits below. [`rest::RestGateway`] implements all of them over HTTP;
//! tests use in-memory mocks.
//!
//! ## Lifecycle
//!
//! 1. Build an [`EngineContext`](context::EngineContext) (store, breakers,
//!    feed supervisor, collaborators, event channel).
//! 2. [`Engine::start`](context::Engine::start) restores pending orders and
//!    active alerts and starts the breaker status reporter.
//! 3. Create/cancel orders and alerts through the scheduler and alert engine.
//! 4. [`Engine::stop`](context::Engine::stop) tears everything down.

pub mod alerts;
pub mod context;
pub mod event;
pub mod rest;
pub mod scheduler;
mod signal;

#[cfg(test)]
mod testing;

use anyhow::Result;
use async_trait::async_trait;
use sentinel_core::types::{Settlement, TradeAction};
use serde::Serialize;

/// Parameters handed to the broker. Validation already happened upstream.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TradeRequest {
    pub network: String,
    pub action: TradeAction,
    pub token_address: String,
    pub amount: f64,
    pub wallet_address: String,
    pub options: TradeOptions,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TradeOptions {
    /// Price the engine observed when it decided to trade.
    pub expected_price: Option<f64>,
    /// Order or alert id, for broker-side idempotency and auditing.
    pub client_ref: Option<String>,
}

/// Trade-execution collaborator.
///
/// Errors are opaque: the engine only distinguishes success from failure.
#[async_trait]
pub trait Broker: Send + Sync {
    async fn execute_trade(&self, request: &TradeRequest) -> Result<Settlement>;
}

/// On-demand point price, used when no live tick is at hand.
#[async_trait]
pub trait PriceQuote: Send + Sync {
    async fn current_price(&self, network: &str, token_address: &str) -> Result<f64>;
}

/// Wallet balances and approval flows.
#[async_trait]
pub trait Wallets: Send + Sync {
    async fn balance(&self, network: &str, token_address: &str, wallet_address: &str) -> Result<f64>;

    /// Ask an externally connected wallet to approve spending `amount`.
    /// `Ok(false)` means the user declined or the request is still open.
    async fn check_and_request_approval(&self, token_address: &str, wallet_address: &str, amount: f64) -> Result<bool>;
}
