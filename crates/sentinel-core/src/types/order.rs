//! Orders: the persisted record, its kind-specific payloads and creation specs.
//!
//! Kind-specific fields live on [`OrderKind`] rather than as optional columns on
//! [`Order`], so every consumer matches on the variant it cares about.

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::enums::{OrderStatus, TradeAction};
use super::market::{FeedKey, PriceTick};
use crate::error::{EngineError, Result};

// ---------------------------------------------------------------------------
// Identifiers
// ---------------------------------------------------------------------------

/// Stable order identifier (UUID v4 string).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OrderId(pub String);

impl OrderId {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for OrderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for OrderId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

// ---------------------------------------------------------------------------
// Conditional predicate
// ---------------------------------------------------------------------------

/// Gate for a conditional order, evaluated on each tick of the order's token.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Condition {
    PriceAbove { price: f64 },
    PriceBelow { price: f64 },
    VolumeAbove { volume: f64 },
    /// Another order has reached the given status.
    OrderStatusIs { order_id: OrderId, status: OrderStatus },
    All { conditions: Vec<Condition> },
    Any { conditions: Vec<Condition> },
}

impl Condition {
    /// Evaluate against a tick. `statuses` must contain every order returned
    /// by [`referenced_orders`](Self::referenced_orders) that still exists.
    pub fn evaluate(&self, tick: &PriceTick, statuses: &HashMap<OrderId, OrderStatus>) -> bool {
        match self {
            Self::PriceAbove { price } => tick.price >= *price,
            Self::PriceBelow { price } => tick.price <= *price,
            Self::VolumeAbove { volume } => tick.volume_24h.is_some_and(|v| v >= *volume),
            Self::OrderStatusIs { order_id, status } => statuses.get(order_id) == Some(status),
            Self::All { conditions } => conditions.iter().all(|c| c.evaluate(tick, statuses)),
            Self::Any { conditions } => conditions.iter().any(|c| c.evaluate(tick, statuses)),
        }
    }

    /// Orders whose status this predicate depends on.
    pub fn referenced_orders(&self) -> Vec<OrderId> {
        let mut out = Vec::new();
        self.collect_refs(&mut out);
        out
    }

    fn collect_refs(&self, out: &mut Vec<OrderId>) {
        match self {
            Self::OrderStatusIs { order_id, .. } => out.push(order_id.clone()),
            Self::All { conditions } | Self::Any { conditions } => {
                for c in conditions {
                    c.collect_refs(out);
                }
            }
            _ => {}
        }
    }

    fn validate(&self) -> Result<()> {
        match self {
            Self::PriceAbove { price } | Self::PriceBelow { price } => positive("condition price", *price),
            Self::VolumeAbove { volume } => positive("condition volume", *volume),
            Self::OrderStatusIs { order_id, .. } => non_empty("condition order id", order_id.as_str()),
            Self::All { conditions } | Self::Any { conditions } => {
                if conditions.is_empty() {
                    return Err(EngineError::InvalidSpec("empty condition group".into()));
                }
                conditions.iter().try_for_each(Condition::validate)
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Order kind
// ---------------------------------------------------------------------------

/// Kind-specific condition payload of an order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OrderKind {
    /// Executes at `execute_at`.
    Standard,
    /// Buy at or below / sell at or above `limit_price`.
    Limit { limit_price: f64 },
    /// Sell at or below / buy at or above `stop_price`.
    Stop { stop_price: f64 },
    /// Stop that follows the best price seen by `trail_percent`.
    Trailing {
        trail_percent: f64,
        /// Highest (sell) or lowest (buy) price observed so far.
        extreme_price: Option<f64>,
        /// Current trigger price derived from `extreme_price`.
        stop_price: Option<f64>,
    },
    /// Ladder parent; its children are limit orders.
    Scaled { levels: u32, base_price: f64, price_step: f64, amount_per_level: f64 },
    /// Chain parent; `steps` execute strictly in order.
    Chained { steps: Vec<OrderId> },
    /// One step of a chain, driven by its parent.
    ChainStep { parent: OrderId, position: u32 },
    /// Executes once the predicate holds on a tick.
    Conditional { condition: Condition },
}

impl OrderKind {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Standard => "standard",
            Self::Limit { .. } => "limit",
            Self::Stop { .. } => "stop",
            Self::Trailing { .. } => "trailing",
            Self::Scaled { .. } => "scaled",
            Self::Chained { .. } => "chained",
            Self::ChainStep { .. } => "chain_step",
            Self::Conditional { .. } => "conditional",
        }
    }

    /// Kinds that, once due, wait on live ticks before executing.
    pub fn is_price_triggered(&self) -> bool {
        matches!(
            self,
            Self::Limit { .. } | Self::Stop { .. } | Self::Trailing { .. } | Self::Conditional { .. }
        )
    }
}

// ---------------------------------------------------------------------------
// Execution result
// ---------------------------------------------------------------------------

/// What the broker reported for a settled trade.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settlement {
    /// Transaction hash (EVM) or signature (Solana).
    #[serde(alias = "signature", alias = "hash")]
    pub tx_hash: String,
    pub price: f64,
    #[serde(alias = "gasCost")]
    pub gas_cost: f64,
}

/// Terminal outcome recorded on an order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ExecutionOutcome {
    Settled(Settlement),
    Failed { error: String },
    /// Parent order whose work was handed to child orders.
    Delegated { children: Vec<OrderId> },
    /// Closed without a trade (user cancel, aborted chain step).
    Skipped { reason: String },
}

/// Populated exactly when an order reaches a terminal status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub outcome: ExecutionOutcome,
    /// Broker submission attempts made.
    pub attempts: u32,
    /// Timestamp of the scheduling pass that released the order.
    pub dispatched_at: Option<DateTime<Utc>>,
    pub completed_at: DateTime<Utc>,
}

impl ExecutionResult {
    pub fn new(outcome: ExecutionOutcome, attempts: u32, dispatched_at: Option<DateTime<Utc>>) -> Self {
        Self { outcome, attempts, dispatched_at, completed_at: Utc::now() }
    }

    pub fn skipped(reason: impl Into<String>) -> Self {
        Self::new(ExecutionOutcome::Skipped { reason: reason.into() }, 0, None)
    }
}

// ---------------------------------------------------------------------------
// Order
// ---------------------------------------------------------------------------

/// A persisted conditional or time-triggered trade request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Order {
    pub id: OrderId,
    pub user_id: String,
    pub wallet_address: String,
    pub network: String,
    pub token_address: String,
    pub action: TradeAction,
    pub amount: f64,
    #[serde(flatten)]
    pub kind: OrderKind,
    pub status: OrderStatus,
    /// Set at creation, never modified afterwards.
    pub execute_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub parent_id: Option<OrderId>,
    pub execution_result: Option<ExecutionResult>,
}

impl Order {
    pub fn feed_key(&self) -> FeedKey {
        FeedKey::new(&self.network, &self.token_address)
    }

    pub fn is_pending(&self) -> bool {
        self.status == OrderStatus::Pending
    }
}

// ---------------------------------------------------------------------------
// Creation specs
// ---------------------------------------------------------------------------

/// One step of a chained order spec. Network and wallet come from the parent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainStepSpec {
    pub token_address: String,
    pub action: TradeAction,
    pub amount: f64,
}

/// Kind-specific part of an [`OrderSpec`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum KindSpec {
    Standard,
    Limit { limit_price: f64 },
    Stop { stop_price: f64 },
    Trailing { trail_percent: f64 },
    /// `levels` children at `base_price + i * price_step`, `amount / levels` each.
    Scaled { levels: u32, base_price: f64, price_step: f64 },
    Chained { steps: Vec<ChainStepSpec> },
    Conditional { condition: Condition },
}

/// Input to order creation, produced by the presentation layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderSpec {
    pub user_id: String,
    pub wallet_address: String,
    pub network: String,
    pub token_address: String,
    pub action: TradeAction,
    /// Total amount. For chained orders each step carries its own amount.
    pub amount: f64,
    /// Defaults to now.
    pub execute_at: Option<DateTime<Utc>>,
    #[serde(flatten)]
    pub kind: KindSpec,
}

impl OrderSpec {
    pub fn standard(
        user_id: impl Into<String>,
        wallet_address: impl Into<String>,
        network: impl Into<String>,
        token_address: impl Into<String>,
        action: TradeAction,
        amount: f64,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            wallet_address: wallet_address.into(),
            network: network.into(),
            token_address: token_address.into(),
            action,
            amount,
            execute_at: None,
            kind: KindSpec::Standard,
        }
    }

    #[must_use]
    pub fn at(mut self, execute_at: DateTime<Utc>) -> Self {
        self.execute_at = Some(execute_at);
        self
    }

    #[must_use]
    pub fn with_kind(mut self, kind: KindSpec) -> Self {
        self.kind = kind;
        self
    }

    #[must_use]
    pub fn with_action(mut self, action: TradeAction) -> Self {
        self.action = action;
        self
    }

    #[must_use]
    pub fn with_amount(mut self, amount: f64) -> Self {
        self.amount = amount;
        self
    }

    /// Reject malformed parameters before anything is persisted.
    pub fn validate(&self) -> Result<()> {
        non_empty("user id", &self.user_id)?;
        non_empty("wallet address", &self.wallet_address)?;
        non_empty("network", &self.network)?;
        non_empty("token address", &self.token_address)?;

        match &self.kind {
            KindSpec::Chained { steps } => {
                if steps.is_empty() {
                    return Err(EngineError::InvalidSpec("chained order needs at least one step".into()));
                }
                for step in steps {
                    non_empty("step token address", &step.token_address)?;
                    positive("step amount", step.amount)?;
                }
                return Ok(());
            }
            _ => positive("amount", self.amount)?,
        }

        match &self.kind {
            KindSpec::Standard | KindSpec::Chained { .. } => Ok(()),
            KindSpec::Limit { limit_price } => positive("limit price", *limit_price),
            KindSpec::Stop { stop_price } => positive("stop price", *stop_price),
            KindSpec::Trailing { trail_percent } => {
                if !trail_percent.is_finite() || *trail_percent <= 0.0 || *trail_percent >= 100.0 {
                    return Err(EngineError::InvalidSpec(format!(
                        "trail percent must be in (0, 100), got {trail_percent}"
                    )));
                }
                Ok(())
            }
            KindSpec::Scaled { levels, base_price, price_step } => {
                if *levels == 0 {
                    return Err(EngineError::InvalidSpec("scaled order needs at least one level".into()));
                }
                positive("base price", *base_price)?;
                if !price_step.is_finite() {
                    return Err(EngineError::InvalidSpec("price step must be finite".into()));
                }
                let last = base_price + f64::from(levels - 1) * price_step;
                positive("lowest ladder price", last.min(*base_price))
            }
            KindSpec::Conditional { condition } => condition.validate(),
        }
    }
}

fn non_empty(field: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(EngineError::InvalidSpec(format!("{field} is required")));
    }
    Ok(())
}

fn positive(field: &str, value: f64) -> Result<()> {
    if !value.is_finite() || value <= 0.0 {
        return Err(EngineError::InvalidSpec(format!("{field} must be a positive number, got {value}")));
    }
    Ok(())
}
