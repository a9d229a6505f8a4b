//! Price triggers of armed orders.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use sentinel_core::types::{Condition, FeedKey, Order, OrderId, OrderKind, OrderStatus, PriceTick, TradeAction};

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Trigger {
    Limit { limit_price: f64 },
    Stop { stop_price: f64 },
    Trailing { trail_percent: f64, extreme_price: Option<f64>, stop_price: Option<f64> },
    Conditional { condition: Condition },
}

/// A due order waiting for its price condition.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct ArmedOrder {
    pub id: OrderId,
    pub key: FeedKey,
    pub action: TradeAction,
    pub trigger: Trigger,
    pub pass: u64,
    pub dispatched_at: DateTime<Utc>,
}

/// Result of checking one tick.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct Check {
    pub fire: bool,
    /// New `(extreme, stop)` of a trailing order, when it moved.
    pub moved: Option<(f64, f64)>,
}

impl ArmedOrder {
    /// `None` for kinds that do not wait on the feed.
    pub fn from_order(order: &Order, pass: u64, dispatched_at: DateTime<Utc>) -> Option<Self> {
        let trigger = match &order.kind {
            OrderKind::Limit { limit_price } => Trigger::Limit { limit_price: *limit_price },
            OrderKind::Stop { stop_price } => Trigger::Stop { stop_price: *stop_price },
            OrderKind::Trailing { trail_percent, extreme_price, stop_price } => Trigger::Trailing {
                trail_percent: *trail_percent,
                extreme_price: *extreme_price,
                stop_price: *stop_price,
            },
            OrderKind::Conditional { condition } => Trigger::Conditional { condition: condition.clone() },
            _ => return None,
        };
        Some(Self { id: order.id.clone(), key: order.feed_key(), action: order.action, trigger, pass, dispatched_at })
    }

    /// Orders whose status the condition reads, if any.
    pub fn referenced_orders(&self) -> Vec<OrderId> {
        match &self.trigger {
            Trigger::Conditional { condition } => condition.referenced_orders(),
            _ => Vec::new(),
        }
    }

    /// Evaluate `tick`, updating trailing state in place.
    pub fn check(&mut self, tick: &PriceTick, statuses: &HashMap<OrderId, OrderStatus>) -> Check {
        let price = tick.price;
        match &mut self.trigger {
            Trigger::Limit { limit_price } => Check { fire: limit_hit(self.action, price, *limit_price), moved: None },
            Trigger::Stop { stop_price } => Check { fire: stop_hit(self.action, price, *stop_price), moved: None },
            Trigger::Trailing { trail_percent, extreme_price, stop_price } => {
                let improved = match (self.action, *extreme_price) {
                    (_, None) => true,
                    (TradeAction::Sell, Some(high)) => price > high,
                    (TradeAction::Buy, Some(low)) => price < low,
                };
                let mut moved = None;
                if improved {
                    let stop = trailing_stop(self.action, price, *trail_percent);
                    *extreme_price = Some(price);
                    *stop_price = Some(stop);
                    moved = Some((price, stop));
                }
                let fire = stop_price.is_some_and(|stop| stop_hit(self.action, price, stop));
                Check { fire, moved }
            }
            Trigger::Conditional { condition } => Check { fire: condition.evaluate(tick, statuses), moved: None },
        }
    }
}

/// Buy at or below the limit, sell at or above it.
pub(crate) fn limit_hit(action: TradeAction, price: f64, limit: f64) -> bool {
    match action {
        TradeAction::Buy => price <= limit,
        TradeAction::Sell => price >= limit,
    }
}

/// Sell at or below the stop, buy at or above it.
pub(crate) fn stop_hit(action: TradeAction, price: f64, stop: f64) -> bool {
    match action {
        TradeAction::Sell => price <= stop,
        TradeAction::Buy => price >= stop,
    }
}

/// Sell trails below the high, buy trails above the low.
pub(crate) fn trailing_stop(action: TradeAction, extreme: f64, trail_percent: f64) -> f64 {
    let trail = trail_percent / 100.0;
    match action {
        TradeAction::Sell => extreme * (1.0 - trail),
        TradeAction::Buy => extreme * (1.0 + trail),
    }
}
