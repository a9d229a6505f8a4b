//! Events emitted by the scheduler and alert engine.
//!
//! The runner (or any embedding layer) polls an [`ExecEventReceiver`] to
//! observe what the engine did. Persisted records remain the source of truth;
//! these events are notifications only.

use std::time::Duration;

use chrono::{DateTime, Utc};
use sentinel_core::types::{AlertId, AlertOutcome, OrderId, Settlement};

#[derive(Debug, Clone, PartialEq)]
pub enum ExecEvent {
    /// Order accepted and placed in a coalescing group.
    OrderScheduled { order_id: OrderId, execute_at: DateTime<Utc> },

    /// Released by a scheduling pass. Orders from the same pass share
    /// `pass` and `dispatched_at`.
    OrderDispatched { order_id: OrderId, pass: u64, dispatched_at: DateTime<Utc> },

    /// Price-triggered order is now watching the live feed.
    OrderArmed { order_id: OrderId },

    /// Trailing order moved its stop.
    TrailingStopMoved { order_id: OrderId, extreme_price: f64, stop_price: f64 },

    OrderExecuted { order_id: OrderId, settlement: Settlement },

    OrderFailed { order_id: OrderId, error: String },

    /// A breaker refused the order's price or broker call. The order stays
    /// pending and goes back to the lane after `retry_in`.
    OrderPostponed { order_id: OrderId, reason: String, retry_in: Duration },

    /// A scaled or chained parent closed after handing its work to children.
    OrderDelegated { order_id: OrderId, children: Vec<OrderId> },

    OrderCancelled { order_id: OrderId },

    /// An alert fired and was deactivated.
    AlertTriggered { alert_id: AlertId, price: f64, outcome: AlertOutcome },

    /// An alert's condition held but the trade could not start yet
    /// (approval missing, balance unavailable, broker breaker open). The
    /// alert stays active.
    AlertDeferred { alert_id: AlertId, reason: String },
}

/// Sender half of the execution event channel.
pub type ExecEventSender = tokio::sync::mpsc::UnboundedSender<ExecEvent>;

/// Receiver half of the execution event channel.
pub type ExecEventReceiver = tokio::sync::mpsc::UnboundedReceiver<ExecEvent>;
