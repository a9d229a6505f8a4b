//! Durable storage for orders and alerts.
//!
//! The store is the source of truth: the scheduler and the alert engine
//! rebuild their in-memory state from it after a restart. Status updates are
//! compare-and-set on "still open" so that an order or alert can only ever be
//! closed once, even if two paths race to execute it.

mod json_file;
mod memory;

use std::collections::HashMap;

use ahash::AHashMap;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::types::{AlertExecution, AlertId, ExecutionResult, Order, OrderId, OrderKind, OrderStatus, PriceAlert};

pub use json_file::JsonFileStore;
pub use memory::MemoryStore;

#[async_trait]
pub trait Store: Send + Sync {
    /// Insert or replace.
    async fn save_order(&self, order: &Order) -> Result<()>;

    async fn get_order(&self, id: &OrderId) -> Result<Option<Order>>;

    /// All `Pending` orders in insertion order.
    async fn load_pending_orders(&self) -> Result<Vec<Order>>;

    /// Orders whose `parent_id` is `parent`, in insertion order.
    async fn load_children(&self, parent: &OrderId) -> Result<Vec<Order>>;

    /// Current status of each id that exists.
    async fn order_statuses(&self, ids: &[OrderId]) -> Result<HashMap<OrderId, OrderStatus>>;

    /// Close a pending order. Returns false, changing nothing, when the order
    /// is missing or no longer `Pending`.
    async fn update_order_status(&self, id: &OrderId, status: OrderStatus, result: ExecutionResult) -> Result<bool>;

    /// Persist a trailing order's watermark and derived stop.
    async fn update_trailing_stop(&self, id: &OrderId, extreme_price: f64, stop_price: f64) -> Result<()>;

    async fn delete_order(&self, id: &OrderId) -> Result<bool>;

    async fn save_alert(&self, alert: &PriceAlert) -> Result<()>;

    async fn get_alert(&self, id: &AlertId) -> Result<Option<PriceAlert>>;

    /// Active alerts in insertion order.
    async fn load_active_alerts(&self) -> Result<Vec<PriceAlert>>;

    /// Deactivate an active alert and record how it ended. Returns false when
    /// the alert is missing or already inactive.
    async fn update_alert_status(&self, id: &AlertId, result: AlertExecution) -> Result<bool>;
}

/// In-memory tables shared by both store implementations.
///
/// Every row carries an insertion sequence so listings come back in creation
/// order regardless of hash iteration order.
#[derive(Debug, Default, Clone)]
pub(crate) struct Tables {
    seq: u64,
    orders: AHashMap<OrderId, (u64, Order)>,
    alerts: AHashMap<AlertId, (u64, PriceAlert)>,
}

/// On-disk layout of [`JsonFileStore`].
#[derive(Debug, Default, Serialize, Deserialize)]
pub(crate) struct Snapshot {
    #[serde(default)]
    pub orders: Vec<Order>,
    #[serde(default)]
    pub alerts: Vec<PriceAlert>,
}

impl Tables {
    fn next_seq(&mut self) -> u64 {
        self.seq += 1;
        self.seq
    }

    pub fn from_snapshot(snapshot: Snapshot) -> Self {
        let mut tables = Self::default();
        for order in snapshot.orders {
            tables.put_order(order);
        }
        for alert in snapshot.alerts {
            tables.put_alert(alert);
        }
        tables
    }

    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            orders: sorted(self.orders.values()).cloned().collect(),
            alerts: sorted(self.alerts.values()).cloned().collect(),
        }
    }

    pub fn put_order(&mut self, order: Order) {
        let seq = match self.orders.get(&order.id) {
            Some((seq, _)) => *seq,
            None => self.next_seq(),
        };
        self.orders.insert(order.id.clone(), (seq, order));
    }

    pub fn order(&self, id: &OrderId) -> Option<Order> {
        self.orders.get(id).map(|(_, o)| o.clone())
    }

    pub fn pending_orders(&self) -> Vec<Order> {
        sorted(self.orders.values()).filter(|o| o.is_pending()).cloned().collect()
    }

    pub fn children(&self, parent: &OrderId) -> Vec<Order> {
        sorted(self.orders.values())
            .filter(|o| o.parent_id.as_ref() == Some(parent))
            .cloned()
            .collect()
    }

    pub fn statuses(&self, ids: &[OrderId]) -> HashMap<OrderId, OrderStatus> {
        ids.iter()
            .filter_map(|id| self.orders.get(id).map(|(_, o)| (id.clone(), o.status)))
            .collect()
    }

    pub fn close_order(&mut self, id: &OrderId, status: OrderStatus, result: ExecutionResult) -> bool {
        match self.orders.get_mut(id) {
            Some((_, order)) if order.is_pending() => {
                order.status = status;
                order.execution_result = Some(result);
                true
            }
            _ => false,
        }
    }

    pub fn set_trailing(&mut self, id: &OrderId, extreme: f64, stop: f64) -> bool {
        match self.orders.get_mut(id) {
            Some((_, Order { kind: OrderKind::Trailing { extreme_price, stop_price, .. }, .. })) => {
                *extreme_price = Some(extreme);
                *stop_price = Some(stop);
                true
            }
            _ => false,
        }
    }

    pub fn remove_order(&mut self, id: &OrderId) -> bool {
        self.orders.remove(id).is_some()
    }

    pub fn put_alert(&mut self, alert: PriceAlert) {
        let seq = match self.alerts.get(&alert.id) {
            Some((seq, _)) => *seq,
            None => self.next_seq(),
        };
        self.alerts.insert(alert.id.clone(), (seq, alert));
    }

    pub fn alert(&self, id: &AlertId) -> Option<PriceAlert> {
        self.alerts.get(id).map(|(_, a)| a.clone())
    }

    pub fn active_alerts(&self) -> Vec<PriceAlert> {
        sorted(self.alerts.values()).filter(|a| a.is_active).cloned().collect()
    }

    pub fn close_alert(&mut self, id: &AlertId, result: AlertExecution) -> bool {
        match self.alerts.get_mut(id) {
            Some((_, alert)) if alert.is_active => {
                alert.is_active = false;
                alert.execution_result = Some(result);
                true
            }
            _ => false,
        }
    }
}

fn sorted<'a, T: 'a>(rows: impl Iterator<Item = &'a (u64, T)>) -> impl Iterator<Item = &'a T> {
    let mut rows: Vec<&(u64, T)> = rows.collect();
    rows.sort_by_key(|(seq, _)| *seq);
    rows.into_iter().map(|(_, row)| row)
}
