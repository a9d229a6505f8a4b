use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;

use super::{Store, Tables};
use crate::error::Result;
use crate::types::{AlertExecution, AlertId, ExecutionResult, Order, OrderId, OrderStatus, PriceAlert};

/// Volatile store for tests and dry runs.
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn tables(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn save_order(&self, order: &Order) -> Result<()> {
        self.tables().put_order(order.clone());
        Ok(())
    }

    async fn get_order(&self, id: &OrderId) -> Result<Option<Order>> {
        Ok(self.tables().order(id))
    }

    async fn load_pending_orders(&self) -> Result<Vec<Order>> {
        Ok(self.tables().pending_orders())
    }

    async fn load_children(&self, parent: &OrderId) -> Result<Vec<Order>> {
        Ok(self.tables().children(parent))
    }

    async fn order_statuses(&self, ids: &[OrderId]) -> Result<HashMap<OrderId, OrderStatus>> {
        Ok(self.tables().statuses(ids))
    }

    async fn update_order_status(&self, id: &OrderId, status: OrderStatus, result: ExecutionResult) -> Result<bool> {
        Ok(self.tables().close_order(id, status, result))
    }

    async fn update_trailing_stop(&self, id: &OrderId, extreme_price: f64, stop_price: f64) -> Result<()> {
        self.tables().set_trailing(id, extreme_price, stop_price);
        Ok(())
    }

    async fn delete_order(&self, id: &OrderId) -> Result<bool> {
        Ok(self.tables().remove_order(id))
    }

    async fn save_alert(&self, alert: &PriceAlert) -> Result<()> {
        self.tables().put_alert(alert.clone());
        Ok(())
    }

    async fn get_alert(&self, id: &AlertId) -> Result<Option<PriceAlert>> {
        Ok(self.tables().alert(id))
    }

    async fn load_active_alerts(&self) -> Result<Vec<PriceAlert>> {
        Ok(self.tables().active_alerts())
    }

    async fn update_alert_status(&self, id: &AlertId, result: AlertExecution) -> Result<bool> {
        Ok(self.tables().close_alert(id, result))
    }
}
