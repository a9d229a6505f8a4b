use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::{Snapshot, Store, Tables};
use crate::error::{EngineError, Result};
use crate::types::{AlertExecution, AlertId, ExecutionResult, Order, OrderId, OrderStatus, PriceAlert};

/// Single-file JSON store.
///
/// Every mutation rewrites the whole file through a temp file + rename, so a
/// crash leaves either the old or the new snapshot on disk, never a torn one.
/// Memory only takes a change once its snapshot is on disk; a failed write
/// leaves both unchanged.
pub struct JsonFileStore {
    path: PathBuf,
    tables: Mutex<Tables>,
}

impl JsonFileStore {
    /// Open `path`, loading its contents if the file exists.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let tables = match tokio::fs::read(&path).await {
            Ok(bytes) if bytes.is_empty() => Tables::default(),
            Ok(bytes) => {
                let snapshot: Snapshot = serde_json::from_slice(&bytes)
                    .map_err(|e| EngineError::Store(format!("corrupt store file {}: {e}", path.display())))?;
                info!(
                    "[store] loaded {} orders, {} alerts from {}",
                    snapshot.orders.len(),
                    snapshot.alerts.len(),
                    path.display()
                );
                Tables::from_snapshot(snapshot)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!("[store] {} not found, starting empty", path.display());
                Tables::default()
            }
            Err(e) => return Err(e.into()),
        };

        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(dir).await?;
        }

        Ok(Self { path, tables: Mutex::new(tables) })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Apply `change` to a copy of the tables, write the copy and only then
    /// swap it in. `change` returns false when it had nothing to do.
    async fn commit(&self, change: impl FnOnce(&mut Tables) -> bool) -> Result<bool> {
        let mut tables = self.tables.lock().await;
        let mut next = tables.clone();
        if !change(&mut next) {
            return Ok(false);
        }
        self.persist(&next).await?;
        *tables = next;
        Ok(true)
    }

    async fn persist(&self, tables: &Tables) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(&tables.snapshot())?;
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, &bytes).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        debug!("[store] wrote {} bytes to {}", bytes.len(), self.path.display());
        Ok(())
    }
}

#[async_trait]
impl Store for JsonFileStore {
    async fn save_order(&self, order: &Order) -> Result<()> {
        self.commit(|t| {
            t.put_order(order.clone());
            true
        })
        .await?;
        Ok(())
    }

    async fn get_order(&self, id: &OrderId) -> Result<Option<Order>> {
        Ok(self.tables.lock().await.order(id))
    }

    async fn load_pending_orders(&self) -> Result<Vec<Order>> {
        Ok(self.tables.lock().await.pending_orders())
    }

    async fn load_children(&self, parent: &OrderId) -> Result<Vec<Order>> {
        Ok(self.tables.lock().await.children(parent))
    }

    async fn order_statuses(&self, ids: &[OrderId]) -> Result<HashMap<OrderId, OrderStatus>> {
        Ok(self.tables.lock().await.statuses(ids))
    }

    async fn update_order_status(&self, id: &OrderId, status: OrderStatus, result: ExecutionResult) -> Result<bool> {
        self.commit(|t| t.close_order(id, status, result)).await
    }

    async fn update_trailing_stop(&self, id: &OrderId, extreme_price: f64, stop_price: f64) -> Result<()> {
        self.commit(|t| t.set_trailing(id, extreme_price, stop_price)).await?;
        Ok(())
    }

    async fn delete_order(&self, id: &OrderId) -> Result<bool> {
        self.commit(|t| t.remove_order(id)).await
    }

    async fn save_alert(&self, alert: &PriceAlert) -> Result<()> {
        self.commit(|t| {
            t.put_alert(alert.clone());
            true
        })
        .await?;
        Ok(())
    }

    async fn get_alert(&self, id: &AlertId) -> Result<Option<PriceAlert>> {
        Ok(self.tables.lock().await.alert(id))
    }

    async fn load_active_alerts(&self) -> Result<Vec<PriceAlert>> {
        Ok(self.tables.lock().await.active_alerts())
    }

    async fn update_alert_status(&self, id: &AlertId, result: AlertExecution) -> Result<bool> {
        self.commit(|t| t.close_alert(id, result)).await
    }
}
