//! One live connection per feed key, shared by every interested consumer.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use ahash::AHashMap;
use sentinel_core::config::FeedConfig;
use sentinel_core::error::{EngineError, Result};
use sentinel_core::health::HealthSink;
use sentinel_core::types::{FeedKey, PriceTick};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::batch::Delivery;
use crate::connection::{ConnectionCtx, ConsumerId, FeedCallback, KeyState, OutboundTx, connection_loop};
use crate::transport::FeedTransport;

/// Per-key view for health and debugging.
#[derive(Debug, Clone, PartialEq)]
pub struct FeedStatus {
    pub key: FeedKey,
    pub consumers: usize,
    pub connected: bool,
    /// Reconnect attempts since the last successful connect.
    pub reconnect_attempts: u32,
    pub last_price: Option<f64>,
}

struct Entry {
    state: Arc<KeyState>,
    outbound: OutboundTx,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

struct Shared {
    config: FeedConfig,
    transport: Arc<dyn FeedTransport>,
    health: Arc<dyn HealthSink>,
    table: Mutex<AHashMap<FeedKey, Entry>>,
    next_id: AtomicU64,
}

impl Shared {
    fn table(&self) -> MutexGuard<'_, AHashMap<FeedKey, Entry>> {
        self.table.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Multiplexes consumers onto per-key feed connections.
#[derive(Clone)]
pub struct PriceFeedSupervisor {
    shared: Arc<Shared>,
}

impl PriceFeedSupervisor {
    pub fn new(config: FeedConfig, transport: Arc<dyn FeedTransport>, health: Arc<dyn HealthSink>) -> Self {
        Self {
            shared: Arc::new(Shared {
                config,
                transport,
                health,
                table: Mutex::new(AHashMap::new()),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Register `callback` for the key, opening its connection if needed.
    ///
    /// Must be called inside a tokio runtime.
    pub fn subscribe(&self, network: &str, token_address: &str, callback: FeedCallback) -> ConsumerId {
        let key = FeedKey::new(network, token_address);
        let id = ConsumerId(self.shared.next_id.fetch_add(1, Ordering::Relaxed));

        let mut table = self.shared.table();
        if let Some(entry) = table.get(&key) {
            entry.state.add_consumer(id, callback);
            debug!("[feed {key}] consumer {} added ({} total)", id.0, entry.state.consumer_count());
            return id;
        }

        let generation = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        let state = Arc::new(KeyState::new(key.clone(), generation));
        state.add_consumer(id, callback);

        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let (shutdown, shutdown_rx) = watch::channel(false);
        let ctx = ConnectionCtx {
            config: self.shared.config.clone(),
            transport: Arc::clone(&self.shared.transport),
            health: Arc::clone(&self.shared.health),
            state: Arc::clone(&state),
            teardown: teardown_hook(Arc::downgrade(&self.shared), key.clone(), generation),
        };
        let task = tokio::spawn(connection_loop(ctx, outbound_rx, shutdown_rx));

        info!("[feed {key}] opened with consumer {}", id.0);
        table.insert(key, Entry { state, outbound, shutdown, task });
        id
    }

    /// Remove one consumer. The connection closes when the last one leaves.
    /// Returns false when the consumer was not registered on that key.
    pub fn unsubscribe(&self, network: &str, token_address: &str, id: ConsumerId) -> bool {
        let key = FeedKey::new(network, token_address);
        let mut table = self.shared.table();
        let Some(entry) = table.get(&key) else { return false };

        match entry.state.remove_consumer(id) {
            None => false,
            Some(0) => {
                if let Some(entry) = table.remove(&key) {
                    let _ = entry.shutdown.send(true);
                    info!("[feed {key}] last consumer left, closing");
                }
                true
            }
            Some(left) => {
                debug!("[feed {key}] consumer {} removed ({left} left)", id.0);
                true
            }
        }
    }

    /// Send a message on the key's connection. Messages queued while the
    /// connection is down go out after the next successful connect.
    pub fn send(&self, network: &str, token_address: &str, payload: String, delivery: Delivery) -> Result<()> {
        let key = FeedKey::new(network, token_address);
        let table = self.shared.table();
        let entry = table.get(&key).ok_or_else(|| EngineError::NotFound(format!("no feed subscription for {key}")))?;
        entry
            .outbound
            .send((payload, delivery))
            .map_err(|_| EngineError::NotFound(format!("feed {key} is shutting down")))
    }

    /// Most recent tick seen on a live key.
    pub fn config(&self) -> &FeedConfig {
        &self.shared.config
    }

    pub fn last_price(&self, key: &FeedKey) -> Option<PriceTick> {
        self.shared.table().get(key).and_then(|e| e.state.last_tick())
    }

    pub fn is_subscribed(&self, key: &FeedKey) -> bool {
        self.shared.table().contains_key(key)
    }

    pub fn status(&self) -> Vec<FeedStatus> {
        let mut out: Vec<FeedStatus> = self
            .shared
            .table()
            .values()
            .map(|e| FeedStatus {
                key: e.state.key.clone(),
                consumers: e.state.consumer_count(),
                connected: e.state.is_connected(),
                reconnect_attempts: e.state.attempts(),
                last_price: e.state.last_tick().map(|t| t.price),
            })
            .collect();
        out.sort_by(|a, b| a.key.cmp(&b.key));
        out
    }

    /// Close every connection and wait for the tasks to finish.
    pub async fn stop(&self) {
        let entries: Vec<Entry> = self.shared.table().drain().map(|(_, e)| e).collect();
        info!("[feed] stopping {} connections", entries.len());
        for entry in &entries {
            let _ = entry.shutdown.send(true);
        }
        for entry in entries {
            let _ = entry.task.await;
        }
    }
}

fn teardown_hook(shared: Weak<Shared>, key: FeedKey, generation: u64) -> Box<dyn FnOnce() + Send> {
    Box::new(move || {
        let Some(shared) = shared.upgrade() else { return };
        let mut table = shared.table();
        if table.get(&key).is_some_and(|e| e.state.generation == generation) {
            table.remove(&key);
        }
    })
}
