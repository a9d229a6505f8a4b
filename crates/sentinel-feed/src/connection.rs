//! Per-key connection task: connect, subscribe, read, ping, reconnect.
//!
//! Each task:
//! 1. Connects through the [`FeedTransport`].
//! 2. Sends the subscribe frame for its key.
//! 3. Dispatches inbound ticks to every consumer of the key.
//! 4. Pings on an interval and drops the session if no pong arrives in time.
//! 5. Reconnects with jittered exponential backoff until the attempt budget
//!    runs out, then tears the key down and tells its consumers.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use sentinel_core::config::FeedConfig;
use sentinel_core::health::{HealthEvent, HealthSink};
use sentinel_core::types::{FeedKey, PriceTick};
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::batch::{Batcher, Delivery};
use crate::heartbeat::HeartbeatState;
use crate::json_parser::{Inbound, parse_inbound, subscribe_frame, unsubscribe_frame};
use crate::reconnect::ReconnectPolicy;
use crate::transport::{FeedReaderBox, FeedTransport, FeedWriterBox, Frame};

/// Identifies one registered consumer of a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConsumerId(pub u64);

/// What consumers receive.
#[derive(Debug, Clone, PartialEq)]
pub enum FeedEvent {
    Price(PriceTick),
    /// The key was torn down; no further events follow. Resubscribe to resume.
    Terminated(String),
}

/// Consumer callback. Runs on the connection task; must not block.
pub type FeedCallback = Arc<dyn Fn(&FeedEvent) + Send + Sync>;

/// State of one key shared between the supervisor and its connection task.
pub(crate) struct KeyState {
    pub key: FeedKey,
    pub generation: u64,
    consumers: Mutex<Vec<(ConsumerId, FeedCallback)>>,
    last_tick: Mutex<Option<PriceTick>>,
    connected: AtomicBool,
    attempts: AtomicU32,
}

impl KeyState {
    pub fn new(key: FeedKey, generation: u64) -> Self {
        Self {
            key,
            generation,
            consumers: Mutex::new(Vec::new()),
            last_tick: Mutex::new(None),
            connected: AtomicBool::new(false),
            attempts: AtomicU32::new(0),
        }
    }

    pub fn add_consumer(&self, id: ConsumerId, callback: FeedCallback) {
        self.consumers.lock().unwrap_or_else(|e| e.into_inner()).push((id, callback));
    }

    /// Returns the number of consumers left, or `None` if `id` was unknown.
    pub fn remove_consumer(&self, id: ConsumerId) -> Option<usize> {
        let mut consumers = self.consumers.lock().unwrap_or_else(|e| e.into_inner());
        let pos = consumers.iter().position(|(c, _)| *c == id)?;
        consumers.remove(pos);
        Some(consumers.len())
    }

    pub fn consumer_count(&self) -> usize {
        self.consumers.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn last_tick(&self) -> Option<PriceTick> {
        self.last_tick.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::Acquire)
    }

    fn deliver(&self, tick: PriceTick) {
        *self.last_tick.lock().unwrap_or_else(|e| e.into_inner()) = Some(tick.clone());
        self.dispatch(&FeedEvent::Price(tick));
    }

    /// Call every consumer in registration order, outside the consumer lock.
    fn dispatch(&self, event: &FeedEvent) {
        let consumers: Vec<FeedCallback> = self
            .consumers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(_, cb)| Arc::clone(cb))
            .collect();
        for cb in consumers {
            cb(event);
        }
    }
}

/// Everything a connection task needs besides its channels.
pub(crate) struct ConnectionCtx {
    pub config: FeedConfig,
    pub transport: Arc<dyn FeedTransport>,
    pub health: Arc<dyn HealthSink>,
    pub state: Arc<KeyState>,
    /// Removes the key from the supervisor table (if still ours).
    pub teardown: Box<dyn FnOnce() + Send>,
}

pub(crate) type OutboundTx = mpsc::UnboundedSender<(String, Delivery)>;
pub(crate) type OutboundRx = mpsc::UnboundedReceiver<(String, Delivery)>;

enum SessionEnd {
    Shutdown,
    Lost(String),
}

/// Main connection loop.
pub(crate) async fn connection_loop(ctx: ConnectionCtx, mut outbound_rx: OutboundRx, mut shutdown_rx: watch::Receiver<bool>) {
    let ConnectionCtx { config, transport, health, state, teardown } = ctx;
    let key = state.key.clone();
    let mut policy = ReconnectPolicy::new((&config).into());
    let mut batcher = Batcher::new(config.batch_window, config.batch_max);
    let mut dropped_once = false;

    loop {
        if *shutdown_rx.borrow() {
            info!("[feed {key}] shutdown requested");
            return;
        }

        debug!("[feed {key}] connecting (attempt {})", policy.attempt_count());
        let connected = tokio::select! {
            res = transport.connect(&key) => res,
            _ = shutdown_rx.changed() => return,
        };

        let reason = match connected {
            Ok((writer, reader)) => {
                policy.reset();
                state.attempts.store(0, Ordering::Release);
                state.connected.store(true, Ordering::Release);
                info!("[feed {key}] connected");
                if dropped_once {
                    health.publish(HealthEvent::FeedRecovered { key: key.to_string() });
                }

                let end = session(&key, &config, &state, writer, reader, &mut batcher, &mut outbound_rx, &mut shutdown_rx).await;
                state.connected.store(false, Ordering::Release);
                match end {
                    SessionEnd::Shutdown => return,
                    SessionEnd::Lost(reason) => reason,
                }
            }
            Err(e) => format!("connect failed: {e:#}"),
        };
        dropped_once = true;

        let Some(delay) = policy.next_delay() else {
            let attempts = policy.attempt_count();
            error!("[feed {key}] unreachable after {attempts} reconnect attempts ({reason}), tearing down");
            health.publish(HealthEvent::FeedUnreachable { key: key.to_string(), attempts });
            teardown();
            let err = sentinel_core::error::EngineError::FeedUnreachable { key: key.to_string(), attempts };
            state.dispatch(&FeedEvent::Terminated(err.to_string()));
            return;
        };

        let attempt = policy.attempt_count();
        state.attempts.store(attempt, Ordering::Release);
        warn!("[feed {key}] {reason}, reconnect attempt {attempt} in {delay:?}");
        health.publish(HealthEvent::FeedDisconnected { key: key.to_string(), attempt, reason });

        tokio::select! {
            _ = tokio::time::sleep(delay) => {},
            _ = shutdown_rx.changed() => return,
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn session(
    key: &FeedKey,
    config: &FeedConfig,
    state: &KeyState,
    mut writer: FeedWriterBox,
    mut reader: FeedReaderBox,
    batcher: &mut Batcher,
    outbound_rx: &mut OutboundRx,
    shutdown_rx: &mut watch::Receiver<bool>,
) -> SessionEnd {
    debug!("[feed {key}] subscribing");
    if let Err(e) = writer.send_text(subscribe_frame(key)).await {
        return SessionEnd::Lost(format!("subscribe send failed: {e:#}"));
    }

    let mut heartbeat = HeartbeatState::new(config.heartbeat_timeout);
    let mut ping = tokio::time::interval_at(Instant::now() + config.heartbeat_interval, config.heartbeat_interval);
    ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        let pong_deadline = heartbeat.deadline();
        let batch_deadline = batcher.deadline();

        tokio::select! {
            _ = shutdown_rx.changed() => {
                info!("[feed {key}] closing: no consumers left");
                if let Some(batch) = batcher.take() {
                    let _ = writer.send_text(batch).await;
                }
                let _ = writer.send_text(unsubscribe_frame(key)).await;
                let _ = writer.close().await;
                return SessionEnd::Shutdown;
            }

            frame = reader.next_frame() => {
                match frame {
                    Some(Ok(Frame::Text(text))) => match parse_inbound(&text, key) {
                        Inbound::Price(tick) => state.deliver(tick),
                        Inbound::Pong => heartbeat.record_pong(),
                        Inbound::Ignored => debug!("[feed {key}] ignored frame: {text}"),
                    },
                    Some(Ok(Frame::Ping(payload))) => {
                        if let Err(e) = writer.send_pong(payload).await {
                            return SessionEnd::Lost(format!("pong send failed: {e:#}"));
                        }
                    }
                    Some(Ok(Frame::Pong)) => heartbeat.record_pong(),
                    Some(Ok(Frame::Close(reason))) => {
                        return SessionEnd::Lost(format!("closed by server: {}", reason.as_deref().unwrap_or("-")));
                    }
                    Some(Err(e)) => return SessionEnd::Lost(format!("read error: {e:#}")),
                    None => return SessionEnd::Lost("stream ended".to_string()),
                }
            }

            Some((payload, delivery)) = outbound_rx.recv() => {
                let mut out = Vec::with_capacity(2);
                match delivery {
                    Delivery::Immediate => {
                        // Keep ordering: anything already batched goes first.
                        out.extend(batcher.take());
                        out.push(payload);
                    }
                    Delivery::Batched => out.extend(batcher.push(payload)),
                }
                for msg in out {
                    if let Err(e) = writer.send_text(msg).await {
                        return SessionEnd::Lost(format!("send failed: {e:#}"));
                    }
                }
            }

            _ = sleep_until(batch_deadline) => {
                if let Some(batch) = batcher.take() {
                    if let Err(e) = writer.send_text(batch).await {
                        return SessionEnd::Lost(format!("batch send failed: {e:#}"));
                    }
                }
            }

            _ = ping.tick() => {
                if let Err(e) = writer.send_ping().await {
                    return SessionEnd::Lost(format!("ping send failed: {e:#}"));
                }
                heartbeat.mark_ping_sent();
            }

            _ = sleep_until(pong_deadline) => {
                let _ = writer.close().await;
                return SessionEnd::Lost(format!("heartbeat timeout: no pong within {:?}", config.heartbeat_timeout));
            }
        }
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(d) => tokio::time::sleep_until(d).await,
        None => std::future::pending::<()>().await,
    }
}
