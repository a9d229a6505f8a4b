//! Health events consumed by the external alerting sink.
//!
//! Breakers and feed connections report here. Publishing is fire-and-forget:
//! a sink never blocks the caller and never returns an error.

use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::breaker::BreakerSnapshot;

/// A health notification.
#[derive(Debug, Clone)]
pub enum HealthEvent {
    /// A dependency's breaker opened.
    DependencyUnhealthy {
        dependency: String,
        consecutive_failures: u32,
        last_error: Option<String>,
    },
    /// A dependency's breaker closed again.
    DependencyRecovered { dependency: String },
    /// A dependency's breaker went half-open and admits trial calls.
    DependencyProbing { dependency: String },
    /// Periodic snapshot of every breaker.
    BreakerStatus(Vec<BreakerSnapshot>),
    /// A feed connection dropped and is reconnecting.
    FeedDisconnected { key: String, attempt: u32, reason: String },
    /// A feed connection is delivering again after a drop.
    FeedRecovered { key: String },
    /// Reconnect budget exhausted; the key was torn down.
    FeedUnreachable { key: String, attempts: u32 },
}

/// Receiver of health events.
pub trait HealthSink: Send + Sync {
    fn publish(&self, event: HealthEvent);
}

/// Writes every event to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogHealthSink;

impl HealthSink for LogHealthSink {
    fn publish(&self, event: HealthEvent) {
        match event {
            HealthEvent::DependencyUnhealthy { dependency, consecutive_failures, last_error } => {
                error!(
                    dependency = %dependency,
                    failures = consecutive_failures,
                    last_error = last_error.as_deref().unwrap_or("-"),
                    "[health] dependency unhealthy"
                );
            }
            HealthEvent::DependencyRecovered { dependency } => {
                info!(dependency = %dependency, "[health] dependency recovered");
            }
            HealthEvent::DependencyProbing { dependency } => {
                info!(dependency = %dependency, "[health] probing dependency");
            }
            HealthEvent::BreakerStatus(snapshots) => {
                for s in snapshots {
                    info!(
                        dependency = %s.name,
                        state = %s.state,
                        failures = s.failure_count,
                        calls = s.metrics.total_calls,
                        "[health] breaker status"
                    );
                }
            }
            HealthEvent::FeedDisconnected { key, attempt, reason } => {
                warn!(key = %key, attempt, reason = %reason, "[health] feed disconnected");
            }
            HealthEvent::FeedRecovered { key } => {
                info!(key = %key, "[health] feed recovered");
            }
            HealthEvent::FeedUnreachable { key, attempts } => {
                error!(key = %key, attempts, "[health] feed unreachable");
            }
        }
    }
}

/// Forwards events into an unbounded channel.
#[derive(Debug, Clone)]
pub struct ChannelHealthSink {
    tx: mpsc::UnboundedSender<HealthEvent>,
}

impl ChannelHealthSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<HealthEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl HealthSink for ChannelHealthSink {
    fn publish(&self, event: HealthEvent) {
        // A dropped receiver just means nobody is listening anymore.
        let _ = self.tx.send(event);
    }
}
