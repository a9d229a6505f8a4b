//! Per-dependency circuit breaker.
//!
//! State machine:
//!
//! ```text
//! CLOSED ──(failure_threshold consecutive failures)──► OPEN
//! OPEN ──(reset_timeout elapsed, next call arrives)──► HALF_OPEN
//! HALF_OPEN ──(any success)──► CLOSED
//! HALF_OPEN ──(half_open_max_retries failures)──► OPEN
//! ```
//!
//! While half-open, calls keep flowing (not just a single trial call) until
//! either a success closes the circuit or the retry limit reopens it.

use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::error::BreakerError;
use crate::types::BreakerState;

/// Tunables for one breaker.
#[derive(Debug, Clone, PartialEq)]
pub struct BreakerConfig {
    /// Consecutive failures that open a closed circuit.
    pub failure_threshold: u32,
    /// How long an open circuit rejects calls before probing.
    pub reset_timeout: Duration,
    /// Failures tolerated while half-open before reopening.
    pub half_open_max_retries: u32,
    /// Calls allowed in flight at once; further calls get `QueueFull`.
    pub max_queue_size: usize,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout: Duration::from_secs(30),
            half_open_max_retries: 3,
            max_queue_size: 100,
        }
    }
}

/// Call counters for health reporting.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BreakerMetrics {
    pub total_calls: u64,
    pub successful_calls: u64,
    pub failed_calls: u64,
    /// Calls refused without invoking the action.
    pub rejected_calls: u64,
    pub last_error: Option<String>,
    pub last_error_at: Option<DateTime<Utc>>,
    pub last_success_at: Option<DateTime<Utc>>,
}

/// Point-in-time view of a breaker.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BreakerSnapshot {
    pub name: String,
    pub state: BreakerState,
    pub failure_count: u32,
    pub half_open_retries: u32,
    pub pending_calls: usize,
    pub metrics: BreakerMetrics,
}

/// Emitted on every state change.
#[derive(Debug, Clone, PartialEq)]
pub struct BreakerTransition {
    pub name: String,
    pub from: BreakerState,
    pub to: BreakerState,
    pub failure_count: u32,
    pub last_error: Option<String>,
    pub at: DateTime<Utc>,
}

/// Callback invoked for each transition, in registration order.
pub type TransitionObserver = Arc<dyn Fn(&BreakerTransition) + Send + Sync>;

struct Inner {
    state: BreakerState,
    failure_count: u32,
    half_open_retries: u32,
    last_failure: Option<Instant>,
    pending: usize,
    metrics: BreakerMetrics,
}

/// Wraps calls to one unreliable dependency.
pub struct CircuitBreaker {
    name: String,
    config: BreakerConfig,
    inner: Mutex<Inner>,
    observers: RwLock<Vec<TransitionObserver>>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: BreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(Inner {
                state: BreakerState::Closed,
                failure_count: 0,
                half_open_retries: 0,
                last_failure: None,
                pending: 0,
                metrics: BreakerMetrics::default(),
            }),
            observers: RwLock::new(Vec::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &BreakerConfig {
        &self.config
    }

    /// Register a transition observer.
    pub fn on_transition(&self, observer: TransitionObserver) {
        self.observers.write().unwrap_or_else(|e| e.into_inner()).push(observer);
    }

    /// Run `action` through the breaker.
    ///
    /// Returns [`BreakerError::Open`] or [`BreakerError::QueueFull`] without
    /// invoking `action` when the call is refused; otherwise the action's own
    /// error is passed through unchanged as [`BreakerError::Failed`].
    pub async fn execute<T, F, Fut>(&self, action: F) -> Result<T, BreakerError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        let _slot = self.admit()?;

        match action().await {
            Ok(value) => {
                self.record_success();
                Ok(value)
            }
            Err(e) => {
                self.record_failure(&e);
                Err(BreakerError::Failed(e))
            }
        }
    }

    /// Current state (does not trigger the open → half-open transition).
    pub fn state(&self) -> BreakerState {
        self.lock().state
    }

    /// Time left before an open breaker admits a trial call. `None` unless
    /// the breaker is open.
    pub fn retry_after(&self) -> Option<Duration> {
        let inner = self.lock();
        if inner.state != BreakerState::Open {
            return None;
        }
        let elapsed = inner.last_failure.map_or(self.config.reset_timeout, |t| t.elapsed());
        Some(self.config.reset_timeout.saturating_sub(elapsed))
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let inner = self.lock();
        BreakerSnapshot {
            name: self.name.clone(),
            state: inner.state,
            failure_count: inner.failure_count,
            half_open_retries: inner.half_open_retries,
            pending_calls: inner.pending,
            metrics: inner.metrics.clone(),
        }
    }

    /// Force the breaker closed (manual recovery).
    pub fn reset(&self) {
        let transition = {
            let mut inner = self.lock();
            inner.failure_count = 0;
            inner.half_open_retries = 0;
            inner.last_failure = None;
            self.set_state(&mut inner, BreakerState::Closed)
        };
        info!("[breaker {}] manual reset", self.name);
        self.notify(transition);
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Admission control: open check, queue bound, then half-open trial.
    fn admit(&self) -> Result<Slot<'_>, BreakerError> {
        let transition = {
            let mut inner = self.lock();

            if inner.state == BreakerState::Open {
                let cooled_down = inner
                    .last_failure
                    .is_none_or(|t| t.elapsed() >= self.config.reset_timeout);
                if !cooled_down {
                    inner.metrics.rejected_calls += 1;
                    debug!("[breaker {}] rejected: circuit open", self.name);
                    return Err(BreakerError::Open(self.name.clone()));
                }
            }

            if inner.pending >= self.config.max_queue_size {
                inner.metrics.rejected_calls += 1;
                warn!("[breaker {}] rejected: {} calls pending", self.name, inner.pending);
                return Err(BreakerError::QueueFull(self.name.clone()));
            }

            let transition = if inner.state == BreakerState::Open {
                inner.half_open_retries = 0;
                self.set_state(&mut inner, BreakerState::HalfOpen)
            } else {
                None
            };

            inner.pending += 1;
            inner.metrics.total_calls += 1;
            transition
        };

        self.notify(transition);
        Ok(Slot { breaker: self })
    }

    fn record_success(&self) {
        let transition = {
            let mut inner = self.lock();
            inner.metrics.successful_calls += 1;
            inner.metrics.last_success_at = Some(Utc::now());
            inner.failure_count = 0;
            inner.half_open_retries = 0;
            if inner.state == BreakerState::HalfOpen {
                self.set_state(&mut inner, BreakerState::Closed)
            } else {
                None
            }
        };
        self.notify(transition);
    }

    fn record_failure(&self, err: &anyhow::Error) {
        let transition = {
            let mut inner = self.lock();
            inner.failure_count += 1;
            inner.last_failure = Some(Instant::now());
            inner.metrics.failed_calls += 1;
            inner.metrics.last_error = Some(format!("{err:#}"));
            inner.metrics.last_error_at = Some(Utc::now());

            match inner.state {
                BreakerState::HalfOpen => {
                    inner.half_open_retries += 1;
                    if inner.half_open_retries >= self.config.half_open_max_retries {
                        self.set_state(&mut inner, BreakerState::Open)
                    } else {
                        None
                    }
                }
                BreakerState::Closed if inner.failure_count >= self.config.failure_threshold => {
                    self.set_state(&mut inner, BreakerState::Open)
                }
                _ => None,
            }
        };
        self.notify(transition);
    }

    /// Apply a state change under the lock and describe it for observers.
    fn set_state(&self, inner: &mut Inner, to: BreakerState) -> Option<BreakerTransition> {
        let from = inner.state;
        if from == to {
            return None;
        }
        inner.state = to;
        if to == BreakerState::Closed {
            inner.failure_count = 0;
        }
        Some(BreakerTransition {
            name: self.name.clone(),
            from,
            to,
            failure_count: inner.failure_count,
            last_error: inner.metrics.last_error.clone(),
            at: Utc::now(),
        })
    }

    /// Deliver a transition to observers outside the state lock.
    fn notify(&self, transition: Option<BreakerTransition>) {
        let Some(t) = transition else { return };

        match t.to {
            BreakerState::Open => error!(
                "[breaker {}] opened after {} failures (last error: {})",
                self.name,
                t.failure_count,
                t.last_error.as_deref().unwrap_or("-")
            ),
            BreakerState::HalfOpen => info!("[breaker {}] half-open, probing", self.name),
            BreakerState::Closed => info!("[breaker {}] closed", self.name),
        }

        let observers = self.observers.read().unwrap_or_else(|e| e.into_inner()).clone();
        for observer in observers {
            observer(&t);
        }
    }
}

/// Occupies one pending-call slot until dropped (also on cancellation).
struct Slot<'a> {
    breaker: &'a CircuitBreaker,
}

impl Drop for Slot<'_> {
    fn drop(&mut self) {
        let mut inner = self.breaker.lock();
        inner.pending = inner.pending.saturating_sub(1);
    }
}
