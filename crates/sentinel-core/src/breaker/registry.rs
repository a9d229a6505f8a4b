//! Named breakers, one per external dependency.

use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use ahash::AHashMap;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use super::circuit::{BreakerConfig, BreakerSnapshot, BreakerTransition, CircuitBreaker};
use crate::error::BreakerError;
use crate::health::{HealthEvent, HealthSink};
use crate::types::BreakerState;

/// Dependency names used by the engine.
pub const PRICE_QUOTE: &str = "price-quote";
pub const BROKER: &str = "broker";
pub const WALLET: &str = "wallet";

/// Lazily creates breakers and reports their transitions to a health sink.
pub struct BreakerRegistry {
    defaults: BreakerConfig,
    overrides: AHashMap<String, BreakerConfig>,
    breakers: Mutex<AHashMap<String, Arc<CircuitBreaker>>>,
    sink: Arc<dyn HealthSink>,
    reporter: Mutex<Option<JoinHandle<()>>>,
}

impl BreakerRegistry {
    pub fn new(defaults: BreakerConfig, sink: Arc<dyn HealthSink>) -> Self {
        Self {
            defaults,
            overrides: AHashMap::new(),
            breakers: Mutex::new(AHashMap::new()),
            sink,
            reporter: Mutex::new(None),
        }
    }

    /// Per-dependency configs applied when that breaker is first created.
    pub fn with_overrides(mut self, overrides: impl IntoIterator<Item = (String, BreakerConfig)>) -> Self {
        self.overrides.extend(overrides);
        self
    }

    /// Run `action` through the breaker for `name`, creating it if needed.
    pub async fn run<T, F, Fut>(&self, name: &str, action: F) -> Result<T, BreakerError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        self.breaker(name).execute(action).await
    }

    /// Get-or-create. Creation uses the override for `name` or the defaults.
    pub fn breaker(&self, name: &str) -> Arc<CircuitBreaker> {
        let config = self.overrides.get(name).unwrap_or(&self.defaults).clone();
        self.get_or_insert(name, config)
    }

    /// Create with an explicit config. If a breaker already exists under
    /// `name`, it is returned unchanged: the first registration wins.
    pub fn register(&self, name: &str, config: BreakerConfig) -> Arc<CircuitBreaker> {
        self.get_or_insert(name, config)
    }

    /// Snapshots of every breaker, sorted by name.
    pub fn status(&self) -> Vec<BreakerSnapshot> {
        let breakers: Vec<Arc<CircuitBreaker>> = self.lock().values().cloned().collect();
        let mut out: Vec<BreakerSnapshot> = breakers.iter().map(|b| b.snapshot()).collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }

    /// Remaining cooldown of an open breaker, see [`CircuitBreaker::retry_after`].
    pub fn retry_after(&self, name: &str) -> Option<Duration> {
        let breaker = self.lock().get(name).cloned();
        breaker.and_then(|b| b.retry_after())
    }

    /// Force a breaker closed. Returns false when no such breaker exists.
    pub fn reset(&self, name: &str) -> bool {
        let breaker = self.lock().get(name).cloned();
        match breaker {
            Some(b) => {
                b.reset();
                true
            }
            None => false,
        }
    }

    /// Start publishing [`HealthEvent::BreakerStatus`] every `interval`.
    pub fn start(self: &Arc<Self>, interval: Duration) {
        let mut reporter = self.reporter.lock().unwrap_or_else(|e| e.into_inner());
        if reporter.is_some() {
            return;
        }

        let registry = Arc::downgrade(self);
        *reporter = Some(tokio::spawn(async move {
            let mut tick = tokio::time::interval(interval);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            tick.tick().await;
            loop {
                tick.tick().await;
                let Some(registry) = registry.upgrade() else { break };
                let snapshots = registry.status();
                if !snapshots.is_empty() {
                    registry.sink.publish(HealthEvent::BreakerStatus(snapshots));
                }
            }
        }));
        info!("[breakers] status reporter started, interval={:?}", interval);
    }

    /// Stop the status reporter. Breakers themselves stay usable.
    pub fn stop(&self) {
        let handle = self.reporter.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(handle) = handle {
            handle.abort();
            info!("[breakers] status reporter stopped");
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, AHashMap<String, Arc<CircuitBreaker>>> {
        self.breakers.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn get_or_insert(&self, name: &str, config: BreakerConfig) -> Arc<CircuitBreaker> {
        let mut breakers = self.lock();
        if let Some(existing) = breakers.get(name) {
            return Arc::clone(existing);
        }

        let breaker = Arc::new(CircuitBreaker::new(name, config));
        let sink = Arc::clone(&self.sink);
        breaker.on_transition(Arc::new(move |t: &BreakerTransition| sink.publish(health_event(t))));
        breakers.insert(name.to_string(), Arc::clone(&breaker));
        debug!("[breakers] created '{}' with {:?}", name, breaker.config());
        breaker
    }
}

impl Drop for BreakerRegistry {
    fn drop(&mut self) {
        self.stop();
    }
}

fn health_event(t: &BreakerTransition) -> HealthEvent {
    match t.to {
        BreakerState::Open => HealthEvent::DependencyUnhealthy {
            dependency: t.name.clone(),
            consecutive_failures: t.failure_count,
            last_error: t.last_error.clone(),
        },
        BreakerState::Closed => HealthEvent::DependencyRecovered { dependency: t.name.clone() },
        BreakerState::HalfOpen => HealthEvent::DependencyProbing { dependency: t.name.clone() },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::health::ChannelHealthSink;

    fn registry() -> (Arc<BreakerRegistry>, tokio::sync::mpsc::UnboundedReceiver<HealthEvent>) {
        let (sink, rx) = ChannelHealthSink::new();
        let defaults = BreakerConfig { failure_threshold: 2, ..Default::default() };
        (Arc::new(BreakerRegistry::new(defaults, Arc::new(sink))), rx)
    }

    #[tokio::test]
    async fn breaker_is_shared_per_name() {
        let (reg, _rx) = registry();
        let a = reg.breaker(BROKER);
        let b = reg.breaker(BROKER);
        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &reg.breaker(WALLET)));
    }

    #[tokio::test]
    async fn first_registration_wins() {
        let (reg, _rx) = registry();
        reg.register(BROKER, BreakerConfig { failure_threshold: 9, ..Default::default() });
        let again = reg.register(BROKER, BreakerConfig { failure_threshold: 1, ..Default::default() });
        assert_eq!(again.config().failure_threshold, 9);
    }

    #[tokio::test]
    async fn overrides_apply_on_creation() {
        let (sink, _rx) = ChannelHealthSink::new();
        let reg = BreakerRegistry::new(BreakerConfig::default(), Arc::new(sink)).with_overrides([(
            WALLET.to_string(),
            BreakerConfig { max_queue_size: 3, ..Default::default() },
        )]);
        assert_eq!(reg.breaker(WALLET).config().max_queue_size, 3);
        assert_eq!(reg.breaker(BROKER).config().max_queue_size, 100);
    }

    #[tokio::test]
    async fn open_publishes_unhealthy() {
        let (reg, mut rx) = registry();
        for _ in 0..2 {
            let _ = reg.run(BROKER, || async { Err::<(), _>(anyhow::anyhow!("timeout")) }).await;
        }
        match rx.recv().await.unwrap() {
            HealthEvent::DependencyUnhealthy { dependency, consecutive_failures, last_error } => {
                assert_eq!(dependency, BROKER);
                assert_eq!(consecutive_failures, 2);
                assert_eq!(last_error.as_deref(), Some("timeout"));
            }
            other => panic!("unexpected event {other:?}"),
        }

        assert!(reg.reset(BROKER));
        assert!(matches!(rx.recv().await.unwrap(), HealthEvent::DependencyRecovered { .. }));
        assert!(!reg.reset("unknown"));
    }

    #[tokio::test(start_paused = true)]
    async fn status_reporter_publishes_periodically() {
        let (reg, mut rx) = registry();
        let _ = reg.run(PRICE_QUOTE, || async { Ok(1.0) }).await;
        reg.start(Duration::from_secs(10));

        tokio::time::sleep(Duration::from_secs(11)).await;
        match rx.recv().await.unwrap() {
            HealthEvent::BreakerStatus(snaps) => {
                assert_eq!(snaps.len(), 1);
                assert_eq!(snaps[0].name, PRICE_QUOTE);
                assert_eq!(snaps[0].metrics.successful_calls, 1);
            }
            other => panic!("unexpected event {other:?}"),
        }
        reg.stop();
    }
}
