//! Alert trigger engine.
//!
//! One feed consumer per watched key. Ticks are evaluated by a single worker,
//! in arrival order, against every active alert of that exact key in creation
//! order. A fired alert is closed compare-and-set on `is_active`, so it
//! triggers at most once even across racing ticks.

use std::sync::{Arc, Mutex, MutexGuard, Weak};

use ahash::{AHashMap, AHashSet};
use sentinel_core::error::{EngineError, Result};
use sentinel_core::types::{
    AlertExecution, AlertId, AlertOutcome, AlertSpec, FeedKey, PriceAlert, PriceTick, WalletType,
};
use sentinel_feed::ConsumerId;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::context::EngineContext;
use crate::event::ExecEvent;
use crate::signal::{FeedSignal, SignalRx, SignalTx, forwarder};
use crate::{TradeOptions, TradeRequest};

#[derive(Default)]
struct State {
    stopped: bool,
    /// Active alerts per key, in creation order.
    alerts: AHashMap<FeedKey, Vec<PriceAlert>>,
    watches: AHashMap<FeedKey, ConsumerId>,
    /// Alerts whose trigger is running right now.
    busy: AHashSet<AlertId>,
}

struct Inner {
    ctx: EngineContext,
    state: Mutex<State>,
    signals: SignalTx,
    shutdown: watch::Sender<bool>,
}

/// Watches active price alerts and runs their optional auto-trade.
#[derive(Clone)]
pub struct AlertEngine {
    inner: Arc<Inner>,
}

/// How far one trigger attempt got.
enum Attempt {
    Closed(AlertOutcome),
    Deferred(String),
}

impl AlertEngine {
    /// Spawns the tick worker; must be called inside a tokio runtime.
    pub fn new(ctx: EngineContext) -> Self {
        let (signals, signal_rx) = mpsc::unbounded_channel();
        let (shutdown, shutdown_rx) = watch::channel(false);
        let inner = Arc::new(Inner { ctx, state: Mutex::new(State::default()), signals, shutdown });
        tokio::spawn(run_ticks(Arc::downgrade(&inner), signal_rx, shutdown_rx));
        Self { inner }
    }

    /// Validate and persist an active alert, then watch its key.
    pub async fn create_alert(&self, spec: AlertSpec) -> Result<PriceAlert> {
        spec.validate()?;
        let alert = spec.into_alert();
        self.inner.ctx.store.save_alert(&alert).await?;
        info!(
            "[alerts] alert {} created: {} {:?} {} on {}",
            alert.id,
            alert.token_address,
            alert.condition,
            alert.target_price,
            alert.network
        );
        self.inner.track(alert.clone());
        Ok(alert)
    }

    /// Deactivate an alert without firing it. `Ok(false)` when it is already
    /// inactive or its trigger is running.
    pub async fn cancel_alert(&self, id: &AlertId) -> Result<bool> {
        let inner = &self.inner;
        let alert = inner
            .ctx
            .store
            .get_alert(id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("alert {id}")))?;
        if !alert.is_active {
            return Ok(false);
        }
        if !inner.claim(&alert.feed_key(), id) {
            info!("[alerts] alert {id} is triggering, cancel not honored");
            return Ok(false);
        }
        let closed = inner
            .ctx
            .store
            .update_alert_status(id, AlertExecution::new(AlertOutcome::Cancelled))
            .await?;
        if closed {
            info!("[alerts] alert {id} cancelled");
        }
        Ok(closed)
    }

    /// Reload active alerts and watch their keys. Returns how many were
    /// newly tracked.
    pub async fn restore(&self) -> Result<usize> {
        let active = self.inner.ctx.store.load_active_alerts().await?;
        let restored = active.into_iter().filter(|a| self.inner.track(a.clone())).count();
        info!("[alerts] restored {restored} active alerts");
        Ok(restored)
    }

    /// Tracked alerts ordered by creation time.
    pub fn active_alerts(&self) -> Vec<PriceAlert> {
        let mut out: Vec<PriceAlert> = self.inner.state().alerts.values().flatten().cloned().collect();
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        out
    }

    pub fn stop(&self) {
        let inner = &self.inner;
        let watches: Vec<(FeedKey, ConsumerId)> = {
            let mut st = inner.state();
            if st.stopped {
                return;
            }
            st.stopped = true;
            st.alerts.clear();
            st.watches.drain().collect()
        };
        for (key, consumer) in watches {
            inner.ctx.feeds.unsubscribe(&key.network, &key.token_address, consumer);
        }
        let _ = inner.shutdown.send(true);
        info!("[alerts] stopped");
    }
}

async fn run_ticks(inner: Weak<Inner>, mut signals: SignalRx, mut shutdown: watch::Receiver<bool>) {
    loop {
        let signal = tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            signal = signals.recv() => match signal {
                Some(signal) => signal,
                None => break,
            },
        };
        let Some(inner) = inner.upgrade() else { break };
        match signal {
            FeedSignal::Tick(tick) => inner.on_tick(&tick).await,
            FeedSignal::Terminated(key, reason) => inner.on_feed_terminated(key, reason),
        }
    }
    debug!("[alerts] tick worker stopped");
}

impl Inner {
    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Returns false when already tracked or stopped.
    fn track(&self, alert: PriceAlert) -> bool {
        let key = alert.feed_key();
        let mut st = self.state();
        if st.stopped {
            return false;
        }
        let list = st.alerts.entry(key.clone()).or_default();
        if list.iter().any(|a| a.id == alert.id) {
            return false;
        }
        list.push(alert);
        if !st.watches.contains_key(&key) {
            let consumer = self.ctx.feeds.subscribe(
                &key.network,
                &key.token_address,
                forwarder(key.clone(), self.signals.clone()),
            );
            st.watches.insert(key, consumer);
        }
        true
    }

    /// Stop tracking unless a trigger for it is running.
    fn claim(&self, key: &FeedKey, id: &AlertId) -> bool {
        let consumer = {
            let mut st = self.state();
            if st.busy.contains(id) {
                return false;
            }
            forget(&mut st, key, id)
        };
        self.release_watch(key, consumer);
        true
    }

    fn untrack(&self, key: &FeedKey, id: &AlertId) {
        let consumer = forget(&mut self.state(), key, id);
        self.release_watch(key, consumer);
    }

    fn release_watch(&self, key: &FeedKey, consumer: Option<ConsumerId>) {
        if let Some(consumer) = consumer {
            debug!("[alerts] no active alerts left on {key}, unsubscribing");
            self.ctx.feeds.unsubscribe(&key.network, &key.token_address, consumer);
        }
    }

    async fn on_tick(&self, tick: &PriceTick) {
        let hits: Vec<PriceAlert> = {
            let mut st = self.state();
            let hits: Vec<PriceAlert> = match st.alerts.get(&tick.key) {
                Some(list) => list
                    .iter()
                    .filter(|a| a.condition.is_met(tick.price, a.target_price) && !st.busy.contains(&a.id))
                    .cloned()
                    .collect(),
                None => return,
            };
            for alert in &hits {
                st.busy.insert(alert.id.clone());
            }
            hits
        };

        for alert in hits {
            info!(
                "[alerts] alert {} condition met: {} {:?} {}",
                alert.id, tick.price, alert.condition, alert.target_price
            );
            match self.attempt(&alert, tick.price).await {
                Attempt::Closed(outcome) => self.close(&alert, tick.price, outcome).await,
                Attempt::Deferred(reason) => {
                    warn!("[alerts] alert {} deferred: {reason}", alert.id);
                    self.state().busy.remove(&alert.id);
                    self.ctx.emit(ExecEvent::AlertDeferred { alert_id: alert.id.clone(), reason });
                }
            }
        }
    }

    /// Run the alert's swap, if any, up to a terminal outcome or a deferral.
    async fn attempt(&self, alert: &PriceAlert, price: f64) -> Attempt {
        let Some(swap) = alert.enabled_swap() else {
            return Attempt::Closed(AlertOutcome::Notified { price });
        };

        // Balance is read first so an approval covers the actual trade size.
        let amount = if swap.amount.needs_balance() {
            match self.ctx.balance(&alert.network, &alert.token_address, &swap.wallet_address).await {
                Ok(balance) => swap.amount.resolve(balance),
                Err(e) => return Attempt::Deferred(format!("balance unavailable: {e}")),
            }
        } else {
            swap.amount.resolve(0.0)
        };
        if !amount.is_finite() || amount <= 0.0 {
            return Attempt::Closed(AlertOutcome::Failed {
                price,
                error: format!("resolved amount {amount} is not positive ({})", swap.amount),
            });
        }

        if alert.wallet_type == WalletType::External && !alert.pre_approved {
            match self.ctx.request_approval(&alert.token_address, &swap.wallet_address, amount).await {
                Ok(true) => debug!("[alerts] alert {} approval granted", alert.id),
                Ok(false) => return Attempt::Deferred("approval not granted".to_string()),
                Err(e) => return Attempt::Deferred(format!("approval request failed: {e}")),
            }
        }

        let request = TradeRequest {
            network: alert.network.clone(),
            action: swap.action,
            token_address: alert.token_address.clone(),
            amount,
            wallet_address: swap.wallet_address.clone(),
            options: TradeOptions { expected_price: Some(price), client_ref: Some(alert.id.to_string()) },
        };
        match self.ctx.submit_trade(&request).await {
            Ok(settlement) => Attempt::Closed(AlertOutcome::Settled { price, amount, settlement }),
            Err(e) if e.unavailable_dependency().is_some() => Attempt::Deferred(format!("trade not submitted: {e}")),
            Err(e) => Attempt::Closed(AlertOutcome::Failed { price, error: e.to_string() }),
        }
    }

    async fn close(&self, alert: &PriceAlert, price: f64, outcome: AlertOutcome) {
        match self.ctx.store.update_alert_status(&alert.id, AlertExecution::new(outcome.clone())).await {
            Ok(true) => {
                info!("[alerts] alert {} fired at {price}: {outcome:?}", alert.id);
                self.ctx.emit(ExecEvent::AlertTriggered { alert_id: alert.id.clone(), price, outcome });
            }
            Ok(false) => debug!("[alerts] alert {} was already inactive", alert.id),
            Err(e) => error!("[alerts] failed to record alert {} outcome {outcome:?}: {e}", alert.id),
        }
        // Dropped from memory either way so it cannot fire twice in this process.
        self.untrack(&alert.feed_key(), &alert.id);
    }

    /// Active alerts outlive their feed: the key is watched again once the
    /// resubscribe cooldown has passed.
    fn on_feed_terminated(self: &Arc<Self>, key: FeedKey, reason: String) {
        let still_active = {
            let mut st = self.state();
            st.watches.remove(&key);
            st.alerts.get(&key).is_some_and(|l| !l.is_empty()) && !st.stopped
        };
        if !still_active {
            return;
        }
        let cooldown = self.ctx.feeds.config().resubscribe_cooldown;
        warn!("[alerts] feed {key} terminated ({reason}), resubscribing in {cooldown:?}");
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            tokio::time::sleep(cooldown).await;
            if let Some(inner) = weak.upgrade() {
                inner.rewatch(&key);
            }
        });
    }

    /// Watch `key` again if alerts remain on it and nothing watches it yet.
    fn rewatch(&self, key: &FeedKey) {
        let mut st = self.state();
        if st.stopped || st.watches.contains_key(key) || !st.alerts.get(key).is_some_and(|l| !l.is_empty()) {
            return;
        }
        let consumer = self.ctx.feeds.subscribe(
            &key.network,
            &key.token_address,
            forwarder(key.clone(), self.signals.clone()),
        );
        st.watches.insert(key.clone(), consumer);
        info!("[alerts] resubscribed to {key}");
    }
}

/// Drop an alert from memory. Returns the key's consumer once no alert is
/// left on it.
fn forget(st: &mut State, key: &FeedKey, id: &AlertId) -> Option<ConsumerId> {
    st.busy.remove(id);
    if let Some(list) = st.alerts.get_mut(key) {
        list.retain(|a| &a.id != id);
        if !list.is_empty() {
            return None;
        }
    }
    st.alerts.remove(key);
    st.watches.remove(key)
}
