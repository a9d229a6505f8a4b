//! Order scheduler.
//!
//! Lifecycle of an order inside the scheduler:
//! 1. `create_order` validates the `OrderSpec`, persists the order as `Pending` and
//!    puts it in the coalescing group of its `execute_at` window.
//! 2. When the group timer fires, every order of the group is released in
//!    creation order under one pass id and dispatch timestamp.
//! 3. Standard orders and chains execute in the single execution lane. Limit,
//!    stop, trailing and conditional orders are *armed*: checked once against
//!    the freshest price, then on every tick of their feed key until they fire.
//! 4. Execution resolves a price, submits through the `broker` breaker with
//!    bounded linear-backoff retry and closes the order compare-and-set on
//!    `Pending`, so an order is never executed twice.
//!
//! Everything here is in memory. After a restart `restore` rebuilds it from
//! the pending orders in the store.

mod executor;
mod groups;
mod lane;
mod triggers;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use ahash::AHashMap;
use chrono::{DateTime, Utc};
use sentinel_core::config::SchedulerConfig;
use sentinel_core::error::{EngineError, Result};
use sentinel_core::types::{
    ExecutionOutcome, ExecutionResult, FeedKey, KindSpec, Order, OrderId, OrderKind, OrderSpec, OrderStatus, PriceTick,
};
use sentinel_feed::ConsumerId;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::context::EngineContext;
use crate::event::ExecEvent;
use crate::signal::{SignalTx, forwarder};
use executor::Execution;
use groups::Groups;
use lane::{Job, JobTx};
use triggers::ArmedOrder;

/// Where a tracked order currently sits.
#[derive(Debug, Clone, PartialEq)]
enum Phase {
    Grouped(i64),
    /// Released to the lane, not started yet.
    Queued,
    Armed(FeedKey),
    InFlight,
}

#[derive(Default)]
struct State {
    stopped: bool,
    next_pass: u64,
    groups: Groups,
    phases: AHashMap<OrderId, Phase>,
    /// Armed orders per key, in arming order.
    armed: AHashMap<FeedKey, Vec<ArmedOrder>>,
    watches: AHashMap<FeedKey, ConsumerId>,
}

pub(crate) struct Inner {
    ctx: EngineContext,
    config: SchedulerConfig,
    state: Mutex<State>,
    jobs: JobTx,
    signals: SignalTx,
    shutdown: watch::Sender<bool>,
}

/// Schedules, arms and executes orders. Cheap to clone.
#[derive(Clone)]
pub struct OrderScheduler {
    inner: Arc<Inner>,
}

impl OrderScheduler {
    /// Spawns the execution lane and tick worker; must be called inside a
    /// tokio runtime.
    pub fn new(ctx: EngineContext, config: SchedulerConfig) -> Self {
        let (jobs, job_rx) = mpsc::unbounded_channel();
        let (signals, signal_rx) = mpsc::unbounded_channel();
        let (shutdown, shutdown_rx) = watch::channel(false);
        let inner = Arc::new(Inner { ctx, config, state: Mutex::new(State::default()), jobs, signals, shutdown });
        tokio::spawn(lane::run_lane(Arc::downgrade(&inner), job_rx, shutdown_rx.clone()));
        tokio::spawn(lane::run_ticks(Arc::downgrade(&inner), signal_rx, shutdown_rx));
        Self { inner }
    }

    /// Validate, persist and schedule a new order.
    ///
    /// Scaled orders persist their limit-order children and return the
    /// parent already closed as delegated. Chained orders persist one
    /// `ChainStep` order per step ahead of the parent.
    pub async fn create_order(&self, spec: OrderSpec) -> Result<Order> {
        spec.validate()?;
        let OrderSpec { user_id, wallet_address, network, token_address, action, amount, execute_at, kind } = spec;
        let now = Utc::now();
        let mut order = Order {
            id: OrderId::generate(),
            user_id,
            wallet_address,
            network,
            token_address,
            action,
            amount,
            kind: OrderKind::Standard,
            status: OrderStatus::Pending,
            execute_at: execute_at.unwrap_or(now),
            created_at: now,
            parent_id: None,
            execution_result: None,
        };

        let inner = &self.inner;
        order.kind = match kind {
            KindSpec::Standard => OrderKind::Standard,
            KindSpec::Limit { limit_price } => OrderKind::Limit { limit_price },
            KindSpec::Stop { stop_price } => OrderKind::Stop { stop_price },
            KindSpec::Trailing { trail_percent } => {
                OrderKind::Trailing { trail_percent, extreme_price: None, stop_price: None }
            }
            KindSpec::Conditional { condition } => OrderKind::Conditional { condition },
            KindSpec::Scaled { levels, base_price, price_step } => {
                order.kind = OrderKind::Scaled {
                    levels,
                    base_price,
                    price_step,
                    amount_per_level: order.amount / f64::from(levels),
                };
                inner.ctx.store.save_order(&order).await?;
                info!("[scheduler] scaled order {} created with {levels} levels", order.id);
                inner.finish_scaled(&mut order).await?;
                return Ok(order);
            }
            KindSpec::Chained { steps } => {
                let mut ids = Vec::with_capacity(steps.len());
                for (position, step) in steps.into_iter().enumerate() {
                    let step_order = Order {
                        id: OrderId::generate(),
                        token_address: step.token_address,
                        action: step.action,
                        amount: step.amount,
                        kind: OrderKind::ChainStep {
                            parent: order.id.clone(),
                            position: u32::try_from(position).unwrap_or(u32::MAX),
                        },
                        parent_id: Some(order.id.clone()),
                        ..order.clone()
                    };
                    inner.ctx.store.save_order(&step_order).await?;
                    ids.push(step_order.id);
                }
                OrderKind::Chained { steps: ids }
            }
        };

        inner.ctx.store.save_order(&order).await?;
        info!(
            "[scheduler] {} order {} created: {} {} {} on {} at {}",
            order.kind.name(),
            order.id,
            order.action,
            order.amount,
            order.token_address,
            order.network,
            order.execute_at
        );
        inner.schedule(&order);
        Ok(order)
    }

    /// Cancel a pending order. Returns `Ok(false)` when the order is already
    /// closed or currently executing; in-flight submissions are not
    /// interrupted.
    pub async fn cancel_order(&self, id: &OrderId) -> Result<bool> {
        let inner = &self.inner;
        let order = inner
            .ctx
            .store
            .get_order(id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("order {id}")))?;
        if !order.is_pending() {
            return Ok(false);
        }
        if !inner.claim(&order) {
            info!("[scheduler] order {id} is executing, cancel not honored");
            return Ok(false);
        }
        let closed = inner
            .ctx
            .store
            .update_order_status(id, OrderStatus::Cancelled, ExecutionResult::skipped("cancelled by user"))
            .await?;
        if !closed {
            return Ok(false);
        }
        if let OrderKind::Chained { steps } = &order.kind {
            inner.skip_steps(steps, "chain cancelled").await;
        }
        info!("[scheduler] order {id} cancelled");
        inner.emit(ExecEvent::OrderCancelled { order_id: id.clone() });
        Ok(true)
    }

    /// Stop scheduling the order and remove its record (and its chain steps).
    /// Returns false when the order does not exist or is executing.
    pub async fn delete_order(&self, id: &OrderId) -> Result<bool> {
        let inner = &self.inner;
        let Some(order) = inner.ctx.store.get_order(id).await? else {
            return Ok(false);
        };
        if !inner.claim(&order) {
            return Ok(false);
        }
        if let OrderKind::Chained { steps } = &order.kind {
            for step in steps {
                inner.ctx.store.delete_order(step).await?;
            }
        }
        let deleted = inner.ctx.store.delete_order(id).await?;
        if deleted {
            info!("[scheduler] order {id} deleted");
        }
        Ok(deleted)
    }

    /// Reschedule every pending order from the store. Orders the scheduler
    /// already tracks are skipped; chain steps are left to their parent.
    /// Returns how many orders were newly scheduled.
    pub async fn restore(&self) -> Result<usize> {
        let inner = &self.inner;
        let pending = inner.ctx.store.load_pending_orders().await?;
        let mut scheduled = 0;
        for order in &pending {
            match &order.kind {
                OrderKind::ChainStep { .. } => {}
                OrderKind::Scaled { .. } => {
                    let mut parent = order.clone();
                    scheduled += inner.finish_scaled(&mut parent).await?;
                }
                _ => {
                    if inner.schedule(order) {
                        scheduled += 1;
                    }
                }
            }
        }
        info!("[scheduler] restored {scheduled} of {} pending orders", pending.len());
        Ok(scheduled)
    }

    pub async fn get_order(&self, id: &OrderId) -> Result<Option<Order>> {
        self.inner.ctx.store.get_order(id).await
    }

    /// Orders waiting in a group, armed on a feed or queued for the lane.
    pub fn scheduled_count(&self) -> usize {
        self.inner.state().phases.values().filter(|p| **p != Phase::InFlight).count()
    }

    /// Drop every timer and feed watch and stop the workers. A submission
    /// already running finishes; nothing new starts.
    pub fn stop(&self) {
        let inner = &self.inner;
        let watches: Vec<(FeedKey, ConsumerId)> = {
            let mut st = inner.state();
            if st.stopped {
                return;
            }
            st.stopped = true;
            st.groups.clear();
            st.armed.clear();
            st.phases.retain(|_, p| *p == Phase::InFlight);
            st.watches.drain().collect()
        };
        for (key, consumer) in watches {
            inner.ctx.feeds.unsubscribe(&key.network, &key.token_address, consumer);
        }
        let _ = inner.shutdown.send(true);
        info!("[scheduler] stopped");
    }
}

impl Inner {
    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn emit(&self, event: ExecEvent) {
        self.ctx.emit(event);
    }

    /// Put `order` into the group of its `execute_at` window. Returns false
    /// when the order is already tracked or the scheduler is stopped.
    fn schedule(self: &Arc<Self>, order: &Order) -> bool {
        let now = Utc::now();
        let window = groups::window_ms(self.config.coalesce_window);
        let bucket = groups::bucket_of(order.execute_at, now, window);
        {
            let mut st = self.state();
            if st.stopped || st.phases.contains_key(&order.id) {
                return false;
            }
            st.phases.insert(order.id.clone(), Phase::Grouped(bucket));
            if st.groups.insert(bucket, order.id.clone()) {
                let delay = groups::delay_until(bucket, window, now);
                let weak = Arc::downgrade(self);
                let timer = tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    if let Some(inner) = weak.upgrade() {
                        inner.fire_group(bucket);
                    }
                });
                st.groups.set_timer(bucket, timer);
            }
        }
        debug!("[scheduler] order {} grouped in bucket {bucket}", order.id);
        self.emit(ExecEvent::OrderScheduled { order_id: order.id.clone(), execute_at: order.execute_at });
        true
    }

    /// Release every order of a group to the lane as one pass.
    fn fire_group(&self, bucket: i64) {
        let (pass, dispatched_at, ids) = {
            let mut st = self.state();
            if st.stopped {
                return;
            }
            let ids = st.groups.take(bucket);
            if ids.is_empty() {
                return;
            }
            st.next_pass += 1;
            for id in &ids {
                st.phases.insert(id.clone(), Phase::Queued);
            }
            (st.next_pass, Utc::now(), ids)
        };
        debug!("[scheduler] pass {pass}: releasing {} orders", ids.len());
        for id in ids {
            self.emit(ExecEvent::OrderDispatched { order_id: id.clone(), pass, dispatched_at });
            let _ = self.jobs.send(Job::Due { id, pass, dispatched_at });
        }
    }

    async fn run_job(self: &Arc<Self>, job: Job) {
        match job {
            Job::Due { id, pass, dispatched_at } => self.on_due(id, pass, dispatched_at).await,
            Job::Fire { id, tick, pass, dispatched_at } => {
                if !self.begin(&id) {
                    return;
                }
                if let Some(order) = self.load_open(&id).await {
                    if let Execution::Postponed(delay) = self.execute(&order, Some(&tick), Some(dispatched_at)).await {
                        self.requeue(id, pass, dispatched_at, delay);
                    }
                }
            }
        }
    }

    async fn on_due(self: &Arc<Self>, id: OrderId, pass: u64, dispatched_at: DateTime<Utc>) {
        if self.state().phases.get(&id) != Some(&Phase::Queued) {
            return;
        }
        let Some(order) = self.load_open(&id).await else { return };
        match &order.kind {
            kind if kind.is_price_triggered() => self.arm(order, pass, dispatched_at).await,
            OrderKind::Chained { .. } => self.run_chain(&order, pass, dispatched_at).await,
            OrderKind::Standard => {
                if !self.begin(&id) {
                    return;
                }
                if let Execution::Postponed(delay) = self.execute(&order, None, Some(dispatched_at)).await {
                    self.requeue(id, pass, dispatched_at, delay);
                }
            }
            other => {
                debug!("[scheduler] order {id} of kind {} is not run on its own", other.name());
                self.untrack(&id);
            }
        }
    }

    /// Send a postponed order back to the lane as due once `delay` is over.
    /// Price-triggered orders are armed again rather than fired on the old
    /// tick. Cancelling in the meantime drops the job.
    fn requeue(self: &Arc<Self>, id: OrderId, pass: u64, dispatched_at: DateTime<Utc>, delay: Duration) {
        {
            let mut st = self.state();
            if st.stopped {
                return;
            }
            match st.phases.get_mut(&id) {
                Some(phase) => *phase = Phase::Queued,
                None => return,
            }
        }
        debug!("[scheduler] order {id} back in the lane in {delay:?}");
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let Some(inner) = weak.upgrade() else { return };
            let queued = {
                let st = inner.state();
                !st.stopped && st.phases.get(&id) == Some(&Phase::Queued)
            };
            if queued {
                let _ = inner.jobs.send(Job::Due { id, pass, dispatched_at });
            }
        });
    }

    /// The order if it is still pending; otherwise it is dropped from tracking.
    async fn load_open(&self, id: &OrderId) -> Option<Order> {
        match self.ctx.store.get_order(id).await {
            Ok(Some(order)) if order.is_pending() => Some(order),
            Ok(_) => {
                debug!("[scheduler] order {id} no longer pending, skipping");
                self.untrack(id);
                None
            }
            Err(e) => {
                error!("[scheduler] failed to load order {id}: {e}");
                self.untrack(id);
                None
            }
        }
    }

    /// Check a due price-triggered order once, then watch its feed.
    async fn arm(self: &Arc<Self>, order: Order, pass: u64, dispatched_at: DateTime<Utc>) {
        let Some(mut armed) = ArmedOrder::from_order(&order, pass, dispatched_at) else { return };

        match self.ctx.freshest_tick(&armed.key).await {
            Ok(tick) => {
                let statuses = self.statuses(&armed.referenced_orders()).await;
                let check = armed.check(&tick, &statuses);
                if let Some((extreme, stop)) = check.moved {
                    self.persist_trailing(&armed.id, extreme, stop).await;
                }
                if check.fire {
                    if !self.begin(&order.id) {
                        return;
                    }
                    if let Execution::Postponed(delay) = self.execute(&order, Some(&tick), Some(dispatched_at)).await {
                        self.requeue(order.id, pass, dispatched_at, delay);
                    }
                    return;
                }
            }
            Err(e) => debug!("[scheduler] no price for {} yet, waiting on feed: {e}", armed.key),
        }

        let key = armed.key.clone();
        {
            let mut st = self.state();
            if st.stopped || st.phases.get(&order.id) != Some(&Phase::Queued) {
                return;
            }
            st.phases.insert(order.id.clone(), Phase::Armed(key.clone()));
            st.armed.entry(key.clone()).or_default().push(armed);
        }
        self.watch(&key);
        info!("[scheduler] {} order {} armed on {key}", order.kind.name(), order.id);
        self.emit(ExecEvent::OrderArmed { order_id: order.id });
    }

    async fn on_tick(&self, tick: PriceTick) {
        let refs: Vec<OrderId> = match self.state().armed.get(&tick.key) {
            Some(list) if !list.is_empty() => list.iter().flat_map(ArmedOrder::referenced_orders).collect(),
            _ => return,
        };
        let statuses = self.statuses(&refs).await;

        let mut moved = Vec::new();
        let mut fired = Vec::new();
        {
            let mut guard = self.state();
            let st = &mut *guard;
            if let Some(list) = st.armed.get_mut(&tick.key) {
                list.retain_mut(|armed| {
                    let check = armed.check(&tick, &statuses);
                    if let Some(m) = check.moved {
                        moved.push((armed.id.clone(), m));
                    }
                    if check.fire {
                        fired.push(armed.clone());
                    }
                    !check.fire
                });
            }
            for armed in &fired {
                st.phases.insert(armed.id.clone(), Phase::Queued);
            }
        }

        for (id, (extreme, stop)) in moved {
            self.persist_trailing(&id, extreme, stop).await;
        }
        for armed in fired {
            info!("[scheduler] order {} triggered at {} on {}", armed.id, tick.price, tick.key);
            let _ = self.jobs.send(Job::Fire {
                id: armed.id,
                tick: tick.clone(),
                pass: armed.pass,
                dispatched_at: armed.dispatched_at,
            });
        }
        self.unwatch_if_idle(&tick.key);
    }

    /// The supervisor dropped `key`. Armed orders stay armed and the key is
    /// watched again, with a fresh reconnect budget, after the feed's
    /// resubscribe cooldown.
    fn on_feed_terminated(self: &Arc<Self>, key: FeedKey, reason: String) {
        let still_armed = {
            let mut st = self.state();
            st.watches.remove(&key);
            !st.stopped && st.armed.get(&key).is_some_and(|l| !l.is_empty())
        };
        if !still_armed {
            return;
        }
        let cooldown = self.ctx.feeds.config().resubscribe_cooldown;
        warn!("[scheduler] feed {key} terminated ({reason}), resubscribing for armed orders in {cooldown:?}");
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            tokio::time::sleep(cooldown).await;
            let Some(inner) = weak.upgrade() else { return };
            if inner.state().armed.get(&key).is_some_and(|l| !l.is_empty()) {
                inner.watch(&key);
            }
        });
    }

    fn watch(&self, key: &FeedKey) {
        let mut st = self.state();
        if st.stopped || st.watches.contains_key(key) {
            return;
        }
        let consumer = self.ctx.feeds.subscribe(
            &key.network,
            &key.token_address,
            forwarder(key.clone(), self.signals.clone()),
        );
        st.watches.insert(key.clone(), consumer);
    }

    fn unwatch_if_idle(&self, key: &FeedKey) {
        let consumer = {
            let mut st = self.state();
            if st.armed.get(key).is_some_and(|l| !l.is_empty()) {
                return;
            }
            st.armed.remove(key);
            st.watches.remove(key)
        };
        if let Some(consumer) = consumer {
            debug!("[scheduler] no armed orders left on {key}, unsubscribing");
            self.ctx.feeds.unsubscribe(&key.network, &key.token_address, consumer);
        }
    }

    async fn statuses(&self, refs: &[OrderId]) -> HashMap<OrderId, OrderStatus> {
        if refs.is_empty() {
            return HashMap::new();
        }
        self.ctx.store.order_statuses(refs).await.unwrap_or_else(|e| {
            warn!("[scheduler] failed to read dependency statuses: {e}");
            HashMap::new()
        })
    }

    async fn persist_trailing(&self, id: &OrderId, extreme_price: f64, stop_price: f64) {
        if let Err(e) = self.ctx.store.update_trailing_stop(id, extreme_price, stop_price).await {
            warn!("[scheduler] failed to persist trailing stop of {id}: {e}");
        }
        debug!("[scheduler] order {id} trailing stop now {stop_price} (extreme {extreme_price})");
        self.emit(ExecEvent::TrailingStopMoved { order_id: id.clone(), extreme_price, stop_price });
    }

    /// Mark a tracked order as executing. False when it was cancelled or the
    /// scheduler stopped in the meantime.
    fn begin(&self, id: &OrderId) -> bool {
        let mut st = self.state();
        if st.stopped {
            return false;
        }
        match st.phases.get_mut(id) {
            Some(phase) => {
                *phase = Phase::InFlight;
                true
            }
            None => false,
        }
    }

    /// Chain steps are not tracked until their parent runs them.
    fn begin_step(&self, id: &OrderId) -> bool {
        let mut st = self.state();
        if st.stopped {
            return false;
        }
        st.phases.insert(id.clone(), Phase::InFlight);
        true
    }

    /// Take an order away from the scheduler for cancel or delete. Fails
    /// while the order, or the chain it belongs to, is executing.
    fn claim(&self, order: &Order) -> bool {
        let key = {
            let mut st = self.state();
            if st.phases.get(&order.id) == Some(&Phase::InFlight) {
                return false;
            }
            if let OrderKind::ChainStep { parent, .. } = &order.kind {
                if st.phases.get(parent) == Some(&Phase::InFlight) {
                    return false;
                }
            }
            release(&mut st, &order.id)
        };
        if let Some(key) = key {
            self.unwatch_if_idle(&key);
        }
        true
    }

    fn untrack(&self, id: &OrderId) {
        let key = release(&mut self.state(), id);
        if let Some(key) = key {
            self.unwatch_if_idle(&key);
        }
    }

    /// Close pending steps without running them.
    async fn skip_steps(&self, steps: &[OrderId], reason: &str) {
        for step in steps {
            match self.ctx.store.update_order_status(step, OrderStatus::Cancelled, ExecutionResult::skipped(reason)).await {
                Ok(true) => self.emit(ExecEvent::OrderCancelled { order_id: step.clone() }),
                Ok(false) => {}
                Err(e) => error!("[scheduler] failed to skip chain step {step}: {e}"),
            }
        }
    }

    /// Persist any missing ladder children, schedule them and close the
    /// parent as delegated. Returns how many children were scheduled.
    async fn finish_scaled(self: &Arc<Self>, parent: &mut Order) -> Result<usize> {
        let &OrderKind::Scaled { levels, base_price, price_step, amount_per_level } = &parent.kind else {
            return Ok(0);
        };

        let existing = self.ctx.store.load_children(&parent.id).await?;
        let mut children: Vec<OrderId> = existing.iter().map(|c| c.id.clone()).collect();
        let mut scheduled = 0;
        let first_missing = u32::try_from(existing.len()).unwrap_or(levels);
        for level in first_missing..levels {
            let child = Order {
                id: OrderId::generate(),
                amount: amount_per_level,
                kind: OrderKind::Limit { limit_price: base_price + f64::from(level) * price_step },
                status: OrderStatus::Pending,
                created_at: Utc::now(),
                parent_id: Some(parent.id.clone()),
                execution_result: None,
                ..parent.clone()
            };
            self.ctx.store.save_order(&child).await?;
            if self.schedule(&child) {
                scheduled += 1;
            }
            children.push(child.id);
        }

        let result = ExecutionResult::new(ExecutionOutcome::Delegated { children: children.clone() }, 0, None);
        if self.ctx.store.update_order_status(&parent.id, OrderStatus::Executed, result.clone()).await? {
            parent.status = OrderStatus::Executed;
            parent.execution_result = Some(result);
            info!("[scheduler] scaled order {} delegated to {} limit orders", parent.id, children.len());
            self.emit(ExecEvent::OrderDelegated { order_id: parent.id.clone(), children });
        }
        Ok(scheduled)
    }
}

/// Drop an order's tracking. Returns the key it was armed on, if any.
fn release(st: &mut State, id: &OrderId) -> Option<FeedKey> {
    match st.phases.remove(id) {
        Some(Phase::Grouped(bucket)) => {
            st.groups.remove_order(bucket, id);
            None
        }
        Some(Phase::Armed(key)) => {
            if let Some(list) = st.armed.get_mut(&key) {
                list.retain(|a| &a.id != id);
            }
            Some(key)
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use sentinel_core::breaker::BROKER;
    use sentinel_core::store::{MemoryStore, Store};
    use sentinel_core::types::{ChainStepSpec, Condition, Settlement, TradeAction};

    use super::*;
    use crate::testing::{Harness, standard_spec};

    fn aligned_future() -> DateTime<Utc> {
        let secs = Utc::now().timestamp() + 3_600;
        DateTime::from_timestamp(secs, 0).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn orders_in_one_window_share_a_pass() {
        let mut h = Harness::new();
        let t = aligned_future();
        let a = h.engine.scheduler.create_order(standard_spec().at(t + chrono::Duration::milliseconds(100))).await.unwrap();
        let b = h.engine.scheduler.create_order(standard_spec().at(t + chrono::Duration::milliseconds(600))).await.unwrap();
        let c = h.engine.scheduler.create_order(standard_spec().at(t + chrono::Duration::milliseconds(1_500))).await.unwrap();
        assert_eq!(h.engine.scheduler.scheduled_count(), 3);

        let mut passes = HashMap::new();
        let mut executed = 0;
        while executed < 3 {
            match h.next_event().await {
                ExecEvent::OrderDispatched { order_id, pass, dispatched_at } => {
                    passes.insert(order_id, (pass, dispatched_at));
                }
                ExecEvent::OrderExecuted { .. } => executed += 1,
                _ => {}
            }
        }
        assert_eq!(passes.len(), 3);
        assert_eq!(passes[&a.id], passes[&b.id]);
        assert_ne!(passes[&a.id].0, passes[&c.id].0);
        let stored = h.store.get_order(&a.id).await.unwrap().unwrap();
        assert_eq!(stored.status, OrderStatus::Executed);
        assert_eq!(stored.execution_result.unwrap().dispatched_at, Some(passes[&a.id].1));
        assert_eq!(h.broker.requests().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn restore_reschedules_exactly_the_pending_orders() {
        let store = Arc::new(MemoryStore::new());
        let later = Utc::now() + chrono::Duration::minutes(5);
        let mut before = Vec::new();
        {
            let h = Harness::with_store(Arc::clone(&store));
            for _ in 0..4 {
                before.push(h.engine.scheduler.create_order(standard_spec().at(later)).await.unwrap());
            }
            h.engine.stop().await;
        }

        let mut h = Harness::with_store(Arc::clone(&store));
        assert_eq!(h.engine.scheduler.restore().await.unwrap(), 4);
        assert_eq!(h.engine.scheduler.restore().await.unwrap(), 0);
        assert_eq!(h.engine.scheduler.scheduled_count(), 4);
        for order in &before {
            let stored = store.get_order(&order.id).await.unwrap().unwrap();
            assert_eq!(stored.execute_at, order.execute_at);
        }

        for _ in 0..4 {
            h.wait_for(|e| matches!(e, ExecEvent::OrderExecuted { .. })).await;
        }
        assert_eq!(h.broker.requests().len(), 4);
        assert!(store.load_pending_orders().await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn trailing_stop_follows_the_high_and_fires() {
        let mut h = Harness::new();
        h.quotes.set_price(1.0);
        let key = FeedKey::new("solana", "TokenA");
        let order = h
            .engine
            .scheduler
            .create_order(standard_spec().with_action(TradeAction::Sell).with_kind(KindSpec::Trailing { trail_percent: 10.0 }))
            .await
            .unwrap();

        match h.wait_for(|e| matches!(e, ExecEvent::TrailingStopMoved { .. })).await {
            ExecEvent::TrailingStopMoved { stop_price, .. } => assert!((stop_price - 0.9).abs() < 1e-9),
            _ => unreachable!(),
        }
        h.wait_for(|e| matches!(e, ExecEvent::OrderArmed { .. })).await;

        h.feed.push(&key, 1.2).await;
        match h.wait_for(|e| matches!(e, ExecEvent::TrailingStopMoved { .. })).await {
            ExecEvent::TrailingStopMoved { extreme_price, stop_price, .. } => {
                assert_eq!(extreme_price, 1.2);
                assert!((stop_price - 1.08).abs() < 1e-9);
            }
            _ => unreachable!(),
        }

        h.feed.push(&key, 1.1).await;
        h.feed.push(&key, 0.9).await;
        let event = h
            .wait_for(|e| matches!(e, ExecEvent::OrderExecuted { .. } | ExecEvent::TrailingStopMoved { .. }))
            .await;
        assert!(matches!(event, ExecEvent::OrderExecuted { .. }), "stop moved on a lower tick: {event:?}");

        let requests = h.broker.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].options.expected_price, Some(0.9));

        let stored = h.store.get_order(&order.id).await.unwrap().unwrap();
        assert_eq!(stored.status, OrderStatus::Executed);
        match stored.kind {
            OrderKind::Trailing { stop_price, .. } => assert!((stop_price.unwrap() - 1.08).abs() < 1e-9),
            other => panic!("unexpected kind {other:?}"),
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!h.engine.context().feeds.is_subscribed(&key));
    }

    #[tokio::test(start_paused = true)]
    async fn limit_buy_waits_for_price() {
        let mut h = Harness::new();
        h.quotes.set_price(1.0);
        let key = FeedKey::new("solana", "TokenA");
        h.engine
            .scheduler
            .create_order(standard_spec().with_kind(KindSpec::Limit { limit_price: 0.5 }))
            .await
            .unwrap();
        h.wait_for(|e| matches!(e, ExecEvent::OrderArmed { .. })).await;

        h.feed.push(&key, 0.6).await;
        h.feed.push(&key, 0.5).await;
        h.wait_for(|e| matches!(e, ExecEvent::OrderExecuted { .. })).await;

        let requests = h.broker.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].options.expected_price, Some(0.5));
    }

    #[tokio::test(start_paused = true)]
    async fn conditional_order_waits_for_dependency() {
        let mut h = Harness::new();
        h.quotes.set_price(3.0);
        let key = FeedKey::new("solana", "TokenA");
        let dep = h
            .engine
            .scheduler
            .create_order(standard_spec().at(Utc::now() + chrono::Duration::hours(1)))
            .await
            .unwrap();
        let condition = Condition::All {
            conditions: vec![
                Condition::PriceAbove { price: 2.0 },
                Condition::OrderStatusIs { order_id: dep.id.clone(), status: OrderStatus::Cancelled },
            ],
        };
        h.engine
            .scheduler
            .create_order(standard_spec().with_kind(KindSpec::Conditional { condition }))
            .await
            .unwrap();
        h.wait_for(|e| matches!(e, ExecEvent::OrderArmed { .. })).await;

        h.feed.push(&key, 2.5).await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(h.broker.requests().is_empty());

        assert!(h.engine.scheduler.cancel_order(&dep.id).await.unwrap());
        h.feed.push(&key, 2.6).await;
        h.wait_for(|e| matches!(e, ExecEvent::OrderExecuted { .. })).await;
        assert_eq!(h.broker.requests().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn scaled_order_spawns_limit_ladder() {
        let h = Harness::new();
        let parent = h
            .engine
            .scheduler
            .create_order(
                standard_spec()
                    .with_amount(9.0)
                    .at(Utc::now() + chrono::Duration::hours(1))
                    .with_kind(KindSpec::Scaled { levels: 3, base_price: 1.0, price_step: -0.1 }),
            )
            .await
            .unwrap();
        assert_eq!(parent.status, OrderStatus::Executed);

        let children = h.store.load_children(&parent.id).await.unwrap();
        assert_eq!(children.len(), 3);
        let prices: Vec<f64> = children
            .iter()
            .map(|c| match c.kind {
                OrderKind::Limit { limit_price } => limit_price,
                _ => panic!("child is not a limit order"),
            })
            .collect();
        for (got, want) in prices.iter().zip([1.0, 0.9, 0.8]) {
            assert!((got - want).abs() < 1e-9);
        }
        assert!(children.iter().all(|c| c.amount == 3.0 && c.is_pending()));
        match parent.execution_result.unwrap().outcome {
            ExecutionOutcome::Delegated { children: ids } => assert_eq!(ids.len(), 3),
            other => panic!("unexpected outcome {other:?}"),
        }
        assert_eq!(h.engine.scheduler.scheduled_count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn partly_spawned_ladder_is_completed_on_restore() {
        let store = Arc::new(MemoryStore::new());
        let now = Utc::now();
        let parent = Order {
            id: OrderId::generate(),
            user_id: "u1".into(),
            wallet_address: "wallet1".into(),
            network: "solana".into(),
            token_address: "TokenA".into(),
            action: TradeAction::Buy,
            amount: 9.0,
            kind: OrderKind::Scaled { levels: 3, base_price: 1.0, price_step: -0.1, amount_per_level: 3.0 },
            status: OrderStatus::Pending,
            execute_at: now + chrono::Duration::hours(1),
            created_at: now,
            parent_id: None,
            execution_result: None,
        };
        let first = Order {
            id: OrderId::generate(),
            amount: 3.0,
            kind: OrderKind::Limit { limit_price: 1.0 },
            parent_id: Some(parent.id.clone()),
            ..parent.clone()
        };
        store.save_order(&parent).await.unwrap();
        store.save_order(&first).await.unwrap();

        let h = Harness::with_store(Arc::clone(&store));
        assert_eq!(h.engine.scheduler.restore().await.unwrap(), 3);
        assert_eq!(h.engine.scheduler.scheduled_count(), 3);

        let children = store.load_children(&parent.id).await.unwrap();
        assert_eq!(children.len(), 3);
        assert_eq!(children[0].id, first.id);
        for (child, want) in children.iter().zip([1.0, 0.9, 0.8]) {
            match child.kind {
                OrderKind::Limit { limit_price } => assert!((limit_price - want).abs() < 1e-9),
                ref other => panic!("unexpected child kind {other:?}"),
            }
            assert!(child.is_pending());
        }

        let stored = store.get_order(&parent.id).await.unwrap().unwrap();
        assert_eq!(stored.status, OrderStatus::Executed);
        match stored.execution_result.unwrap().outcome {
            ExecutionOutcome::Delegated { children: ids } => {
                assert_eq!(ids, children.iter().map(|c| c.id.clone()).collect::<Vec<_>>());
            }
            other => panic!("unexpected outcome {other:?}"),
        }
        assert_eq!(h.engine.scheduler.restore().await.unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn restored_chain_skips_steps_already_executed() {
        let store = Arc::new(MemoryStore::new());
        let step = |token: &str| ChainStepSpec { token_address: token.into(), action: TradeAction::Buy, amount: 1.0 };
        let parent = {
            let h = Harness::with_store(Arc::clone(&store));
            let parent = h
                .engine
                .scheduler
                .create_order(
                    standard_spec()
                        .at(Utc::now() + chrono::Duration::hours(1))
                        .with_kind(KindSpec::Chained { steps: vec![step("TokenA"), step("TokenB"), step("TokenC")] }),
                )
                .await
                .unwrap();
            h.engine.stop().await;
            parent
        };

        // The process died right after the first step settled.
        let steps = store.load_children(&parent.id).await.unwrap();
        let settled = ExecutionResult::new(
            ExecutionOutcome::Settled(Settlement { tx_hash: "0xbefore".into(), price: 1.0, gas_cost: 0.0 }),
            1,
            None,
        );
        assert!(store.update_order_status(&steps[0].id, OrderStatus::Executed, settled.clone()).await.unwrap());

        let mut h = Harness::with_store(Arc::clone(&store));
        assert_eq!(h.engine.scheduler.restore().await.unwrap(), 1);
        h.wait_for(|e| matches!(e, ExecEvent::OrderDelegated { order_id, .. } if *order_id == parent.id)).await;

        let tokens: Vec<String> = h.broker.requests().into_iter().map(|r| r.token_address).collect();
        assert_eq!(tokens, vec!["TokenB", "TokenC"]);
        let steps = store.load_children(&parent.id).await.unwrap();
        assert!(steps.iter().all(|s| s.status == OrderStatus::Executed));
        assert_eq!(steps[0].execution_result.as_ref(), Some(&settled));
        assert_eq!(store.get_order(&parent.id).await.unwrap().unwrap().status, OrderStatus::Executed);
    }

    #[tokio::test(start_paused = true)]
    async fn armed_order_resubscribes_after_feed_termination() {
        let mut h = Harness::new();
        let key = FeedKey::new("solana", "TokenA");
        let order = h
            .engine
            .scheduler
            .create_order(standard_spec().with_kind(KindSpec::Limit { limit_price: 0.5 }))
            .await
            .unwrap();
        h.wait_for(|e| matches!(e, ExecEvent::OrderArmed { .. })).await;
        h.feed.push(&key, 0.9).await;

        h.feed.refuse_connects(true);
        h.feed.close_session(&key);
        h.wait_unreachable(&key).await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!h.engine.context().feeds.is_subscribed(&key));
        let refused = h.feed.connects();

        h.feed.refuse_connects(false);
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(h.feed.connects(), refused, "resubscribed before the cooldown");
        assert_eq!(h.engine.scheduler.scheduled_count(), 1);

        tokio::time::sleep(Duration::from_secs(31)).await;
        assert!(h.engine.context().feeds.is_subscribed(&key));
        h.feed.push(&key, 0.45).await;
        h.wait_for(|e| matches!(e, ExecEvent::OrderExecuted { .. })).await;
        let stored = h.store.get_order(&order.id).await.unwrap().unwrap();
        assert_eq!(stored.status, OrderStatus::Executed);
        assert_eq!(h.broker.requests()[0].options.expected_price, Some(0.45));
    }

    #[tokio::test(start_paused = true)]
    async fn failed_chain_step_skips_the_rest() {
        let mut h = Harness::new();
        h.broker.fail_token("TokenB");
        let step = |token: &str| ChainStepSpec { token_address: token.into(), action: TradeAction::Buy, amount: 1.0 };
        let parent = h
            .engine
            .scheduler
            .create_order(standard_spec().with_kind(KindSpec::Chained {
                steps: vec![step("TokenA"), step("TokenB"), step("TokenC")],
            }))
            .await
            .unwrap();

        h.wait_for(|e| matches!(e, ExecEvent::OrderFailed { order_id, .. } if *order_id == parent.id)).await;

        let tokens: Vec<String> = h.broker.requests().into_iter().map(|r| r.token_address).collect();
        assert_eq!(tokens, vec!["TokenA", "TokenB", "TokenB", "TokenB"]);

        let steps = h.store.load_children(&parent.id).await.unwrap();
        let statuses: Vec<OrderStatus> = steps.iter().map(|s| s.status).collect();
        assert_eq!(statuses, vec![OrderStatus::Executed, OrderStatus::Failed, OrderStatus::Cancelled]);
        assert_eq!(steps[1].execution_result.as_ref().unwrap().attempts, 3);
        assert!(matches!(
            steps[2].execution_result.as_ref().unwrap().outcome,
            ExecutionOutcome::Skipped { .. }
        ));
        let stored = h.store.get_order(&parent.id).await.unwrap().unwrap();
        assert_eq!(stored.status, OrderStatus::Failed);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_mark_the_order_failed() {
        let mut h = Harness::new();
        h.broker.fail_all(true);
        let order = h.engine.scheduler.create_order(standard_spec()).await.unwrap();
        h.wait_for(|e| matches!(e, ExecEvent::OrderFailed { .. })).await;

        let stored = h.store.get_order(&order.id).await.unwrap().unwrap();
        assert_eq!(stored.status, OrderStatus::Failed);
        let result = stored.execution_result.unwrap();
        assert_eq!(result.attempts, 3);
        assert!(matches!(result.outcome, ExecutionOutcome::Failed { .. }));
        assert_eq!(h.broker.requests().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn open_broker_breaker_postpones_instead_of_failing() {
        let mut h = Harness::new();
        h.trip_breaker(BROKER).await;
        let order = h.engine.scheduler.create_order(standard_spec()).await.unwrap();

        match h.wait_for(|e| matches!(e, ExecEvent::OrderPostponed { .. } | ExecEvent::OrderFailed { .. })).await {
            ExecEvent::OrderPostponed { order_id, retry_in, .. } => {
                assert_eq!(order_id, order.id);
                assert!(retry_in >= Duration::from_secs(29), "retry_in {retry_in:?} ignores the cooldown");
            }
            other => panic!("order was not postponed: {other:?}"),
        }
        assert!(h.broker.requests().is_empty());
        assert!(h.store.get_order(&order.id).await.unwrap().unwrap().is_pending());
        assert_eq!(h.engine.scheduler.scheduled_count(), 1);

        let event = h
            .wait_for(|e| matches!(e, ExecEvent::OrderExecuted { .. } | ExecEvent::OrderFailed { .. }))
            .await;
        assert!(matches!(event, ExecEvent::OrderExecuted { .. }), "{event:?}");
        let stored = h.store.get_order(&order.id).await.unwrap().unwrap();
        assert_eq!(stored.status, OrderStatus::Executed);
        assert_eq!(stored.execution_result.unwrap().attempts, 1);
        assert_eq!(h.broker.requests().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn postponed_order_can_be_cancelled() {
        let mut h = Harness::new();
        h.trip_breaker(BROKER).await;
        let order = h.engine.scheduler.create_order(standard_spec()).await.unwrap();
        h.wait_for(|e| matches!(e, ExecEvent::OrderPostponed { .. })).await;

        assert!(h.engine.scheduler.cancel_order(&order.id).await.unwrap());
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(h.broker.requests().is_empty());
        assert_eq!(h.engine.scheduler.scheduled_count(), 0);
        let stored = h.store.get_order(&order.id).await.unwrap().unwrap();
        assert_eq!(stored.status, OrderStatus::Cancelled);
    }

    #[tokio::test(start_paused = true)]
    async fn chain_resumes_at_the_postponed_step() {
        let mut h = Harness::new();
        let step = |token: &str| ChainStepSpec { token_address: token.into(), action: TradeAction::Buy, amount: 1.0 };
        h.broker.set_delay(Duration::from_millis(5));
        let parent = h
            .engine
            .scheduler
            .create_order(standard_spec().with_kind(KindSpec::Chained { steps: vec![step("TokenA"), step("TokenB")] }))
            .await
            .unwrap();

        // Trip the breaker while step one is in flight.
        while h.broker.requests().is_empty() {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        h.trip_breaker(BROKER).await;

        match h.wait_for(|e| matches!(e, ExecEvent::OrderPostponed { .. } | ExecEvent::OrderFailed { .. })).await {
            ExecEvent::OrderPostponed { order_id, .. } => assert_ne!(order_id, parent.id),
            other => panic!("chain step was not postponed: {other:?}"),
        }
        assert!(h.store.get_order(&parent.id).await.unwrap().unwrap().is_pending());

        h.wait_for(|e| matches!(e, ExecEvent::OrderDelegated { order_id, .. } if *order_id == parent.id)).await;
        let tokens: Vec<String> = h.broker.requests().into_iter().map(|r| r.token_address).collect();
        assert_eq!(tokens, vec!["TokenA", "TokenB"]);
        let statuses: Vec<OrderStatus> =
            h.store.load_children(&parent.id).await.unwrap().iter().map(|s| s.status).collect();
        assert_eq!(statuses, vec![OrderStatus::Executed, OrderStatus::Executed]);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_pending_and_in_flight() {
        let mut h = Harness::new();
        let later = h
            .engine
            .scheduler
            .create_order(standard_spec().at(Utc::now() + chrono::Duration::hours(1)))
            .await
            .unwrap();
        assert!(h.engine.scheduler.cancel_order(&later.id).await.unwrap());
        assert!(!h.engine.scheduler.cancel_order(&later.id).await.unwrap());
        assert_eq!(h.engine.scheduler.scheduled_count(), 0);
        let stored = h.store.get_order(&later.id).await.unwrap().unwrap();
        assert_eq!(stored.status, OrderStatus::Cancelled);

        let missing = h.engine.scheduler.cancel_order(&OrderId::from("nope")).await;
        assert!(matches!(missing, Err(EngineError::NotFound(_))));

        h.broker.set_delay(Duration::from_secs(10));
        let now = h.engine.scheduler.create_order(standard_spec()).await.unwrap();
        while h.broker.requests().is_empty() {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        assert!(!h.engine.scheduler.cancel_order(&now.id).await.unwrap());
        h.wait_for(|e| matches!(e, ExecEvent::OrderExecuted { .. })).await;
        let stored = h.store.get_order(&now.id).await.unwrap().unwrap();
        assert_eq!(stored.status, OrderStatus::Executed);
    }

    #[tokio::test(start_paused = true)]
    async fn invalid_spec_is_not_persisted() {
        let h = Harness::new();
        let err = h.engine.scheduler.create_order(standard_spec().with_amount(0.0)).await.unwrap_err();
        assert!(matches!(err, EngineError::InvalidSpec(_)));
        assert!(h.store.load_pending_orders().await.unwrap().is_empty());
    }
}
