//! Order execution inside the lane: price, submit, retry, record.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use sentinel_core::error::{EngineError, Result};
use sentinel_core::types::{ExecutionOutcome, ExecutionResult, Order, OrderKind, OrderStatus, PriceTick, Settlement};
use tracing::{debug, error, info, warn};

use super::Inner;
use crate::event::ExecEvent;
use crate::{TradeOptions, TradeRequest};

fn trade_request(order: &Order, price: f64) -> TradeRequest {
    TradeRequest {
        network: order.network.clone(),
        action: order.action,
        token_address: order.token_address.clone(),
        amount: order.amount,
        wallet_address: order.wallet_address.clone(),
        options: TradeOptions { expected_price: Some(price), client_ref: Some(order.id.to_string()) },
    }
}

/// How one run of an order ended.
#[derive(Debug)]
pub(super) enum Execution {
    Settled(Settlement),
    Failed(String),
    /// A breaker refused the call. Nothing was recorded and the order is
    /// still pending; it may run again after the delay.
    Postponed(Duration),
}

impl Inner {
    /// Triggering tick first, then the feed's last price, then a quote.
    async fn resolve_price(&self, order: &Order, trigger: Option<&PriceTick>) -> Result<f64> {
        if let Some(tick) = trigger {
            return Ok(tick.price);
        }
        Ok(self.ctx.freshest_tick(&order.feed_key()).await?.price)
    }

    async fn submit_with_retry(&self, order: &Order, trigger: Option<&PriceTick>) -> (Result<Settlement>, u32) {
        let max_attempts = self.config.execution_retries.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            let result = match self.resolve_price(order, trigger).await {
                Ok(price) => self.ctx.submit_trade(&trade_request(order, price)).await,
                Err(e) => Err(e),
            };
            match result {
                Ok(settlement) => return (Ok(settlement), attempt),
                Err(e) if attempt < max_attempts && e.is_retryable() => {
                    let backoff = self.config.retry_backoff * attempt;
                    warn!("[scheduler] order {} attempt {attempt}/{max_attempts} failed: {e}, retrying in {backoff:?}", order.id);
                    tokio::time::sleep(backoff).await;
                }
                Err(e) => return (Err(e), attempt),
            }
        }
    }

    /// Run one claimed order to a terminal status, unless a breaker refuses
    /// the call. A postponed order keeps its tracking for the caller to
    /// requeue.
    pub(super) async fn execute(
        &self,
        order: &Order,
        trigger: Option<&PriceTick>,
        dispatched_at: Option<DateTime<Utc>>,
    ) -> Execution {
        let (outcome, attempts) = self.submit_with_retry(order, trigger).await;
        if let Err(e) = &outcome {
            if let Some(dependency) = e.unavailable_dependency() {
                let retry_in = self.postpone_delay(dependency);
                warn!("[scheduler] order {} postponed for {retry_in:?}: {e}", order.id);
                self.emit(ExecEvent::OrderPostponed { order_id: order.id.clone(), reason: e.to_string(), retry_in });
                return Execution::Postponed(retry_in);
            }
        }
        let (status, result, ret) = match outcome {
            Ok(settlement) => (
                OrderStatus::Executed,
                ExecutionResult::new(ExecutionOutcome::Settled(settlement.clone()), attempts, dispatched_at),
                Ok(settlement),
            ),
            Err(e) => {
                let error = terminal(e).to_string();
                (
                    OrderStatus::Failed,
                    ExecutionResult::new(ExecutionOutcome::Failed { error: error.clone() }, attempts, dispatched_at),
                    Err(error),
                )
            }
        };

        match self.ctx.store.update_order_status(&order.id, status, result).await {
            Ok(true) => match &ret {
                Ok(settlement) => {
                    info!(
                        "[scheduler] order {} executed: tx={} price={} attempts={attempts}",
                        order.id, settlement.tx_hash, settlement.price
                    );
                    self.emit(ExecEvent::OrderExecuted { order_id: order.id.clone(), settlement: settlement.clone() });
                }
                Err(error) => {
                    warn!("[scheduler] order {} failed after {attempts} attempts: {error}", order.id);
                    self.emit(ExecEvent::OrderFailed { order_id: order.id.clone(), error: error.clone() });
                }
            },
            Ok(false) => warn!("[scheduler] order {} was closed while executing, result not recorded", order.id),
            Err(e) => error!("[scheduler] failed to record result of order {}: {e}", order.id),
        }
        self.untrack(&order.id);
        match ret {
            Ok(settlement) => Execution::Settled(settlement),
            Err(error) => Execution::Failed(error),
        }
    }

    /// Wait for the breaker's remaining cooldown, and at least one backoff unit.
    fn postpone_delay(&self, dependency: &str) -> Duration {
        self.ctx.breakers.retry_after(dependency).unwrap_or_default().max(self.config.retry_backoff)
    }

    /// Run the steps of a chain in order. Steps already executed (before a
    /// restart) are skipped; the first failure skips every later step and
    /// fails the parent. A postponed step puts the whole chain back in the
    /// lane, to resume at that step.
    pub(super) async fn run_chain(self: &Arc<Self>, parent: &Order, pass: u64, dispatched_at: DateTime<Utc>) {
        let OrderKind::Chained { steps } = &parent.kind else { return };
        if !self.begin(&parent.id) {
            return;
        }

        let mut failure = None;
        for (i, step_id) in steps.iter().enumerate() {
            let step = match self.ctx.store.get_order(step_id).await {
                Ok(Some(step)) => step,
                Ok(None) => {
                    failure = Some((i, format!("step {step_id} not found")));
                    break;
                }
                Err(e) => {
                    failure = Some((i, e.to_string()));
                    break;
                }
            };
            match step.status {
                OrderStatus::Executed => continue,
                OrderStatus::Pending => {
                    if !self.begin_step(&step.id) {
                        // Stopped mid-chain; the rest resumes after restore.
                        self.untrack(&parent.id);
                        return;
                    }
                    match self.execute(&step, None, Some(dispatched_at)).await {
                        Execution::Settled(settlement) => {
                            debug!("[scheduler] chain {} step {} settled in {}", parent.id, i + 1, settlement.tx_hash);
                        }
                        Execution::Failed(error) => {
                            failure = Some((i, error));
                            break;
                        }
                        Execution::Postponed(delay) => {
                            self.untrack(&step.id);
                            self.requeue(parent.id.clone(), pass, dispatched_at, delay);
                            return;
                        }
                    }
                }
                other => {
                    failure = Some((i, format!("step is {other}")));
                    break;
                }
            }
        }

        let (status, outcome) = match &failure {
            None => (OrderStatus::Executed, ExecutionOutcome::Delegated { children: steps.clone() }),
            Some((i, error)) => {
                self.skip_steps(&steps[i + 1..], "previous chain step failed").await;
                (OrderStatus::Failed, ExecutionOutcome::Failed { error: format!("chain step {} failed: {error}", i + 1) })
            }
        };
        let result = ExecutionResult::new(outcome, 0, Some(dispatched_at));
        match self.ctx.store.update_order_status(&parent.id, status, result).await {
            Ok(true) => match failure {
                None => {
                    info!("[scheduler] chain {} completed {} steps", parent.id, steps.len());
                    self.emit(ExecEvent::OrderDelegated { order_id: parent.id.clone(), children: steps.clone() });
                }
                Some((i, error)) => {
                    warn!("[scheduler] chain {} aborted at step {}: {error}", parent.id, i + 1);
                    self.emit(ExecEvent::OrderFailed {
                        order_id: parent.id.clone(),
                        error: format!("chain step {} failed: {error}", i + 1),
                    });
                }
            },
            Ok(false) => warn!("[scheduler] chain {} was closed while running", parent.id),
            Err(e) => error!("[scheduler] failed to record chain {}: {e}", parent.id),
        }
        self.untrack(&parent.id);
    }
}

/// Retries are over: whatever is left is terminal.
fn terminal(e: EngineError) -> EngineError {
    match e {
        EngineError::TransientExecution(msg) => EngineError::TerminalExecution(msg),
        other => other,
    }
}
