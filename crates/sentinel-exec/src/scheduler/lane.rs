//! Background workers of the scheduler.
//!
//! The execution lane runs jobs strictly one at a time, so no two broker
//! submissions from this scheduler ever overlap. The tick worker evaluates
//! armed orders as feed events arrive and hands fired orders to the lane.

use std::sync::Weak;

use chrono::{DateTime, Utc};
use sentinel_core::types::{OrderId, PriceTick};
use tokio::sync::{mpsc, watch};
use tracing::debug;

use super::Inner;
use crate::signal::{FeedSignal, SignalRx};

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Job {
    /// The order's group timer fired.
    Due { id: OrderId, pass: u64, dispatched_at: DateTime<Utc> },
    /// An armed order's condition held on `tick`.
    Fire { id: OrderId, tick: PriceTick, pass: u64, dispatched_at: DateTime<Utc> },
}

pub(crate) type JobTx = mpsc::UnboundedSender<Job>;
pub(crate) type JobRx = mpsc::UnboundedReceiver<Job>;

pub(crate) async fn run_lane(inner: Weak<Inner>, mut jobs: JobRx, mut shutdown: watch::Receiver<bool>) {
    loop {
        let job = tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            job = jobs.recv() => match job {
                Some(job) => job,
                None => break,
            },
        };
        let Some(inner) = inner.upgrade() else { break };
        inner.run_job(job).await;
    }
    debug!("[scheduler] execution lane stopped");
}

pub(crate) async fn run_ticks(inner: Weak<Inner>, mut signals: SignalRx, mut shutdown: watch::Receiver<bool>) {
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
            FeedSignal::Tick(tick) => inner.on_tick(tick).await,
            FeedSignal::Terminated(key, reason) => inner.on_feed_terminated(key, reason),
        }
    }
    debug!("[scheduler] tick worker stopped");
}
