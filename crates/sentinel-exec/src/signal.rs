//! Bridges synchronous feed callbacks into an engine's async tick worker.

use std::sync::Arc;

use sentinel_core::types::{FeedKey, PriceTick};
use sentinel_feed::{FeedCallback, FeedEvent};
use tokio::sync::mpsc;

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum FeedSignal {
    Tick(PriceTick),
    /// The supervisor gave up on `key`; the consumer registration is gone.
    Terminated(FeedKey, String),
}

pub(crate) type SignalTx = mpsc::UnboundedSender<FeedSignal>;
pub(crate) type SignalRx = mpsc::UnboundedReceiver<FeedSignal>;

/// Callback that forwards every event on `key` into `tx`.
pub(crate) fn forwarder(key: FeedKey, tx: SignalTx) -> FeedCallback {
    Arc::new(move |event: &FeedEvent| {
        let signal = match event {
            FeedEvent::Price(tick) => FeedSignal::Tick(tick.clone()),
            FeedEvent::Terminated(reason) => FeedSignal::Terminated(key.clone(), reason.clone()),
        };
        // Receiver gone means the engine stopped.
        let _ = tx.send(signal);
    })
}
