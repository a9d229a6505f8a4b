//! Time-windowed outbound batching.

use std::time::Duration;

use serde_json::Value;
use tokio::time::Instant;

/// How an outbound message should be sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Delivery {
    #[default]
    Immediate,
    /// Held until the batch window closes or the batch is full.
    Batched,
}

/// Accumulates messages for one connection.
///
/// The window opens with the first message; the batch flushes when the
/// window closes or `max` messages are pending, whichever comes first.
#[derive(Debug)]
pub struct Batcher {
    window: Duration,
    max: usize,
    pending: Vec<String>,
    deadline: Option<Instant>,
}

impl Batcher {
    pub fn new(window: Duration, max: usize) -> Self {
        Self { window, max: max.max(1), pending: Vec::new(), deadline: None }
    }

    /// Add a message. Returns the encoded batch if it is now full.
    pub fn push(&mut self, msg: String) -> Option<String> {
        if self.pending.is_empty() {
            self.deadline = Some(Instant::now() + self.window);
        }
        self.pending.push(msg);
        if self.pending.len() >= self.max { self.take() } else { None }
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Drain and encode. A single message goes out unchanged; several are
    /// sent as one JSON array (non-JSON messages become string elements).
    pub fn take(&mut self) -> Option<String> {
        self.deadline = None;
        match self.pending.len() {
            0 => None,
            1 => self.pending.pop(),
            _ => {
                let items: Vec<Value> = self
                    .pending
                    .drain(..)
                    .map(|m| serde_json::from_str(&m).unwrap_or(Value::String(m)))
                    .collect();
                Some(Value::Array(items).to_string())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn single_message_is_sent_as_is() {
        let mut b = Batcher::new(Duration::from_millis(100), 10);
        assert!(b.push(r#"{"op":"a"}"#.to_string()).is_none());
        assert!(b.deadline().is_some());
        assert_eq!(b.take().unwrap(), r#"{"op":"a"}"#);
        assert!(b.deadline().is_none());
        assert!(b.take().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn full_batch_flushes_as_array() {
        let mut b = Batcher::new(Duration::from_secs(1), 3);
        assert!(b.push(r#"{"n":1}"#.into()).is_none());
        assert!(b.push("raw".into()).is_none());
        let out = b.push(r#"{"n":3}"#.into()).unwrap();
        assert_eq!(out, r#"[{"n":1},"raw",{"n":3}]"#);
        assert!(b.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn window_opens_with_first_message() {
        let mut b = Batcher::new(Duration::from_millis(100), 10);
        b.push("1".into());
        let deadline = b.deadline().unwrap();
        tokio::time::advance(Duration::from_millis(50)).await;
        b.push("2".into());
        assert_eq!(b.deadline().unwrap(), deadline);
        assert_eq!(b.len(), 2);
    }
}
