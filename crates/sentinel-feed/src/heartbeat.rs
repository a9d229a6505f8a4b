//! Ping/pong bookkeeping for one connected session.

use std::time::Duration;

use tokio::time::Instant;

/// Tracks the outstanding ping, if any, and when its reply is due.
#[derive(Debug)]
pub struct HeartbeatState {
    pong_timeout: Duration,
    ping_sent_at: Option<Instant>,
}

impl HeartbeatState {
    pub fn new(pong_timeout: Duration) -> Self {
        Self { pong_timeout, ping_sent_at: None }
    }

    /// Record a ping. An already outstanding ping keeps its original deadline.
    pub fn mark_ping_sent(&mut self) {
        if self.ping_sent_at.is_none() {
            self.ping_sent_at = Some(Instant::now());
        }
    }

    pub fn record_pong(&mut self) {
        self.ping_sent_at = None;
    }

    /// When the connection must be considered dead, if a ping is outstanding.
    pub fn deadline(&self) -> Option<Instant> {
        self.ping_sent_at.map(|t| t + self.pong_timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn deadline_follows_first_unanswered_ping() {
        let mut hb = HeartbeatState::new(Duration::from_secs(10));
        assert!(hb.deadline().is_none());

        hb.mark_ping_sent();
        let first = hb.deadline().unwrap();
        tokio::time::advance(Duration::from_secs(5)).await;
        hb.mark_ping_sent();
        assert_eq!(hb.deadline().unwrap(), first);

        hb.record_pong();
        assert!(hb.deadline().is_none());

        tokio::time::advance(Duration::from_secs(30)).await;
        hb.mark_ping_sent();
        assert_eq!(hb.deadline().unwrap(), first + Duration::from_secs(35));
    }
}
