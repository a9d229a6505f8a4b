//! Exponential backoff with jitter for feed reconnection.

use std::time::Duration;

use rand::Rng;
use sentinel_core::config::FeedConfig;

#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectConfig {
    /// Delay before the first reconnect attempt.
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    /// Fraction of the delay randomly added or removed (0.1 = ±10%).
    pub jitter_factor: f64,
    /// Attempts allowed between two successful connects.
    pub max_attempts: u32,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self::from(&FeedConfig::default())
    }
}

impl From<&FeedConfig> for ReconnectConfig {
    fn from(cfg: &FeedConfig) -> Self {
        Self {
            initial_delay: cfg.reconnect_base,
            max_delay: cfg.reconnect_max,
            multiplier: cfg.reconnect_multiplier,
            jitter_factor: cfg.reconnect_jitter,
            max_attempts: cfg.max_reconnect_attempts,
        }
    }
}

/// Attempt `n` (1-based) waits `min(initial × multiplier^(n-1), max)`,
/// jittered. Returns `None` once `max_attempts` is used up.
#[derive(Debug)]
pub struct ReconnectPolicy {
    config: ReconnectConfig,
    attempt_count: u32,
}

impl ReconnectPolicy {
    pub fn new(config: ReconnectConfig) -> Self {
        Self { config, attempt_count: 0 }
    }

    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.attempt_count >= self.config.max_attempts {
            return None;
        }
        self.attempt_count += 1;
        Some(self.apply_jitter(self.base_delay(self.attempt_count)))
    }

    /// Un-jittered delay for a 1-based attempt number.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(64) as i32;
        let millis = self.config.initial_delay.as_millis() as f64 * self.config.multiplier.powi(exp);
        let cap = self.config.max_delay.as_millis() as f64;
        let millis = if millis.is_finite() { millis.min(cap) } else { cap };
        Duration::from_millis(millis.max(0.0) as u64)
    }

    /// Call after a successful connect.
    pub fn reset(&mut self) {
        self.attempt_count = 0;
    }

    pub fn attempt_count(&self) -> u32 {
        self.attempt_count
    }

    fn apply_jitter(&self, duration: Duration) -> Duration {
        if self.config.jitter_factor <= 0.0 {
            return duration;
        }
        let base = duration.as_millis() as f64;
        let range = base * self.config.jitter_factor;
        let jitter: f64 = rand::rng().random_range(-range..=range);
        Duration::from_millis((base + jitter).max(1.0) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(jitter: f64, max_attempts: u32) -> ReconnectConfig {
        ReconnectConfig {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(1000),
            multiplier: 2.0,
            jitter_factor: jitter,
            max_attempts,
        }
    }

    #[test]
    fn delays_grow_and_cap() {
        let mut policy = ReconnectPolicy::new(config(0.0, 10));
        let delays: Vec<u64> = (0..6).map(|_| policy.next_delay().unwrap().as_millis() as u64).collect();
        assert_eq!(delays, vec![100, 200, 400, 800, 1000, 1000]);
    }

    #[test]
    fn gives_up_after_max_attempts_and_reset_restores_budget() {
        let mut policy = ReconnectPolicy::new(config(0.0, 2));
        assert!(policy.next_delay().is_some());
        assert!(policy.next_delay().is_some());
        assert!(policy.next_delay().is_none());
        assert_eq!(policy.attempt_count(), 2);

        policy.reset();
        assert_eq!(policy.next_delay(), Some(Duration::from_millis(100)));
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let mut policy = ReconnectPolicy::new(config(0.1, 100));
        for attempt in 1..=20 {
            let base = policy.base_delay(attempt).as_millis() as f64;
            let d = policy.next_delay().unwrap().as_millis() as f64;
            assert!(d >= (base * 0.9).floor() - 1.0 && d <= base * 1.1 + 1.0, "attempt {attempt}: {d} vs {base}");
        }
    }
}
