//! Coalescing groups: due orders bucketed by `execute_at` under one timer each.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use sentinel_core::types::OrderId;
use tokio::task::JoinHandle;

/// Bucket for orders already due when scheduled. Fires on the next tick.
pub(crate) const OVERDUE: i64 = i64::MIN;

pub(crate) fn window_ms(window: Duration) -> i64 {
    i64::try_from(window.as_millis()).unwrap_or(i64::MAX).max(1)
}

pub(crate) fn bucket_of(execute_at: DateTime<Utc>, now: DateTime<Utc>, window_ms: i64) -> i64 {
    if execute_at <= now {
        OVERDUE
    } else {
        execute_at.timestamp_millis().div_euclid(window_ms)
    }
}

/// Time from `now` until the bucket's window closes.
pub(crate) fn delay_until(bucket: i64, window_ms: i64, now: DateTime<Utc>) -> Duration {
    if bucket == OVERDUE {
        return Duration::ZERO;
    }
    let end = bucket.saturating_add(1).saturating_mul(window_ms);
    let wait = end.saturating_sub(now.timestamp_millis());
    Duration::from_millis(u64::try_from(wait).unwrap_or(0))
}

#[derive(Default)]
struct Group {
    orders: Vec<OrderId>,
    timer: Option<JoinHandle<()>>,
}

#[derive(Default)]
pub(crate) struct Groups {
    buckets: BTreeMap<i64, Group>,
}

impl Groups {
    /// Append to the bucket. Returns true when the bucket is new and still
    /// needs a timer.
    pub fn insert(&mut self, bucket: i64, id: OrderId) -> bool {
        let group = self.buckets.entry(bucket).or_default();
        group.orders.push(id);
        group.timer.is_none()
    }

    pub fn set_timer(&mut self, bucket: i64, timer: JoinHandle<()>) {
        match self.buckets.get_mut(&bucket) {
            Some(group) => group.timer = Some(timer),
            None => timer.abort(),
        }
    }

    /// Remove the bucket and return its orders in insertion order. The timer
    /// is left running since this is normally called from it.
    pub fn take(&mut self, bucket: i64) -> Vec<OrderId> {
        self.buckets.remove(&bucket).map(|g| g.orders).unwrap_or_default()
    }

    /// Drop one order. An emptied bucket is removed and its timer aborted.
    pub fn remove_order(&mut self, bucket: i64, id: &OrderId) {
        let Some(group) = self.buckets.get_mut(&bucket) else { return };
        group.orders.retain(|o| o != id);
        if group.orders.is_empty() {
            if let Some(timer) = self.buckets.remove(&bucket).and_then(|g| g.timer) {
                timer.abort();
            }
        }
    }

    pub fn clear(&mut self) {
        for (_, group) in std::mem::take(&mut self.buckets) {
            if let Some(timer) = group.timer {
                timer.abort();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(ms: i64) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(ms).unwrap()
    }

    #[test]
    fn same_window_same_bucket() {
        let now = at(1_000_000);
        let w = window_ms(Duration::from_secs(1));
        assert_eq!(bucket_of(at(1_005_100), now, w), bucket_of(at(1_005_900), now, w));
        assert_ne!(bucket_of(at(1_005_900), now, w), bucket_of(at(1_006_000), now, w));
        assert_eq!(bucket_of(at(999_000), now, w), OVERDUE);
        assert_eq!(bucket_of(now, now, w), OVERDUE);
    }

    #[test]
    fn timer_fires_at_window_end() {
        let now = at(1_000_000);
        let w = 1_000;
        let bucket = bucket_of(at(1_005_100), now, w);
        assert_eq!(delay_until(bucket, w, now), Duration::from_millis(6_000));
        assert_eq!(delay_until(OVERDUE, w, now), Duration::ZERO);
    }

    #[tokio::test]
    async fn emptied_bucket_is_dropped_with_its_timer() {
        let mut groups = Groups::default();
        let a = OrderId::from("a");
        let b = OrderId::from("b");
        assert!(groups.insert(7, a.clone()));
        groups.set_timer(7, tokio::spawn(std::future::pending::<()>()));
        assert!(!groups.insert(7, b.clone()), "bucket already has a timer");

        groups.remove_order(7, &a);
        groups.remove_order(7, &b);
        assert!(groups.take(7).is_empty());
        assert!(groups.insert(7, a.clone()), "emptied bucket kept its timer");
        assert_eq!(groups.take(7), vec![a]);
    }
}
