// Pending probe table
//
// Maps correlation keys to the instant their probe was written. Sessions
// record on send and resolve on echo; a periodic sweep drops probes whose
// echo never arrived.

use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::stats::MetricsAggregator;

pub struct LatencyTracker {
    pending: DashMap<String, Instant>,
}

impl LatencyTracker {
    pub fn new() -> Self {
        Self {
            pending: DashMap::new(),
        }
    }

    /// Insert or overwrite the send time for `key`.
    pub fn record(&self, key: String, sent_at: Instant) {
        self.pending.insert(key, sent_at);
    }

    /// Remove and return the send time for `key`. A second resolve of the
    /// same key returns `None`.
    pub fn resolve(&self, key: &str) -> Option<Instant> {
        self.pending.remove(key).map(|(_, sent_at)| sent_at)
    }

    /// Drop every entry older than `stale_after`; returns how many were dropped.
    pub fn sweep(&self, stale_after: Duration) -> usize {
        self.sweep_at(Instant::now(), stale_after)
    }

    /// Sweep relative to `now`. Stale keys are collected under shard read
    /// locks, then each is removed individually with its age re-checked.
    pub fn sweep_at(&self, now: Instant, stale_after: Duration) -> usize {
        let stale: Vec<String> = self
            .pending
            .iter()
            .filter(|entry| now.saturating_duration_since(*entry.value()) > stale_after)
            .map(|entry| entry.key().clone())
            .collect();

        stale
            .iter()
            .filter(|key| {
                self.pending
                    .remove_if(key.as_str(), |_, sent_at| {
                        now.saturating_duration_since(*sent_at) > stale_after
                    })
                    .is_some()
            })
            .count()
    }

    /// Drop every entry regardless of age; returns how many were dropped.
    pub fn drain(&self) -> usize {
        let mut dropped = 0;
        self.pending.retain(|_, _| {
            dropped += 1;
            false
        });
        dropped
    }

    pub fn contains(&self, key: &str) -> bool {
        self.pending.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

impl Default for LatencyTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// Run the sweep every `stale_after / 2` until `cancel` fires. Swept probes
/// are added to the lost counter.
pub fn spawn_sweeper(
    tracker: Arc<LatencyTracker>,
    stats: Arc<MetricsAggregator>,
    stale_after: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    let period = (stale_after / 2).max(Duration::from_millis(1));
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let removed = tracker.sweep(stale_after);
                    if removed > 0 {
                        stats.record_lost(removed as u64);
                        debug!(removed, pending = tracker.len(), "swept stale probes");
                    }
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn record_then_resolve_returns_send_time() {
        let tracker = LatencyTracker::new();
        let sent = Instant::now();
        tracker.record("W1-N1".to_string(), sent);
        assert_eq!(tracker.resolve("W1-N1"), Some(sent));
        assert!(tracker.is_empty());
    }

    #[test]
    fn resolve_twice_finds_once() {
        let tracker = LatencyTracker::new();
        tracker.record("W1-N1".to_string(), Instant::now());
        assert!(tracker.resolve("W1-N1").is_some());
        assert!(tracker.resolve("W1-N1").is_none());
    }

    #[test]
    fn resolve_unknown_key_is_none() {
        let tracker = LatencyTracker::new();
        assert!(tracker.resolve("W9-N9").is_none());
    }

    #[test]
    fn record_overwrites_existing_key() {
        let tracker = LatencyTracker::new();
        let first = Instant::now();
        let second = first + Duration::from_millis(5);
        tracker.record("k".to_string(), first);
        tracker.record("k".to_string(), second);
        assert_eq!(tracker.len(), 1);
        assert_eq!(tracker.resolve("k"), Some(second));
    }

    #[test]
    fn sweep_removes_only_stale_entries() {
        let tracker = LatencyTracker::new();
        let base = Instant::now();
        tracker.record("old".to_string(), base);
        tracker.record("young".to_string(), base + Duration::from_secs(20));

        let removed = tracker.sweep_at(base + Duration::from_secs(31), Duration::from_secs(30));
        assert_eq!(removed, 1);
        assert!(!tracker.contains("old"));
        assert!(tracker.contains("young"));
    }

    #[test]
    fn sweep_keeps_entry_exactly_at_threshold() {
        let tracker = LatencyTracker::new();
        let base = Instant::now();
        tracker.record("edge".to_string(), base);
        let removed = tracker.sweep_at(base + Duration::from_secs(30), Duration::from_secs(30));
        assert_eq!(removed, 0);
        assert!(tracker.contains("edge"));
    }

    #[test]
    fn drain_drops_everything() {
        let tracker = LatencyTracker::new();
        let now = Instant::now();
        tracker.record("a".to_string(), now);
        tracker.record("b".to_string(), now);
        assert_eq!(tracker.drain(), 2);
        assert!(tracker.is_empty());
        assert_eq!(tracker.drain(), 0);
    }

    #[test]
    fn sweep_empty_table() {
        let tracker = LatencyTracker::new();
        assert_eq!(tracker.sweep(Duration::from_secs(1)), 0);
    }

    #[test]
    fn concurrent_record_and_resolve() {
        use std::thread;

        let tracker = Arc::new(LatencyTracker::new());
        let mut handles = vec![];
        for t in 0..8u64 {
            let tr = Arc::clone(&tracker);
            handles.push(thread::spawn(move || {
                let mut found = 0;
                for n in 0..500u64 {
                    let key = crate::stomp::make_key(t, n);
                    tr.record(key.clone(), Instant::now());
                    if tr.resolve(&key).is_some() {
                        found += 1;
                    }
                }
                found
            }));
        }
        let total: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(total, 8 * 500);
        assert!(tracker.is_empty());
    }

    #[test]
    fn concurrent_resolve_same_key_wins_once() {
        use std::thread;

        let tracker = Arc::new(LatencyTracker::new());
        tracker.record("shared".to_string(), Instant::now());
        let handles: Vec<_> = (0..16)
            .map(|_| {
                let tr = Arc::clone(&tracker);
                thread::spawn(move || tr.resolve("shared").is_some())
            })
            .collect();
        let wins = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(wins, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn sweeper_moves_expired_probes_to_lost() {
        let tracker = Arc::new(LatencyTracker::new());
        let stats = Arc::new(MetricsAggregator::new());
        let cancel = CancellationToken::new();
        tracker.record("W1-N1".to_string(), Instant::now());

        let handle = spawn_sweeper(
            tracker.clone(),
            stats.clone(),
            Duration::from_millis(200),
            cancel.clone(),
        );

        tokio::time::sleep(Duration::from_millis(350)).await;

        assert!(tracker.is_empty());
        assert_eq!(stats.counters().lost, 1);

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn sweeper_stops_on_cancel() {
        let tracker = Arc::new(LatencyTracker::new());
        let stats = Arc::new(MetricsAggregator::new());
        let cancel = CancellationToken::new();
        let handle = spawn_sweeper(tracker, stats, Duration::from_secs(30), cancel.clone());
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("sweeper should stop promptly")
            .unwrap();
    }

    proptest! {
        #[test]
        fn prop_sweep_never_removes_young_entries(
            ages_ms in proptest::collection::vec(0u64..10_000, 1..50),
            stale_ms in 1u64..10_000,
        ) {
            let tracker = LatencyTracker::new();
            let now = Instant::now() + Duration::from_secs(20);
            for (i, age) in ages_ms.iter().enumerate() {
                tracker.record(format!("k{}", i), now - Duration::from_millis(*age));
            }
            let removed = tracker.sweep_at(now, Duration::from_millis(stale_ms));
            let expected = ages_ms.iter().filter(|a| **a > stale_ms).count();
            prop_assert_eq!(removed, expected);
            for (i, age) in ages_ms.iter().enumerate() {
                prop_assert_eq!(tracker.contains(&format!("k{}", i)), *age <= stale_ms);
            }
        }
    }
}
