// Statistics collector module

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use metrics::{counter, gauge, histogram};

use crate::metrics as names;
use crate::session::pattern::TrafficTier;

/// Shared run statistics. Counters are lock-free atomics; each sample list
/// is split into per-thread shards so concurrent appends rarely meet on the
/// same mutex. Every update is mirrored to the `metrics` facade so an
/// installed Prometheus recorder sees it live.
pub struct MetricsAggregator {
    sent: AtomicU64,
    received: AtomicU64,
    success: AtomicU64,
    errors: AtomicU64,
    lost: AtomicU64,
    sessions_created: AtomicU64,
    active_sessions: AtomicU64,
    tier_active: [AtomicU64; 3],
    connection_retries: AtomicU64,
    failed_reconnections: AtomicU64,
    successful_reconnections: AtomicU64,
    current_stage: AtomicU64,
    reconnecting: AtomicU64,
    latency: SampleShards,
    connect_setup: SampleShards,
    handshake: SampleShards,
    reconnection: SampleShards,
    start_time: Instant,
}

/// Counter values only; cheap enough for periodic progress output.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsCounters {
    pub sent: u64,
    pub received: u64,
    pub success: u64,
    pub errors: u64,
    pub lost: u64,
    pub sessions_created: u64,
    pub active_sessions: u64,
    pub active_tier: u64,
    pub moderate_tier: u64,
    pub passive_tier: u64,
    pub connection_retries: u64,
    pub failed_reconnections: u64,
    pub successful_reconnections: u64,
    pub current_stage: u64,
    /// Sessions currently inside a reconnect attempt.
    pub reconnecting: u64,
}

impl StatsCounters {
    /// Per-field difference `self - earlier`; gauges keep their current value.
    pub fn since(&self, earlier: &StatsCounters) -> StatsCounters {
        StatsCounters {
            sent: self.sent.saturating_sub(earlier.sent),
            received: self.received.saturating_sub(earlier.received),
            success: self.success.saturating_sub(earlier.success),
            errors: self.errors.saturating_sub(earlier.errors),
            lost: self.lost.saturating_sub(earlier.lost),
            sessions_created: self.sessions_created.saturating_sub(earlier.sessions_created),
            connection_retries: self.connection_retries.saturating_sub(earlier.connection_retries),
            failed_reconnections: self
                .failed_reconnections
                .saturating_sub(earlier.failed_reconnections),
            successful_reconnections: self
                .successful_reconnections
                .saturating_sub(earlier.successful_reconnections),
            ..*self
        }
    }
}

/// A point-in-time copy of counters and every sample list.
#[derive(Debug, Clone)]
pub struct StatsSnapshot {
    pub timestamp: Instant,
    pub elapsed: Duration,
    pub counters: StatsCounters,
    pub latency: Vec<Duration>,
    pub connect_setup: Vec<Duration>,
    pub handshake: Vec<Duration>,
    pub reconnection: Vec<Duration>,
}

impl StatsSnapshot {
    /// Correlated round trips per probe sent; 0 when nothing was sent.
    pub fn success_rate(&self) -> f64 {
        if self.counters.sent == 0 {
            0.0
        } else {
            self.counters.success as f64 / self.counters.sent as f64
        }
    }
}

struct SampleShards {
    shards: Vec<Mutex<Vec<Duration>>>,
}

impl SampleShards {
    fn new(count: usize) -> Self {
        Self {
            shards: (0..count).map(|_| Mutex::new(Vec::new())).collect(),
        }
    }

    fn push(&self, idx: usize, sample: Duration) {
        self.shards[idx]
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(sample);
    }

    fn collect(&self) -> Vec<Duration> {
        let mut all = Vec::new();
        for shard in &self.shards {
            let guard = shard.lock().unwrap_or_else(PoisonError::into_inner);
            all.extend_from_slice(&guard);
        }
        all
    }

    fn len(&self) -> usize {
        self.shards
            .iter()
            .map(|s| s.lock().unwrap_or_else(PoisonError::into_inner).len())
            .sum()
    }
}

impl MetricsAggregator {
    pub fn new() -> Self {
        let shard_count = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);
        Self {
            sent: AtomicU64::new(0),
            received: AtomicU64::new(0),
            success: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            lost: AtomicU64::new(0),
            sessions_created: AtomicU64::new(0),
            active_sessions: AtomicU64::new(0),
            tier_active: [AtomicU64::new(0), AtomicU64::new(0), AtomicU64::new(0)],
            connection_retries: AtomicU64::new(0),
            failed_reconnections: AtomicU64::new(0),
            successful_reconnections: AtomicU64::new(0),
            current_stage: AtomicU64::new(0),
            reconnecting: AtomicU64::new(0),
            latency: SampleShards::new(shard_count),
            connect_setup: SampleShards::new(shard_count),
            handshake: SampleShards::new(shard_count),
            reconnection: SampleShards::new(shard_count),
            start_time: Instant::now(),
        }
    }

    /// Select a shard based on the current thread ID.
    fn shard_index(&self) -> usize {
        let thread_id = std::thread::current().id();
        let hash = format!("{:?}", thread_id);
        let mut h: usize = 0;
        for b in hash.bytes() {
            h = h.wrapping_mul(31).wrapping_add(b as usize);
        }
        h % self.latency.shards.len()
    }

    pub fn record_sent(&self) {
        self.sent.fetch_add(1, Ordering::Relaxed);
        counter!(names::MESSAGES_SENT).increment(1);
    }

    pub fn record_received(&self) {
        self.received.fetch_add(1, Ordering::Relaxed);
        counter!(names::MESSAGES_RECEIVED).increment(1);
    }

    /// Record one correlated round trip.
    pub fn record_round_trip(&self, latency: Duration) {
        self.success.fetch_add(1, Ordering::Relaxed);
        self.latency.push(self.shard_index(), latency);
        counter!(names::SUCCESS).increment(1);
        histogram!(names::MESSAGE_LATENCY_MS).record(as_millis_f64(latency));
    }

    pub fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
        counter!(names::ERRORS).increment(1);
    }

    /// Probes dropped by the pending-table sweep.
    pub fn record_lost(&self, count: u64) {
        self.lost.fetch_add(count, Ordering::Relaxed);
        counter!(names::LOST).increment(count);
    }

    pub fn record_session_created(&self) {
        self.sessions_created.fetch_add(1, Ordering::Relaxed);
        counter!(names::TOTAL_WORKERS).increment(1);
    }

    pub fn session_started(&self, tier: TrafficTier) {
        self.active_sessions.fetch_add(1, Ordering::Relaxed);
        self.tier_active[tier.index()].fetch_add(1, Ordering::Relaxed);
        gauge!(names::ACTIVE_CONNECTIONS).increment(1.0);
        gauge!(names::SESSIONS_BY_TIER, "tier" => tier.name()).increment(1.0);
    }

    pub fn session_finished(&self, tier: TrafficTier) {
        self.active_sessions.fetch_sub(1, Ordering::Relaxed);
        self.tier_active[tier.index()].fetch_sub(1, Ordering::Relaxed);
        gauge!(names::ACTIVE_CONNECTIONS).decrement(1.0);
        gauge!(names::SESSIONS_BY_TIER, "tier" => tier.name()).decrement(1.0);
    }

    /// One-based number of the stage now running; 0 before the first.
    pub fn set_current_stage(&self, number: usize) {
        self.current_stage.store(number as u64, Ordering::Relaxed);
        gauge!(names::CURRENT_STAGE).set(number as f64);
    }

    /// A lost connection is being re-established.
    pub fn reconnect_started(&self) {
        self.reconnecting.fetch_add(1, Ordering::Relaxed);
        gauge!(names::ACTIVE_RECONNECTIONS).increment(1.0);
    }

    /// Pairs with `reconnect_started`, whatever the outcome.
    pub fn reconnect_finished(&self) {
        self.reconnecting.fetch_sub(1, Ordering::Relaxed);
        gauge!(names::ACTIVE_RECONNECTIONS).decrement(1.0);
    }

    /// Transport dial time and protocol handshake time for one established
    /// connection.
    pub fn record_connection_setup(&self, connect_setup: Duration, handshake: Duration) {
        let idx = self.shard_index();
        self.connect_setup.push(idx, connect_setup);
        self.handshake.push(idx, handshake);
        histogram!(names::WEBSOCKET_CONNECT_MS).record(as_millis_f64(connect_setup));
        histogram!(names::STOMP_CONNECT_MS).record(as_millis_f64(handshake));
    }

    pub fn record_connection_retry(&self) {
        self.connection_retries.fetch_add(1, Ordering::Relaxed);
        counter!(names::CONNECTION_RETRIES).increment(1);
    }

    pub fn record_failed_reconnection(&self) {
        self.failed_reconnections.fetch_add(1, Ordering::Relaxed);
        counter!(names::FAILED_RECONNECTIONS).increment(1);
    }

    pub fn record_successful_reconnection(&self, elapsed: Duration) {
        self.successful_reconnections.fetch_add(1, Ordering::Relaxed);
        self.reconnection.push(self.shard_index(), elapsed);
        counter!(names::SUCCESSFUL_RECONNECTIONS).increment(1);
        histogram!(names::RECONNECTION_TIME_MS).record(as_millis_f64(elapsed));
    }

    pub fn counters(&self) -> StatsCounters {
        StatsCounters {
            sent: self.sent.load(Ordering::Relaxed),
            received: self.received.load(Ordering::Relaxed),
            success: self.success.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            lost: self.lost.load(Ordering::Relaxed),
            sessions_created: self.sessions_created.load(Ordering::Relaxed),
            active_sessions: self.active_sessions.load(Ordering::Relaxed),
            active_tier: self.tier_active[TrafficTier::Active.index()].load(Ordering::Relaxed),
            moderate_tier: self.tier_active[TrafficTier::Moderate.index()].load(Ordering::Relaxed),
            passive_tier: self.tier_active[TrafficTier::Passive.index()].load(Ordering::Relaxed),
            connection_retries: self.connection_retries.load(Ordering::Relaxed),
            failed_reconnections: self.failed_reconnections.load(Ordering::Relaxed),
            successful_reconnections: self.successful_reconnections.load(Ordering::Relaxed),
            current_stage: self.current_stage.load(Ordering::Relaxed),
            reconnecting: self.reconnecting.load(Ordering::Relaxed),
        }
    }

    pub fn latency_sample_count(&self) -> usize {
        self.latency.len()
    }

    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// Take a snapshot of the current statistics.
    pub fn snapshot(&self) -> StatsSnapshot {
        let now = Instant::now();
        StatsSnapshot {
            timestamp: now,
            elapsed: now.duration_since(self.start_time),
            counters: self.counters(),
            latency: self.latency.collect(),
            connect_setup: self.connect_setup.collect(),
            handshake: self.handshake.collect(),
            reconnection: self.reconnection.collect(),
        }
    }

    /// One progress line from the live counters. Sample lists are not
    /// touched, so this never contends with session appends.
    pub fn display_progress(&self, label: &str) {
        let c = self.counters();
        println!(
            "[{}] {:.0}s | sessions: {} active / {} created | sent: {} | recv: {} | ok: {} | err: {} | lost: {} | retries: {}",
            label,
            self.elapsed().as_secs_f64(),
            c.active_sessions,
            c.sessions_created,
            c.sent,
            c.received,
            c.success,
            c.errors,
            c.lost,
            c.connection_retries,
        );
    }
}

impl Default for MetricsAggregator {
    fn default() -> Self {
        Self::new()
    }
}

fn as_millis_f64(d: Duration) -> f64 {
    d.as_nanos() as f64 / 1_000_000.0
}

/// Calculate percentiles from a slice of durations.
/// Returns (p50, p90, p95, p99). Returns Duration::ZERO for empty input.
pub fn calculate_percentiles(latencies: &[Duration]) -> (Duration, Duration, Duration, Duration) {
    if latencies.is_empty() {
        return (
            Duration::ZERO,
            Duration::ZERO,
            Duration::ZERO,
            Duration::ZERO,
        );
    }

    let mut sorted = latencies.to_vec();
    sorted.sort();

    (
        percentile_at(&sorted, 50.0),
        percentile_at(&sorted, 90.0),
        percentile_at(&sorted, 95.0),
        percentile_at(&sorted, 99.0),
    )
}

/// Value at `pct` in a sorted slice, nearest-rank method.
pub fn percentile_at(sorted: &[Duration], pct: f64) -> Duration {
    let len = sorted.len();
    if len == 0 {
        return Duration::ZERO;
    }
    if len == 1 {
        return sorted[0];
    }
    // Nearest-rank: index = ceil(pct/100 * len) - 1
    let rank = (pct / 100.0 * len as f64).ceil() as usize;
    let idx = rank.saturating_sub(1).min(len - 1);
    sorted[idx]
}
