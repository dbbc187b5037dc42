use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Ring buffer capacity for latency samples
const RING_BUFFER_CAPACITY: usize = 1024;

/// Maximum age for samples (15 minutes)
const MAX_SAMPLE_AGE: Duration = Duration::from_secs(15 * 60);

/// Per-endpoint-family statistics
#[derive(Debug)]
pub struct FamilyStats {
    pub request_count: AtomicU64,
    pub total_latency_ms: AtomicU64,
}

impl FamilyStats {
    pub fn new() -> Self {
        Self {
            request_count: AtomicU64::new(0),
            total_latency_ms: AtomicU64::new(0),
        }
    }

    pub fn record_request(&self, latency_ms: f64) {
        self.request_count.fetch_add(1, Ordering::Relaxed);
        self.total_latency_ms
            .fetch_add(latency_ms as u64, Ordering::Relaxed);
    }

    /// Get average latency in milliseconds
    pub fn avg_latency_ms(&self) -> f64 {
        let count = self.request_count.load(Ordering::Relaxed);
        if count == 0 {
            return 0.0;
        }
        let total = self.total_latency_ms.load(Ordering::Relaxed);
        total as f64 / count as f64
    }
}

impl Default for FamilyStats {
    fn default() -> Self {
        Self::new()
    }
}

/// Counters for the request pipeline
pub struct ClientMetrics {
    /// Requests that reached the network (retries included)
    network_requests: AtomicU64,

    /// Fresh cache hits
    cache_hits: AtomicU64,

    /// Stale values served while revalidating
    stale_hits: AtomicU64,

    /// Lookups that had to fetch
    cache_misses: AtomicU64,

    /// Callers that joined an in-flight fetch
    coalesced: AtomicU64,

    /// 401-triggered refreshes
    token_refreshes: AtomicU64,

    /// Refreshes that ended the session
    refresh_failures: AtomicU64,

    /// List reads downgraded to an empty envelope
    degraded_lists: AtomicU64,

    /// Lifetime total error count
    total_errors: AtomicU64,

    /// Errors keyed by kind
    errors_by_kind: DashMap<String, AtomicU64>,

    /// Latency samples (time, latency_ms) - ring buffer
    latency_samples: Mutex<VecDeque<(Instant, f64)>>,

    /// Per-family statistics
    per_family_stats: DashMap<String, FamilyStats>,
}

/// Point-in-time copy of the counters
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub captured_at: DateTime<Utc>,
    pub network_requests: u64,
    pub cache_hits: u64,
    pub stale_hits: u64,
    pub cache_misses: u64,
    pub coalesced: u64,
    pub token_refreshes: u64,
    pub refresh_failures: u64,
    pub degraded_lists: u64,
    pub total_errors: u64,
    pub errors_by_kind: BTreeMap<String, u64>,
    pub latency_p50_ms: f64,
    pub latency_p95_ms: f64,
    pub latency_p99_ms: f64,
    /// Average dispatch latency per family
    pub family_latency_ms: BTreeMap<String, f64>,
}

impl ClientMetrics {
    pub fn new() -> Self {
        Self {
            network_requests: AtomicU64::new(0),
            cache_hits: AtomicU64::new(0),
            stale_hits: AtomicU64::new(0),
            cache_misses: AtomicU64::new(0),
            coalesced: AtomicU64::new(0),
            token_refreshes: AtomicU64::new(0),
            refresh_failures: AtomicU64::new(0),
            degraded_lists: AtomicU64::new(0),
            total_errors: AtomicU64::new(0),
            errors_by_kind: DashMap::new(),
            latency_samples: Mutex::new(VecDeque::with_capacity(RING_BUFFER_CAPACITY)),
            per_family_stats: DashMap::new(),
        }
    }

    pub fn record_network_request(&self) {
        self.network_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cache_hit(&self) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_stale_hit(&self) {
        self.stale_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cache_miss(&self) {
        self.cache_misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_coalesced(&self) {
        self.coalesced.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_token_refresh(&self) {
        self.token_refreshes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_refresh_failure(&self) {
        self.refresh_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_degraded_list(&self) {
        self.degraded_lists.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a completed dispatch
    pub fn record_request_end(&self, latency_ms: f64, family: &str) {
        if let Ok(mut samples) = self.latency_samples.lock() {
            if samples.len() >= RING_BUFFER_CAPACITY {
                samples.pop_front();
            }
            samples.push_back((Instant::now(), latency_ms));
        }

        self.per_family_stats
            .entry(family.to_string())
            .or_default()
            .record_request(latency_ms);
    }

    /// Record an error
    pub fn record_error(&self, kind: &str) {
        self.total_errors.fetch_add(1, Ordering::Relaxed);

        self.errors_by_kind
            .entry(kind.to_string())
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn network_requests(&self) -> u64 {
        self.network_requests.load(Ordering::Relaxed)
    }

    pub fn cache_hits(&self) -> u64 {
        self.cache_hits.load(Ordering::Relaxed)
    }

    pub fn stale_hits(&self) -> u64 {
        self.stale_hits.load(Ordering::Relaxed)
    }

    pub fn coalesced(&self) -> u64 {
        self.coalesced.load(Ordering::Relaxed)
    }

    pub fn token_refreshes(&self) -> u64 {
        self.token_refreshes.load(Ordering::Relaxed)
    }

    pub fn degraded_lists(&self) -> u64 {
        self.degraded_lists.load(Ordering::Relaxed)
    }

    /// Get latency percentiles (p50, p95, p99)
    pub fn get_latency_percentiles(&self) -> (f64, f64, f64) {
        let samples = match self.latency_samples.lock() {
            Ok(s) => s,
            Err(_) => return (0.0, 0.0, 0.0),
        };

        if samples.is_empty() {
            return (0.0, 0.0, 0.0);
        }

        let mut latencies: Vec<f64> = samples.iter().map(|(_, lat)| *lat).collect();
        latencies.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

        let len = latencies.len();
        let p50_idx = (len as f64 * 0.50) as usize;
        let p95_idx = (len as f64 * 0.95) as usize;
        let p99_idx = (len as f64 * 0.99) as usize;

        let p50 = latencies.get(p50_idx.min(len - 1)).copied().unwrap_or(0.0);
        let p95 = latencies.get(p95_idx.min(len - 1)).copied().unwrap_or(0.0);
        let p99 = latencies.get(p99_idx.min(len - 1)).copied().unwrap_or(0.0);

        (p50, p95, p99)
    }

    /// Average latency per family
    pub fn get_family_latencies(&self) -> Vec<(String, f64)> {
        self.per_family_stats
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().avg_latency_ms()))
            .collect()
    }

    /// Clean up old samples (older than 15 minutes)
    pub fn cleanup_old_samples(&self) {
        let Some(cutoff) = Instant::now().checked_sub(MAX_SAMPLE_AGE) else {
            return;
        };

        if let Ok(mut samples) = self.latency_samples.lock() {
            samples.retain(|(time, _)| *time >= cutoff);
        }
    }

    /// Point-in-time copy; samples older than 15 minutes are dropped first
    pub fn snapshot(&self) -> MetricsSnapshot {
        self.cleanup_old_samples();
        let (p50, p95, p99) = self.get_latency_percentiles();

        MetricsSnapshot {
            captured_at: Utc::now(),
            network_requests: self.network_requests(),
            cache_hits: self.cache_hits(),
            stale_hits: self.stale_hits(),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
            coalesced: self.coalesced(),
            token_refreshes: self.token_refreshes(),
            refresh_failures: self.refresh_failures.load(Ordering::Relaxed),
            degraded_lists: self.degraded_lists(),
            total_errors: self.total_errors.load(Ordering::Relaxed),
            errors_by_kind: self
                .errors_by_kind
                .iter()
                .map(|entry| (entry.key().clone(), entry.value().load(Ordering::Relaxed)))
                .collect(),
            latency_p50_ms: p50,
            latency_p95_ms: p95,
            latency_p99_ms: p99,
            family_latency_ms: self.get_family_latencies().into_iter().collect(),
        }
    }
}

impl Default for ClientMetrics {
    fn default() -> Self {
        Self::new()
    }
}
