//! Provider health tracking with latency metrics
//!
//! Tracks per-provider health metrics including:
//! - Success/failure counts
//! - Call latency percentiles (p50, p95, p99)
//! - Last success/failure timestamps
//! - Overall health status

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use dashmap::DashMap;
use parking_lot::RwLock;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::provider::ProviderId;

/// Default capacity for latency histogram
const DEFAULT_HISTOGRAM_CAPACITY: usize = 1000;

/// Consecutive failures before a provider is reported unhealthy
const UNHEALTHY_AFTER: u64 = 3;

fn epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or_default()
}

fn as_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Health of a single provider
struct ProviderHealth {
    healthy: AtomicBool,
    success_count: AtomicU64,
    failure_count: AtomicU64,
    consecutive_failures: AtomicU64,
    last_success: AtomicU64,
    last_failure: AtomicU64,
    latencies: RwLock<LatencyHistogram>,
}

impl ProviderHealth {
    fn new() -> Self {
        Self {
            healthy: AtomicBool::new(true),
            success_count: AtomicU64::new(0),
            failure_count: AtomicU64::new(0),
            consecutive_failures: AtomicU64::new(0),
            last_success: AtomicU64::new(0),
            last_failure: AtomicU64::new(0),
            latencies: RwLock::new(LatencyHistogram::new(DEFAULT_HISTOGRAM_CAPACITY)),
        }
    }
}

/// Per-provider health tracker
#[derive(Default)]
pub struct HealthTracker {
    providers: DashMap<ProviderId, Arc<ProviderHealth>>,
}

impl HealthTracker {
    /// Create an empty tracker
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn entry(&self, provider: &ProviderId) -> Arc<ProviderHealth> {
        if let Some(entry) = self.providers.get(provider) {
            return Arc::clone(entry.value());
        }
        Arc::clone(
            self.providers
                .entry(provider.clone())
                .or_insert_with(|| Arc::new(ProviderHealth::new()))
                .value(),
        )
    }

    /// Record a successful call
    pub fn record_success(&self, provider: &ProviderId, latency: Duration) {
        let health = self.entry(provider);
        health.success_count.fetch_add(1, Ordering::Relaxed);
        health.consecutive_failures.store(0, Ordering::Relaxed);
        health.last_success.store(epoch_millis(), Ordering::Relaxed);
        health.latencies.write().record(latency);

        if !health.healthy.swap(true, Ordering::Relaxed) {
            info!(provider = %provider, "Provider recovered");
        }
    }

    /// Record a failed call
    pub fn record_failure(&self, provider: &ProviderId) {
        let health = self.entry(provider);
        health.failure_count.fetch_add(1, Ordering::Relaxed);
        let consecutive = health.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
        health.last_failure.store(epoch_millis(), Ordering::Relaxed);

        if consecutive >= UNHEALTHY_AFTER && health.healthy.swap(false, Ordering::Relaxed) {
            warn!(
                provider = %provider,
                consecutive_failures = consecutive,
                "Provider marked unhealthy"
            );
        }
    }

    /// Whether a provider is currently healthy (unknown providers are)
    #[must_use]
    pub fn is_healthy(&self, provider: &ProviderId) -> bool {
        self.providers
            .get(provider)
            .is_none_or(|h| h.healthy.load(Ordering::Relaxed))
    }

    /// Current metrics for a provider
    #[must_use]
    pub fn metrics(&self, provider: &ProviderId) -> HealthMetrics {
        let health = self.entry(provider);
        let latencies = health.latencies.read();

        HealthMetrics {
            provider: provider.clone(),
            healthy: health.healthy.load(Ordering::Relaxed),
            success_count: health.success_count.load(Ordering::Relaxed),
            failure_count: health.failure_count.load(Ordering::Relaxed),
            consecutive_failures: health.consecutive_failures.load(Ordering::Relaxed),
            last_success_ms: health.last_success.load(Ordering::Relaxed),
            last_failure_ms: health.last_failure.load(Ordering::Relaxed),
            latency_p50_ms: latencies.percentile(0.50).map(as_millis),
            latency_p95_ms: latencies.percentile(0.95).map(as_millis),
            latency_p99_ms: latencies.percentile(0.99).map(as_millis),
        }
    }

    /// Metrics for every provider seen so far, sorted by provider
    #[must_use]
    pub fn all_metrics(&self) -> Vec<HealthMetrics> {
        let mut ids: Vec<ProviderId> = self.providers.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids.iter().map(|id| self.metrics(id)).collect()
    }

    /// Reset metrics for a provider
    pub fn reset(&self, provider: &ProviderId) {
        self.providers.remove(provider);
        debug!(provider = %provider, "Health metrics reset");
    }

    /// Reset metrics for every provider
    pub fn reset_all(&self) {
        self.providers.clear();
    }
}

/// Health metrics snapshot
#[derive(Debug, Clone, Serialize)]
pub struct HealthMetrics {
    /// Provider
    pub provider: ProviderId,
    /// Current health status
    pub healthy: bool,
    /// Total successful calls
    pub success_count: u64,
    /// Total failed calls
    pub failure_count: u64,
    /// Consecutive failures
    pub consecutive_failures: u64,
    /// Last success timestamp (millis since epoch)
    pub last_success_ms: u64,
    /// Last failure timestamp (millis since epoch)
    pub last_failure_ms: u64,
    /// 50th percentile latency (milliseconds)
    pub latency_p50_ms: Option<u64>,
    /// 95th percentile latency (milliseconds)
    pub latency_p95_ms: Option<u64>,
    /// 99th percentile latency (milliseconds)
    pub latency_p99_ms: Option<u64>,
}

/// Bounded latency sample buffer for percentile calculation
#[derive(Debug, Clone)]
pub(crate) struct LatencyHistogram {
    samples: VecDeque<Duration>,
    capacity: usize,
}

impl LatencyHistogram {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            samples: VecDeque::with_capacity(capacity.min(DEFAULT_HISTOGRAM_CAPACITY)),
            capacity,
        }
    }

    /// Record a sample, evicting the oldest when full
    pub(crate) fn record(&mut self, latency: Duration) {
        if self.samples.len() >= self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(latency);
    }

    /// Nearest-rank percentile (0.0 to 1.0)
    pub(crate) fn percentile(&self, p: f64) -> Option<Duration> {
        if self.samples.is_empty() {
            return None;
        }

        let mut sorted: Vec<Duration> = self.samples.iter().copied().collect();
        sorted.sort_unstable();

        #[allow(
            clippy::cast_precision_loss,
            clippy::cast_possible_truncation,
            clippy::cast_sign_loss
        )]
        let index = ((sorted.len() as f64) * p).floor() as usize;
        Some(sorted[index.min(sorted.len() - 1)])
    }

    /// Mean of the retained samples
    pub(crate) fn mean(&self) -> Option<Duration> {
        if self.samples.is_empty() {
            return None;
        }
        let total: Duration = self.samples.iter().sum();
        let count = u32::try_from(self.samples.len()).unwrap_or(u32::MAX);
        Some(total / count)
    }
}
