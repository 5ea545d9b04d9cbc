//! Fixed-window rate limiting per provider
//!
//! Each configured quota (requests per minute, requests per hour, tokens per
//! minute) is tracked in its own fixed window. A window rolls over, resetting
//! its counter and start time, on the first check or record at or after
//! `start + length`. A request is admissible only when every window has room.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, trace};

use crate::clock::Clock;
use crate::provider::ProviderId;

const MINUTE: Duration = Duration::from_secs(60);
const HOUR: Duration = Duration::from_secs(3600);

/// Quotas for one provider (0 = unlimited on that dimension)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RateLimits {
    /// Requests per minute
    pub requests_per_minute: u32,
    /// Requests per hour
    pub requests_per_hour: u32,
    /// Estimated tokens per minute
    pub tokens_per_minute: u64,
}

impl RateLimits {
    /// Only a per-minute request quota
    #[must_use]
    pub fn per_minute(requests: u32) -> Self {
        Self {
            requests_per_minute: requests,
            ..Self::default()
        }
    }

    /// Add a per-hour request quota
    #[must_use]
    pub fn with_hourly(mut self, requests: u32) -> Self {
        self.requests_per_hour = requests;
        self
    }

    /// Add a per-minute token quota
    #[must_use]
    pub fn with_tokens_per_minute(mut self, tokens: u64) -> Self {
        self.tokens_per_minute = tokens;
        self
    }

    /// Whether no quota is configured
    #[must_use]
    pub fn is_unlimited(&self) -> bool {
        self.requests_per_minute == 0 && self.requests_per_hour == 0 && self.tokens_per_minute == 0
    }
}

/// Usage snapshot for one provider
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RateLimitUsage {
    /// Configured quotas
    pub limits: RateLimits,
    /// Requests counted in the current minute window
    pub requests_this_minute: u64,
    /// Requests counted in the current hour window
    pub requests_this_hour: u64,
    /// Tokens counted in the current token window
    pub tokens_this_minute: u64,
}

#[derive(Debug)]
struct FixedWindow {
    length: Duration,
    limit: u64,
    start: Instant,
    used: u64,
}

impl FixedWindow {
    fn new(length: Duration, limit: u64, now: Instant) -> Option<Self> {
        (limit > 0).then_some(Self {
            length,
            limit,
            start: now,
            used: 0,
        })
    }

    fn roll(&mut self, now: Instant) {
        if now.saturating_duration_since(self.start) >= self.length {
            self.start = now;
            self.used = 0;
        }
    }

    fn has_room(&self, amount: u64) -> bool {
        self.used.saturating_add(amount) <= self.limit
    }

    fn remaining(&self, now: Instant) -> Duration {
        (self.start + self.length).saturating_duration_since(now)
    }
}

#[derive(Debug)]
struct ProviderWindows {
    limits: RateLimits,
    minute: Option<FixedWindow>,
    hour: Option<FixedWindow>,
    tokens: Option<FixedWindow>,
}

impl ProviderWindows {
    fn new(limits: RateLimits, now: Instant) -> Self {
        Self {
            limits,
            minute: FixedWindow::new(MINUTE, u64::from(limits.requests_per_minute), now),
            hour: FixedWindow::new(HOUR, u64::from(limits.requests_per_hour), now),
            tokens: FixedWindow::new(MINUTE, limits.tokens_per_minute, now),
        }
    }

    /// Apply new limits, keeping counters of dimensions that stay configured
    fn reconfigure(&mut self, limits: RateLimits, now: Instant) {
        fn update(slot: &mut Option<FixedWindow>, length: Duration, limit: u64, now: Instant) {
            match slot {
                Some(window) if limit > 0 => window.limit = limit,
                _ => *slot = FixedWindow::new(length, limit, now),
            }
        }

        self.limits = limits;
        update(&mut self.minute, MINUTE, u64::from(limits.requests_per_minute), now);
        update(&mut self.hour, HOUR, u64::from(limits.requests_per_hour), now);
        update(&mut self.tokens, MINUTE, limits.tokens_per_minute, now);
    }

    fn windows_mut(&mut self) -> impl Iterator<Item = &mut FixedWindow> {
        [&mut self.minute, &mut self.hour, &mut self.tokens]
            .into_iter()
            .flatten()
    }

    /// Wait until one request with `tokens` would be admitted; zero when admissible now
    fn wait_for(&mut self, now: Instant, tokens: u64) -> Duration {
        for window in self.windows_mut() {
            window.roll(now);
        }

        let mut wait = Duration::ZERO;
        for window in [&self.minute, &self.hour].into_iter().flatten() {
            if !window.has_room(1) {
                wait = wait.max(window.remaining(now));
            }
        }

        // Zero tokens never block; an oversized estimate only fits an empty window
        if tokens > 0
            && let Some(window) = &self.tokens
            && window.used > 0
            && !window.has_room(tokens)
        {
            wait = wait.max(window.remaining(now));
        }

        wait
    }

    fn record(&mut self, now: Instant, tokens: u64) {
        for window in self.windows_mut() {
            window.roll(now);
        }
        for window in [&mut self.minute, &mut self.hour].into_iter().flatten() {
            window.used = window.used.saturating_add(1);
        }
        if let Some(window) = &mut self.tokens {
            window.used = window.used.saturating_add(tokens);
        }
    }

    fn reset(&mut self, now: Instant) {
        *self = Self::new(self.limits, now);
    }

    fn usage(&mut self, now: Instant) -> RateLimitUsage {
        for window in self.windows_mut() {
            window.roll(now);
        }
        RateLimitUsage {
            limits: self.limits,
            requests_this_minute: self.minute.as_ref().map_or(0, |w| w.used),
            requests_this_hour: self.hour.as_ref().map_or(0, |w| w.used),
            tokens_this_minute: self.tokens.as_ref().map_or(0, |w| w.used),
        }
    }
}

/// Per-provider admission controller
pub struct RateLimiter {
    clock: Arc<dyn Clock>,
    windows: DashMap<ProviderId, Arc<Mutex<ProviderWindows>>>,
}

impl RateLimiter {
    /// Create a rate limiter with no configured providers
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            windows: DashMap::new(),
        }
    }

    // The map guard is dropped before the entry mutex is locked.
    fn entry(&self, provider: &ProviderId) -> Option<Arc<Mutex<ProviderWindows>>> {
        self.windows.get(provider).map(|e| Arc::clone(e.value()))
    }

    /// Set or overwrite the quotas for a provider
    pub fn configure_limits(&self, provider: &ProviderId, limits: RateLimits) {
        let now = self.clock.now();
        if limits.is_unlimited() {
            self.windows.remove(provider);
        } else {
            let entry = Arc::clone(
                self.windows
                    .entry(provider.clone())
                    .or_insert_with(|| Arc::new(Mutex::new(ProviderWindows::new(limits, now))))
                    .value(),
            );
            // Keeps counts an existing entry already holds
            entry.lock().reconfigure(limits, now);
        }
        debug!(
            provider = %provider,
            rpm = limits.requests_per_minute,
            rph = limits.requests_per_hour,
            tpm = limits.tokens_per_minute,
            "Configured rate limits"
        );
    }

    /// Configured quotas for a provider
    #[must_use]
    pub fn limits(&self, provider: &ProviderId) -> Option<RateLimits> {
        self.entry(provider).map(|e| e.lock().limits)
    }

    /// Whether one more request (with `estimated_tokens`) fits every window
    pub fn can_make_request(&self, provider: &ProviderId, estimated_tokens: u64) -> bool {
        self.time_until_admitted(provider, estimated_tokens).is_zero()
    }

    /// Count one request against the provider's windows
    ///
    /// Recording a request that was not admitted is accepted silently; the
    /// counters then exceed the limit until the window rolls over.
    pub fn record_request(&self, provider: &ProviderId, tokens: u64) {
        if let Some(entry) = self.entry(provider) {
            entry.lock().record(self.clock.now(), tokens);
        }
    }

    /// Time until the next request is admitted; zero when admissible now
    ///
    /// When several windows are exhausted the longest wait wins.
    pub fn time_until_next_request(&self, provider: &ProviderId) -> Duration {
        self.time_until_admitted(provider, 0)
    }

    /// Token-aware variant of [`Self::time_until_next_request`]
    pub fn time_until_admitted(&self, provider: &ProviderId, estimated_tokens: u64) -> Duration {
        match self.entry(provider) {
            Some(entry) => entry.lock().wait_for(self.clock.now(), estimated_tokens),
            None => Duration::ZERO,
        }
    }

    /// Atomically check and record one request
    ///
    /// Returns the required wait when the request is not admitted. This is
    /// the admission path for concurrent callers: the check and the increment
    /// happen under the same per-provider lock.
    pub fn try_acquire(&self, provider: &ProviderId, tokens: u64) -> Result<(), Duration> {
        let Some(entry) = self.entry(provider) else {
            return Ok(());
        };

        let now = self.clock.now();
        let mut windows = entry.lock();
        let wait = windows.wait_for(now, tokens);
        if wait.is_zero() {
            windows.record(now, tokens);
            trace!(provider = %provider, tokens, "Request admitted");
            Ok(())
        } else {
            debug!(
                provider = %provider,
                wait_ms = u64::try_from(wait.as_millis()).unwrap_or(u64::MAX),
                "Request rejected by rate limiter"
            );
            Err(wait)
        }
    }

    /// Current usage for a provider
    #[must_use]
    pub fn usage(&self, provider: &ProviderId) -> Option<RateLimitUsage> {
        self.entry(provider)
            .map(|e| e.lock().usage(self.clock.now()))
    }

    /// Clear counters for a provider, keeping its limits
    pub fn reset(&self, provider: &ProviderId) {
        if let Some(entry) = self.entry(provider) {
            entry.lock().reset(self.clock.now());
        }
    }

    /// Clear counters for every provider
    pub fn reset_all(&self) {
        let now = self.clock.now();
        for entry in &self.windows {
            entry.value().lock().reset(now);
        }
    }
}
