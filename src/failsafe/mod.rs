//! Failsafe mechanisms: circuit breaker, rate limiting, health tracking

mod circuit_breaker;
mod health;
mod rate_limiter;

pub use circuit_breaker::{CallPermit, CircuitBreaker, CircuitState, CircuitStats};
pub use health::{HealthMetrics, HealthTracker};
pub(crate) use health::LatencyHistogram;
pub use rate_limiter::{RateLimitUsage, RateLimiter, RateLimits};

use std::sync::Arc;

use crate::clock::Clock;
use crate::config::Config;
use crate::provider::ProviderId;

/// Shared per-provider failsafe state
///
/// Every component holding a clone sees the same breakers, windows and
/// health counters.
#[derive(Clone)]
pub struct Failsafe {
    /// Circuit breakers
    pub circuit_breaker: Arc<CircuitBreaker>,
    /// Rate limiter
    pub rate_limiter: Arc<RateLimiter>,
    /// Health tracker
    pub health_tracker: Arc<HealthTracker>,
    /// Time source shared by all of the above
    pub clock: Arc<dyn Clock>,
}

impl Failsafe {
    /// Create failsafe state with default breaker settings and no quotas
    pub fn new(config: crate::config::CircuitBreakerConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            circuit_breaker: Arc::new(CircuitBreaker::new(config, Arc::clone(&clock))),
            rate_limiter: Arc::new(RateLimiter::new(Arc::clone(&clock))),
            health_tracker: Arc::new(HealthTracker::new()),
            clock,
        }
    }

    /// Create failsafe state from configuration, applying every enabled
    /// provider's quotas and breaker override
    pub fn from_config(config: &Config, clock: Arc<dyn Clock>) -> Self {
        let failsafe = Self::new(config.circuit_breaker, clock);
        for (id, provider) in config.enabled_providers() {
            if provider.rate_limit.is_limited() {
                failsafe
                    .rate_limiter
                    .configure_limits(id, provider.rate_limit.into());
            }
            if let Some(cb) = provider.circuit_breaker {
                failsafe.circuit_breaker.configure(id, cb);
            }
        }
        failsafe
    }

    /// Reset breaker, quota counters and health for one provider
    pub fn reset(&self, provider: &ProviderId) {
        self.circuit_breaker.reset(provider);
        self.rate_limiter.reset(provider);
        self.health_tracker.reset(provider);
    }

    /// Reset all per-provider state
    pub fn reset_all(&self) {
        self.circuit_breaker.reset_all();
        self.rate_limiter.reset_all();
        self.health_tracker.reset_all();
    }
}
