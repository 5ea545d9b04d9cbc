//! Single gated call to a single provider

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::clock::Clock;
use crate::config::{RateLimitMode, RateLimitPolicyConfig};
use crate::failsafe::Failsafe;
use crate::provider::{GenerationRequest, ProviderId, ProviderRegistry, ProviderResponse};
use crate::{Error, Result};

/// What to do when a provider's quota is exhausted
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RateLimitPolicy {
    /// Reject with [`Error::RateLimited`] immediately
    #[default]
    FailFast,
    /// Sleep until admitted, giving up once the cumulative wait would exceed `max_wait`
    Wait {
        /// Longest cumulative wait
        max_wait: Duration,
    },
}

impl From<RateLimitPolicyConfig> for RateLimitPolicy {
    fn from(config: RateLimitPolicyConfig) -> Self {
        match config.mode {
            RateLimitMode::FailFast => Self::FailFast,
            RateLimitMode::Wait => Self::Wait {
                max_wait: config.max_wait,
            },
        }
    }
}

/// A successful provider call
#[derive(Debug, Clone)]
pub struct Invocation {
    /// Provider that served the call
    pub provider: ProviderId,
    /// Provider response
    pub response: ProviderResponse,
    /// Time spent in the provider call
    pub elapsed: Duration,
    /// Time spent waiting for rate-limit admission
    pub waited: Duration,
}

/// Combines circuit breaking and rate limiting around one provider call
///
/// The invoker never retries; a failed call is reported upward at once.
pub struct ProviderInvoker {
    registry: Arc<ProviderRegistry>,
    failsafe: Failsafe,
    policy: RateLimitPolicy,
}

impl ProviderInvoker {
    /// Create an invoker that fails fast on exhausted quotas
    pub fn new(registry: Arc<ProviderRegistry>, failsafe: Failsafe) -> Self {
        Self {
            registry,
            failsafe,
            policy: RateLimitPolicy::FailFast,
        }
    }

    /// Set the rate limit policy
    #[must_use]
    pub fn with_policy(mut self, policy: RateLimitPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Current rate limit policy
    pub fn policy(&self) -> RateLimitPolicy {
        self.policy
    }

    /// Shared failsafe state
    pub fn failsafe(&self) -> &Failsafe {
        &self.failsafe
    }

    /// Provider registry
    pub fn registry(&self) -> &Arc<ProviderRegistry> {
        &self.registry
    }

    /// Time source
    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.failsafe.clock
    }

    /// Call one provider
    ///
    /// An open circuit rejects before the rate limiter is consulted, so a
    /// rejected call never consumes quota.
    ///
    /// # Errors
    ///
    /// - [`Error::ProviderNotFound`] for an unregistered provider
    /// - [`Error::CircuitOpen`] when the breaker rejects the call
    /// - [`Error::RateLimited`] when the quota is exhausted under the policy
    /// - whatever the provider call returns on failure
    pub async fn invoke(
        &self,
        provider: &ProviderId,
        request: &GenerationRequest,
    ) -> Result<Invocation> {
        self.invoke_within(provider, request, Duration::MAX).await
    }

    /// Call one provider, giving up on rate-limit admission once `budget` is spent
    ///
    /// A wait that would leave no time for the call itself is rejected
    /// instead of slept, so no quota is consumed past the budget.
    ///
    /// # Errors
    ///
    /// As [`Self::invoke`]; [`Error::RateLimited`] also when admission
    /// cannot happen within `budget`.
    #[tracing::instrument(
        skip(self, provider, request),
        fields(provider = %provider, request_id = %request.id)
    )]
    pub async fn invoke_within(
        &self,
        provider: &ProviderId,
        request: &GenerationRequest,
        budget: Duration,
    ) -> Result<Invocation> {
        let target = self
            .registry
            .get(provider)
            .ok_or_else(|| Error::ProviderNotFound(provider.clone()))?;

        let permit = self.failsafe.circuit_breaker.try_acquire(provider)?;
        // Dropping the permit on rejection frees a half-open trial slot
        let waited = self.admit(provider, request.estimated_tokens, budget).await?;

        let clock = &self.failsafe.clock;
        let started = clock.now();
        let result = target.generate(request).await;
        let elapsed = clock.elapsed_since(started);

        match result {
            Ok(response) => {
                permit.success();
                self.failsafe.health_tracker.record_success(provider, elapsed);
                debug!(latency_ms = elapsed.as_millis(), "Provider call succeeded");
                Ok(Invocation {
                    provider: provider.clone(),
                    response,
                    elapsed,
                    waited,
                })
            }
            Err(e) => {
                permit.failure();
                self.failsafe.health_tracker.record_failure(provider);
                warn!(error = %e, latency_ms = elapsed.as_millis(), "Provider call failed");
                Err(e)
            }
        }
    }

    /// Acquire rate-limit admission, returning the time spent waiting
    async fn admit(&self, provider: &ProviderId, tokens: u64, budget: Duration) -> Result<Duration> {
        let mut waited = Duration::ZERO;
        loop {
            let wait = match self.failsafe.rate_limiter.try_acquire(provider, tokens) {
                Ok(()) => return Ok(waited),
                Err(wait) => wait,
            };

            match self.policy {
                RateLimitPolicy::FailFast => {
                    return Err(Error::RateLimited {
                        provider: provider.clone(),
                        retry_after: wait,
                    });
                }
                RateLimitPolicy::Wait { max_wait } => {
                    let total = waited.saturating_add(wait);
                    if total > max_wait || total >= budget {
                        debug!(
                            wait_ms = wait.as_millis(),
                            waited_ms = waited.as_millis(),
                            budget_ms = budget.as_millis(),
                            "Rate limit wait would exceed budget"
                        );
                        return Err(Error::RateLimited {
                            provider: provider.clone(),
                            retry_after: wait,
                        });
                    }
                    debug!(wait_ms = wait.as_millis(), "Waiting for rate limit window");
                    self.failsafe.clock.sleep(wait).await;
                    waited += wait;
                }
            }
        }
    }
}
