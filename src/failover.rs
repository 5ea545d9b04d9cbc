//! Ordered failover across a provider chain

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::config::humantime_serde;
use crate::invoker::ProviderInvoker;
use crate::provider::{GenerationRequest, ProviderId, ProviderResponse};
use crate::{Error, Result};

/// Default failover deadline
const DEFAULT_FAILOVER_TIMEOUT: Duration = Duration::from_secs(60);

/// How one attempt in a failover chain ended
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AttemptOutcome {
    /// The provider served the request
    Succeeded,
    /// Rejected without a call: circuit open
    CircuitOpen,
    /// Rejected without a call: quota exhausted
    RateLimited,
    /// Rejected without a call: provider not registered
    NotFound,
    /// The call was made and failed
    Failed {
        /// Failure description
        message: String,
    },
    /// The call succeeded after the failover deadline; its result was discarded
    DeadlineExceeded,
}

impl AttemptOutcome {
    /// Classify an invocation error
    #[must_use]
    pub fn from_error(error: &Error) -> Self {
        match error {
            Error::CircuitOpen { .. } => Self::CircuitOpen,
            Error::RateLimited { .. } => Self::RateLimited,
            Error::ProviderNotFound(_) => Self::NotFound,
            other => Self::Failed {
                message: other.to_string(),
            },
        }
    }

    /// Whether the provider was skipped without a call
    #[must_use]
    pub fn is_rejection(&self) -> bool {
        matches!(self, Self::CircuitOpen | Self::RateLimited | Self::NotFound)
    }
}

/// One step of a failover chain
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Attempt {
    /// Provider tried
    pub provider: ProviderId,
    /// Outcome
    pub outcome: AttemptOutcome,
    /// Time spent on this attempt
    #[serde(serialize_with = "humantime_serde::serialize")]
    pub elapsed: Duration,
}

/// A request served after zero or more failovers
#[derive(Debug, Clone, Serialize)]
pub struct InvocationResult {
    /// Provider that served the request
    pub provider: ProviderId,
    /// Provider response
    pub response: ProviderResponse,
    /// Total time across the chain
    #[serde(serialize_with = "humantime_serde::serialize")]
    pub elapsed: Duration,
    /// Every attempt made, in order; the last one succeeded
    pub attempts: Vec<Attempt>,
}

impl InvocationResult {
    /// Always true; failures are returned as [`Error::FailoverExhausted`]
    #[must_use]
    pub fn success(&self) -> bool {
        true
    }

    /// Whether a fallback served the request
    #[must_use]
    pub fn failed_over(&self) -> bool {
        self.attempts.len() > 1
    }
}

/// Tries a primary provider, then each fallback in order
///
/// Ordering is strict: no reordering by load or health.
pub struct FailoverOrchestrator {
    invoker: Arc<ProviderInvoker>,
    chain: Vec<ProviderId>,
    timeout: Duration,
}

impl FailoverOrchestrator {
    /// Create an orchestrator with no default chain
    pub fn new(invoker: Arc<ProviderInvoker>) -> Self {
        Self {
            invoker,
            chain: Vec::new(),
            timeout: DEFAULT_FAILOVER_TIMEOUT,
        }
    }

    /// Set the default chain used by [`Self::dispatch_default`]
    #[must_use]
    pub fn with_chain(mut self, chain: Vec<ProviderId>) -> Self {
        self.chain = chain;
        self
    }

    /// Set the default failover deadline
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Default chain
    pub fn chain(&self) -> &[ProviderId] {
        &self.chain
    }

    /// Default failover deadline
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Underlying invoker
    pub fn invoker(&self) -> &Arc<ProviderInvoker> {
        &self.invoker
    }

    /// Time source
    pub fn clock(&self) -> &Arc<dyn Clock> {
        self.invoker.clock()
    }

    /// Dispatch over the default chain and deadline
    pub async fn dispatch_default(&self, request: &GenerationRequest) -> Result<InvocationResult> {
        self.dispatch(&self.chain, request, self.timeout).await
    }

    /// Dispatch `request` over `providers`, primary first
    ///
    /// No attempt starts once `failover_timeout` has elapsed, and rate-limit
    /// waits are bounded by the time left. A success that completes after the
    /// deadline is recorded as [`AttemptOutcome::DeadlineExceeded`] and its
    /// result discarded.
    ///
    /// # Errors
    ///
    /// [`Error::FailoverExhausted`] with the full attempt chain when no
    /// provider succeeds in time; [`Error::Config`] for an empty chain.
    #[tracing::instrument(skip(self, providers, request), fields(request_id = %request.id))]
    pub async fn dispatch(
        &self,
        providers: &[ProviderId],
        request: &GenerationRequest,
        failover_timeout: Duration,
    ) -> Result<InvocationResult> {
        if providers.is_empty() {
            return Err(Error::Config("failover chain is empty".to_string()));
        }

        let clock = self.clock();
        let started = clock.now();
        let mut attempts = Vec::with_capacity(providers.len());

        for (position, provider) in providers.iter().enumerate() {
            if clock.elapsed_since(started) >= failover_timeout {
                warn!(
                    attempted = attempts.len(),
                    remaining = providers.len() - position,
                    "Failover deadline reached before trying remaining providers"
                );
                return Err(Error::FailoverExhausted {
                    attempts,
                    elapsed: clock.elapsed_since(started),
                    timed_out: true,
                });
            }

            let remaining = failover_timeout.saturating_sub(clock.elapsed_since(started));
            let attempt_started = clock.now();
            let result = self.invoker.invoke_within(provider, request, remaining).await;
            let elapsed = clock.elapsed_since(attempt_started);
            let total = clock.elapsed_since(started);

            if total > failover_timeout {
                // A late failure keeps its diagnosis; a late success is discarded
                let outcome = match &result {
                    Ok(_) => AttemptOutcome::DeadlineExceeded,
                    Err(e) => AttemptOutcome::from_error(e),
                };
                warn!(provider = %provider, "Attempt finished after failover deadline, discarding result");
                attempts.push(Attempt {
                    provider: provider.clone(),
                    outcome,
                    elapsed,
                });
                return Err(Error::FailoverExhausted {
                    attempts,
                    elapsed: total,
                    timed_out: true,
                });
            }

            match result {
                Ok(invocation) => {
                    attempts.push(Attempt {
                        provider: provider.clone(),
                        outcome: AttemptOutcome::Succeeded,
                        elapsed,
                    });
                    if position > 0 {
                        info!(
                            provider = %provider,
                            failovers = position,
                            "Request served by fallback provider"
                        );
                    }
                    return Ok(InvocationResult {
                        provider: invocation.provider,
                        response: invocation.response,
                        elapsed: total,
                        attempts,
                    });
                }
                Err(e) => {
                    let outcome = AttemptOutcome::from_error(&e);
                    if outcome.is_rejection() {
                        debug!(provider = %provider, reason = %e, "Provider skipped");
                    } else {
                        warn!(provider = %provider, error = %e, "Provider attempt failed");
                    }
                    attempts.push(Attempt {
                        provider: provider.clone(),
                        outcome,
                        elapsed,
                    });
                }
            }
        }

        let elapsed = clock.elapsed_since(started);
        warn!(attempts = attempts.len(), "All providers failed");
        Err(Error::FailoverExhausted {
            attempts,
            elapsed,
            timed_out: false,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outcome_from_error() {
        let provider = ProviderId::from("openai");
        assert_eq!(
            AttemptOutcome::from_error(&Error::CircuitOpen {
                provider: provider.clone(),
                retry_in: Duration::from_secs(1),
            }),
            AttemptOutcome::CircuitOpen
        );
        assert_eq!(
            AttemptOutcome::from_error(&Error::ProviderNotFound(provider.clone())),
            AttemptOutcome::NotFound
        );

        let failed = AttemptOutcome::from_error(&Error::provider(&provider, "boom"));
        assert!(!failed.is_rejection());
        assert!(matches!(failed, AttemptOutcome::Failed { message } if message.contains("boom")));
    }

    #[test]
    fn test_attempt_serializes_with_kind_tag() {
        let attempt = Attempt {
            provider: ProviderId::from("anthropic"),
            outcome: AttemptOutcome::RateLimited,
            elapsed: Duration::from_millis(5),
        };
        let json = serde_json::to_value(&attempt).unwrap();
        assert_eq!(json["provider"], "anthropic");
        assert_eq!(json["outcome"]["kind"], "rate_limited");
        assert_eq!(json["elapsed"], "5ms");
    }
}
