//! Relay assembly: configuration to a ready dispatch pipeline

use std::sync::Arc;

use serde::Serialize;
use tracing::info;

use crate::Result;
use crate::clock::{Clock, SystemClock};
use crate::config::Config;
use crate::dispatch::{DispatchPool, DispatchReport, DispatchRequest};
use crate::failover::{FailoverOrchestrator, InvocationResult};
use crate::failsafe::{CircuitStats, Failsafe, HealthMetrics, RateLimitUsage};
use crate::invoker::{ProviderInvoker, RateLimitPolicy};
use crate::provider::{GenerationRequest, HttpProvider, Provider, ProviderId, ProviderRegistry};

/// Point-in-time view of one provider's failsafe state
#[derive(Debug, Clone, Serialize)]
pub struct ProviderStatus {
    /// Provider
    pub provider: ProviderId,
    /// Breaker state
    pub circuit: CircuitStats,
    /// Quota usage, `None` when unlimited
    pub rate_limit: Option<RateLimitUsage>,
    /// Call health
    pub health: HealthMetrics,
}

/// The assembled relay
pub struct Relay {
    config: Config,
    registry: Arc<ProviderRegistry>,
    failsafe: Failsafe,
    orchestrator: Arc<FailoverOrchestrator>,
    pool: DispatchPool,
}

impl Relay {
    /// Build a relay on the system clock
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or an HTTP provider
    /// cannot be built.
    pub fn from_config(config: Config) -> Result<Self> {
        Self::with_clock(config, SystemClock::shared())
    }

    /// Build a relay with an explicit time source
    ///
    /// # Errors
    ///
    /// Same as [`Self::from_config`].
    pub fn with_clock(config: Config, clock: Arc<dyn Clock>) -> Result<Self> {
        config.validate()?;

        let registry = Arc::new(ProviderRegistry::new());
        for (id, provider) in config.enabled_providers() {
            registry.register(Arc::new(HttpProvider::new(id.clone(), provider)?));
        }

        let failsafe = Failsafe::from_config(&config, clock);
        let invoker = ProviderInvoker::new(Arc::clone(&registry), failsafe.clone())
            .with_policy(RateLimitPolicy::from(config.rate_limit_policy));
        let orchestrator = Arc::new(
            FailoverOrchestrator::new(Arc::new(invoker))
                .with_chain(config.failover_chain())
                .with_timeout(config.failover.timeout),
        );
        let pool = DispatchPool::new(Arc::clone(&orchestrator));

        info!(
            providers = registry.len(),
            chain = ?orchestrator.chain(),
            "Relay ready"
        );

        Ok(Self {
            config,
            registry,
            failsafe,
            orchestrator,
            pool,
        })
    }

    /// Register an additional provider, replacing any with the same id
    pub fn register(&self, provider: Arc<dyn Provider>) {
        self.registry.register(provider);
    }

    /// Dispatch one request over the configured chain
    ///
    /// # Errors
    ///
    /// See [`FailoverOrchestrator::dispatch`].
    pub async fn dispatch(&self, request: &GenerationRequest) -> Result<InvocationResult> {
        self.orchestrator.dispatch_default(request).await
    }

    /// Dispatch a batch with the configured concurrency
    pub async fn run_batch(&self, requests: Vec<DispatchRequest>) -> DispatchReport {
        self.pool
            .run_batch(requests, self.config.dispatch.concurrency)
            .await
    }

    /// Status of every registered provider, sorted by id
    #[must_use]
    pub fn provider_status(&self) -> Vec<ProviderStatus> {
        self.registry
            .ids()
            .into_iter()
            .map(|id| ProviderStatus {
                circuit: self.failsafe.circuit_breaker.stats(&id),
                rate_limit: self.failsafe.rate_limiter.usage(&id),
                health: self.failsafe.health_tracker.metrics(&id),
                provider: id,
            })
            .collect()
    }

    /// Loaded configuration
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Shared failsafe state
    pub fn failsafe(&self) -> &Failsafe {
        &self.failsafe
    }

    /// Failover orchestrator
    pub fn orchestrator(&self) -> &Arc<FailoverOrchestrator> {
        &self.orchestrator
    }

    /// Batch dispatcher
    pub fn pool(&self) -> &DispatchPool {
        &self.pool
    }
}
