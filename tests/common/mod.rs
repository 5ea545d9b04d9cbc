//! Shared test fixtures: a scripted provider and relay wiring helpers

#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;

use failover_relay::clock::{Clock, ManualClock};
use failover_relay::config::CircuitBreakerConfig;
use failover_relay::failover::FailoverOrchestrator;
use failover_relay::failsafe::Failsafe;
use failover_relay::invoker::{ProviderInvoker, RateLimitPolicy};
use failover_relay::provider::{
    GenerationRequest, Provider, ProviderId, ProviderRegistry, ProviderResponse,
};
use failover_relay::{Error, Result};

type Script = Box<dyn Fn(usize) -> bool + Send + Sync>;

/// Provider whose outcome per call is decided by a script over the call index
pub struct ScriptedProvider {
    id: ProviderId,
    succeed: Script,
    latency: Duration,
    clock: Option<Arc<ManualClock>>,
    panics: bool,
    calls: AtomicUsize,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

impl ScriptedProvider {
    fn scripted(id: &str, succeed: Script) -> Self {
        Self {
            id: ProviderId::from(id),
            succeed,
            latency: Duration::ZERO,
            clock: None,
            panics: false,
            calls: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        }
    }

    /// Always succeeds
    pub fn healthy(id: &str) -> Self {
        Self::scripted(id, Box::new(|_| true))
    }

    /// Always fails
    pub fn failing(id: &str) -> Self {
        Self::scripted(id, Box::new(|_| false))
    }

    /// Fails the first `n` calls, then succeeds
    pub fn failing_first(id: &str, n: usize) -> Self {
        Self::scripted(id, Box::new(move |call| call >= n))
    }

    /// Panics on every call
    pub fn panicking(id: &str) -> Self {
        let mut provider = Self::healthy(id);
        provider.panics = true;
        provider
    }

    /// Take `latency` per call
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Spend latency by advancing `clock` instead of sleeping
    pub fn on_clock(mut self, clock: Arc<ManualClock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Calls made so far
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Most calls observed in flight at once
    pub fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Provider for ScriptedProvider {
    fn id(&self) -> &ProviderId {
        &self.id
    }

    async fn generate(&self, request: &GenerationRequest) -> Result<ProviderResponse> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(current, Ordering::SeqCst);

        if !self.latency.is_zero() {
            match &self.clock {
                Some(clock) => {
                    clock.advance(self.latency);
                    tokio::task::yield_now().await;
                }
                None => tokio::time::sleep(self.latency).await,
            }
        }

        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        assert!(!self.panics, "scripted provider {} panicked", self.id);

        if (self.succeed)(call) {
            Ok(ProviderResponse::ok(json!({
                "provider": self.id.as_str(),
                "request": request.id,
            })))
        } else {
            Err(Error::Provider {
                provider: self.id.clone(),
                status: Some(503),
                message: "scripted failure".to_string(),
            })
        }
    }
}

/// Relay components wired over a set of providers
pub struct Harness {
    pub registry: Arc<ProviderRegistry>,
    pub failsafe: Failsafe,
    pub invoker: Arc<ProviderInvoker>,
    pub orchestrator: Arc<FailoverOrchestrator>,
}

impl Harness {
    pub fn new(
        providers: Vec<Arc<ScriptedProvider>>,
        breaker: CircuitBreakerConfig,
        policy: RateLimitPolicy,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let registry = Arc::new(ProviderRegistry::new());
        let mut chain = Vec::new();
        for provider in providers {
            chain.push(provider.id().clone());
            registry.register(provider);
        }

        let failsafe = Failsafe::new(breaker, clock);
        let invoker = Arc::new(
            ProviderInvoker::new(Arc::clone(&registry), failsafe.clone()).with_policy(policy),
        );
        let orchestrator = Arc::new(
            FailoverOrchestrator::new(Arc::clone(&invoker))
                .with_chain(chain)
                .with_timeout(Duration::from_secs(60)),
        );

        Self {
            registry,
            failsafe,
            invoker,
            orchestrator,
        }
    }

    /// Default breaker, fail-fast, on `clock`
    pub fn simple(providers: Vec<Arc<ScriptedProvider>>, clock: Arc<dyn Clock>) -> Self {
        Self::new(
            providers,
            CircuitBreakerConfig::default(),
            RateLimitPolicy::FailFast,
            clock,
        )
    }
}

pub fn breaker(threshold: u32, open_for: Duration) -> CircuitBreakerConfig {
    CircuitBreakerConfig {
        failure_threshold: threshold,
        timeout_duration: open_for,
        ..Default::default()
    }
}

pub fn request() -> GenerationRequest {
    GenerationRequest::new(json!({ "prompt": "hello" }))
}

pub fn id(name: &str) -> ProviderId {
    ProviderId::from(name)
}
