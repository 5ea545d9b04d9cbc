//! Circuit breaker implementation
//!
//! One state machine per provider, created lazily on first reference:
//!
//! - **Closed**: calls pass. Failures accumulate; reaching the threshold opens
//!   the circuit. Any success resets the count.
//! - **Open**: calls are rejected with [`Error::CircuitOpen`] without running.
//!   Once `timeout_duration` has passed the circuit moves to half-open the next
//!   time it is touched. There is no background timer.
//! - **HalfOpen**: exactly one trial call is admitted. Its success closes the
//!   circuit, its failure reopens it.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::config::CircuitBreakerConfig;
use crate::provider::ProviderId;
use crate::{Error, Result};

/// Circuit breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum CircuitState {
    /// Circuit is closed (allowing requests)
    Closed,
    /// Circuit is open (blocking requests)
    Open,
    /// Circuit is half-open (allowing a single trial request)
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half-open",
        })
    }
}

/// Snapshot of one provider's circuit
#[derive(Debug, Clone, Serialize)]
pub struct CircuitStats {
    /// Provider
    pub provider: ProviderId,
    /// Current state
    pub state: CircuitState,
    /// Consecutive failure count
    pub failures: u32,
    /// Configured threshold
    pub failure_threshold: u32,
    /// Time until an open circuit admits a trial
    pub retry_in_ms: u64,
    /// How many times this circuit has opened
    pub times_opened: u64,
}

#[derive(Debug)]
struct Circuit {
    config: CircuitBreakerConfig,
    state: CircuitState,
    failures: u32,
    last_transition: Instant,
    last_failure: Option<Instant>,
    trial_in_flight: bool,
    times_opened: u64,
}

impl Circuit {
    fn new(config: CircuitBreakerConfig, now: Instant) -> Self {
        Self {
            config,
            state: CircuitState::Closed,
            failures: 0,
            last_transition: now,
            last_failure: None,
            trial_in_flight: false,
            times_opened: 0,
        }
    }

    /// Materialize the lazy Open -> HalfOpen transition
    fn refresh(&mut self, provider: &ProviderId, now: Instant) {
        if self.state == CircuitState::Open
            && now.saturating_duration_since(self.last_transition) >= self.config.timeout_duration
        {
            self.transition_to(provider, CircuitState::HalfOpen, now);
        }
    }

    fn retry_in(&self, now: Instant) -> Duration {
        match self.state {
            CircuitState::Open => (self.last_transition + self.config.timeout_duration)
                .saturating_duration_since(now),
            CircuitState::Closed | CircuitState::HalfOpen => Duration::ZERO,
        }
    }

    fn on_success(&mut self, provider: &ProviderId, trial: bool, now: Instant) {
        if !self.config.enabled {
            return;
        }
        match self.state {
            CircuitState::Closed => {
                self.failures = 0;
                tracing::trace!(provider = %provider, "Success in closed state, reset failure count");
            }
            CircuitState::HalfOpen if trial => {
                self.transition_to(provider, CircuitState::Closed, now);
            }
            CircuitState::HalfOpen => {
                tracing::trace!(provider = %provider, "Late success in half-open state (ignored)");
            }
            CircuitState::Open => {
                tracing::trace!(provider = %provider, "Success recorded in open state (ignored)");
            }
        }
    }

    fn on_failure(&mut self, provider: &ProviderId, trial: bool, now: Instant) {
        if !self.config.enabled {
            return;
        }
        match self.state {
            CircuitState::Closed => {
                let retry_timeout = self.config.retry_timeout;
                if !retry_timeout.is_zero()
                    && self
                        .last_failure
                        .is_some_and(|at| now.saturating_duration_since(at) > retry_timeout)
                {
                    self.failures = 0;
                }
                self.failures += 1;
                self.last_failure = Some(now);
                warn!(
                    provider = %provider,
                    failures = self.failures,
                    threshold = self.config.failure_threshold,
                    "Failure in closed state"
                );
                if self.failures >= self.config.failure_threshold {
                    self.transition_to(provider, CircuitState::Open, now);
                }
            }
            CircuitState::HalfOpen if trial => {
                self.last_failure = Some(now);
                warn!(provider = %provider, "Trial call failed, reopening circuit");
                self.transition_to(provider, CircuitState::Open, now);
            }
            CircuitState::HalfOpen => {
                tracing::trace!(provider = %provider, "Late failure in half-open state (ignored)");
            }
            CircuitState::Open => {
                tracing::trace!(provider = %provider, "Failure recorded in open state (ignored)");
            }
        }
    }

    fn transition_to(&mut self, provider: &ProviderId, new_state: CircuitState, now: Instant) {
        let old_state = self.state;
        self.state = new_state;
        self.last_transition = now;
        self.trial_in_flight = false;

        match new_state {
            CircuitState::Closed => {
                self.failures = 0;
                info!(provider = %provider, from = %old_state, "Circuit breaker closed");
            }
            CircuitState::Open => {
                self.failures = self.config.failure_threshold;
                self.times_opened += 1;
                warn!(
                    provider = %provider,
                    from = %old_state,
                    failures = self.failures,
                    "Circuit breaker opened"
                );
            }
            CircuitState::HalfOpen => {
                debug!(provider = %provider, "Circuit breaker half-open");
            }
        }
    }

    fn reset(&mut self, now: Instant) {
        *self = Self {
            times_opened: self.times_opened,
            ..Self::new(self.config, now)
        };
    }
}

/// Admission to call a provider through its circuit
///
/// Settle it with [`CallPermit::success`] or [`CallPermit::failure`]. A
/// half-open trial permit dropped without an outcome frees the trial slot
/// for the next caller.
#[must_use = "a permit must be settled with success() or failure()"]
pub struct CallPermit {
    provider: ProviderId,
    circuit: Arc<Mutex<Circuit>>,
    clock: Arc<dyn Clock>,
    trial: bool,
    settled: bool,
}

impl CallPermit {
    /// Whether this permit is the half-open trial
    pub fn is_trial(&self) -> bool {
        self.trial
    }

    /// Report a successful call
    pub fn success(mut self) {
        self.settled = true;
        let now = self.clock.now();
        self.circuit.lock().on_success(&self.provider, self.trial, now);
    }

    /// Report a failed call
    pub fn failure(mut self) {
        self.settled = true;
        let now = self.clock.now();
        self.circuit.lock().on_failure(&self.provider, self.trial, now);
    }
}

impl Drop for CallPermit {
    fn drop(&mut self) {
        if self.settled || !self.trial {
            return;
        }
        let mut circuit = self.circuit.lock();
        if circuit.state == CircuitState::HalfOpen {
            circuit.trial_in_flight = false;
            debug!(provider = %self.provider, "Trial permit released without outcome");
        }
    }
}

/// Per-provider circuit breakers
pub struct CircuitBreaker {
    defaults: CircuitBreakerConfig,
    clock: Arc<dyn Clock>,
    circuits: DashMap<ProviderId, Arc<Mutex<Circuit>>>,
}

impl CircuitBreaker {
    /// Create a breaker registry applying `defaults` to every provider
    pub fn new(defaults: CircuitBreakerConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            defaults,
            clock,
            circuits: DashMap::new(),
        }
    }

    // The map guard is dropped before the circuit mutex is locked.
    fn circuit(&self, provider: &ProviderId) -> Arc<Mutex<Circuit>> {
        if let Some(entry) = self.circuits.get(provider) {
            return Arc::clone(entry.value());
        }
        let now = self.clock.now();
        Arc::clone(
            self.circuits
                .entry(provider.clone())
                .or_insert_with(|| Arc::new(Mutex::new(Circuit::new(self.defaults, now))))
                .value(),
        )
    }

    /// Override the configuration for one provider
    pub fn configure(&self, provider: &ProviderId, config: CircuitBreakerConfig) {
        self.circuit(provider).lock().config = config;
        debug!(
            provider = %provider,
            threshold = config.failure_threshold,
            timeout_ms = u64::try_from(config.timeout_duration.as_millis()).unwrap_or(u64::MAX),
            "Configured circuit breaker"
        );
    }

    /// Current state of a provider's circuit
    ///
    /// Reading the state applies the lazy Open -> HalfOpen transition once the
    /// open timeout has elapsed, so this call may change the stored state. It
    /// never admits the trial call; only [`Self::try_acquire`] does.
    pub fn state(&self, provider: &ProviderId) -> CircuitState {
        let circuit = self.circuit(provider);
        let mut circuit = circuit.lock();
        circuit.refresh(provider, self.clock.now());
        circuit.state
    }

    /// Ask to call a provider
    ///
    /// # Errors
    ///
    /// Returns [`Error::CircuitOpen`] when the circuit is open, or half-open
    /// with its trial already in flight.
    pub fn try_acquire(&self, provider: &ProviderId) -> Result<CallPermit> {
        let circuit = self.circuit(provider);
        let now = self.clock.now();

        let trial = {
            let mut state = circuit.lock();
            if !state.config.enabled {
                false
            } else {
                state.refresh(provider, now);
                match state.state {
                    CircuitState::Closed => false,
                    CircuitState::Open => {
                        debug!(provider = %provider, "Circuit open, rejecting request");
                        return Err(Error::CircuitOpen {
                            provider: provider.clone(),
                            retry_in: state.retry_in(now),
                        });
                    }
                    CircuitState::HalfOpen if state.trial_in_flight => {
                        debug!(provider = %provider, "Trial in flight, rejecting request");
                        return Err(Error::CircuitOpen {
                            provider: provider.clone(),
                            retry_in: Duration::ZERO,
                        });
                    }
                    CircuitState::HalfOpen => {
                        debug!(provider = %provider, "Circuit half-open, admitting trial request");
                        state.trial_in_flight = true;
                        true
                    }
                }
            }
        };

        Ok(CallPermit {
            provider: provider.clone(),
            circuit,
            clock: Arc::clone(&self.clock),
            trial,
            settled: false,
        })
    }

    /// Run `f` through the circuit and record its outcome
    ///
    /// `f` is not invoked when the circuit rejects the call.
    ///
    /// # Errors
    ///
    /// Returns [`Error::CircuitOpen`] on rejection, otherwise the error
    /// produced by `f`.
    pub async fn call<F, Fut, T>(&self, provider: &ProviderId, f: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let permit = self.try_acquire(provider)?;
        match f().await {
            Ok(value) => {
                permit.success();
                Ok(value)
            }
            Err(e) => {
                permit.failure();
                Err(e)
            }
        }
    }

    /// Record a success outside of a permit
    pub fn record_success(&self, provider: &ProviderId) {
        let now = self.clock.now();
        self.circuit(provider).lock().on_success(provider, true, now);
    }

    /// Record a failure outside of a permit
    pub fn record_failure(&self, provider: &ProviderId) {
        let now = self.clock.now();
        self.circuit(provider).lock().on_failure(provider, true, now);
    }

    /// Consecutive failure count
    pub fn failure_count(&self, provider: &ProviderId) -> u32 {
        self.circuit(provider).lock().failures
    }

    /// Force a provider's circuit closed with zero failures
    pub fn reset(&self, provider: &ProviderId) {
        let now = self.clock.now();
        self.circuit(provider).lock().reset(now);
        debug!(provider = %provider, "Circuit breaker reset");
    }

    /// Reset every known circuit
    pub fn reset_all(&self) {
        let now = self.clock.now();
        for entry in &self.circuits {
            entry.value().lock().reset(now);
        }
    }

    /// Snapshot of a provider's circuit
    pub fn stats(&self, provider: &ProviderId) -> CircuitStats {
        let now = self.clock.now();
        let circuit = self.circuit(provider);
        let mut circuit = circuit.lock();
        circuit.refresh(provider, now);
        CircuitStats {
            provider: provider.clone(),
            state: circuit.state,
            failures: circuit.failures,
            failure_threshold: circuit.config.failure_threshold,
            retry_in_ms: u64::try_from(circuit.retry_in(now).as_millis()).unwrap_or(u64::MAX),
            times_opened: circuit.times_opened,
        }
    }

    /// Human-readable description of a provider's circuit
    pub fn status_message(&self, provider: &ProviderId) -> String {
        let now = self.clock.now();
        let circuit = self.circuit(provider);
        let mut circuit = circuit.lock();
        if !circuit.config.enabled {
            return format!("Provider '{provider}' circuit breaker is disabled (closed)");
        }
        circuit.refresh(provider, now);
        match circuit.state {
            CircuitState::Closed => format!(
                "Provider '{provider}' circuit breaker is closed ({}/{} failures)",
                circuit.failures, circuit.config.failure_threshold
            ),
            CircuitState::Open => format!(
                "Provider '{provider}' circuit breaker is open after {} failures, retry in {} seconds",
                circuit.failures,
                ceil_secs(circuit.retry_in(now))
            ),
            CircuitState::HalfOpen => {
                format!("Provider '{provider}' circuit breaker is half-open, testing recovery")
            }
        }
    }
}

fn ceil_secs(duration: Duration) -> u64 {
    duration.as_secs() + u64::from(duration.subsec_nanos() > 0)
}
