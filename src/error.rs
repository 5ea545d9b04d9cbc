//! Error types for the failover relay

use std::io;
use std::time::Duration;

use thiserror::Error;

use crate::failover::Attempt;
use crate::provider::ProviderId;

/// Result type alias for the failover relay
pub type Result<T> = std::result::Result<T, Error>;

/// Failover relay errors
#[derive(Error, Debug)]
pub enum Error {
    /// Provider rejected without an attempt because its circuit is open
    #[error("Circuit open for provider {provider}, retry in {}ms", .retry_in.as_millis())]
    CircuitOpen {
        /// Provider whose circuit rejected the call
        provider: ProviderId,
        /// Time until the circuit will admit a trial call
        retry_in: Duration,
    },

    /// Provider rejected without an attempt because its quota is exhausted
    #[error("Rate limited on provider {provider}, retry after {}ms", .retry_after.as_millis())]
    RateLimited {
        /// Provider whose quota is exhausted
        provider: ProviderId,
        /// Time until the next request would be admitted
        retry_after: Duration,
    },

    /// The provider call was attempted and failed
    #[error("Provider {provider} failed{}: {message}", status_suffix(.status))]
    Provider {
        /// Provider that failed
        provider: ProviderId,
        /// HTTP status, when the failure came from a response
        status: Option<u16>,
        /// Failure description
        message: String,
    },

    /// Every provider in the chain failed, or the failover deadline passed
    #[error("{}", exhausted_message(.attempts, .elapsed, .timed_out))]
    FailoverExhausted {
        /// Ordered record of every attempt made
        attempts: Vec<Attempt>,
        /// Total time spent in failover
        elapsed: Duration,
        /// Whether the failover deadline cut the chain short
        timed_out: bool,
    },

    /// Provider is not registered
    #[error("Provider not found: {0}")]
    ProviderNotFound(ProviderId),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// HTTP transport error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

fn status_suffix(status: &Option<u16>) -> String {
    status.map(|s| format!(" with status {s}")).unwrap_or_default()
}

fn exhausted_message(attempts: &[Attempt], elapsed: &Duration, timed_out: &bool) -> String {
    format!(
        "Failover exhausted after {} attempt(s) in {}ms{}",
        attempts.len(),
        elapsed.as_millis(),
        if *timed_out { " (deadline exceeded)" } else { "" }
    )
}

impl Error {
    /// Create a provider failure
    pub fn provider(provider: &ProviderId, message: impl Into<String>) -> Self {
        Self::Provider {
            provider: provider.clone(),
            status: None,
            message: message.into(),
        }
    }

    /// Whether the provider was rejected before any call was attempted
    #[must_use]
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            Self::CircuitOpen { .. } | Self::RateLimited { .. } | Self::ProviderNotFound(_)
        )
    }

    /// Attempt chain carried by a failover exhaustion, empty otherwise
    #[must_use]
    pub fn attempts(&self) -> &[Attempt] {
        match self {
            Self::FailoverExhausted { attempts, .. } => attempts,
            _ => &[],
        }
    }
}
