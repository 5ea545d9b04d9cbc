//! Failover Relay Library
//!
//! Provider resilience for outbound generation calls: per-provider rate
//! limiting and circuit breaking, ordered failover across providers, and
//! bounded concurrent batch dispatch.
//!
//! # Features
//!
//! - **Rate limiting**: fixed per-minute, per-hour and token windows per provider
//! - **Circuit breaking**: closed/open/half-open with a single recovery trial
//! - **Failover**: strict primary-then-fallback order under a deadline
//! - **Dispatch**: priority-ordered batches with a concurrency bound and a report
//! - **Injectable clock**: deterministic tests without sleeping

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod cli;
pub mod clock;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod failover;
pub mod failsafe;
pub mod invoker;
pub mod provider;
pub mod relay;

pub use error::{Error, Result};

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Setup tracing/logging
///
/// # Errors
///
/// Returns an error if a global subscriber is already installed.
pub fn setup_tracing(level: &str, format: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::registry().with(filter);

    let installed = match format {
        Some("json") => subscriber.with(fmt::layer().json()).try_init(),
        _ => subscriber.with(fmt::layer()).try_init(),
    };

    installed.map_err(|e| Error::Internal(format!("failed to install tracing subscriber: {e}")))
}
