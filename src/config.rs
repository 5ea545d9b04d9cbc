//! Configuration management

use std::{collections::BTreeMap, collections::HashMap, env, path::Path, time::Duration};

use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::failsafe::RateLimits;
use crate::provider::ProviderId;
use crate::{Error, Result};

/// Main configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// Environment files to load before processing config.
    /// Paths support ~ expansion. Loaded in order, later files override earlier.
    pub env_files: Vec<String>,
    /// Provider definitions, keyed by provider id
    pub providers: BTreeMap<ProviderId, ProviderConfig>,
    /// Default circuit breaker settings for every provider
    pub circuit_breaker: CircuitBreakerConfig,
    /// What to do when a provider's quota is exhausted
    pub rate_limit_policy: RateLimitPolicyConfig,
    /// Failover chain and deadline
    pub failover: FailoverConfig,
    /// Batch dispatch settings
    pub dispatch: DispatchConfig,
}

impl Config {
    /// Load configuration from file and environment
    ///
    /// # Errors
    ///
    /// Returns an error if the config file does not exist, cannot be parsed,
    /// or fails validation.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::new();

        if let Some(p) = path {
            if !p.exists() {
                return Err(Error::Config(format!(
                    "Config file not found: {}",
                    p.display()
                )));
            }
            figment = figment.merge(Yaml::file(p));
        }

        // Merge environment variables (FAILOVER_RELAY_ prefix)
        figment = figment.merge(Env::prefixed("FAILOVER_RELAY_").split("__"));

        let mut config: Self = figment
            .extract()
            .map_err(|e| Error::Config(e.to_string()))?;

        // Env files must be loaded before ${VAR} expansion
        config.load_env_files();
        config.expand_env_vars()?;
        config.validate()?;

        Ok(config)
    }

    /// Check cross-section consistency
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] describing the first problem found.
    pub fn validate(&self) -> Result<()> {
        if self.circuit_breaker.failure_threshold == 0 {
            return Err(Error::Config(
                "circuit_breaker.failure_threshold must be at least 1".to_string(),
            ));
        }

        for (id, provider) in &self.providers {
            if let Some(cb) = &provider.circuit_breaker
                && cb.failure_threshold == 0
            {
                return Err(Error::Config(format!(
                    "providers.{id}.circuit_breaker.failure_threshold must be at least 1"
                )));
            }
        }

        for id in &self.failover.providers {
            match self.providers.get(id) {
                None => {
                    return Err(Error::Config(format!(
                        "failover.providers names unknown provider '{id}'"
                    )));
                }
                Some(p) if !p.enabled => {
                    return Err(Error::Config(format!(
                        "failover.providers names disabled provider '{id}'"
                    )));
                }
                Some(_) => {}
            }
        }

        Ok(())
    }

    /// Enabled providers only
    pub fn enabled_providers(&self) -> impl Iterator<Item = (&ProviderId, &ProviderConfig)> {
        self.providers.iter().filter(|(_, p)| p.enabled)
    }

    /// Failover chain, defaulting to every enabled provider in id order
    #[must_use]
    pub fn failover_chain(&self) -> Vec<ProviderId> {
        if self.failover.providers.is_empty() {
            self.enabled_providers().map(|(id, _)| id.clone()).collect()
        } else {
            self.failover.providers.clone()
        }
    }

    /// Load environment files into the process environment.
    /// Files that don't exist are silently skipped.
    fn load_env_files(&self) {
        for path_str in &self.env_files {
            let expanded = if path_str.starts_with('~') {
                if let Some(home) = dirs::home_dir() {
                    path_str.replacen('~', &home.display().to_string(), 1)
                } else {
                    path_str.clone()
                }
            } else {
                path_str.clone()
            };

            let path = Path::new(&expanded);
            if path.exists() {
                match dotenvy::from_path(path) {
                    Ok(()) => {
                        tracing::info!("Loaded env file: {expanded}");
                    }
                    Err(e) => {
                        tracing::warn!("Failed to load env file {expanded}: {e}");
                    }
                }
            } else {
                tracing::debug!("Env file not found (skipped): {expanded}");
            }
        }
    }

    /// Expand ${VAR} and ${VAR:-default} in provider endpoints and headers
    fn expand_env_vars(&mut self) -> Result<()> {
        let re = Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)(?::-([^}]*))?\}")
            .map_err(|e| Error::Internal(e.to_string()))?;

        for provider in self.providers.values_mut() {
            provider.endpoint = Self::expand_string(&re, &provider.endpoint);
            for value in provider.headers.values_mut() {
                *value = Self::expand_string(&re, value);
            }
        }

        Ok(())
    }

    fn expand_string(re: &Regex, value: &str) -> String {
        re.replace_all(value, |caps: &regex::Captures| {
            let var_name = &caps[1];
            let default = caps.get(2).map_or("", |m| m.as_str());
            env::var(var_name).unwrap_or_else(|_| default.to_string())
        })
        .into_owned()
    }
}

/// A single provider
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    /// Whether the provider takes traffic
    pub enabled: bool,
    /// Generation endpoint (HTTP POST)
    pub endpoint: String,
    /// Per-request timeout
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
    /// Extra HTTP headers (supports ${VAR} expansion)
    pub headers: HashMap<String, String>,
    /// Quotas for this provider
    pub rate_limit: RateLimitConfig,
    /// Circuit breaker override for this provider
    pub circuit_breaker: Option<CircuitBreakerConfig>,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            endpoint: String::new(),
            timeout: Duration::from_secs(30),
            headers: HashMap::new(),
            rate_limit: RateLimitConfig::default(),
            circuit_breaker: None,
        }
    }
}

/// Provider quotas (0 = unlimited)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Requests per minute
    pub requests_per_minute: u32,
    /// Requests per hour
    pub requests_per_hour: u32,
    /// Estimated tokens per minute
    pub tokens_per_minute: u64,
}

impl RateLimitConfig {
    /// Whether any quota is configured
    #[must_use]
    pub fn is_limited(&self) -> bool {
        self.requests_per_minute > 0 || self.requests_per_hour > 0 || self.tokens_per_minute > 0
    }
}

impl From<RateLimitConfig> for RateLimits {
    fn from(config: RateLimitConfig) -> Self {
        RateLimits {
            requests_per_minute: config.requests_per_minute,
            requests_per_hour: config.requests_per_hour,
            tokens_per_minute: config.tokens_per_minute,
        }
    }
}

/// Circuit breaker configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Enable circuit breaker
    pub enabled: bool,
    /// Consecutive failures before opening
    pub failure_threshold: u32,
    /// How long the circuit stays open before a trial call
    #[serde(with = "humantime_serde")]
    pub timeout_duration: Duration,
    /// Failures further apart than this do not accumulate (0 = never forget)
    #[serde(with = "humantime_serde")]
    pub retry_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            failure_threshold: 5,
            timeout_duration: Duration::from_secs(60),
            retry_timeout: Duration::from_secs(300),
        }
    }
}

/// Rate limit policy mode
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RateLimitMode {
    /// Reject immediately
    #[default]
    FailFast,
    /// Wait for the window, up to `max_wait`
    Wait,
}

/// Rate limit policy configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitPolicyConfig {
    /// Reject or wait
    pub mode: RateLimitMode,
    /// Longest cumulative wait in `wait` mode
    #[serde(with = "humantime_serde")]
    pub max_wait: Duration,
}

impl Default for RateLimitPolicyConfig {
    fn default() -> Self {
        Self {
            mode: RateLimitMode::FailFast,
            max_wait: Duration::from_secs(5),
        }
    }
}

/// Failover configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FailoverConfig {
    /// Ordered chain: primary first
    pub providers: Vec<ProviderId>,
    /// Overall deadline for one request across the chain
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
}

impl Default for FailoverConfig {
    fn default() -> Self {
        Self {
            providers: Vec::new(),
            timeout: Duration::from_secs(60),
        }
    }
}

/// Batch dispatch configuration
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Maximum in-flight requests
    pub concurrency: usize,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self { concurrency: 8 }
    }
}

/// Custom humantime serde module for Duration
pub mod humantime_serde {
    use std::time::Duration;

    use serde::{self, Deserialize, Deserializer, Serializer};

    /// Serialize Duration to a human-readable string ("30s" or "250ms")
    ///
    /// # Errors
    ///
    /// Returns a serialization error if the serializer fails.
    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        if duration.subsec_millis() == 0 {
            serializer.serialize_str(&format!("{}s", duration.as_secs()))
        } else {
            serializer.serialize_str(&format!("{}ms", duration.as_millis()))
        }
    }

    /// Deserialize a human-readable duration ("30s", "5m", "1h", "100ms", or bare seconds)
    ///
    /// # Errors
    ///
    /// Returns a deserialization error if the string cannot be parsed as a duration.
    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        parse(&s).map_err(serde::de::Error::custom)
    }

    /// Parse a human-readable duration
    ///
    /// # Errors
    ///
    /// Returns a message for malformed or out-of-range input.
    pub fn parse(s: &str) -> Result<Duration, String> {
        let s = s.trim();
        // "ms" must be checked before "s" and "m"
        if let Some(ms) = s.strip_suffix("ms") {
            return number(ms, s).map(Duration::from_millis);
        }
        let (value, unit_secs) = if let Some(secs) = s.strip_suffix('s') {
            (secs, 1)
        } else if let Some(mins) = s.strip_suffix('m') {
            (mins, 60)
        } else if let Some(hours) = s.strip_suffix('h') {
            (hours, 3600)
        } else {
            (s, 1)
        };
        number(value, s)?
            .checked_mul(unit_secs)
            .map(Duration::from_secs)
            .ok_or_else(|| format!("duration out of range: {s}"))
    }

    fn number(digits: &str, input: &str) -> Result<u64, String> {
        digits
            .trim()
            .parse::<u64>()
            .map_err(|e| format!("invalid duration '{input}': {e}"))
    }
}
