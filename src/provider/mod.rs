//! Provider abstraction: the opaque outbound call the relay protects

mod http;

pub use self::http::HttpProvider;

use std::borrow::Borrow;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::Result;

/// Identifier naming a logical provider (`openai`, `anthropic`, ...)
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProviderId(String);

impl ProviderId {
    /// Create a provider id
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow as a string slice
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ProviderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ProviderId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for ProviderId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl Borrow<str> for ProviderId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// A single generation request; the payload is never interpreted
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationRequest {
    /// Request identifier
    #[serde(default = "new_request_id")]
    pub id: String,
    /// Opaque provider payload
    #[serde(default)]
    pub payload: Value,
    /// Estimated token cost, checked against token quotas
    #[serde(default)]
    pub estimated_tokens: u64,
}

fn new_request_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

impl GenerationRequest {
    /// Create a request with a fresh id
    #[must_use]
    pub fn new(payload: Value) -> Self {
        Self {
            id: new_request_id(),
            payload,
            estimated_tokens: 0,
        }
    }

    /// Set the token estimate
    #[must_use]
    pub fn with_estimated_tokens(mut self, tokens: u64) -> Self {
        self.estimated_tokens = tokens;
        self
    }
}

/// Successful provider response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderResponse {
    /// Transport status (200 for non-HTTP providers)
    pub status: u16,
    /// Response body
    pub body: Value,
}

impl ProviderResponse {
    /// Response with status 200
    #[must_use]
    pub fn ok(body: Value) -> Self {
        Self { status: 200, body }
    }
}

/// An external content-generation provider
///
/// Any `Err` counts as a failed attempt for circuit breaking and failover.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Provider identifier
    fn id(&self) -> &ProviderId;

    /// Perform one generation call
    async fn generate(&self, request: &GenerationRequest) -> Result<ProviderResponse>;
}

/// Registered providers, keyed by id
#[derive(Default)]
pub struct ProviderRegistry {
    providers: DashMap<ProviderId, Arc<dyn Provider>>,
}

impl ProviderRegistry {
    /// Create an empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a provider under its own id, replacing any previous one
    pub fn register(&self, provider: Arc<dyn Provider>) {
        let id = provider.id().clone();
        tracing::debug!(provider = %id, "Registered provider");
        self.providers.insert(id, provider);
    }

    /// Look up a provider
    #[must_use]
    pub fn get(&self, id: &ProviderId) -> Option<Arc<dyn Provider>> {
        self.providers.get(id).map(|entry| Arc::clone(entry.value()))
    }

    /// Whether a provider is registered
    #[must_use]
    pub fn contains(&self, id: &ProviderId) -> bool {
        self.providers.contains_key(id)
    }

    /// Registered ids, sorted
    #[must_use]
    pub fn ids(&self) -> Vec<ProviderId> {
        let mut ids: Vec<ProviderId> = self.providers.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    /// Number of registered providers
    #[must_use]
    pub fn len(&self) -> usize {
        self.providers.len()
    }

    /// Whether no providers are registered
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Echo(ProviderId);

    #[async_trait]
    impl Provider for Echo {
        fn id(&self) -> &ProviderId {
            &self.0
        }

        async fn generate(&self, request: &GenerationRequest) -> Result<ProviderResponse> {
            Ok(ProviderResponse::ok(request.payload.clone()))
        }
    }

    #[test]
    fn test_registry_register_and_lookup() {
        let registry = ProviderRegistry::new();
        assert!(registry.is_empty());

        registry.register(Arc::new(Echo(ProviderId::from("openai"))));
        registry.register(Arc::new(Echo(ProviderId::from("anthropic"))));

        assert_eq!(registry.len(), 2);
        assert!(registry.contains(&ProviderId::from("openai")));
        assert!(registry.get(&ProviderId::from("cohere")).is_none());
        assert_eq!(
            registry.ids(),
            vec![ProviderId::from("anthropic"), ProviderId::from("openai")]
        );
    }

    #[test]
    fn test_generation_request_defaults() {
        let request: GenerationRequest =
            serde_json::from_str(r#"{"payload": {"prompt": "hi"}}"#).unwrap();
        assert!(!request.id.is_empty());
        assert_eq!(request.estimated_tokens, 0);
        assert_eq!(request.payload["prompt"], "hi");
    }
}
