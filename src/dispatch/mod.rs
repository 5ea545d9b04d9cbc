//! Bounded concurrent batch dispatch
//!
//! A batch is ordered by descending priority and drawn by at most
//! `concurrency` in-flight requests. Each request runs in its own task, so a
//! panicking provider only fails the request that hit it.

mod report;

pub use report::{AttemptCounts, DispatchOutcome, DispatchReport};

use std::cmp::Reverse;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use futures::StreamExt;
use futures::stream;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info};

use crate::failover::FailoverOrchestrator;
use crate::provider::{GenerationRequest, ProviderId};
use crate::{Error, Result};

use report::ReportBuilder;

/// A request queued for batch dispatch
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchRequest {
    /// The generation request
    #[serde(flatten)]
    pub request: GenerationRequest,
    /// Higher runs first
    #[serde(default)]
    pub priority: i32,
    /// Provider chain override
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub providers: Option<Vec<ProviderId>>,
    /// Failover deadline override in milliseconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failover_timeout_ms: Option<u64>,
}

impl DispatchRequest {
    /// Wrap a request with default priority and chain
    #[must_use]
    pub fn new(request: GenerationRequest) -> Self {
        Self {
            request,
            priority: 0,
            providers: None,
            failover_timeout_ms: None,
        }
    }

    /// Set the priority
    #[must_use]
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Override the provider chain
    #[must_use]
    pub fn with_providers(mut self, providers: Vec<ProviderId>) -> Self {
        self.providers = Some(providers);
        self
    }

    /// Override the failover deadline
    #[must_use]
    pub fn with_failover_timeout(mut self, timeout: Duration) -> Self {
        self.failover_timeout_ms = Some(u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX));
        self
    }

    /// Parse one request per non-empty line
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` naming the first malformed line.
    pub fn parse_lines(input: &str) -> Result<Vec<Self>> {
        input
            .lines()
            .enumerate()
            .filter(|(_, line)| !line.trim().is_empty())
            .map(|(index, line)| {
                serde_json::from_str(line)
                    .map_err(|e| Error::Config(format!("invalid request on line {}: {e}", index + 1)))
            })
            .collect()
    }
}

/// Decrements the in-flight counter when a request finishes or unwinds
struct InFlight(Arc<AtomicUsize>);

impl InFlight {
    fn enter(in_flight: &Arc<AtomicUsize>, peak: &AtomicUsize) -> Self {
        let current = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        peak.fetch_max(current, Ordering::SeqCst);
        Self(Arc::clone(in_flight))
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Runs batches of requests through a [`FailoverOrchestrator`]
#[derive(Clone)]
pub struct DispatchPool {
    orchestrator: Arc<FailoverOrchestrator>,
}

impl DispatchPool {
    /// Create a pool over an orchestrator
    pub fn new(orchestrator: Arc<FailoverOrchestrator>) -> Self {
        Self { orchestrator }
    }

    /// Underlying orchestrator
    pub fn orchestrator(&self) -> &Arc<FailoverOrchestrator> {
        &self.orchestrator
    }

    /// Dispatch a batch with at most `concurrency` requests in flight
    ///
    /// Never fails as a whole; each request's error lands in its outcome.
    pub async fn run_batch(
        &self,
        requests: Vec<DispatchRequest>,
        concurrency: usize,
    ) -> DispatchReport {
        let concurrency = concurrency.max(1);
        let mut queue = requests;
        // Stable, so equal priorities keep submission order
        queue.sort_by_key(|r| Reverse(r.priority));

        info!(requests = queue.len(), concurrency, "Dispatching batch");

        let clock = Arc::clone(self.orchestrator.clock());
        let started = clock.now();
        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let mut builder = ReportBuilder::new(queue.len());

        let mut outcomes = stream::iter(queue)
            .map(|request| {
                let orchestrator = Arc::clone(&self.orchestrator);
                let in_flight = Arc::clone(&in_flight);
                let peak = Arc::clone(&peak);
                let request_id = request.request.id.clone();
                let priority = request.priority;

                async move {
                    let handle = tokio::spawn(async move {
                        let _guard = InFlight::enter(&in_flight, &peak);
                        run_one(&orchestrator, request).await
                    });
                    match handle.await {
                        Ok(outcome) => outcome,
                        Err(e) => {
                            error!(request_id = %request_id, error = %e, "Dispatch task failed");
                            DispatchOutcome {
                                request_id,
                                priority,
                                latency: Duration::ZERO,
                                result: Err(Error::Internal(format!("dispatch task failed: {e}"))),
                            }
                        }
                    }
                }
            })
            .buffer_unordered(concurrency);

        while let Some(outcome) = outcomes.next().await {
            builder.record(outcome);
        }

        let report = builder.finish(
            clock.elapsed_since(started),
            peak.load(Ordering::SeqCst),
            concurrency,
        );
        info!(
            total = report.total,
            succeeded = report.succeeded,
            failed = report.failed,
            wall_ms = report.wall_time.as_millis(),
            "Batch complete"
        );
        report
    }
}

async fn run_one(orchestrator: &FailoverOrchestrator, request: DispatchRequest) -> DispatchOutcome {
    let clock = orchestrator.clock();
    let started = clock.now();
    let timeout = request
        .failover_timeout_ms
        .map_or(orchestrator.timeout(), Duration::from_millis);

    let result = match &request.providers {
        Some(chain) => orchestrator.dispatch(chain, &request.request, timeout).await,
        None => {
            orchestrator
                .dispatch(orchestrator.chain(), &request.request, timeout)
                .await
        }
    };

    let latency = clock.elapsed_since(started);
    debug!(
        request_id = %request.request.id,
        success = result.is_ok(),
        latency_ms = latency.as_millis(),
        "Request finished"
    );

    DispatchOutcome {
        request_id: request.request.id,
        priority: request.priority,
        latency,
        result,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_lines() {
        let input = r#"
{"id": "a", "payload": {"prompt": "hi"}, "priority": 5}

{"payload": "plain", "providers": ["openai", "anthropic"], "failover_timeout_ms": 250, "estimated_tokens": 12}
"#;
        let requests = DispatchRequest::parse_lines(input).unwrap();

        assert_eq!(requests.len(), 2);
        assert_eq!(requests[0].request.id, "a");
        assert_eq!(requests[0].priority, 5);
        assert!(requests[0].providers.is_none());

        assert!(!requests[1].request.id.is_empty());
        assert_eq!(requests[1].request.estimated_tokens, 12);
        assert_eq!(
            requests[1].providers,
            Some(vec![ProviderId::from("openai"), ProviderId::from("anthropic")])
        );
        assert_eq!(requests[1].failover_timeout_ms, Some(250));
    }

    #[test]
    fn test_parse_lines_reports_line_number() {
        let err = DispatchRequest::parse_lines("{\"id\": \"a\"}\nnot json\n").unwrap_err();
        assert!(err.to_string().contains("line 2"));
    }

    #[test]
    fn test_builder() {
        let request = DispatchRequest::new(GenerationRequest::new(serde_json::json!({})))
            .with_priority(3)
            .with_providers(vec![ProviderId::from("openai")])
            .with_failover_timeout(Duration::from_millis(1500));

        assert_eq!(request.priority, 3);
        assert_eq!(request.failover_timeout_ms, Some(1500));
    }
}
