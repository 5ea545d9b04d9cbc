//! Batch dispatch report

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use serde::Serialize;

use crate::Result;
use crate::config::humantime_serde;
use crate::failover::{AttemptOutcome, InvocationResult};
use crate::failsafe::LatencyHistogram;
use crate::provider::ProviderId;

/// Result of one request in a batch
#[derive(Debug)]
pub struct DispatchOutcome {
    /// Request id
    pub request_id: String,
    /// Request priority
    pub priority: i32,
    /// Time from start to completion of this request
    pub latency: Duration,
    /// Failover result
    pub result: Result<InvocationResult>,
}

impl DispatchOutcome {
    /// Whether the request was served
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.result.is_ok()
    }

    /// Provider that served the request
    #[must_use]
    pub fn served_by(&self) -> Option<&ProviderId> {
        self.result.as_ref().ok().map(|r| &r.provider)
    }
}

/// Attempts across a batch that did not succeed, by kind
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct AttemptCounts {
    /// Skipped: circuit open
    pub circuit_open: usize,
    /// Skipped: quota exhausted
    pub rate_limited: usize,
    /// Skipped: provider not registered
    pub not_found: usize,
    /// Called and failed
    pub failed: usize,
    /// Finished after the failover deadline
    pub deadline_exceeded: usize,
}

impl AttemptCounts {
    fn record(&mut self, outcome: &AttemptOutcome) {
        match outcome {
            AttemptOutcome::Succeeded => {}
            AttemptOutcome::CircuitOpen => self.circuit_open += 1,
            AttemptOutcome::RateLimited => self.rate_limited += 1,
            AttemptOutcome::NotFound => self.not_found += 1,
            AttemptOutcome::Failed { .. } => self.failed += 1,
            AttemptOutcome::DeadlineExceeded => self.deadline_exceeded += 1,
        }
    }

    /// Attempts skipped without calling the provider
    #[must_use]
    pub fn rejections(&self) -> usize {
        self.circuit_open + self.rate_limited + self.not_found
    }
}

/// Summary of a dispatched batch
#[derive(Debug, Serialize)]
pub struct DispatchReport {
    /// Requests in the batch
    pub total: usize,
    /// Requests served
    pub succeeded: usize,
    /// Requests not served
    pub failed: usize,
    /// `succeeded / total`, 0 for an empty batch
    pub success_rate: f64,
    /// Mean request latency
    #[serde(serialize_with = "humantime_serde::serialize")]
    pub average_latency: Duration,
    /// Median request latency
    #[serde(serialize_with = "humantime_serde::serialize")]
    pub latency_p50: Duration,
    /// 95th percentile request latency
    #[serde(serialize_with = "humantime_serde::serialize")]
    pub latency_p95: Duration,
    /// 99th percentile request latency
    #[serde(serialize_with = "humantime_serde::serialize")]
    pub latency_p99: Duration,
    /// Served requests per second of wall time, 0 when no time elapsed
    pub throughput: f64,
    /// Wall time for the whole batch
    #[serde(serialize_with = "humantime_serde::serialize")]
    pub wall_time: Duration,
    /// Concurrency limit the batch ran with
    pub concurrency: usize,
    /// Most requests observed in flight at once
    pub peak_in_flight: usize,
    /// Served requests per provider
    pub served_by: BTreeMap<ProviderId, usize>,
    /// Requests served by a provider other than the first in their chain
    pub served_by_fallback: usize,
    /// Unsuccessful attempts by kind
    pub attempts: AttemptCounts,
    /// Per-request outcomes in completion order
    #[serde(skip)]
    pub outcomes: Vec<DispatchOutcome>,
}

impl DispatchReport {
    /// Outcome for a request id
    #[must_use]
    pub fn outcome(&self, request_id: &str) -> Option<&DispatchOutcome> {
        self.outcomes.iter().find(|o| o.request_id == request_id)
    }
}

impl fmt::Display for DispatchReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "Dispatched {} requests: {} succeeded, {} failed ({:.1}%)",
            self.total,
            self.succeeded,
            self.failed,
            self.success_rate * 100.0
        )?;
        writeln!(
            f,
            "Latency: avg {}ms, p50 {}ms, p95 {}ms, p99 {}ms",
            self.average_latency.as_millis(),
            self.latency_p50.as_millis(),
            self.latency_p95.as_millis(),
            self.latency_p99.as_millis()
        )?;
        writeln!(
            f,
            "Wall time {}ms, throughput {:.2} req/s, peak in flight {}/{}",
            self.wall_time.as_millis(),
            self.throughput,
            self.peak_in_flight,
            self.concurrency
        )?;
        for (provider, count) in &self.served_by {
            writeln!(f, "  {provider}: {count}")?;
        }
        write!(
            f,
            "Fallbacks {}, circuit open {}, rate limited {}, not found {}, failed {}, deadline {}",
            self.served_by_fallback,
            self.attempts.circuit_open,
            self.attempts.rate_limited,
            self.attempts.not_found,
            self.attempts.failed,
            self.attempts.deadline_exceeded
        )
    }
}

/// Folds outcomes into a report; owned by a single task
pub(crate) struct ReportBuilder {
    outcomes: Vec<DispatchOutcome>,
    latencies: LatencyHistogram,
    succeeded: usize,
    served_by: BTreeMap<ProviderId, usize>,
    served_by_fallback: usize,
    attempts: AttemptCounts,
}

impl ReportBuilder {
    pub(crate) fn new(expected: usize) -> Self {
        Self {
            outcomes: Vec::with_capacity(expected),
            latencies: LatencyHistogram::new(expected.max(1)),
            succeeded: 0,
            served_by: BTreeMap::new(),
            served_by_fallback: 0,
            attempts: AttemptCounts::default(),
        }
    }

    pub(crate) fn record(&mut self, outcome: DispatchOutcome) {
        self.latencies.record(outcome.latency);
        match &outcome.result {
            Ok(result) => {
                self.succeeded += 1;
                *self.served_by.entry(result.provider.clone()).or_default() += 1;
                if result.failed_over() {
                    self.served_by_fallback += 1;
                }
                for attempt in &result.attempts {
                    self.attempts.record(&attempt.outcome);
                }
            }
            Err(e) => {
                for attempt in e.attempts() {
                    self.attempts.record(&attempt.outcome);
                }
            }
        }
        self.outcomes.push(outcome);
    }

    pub(crate) fn finish(
        self,
        wall_time: Duration,
        peak_in_flight: usize,
        concurrency: usize,
    ) -> DispatchReport {
        let total = self.outcomes.len();

        #[allow(clippy::cast_precision_loss)]
        let success_rate = if total == 0 {
            0.0
        } else {
            self.succeeded as f64 / total as f64
        };

        let seconds = wall_time.as_secs_f64();
        #[allow(clippy::cast_precision_loss)]
        let throughput = if seconds > 0.0 {
            self.succeeded as f64 / seconds
        } else {
            0.0
        };

        DispatchReport {
            total,
            succeeded: self.succeeded,
            failed: total - self.succeeded,
            success_rate,
            average_latency: self.latencies.mean().unwrap_or_default(),
            latency_p50: self.latencies.percentile(0.50).unwrap_or_default(),
            latency_p95: self.latencies.percentile(0.95).unwrap_or_default(),
            latency_p99: self.latencies.percentile(0.99).unwrap_or_default(),
            throughput,
            wall_time,
            concurrency,
            peak_in_flight,
            served_by: self.served_by,
            served_by_fallback: self.served_by_fallback,
            attempts: self.attempts,
            outcomes: self.outcomes,
        }
    }
}
