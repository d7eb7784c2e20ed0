//! Routing telemetry and the observability sink boundary
//!
//! Per-decision metrics, success-rate analytics per path and strategy,
//! and the fire-and-forget [`CostSink`] the orchestrator publishes to.
//! Sink failures never fail a coordination round.

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::session::SessionStatistics;

/// Telemetry for one routing decision.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingMetrics {
    /// Task this decision was made for
    pub task_id: String,

    /// Tree evaluation latency in microseconds
    pub decision_latency_us: u64,

    /// Conditions evaluated during traversal
    pub conditions_evaluated: u32,

    /// Paths considered (selected plus viable alternatives)
    pub paths_evaluated: u32,

    /// Selected path, absent on a no-route decision
    pub selected_path: Option<String>,

    /// Execution strategy chosen for the round
    pub strategy: String,

    /// Estimated cost for the round in USD
    pub estimated_cost_usd: f64,

    /// Estimated tokens for the round
    pub estimated_tokens: u32,
}

#[derive(Default)]
struct OutcomeCounter {
    successes: AtomicU64,
    failures: AtomicU64,
}

impl OutcomeCounter {
    fn record(&self, succeeded: bool) {
        if succeeded {
            self.successes.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn rate(&self) -> Option<f64> {
        let successes = self.successes.load(Ordering::Relaxed);
        let failures = self.failures.load(Ordering::Relaxed);
        let total = successes + failures;
        if total == 0 {
            None
        } else {
            Some(successes as f64 / total as f64)
        }
    }
}

/// Success-rate tracking per path and per strategy.
///
/// Outcomes arrive asynchronously, after the round the decision belonged
/// to has finished. Scoped to an orchestrator instance.
#[derive(Default)]
pub struct RoutingAnalytics {
    paths: DashMap<String, OutcomeCounter>,
    strategies: DashMap<String, OutcomeCounter>,
}

impl RoutingAnalytics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record whether the round a decision routed ultimately succeeded.
    pub fn record_outcome(&self, path_id: &str, strategy: &str, succeeded: bool) {
        self.paths
            .entry(path_id.to_string())
            .or_default()
            .record(succeeded);
        self.strategies
            .entry(strategy.to_string())
            .or_default()
            .record(succeeded);

        metrics::counter!(
            "cohort_round_outcomes_total",
            "path" => path_id.to_string(),
            "succeeded" => succeeded.to_string(),
        )
        .increment(1);
    }

    /// Success rate for a path, `None` before any outcome is recorded.
    pub fn path_success_rate(&self, path_id: &str) -> Option<f64> {
        self.paths.get(path_id).and_then(|c| c.rate())
    }

    /// Success rate for a strategy, `None` before any outcome is recorded.
    pub fn strategy_success_rate(&self, strategy: &str) -> Option<f64> {
        self.strategies.get(strategy).and_then(|c| c.rate())
    }
}

/// Accepts metric and cost events. Fire-and-forget: implementations
/// must swallow their own delivery failures.
#[async_trait]
pub trait CostSink: Send + Sync {
    async fn record_metrics(&self, metrics: &RoutingMetrics);

    async fn record_statistics(&self, statistics: &SessionStatistics);
}

/// Sink that discards everything. Default when no sink is configured.
#[derive(Debug, Default)]
pub struct NullSink;

#[async_trait]
impl CostSink for NullSink {
    async fn record_metrics(&self, _metrics: &RoutingMetrics) {}

    async fn record_statistics(&self, _statistics: &SessionStatistics) {}
}

/// Sink that emits structured log events, for embedded deployments
/// without a metrics pipeline.
#[derive(Debug, Default)]
pub struct LogSink;

#[async_trait]
impl CostSink for LogSink {
    async fn record_metrics(&self, metrics: &RoutingMetrics) {
        tracing::info!(
            task_id = %metrics.task_id,
            path = metrics.selected_path.as_deref().unwrap_or("<none>"),
            strategy = %metrics.strategy,
            latency_us = metrics.decision_latency_us,
            conditions = metrics.conditions_evaluated,
            estimated_cost_usd = metrics.estimated_cost_usd,
            "Routing decision"
        );
    }

    async fn record_statistics(&self, statistics: &SessionStatistics) {
        tracing::info!(
            session_id = %statistics.session_id,
            status = %statistics.status,
            total_cost_usd = statistics.total_cost_usd,
            total_tokens = statistics.total_tokens,
            duration_ms = statistics.duration_ms,
            "Session statistics"
        );
    }
}
