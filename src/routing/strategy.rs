//! Execution strategies and the strategy selection step
//!
//! The tree decides *where* a task may run; the selector decides *how*.
//! Selection is pluggable: custom rules run ahead of the default policy
//! and a misbehaving rule falls through instead of aborting selection.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::str::FromStr;

use crate::context::ExecutionContext;
use crate::routing::RoutingDecision;
use serde::{Deserialize, Serialize};

/// Dispatch shape for a coordination round.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStrategy {
    /// Single dispatch to the selected path
    #[default]
    Direct,

    /// All agents dispatched concurrently; all results aggregated
    Parallel,

    /// Agents dispatched one at a time in definition order
    Sequential,

    /// Selected path first, then alternatives until one succeeds
    Failover,

    /// Rotate across agents between rounds
    RoundRobin,

    /// Uniform random choice among agents
    Random,

    /// Sequential, stopping at the first sufficiently confident success
    Cascade,

    /// All agents race; first success wins, the rest are cancelled
    Competitive,

    /// All agents dispatched; aggregation requires a quorum of results
    Consensus,

    /// A lead agent dispatches first, remaining agents refine its output
    Hierarchical,
}

impl ExecutionStrategy {
    /// Whether this strategy dispatches more than one agent per round.
    pub fn is_multi_agent(&self) -> bool {
        !matches!(
            self,
            ExecutionStrategy::Direct | ExecutionStrategy::RoundRobin | ExecutionStrategy::Random
        )
    }
}

impl FromStr for ExecutionStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "direct" => Ok(ExecutionStrategy::Direct),
            "parallel" => Ok(ExecutionStrategy::Parallel),
            "sequential" => Ok(ExecutionStrategy::Sequential),
            "failover" => Ok(ExecutionStrategy::Failover),
            "round_robin" => Ok(ExecutionStrategy::RoundRobin),
            "random" => Ok(ExecutionStrategy::Random),
            "cascade" => Ok(ExecutionStrategy::Cascade),
            "competitive" => Ok(ExecutionStrategy::Competitive),
            "consensus" => Ok(ExecutionStrategy::Consensus),
            "hierarchical" => Ok(ExecutionStrategy::Hierarchical),
            _ => Err(format!("Unknown execution strategy: {}", s)),
        }
    }
}

impl std::fmt::Display for ExecutionStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ExecutionStrategy::Direct => "direct",
            ExecutionStrategy::Parallel => "parallel",
            ExecutionStrategy::Sequential => "sequential",
            ExecutionStrategy::Failover => "failover",
            ExecutionStrategy::RoundRobin => "round_robin",
            ExecutionStrategy::Random => "random",
            ExecutionStrategy::Cascade => "cascade",
            ExecutionStrategy::Competitive => "competitive",
            ExecutionStrategy::Consensus => "consensus",
            ExecutionStrategy::Hierarchical => "hierarchical",
        };
        write!(f, "{}", name)
    }
}

/// Budget, latency, and reliability hints feeding strategy selection.
#[derive(Debug, Clone, Copy, Default)]
pub struct SelectionHints {
    /// Cost budget comfortably covers the estimated round cost
    pub budget_ample: bool,

    /// Caller prioritizes latency over reliability
    pub latency_sensitive: bool,

    /// Caller prioritizes reliability over latency
    pub reliability_first: bool,

    /// The round requires agreement among agents before aggregating
    pub requires_consensus: bool,

    /// Number of agents available for the round
    pub agent_count: usize,
}

impl SelectionHints {
    /// Derive hints from a context and the round's estimated cost.
    pub fn from_context(ctx: &ExecutionContext, estimated_cost: f64, agent_count: usize) -> Self {
        let budget_ample = ctx
            .cost_budget
            .map_or(false, |budget| budget >= estimated_cost * 2.0);
        let latency_sensitive = ctx
            .metadata
            .get("latency_sensitive")
            .and_then(|v| v.as_bool())
            .unwrap_or(false);
        let reliability_first = ctx
            .metadata
            .get("reliability_first")
            .and_then(|v| v.as_bool())
            .unwrap_or(false);
        let requires_consensus = ctx
            .metadata
            .get("requires_consensus")
            .and_then(|v| v.as_bool())
            .unwrap_or(false);

        Self {
            budget_ample,
            latency_sensitive,
            reliability_first,
            requires_consensus,
            agent_count,
        }
    }
}

/// A custom selection rule: returns a strategy to short-circuit the
/// default policy, or `None` to pass.
pub type SelectionRule =
    Box<dyn Fn(&RoutingDecision, &SelectionHints) -> Option<ExecutionStrategy> + Send + Sync>;

/// Pluggable strategy selection.
///
/// Custom rules are evaluated in registration order before the default
/// policy. A rule that panics is caught and logged, and selection falls
/// through to the next rule.
pub struct StrategySelector {
    rules: Vec<(String, SelectionRule)>,
}

impl StrategySelector {
    pub fn new() -> Self {
        Self { rules: Vec::new() }
    }

    /// Register a custom rule ahead of the default policy.
    pub fn add_rule(
        &mut self,
        name: impl Into<String>,
        rule: impl Fn(&RoutingDecision, &SelectionHints) -> Option<ExecutionStrategy>
            + Send
            + Sync
            + 'static,
    ) {
        self.rules.push((name.into(), Box::new(rule)));
    }

    /// Select the execution strategy for a round.
    pub fn select(&self, decision: &RoutingDecision, hints: &SelectionHints) -> ExecutionStrategy {
        for (name, rule) in &self.rules {
            match catch_unwind(AssertUnwindSafe(|| rule(decision, hints))) {
                Ok(Some(strategy)) => {
                    tracing::debug!(rule = %name, strategy = %strategy, "Custom rule selected strategy");
                    return strategy;
                }
                Ok(None) => {}
                Err(_) => {
                    tracing::warn!(rule = %name, "Custom selection rule panicked, falling through");
                }
            }
        }
        self.default_policy(decision, hints)
    }

    /// Default policy: latency-sensitive rounds with ample budget fan
    /// out, reliability-first rounds serialize, consensus requirements
    /// win over both.
    fn default_policy(
        &self,
        decision: &RoutingDecision,
        hints: &SelectionHints,
    ) -> ExecutionStrategy {
        if hints.requires_consensus {
            return ExecutionStrategy::Consensus;
        }

        if hints.reliability_first {
            return if decision.alternatives.is_empty() {
                ExecutionStrategy::Sequential
            } else {
                ExecutionStrategy::Failover
            };
        }

        if hints.latency_sensitive && hints.budget_ample && hints.agent_count > 1 {
            return ExecutionStrategy::Parallel;
        }

        if hints.agent_count > 1 {
            ExecutionStrategy::Sequential
        } else {
            ExecutionStrategy::Direct
        }
    }
}

impl Default for StrategySelector {
    fn default() -> Self {
        Self::new()
    }
}
