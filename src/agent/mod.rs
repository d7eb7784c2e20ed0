//! Agent definitions, per-attempt results, and the worker boundary.
//!
//! The engine never talks to a model or network itself: it dispatches
//! through the [`WorkerBackend`] trait and consumes [`AgentResult`]s.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::time::Duration;
use thiserror::Error;

use crate::context::ContextValue;

/// Registration record for an agent that may be dispatched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentDefinition {
    /// Unique agent identifier
    pub agent_id: String,

    /// Capabilities this agent provides
    pub capabilities: BTreeSet<String>,

    /// Higher priority wins conflict resolution ties
    pub priority: i32,

    /// Per-call timeout in milliseconds
    pub timeout_ms: u64,

    /// Retry budget per round before a failure snapshot is final
    pub max_retries: u32,
}

impl AgentDefinition {
    pub fn new(agent_id: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            capabilities: BTreeSet::new(),
            priority: 0,
            timeout_ms: 30_000,
            max_retries: 0,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_capability(mut self, capability: impl Into<String>) -> Self {
        self.capabilities.insert(capability.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// The unit of work handed to a worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// Unique task identifier, used for correlation and tracing
    pub task_id: String,

    /// Opaque task payload
    pub input: serde_json::Value,
}

impl Task {
    pub fn new(input: serde_json::Value) -> Self {
        Self {
            task_id: uuid::Uuid::new_v4().to_string(),
            input,
        }
    }

    pub fn with_id(task_id: impl Into<String>, input: serde_json::Value) -> Self {
        Self {
            task_id: task_id.into(),
            input,
        }
    }
}

/// One agent's output for a coordination round.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentResult {
    /// Agent that produced this result
    pub agent_id: String,

    /// Result value
    pub value: ContextValue,

    /// Agent-reported confidence (0.0 to 1.0)
    pub confidence: f64,

    /// Priority inherited from the agent definition
    pub priority: i32,

    /// Whether the invocation succeeded
    pub succeeded: bool,

    /// Failure description when `succeeded` is false
    pub error: Option<String>,

    /// Wall-clock duration of the invocation in milliseconds
    pub duration_ms: u64,

    /// Cost of the invocation in USD
    pub cost_usd: f64,

    /// Tokens consumed by the invocation
    pub tokens: u32,
}

impl AgentResult {
    /// A successful result with the given value.
    pub fn success(agent_id: impl Into<String>, value: ContextValue) -> Self {
        Self {
            agent_id: agent_id.into(),
            value,
            confidence: 1.0,
            priority: 0,
            succeeded: true,
            error: None,
            duration_ms: 0,
            cost_usd: 0.0,
            tokens: 0,
        }
    }

    /// A failed result carrying an error description.
    pub fn failure(agent_id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            value: ContextValue::Null,
            confidence: 0.0,
            priority: 0,
            succeeded: false,
            error: Some(error.into()),
            duration_ms: 0,
            cost_usd: 0.0,
            tokens: 0,
        }
    }

    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = confidence;
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_cost(mut self, cost_usd: f64, tokens: u32) -> Self {
        self.cost_usd = cost_usd;
        self.tokens = tokens;
        self
    }

    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration_ms = duration.as_millis() as u64;
        self
    }
}

/// Errors surfaced at the worker boundary.
///
/// Dispatch failures are isolated per agent: they never abort the round
/// unless the active strategy's success criterion cannot be met.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// The worker did not return within its deadline plus grace
    #[error("agent '{agent_id}' timed out after {timeout_ms}ms")]
    Timeout { agent_id: String, timeout_ms: u64 },

    /// The worker returned an error
    #[error("agent '{agent_id}' failed: {reason}")]
    WorkerFailed { agent_id: String, reason: String },

    /// The invocation was cancelled before completion
    #[error("agent '{agent_id}' cancelled")]
    Cancelled { agent_id: String },

    /// The round's quorum could not be met
    #[error("quorum not met: {received}/{required} results, missing {missing:?}")]
    QuorumNotMet {
        required: usize,
        received: usize,
        missing: Vec<String>,
    },

    /// No agents were supplied for the round
    #[error("no agents supplied for coordination round")]
    NoAgents,
}

impl DispatchError {
    /// Agent this error is attributable to, when per-agent.
    pub fn agent_id(&self) -> Option<&str> {
        match self {
            DispatchError::Timeout { agent_id, .. }
            | DispatchError::WorkerFailed { agent_id, .. }
            | DispatchError::Cancelled { agent_id } => Some(agent_id),
            _ => None,
        }
    }
}

/// Executes a single unit of work for one agent.
///
/// Implementations must honor the deadline: the orchestrator treats a
/// worker that has not returned within `deadline` plus its configured
/// grace period as hung and excludes it from aggregation.
#[async_trait]
pub trait WorkerBackend: Send + Sync {
    async fn invoke(
        &self,
        agent: &AgentDefinition,
        task: &Task,
        deadline: Duration,
    ) -> Result<AgentResult, DispatchError>;
}
