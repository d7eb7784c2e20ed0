//! Routing conditions evaluated against an execution context.
//!
//! The condition set is closed and every condition is total: a missing or
//! unevaluable context field evaluates to `false`, never to an error.

use crate::context::ExecutionContext;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// A pure predicate over an [`ExecutionContext`].
///
/// Conditions compose through `All`/`Any`/`Not` to arbitrary depth.
/// Evaluation has no side effects, so a condition can be shared across
/// concurrent tree evaluations without locking.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RoutingCondition {
    /// Token estimate falls within the inclusive `[min, max]` window.
    /// Either bound may be open; a context without an estimate never matches.
    TokenThreshold { min: Option<u32>, max: Option<u32> },

    /// Confidence score is at least `min`.
    ConfidenceThreshold { min: f64 },

    /// Every required capability is present in the context capability set.
    CapabilitySubset { required: BTreeSet<String> },

    /// The `model_capabilities` metadata list contains the named capability.
    ModelCapability { capability: String },

    /// Declared cost budget is at most `max_cost`.
    CostCeiling { max_cost: f64 },

    /// Context-type tag equals `context_type` exactly.
    ContextTypeEquals { context_type: String },

    /// All child conditions hold. Empty list holds vacuously.
    All { conditions: Vec<RoutingCondition> },

    /// At least one child condition holds. Empty list never holds.
    Any { conditions: Vec<RoutingCondition> },

    /// The child condition does not hold.
    Not { condition: Box<RoutingCondition> },
}

impl RoutingCondition {
    /// Evaluate against a context. Total: never panics, never errors.
    pub fn evaluate(&self, ctx: &ExecutionContext) -> bool {
        match self {
            RoutingCondition::TokenThreshold { min, max } => match ctx.token_estimate {
                Some(tokens) => {
                    min.map_or(true, |m| tokens >= m) && max.map_or(true, |m| tokens <= m)
                }
                None => false,
            },
            RoutingCondition::ConfidenceThreshold { min } => {
                ctx.confidence.map_or(false, |c| c >= *min)
            }
            RoutingCondition::CapabilitySubset { required } => {
                required.iter().all(|cap| ctx.capabilities.contains(cap))
            }
            RoutingCondition::ModelCapability { capability } => ctx
                .metadata
                .get("model_capabilities")
                .and_then(|v| v.as_array())
                .map_or(false, |caps| {
                    caps.iter()
                        .filter_map(|c| c.as_str())
                        .any(|c| c == capability)
                }),
            RoutingCondition::CostCeiling { max_cost } => {
                ctx.cost_budget.map_or(false, |b| b <= *max_cost)
            }
            RoutingCondition::ContextTypeEquals { context_type } => {
                ctx.context_type.as_deref() == Some(context_type.as_str())
            }
            RoutingCondition::All { conditions } => conditions.iter().all(|c| c.evaluate(ctx)),
            RoutingCondition::Any { conditions } => conditions.iter().any(|c| c.evaluate(ctx)),
            RoutingCondition::Not { condition } => !condition.evaluate(ctx),
        }
    }

    /// Human-readable form used in decision traces.
    pub fn describe(&self) -> String {
        match self {
            RoutingCondition::TokenThreshold { min, max } => match (min, max) {
                (Some(min), Some(max)) => format!("tokens in [{}, {}]", min, max),
                (Some(min), None) => format!("tokens >= {}", min),
                (None, Some(max)) => format!("tokens <= {}", max),
                (None, None) => "tokens unbounded".to_string(),
            },
            RoutingCondition::ConfidenceThreshold { min } => format!("confidence >= {}", min),
            RoutingCondition::CapabilitySubset { required } => {
                format!("capabilities include {:?}", required)
            }
            RoutingCondition::ModelCapability { capability } => {
                format!("model supports '{}'", capability)
            }
            RoutingCondition::CostCeiling { max_cost } => format!("budget <= {}", max_cost),
            RoutingCondition::ContextTypeEquals { context_type } => {
                format!("context type == '{}'", context_type)
            }
            RoutingCondition::All { conditions } => {
                let parts: Vec<String> = conditions.iter().map(|c| c.describe()).collect();
                format!("all({})", parts.join(", "))
            }
            RoutingCondition::Any { conditions } => {
                let parts: Vec<String> = conditions.iter().map(|c| c.describe()).collect();
                format!("any({})", parts.join(", "))
            }
            RoutingCondition::Not { condition } => format!("not({})", condition.describe()),
        }
    }

    /// Convenience constructor for a maximum-token condition.
    pub fn max_tokens(max: u32) -> Self {
        RoutingCondition::TokenThreshold {
            min: None,
            max: Some(max),
        }
    }

    /// Convenience constructor for a minimum-token condition.
    pub fn min_tokens(min: u32) -> Self {
        RoutingCondition::TokenThreshold {
            min: Some(min),
            max: None,
        }
    }

    /// Convenience constructor for a capability-subset condition.
    pub fn requires_capabilities<I, S>(caps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        RoutingCondition::CapabilitySubset {
            required: caps.into_iter().map(Into::into).collect(),
        }
    }
}
