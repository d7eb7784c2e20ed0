//! Execution context and field values.
//!
//! `ExecutionContext` is the read-only input to every routing condition.
//! `ContextValue` is the closed set of value shapes agents may return,
//! so type comparisons are tag checks instead of reflection.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};

/// Tag identifying the shape of a [`ContextValue`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueKind {
    Number,
    String,
    Bool,
    List,
    Map,
    Null,
}

/// A field value produced by an agent or carried in context metadata.
///
/// Closed variant set: aggregation and conflict analysis compare tags
/// before comparing contents, so heterogeneous results can never panic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ContextValue {
    Null,
    Bool(bool),
    Number(f64),
    String(String),
    List(Vec<ContextValue>),
    Map(BTreeMap<String, ContextValue>),
}

impl ContextValue {
    /// The tag for this value.
    pub fn kind(&self) -> ValueKind {
        match self {
            ContextValue::Number(_) => ValueKind::Number,
            ContextValue::String(_) => ValueKind::String,
            ContextValue::Bool(_) => ValueKind::Bool,
            ContextValue::List(_) => ValueKind::List,
            ContextValue::Map(_) => ValueKind::Map,
            ContextValue::Null => ValueKind::Null,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, ContextValue::Null)
    }

    /// Numeric payload, if this is a Number.
    pub fn as_number(&self) -> Option<f64> {
        match self {
            ContextValue::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            ContextValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[ContextValue]> {
        match self {
            ContextValue::List(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&BTreeMap<String, ContextValue>> {
        match self {
            ContextValue::Map(entries) => Some(entries),
            _ => None,
        }
    }

    /// Whether this value counts as "empty" for first-success aggregation.
    pub fn is_empty(&self) -> bool {
        match self {
            ContextValue::Null => true,
            ContextValue::String(s) => s.is_empty(),
            ContextValue::List(items) => items.is_empty(),
            ContextValue::Map(entries) => entries.is_empty(),
            _ => false,
        }
    }

    /// Normalized form used for vote grouping and string conflict checks:
    /// strings are trimmed and lowercased, containers normalize elementwise.
    pub fn normalized(&self) -> ContextValue {
        match self {
            ContextValue::String(s) => ContextValue::String(s.trim().to_lowercase()),
            ContextValue::List(items) => {
                ContextValue::List(items.iter().map(|v| v.normalized()).collect())
            }
            ContextValue::Map(entries) => ContextValue::Map(
                entries
                    .iter()
                    .map(|(k, v)| (k.clone(), v.normalized()))
                    .collect(),
            ),
            other => other.clone(),
        }
    }
}

impl From<serde_json::Value> for ContextValue {
    fn from(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => ContextValue::Null,
            serde_json::Value::Bool(b) => ContextValue::Bool(b),
            serde_json::Value::Number(n) => ContextValue::Number(n.as_f64().unwrap_or(f64::NAN)),
            serde_json::Value::String(s) => ContextValue::String(s),
            serde_json::Value::Array(items) => {
                ContextValue::List(items.into_iter().map(ContextValue::from).collect())
            }
            serde_json::Value::Object(entries) => ContextValue::Map(
                entries
                    .into_iter()
                    .map(|(k, v)| (k, ContextValue::from(v)))
                    .collect(),
            ),
        }
    }
}

impl From<&str> for ContextValue {
    fn from(s: &str) -> Self {
        ContextValue::String(s.to_string())
    }
}

impl From<f64> for ContextValue {
    fn from(n: f64) -> Self {
        ContextValue::Number(n)
    }
}

impl From<bool> for ContextValue {
    fn from(b: bool) -> Self {
        ContextValue::Bool(b)
    }
}

/// Read-only input to routing condition evaluation.
///
/// Every field is optional or defaultable: conditions are total over
/// partial contexts and treat a missing field as a non-match.
///
/// # Example
///
/// ```
/// use cohort::context::ExecutionContext;
///
/// let ctx = ExecutionContext::new()
///     .with_token_estimate(1500)
///     .with_capability("code");
/// assert_eq!(ctx.token_estimate, Some(1500));
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionContext {
    /// Estimated input token count for the task
    pub token_estimate: Option<u32>,

    /// Confidence score attached to the task (0.0 to 1.0)
    pub confidence: Option<f64>,

    /// Capabilities available to the caller (e.g. "vision", "tools")
    pub capabilities: HashSet<String>,

    /// Declared cost budget in USD for the whole round
    pub cost_budget: Option<f64>,

    /// Context-type tag (e.g. "chat", "batch", "code-review")
    pub context_type: Option<String>,

    /// Free-form metadata consulted by custom rules
    pub metadata: HashMap<String, serde_json::Value>,
}

impl ExecutionContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_token_estimate(mut self, tokens: u32) -> Self {
        self.token_estimate = Some(tokens);
        self
    }

    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = Some(confidence);
        self
    }

    pub fn with_capability(mut self, capability: impl Into<String>) -> Self {
        self.capabilities.insert(capability.into());
        self
    }

    pub fn with_cost_budget(mut self, budget: f64) -> Self {
        self.cost_budget = Some(budget);
        self
    }

    pub fn with_context_type(mut self, context_type: impl Into<String>) -> Self {
        self.context_type = Some(context_type.into());
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }
}
