//! Decision-tree routing for task dispatch
//!
//! This module implements the routing logic that selects an execution
//! path for each task by walking a tree of conditions against the
//! task's execution context. Trees are immutable once built and are
//! shared freely across concurrent evaluations.

use std::collections::{BTreeSet, HashMap};
use std::time::Instant;

pub mod condition;
pub mod error;
pub mod strategy;

pub use condition::RoutingCondition;
pub use error::RoutingError;
pub use strategy::{ExecutionStrategy, SelectionHints, StrategySelector};

use crate::context::ExecutionContext;
use serde::{Deserialize, Serialize};

/// A named candidate execution target. Immutable once registered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutingPath {
    /// Unique path identifier
    pub path_id: String,

    /// Opaque worker/model identifier the orchestrator dispatches to
    pub target: String,

    /// Capabilities the context must provide for this path to be viable
    pub required_capabilities: BTreeSet<String>,

    /// Higher priority wins ties among alternatives
    pub priority: i32,

    /// Free-form metadata
    pub metadata: HashMap<String, String>,
}

impl RoutingPath {
    pub fn new(path_id: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            path_id: path_id.into(),
            target: target.into(),
            required_capabilities: BTreeSet::new(),
            priority: 0,
            metadata: HashMap::new(),
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_required_capability(mut self, capability: impl Into<String>) -> Self {
        self.required_capabilities.insert(capability.into());
        self
    }

    /// Whether the context satisfies this path's capability requirements.
    pub fn viable_for(&self, ctx: &ExecutionContext) -> bool {
        self.required_capabilities
            .iter()
            .all(|cap| ctx.capabilities.contains(cap))
    }
}

/// Where a node branch leads: an inner node or a terminal path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum Branch {
    Node(String),
    Path(String),
}

/// One decision point in the tree.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingNode {
    /// Unique node identifier
    pub node_id: String,

    /// Condition evaluated against the execution context
    pub condition: RoutingCondition,

    /// Followed when the condition holds; a missing branch is a dead end
    pub on_true: Option<Branch>,

    /// Followed when the condition does not hold
    pub on_false: Option<Branch>,

    /// Path used when traversal below this node dead-ends
    pub default_path: Option<String>,
}

impl RoutingNode {
    pub fn new(node_id: impl Into<String>, condition: RoutingCondition) -> Self {
        Self {
            node_id: node_id.into(),
            condition,
            on_true: None,
            on_false: None,
            default_path: None,
        }
    }

    pub fn on_true(mut self, branch: Branch) -> Self {
        self.on_true = Some(branch);
        self
    }

    pub fn on_false(mut self, branch: Branch) -> Self {
        self.on_false = Some(branch);
        self
    }

    pub fn with_default(mut self, path_id: impl Into<String>) -> Self {
        self.default_path = Some(path_id.into());
        self
    }
}

/// One condition evaluation recorded during tree traversal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceEntry {
    /// Node at which the condition ran
    pub node_id: String,

    /// Human-readable condition description
    pub condition: String,

    /// Evaluation outcome
    pub matched: bool,
}

/// Ordered log of condition evaluations leading to a routing outcome.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DecisionTrace {
    pub entries: Vec<TraceEntry>,
}

impl DecisionTrace {
    /// Number of conditions evaluated.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// One line per evaluation, for operator logs.
    pub fn render(&self) -> String {
        self.entries
            .iter()
            .map(|e| {
                format!(
                    "{}: {} -> {}",
                    e.node_id,
                    e.condition,
                    if e.matched { "true" } else { "false" }
                )
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// How the traversal terminated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RouteOutcome {
    /// A leaf path was reached through condition branches
    Leaf,
    /// Traversal dead-ended and fell back to a declared default path
    Default,
    /// Traversal dead-ended with no default in scope
    NoRoute,
}

/// Output of tree evaluation.
///
/// A dead end without a default is reported as a decision with no
/// selected path, not as an error; callers decide whether that is fatal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingDecision {
    /// Selected path id, absent when no route was viable
    pub path_id: Option<String>,

    /// Dispatch target of the selected path
    pub target: Option<String>,

    /// How the traversal terminated
    pub outcome: RouteOutcome,

    /// Decision confidence in [0, 1]
    pub confidence: f64,

    /// Ordered log of every condition evaluated
    pub trace: DecisionTrace,

    /// Viable-but-not-chosen path ids, descending priority, for failover
    pub alternatives: Vec<String>,
}

impl RoutingDecision {
    /// Whether a path was selected.
    pub fn is_routed(&self) -> bool {
        self.path_id.is_some()
    }
}

/// Decision tree mapping execution contexts to routing paths.
///
/// Built once through `add_path`/`add_node`/`set_root`, then shared
/// read-only (typically behind an `Arc`) across concurrent evaluations.
///
/// # Examples
///
/// ```
/// use cohort::routing::{Branch, RoutingCondition, RoutingNode, RoutingPath, RoutingTree};
/// use cohort::context::ExecutionContext;
///
/// let mut tree = RoutingTree::new();
/// tree.add_path(RoutingPath::new("path_fast", "small-model")).unwrap();
/// tree.add_path(RoutingPath::new("path_heavy", "large-model")).unwrap();
/// tree.add_node(
///     RoutingNode::new("root", RoutingCondition::min_tokens(1001))
///         .on_true(Branch::Path("path_heavy".into()))
///         .on_false(Branch::Path("path_fast".into())),
/// ).unwrap();
/// tree.set_root("root");
///
/// let decision = tree.evaluate(&ExecutionContext::new().with_token_estimate(500));
/// assert_eq!(decision.path_id.as_deref(), Some("path_fast"));
/// ```
#[derive(Debug, Default)]
pub struct RoutingTree {
    paths: HashMap<String, RoutingPath>,
    nodes: HashMap<String, RoutingNode>,
    /// Path ids in registration order, for deterministic tie-breaking
    path_order: Vec<String>,
    root: Option<String>,
}

impl RoutingTree {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a candidate path.
    ///
    /// # Errors
    ///
    /// Returns `RoutingError::DuplicatePath` if the path id is taken.
    pub fn add_path(&mut self, path: RoutingPath) -> Result<(), RoutingError> {
        if self.paths.contains_key(&path.path_id) {
            return Err(RoutingError::DuplicatePath {
                path_id: path.path_id,
            });
        }
        self.path_order.push(path.path_id.clone());
        self.paths.insert(path.path_id.clone(), path);
        Ok(())
    }

    /// Register a decision node.
    ///
    /// # Errors
    ///
    /// Returns `RoutingError::DuplicateNode` if the node id is taken.
    pub fn add_node(&mut self, node: RoutingNode) -> Result<(), RoutingError> {
        if self.nodes.contains_key(&node.node_id) {
            return Err(RoutingError::DuplicateNode {
                node_id: node.node_id,
            });
        }
        self.nodes.insert(node.node_id.clone(), node);
        Ok(())
    }

    /// Declare the traversal entry point.
    pub fn set_root(&mut self, node_id: impl Into<String>) {
        self.root = Some(node_id.into());
    }

    /// Look up a registered path.
    pub fn path(&self, path_id: &str) -> Option<&RoutingPath> {
        self.paths.get(path_id)
    }

    /// Number of registered paths.
    pub fn path_count(&self) -> usize {
        self.paths.len()
    }

    /// Walk the tree against a context and produce a decision.
    ///
    /// Deterministic: the same tree and context always yield the same
    /// path id and an identical trace.
    pub fn evaluate(&self, ctx: &ExecutionContext) -> RoutingDecision {
        let started = Instant::now();
        let mut trace = DecisionTrace::default();

        let outcome = self.walk(ctx, &mut trace);

        let (path_id, route_outcome) = match outcome {
            WalkOutcome::Leaf(path_id) => (Some(path_id), RouteOutcome::Leaf),
            WalkOutcome::Default(path_id) => (Some(path_id), RouteOutcome::Default),
            WalkOutcome::DeadEnd => (None, RouteOutcome::NoRoute),
        };

        let confidence = match route_outcome {
            // Deeper chains carry less certainty
            RouteOutcome::Leaf => (1.0 - 0.05 * trace.len() as f64).max(0.5),
            RouteOutcome::Default => 0.4,
            RouteOutcome::NoRoute => 0.0,
        };

        let alternatives = self.alternatives_for(ctx, path_id.as_deref());
        let target = path_id
            .as_deref()
            .and_then(|id| self.paths.get(id))
            .map(|p| p.target.clone());

        metrics::histogram!("cohort_routing_duration_seconds")
            .record(started.elapsed().as_secs_f64());
        metrics::counter!("cohort_routing_evaluations_total").increment(1);

        tracing::debug!(
            path = path_id.as_deref().unwrap_or("<none>"),
            outcome = ?route_outcome,
            conditions = trace.len(),
            "Routing evaluation completed"
        );

        RoutingDecision {
            path_id,
            target,
            outcome: route_outcome,
            confidence,
            trace,
            alternatives,
        }
    }

    fn walk(&self, ctx: &ExecutionContext, trace: &mut DecisionTrace) -> WalkOutcome {
        let Some(root) = self.root.as_deref() else {
            return WalkOutcome::DeadEnd;
        };

        let mut current = root;
        // Nearest default declared on the walk so far
        let mut active_default: Option<&str> = None;
        // Bound traversal by node count so an unvalidated cyclic tree
        // terminates with a dead end instead of spinning
        let mut remaining = self.nodes.len() + 1;

        loop {
            if remaining == 0 {
                return self.fall_back(active_default);
            }
            remaining -= 1;

            let Some(node) = self.nodes.get(current) else {
                return self.fall_back(active_default);
            };

            if node.default_path.is_some() {
                active_default = node.default_path.as_deref();
            }

            let matched = node.condition.evaluate(ctx);
            trace.entries.push(TraceEntry {
                node_id: node.node_id.clone(),
                condition: node.condition.describe(),
                matched,
            });

            let branch = if matched { &node.on_true } else { &node.on_false };
            match branch {
                Some(Branch::Path(path_id)) => {
                    if self.paths.contains_key(path_id) {
                        return WalkOutcome::Leaf(path_id.clone());
                    }
                    return self.fall_back(active_default);
                }
                Some(Branch::Node(node_id)) => current = node_id,
                None => return self.fall_back(active_default),
            }
        }
    }

    fn fall_back(&self, default: Option<&str>) -> WalkOutcome {
        match default {
            Some(path_id) if self.paths.contains_key(path_id) => {
                WalkOutcome::Default(path_id.to_string())
            }
            _ => WalkOutcome::DeadEnd,
        }
    }

    /// Paths viable for the context that were not chosen, ordered by
    /// descending priority then registration order.
    fn alternatives_for(&self, ctx: &ExecutionContext, chosen: Option<&str>) -> Vec<String> {
        let mut viable: Vec<&RoutingPath> = self
            .path_order
            .iter()
            .filter_map(|id| self.paths.get(id))
            .filter(|p| Some(p.path_id.as_str()) != chosen && p.viable_for(ctx))
            .collect();
        viable.sort_by(|a, b| b.priority.cmp(&a.priority));
        viable.into_iter().map(|p| p.path_id.clone()).collect()
    }

    /// Check structural integrity: a root exists, all branch references
    /// resolve, the node graph is acyclic, and every branch reaches a
    /// leaf or has a default in scope.
    pub fn validate(&self) -> Result<(), RoutingError> {
        let Some(root) = self.root.as_deref() else {
            return Err(RoutingError::MissingRoot);
        };
        if !self.nodes.contains_key(root) {
            return Err(RoutingError::UnknownNode {
                node_id: "<root>".to_string(),
                child_id: root.to_string(),
            });
        }

        let mut visiting = BTreeSet::new();
        let mut visited = BTreeSet::new();
        self.check_node(root, false, &mut visiting, &mut visited)
    }

    fn check_node(
        &self,
        node_id: &str,
        inherited_default: bool,
        visiting: &mut BTreeSet<String>,
        visited: &mut BTreeSet<String>,
    ) -> Result<(), RoutingError> {
        if visiting.contains(node_id) {
            return Err(RoutingError::CycleDetected {
                node_id: node_id.to_string(),
            });
        }
        if visited.contains(node_id) {
            return Ok(());
        }

        let node = self
            .nodes
            .get(node_id)
            .expect("caller verifies node exists");

        let has_default = inherited_default || node.default_path.is_some();
        if let Some(default) = &node.default_path {
            if !self.paths.contains_key(default) {
                return Err(RoutingError::UnknownPath {
                    node_id: node_id.to_string(),
                    path_id: default.clone(),
                });
            }
        }

        visiting.insert(node_id.to_string());
        for branch in [&node.on_true, &node.on_false] {
            match branch {
                Some(Branch::Path(path_id)) => {
                    if !self.paths.contains_key(path_id) {
                        return Err(RoutingError::UnknownPath {
                            node_id: node_id.to_string(),
                            path_id: path_id.clone(),
                        });
                    }
                }
                Some(Branch::Node(child_id)) => {
                    if !self.nodes.contains_key(child_id) {
                        return Err(RoutingError::UnknownNode {
                            node_id: node_id.to_string(),
                            child_id: child_id.clone(),
                        });
                    }
                    self.check_node(child_id, has_default, visiting, visited)?;
                }
                None => {
                    if !has_default {
                        return Err(RoutingError::UnterminatedBranch {
                            node_id: node_id.to_string(),
                        });
                    }
                }
            }
        }
        visiting.remove(node_id);
        visited.insert(node_id.to_string());
        Ok(())
    }
}

enum WalkOutcome {
    Leaf(String),
    Default(String),
    DeadEnd,
}
