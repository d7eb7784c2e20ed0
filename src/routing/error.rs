//! Error types for routing failures

use thiserror::Error;

/// Errors that can occur while building or validating a routing tree.
///
/// Tree evaluation itself never errors: a dead end yields a
/// "no viable route" decision and the caller decides whether that is fatal.
#[derive(Debug, Error)]
pub enum RoutingError {
    /// A path with this id is already registered on the tree
    #[error("duplicate path id '{path_id}'")]
    DuplicatePath { path_id: String },

    /// A node with this id is already registered on the tree
    #[error("duplicate node id '{node_id}'")]
    DuplicateNode { node_id: String },

    /// A node references a path id that was never registered
    #[error("node '{node_id}' references unknown path '{path_id}'")]
    UnknownPath { node_id: String, path_id: String },

    /// A node references a child node that was never registered
    #[error("node '{node_id}' references unknown node '{child_id}'")]
    UnknownNode { node_id: String, child_id: String },

    /// The node graph contains a cycle
    #[error("cycle detected through node '{node_id}'")]
    CycleDetected { node_id: String },

    /// The tree has no root node
    #[error("tree has no root node")]
    MissingRoot,

    /// A branch dead-ends with neither a leaf nor a default in scope
    #[error("a branch of node '{node_id}' reaches no leaf and has no default in scope")]
    UnterminatedBranch { node_id: String },
}
