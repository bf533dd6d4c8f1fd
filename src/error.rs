// error.rs — engine error taxonomy
//
// Graph-shape errors are authoring defects: nodes log them and degrade to an
// empty output. Resource and lifecycle errors are bookkeeping bugs and are
// fatal: they propagate out of `Tree::process_tree`.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    // ── Graph shape ──
    #[error("node {node} has no connection for required input '{field}'")]
    MissingInput { node: String, field: String },

    #[error("cycle detected in graph at node {0}")]
    Cycle(String),

    #[error("node id collision: {0} already exists in the graph")]
    GuidCollision(String),

    #[error("unknown node kind '{0}'")]
    UnknownNodeKind(String),

    #[error("node {0} not found in graph")]
    UnknownNode(String),

    #[error("invalid field '{field}' on node {node}: {reason}")]
    InvalidField {
        node: String,
        field: String,
        reason: String,
    },

    #[error("graph asset error: {0}")]
    Asset(String),

    #[error("job failed: {0}")]
    JobFailed(String),

    // ── Resources ──
    #[error("pool mismatch: instance of {found} returned to the pool of {expected}")]
    PoolMismatch { expected: String, found: String },

    #[error("buffer shape mismatch: expected {expected} cells, got {got}")]
    BufferShape { expected: usize, got: usize },

    #[error("keyed store entry '{0}' holds a different type")]
    StoreType(String),

    #[error("job substrate error: {0}")]
    JobSubstrate(String),

    // ── Lifecycle ──
    #[error("branch {0} used after close")]
    BranchClosed(usize),

    #[error("tree used after close")]
    TreeClosed,

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl EngineError {
    /// Resource and lifecycle violations indicate a bookkeeping bug and must
    /// not be swallowed at the node boundary.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            EngineError::PoolMismatch { .. }
                | EngineError::BufferShape { .. }
                | EngineError::StoreType(_)
                | EngineError::JobSubstrate(_)
                | EngineError::BranchClosed(_)
                | EngineError::TreeClosed
        )
    }

    pub fn missing_input(node: impl ToString, field: &str) -> Self {
        EngineError::MissingInput {
            node: node.to_string(),
            field: field.to_string(),
        }
    }

    pub fn invalid_field(node: impl ToString, field: &str, reason: impl Into<String>) -> Self {
        EngineError::InvalidField {
            node: node.to_string(),
            field: field.to_string(),
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn graph_shape_errors_are_not_fatal() {
        assert!(!EngineError::missing_input("a", "Input").is_fatal());
        assert!(!EngineError::Cycle("a".into()).is_fatal());
        assert!(!EngineError::GuidCollision("a".into()).is_fatal());
    }

    #[test]
    fn resource_errors_are_fatal() {
        assert!(EngineError::BufferShape { expected: 4, got: 3 }.is_fatal());
        assert!(EngineError::BranchClosed(2).is_fatal());
        assert!(EngineError::StoreType("k".into()).is_fatal());
    }

    #[test]
    fn messages_name_the_node() {
        let e = EngineError::missing_input("out", "Input");
        assert_eq!(
            e.to_string(),
            "node out has no connection for required input 'Input'"
        );
    }
}
