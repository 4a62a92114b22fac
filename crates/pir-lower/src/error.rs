use thiserror::Error;

use crate::source::{NodeId, ValueRef};

/// Errors raised while lowering a source graph into a target network.
#[derive(Debug, Error)]
pub enum LoweringError {
    #[error("{kind}: unsupported variant: {reason}")]
    UnsupportedVariant { kind: String, reason: String },
    #[error("{kind}: section list with unknown cardinality cannot be lowered")]
    UnsupportedDynamicSections { kind: String },
    #[error("no converter registered for '{kind}' at target version {version}")]
    NoConverter { kind: String, version: String },
    #[error(
        "conflicting converters for '{kind}' ({version}): '{existing}' already registered, got '{incoming}'"
    )]
    DuplicateConverter {
        kind: String,
        version: String,
        existing: String,
        incoming: String,
    },
    #[error("invalid graph: {reason}")]
    InvalidGraph { reason: String },
    #[error("operand #{index} of node {node} references unresolved value {value}")]
    UnresolvedOperand {
        node: NodeId,
        index: usize,
        value: ValueRef,
    },
    #[error("value is not a compile-time constant")]
    NotConstant,
    #[error("target network rejected layer: {message}")]
    Target { message: String },
    #[error("while lowering '{kind}' (node #{position}): {source}")]
    Node {
        kind: String,
        position: usize,
        #[source]
        source: Box<LoweringError>,
    },
    #[error("serialization error: {0}")]
    Serde(String),
}

pub type LoweringResult<T> = Result<T, LoweringError>;

impl LoweringError {
    pub fn invalid(reason: impl Into<String>) -> Self {
        LoweringError::InvalidGraph {
            reason: reason.into(),
        }
    }

    pub fn unsupported(kind: impl Into<String>, reason: impl Into<String>) -> Self {
        LoweringError::UnsupportedVariant {
            kind: kind.into(),
            reason: reason.into(),
        }
    }

    pub fn target(message: impl Into<String>) -> Self {
        LoweringError::Target {
            message: message.into(),
        }
    }

    /// Wraps `self` with the kind and topological position of the failing node.
    pub fn at_node(self, kind: &str, position: usize) -> Self {
        LoweringError::Node {
            kind: kind.to_string(),
            position,
            source: Box::new(self),
        }
    }

    /// Returns the innermost error, skipping node attribution wrappers.
    pub fn root_cause(&self) -> &LoweringError {
        match self {
            LoweringError::Node { source, .. } => source.root_cause(),
            other => other,
        }
    }

    pub fn is_not_constant(&self) -> bool {
        matches!(self.root_cause(), LoweringError::NotConstant)
    }

    pub fn is_unsupported(&self) -> bool {
        matches!(
            self.root_cause(),
            LoweringError::UnsupportedVariant { .. } | LoweringError::UnsupportedDynamicSections { .. }
        )
    }

    pub fn is_invalid_graph(&self) -> bool {
        matches!(
            self.root_cause(),
            LoweringError::InvalidGraph { .. } | LoweringError::UnresolvedOperand { .. }
        )
    }
}

impl From<serde_json::Error> for LoweringError {
    fn from(err: serde_json::Error) -> Self {
        LoweringError::Serde(err.to_string())
    }
}
