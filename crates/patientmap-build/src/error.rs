//! Error types for the patientmap-build crate.

use thiserror::Error;

use patientmap_core::{NodeKey, RelationshipKey, SchemaError};
use patientmap_graph::GraphError;

/// Why a single batch item was not applied. Always recoverable: the item is
/// recorded in the batch's failures and retried on the next iteration.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ItemError {
    #[error("Dangling reference: {relationship} points at missing {missing}")]
    DanglingReference {
        relationship: RelationshipKey,
        missing: NodeKey,
    },

    #[error("Malformed item: {0}")]
    Malformed(SchemaError),

    #[error("Condition {condition_id} is already owned by patient {owner}")]
    OwnershipConflict { condition_id: String, owner: String },

    #[error("Store call timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("Write '{operation}' refused: store handle is read-only")]
    CapabilityViolation { operation: &'static str },

    #[error("Store error after {attempts} attempt(s): {message}")]
    Store { attempts: u32, message: String },
}

impl ItemError {
    /// Classify a store error for the batch report.
    pub fn from_graph(err: GraphError, attempts: u32) -> Self {
        match err {
            GraphError::DanglingReference {
                relationship,
                missing,
            } => Self::DanglingReference {
                relationship,
                missing,
            },
            GraphError::Malformed(e) => Self::Malformed(e),
            GraphError::OwnershipConflict {
                condition_id,
                owner,
            } => Self::OwnershipConflict {
                condition_id,
                owner,
            },
            GraphError::CapabilityViolation { operation } => {
                Self::CapabilityViolation { operation }
            }
            other => Self::Store {
                attempts,
                message: other.to_string(),
            },
        }
    }

    pub fn is_dangling(&self) -> bool {
        matches!(self, Self::DanglingReference { .. })
    }

    /// Failures that may succeed if the same item is submitted again.
    /// Dangling, malformed, conflicting and refused items fail the same way
    /// until the input or the graph changes.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Timeout { .. } | Self::Store { .. })
    }
}

/// Loop- and analysis-level errors.
#[derive(Error, Debug)]
pub enum BuildError {
    #[error("Build stalled: no progress for {iterations} consecutive iterations")]
    Stalled { iterations: u32 },

    #[error("Iteration ceiling of {max_iterations} reached with gaps remaining")]
    CeilingReached { max_iterations: u32 },

    #[error("Graph error: {0}")]
    Graph(#[from] GraphError),

    #[error("Graph read timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },
}

pub type Result<T> = std::result::Result<T, BuildError>;
