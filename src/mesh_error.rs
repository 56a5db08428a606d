//! MeshAdaptError: unified error type for mesh-adapt public APIs
//!
//! The variants follow the adaptation error taxonomy: configuration errors
//! abort before any mutation, validation errors reject a single candidate,
//! convergence failures are reported and recovered from, and fatal invariant
//! violations abort the whole adapt invocation.

use crate::config::error::ConfigError;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Iterative limiter that stopped at its iteration cap.
#[derive(Debug, Error, Clone, PartialEq, Serialize, Deserialize)]
pub enum ConvergenceFailure {
    /// Gradation smoothing did not reach its tolerance.
    #[error("gradation limiting did not converge after {iterations} iterations (max change {max_change:.3e})")]
    Gradation { iterations: usize, max_change: f64 },
    /// Element-count scaling did not bring the predicted count into range.
    #[error("element count limiting did not converge after {iterations} iterations (predicted {predicted:.1})")]
    ElementCount { iterations: usize, predicted: f64 },
    /// A conserved integral drifted outside its comparison tolerance.
    #[error("integral `{integral}` outside tolerance: before {before:.6e}, after {after:.6e}")]
    Conservation {
        integral: String,
        before: f64,
        after: f64,
    },
}

/// Unified error type for mesh-adapt operations.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum MeshAdaptError {
    /// Option structures or a parameter tree failed validation.
    #[error("configuration error: {0}")]
    Configuration(#[from] ConfigError),
    /// A proposed edit or intermediate result is geometrically invalid.
    #[error("validation error: {0}")]
    Validation(String),
    /// An iterative limiter or conservation check did not converge.
    #[error("convergence failure: {0}")]
    Convergence(#[from] ConvergenceFailure),
    /// A protocol guarantee was broken (global id collision, ghost divergence).
    #[error("fatal invariant violation: {0}")]
    FatalInvariant(String),
    /// A tag was requested that does not exist on the given dimension.
    #[error("missing tag `{name}` on dimension {dim}")]
    MissingTag { dim: usize, name: String },
    /// A tag with this name already exists on the dimension.
    #[error("tag `{name}` already exists on dimension {dim}")]
    DuplicateTag { dim: usize, name: String },
    /// Tag array does not hold `nents * ncomps` values.
    #[error("tag `{name}` on dimension {dim}: expected {expected} values, found {found}")]
    TagSizeMismatch {
        dim: usize,
        name: String,
        expected: usize,
        found: usize,
    },
    /// Tag exists but stores a different value type.
    #[error("tag `{name}` on dimension {dim} has type {found}, expected {expected}")]
    TagTypeMismatch {
        dim: usize,
        name: String,
        expected: &'static str,
        found: &'static str,
    },
    /// Point-to-point communication with a neighbor failed.
    #[error("communication error with rank {neighbor}: {reason}")]
    Comm { neighbor: usize, reason: String },
    /// A received buffer could not be decoded.
    #[error("wire decode error: {0}")]
    Wire(String),
    /// Geometry is degenerate or malformed.
    #[error("invalid geometry: {0}")]
    InvalidGeometry(String),
    /// Mesh construction input is malformed.
    #[error("invalid mesh: {0}")]
    InvalidMesh(String),
}

impl MeshAdaptError {
    /// True for errors that abort an adapt invocation.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            MeshAdaptError::Validation(_) | MeshAdaptError::Convergence(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn convergence_failures_serialize() {
        let fail = ConvergenceFailure::Conservation {
            integral: "mass".to_owned(),
            before: 1.0,
            after: 1.5,
        };
        let json = serde_json::to_string(&fail).unwrap();
        let back: ConvergenceFailure = serde_json::from_str(&json).unwrap();
        assert_eq!(back, fail);
    }

    #[test]
    fn only_local_failures_are_recoverable() {
        assert!(!MeshAdaptError::Validation("collapse inverts".into()).is_fatal());
        assert!(MeshAdaptError::FatalInvariant("gid collision".into()).is_fatal());
    }
}
