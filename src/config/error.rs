//! Configuration errors for option validation

use thiserror::Error;

/// Errors raised while validating a parameter tree into option structures.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// A string parameter names no known enumeration member.
    #[error("unknown {kind} \"{value}\" for parameter \"{param}\"")]
    UnknownEnum {
        kind: &'static str,
        param: String,
        value: String,
    },
    /// A parameter list holds an entry no loader reads.
    #[error("unknown parameter \"{name}\" in \"{list}\"")]
    UnknownParameter { list: String, name: String },
    /// A required parameter is absent.
    #[error("missing required parameter \"{0}\"")]
    MissingEntry(String),
    /// A parameter holds a value of the wrong type.
    #[error("parameter \"{param}\" should be of type {expected}")]
    WrongType {
        param: String,
        expected: &'static str,
    },
    /// An entry that must be a sublist is a plain value.
    #[error("expected \"{0}\" to be a sublist")]
    ExpectedSublist(String),
    /// A Conserve/MomentumVelocity field has no single convergence entry.
    #[error("field \"{field}\": {reason}")]
    UnresolvedIntegral { field: String, reason: String },
    /// A value is out of its admissible range.
    #[error("parameter \"{param}\": {reason}")]
    InvalidValue { param: String, reason: String },
}
