//! Structural self-checks for meshes and tag arrays.
//!
//! Checks run after ghost rebuilds and commit rounds in debug builds, or in
//! release builds with the `check-invariants` / `strict-invariants` features.

use crate::mesh_error::MeshAdaptError;

/// Types that can validate their own structural invariants.
pub trait DebugInvariants {
    /// Panic on the first violation when invariant checking is enabled.
    fn debug_assert_invariants(&self);
    /// Validate invariants and return the first violation as a fatal error.
    fn validate_invariants(&self) -> Result<(), MeshAdaptError>;
}

/// `Ok(())` if `cond` holds, otherwise a [`MeshAdaptError::FatalInvariant`]
/// carrying the lazily built message.
#[inline]
pub fn ensure(cond: bool, msg: impl FnOnce() -> String) -> Result<(), MeshAdaptError> {
    if cond {
        Ok(())
    } else {
        Err(MeshAdaptError::FatalInvariant(msg()))
    }
}

/// Run a fallible check and panic with context on error when invariant
/// checking is enabled.
#[macro_export]
macro_rules! debug_invariants {
    ($expr:expr, $($ctx:tt)*) => {
        #[cfg(any(debug_assertions, feature = "strict-invariants", feature = "check-invariants"))]
        if let Err(e) = $expr {
            panic!(concat!("[invariants] ", $($ctx)*, ": {}"), e);
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ensure_builds_message_only_on_failure() {
        assert!(ensure(true, || unreachable!()).is_ok());
        let err = ensure(false, || "closure broken".to_string()).unwrap_err();
        assert!(err.is_fatal());
        assert!(err.to_string().contains("closure broken"));
    }
}
