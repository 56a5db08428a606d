//! `GlobalId`: a strong, zero-cost handle for globally identified mesh entities
//!
//! Every entity (vertex, edge, face, region) carries a mesh-wide unique
//! identifier that survives migration and ghosting. Local storage indexes
//! entities by dense `usize` slots; `GlobalId` is the only identity that is
//! meaningful across ranks.
//!
//! Identifiers are allocated per dimension. Freshly created entities first
//! receive a *provisional* id (counting down from `u64::MAX`) so that they
//! still sort after every committed id; the round commit rewrites them to
//! their final value.

use std::fmt;

#[derive(
    Copy,
    Clone,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    serde::Serialize,
    serde::Deserialize,
    bytemuck::Pod,
    bytemuck::Zeroable,
)]
#[repr(transparent)]
pub struct GlobalId(u64);

/// Provisional ids occupy the top of the id space.
const PROVISIONAL_BASE: u64 = u64::MAX;
const PROVISIONAL_SPAN: u64 = 1 << 40;

impl GlobalId {
    /// Wrap a raw committed identifier.
    #[inline]
    pub const fn new(raw: u64) -> Self {
        GlobalId(raw)
    }

    /// The raw identifier.
    #[inline]
    pub const fn get(self) -> u64 {
        self.0
    }

    /// The `k`-th provisional identifier of the current round.
    ///
    /// Provisional ids compare greater than every committed id and keep
    /// creation order.
    #[inline]
    pub fn provisional(k: u64) -> Self {
        assert!(k < PROVISIONAL_SPAN, "provisional id space exhausted");
        GlobalId(PROVISIONAL_BASE - PROVISIONAL_SPAN + 1 + k)
    }

    /// Returns the creation index when this id is provisional.
    #[inline]
    pub fn provisional_index(self) -> Option<u64> {
        let start = PROVISIONAL_BASE - PROVISIONAL_SPAN + 1;
        (self.0 >= start).then(|| self.0 - start)
    }
}

impl fmt::Debug for GlobalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.provisional_index() {
            Some(k) => write!(f, "GlobalId(provisional {k})"),
            None => f.debug_tuple("GlobalId").field(&self.0).finish(),
        }
    }
}

impl fmt::Display for GlobalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// `GlobalId` travels over MPI as a `u64`.
#[cfg(feature = "mpi-support")]
unsafe impl mpi::datatype::Equivalence for GlobalId {
    type Out = <u64 as mpi::datatype::Equivalence>::Out;

    fn equivalent_datatype() -> Self::Out {
        u64::equivalent_datatype()
    }
}

#[cfg(test)]
mod layout_tests {
    use super::*;
    use static_assertions::assert_eq_size;

    assert_eq_size!(GlobalId, u64);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provisional_ids_sort_after_committed_in_creation_order() {
        let committed = GlobalId::new(1_000_000);
        let p0 = GlobalId::provisional(0);
        let p1 = GlobalId::provisional(1);
        assert!(committed < p0);
        assert!(p0 < p1);
        assert_eq!(p1.provisional_index(), Some(1));
        assert_eq!(committed.provisional_index(), None);
    }

    #[test]
    fn display_prints_raw_value() {
        assert_eq!(format!("{}", GlobalId::new(42)), "42");
        assert_eq!(format!("{:?}", GlobalId::new(7)), "GlobalId(7)");
    }
}
