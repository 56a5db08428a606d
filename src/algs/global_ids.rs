//! Global id allocation without a per-entity lock.
//!
//! Entities created during a round carry provisional ids. At commit every
//! rank contributes its per-dimension creation count; an exclusive prefix
//! sum gives each rank a contiguous range starting at the mesh-wide
//! `next_gid[dim]`, and `next_gid` then advances by the global total.

use crate::algs::communicator::Communicator;
use crate::algs::exchange::{allreduce_max_u64, allreduce_sum_u64, exscan_u64};
use crate::mesh_error::MeshAdaptError;
use crate::topology::mesh::Mesh;
use crate::topology::point::GlobalId;

/// Final id ranges of one commit.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GidAllocator {
    base: [u64; 4],
    offset: [u64; 4],
    total: [u64; 4],
}

impl GidAllocator {
    /// Collective: agree on the ranges for `counts` local provisional ids.
    pub fn commit<C: Communicator>(comm: &C, next_gid: [u64; 4], counts: [u64; 4]) -> Result<Self, MeshAdaptError> {
        let offset = exscan_u64(comm, &counts)?;
        let total = allreduce_sum_u64(comm, &counts)?;
        Ok(Self {
            base: next_gid,
            offset: [offset[0], offset[1], offset[2], offset[3]],
            total: [total[0], total[1], total[2], total[3]],
        })
    }

    /// Final id of a (possibly provisional) id.
    pub fn resolve(&self, dim: usize, gid: GlobalId) -> GlobalId {
        match gid.provisional_index() {
            Some(k) => GlobalId::new(self.base[dim] + self.offset[dim] + k),
            None => gid,
        }
    }

    /// `next_gid` after this commit.
    pub fn next_gid(&self) -> [u64; 4] {
        std::array::from_fn(|d| self.base[d] + self.total[d])
    }

    /// Ids created mesh-wide by this commit, per dimension.
    pub fn created(&self) -> [u64; 4] {
        self.total
    }
}

impl<C: Communicator> Mesh<C> {
    /// Collective: raise `next_gid` above every committed id on any rank.
    pub(crate) fn sync_next_gid(&mut self) -> Result<(), MeshAdaptError> {
        let mut local = [0u64; 4];
        for (d, slot) in local.iter_mut().enumerate().take(self.dim() + 1) {
            let max_committed = self
                .alive(d)
                .map(|e| self.global(d, e))
                .filter(|g| g.provisional_index().is_none())
                .map(|g| g.get() + 1)
                .max()
                .unwrap_or(0);
            *slot = max_committed.max(self.next_gid(d));
        }
        let agreed = allreduce_max_u64(self.comm(), &local)?;
        for d in 0..=self.dim() {
            self.set_next_gid(d, agreed[d]);
        }
        Ok(())
    }

    /// Collective: give every provisional id on this rank its final value.
    pub fn commit_globals(&mut self) -> Result<(), MeshAdaptError> {
        let dim = self.dim();
        let mut counts = [0u64; 4];
        for (d, c) in counts.iter_mut().enumerate().take(dim + 1) {
            *c = self.provisional_count(d);
        }
        let next = std::array::from_fn(|d| if d <= dim { self.next_gid(d) } else { 0 });
        let alloc = GidAllocator::commit(self.comm(), next, counts)?;
        for d in 0..=dim {
            let slots: Vec<usize> = self.alive(d).collect();
            for e in slots {
                let gid = self.global(d, e);
                let resolved = alloc.resolve(d, gid);
                if resolved != gid {
                    self.set_global(d, e, resolved);
                }
            }
            self.set_next_gid(d, alloc.next_gid()[d]);
        }
        self.reset_provisional();
        Ok(())
    }
}
