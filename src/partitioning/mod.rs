//! Partition policies and space-filling-curve load balancing.
//!
//! [`Mesh::balance`] orders elements along a Morton curve over the global
//! bounding box and cuts the curve into equal pieces. The cut positions
//! depend only on the global element set, never on how it is currently
//! distributed.

use crate::algs::communicator::Communicator;
use crate::algs::exchange::{allgather, allreduce_max, allreduce_min, allreduce_sum_u64};
use crate::geometry::metrics::{centroid, norm, sub, Vec3};
use crate::mesh_error::MeshAdaptError;
use crate::topology::mesh::Mesh;
use crate::topology::simplex::VERT;
use hashbrown::HashSet;

/// Which entities a rank holds beyond its owned elements.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum PartitionPolicy {
    /// Owned elements and their closure only.
    ElementBased,
    /// Plus every element sharing a vertex with an owned element.
    #[default]
    Ghosted,
    /// Plus every element using a vertex this rank owns.
    VertexBased,
}

/// Axis-aligned bounding box.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct BBox {
    pub min: Vec3,
    pub max: Vec3,
}

impl BBox {
    /// The empty box (identity of [`BBox::unite`]).
    pub fn empty() -> Self {
        Self {
            min: [f64::INFINITY; 3],
            max: [f64::NEG_INFINITY; 3],
        }
    }

    pub fn of_point(p: Vec3) -> Self {
        Self { min: p, max: p }
    }

    pub fn unite(self, other: BBox) -> BBox {
        BBox {
            min: std::array::from_fn(|i| self.min[i].min(other.min[i])),
            max: std::array::from_fn(|i| self.max[i].max(other.max[i])),
        }
    }

    pub fn is_empty(&self) -> bool {
        (0..3).any(|i| self.min[i] > self.max[i])
    }

    pub fn diagonal(&self) -> f64 {
        if self.is_empty() {
            0.0
        } else {
            norm(sub(self.max, self.min))
        }
    }
}

/// Bounding box of a coordinate array with `dim` components per point.
pub fn find_bounding_box(dim: usize, coords: &[f64]) -> BBox {
    coords.chunks_exact(dim).fold(BBox::empty(), |b, c| {
        let mut p = [0.0; 3];
        p[..dim].copy_from_slice(c);
        b.unite(BBox::of_point(p))
    })
}

const MORTON_BUCKET_BITS: u32 = 16;

/// Morton code of `p` quantized inside `bbox`.
pub fn morton_code(dim: usize, bbox: &BBox, p: Vec3) -> u64 {
    let bits = 64 / dim as u32;
    let cells = (1u64 << bits) - 1;
    let q: Vec<u64> = (0..dim)
        .map(|a| {
            let span = bbox.max[a] - bbox.min[a];
            let t = if span > 0.0 { (p[a] - bbox.min[a]) / span } else { 0.0 };
            (t.clamp(0.0, 1.0) * cells as f64) as u64
        })
        .collect();
    let mut code = 0u64;
    for bit in (0..bits).rev() {
        for qa in &q {
            code = (code << 1) | ((qa >> bit) & 1);
        }
    }
    code
}

impl<C: Communicator> Mesh<C> {
    /// Collective: bounding box of every rank's vertices.
    pub fn bounding_box(&self) -> Result<BBox, MeshAdaptError> {
        let dim = self.dim();
        let coords = self.coords()?;
        let local = self
            .alive(VERT)
            .fold(BBox::empty(), |b, v| {
                b.unite(find_bounding_box(dim, &coords[v * dim..(v + 1) * dim]))
            });
        let min = allreduce_min(self.comm(), &local.min)?;
        let max = allreduce_max(self.comm(), &local.max)?;
        Ok(BBox {
            min: [min[0], min[1], min[2]],
            max: [max[0], max[1], max[2]],
        })
    }

    /// Collective: select a partition policy and rebuild the ghost layer.
    pub fn set_partition(&mut self, policy: PartitionPolicy) -> Result<(), MeshAdaptError> {
        self.set_policy_flag(policy);
        self.rebuild_ghosts()
    }

    /// Collective: redistribute owned elements into equal contiguous pieces
    /// of the Morton curve, then rebuild ghosts for the current policy.
    pub fn balance(&mut self) -> Result<(), MeshAdaptError> {
        let dim = self.dim();
        let size = self.nranks();
        let bbox = self.bounding_box()?;
        let owned: Vec<usize> = self.owned(dim).collect();
        let keys: Vec<[u64; 2]> = owned
            .iter()
            .map(|&e| {
                let c = centroid(&self.elem_points(e));
                [morton_code(dim, &bbox, c), self.global(dim, e).get()]
            })
            .collect();

        let shift = 64 - MORTON_BUCKET_BITS;
        let mut hist = vec![0u64; 1 << MORTON_BUCKET_BITS];
        for k in &keys {
            hist[(k[0] >> shift) as usize] += 1;
        }
        let hist = allreduce_sum_u64(self.comm(), &hist)?;
        let total: u64 = hist.iter().sum();
        if total == 0 {
            return self.rebuild_ghosts();
        }
        let mut start = vec![0u64; hist.len()];
        let mut acc = 0;
        for (b, &n) in hist.iter().enumerate() {
            start[b] = acc;
            acc += n;
        }
        let rank_of = |index: u64| ((index as u128 * size as u128 / total as u128) as usize).min(size - 1);

        // buckets whose elements straddle a rank boundary are ordered exactly
        let split: HashSet<usize> = (0..hist.len())
            .filter(|&b| hist[b] > 0 && rank_of(start[b]) != rank_of(start[b] + hist[b] - 1))
            .collect();
        let mine_in_split: Vec<[u64; 2]> = keys
            .iter()
            .copied()
            .filter(|k| split.contains(&((k[0] >> shift) as usize)))
            .collect();
        let mut all_split: Vec<[u64; 2]> = allgather(self.comm(), &mine_in_split)?.concat();
        all_split.sort_unstable();

        let mut dest = vec![0usize; self.nslots(dim)];
        for (&e, k) in owned.iter().zip(&keys) {
            let b = (k[0] >> shift) as usize;
            let index = if split.contains(&b) {
                let before = all_split.partition_point(|x| (x[0] >> shift) < b as u64);
                let pos = all_split.partition_point(|x| x < k);
                start[b] + (pos - before) as u64
            } else {
                start[b]
            };
            dest[e] = rank_of(index);
        }
        self.migrate_elements(&dest)?;
        self.rebuild_ghosts()?;
        log::debug!(
            "rank {}: balanced to {} owned elements of {total}",
            self.rank(),
            self.owned(dim).count()
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unite_grows_both_corners() {
        let a = BBox::of_point([0.0, 1.0, 0.0]);
        let b = BBox::of_point([2.0, -1.0, 0.0]);
        let c = a.unite(b);
        assert_eq!(c.min, [0.0, -1.0, 0.0]);
        assert_eq!(c.max, [2.0, 1.0, 0.0]);
        assert!(BBox::empty().is_empty());
        assert_eq!(BBox::empty().unite(a), a);
    }

    #[test]
    fn morton_orders_quadrants() {
        let bbox = BBox {
            min: [0.0; 3],
            max: [1.0, 1.0, 0.0],
        };
        let lo = morton_code(2, &bbox, [0.1, 0.1, 0.0]);
        let hi = morton_code(2, &bbox, [0.9, 0.9, 0.0]);
        let mid = morton_code(2, &bbox, [0.9, 0.1, 0.0]);
        assert!(lo < mid && mid < hi);
    }

    #[test]
    fn coordinates_bounding_box() {
        let b = find_bounding_box(2, &[0.0, 0.0, 3.0, -1.0, 1.0, 4.0]);
        assert_eq!(b.min, [0.0, -1.0, 0.0]);
        assert_eq!(b.max, [3.0, 4.0, 0.0]);
        assert!((b.diagonal() - 34f64.sqrt()).abs() < 1e-12);
    }
}
