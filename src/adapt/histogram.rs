//! Quality and length statistics gathered at pass boundaries.

use crate::algs::communicator::Communicator;
use crate::algs::exchange::{allreduce_max, allreduce_min, allreduce_sum_u64};
use crate::mesh_error::MeshAdaptError;
use crate::topology::cavity::AdaptView;
use crate::topology::simplex::EDGE;
use std::fmt;

/// Global histogram over a fixed range; values outside it land in the first
/// or last bin.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Histogram {
    pub min: f64,
    pub max: f64,
    pub bins: Vec<u64>,
}

impl Histogram {
    fn new(min: f64, max: f64, nbins: usize) -> Self {
        Self {
            min,
            max,
            bins: vec![0; nbins.max(1)],
        }
    }

    fn insert(&mut self, x: f64) {
        let n = self.bins.len();
        let width = (self.max - self.min) / n as f64;
        let k = if width > 0.0 { ((x - self.min) / width).floor() } else { 0.0 };
        let k = (k.max(0.0) as usize).min(n - 1);
        self.bins[k] += 1;
    }

    pub fn total(&self) -> u64 {
        self.bins.iter().sum()
    }

    /// Collective: sum the bins over all ranks.
    fn reduce<C: Communicator>(mut self, comm: &C) -> Result<Self, MeshAdaptError> {
        self.bins = allreduce_sum_u64(comm, &self.bins)?;
        Ok(self)
    }
}

impl fmt::Display for Histogram {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let width = (self.max - self.min) / self.bins.len() as f64;
        for (k, count) in self.bins.iter().enumerate() {
            let lo = self.min + k as f64 * width;
            writeln!(f, "  [{:.3}, {:.3}): {count}", lo, lo + width)?;
        }
        Ok(())
    }
}

/// Mesh-wide quality and length summary.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct MeshStats {
    pub nelems: u64,
    pub min_quality: f64,
    pub min_length: f64,
    pub max_length: f64,
    pub quality: Histogram,
    pub length: Histogram,
}

impl fmt::Display for MeshStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} elements, quality >= {:.4}, lengths in [{:.4}, {:.4}]",
            self.nelems, self.min_quality, self.min_length, self.max_length
        )
    }
}

/// Collective: statistics of the owned elements and edges of the view.
pub fn mesh_stats<C: Communicator>(
    view: &AdaptView<'_, C>,
    length_range: (f64, f64),
    nlength_bins: usize,
    nquality_bins: usize,
) -> Result<MeshStats, MeshAdaptError> {
    let mesh = view.mesh();
    let dim = mesh.dim();
    let mut quality = Histogram::new(0.0, 1.0, nquality_bins);
    let mut length = Histogram::new(length_range.0, length_range.1, nlength_bins);
    let mut min_quality = f64::INFINITY;
    for e in mesh.owned(dim) {
        let q = view.quality(e);
        min_quality = min_quality.min(q);
        quality.insert(q);
    }
    let (mut lo, mut hi) = (f64::INFINITY, 0.0f64);
    for e in mesh.owned(EDGE) {
        let l = view.edge_length(e);
        lo = lo.min(l);
        hi = hi.max(l);
        length.insert(l);
    }
    let comm = mesh.comm();
    let quality = quality.reduce(comm)?;
    let length = length.reduce(comm)?;
    let mins = allreduce_min(comm, &[min_quality, lo])?;
    let maxs = allreduce_max(comm, &[hi])?;
    Ok(MeshStats {
        nelems: quality.total(),
        min_quality: mins[0],
        min_length: mins[1],
        max_length: maxs[0],
        quality,
        length,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algs::communicator::NoComm;
    use crate::algs::meshgen::build_box;
    use crate::geometry::tensor;
    use crate::topology::mesh::METRIC;

    #[test]
    fn out_of_range_values_clamp_to_the_end_bins() {
        let mut h = Histogram::new(0.0, 3.0, 3);
        for x in [-1.0, 0.5, 1.5, 2.9, 7.0] {
            h.insert(x);
        }
        assert_eq!(h.bins, vec![2, 1, 2]);
    }

    #[test]
    fn stats_count_every_element_and_edge() {
        let mut mesh = build_box(NoComm, 2, [1.0, 1.0, 0.0], [2, 2, 0]).unwrap();
        let m = tensor::to_packed(2, &tensor::isotropic(2, 0.5));
        let values: Vec<f64> = (0..mesh.nslots(0)).flat_map(|_| m.clone()).collect();
        mesh.add_tag(0, METRIC, 3, values).unwrap();
        let view = AdaptView::new(&mesh, METRIC).unwrap();
        let stats = mesh_stats(&view, (0.0, 3.0), 10, 10).unwrap();
        assert_eq!(stats.nelems, 8);
        assert_eq!(stats.length.total(), mesh.nents(EDGE) as u64);
        assert!((stats.min_length - 1.0).abs() < 1e-12);
        assert!((stats.max_length - 2f64.sqrt()).abs() < 1e-12);
    }
}
