//! Limiters applied to the combined metric field.

use crate::algs::communicator::Communicator;
use crate::algs::exchange::{allreduce_max, allreduce_sum};
use crate::geometry::metrics::sub;
use crate::geometry::quality::{equilateral_measure, metric_measure};
use crate::geometry::tensor::{self, Mat};
use crate::mesh_error::{ConvergenceFailure, MeshAdaptError};
use crate::metric::sync_metrics;
use crate::topology::mesh::Mesh;
use crate::topology::simplex::VERT;

/// Clamp every size into `[h_min, h_max]`.
pub fn clamp_lengths(dim: usize, ms: &mut [Mat], h_min: f64, h_max: f64) {
    for m in ms {
        *m = tensor::clamp_sizes(dim, m, h_min, h_max);
    }
}

/// Frobenius norm over the leading `dim` block.
fn frobenius(dim: usize, m: &Mat) -> f64 {
    (0..dim)
        .flat_map(|i| (0..dim).map(move |j| (i, j)))
        .map(|(i, j)| m[i][j] * m[i][j])
        .sum::<f64>()
        .sqrt()
}

/// The metric `b` allows at the far end of `e`: sizes may grow by the
/// factor `1 + rate * l`, with `l` the length of `e` in `b`.
pub fn grown(dim: usize, b: &Mat, e: [f64; 3], rate: f64) -> Mat {
    let l = tensor::metric_length(dim, b, e);
    tensor::scale(b, 1.0 / (1.0 + rate * l).powi(2))
}

/// Collective: limit how fast sizes grow between neighboring vertices.
///
/// Each sweep intersects every vertex metric with the metrics its neighbors
/// allow, until the largest relative change falls below `tolerance`.
pub fn limit_gradation<C: Communicator>(
    mesh: &Mesh<C>,
    ms: &mut Vec<Mat>,
    rate: f64,
    tolerance: f64,
    max_iterations: usize,
) -> Result<Option<ConvergenceFailure>, MeshAdaptError> {
    let dim = mesh.dim();
    let mut max_change = f64::INFINITY;
    for it in 0..max_iterations {
        let mut next = ms.clone();
        let mut local_change: f64 = 0.0;
        for v in mesh.alive(VERT) {
            let pv = mesh.coord(v);
            let mut m = ms[v];
            for u in mesh.vert_neighbors(v) {
                let allowed = grown(dim, &ms[u], sub(pv, mesh.coord(u)), rate);
                m = tensor::intersect(dim, &m, &allowed);
            }
            let base = frobenius(dim, &ms[v]).max(f64::MIN_POSITIVE);
            let diff = tensor::add(&m, &tensor::scale(&ms[v], -1.0));
            local_change = local_change.max(frobenius(dim, &diff) / base);
            next[v] = m;
        }
        sync_metrics(mesh, &mut next)?;
        *ms = next;
        max_change = allreduce_max(mesh.comm(), &[local_change])?[0];
        log::trace!("gradation sweep {it}: max relative change {max_change:.3e}");
        if max_change < tolerance {
            return Ok(None);
        }
    }
    Ok(Some(ConvergenceFailure::Gradation {
        iterations: max_iterations,
        max_change,
    }))
}

/// Collective: predicted number of elements of a mesh conforming to `ms`.
pub fn predicted_element_count<C: Communicator>(mesh: &Mesh<C>, ms: &[Mat]) -> Result<f64, MeshAdaptError> {
    let dim = mesh.dim();
    let unit = equilateral_measure(dim);
    let local: f64 = mesh
        .owned(dim)
        .map(|e| {
            let metrics: Vec<Mat> = mesh.verts_of(dim, e).iter().map(|&v| ms[v]).collect();
            metric_measure(dim, &mesh.elem_points(e), &metrics).abs() / unit
        })
        .sum();
    Ok(allreduce_sum(mesh.comm(), &[local])?[0])
}

/// Scaling factor that moves a predicted `count` to `target`; metric
/// measures grow as `s^(dim/2)`.
pub fn count_scaling(dim: usize, count: f64, target: f64, over_relaxation: f64) -> f64 {
    if count <= 0.0 {
        return 1.0;
    }
    (target / count).powf(2.0 / dim as f64 * over_relaxation)
}
