//! Element quality and edge length measured in a metric.
//!
//! Quality is the mean-ratio shape measure evaluated in metric space,
//! `q = (V_M / (c_d · l_rms^d))^(2/d)`, where `V_M = V·sqrt(det M)`, `l_rms`
//! is the root-mean-square metric edge length and `c_d` the measure of the
//! unit equilateral simplex. `q = 1` for a unit-equilateral element; the
//! sign follows the element orientation, so inverted elements are negative.

use crate::geometry::metrics::{signed_measure, sub, Vec3};
use crate::geometry::tensor::{self, Mat};
use crate::topology::simplex;

/// Measure of the unit-edge equilateral simplex.
pub fn equilateral_measure(dim: usize) -> f64 {
    match dim {
        2 => 3f64.sqrt() / 4.0,
        3 => 1.0 / (6.0 * 2f64.sqrt()),
        _ => panic!("no equilateral simplex measure for dimension {dim}"),
    }
}

/// Arithmetic average of tensors.
pub fn average_metric(ms: &[Mat]) -> Mat {
    let mut acc = tensor::ZERO;
    for m in ms {
        acc = tensor::add(&acc, m);
    }
    tensor::scale(&acc, 1.0 / ms.len().max(1) as f64)
}

/// Metric length of the segment `a → b` under the average of the endpoint metrics.
pub fn edge_length(dim: usize, a: Vec3, b: Vec3, ma: &Mat, mb: &Mat) -> f64 {
    let m = average_metric(&[*ma, *mb]);
    tensor::metric_length(dim, &m, sub(b, a))
}

/// Mean-ratio quality of a simplex under a single metric.
pub fn quality_in_metric(dim: usize, pts: &[Vec3], m: &Mat) -> f64 {
    let volume = signed_measure(dim, pts) * tensor::det(dim, m).max(0.0).sqrt();
    let mut sum_sq = 0.0;
    let edges = simplex::template(dim, 1);
    for e in edges {
        let l = tensor::metric_length(dim, m, sub(pts[e[1]], pts[e[0]]));
        sum_sq += l * l;
    }
    let l_rms = (sum_sq / edges.len() as f64).sqrt();
    if l_rms <= 0.0 {
        return 0.0;
    }
    let ratio = volume / (equilateral_measure(dim) * l_rms.powi(dim as i32));
    ratio.signum() * ratio.abs().powf(2.0 / dim as f64)
}

/// Quality of a simplex under the average of its vertex metrics.
pub fn element_quality(dim: usize, pts: &[Vec3], metrics: &[Mat]) -> f64 {
    quality_in_metric(dim, pts, &average_metric(metrics))
}

/// Element measure in metric space, used to predict element counts.
pub fn metric_measure(dim: usize, pts: &[Vec3], metrics: &[Mat]) -> f64 {
    let m = average_metric(metrics);
    signed_measure(dim, pts) * tensor::det(dim, &m).max(0.0).sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn equilateral_triangle_has_unit_quality() {
        let h = 0.3;
        let pts = [[0.0; 3], [h, 0.0, 0.0], [h / 2.0, h * 3f64.sqrt() / 2.0, 0.0]];
        let q = quality_in_metric(2, &pts, &tensor::identity(2));
        assert!((q - 1.0).abs() < 1e-12);
    }

    #[test]
    fn regular_tet_has_unit_quality_and_inversion_is_negative() {
        let mut pts = [
            [1.0, 1.0, 1.0],
            [1.0, -1.0, -1.0],
            [-1.0, 1.0, -1.0],
            [-1.0, -1.0, 1.0],
        ];
        let m = tensor::identity(3);
        let q = quality_in_metric(3, &pts, &m);
        let q = if q < 0.0 {
            pts.swap(1, 2);
            quality_in_metric(3, &pts, &m)
        } else {
            q
        };
        assert!((q - 1.0).abs() < 1e-12);
        pts.swap(1, 2);
        assert!(quality_in_metric(3, &pts, &m) < 0.0);
    }

    #[test]
    fn stretched_metric_recovers_quality_of_stretched_element() {
        // a triangle squashed by 1/2 in y is equilateral under M = diag(1, 4)
        let pts = [[0.0; 3], [1.0, 0.0, 0.0], [0.5, 3f64.sqrt() / 4.0, 0.0]];
        let m = tensor::from_packed(2, &[1.0, 4.0, 0.0]);
        assert!((quality_in_metric(2, &pts, &m) - 1.0).abs() < 1e-12);
        assert!(quality_in_metric(2, &pts, &tensor::identity(2)) < 0.9);
    }

    #[test]
    fn edge_length_averages_endpoint_metrics() {
        let a = tensor::isotropic(2, 1.0);
        let b = tensor::isotropic(2, 0.5);
        let l = edge_length(2, [0.0; 3], [1.0, 0.0, 0.0], &a, &b);
        assert!((l - 2.5f64.sqrt()).abs() < 1e-12);
    }
}
