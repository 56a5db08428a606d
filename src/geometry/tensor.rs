//! Small symmetric-tensor algebra for metric fields.
//!
//! Tensors are stored as `[[f64; 3]; 3]`; a two-dimensional tensor occupies
//! the leading 2×2 block and every routine takes the working dimension.
//! Packed layouts: 2D `xx yy xy`, 3D `xx yy zz xy yz xz`.

use crate::geometry::metrics::Vec3;

pub type Mat = [[f64; 3]; 3];

pub const ZERO: Mat = [[0.0; 3]; 3];

const JACOBI_SWEEPS: usize = 50;

pub fn identity(dim: usize) -> Mat {
    let mut m = ZERO;
    for (i, row) in m.iter_mut().enumerate().take(dim) {
        row[i] = 1.0;
    }
    m
}

pub fn from_packed(dim: usize, c: &[f64]) -> Mat {
    match dim {
        2 => [[c[0], c[2], 0.0], [c[2], c[1], 0.0], [0.0; 3]],
        3 => [[c[0], c[3], c[5]], [c[3], c[1], c[4]], [c[5], c[4], c[2]]],
        _ => panic!("no packed tensor layout for dimension {dim}"),
    }
}

pub fn to_packed(dim: usize, m: &Mat) -> Vec<f64> {
    match dim {
        2 => vec![m[0][0], m[1][1], m[0][1]],
        3 => vec![m[0][0], m[1][1], m[2][2], m[0][1], m[1][2], m[0][2]],
        _ => panic!("no packed tensor layout for dimension {dim}"),
    }
}

pub fn isotropic(dim: usize, size: f64) -> Mat {
    scale(&identity(dim), 1.0 / (size * size))
}

pub fn scale(m: &Mat, s: f64) -> Mat {
    let mut out = *m;
    for row in &mut out {
        for x in row {
            *x *= s;
        }
    }
    out
}

pub fn add(a: &Mat, b: &Mat) -> Mat {
    std::array::from_fn(|i| std::array::from_fn(|j| a[i][j] + b[i][j]))
}

pub fn mul(dim: usize, a: &Mat, b: &Mat) -> Mat {
    let mut out = ZERO;
    for i in 0..dim {
        for j in 0..dim {
            out[i][j] = (0..dim).map(|k| a[i][k] * b[k][j]).sum();
        }
    }
    out
}

pub fn transpose(m: &Mat) -> Mat {
    std::array::from_fn(|i| std::array::from_fn(|j| m[j][i]))
}

pub fn mat_vec(dim: usize, m: &Mat, v: Vec3) -> Vec3 {
    let mut out = [0.0; 3];
    for i in 0..dim {
        out[i] = (0..dim).map(|k| m[i][k] * v[k]).sum();
    }
    out
}

pub fn is_zero(m: &Mat) -> bool {
    m.iter().flatten().all(|&x| x == 0.0)
}

pub fn det(dim: usize, m: &Mat) -> f64 {
    match dim {
        2 => m[0][0] * m[1][1] - m[0][1] * m[1][0],
        3 => {
            m[0][0] * (m[1][1] * m[2][2] - m[1][2] * m[2][1])
                - m[0][1] * (m[1][0] * m[2][2] - m[1][2] * m[2][0])
                + m[0][2] * (m[1][0] * m[2][1] - m[1][1] * m[2][0])
        }
        _ => panic!("no determinant for dimension {dim}"),
    }
}

/// `sqrt(eᵀ M e)`.
pub fn metric_length(dim: usize, m: &Mat, e: Vec3) -> f64 {
    let me = mat_vec(dim, m, e);
    (0..dim).map(|i| e[i] * me[i]).sum::<f64>().max(0.0).sqrt()
}

/// Eigen-decomposition of a symmetric tensor by cyclic Jacobi rotations.
///
/// Returns `(q, l)` with eigenvectors as the columns of `q`.
pub fn eigen(dim: usize, m: &Mat) -> (Mat, [f64; 3]) {
    let mut a = *m;
    let mut q = identity(dim);
    for _ in 0..JACOBI_SWEEPS {
        let off: f64 = (0..dim)
            .flat_map(|i| ((i + 1)..dim).map(move |j| (i, j)))
            .map(|(i, j)| a[i][j] * a[i][j])
            .sum();
        let scale_sq: f64 = (0..dim).map(|i| a[i][i] * a[i][i]).sum::<f64>() + off;
        if off <= 1e-30 * scale_sq.max(f64::MIN_POSITIVE) {
            break;
        }
        for p in 0..dim {
            for r in (p + 1)..dim {
                if a[p][r] == 0.0 {
                    continue;
                }
                let theta = (a[r][r] - a[p][p]) / (2.0 * a[p][r]);
                let t = theta.signum() / (theta.abs() + (theta * theta + 1.0).sqrt());
                let t = if theta == 0.0 { 1.0 } else { t };
                let c = 1.0 / (t * t + 1.0).sqrt();
                let s = t * c;
                for k in 0..dim {
                    let (akp, akr) = (a[k][p], a[k][r]);
                    a[k][p] = c * akp - s * akr;
                    a[k][r] = s * akp + c * akr;
                }
                for k in 0..dim {
                    let (apk, ark) = (a[p][k], a[r][k]);
                    a[p][k] = c * apk - s * ark;
                    a[r][k] = s * apk + c * ark;
                }
                for k in 0..dim {
                    let (qkp, qkr) = (q[k][p], q[k][r]);
                    q[k][p] = c * qkp - s * qkr;
                    q[k][r] = s * qkp + c * qkr;
                }
            }
        }
    }
    let mut l = [0.0; 3];
    for (i, li) in l.iter_mut().enumerate().take(dim) {
        *li = a[i][i];
    }
    (q, l)
}

/// `Q diag(l) Qᵀ`.
pub fn compose(dim: usize, q: &Mat, l: &[f64; 3]) -> Mat {
    let mut out = ZERO;
    for i in 0..dim {
        for j in 0..dim {
            out[i][j] = (0..dim).map(|k| q[i][k] * l[k] * q[j][k]).sum();
        }
    }
    out
}

/// Apply `f` to the eigenvalues.
pub fn map_eigenvalues(dim: usize, m: &Mat, f: impl Fn(f64) -> f64) -> Mat {
    let (q, mut l) = eigen(dim, m);
    for li in l.iter_mut().take(dim) {
        *li = f(*li);
    }
    compose(dim, &q, &l)
}

pub fn is_spd(dim: usize, m: &Mat) -> bool {
    let (_, l) = eigen(dim, m);
    l[..dim].iter().all(|&x| x > 0.0 && x.is_finite())
}

/// Absolute value: eigenvalues replaced by their magnitudes.
pub fn abs(dim: usize, m: &Mat) -> Mat {
    map_eigenvalues(dim, m, f64::abs)
}

pub fn log(dim: usize, m: &Mat) -> Mat {
    map_eigenvalues(dim, m, |x| x.max(f64::MIN_POSITIVE).ln())
}

pub fn exp(dim: usize, m: &Mat) -> Mat {
    map_eigenvalues(dim, m, f64::exp)
}

/// Clamp eigenvalues into `[lo, hi]`.
pub fn clamp_eigenvalues(dim: usize, m: &Mat, lo: f64, hi: f64) -> Mat {
    map_eigenvalues(dim, m, |x| x.clamp(lo, hi))
}

/// Clamp the metric sizes `1/sqrt(λ)` into `[h_min, h_max]`.
pub fn clamp_sizes(dim: usize, m: &Mat, h_min: f64, h_max: f64) -> Mat {
    clamp_eigenvalues(dim, m, 1.0 / (h_max * h_max), 1.0 / (h_min * h_min))
}

/// Lower Cholesky factor of an SPD tensor.
fn cholesky(dim: usize, m: &Mat) -> Option<Mat> {
    let mut l = ZERO;
    for i in 0..dim {
        for j in 0..=i {
            let s: f64 = (0..j).map(|k| l[i][k] * l[j][k]).sum();
            if i == j {
                let d = m[i][i] - s;
                if d <= 0.0 {
                    return None;
                }
                l[i][j] = d.sqrt();
            } else {
                l[i][j] = (m[i][j] - s) / l[j][j];
            }
        }
    }
    Some(l)
}

/// Inverse of a lower-triangular matrix.
fn invert_lower(dim: usize, l: &Mat) -> Mat {
    let mut inv = ZERO;
    for i in 0..dim {
        inv[i][i] = 1.0 / l[i][i];
        for j in 0..i {
            let s: f64 = (j..i).map(|k| l[i][k] * inv[k][j]).sum();
            inv[i][j] = -s / l[i][i];
        }
    }
    inv
}

/// Metric intersection by simultaneous reduction.
///
/// The result prescribes, in every direction, the smaller of the two sizes.
/// A zero tensor imposes no constraint.
pub fn intersect(dim: usize, a: &Mat, b: &Mat) -> Mat {
    if is_zero(a) {
        return *b;
    }
    if is_zero(b) {
        return *a;
    }
    let Some(la) = cholesky(dim, a) else {
        return *b;
    };
    let li = invert_lower(dim, &la);
    let c = mul(dim, &mul(dim, &li, b), &transpose(&li));
    let (v, lambda) = eigen(dim, &c);
    let mut raised = [0.0; 3];
    for i in 0..dim {
        raised[i] = lambda[i].max(1.0);
    }
    let lv = mul(dim, &la, &v);
    symmetrize(&compose(dim, &lv, &raised))
}

/// Log-Euclidean weighted average of SPD tensors.
pub fn log_euclidean_average(dim: usize, ms: &[Mat], weights: &[f64]) -> Mat {
    let total: f64 = weights.iter().sum();
    if ms.is_empty() || total <= 0.0 {
        return ZERO;
    }
    let mut acc = ZERO;
    for (m, &w) in ms.iter().zip(weights) {
        acc = add(&acc, &scale(&log(dim, m), w / total));
    }
    exp(dim, &acc)
}

/// Interpolate between two SPD tensors in log space.
pub fn interpolate(dim: usize, a: &Mat, b: &Mat, t: f64) -> Mat {
    log_euclidean_average(dim, &[*a, *b], &[1.0 - t, t])
}

fn symmetrize(m: &Mat) -> Mat {
    std::array::from_fn(|i| std::array::from_fn(|j| 0.5 * (m[i][j] + m[j][i])))
}

/// Solve `A x = b` for a small dense system by partial pivoting.
pub fn solve(a: &[Vec<f64>], b: &[f64]) -> Option<Vec<f64>> {
    let n = b.len();
    let mut m: Vec<Vec<f64>> = a
        .iter()
        .zip(b)
        .map(|(row, &rhs)| {
            let mut r = row.clone();
            r.push(rhs);
            r
        })
        .collect();
    for col in 0..n {
        let pivot = (col..n).max_by(|&i, &j| m[i][col].abs().total_cmp(&m[j][col].abs()))?;
        if m[pivot][col].abs() < 1e-300 {
            return None;
        }
        m.swap(col, pivot);
        for row in (col + 1)..n {
            let f = m[row][col] / m[col][col];
            for k in col..=n {
                m[row][k] -= f * m[col][k];
            }
        }
    }
    let mut x = vec![0.0; n];
    for row in (0..n).rev() {
        let s: f64 = ((row + 1)..n).map(|k| m[row][k] * x[k]).sum();
        x[row] = (m[row][n] - s) / m[row][row];
    }
    Some(x)
}

/// The metric under which every listed edge has unit length.
///
/// Expects `symm_ncomps(dim)` edges of a non-degenerate simplex.
pub fn implied_by_edges(dim: usize, edges: &[Vec3]) -> Option<Mat> {
    let rows: Vec<Vec<f64>> = edges
        .iter()
        .map(|e| match dim {
            2 => vec![e[0] * e[0], e[1] * e[1], 2.0 * e[0] * e[1]],
            _ => vec![
                e[0] * e[0],
                e[1] * e[1],
                e[2] * e[2],
                2.0 * e[0] * e[1],
                2.0 * e[1] * e[2],
                2.0 * e[0] * e[2],
            ],
        })
        .collect();
    let ones = vec![1.0; rows.len()];
    solve(&rows, &ones).map(|c| from_packed(dim, &c))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn close(a: &Mat, b: &Mat, dim: usize, tol: f64) -> bool {
        (0..dim).all(|i| (0..dim).all(|j| (a[i][j] - b[i][j]).abs() <= tol * (1.0 + b[i][j].abs())))
    }

    fn spd(dim: usize) -> impl Strategy<Value = Mat> {
        (
            prop::array::uniform3(0.05f64..20.0),
            prop::array::uniform3(-3.0f64..3.0),
        )
            .prop_map(move |(l, angles)| {
                let q = rotation(dim, angles);
                compose(dim, &q, &l)
            })
    }

    fn rotation(dim: usize, a: [f64; 3]) -> Mat {
        let rz = [[a[0].cos(), -a[0].sin(), 0.0], [a[0].sin(), a[0].cos(), 0.0], [0.0, 0.0, 1.0]];
        if dim == 2 {
            return rz;
        }
        let ry = [[a[1].cos(), 0.0, a[1].sin()], [0.0, 1.0, 0.0], [-a[1].sin(), 0.0, a[1].cos()]];
        let rx = [[1.0, 0.0, 0.0], [0.0, a[2].cos(), -a[2].sin()], [0.0, a[2].sin(), a[2].cos()]];
        mul(3, &mul(3, &rz, &ry), &rx)
    }

    #[test]
    fn packed_layout_roundtrips_3d() {
        let c = [1.0, 2.0, 3.0, 0.1, 0.2, 0.3];
        assert_eq!(to_packed(3, &from_packed(3, &c)), c.to_vec());
    }

    #[test]
    fn intersection_with_zero_is_identity() {
        let m = isotropic(2, 0.5);
        assert_eq!(intersect(2, &ZERO, &m), m);
        assert_eq!(intersect(2, &m, &ZERO), m);
    }

    #[test]
    fn intersection_takes_smaller_size_per_axis() {
        let a = from_packed(2, &[1.0, 100.0, 0.0]);
        let b = from_packed(2, &[100.0, 1.0, 0.0]);
        let m = intersect(2, &a, &b);
        assert!(close(&m, &from_packed(2, &[100.0, 100.0, 0.0]), 2, 1e-9));
    }

    #[test]
    fn implied_metric_of_equilateral_is_isotropic() {
        let h = 0.5;
        let s = 3f64.sqrt() / 2.0 * h;
        let edges = [[h, 0.0, 0.0], [-h / 2.0, s, 0.0], [-h / 2.0, -s, 0.0]];
        let m = implied_by_edges(2, &edges).unwrap();
        assert!(close(&m, &isotropic(2, h), 2, 1e-9));
    }

    proptest! {
        #[test]
        fn eigen_recomposes(m in spd(3)) {
            let (q, l) = eigen(3, &m);
            prop_assert!(close(&compose(3, &q, &l), &m, 3, 1e-9));
        }

        #[test]
        fn intersection_is_spd_and_dominates(a in spd(3), b in spd(3)) {
            let m = intersect(3, &a, &b);
            prop_assert!(is_spd(3, &m));
            // m - a and m - b are positive semi-definite
            for other in [a, b] {
                let (_, l) = eigen(3, &add(&m, &scale(&other, -1.0)));
                let tol = 1e-7 * l.iter().fold(1.0f64, |x, y| x.max(y.abs()));
                prop_assert!(l.iter().all(|&x| x >= -tol));
            }
        }

        #[test]
        fn intersection_is_symmetric(a in spd(2), b in spd(2)) {
            prop_assert!(close(&intersect(2, &a, &b), &intersect(2, &b, &a), 2, 1e-7));
        }

        #[test]
        fn log_euclidean_average_of_copies_is_identity_map(m in spd(2)) {
            let avg = log_euclidean_average(2, &[m, m, m], &[1.0, 2.0, 3.0]);
            prop_assert!(close(&avg, &m, 2, 1e-8));
        }
    }
}
