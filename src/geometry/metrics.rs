//! Simplex measures and point-location helpers.
//!
//! Points are `[f64; 3]`; two-dimensional meshes leave the third component
//! at zero. Vertex ordering follows [`crate::topology::simplex`].

use crate::mesh_error::MeshAdaptError;

pub(crate) const EPS: f64 = 1e-12;

pub type Vec3 = [f64; 3];

#[inline]
pub fn sub(a: Vec3, b: Vec3) -> Vec3 {
    [a[0] - b[0], a[1] - b[1], a[2] - b[2]]
}

#[inline]
pub fn add(a: Vec3, b: Vec3) -> Vec3 {
    [a[0] + b[0], a[1] + b[1], a[2] + b[2]]
}

#[inline]
pub fn scale(a: Vec3, s: f64) -> Vec3 {
    [a[0] * s, a[1] * s, a[2] * s]
}

#[inline]
pub fn dot(a: Vec3, b: Vec3) -> f64 {
    a[0] * b[0] + a[1] * b[1] + a[2] * b[2]
}

#[inline]
pub fn cross(a: Vec3, b: Vec3) -> Vec3 {
    [
        a[1] * b[2] - a[2] * b[1],
        a[2] * b[0] - a[0] * b[2],
        a[0] * b[1] - a[1] * b[0],
    ]
}

#[inline]
pub fn norm(a: Vec3) -> f64 {
    dot(a, a).sqrt()
}

/// Linear interpolation `a + t (b - a)`.
#[inline]
pub fn lerp(a: Vec3, b: Vec3, t: f64) -> Vec3 {
    add(a, scale(sub(b, a), t))
}

/// Signed area (dim 2) or volume (dim 3) of a simplex.
pub fn signed_measure(dim: usize, pts: &[Vec3]) -> f64 {
    match dim {
        1 => norm(sub(pts[1], pts[0])),
        2 => {
            let (a, b) = (sub(pts[1], pts[0]), sub(pts[2], pts[0]));
            0.5 * (a[0] * b[1] - a[1] * b[0])
        }
        3 => {
            let (a, b, c) = (sub(pts[1], pts[0]), sub(pts[2], pts[0]), sub(pts[3], pts[0]));
            dot(a, cross(b, c)) / 6.0
        }
        _ => panic!("no simplex measure in dimension {dim}"),
    }
}

/// Unsigned measure of a side (segment length or triangle area) in 3-space.
pub fn side_measure(pts: &[Vec3]) -> f64 {
    match pts.len() {
        2 => norm(sub(pts[1], pts[0])),
        3 => 0.5 * norm(cross(sub(pts[1], pts[0]), sub(pts[2], pts[0]))),
        n => panic!("no side measure for {n} vertices"),
    }
}

pub fn centroid(pts: &[Vec3]) -> Vec3 {
    let mut c = [0.0; 3];
    for p in pts {
        c = add(c, *p);
    }
    scale(c, 1.0 / pts.len() as f64)
}

/// Barycentric coordinates of `p` in a simplex.
pub fn barycentric(dim: usize, pts: &[Vec3], p: Vec3) -> Result<Vec<f64>, MeshAdaptError> {
    let total = signed_measure(dim, pts);
    if total.abs() < EPS * EPS {
        return Err(MeshAdaptError::InvalidGeometry(format!(
            "degenerate simplex (measure {total:.3e})"
        )));
    }
    let mut out = Vec::with_capacity(dim + 1);
    for i in 0..=dim {
        let mut sub_pts = pts.to_vec();
        sub_pts[i] = p;
        out.push(signed_measure(dim, &sub_pts) / total);
    }
    Ok(out)
}

/// Unit normal of a side; in 2D the side is a segment in the XY plane.
///
/// For sides taken from [`crate::topology::simplex::template`] of a
/// positively oriented element the normal points out of the element.
pub fn side_normal(dim: usize, pts: &[Vec3]) -> Vec3 {
    let n = match dim {
        2 => {
            let t = sub(pts[1], pts[0]);
            [t[1], -t[0], 0.0]
        }
        3 => cross(sub(pts[1], pts[0]), sub(pts[2], pts[0])),
        _ => panic!("no side normal in dimension {dim}"),
    };
    let len = norm(n);
    if len < EPS {
        [0.0; 3]
    } else {
        scale(n, 1.0 / len)
    }
}

/// Distance from `p` to a segment.
pub fn point_segment_distance(p: Vec3, a: Vec3, b: Vec3) -> f64 {
    let ab = sub(b, a);
    let len2 = dot(ab, ab);
    let t = if len2 < EPS * EPS {
        0.0
    } else {
        (dot(sub(p, a), ab) / len2).clamp(0.0, 1.0)
    };
    norm(sub(p, lerp(a, b, t)))
}

/// Distance from `p` to a triangle in 3-space.
pub fn point_triangle_distance(p: Vec3, a: Vec3, b: Vec3, c: Vec3) -> f64 {
    let n = cross(sub(b, a), sub(c, a));
    let n2 = dot(n, n);
    if n2 > EPS * EPS {
        let d = dot(sub(p, a), n) / n2;
        let q = sub(p, scale(n, d));
        let inside = [(a, b), (b, c), (c, a)]
            .iter()
            .all(|&(u, v)| dot(cross(sub(v, u), sub(q, u)), n) >= 0.0);
        if inside {
            return norm(sub(p, q));
        }
    }
    point_segment_distance(p, a, b)
        .min(point_segment_distance(p, b, c))
        .min(point_segment_distance(p, c, a))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reference_measures() {
        let tri = [[0.0, 0.0, 0.0], [1.0, 0.0, 0.0], [0.0, 1.0, 0.0]];
        assert!((signed_measure(2, &tri) - 0.5).abs() < EPS);
        let tet = [[0.0; 3], [1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 1.0]];
        assert!((signed_measure(3, &tet) - 1.0 / 6.0).abs() < EPS);
    }

    #[test]
    fn barycentric_weights_sum_to_one() {
        let tri = [[0.0, 0.0, 0.0], [2.0, 0.0, 0.0], [0.0, 2.0, 0.0]];
        let w = barycentric(2, &tri, [0.5, 0.5, 0.0]).unwrap();
        assert!((w.iter().sum::<f64>() - 1.0).abs() < EPS);
        assert!((w[1] - 0.25).abs() < EPS);
    }

    #[test]
    fn degenerate_barycentric_errors() {
        let tri = [[0.0; 3], [1.0, 0.0, 0.0], [2.0, 0.0, 0.0]];
        assert!(barycentric(2, &tri, [0.0; 3]).is_err());
    }

    #[test]
    fn triangle_distance_projects_inside() {
        let d = point_triangle_distance(
            [0.25, 0.25, 2.0],
            [0.0; 3],
            [1.0, 0.0, 0.0],
            [0.0, 1.0, 0.0],
        );
        assert!((d - 2.0).abs() < EPS);
    }

    #[test]
    fn side_normal_points_outward() {
        // edge (0,1) of a counter-clockwise triangle lies at y = 0
        let n = side_normal(2, &[[0.0; 3], [1.0, 0.0, 0.0]]);
        assert!(n[1] < 0.0);
    }
}
