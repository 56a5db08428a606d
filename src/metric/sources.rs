//! Per-source vertex tensors.
//!
//! Each source yields one tensor per vertex slot; the zero tensor means the
//! source does not constrain that vertex. Values are exact at vertices whose
//! star is complete on this rank and are refreshed from the owners before
//! they are returned.

use crate::algs::communicator::Communicator;
use crate::algs::exchange::allgather;
use crate::config::error::ConfigError;
use crate::geometry::metrics::{
    centroid, dot, norm, point_segment_distance, point_triangle_distance, side_normal, signed_measure, sub,
    Vec3,
};
use crate::geometry::tensor::{self, Mat, ZERO};
use crate::mesh_error::MeshAdaptError;
use crate::metric::{sync_metrics, MetricSource, MetricSourceKind};
use crate::topology::mesh::Mesh;
use crate::topology::simplex::{self, symm_ncomps, VERT};
use hashbrown::HashMap;

/// Interpolation error constant of linear simplices.
fn error_constant(dim: usize) -> f64 {
    if dim == 2 { 2.0 / 9.0 } else { 9.0 / 32.0 }
}

/// Turning angle per element the curvature source aims for, in radians.
pub const DEFAULT_CURVATURE_KNOB: f64 = 0.25;

/// Evaluate one source.
pub(crate) fn evaluate<C: Communicator>(
    mesh: &Mesh<C>,
    source: &MetricSource,
    nsmoothing_steps: usize,
) -> Result<Vec<Mat>, MeshAdaptError> {
    let dim = mesh.dim();
    let mut out = match source.kind {
        MetricSourceKind::Hessian => {
            let knob = source.knob.unwrap_or(1.0);
            let h = recover_hessians(mesh, &source.tag_name)?;
            let mut ms: Vec<Mat> = h
                .iter()
                .map(|h| tensor::scale(&tensor::abs(dim, h), error_constant(dim) / knob))
                .collect();
            for _ in 0..nsmoothing_steps {
                ms = smooth(mesh, &ms)?;
            }
            ms
        }
        MetricSourceKind::Given => given(mesh, source)?,
        MetricSourceKind::Implied => implied(mesh, source.knob.unwrap_or(1.0))?,
        MetricSourceKind::Proximity => proximity(mesh, source.knob.unwrap_or(1.0))?,
        MetricSourceKind::Curvature => curvature(mesh, source.knob.unwrap_or(DEFAULT_CURVATURE_KNOB))?,
    };
    for m in &mut out {
        if !tensor::is_zero(m) {
            *m = tensor::map_eigenvalues(dim, m, |l| l.abs());
        }
    }
    Ok(out)
}

fn vertex_scalar<C: Communicator>(mesh: &Mesh<C>, name: &str) -> Result<Vec<f64>, MeshAdaptError> {
    let ncomps = mesh.ncomps(VERT, name)?;
    if ncomps != 1 {
        return Err(ConfigError::InvalidValue {
            param: name.to_owned(),
            reason: format!("expected a scalar vertex field, found {ncomps} components"),
        }
        .into());
    }
    Ok(mesh.get_tag::<f64>(VERT, name)?.to_vec())
}

fn element_gradient(dim: usize, pts: &[Vec3], u: &[f64]) -> Option<Vec3> {
    let rows: Vec<Vec<f64>> = (1..=dim).map(|k| sub(pts[k], pts[0])[..dim].to_vec()).collect();
    let rhs: Vec<f64> = (1..=dim).map(|k| u[k] - u[0]).collect();
    let g = tensor::solve(&rows, &rhs)?;
    let mut out = [0.0; 3];
    out[..dim].copy_from_slice(&g);
    Some(out)
}

/// Volume-weighted average of the element gradients around each vertex,
/// `dim` components per slot.
pub(crate) fn recover_gradient<C: Communicator>(mesh: &Mesh<C>, u: &[f64]) -> Result<Vec<f64>, MeshAdaptError> {
    let dim = mesh.dim();
    let n = mesh.nslots(VERT);
    let mut acc = vec![0.0; n * dim];
    let mut weight = vec![0.0; n];
    for e in mesh.alive(dim) {
        let verts = mesh.verts_of(dim, e);
        let pts = mesh.elem_points(e);
        let vals: Vec<f64> = verts.iter().map(|&v| u[v]).collect();
        let Some(g) = element_gradient(dim, &pts, &vals) else {
            continue;
        };
        let w = signed_measure(dim, &pts).abs();
        for &v in verts {
            for k in 0..dim {
                acc[v * dim + k] += w * g[k];
            }
            weight[v] += w;
        }
    }
    for v in 0..n {
        if weight[v] > 0.0 {
            for k in 0..dim {
                acc[v * dim + k] /= weight[v];
            }
        }
    }
    mesh.sync_array(VERT, &mut acc, dim)?;
    Ok(acc)
}

/// Hessians of a scalar vertex field by recovering the gradient twice.
pub(crate) fn recover_hessians<C: Communicator>(mesh: &Mesh<C>, name: &str) -> Result<Vec<Mat>, MeshAdaptError> {
    let dim = mesh.dim();
    let u = vertex_scalar(mesh, name)?;
    let grad = recover_gradient(mesh, &u)?;
    let n = mesh.nslots(VERT);
    let mut h = vec![ZERO; n];
    for i in 0..dim {
        let component: Vec<f64> = (0..n).map(|v| grad[v * dim + i]).collect();
        let second = recover_gradient(mesh, &component)?;
        for (v, hv) in h.iter_mut().enumerate() {
            for j in 0..dim {
                hv[i][j] = second[v * dim + j];
            }
        }
    }
    for hv in &mut h {
        for i in 0..dim {
            for j in (i + 1)..dim {
                let s = 0.5 * (hv[i][j] + hv[j][i]);
                hv[i][j] = s;
                hv[j][i] = s;
            }
        }
    }
    Ok(h)
}

/// One step of log-Euclidean averaging over each vertex and its neighbors.
fn smooth<C: Communicator>(mesh: &Mesh<C>, ms: &[Mat]) -> Result<Vec<Mat>, MeshAdaptError> {
    let dim = mesh.dim();
    let mut out = ms.to_vec();
    for v in mesh.alive(VERT) {
        let group: Vec<Mat> = std::iter::once(v)
            .chain(mesh.vert_neighbors(v))
            .map(|u| ms[u])
            .filter(|m| !tensor::is_zero(m))
            .collect();
        if !group.is_empty() && !tensor::is_zero(&ms[v]) {
            let floor = f64::MIN_POSITIVE.sqrt();
            let lifted: Vec<Mat> = group
                .iter()
                .map(|m| tensor::map_eigenvalues(dim, m, |l| l.max(floor)))
                .collect();
            out[v] = tensor::log_euclidean_average(dim, &lifted, &vec![1.0; lifted.len()]);
        }
    }
    sync_metrics(mesh, &mut out)?;
    Ok(out)
}

fn given<C: Communicator>(mesh: &Mesh<C>, source: &MetricSource) -> Result<Vec<Mat>, MeshAdaptError> {
    let dim = mesh.dim();
    let ncomps = mesh.ncomps(VERT, &source.tag_name)?;
    let values = mesh.get_tag::<f64>(VERT, &source.tag_name)?;
    let symm = symm_ncomps(dim);
    if ncomps != 1 && ncomps != symm {
        return Err(ConfigError::InvalidValue {
            param: source.tag_name.clone(),
            reason: format!("a given metric needs 1 or {symm} components, found {ncomps}"),
        }
        .into());
    }
    let factor = source.knob.map_or(1.0, |k| 1.0 / (k * k));
    Ok((0..mesh.nslots(VERT))
        .map(|v| {
            let m = if ncomps == 1 {
                let h = values[v];
                if h > 0.0 { tensor::isotropic(dim, h) } else { ZERO }
            } else {
                tensor::from_packed(dim, &values[v * symm..(v + 1) * symm])
            };
            tensor::scale(&m, factor)
        })
        .collect())
}

/// The metric under which every element is unit-equilateral, averaged to
/// the vertices by element volume.
fn implied<C: Communicator>(mesh: &Mesh<C>, knob: f64) -> Result<Vec<Mat>, MeshAdaptError> {
    let dim = mesh.dim();
    let mut per_elem: HashMap<usize, (Mat, f64)> = HashMap::new();
    for e in mesh.alive(dim) {
        let pts = mesh.elem_points(e);
        let edges: Vec<Vec3> = simplex::template(dim, 1).iter().map(|t| sub(pts[t[1]], pts[t[0]])).collect();
        if let Some(m) = tensor::implied_by_edges(dim, &edges) {
            if tensor::is_spd(dim, &m) {
                per_elem.insert(e, (m, signed_measure(dim, &pts).abs()));
            }
        }
    }
    let factor = 1.0 / (knob * knob);
    let mut out = vec![ZERO; mesh.nslots(VERT)];
    for v in mesh.alive(VERT) {
        let (ms, ws): (Vec<Mat>, Vec<f64>) = mesh.star(v).iter().filter_map(|e| per_elem.get(e).copied()).unzip();
        if !ms.is_empty() {
            out[v] = tensor::scale(&tensor::log_euclidean_average(dim, &ms, &ws), factor);
        }
    }
    sync_metrics(mesh, &mut out)?;
    Ok(out)
}

/// An exposed side with its vertices in outward order.
struct ExposedSide {
    side: usize,
    verts: Vec<usize>,
    pts: Vec<Vec3>,
    normal: Vec3,
}

/// Sides with a single element. Counts are exact for sides through a vertex
/// whose star is complete on this rank.
fn exposed_sides<C: Communicator>(mesh: &Mesh<C>) -> Vec<ExposedSide> {
    let dim = mesh.dim();
    let side_dim = dim - 1;
    let mut out = Vec::new();
    for e in mesh.alive(dim) {
        let evs = mesh.verts_of(dim, e);
        let pts = mesh.elem_points(e);
        for (local, s) in mesh.sub_entities(dim, e, side_dim).into_iter().enumerate() {
            if mesh.elems_of(side_dim, s).len() != 1 {
                continue;
            }
            let tmpl = simplex::template(dim, side_dim)[local];
            let spts: Vec<Vec3> = tmpl.iter().map(|&k| pts[k]).collect();
            out.push(ExposedSide {
                side: s,
                verts: tmpl.iter().map(|&k| evs[k]).collect(),
                normal: side_normal(dim, &spts),
                pts: spts,
            });
        }
    }
    out
}

/// Boundary vertices sized by their distance to the nearest boundary side
/// they do not touch.
fn proximity<C: Communicator>(mesh: &Mesh<C>, knob: f64) -> Result<Vec<Mat>, MeshAdaptError> {
    let dim = mesh.dim();
    let side_dim = dim - 1;
    let sides = exposed_sides(mesh);
    let mut my_pts: Vec<[f64; 9]> = Vec::new();
    let mut my_gids: Vec<[u64; 3]> = Vec::new();
    for s in sides.iter().filter(|s| mesh.is_owned(side_dim, s.side)) {
        let mut p = [0.0; 9];
        let mut g = [u64::MAX; 3];
        for (k, (pt, &v)) in s.pts.iter().zip(&s.verts).enumerate() {
            p[3 * k..3 * k + 3].copy_from_slice(pt);
            g[k] = mesh.global(VERT, v).get();
        }
        my_pts.push(p);
        my_gids.push(g);
    }
    let all_pts: Vec<[f64; 9]> = allgather(mesh.comm(), &my_pts)?.concat();
    let all_gids: Vec<[u64; 3]> = allgather(mesh.comm(), &my_gids)?.concat();

    let mut boundary = vec![false; mesh.nslots(VERT)];
    for s in &sides {
        for &v in &s.verts {
            boundary[v] = true;
        }
    }
    let mut out = vec![ZERO; mesh.nslots(VERT)];
    for v in mesh.alive(VERT).filter(|&v| boundary[v]) {
        let gid = mesh.global(VERT, v).get();
        let p = mesh.coord(v);
        let nearest = all_pts
            .iter()
            .zip(&all_gids)
            .filter(|(_, g)| !g.contains(&gid))
            .map(|(q, _)| {
                let a = [q[0], q[1], q[2]];
                let b = [q[3], q[4], q[5]];
                if dim == 2 {
                    point_segment_distance(p, a, b)
                } else {
                    point_triangle_distance(p, a, b, [q[6], q[7], q[8]])
                }
            })
            .fold(f64::INFINITY, f64::min);
        if nearest.is_finite() && nearest > 0.0 {
            out[v] = tensor::isotropic(dim, nearest / knob);
        }
    }
    sync_metrics(mesh, &mut out)?;
    Ok(out)
}

/// Boundary vertices sized by the turning of the boundary normals within
/// one model side.
fn curvature<C: Communicator>(mesh: &Mesh<C>, knob: f64) -> Result<Vec<Mat>, MeshAdaptError> {
    let dim = mesh.dim();
    let side_dim = dim - 1;
    let sides = exposed_sides(mesh);
    let mut through: HashMap<usize, Vec<usize>> = HashMap::new();
    for (k, s) in sides.iter().enumerate() {
        for &v in &s.verts {
            through.entry(v).or_default().push(k);
        }
    }
    let mut out = vec![ZERO; mesh.nslots(VERT)];
    for (&v, ks) in &through {
        let mut kappa: f64 = 0.0;
        for (i, &a) in ks.iter().enumerate() {
            for &b in &ks[i + 1..] {
                let (sa, sb) = (&sides[a], &sides[b]);
                if mesh.class_of(side_dim, sa.side) != mesh.class_of(side_dim, sb.side) {
                    continue;
                }
                let angle = dot(sa.normal, sb.normal).clamp(-1.0, 1.0).acos();
                let span = norm(sub(centroid(&sa.pts), centroid(&sb.pts)));
                if span > 0.0 {
                    kappa = kappa.max(angle / span);
                }
            }
        }
        if kappa > 1e-12 {
            out[v] = tensor::isotropic(dim, knob / kappa);
        }
    }
    sync_metrics(mesh, &mut out)?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algs::communicator::NoComm;
    use crate::algs::meshgen::build_box;

    fn close(a: f64, b: f64, tol: f64) -> bool {
        (a - b).abs() <= tol * (1.0 + b.abs())
    }

    #[test]
    fn quadratic_field_recovers_its_hessian_inside() {
        let mut mesh = build_box(NoComm, 2, [1.0, 1.0, 0.0], [8, 8, 0]).unwrap();
        let u: Vec<f64> = (0..mesh.nslots(0))
            .map(|v| {
                let c = mesh.coord(v);
                c[0] * c[0] + 3.0 * c[1] * c[1]
            })
            .collect();
        mesh.add_tag(0, "u", 1, u).unwrap();
        let h = recover_hessians(&mesh, "u").unwrap();
        let center = mesh
            .alive(0)
            .find(|&v| {
                let c = mesh.coord(v);
                (c[0] - 0.5).abs() < 1e-12 && (c[1] - 0.5).abs() < 1e-12
            })
            .unwrap();
        assert!(close(h[center][0][0], 2.0, 0.05), "{:?}", h[center]);
        assert!(close(h[center][1][1], 6.0, 0.05), "{:?}", h[center]);
        assert!(h[center][0][1].abs() < 0.1);
    }

    #[test]
    fn linear_field_imposes_nothing() {
        let mut mesh = build_box(NoComm, 2, [1.0, 1.0, 0.0], [4, 4, 0]).unwrap();
        let u: Vec<f64> = (0..mesh.nslots(0)).map(|v| 2.0 * mesh.coord(v)[0] - mesh.coord(v)[1]).collect();
        mesh.add_tag(0, "u", 1, u).unwrap();
        let source = MetricSource::new(MetricSourceKind::Hessian, true, "u");
        let ms = evaluate(&mesh, &source, 0).unwrap();
        for m in ms {
            for row in m.iter().take(2) {
                for x in row.iter().take(2) {
                    assert!(x.abs() < 1e-8);
                }
            }
        }
    }

    #[test]
    fn implied_metric_of_a_uniform_grid_is_positive() {
        let mesh = build_box(NoComm, 3, [1.0; 3], [2, 2, 2]).unwrap();
        let ms = implied(&mesh, 1.0).unwrap();
        for v in mesh.alive(0) {
            assert!(tensor::is_spd(3, &ms[v]));
        }
    }

    #[test]
    fn isotropic_given_sizes_become_tensors() {
        let mut mesh = build_box(NoComm, 2, [1.0, 1.0, 0.0], [1, 1, 0]).unwrap();
        mesh.add_tag(0, "h", 1, vec![0.5; mesh.nslots(0)]).unwrap();
        let source = MetricSource::new(MetricSourceKind::Given, false, "h").with_knob(2.0);
        let ms = evaluate(&mesh, &source, 0).unwrap();
        // size 0.5 scaled by the knob to 1.0
        assert!(close(ms[0][0][0], 1.0, 1e-12));
    }

    #[test]
    fn proximity_sees_the_opposite_wall() {
        // a thin strip: boundary vertices are 0.1 away from the far side
        let mesh = build_box(NoComm, 2, [1.0, 0.1, 0.0], [10, 1, 0]).unwrap();
        let ms = proximity(&mesh, 1.0).unwrap();
        let v = mesh
            .alive(0)
            .find(|&v| {
                let c = mesh.coord(v);
                (c[0] - 0.5).abs() < 1e-12 && c[1] == 0.0
            })
            .unwrap();
        assert!(close(ms[v][0][0], 100.0, 1e-9));
    }

    #[test]
    fn flat_boundary_has_no_curvature() {
        let mut mesh = build_box(NoComm, 2, [1.0, 1.0, 0.0], [3, 3, 0]).unwrap();
        crate::topology::classify::classify_by_angles(&mut mesh, std::f64::consts::FRAC_PI_4).unwrap();
        let ms = curvature(&mesh, 0.25).unwrap();
        assert!(ms.iter().all(tensor::is_zero));
    }
}
