//! Vertex relocation for quality.

use crate::adapt::AdaptOpts;
use crate::algs::communicator::Communicator;
use crate::geometry::metrics::{add, norm, scale, sub, Vec3};
use crate::geometry::tensor::{self, Mat};
use crate::topology::cavity::{AdaptView, EditPlan, NewElement, NewVertex, OpKind, Rejection, VertRef, VertexOrigin};
use crate::topology::simplex::VERT;
use crate::transfer::locate;

/// Metric at `p` interpolated in log space from the cavity element holding it.
fn metric_at<C: Communicator>(view: &AdaptView<'_, C>, cavity: &[usize], v: usize, p: Vec3) -> Mat {
    let mesh = view.mesh();
    let dim = mesh.dim();
    match locate(mesh, cavity, p) {
        Some((e, weights)) => {
            let ms: Vec<Mat> = mesh.verts_of(dim, e).iter().map(|&x| *view.metric(x)).collect();
            tensor::log_euclidean_average(dim, &ms, &weights)
        }
        None => *view.metric(v),
    }
}

/// Plan moving interior vertex `v` by gradient ascent on its cavity's
/// minimum quality.
pub fn plan_move<C: Communicator>(view: &AdaptView<'_, C>, v: usize, opts: &AdaptOpts) -> Result<EditPlan, Rejection> {
    let mesh = view.mesh();
    let dim = mesh.dim();
    if mesh.class_of(VERT, v).0 != dim as i8 {
        return Err(Rejection::NotEligible);
    }
    let cavity = mesh.star(v).to_vec();
    let quality_before = view.min_quality(&cavity);
    if cavity.is_empty() || quality_before >= opts.min_quality_desired {
        return Err(Rejection::NotEligible);
    }
    let neighbors = mesh.vert_neighbors(v);
    let origin = view.point(v);
    let mean_len = neighbors
        .iter()
        .map(|&u| norm(sub(view.point(u), origin)))
        .sum::<f64>()
        / neighbors.len().max(1) as f64;
    let mut step = opts.motion_step_size * mean_len;

    let new_elems: Vec<NewElement> = cavity
        .iter()
        .map(|&e| NewElement {
            verts: mesh
                .verts_of(dim, e)
                .iter()
                .map(|&x| if x == v { VertRef::New(0) } else { VertRef::Old(x) })
                .collect(),
            parent: e,
        })
        .collect();
    let moved = |pos: Vec3| {
        vec![NewVertex {
            pos,
            metric: metric_at(view, &cavity, v, pos),
            origin: VertexOrigin::Moved { from: v },
        }]
    };
    // worst element quality with v at `pos`, and which element it is
    let worst = |pos: Vec3| -> (f64, usize) {
        let verts = moved(pos);
        new_elems
            .iter()
            .enumerate()
            .map(|(k, el)| {
                let (measure, q) = view.planned_shape(&verts, &el.verts);
                (if measure <= 0.0 { -1.0 } else { q }, k)
            })
            .fold((f64::INFINITY, 0), |a, b| if b.0 < a.0 { b } else { a })
    };

    let mut pos = origin;
    let (mut best, _) = worst(pos);
    let mut backtracks = 0;
    let h = opts.motion_gradient_step * mean_len.max(f64::MIN_POSITIVE);
    for _ in 0..opts.max_motion_steps {
        let (_, k) = worst(pos);
        let grad = quality_gradient(pos, h, dim, |p| {
            let verts = moved(p);
            view.planned_shape(&verts, &new_elems[k].verts).1
        });
        let gnorm = norm(grad);
        if gnorm < 1e-14 {
            break;
        }
        let trial = add(pos, scale(grad, step / gnorm));
        let (q, _) = worst(trial);
        if q > best {
            pos = trial;
            best = q;
        } else {
            step *= 0.5;
            backtracks += 1;
            if backtracks > opts.max_motion_backtracks {
                break;
            }
        }
    }
    if best <= quality_before {
        return Err(Rejection::NoImprovement);
    }
    let new_verts = moved(pos);
    let quality_after = view.check_elements(&new_verts, &new_elems, quality_before)?;
    let plan = EditPlan {
        kind: OpKind::Move,
        key_dim: VERT,
        key: v,
        cavity,
        new_verts,
        new_elems,
        collapse: None,
        quality_before,
        quality_after,
    };
    if opts.xfer_opts.should_conserve_size {
        view.check_volume(&plan.new_verts, &plan.cavity, &plan.new_elems, opts.volume_tolerance)?;
    }
    Ok(plan)
}

/// Central-difference gradient of `at` with respect to the moving vertex
/// position.
fn quality_gradient(pos: Vec3, h: f64, dim: usize, at: impl Fn(Vec3) -> f64) -> Vec3 {
    let mut grad = [0.0; 3];
    for (axis, g) in grad.iter_mut().enumerate().take(dim) {
        let mut plus = pos;
        let mut minus = pos;
        plus[axis] += h;
        minus[axis] -= h;
        *g = (at(plus) - at(minus)) / (2.0 * h);
    }
    grad
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algs::communicator::NoComm;
    use crate::algs::meshgen::build_box;
    use crate::geometry::tensor;
    use crate::topology::mesh::{Mesh, COORDINATES, METRIC};

    fn perturbed_grid() -> (Mesh, usize) {
        let mut mesh = build_box(NoComm, 2, [1.0, 1.0, 0.0], [2, 2, 0]).unwrap();
        let center = mesh
            .alive(0)
            .find(|&v| {
                let c = mesh.coord(v);
                (c[0] - 0.5).abs() < 1e-12 && (c[1] - 0.5).abs() < 1e-12
            })
            .unwrap();
        let coords = mesh.get_tag_mut::<f64>(0, COORDINATES).unwrap();
        coords[2 * center] = 0.8;
        coords[2 * center + 1] = 0.75;
        let m = tensor::to_packed(2, &tensor::isotropic(2, 0.5));
        let values: Vec<f64> = (0..mesh.nslots(0)).flat_map(|_| m.clone()).collect();
        mesh.add_tag(0, METRIC, 3, values).unwrap();
        (mesh, center)
    }

    #[test]
    fn displaced_center_moves_back_toward_the_middle() {
        let (mesh, center) = perturbed_grid();
        let view = AdaptView::new(&mesh, METRIC).unwrap();
        let opts = AdaptOpts {
            min_quality_desired: 0.99,
            ..AdaptOpts::default()
        };
        let plan = plan_move(&view, center, &opts).unwrap();
        assert!(plan.quality_after > plan.quality_before);
        let p = plan.new_verts[0].pos;
        let before = norm(sub([0.8, 0.75, 0.0], [0.5, 0.5, 0.0]));
        assert!(norm(sub(p, [0.5, 0.5, 0.0])) < before);
    }

    #[test]
    fn moved_vertex_takes_the_metric_at_its_new_position() {
        let (mut mesh, center) = perturbed_grid();
        // finer metric at the displaced vertex only
        let fine = tensor::to_packed(2, &tensor::isotropic(2, 0.25));
        let metric = mesh.get_tag_mut::<f64>(0, METRIC).unwrap();
        metric[3 * center..3 * center + 3].copy_from_slice(&fine);
        let view = AdaptView::new(&mesh, METRIC).unwrap();
        let opts = AdaptOpts {
            min_quality_desired: 0.99,
            ..AdaptOpts::default()
        };
        let plan = plan_move(&view, center, &opts).unwrap();
        let m = plan.new_verts[0].metric;
        assert!(tensor::is_spd(2, &m));
        // a blend of 1/0.5^2 and 1/0.25^2
        let (_, lambda) = tensor::eigen(2, &m);
        for l in &lambda[..2] {
            assert!(*l > 4.0 + 1e-9 && *l < 16.0 - 1e-9, "eigenvalue {l}");
        }
    }

    #[test]
    fn boundary_vertices_stay_put() {
        let (mesh, _) = perturbed_grid();
        let view = AdaptView::new(&mesh, METRIC).unwrap();
        assert_eq!(plan_move(&view, 0, &AdaptOpts::default()), Err(Rejection::NotEligible));
    }
}
