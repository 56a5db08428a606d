//! Edge collapse.
//!
//! Collapsing `v` onto `w` removes the star of `v`; elements using both
//! vertices vanish, the others are rebuilt with `w` in place of `v`.

use crate::adapt::AdaptOpts;
use crate::algs::communicator::Communicator;
use crate::topology::cavity::{AdaptView, EditPlan, NewElement, OpKind, Rejection, VertRef};
use crate::topology::simplex::{EDGE, VERT};

/// Bound on the edges a size-driven collapse of a boundary vertex may
/// create, relative to `max_length_desired`. Splitting such an edge leaves
/// halves of at least `min_length_desired` under the default bounds.
pub const OVERSHOOT: f64 = 2.0;

/// True when `edge` borders an element below the desired quality.
pub fn is_sliver_edge<C: Communicator>(view: &AdaptView<'_, C>, edge: usize, min_quality_desired: f64) -> bool {
    view.mesh()
        .elems_of(EDGE, edge)
        .into_iter()
        .any(|e| view.quality(e) < min_quality_desired)
}

/// Plan the best valid collapse of `edge` in either direction.
pub fn plan_collapse<C: Communicator>(view: &AdaptView<'_, C>, edge: usize, opts: &AdaptOpts) -> Result<EditPlan, Rejection> {
    let short = view.edge_length(edge) < opts.min_length_desired;
    let sliver = opts.should_coarsen_slivers && is_sliver_edge(view, edge, opts.min_quality_desired);
    if !short && !sliver {
        return Err(Rejection::NotEligible);
    }
    let ev = view.mesh().verts_of(EDGE, edge);
    let (a, b) = (ev[0], ev[1]);
    let mut best: Option<EditPlan> = None;
    let mut last = Rejection::NotEligible;
    for (v, w) in [(a, b), (b, a)] {
        match plan_collapse_onto(view, edge, v, w, opts, !short) {
            Ok(plan) => {
                if best.as_ref().is_none_or(|p| plan.quality_after > p.quality_after) {
                    best = Some(plan);
                }
            }
            Err(r) => last = r,
        }
    }
    best.ok_or(last)
}

/// Plan collapsing `v` onto `w` along `edge`.
///
/// `must_improve` is set for edges that are only candidates because they
/// touch a sliver; such collapses have to raise the cavity minimum.
pub fn plan_collapse_onto<C: Communicator>(
    view: &AdaptView<'_, C>,
    edge: usize,
    v: usize,
    w: usize,
    opts: &AdaptOpts,
    must_improve: bool,
) -> Result<EditPlan, Rejection> {
    let mesh = view.mesh();
    let dim = mesh.dim();
    if mesh.class_of(VERT, v) != mesh.class_of(EDGE, edge) {
        return Err(Rejection::Classification);
    }

    let cavity = mesh.star(v).to_vec();
    let mut new_elems = Vec::new();
    for &e in &cavity {
        let verts = mesh.verts_of(dim, e);
        if verts.contains(&w) {
            continue;
        }
        let moved: Vec<usize> = verts.iter().map(|&x| if x == v { w } else { x }).collect();
        if mesh.find_entity(dim, &moved).is_some() {
            return Err(Rejection::Topology);
        }
        new_elems.push(NewElement {
            verts: moved.into_iter().map(VertRef::Old).collect(),
            parent: e,
        });
    }
    if new_elems.is_empty() {
        return Err(Rejection::Topology);
    }

    let quality_before = view.min_quality(&cavity);
    let mut plan = EditPlan {
        kind: OpKind::Coarsen,
        key_dim: EDGE,
        key: edge,
        cavity,
        new_verts: Vec::new(),
        new_elems,
        collapse: Some((v, w)),
        quality_before,
        quality_after: 0.0,
    };

    // an existing entity through w may only be reused where a vanishing
    // element already joined it to v; anything else is a non-manifold merge
    for low in EDGE..dim {
        for sub in plan.planned_subs(mesh, low) {
            if sub.existing.is_none() {
                continue;
            }
            let mut needed: Vec<usize> = sub
                .verts
                .iter()
                .filter_map(|r| match r {
                    VertRef::Old(x) => Some(*x),
                    VertRef::New(_) => None,
                })
                .collect();
            if !needed.contains(&w) {
                continue;
            }
            needed.push(v);
            let joined = plan
                .cavity
                .iter()
                .any(|&e| needed.iter().all(|x| mesh.verts_of(dim, e).contains(x)));
            if !joined {
                return Err(Rejection::Topology);
            }
        }
    }

    if !opts.should_allow_pinching {
        let interior = dim as i8;
        for sub in plan.planned_subs(mesh, EDGE) {
            if sub.existing.is_some() {
                continue;
            }
            let (sd, se) = plan.class_source(mesh, &sub.verts);
            let on_boundary = sub.verts.iter().all(|r| match r {
                VertRef::Old(x) => mesh.class_of(VERT, *x).0 < interior,
                VertRef::New(_) => false,
            });
            if mesh.class_of(sd, se).0 == interior && on_boundary {
                return Err(Rejection::Pinching);
            }
        }
    }

    let relaxed = opts.should_coarsen_slivers && view.is_near_sliver(v);
    let floor = if relaxed {
        opts.min_quality_allowed.min(quality_before)
    } else {
        opts.min_quality_allowed
    };
    plan.quality_after = view.check_elements(&plan.new_verts, &plan.new_elems, floor)?;
    if must_improve && plan.quality_after <= quality_before {
        return Err(Rejection::NoImprovement);
    }
    // size-driven collapses must not overshoot into edges the refiner would split
    let max_length = if must_improve {
        opts.max_length_allowed
    } else {
        opts.max_length_desired.min(opts.max_length_allowed)
    };
    match view.check_lengths(&plan, max_length) {
        Err(Rejection::LongEdge { .. }) if !must_improve && mesh.class_of(VERT, v).0 < dim as i8 => {
            // no swap reaches a boundary edge, so its collapse may overshoot
            view.check_lengths(&plan, (OVERSHOOT * opts.max_length_desired).min(opts.max_length_allowed))?;
        }
        checked => checked?,
    }
    if opts.xfer_opts.should_conserve_size {
        view.check_volume(&plan.new_verts, &plan.cavity, &plan.new_elems, opts.volume_tolerance)?;
    }
    Ok(plan)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algs::communicator::NoComm;
    use crate::algs::meshgen::build_box;
    use crate::geometry::tensor;
    use crate::topology::mesh::{Mesh, METRIC};

    fn grid(n: usize, size: f64) -> Mesh {
        let mut mesh = build_box(NoComm, 2, [1.0, 1.0, 0.0], [n, n, 0]).unwrap();
        let m = tensor::to_packed(2, &tensor::isotropic(2, size));
        let values: Vec<f64> = (0..mesh.nslots(0)).flat_map(|_| m.clone()).collect();
        mesh.add_tag(0, METRIC, 3, values).unwrap();
        mesh
    }

    fn vertex_at<C: Communicator>(mesh: &Mesh<C>, p: [f64; 2]) -> usize {
        mesh.alive(0)
            .find(|&v| {
                let c = mesh.coord(v);
                (c[0] - p[0]).abs() < 1e-12 && (c[1] - p[1]).abs() < 1e-12
            })
            .unwrap()
    }

    #[test]
    fn interior_vertex_collapses_onto_neighbor() {
        let mesh = grid(2, 4.0);
        let view = AdaptView::new(&mesh, METRIC).unwrap();
        let center = vertex_at(&mesh, [0.5, 0.5]);
        let corner = vertex_at(&mesh, [0.0, 0.0]);
        let edge = mesh.find_entity(EDGE, &[center, corner]).unwrap();
        let opts = AdaptOpts {
            should_allow_pinching: true,
            ..AdaptOpts::default()
        };
        let plan = plan_collapse_onto(&view, edge, center, corner, &opts, false).unwrap();
        assert_eq!(plan.cavity.len(), mesh.star(center).len());
        // the two triangles sharing the collapsed edge vanish
        assert_eq!(plan.new_elems.len(), plan.cavity.len() - 2);
        assert!(plan.quality_after > 0.0);
    }

    #[test]
    fn corners_never_move() {
        let mesh = grid(2, 4.0);
        let view = AdaptView::new(&mesh, METRIC).unwrap();
        let corner = vertex_at(&mesh, [0.0, 0.0]);
        let side = vertex_at(&mesh, [0.5, 0.0]);
        let edge = mesh.find_entity(EDGE, &[corner, side]).unwrap();
        let err = plan_collapse_onto(&view, edge, corner, side, &AdaptOpts::default(), false).unwrap_err();
        assert_eq!(err, Rejection::Classification);
    }

    #[test]
    fn boundary_vertex_slides_along_its_side() {
        let mesh = grid(4, 8.0);
        let view = AdaptView::new(&mesh, METRIC).unwrap();
        let corner = vertex_at(&mesh, [0.0, 0.0]);
        let side = vertex_at(&mesh, [0.25, 0.0]);
        let edge = mesh.find_entity(EDGE, &[corner, side]).unwrap();
        let plan = plan_collapse_onto(&view, edge, side, corner, &AdaptOpts::default(), false).unwrap();
        assert_eq!(plan.collapse, Some((side, corner)));
    }

    fn tight_lengths() -> AdaptOpts {
        // every edge of grid(4, 8.0) measures 1/32 or more
        AdaptOpts {
            min_length_desired: 0.035,
            max_length_desired: 0.05,
            ..AdaptOpts::default()
        }
    }

    #[test]
    fn boundary_collapses_may_overshoot_the_desired_maximum() {
        let mesh = grid(4, 8.0);
        let view = AdaptView::new(&mesh, METRIC).unwrap();
        let corner = vertex_at(&mesh, [0.0, 0.0]);
        let side = vertex_at(&mesh, [0.25, 0.0]);
        let edge = mesh.find_entity(EDGE, &[corner, side]).unwrap();
        let opts = tight_lengths();
        let plan = plan_collapse_onto(&view, edge, side, corner, &opts, false).unwrap();
        // the new bottom edge spans half the side
        let far = vertex_at(&mesh, [0.5, 0.0]);
        let l = view.planned_length(&plan.new_verts, VertRef::Old(corner), VertRef::Old(far));
        assert!(l > opts.max_length_desired && l <= OVERSHOOT * opts.max_length_desired);
    }

    #[test]
    fn interior_collapses_never_overshoot() {
        let mesh = grid(4, 8.0);
        let view = AdaptView::new(&mesh, METRIC).unwrap();
        let center = vertex_at(&mesh, [0.5, 0.5]);
        let left = vertex_at(&mesh, [0.25, 0.5]);
        let edge = mesh.find_entity(EDGE, &[center, left]).unwrap();
        let err = plan_collapse_onto(&view, edge, center, left, &tight_lengths(), false).unwrap_err();
        assert!(matches!(err, Rejection::LongEdge { .. }), "{err:?}");
    }

    #[test]
    fn collapsing_center_to_corner_pinches_when_forbidden() {
        let mesh = grid(2, 4.0);
        let view = AdaptView::new(&mesh, METRIC).unwrap();
        let center = vertex_at(&mesh, [0.5, 0.5]);
        let corner = vertex_at(&mesh, [0.0, 0.0]);
        let edge = mesh.find_entity(EDGE, &[center, corner]).unwrap();
        let err = plan_collapse_onto(&view, edge, center, corner, &AdaptOpts::default(), false).unwrap_err();
        assert_eq!(err, Rejection::Pinching);
    }

    #[test]
    fn long_edges_are_not_candidates() {
        let mesh = grid(2, 0.5);
        let view = AdaptView::new(&mesh, METRIC).unwrap();
        let edge = mesh.alive(EDGE).next().unwrap();
        assert_eq!(plan_collapse(&view, edge, &AdaptOpts::default()), Err(Rejection::NotEligible));
    }
}
