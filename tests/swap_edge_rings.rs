use mesh_adapt::geometry::metrics::Vec3;
use mesh_adapt::geometry::tensor;
use mesh_adapt::prelude::*;
use mesh_adapt::topology::cavity::{AdaptView, OpKind, Rejection};
use mesh_adapt::topology::simplex::{EDGE, FACE};
use mesh_adapt::topology::swap::plan_swap;

/// `n` tets around a long edge through a regular ring of unit sides.
fn needles(n: usize, half_height: f64) -> Mesh {
    let theta = 2.0 * std::f64::consts::PI / n as f64;
    let r = 0.5 / (theta / 2.0).sin();
    let mut pts: Vec<Vec3> = vec![[0.0, 0.0, half_height], [0.0, 0.0, -half_height]];
    pts.extend((0..n).map(|k| {
        let t = k as f64 * theta;
        [r * t.cos(), r * t.sin(), 0.0]
    }));
    let mut mesh = Mesh::serial(3).unwrap();
    for (i, p) in pts.iter().enumerate() {
        mesh.add_vertex(p, GlobalId::new(i as u64), 0).unwrap();
    }
    // (b, a, r_k, r_k+1) is positively oriented for a counter-clockwise ring
    for k in 0..n {
        let (p, q) = (2 + k, 2 + (k + 1) % n);
        mesh.add_element(&[1, 0, p, q], GlobalId::new(k as u64), 0).unwrap();
    }
    mesh.commit_globals().unwrap();
    let m = tensor::to_packed(3, &tensor::identity(3));
    let values: Vec<f64> = (0..mesh.nslots(0)).flat_map(|_| m.clone()).collect();
    mesh.add_tag(0, METRIC, m.len(), values).unwrap();
    mesh
}

fn needle_ring() -> Mesh {
    needles(3, 1.5)
}

#[test]
fn three_needles_become_two_tets() {
    let mesh = needle_ring();
    let view = AdaptView::new(&mesh, METRIC).unwrap();
    let axis = mesh.find_entity(EDGE, &[0, 1]).unwrap();
    let plan = plan_swap(&view, EDGE, axis, &AdaptOpts::default()).unwrap();
    assert_eq!(plan.kind, OpKind::Swap);
    assert_eq!(plan.new_elems.len(), 2);
    assert!(plan.quality_before < 0.35);
    assert!(plan.quality_after > 0.8);
}

#[test]
fn adapt_applies_the_swap_and_keeps_the_volume() {
    let mut mesh = needle_ring();
    classify_by_angles(&mut mesh, std::f64::consts::FRAC_PI_4).unwrap();
    let volume: f64 = mesh
        .alive(3)
        .map(|e| mesh_adapt::geometry::metrics::signed_measure(3, &mesh.elem_points(e)))
        .sum();
    let opts = AdaptOpts {
        should_refine: false,
        should_coarsen: false,
        verbosity: Verbosity::Silent,
        should_check_invariants: true,
        ..AdaptOpts::default()
    };
    let report = adapt(&mut mesh, &opts).unwrap();
    assert_eq!(report.swapped, 1);
    assert_eq!(mesh.nelems(), 2);
    let slot = |g: u64| mesh.find_global(0, GlobalId::new(g)).unwrap();
    assert!(mesh.find_entity(EDGE, &[slot(0), slot(1)]).is_none());
    let ring = [2, 3, 4].map(slot);
    let face = mesh.find_entity(FACE, &ring).unwrap();
    assert_eq!(mesh.class_of(FACE, face).0, 3);
    let after: f64 = mesh
        .alive(3)
        .map(|e| mesh_adapt::geometry::metrics::signed_measure(3, &mesh.elem_points(e)))
        .sum();
    assert!((after - volume).abs() < 1e-12);
}

#[test]
fn five_needles_become_six_tets() {
    let mesh = needles(5, 3.0);
    let view = AdaptView::new(&mesh, METRIC).unwrap();
    let axis = mesh.find_entity(EDGE, &[0, 1]).unwrap();
    let plan = plan_swap(&view, EDGE, axis, &AdaptOpts::default()).unwrap();
    // a pentagon splits into three triangles, each capped above and below
    assert_eq!(plan.new_elems.len(), 6);
    assert!(plan.quality_after > plan.quality_before);
    let volume: f64 = plan.cavity.iter().map(|&e| view.volume(&[e])).sum();
    let after: f64 = plan.new_elems.iter().map(|el| view.planned_shape(&[], &el.verts).0).sum();
    assert!((after - volume).abs() < 1e-12);
}

#[test]
fn rings_beyond_the_limit_are_left_alone() {
    let mesh = needles(8, 3.0);
    let view = AdaptView::new(&mesh, METRIC).unwrap();
    let axis = mesh.find_entity(EDGE, &[0, 1]).unwrap();
    assert_eq!(plan_swap(&view, EDGE, axis, &AdaptOpts::default()), Err(Rejection::NotEligible));
}
