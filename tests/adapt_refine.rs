mod common;

use common::{put_uniform_metric, total_measure};
use mesh_adapt::prelude::*;
use mesh_adapt::topology::simplex::EDGE;

fn quiet() -> AdaptOpts {
    AdaptOpts {
        verbosity: Verbosity::Silent,
        should_check_invariants: true,
        ..AdaptOpts::default()
    }
}

#[test]
fn only_the_long_diagonal_is_split() {
    // axis edges measure 1/0.9, the diagonal sqrt(2)/0.9
    let mut mesh = build_box(NoComm, 2, [1.0, 1.0, 0.0], [1, 1, 0]).unwrap();
    put_uniform_metric(&mut mesh, 0.9);
    let report = adapt(&mut mesh, &quiet()).unwrap();
    assert_eq!(report.refined, 1);
    assert_eq!(report.coarsened, 0);
    assert!(report.converged);
    assert_eq!(mesh.nverts(), 5);
    assert_eq!(mesh.nents(EDGE), 8);
    assert_eq!(mesh.nelems(), 4);
    assert!((total_measure(&mesh) - 1.0).abs() < 1e-12);
}

#[test]
fn converged_meshes_are_left_alone() {
    let mut mesh = build_box(NoComm, 2, [1.0, 1.0, 0.0], [1, 1, 0]).unwrap();
    put_uniform_metric(&mut mesh, 0.9);
    let first = adapt(&mut mesh, &quiet()).unwrap();
    assert!(first.converged);
    let globals: Vec<_> = mesh.alive(2).map(|e| mesh.global(2, e)).collect();
    let second = adapt(&mut mesh, &quiet()).unwrap();
    assert_eq!(second.total_edits(), 0);
    assert_eq!(second.sweeps, 1);
    let again: Vec<_> = mesh.alive(2).map(|e| mesh.global(2, e)).collect();
    assert_eq!(globals, again);
}

#[test]
fn refinement_respects_the_quality_floor_and_the_domain() {
    let mut mesh = build_box(NoComm, 2, [2.0, 1.0, 0.0], [2, 1, 0]).unwrap();
    put_uniform_metric(&mut mesh, 0.15);
    let opts = quiet();
    let report = adapt(&mut mesh, &opts).unwrap();
    assert!(report.refined > 0);
    assert!(report.after.nelems > report.before.nelems);
    assert!(report.after.max_length < report.before.max_length);
    let floor = report.before.min_quality.min(opts.min_quality_allowed);
    assert!(report.after.min_quality >= floor - 1e-12, "{}", report.after);
    assert!((total_measure(&mesh) - 2.0).abs() < 1e-10);
    // boundary vertices stay on the boundary
    for v in mesh.alive(0) {
        let (cd, _) = mesh.class_of(0, v);
        let c = mesh.coord(v);
        let on_wall = c[0].abs() < 1e-12 || (c[0] - 2.0).abs() < 1e-12 || c[1].abs() < 1e-12 || (c[1] - 1.0).abs() < 1e-12;
        assert_eq!(cd < 2, on_wall, "vertex at {c:?} classified {cd}");
    }
}

#[test]
fn invalid_options_fail_before_the_mesh_changes() {
    let mut mesh = build_box(NoComm, 2, [1.0, 1.0, 0.0], [2, 2, 0]).unwrap();
    put_uniform_metric(&mut mesh, 0.1);
    let opts = AdaptOpts {
        min_quality_allowed: 0.5,
        min_quality_desired: 0.4,
        ..quiet()
    };
    let err = adapt(&mut mesh, &opts).unwrap_err();
    assert!(matches!(err, MeshAdaptError::Configuration(_)));
    assert_eq!(mesh.nelems(), 8);
}
