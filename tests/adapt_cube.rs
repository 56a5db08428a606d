mod common;

use common::{close, put_metric, total_measure};
use mesh_adapt::geometry::tensor::{self, Mat};
use mesh_adapt::prelude::*;
use mesh_adapt::topology::simplex::{EDGE, VERT};

fn stretched() -> Mat {
    // sizes 0.2 along x, 0.5 across
    let mut m = tensor::ZERO;
    m[0][0] = 1.0 / 0.04;
    m[1][1] = 1.0 / 0.25;
    m[2][2] = 1.0 / 0.25;
    m
}

fn opts() -> AdaptOpts {
    AdaptOpts {
        verbosity: Verbosity::Silent,
        should_check_invariants: true,
        ..AdaptOpts::default()
    }
}

#[test]
fn anisotropic_cube_refines_within_the_quality_floor() {
    let mut mesh = build_box(NoComm, 3, [1.0; 3], [2, 2, 2]).unwrap();
    put_metric(&mut mesh, &stretched());
    let before_elems = mesh.nelems();
    let opts = opts();
    let report = adapt(&mut mesh, &opts).unwrap();
    assert!(report.refined > 0);
    assert!(mesh.nelems() > before_elems);
    assert!(report.after.max_length < report.before.max_length);
    let floor = report.before.min_quality.min(opts.min_quality_allowed);
    assert!(report.after.min_quality >= floor - 1e-12, "{}", report.after);
    assert!(close(total_measure(&mesh), 1.0, 1e-10));
    mesh.verify_consistency().unwrap();
}

#[test]
fn metric_input_drives_a_cube_and_is_dropped_afterwards() {
    let mut mesh = build_box(NoComm, 3, [1.0; 3], [1, 1, 1]).unwrap();
    let mut input = MetricInput {
        should_limit_lengths: true,
        max_length: 0.4,
        metric_name: "target_metric".to_owned(),
        ..MetricInput::default()
    };
    input.add_source(MetricSource::new(MetricSourceKind::Implied, false, ""));
    let (metric, report) = adapt_with_metric_input(&mut mesh, &input, &opts()).unwrap();
    assert_eq!(metric.tag_name, "target_metric");
    assert!(report.refined > 0);
    assert!(!mesh.has_tag(VERT, "target_metric"));
    assert!(mesh.nents(EDGE) > 19);
    assert!(close(total_measure(&mesh), 1.0, 1e-10));
}

#[test]
fn coarse_anisotropic_cube_reaches_the_length_window() {
    let mut mesh = build_box(NoComm, 3, [1.0; 3], [5, 5, 5]).unwrap();
    classify_by_angles(&mut mesh, std::f64::consts::FRAC_PI_4).unwrap();
    // unit sizes across, half along z
    let mut m = tensor::ZERO;
    m[0][0] = 1.0;
    m[1][1] = 1.0;
    m[2][2] = 4.0;
    put_metric(&mut mesh, &m);
    let opts = opts();
    let report = adapt(&mut mesh, &opts).unwrap();
    assert!(report.coarsened > 0);
    let stats = &report.after;
    assert!(stats.min_length >= opts.min_length_desired - 1e-9, "{stats}");
    assert!(stats.max_length <= opts.max_length_desired + 1e-9, "{stats}");
    assert!(close(total_measure(&mesh), 1.0, 1e-10));
    mesh.verify_consistency().unwrap();
}
