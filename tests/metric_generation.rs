mod common;

use mesh_adapt::geometry::tensor;
use mesh_adapt::metric::{generate_metric, read_metrics, MetricInput, MetricSource, MetricSourceKind};
use mesh_adapt::prelude::*;

#[test]
fn hessian_metric_is_spd_and_within_length_bounds() {
    let mut mesh = build_box(NoComm, 2, [1.0, 1.0, 0.0], [8, 8, 0]).unwrap();
    // strongly varying in x only
    let u: Vec<f64> = (0..mesh.nslots(0)).map(|v| 10.0 * mesh.coord(v)[0].powi(2)).collect();
    mesh.add_tag(0, "u", 1, u).unwrap();
    let mut input = MetricInput {
        should_limit_lengths: true,
        min_length: 0.01,
        max_length: 0.5,
        ..MetricInput::default()
    };
    input.add_source(MetricSource::new(MetricSourceKind::Hessian, true, "u").with_knob(0.01));
    let out = generate_metric(&mut mesh, &input).unwrap();
    assert_eq!(out.tag_name, METRIC);
    assert!(out.failures.is_empty());

    let ms = read_metrics(&mesh, METRIC).unwrap();
    let (lo, hi) = (1.0 / 0.5f64.powi(2), 1.0 / 0.01f64.powi(2));
    for v in mesh.alive(0) {
        assert!(tensor::is_spd(2, &ms[v]), "{:?}", ms[v]);
        let (_, l) = tensor::eigen(2, &ms[v]);
        for &x in &l[..2] {
            assert!(x >= lo * (1.0 - 1e-9) && x <= hi * (1.0 + 1e-9), "eigenvalue {x}");
        }
    }
    // the x direction asks for smaller sizes than y
    let center = mesh
        .alive(0)
        .find(|&v| {
            let c = mesh.coord(v);
            (c[0] - 0.5).abs() < 1e-12 && (c[1] - 0.5).abs() < 1e-12
        })
        .unwrap();
    assert!(ms[center][0][0] > ms[center][1][1]);
}

#[test]
fn gradation_bounds_endpoint_size_ratio_by_metric_length() {
    let mut mesh = build_box(NoComm, 2, [1.0, 1.0, 0.0], [8, 8, 0]).unwrap();
    let h: Vec<f64> = (0..mesh.nslots(0))
        .map(|v| if mesh.coord(v)[0] < 1e-12 { 0.01 } else { 1.0 })
        .collect();
    mesh.add_tag(0, "h", 1, h).unwrap();
    let mut input = MetricInput {
        should_limit_gradation: true,
        max_gradation_rate: 0.5,
        gradation_convergence_tolerance: 1e-6,
        max_gradation_iterations: 500,
        ..MetricInput::default()
    };
    input.add_source(MetricSource::new(MetricSourceKind::Given, false, "h"));
    let out = generate_metric(&mut mesh, &input).unwrap();
    assert!(out.failures.is_empty(), "{:?}", out.failures);

    let ms = read_metrics(&mesh, METRIC).unwrap();
    let size = |v: usize| 1.0 / ms[v][0][0].sqrt();
    for v in mesh.alive(0) {
        for u in mesh.vert_neighbors(v) {
            let e = mesh_adapt::geometry::metrics::sub(mesh.coord(u), mesh.coord(v));
            let lu = tensor::metric_length(2, &ms[u], e);
            assert!(size(v) <= size(u) * (1.0 + 0.5 * lu) * (1.0 + 1e-5));
        }
    }
    // the small sizes on the left wall spread into the interior
    let inner = mesh
        .alive(0)
        .find(|&v| {
            let c = mesh.coord(v);
            (c[0] - 0.125).abs() < 1e-12 && (c[1] - 0.5).abs() < 1e-12
        })
        .unwrap();
    assert!(size(inner) < 0.2);
}

#[test]
fn element_count_limit_is_skipped_without_scaled_sources() {
    let mut mesh = build_box(NoComm, 2, [1.0, 1.0, 0.0], [4, 4, 0]).unwrap();
    mesh.add_tag(0, "h", 1, vec![0.25; mesh.nslots(0)]).unwrap();
    let mut input = MetricInput {
        should_limit_element_count: true,
        min_element_count: 1000.0,
        max_element_count: 2000.0,
        ..MetricInput::default()
    };
    input.add_source(MetricSource::new(MetricSourceKind::Given, false, "h"));
    let out = generate_metric(&mut mesh, &input).unwrap();
    assert_eq!(out.scale, 1.0);
    assert!(out.failures.is_empty());
    assert!(out.predicted_elements < 1000.0);
}
