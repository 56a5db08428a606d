mod common;

use common::put_uniform_metric;
use mesh_adapt::geometry::tensor;
use mesh_adapt::metric::read_metrics;
use mesh_adapt::prelude::*;

fn refine_only() -> AdaptOpts {
    AdaptOpts {
        should_coarsen: false,
        should_swap: false,
        verbosity: Verbosity::Silent,
        ..AdaptOpts::default()
    }
}

#[test]
fn linear_vertex_fields_stay_exact_under_refinement() {
    let mut mesh = build_box(NoComm, 2, [1.0, 1.0, 0.0], [2, 2, 0]).unwrap();
    put_uniform_metric(&mut mesh, 0.2);
    let u: Vec<f64> = (0..mesh.nslots(0))
        .map(|v| {
            let c = mesh.coord(v);
            2.0 * c[0] + 3.0 * c[1]
        })
        .collect();
    mesh.add_tag(0, "u", 1, u).unwrap();
    mesh.add_tag(0, "flag", 1, vec![7i32; mesh.nslots(0)]).unwrap();
    let mut opts = refine_only();
    opts.xfer_opts.set_policy("u", TransferPolicy::LinearInterp);

    let report = adapt(&mut mesh, &opts).unwrap();
    assert!(report.refined > 0);
    let u = mesh.get_tag::<f64>(0, "u").unwrap();
    let flag = mesh.get_tag::<i32>(0, "flag").unwrap();
    for v in mesh.alive(0) {
        let c = mesh.coord(v);
        assert!((u[v] - (2.0 * c[0] + 3.0 * c[1])).abs() < 1e-12, "u at {c:?}");
        assert_eq!(flag[v], 7);
    }
}

#[test]
fn element_fields_inherit_and_metrics_stay_spd() {
    let mut mesh = build_box(NoComm, 2, [1.0, 1.0, 0.0], [2, 2, 0]).unwrap();
    put_uniform_metric(&mut mesh, 0.25);
    let region: Vec<i32> = (0..mesh.nslots(2)).map(|e| (mesh.global(2, e).get() % 2) as i32).collect();
    mesh.add_tag(2, "region", 1, region).unwrap();
    let pressure: Vec<f64> = (0..mesh.nslots(2))
        .map(|e| if mesh.elem_points(e).iter().all(|p| p[0] <= 0.5) { 1.0 } else { 2.0 })
        .collect();
    mesh.add_tag(2, "pressure", 1, pressure).unwrap();
    let mut opts = refine_only();
    opts.xfer_opts.set_policy("pressure", TransferPolicy::Pointwise);

    adapt(&mut mesh, &opts).unwrap();
    let region = mesh.get_tag::<i32>(2, "region").unwrap();
    let pressure = mesh.get_tag::<f64>(2, "pressure").unwrap();
    for e in mesh.alive(2) {
        assert!(region[e] == 0 || region[e] == 1);
        let expected = if mesh.elem_points(e).iter().all(|p| p[0] <= 0.5 + 1e-12) { 1.0 } else { 2.0 };
        assert_eq!(pressure[e], expected);
    }
    let ms = read_metrics(&mesh, METRIC).unwrap();
    for v in mesh.alive(0) {
        assert!(tensor::is_spd(2, &ms[v]));
    }
}

#[test]
fn misconfigured_fields_are_rejected_up_front() {
    let mut mesh = build_box(NoComm, 2, [1.0, 1.0, 0.0], [2, 2, 0]).unwrap();
    put_uniform_metric(&mut mesh, 0.25);
    mesh.add_tag(0, "u", 1, vec![0.0; mesh.nslots(0)]).unwrap();
    let mut opts = refine_only();
    // a density must live on elements
    opts.xfer_opts.set_conserve("u", "mass", VarCompareOpts::None);
    let err = adapt(&mut mesh, &opts).unwrap_err();
    assert!(matches!(err, MeshAdaptError::Configuration(_)));
    assert_eq!(mesh.nelems(), 8);

    let mut opts = refine_only();
    opts.xfer_opts
        .type_map
        .insert("v".to_owned(), TransferPolicy::Conserve);
    let err = adapt(&mut mesh, &opts).unwrap_err();
    assert!(matches!(
        err,
        MeshAdaptError::Configuration(ConfigError::UnresolvedIntegral { .. })
    ));
}
