// cargo run --example adapt_box
use mesh_adapt::prelude::*;

fn main() {
    let mut mesh = build_box(NoComm, 2, [1.0, 1.0, 0.0], [4, 4, 0]).unwrap();

    // a boundary layer near x = 0
    let u: Vec<f64> = (0..mesh.nslots(0))
        .map(|v| (-20.0 * mesh.coord(v)[0]).exp())
        .collect();
    mesh.add_tag(0, "u", 1, u).unwrap();

    let mut input = MetricInput {
        should_limit_lengths: true,
        min_length: 1e-3,
        max_length: 0.3,
        should_limit_gradation: true,
        ..MetricInput::default()
    };
    input.add_source(MetricSource::new(MetricSourceKind::Hessian, true, "u").with_knob(0.01));

    let mut opts = AdaptOpts::default();
    opts.xfer_opts.set_policy("u", TransferPolicy::LinearInterp);

    let (metric, report) = adapt_with_metric_input(&mut mesh, &input, &opts).unwrap();
    println!("metric scale {:.3}, predicted {:.0} elements", metric.scale, metric.predicted_elements);
    println!(
        "{} sweeps: {} refined, {} coarsened, {} swapped, {} moved",
        report.sweeps, report.refined, report.coarsened, report.swapped, report.moved
    );
    println!(
        "elements {} -> {}, min quality {:.3} -> {:.3}",
        report.before.nelems, report.after.nelems, report.before.min_quality, report.after.min_quality
    );
    for w in &report.warnings {
        println!("warning: {w}");
    }
}
