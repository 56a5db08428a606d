//! The adaptation driver.
//!
//! [`adapt`] sweeps the mesh with the enabled operator classes in a fixed
//! order (refine, coarsen, swap, move). Each pass repeats rounds until no
//! candidate is accepted anywhere: every rank evaluates its owned keys
//! against a read-only [`AdaptView`], an [`indset::independent_set`] picks
//! non-overlapping winners, their fields are transferred and
//! [`commit::commit_round`] applies them mesh-wide. The driver converges once
//! a whole sweep accepts nothing.

pub mod commit;
pub mod histogram;
pub mod indset;

use crate::algs::communicator::Communicator;
use crate::algs::exchange::allreduce_sum_u64;
use crate::config::error::ConfigError;
use crate::metric::{generate_metric, MetricInput, MetricOutput};
use crate::mesh_error::{ConvergenceFailure, MeshAdaptError};
use crate::partitioning::PartitionPolicy;
use crate::topology::cavity::{AdaptView, EditPlan, OpKind};
use crate::topology::coarsen::plan_collapse;
use crate::topology::mesh::{Mesh, METRIC};
use crate::topology::motion::plan_move;
use crate::topology::refine::plan_split;
use crate::topology::simplex::{EDGE, FACE, VERT};
use crate::topology::swap::plan_swap;
use crate::transfer::{transfer_plan, PlanFields, TransferOpts};
use histogram::{mesh_stats, MeshStats};
use indset::{independent_set, Candidate};
#[cfg(feature = "rayon")]
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

/// How much the driver reports, from rank 0 only.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Verbosity {
    Silent,
    /// One summary line per adapt (`info`).
    EachAdapt,
    /// Plus one line per pass (`debug`).
    #[default]
    EachRebuild,
    /// Plus histograms at every pass boundary.
    ExtraStats,
}

/// Options of one adapt invocation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdaptOpts {
    /// Edges shorter than this (in metric space) are collapsed.
    pub min_length_desired: f64,
    /// Edges longer than this are split.
    pub max_length_desired: f64,
    /// No coarsening or swap may create an edge longer than this.
    pub max_length_allowed: f64,
    /// Hard floor on the quality of any element an edit creates.
    pub min_quality_allowed: f64,
    /// Elements below this quality are targeted by swaps and moves.
    pub min_quality_desired: f64,
    /// Element layers around a sliver where collapses use a relaxed floor.
    pub nsliver_layers: usize,
    pub max_motion_steps: usize,
    /// Motion step as a fraction of the mean incident edge length.
    pub motion_step_size: f64,
    /// Step halvings a vertex motion tolerates before it stops.
    pub max_motion_backtracks: usize,
    /// Finite-difference step of the motion gradient, as a fraction of the
    /// mean incident edge length.
    pub motion_gradient_step: f64,
    /// Relative cavity volume change tolerated when sizes are conserved.
    pub volume_tolerance: f64,
    pub should_refine: bool,
    pub should_coarsen: bool,
    pub should_swap: bool,
    pub should_coarsen_slivers: bool,
    pub should_move_for_quality: bool,
    pub should_allow_pinching: bool,
    pub verbosity: Verbosity,
    pub length_histogram_min: f64,
    pub length_histogram_max: f64,
    pub nlength_histogram_bins: usize,
    pub nquality_histogram_bins: usize,
    pub max_sweeps: usize,
    /// Rounds one operator pass may take before the driver moves on.
    pub max_rounds_per_pass: usize,
    /// Verify owner/copy consistency after every commit.
    pub should_check_invariants: bool,
    /// Name of the vertex metric tag driving the adaptation.
    pub metric_name: String,
    pub xfer_opts: TransferOpts,
}

impl Default for AdaptOpts {
    fn default() -> Self {
        Self {
            min_length_desired: 1.0 / 2f64.sqrt(),
            max_length_desired: 2f64.sqrt(),
            max_length_allowed: f64::MAX,
            min_quality_allowed: 0.30,
            min_quality_desired: 0.40,
            nsliver_layers: 4,
            max_motion_steps: 100,
            motion_step_size: 0.1,
            max_motion_backtracks: 8,
            motion_gradient_step: 1e-4,
            volume_tolerance: 1e-10,
            should_refine: true,
            should_coarsen: true,
            should_swap: true,
            should_coarsen_slivers: true,
            should_move_for_quality: false,
            should_allow_pinching: false,
            verbosity: Verbosity::default(),
            length_histogram_min: 0.0,
            length_histogram_max: 3.0,
            nlength_histogram_bins: 10,
            nquality_histogram_bins: 10,
            max_sweeps: 16,
            max_rounds_per_pass: 200,
            should_check_invariants: false,
            metric_name: METRIC.to_owned(),
            xfer_opts: TransferOpts::default(),
        }
    }
}

impl AdaptOpts {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let bad = |param: &str, reason: &str| {
            Err(ConfigError::InvalidValue {
                param: param.to_owned(),
                reason: reason.to_owned(),
            })
        };
        if !(self.min_length_desired > 0.0) {
            return bad("min_length_desired", "must be positive");
        }
        if !(self.max_length_desired > self.min_length_desired) {
            return bad("max_length_desired", "must exceed min_length_desired");
        }
        if !(self.max_length_allowed >= self.max_length_desired) {
            return bad("max_length_allowed", "must be at least max_length_desired");
        }
        if !(self.min_quality_allowed > 0.0 && self.min_quality_allowed <= 1.0) {
            return bad("min_quality_allowed", "must lie in (0, 1]");
        }
        if !(self.min_quality_desired >= self.min_quality_allowed && self.min_quality_desired <= 1.0) {
            return bad("min_quality_desired", "must lie in [min_quality_allowed, 1]");
        }
        if !(self.motion_step_size > 0.0) {
            return bad("motion_step_size", "must be positive");
        }
        if !(self.motion_gradient_step > 0.0) {
            return bad("motion_gradient_step", "must be positive");
        }
        if !(self.volume_tolerance >= 0.0) {
            return bad("volume_tolerance", "must not be negative");
        }
        if self.max_rounds_per_pass == 0 {
            return bad("max_rounds_per_pass", "passes need at least one round");
        }
        if !(self.length_histogram_max > self.length_histogram_min) {
            return bad("length_histogram_max", "must exceed length_histogram_min");
        }
        if self.nlength_histogram_bins == 0 || self.nquality_histogram_bins == 0 {
            return bad("nlength_histogram_bins", "histograms need at least one bin");
        }
        self.xfer_opts.validate()
    }

    fn passes(&self) -> Vec<OpKind> {
        [
            (self.should_refine, OpKind::Refine),
            (self.should_coarsen, OpKind::Coarsen),
            (self.should_swap, OpKind::Swap),
            (self.should_move_for_quality, OpKind::Move),
        ]
        .into_iter()
        .filter_map(|(on, kind)| on.then_some(kind))
        .collect()
    }
}

/// Summary of one adapt invocation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AdaptReport {
    pub sweeps: usize,
    /// A sweep accepted no edit before `max_sweeps` ran out.
    pub converged: bool,
    /// Mesh-wide accepted edits per operator class.
    pub refined: u64,
    pub coarsened: u64,
    pub swapped: u64,
    pub moved: u64,
    /// Passes stopped by `max_rounds_per_pass` while still accepting edits.
    pub capped_passes: u64,
    /// Transfer warnings raised on this rank.
    pub warnings: Vec<ConvergenceFailure>,
    pub before: MeshStats,
    pub after: MeshStats,
}

impl AdaptReport {
    pub fn total_edits(&self) -> u64 {
        self.refined + self.coarsened + self.swapped + self.moved
    }

    fn count(&mut self, kind: OpKind, n: u64) {
        match kind {
            OpKind::Refine => self.refined += n,
            OpKind::Coarsen => self.coarsened += n,
            OpKind::Swap => self.swapped += n,
            OpKind::Move => self.moved += n,
        }
    }
}

fn stats<C: Communicator>(mesh: &Mesh<C>, opts: &AdaptOpts) -> Result<MeshStats, MeshAdaptError> {
    let view = AdaptView::new(mesh, &opts.metric_name)?;
    mesh_stats(
        &view,
        (opts.length_histogram_min, opts.length_histogram_max),
        opts.nlength_histogram_bins,
        opts.nquality_histogram_bins,
    )
}

/// Collective: adapt `mesh` to its metric tag `opts.metric_name`.
///
/// Options are checked before the mesh is touched. The mesh runs under the
/// `Ghosted` policy while adapting; the caller's policy is restored before
/// returning.
pub fn adapt<C: Communicator>(mesh: &mut Mesh<C>, opts: &AdaptOpts) -> Result<AdaptReport, MeshAdaptError> {
    opts.validate()?;
    opts.xfer_opts.check_mesh(mesh)?;
    AdaptView::new(mesh, &opts.metric_name)?;

    let caller_policy = mesh.partition_policy();
    if caller_policy != PartitionPolicy::Ghosted {
        mesh.set_partition(PartitionPolicy::Ghosted)?;
    }
    mesh.unify_tag_schema()?;
    let report = drive(mesh, opts)?;
    if caller_policy != PartitionPolicy::Ghosted {
        mesh.set_partition(caller_policy)?;
    }
    Ok(report)
}

/// Collective: build the metric described by `input`, adapt to it and drop
/// the metric tag again.
pub fn adapt_with_metric_input<C: Communicator>(
    mesh: &mut Mesh<C>,
    input: &MetricInput,
    opts: &AdaptOpts,
) -> Result<(MetricOutput, AdaptReport), MeshAdaptError> {
    opts.validate()?;
    opts.xfer_opts.check_mesh(mesh)?;
    input.validate()?;
    let metric = generate_metric(mesh, input)?;
    let opts = AdaptOpts {
        metric_name: metric.tag_name.clone(),
        ..opts.clone()
    };
    let report = adapt(mesh, &opts)?;
    mesh.remove_tag(VERT, &metric.tag_name);
    Ok((metric, report))
}

fn drive<C: Communicator>(mesh: &mut Mesh<C>, opts: &AdaptOpts) -> Result<AdaptReport, MeshAdaptError> {
    let loud = mesh.rank() == 0;
    let before = stats(mesh, opts)?;
    if loud && opts.verbosity >= Verbosity::EachAdapt {
        log::info!("adapt: start with {before}");
    }
    let mut report = AdaptReport {
        sweeps: 0,
        converged: false,
        refined: 0,
        coarsened: 0,
        swapped: 0,
        moved: 0,
        capped_passes: 0,
        warnings: Vec::new(),
        after: before.clone(),
        before,
    };
    let passes = opts.passes();
    for sweep in 0..opts.max_sweeps {
        let mut accepted = 0;
        for &kind in &passes {
            let (n, capped) = run_pass(mesh, opts, kind, &mut report.warnings)?;
            if capped {
                report.capped_passes += 1;
                if loud {
                    log::warn!(
                        "sweep {sweep}, {kind:?}: still accepting edits after {} rounds",
                        opts.max_rounds_per_pass
                    );
                }
            }
            report.count(kind, n);
            accepted += n;
            if opts.verbosity >= Verbosity::EachRebuild {
                let s = stats(mesh, opts)?;
                if loud {
                    log::debug!("sweep {sweep}, {kind:?}: {n} edits, {s}");
                    if opts.verbosity >= Verbosity::ExtraStats {
                        log::debug!("quality histogram:\n{}", s.quality);
                        log::debug!("length histogram:\n{}", s.length);
                    }
                }
            }
        }
        report.sweeps += 1;
        if accepted == 0 {
            report.converged = true;
            break;
        }
    }
    report.after = stats(mesh, opts)?;
    if loud && opts.verbosity >= Verbosity::EachAdapt {
        log::info!(
            "adapt: {} edits in {} sweeps{}, end with {}",
            report.total_edits(),
            report.sweeps,
            if report.converged { "" } else { " (sweep cap reached)" },
            report.after
        );
    }
    Ok(report)
}

/// Collective: vertices within `nsliver_layers` element layers of an element
/// below the desired quality.
fn sliver_region<C: Communicator>(view: &AdaptView<'_, C>, opts: &AdaptOpts) -> Result<Vec<bool>, MeshAdaptError> {
    let mesh = view.mesh();
    let dim = mesh.dim();
    let mut marks = vec![0u8; mesh.nslots(VERT)];
    for e in mesh.alive(dim) {
        if view.quality(e) < opts.min_quality_desired {
            for &v in mesh.verts_of(dim, e) {
                marks[v] = 1;
            }
        }
    }
    let combine = |a: &mut [u8], b: &[u8]| a[0] = a[0].max(b[0]);
    mesh.reduce_to_owners(VERT, &mut marks, 1, combine)?;
    for _ in 1..opts.nsliver_layers {
        let mut next = marks.clone();
        for e in mesh.alive(dim) {
            let verts = mesh.verts_of(dim, e);
            if verts.iter().any(|&v| marks[v] != 0) {
                for &v in verts {
                    next[v] = 1;
                }
            }
        }
        mesh.reduce_to_owners(VERT, &mut next, 1, combine)?;
        marks = next;
    }
    Ok(marks.into_iter().map(|m| m != 0).collect())
}

/// Owned keys an operator class is tried on.
fn candidate_keys<C: Communicator>(mesh: &Mesh<C>, kind: OpKind) -> Vec<(usize, usize)> {
    let dim = mesh.dim();
    let of = |d: usize| mesh.owned(d).map(move |e| (d, e));
    match kind {
        OpKind::Refine | OpKind::Coarsen => of(EDGE).collect(),
        OpKind::Swap if dim == 3 => of(FACE).chain(of(EDGE)).collect(),
        OpKind::Swap => of(EDGE).collect(),
        OpKind::Move => of(VERT).collect(),
    }
}

fn propose<C: Communicator>(view: &AdaptView<'_, C>, kind: OpKind, opts: &AdaptOpts) -> Vec<EditPlan> {
    let keys = candidate_keys(view.mesh(), kind);
    let eval = |&(d, k): &(usize, usize)| {
        match kind {
            OpKind::Refine => plan_split(view, k, opts),
            OpKind::Coarsen => plan_collapse(view, k, opts),
            OpKind::Swap => plan_swap(view, d, k, opts),
            OpKind::Move => plan_move(view, k, opts),
        }
        .ok()
    };
    #[cfg(feature = "rayon")]
    let plans = keys.par_iter().filter_map(eval).collect();
    #[cfg(not(feature = "rayon"))]
    let plans = keys.iter().filter_map(eval).collect();
    plans
}

/// Larger goes first: the longest edges split first, the other classes
/// prefer the best resulting quality.
fn priority<C: Communicator>(view: &AdaptView<'_, C>, plan: &EditPlan) -> f64 {
    match plan.kind {
        OpKind::Refine => view.edge_length(plan.key),
        OpKind::Coarsen => plan.quality_after,
        OpKind::Swap | OpKind::Move => plan.quality_after - plan.quality_before,
    }
}

/// Collective: repeat rounds of one operator class until nothing is
/// accepted. Returns the mesh-wide edit count and whether the round cap
/// stopped the pass.
fn run_pass<C: Communicator>(
    mesh: &mut Mesh<C>,
    opts: &AdaptOpts,
    kind: OpKind,
    warnings: &mut Vec<ConvergenceFailure>,
) -> Result<(u64, bool), MeshAdaptError> {
    let mut total = 0;
    for round in 0..opts.max_rounds_per_pass {
        let edits: Vec<(EditPlan, PlanFields)> = {
            let mut view = AdaptView::new(mesh, &opts.metric_name)?;
            if kind == OpKind::Coarsen && opts.should_coarsen_slivers {
                let near = sliver_region(&view, opts)?;
                view = view.with_sliver_region(near);
            }
            let plans = propose(&view, kind, opts);
            let cands: Vec<Candidate> = plans
                .iter()
                .map(|p| Candidate {
                    verts: p.cavity_verts(mesh),
                    priority: priority(&view, p),
                    key_dim: p.key_dim,
                    key: mesh.global(p.key_dim, p.key),
                })
                .collect();
            let winners = independent_set(mesh, &cands)?;
            winners
                .into_iter()
                .map(|k| {
                    let fields = transfer_plan(mesh, &plans[k], &opts.xfer_opts, &opts.metric_name)?;
                    Ok((plans[k].clone(), fields))
                })
                .collect::<Result<_, MeshAdaptError>>()?
        };
        let accepted = allreduce_sum_u64(mesh.comm(), &[edits.len() as u64])?[0];
        if accepted == 0 {
            return Ok((total, false));
        }
        for (_, fields) in &edits {
            warnings.extend(fields.warnings.iter().cloned());
        }
        commit::commit_round(mesh, &edits, opts.should_check_invariants)?;
        log::trace!("rank {}: {kind:?} round {round} committed {} edits locally", mesh.rank(), edits.len());
        total += accepted;
    }
    Ok((total, true))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algs::communicator::NoComm;
    use crate::algs::meshgen::build_box;
    use crate::geometry::tensor;

    fn box_with_size(n: usize, size: f64) -> Mesh {
        let mut mesh = build_box(NoComm, 2, [1.0, 1.0, 0.0], [n, n, 0]).unwrap();
        let m = tensor::to_packed(2, &tensor::isotropic(2, size));
        let values: Vec<f64> = (0..mesh.nslots(0)).flat_map(|_| m.clone()).collect();
        mesh.add_tag(0, METRIC, 3, values).unwrap();
        mesh
    }

    #[test]
    fn defaults_validate() {
        assert!(AdaptOpts::default().validate().is_ok());
        let opts = AdaptOpts {
            min_length_desired: 2.0,
            ..AdaptOpts::default()
        };
        assert!(opts.validate().is_err());
    }

    #[test]
    fn refinement_brings_lengths_below_the_maximum() {
        let mut mesh = box_with_size(2, 0.2);
        let report = adapt(&mut mesh, &AdaptOpts::default()).unwrap();
        assert!(report.converged);
        assert!(report.refined > 0);
        assert!(report.after.max_length <= AdaptOpts::default().max_length_desired + 1e-9);
        assert!(report.after.min_quality >= AdaptOpts::default().min_quality_allowed);
    }

    #[test]
    fn coarsening_reduces_an_overrefined_mesh() {
        let mut mesh = box_with_size(8, 0.5);
        let before = mesh.nelems();
        let report = adapt(&mut mesh, &AdaptOpts::default()).unwrap();
        assert!(report.coarsened > 0);
        assert!(mesh.nelems() < before);
    }

    #[test]
    fn missing_metric_is_rejected_before_mutation() {
        let mut mesh = build_box(NoComm, 2, [1.0, 1.0, 0.0], [2, 2, 0]).unwrap();
        let n = mesh.nelems();
        let err = adapt(&mut mesh, &AdaptOpts::default()).unwrap_err();
        assert!(matches!(err, MeshAdaptError::MissingTag { .. }));
        assert_eq!(mesh.nelems(), n);
    }

    #[test]
    fn round_cap_is_reported() {
        let mut mesh = box_with_size(2, 0.05);
        let opts = AdaptOpts {
            max_rounds_per_pass: 1,
            max_sweeps: 2,
            ..AdaptOpts::default()
        };
        let report = adapt(&mut mesh, &opts).unwrap();
        assert!(report.refined > 0);
        assert!(report.capped_passes >= 1);
        assert!(!report.converged);
    }

    #[test]
    fn disabled_operators_leave_the_mesh_alone() {
        let mut mesh = box_with_size(2, 0.2);
        let opts = AdaptOpts {
            should_refine: false,
            should_coarsen: false,
            should_swap: false,
            ..AdaptOpts::default()
        };
        let report = adapt(&mut mesh, &opts).unwrap();
        assert_eq!(report.total_edits(), 0);
        assert_eq!(report.sweeps, 1);
        assert_eq!(mesh.nelems(), 8);
    }
}
