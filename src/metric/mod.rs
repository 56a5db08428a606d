//! Metric field builder.
//!
//! Several sources are evaluated into per-vertex tensors and combined into
//! one SPD field by intersection:
//!
//! 1. scaled sources are intersected and multiplied by a global scalar
//!    chosen by element-count limiting;
//! 2. the result is intersected with the absolute sources;
//! 3. sizes are clamped, then gradation is limited.
//!
//! Every eigenvalue is finally floored at `1/h_max²`, where `h_max` is the
//! length clamp bound or the diagonal of the global bounding box, so the
//! stored field is SPD even where no source constrains it.

pub mod limit;
pub mod sources;

use crate::algs::communicator::Communicator;
use crate::config::error::ConfigError;
use crate::geometry::tensor::{self, Mat, ZERO};
use crate::mesh_error::{ConvergenceFailure, MeshAdaptError};
use crate::topology::mesh::{Mesh, METRIC};
use crate::topology::simplex::{symm_ncomps, VERT};
use serde::{Deserialize, Serialize};

/// What a metric source is computed from.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MetricSourceKind {
    /// Recovered Hessian of a scalar vertex field.
    Hessian,
    /// An existing metric or isotropic size tag.
    Given,
    /// The metric of the current mesh.
    Implied,
    /// Distance between facing boundary sides.
    Proximity,
    /// Boundary curvature.
    Curvature,
}

impl MetricSourceKind {
    /// Whether the source reads a vertex tag.
    pub fn needs_tag(self) -> bool {
        matches!(self, MetricSourceKind::Hessian | MetricSourceKind::Given)
    }
}

/// One contribution to the metric field.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MetricSource {
    pub kind: MetricSourceKind,
    /// Scaled by element-count limiting rather than used as given.
    pub should_scale: bool,
    /// Vertex tag read by Hessian and Given sources.
    pub tag_name: String,
    /// Source-specific tuning; `None` selects the source default.
    pub knob: Option<f64>,
}

impl MetricSource {
    pub fn new(kind: MetricSourceKind, should_scale: bool, tag_name: impl Into<String>) -> Self {
        Self {
            kind,
            should_scale,
            tag_name: tag_name.into(),
            knob: None,
        }
    }

    pub fn with_knob(mut self, knob: f64) -> Self {
        self.knob = Some(knob);
        self
    }
}

/// Sources plus the limiting knobs of one metric build.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricInput {
    pub sources: Vec<MetricSource>,
    pub should_limit_lengths: bool,
    pub min_length: f64,
    pub max_length: f64,
    pub should_limit_gradation: bool,
    pub max_gradation_rate: f64,
    pub gradation_convergence_tolerance: f64,
    pub max_gradation_iterations: usize,
    pub should_limit_element_count: bool,
    pub min_element_count: f64,
    pub max_element_count: f64,
    pub element_count_over_relaxation: f64,
    pub max_element_count_iterations: usize,
    /// Smoothing steps applied to recovered Hessian metrics.
    pub nsmoothing_steps: usize,
    /// Name of the vertex tag the result is written to.
    pub metric_name: String,
}

impl Default for MetricInput {
    fn default() -> Self {
        Self {
            sources: Vec::new(),
            should_limit_lengths: false,
            min_length: 0.0,
            max_length: f64::INFINITY,
            should_limit_gradation: false,
            max_gradation_rate: 1.0,
            gradation_convergence_tolerance: 1e-3,
            max_gradation_iterations: 100,
            should_limit_element_count: false,
            min_element_count: 1.0,
            max_element_count: 1e6,
            element_count_over_relaxation: 1.1,
            max_element_count_iterations: 20,
            nsmoothing_steps: 0,
            metric_name: METRIC.to_owned(),
        }
    }
}

impl MetricInput {
    pub fn add_source(&mut self, source: MetricSource) -> &mut Self {
        self.sources.push(source);
        self
    }

    /// Reject inputs that cannot produce a metric.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |param: &str, reason: &str| ConfigError::InvalidValue {
            param: param.to_owned(),
            reason: reason.to_owned(),
        };
        if self.sources.is_empty() {
            return Err(ConfigError::MissingEntry("Sources".into()));
        }
        for s in &self.sources {
            if s.kind.needs_tag() && s.tag_name.is_empty() {
                return Err(invalid("Tag Name", "Hessian and Given sources read a vertex tag"));
            }
            if let Some(k) = s.knob {
                if !(k > 0.0 && k.is_finite()) {
                    return Err(invalid("Knob", "must be positive and finite"));
                }
            }
        }
        if self.should_limit_lengths && !(self.min_length >= 0.0 && self.min_length < self.max_length) {
            return Err(invalid("Min Length", "must be non-negative and below Max Length"));
        }
        if self.should_limit_gradation {
            if !(self.max_gradation_rate > 0.0) {
                return Err(invalid("Max Gradation Rate", "must be positive"));
            }
            if !(self.gradation_convergence_tolerance > 0.0) {
                return Err(invalid("Gradation Convergence Tolerance", "must be positive"));
            }
        }
        if self.should_limit_element_count {
            if !(self.min_element_count > 0.0 && self.min_element_count <= self.max_element_count) {
                return Err(invalid("Min Element Count", "must be positive and at most Max Element Count"));
            }
            if !(self.element_count_over_relaxation > 0.0) {
                return Err(invalid("Element Count Over-Relaxation", "must be positive"));
            }
        }
        if self.metric_name.is_empty() {
            return Err(invalid("Metric Name", "must not be empty"));
        }
        Ok(())
    }
}

/// Result of [`generate_metric`].
#[derive(Clone, Debug, PartialEq)]
pub struct MetricOutput {
    /// Vertex tag holding the metric.
    pub tag_name: String,
    /// Global scalar applied to the scaled sources.
    pub scale: f64,
    /// Predicted element count of the final field.
    pub predicted_elements: f64,
    /// Limiters that stopped at their iteration cap.
    pub failures: Vec<ConvergenceFailure>,
}

/// Collective: refresh the non-owned entries of a per-vertex tensor field.
pub(crate) fn sync_metrics<C: Communicator>(mesh: &Mesh<C>, ms: &mut [Mat]) -> Result<(), MeshAdaptError> {
    if mesh.nranks() == 1 {
        return Ok(());
    }
    let dim = mesh.dim();
    let n = symm_ncomps(dim);
    let mut packed: Vec<f64> = ms.iter().flat_map(|m| tensor::to_packed(dim, m)).collect();
    mesh.sync_array(VERT, &mut packed, n)?;
    for (v, m) in ms.iter_mut().enumerate() {
        *m = tensor::from_packed(dim, &packed[v * n..(v + 1) * n]);
    }
    Ok(())
}

/// Collective: read a per-vertex tensor field from a tag.
pub fn read_metrics<C: Communicator>(mesh: &Mesh<C>, name: &str) -> Result<Vec<Mat>, MeshAdaptError> {
    let dim = mesh.dim();
    let n = symm_ncomps(dim);
    let found = mesh.ncomps(VERT, name)?;
    if found != n {
        return Err(MeshAdaptError::TagSizeMismatch {
            dim: VERT,
            name: name.to_owned(),
            expected: n,
            found,
        });
    }
    let values = mesh.get_tag::<f64>(VERT, name)?;
    Ok((0..mesh.nslots(VERT))
        .map(|v| tensor::from_packed(dim, &values[v * n..(v + 1) * n]))
        .collect())
}

/// Size bounds every final tensor is clamped into.
fn size_bounds(input: &MetricInput, diagonal: f64) -> (f64, f64) {
    if input.should_limit_lengths {
        let h_max = if input.max_length.is_finite() {
            input.max_length
        } else {
            diagonal
        };
        (input.min_length, h_max)
    } else {
        (0.0, diagonal)
    }
}

/// Collective: combine, clamp and grade the metric for one global scalar.
fn assemble<C: Communicator>(
    mesh: &Mesh<C>,
    input: &MetricInput,
    scaled: &[Mat],
    absolute: &[Mat],
    s: f64,
    bounds: (f64, f64),
    failures: &mut Vec<ConvergenceFailure>,
) -> Result<Vec<Mat>, MeshAdaptError> {
    let dim = mesh.dim();
    let (h_min, h_max) = bounds;
    let mut ms: Vec<Mat> = scaled
        .iter()
        .zip(absolute)
        .map(|(a, b)| tensor::intersect(dim, &tensor::scale(a, s), b))
        .collect();
    limit::clamp_lengths(dim, &mut ms, h_min, h_max);
    if input.should_limit_gradation {
        if let Some(f) = limit::limit_gradation(
            mesh,
            &mut ms,
            input.max_gradation_rate,
            input.gradation_convergence_tolerance,
            input.max_gradation_iterations,
        )? {
            failures.push(f);
        }
        limit::clamp_lengths(dim, &mut ms, h_min, h_max);
    }
    Ok(ms)
}

/// Collective: build the metric field of `input` and store it as a vertex tag.
pub fn generate_metric<C: Communicator>(mesh: &mut Mesh<C>, input: &MetricInput) -> Result<MetricOutput, MeshAdaptError> {
    input.validate()?;
    let dim = mesh.dim();
    let nslots = mesh.nslots(VERT);
    let diagonal = mesh.bounding_box()?.diagonal();
    if !(diagonal > 0.0) {
        return Err(MeshAdaptError::InvalidGeometry("mesh has an empty bounding box".into()));
    }
    let bounds = size_bounds(input, diagonal);

    let mut scaled = vec![ZERO; nslots];
    let mut absolute = vec![ZERO; nslots];
    for source in &input.sources {
        let ms = sources::evaluate(mesh, source, input.nsmoothing_steps)?;
        let target = if source.should_scale { &mut scaled } else { &mut absolute };
        for (t, m) in target.iter_mut().zip(&ms) {
            *t = tensor::intersect(dim, t, m);
        }
        log::debug!("metric source {:?} ({}) evaluated", source.kind, source.tag_name);
    }

    let mut failures = Vec::new();
    let mut s = 1.0;
    let mut ms = assemble(mesh, input, &scaled, &absolute, s, bounds, &mut failures)?;
    let mut predicted = limit::predicted_element_count(mesh, &ms)?;
    let has_scaled = input.sources.iter().any(|src| src.should_scale);
    if input.should_limit_element_count && has_scaled {
        let (lo, hi) = (input.min_element_count, input.max_element_count);
        let mut converged = false;
        for it in 0..input.max_element_count_iterations {
            if predicted >= lo && predicted <= hi {
                converged = true;
                break;
            }
            let target = predicted.clamp(lo, hi);
            s *= limit::count_scaling(dim, predicted, target, input.element_count_over_relaxation);
            failures.clear();
            ms = assemble(mesh, input, &scaled, &absolute, s, bounds, &mut failures)?;
            predicted = limit::predicted_element_count(mesh, &ms)?;
            log::debug!("element count step {it}: scale {s:.4e}, predicted {predicted:.1}");
        }
        converged |= predicted >= lo && predicted <= hi;
        if !converged {
            failures.push(ConvergenceFailure::ElementCount {
                iterations: input.max_element_count_iterations,
                predicted,
            });
        }
    }
    for f in &failures {
        if mesh.rank() == 0 {
            log::warn!("{f}");
        }
    }

    let values: Vec<f64> = ms.iter().flat_map(|m| tensor::to_packed(dim, m)).collect();
    mesh.put_tag(VERT, &input.metric_name, symm_ncomps(dim), values)?;
    Ok(MetricOutput {
        tag_name: input.metric_name.clone(),
        scale: s,
        predicted_elements: predicted,
        failures,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algs::communicator::NoComm;
    use crate::algs::meshgen::build_box;

    #[test]
    fn empty_source_list_is_a_configuration_error() {
        let mut mesh = build_box(NoComm, 2, [1.0, 1.0, 0.0], [2, 2, 0]).unwrap();
        let err = generate_metric(&mut mesh, &MetricInput::default()).unwrap_err();
        assert!(matches!(err, MeshAdaptError::Configuration(ConfigError::MissingEntry(_))));
    }

    #[test]
    fn unconstrained_vertices_get_the_diagonal_size() {
        let mut mesh = build_box(NoComm, 2, [3.0, 4.0, 0.0], [2, 2, 0]).unwrap();
        // a zero size imposes nothing
        mesh.add_tag(VERT, "h", 1, vec![0.0; mesh.nslots(VERT)]).unwrap();
        let mut input = MetricInput::default();
        input.add_source(MetricSource::new(MetricSourceKind::Given, false, "h"));
        let out = generate_metric(&mut mesh, &input).unwrap();
        let ms = read_metrics(&mesh, &out.tag_name).unwrap();
        assert!((ms[0][0][0] - 1.0 / 25.0).abs() < 1e-12);
    }

    #[test]
    fn element_count_limit_scales_the_field() {
        let mut mesh = build_box(NoComm, 2, [1.0, 1.0, 0.0], [4, 4, 0]).unwrap();
        mesh.add_tag(VERT, "h", 1, vec![0.25; mesh.nslots(VERT)]).unwrap();
        let mut input = MetricInput {
            should_limit_element_count: true,
            min_element_count: 200.0,
            max_element_count: 400.0,
            ..MetricInput::default()
        };
        input.add_source(MetricSource::new(MetricSourceKind::Given, true, "h"));
        let out = generate_metric(&mut mesh, &input).unwrap();
        assert!(out.failures.is_empty(), "{:?}", out.failures);
        assert!(out.scale > 1.0);
        assert!(out.predicted_elements >= 200.0 && out.predicted_elements <= 400.0);
    }
}
