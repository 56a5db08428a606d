//! Field transfer through local edits.
//!
//! [`transfer_plan`] evaluates, against the unmodified mesh, the tag rows of
//! every entity an [`EditPlan`] creates and the rows of surviving vertices it
//! changes. Coordinates, the adaptation metric and classification follow
//! built-in rules; every other tag follows its [`TransferPolicy`], Inherit
//! when none is configured.

pub mod conserve;

use crate::algs::communicator::Communicator;
use crate::config::error::ConfigError;
use crate::data::tags::{TagSet, TagValue};
use crate::geometry::metrics::{barycentric, centroid, signed_measure, Vec3};
use crate::geometry::tensor;
use crate::mesh_error::{ConvergenceFailure, MeshAdaptError};
use crate::topology::cavity::{EditPlan, VertRef, VertexOrigin};
use crate::topology::mesh::{Mesh, CLASS_DIM, CLASS_ID, COORDINATES};
use crate::topology::simplex::{symm_ncomps, VERT};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// How a field's values are carried onto new entities.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransferPolicy {
    /// Value of the nearest surviving entity.
    #[default]
    Inherit,
    /// Barycentric interpolation from the prior cavity.
    LinearInterp,
    /// Tensor intersection of the endpoint values.
    Metric,
    /// Element density whose cavity integral is preserved.
    Conserve,
    /// Vertex velocity corrected to preserve cavity momentum.
    MomentumVelocity,
    /// Re-evaluation at the new location from the prior cavity.
    Pointwise,
}

/// Tolerance used to compare an integral before and after an edit.
#[derive(Copy, Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub enum VarCompareOpts {
    #[default]
    None,
    Relative { tolerance: f64, floor: f64 },
    Absolute { tolerance: f64, floor: f64 },
}

impl VarCompareOpts {
    pub fn none() -> Self {
        VarCompareOpts::None
    }

    /// Whether `after` is acceptably close to `before`; values no larger
    /// than the floor in magnitude compare equal.
    pub fn accepts(&self, before: f64, after: f64) -> bool {
        match *self {
            VarCompareOpts::None => true,
            VarCompareOpts::Relative { tolerance, floor } => {
                let scale = before.abs().max(after.abs());
                scale <= floor || (after - before).abs() <= tolerance * scale
            }
            VarCompareOpts::Absolute { tolerance, floor } => {
                (before.abs() <= floor && after.abs() <= floor) || (after - before).abs() <= tolerance
            }
        }
    }
}

/// Per-field transfer configuration.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferOpts {
    pub type_map: BTreeMap<String, TransferPolicy>,
    /// Conserve field → integral name.
    pub integral_map: BTreeMap<String, String>,
    /// MomentumVelocity field → momentum name.
    pub velocity_momentum_map: BTreeMap<String, String>,
    /// Integral or momentum name → convergence check.
    pub integral_diffuse_map: BTreeMap<String, VarCompareOpts>,
    /// Reject collapses, swaps and moves that change the cavity volume.
    pub should_conserve_size: bool,
}

/// Integral whose Conserve field provides the lumped vertex masses.
pub const MASS_INTEGRAL: &str = "mass";

impl TransferOpts {
    pub fn policy(&self, field: &str) -> TransferPolicy {
        self.type_map.get(field).copied().unwrap_or_default()
    }

    pub fn set_policy(&mut self, field: &str, policy: TransferPolicy) -> &mut Self {
        self.type_map.insert(field.to_owned(), policy);
        self
    }

    pub fn set_conserve(&mut self, field: &str, integral: &str, compare: VarCompareOpts) -> &mut Self {
        self.set_policy(field, TransferPolicy::Conserve);
        self.integral_map.insert(field.to_owned(), integral.to_owned());
        self.integral_diffuse_map.insert(integral.to_owned(), compare);
        self
    }

    pub fn set_momentum_velocity(&mut self, field: &str, momentum: &str, compare: VarCompareOpts) -> &mut Self {
        self.set_policy(field, TransferPolicy::MomentumVelocity);
        self.velocity_momentum_map.insert(field.to_owned(), momentum.to_owned());
        self.integral_diffuse_map.insert(momentum.to_owned(), compare);
        self
    }

    /// Integral name and check of a Conserve or MomentumVelocity field.
    pub fn integral_of(&self, field: &str) -> Option<(&str, VarCompareOpts)> {
        let name = match self.policy(field) {
            TransferPolicy::Conserve => self.integral_map.get(field)?,
            TransferPolicy::MomentumVelocity => self.velocity_momentum_map.get(field)?,
            _ => return None,
        };
        let compare = *self.integral_diffuse_map.get(name)?;
        Some((name.as_str(), compare))
    }

    /// The Conserve field integrating to [`MASS_INTEGRAL`].
    pub fn mass_field(&self) -> Option<&str> {
        self.integral_map
            .iter()
            .find(|(f, i)| i.as_str() == MASS_INTEGRAL && self.policy(f) == TransferPolicy::Conserve)
            .map(|(f, _)| f.as_str())
    }

    /// Every Conserve and MomentumVelocity field must resolve to exactly one
    /// convergence entry.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (field, policy) in &self.type_map {
            let map = match policy {
                TransferPolicy::Conserve => &self.integral_map,
                TransferPolicy::MomentumVelocity => &self.velocity_momentum_map,
                _ => continue,
            };
            let name = map.get(field).ok_or_else(|| ConfigError::UnresolvedIntegral {
                field: field.clone(),
                reason: format!("{policy:?} field names no integral"),
            })?;
            if !self.integral_diffuse_map.contains_key(name) {
                return Err(ConfigError::UnresolvedIntegral {
                    field: field.clone(),
                    reason: format!("integral \"{name}\" has no convergence entry"),
                });
            }
        }
        for field in self.integral_map.keys() {
            if self.policy(field) != TransferPolicy::Conserve {
                return Err(ConfigError::UnresolvedIntegral {
                    field: field.clone(),
                    reason: "has an integral but is not a Conserve field".into(),
                });
            }
        }
        for field in self.velocity_momentum_map.keys() {
            if self.policy(field) != TransferPolicy::MomentumVelocity {
                return Err(ConfigError::UnresolvedIntegral {
                    field: field.clone(),
                    reason: "has a momentum but is not a Momentum Velocity field".into(),
                });
            }
        }
        Ok(())
    }

    /// Check that every configured field exists with a usable layout.
    pub fn check_mesh<C: Communicator>(&self, mesh: &Mesh<C>) -> Result<(), MeshAdaptError> {
        self.validate()?;
        let dim = mesh.dim();
        let invalid = |field: &str, reason: String| -> MeshAdaptError {
            ConfigError::InvalidValue {
                param: field.to_owned(),
                reason,
            }
            .into()
        };
        for (field, policy) in &self.type_map {
            let on: Vec<usize> = (0..=dim).filter(|&d| mesh.has_tag(d, field)).collect();
            if on.is_empty() {
                return Err(invalid(field, "no such tag on the mesh".into()));
            }
            let want = match policy {
                TransferPolicy::Conserve => Some(dim),
                TransferPolicy::MomentumVelocity | TransferPolicy::Metric => Some(VERT),
                _ => None,
            };
            if let Some(d) = want {
                if !on.contains(&d) {
                    return Err(invalid(field, format!("{policy:?} fields live on dimension {d}")));
                }
                if mesh.get_tag::<f64>(d, field).is_err() {
                    return Err(invalid(field, format!("{policy:?} fields hold f64 values")));
                }
            }
            if *policy == TransferPolicy::Metric && mesh.ncomps(VERT, field)? != symm_ncomps(dim) {
                return Err(invalid(field, format!("metric fields have {} components", symm_ncomps(dim))));
            }
        }
        Ok(())
    }
}

/// Tag rows produced for one plan.
#[derive(Clone, Debug, Default)]
pub struct PlanFields {
    /// One row per planned vertex.
    pub verts: TagSet,
    /// Per dimension below the elements, the new sub-entities (sorted
    /// vertex references, `planned_subs` order) and their rows.
    pub new_subs: Vec<Vec<Vec<VertRef>>>,
    pub lowers: Vec<TagSet>,
    /// One row per planned element.
    pub elems: TagSet,
    /// Surviving vertices whose rows change, each with its full new row.
    pub updates: Vec<(usize, TagSet)>,
    pub warnings: Vec<ConvergenceFailure>,
}

/// Empty rows with the schema of dimension `dim`.
pub(crate) fn scratch<C: Communicator>(mesh: &Mesh<C>, dim: usize, rows: usize) -> TagSet {
    let mut set = mesh.tags(dim).gather_all(&[]);
    set.resize_all(rows);
    set
}

/// Copy every tag of entity `slot` of `mesh` into `row`.
pub(crate) fn copy_row<C: Communicator>(mesh: &Mesh<C>, dim: usize, slot: usize, set: &mut TagSet, row: usize) {
    let src = mesh.tags(dim);
    for (name, tag) in set.iter_mut() {
        if let Some(s) = src.get(name) {
            let n = tag.ncomps();
            tag.data_mut().copy_entity_from(row, s.data(), slot, n);
        }
    }
}

pub(crate) fn write_row<T: TagValue>(set: &mut TagSet, name: &str, row: usize, values: &[T]) {
    if let Some(tag) = set.get_mut(name) {
        let n = tag.ncomps();
        if let Some(v) = T::view_mut(tag.data_mut()) {
            v[row * n..(row + 1) * n].copy_from_slice(&values[..n]);
        }
    }
}

pub(crate) fn read_row(set: &TagSet, name: &str, row: usize) -> Option<Vec<f64>> {
    let tag = set.get(name)?;
    let n = tag.ncomps();
    f64::view(tag.data()).map(|v| v[row * n..(row + 1) * n].to_vec())
}

/// Position of a planned vertex reference.
pub(crate) fn ref_point<C: Communicator>(mesh: &Mesh<C>, plan: &EditPlan, r: VertRef) -> Vec3 {
    match r {
        VertRef::Old(v) => mesh.coord(v),
        VertRef::New(k) => plan.new_verts[k].pos,
    }
}

/// Unsigned measures of the planned elements.
pub(crate) fn planned_volumes<C: Communicator>(mesh: &Mesh<C>, plan: &EditPlan) -> Vec<f64> {
    let dim = mesh.dim();
    plan.new_elems
        .iter()
        .map(|el| {
            let pts: Vec<Vec3> = el.verts.iter().map(|&r| ref_point(mesh, plan, r)).collect();
            signed_measure(dim, &pts).abs()
        })
        .collect()
}

/// The cavity element containing `p` (or the closest one) and the clamped
/// barycentric weights of `p` in it.
pub(crate) fn locate<C: Communicator>(mesh: &Mesh<C>, cavity: &[usize], p: Vec3) -> Option<(usize, Vec<f64>)> {
    let dim = mesh.dim();
    let mut best: Option<(f64, usize, Vec<f64>)> = None;
    for &e in cavity {
        let Ok(b) = barycentric(dim, &mesh.elem_points(e), p) else {
            continue;
        };
        let worst = b.iter().copied().fold(f64::INFINITY, f64::min);
        if best.as_ref().is_none_or(|(w, _, _)| worst > *w) {
            best = Some((worst, e, b));
        }
    }
    best.map(|(_, e, b)| {
        let clamped: Vec<f64> = b.iter().map(|x| x.max(0.0)).collect();
        let total: f64 = clamped.iter().sum();
        let weights = if total > 0.0 {
            clamped.iter().map(|x| x / total).collect()
        } else {
            vec![1.0 / (dim + 1) as f64; dim + 1]
        };
        (e, weights)
    })
}

fn interpolate_at<C: Communicator>(mesh: &Mesh<C>, values: &[f64], n: usize, cavity: &[usize], p: Vec3) -> Option<Vec<f64>> {
    let dim = mesh.dim();
    let (e, w) = locate(mesh, cavity, p)?;
    let mut out = vec![0.0; n];
    for (&v, wk) in mesh.verts_of(dim, e).iter().zip(&w) {
        for c in 0..n {
            out[c] += wk * values[v * n + c];
        }
    }
    Some(out)
}

/// Evaluate the rows of every entity `plan` creates.
pub fn transfer_plan<C: Communicator>(
    mesh: &Mesh<C>,
    plan: &EditPlan,
    opts: &TransferOpts,
    metric_name: &str,
) -> Result<PlanFields, MeshAdaptError> {
    let dim = mesh.dim();
    let mut fields = PlanFields {
        verts: scratch(mesh, VERT, plan.new_verts.len()),
        elems: scratch(mesh, dim, plan.new_elems.len()),
        ..PlanFields::default()
    };
    transfer_vertices(mesh, plan, opts, metric_name, &mut fields.verts)?;
    transfer_lowers(mesh, plan, &mut fields);
    let volumes = planned_volumes(mesh, plan);
    transfer_elements(mesh, plan, opts, &volumes, &mut fields)?;
    for field in mesh.tags(VERT).names() {
        if opts.policy(field) != TransferPolicy::MomentumVelocity {
            continue;
        }
        let Some((momentum, compare)) = opts.integral_of(field) else {
            continue;
        };
        if let Some(w) = conserve::correct_momentum(mesh, plan, field, momentum, compare, opts.mass_field(), &volumes, &mut fields)? {
            fields.warnings.push(w);
        }
    }
    Ok(fields)
}

fn transfer_vertices<C: Communicator>(
    mesh: &Mesh<C>,
    plan: &EditPlan,
    opts: &TransferOpts,
    metric_name: &str,
    rows: &mut TagSet,
) -> Result<(), MeshAdaptError> {
    let dim = mesh.dim();
    let names: Vec<String> = mesh.tag_names(VERT);
    for (k, nv) in plan.new_verts.iter().enumerate() {
        // non-interpolated tags come from the nearest existing vertex
        let nearest = match nv.origin {
            VertexOrigin::Split { a, b, t, .. } => {
                if t < 0.5 {
                    a
                } else {
                    b
                }
            }
            VertexOrigin::Moved { from } => from,
        };
        copy_row(mesh, VERT, nearest, rows, k);
        for name in &names {
            if name == COORDINATES {
                write_row(rows, name, k, &nv.pos[..dim]);
                continue;
            }
            if name == metric_name {
                write_row(rows, name, k, &tensor::to_packed(dim, &nv.metric));
                continue;
            }
            if name == CLASS_DIM || name == CLASS_ID {
                continue;
            }
            let Ok(values) = mesh.get_tag::<f64>(VERT, name) else {
                continue;
            };
            let n = mesh.ncomps(VERT, name)?;
            let policy = opts.policy(name);
            let out: Option<Vec<f64>> = match (policy, nv.origin) {
                (TransferPolicy::Inherit | TransferPolicy::Conserve, _) => None,
                (TransferPolicy::Metric, VertexOrigin::Split { a, b, .. }) if n == symm_ncomps(dim) => {
                    let ma = tensor::from_packed(dim, &values[a * n..(a + 1) * n]);
                    let mb = tensor::from_packed(dim, &values[b * n..(b + 1) * n]);
                    Some(tensor::to_packed(dim, &tensor::intersect(dim, &ma, &mb)))
                }
                (TransferPolicy::Metric, VertexOrigin::Moved { .. }) if n == symm_ncomps(dim) => {
                    locate(mesh, &plan.cavity, nv.pos).map(|(e, w)| {
                        let ms: Vec<_> = mesh
                            .verts_of(dim, e)
                            .iter()
                            .map(|&x| tensor::from_packed(dim, &values[x * n..(x + 1) * n]))
                            .collect();
                        tensor::to_packed(dim, &tensor::log_euclidean_average(dim, &ms, &w))
                    })
                }
                (TransferPolicy::Metric, _) => None,
                (_, VertexOrigin::Split { a, b, t, .. }) => Some(
                    (0..n)
                        .map(|c| (1.0 - t) * values[a * n + c] + t * values[b * n + c])
                        .collect(),
                ),
                (_, VertexOrigin::Moved { .. }) => interpolate_at(mesh, values, n, &plan.cavity, nv.pos),
            };
            if let Some(out) = out {
                write_row(rows, name, k, &out);
            }
        }
        let (sd, se) = plan.class_source(mesh, &[VertRef::New(k)]);
        let (cd, ci) = mesh.class_of(sd, se);
        write_row(rows, CLASS_DIM, k, &[cd]);
        write_row(rows, CLASS_ID, k, &[ci]);
    }
    Ok(())
}

fn transfer_lowers<C: Communicator>(mesh: &Mesh<C>, plan: &EditPlan, fields: &mut PlanFields) {
    let dim = mesh.dim();
    fields.new_subs = vec![Vec::new(); dim];
    fields.lowers = vec![TagSet::default(); dim];
    for low in 1..dim {
        let subs: Vec<Vec<VertRef>> = plan
            .planned_subs(mesh, low)
            .into_iter()
            .filter(|s| s.existing.is_none())
            .map(|s| s.verts)
            .collect();
        let mut rows = scratch(mesh, low, subs.len());
        for (k, refs) in subs.iter().enumerate() {
            let (sd, se) = plan.class_source(mesh, refs);
            if sd == low {
                copy_row(mesh, low, se, &mut rows, k);
            }
            let (cd, ci) = mesh.class_of(sd, se);
            write_row(&mut rows, CLASS_DIM, k, &[cd]);
            write_row(&mut rows, CLASS_ID, k, &[ci]);
        }
        fields.new_subs[low] = subs;
        fields.lowers[low] = rows;
    }
}

fn transfer_elements<C: Communicator>(
    mesh: &Mesh<C>,
    plan: &EditPlan,
    opts: &TransferOpts,
    volumes: &[f64],
    fields: &mut PlanFields,
) -> Result<(), MeshAdaptError> {
    let dim = mesh.dim();
    for (k, el) in plan.new_elems.iter().enumerate() {
        copy_row(mesh, dim, el.parent, &mut fields.elems, k);
    }
    for name in mesh.tag_names(dim) {
        let Ok(values) = mesh.get_tag::<f64>(dim, &name) else {
            continue;
        };
        let n = mesh.ncomps(dim, &name)?;
        match opts.policy(&name) {
            TransferPolicy::Conserve => {
                let Some((integral, compare)) = opts.integral_of(&name) else {
                    continue;
                };
                if let Some(w) = conserve::conserve_field(mesh, plan, &name, integral, compare, volumes, &mut fields.elems)? {
                    fields.warnings.push(w);
                }
            }
            TransferPolicy::Pointwise | TransferPolicy::LinearInterp => {
                for (k, el) in plan.new_elems.iter().enumerate() {
                    let pts: Vec<Vec3> = el.verts.iter().map(|&r| ref_point(mesh, plan, r)).collect();
                    let at = locate(mesh, &plan.cavity, centroid(&pts)).map_or(el.parent, |(e, _)| e);
                    write_row(&mut fields.elems, &name, k, &values[at * n..(at + 1) * n]);
                }
            }
            _ => {}
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapt::AdaptOpts;
    use crate::algs::communicator::NoComm;
    use crate::algs::meshgen::build_box;
    use crate::topology::cavity::AdaptView;
    use crate::topology::mesh::METRIC;
    use crate::topology::refine::plan_split;
    use crate::topology::simplex::EDGE;

    fn mesh_with_fields() -> Mesh {
        let mut mesh = build_box(NoComm, 2, [1.0, 1.0, 0.0], [1, 1, 0]).unwrap();
        let m = tensor::to_packed(2, &tensor::isotropic(2, 0.5));
        let values: Vec<f64> = (0..mesh.nslots(0)).flat_map(|_| m.clone()).collect();
        mesh.add_tag(0, METRIC, 3, values).unwrap();
        let u: Vec<f64> = (0..mesh.nslots(0)).map(|v| 1.0 + mesh.coord(v)[0] + 2.0 * mesh.coord(v)[1]).collect();
        mesh.add_tag(0, "u", 1, u.clone()).unwrap();
        mesh.add_tag(0, "label", 1, u).unwrap();
        mesh.add_tag(2, "rho", 1, vec![2.0, 4.0]).unwrap();
        mesh
    }

    #[test]
    fn compare_options() {
        let rel = VarCompareOpts::Relative { tolerance: 1e-3, floor: 1e-9 };
        assert!(rel.accepts(1000.0, 1000.5));
        assert!(!rel.accepts(1.0, 1.01));
        assert!(rel.accepts(0.0, 1e-12));
        let abs = VarCompareOpts::Absolute { tolerance: 0.1, floor: 0.0 };
        assert!(abs.accepts(5.0, 5.05));
        assert!(!abs.accepts(5.0, 5.2));
        assert!(VarCompareOpts::none().accepts(0.0, 1e9));
    }

    #[test]
    fn conserve_without_integral_is_rejected() {
        let mut opts = TransferOpts::default();
        opts.set_policy("rho", TransferPolicy::Conserve);
        assert!(matches!(opts.validate(), Err(ConfigError::UnresolvedIntegral { .. })));
        opts.integral_map.insert("rho".into(), "mass".into());
        assert!(opts.validate().is_err());
        opts.integral_diffuse_map.insert("mass".into(), VarCompareOpts::none());
        assert!(opts.validate().is_ok());
        assert_eq!(opts.mass_field(), Some("rho"));
    }

    #[test]
    fn split_interpolates_and_inherits() {
        let mesh = mesh_with_fields();
        let view = AdaptView::new(&mesh, METRIC).unwrap();
        let diag = mesh.find_entity(EDGE, &[0, 3]).unwrap();
        let plan = plan_split(&view, diag, &AdaptOpts::default()).unwrap();
        let mut opts = TransferOpts::default();
        opts.set_policy("u", TransferPolicy::LinearInterp);
        opts.set_conserve("rho", "mass", VarCompareOpts::Relative { tolerance: 1e-10, floor: 0.0 });
        let fields = transfer_plan(&mesh, &plan, &opts, METRIC).unwrap();
        assert!(fields.warnings.is_empty());
        // u is linear, so interpolation at the midpoint is exact
        let u = read_row(&fields.verts, "u", 0).unwrap();
        assert!((u[0] - 2.5).abs() < 1e-12);
        let label = read_row(&fields.verts, "label", 0).unwrap();
        assert!(label[0] == 1.0 || label[0] == 4.0);
        let coords = read_row(&fields.verts, COORDINATES, 0).unwrap();
        assert_eq!(coords, vec![0.5, 0.5]);
        // the split cuts each triangle in half: density is unchanged
        let vols = planned_volumes(&mesh, &plan);
        let total: f64 = (0..plan.new_elems.len())
            .map(|k| read_row(&fields.elems, "rho", k).unwrap()[0] * vols[k])
            .sum();
        assert!((total - 3.0).abs() < 1e-12);
        // the diagonal is interior, so the new vertex is too
        let cd = fields.verts.get(CLASS_DIM).unwrap();
        assert_eq!(i8::view(cd.data()).unwrap()[0], 2);
    }

    #[test]
    fn configured_fields_must_exist() {
        let mesh = mesh_with_fields();
        let mut opts = TransferOpts::default();
        opts.set_policy("missing", TransferPolicy::LinearInterp);
        assert!(opts.check_mesh(&mesh).is_err());
        let mut opts = TransferOpts::default();
        opts.set_conserve("u", "mass", VarCompareOpts::none());
        assert!(opts.check_mesh(&mesh).is_err());
    }
}
