//! Cavities, edit plans and the read-only view operators evaluate against.
//!
//! An operator never mutates the mesh. It reads an [`AdaptView`] (the mesh
//! plus per-vertex metric tensors and sliver flags) and returns an
//! [`EditPlan`]: the cavity elements to remove and the elements that replace
//! them, written over [`VertRef`]s so new vertices can be referenced before
//! they exist.

use crate::algs::communicator::Communicator;
use crate::geometry::metrics::{signed_measure, Vec3};
use crate::geometry::quality::{edge_length, element_quality};
use crate::geometry::tensor::{self, Mat};
use crate::mesh_error::MeshAdaptError;
use crate::topology::mesh::Mesh;
use crate::topology::simplex::{self, symm_ncomps, EDGE, VERT};
use thiserror::Error;

/// Operator class of an edit.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum OpKind {
    Refine,
    Coarsen,
    Swap,
    Move,
}

/// Why an operator declined a candidate.
#[derive(Clone, Debug, PartialEq, Error)]
pub enum Rejection {
    #[error("candidate does not meet the operator's selection criterion")]
    NotEligible,
    #[error("edit would move a vertex off its model entity")]
    Classification,
    #[error("edit would pinch the domain")]
    Pinching,
    #[error("edit would make the mesh non-manifold")]
    Topology,
    #[error("edit would invert an element")]
    Inverted,
    #[error("resulting quality {quality:.4} is below the floor {floor:.4}")]
    LowQuality { quality: f64, floor: f64 },
    #[error("resulting edge length {length:.4} exceeds the allowed maximum")]
    LongEdge { length: f64 },
    #[error("cavity volume changes from {before:.6e} to {after:.6e}")]
    VolumeChange { before: f64, after: f64 },
    #[error("edit does not improve the cavity quality")]
    NoImprovement,
}

impl From<Rejection> for MeshAdaptError {
    fn from(r: Rejection) -> Self {
        MeshAdaptError::Validation(r.to_string())
    }
}

/// A vertex of a planned element: an existing slot or a planned vertex.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum VertRef {
    Old(usize),
    New(usize),
}

/// How a planned vertex relates to the existing mesh.
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum VertexOrigin {
    /// The point `a + t (b - a)` on an existing edge.
    Split { edge: usize, a: usize, b: usize, t: f64 },
    /// A relocated replacement of an existing vertex.
    Moved { from: usize },
}

#[derive(Clone, Debug, PartialEq)]
pub struct NewVertex {
    pub pos: Vec3,
    pub metric: Mat,
    pub origin: VertexOrigin,
}

#[derive(Clone, Debug, PartialEq)]
pub struct NewElement {
    /// Vertices in orientation order.
    pub verts: Vec<VertRef>,
    /// Cavity element this one replaces.
    pub parent: usize,
}

/// A sub-entity of the planned elements.
#[derive(Clone, Debug, PartialEq)]
pub struct PlannedSub {
    /// Sorted vertex references.
    pub verts: Vec<VertRef>,
    /// The existing entity with these vertices, if any.
    pub existing: Option<usize>,
}

/// A validated local edit, ready to be committed.
#[derive(Clone, Debug, PartialEq)]
pub struct EditPlan {
    pub kind: OpKind,
    pub key_dim: usize,
    pub key: usize,
    /// Elements removed by the edit.
    pub cavity: Vec<usize>,
    pub new_verts: Vec<NewVertex>,
    pub new_elems: Vec<NewElement>,
    /// `(v, w)` when vertex `v` collapses onto `w`.
    pub collapse: Option<(usize, usize)>,
    pub quality_before: f64,
    pub quality_after: f64,
}

impl EditPlan {
    /// Sorted vertices of the cavity elements.
    pub fn cavity_verts<C: Communicator>(&self, mesh: &Mesh<C>) -> Vec<usize> {
        let dim = mesh.dim();
        let mut out: Vec<usize> = self
            .cavity
            .iter()
            .flat_map(|&e| mesh.verts_of(dim, e).iter().copied())
            .collect();
        out.sort_unstable();
        out.dedup();
        out
    }

    /// Distinct sub-entities of dimension `low` of the planned elements.
    pub fn planned_subs<C: Communicator>(&self, mesh: &Mesh<C>, low: usize) -> Vec<PlannedSub> {
        let dim = mesh.dim();
        let mut subs: Vec<Vec<VertRef>> = Vec::new();
        for el in &self.new_elems {
            for local in simplex::template(dim, low) {
                let mut verts: Vec<VertRef> = local.iter().map(|&k| el.verts[k]).collect();
                verts.sort_unstable();
                subs.push(verts);
            }
        }
        subs.sort_unstable();
        subs.dedup();
        subs.into_iter()
            .map(|verts| {
                let olds: Option<Vec<usize>> = verts
                    .iter()
                    .map(|r| match r {
                        VertRef::Old(v) => Some(*v),
                        VertRef::New(_) => None,
                    })
                    .collect();
                let existing = olds.and_then(|o| mesh.find_entity(low, &o));
                PlannedSub { verts, existing }
            })
            .collect()
    }

    /// Existing vertices an entity over `refs` descends from.
    ///
    /// A collapse maps the surviving vertex back to the removed one, so new
    /// entities of a collapse resolve to the entity they were swept from.
    pub fn ancestors(&self, refs: &[VertRef]) -> Vec<usize> {
        let mut out = Vec::new();
        for r in refs {
            match *r {
                VertRef::Old(x) => match self.collapse {
                    Some((v, w)) if x == w => out.push(v),
                    _ => out.push(x),
                },
                VertRef::New(k) => match self.new_verts[k].origin {
                    VertexOrigin::Split { a, b, .. } => out.extend([a, b]),
                    VertexOrigin::Moved { from } => out.push(from),
                },
            }
        }
        out.sort_unstable();
        out.dedup();
        out
    }

    /// The lowest-dimensional existing entity, within the cavity closure,
    /// containing every ancestor of `refs`. Falls back to the first cavity
    /// element.
    pub fn class_source<C: Communicator>(&self, mesh: &Mesh<C>, refs: &[VertRef]) -> (usize, usize) {
        let dim = mesh.dim();
        let anc = self.ancestors(refs);
        if anc.is_empty() {
            return (dim, self.cavity[0]);
        }
        for d in (anc.len() - 1)..=dim {
            if d == anc.len() - 1 {
                if let Some(e) = mesh.find_entity(d, &anc) {
                    return (d, e);
                }
                continue;
            }
            for &e in &self.cavity {
                for s in mesh.sub_entities(dim, e, d) {
                    let sv = mesh.verts_of(d, s);
                    if anc.iter().all(|v| sv.contains(v)) {
                        return (d, s);
                    }
                }
            }
        }
        (dim, self.cavity[0])
    }
}

/// Read-only state shared by all candidates of a pass.
pub struct AdaptView<'a, C: Communicator> {
    mesh: &'a Mesh<C>,
    metrics: Vec<Mat>,
    near_sliver: Vec<bool>,
}

impl<'a, C: Communicator> AdaptView<'a, C> {
    /// Snapshot the metric tag `metric` of `mesh`.
    pub fn new(mesh: &'a Mesh<C>, metric: &str) -> Result<Self, MeshAdaptError> {
        let dim = mesh.dim();
        let ncomps = mesh.ncomps(VERT, metric)?;
        if ncomps != symm_ncomps(dim) {
            return Err(MeshAdaptError::TagSizeMismatch {
                dim: VERT,
                name: metric.to_owned(),
                expected: symm_ncomps(dim),
                found: ncomps,
            });
        }
        let values = mesh.get_tag::<f64>(VERT, metric)?;
        let metrics = values
            .chunks_exact(ncomps)
            .map(|c| tensor::from_packed(dim, c))
            .collect();
        Ok(Self {
            mesh,
            metrics,
            near_sliver: vec![false; mesh.nslots(VERT)],
        })
    }

    /// Mark the vertices close to a sliver, which relaxes the collapse floor.
    pub fn with_sliver_region(mut self, near: Vec<bool>) -> Self {
        self.near_sliver = near;
        self
    }

    #[inline]
    pub fn mesh(&self) -> &'a Mesh<C> {
        self.mesh
    }

    #[inline]
    pub fn dim(&self) -> usize {
        self.mesh.dim()
    }

    pub fn metric(&self, v: usize) -> &Mat {
        &self.metrics[v]
    }

    pub fn is_near_sliver(&self, v: usize) -> bool {
        self.near_sliver.get(v).copied().unwrap_or(false)
    }

    pub fn point(&self, v: usize) -> Vec3 {
        self.mesh.coord(v)
    }

    /// Metric length between two existing vertices.
    pub fn length(&self, a: usize, b: usize) -> f64 {
        edge_length(self.dim(), self.point(a), self.point(b), &self.metrics[a], &self.metrics[b])
    }

    pub fn edge_length(&self, edge: usize) -> f64 {
        let v = self.mesh.verts_of(EDGE, edge);
        self.length(v[0], v[1])
    }

    pub fn quality(&self, elem: usize) -> f64 {
        let dim = self.dim();
        let verts = self.mesh.verts_of(dim, elem);
        let pts: Vec<Vec3> = verts.iter().map(|&v| self.point(v)).collect();
        let ms: Vec<Mat> = verts.iter().map(|&v| self.metrics[v]).collect();
        element_quality(dim, &pts, &ms)
    }

    pub fn min_quality(&self, elems: &[usize]) -> f64 {
        elems.iter().map(|&e| self.quality(e)).fold(f64::INFINITY, f64::min)
    }

    fn resolve(&self, new_verts: &[NewVertex], r: VertRef) -> (Vec3, Mat) {
        match r {
            VertRef::Old(v) => (self.point(v), self.metrics[v]),
            VertRef::New(k) => (new_verts[k].pos, new_verts[k].metric),
        }
    }

    /// Signed measure and quality of a planned element.
    pub fn planned_shape(&self, new_verts: &[NewVertex], verts: &[VertRef]) -> (f64, f64) {
        let dim = self.dim();
        let (pts, ms): (Vec<Vec3>, Vec<Mat>) = verts.iter().map(|&r| self.resolve(new_verts, r)).unzip();
        (signed_measure(dim, &pts), element_quality(dim, &pts, &ms))
    }

    /// Metric length of a planned edge.
    pub fn planned_length(&self, new_verts: &[NewVertex], a: VertRef, b: VertRef) -> f64 {
        let (pa, ma) = self.resolve(new_verts, a);
        let (pb, mb) = self.resolve(new_verts, b);
        edge_length(self.dim(), pa, pb, &ma, &mb)
    }

    /// Measure of a set of existing elements.
    pub fn volume(&self, elems: &[usize]) -> f64 {
        let dim = self.dim();
        elems
            .iter()
            .map(|&e| signed_measure(dim, &self.mesh.elem_points(e)))
            .sum()
    }

    /// Check planned elements for inversion and the quality floor; returns
    /// their minimum quality.
    pub fn check_elements(
        &self,
        new_verts: &[NewVertex],
        elems: &[NewElement],
        floor: f64,
    ) -> Result<f64, Rejection> {
        let mut worst = f64::INFINITY;
        for el in elems {
            let (measure, q) = self.planned_shape(new_verts, &el.verts);
            if measure <= 0.0 || q <= 0.0 {
                return Err(Rejection::Inverted);
            }
            if q < floor {
                return Err(Rejection::LowQuality { quality: q, floor });
            }
            worst = worst.min(q);
        }
        Ok(worst)
    }

    /// Reject when the planned elements do not fill the cavity's volume to
    /// the relative `tolerance`.
    pub fn check_volume(
        &self,
        plan_verts: &[NewVertex],
        cavity: &[usize],
        elems: &[NewElement],
        tolerance: f64,
    ) -> Result<(), Rejection> {
        let before = self.volume(cavity);
        let after: f64 = elems.iter().map(|el| self.planned_shape(plan_verts, &el.verts).0).sum();
        if (after - before).abs() > tolerance * before.abs().max(f64::MIN_POSITIVE) {
            return Err(Rejection::VolumeChange { before, after });
        }
        Ok(())
    }

    /// Reject when a planned edge exceeds `max_length`.
    pub fn check_lengths(&self, plan: &EditPlan, max_length: f64) -> Result<(), Rejection> {
        for sub in plan.planned_subs(self.mesh, EDGE) {
            if sub.existing.is_some() {
                continue;
            }
            let l = self.planned_length(&plan.new_verts, sub.verts[0], sub.verts[1]);
            if l > max_length {
                return Err(Rejection::LongEdge { length: l });
            }
        }
        Ok(())
    }
}
