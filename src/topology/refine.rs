//! Edge split.

use crate::adapt::AdaptOpts;
use crate::algs::communicator::Communicator;
use crate::geometry::metrics::lerp;
use crate::geometry::tensor;
use crate::topology::cavity::{AdaptView, EditPlan, NewElement, NewVertex, OpKind, Rejection, VertRef, VertexOrigin};
use crate::topology::simplex::EDGE;

/// Parameter of the point splitting `a → b` into two halves of equal metric
/// length, assuming the size varies linearly along the edge.
pub fn metric_midpoint(la: f64, lb: f64) -> f64 {
    let (sa, sb) = (la.max(0.0).sqrt(), lb.max(0.0).sqrt());
    if sa + sb <= 0.0 { 0.5 } else { sb / (sa + sb) }
}

/// Plan the split of `edge` at its metric midpoint.
pub fn plan_split<C: Communicator>(view: &AdaptView<'_, C>, edge: usize, opts: &AdaptOpts) -> Result<EditPlan, Rejection> {
    let mesh = view.mesh();
    let dim = mesh.dim();
    let length = view.edge_length(edge);
    if length <= opts.max_length_desired {
        return Err(Rejection::NotEligible);
    }
    let ev = mesh.verts_of(EDGE, edge);
    let (a, b) = (ev[0], ev[1]);
    let dir = crate::geometry::metrics::sub(view.point(b), view.point(a));
    let la = tensor::metric_length(dim, view.metric(a), dir);
    let lb = tensor::metric_length(dim, view.metric(b), dir);
    let t = metric_midpoint(la, lb);
    let mid = NewVertex {
        pos: lerp(view.point(a), view.point(b), t),
        metric: tensor::intersect(dim, view.metric(a), view.metric(b)),
        origin: VertexOrigin::Split { edge, a, b, t },
    };

    let cavity = mesh.elems_of(EDGE, edge);
    let mut new_elems = Vec::with_capacity(2 * cavity.len());
    for &e in &cavity {
        let verts: Vec<VertRef> = mesh.verts_of(dim, e).iter().map(|&v| VertRef::Old(v)).collect();
        for replaced in [b, a] {
            let split: Vec<VertRef> = verts
                .iter()
                .map(|&r| if r == VertRef::Old(replaced) { VertRef::New(0) } else { r })
                .collect();
            new_elems.push(NewElement { verts: split, parent: e });
        }
    }
    let new_verts = vec![mid];
    let quality_after = view.check_elements(&new_verts, &new_elems, opts.min_quality_allowed)?;
    Ok(EditPlan {
        kind: OpKind::Refine,
        key_dim: EDGE,
        key: edge,
        quality_before: view.min_quality(&cavity),
        cavity,
        new_verts,
        new_elems,
        collapse: None,
        quality_after,
    })
}
