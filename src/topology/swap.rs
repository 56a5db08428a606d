//! Edge and face swaps.
//!
//! - 2D: flip the diagonal shared by two triangles.
//! - 3D 2→3: replace two tets sharing a face by three tets around the
//!   segment joining their apexes.
//! - 3D edge swap: remove an interior edge ringed by up to [`MAX_RING`]
//!   tets and fill its cavity from the ring-polygon triangulation with the
//!   best worst quality; a ring of three gives the 3→2 swap.
//!
//! Only interior keys are swapped, and a swap must strictly raise the worst
//! quality of its cavity. Keys below the desired quality are candidates, as
//! are interior edges shorter than the desired minimum length.

use crate::adapt::AdaptOpts;
use crate::algs::communicator::Communicator;
use crate::geometry::metrics::signed_measure;
use crate::topology::cavity::{AdaptView, EditPlan, NewElement, OpKind, Rejection, VertRef};
use crate::topology::simplex::{EDGE, FACE};

/// Plan the swap keyed by entity `key` of dimension `key_dim`.
pub fn plan_swap<C: Communicator>(
    view: &AdaptView<'_, C>,
    key_dim: usize,
    key: usize,
    opts: &AdaptOpts,
) -> Result<EditPlan, Rejection> {
    let mesh = view.mesh();
    let dim = mesh.dim();
    if mesh.class_of(key_dim, key).0 != dim as i8 {
        return Err(Rejection::NotEligible);
    }
    let cavity = mesh.elems_of(key_dim, key);
    let quality_before = view.min_quality(&cavity);
    let short = key_dim == EDGE && view.edge_length(key) < opts.min_length_desired;
    if quality_before >= opts.min_quality_desired && !short {
        return Err(Rejection::NotEligible);
    }
    let new_elems = match (dim, key_dim) {
        (2, EDGE) => flip_edge(view, key, &cavity)?,
        (3, FACE) => two_to_three(view, key, &cavity)?,
        (3, EDGE) => edge_swap(view, key, &cavity)?,
        _ => return Err(Rejection::NotEligible),
    };
    let mut plan = EditPlan {
        kind: OpKind::Swap,
        key_dim,
        key,
        cavity,
        new_verts: Vec::new(),
        new_elems,
        collapse: None,
        quality_before,
        quality_after: 0.0,
    };
    plan.quality_after = view.check_elements(&plan.new_verts, &plan.new_elems, f64::MIN_POSITIVE)?;
    if plan.quality_after <= quality_before {
        return Err(Rejection::NoImprovement);
    }
    view.check_lengths(&plan, opts.max_length_allowed)?;
    if opts.xfer_opts.should_conserve_size {
        view.check_volume(&plan.new_verts, &plan.cavity, &plan.new_elems, opts.volume_tolerance)?;
    }
    Ok(plan)
}

/// The vertex of `elem` not in `shared`.
fn apex(verts: &[usize], shared: &[usize]) -> usize {
    verts
        .iter()
        .copied()
        .find(|v| !shared.contains(v))
        .unwrap_or(usize::MAX)
}

fn replaced(verts: &[usize], from: usize, to: usize) -> Vec<VertRef> {
    verts
        .iter()
        .map(|&x| VertRef::Old(if x == from { to } else { x }))
        .collect()
}

fn flip_edge<C: Communicator>(view: &AdaptView<'_, C>, edge: usize, cavity: &[usize]) -> Result<Vec<NewElement>, Rejection> {
    let mesh = view.mesh();
    let [e1, e2] = cavity else {
        return Err(Rejection::NotEligible);
    };
    let ev = mesh.verts_of(EDGE, edge);
    let (a, b) = (ev[0], ev[1]);
    let t1 = mesh.verts_of(2, *e1);
    let t2 = mesh.verts_of(2, *e2);
    let p = apex(t1, ev);
    let q = apex(t2, ev);
    if mesh.find_entity(EDGE, &[p, q]).is_some() {
        return Err(Rejection::Topology);
    }
    Ok(vec![
        NewElement { verts: replaced(t1, b, q), parent: *e1 },
        NewElement { verts: replaced(t2, a, p), parent: *e2 },
    ])
}

fn two_to_three<C: Communicator>(view: &AdaptView<'_, C>, face: usize, cavity: &[usize]) -> Result<Vec<NewElement>, Rejection> {
    let mesh = view.mesh();
    let [e1, e2] = cavity else {
        return Err(Rejection::NotEligible);
    };
    let fv = mesh.verts_of(FACE, face);
    let t1 = mesh.verts_of(3, *e1);
    let t2 = mesh.verts_of(3, *e2);
    let q = apex(t2, fv);
    let p = apex(t1, fv);
    if mesh.find_entity(EDGE, &[p, q]).is_some() {
        return Err(Rejection::Topology);
    }
    Ok(fv
        .iter()
        .enumerate()
        .map(|(k, &x)| NewElement {
            verts: replaced(t1, x, q),
            parent: if k == 0 { *e1 } else { *e2 },
        })
        .collect())
}

/// Largest ring of tets an edge swap triangulates.
pub const MAX_RING: usize = 7;

/// Vertices around `edge` in ring order, one per cavity tet.
fn edge_ring<C: Communicator>(view: &AdaptView<'_, C>, a: usize, b: usize, cavity: &[usize]) -> Option<Vec<usize>> {
    let mesh = view.mesh();
    let pairs: Vec<[usize; 2]> = cavity
        .iter()
        .map(|&e| {
            let mut opp = mesh.verts_of(3, e).iter().copied().filter(|&x| x != a && x != b);
            [opp.next().unwrap_or(usize::MAX), opp.next().unwrap_or(usize::MAX)]
        })
        .collect();
    let n = pairs.len();
    let mut used = vec![false; n];
    used[0] = true;
    let mut ring = pairs[0].to_vec();
    while ring.len() < n {
        let last = ring[ring.len() - 1];
        let k = (0..n).find(|&k| !used[k] && pairs[k].contains(&last))?;
        used[k] = true;
        let next = if pairs[k][0] == last { pairs[k][1] } else { pairs[k][0] };
        if ring.contains(&next) {
            return None;
        }
        ring.push(next);
    }
    // the remaining tet closes the ring
    let k = used.iter().position(|u| !u)?;
    let closing = [ring[n - 1], ring[0]];
    closing.iter().all(|v| pairs[k].contains(v)).then_some(ring)
}

/// The pair of tets a ring triangle forms with the edge endpoints, oriented
/// positively over `a`, with their worst quality. `None` when either is
/// inverted or the triangle would duplicate an existing entity.
fn ring_pair<C: Communicator>(
    view: &AdaptView<'_, C>,
    (a, b): (usize, usize),
    ring: &[usize],
    (i, j, k): (usize, usize, usize),
) -> Option<([VertRef; 4], [VertRef; 4], f64)> {
    let mesh = view.mesh();
    let n = ring.len();
    let adjacent = |x: usize, y: usize| y == x + 1 || (x == 0 && y == n - 1);
    for (x, y) in [(i, j), (j, k), (i, k)] {
        if !adjacent(x, y) && mesh.find_entity(EDGE, &[ring[x], ring[y]]).is_some() {
            return None;
        }
    }
    let (ri, mut rj, mut rk) = (ring[i], ring[j], ring[k]);
    if mesh.find_entity(FACE, &[ri, rj, rk]).is_some() {
        return None;
    }
    if signed_measure(3, &[view.point(ri), view.point(rj), view.point(rk), view.point(a)]) < 0.0 {
        std::mem::swap(&mut rj, &mut rk);
    }
    let over_a = [ri, rj, rk, a].map(VertRef::Old);
    let over_b = [ri, rk, rj, b].map(VertRef::Old);
    let mut worst = f64::INFINITY;
    for tet in [&over_a, &over_b] {
        let (measure, q) = view.planned_shape(&[], tet);
        if measure <= 0.0 || q <= 0.0 {
            return None;
        }
        worst = worst.min(q);
    }
    Some((over_a, over_b, worst))
}

/// Ring triangles `(i, k, j)` of the triangulation maximizing the worst
/// quality, with that quality.
fn best_triangulation<C: Communicator>(view: &AdaptView<'_, C>, ends: (usize, usize), ring: &[usize]) -> Option<(Vec<(usize, usize, usize)>, f64)> {
    let n = ring.len();
    // best[i][j]: best worst quality of the sub-polygon i..=j, split at choice[i][j]
    let mut best = vec![vec![f64::NEG_INFINITY; n]; n];
    let mut choice = vec![vec![0usize; n]; n];
    for i in 0..n - 1 {
        best[i][i + 1] = f64::INFINITY;
    }
    for span in 2..n {
        for i in 0..n - span {
            let j = i + span;
            for k in i + 1..j {
                let Some((_, _, q)) = ring_pair(view, ends, ring, (i, k, j)) else {
                    continue;
                };
                let worst = q.min(best[i][k]).min(best[k][j]);
                if worst > best[i][j] {
                    best[i][j] = worst;
                    choice[i][j] = k;
                }
            }
        }
    }
    let quality = best[0][n - 1];
    if quality <= 0.0 {
        return None;
    }
    let mut tris = Vec::with_capacity(n - 2);
    let mut stack = vec![(0, n - 1)];
    while let Some((i, j)) = stack.pop() {
        if j < i + 2 {
            continue;
        }
        let k = choice[i][j];
        tris.push((i, k, j));
        stack.push((i, k));
        stack.push((k, j));
    }
    Some((tris, quality))
}

fn edge_swap<C: Communicator>(view: &AdaptView<'_, C>, edge: usize, cavity: &[usize]) -> Result<Vec<NewElement>, Rejection> {
    let mesh = view.mesh();
    if cavity.len() < 3 || cavity.len() > MAX_RING {
        return Err(Rejection::NotEligible);
    }
    let ev = mesh.verts_of(EDGE, edge);
    let ends = (ev[0], ev[1]);
    let ring = edge_ring(view, ends.0, ends.1, cavity).ok_or(Rejection::Topology)?;
    let (tris, _) = best_triangulation(view, ends, &ring).ok_or(Rejection::Inverted)?;
    let mut new_elems = Vec::with_capacity(2 * tris.len());
    for (t, &tri) in tris.iter().enumerate() {
        let (over_a, over_b, _) = ring_pair(view, ends, &ring, tri).ok_or(Rejection::Inverted)?;
        new_elems.push(NewElement { verts: over_a.to_vec(), parent: cavity[(2 * t) % cavity.len()] });
        new_elems.push(NewElement { verts: over_b.to_vec(), parent: cavity[(2 * t + 1) % cavity.len()] });
    }
    Ok(new_elems)
}
