//! Two-phase commit of one round of accepted edits.
//!
//! Each key owner applies its plans locally with provisional ids, the ranks
//! agree on final ids, and every edit is then described to the owners of the
//! elements around its cavity: the removed element ids, the new elements
//! with their closure (as an [`EntityBatch`]) and the new rows of updated
//! surviving vertices. Receivers insert every batch first, then remove, then
//! apply updates. A ghost rebuild restores the ghost layer afterwards.

use crate::algs::communicator::Communicator;
use crate::algs::exchange::exchange;
use crate::algs::migrate::EntityBatch;
use crate::algs::wire::{kind, WireReader, WireWriter};
use crate::data::tags::TagSet;
use crate::mesh_error::MeshAdaptError;
use crate::topology::cavity::{EditPlan, VertRef};
use crate::topology::mesh::Mesh;
use crate::topology::point::GlobalId;
use crate::topology::simplex::VERT;
use crate::transfer::PlanFields;

/// Outcome of applying one plan on its key owner.
struct Applied {
    removed: Vec<GlobalId>,
    new_elems: Vec<usize>,
    updated: Vec<usize>,
    dests: Vec<usize>,
}

/// Copy row `row` of `src` into slot `slot` of the matching tags of `dst`.
fn store_row(dst: &mut TagSet, slot: usize, src: &TagSet, row: usize) {
    for (name, tag) in dst.iter_mut() {
        if let Some(s) = src.get(name) {
            let n = tag.ncomps();
            if s.ncomps() == n && s.data().type_code() == tag.data().type_code() {
                tag.data_mut().copy_entity_from(slot, s.data(), row, n);
            }
        }
    }
}

fn apply_plan<C: Communicator>(mesh: &mut Mesh<C>, plan: &EditPlan, fields: &PlanFields) -> Result<Applied, MeshAdaptError> {
    let dim = mesh.dim();
    let me = mesh.rank();
    let mut dests: Vec<usize> = plan
        .cavity_verts(mesh)
        .iter()
        .flat_map(|&x| mesh.star(x).iter().map(|&e| mesh.owner(dim, e)))
        .filter(|&r| r != me)
        .collect();
    dests.sort_unstable();
    dests.dedup();
    let removed: Vec<GlobalId> = plan.cavity.iter().map(|&e| mesh.global(dim, e)).collect();

    let mut vslots = Vec::with_capacity(plan.new_verts.len());
    for (k, nv) in plan.new_verts.iter().enumerate() {
        let gid = mesh.take_provisional(VERT);
        let slot = mesh.add_vertex(&nv.pos[..dim], gid, me)?;
        store_row(mesh.tags_mut(VERT), slot, &fields.verts, k);
        vslots.push(slot);
    }
    let resolve = |refs: &[VertRef]| -> Vec<usize> {
        refs.iter()
            .map(|r| match *r {
                VertRef::Old(v) => v,
                VertRef::New(k) => vslots[k],
            })
            .collect()
    };

    let mut new_elems = Vec::with_capacity(plan.new_elems.len());
    for (k, el) in plan.new_elems.iter().enumerate() {
        let gid = mesh.take_provisional(dim);
        let slot = mesh.add_element(&resolve(&el.verts), gid, me)?;
        store_row(mesh.tags_mut(dim), slot, &fields.elems, k);
        new_elems.push(slot);
    }
    for low in 1..dim {
        for (j, refs) in fields.new_subs[low].iter().enumerate() {
            if let Some(s) = mesh.find_entity(low, &resolve(refs)) {
                store_row(mesh.tags_mut(low), s, &fields.lowers[low], j);
            }
        }
    }
    mesh.remove_elements(&plan.cavity);
    let mut updated = Vec::with_capacity(fields.updates.len());
    for (v, row) in &fields.updates {
        store_row(mesh.tags_mut(VERT), *v, row, 0);
        updated.push(*v);
    }
    Ok(Applied {
        removed,
        new_elems,
        updated,
        dests,
    })
}

/// Per-destination edit descriptor.
#[derive(Default)]
struct Descriptor {
    removed: Vec<GlobalId>,
    batch: EntityBatch,
    updated: Vec<GlobalId>,
    rows: Vec<u8>,
}

/// Collective: commit the plans this rank won, with their transferred rows.
///
/// Returns the number of edits applied on this rank.
pub fn commit_round<C: Communicator>(
    mesh: &mut Mesh<C>,
    edits: &[(EditPlan, PlanFields)],
    verify: bool,
) -> Result<usize, MeshAdaptError> {
    let dim = mesh.dim();
    let size = mesh.nranks();
    let mut applied = Vec::with_capacity(edits.len());
    for (plan, fields) in edits {
        applied.push(apply_plan(mesh, plan, fields)?);
    }
    mesh.commit_globals()?;

    if size > 1 {
        let mut descs: Vec<Descriptor> = (0..size).map(|_| Descriptor::default()).collect();
        let owner_of = |d: usize, e: usize| mesh.owner(d, e);
        for a in &applied {
            for &to in &a.dests {
                let desc = &mut descs[to];
                desc.removed.extend_from_slice(&a.removed);
                for &e in &a.new_elems {
                    desc.batch.push_closure(mesh, e, &owner_of);
                }
                for &v in &a.updated {
                    desc.updated.push(mesh.global(VERT, v));
                    mesh.tags(VERT).pack_entity(v, &mut desc.rows);
                }
            }
        }
        let sends = descs
            .iter()
            .map(|d| {
                let mut w = WireWriter::new(kind::EDIT);
                w.put(&d.removed);
                d.batch.write(&mut w);
                w.put(&d.updated).put(&d.rows);
                w.finish()
            })
            .collect();
        let recvd = exchange(mesh.comm(), sends)?;
        receive_edits(mesh, &recvd)?;
    }

    mesh.rebuild_ghosts()?;
    for d in 0..=dim {
        mesh.sync_all_tags(d)?;
    }
    if verify {
        mesh.verify_consistency()?;
    }
    Ok(edits.len())
}

fn receive_edits<C: Communicator>(mesh: &mut Mesh<C>, recvd: &[Vec<u8>]) -> Result<(), MeshAdaptError> {
    let dim = mesh.dim();
    let mut removed = Vec::new();
    let mut updates = Vec::new();
    for buf in recvd {
        let mut r = WireReader::new(buf, kind::EDIT)?;
        let gone = r.get::<GlobalId>()?;
        let batch = EntityBatch::read(&mut r)?;
        let updated = r.get::<GlobalId>()?;
        let rows = r.get::<u8>()?;
        mesh.unpack_batch(&batch)?;
        removed.extend(gone);
        updates.push((updated, rows));
    }
    let elems: Vec<usize> = removed.iter().filter_map(|&g| mesh.find_global(dim, g)).collect();
    mesh.remove_elements(&elems);
    let width = mesh.tags(VERT).entity_width();
    for (gids, rows) in updates {
        if rows.len() != gids.len() * width {
            return Err(MeshAdaptError::Wire(format!(
                "{} update bytes for {} vertices of width {width}",
                rows.len(),
                gids.len()
            )));
        }
        for (k, gid) in gids.iter().enumerate() {
            if let Some(v) = mesh.find_global(VERT, *gid) {
                mesh.tags_mut(VERT).unpack_entity(v, &rows[k * width..(k + 1) * width])?;
            }
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
    use crate::geometry::tensor;
    use crate::topology::cavity::AdaptView;
    use crate::topology::mesh::METRIC;
    use crate::topology::refine::plan_split;
    use crate::topology::simplex::EDGE;
    use crate::transfer::{transfer_plan, TransferOpts};

    #[test]
    fn split_commit_updates_counts_and_ids() {
        let mut mesh = build_box(NoComm, 2, [1.0, 1.0, 0.0], [1, 1, 0]).unwrap();
        let m = tensor::to_packed(2, &tensor::isotropic(2, 0.5));
        let values: Vec<f64> = (0..mesh.nslots(0)).flat_map(|_| m.clone()).collect();
        mesh.add_tag(0, METRIC, 3, values).unwrap();
        let edits = {
            let view = AdaptView::new(&mesh, METRIC).unwrap();
            let diag = mesh.find_entity(EDGE, &[0, 3]).unwrap();
            let plan = plan_split(&view, diag, &AdaptOpts::default()).unwrap();
            let fields = transfer_plan(&mesh, &plan, &TransferOpts::default(), METRIC).unwrap();
            vec![(plan, fields)]
        };
        let next_vert = mesh.next_gid(VERT);
        assert_eq!(commit_round(&mut mesh, &edits, true).unwrap(), 1);
        assert_eq!(mesh.nents(VERT), 5);
        assert_eq!(mesh.nents(EDGE), 8);
        assert_eq!(mesh.nelems(), 4);
        let center = mesh.find_global(VERT, GlobalId::new(next_vert)).unwrap();
        assert_eq!(mesh.coord(center), [0.5, 0.5, 0.0]);
        assert_eq!(mesh.next_gid(VERT), next_vert + 1);
        for d in 0..=2 {
            assert!(mesh.alive(d).all(|e| mesh.global(d, e).provisional_index().is_none()));
        }
        // new interior edges are interior
        let (cd, _) = mesh.class_of(VERT, center);
        assert_eq!(cd, 2);
    }
}
