//! Entity batches: closure-ordered records plus tag payloads.
//!
//! Migration, ghosting and edit descriptors all ship entities the same way:
//! a list of [`WireEntity`] records in closure order (vertices, then edges,
//! faces and elements) and, per record, the packed bytes of every tag of its
//! dimension in name order. Receivers insert records they do not hold yet.

use crate::algs::communicator::Communicator;
use crate::algs::exchange::exchange;
use crate::algs::wire::{kind, WireEntity, WireReader, WireWriter};
use crate::data::tags::TagSchema;
use crate::mesh_error::MeshAdaptError;
use crate::topology::mesh::Mesh;
use crate::topology::point::GlobalId;
use crate::topology::simplex::VERT;
use bytemuck::{Pod, Zeroable};
use hashbrown::HashSet;

/// Entities in closure order with their tag payloads.
#[derive(Clone, Debug, Default)]
pub struct EntityBatch {
    pub records: Vec<WireEntity>,
    pub payload: Vec<u8>,
    seen: HashSet<(usize, GlobalId)>,
}

impl EntityBatch {
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Append one entity with an explicit owner; duplicates are ignored.
    pub fn push_entity<C: Communicator>(&mut self, mesh: &Mesh<C>, dim: usize, ent: usize, owner: usize) {
        let gid = mesh.global(dim, ent);
        if !self.seen.insert((dim, gid)) {
            return;
        }
        let verts: Vec<GlobalId> = if dim == VERT {
            Vec::new()
        } else {
            mesh.verts_of(dim, ent)
                .iter()
                .map(|&v| mesh.global(VERT, v))
                .collect()
        };
        self.records.push(WireEntity::new(dim, gid, owner, &verts));
        mesh.tags(dim).pack_entity(ent, &mut self.payload);
    }

    /// Append an element and its closure; `owner_of` names every owner.
    pub fn push_closure<C: Communicator>(
        &mut self,
        mesh: &Mesh<C>,
        elem: usize,
        owner_of: &dyn Fn(usize, usize) -> usize,
    ) {
        let dim = mesh.dim();
        for low in 0..=dim {
            for sub in mesh.sub_entities(dim, elem, low) {
                self.push_entity(mesh, low, sub, owner_of(low, sub));
            }
        }
    }

    pub fn write(&self, w: &mut WireWriter) {
        w.put(&self.records).put(&self.payload);
    }

    pub fn read(r: &mut WireReader<'_>) -> Result<Self, MeshAdaptError> {
        let records = r.get::<WireEntity>()?;
        let payload = r.get::<u8>()?;
        Ok(Self {
            records,
            payload,
            seen: HashSet::new(),
        })
    }
}

impl<C: Communicator> Mesh<C> {
    /// Insert every record not held yet and fill its tags from the payload.
    ///
    /// Returns the local slot of each record, in record order.
    pub(crate) fn unpack_batch(&mut self, batch: &EntityBatch) -> Result<Vec<usize>, MeshAdaptError> {
        let dim = self.dim();
        let widths: Vec<usize> = (0..=dim).map(|d| self.tags(d).entity_width()).collect();
        let mut at = 0;
        let mut slots = Vec::with_capacity(batch.records.len());
        for rec in &batch.records {
            let d = rec.dim();
            if d > dim {
                return Err(MeshAdaptError::Wire(format!("record of dimension {d} in a {dim}D mesh")));
            }
            let width = widths[d];
            let bytes = batch
                .payload
                .get(at..at + width)
                .ok_or_else(|| MeshAdaptError::Wire("entity payload truncated".into()))?;
            at += width;
            if let Some(existing) = self.find_global(d, rec.gid()) {
                slots.push(existing);
                continue;
            }
            let slot = if d == VERT {
                let zeros = vec![0.0; dim];
                self.add_vertex(&zeros, rec.gid(), rec.owner())?
            } else {
                let verts = rec
                    .verts()
                    .into_iter()
                    .map(|g| {
                        self.find_global(VERT, g).ok_or_else(|| {
                            MeshAdaptError::Wire(format!("record {} references unknown vertex {g}", rec.gid()))
                        })
                    })
                    .collect::<Result<Vec<_>, _>>()?;
                if d == dim {
                    self.add_element(&verts, rec.gid(), rec.owner())?
                } else {
                    self.add_lower(d, &verts, rec.gid(), rec.owner())?
                }
            };
            self.tags_mut(d).unpack_entity(slot, bytes)?;
            slots.push(slot);
        }
        if at != batch.payload.len() {
            return Err(MeshAdaptError::Wire(format!(
                "{} trailing payload bytes",
                batch.payload.len() - at
            )));
        }
        Ok(slots)
    }

    /// Collective: make every rank carry the union of all tag schemas.
    pub(crate) fn unify_tag_schema(&mut self) -> Result<(), MeshAdaptError> {
        let dim = self.dim();
        let mut w = WireWriter::new(kind::SCHEMA);
        let mut heads = Vec::new();
        let mut names = Vec::new();
        for d in 0..=dim {
            for entry in self.tags(d).schema() {
                heads.push(WireTagSchema {
                    dim_le: (d as u32).to_le(),
                    type_le: (entry.type_code as u32).to_le(),
                    ncomps_le: (entry.ncomps as u32).to_le(),
                    name_len_le: (entry.name.len() as u32).to_le(),
                });
                names.extend_from_slice(entry.name.as_bytes());
            }
        }
        w.put(&heads).put(&names);
        let msg = w.finish();
        let recvd = exchange(self.comm(), vec![msg; self.nranks()])?;
        for buf in &recvd {
            let mut r = WireReader::new(buf, kind::SCHEMA)?;
            let heads = r.get::<WireTagSchema>()?;
            let names = r.get::<u8>()?;
            let mut at = 0;
            let mut per_dim: Vec<Vec<TagSchema>> = vec![Vec::new(); dim + 1];
            for h in heads {
                let len = u32::from_le(h.name_len_le) as usize;
                let raw = names
                    .get(at..at + len)
                    .ok_or_else(|| MeshAdaptError::Wire("schema names truncated".into()))?;
                at += len;
                let name = String::from_utf8(raw.to_vec())
                    .map_err(|e| MeshAdaptError::Wire(format!("tag name is not UTF-8: {e}")))?;
                let d = u32::from_le(h.dim_le) as usize;
                if d > dim {
                    return Err(MeshAdaptError::Wire(format!("schema for dimension {d}")));
                }
                per_dim[d].push(TagSchema {
                    name,
                    type_code: u32::from_le(h.type_le) as u8,
                    ncomps: u32::from_le(h.ncomps_le) as usize,
                });
            }
            for (d, schema) in per_dim.iter().enumerate() {
                let nslots = self.nslots(d);
                self.tags_mut(d).adopt_schema(d, schema, nslots)?;
            }
        }
        Ok(())
    }

    /// Collective: send every owned element to `dest[elem]`.
    ///
    /// Afterwards each rank holds exactly the elements sent to it (with
    /// their closure and tags); owners of lower entities are provisional
    /// until the ghost rebuild that follows.
    pub fn migrate_elements(&mut self, dest: &[usize]) -> Result<(), MeshAdaptError> {
        let dim = self.dim();
        let nranks = self.nranks();
        self.unify_tag_schema()?;
        let mut batches: Vec<EntityBatch> = vec![EntityBatch::default(); nranks];
        for e in self.owned(dim).collect::<Vec<_>>() {
            let to = dest[e];
            if to >= nranks {
                return Err(MeshAdaptError::InvalidMesh(format!(
                    "element {} sent to rank {to} of {nranks}",
                    self.global(dim, e)
                )));
            }
            batches[to].push_closure(self, e, &|_, _| to);
        }
        let sends = batches
            .iter()
            .map(|b| {
                let mut w = WireWriter::new(kind::MIGRATE);
                b.write(&mut w);
                w.finish()
            })
            .collect();
        let recvd = exchange(self.comm(), sends)?;
        self.clear();
        for buf in &recvd {
            let mut r = WireReader::new(buf, kind::MIGRATE)?;
            let batch = EntityBatch::read(&mut r)?;
            self.unpack_batch(&batch)?;
        }
        log::debug!(
            "rank {}: migration left {} elements",
            self.rank(),
            self.nents(dim)
        );
        Ok(())
    }
}

#[repr(C)]
#[derive(Copy, Clone, Pod, Zeroable)]
struct WireTagSchema {
    dim_le: u32,
    type_le: u32,
    ncomps_le: u32,
    name_len_le: u32,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algs::communicator::NoComm;
    use crate::algs::meshgen::build_box;

    /// An empty mesh carrying the tag schema of `src`.
    fn receiver_for(src: &Mesh) -> Mesh {
        let mut dst = Mesh::serial(src.dim()).unwrap();
        for d in 0..=src.dim() {
            dst.tags_mut(d).adopt_schema(d, &src.tags(d).schema(), 0).unwrap();
        }
        dst
    }

    #[test]
    fn batch_rebuilds_an_element_with_tags() {
        let mut src = build_box(NoComm, 2, [1.0, 1.0, 0.0], [1, 1, 0]).unwrap();
        src.add_tag::<f64>(0, "u", 1, (0..src.nslots(0)).map(|v| v as f64).collect())
            .unwrap();
        let mut batch = EntityBatch::default();
        batch.push_closure(&src, 0, &|_, _| 0);

        let mut dst = receiver_for(&src);
        let slots = dst.unpack_batch(&batch).unwrap();
        assert_eq!(dst.nents(2), 1);
        assert_eq!(dst.nents(1), 3);
        assert_eq!(slots.len(), 7);
        let u = dst.get_tag::<f64>(0, "u").unwrap();
        for v in dst.alive(0) {
            let g = dst.global(0, v);
            let s = src.find_global(0, g).unwrap();
            assert_eq!(u[v], s as f64);
            assert_eq!(dst.coord(v), src.coord(s));
        }
    }

    #[test]
    fn duplicate_records_are_skipped() {
        let src = build_box(NoComm, 2, [1.0, 1.0, 0.0], [1, 1, 0]).unwrap();
        let mut batch = EntityBatch::default();
        batch.push_closure(&src, 0, &|_, _| 0);
        batch.push_closure(&src, 1, &|_, _| 0);
        assert_eq!(batch.records.len(), 4 + 5 + 2);
        let mut dst = receiver_for(&src);
        dst.unpack_batch(&batch).unwrap();
        dst.unpack_batch(&batch).unwrap();
        assert_eq!(dst.nents(2), 2);
    }

    #[test]
    fn batches_need_a_matching_schema() {
        let src = build_box(NoComm, 2, [1.0, 1.0, 0.0], [1, 1, 0]).unwrap();
        let mut batch = EntityBatch::default();
        batch.push_closure(&src, 0, &|_, _| 0);
        let mut bare = Mesh::serial(2).unwrap();
        let err = bare.unpack_batch(&batch).unwrap_err();
        assert!(matches!(err, MeshAdaptError::Wire(_)), "{err}");
    }
}
