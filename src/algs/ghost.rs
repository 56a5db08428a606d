//! Ghost layer maintenance and owner/copy synchronization.
//!
//! After every round the ghost layer is rebuilt from scratch:
//! 1. non-owned elements (and entities only they used) are dropped;
//! 2. a rendezvous directory, keyed by `(dim, gid)` and hashed to a home
//!    rank, tells every rank which ranks' owned elements use each of its
//!    lower entities; the minimum such rank owns the entity;
//! 3. for `Ghosted`, each owned element is sent to every rank sharing one of
//!    its vertices, so every rank holds the full star of every vertex of its
//!    owned elements. `VertexBased` only sends to the vertex owners.
//!
//! Copies are refreshed with a pull model: holders of non-owned entities ask
//! the owners for current values.

use crate::algs::communicator::Communicator;
use crate::algs::exchange::{allreduce_or, exchange, exchange_pod};
use crate::algs::migrate::EntityBatch;
use crate::algs::wire::{kind, pod_vec_from_bytes, WireDimGid, WireEntity, WireReader, WireWriter};
use crate::debug_invariants::DebugInvariants;
use crate::mesh_error::MeshAdaptError;
use crate::partitioning::PartitionPolicy;
use crate::topology::mesh::Mesh;
use crate::topology::point::GlobalId;
use crate::topology::simplex::VERT;
use bytemuck::Pod;
use hashbrown::HashMap;

/// Directory home of an entity.
fn home_rank(dim: usize, gid: GlobalId, size: usize) -> usize {
    let h = gid.get().wrapping_mul(0x9E37_79B9_7F4A_7C15) ^ (dim as u64).wrapping_mul(0xC2B2_AE3D_27D4_EB4F);
    ((h >> 17) % size as u64) as usize
}

/// For each local entity of every dimension below the element dimension,
/// the sorted ranks whose owned elements use it.
pub(crate) type Sharers = Vec<Vec<Vec<usize>>>;

impl<C: Communicator> Mesh<C> {
    /// Collective directory query. Every local lower entity must belong to
    /// the closure of an owned element when this is called.
    pub(crate) fn query_sharers(&self) -> Result<Sharers, MeshAdaptError> {
        let dim = self.dim();
        let me = self.rank();
        let size = self.nranks();
        let mut regs: Vec<Vec<WireDimGid>> = vec![Vec::new(); size];
        for d in 0..dim {
            for e in self.alive(d) {
                let gid = self.global(d, e);
                regs[home_rank(d, gid, size)].push(WireDimGid::new(d, gid, me));
            }
        }
        let at_home = exchange_pod(self.comm(), regs)?;

        let mut users: HashMap<(usize, GlobalId), Vec<usize>> = HashMap::new();
        for (src, recs) in at_home.iter().enumerate() {
            for r in recs {
                users.entry((r.dim(), r.gid())).or_default().push(src);
            }
        }
        let replies: Vec<Vec<WireDimGid>> = at_home
            .iter()
            .map(|recs| {
                recs.iter()
                    .flat_map(|r| {
                        let ranks = users.get(&(r.dim(), r.gid())).cloned().unwrap_or_default();
                        ranks
                            .into_iter()
                            .map(move |rank| WireDimGid::new(r.dim(), r.gid(), rank))
                    })
                    .collect()
            })
            .collect();
        let answers = exchange_pod(self.comm(), replies)?;

        let mut sharers: Sharers = (0..dim).map(|d| vec![Vec::new(); self.nslots(d)]).collect();
        for rec in answers.iter().flatten() {
            let slot = self.find_global(rec.dim(), rec.gid()).ok_or_else(|| {
                MeshAdaptError::FatalInvariant(format!(
                    "directory answered for unknown dimension {} entity {}",
                    rec.dim(),
                    rec.gid()
                ))
            })?;
            sharers[rec.dim()][slot].push(rec.rank());
        }
        for per_dim in &mut sharers {
            for ranks in per_dim {
                ranks.sort_unstable();
                ranks.dedup();
            }
        }
        Ok(sharers)
    }

    /// Collective: restore the ghost layer of the current partition policy.
    pub fn rebuild_ghosts(&mut self) -> Result<(), MeshAdaptError> {
        let dim = self.dim();
        let me = self.rank();
        let size = self.nranks();

        let foreign: Vec<usize> = self.alive(dim).filter(|&e| !self.is_owned(dim, e)).collect();
        self.remove_elements(&foreign);
        self.compact();

        let sharers = self.query_sharers()?;
        for (d, per_dim) in sharers.iter().enumerate() {
            for (slot, ranks) in per_dim.iter().enumerate() {
                if let Some(&owner) = ranks.first() {
                    self.set_owner(d, slot, owner)?;
                }
            }
        }

        let policy = self.partition_policy();
        if policy != PartitionPolicy::ElementBased && size > 1 {
            let mut batches = vec![EntityBatch::default(); size];
            let owners: Vec<Vec<usize>> = (0..=dim)
                .map(|d| self.ownership(d).owners().collect())
                .collect();
            let owner_of = |d: usize, e: usize| owners[d][e];
            for e in self.owned(dim).collect::<Vec<_>>() {
                let mut dests: Vec<usize> = Vec::new();
                for &v in self.verts_of(dim, e) {
                    match policy {
                        PartitionPolicy::VertexBased => dests.push(owners[VERT][v]),
                        _ => dests.extend_from_slice(&sharers[VERT][v]),
                    }
                }
                dests.sort_unstable();
                dests.dedup();
                for to in dests.into_iter().filter(|&r| r != me) {
                    batches[to].push_closure(self, e, &owner_of);
                }
            }
            let sends = batches
                .iter()
                .map(|b| {
                    let mut w = WireWriter::new(kind::GHOST);
                    b.write(&mut w);
                    w.finish()
                })
                .collect();
            let recvd = exchange(self.comm(), sends)?;
            for buf in &recvd {
                let mut r = WireReader::new(buf, kind::GHOST)?;
                let batch = EntityBatch::read(&mut r)?;
                self.unpack_batch(&batch)?;
            }
        }
        self.debug_assert_invariants();
        log::trace!(
            "rank {me}: ghost rebuild holds {} elements ({} owned)",
            self.nents(dim),
            self.owned(dim).count()
        );
        Ok(())
    }

    /// Collective: overwrite non-owned entries of a per-slot array with the
    /// owners' values.
    pub fn sync_array<T: Pod>(&self, dim: usize, values: &mut [T], ncomps: usize) -> Result<(), MeshAdaptError> {
        let bytes = bytemuck::cast_slice_mut::<T, u8>(values);
        self.sync_bytes(dim, bytes, ncomps * std::mem::size_of::<T>())
    }

    fn sync_bytes(&self, dim: usize, bytes: &mut [u8], width: usize) -> Result<(), MeshAdaptError> {
        let size = self.nranks();
        if size == 1 {
            return Ok(());
        }
        let me = self.rank();
        let mut requests: Vec<Vec<WireDimGid>> = vec![Vec::new(); size];
        let mut waiting: Vec<Vec<usize>> = vec![Vec::new(); size];
        for e in self.alive(dim) {
            let owner = self.owner(dim, e);
            if owner != me {
                requests[owner].push(WireDimGid::new(dim, self.global(dim, e), me));
                waiting[owner].push(e);
            }
        }
        let incoming = exchange_pod(self.comm(), requests)?;
        let mut replies = Vec::with_capacity(size);
        for (src, reqs) in incoming.iter().enumerate() {
            let mut w = WireWriter::new(kind::SYNC);
            let mut out = Vec::with_capacity(reqs.len() * width);
            for r in reqs {
                let slot = self.find_global(dim, r.gid()).ok_or_else(|| {
                    MeshAdaptError::FatalInvariant(format!(
                        "rank {src} expects rank {me} to own dimension {dim} entity {}",
                        r.gid()
                    ))
                })?;
                out.extend_from_slice(&bytes[slot * width..(slot + 1) * width]);
            }
            w.put(&out);
            replies.push(w.finish());
        }
        let answers = exchange(self.comm(), replies)?;
        for (owner, buf) in answers.iter().enumerate() {
            let mut r = WireReader::new(buf, kind::SYNC)?;
            let data = r.get::<u8>()?;
            if data.len() != waiting[owner].len() * width {
                return Err(MeshAdaptError::Comm {
                    neighbor: owner,
                    reason: format!("sync reply of {} bytes, expected {}", data.len(), waiting[owner].len() * width),
                });
            }
            for (k, &slot) in waiting[owner].iter().enumerate() {
                bytes[slot * width..(slot + 1) * width].copy_from_slice(&data[k * width..(k + 1) * width]);
            }
        }
        Ok(())
    }

    /// Collective: refresh the copies of one tag from the owners.
    pub fn sync_tag(&mut self, dim: usize, name: &str) -> Result<(), MeshAdaptError> {
        if self.nranks() == 1 {
            return Ok(());
        }
        let tag = self.tags(dim).get(name).ok_or_else(|| MeshAdaptError::MissingTag {
            dim,
            name: name.to_owned(),
        })?;
        let width = tag.entity_width();
        let mut data = tag.data().clone();
        self.sync_bytes(dim, data.as_bytes_mut(), width)?;
        let nslots = self.nslots(dim);
        self.tags_mut(dim).replace(dim, name, data, nslots)
    }

    /// Collective: refresh every tag of a dimension.
    pub fn sync_all_tags(&mut self, dim: usize) -> Result<(), MeshAdaptError> {
        for name in self.tag_names(dim) {
            self.sync_tag(dim, &name)?;
        }
        Ok(())
    }

    /// Collective: fold every copy's contribution into the owner's entry with
    /// `combine(owner_value, copy_value)` (in source-rank order), then
    /// broadcast the result back to the copies.
    pub fn reduce_to_owners<T: Pod>(
        &self,
        dim: usize,
        values: &mut [T],
        ncomps: usize,
        combine: impl Fn(&mut [T], &[T]),
    ) -> Result<(), MeshAdaptError> {
        let size = self.nranks();
        if size == 1 {
            return Ok(());
        }
        let me = self.rank();
        let mut keys: Vec<Vec<WireDimGid>> = vec![Vec::new(); size];
        let mut vals: Vec<Vec<T>> = vec![Vec::new(); size];
        for e in self.alive(dim) {
            let owner = self.owner(dim, e);
            if owner != me {
                keys[owner].push(WireDimGid::new(dim, self.global(dim, e), me));
                vals[owner].extend_from_slice(&values[e * ncomps..(e + 1) * ncomps]);
            }
        }
        let keys_in = exchange_pod(self.comm(), keys)?;
        let vals_in = exchange_pod(self.comm(), vals)?;
        for (src, (ks, vs)) in keys_in.iter().zip(&vals_in).enumerate() {
            if vs.len() != ks.len() * ncomps {
                return Err(MeshAdaptError::Comm {
                    neighbor: src,
                    reason: "reduction keys and values disagree".into(),
                });
            }
            for (k, key) in ks.iter().enumerate() {
                let slot = self.find_global(dim, key.gid()).ok_or_else(|| {
                    MeshAdaptError::FatalInvariant(format!(
                        "rank {src} reduces into unknown dimension {dim} entity {}",
                        key.gid()
                    ))
                })?;
                combine(
                    &mut values[slot * ncomps..(slot + 1) * ncomps],
                    &vs[k * ncomps..(k + 1) * ncomps],
                );
            }
        }
        self.sync_array(dim, values, ncomps)
    }

    /// Collective: check that every copy agrees with its owner.
    ///
    /// Compares vertex tuples (in global ids), owner ranks and vertex
    /// coordinates across ranks, and detects global id collisions.
    pub fn verify_consistency(&self) -> Result<(), MeshAdaptError> {
        let dim = self.dim();
        let size = self.nranks();
        let mut problem: Option<String> = None;
        for d in 0..=dim {
            let mut seen: HashMap<GlobalId, usize> = HashMap::new();
            for e in self.alive(d) {
                if let Some(prev) = seen.insert(self.global(d, e), e) {
                    problem.get_or_insert(format!(
                        "dimension {d} slots {prev} and {e} share global id {}",
                        self.global(d, e)
                    ));
                }
            }
        }

        let mut recs: Vec<Vec<WireEntity>> = vec![Vec::new(); size];
        let mut pts: Vec<Vec<[f64; 3]>> = vec![Vec::new(); size];
        for d in 0..=dim {
            for e in self.alive(d) {
                let gid = self.global(d, e);
                let home = home_rank(d, gid, size);
                let verts: Vec<GlobalId> = if d == VERT {
                    Vec::new()
                } else {
                    self.verts_of(d, e).iter().map(|&v| self.global(VERT, v)).collect()
                };
                recs[home].push(WireEntity::new(d, gid, self.owner(d, e), &verts));
                if d == VERT {
                    pts[home].push(self.coord(e));
                }
            }
        }
        let recs_in = exchange_pod(self.comm(), recs)?;
        let pts_in = exchange_pod(self.comm(), pts)?;
        let mut reports: HashMap<(usize, GlobalId), (usize, WireEntity, Option<[f64; 3]>)> = HashMap::new();
        let mut owner_seen: HashMap<(usize, GlobalId), bool> = HashMap::new();
        for (src, (rs, ps)) in recs_in.iter().zip(&pts_in).enumerate() {
            let mut vp = ps.iter();
            for r in rs {
                let key = (r.dim(), r.gid());
                let p = if r.dim() == VERT { vp.next().copied() } else { None };
                *owner_seen.entry(key).or_insert(false) |= r.owner() == src;
                match reports.get(&key) {
                    None => {
                        reports.insert(key, (src, *r, p));
                    }
                    Some((first, rec, q)) => {
                        if rec.verts() != r.verts() {
                            problem.get_or_insert(format!(
                                "dimension {} entity {}: ranks {first} and {src} disagree on vertices ({:?} vs {:?})",
                                r.dim(),
                                r.gid(),
                                rec.verts(),
                                r.verts()
                            ));
                        } else if rec.owner() != r.owner() {
                            problem.get_or_insert(format!(
                                "dimension {} entity {}: ranks {first} and {src} disagree on the owner",
                                r.dim(),
                                r.gid()
                            ));
                        } else if p != *q {
                            problem.get_or_insert(format!(
                                "vertex {}: ranks {first} and {src} disagree on coordinates",
                                r.gid()
                            ));
                        }
                    }
                }
            }
        }
        for ((d, gid), ok) in &owner_seen {
            if !ok {
                problem.get_or_insert(format!("dimension {d} entity {gid} is not held by its owner"));
            }
        }
        let failed = allreduce_or(self.comm(), problem.is_some())?;
        match problem {
            Some(msg) => Err(MeshAdaptError::FatalInvariant(msg)),
            None if failed => Err(MeshAdaptError::FatalInvariant(
                "ghost copies disagree with their owners on another rank".into(),
            )),
            None => Ok(()),
        }
    }
}

/// Decode a tag-width byte section into values (used by descriptor replay).
pub(crate) fn decode_values<T: Pod>(bytes: &[u8]) -> Result<Vec<T>, MeshAdaptError> {
    pod_vec_from_bytes(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn home_rank_is_in_range_and_spreads() {
        let mut hits = [0usize; 4];
        for g in 0..400u64 {
            let r = home_rank(0, GlobalId::new(g), 4);
            hits[r] += 1;
        }
        assert!(hits.iter().all(|&h| h > 50));
    }
}
