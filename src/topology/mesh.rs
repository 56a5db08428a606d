//! Distributed simplex mesh: per-dimension entity arenas plus tags.
//!
//! Every dimension `0..=dim` has an [`EntitySet`] arena of slots. A slot
//! stores the entity's vertex tuple, its [`GlobalId`], its ownership entry and
//! an alive flag; tag arrays of the dimension are sized to the slot count.
//! Slots are only ever appended during a round. Dead slots are squeezed out
//! by [`Mesh::compact`], which the ghost rebuild runs after every round.
//!
//! Vertex tuples:
//! - elements keep their orientation order (positive measure);
//! - edges and faces below the element dimension are sorted by global id,
//!   so every rank derives identical downward adjacency for them.
//!
//! Downward adjacency is derived from [`simplex::template`] and a key map
//! over sorted local vertex tuples. Upward adjacency is the vertex star
//! (alive elements using a vertex), maintained incrementally.

use crate::algs::communicator::{Communicator, NoComm};
use crate::data::tags::{TagData, TagSet, TagValue};
use crate::debug_invariants::{ensure, DebugInvariants};
use crate::mesh_error::MeshAdaptError;
use crate::partitioning::PartitionPolicy;
use crate::topology::ownership::EntityOwnership;
use crate::topology::point::GlobalId;
use crate::topology::simplex::{self, VERT};
use hashbrown::HashMap;

/// Vertex coordinates, `dim` components per vertex.
pub const COORDINATES: &str = "coordinates";
/// Dimension of the geometric model entity an entity is classified on.
pub const CLASS_DIM: &str = "class_dim";
/// Identifier of the geometric model entity an entity is classified on.
pub const CLASS_ID: &str = "class_id";
/// Default name of the vertex metric tag.
pub const METRIC: &str = "metric";

/// Sorted local vertex tuple, padded with `usize::MAX`.
pub(crate) type EntityKey = [usize; 4];

pub(crate) fn entity_key(verts: &[usize]) -> EntityKey {
    let mut key = [usize::MAX; 4];
    key[..verts.len()].copy_from_slice(verts);
    key[..verts.len()].sort_unstable();
    key
}

/// Arena of the entities of one dimension.
#[derive(Clone, Debug, Default)]
pub struct EntitySet {
    verts: Vec<usize>,
    globals: Vec<GlobalId>,
    ownership: EntityOwnership,
    alive: Vec<bool>,
    nalive: usize,
    tags: TagSet,
}

impl EntitySet {
    fn nslots(&self) -> usize {
        self.alive.len()
    }
}

/// A distributed simplex mesh bound to a communicator.
#[derive(Clone)]
pub struct Mesh<C: Communicator = NoComm> {
    comm: C,
    dim: usize,
    policy: PartitionPolicy,
    ents: Vec<EntitySet>,
    stars: Vec<Vec<usize>>,
    keys: Vec<HashMap<EntityKey, usize>>,
    by_gid: Vec<HashMap<GlobalId, usize>>,
    next_gid: [u64; 4],
    nprovisional: [u64; 4],
}

impl Mesh<NoComm> {
    /// An empty serial mesh.
    pub fn serial(dim: usize) -> Result<Self, MeshAdaptError> {
        Mesh::new(NoComm, dim)
    }
}

impl<C: Communicator> Mesh<C> {
    /// An empty mesh of topological dimension 2 or 3.
    pub fn new(comm: C, dim: usize) -> Result<Self, MeshAdaptError> {
        if !(2..=3).contains(&dim) {
            return Err(MeshAdaptError::InvalidMesh(format!(
                "unsupported mesh dimension {dim}; expected 2 or 3"
            )));
        }
        let mut ents = vec![EntitySet::default(); dim + 1];
        ents[VERT].tags.insert(VERT, COORDINATES, dim, TagData::F64(Vec::new()), 0)?;
        Ok(Mesh {
            comm,
            dim,
            policy: PartitionPolicy::Ghosted,
            ents,
            stars: Vec::new(),
            keys: vec![HashMap::new(); dim + 1],
            by_gid: vec![HashMap::new(); dim + 1],
            next_gid: [0; 4],
            nprovisional: [0; 4],
        })
    }

    #[inline]
    pub fn dim(&self) -> usize {
        self.dim
    }

    #[inline]
    pub fn comm(&self) -> &C {
        &self.comm
    }

    #[inline]
    pub fn rank(&self) -> usize {
        self.comm.rank()
    }

    #[inline]
    pub fn nranks(&self) -> usize {
        self.comm.size()
    }

    pub fn partition_policy(&self) -> PartitionPolicy {
        self.policy
    }

    pub(crate) fn set_policy_flag(&mut self, policy: PartitionPolicy) {
        self.policy = policy;
    }

    #[inline]
    #[track_caller]
    fn check_dim(&self, dim: usize) {
        assert!(
            dim <= self.dim,
            "dimension {dim} exceeds mesh dimension {}",
            self.dim
        );
    }

    /// Rebind the mesh to another process group.
    ///
    /// Entities held locally become owned by the new rank; global id bases
    /// are agreed on and the ghost layer is rebuilt for the current policy.
    pub fn set_comm<D: Communicator>(self, comm: D) -> Result<Mesh<D>, MeshAdaptError> {
        let rank = comm.rank();
        let mut ents = self.ents;
        for set in &mut ents {
            let mut ownership = EntityOwnership::default();
            for _ in 0..set.nslots() {
                ownership.push(rank, rank);
            }
            set.ownership = ownership;
        }
        let mut mesh = Mesh {
            comm,
            dim: self.dim,
            policy: self.policy,
            ents,
            stars: self.stars,
            keys: self.keys,
            by_gid: self.by_gid,
            next_gid: self.next_gid,
            nprovisional: [0; 4],
        };
        mesh.sync_next_gid()?;
        mesh.rebuild_ghosts()?;
        Ok(mesh)
    }

    // ----- counts and slots ---------------------------------------------

    /// Number of alive entities of dimension `dim`.
    pub fn nents(&self, dim: usize) -> usize {
        self.check_dim(dim);
        self.ents[dim].nalive
    }

    /// Number of slots (alive or dead) of dimension `dim`.
    pub fn nslots(&self, dim: usize) -> usize {
        self.check_dim(dim);
        self.ents[dim].nslots()
    }

    pub fn nelems(&self) -> usize {
        self.nents(self.dim)
    }

    pub fn nverts(&self) -> usize {
        self.nents(VERT)
    }

    pub fn is_alive(&self, dim: usize, ent: usize) -> bool {
        self.check_dim(dim);
        self.ents[dim].alive.get(ent).copied().unwrap_or(false)
    }

    /// Alive slots of dimension `dim`, ascending.
    pub fn alive(&self, dim: usize) -> impl Iterator<Item = usize> + '_ {
        self.check_dim(dim);
        self.ents[dim]
            .alive
            .iter()
            .enumerate()
            .filter_map(|(i, &a)| a.then_some(i))
    }

    /// Alive slots owned by this rank.
    pub fn owned(&self, dim: usize) -> impl Iterator<Item = usize> + '_ {
        self.alive(dim)
            .filter(move |&i| self.ents[dim].ownership.is_owned(i))
    }

    // ----- identity and ownership --------------------------------------

    pub fn global(&self, dim: usize, ent: usize) -> GlobalId {
        self.check_dim(dim);
        self.ents[dim].globals[ent]
    }

    pub fn globals(&self, dim: usize) -> &[GlobalId] {
        self.check_dim(dim);
        &self.ents[dim].globals
    }

    pub fn find_global(&self, dim: usize, gid: GlobalId) -> Option<usize> {
        self.check_dim(dim);
        self.by_gid[dim].get(&gid).copied()
    }

    pub(crate) fn set_global(&mut self, dim: usize, ent: usize, gid: GlobalId) {
        let old = self.ents[dim].globals[ent];
        if self.by_gid[dim].get(&old) == Some(&ent) {
            self.by_gid[dim].remove(&old);
        }
        self.ents[dim].globals[ent] = gid;
        if self.ents[dim].alive[ent] {
            self.by_gid[dim].insert(gid, ent);
        }
    }

    pub fn owner(&self, dim: usize, ent: usize) -> usize {
        self.check_dim(dim);
        self.ents[dim].ownership.owner(ent).unwrap_or(usize::MAX)
    }

    pub fn is_owned(&self, dim: usize, ent: usize) -> bool {
        self.check_dim(dim);
        self.ents[dim].ownership.is_owned(ent)
    }

    pub fn ownership(&self, dim: usize) -> &EntityOwnership {
        self.check_dim(dim);
        &self.ents[dim].ownership
    }

    pub(crate) fn set_owner(&mut self, dim: usize, ent: usize, owner: usize) -> Result<(), MeshAdaptError> {
        let rank = self.rank();
        self.ents[dim].ownership.set(ent, owner, rank)
    }

    /// Mesh-wide next committed global id of dimension `dim`.
    pub fn next_gid(&self, dim: usize) -> u64 {
        self.check_dim(dim);
        self.next_gid[dim]
    }

    pub(crate) fn set_next_gid(&mut self, dim: usize, next: u64) {
        self.next_gid[dim] = next;
    }

    /// Local count of provisional ids handed out since the last commit.
    pub(crate) fn provisional_count(&self, dim: usize) -> u64 {
        self.nprovisional[dim]
    }

    pub(crate) fn take_provisional(&mut self, dim: usize) -> GlobalId {
        let gid = GlobalId::provisional(self.nprovisional[dim]);
        self.nprovisional[dim] += 1;
        gid
    }

    pub(crate) fn reset_provisional(&mut self) {
        self.nprovisional = [0; 4];
    }

    // ----- adjacency ----------------------------------------------------

    /// Vertex tuple of an entity (`[ent]` for vertices).
    #[track_caller]
    pub fn verts_of(&self, dim: usize, ent: usize) -> &[usize] {
        self.check_dim(dim);
        let n = simplex::nverts(dim);
        &self.ents[dim].verts[ent * n..(ent + 1) * n]
    }

    /// Flat vertex tuples of a dimension, `dim + 1` per slot.
    pub fn ents2verts(&self, dim: usize) -> &[usize] {
        self.check_dim(dim);
        &self.ents[dim].verts
    }

    /// Entity of dimension `dim` with exactly these vertices.
    pub fn find_entity(&self, dim: usize, verts: &[usize]) -> Option<usize> {
        self.check_dim(dim);
        if dim == VERT {
            return verts.first().copied().filter(|&v| self.is_alive(VERT, v));
        }
        self.keys[dim].get(&entity_key(verts)).copied()
    }

    /// Sub-entities of dimension `low` of an entity, in template order.
    ///
    /// # Panics
    /// Panics if a sub-entity is missing, which breaks the closure invariant.
    #[track_caller]
    pub fn sub_entities(&self, dim: usize, ent: usize, low: usize) -> Vec<usize> {
        let verts = self.verts_of(dim, ent);
        if low == dim {
            return vec![ent];
        }
        if low == VERT {
            return verts.to_vec();
        }
        simplex::template(dim, low)
            .iter()
            .map(|local| {
                let sub: Vec<usize> = local.iter().map(|&k| verts[k]).collect();
                self.find_entity(low, &sub).unwrap_or_else(|| {
                    panic!("dimension {dim} entity {ent} lacks sub-entity {sub:?} of dimension {low}")
                })
            })
            .collect()
    }

    /// Downward adjacency into the next-lower dimension.
    pub fn down(&self, dim: usize, ent: usize) -> Vec<usize> {
        assert!(dim > VERT, "vertices have no downward adjacency");
        self.sub_entities(dim, ent, dim - 1)
    }

    /// Alive elements using vertex `v`.
    pub fn star(&self, v: usize) -> &[usize] {
        &self.stars[v]
    }

    /// Alive elements containing an entity.
    pub fn elems_of(&self, dim: usize, ent: usize) -> Vec<usize> {
        let verts = self.verts_of(dim, ent);
        if dim == self.dim {
            return vec![ent];
        }
        self.stars[verts[0]]
            .iter()
            .copied()
            .filter(|&e| {
                let ev = self.verts_of(self.dim, e);
                verts.iter().all(|v| ev.contains(v))
            })
            .collect()
    }

    /// Vertices sharing an edge with `v`, sorted.
    pub fn vert_neighbors(&self, v: usize) -> Vec<usize> {
        let mut out: Vec<usize> = self.stars[v]
            .iter()
            .flat_map(|&e| self.verts_of(self.dim, e).iter().copied())
            .filter(|&u| u != v)
            .collect();
        out.sort_unstable();
        out.dedup();
        out
    }

    /// Entities of dimension `dim` incident to vertex `v`, sorted.
    pub fn ents_of_vert(&self, dim: usize, v: usize) -> Vec<usize> {
        let mut out: Vec<usize> = self.stars[v]
            .iter()
            .flat_map(|&e| self.sub_entities(self.dim, e, dim))
            .filter(|&s| self.verts_of(dim, s).contains(&v))
            .collect();
        out.sort_unstable();
        out.dedup();
        out
    }

    /// Vertex coordinates, padded to three components.
    pub fn coord(&self, v: usize) -> [f64; 3] {
        let dim = self.dim;
        let mut p = [0.0; 3];
        if let Ok(coords) = self.get_tag::<f64>(VERT, COORDINATES) {
            p[..dim].copy_from_slice(&coords[v * dim..(v + 1) * dim]);
        }
        p
    }

    pub fn coords(&self) -> Result<&[f64], MeshAdaptError> {
        self.get_tag::<f64>(VERT, COORDINATES)
    }

    /// Element vertex coordinates, in element order.
    pub fn elem_points(&self, elem: usize) -> Vec<[f64; 3]> {
        self.verts_of(self.dim, elem)
            .iter()
            .map(|&v| self.coord(v))
            .collect()
    }

    // ----- construction -------------------------------------------------

    fn push_slot(&mut self, dim: usize, verts: &[usize], gid: GlobalId, owner: usize) -> usize {
        let rank = self.rank();
        let set = &mut self.ents[dim];
        let slot = set.nslots();
        set.verts.extend_from_slice(verts);
        set.globals.push(gid);
        set.ownership.push(owner, rank);
        set.alive.push(true);
        set.nalive += 1;
        set.tags.resize_all(slot + 1);
        self.by_gid[dim].insert(gid, slot);
        if dim > VERT {
            self.keys[dim].insert(entity_key(verts), slot);
        }
        slot
    }

    /// Append a vertex with its coordinates.
    pub fn add_vertex(&mut self, coords: &[f64], gid: GlobalId, owner: usize) -> Result<usize, MeshAdaptError> {
        if coords.len() != self.dim {
            return Err(MeshAdaptError::InvalidMesh(format!(
                "vertex has {} coordinates, mesh dimension is {}",
                coords.len(),
                self.dim
            )));
        }
        if let Some(existing) = self.find_global(VERT, gid) {
            return Ok(existing);
        }
        let next = self.ents[VERT].nslots();
        let slot = self.push_slot(VERT, &[next], gid, owner);
        self.stars.push(Vec::new());
        let dim = self.dim;
        if let Some(tag) = self.ents[VERT].tags.get_mut(COORDINATES) {
            if let Some(values) = f64::view_mut(tag.data_mut()) {
                values[slot * dim..(slot + 1) * dim].copy_from_slice(coords);
            }
        }
        Ok(slot)
    }

    /// Append an edge or face with an explicit identity.
    ///
    /// The vertex tuple is stored sorted by global id. Returns the existing
    /// slot if an entity with the same vertices is already present.
    pub fn add_lower(&mut self, dim: usize, verts: &[usize], gid: GlobalId, owner: usize) -> Result<usize, MeshAdaptError> {
        self.check_dim(dim);
        if dim == VERT || dim == self.dim || verts.len() != simplex::nverts(dim) {
            return Err(MeshAdaptError::InvalidMesh(format!(
                "cannot add a dimension {dim} entity with {} vertices",
                verts.len()
            )));
        }
        if let Some(existing) = self.find_entity(dim, verts) {
            return Ok(existing);
        }
        self.check_verts_alive(verts)?;
        let mut sorted = verts.to_vec();
        sorted.sort_by_key(|&v| self.ents[VERT].globals[v]);
        Ok(self.push_slot(dim, &sorted, gid, owner))
    }

    /// Append an element; missing sub-entities get provisional ids.
    pub fn add_element(&mut self, verts: &[usize], gid: GlobalId, owner: usize) -> Result<usize, MeshAdaptError> {
        let dim = self.dim;
        if verts.len() != simplex::nverts(dim) {
            return Err(MeshAdaptError::InvalidMesh(format!(
                "element needs {} vertices, got {}",
                simplex::nverts(dim),
                verts.len()
            )));
        }
        self.check_verts_alive(verts)?;
        if self.find_entity(dim, verts).is_some() {
            return Err(MeshAdaptError::InvalidMesh(format!(
                "duplicate element over vertices {verts:?}"
            )));
        }
        for low in 1..dim {
            for local in simplex::template(dim, low) {
                let sub: Vec<usize> = local.iter().map(|&k| verts[k]).collect();
                if self.find_entity(low, &sub).is_none() {
                    let sub_gid = self.take_provisional(low);
                    self.add_lower(low, &sub, sub_gid, owner)?;
                }
            }
        }
        let slot = self.push_slot(dim, verts, gid, owner);
        for &v in verts {
            self.stars[v].push(slot);
        }
        Ok(slot)
    }

    fn check_verts_alive(&self, verts: &[usize]) -> Result<(), MeshAdaptError> {
        for &v in verts {
            if !self.is_alive(VERT, v) {
                return Err(MeshAdaptError::InvalidMesh(format!("vertex slot {v} is not alive")));
            }
        }
        Ok(())
    }

    fn kill(&mut self, dim: usize, ent: usize) {
        let set = &mut self.ents[dim];
        if !set.alive[ent] {
            return;
        }
        set.alive[ent] = false;
        set.nalive -= 1;
        let gid = set.globals[ent];
        if self.by_gid[dim].get(&gid) == Some(&ent) {
            self.by_gid[dim].remove(&gid);
        }
        if dim > VERT {
            let n = simplex::nverts(dim);
            let key = entity_key(&self.ents[dim].verts[ent * n..(ent + 1) * n]);
            if self.keys[dim].get(&key) == Some(&ent) {
                self.keys[dim].remove(&key);
            }
        }
    }

    /// Remove elements and every lower entity left without an element.
    pub fn remove_elements(&mut self, elems: &[usize]) {
        let dim = self.dim;
        let mut orphans: Vec<Vec<usize>> = vec![Vec::new(); dim];
        for &e in elems {
            if !self.is_alive(dim, e) {
                continue;
            }
            for low in 0..dim {
                orphans[low].extend(self.sub_entities(dim, e, low));
            }
            let verts = self.verts_of(dim, e).to_vec();
            self.kill(dim, e);
            for v in verts {
                self.stars[v].retain(|&x| x != e);
            }
        }
        for (low, mut cands) in orphans.into_iter().enumerate().rev() {
            cands.sort_unstable();
            cands.dedup();
            for ent in cands {
                if self.is_alive(low, ent) && self.elems_of(low, ent).is_empty() {
                    self.kill(low, ent);
                }
            }
        }
    }

    /// Squeeze out dead slots, keeping alive entities in slot order.
    ///
    /// Returns per-dimension maps from old slot to new slot.
    pub fn compact(&mut self) -> Vec<Vec<Option<usize>>> {
        let dim = self.dim;
        let mut maps = Vec::with_capacity(dim + 1);
        let mut keeps = Vec::with_capacity(dim + 1);
        for d in 0..=dim {
            let mut map = vec![None; self.ents[d].nslots()];
            let keep: Vec<usize> = self.alive(d).collect();
            for (new, &old) in keep.iter().enumerate() {
                map[old] = Some(new);
            }
            maps.push(map);
            keeps.push(keep);
        }
        for d in 0..=dim {
            let n = simplex::nverts(d);
            let old = std::mem::take(&mut self.ents[d]);
            let keep = &keeps[d];
            let mut verts = Vec::with_capacity(keep.len() * n);
            for &s in keep {
                for &v in &old.verts[s * n..(s + 1) * n] {
                    verts.push(maps[VERT][v].unwrap_or(usize::MAX));
                }
            }
            self.ents[d] = EntitySet {
                verts,
                globals: keep.iter().map(|&s| old.globals[s]).collect(),
                ownership: old.ownership.gather(keep),
                alive: vec![true; keep.len()],
                nalive: keep.len(),
                tags: old.tags.gather_all(keep),
            };
        }
        self.reindex();
        maps
    }

    /// Rebuild key maps, gid maps and vertex stars from the arenas.
    fn reindex(&mut self) {
        let dim = self.dim;
        for d in 0..=dim {
            self.keys[d].clear();
            self.by_gid[d].clear();
            let n = simplex::nverts(d);
            for s in 0..self.ents[d].nslots() {
                if !self.ents[d].alive[s] {
                    continue;
                }
                self.by_gid[d].insert(self.ents[d].globals[s], s);
                if d > VERT {
                    let key = entity_key(&self.ents[d].verts[s * n..(s + 1) * n]);
                    self.keys[d].insert(key, s);
                }
            }
        }
        self.stars = vec![Vec::new(); self.ents[VERT].nslots()];
        let n = simplex::nverts(dim);
        for e in 0..self.ents[dim].nslots() {
            if self.ents[dim].alive[e] {
                for &v in &self.ents[dim].verts[e * n..(e + 1) * n] {
                    self.stars[v].push(e);
                }
            }
        }
    }

    /// Drop every entity.
    pub(crate) fn clear(&mut self) {
        for set in &mut self.ents {
            set.verts.clear();
            set.globals.clear();
            set.ownership = EntityOwnership::default();
            set.alive.clear();
            set.nalive = 0;
            set.tags.resize_all(0);
        }
        self.reindex();
    }

    // ----- tags ---------------------------------------------------------

    pub fn tags(&self, dim: usize) -> &TagSet {
        self.check_dim(dim);
        &self.ents[dim].tags
    }

    pub(crate) fn tags_mut(&mut self, dim: usize) -> &mut TagSet {
        self.check_dim(dim);
        &mut self.ents[dim].tags
    }

    pub fn has_tag(&self, dim: usize, name: &str) -> bool {
        self.check_dim(dim);
        self.ents[dim].tags.contains(name)
    }

    pub fn tag_names(&self, dim: usize) -> Vec<String> {
        self.check_dim(dim);
        self.ents[dim].tags.names().map(str::to_owned).collect()
    }

    pub fn ncomps(&self, dim: usize, name: &str) -> Result<usize, MeshAdaptError> {
        self.check_dim(dim);
        self.ents[dim]
            .tags
            .get(name)
            .map(|t| t.ncomps())
            .ok_or_else(|| MeshAdaptError::MissingTag {
                dim,
                name: name.to_owned(),
            })
    }

    /// Create a tag holding `ncomps` values per slot.
    pub fn add_tag<T: TagValue>(&mut self, dim: usize, name: &str, ncomps: usize, values: Vec<T>) -> Result<(), MeshAdaptError> {
        self.check_dim(dim);
        let nslots = self.ents[dim].nslots();
        self.ents[dim].tags.insert(dim, name, ncomps, T::wrap(values), nslots)
    }

    /// Replace the values of an existing tag.
    pub fn set_tag<T: TagValue>(&mut self, dim: usize, name: &str, values: Vec<T>) -> Result<(), MeshAdaptError> {
        self.check_dim(dim);
        let nslots = self.ents[dim].nslots();
        self.ents[dim].tags.replace(dim, name, T::wrap(values), nslots)
    }

    /// Create or replace a tag.
    pub fn put_tag<T: TagValue>(&mut self, dim: usize, name: &str, ncomps: usize, values: Vec<T>) -> Result<(), MeshAdaptError> {
        if self.has_tag(dim, name) && self.ncomps(dim, name)? == ncomps {
            self.set_tag(dim, name, values)
        } else {
            self.remove_tag(dim, name);
            self.add_tag(dim, name, ncomps, values)
        }
    }

    pub fn remove_tag(&mut self, dim: usize, name: &str) -> bool {
        self.check_dim(dim);
        self.ents[dim].tags.remove(name).is_some()
    }

    /// Typed view of a tag's values.
    pub fn get_tag<T: TagValue>(&self, dim: usize, name: &str) -> Result<&[T], MeshAdaptError> {
        self.check_dim(dim);
        let tag = self.ents[dim]
            .tags
            .get(name)
            .ok_or_else(|| MeshAdaptError::MissingTag {
                dim,
                name: name.to_owned(),
            })?;
        T::view(tag.data())
            .map(Vec::as_slice)
            .ok_or_else(|| MeshAdaptError::TagTypeMismatch {
                dim,
                name: name.to_owned(),
                expected: T::NAME,
                found: tag.data().type_name(),
            })
    }

    /// Mutable typed view of a tag's values.
    pub fn get_tag_mut<T: TagValue>(&mut self, dim: usize, name: &str) -> Result<&mut [T], MeshAdaptError> {
        self.check_dim(dim);
        let tag = self.ents[dim]
            .tags
            .get_mut(name)
            .ok_or_else(|| MeshAdaptError::MissingTag {
                dim,
                name: name.to_owned(),
            })?;
        let found = tag.data().type_name();
        T::view_mut(tag.data_mut())
            .map(Vec::as_mut_slice)
            .ok_or_else(|| MeshAdaptError::TagTypeMismatch {
                dim,
                name: name.to_owned(),
                expected: T::NAME,
                found,
            })
    }

    /// Classification of an entity, `(class_dim, class_id)`.
    ///
    /// Unclassified meshes report every entity as interior.
    pub fn class_of(&self, dim: usize, ent: usize) -> (i8, i32) {
        let cd = self
            .get_tag::<i8>(dim, CLASS_DIM)
            .map(|v| v[ent])
            .unwrap_or(self.dim as i8);
        let ci = self.get_tag::<i32>(dim, CLASS_ID).map(|v| v[ent]).unwrap_or(0);
        (cd, ci)
    }

    /// True when the mesh carries classification tags on every dimension.
    pub fn is_classified(&self) -> bool {
        (0..=self.dim).all(|d| self.has_tag(d, CLASS_DIM) && self.has_tag(d, CLASS_ID))
    }
}

impl<C: Communicator> DebugInvariants for Mesh<C> {
    fn debug_assert_invariants(&self) {
        crate::debug_invariants!(self.validate_invariants(), "Mesh");
    }

    fn validate_invariants(&self) -> Result<(), MeshAdaptError> {
        let dim = self.dim;
        for d in 0..=dim {
            let set = &self.ents[d];
            let nslots = set.nslots();
            ensure(set.globals.len() == nslots && set.ownership.len() == nslots, || {
                format!("dimension {d}: per-slot arrays disagree in length")
            })?;
            for (name, tag) in set.tags.iter() {
                if tag.data().len() != nslots * tag.ncomps() {
                    return Err(MeshAdaptError::TagSizeMismatch {
                        dim: d,
                        name: name.clone(),
                        expected: nslots * tag.ncomps(),
                        found: tag.data().len(),
                    });
                }
            }
            for ent in self.alive(d) {
                if d == VERT {
                    continue;
                }
                let verts = self.verts_of(d, ent);
                ensure(verts.iter().all(|&v| self.is_alive(VERT, v)), || {
                    format!("dimension {d} entity {} uses a dead vertex", set.globals[ent])
                })?;
                for low in 1..d {
                    for local in simplex::template(d, low) {
                        let sub: Vec<usize> = local.iter().map(|&k| verts[k]).collect();
                        match self.find_entity(low, &sub) {
                            Some(s) if self.is_alive(low, s) => {}
                            _ => {
                                return Err(MeshAdaptError::FatalInvariant(format!(
                                    "dimension {d} entity {} lacks a dimension {low} sub-entity",
                                    set.globals[ent]
                                )));
                            }
                        }
                    }
                }
                ensure(d == dim || !self.elems_of(d, ent).is_empty(), || {
                    format!("dimension {d} entity {} belongs to no element", set.globals[ent])
                })?;
            }
        }
        for e in self.alive(dim) {
            for &v in self.verts_of(dim, e) {
                ensure(self.stars[v].contains(&e), || {
                    format!(
                        "vertex {} star misses element {}",
                        self.ents[VERT].globals[v], self.ents[dim].globals[e]
                    )
                })?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_triangles() -> Mesh {
        let mut mesh = Mesh::serial(2).unwrap();
        let pts = [[0.0, 0.0], [1.0, 0.0], [1.0, 1.0], [0.0, 1.0]];
        for (i, p) in pts.iter().enumerate() {
            mesh.add_vertex(p, GlobalId::new(i as u64), 0).unwrap();
        }
        mesh.add_element(&[0, 1, 2], GlobalId::new(0), 0).unwrap();
        mesh.add_element(&[0, 2, 3], GlobalId::new(1), 0).unwrap();
        mesh
    }

    #[test]
    fn elements_create_shared_edges_once() {
        let mesh = two_triangles();
        assert_eq!(mesh.nents(1), 5);
        let diag = mesh.find_entity(1, &[2, 0]).unwrap();
        assert_eq!(mesh.elems_of(1, diag).len(), 2);
        assert_eq!(mesh.down(2, 0).len(), 3);
        mesh.validate_invariants().unwrap();
    }

    #[test]
    fn removing_an_element_drops_orphans_only() {
        let mut mesh = two_triangles();
        mesh.remove_elements(&[1]);
        assert_eq!(mesh.nents(2), 1);
        assert_eq!(mesh.nents(1), 3);
        assert_eq!(mesh.nents(0), 3);
        mesh.compact();
        assert_eq!(mesh.nslots(0), 3);
        mesh.validate_invariants().unwrap();
    }

    #[test]
    fn tag_lengths_are_checked() {
        let mut mesh = two_triangles();
        let err = mesh.add_tag::<f64>(0, "u", 1, vec![0.0; 3]).unwrap_err();
        assert!(matches!(err, MeshAdaptError::TagSizeMismatch { .. }));
        mesh.add_tag::<f64>(0, "u", 1, vec![1.0; 4]).unwrap();
        assert!(matches!(
            mesh.get_tag::<i32>(0, "u"),
            Err(MeshAdaptError::TagTypeMismatch { .. })
        ));
    }

    #[test]
    #[should_panic(expected = "exceeds mesh dimension")]
    fn querying_above_mesh_dimension_panics() {
        let mesh = two_triangles();
        let _ = mesh.nents(3);
    }

    #[test]
    fn lower_entity_vertices_are_sorted_by_gid() {
        let mesh = two_triangles();
        for e in mesh.alive(1) {
            let v = mesh.verts_of(1, e);
            assert!(mesh.global(0, v[0]) < mesh.global(0, v[1]));
        }
    }
}
