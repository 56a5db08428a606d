//! Ownership metadata for mesh entities of one dimension.
//!
//! [`EntityOwnership`] records, per local slot, the owning rank and whether
//! the entity is a ghost copy on this rank. Ownership of lower entities is
//! the minimum rank among the ranks whose owned elements use them.

use crate::mesh_error::MeshAdaptError;

#[derive(Copy, Clone, Debug, Eq, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct OwnershipEntry {
    pub owner: usize,
    pub is_ghost: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct EntityOwnership {
    entries: Vec<OwnershipEntry>,
}

impl EntityOwnership {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Append the entry of a newly created slot.
    pub fn push(&mut self, owner: usize, my_rank: usize) {
        self.entries.push(OwnershipEntry {
            owner,
            is_ghost: owner != my_rank,
        });
    }

    /// Update the owner of an existing slot.
    pub fn set(&mut self, slot: usize, owner: usize, my_rank: usize) -> Result<(), MeshAdaptError> {
        let entry = self.entries.get_mut(slot).ok_or_else(|| {
            MeshAdaptError::InvalidMesh(format!("ownership slot {slot} out of range"))
        })?;
        *entry = OwnershipEntry {
            owner,
            is_ghost: owner != my_rank,
        };
        Ok(())
    }

    /// Keep the smaller of the current and the offered owner.
    pub fn set_owner_min(&mut self, slot: usize, owner: usize, my_rank: usize) -> Result<(), MeshAdaptError> {
        let current = self.owner(slot)?;
        self.set(slot, current.min(owner), my_rank)
    }

    pub fn owner(&self, slot: usize) -> Result<usize, MeshAdaptError> {
        self.entries
            .get(slot)
            .map(|e| e.owner)
            .ok_or_else(|| MeshAdaptError::InvalidMesh(format!("ownership slot {slot} out of range")))
    }

    pub fn is_ghost(&self, slot: usize) -> bool {
        self.entries.get(slot).is_some_and(|e| e.is_ghost)
    }

    pub fn is_owned(&self, slot: usize) -> bool {
        self.entries.get(slot).is_some_and(|e| !e.is_ghost)
    }

    /// Raw owner ranks, one per slot.
    pub fn owners(&self) -> impl Iterator<Item = usize> + '_ {
        self.entries.iter().map(|e| e.owner)
    }

    /// Keep the listed slots, in that order.
    pub fn gather(&self, keep: &[usize]) -> Self {
        Self {
            entries: keep.iter().map(|&s| self.entries[s]).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn owner_min_keeps_smallest_rank() {
        let mut own = EntityOwnership::default();
        own.push(3, 1);
        own.set_owner_min(0, 2, 1).unwrap();
        own.set_owner_min(0, 5, 1).unwrap();
        assert_eq!(own.owner(0).unwrap(), 2);
        assert!(own.is_ghost(0));
        own.set_owner_min(0, 1, 1).unwrap();
        assert!(own.is_owned(0));
    }

    #[test]
    fn out_of_range_slot_is_an_error() {
        let own = EntityOwnership::default();
        assert!(own.owner(0).is_err());
    }
}
