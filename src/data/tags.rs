//! Fixed-width per-entity tag arrays.
//!
//! A tag is a named array holding exactly `ncomps` values for every entity
//! slot of one dimension. Values are stored in a type-erased [`TagData`]
//! buffer; [`TagValue`] recovers typed views. Tags of one dimension are kept
//! in a [`TagSet`] ordered by name, so every rank enumerates them (and packs
//! their wire payloads) in the same order.

use crate::mesh_error::MeshAdaptError;
use bytemuck::Pod;
use num_traits::Zero;
use std::collections::BTreeMap;
use std::fmt::Debug;

/// Type-erased tag storage.
#[derive(Clone, Debug, PartialEq)]
pub enum TagData {
    I8(Vec<i8>),
    I32(Vec<i32>),
    I64(Vec<i64>),
    F64(Vec<f64>),
}

/// Scalar types storable in a tag.
pub trait TagValue: Pod + Zero + PartialEq + Debug + Send + Sync + 'static {
    /// Human-readable type name used in diagnostics.
    const NAME: &'static str;
    /// Discriminant used on the wire.
    const CODE: u8;

    fn wrap(values: Vec<Self>) -> TagData;
    fn view(data: &TagData) -> Option<&Vec<Self>>;
    fn view_mut(data: &mut TagData) -> Option<&mut Vec<Self>>;
}

macro_rules! impl_tag_value {
    ($t:ty, $variant:ident, $name:expr, $code:expr) => {
        impl TagValue for $t {
            const NAME: &'static str = $name;
            const CODE: u8 = $code;

            fn wrap(values: Vec<Self>) -> TagData {
                TagData::$variant(values)
            }
            fn view(data: &TagData) -> Option<&Vec<Self>> {
                match data {
                    TagData::$variant(v) => Some(v),
                    _ => None,
                }
            }
            fn view_mut(data: &mut TagData) -> Option<&mut Vec<Self>> {
                match data {
                    TagData::$variant(v) => Some(v),
                    _ => None,
                }
            }
        }
    };
}

impl_tag_value!(i8, I8, "i8", 0);
impl_tag_value!(i32, I32, "i32", 1);
impl_tag_value!(i64, I64, "i64", 2);
impl_tag_value!(f64, F64, "f64", 3);

macro_rules! dispatch {
    ($data:expr, $v:ident => $body:expr) => {
        match $data {
            TagData::I8($v) => $body,
            TagData::I32($v) => $body,
            TagData::I64($v) => $body,
            TagData::F64($v) => $body,
        }
    };
}

impl TagData {
    /// Empty storage of the type identified by a wire code.
    pub fn empty_of(code: u8) -> Option<Self> {
        match code {
            0 => Some(TagData::I8(Vec::new())),
            1 => Some(TagData::I32(Vec::new())),
            2 => Some(TagData::I64(Vec::new())),
            3 => Some(TagData::F64(Vec::new())),
            _ => None,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            TagData::I8(_) => i8::NAME,
            TagData::I32(_) => i32::NAME,
            TagData::I64(_) => i64::NAME,
            TagData::F64(_) => f64::NAME,
        }
    }

    pub fn type_code(&self) -> u8 {
        match self {
            TagData::I8(_) => i8::CODE,
            TagData::I32(_) => i32::CODE,
            TagData::I64(_) => i64::CODE,
            TagData::F64(_) => f64::CODE,
        }
    }

    /// Size in bytes of one scalar.
    pub fn scalar_size(&self) -> usize {
        match self {
            TagData::I8(_) => 1,
            TagData::I32(_) => 4,
            TagData::I64(_) | TagData::F64(_) => 8,
        }
    }

    pub fn len(&self) -> usize {
        dispatch!(self, v => v.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Grow or shrink to `len` scalars, zero-filling new values.
    pub fn resize(&mut self, len: usize) {
        dispatch!(self, v => v.resize(len, Zero::zero()))
    }

    /// Keep the entity slots listed in `keep`, in that order.
    pub fn gather(&self, keep: &[usize], ncomps: usize) -> TagData {
        dispatch!(self, v => {
            let mut out = Vec::with_capacity(keep.len() * ncomps);
            for &slot in keep {
                out.extend_from_slice(&v[slot * ncomps..(slot + 1) * ncomps]);
            }
            TagValue::wrap(out)
        })
    }

    /// The whole array as raw bytes.
    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        dispatch!(self, v => bytemuck::cast_slice_mut(v.as_mut_slice()))
    }

    /// Raw bytes of one entity slot.
    pub fn entity_bytes(&self, slot: usize, ncomps: usize) -> &[u8] {
        dispatch!(self, v => bytemuck::cast_slice(&v[slot * ncomps..(slot + 1) * ncomps]))
    }

    /// Overwrite one entity slot from raw bytes (alignment-agnostic).
    pub fn set_entity_bytes(&mut self, slot: usize, ncomps: usize, bytes: &[u8]) {
        dispatch!(self, v => {
            let dst: &mut [u8] = bytemuck::cast_slice_mut(&mut v[slot * ncomps..(slot + 1) * ncomps]);
            dst.copy_from_slice(bytes);
        })
    }

    /// Copy one entity slot from `other` (same type) into `slot`.
    pub fn copy_entity_from(&mut self, slot: usize, other: &TagData, from: usize, ncomps: usize) {
        let bytes = other.entity_bytes(from, ncomps).to_vec();
        self.set_entity_bytes(slot, ncomps, &bytes);
    }
}

/// A named fixed-width tag.
#[derive(Clone, Debug, PartialEq)]
pub struct Tag {
    ncomps: usize,
    data: TagData,
}

impl Tag {
    pub fn ncomps(&self) -> usize {
        self.ncomps
    }

    pub fn data(&self) -> &TagData {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut TagData {
        &mut self.data
    }

    /// Bytes per entity slot.
    pub fn entity_width(&self) -> usize {
        self.ncomps * self.data.scalar_size()
    }
}

/// All tags of one dimension, ordered by name.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct TagSet {
    tags: BTreeMap<String, Tag>,
}

/// Schema entry describing a tag without its values.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct TagSchema {
    pub name: String,
    pub type_code: u8,
    pub ncomps: usize,
}

impl TagSet {
    pub fn contains(&self, name: &str) -> bool {
        self.tags.contains_key(name)
    }

    pub fn get(&self, name: &str) -> Option<&Tag> {
        self.tags.get(name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut Tag> {
        self.tags.get_mut(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.tags.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Tag)> {
        self.tags.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&String, &mut Tag)> {
        self.tags.iter_mut()
    }

    /// Insert a tag after checking its length against `nslots`.
    pub fn insert(
        &mut self,
        dim: usize,
        name: &str,
        ncomps: usize,
        data: TagData,
        nslots: usize,
    ) -> Result<(), MeshAdaptError> {
        if self.tags.contains_key(name) {
            return Err(MeshAdaptError::DuplicateTag {
                dim,
                name: name.to_owned(),
            });
        }
        check_len(dim, name, ncomps, &data, nslots)?;
        self.tags.insert(name.to_owned(), Tag { ncomps, data });
        Ok(())
    }

    /// Replace the values of an existing tag.
    pub fn replace(
        &mut self,
        dim: usize,
        name: &str,
        data: TagData,
        nslots: usize,
    ) -> Result<(), MeshAdaptError> {
        let tag = self
            .tags
            .get_mut(name)
            .ok_or_else(|| MeshAdaptError::MissingTag {
                dim,
                name: name.to_owned(),
            })?;
        if tag.data.type_code() != data.type_code() {
            return Err(MeshAdaptError::TagTypeMismatch {
                dim,
                name: name.to_owned(),
                expected: tag.data.type_name(),
                found: data.type_name(),
            });
        }
        check_len(dim, name, tag.ncomps, &data, nslots)?;
        tag.data = data;
        Ok(())
    }

    pub fn remove(&mut self, name: &str) -> Option<Tag> {
        self.tags.remove(name)
    }

    /// Resize every tag to hold `nslots` entities.
    pub fn resize_all(&mut self, nslots: usize) {
        for tag in self.tags.values_mut() {
            tag.data.resize(nslots * tag.ncomps);
        }
    }

    /// Keep the listed slots of every tag.
    pub fn gather_all(&self, keep: &[usize]) -> TagSet {
        let tags = self
            .tags
            .iter()
            .map(|(name, tag)| {
                (
                    name.clone(),
                    Tag {
                        ncomps: tag.ncomps,
                        data: tag.data.gather(keep, tag.ncomps),
                    },
                )
            })
            .collect();
        TagSet { tags }
    }

    /// Bytes per entity slot across all tags.
    pub fn entity_width(&self) -> usize {
        self.tags.values().map(Tag::entity_width).sum()
    }

    /// Append the packed bytes of one entity (all tags, name order).
    pub fn pack_entity(&self, slot: usize, out: &mut Vec<u8>) {
        for tag in self.tags.values() {
            out.extend_from_slice(tag.data.entity_bytes(slot, tag.ncomps));
        }
    }

    /// Overwrite one entity from bytes produced by [`TagSet::pack_entity`].
    pub fn unpack_entity(&mut self, slot: usize, bytes: &[u8]) -> Result<(), MeshAdaptError> {
        if bytes.len() != self.entity_width() {
            return Err(MeshAdaptError::Wire(format!(
                "entity payload of {} bytes, schema expects {}",
                bytes.len(),
                self.entity_width()
            )));
        }
        let mut offset = 0;
        for tag in self.tags.values_mut() {
            let width = tag.entity_width();
            tag.data
                .set_entity_bytes(slot, tag.ncomps, &bytes[offset..offset + width]);
            offset += width;
        }
        Ok(())
    }

    pub fn schema(&self) -> Vec<TagSchema> {
        self.tags
            .iter()
            .map(|(name, tag)| TagSchema {
                name: name.clone(),
                type_code: tag.data.type_code(),
                ncomps: tag.ncomps,
            })
            .collect()
    }

    /// Create zero-filled tags for schema entries not present yet.
    pub fn adopt_schema(
        &mut self,
        dim: usize,
        schema: &[TagSchema],
        nslots: usize,
    ) -> Result<(), MeshAdaptError> {
        for entry in schema {
            match self.tags.get(&entry.name) {
                Some(tag) if tag.ncomps != entry.ncomps || tag.data.type_code() != entry.type_code => {
                    return Err(MeshAdaptError::FatalInvariant(format!(
                        "tag `{}` on dimension {dim} differs between ranks",
                        entry.name
                    )));
                }
                Some(_) => {}
                None => {
                    let mut data = TagData::empty_of(entry.type_code).ok_or_else(|| {
                        MeshAdaptError::Wire(format!("unknown tag type code {}", entry.type_code))
                    })?;
                    data.resize(nslots * entry.ncomps);
                    self.tags.insert(
                        entry.name.clone(),
                        Tag {
                            ncomps: entry.ncomps,
                            data,
                        },
                    );
                }
            }
        }
        Ok(())
    }
}

fn check_len(
    dim: usize,
    name: &str,
    ncomps: usize,
    data: &TagData,
    nslots: usize,
) -> Result<(), MeshAdaptError> {
    let expected = nslots * ncomps;
    if data.len() != expected {
        return Err(MeshAdaptError::TagSizeMismatch {
            dim,
            name: name.to_owned(),
            expected,
            found: data.len(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_rejects_wrong_width() {
        let mut set = TagSet::default();
        let err = set
            .insert(0, "u", 2, TagData::F64(vec![0.0; 5]), 3)
            .unwrap_err();
        assert!(matches!(err, MeshAdaptError::TagSizeMismatch { expected: 6, found: 5, .. }));
    }

    #[test]
    fn pack_unpack_entity_preserves_mixed_types() {
        let mut set = TagSet::default();
        set.insert(0, "a", 1, TagData::I8(vec![1, 2]), 2).unwrap();
        set.insert(0, "b", 2, TagData::F64(vec![0.5, 1.5, 2.5, 3.5]), 2)
            .unwrap();
        let mut bytes = Vec::new();
        set.pack_entity(1, &mut bytes);
        assert_eq!(bytes.len(), set.entity_width());

        let mut other = set.clone();
        other.unpack_entity(0, &bytes).unwrap();
        assert_eq!(other.get("a").unwrap().data(), &TagData::I8(vec![2, 2]));
        assert_eq!(
            other.get("b").unwrap().data(),
            &TagData::F64(vec![2.5, 3.5, 2.5, 3.5])
        );
    }

    #[test]
    fn gather_keeps_requested_slots_in_order() {
        let data = TagData::I32(vec![10, 11, 20, 21, 30, 31]);
        assert_eq!(data.gather(&[2, 0], 2), TagData::I32(vec![30, 31, 10, 11]));
    }
}
