//! Typed per-entity tag storage.

pub mod tags;

pub use tags::{Tag, TagData, TagSchema, TagSet, TagValue};
