//! Fixed, versioned, little-endian wire types for mesh exchange paths.
//!
//! A message is a [`WireHdr`] followed by sections; each section is a
//! [`WireCount`] and that many `Pod` records. [`WireWriter`] and
//! [`WireReader`] produce and consume such messages; decoding copies into
//! freshly allocated, correctly aligned vectors.

use crate::mesh_error::MeshAdaptError;
use crate::topology::point::GlobalId;
use bytemuck::{Pod, Zeroable};
use std::mem::{align_of, size_of};

/// Bump when the layout or semantics change in incompatible ways.
pub const WIRE_VERSION: u16 = 1;

/// Message kinds.
pub mod kind {
    pub const MIGRATE: u16 = 1;
    pub const GHOST: u16 = 2;
    pub const EDIT: u16 = 3;
    pub const DIRECTORY: u16 = 4;
    pub const SYNC: u16 = 5;
    pub const SCHEMA: u16 = 6;
}

/// All multi-byte integers in these structs are little-endian on the wire.
#[repr(C)]
#[derive(Copy, Clone, Pod, Zeroable)]
pub struct WireHdr {
    pub version_le: u16,
    pub kind_le: u16,
    pub reserved_le: u32,
}

impl WireHdr {
    pub fn new(kind: u16) -> Self {
        Self {
            version_le: WIRE_VERSION.to_le(),
            kind_le: kind.to_le(),
            reserved_le: 0,
        }
    }
    pub fn kind(&self) -> u16 {
        u16::from_le(self.kind_le)
    }
    pub fn version(&self) -> u16 {
        u16::from_le(self.version_le)
    }
}

#[repr(C)]
#[derive(Copy, Clone, Pod, Zeroable)]
pub struct WireCount {
    pub n_le: u32,
}

impl WireCount {
    pub fn new(n: usize) -> Self {
        Self {
            n_le: (n as u32).to_le(),
        }
    }
    pub fn get(&self) -> usize {
        u32::from_le(self.n_le) as usize
    }
}

/// One entity: identity, owner and vertex global ids.
#[repr(C)]
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
pub struct WireEntity {
    pub gid_le: u64,
    pub verts_le: [u64; 4],
    pub owner_le: u32,
    pub dim_le: u16,
    pub nverts_le: u16,
}

impl WireEntity {
    pub fn new(dim: usize, gid: GlobalId, owner: usize, verts: &[GlobalId]) -> Self {
        let mut verts_le = [u64::MAX.to_le(); 4];
        for (slot, v) in verts_le.iter_mut().zip(verts) {
            *slot = v.get().to_le();
        }
        Self {
            gid_le: gid.get().to_le(),
            verts_le,
            owner_le: (owner as u32).to_le(),
            dim_le: (dim as u16).to_le(),
            nverts_le: (verts.len() as u16).to_le(),
        }
    }
    pub fn dim(&self) -> usize {
        u16::from_le(self.dim_le) as usize
    }
    pub fn gid(&self) -> GlobalId {
        GlobalId::new(u64::from_le(self.gid_le))
    }
    pub fn owner(&self) -> usize {
        u32::from_le(self.owner_le) as usize
    }
    pub fn verts(&self) -> Vec<GlobalId> {
        let n = u16::from_le(self.nverts_le) as usize;
        self.verts_le[..n.min(4)]
            .iter()
            .map(|&v| GlobalId::new(u64::from_le(v)))
            .collect()
    }
}

/// A `(dimension, global id)` key with an attached rank.
#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, Pod, Zeroable)]
pub struct WireDimGid {
    pub gid_le: u64,
    pub dim_le: u32,
    pub rank_le: u32,
}

impl WireDimGid {
    pub fn new(dim: usize, gid: GlobalId, rank: usize) -> Self {
        Self {
            gid_le: gid.get().to_le(),
            dim_le: (dim as u32).to_le(),
            rank_le: (rank as u32).to_le(),
        }
    }
    pub fn dim(&self) -> usize {
        u32::from_le(self.dim_le) as usize
    }
    pub fn gid(&self) -> GlobalId {
        GlobalId::new(u64::from_le(self.gid_le))
    }
    pub fn rank(&self) -> usize {
        u32::from_le(self.rank_le) as usize
    }
}

const _: () = {
    assert!(size_of::<WireHdr>() == 8);
    assert!(size_of::<WireCount>() == 4);
    assert!(size_of::<WireEntity>() == 48);
    assert!(align_of::<WireEntity>() == 8);
    assert!(size_of::<WireDimGid>() == 16);
};

/// Copy raw bytes into a vector of `T`, independent of source alignment.
pub fn pod_vec_from_bytes<T: Pod>(bytes: &[u8]) -> Result<Vec<T>, MeshAdaptError> {
    let width = size_of::<T>();
    if width == 0 || bytes.len() % width != 0 {
        return Err(MeshAdaptError::Wire(format!(
            "{} bytes is not a whole number of {width}-byte records",
            bytes.len()
        )));
    }
    let mut out = vec![T::zeroed(); bytes.len() / width];
    bytemuck::cast_slice_mut::<T, u8>(&mut out).copy_from_slice(bytes);
    Ok(out)
}

/// Builds one message.
pub struct WireWriter {
    buf: Vec<u8>,
}

impl WireWriter {
    pub fn new(kind: u16) -> Self {
        let mut buf = Vec::new();
        buf.extend_from_slice(bytemuck::bytes_of(&WireHdr::new(kind)));
        Self { buf }
    }

    /// Append a counted section of records.
    pub fn put<T: Pod>(&mut self, records: &[T]) -> &mut Self {
        self.buf
            .extend_from_slice(bytemuck::bytes_of(&WireCount::new(records.len())));
        self.buf.extend_from_slice(bytemuck::cast_slice(records));
        self
    }

    pub fn finish(self) -> Vec<u8> {
        self.buf
    }
}

/// Consumes one message produced by [`WireWriter`].
pub struct WireReader<'a> {
    buf: &'a [u8],
    at: usize,
}

impl<'a> WireReader<'a> {
    /// Check the header and expect the given kind.
    pub fn new(buf: &'a [u8], expected_kind: u16) -> Result<Self, MeshAdaptError> {
        let hdr_len = size_of::<WireHdr>();
        if buf.len() < hdr_len {
            return Err(MeshAdaptError::Wire(format!(
                "message of {} bytes is shorter than its header",
                buf.len()
            )));
        }
        let hdr: WireHdr = bytemuck::pod_read_unaligned(&buf[..hdr_len]);
        if hdr.version() != WIRE_VERSION {
            return Err(MeshAdaptError::Wire(format!(
                "wire version {} (expected {WIRE_VERSION})",
                hdr.version()
            )));
        }
        if hdr.kind() != expected_kind {
            return Err(MeshAdaptError::Wire(format!(
                "message kind {} (expected {expected_kind})",
                hdr.kind()
            )));
        }
        Ok(Self { buf, at: hdr_len })
    }

    /// Read the next counted section.
    pub fn get<T: Pod>(&mut self) -> Result<Vec<T>, MeshAdaptError> {
        let count_len = size_of::<WireCount>();
        if self.buf.len() < self.at + count_len {
            return Err(MeshAdaptError::Wire("truncated section count".into()));
        }
        let count: WireCount = bytemuck::pod_read_unaligned(&self.buf[self.at..self.at + count_len]);
        self.at += count_len;
        let len = count.get() * size_of::<T>();
        if self.buf.len() < self.at + len {
            return Err(MeshAdaptError::Wire(format!(
                "section of {len} bytes overruns message of {} bytes",
                self.buf.len()
            )));
        }
        let out = pod_vec_from_bytes(&self.buf[self.at..self.at + len])?;
        self.at += len;
        Ok(out)
    }

    pub fn is_done(&self) -> bool {
        self.at == self.buf.len()
    }
}
