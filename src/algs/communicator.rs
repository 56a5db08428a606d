//! Thin façade over intra-process (threads) or inter-process (MPI) message passing.
//!
//! Messages are contiguous byte slices. Between a fixed (source, destination,
//! tag) triple, messages are delivered in the order they were sent; the
//! collectives in [`crate::algs::exchange`] rely on that to reuse tags.

use crate::mesh_error::MeshAdaptError;
use bytes::Bytes;
use dashmap::DashMap;
use once_cell::sync::Lazy;
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

/// Message tag namespace for one protocol step.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct CommTag(pub u16);

impl CommTag {
    pub const fn new(tag: u16) -> Self {
        CommTag(tag)
    }

    pub const fn as_u16(self) -> u16 {
        self.0
    }

    /// Derived tag for a sub-step (e.g. sizes, then payloads).
    pub const fn offset(self, k: u16) -> Self {
        CommTag(self.0.wrapping_add(k))
    }
}

/// Non-blocking point-to-point communication over a fixed group of ranks.
pub trait Communicator: Send + Sync + 'static {
    /// Handle returned by `isend`.
    type SendHandle: Wait;
    /// Handle returned by `irecv`.
    type RecvHandle: Wait;

    fn isend(&self, peer: usize, tag: u16, buf: &[u8]) -> Self::SendHandle;
    /// Receive at most `buf.len()` bytes; the data is returned by `wait`.
    fn irecv(&self, peer: usize, tag: u16, buf: &mut [u8]) -> Self::RecvHandle;

    fn rank(&self) -> usize;
    fn size(&self) -> usize;

    /// Personalized all-to-all: `sends[p]` goes to rank `p`; the result
    /// holds what every rank sent to this one, indexed by source rank.
    fn exchange_bytes(&self, sends: Vec<Vec<u8>>, tag: CommTag) -> Result<Vec<Vec<u8>>, MeshAdaptError>
    where
        Self: Sized,
    {
        crate::algs::exchange::exchange_p2p(self, sends, tag)
    }
}

/// Anything that can be waited on.
pub trait Wait {
    /// Wait for completion and return the received data (if any).
    fn wait(self) -> Option<Vec<u8>>;
}

/// Compile-time no-op comm for serial meshes.
#[derive(Clone, Debug, Default)]
pub struct NoComm;

impl Wait for () {
    fn wait(self) -> Option<Vec<u8>> {
        None
    }
}

impl Communicator for NoComm {
    type SendHandle = ();
    type RecvHandle = ();

    fn isend(&self, _peer: usize, _tag: u16, _buf: &[u8]) {}
    fn irecv(&self, _peer: usize, _tag: u16, _buf: &mut [u8]) {}

    fn rank(&self) -> usize {
        0
    }
    fn size(&self) -> usize {
        1
    }
}

// --- RayonComm: ranks as threads of one process ---

type Key = (u64, usize, usize, u16); // (group, src, dst, tag)

struct Mailbox {
    queues: DashMap<Key, VecDeque<Bytes>>,
    lock: Mutex<()>,
    arrived: Condvar,
}

static MAILBOX: Lazy<Mailbox> = Lazy::new(|| Mailbox {
    queues: DashMap::new(),
    lock: Mutex::new(()),
    arrived: Condvar::new(),
});

static NEXT_GROUP: AtomicU64 = AtomicU64::new(1);

/// Receive handle of [`RayonComm`]; `wait` blocks until a message arrives.
pub struct LocalHandle {
    key: Key,
    len: usize,
}

impl Wait for LocalHandle {
    fn wait(self) -> Option<Vec<u8>> {
        let mut guard = MAILBOX.lock.lock();
        loop {
            let popped = MAILBOX
                .queues
                .get_mut(&self.key)
                .and_then(|mut q| q.pop_front());
            if let Some(bytes) = popped {
                let n = self.len.min(bytes.len());
                return Some(bytes[..n].to_vec());
            }
            MAILBOX.arrived.wait(&mut guard);
        }
    }
}

/// In-process communicator: each rank runs on its own thread.
#[derive(Clone, Debug)]
pub struct RayonComm {
    group: u64,
    rank: usize,
    size: usize,
}

impl RayonComm {
    /// Rank `rank` of the shared default group of `size` ranks.
    pub fn new(rank: usize, size: usize) -> Self {
        assert!(rank < size, "rank {rank} outside group of {size}");
        Self {
            group: 0,
            rank,
            size,
        }
    }

    /// A fresh, isolated group of `size` ranks; element `r` is rank `r`.
    pub fn group(size: usize) -> Vec<Self> {
        let group = NEXT_GROUP.fetch_add(1, Ordering::Relaxed);
        (0..size).map(|rank| Self { group, rank, size }).collect()
    }
}

impl Communicator for RayonComm {
    type SendHandle = ();
    type RecvHandle = LocalHandle;

    fn isend(&self, peer: usize, tag: u16, buf: &[u8]) {
        let key = (self.group, self.rank, peer, tag);
        let _guard = MAILBOX.lock.lock();
        MAILBOX
            .queues
            .entry(key)
            .or_default()
            .push_back(Bytes::copy_from_slice(buf));
        MAILBOX.arrived.notify_all();
    }

    fn irecv(&self, peer: usize, tag: u16, buf: &mut [u8]) -> LocalHandle {
        LocalHandle {
            key: (self.group, peer, self.rank, tag),
            len: buf.len(),
        }
    }

    fn rank(&self) -> usize {
        self.rank
    }
    fn size(&self) -> usize {
        self.size
    }
}

// --- MPI backend (feature = "mpi-support") ---
#[cfg(feature = "mpi-support")]
mod mpi_backend {
    use super::*;
    use mpi::datatype::{Partition, PartitionMut};
    use mpi::topology::SimpleCommunicator;
    use mpi::traits::*;
    use mpi::Count;

    pub struct MpiComm {
        world: SimpleCommunicator,
        rank: usize,
        size: usize,
    }

    // SAFETY: a mesh drives its communicator from the thread that owns the
    // mesh; MPI handles are never used concurrently.
    unsafe impl Send for MpiComm {}
    unsafe impl Sync for MpiComm {}

    impl MpiComm {
        pub fn from_world(world: SimpleCommunicator) -> Self {
            let rank = world.rank() as usize;
            let size = world.size() as usize;
            Self { world, rank, size }
        }
    }

    /// Completed MPI operation carrying received bytes, if any.
    pub struct MpiHandle(Option<Vec<u8>>);

    impl Wait for MpiHandle {
        fn wait(self) -> Option<Vec<u8>> {
            self.0
        }
    }

    impl Communicator for MpiComm {
        type SendHandle = MpiHandle;
        type RecvHandle = MpiHandle;

        fn isend(&self, peer: usize, tag: u16, buf: &[u8]) -> MpiHandle {
            self.world
                .process_at_rank(peer as i32)
                .send_with_tag(buf, tag as i32);
            MpiHandle(None)
        }

        fn irecv(&self, peer: usize, tag: u16, buf: &mut [u8]) -> MpiHandle {
            let (data, _status) = self
                .world
                .process_at_rank(peer as i32)
                .receive_vec_with_tag::<u8>(tag as i32);
            let n = buf.len().min(data.len());
            MpiHandle(Some(data[..n].to_vec()))
        }

        fn rank(&self) -> usize {
            self.rank
        }
        fn size(&self) -> usize {
            self.size
        }

        fn exchange_bytes(&self, sends: Vec<Vec<u8>>, _tag: CommTag) -> Result<Vec<Vec<u8>>, MeshAdaptError> {
            if sends.len() != self.size {
                return Err(MeshAdaptError::Comm {
                    neighbor: self.rank,
                    reason: format!("{} send buffers for {} ranks", sends.len(), self.size),
                });
            }
            let counts: Vec<Count> = sends.iter().map(|s| s.len() as Count).collect();
            let mut recv_counts = vec![0 as Count; self.size];
            self.world.all_to_all_into(&counts[..], &mut recv_counts[..]);
            let displs = |c: &[Count]| -> Vec<Count> {
                c.iter()
                    .scan(0, |acc, &n| {
                        let at = *acc;
                        *acc += n;
                        Some(at)
                    })
                    .collect()
            };
            let send_displs = displs(&counts);
            let recv_displs = displs(&recv_counts);
            let flat: Vec<u8> = sends.concat();
            let total: usize = recv_counts.iter().map(|&n| n as usize).sum();
            let mut recv = vec![0u8; total];
            {
                let partition = Partition::new(&flat[..], &counts[..], &send_displs[..]);
                let mut partition_mut =
                    PartitionMut::new(&mut recv[..], &recv_counts[..], &recv_displs[..]);
                self.world
                    .all_to_all_varcount_into(&partition, &mut partition_mut);
            }
            Ok(recv_counts
                .iter()
                .zip(&recv_displs)
                .map(|(&n, &at)| recv[at as usize..(at + n) as usize].to_vec())
                .collect())
        }
    }
}

#[cfg(feature = "mpi-support")]
pub use mpi_backend::MpiComm;
