//! Distance-one independent sets of candidate edits.
//!
//! Two candidates conflict when their cavities share a vertex. Every
//! candidate carries a key `(priority, dimension, global id)`; a candidate is
//! accepted once its key is the largest among the undecided candidates at
//! every vertex of its cavity, and rejected once a neighbor is accepted. The
//! outcome depends only on the keys, never on the partition.

use crate::algs::communicator::Communicator;
use crate::algs::exchange::allreduce_or;
use crate::mesh_error::MeshAdaptError;
use crate::topology::mesh::Mesh;
use crate::topology::point::GlobalId;
use crate::topology::simplex::VERT;

#[derive(Clone, Debug, PartialEq)]
pub struct Candidate {
    /// Vertices of the cavity.
    pub verts: Vec<usize>,
    pub priority: f64,
    pub key_dim: usize,
    pub key: GlobalId,
}

const WIDTH: usize = 3;

/// Map `x` to an unsigned integer with the same ordering.
fn ordered_bits(x: f64) -> u64 {
    let b = x.to_bits();
    if b >> 63 == 0 { b | (1 << 63) } else { !b }
}

fn rank_key(c: &Candidate) -> [u64; WIDTH] {
    [ordered_bits(c.priority), c.key_dim as u64 + 1, c.key.get()]
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum State {
    Undecided,
    Accepted,
    Rejected,
}

/// Collective: indices of the accepted candidates.
pub fn independent_set<C: Communicator>(mesh: &Mesh<C>, cands: &[Candidate]) -> Result<Vec<usize>, MeshAdaptError> {
    let n = mesh.nslots(VERT);
    let keys: Vec<[u64; WIDTH]> = cands.iter().map(rank_key).collect();
    let mut state = vec![State::Undecided; cands.len()];
    let mut round = 0usize;
    loop {
        let mut best = vec![0u64; n * WIDTH];
        for (k, c) in cands.iter().enumerate() {
            if state[k] != State::Undecided {
                continue;
            }
            let key = &keys[k];
            for &v in &c.verts {
                let slot = &mut best[v * WIDTH..(v + 1) * WIDTH];
                if key.as_slice() > &*slot {
                    slot.copy_from_slice(key);
                }
            }
        }
        mesh.reduce_to_owners(VERT, &mut best, WIDTH, |a, b| {
            if b > &*a {
                a.copy_from_slice(b);
            }
        })?;

        let mut taken = vec![0u8; n];
        for (k, c) in cands.iter().enumerate() {
            if state[k] != State::Undecided {
                continue;
            }
            let wins = c.verts.iter().all(|&v| best[v * WIDTH..(v + 1) * WIDTH] == keys[k]);
            if wins {
                state[k] = State::Accepted;
                for &v in &c.verts {
                    taken[v] = 1;
                }
            }
        }
        mesh.reduce_to_owners(VERT, &mut taken, 1, |a, b| a[0] = a[0].max(b[0]))?;

        let mut left = false;
        for (k, c) in cands.iter().enumerate() {
            if state[k] == State::Undecided {
                if c.verts.iter().any(|&v| taken[v] != 0) {
                    state[k] = State::Rejected;
                } else {
                    left = true;
                }
            }
        }
        round += 1;
        if !allreduce_or(mesh.comm(), left)? {
            break;
        }
    }
    log::trace!("independent set settled after {round} rounds");
    Ok((0..cands.len()).filter(|&k| state[k] == State::Accepted).collect())
}
