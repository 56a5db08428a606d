//! Collectives built on point-to-point messages.
//!
//! Everything funnels through a personalized all-to-all exchange: sizes are
//! exchanged first, then payloads of known length. Reductions gather every
//! rank's contribution and combine them in rank order, so all ranks compute
//! bitwise-identical results.

use crate::algs::communicator::{CommTag, Communicator, Wait};
use crate::algs::wire::pod_vec_from_bytes;
use crate::mesh_error::MeshAdaptError;
use bytemuck::Pod;

/// Tag used by exchanges issued through [`exchange`].
pub const EXCHANGE_TAG: CommTag = CommTag::new(0x4d00);

/// Point-to-point implementation of [`Communicator::exchange_bytes`].
pub fn exchange_p2p<C: Communicator>(
    comm: &C,
    mut sends: Vec<Vec<u8>>,
    tag: CommTag,
) -> Result<Vec<Vec<u8>>, MeshAdaptError> {
    let (me, size) = (comm.rank(), comm.size());
    if sends.len() != size {
        return Err(MeshAdaptError::Comm {
            neighbor: me,
            reason: format!("{} send buffers for {size} ranks", sends.len()),
        });
    }
    let mut recvd: Vec<Vec<u8>> = vec![Vec::new(); size];
    recvd[me] = std::mem::take(&mut sends[me]);
    if size == 1 {
        return Ok(recvd);
    }

    let size_tag = tag.as_u16();
    let data_tag = tag.offset(1).as_u16();

    // sizes
    let mut send_handles = Vec::with_capacity(size - 1);
    let mut recv_handles = Vec::with_capacity(size - 1);
    let mut size_bufs = vec![[0u8; 8]; size];
    for peer in (0..size).filter(|&p| p != me) {
        let n = (sends[peer].len() as u64).to_le_bytes();
        send_handles.push(comm.isend(peer, size_tag, &n));
        recv_handles.push((peer, comm.irecv(peer, size_tag, &mut size_bufs[peer])));
    }
    let mut incoming = vec![0usize; size];
    let mut first_err = None;
    for (peer, h) in recv_handles {
        match h.wait() {
            Some(data) if data.len() == 8 => {
                let mut raw = [0u8; 8];
                raw.copy_from_slice(&data);
                incoming[peer] = u64::from_le_bytes(raw) as usize;
            }
            Some(data) => {
                first_err.get_or_insert(MeshAdaptError::Comm {
                    neighbor: peer,
                    reason: format!("size message of {} bytes", data.len()),
                });
            }
            None => {
                first_err.get_or_insert(MeshAdaptError::Comm {
                    neighbor: peer,
                    reason: "missing size message".into(),
                });
            }
        }
    }
    for h in send_handles {
        let _ = h.wait();
    }
    if let Some(err) = first_err {
        return Err(err);
    }

    // payloads
    let mut send_handles = Vec::new();
    let mut recv_handles = Vec::new();
    for peer in (0..size).filter(|&p| p != me) {
        if !sends[peer].is_empty() {
            send_handles.push(comm.isend(peer, data_tag, &sends[peer]));
        }
        if incoming[peer] > 0 {
            let mut buf = vec![0u8; incoming[peer]];
            recv_handles.push((peer, comm.irecv(peer, data_tag, &mut buf)));
        }
    }
    for (peer, h) in recv_handles {
        match h.wait() {
            Some(data) if data.len() == incoming[peer] => recvd[peer] = data,
            other => {
                first_err.get_or_insert(MeshAdaptError::Comm {
                    neighbor: peer,
                    reason: format!(
                        "expected {} payload bytes, got {}",
                        incoming[peer],
                        other.map_or(0, |d| d.len())
                    ),
                });
            }
        }
    }
    for h in send_handles {
        let _ = h.wait();
    }
    match first_err {
        Some(err) => Err(err),
        None => Ok(recvd),
    }
}

/// Personalized all-to-all of byte buffers.
pub fn exchange<C: Communicator>(comm: &C, sends: Vec<Vec<u8>>) -> Result<Vec<Vec<u8>>, MeshAdaptError> {
    comm.exchange_bytes(sends, EXCHANGE_TAG)
}

/// Personalized all-to-all of `Pod` records.
pub fn exchange_pod<C: Communicator, T: Pod>(comm: &C, sends: Vec<Vec<T>>) -> Result<Vec<Vec<T>>, MeshAdaptError> {
    let bytes = sends
        .into_iter()
        .map(|v| bytemuck::cast_slice(&v).to_vec())
        .collect();
    exchange(comm, bytes)?
        .iter()
        .map(|b| pod_vec_from_bytes(b))
        .collect()
}

/// Every rank's records, indexed by rank.
pub fn allgather<C: Communicator, T: Pod>(comm: &C, mine: &[T]) -> Result<Vec<Vec<T>>, MeshAdaptError> {
    exchange_pod(comm, vec![mine.to_vec(); comm.size()])
}

fn allreduce_with<C: Communicator, T: Pod>(
    comm: &C,
    mine: &[T],
    combine: impl Fn(T, T) -> T,
) -> Result<Vec<T>, MeshAdaptError> {
    let all = allgather(comm, mine)?;
    let mut acc = all[0].clone();
    for (rank, contrib) in all.iter().enumerate().skip(1) {
        if contrib.len() != acc.len() {
            return Err(MeshAdaptError::Comm {
                neighbor: rank,
                reason: format!("reduction of {} values, expected {}", contrib.len(), acc.len()),
            });
        }
        for (a, &b) in acc.iter_mut().zip(contrib) {
            *a = combine(*a, b);
        }
    }
    Ok(acc)
}

pub fn allreduce_sum<C: Communicator>(comm: &C, mine: &[f64]) -> Result<Vec<f64>, MeshAdaptError> {
    allreduce_with(comm, mine, |a, b| a + b)
}

pub fn allreduce_max<C: Communicator>(comm: &C, mine: &[f64]) -> Result<Vec<f64>, MeshAdaptError> {
    allreduce_with(comm, mine, f64::max)
}

pub fn allreduce_min<C: Communicator>(comm: &C, mine: &[f64]) -> Result<Vec<f64>, MeshAdaptError> {
    allreduce_with(comm, mine, f64::min)
}

pub fn allreduce_sum_u64<C: Communicator>(comm: &C, mine: &[u64]) -> Result<Vec<u64>, MeshAdaptError> {
    allreduce_with(comm, mine, |a, b| a + b)
}

pub fn allreduce_max_u64<C: Communicator>(comm: &C, mine: &[u64]) -> Result<Vec<u64>, MeshAdaptError> {
    allreduce_with(comm, mine, u64::max)
}

/// True on every rank if it is true on any rank.
pub fn allreduce_or<C: Communicator>(comm: &C, mine: bool) -> Result<bool, MeshAdaptError> {
    Ok(allreduce_max_u64(comm, &[mine as u64])?[0] != 0)
}

/// Exclusive prefix sum over ranks, component by component.
pub fn exscan_u64<C: Communicator>(comm: &C, mine: &[u64]) -> Result<Vec<u64>, MeshAdaptError> {
    let all = allgather(comm, mine)?;
    let mut out = vec![0u64; mine.len()];
    for contrib in &all[..comm.rank()] {
        for (o, &c) in out.iter_mut().zip(contrib) {
            *o += c;
        }
    }
    Ok(out)
}

/// Broadcast `root`'s bytes to every rank.
pub fn broadcast<C: Communicator>(comm: &C, root: usize, bytes: &[u8]) -> Result<Vec<u8>, MeshAdaptError> {
    let sends = if comm.rank() == root {
        vec![bytes.to_vec(); comm.size()]
    } else {
        vec![Vec::new(); comm.size()]
    };
    let mut recvd = exchange(comm, sends)?;
    Ok(std::mem::take(&mut recvd[root]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algs::communicator::{NoComm, RayonComm};
    use std::thread;

    fn run_group<R: Send + 'static>(n: usize, f: impl Fn(RayonComm) -> R + Send + Sync + Clone + 'static) -> Vec<R> {
        let handles: Vec<_> = RayonComm::group(n)
            .into_iter()
            .map(|c| {
                let f = f.clone();
                thread::spawn(move || f(c))
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    }

    #[test]
    fn serial_collectives_are_identities() {
        assert_eq!(allreduce_sum(&NoComm, &[1.5, 2.0]).unwrap(), vec![1.5, 2.0]);
        assert_eq!(exscan_u64(&NoComm, &[4]).unwrap(), vec![0]);
        assert!(allreduce_or(&NoComm, true).unwrap());
    }

    #[test]
    fn exchange_routes_by_destination() {
        let out = run_group(3, |c| {
            let me = c.rank() as u8;
            let sends = (0..3).map(|p| vec![me, p as u8]).collect();
            exchange(&c, sends).unwrap()
        });
        for (me, recvd) in out.iter().enumerate() {
            for (src, msg) in recvd.iter().enumerate() {
                assert_eq!(msg, &vec![src as u8, me as u8]);
            }
        }
    }

    #[test]
    fn reductions_agree_on_every_rank() {
        let out = run_group(4, |c| {
            let r = c.rank() as u64;
            (
                allreduce_sum_u64(&c, &[r, 1]).unwrap(),
                exscan_u64(&c, &[r + 1]).unwrap(),
                allreduce_max(&c, &[r as f64]).unwrap(),
            )
        });
        for (rank, (sum, scan, max)) in out.into_iter().enumerate() {
            assert_eq!(sum, vec![6, 4]);
            assert_eq!(scan[0], (1..=rank as u64).sum::<u64>());
            assert_eq!(max, vec![3.0]);
        }
    }

    #[test]
    fn empty_payloads_skip_the_data_phase() {
        let out = run_group(2, |c| {
            let sends = vec![Vec::new(); 2];
            exchange(&c, sends).unwrap()
        });
        assert!(out.iter().all(|r| r.iter().all(Vec::is_empty)));
    }
}
