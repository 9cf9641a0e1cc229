// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! In-process reference fabric.
//!
//! Every group is a full mesh of unbounded `flume` channels, one per ordered pair of
//! members. Messages between two members are delivered in order, so collectives need
//! no tags as long as every member issues the same sequence of calls.
//!
//! Reductions gather every member's buffer and sum in rank order, which makes the
//! result bit-identical on every member.

use std::collections::BTreeMap;
use std::time::Duration;

use bytes::Bytes;
use flume::{Receiver, RecvTimeoutError, Sender};
use half::{bf16, f16};

use super::{Communicator, CommunicatorSet, TransportError};
use crate::tensor::DataType;

/// Builds the communicators of a simulated multi-node job inside one process.
///
/// ```rust,ignore
/// let ranks = LocalCluster::new(2, 4)?; // 2 nodes x 4 ranks
/// for (rank, comms) in ranks.into_iter().enumerate() {
///     std::thread::spawn(move || run_rank(rank, comms));
/// }
/// ```
pub struct LocalCluster;

impl LocalCluster {
    /// `nodes` nodes with `ranks_per_node` ranks each, numbered node by node.
    pub fn new(
        nodes: usize,
        ranks_per_node: usize,
    ) -> Result<Vec<CommunicatorSet>, TransportError> {
        Self::build(node_major_layout(nodes, ranks_per_node), None)
    }

    /// Like [`LocalCluster::new`], but every receive gives up after `timeout`.
    pub fn with_timeout(
        nodes: usize,
        ranks_per_node: usize,
        timeout: Duration,
    ) -> Result<Vec<CommunicatorSet>, TransportError> {
        Self::build(node_major_layout(nodes, ranks_per_node), Some(timeout))
    }

    /// Round-robin placement: global rank `r` lives on node `r % nodes`.
    pub fn interleaved(
        nodes: usize,
        ranks_per_node: usize,
    ) -> Result<Vec<CommunicatorSet>, TransportError> {
        if nodes == 0 || ranks_per_node == 0 {
            return Err(empty_cluster());
        }
        let layout = (0..nodes * ranks_per_node).map(|r| r % nodes).collect();
        Self::build(layout, None)
    }

    /// Arbitrary placement: `node_of_rank[r]` is the node hosting global rank `r`.
    /// Nodes may host different numbers of ranks.
    pub fn from_layout(
        node_of_rank: Vec<usize>,
        timeout: Option<Duration>,
    ) -> Result<Vec<CommunicatorSet>, TransportError> {
        Self::build(node_of_rank, timeout)
    }

    fn build(
        node_of_rank: Vec<usize>,
        timeout: Option<Duration>,
    ) -> Result<Vec<CommunicatorSet>, TransportError> {
        if node_of_rank.is_empty() {
            return Err(empty_cluster());
        }
        let size = node_of_rank.len();

        // members of each node, in global rank order
        let mut nodes: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
        for (rank, node) in node_of_rank.iter().enumerate() {
            nodes.entry(*node).or_default().push(rank);
        }

        let mut local_rank = vec![0; size];
        for members in nodes.values() {
            for (i, rank) in members.iter().enumerate() {
                local_rank[*rank] = i;
            }
        }

        // ranks sharing a local rank form one cross group
        let mut cross_groups: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
        for (rank, lr) in local_rank.iter().enumerate() {
            cross_groups.entry(*lr).or_default().push(rank);
        }

        let mut global: Vec<Option<LocalCommunicator>> =
            mesh(size, timeout).into_iter().map(Some).collect();
        let mut local: Vec<Option<LocalCommunicator>> = (0..size).map(|_| None).collect();
        let mut cross: Vec<Option<LocalCommunicator>> = (0..size).map(|_| None).collect();

        for members in nodes.values() {
            for (comm, rank) in mesh(members.len(), timeout).into_iter().zip(members) {
                local[*rank] = Some(comm);
            }
        }
        for members in cross_groups.values() {
            for (comm, rank) in mesh(members.len(), timeout).into_iter().zip(members) {
                cross[*rank] = Some(comm);
            }
        }

        let mut sets = Vec::with_capacity(size);
        for rank in 0..size {
            match (global[rank].take(), local[rank].take(), cross[rank].take()) {
                (Some(g), Some(l), Some(c)) => {
                    sets.push(CommunicatorSet::new(Box::new(g), Box::new(l), Box::new(c)))
                }
                _ => return Err(TransportError::InvalidPeer(rank)),
            }
        }
        Ok(sets)
    }
}

fn node_major_layout(nodes: usize, ranks_per_node: usize) -> Vec<usize> {
    (0..nodes * ranks_per_node)
        .map(|r| r / ranks_per_node.max(1))
        .collect()
}

fn empty_cluster() -> TransportError {
    TransportError::Unsupported("a cluster needs at least one rank".to_string())
}

fn mesh(size: usize, timeout: Option<Duration>) -> Vec<LocalCommunicator> {
    let mut senders: Vec<Vec<Sender<Bytes>>> =
        (0..size).map(|_| Vec::with_capacity(size)).collect();
    let mut receivers: Vec<Vec<Receiver<Bytes>>> =
        (0..size).map(|_| Vec::with_capacity(size)).collect();

    for from in 0..size {
        for to_receivers in receivers.iter_mut() {
            let (tx, rx) = flume::unbounded();
            senders[from].push(tx);
            to_receivers.push(rx);
        }
    }

    senders
        .into_iter()
        .zip(receivers)
        .enumerate()
        .map(|(rank, (senders, receivers))| LocalCommunicator {
            rank,
            senders,
            receivers,
            timeout,
        })
        .collect()
}

/// One member of an in-process group.
pub struct LocalCommunicator {
    rank: usize,
    /// `senders[p]` delivers to peer `p`
    senders: Vec<Sender<Bytes>>,
    /// `receivers[p]` yields messages sent by peer `p`
    receivers: Vec<Receiver<Bytes>>,
    timeout: Option<Duration>,
}

impl LocalCommunicator {
    fn send(&self, peer: usize, payload: Bytes) -> Result<(), TransportError> {
        self.senders
            .get(peer)
            .ok_or(TransportError::InvalidPeer(peer))?
            .send(payload)
            .map_err(|_| TransportError::Disconnected { peer })
    }

    fn recv(&self, peer: usize) -> Result<Bytes, TransportError> {
        let rx = self
            .receivers
            .get(peer)
            .ok_or(TransportError::InvalidPeer(peer))?;
        match self.timeout {
            Some(timeout) => rx.recv_timeout(timeout).map_err(|e| match e {
                RecvTimeoutError::Timeout => TransportError::Timeout { peer },
                RecvTimeoutError::Disconnected => TransportError::Disconnected { peer },
            }),
            None => rx.recv().map_err(|_| TransportError::Disconnected { peer }),
        }
    }

    /// Every member's payload, indexed by rank.
    fn exchange(&self, payload: Bytes) -> Result<Vec<Bytes>, TransportError> {
        let size = self.size();
        for peer in (0..size).filter(|p| *p != self.rank) {
            self.send(peer, payload.clone())?;
        }
        let mut all = Vec::with_capacity(size);
        for peer in 0..size {
            if peer == self.rank {
                all.push(payload.clone());
            } else {
                all.push(self.recv(peer)?);
            }
        }
        Ok(all)
    }
}

impl Communicator for LocalCommunicator {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.senders.len()
    }

    fn gather(&self, payload: Bytes) -> Result<Option<Vec<Bytes>>, TransportError> {
        if self.rank != 0 {
            self.send(0, payload)?;
            return Ok(None);
        }
        let mut all = Vec::with_capacity(self.size());
        all.push(payload);
        for peer in 1..self.size() {
            all.push(self.recv(peer)?);
        }
        Ok(Some(all))
    }

    fn broadcast_bytes(&self, payload: Option<Bytes>) -> Result<Bytes, TransportError> {
        if self.rank != 0 {
            return self.recv(0);
        }
        let payload = payload
            .ok_or_else(|| TransportError::Codec("root must supply a payload".to_string()))?;
        for peer in 1..self.size() {
            self.send(peer, payload.clone())?;
        }
        Ok(payload)
    }

    fn barrier(&self) -> Result<(), TransportError> {
        self.gather(Bytes::new())?;
        self.broadcast_bytes(Some(Bytes::new()))?;
        Ok(())
    }

    fn allreduce(&self, buffer: &mut [u8], dtype: DataType) -> Result<(), TransportError> {
        if buffer.len() % dtype.size() != 0 {
            return Err(TransportError::Codec(format!(
                "{} bytes is not a whole number of {} elements",
                buffer.len(),
                dtype.name()
            )));
        }

        let all = self.exchange(Bytes::copy_from_slice(buffer))?;
        for (peer, part) in all.iter().enumerate() {
            if part.len() != buffer.len() {
                return Err(TransportError::Codec(format!(
                    "peer {peer} contributed {} bytes, expected {}",
                    part.len(),
                    buffer.len()
                )));
            }
        }

        let mut acc = all[0].to_vec();
        for part in &all[1..] {
            sum_into(&mut acc, part, dtype);
        }
        buffer.copy_from_slice(&acc);
        Ok(())
    }

    fn allgatherv(&self, input: &[u8], counts: &[usize]) -> Result<Vec<u8>, TransportError> {
        if counts.len() != self.size() {
            return Err(TransportError::Codec(format!(
                "{} counts for a group of {}",
                counts.len(),
                self.size()
            )));
        }
        if input.len() != counts[self.rank] {
            return Err(TransportError::Codec(format!(
                "input is {} bytes, count says {}",
                input.len(),
                counts[self.rank]
            )));
        }

        let all = self.exchange(Bytes::copy_from_slice(input))?;
        let mut output = Vec::with_capacity(counts.iter().sum());
        for (peer, part) in all.iter().enumerate() {
            if part.len() != counts[peer] {
                return Err(TransportError::Codec(format!(
                    "peer {peer} contributed {} bytes, expected {}",
                    part.len(),
                    counts[peer]
                )));
            }
            output.extend_from_slice(part);
        }
        Ok(output)
    }

    fn broadcast(&self, buffer: &mut [u8], root: usize) -> Result<(), TransportError> {
        if root >= self.size() {
            return Err(TransportError::InvalidPeer(root));
        }
        if self.rank == root {
            let payload = Bytes::copy_from_slice(buffer);
            for peer in (0..self.size()).filter(|p| *p != root) {
                self.send(peer, payload.clone())?;
            }
            return Ok(());
        }
        let payload = self.recv(root)?;
        if payload.len() != buffer.len() {
            return Err(TransportError::Codec(format!(
                "root sent {} bytes, expected {}",
                payload.len(),
                buffer.len()
            )));
        }
        buffer.copy_from_slice(&payload);
        Ok(())
    }
}

macro_rules! sum_as {
    ($t:ty, $dst:expr, $src:expr, $add:expr) => {{
        const N: usize = std::mem::size_of::<$t>();
        for (d, s) in $dst.chunks_exact_mut(N).zip($src.chunks_exact(N)) {
            let mut a = [0u8; N];
            let mut b = [0u8; N];
            a.copy_from_slice(d);
            b.copy_from_slice(s);
            let v: $t = ($add)(<$t>::from_le_bytes(a), <$t>::from_le_bytes(b));
            d.copy_from_slice(&v.to_le_bytes());
        }
    }};
}

fn sum_into(dst: &mut [u8], src: &[u8], dtype: DataType) {
    match dtype {
        DataType::U8 => sum_as!(u8, dst, src, u8::wrapping_add),
        DataType::I8 => sum_as!(i8, dst, src, i8::wrapping_add),
        DataType::I32 => sum_as!(i32, dst, src, i32::wrapping_add),
        DataType::I64 => sum_as!(i64, dst, src, i64::wrapping_add),
        DataType::F16 => sum_as!(f16, dst, src, |a: f16, b: f16| a + b),
        DataType::BF16 => sum_as!(bf16, dst, src, |a: bf16, b: bf16| a + b),
        DataType::F32 => sum_as!(f32, dst, src, |a: f32, b: f32| a + b),
        DataType::F64 => sum_as!(f64, dst, src, |a: f64, b: f64| a + b),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::Element;
    use std::thread;

    /// Run `f` on every rank's communicator set on its own thread, returning results by rank.
    fn on_every_rank<T, F>(sets: Vec<CommunicatorSet>, f: F) -> Vec<T>
    where
        T: Send + 'static,
        F: Fn(CommunicatorSet) -> T + Send + Sync + Clone + 'static,
    {
        let handles: Vec<_> = sets
            .into_iter()
            .map(|set| {
                let f = f.clone();
                thread::spawn(move || f(set))
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    }

    fn to_bytes<T: Element>(values: &[T]) -> Vec<u8> {
        let mut out = Vec::new();
        for v in values {
            v.write_le(&mut out);
        }
        out
    }

    #[test]
    fn test_allreduce_f32_is_identical_everywhere() {
        let sets = LocalCluster::new(1, 4).unwrap();
        let results = on_every_rank(sets, |set| {
            let rank = set.global.rank() as f32;
            let mut buf = to_bytes(&[rank, 0.1 * rank, 1.0]);
            set.global.allreduce(&mut buf, DataType::F32).unwrap();
            buf
        });
        for r in &results[1..] {
            assert_eq!(r, &results[0]);
        }
        assert_eq!(&results[0][..4], &6.0f32.to_le_bytes());
        assert_eq!(&results[0][8..], &4.0f32.to_le_bytes());
    }

    #[test]
    fn test_allreduce_sums_half_precision() {
        let sets = LocalCluster::new(1, 2).unwrap();
        let results = on_every_rank(sets, |set| {
            let mut buf = Vec::new();
            f16::from_f32(1.5).write_le(&mut buf);
            bf16::from_f32(2.0).write_le(&mut buf);
            set.global.allreduce(&mut buf[..2], DataType::F16).unwrap();
            set.global.allreduce(&mut buf[2..], DataType::BF16).unwrap();
            (f16::read_le(&buf[..2]), bf16::read_le(&buf[2..]))
        });
        for (h, b) in results {
            assert_eq!(h, f16::from_f32(3.0));
            assert_eq!(b, bf16::from_f32(4.0));
        }
    }

    #[test]
    fn test_allreduce_rejects_ragged_buffer() {
        let sets = LocalCluster::new(1, 1).unwrap();
        let mut buf = vec![0u8; 3];
        let err = sets[0]
            .global
            .allreduce(&mut buf, DataType::F16)
            .unwrap_err();
        assert!(matches!(err, TransportError::Codec(_)));
    }

    #[test]
    fn test_allgatherv_concatenates_in_rank_order() {
        let sets = LocalCluster::new(1, 3).unwrap();
        let results = on_every_rank(sets, |set| {
            let rank = set.global.rank();
            let input = vec![rank as u8; rank + 1];
            set.global.allgatherv(&input, &[1, 2, 3]).unwrap()
        });
        for r in results {
            assert_eq!(r, vec![0, 1, 1, 2, 2, 2]);
        }
    }

    #[test]
    fn test_broadcast_from_non_zero_root() {
        let sets = LocalCluster::new(2, 2).unwrap();
        let results = on_every_rank(sets, |set| {
            let mut buf = vec![set.global.rank() as u8; 4];
            set.global.broadcast(&mut buf, 2).unwrap();
            buf
        });
        for r in results {
            assert_eq!(r, vec![2; 4]);
        }
    }

    #[test]
    fn test_gather_and_broadcast_bytes() {
        let sets = LocalCluster::new(1, 3).unwrap();
        let results = on_every_rank(sets, |set| {
            let rank = set.global.rank();
            let gathered = set
                .global
                .gather(Bytes::from(vec![rank as u8]))
                .unwrap();
            let reply = gathered.map(|all| Bytes::from(all.concat()));
            set.global.broadcast_bytes(reply).unwrap()
        });
        for r in results {
            assert_eq!(&r[..], &[0, 1, 2]);
        }
    }

    #[test]
    fn test_cross_groups_share_local_rank() {
        let sets = LocalCluster::new(3, 2).unwrap();
        let results = on_every_rank(sets, |set| {
            let mut buf = (set.global.rank() as i32).to_le_bytes().to_vec();
            set.cross.allreduce(&mut buf, DataType::I32).unwrap();
            (set.local.rank(), i32::from_le_bytes(buf.try_into().unwrap()))
        });
        // local rank 0: 0 + 2 + 4, local rank 1: 1 + 3 + 5
        for (local_rank, sum) in results {
            assert_eq!(sum, if local_rank == 0 { 6 } else { 9 });
        }
    }

    #[test]
    fn test_interleaved_layout() {
        let sets = LocalCluster::interleaved(2, 2).unwrap();
        let topo: Vec<_> = sets.iter().map(|s| s.topology()).collect();
        // ranks 0 and 2 share node 0
        assert_eq!(topo[0].cross_rank, 0);
        assert_eq!(topo[2].cross_rank, 0);
        assert_eq!(topo[2].local_rank, 1);
        assert_eq!(topo[1].cross_rank, 1);
    }

    #[test]
    fn test_dropped_peer_is_disconnected() {
        let mut sets = LocalCluster::new(1, 2).unwrap();
        let survivor = sets.remove(0);
        drop(sets);
        let err = survivor.global.barrier().unwrap_err();
        assert_eq!(err, TransportError::Disconnected { peer: 1 });
    }

    #[test]
    fn test_receive_timeout() {
        let sets = LocalCluster::with_timeout(1, 2, Duration::from_millis(20)).unwrap();
        let err = sets[0].global.gather(Bytes::new()).unwrap_err();
        assert_eq!(err, TransportError::Timeout { peer: 1 });
    }

    #[test]
    fn test_empty_cluster_is_rejected() {
        assert!(LocalCluster::new(0, 4).is_err());
    }
}
