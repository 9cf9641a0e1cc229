// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Transport contract consumed by the coordination loop and the built-in strategies.
//!
//! The engine never implements wire protocols itself. Everything it needs from a
//! communication library is expressed by [`Communicator`]: two byte-level primitives
//! used for negotiation (`gather` to the coordinator and `broadcast_bytes` from it) and
//! the numeric collectives used by the execution strategies.
//!
//! A process participates in three groups, bundled in a [`CommunicatorSet`]:
//! - `global`: every rank in the job,
//! - `local`: the ranks sharing this node,
//! - `cross`: the ranks with the same local rank on every node.
//!
//! All methods are called from the coordination loop thread only, so implementations
//! need to be `Send` but not `Sync`.

pub mod local;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::tensor::DataType;

pub use local::LocalCluster;

/// Errors raised by a [`Communicator`].
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// The peer hung up; its communicator was dropped or its process exited.
    #[error("peer {peer} disconnected")]
    Disconnected { peer: usize },

    /// No message arrived from the peer within the configured bound.
    #[error("timed out waiting for peer {peer}")]
    Timeout { peer: usize },

    /// The peer index is outside the group.
    #[error("invalid peer {0}")]
    InvalidPeer(usize),

    /// A message could not be encoded, decoded or did not have the expected length.
    #[error("codec error: {0}")]
    Codec(String),

    /// The primitive does not support the requested data type or argument.
    #[error("unsupported: {0}")]
    Unsupported(String),
}

/// Collective primitives over one group of ranks.
///
/// Every member of the group must invoke the same sequence of calls with compatible
/// arguments. Rank 0 of the group is the root of `gather` and `broadcast_bytes`.
pub trait Communicator: Send {
    /// This process's index within the group.
    fn rank(&self) -> usize;

    /// Number of members in the group.
    fn size(&self) -> usize;

    /// Send `payload` to rank 0. Rank 0 receives every member's payload in rank order;
    /// all other ranks receive `None`.
    fn gather(&self, payload: Bytes) -> Result<Option<Vec<Bytes>>, TransportError>;

    /// Rank 0 supplies `Some(payload)`; every member returns that payload.
    fn broadcast_bytes(&self, payload: Option<Bytes>) -> Result<Bytes, TransportError>;

    /// Returns once every member has entered the barrier.
    fn barrier(&self) -> Result<(), TransportError>;

    /// Element-wise sum of `buffer` across the group, in place.
    fn allreduce(&self, buffer: &mut [u8], dtype: DataType) -> Result<(), TransportError>;

    /// Concatenate every member's `input` in rank order. `counts[r]` is the number of
    /// bytes contributed by rank `r`.
    fn allgatherv(&self, input: &[u8], counts: &[usize]) -> Result<Vec<u8>, TransportError>;

    /// Replace `buffer` on every member with the contents of `root`'s buffer.
    fn broadcast(&self, buffer: &mut [u8], root: usize) -> Result<(), TransportError>;
}

/// Rank layout of the job as seen from one process.
///
/// `homogeneous` and `node_major` are global facts; they are filled in by the
/// initialization handshake and are `false` until then.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Topology {
    pub rank: usize,
    pub size: usize,
    pub local_rank: usize,
    pub local_size: usize,
    pub cross_rank: usize,
    pub cross_size: usize,

    /// Every node runs the same number of ranks.
    pub homogeneous: bool,

    /// Global ranks are numbered node by node: `rank == cross_rank * local_size + local_rank`.
    pub node_major: bool,
}

impl Topology {
    pub fn is_multi_node(&self) -> bool {
        self.size != self.local_size
    }

    /// Is this rank the negotiation coordinator?
    pub fn is_coordinator(&self) -> bool {
        self.rank == 0
    }
}

/// The three communicators of one rank.
pub struct CommunicatorSet {
    pub global: Box<dyn Communicator>,
    pub local: Box<dyn Communicator>,
    pub cross: Box<dyn Communicator>,
}

impl CommunicatorSet {
    pub fn new(
        global: Box<dyn Communicator>,
        local: Box<dyn Communicator>,
        cross: Box<dyn Communicator>,
    ) -> Self {
        Self {
            global,
            local,
            cross,
        }
    }

    /// Topology derived from the communicators alone. Global facts are left unset.
    pub fn topology(&self) -> Topology {
        Topology {
            rank: self.global.rank(),
            size: self.global.size(),
            local_rank: self.local.rank(),
            local_size: self.local.size(),
            cross_rank: self.cross.rank(),
            cross_size: self.cross.size(),
            homogeneous: false,
            node_major: false,
        }
    }
}

impl std::fmt::Debug for CommunicatorSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommunicatorSet")
            .field("topology", &self.topology())
            .finish()
    }
}

/// Byte ranges `[start, end)` splitting `elements` elements of `elem_size` bytes into
/// `parts` shards. The remainder is spread over the first shards.
pub(crate) fn shard_ranges(elements: usize, elem_size: usize, parts: usize) -> Vec<(usize, usize)> {
    let parts = parts.max(1);
    let base = elements / parts;
    let extra = elements % parts;
    let mut ranges = Vec::with_capacity(parts);
    let mut start = 0;
    for i in 0..parts {
        let len = (base + usize::from(i < extra)) * elem_size;
        ranges.push((start, start + len));
        start += len;
    }
    ranges
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::even(8, 4, 4, vec![(0, 8), (8, 16), (16, 24), (24, 32)])]
    #[case::remainder(10, 4, 4, vec![(0, 12), (12, 24), (24, 32), (32, 40)])]
    #[case::fewer_elements_than_parts(2, 8, 3, vec![(0, 8), (8, 16), (16, 16)])]
    #[case::single(5, 1, 1, vec![(0, 5)])]
    fn test_shard_ranges(
        #[case] elements: usize,
        #[case] elem_size: usize,
        #[case] parts: usize,
        #[case] expected: Vec<(usize, usize)>,
    ) {
        assert_eq!(shard_ranges(elements, elem_size, parts), expected);
    }

    #[test]
    fn test_topology_from_local_cluster() {
        let sets = LocalCluster::new(2, 3).unwrap();
        let topo = sets[4].topology();
        assert_eq!(topo.rank, 4);
        assert_eq!(topo.size, 6);
        assert_eq!(topo.local_rank, 1);
        assert_eq!(topo.local_size, 3);
        assert_eq!(topo.cross_rank, 1);
        assert_eq!(topo.cross_size, 2);
        assert!(topo.is_multi_node());
        assert!(!topo.is_coordinator());
    }
}
