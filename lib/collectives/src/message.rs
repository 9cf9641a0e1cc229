// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Negotiation messages.
//!
//! Requests travel from every rank to the coordinator, plans travel back. All
//! messages are MessagePack encoded with `rmp-serde`.

use bytes::Bytes;
use serde::{Deserialize, Serialize, de::DeserializeOwned};

use crate::tensor::{DataType, Device};
use crate::transport::TransportError;

/// Collective kind of a request or batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum OpKind {
    /// Element-wise sum across ranks.
    Reduce,
    /// Concatenation along the first dimension, in rank order.
    Gather,
    /// Copy of the root rank's tensor.
    Broadcast,
    /// Members are resolved with a negotiation error instead of being executed.
    Error,
}

impl OpKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OpKind::Reduce => "REDUCE",
            OpKind::Gather => "GATHER",
            OpKind::Broadcast => "BROADCAST",
            OpKind::Error => "ERROR",
        }
    }
}

impl std::fmt::Display for OpKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Metadata of one submitted operation, as reported by one rank.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Request {
    pub name: String,
    pub kind: OpKind,
    pub rank: usize,
    pub dtype: DataType,
    pub shape: Vec<usize>,
    pub device: Device,
    pub root_rank: Option<usize>,
}

impl Request {
    pub fn numel(&self) -> usize {
        self.shape.iter().product()
    }

    pub fn size_bytes(&self) -> usize {
        self.numel() * self.dtype.size()
    }

    /// Describes the same collective as `other`. The reporting rank and the
    /// device index are ignored; only the device class has to agree.
    pub fn same_operation(&self, other: &Request) -> bool {
        self.name == other.name
            && self.kind == other.kind
            && self.dtype == other.dtype
            && self.shape == other.shape
            && self.device.is_gpu() == other.device.is_gpu()
            && self.root_rank == other.root_rank
    }
}

/// What one rank sends to the coordinator in a full negotiation round.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RequestList {
    /// Requests this rank has not reported before.
    pub requests: Vec<Request>,
    /// This rank asks the job to shut down.
    pub shutdown: bool,
}

/// Operations executed together with one strategy call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Batch {
    pub kind: OpKind,
    pub names: Vec<String>,
    pub dtype: DataType,
    pub root_rank: Option<usize>,
    /// Gather only: first dimension contributed by each rank.
    #[serde(default)]
    pub gather_dims: Vec<usize>,
    /// Error only: why negotiation failed.
    #[serde(default)]
    pub error: Option<String>,
}

impl Batch {
    pub fn error(name: impl Into<String>, dtype: DataType, reason: impl Into<String>) -> Self {
        Self {
            kind: OpKind::Error,
            names: vec![name.into()],
            dtype,
            root_rank: None,
            gather_dims: Vec::new(),
            error: Some(reason.into()),
        }
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

/// Ordered work for one cycle; identical on every rank.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    pub batches: Vec<Batch>,
    /// Some rank requested shutdown; the loop drains after executing the batches.
    pub shutdown: bool,
    /// Every rank reported identical metadata and no batch is an error, so the plan
    /// may be memoized.
    pub cacheable: bool,
}

impl Plan {
    pub fn is_empty(&self) -> bool {
        self.batches.is_empty()
    }

    /// Names in execution order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.batches
            .iter()
            .flat_map(|b| b.names.iter().map(String::as_str))
    }
}

/// What one rank sends to the coordinator in the lightweight cache round.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheQuery {
    /// Signature of every ready request pending on this rank, `None` when nothing is pending.
    pub signature: Option<u64>,
    pub shutdown: bool,
}

/// The coordinator's answer to a cache round.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CacheDecision {
    /// Every rank has exactly the ready set memoized under this key; execute the cached plan.
    Hit(u64),
    /// Run the full negotiation round.
    Miss,
    /// Nothing is pending anywhere; skip the full round.
    Idle,
}

pub fn encode<T: Serialize>(value: &T) -> Result<Bytes, TransportError> {
    rmp_serde::to_vec(value)
        .map(Bytes::from)
        .map_err(|e| TransportError::Codec(e.to_string()))
}

pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, TransportError> {
    rmp_serde::from_slice(bytes).map_err(|e| TransportError::Codec(e.to_string()))
}
