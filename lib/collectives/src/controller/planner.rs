// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Turns the names that became ready in one cycle into an ordered [`Plan`].
//!
//! Names are visited in lexicographic order. Each valid reduce or broadcast opens a
//! batch and greedily pulls in later compatible names while the batch stays under
//! the fusion threshold. Gathers and errors always form batches of their own.

use crate::message::{Batch, OpKind, Plan};
use crate::tensor::{DataType, Device};

use super::table::{ReadyName, validate};

struct Candidate {
    name: String,
    kind: OpKind,
    dtype: DataType,
    root_rank: Option<usize>,
    /// Placement on each rank.
    devices: Vec<Device>,
    size_bytes: usize,
    gather_dims: Vec<usize>,
}

impl Candidate {
    fn from_ready(ready: ReadyName) -> Self {
        let first = &ready.requests[0];
        Self {
            kind: first.kind,
            dtype: first.dtype,
            root_rank: first.root_rank,
            size_bytes: first.size_bytes(),
            devices: ready.requests.iter().map(|r| r.device).collect(),
            gather_dims: ready
                .requests
                .iter()
                .map(|r| r.shape.first().copied().unwrap_or(0))
                .collect(),
            name: ready.name,
        }
    }

    fn fuses_with(&self, other: &Candidate) -> bool {
        matches!(self.kind, OpKind::Reduce | OpKind::Broadcast)
            && self.kind == other.kind
            && self.dtype == other.dtype
            && self.root_rank == other.root_rank
            && self.devices == other.devices
    }

    fn into_batch(self) -> Batch {
        Batch {
            kind: self.kind,
            names: vec![self.name],
            dtype: self.dtype,
            root_rank: self.root_rank,
            gather_dims: if self.kind == OpKind::Gather {
                self.gather_dims
            } else {
                Vec::new()
            },
            error: None,
        }
    }
}

enum Slot {
    Op(Candidate),
    Error(Batch),
}

pub struct Planner {
    size: usize,
    fusion_threshold: usize,
}

impl Planner {
    pub fn new(size: usize, fusion_threshold: usize) -> Self {
        Self {
            size,
            fusion_threshold,
        }
    }

    /// Build the plan for `ready`, which must be sorted by name.
    pub fn plan(&self, ready: Vec<ReadyName>, shutdown: bool) -> Plan {
        let mut cacheable = true;
        let mut slots: Vec<Option<Slot>> = Vec::with_capacity(ready.len());

        for name in ready {
            match validate(&name.requests, self.size) {
                Ok(()) => {
                    let first = &name.requests[0];
                    if !name.requests.iter().all(|r| r.same_operation(first)) {
                        cacheable = false;
                    }
                    slots.push(Some(Slot::Op(Candidate::from_ready(name))));
                }
                Err(reason) => {
                    tracing::warn!(name = %name.name, %reason, "negotiation mismatch");
                    cacheable = false;
                    let dtype = name.requests.first().map_or(DataType::U8, |r| r.dtype);
                    slots.push(Some(Slot::Error(Batch::error(name.name, dtype, reason))));
                }
            }
        }

        let mut batches = Vec::new();
        for i in 0..slots.len() {
            let Some(slot) = slots[i].take() else {
                continue;
            };
            let lead = match slot {
                Slot::Error(batch) => {
                    batches.push(batch);
                    continue;
                }
                Slot::Op(candidate) => candidate,
            };

            if lead.kind == OpKind::Gather || self.fusion_threshold == 0 {
                batches.push(lead.into_batch());
                continue;
            }

            let mut total = lead.size_bytes;
            let mut members = Vec::new();
            for later in slots.iter_mut().skip(i + 1) {
                let fits = matches!(
                    later,
                    Some(Slot::Op(c)) if lead.fuses_with(c) && total + c.size_bytes <= self.fusion_threshold
                );
                if !fits {
                    continue;
                }
                if let Some(Slot::Op(c)) = later.take() {
                    total += c.size_bytes;
                    members.push(c.name);
                }
            }

            let mut batch = lead.into_batch();
            batch.names.extend(members);
            batches.push(batch);
        }

        Plan {
            batches,
            shutdown,
            cacheable,
        }
    }
}
