// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Coordinator-side tally of reported requests.

use std::collections::HashMap;
use std::time::Instant;

use crate::message::{OpKind, Request};

struct TableEntry {
    /// Indexed by rank.
    requests: Vec<Option<Request>>,
    count: usize,
    first_seen: Instant,
}

/// A name every rank has reported.
#[derive(Debug, Clone)]
pub struct ReadyName {
    pub name: String,
    /// One request per rank, indexed by rank.
    pub requests: Vec<Request>,
}

/// A name some, but not all, ranks have reported.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartialName {
    pub name: String,
    pub first_seen: Instant,
    pub missing: Vec<usize>,
}

/// Per-name tally of how many ranks requested each operation.
pub struct MessageTable {
    size: usize,
    entries: HashMap<String, TableEntry>,
}

impl MessageTable {
    pub fn new(size: usize) -> Self {
        Self {
            size,
            entries: HashMap::new(),
        }
    }

    /// Record `request` and return the number of distinct ranks that have reported
    /// its name so far.
    pub fn add(&mut self, request: Request) -> usize {
        if request.rank >= self.size {
            tracing::warn!(name = %request.name, rank = request.rank, "dropping request from unknown rank");
            return 0;
        }
        let size = self.size;
        let entry = self
            .entries
            .entry(request.name.clone())
            .or_insert_with(|| TableEntry {
                requests: vec![None; size],
                count: 0,
                first_seen: Instant::now(),
            });
        let rank = request.rank;
        if entry.requests[rank].replace(request).is_none() {
            entry.count += 1;
        }
        entry.count
    }

    /// Remove every fully tallied name, sorted by name.
    pub fn take_ready(&mut self) -> Vec<ReadyName> {
        let mut names: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, e)| e.count == self.size)
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();

        names
            .into_iter()
            .filter_map(|name| {
                let entry = self.entries.remove(&name)?;
                let requests = entry.requests.into_iter().flatten().collect();
                Some(ReadyName { name, requests })
            })
            .collect()
    }

    /// Drop a partial tally. Returns whether `name` was being tallied.
    pub fn remove(&mut self, name: &str) -> bool {
        self.entries.remove(name).is_some()
    }

    /// Names still waiting on at least one rank.
    pub fn partial(&self) -> Vec<PartialName> {
        let mut partial: Vec<PartialName> = self
            .entries
            .iter()
            .filter(|(_, e)| e.count < self.size)
            .map(|(name, e)| PartialName {
                name: name.clone(),
                first_seen: e.first_seen,
                missing: e
                    .requests
                    .iter()
                    .enumerate()
                    .filter(|(_, r)| r.is_none())
                    .map(|(rank, _)| rank)
                    .collect(),
            })
            .collect();
        partial.sort_by(|a, b| a.name.cmp(&b.name));
        partial
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Check that every rank asked for the same operation. `requests` is indexed by rank.
///
/// Returns a human readable reason on mismatch.
pub fn validate(requests: &[Request], size: usize) -> Result<(), String> {
    let Some(first) = requests.first() else {
        return Err("no rank reported the operation".to_string());
    };

    for other in &requests[1..] {
        if other.kind != first.kind {
            return Err(format!(
                "mismatched operations: rank {} requested {}, rank {} requested {}",
                first.rank, first.kind, other.rank, other.kind
            ));
        }
        if other.dtype != first.dtype {
            return Err(format!(
                "mismatched data types: rank {} sent {}, rank {} sent {}",
                first.rank, first.dtype, other.rank, other.dtype
            ));
        }
        if other.device.is_gpu() != first.device.is_gpu() {
            return Err(format!(
                "mismatched devices: rank {} placed the tensor on {}, rank {} on {}",
                first.rank, first.device, other.rank, other.device
            ));
        }
    }

    match first.kind {
        OpKind::Reduce | OpKind::Broadcast => {
            for other in &requests[1..] {
                if other.shape != first.shape {
                    return Err(format!(
                        "mismatched shapes: rank {} sent {:?}, rank {} sent {:?}",
                        first.rank, first.shape, other.rank, other.shape
                    ));
                }
            }
        }
        OpKind::Gather => {
            if first.shape.is_empty() {
                return Err("a scalar cannot be gathered".to_string());
            }
            for other in &requests[1..] {
                if other.shape.len() != first.shape.len() {
                    return Err(format!(
                        "mismatched ranks: rank {} sent a {}-d tensor, rank {} a {}-d tensor",
                        first.rank,
                        first.shape.len(),
                        other.rank,
                        other.shape.len()
                    ));
                }
                if other.shape[1..] != first.shape[1..] {
                    return Err(format!(
                        "mismatched trailing dimensions: rank {} sent {:?}, rank {} sent {:?}",
                        first.rank, first.shape, other.rank, other.shape
                    ));
                }
            }
        }
        OpKind::Error => return Err("error operations cannot be submitted".to_string()),
    }

    if first.kind == OpKind::Broadcast {
        let Some(root) = first.root_rank else {
            return Err(format!("rank {} did not name a root rank", first.rank));
        };
        for other in &requests[1..] {
            if other.root_rank != first.root_rank {
                return Err(format!(
                    "mismatched root ranks: rank {} named {:?}, rank {} named {:?}",
                    first.rank, first.root_rank, other.rank, other.root_rank
                ));
            }
        }
        if root >= size {
            return Err(format!("root rank {root} is out of range for {size} ranks"));
        }
    }

    Ok(())
}
