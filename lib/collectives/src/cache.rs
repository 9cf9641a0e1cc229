// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Plan cache.
//!
//! Steady-state training submits the same set of operations every step. Once a plan
//! for a ready set has been negotiated, later cycles that find exactly that set
//! pending on every rank reuse it and skip the full request exchange.
//!
//! Every rank holds its own cache. Inserts happen after the same full rounds and
//! lookups after the same cache rounds on every rank, so the caches stay identical
//! without being exchanged.

use std::num::NonZeroUsize;

use lru::LruCache;
use xxhash_rust::xxh3::Xxh3;

use crate::message::{Plan, Request};

/// Order-independent digest of a set of requests, ignoring the reporting rank and
/// the device index. Ranks that each drive their own GPU produce the same digest.
///
/// Returns `None` for an empty set.
pub fn ready_set_signature<'a>(requests: impl IntoIterator<Item = &'a Request>) -> Option<u64> {
    let mut sorted: Vec<&Request> = requests.into_iter().collect();
    if sorted.is_empty() {
        return None;
    }
    sorted.sort_by(|a, b| a.name.cmp(&b.name));

    let mut hasher = Xxh3::new();
    for r in sorted {
        hasher.update(&(r.name.len() as u64).to_le_bytes());
        hasher.update(r.name.as_bytes());
        hasher.update(&[r.kind as u8, r.dtype as u8, r.device.is_gpu() as u8]);
        hasher.update(&(r.shape.len() as u64).to_le_bytes());
        for dim in &r.shape {
            hasher.update(&(*dim as u64).to_le_bytes());
        }
        match r.root_rank {
            None => hasher.update(&[0]),
            Some(root) => {
                hasher.update(&[1]);
                hasher.update(&(root as u64).to_le_bytes());
            }
        }
    }
    Some(hasher.digest())
}

/// Bounded LRU map from ready-set signature to negotiated plan.
pub struct PlanCache {
    plans: Option<LruCache<u64, Plan>>,
    hits: u64,
}

impl PlanCache {
    /// A capacity of zero disables the cache.
    pub fn new(capacity: usize) -> Self {
        Self {
            plans: NonZeroUsize::new(capacity).map(LruCache::new),
            hits: 0,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.plans.is_some()
    }

    pub fn len(&self) -> usize {
        self.plans.as_ref().map_or(0, LruCache::len)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Look up without touching recency.
    pub fn peek(&self, signature: u64) -> Option<&Plan> {
        self.plans.as_ref()?.peek(&signature)
    }

    /// Plans served by [`PlanCache::get`] so far.
    pub fn hits(&self) -> u64 {
        self.hits
    }

    /// Look up and mark as most recently used.
    pub fn get(&mut self, signature: u64) -> Option<Plan> {
        let plan = self.plans.as_mut()?.get(&signature).cloned()?;
        self.hits += 1;
        Some(plan)
    }

    pub fn put(&mut self, signature: u64, plan: Plan) {
        let Some(plans) = self.plans.as_mut() else {
            return;
        };
        if let Some((evicted, _)) = plans.push(signature, plan) {
            if evicted != signature {
                tracing::trace!(signature = evicted, "evicted cached plan");
            }
        }
    }
}
