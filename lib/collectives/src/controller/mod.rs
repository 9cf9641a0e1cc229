// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Negotiator.
//!
//! Every cycle each rank reports its ready requests to the coordinator (global rank 0),
//! which tallies them per name. A name is scheduled once every rank has reported it;
//! the coordinator validates the metadata, orders and fuses the ready names and
//! broadcasts the resulting [`Plan`]. Non-coordinator ranks never decide order.
//!
//! Message bound: a rank reports each request exactly once, in the first full round
//! after it became ready. With the plan cache enabled every cycle starts with a cache
//! round in which each rank sends a single 64-bit signature of its pending set; the
//! full round only runs when the coordinator answers [`CacheDecision::Miss`].

mod planner;
mod stall;
mod table;

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::time::Instant;

pub use planner::Planner;
pub use stall::StallInspector;
pub use table::{MessageTable, PartialName, ReadyName, validate};

use crate::cache::{PlanCache, ready_set_signature};
use crate::config::StallCheckConfig;
use crate::message::{self, CacheDecision, CacheQuery, Plan, Request, RequestList};
use crate::state::Parameters;
use crate::timeline::Timeline;
use crate::transport::{Communicator, Topology, TransportError};

/// Rank-side negotiation state; on the coordinator it also owns the tally.
pub struct Controller {
    topology: Topology,
    planner: Planner,
    cache: PlanCache,
    /// Ready requests not yet executed, by name.
    pending: BTreeMap<String, Request>,
    /// Pending names already reported to the coordinator.
    sent: HashSet<String>,
    /// Coordinator only.
    table: MessageTable,
    stall: Option<StallInspector>,
}

impl Controller {
    pub fn new(topology: Topology, parameters: &Parameters, stall_check: &StallCheckConfig) -> Self {
        let stall = (topology.is_coordinator() && stall_check.enabled)
            .then(|| StallInspector::new(stall_check.warning_time()));
        Self {
            topology,
            planner: Planner::new(topology.size, parameters.fusion_threshold_bytes),
            cache: PlanCache::new(parameters.cache_capacity),
            pending: BTreeMap::new(),
            sent: HashSet::new(),
            table: MessageTable::new(topology.size),
            stall,
        }
    }

    /// Hand over a request whose input is ready.
    pub fn push_ready(&mut self, request: Request) {
        self.pending.insert(request.name.clone(), request);
    }

    pub fn cache(&self) -> &PlanCache {
        &self.cache
    }

    /// Run one negotiation cycle over `comm`. Every rank must call this once per cycle.
    pub fn negotiate(
        &mut self,
        comm: &dyn Communicator,
        shutdown: bool,
        timeline: &mut Timeline,
    ) -> Result<Plan, TransportError> {
        if self.cache.is_enabled() {
            match self.cache_round(comm, shutdown, timeline)? {
                CacheDecision::Hit(signature) => {
                    let plan = self.cache.get(signature).ok_or_else(|| {
                        TransportError::Codec(format!(
                            "plan {signature:#x} missing from this rank's cache"
                        ))
                    })?;
                    tracing::trace!(signature, batches = plan.batches.len(), "plan cache hit");
                    self.retire(&plan);
                    return Ok(plan);
                }
                CacheDecision::Idle => return Ok(Plan::default()),
                CacheDecision::Miss => {}
            }
        }
        self.full_round(comm, shutdown, timeline)
    }

    fn cache_round(
        &mut self,
        comm: &dyn Communicator,
        shutdown: bool,
        timeline: &mut Timeline,
    ) -> Result<CacheDecision, TransportError> {
        let query = CacheQuery {
            signature: ready_set_signature(self.pending.values()),
            shutdown,
        };
        let gathered = comm.gather(message::encode(&query)?)?;
        let reply = match gathered {
            Some(all) => {
                let queries = all
                    .iter()
                    .map(|b| message::decode::<CacheQuery>(b))
                    .collect::<Result<Vec<_>, _>>()?;
                Some(message::encode(&self.decide(&queries, timeline))?)
            }
            None => None,
        };
        message::decode(&comm.broadcast_bytes(reply)?)
    }

    fn decide(&mut self, queries: &[CacheQuery], timeline: &mut Timeline) -> CacheDecision {
        if queries.iter().any(|q| q.shutdown) {
            return CacheDecision::Miss;
        }
        if queries.iter().all(|q| q.signature.is_none()) {
            return CacheDecision::Idle;
        }
        let Some(signature) = queries[0].signature else {
            return CacheDecision::Miss;
        };
        if queries.iter().any(|q| q.signature != Some(signature)) {
            return CacheDecision::Miss;
        }
        let Some(plan) = self.cache.peek(signature) else {
            return CacheDecision::Miss;
        };
        let planned: BTreeSet<&str> = plan.names().collect();
        let pending: BTreeSet<&str> = self.pending.keys().map(String::as_str).collect();
        if planned != pending {
            return CacheDecision::Miss;
        }

        // names partly tallied in an earlier full round close their negotiation here
        for name in &planned {
            if self.table.remove(name) {
                timeline.end(name, None);
            }
        }
        CacheDecision::Hit(signature)
    }

    fn full_round(
        &mut self,
        comm: &dyn Communicator,
        shutdown: bool,
        timeline: &mut Timeline,
    ) -> Result<Plan, TransportError> {
        let requests: Vec<Request> = self
            .pending
            .values()
            .filter(|r| !self.sent.contains(&r.name))
            .cloned()
            .collect();
        self.sent.extend(requests.iter().map(|r| r.name.clone()));

        let list = RequestList { requests, shutdown };
        let gathered = comm.gather(message::encode(&list)?)?;
        let reply = match gathered {
            Some(all) => Some(message::encode(&self.coordinate(&all, timeline)?)?),
            None => None,
        };
        let plan: Plan = message::decode(&comm.broadcast_bytes(reply)?)?;

        if plan.cacheable {
            let signature = ready_set_signature(plan.names().filter_map(|n| self.pending.get(n)));
            if let Some(signature) = signature {
                self.cache.put(
                    signature,
                    Plan {
                        shutdown: false,
                        ..plan.clone()
                    },
                );
            }
        }
        self.retire(&plan);
        Ok(plan)
    }

    /// Coordinator: fold every rank's report into the tally and build the plan.
    fn coordinate(
        &mut self,
        reports: &[bytes::Bytes],
        timeline: &mut Timeline,
    ) -> Result<Plan, TransportError> {
        let mut shutdown = false;
        for (rank, bytes) in reports.iter().enumerate() {
            let list: RequestList = message::decode(bytes)?;
            shutdown |= list.shutdown;
            for mut request in list.requests {
                request.rank = rank;
                let name = request.name.clone();
                let kind = request.kind;
                let count = self.table.add(request);
                if count == 1 {
                    timeline.start(&name, &format!("NEGOTIATE_{kind}"));
                }
                if count > 0 {
                    timeline.instant(&name, &rank.to_string());
                }
                if count == self.topology.size {
                    timeline.end(&name, None);
                }
            }
        }

        if let Some(stall) = self.stall.as_mut() {
            stall.check(&self.table, Instant::now());
        }

        let plan = self.planner.plan(self.table.take_ready(), shutdown);
        if !plan.is_empty() || plan.shutdown {
            tracing::debug!(
                batches = plan.batches.len(),
                names = plan.names().count(),
                cacheable = plan.cacheable,
                shutdown = plan.shutdown,
                "negotiated plan"
            );
        }
        Ok(plan)
    }

    fn retire(&mut self, plan: &Plan) {
        for name in plan.names() {
            self.pending.remove(name);
            self.sent.remove(name);
        }
    }
}
