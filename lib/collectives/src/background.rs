// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! The coordination loop.
//!
//! One dedicated thread per rank owns every communicator, the negotiation state, the
//! plan cache and the fusion buffers. Each cycle it
//!
//! 1. sleeps until `last_cycle_start + cycle_time`,
//! 2. moves newly submitted requests into staging and hands the ones whose input is
//!    ready to the negotiator,
//! 3. negotiates a plan with the other ranks,
//! 4. executes the plan's batches in order and resolves their entries.
//!
//! When a plan carries the shutdown flag the loop drains: every outstanding entry is
//! resolved with [`CollectiveError::ShutDown`] and the communicators are released.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::config::CollectivesConfig;
use crate::controller::Controller;
use crate::entry::TensorEntry;
use crate::error::{CollectiveError, Result};
use crate::fusion::{self, FUSION_ALIGNMENT_BYTES, FusionBufferManager};
use crate::message::{self, Batch, OpKind, Request};
use crate::ops::{CollectiveOp, ExecutionContext, OperationManager, Payload};
use crate::state::{CoordinatorState, Parameters};
use crate::tensor::Tensor;
use crate::timeline::{Timeline, TimelineSink};
use crate::transport::{CommunicatorSet, Topology, TransportError};

/// Sent by the coordinator at the end of the initialization handshake.
#[derive(Debug, Serialize, Deserialize)]
struct InitReply {
    homogeneous: bool,
    node_major: bool,
    parameters: Parameters,
}

pub(crate) struct LoopSetup {
    pub state: Arc<CoordinatorState>,
    pub comms: CommunicatorSet,
    pub config: CollectivesConfig,
    pub strategies: Vec<Arc<dyn CollectiveOp>>,
    pub timeline: Option<Box<dyn TimelineSink>>,
}

/// Start the loop thread. The thread performs the initialization handshake and then
/// reports `Running` (or `ShutDown` on failure) through the coordinator state.
pub(crate) fn spawn(setup: LoopSetup) -> std::io::Result<JoinHandle<()>> {
    let name = format!("collectives-{}", setup.comms.global.rank());
    thread::Builder::new().name(name).spawn(move || run(setup))
}

fn run(setup: LoopSetup) {
    let LoopSetup {
        state,
        comms,
        config,
        strategies,
        timeline,
    } = setup;

    let (topology, parameters) = match handshake(&comms, &config) {
        Ok(agreed) => agreed,
        Err(e) => {
            tracing::error!(error = %e, "collectives initialization failed");
            drop(comms);
            state.mark_shut_down(Some(e.into()));
            return;
        }
    };

    tracing::info!(
        rank = topology.rank,
        size = topology.size,
        local_rank = topology.local_rank,
        local_size = topology.local_size,
        cross_size = topology.cross_size,
        homogeneous = topology.homogeneous,
        cycle_time_ms = parameters.cycle_time_ms,
        fusion_threshold_bytes = parameters.fusion_threshold_bytes,
        cache_capacity = parameters.cache_capacity,
        "collectives initialized"
    );

    let coordination = CoordinationLoop {
        controller: Controller::new(topology, &parameters, &config.stall_check),
        ops: OperationManager::new(strategies),
        fusion: FusionBufferManager::new(),
        timeline: timeline.map(Timeline::new).unwrap_or_default(),
        staged: Vec::new(),
        ready_poll: config.ready_poll_interval(),
        mark_cycles: config.timeline.mark_cycles,
        cycle: 0,
        state: state.clone(),
        comms,
        topology,
        parameters,
    };
    state.mark_running(topology);
    coordination.run();
}

/// Agree on the global topology facts and adopt the coordinator's parameters.
fn handshake(
    comms: &CommunicatorSet,
    config: &CollectivesConfig,
) -> Result<(Topology, Parameters), TransportError> {
    let mut topology = comms.topology();

    let gathered = comms.global.gather(message::encode(&topology)?)?;
    let reply = match gathered {
        Some(all) => {
            let reports = all
                .iter()
                .map(|b| message::decode::<Topology>(b))
                .collect::<Result<Vec<_>, _>>()?;
            let homogeneous = reports
                .iter()
                .all(|t| t.local_size == topology.local_size);
            let node_major = reports
                .iter()
                .all(|t| t.rank == t.cross_rank * t.local_size + t.local_rank);

            let mut parameters = Parameters::from(config);
            let hierarchical = parameters.hierarchical_allreduce || parameters.hierarchical_allgather;
            if hierarchical && !topology.is_multi_node() {
                tracing::info!("single-node job: hierarchical strategies disabled");
                parameters.hierarchical_allreduce = false;
                parameters.hierarchical_allgather = false;
            } else if hierarchical && !homogeneous {
                tracing::warn!(
                    "hierarchical strategies need the same number of ranks on every node; \
                     falling back to flat strategies"
                );
            }

            Some(message::encode(&InitReply {
                homogeneous,
                node_major,
                parameters,
            })?)
        }
        None => None,
    };

    let reply: InitReply = message::decode(&comms.global.broadcast_bytes(reply)?)?;
    topology.homogeneous = reply.homogeneous;
    topology.node_major = reply.node_major;
    comms.global.barrier()?;
    Ok((topology, reply.parameters))
}

struct CoordinationLoop {
    state: Arc<CoordinatorState>,
    comms: CommunicatorSet,
    topology: Topology,
    parameters: Parameters,
    controller: Controller,
    ops: OperationManager,
    fusion: FusionBufferManager,
    timeline: Timeline,
    /// Submitted requests whose input is not ready yet.
    staged: Vec<Request>,
    ready_poll: Duration,
    mark_cycles: bool,
    cycle: u64,
}

impl CoordinationLoop {
    fn run(mut self) {
        let cycle_time = self.parameters.cycle_time();
        let mut last_cycle_start = Instant::now();

        let failure = loop {
            let next = last_cycle_start + cycle_time;
            let now = Instant::now();
            if next > now {
                thread::sleep(next - now);
            }
            last_cycle_start = Instant::now();

            match self.run_cycle() {
                Ok(true) => {}
                Ok(false) => break None,
                Err(e) => {
                    tracing::error!(cycle = self.cycle, error = %e, "transport failure; shutting down");
                    break Some(CollectiveError::from(e));
                }
            }
        };
        self.drain(failure);
    }

    /// One cycle. Returns `false` once the job agreed to shut down.
    fn run_cycle(&mut self) -> Result<bool, TransportError> {
        self.cycle += 1;
        if self.mark_cycles {
            self.timeline.mark_cycle();
        }

        let shutdown = self.state.shutdown_requested();
        self.stage_ready();

        let plan = self
            .controller
            .negotiate(self.comms.global.as_ref(), shutdown, &mut self.timeline)?;
        if !plan.is_empty() {
            tracing::debug!(
                cycle = self.cycle,
                batches = plan.batches.len(),
                "executing plan"
            );
        }

        for batch in &plan.batches {
            self.perform(batch);
        }
        Ok(!plan.shutdown)
    }

    /// Pull new submissions and forward the ones whose input is ready.
    fn stage_ready(&mut self) {
        for request in self.state.queue().pop_requests() {
            self.timeline.start(&request.name, "QUEUE");
            self.staged.push(request);
        }

        let queue = self.state.queue();
        let (ready, waiting): (Vec<Request>, Vec<Request>) = std::mem::take(&mut self.staged)
            .into_iter()
            .partition(|r| queue.is_ready(&r.name));
        self.staged = waiting;

        for request in ready {
            self.timeline.end(&request.name, None);
            self.controller.push_ready(request);
        }
    }

    fn perform(&mut self, batch: &Batch) {
        let entries = self.state.queue().take_entries(&batch.names);
        if entries.len() != batch.names.len() {
            tracing::error!(
                cycle = self.cycle,
                names = ?batch.names,
                found = entries.len(),
                "plan references operations that are not pending on this rank"
            );
            let err = CollectiveError::Unknown("operation missing from the entry table".to_string());
            for entry in entries {
                entry.complete(Err(err.clone()));
            }
            return;
        }

        if batch.kind != OpKind::Error {
            self.wait_for_data(&entries);
        }
        for entry in &entries {
            self.timeline.start(&entry.name, batch.kind.as_str());
        }

        let result = match batch.kind {
            OpKind::Reduce | OpKind::Broadcast => self.execute_in_place(batch, &entries),
            OpKind::Gather => self.execute_gather(batch, &entries),
            OpKind::Error => {
                let ctx = ExecutionContext {
                    comms: &self.comms,
                    topology: &self.topology,
                    parameters: &self.parameters,
                };
                self.ops
                    .execute(batch, Payload::Empty, &ctx)
                    .map(|_| Vec::new())
            }
        };

        self.resolve(batch, entries, result);
    }

    /// Poll the readiness events with short sleeps rather than blocking on them.
    fn wait_for_data(&mut self, entries: &[TensorEntry]) {
        for entry in entries {
            self.timeline.start(&entry.name, "WAIT_FOR_DATA");
        }
        while !entries.iter().all(TensorEntry::is_ready) {
            thread::sleep(self.ready_poll);
        }
        for entry in entries {
            self.timeline.end(&entry.name, None);
        }
    }

    fn fusion_alignment(&self, batch: &Batch) -> usize {
        let hierarchical = batch.kind == OpKind::Reduce
            && self.parameters.hierarchical_allreduce
            && self.topology.is_multi_node()
            && self.topology.homogeneous;
        if hierarchical {
            FUSION_ALIGNMENT_BYTES * self.topology.local_size
        } else {
            FUSION_ALIGNMENT_BYTES
        }
    }

    fn execute_in_place(&mut self, batch: &Batch, entries: &[TensorEntry]) -> Result<Vec<Tensor>> {
        let alignment = self.fusion_alignment(batch);
        let ctx = ExecutionContext {
            comms: &self.comms,
            topology: &self.topology,
            parameters: &self.parameters,
        };

        if let [entry] = entries {
            let input = &entry.tensor;
            let mut buffer = input.data().to_vec();
            let strategy = self.ops.execute(batch, Payload::InPlace(&mut buffer), &ctx)?;
            tracing::trace!(name = %entry.name, %strategy, "performed");
            return Ok(vec![Tensor::new(
                input.dtype(),
                input.shape(),
                input.device(),
                buffer,
            )?]);
        }

        let device = entries
            .first()
            .map(|e| e.tensor.device())
            .ok_or_else(|| CollectiveError::InvalidArgument("empty batch".to_string()))?;
        let sizes: Vec<usize> = entries.iter().map(|e| e.tensor.size_bytes()).collect();

        let buffer = self
            .fusion
            .pack(device, entries.iter().map(|e| &e.tensor.data()[..]), alignment);
        let strategy = self
            .ops
            .execute(batch, Payload::InPlace(&mut *buffer), &ctx)?;
        tracing::trace!(names = ?batch.names, %strategy, bytes = buffer.len(), "performed fused batch");

        entries
            .iter()
            .zip(fusion::unpack(buffer, &sizes))
            .map(|(e, data)| {
                Tensor::new(e.tensor.dtype(), e.tensor.shape(), e.tensor.device(), data)
            })
            .collect()
    }

    fn execute_gather(&mut self, batch: &Batch, entries: &[TensorEntry]) -> Result<Vec<Tensor>> {
        let [entry] = entries else {
            return Err(CollectiveError::InvalidArgument(format!(
                "a gather batch has exactly one member, got {}",
                entries.len()
            )));
        };
        if batch.gather_dims.len() != self.topology.size {
            return Err(CollectiveError::InvalidArgument(format!(
                "gather plan lists {} ranks, job has {}",
                batch.gather_dims.len(),
                self.topology.size
            )));
        }

        let input = &entry.tensor;
        let trailing: usize = input.shape().get(1..).unwrap_or(&[]).iter().product();
        let row_bytes = trailing * input.dtype().size();
        let counts: Vec<usize> = batch.gather_dims.iter().map(|d| d * row_bytes).collect();

        let ctx = ExecutionContext {
            comms: &self.comms,
            topology: &self.topology,
            parameters: &self.parameters,
        };
        let mut output = Vec::new();
        let strategy = self.ops.execute(
            batch,
            Payload::Gather {
                input: input.data(),
                counts: &counts,
                output: &mut output,
            },
            &ctx,
        )?;
        tracing::trace!(name = %entry.name, %strategy, bytes = output.len(), "performed");

        let mut shape = input.shape().to_vec();
        if let Some(first) = shape.first_mut() {
            *first = batch.gather_dims.iter().sum();
        }
        Ok(vec![Tensor::new(input.dtype(), shape, input.device(), output)?])
    }

    /// Deliver outputs, or the batch error, to every member in plan order.
    fn resolve(&mut self, batch: &Batch, entries: Vec<TensorEntry>, result: Result<Vec<Tensor>>) {
        let result = result.and_then(|outputs| {
            if outputs.len() == entries.len() {
                Ok(outputs)
            } else {
                Err(CollectiveError::Unknown(format!(
                    "strategy produced {} outputs for {} operations",
                    outputs.len(),
                    entries.len()
                )))
            }
        });

        match result {
            Ok(outputs) => {
                let scale = 1.0 / self.topology.size as f64;
                for (entry, output) in entries.into_iter().zip(outputs) {
                    self.timeline.end(
                        &entry.name,
                        Some(json!({"dtype": output.dtype().name(), "shape": output.shape()})),
                    );
                    let output = if entry.average && batch.kind == OpKind::Reduce {
                        output.scaled(scale)
                    } else {
                        output
                    };
                    entry.complete(Ok(output));
                }
            }
            Err(e) => {
                tracing::debug!(cycle = self.cycle, names = ?batch.names, error = %e, "batch failed");
                for entry in entries {
                    self.timeline.end(&entry.name, None);
                    entry.complete(Err(e.clone()));
                }
            }
        }
    }

    fn drain(mut self, failure: Option<CollectiveError>) {
        self.state.mark_draining();

        let entries = self.state.queue().drain();
        let outstanding = entries.len();
        for entry in entries {
            entry.complete(Err(CollectiveError::ShutDown));
        }
        self.staged.clear();
        self.timeline.flush();

        tracing::info!(
            rank = self.topology.rank,
            cycles = self.cycle,
            outstanding,
            "collectives shut down"
        );

        let CoordinationLoop {
            state,
            comms,
            timeline,
            ..
        } = self;
        drop(timeline);
        drop(comms);
        state.mark_shut_down(failure);
    }
}
