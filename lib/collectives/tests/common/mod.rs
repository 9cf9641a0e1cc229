// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Test harness: one thread per rank over an in-process cluster.

#![allow(dead_code)]

use std::sync::Arc;
use std::thread;

use anyhow::{Context, anyhow};
use dynamo_collectives::message::Batch;
use dynamo_collectives::ops::{CollectiveOp, ExecutionContext, FabricAllreduce, Payload};
use dynamo_collectives::{Collectives, CollectivesConfig, CommunicatorSet, Tensor};
use parking_lot::Mutex;

/// Short cycles and fine-grained readiness polling so tests finish quickly.
pub fn fast_config() -> CollectivesConfig {
    CollectivesConfig {
        cycle_time_ms: 1.0,
        ready_poll_interval_us: 20,
        ..Default::default()
    }
}

/// Initialize one [`Collectives`] per communicator set, run `body` on every rank
/// concurrently, shut down, and return the per-rank results in rank order.
pub fn run_ranks<T, F>(
    sets: Vec<CommunicatorSet>,
    config: CollectivesConfig,
    body: F,
) -> anyhow::Result<Vec<T>>
where
    T: Send + 'static,
    F: Fn(usize, &Collectives) -> anyhow::Result<T> + Send + Sync + 'static,
{
    run_ranks_with(
        sets,
        move |_| Ok(Collectives::new(config.clone())?),
        body,
    )
}

/// Like [`run_ranks`], with a per-rank constructor.
pub fn run_ranks_with<T, M, F>(sets: Vec<CommunicatorSet>, make: M, body: F) -> anyhow::Result<Vec<T>>
where
    T: Send + 'static,
    M: Fn(usize) -> anyhow::Result<Collectives> + Send + Sync + 'static,
    F: Fn(usize, &Collectives) -> anyhow::Result<T> + Send + Sync + 'static,
{
    dynamo_collectives::logging::init();
    let make = Arc::new(make);
    let body = Arc::new(body);
    let handles: Vec<_> = sets
        .into_iter()
        .enumerate()
        .map(|(index, set)| {
            let make = make.clone();
            let body = body.clone();
            thread::Builder::new()
                .name(format!("rank-{index}"))
                .spawn(move || -> anyhow::Result<T> {
                    let collectives = make(index)?;
                    collectives.initialize(set)?;
                    let rank = collectives.rank()?;
                    let result = body(rank, &collectives);
                    collectives.shutdown()?;
                    result.with_context(|| format!("rank {rank}"))
                })
                .map_err(anyhow::Error::from)
        })
        .collect::<anyhow::Result<_>>()?;

    handles
        .into_iter()
        .map(|h| h.join().map_err(|_| anyhow!("rank thread panicked"))?)
        .collect()
}

/// `len` values derived from `rank` and `salt` with non-trivial fractional parts.
pub fn values(rank: usize, salt: usize, len: usize) -> Vec<f32> {
    (0..len)
        .map(|i| ((rank * 31 + salt * 7 + i) % 97) as f32 / 13.0 + 0.1)
        .collect()
}

pub fn f32_tensor(values: &[f32]) -> anyhow::Result<Tensor> {
    Ok(Tensor::from_slice(values, [values.len()])?)
}

/// Records the names of every reduce batch it executes, then runs the fabric
/// allreduce.
#[derive(Clone, Default)]
pub struct Recorder(pub Arc<Mutex<Vec<Vec<String>>>>);

impl Recorder {
    pub fn batches(&self) -> Vec<Vec<String>> {
        self.0.lock().clone()
    }
}

impl CollectiveOp for Recorder {
    fn name(&self) -> &str {
        "recorder"
    }

    fn enabled(&self, batch: &Batch, ctx: &ExecutionContext<'_>) -> bool {
        FabricAllreduce.enabled(batch, ctx)
    }

    fn execute(
        &self,
        batch: &Batch,
        payload: Payload<'_>,
        ctx: &ExecutionContext<'_>,
    ) -> dynamo_collectives::Result<()> {
        self.0.lock().push(batch.names.clone());
        FabricAllreduce.execute(batch, payload, ctx)
    }
}
