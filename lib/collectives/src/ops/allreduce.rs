// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

use super::{CollectiveOp, ExecutionContext, Payload};
use crate::error::Result;
use crate::message::{Batch, OpKind};
use crate::transport::shard_ranges;

/// Sum over the global communicator.
pub struct FabricAllreduce;

impl CollectiveOp for FabricAllreduce {
    fn name(&self) -> &str {
        "fabric_allreduce"
    }

    fn enabled(&self, batch: &Batch, _ctx: &ExecutionContext<'_>) -> bool {
        batch.kind == OpKind::Reduce
    }

    fn execute(&self, batch: &Batch, payload: Payload<'_>, ctx: &ExecutionContext<'_>) -> Result<()> {
        let buffer = payload.into_in_place()?;
        ctx.comms.global.allreduce(buffer, batch.dtype)?;
        Ok(())
    }
}

/// Two-level sum for multi-node jobs.
///
/// 1. sum within the node,
/// 2. every local rank sums its shard of the buffer with the same local rank on the
///    other nodes,
/// 3. the shards are gathered back within the node.
///
/// Only the shard traffic crosses node boundaries.
pub struct HierarchicalAllreduce;

impl CollectiveOp for HierarchicalAllreduce {
    fn name(&self) -> &str {
        "hierarchical_allreduce"
    }

    fn enabled(&self, batch: &Batch, ctx: &ExecutionContext<'_>) -> bool {
        batch.kind == OpKind::Reduce
            && ctx.parameters.hierarchical_allreduce
            && ctx.topology.is_multi_node()
            && ctx.topology.homogeneous
    }

    fn execute(&self, batch: &Batch, payload: Payload<'_>, ctx: &ExecutionContext<'_>) -> Result<()> {
        let buffer = payload.into_in_place()?;
        let elem = batch.dtype.size();

        ctx.comms.local.allreduce(buffer, batch.dtype)?;

        let shards = shard_ranges(buffer.len() / elem, elem, ctx.topology.local_size);
        let (start, end) = shards[ctx.topology.local_rank];
        ctx.comms.cross.allreduce(&mut buffer[start..end], batch.dtype)?;

        let counts: Vec<usize> = shards.iter().map(|(s, e)| e - s).collect();
        let gathered = ctx.comms.local.allgatherv(&buffer[start..end], &counts)?;
        buffer.copy_from_slice(&gathered);
        Ok(())
    }
}
