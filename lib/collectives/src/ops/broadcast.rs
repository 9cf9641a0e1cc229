// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

use super::{CollectiveOp, ExecutionContext, Payload};
use crate::error::{CollectiveError, Result};
use crate::message::{Batch, OpKind};

/// Copy of the root's buffer over the global communicator.
pub struct FabricBroadcast;

impl CollectiveOp for FabricBroadcast {
    fn name(&self) -> &str {
        "fabric_broadcast"
    }

    fn enabled(&self, batch: &Batch, _ctx: &ExecutionContext<'_>) -> bool {
        batch.kind == OpKind::Broadcast
    }

    fn execute(&self, batch: &Batch, payload: Payload<'_>, ctx: &ExecutionContext<'_>) -> Result<()> {
        let root = batch.root_rank.ok_or_else(|| {
            CollectiveError::InvalidArgument("broadcast batch without a root rank".to_string())
        })?;
        let buffer = payload.into_in_place()?;
        ctx.comms.global.broadcast(buffer, root)?;
        Ok(())
    }
}
