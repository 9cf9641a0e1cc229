// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Backend dispatcher.
//!
//! A batch is executed by the first strategy in priority order whose
//! [`CollectiveOp::enabled`] predicate holds. Strategies registered by the user are
//! consulted before the built-in ones, which run from most specialized to the
//! generic fallback:
//!
//! 1. [`HierarchicalAllreduce`]
//! 2. [`FabricAllreduce`]
//! 3. [`HierarchicalAllgather`]
//! 4. [`FabricAllgather`]
//! 5. [`FabricBroadcast`]
//! 6. [`ErrorOp`]
//!
//! Every input a predicate looks at (batch, topology, parameters) is identical on all
//! ranks, so every rank selects the same strategy for the same batch.

mod allgather;
mod allreduce;
mod broadcast;
mod error;

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

pub use allgather::{FabricAllgather, HierarchicalAllgather};
pub use allreduce::{FabricAllreduce, HierarchicalAllreduce};
pub use broadcast::FabricBroadcast;
pub use error::ErrorOp;

use crate::error::{CollectiveError, Result};
use crate::message::Batch;
use crate::state::Parameters;
use crate::transport::{CommunicatorSet, Topology};

/// What a strategy has to work with while executing one batch.
pub struct ExecutionContext<'a> {
    pub comms: &'a CommunicatorSet,
    pub topology: &'a Topology,
    pub parameters: &'a Parameters,
}

/// Data of one batch.
pub enum Payload<'a> {
    /// Reduce and broadcast: the (possibly fused) buffer, updated in place.
    InPlace(&'a mut [u8]),
    /// Gather: this rank's contribution, the byte count of every rank, and the output.
    Gather {
        input: &'a [u8],
        counts: &'a [usize],
        output: &'a mut Vec<u8>,
    },
    /// Nothing to move (error batches).
    Empty,
}

impl<'a> Payload<'a> {
    fn describe(&self) -> &'static str {
        match self {
            Payload::InPlace(_) => "an in-place buffer",
            Payload::Gather { .. } => "a gather payload",
            Payload::Empty => "no payload",
        }
    }

    /// The in-place buffer, or an error naming what was passed instead.
    pub fn into_in_place(self) -> Result<&'a mut [u8]> {
        match self {
            Payload::InPlace(buffer) => Ok(buffer),
            other => Err(CollectiveError::InvalidArgument(format!(
                "expected an in-place buffer, got {}",
                other.describe()
            ))),
        }
    }
}

/// One execution strategy.
pub trait CollectiveOp: Send + Sync {
    /// Short identifier used in logs and error messages.
    fn name(&self) -> &str;

    /// Can this strategy execute `batch` here? Must depend only on state that is
    /// identical on every rank.
    fn enabled(&self, batch: &Batch, ctx: &ExecutionContext<'_>) -> bool;

    fn execute(
        &self,
        batch: &Batch,
        payload: Payload<'_>,
        ctx: &ExecutionContext<'_>,
    ) -> Result<()>;
}

/// Ordered strategy chain.
pub struct OperationManager {
    ops: Vec<Arc<dyn CollectiveOp>>,
}

impl OperationManager {
    /// `user` strategies take priority over the built-in chain.
    pub fn new(user: Vec<Arc<dyn CollectiveOp>>) -> Self {
        let mut ops = user;
        ops.push(Arc::new(HierarchicalAllreduce));
        ops.push(Arc::new(FabricAllreduce));
        ops.push(Arc::new(HierarchicalAllgather));
        ops.push(Arc::new(FabricAllgather));
        ops.push(Arc::new(FabricBroadcast));
        ops.push(Arc::new(ErrorOp));
        Self { ops }
    }

    /// First strategy enabled for `batch`.
    pub fn select(&self, batch: &Batch, ctx: &ExecutionContext<'_>) -> Option<&dyn CollectiveOp> {
        self.ops
            .iter()
            .find(|op| op.enabled(batch, ctx))
            .map(|op| op.as_ref())
    }

    /// Execute `batch` with the selected strategy and return the strategy's name.
    ///
    /// Failures, including panics, are returned as errors; nothing escapes.
    pub fn execute(
        &self,
        batch: &Batch,
        payload: Payload<'_>,
        ctx: &ExecutionContext<'_>,
    ) -> Result<String> {
        let Some(op) = self.select(batch, ctx) else {
            return Err(CollectiveError::Execution {
                strategy: "none".to_string(),
                reason: format!("no strategy is enabled for a {} batch", batch.kind),
            });
        };
        let name = op.name().to_string();
        tracing::trace!(strategy = %name, kind = %batch.kind, batch_size = batch.len(), "executing batch");

        match catch_unwind(AssertUnwindSafe(|| op.execute(batch, payload, ctx))) {
            Ok(Ok(())) => Ok(name),
            Ok(Err(e)) => Err(e.into_execution(&name)),
            Err(panic) => {
                let reason = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "strategy panicked".to_string());
                Err(CollectiveError::Unknown(format!("{name}: {reason}")))
            }
        }
    }
}
