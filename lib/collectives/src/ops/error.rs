// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

use super::{CollectiveOp, ExecutionContext, Payload};
use crate::error::{CollectiveError, Result};
use crate::message::{Batch, OpKind};

/// Resolves the members of an error batch with the negotiation failure.
pub struct ErrorOp;

impl CollectiveOp for ErrorOp {
    fn name(&self) -> &str {
        "error"
    }

    fn enabled(&self, batch: &Batch, _ctx: &ExecutionContext<'_>) -> bool {
        batch.kind == OpKind::Error
    }

    fn execute(&self, batch: &Batch, _payload: Payload<'_>, _ctx: &ExecutionContext<'_>) -> Result<()> {
        Err(CollectiveError::NegotiationMismatch {
            name: batch.names.join(", "),
            reason: batch
                .error
                .clone()
                .unwrap_or_else(|| "negotiation failed".to_string()),
        })
    }
}
