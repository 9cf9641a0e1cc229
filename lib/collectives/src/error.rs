// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

use std::sync::Arc;

use thiserror::Error;

use crate::config::ConfigError;
use crate::transport::TransportError;

/// Errors surfaced by the collectives engine.
///
/// Errors routed to a completion handle are terminal for that operation; the
/// engine never retries. The type is `Clone` so one batch failure can be
/// delivered to every member of the batch.
#[derive(Debug, Clone, Error)]
pub enum CollectiveError {
    #[error("collectives have not been initialized; call initialize() first")]
    NotInitialized,

    #[error("collectives are already initialized")]
    AlreadyInitialized,

    #[error(
        "collectives have been shut down; this was caused by a shutdown request on one of \
         the ranks or a fatal transport failure, see the logs of the first rank that shut down"
    )]
    ShutDown,

    #[error(
        "an operation named '{0}' is already in flight on this rank; use a distinct name for \
         concurrent operations"
    )]
    DuplicateName(String),

    #[error("ranks disagree on operation '{name}': {reason}")]
    NegotiationMismatch { name: String, reason: String },

    #[error("strategy {strategy} failed: {reason}")]
    Execution { strategy: String, reason: String },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("configuration error: {0}")]
    Config(Arc<ConfigError>),

    #[error("unknown error: {0}")]
    Unknown(String),
}

impl CollectiveError {
    /// Wrap a failure raised inside an execution strategy.
    ///
    /// Errors that already describe the outcome of the batch (mismatch or
    /// execution) pass through unchanged.
    pub fn into_execution(self, strategy: &str) -> Self {
        match self {
            Self::Execution { .. } | Self::NegotiationMismatch { .. } => self,
            other => Self::Execution {
                strategy: strategy.to_string(),
                reason: other.to_string(),
            },
        }
    }
}

impl From<ConfigError> for CollectiveError {
    fn from(err: ConfigError) -> Self {
        Self::Config(Arc::new(err))
    }
}

impl From<derive_builder::UninitializedFieldError> for CollectiveError {
    fn from(err: derive_builder::UninitializedFieldError) -> Self {
        Self::InvalidArgument(format!("missing field `{}`", err.field_name()))
    }
}

pub type Result<T, E = CollectiveError> = std::result::Result<T, E>;
