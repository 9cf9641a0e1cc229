// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Public submission API.

use std::sync::Arc;
use std::thread::JoinHandle;

use derive_builder::Builder;
use parking_lot::Mutex;
use validator::Validate;

use crate::background::{self, LoopSetup};
use crate::config::{CollectivesConfig, ConfigError};
use crate::entry::{CompletionHandle, TensorEntry};
use crate::error::{CollectiveError, Result};
use crate::message::{OpKind, Request};
use crate::ops::CollectiveOp;
use crate::state::{CoordinatorState, LoopState};
use crate::tensor::{ReadyEvent, Tensor};
use crate::timeline::{ChromeTimeline, TimelineSink};
use crate::transport::{CommunicatorSet, Topology};

/// One collective operation to submit.
///
/// ```rust,ignore
/// let op = Operation::builder()
///     .name("layer1.weight.grad")
///     .kind(OpKind::Reduce)
///     .tensor(grad)
///     .ready_event(Arc::new(flag.clone()))
///     .build()?;
/// let handle = collectives.submit(op)?;
/// ```
#[derive(Builder, Clone)]
#[builder(pattern = "owned", build_fn(error = "CollectiveError"))]
pub struct Operation {
    /// Unique among the operations in flight on this rank; every rank must use the
    /// same name for the same logical operation.
    #[builder(setter(into))]
    name: String,

    kind: OpKind,

    tensor: Tensor,

    /// Broadcast only.
    #[builder(default, setter(strip_option))]
    root_rank: Option<usize>,

    /// Signals that the producer has finished writing `tensor`. Absent means ready now.
    #[builder(default, setter(strip_option))]
    ready_event: Option<Arc<dyn ReadyEvent>>,

    /// Reduce only: divide the sum by the number of ranks (floating point tensors).
    #[builder(default)]
    average: bool,
}

impl Operation {
    pub fn builder() -> OperationBuilder {
        OperationBuilder::default()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> OpKind {
        self.kind
    }
}

impl std::fmt::Debug for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Operation")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("tensor", &self.tensor)
            .field("root_rank", &self.root_rank)
            .field("average", &self.average)
            .finish()
    }
}

/// Entry point of the engine: one instance per process.
///
/// ```rust,ignore
/// let collectives = Collectives::from_env()?;
/// collectives.initialize(comms)?;
/// let sum = collectives.allreduce("grad", tensor)?.wait()?;
/// collectives.shutdown()?;
/// ```
pub struct Collectives {
    config: CollectivesConfig,
    state: Arc<CoordinatorState>,
    strategies: Vec<Arc<dyn CollectiveOp>>,
    timeline: Mutex<Option<Box<dyn TimelineSink>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Collectives {
    /// Validates `config`; nothing runs until [`Collectives::initialize`].
    pub fn new(config: CollectivesConfig) -> Result<Self> {
        config
            .validate()
            .map_err(|e| CollectiveError::from(ConfigError::from(e)))?;
        Ok(Self {
            config,
            state: Arc::new(CoordinatorState::new()),
            strategies: Vec::new(),
            timeline: Mutex::new(None),
            worker: Mutex::new(None),
        })
    }

    /// Configuration from files and `DYN_COLLECTIVES_*` environment variables.
    pub fn from_env() -> Result<Self> {
        Self::new(CollectivesConfig::from_env()?)
    }

    /// Register a strategy ahead of the built-in chain.
    pub fn with_strategy(mut self, op: impl CollectiveOp + 'static) -> Self {
        self.strategies.push(Arc::new(op));
        self
    }

    /// Send lifecycle events to `sink` instead of the configured timeline file. Only
    /// the coordinator rank records a timeline.
    pub fn with_timeline(self, sink: impl TimelineSink + 'static) -> Self {
        *self.timeline.lock() = Some(Box::new(sink));
        self
    }

    pub fn config(&self) -> &CollectivesConfig {
        &self.config
    }

    /// Start the coordination loop over `comms` and block until every rank has
    /// completed the initialization handshake.
    pub fn initialize(&self, comms: CommunicatorSet) -> Result<()> {
        self.state.begin_initialize()?;

        // a previous loop has already reported ShutDown; reap it
        if let Some(previous) = self.worker.lock().take() {
            if previous.join().is_err() {
                tracing::warn!("previous coordination loop panicked");
            }
        }

        let timeline = match self.coordinator_timeline(&comms) {
            Ok(timeline) => timeline,
            Err(e) => {
                self.state.mark_shut_down(Some(e.clone()));
                return Err(e);
            }
        };

        let setup = LoopSetup {
            state: self.state.clone(),
            comms,
            config: self.config.clone(),
            strategies: self.strategies.clone(),
            timeline,
        };
        let handle = match background::spawn(setup) {
            Ok(handle) => handle,
            Err(e) => {
                let err = CollectiveError::Unknown(format!("failed to start the loop thread: {e}"));
                self.state.mark_shut_down(Some(err.clone()));
                return Err(err);
            }
        };
        *self.worker.lock() = Some(handle);

        self.state.wait_started().map(|_| ())
    }

    fn coordinator_timeline(
        &self,
        comms: &CommunicatorSet,
    ) -> Result<Option<Box<dyn TimelineSink>>> {
        if comms.global.rank() != 0 {
            return Ok(None);
        }
        if let Some(sink) = self.timeline.lock().take() {
            return Ok(Some(sink));
        }
        match &self.config.timeline.path {
            Some(path) => {
                let sink = ChromeTimeline::create(path).map_err(|source| ConfigError::Timeline {
                    path: path.clone(),
                    source,
                })?;
                Ok(Some(Box::new(sink)))
            }
            None => Ok(None),
        }
    }

    /// Request a job-wide shutdown and block until this rank's loop has drained.
    /// Calling it again, or before initialization, is a no-op.
    pub fn shutdown(&self) -> Result<()> {
        self.state.request_shutdown();
        let Some(handle) = self.worker.lock().take() else {
            return Ok(());
        };
        handle
            .join()
            .map_err(|_| CollectiveError::Unknown("coordination loop panicked".to_string()))
    }

    pub fn state(&self) -> LoopState {
        self.state.state()
    }

    fn topology(&self) -> Result<Topology> {
        self.state.topology().ok_or(CollectiveError::NotInitialized)
    }

    pub fn rank(&self) -> Result<usize> {
        Ok(self.topology()?.rank)
    }

    pub fn local_rank(&self) -> Result<usize> {
        Ok(self.topology()?.local_rank)
    }

    pub fn size(&self) -> Result<usize> {
        Ok(self.topology()?.size)
    }

    pub fn local_size(&self) -> Result<usize> {
        Ok(self.topology()?.local_size)
    }

    pub fn cross_rank(&self) -> Result<usize> {
        Ok(self.topology()?.cross_rank)
    }

    pub fn cross_size(&self) -> Result<usize> {
        Ok(self.topology()?.cross_size)
    }

    /// Does every node run the same number of ranks?
    pub fn is_homogeneous(&self) -> Result<bool> {
        Ok(self.topology()?.homogeneous)
    }

    /// Submit `op` without blocking on the network.
    ///
    /// Fails with [`CollectiveError::DuplicateName`] if an operation with the same
    /// name is still in flight on this rank, and with [`CollectiveError::ShutDown`]
    /// once shutdown has begun.
    pub fn submit(&self, op: Operation) -> Result<CompletionHandle> {
        let topology = match self.state.state() {
            LoopState::Running => self.topology()?,
            LoopState::Draining | LoopState::ShutDown => return Err(CollectiveError::ShutDown),
            LoopState::Uninitialized | LoopState::Initializing => {
                return Err(CollectiveError::NotInitialized);
            }
        };

        match op.kind {
            OpKind::Error => {
                return Err(CollectiveError::InvalidArgument(
                    "error operations cannot be submitted".to_string(),
                ));
            }
            OpKind::Broadcast if op.root_rank.is_none() => {
                return Err(CollectiveError::InvalidArgument(format!(
                    "broadcast '{}' needs a root rank",
                    op.name
                )));
            }
            OpKind::Gather if op.tensor.shape().is_empty() => {
                return Err(CollectiveError::InvalidArgument(format!(
                    "cannot gather scalar '{}'",
                    op.name
                )));
            }
            _ => {}
        }

        let request = Request {
            name: op.name.clone(),
            kind: op.kind,
            rank: topology.rank,
            dtype: op.tensor.dtype(),
            shape: op.tensor.shape().to_vec(),
            device: op.tensor.device(),
            root_rank: op.root_rank,
        };
        let (entry, handle) = TensorEntry::new(
            op.name,
            op.kind,
            op.tensor,
            op.root_rank,
            op.ready_event,
            op.average,
        );
        self.state.queue().add(request, entry)?;
        Ok(handle)
    }

    /// Element-wise sum across ranks.
    pub fn allreduce(&self, name: impl Into<String>, tensor: Tensor) -> Result<CompletionHandle> {
        self.submit(
            Operation::builder()
                .name(name)
                .kind(OpKind::Reduce)
                .tensor(tensor)
                .build()?,
        )
    }

    /// Element-wise mean across ranks. Integer tensors are summed but not divided.
    pub fn allreduce_average(
        &self,
        name: impl Into<String>,
        tensor: Tensor,
    ) -> Result<CompletionHandle> {
        self.submit(
            Operation::builder()
                .name(name)
                .kind(OpKind::Reduce)
                .tensor(tensor)
                .average(true)
                .build()?,
        )
    }

    /// Concatenation along the first dimension in rank order.
    pub fn allgather(&self, name: impl Into<String>, tensor: Tensor) -> Result<CompletionHandle> {
        self.submit(
            Operation::builder()
                .name(name)
                .kind(OpKind::Gather)
                .tensor(tensor)
                .build()?,
        )
    }

    /// `root_rank`'s tensor on every rank.
    pub fn broadcast(
        &self,
        name: impl Into<String>,
        tensor: Tensor,
        root_rank: usize,
    ) -> Result<CompletionHandle> {
        self.submit(
            Operation::builder()
                .name(name)
                .kind(OpKind::Broadcast)
                .tensor(tensor)
                .root_rank(root_rank)
                .build()?,
        )
    }
}

impl Drop for Collectives {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            tracing::warn!(error = %e, "collectives shutdown on drop failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::LocalCluster;

    fn tensor() -> Tensor {
        Tensor::from_slice(&[1.0f32, 2.0], [2]).unwrap()
    }

    #[test]
    fn test_builder_requires_fields() {
        let err = Operation::builder().name("x").build().unwrap_err();
        assert!(matches!(err, CollectiveError::InvalidArgument(_)));
    }

    #[test]
    fn test_submit_before_initialize() {
        let collectives = Collectives::new(CollectivesConfig::default()).unwrap();
        assert_eq!(collectives.state(), LoopState::Uninitialized);
        assert!(matches!(
            collectives.allreduce("a", tensor()),
            Err(CollectiveError::NotInitialized)
        ));
        assert!(matches!(collectives.rank(), Err(CollectiveError::NotInitialized)));
        // shutdown before initialize is harmless
        collectives.shutdown().unwrap();
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let config = CollectivesConfig {
            cycle_time_ms: 0.0,
            ..Default::default()
        };
        let Err(CollectiveError::Config(cause)) = Collectives::new(config) else {
            panic!("a zero cycle time was accepted");
        };
        assert!(matches!(*cause, ConfigError::Validation(_)));
    }

    #[test]
    fn test_single_rank_lifecycle() -> anyhow::Result<()> {
        let config = CollectivesConfig {
            cycle_time_ms: 1.0,
            ..Default::default()
        };
        let collectives = Collectives::new(config)?;
        let comms = LocalCluster::new(1, 1)?.remove(0);
        collectives.initialize(comms)?;
        assert_eq!(collectives.state(), LoopState::Running);
        assert_eq!(collectives.size()?, 1);

        // a second initialize while running is refused
        let again = LocalCluster::new(1, 1)?.remove(0);
        assert!(matches!(
            collectives.initialize(again),
            Err(CollectiveError::AlreadyInitialized)
        ));

        let out = collectives.allreduce("a", tensor())?.wait()?;
        assert_eq!(out.to_vec::<f32>()?, vec![1.0, 2.0]);

        let rootless = Operation::builder()
            .name("c")
            .kind(OpKind::Broadcast)
            .tensor(tensor())
            .build()?;
        assert!(matches!(
            collectives.submit(rootless),
            Err(CollectiveError::InvalidArgument(_))
        ));
        let scalar = Tensor::from_slice(&[1i32], Vec::<usize>::new())?;
        assert!(matches!(
            collectives.allgather("s", scalar),
            Err(CollectiveError::InvalidArgument(_))
        ));

        collectives.shutdown()?;
        assert_eq!(collectives.state(), LoopState::ShutDown);
        assert!(matches!(
            collectives.allreduce("d", tensor()),
            Err(CollectiveError::ShutDown)
        ));

        // shut down is the only state that permits re-initialization
        collectives.initialize(LocalCluster::new(1, 1)?.remove(0))?;
        let out = collectives.allreduce("d", tensor())?.wait()?;
        assert_eq!(out.to_vec::<f32>()?, vec![1.0, 2.0]);
        collectives.shutdown()?;
        Ok(())
    }
}
