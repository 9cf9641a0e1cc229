// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Coordinator state shared between the public API and the coordination loop.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};

use crate::config::CollectivesConfig;
use crate::entry::TensorQueue;
use crate::error::{CollectiveError, Result};
use crate::transport::Topology;

/// Observable lifecycle of the coordination loop.
///
/// ```text
/// Uninitialized -> Initializing -> Running -> Draining -> ShutDown
///                        |                                  |
///                        +----------> ShutDown              +--> Initializing
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LoopState {
    Uninitialized,
    Initializing,
    Running,
    Draining,
    ShutDown,
}

impl LoopState {
    /// States from which `initialize` may be called.
    pub fn can_initialize(&self) -> bool {
        matches!(self, LoopState::Uninitialized | LoopState::ShutDown)
    }
}

/// Tunables every rank must agree on. The coordinator's values are adopted by every
/// rank during initialization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Parameters {
    pub cycle_time_ms: f64,
    pub fusion_threshold_bytes: usize,
    pub cache_capacity: usize,
    pub hierarchical_allreduce: bool,
    pub hierarchical_allgather: bool,
}

impl Parameters {
    pub fn cycle_time(&self) -> Duration {
        Duration::from_secs_f64(self.cycle_time_ms / 1000.0)
    }
}

impl From<&CollectivesConfig> for Parameters {
    fn from(config: &CollectivesConfig) -> Self {
        Self {
            cycle_time_ms: config.cycle_time_ms,
            fusion_threshold_bytes: config.fusion_threshold_bytes,
            cache_capacity: config.cache_capacity,
            hierarchical_allreduce: config.hierarchical_allreduce,
            hierarchical_allgather: config.hierarchical_allgather,
        }
    }
}

struct Status {
    state: LoopState,
    topology: Option<Topology>,
    error: Option<CollectiveError>,
}

/// One per [`Collectives`](crate::Collectives) instance; owns the entry table and the
/// lifecycle state observed by callers.
pub struct CoordinatorState {
    queue: TensorQueue,
    shutdown_requested: AtomicBool,
    status: Mutex<Status>,
    changed: Condvar,
}

impl Default for CoordinatorState {
    fn default() -> Self {
        Self::new()
    }
}

impl CoordinatorState {
    pub fn new() -> Self {
        Self {
            queue: TensorQueue::new(),
            shutdown_requested: AtomicBool::new(false),
            status: Mutex::new(Status {
                state: LoopState::Uninitialized,
                topology: None,
                error: None,
            }),
            changed: Condvar::new(),
        }
    }

    pub fn queue(&self) -> &TensorQueue {
        &self.queue
    }

    pub fn state(&self) -> LoopState {
        self.status.lock().state
    }

    /// Topology of the most recent successful initialization.
    pub fn topology(&self) -> Option<Topology> {
        self.status.lock().topology
    }

    /// Ask the job to shut down and stop accepting submissions on this rank.
    pub fn request_shutdown(&self) {
        self.shutdown_requested.store(true, Ordering::Release);
        self.queue.close();
    }

    pub fn shutdown_requested(&self) -> bool {
        self.shutdown_requested.load(Ordering::Acquire)
    }

    pub(crate) fn begin_initialize(&self) -> Result<()> {
        let mut status = self.status.lock();
        if !status.state.can_initialize() {
            return Err(CollectiveError::AlreadyInitialized);
        }
        status.state = LoopState::Initializing;
        status.topology = None;
        status.error = None;
        self.shutdown_requested.store(false, Ordering::Release);
        self.queue.reopen();
        Ok(())
    }

    pub(crate) fn mark_running(&self, topology: Topology) {
        let mut status = self.status.lock();
        status.state = LoopState::Running;
        status.topology = Some(topology);
        self.changed.notify_all();
    }

    pub(crate) fn mark_draining(&self) {
        self.status.lock().state = LoopState::Draining;
    }

    pub(crate) fn mark_shut_down(&self, error: Option<CollectiveError>) {
        let mut status = self.status.lock();
        status.state = LoopState::ShutDown;
        if error.is_some() {
            status.error = error;
        }
        self.changed.notify_all();
    }

    /// Block until the loop leaves `Initializing`. Fails if it never reached `Running`.
    pub(crate) fn wait_started(&self) -> Result<Topology> {
        let mut status = self.status.lock();
        while status.state == LoopState::Initializing {
            self.changed.wait(&mut status);
        }
        match status.topology {
            Some(topology) => Ok(topology),
            None => Err(status.error.clone().unwrap_or(CollectiveError::ShutDown)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn topology() -> Topology {
        Topology {
            rank: 0,
            size: 1,
            local_rank: 0,
            local_size: 1,
            cross_rank: 0,
            cross_size: 1,
            homogeneous: true,
            node_major: true,
        }
    }

    #[rstest]
    #[case::fresh(LoopState::Uninitialized, true)]
    #[case::initializing(LoopState::Initializing, false)]
    #[case::running(LoopState::Running, false)]
    #[case::draining(LoopState::Draining, false)]
    #[case::shut_down(LoopState::ShutDown, true)]
    fn test_can_initialize(#[case] state: LoopState, #[case] allowed: bool) {
        assert_eq!(state.can_initialize(), allowed);
    }

    #[test]
    fn test_lifecycle() {
        let state = CoordinatorState::new();
        assert_eq!(state.state(), LoopState::Uninitialized);
        state.begin_initialize().unwrap();
        assert!(matches!(
            state.begin_initialize(),
            Err(CollectiveError::AlreadyInitialized)
        ));

        state.mark_running(topology());
        assert_eq!(state.wait_started().unwrap().size, 1);

        state.request_shutdown();
        assert!(state.queue().is_closed());
        state.mark_draining();
        state.mark_shut_down(None);
        assert_eq!(state.state(), LoopState::ShutDown);

        // re-initialization reopens the queue
        state.begin_initialize().unwrap();
        assert!(!state.queue().is_closed());
        assert!(!state.shutdown_requested());
    }

    #[test]
    fn test_failed_start_reports_error() {
        let state = std::sync::Arc::new(CoordinatorState::new());
        state.begin_initialize().unwrap();
        let loop_side = state.clone();
        let t = std::thread::spawn(move || {
            loop_side.mark_shut_down(Some(CollectiveError::Unknown("handshake".into())));
        });
        let err = state.wait_started().unwrap_err();
        t.join().unwrap();
        assert!(matches!(err, CollectiveError::Unknown(_)));
    }
}
