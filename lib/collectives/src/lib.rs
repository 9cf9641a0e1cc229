// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Coordination engine for data-parallel collectives.
//!
//! Every rank submits named operations at its own pace. A background loop per rank
//! negotiates with the coordinator (rank 0) which operations every rank has made
//! ready, fuses small compatible operations into one transfer, and executes them in
//! the same order on all ranks.

mod background;

pub mod cache;
pub mod collectives;
pub mod config;
pub mod controller;
pub mod entry;
pub mod error;
pub mod fusion;
pub mod logging;
pub mod message;
pub mod ops;
pub mod state;
pub mod tensor;
pub mod timeline;
pub mod transport;

pub use collectives::{Collectives, Operation, OperationBuilder};
pub use config::CollectivesConfig;
pub use entry::CompletionHandle;
pub use error::{CollectiveError, Result};
pub use message::OpKind;
pub use ops::CollectiveOp;
pub use state::LoopState;
pub use tensor::{DataType, Device, ReadyEvent, ReadyFlag, Tensor};
pub use timeline::{ChromeTimeline, TimelineSink};
pub use transport::{Communicator, CommunicatorSet, LocalCluster, Topology, TransportError};
