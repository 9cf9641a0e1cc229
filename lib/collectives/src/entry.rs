// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Entry table and request queue shared between producer threads and the loop.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::error::{CollectiveError, Result};
use crate::message::{OpKind, Request};
use crate::tensor::{ReadyEvent, Tensor};

/// Rank-local state of one submitted operation.
pub struct TensorEntry {
    pub name: String,
    pub kind: OpKind,
    pub tensor: Tensor,
    pub root_rank: Option<usize>,
    pub ready_event: Option<Arc<dyn ReadyEvent>>,
    /// Divide the reduced result by the number of ranks.
    pub average: bool,
    completion: oneshot::Sender<Result<Tensor>>,
}

impl TensorEntry {
    pub fn new(
        name: String,
        kind: OpKind,
        tensor: Tensor,
        root_rank: Option<usize>,
        ready_event: Option<Arc<dyn ReadyEvent>>,
        average: bool,
    ) -> (Self, CompletionHandle) {
        let (tx, rx) = oneshot::channel();
        let handle = CompletionHandle {
            name: name.clone(),
            rx,
        };
        let entry = Self {
            name,
            kind,
            tensor,
            root_rank,
            ready_event,
            average,
            completion: tx,
        };
        (entry, handle)
    }

    /// Has the producer finished writing the input? Entries without an event are
    /// ready on submission.
    pub fn is_ready(&self) -> bool {
        self.ready_event.as_ref().is_none_or(|e| e.ready())
    }

    /// Resolve the entry. Consumes it, so an entry resolves exactly once.
    pub fn complete(self, result: Result<Tensor>) {
        if self.completion.send(result).is_err() {
            tracing::trace!(name = %self.name, "completion handle dropped before resolution");
        }
    }
}

impl std::fmt::Debug for TensorEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TensorEntry")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("tensor", &self.tensor)
            .field("root_rank", &self.root_rank)
            .field("average", &self.average)
            .finish()
    }
}

/// Receives the outcome of one submitted operation.
///
/// Await it from async code, or call [`CompletionHandle::wait`] from a plain thread.
#[derive(Debug)]
pub struct CompletionHandle {
    name: String,
    rx: oneshot::Receiver<Result<Tensor>>,
}

impl CompletionHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Block the current thread until the operation resolves.
    ///
    /// Must not be called from within an async runtime; await the handle instead.
    pub fn wait(self) -> Result<Tensor> {
        self.rx
            .blocking_recv()
            .unwrap_or(Err(CollectiveError::ShutDown))
    }

    /// The result, if the operation has already resolved.
    pub fn try_result(&mut self) -> Option<Result<Tensor>> {
        match self.rx.try_recv() {
            Ok(result) => Some(result),
            Err(oneshot::error::TryRecvError::Empty) => None,
            Err(oneshot::error::TryRecvError::Closed) => Some(Err(CollectiveError::ShutDown)),
        }
    }
}

impl Future for CompletionHandle {
    type Output = Result<Tensor>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|r| r.unwrap_or(Err(CollectiveError::ShutDown)))
    }
}

#[derive(Default)]
struct QueueInner {
    table: HashMap<String, TensorEntry>,
    queue: VecDeque<Request>,
    closed: bool,
}

/// Entry table plus request queue behind one lock.
///
/// The lock is only held for map and queue operations, never across a network or
/// device call.
#[derive(Default)]
pub struct TensorQueue {
    inner: Mutex<QueueInner>,
}

impl TensorQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `entry` and enqueue `request` for negotiation.
    pub fn add(&self, request: Request, entry: TensorEntry) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return Err(CollectiveError::ShutDown);
        }
        if inner.table.contains_key(&entry.name) {
            return Err(CollectiveError::DuplicateName(entry.name));
        }
        tracing::trace!(name = %entry.name, kind = %entry.kind, "enqueued");
        inner.table.insert(entry.name.clone(), entry);
        inner.queue.push_back(request);
        Ok(())
    }

    /// Every request submitted since the previous call, in submission order.
    pub fn pop_requests(&self) -> Vec<Request> {
        self.inner.lock().queue.drain(..).collect()
    }

    /// Is the entry for `name` present and its input ready?
    pub fn is_ready(&self, name: &str) -> bool {
        self.inner
            .lock()
            .table
            .get(name)
            .is_some_and(TensorEntry::is_ready)
    }

    /// Remove the entries for `names`, preserving order. Names without an entry are skipped.
    pub fn take_entries(&self, names: &[String]) -> Vec<TensorEntry> {
        let mut inner = self.inner.lock();
        names
            .iter()
            .filter_map(|name| inner.table.remove(name))
            .collect()
    }

    /// Reject every later submission with [`CollectiveError::ShutDown`].
    pub fn close(&self) {
        self.inner.lock().closed = true;
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    /// Accept submissions again after a completed shutdown.
    pub fn reopen(&self) {
        self.inner.lock().closed = false;
    }

    /// Close the queue and hand back every outstanding entry.
    pub fn drain(&self) -> Vec<TensorEntry> {
        let mut inner = self.inner.lock();
        inner.closed = true;
        inner.queue.clear();
        inner.table.drain().map(|(_, entry)| entry).collect()
    }

    /// Number of outstanding entries.
    pub fn len(&self) -> usize {
        self.inner.lock().table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
