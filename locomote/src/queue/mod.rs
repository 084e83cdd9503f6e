// SPDX-FileCopyrightText: Copyright © 2020-2024 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use log::debug;
use thiserror::Error;
use tokio::sync::oneshot;

pub use self::command::CommandQueue;

pub mod command;

/// Error type produced by operations themselves
pub type OpError = Box<dyn std::error::Error + Send + Sync>;

/// An asynchronous unit of work on a [`Queue`].
///
/// Running an operation resolves to a list of follow-on operations which
/// execute, in order, ahead of anything else queued. Follow-ons share the
/// runtime identity of the operation that produced them, and the promise
/// returned on enqueue resolves only once the whole chain has completed.
pub struct Operation {
    op_id: String,
    produce: Box<dyn FnOnce() -> BoxFuture<'static, Result<Vec<Operation>, OpError>> + Send>,
}

impl Operation {
    pub fn new<F, Fut>(op_id: impl ToString, produce: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<Vec<Operation>, OpError>> + Send + 'static,
    {
        Self {
            op_id: op_id.to_string(),
            produce: Box::new(move || produce().boxed()),
        }
    }

    /// The identifier used to deduplicate this operation on the queue
    pub fn op_id(&self) -> &str {
        &self.op_id
    }
}

/// Completion handle for an operation chain.
///
/// Clones all observe the same outcome, so deduplicated enqueues share
/// one promise. Dropping a promise doesn't cancel anything.
#[derive(Clone)]
pub struct Promise(Shared<BoxFuture<'static, Result<(), Error>>>);

impl Promise {
    /// Whether two promises track the same operation chain
    pub fn same(&self, other: &Promise) -> bool {
        Shared::ptr_eq(&self.0, &other.0)
    }
}

impl Future for Promise {
    type Output = Result<(), Error>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.0.poll_unpin(cx)
    }
}

#[derive(Debug, Clone, Error)]
pub enum Error {
    /// Cleared from the queue before the chain completed. Distinct from
    /// failure; work already performed is not rolled back.
    #[error("operation cancelled")]
    Cancelled,
    /// The operation itself failed
    #[error("{0}")]
    Failed(Arc<dyn std::error::Error + Send + Sync>),
}

/// A serial, deduplicating executor of asynchronous operations.
///
/// One drain task runs at a time; operations execute strictly in FIFO
/// order at the top level, with follow-ons inserted at the head so a
/// logical chain completes before the next top-level item begins.
#[derive(Clone)]
pub struct Queue {
    inner: Arc<Inner>,
}

struct Inner {
    state: Mutex<State>,
}

struct State {
    running: bool,
    draining: bool,
    epoch: u64,
    next_runtime_id: u64,
    queue: VecDeque<Item>,
    pending: HashMap<u64, Pending>,
    current: Option<Current>,
}

struct Item {
    operation: Operation,
    runtime_id: u64,
}

struct Pending {
    sender: Option<oneshot::Sender<Result<(), Error>>>,
    promise: Promise,
    /// Queue items plus the in-flight item still owing completion for
    /// this runtime identity
    outstanding: usize,
}

struct Current {
    op_id: String,
    runtime_id: u64,
    epoch: u64,
}

impl Default for Queue {
    fn default() -> Self {
        Self::new()
    }
}

impl Queue {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State {
                    running: false,
                    draining: false,
                    epoch: 0,
                    next_runtime_id: 0,
                    queue: VecDeque::new(),
                    pending: HashMap::new(),
                    current: None,
                }),
            }),
        }
    }

    /// Append an operation to the end of the queue.
    ///
    /// If an operation with the same `op_id` is already pending or
    /// executing, its existing promise is returned and nothing is queued.
    pub fn enqueue(&self, operation: Operation) -> Promise {
        let mut state = self.inner.state.lock().expect("mutex lock");

        let existing = state
            .queue
            .iter()
            .find(|item| item.operation.op_id == operation.op_id)
            .map(|item| item.runtime_id)
            .or_else(|| {
                state
                    .current
                    .as_ref()
                    .filter(|current| current.op_id == operation.op_id)
                    .map(|current| current.runtime_id)
            });
        if let Some(promise) = existing.and_then(|id| state.pending.get(&id)) {
            debug!("queue: deduplicated {}", operation.op_id);
            return promise.promise.clone();
        }

        let runtime_id = state.next_runtime_id;
        state.next_runtime_id += 1;

        let (sender, receiver) = oneshot::channel();
        let promise = Promise(
            async move { receiver.await.unwrap_or(Err(Error::Cancelled)) }
                .boxed()
                .shared(),
        );

        state.pending.insert(
            runtime_id,
            Pending {
                sender: Some(sender),
                promise: promise.clone(),
                outstanding: 1,
            },
        );
        state.queue.push_back(Item {
            operation,
            runtime_id,
        });

        self.maybe_drain(&mut state);

        promise
    }

    /// Clear all pending operations.
    ///
    /// The in-flight operation, if any, completes; its follow-ons are
    /// discarded and its promise rejected with [`Error::Cancelled`], as
    /// are the promises of every not-yet-started item.
    pub fn clear_pending(&self) {
        let mut state = self.inner.state.lock().expect("mutex lock");

        state.epoch += 1;

        let current_runtime = state.current.as_ref().map(|current| current.runtime_id);
        let cleared = std::mem::take(&mut state.queue);

        for item in cleared {
            if Some(item.runtime_id) != current_runtime {
                reject(&mut state, item.runtime_id, Error::Cancelled);
            }
        }
    }

    /// Begin draining the queue
    pub fn start(&self) {
        let mut state = self.inner.state.lock().expect("mutex lock");
        state.running = true;
        self.maybe_drain(&mut state);
    }

    /// Stop draining; the in-flight operation completes, everything else
    /// waits until the next [`Self::start`]
    pub fn stop(&self) {
        self.inner.state.lock().expect("mutex lock").running = false;
    }

    fn maybe_drain(&self, state: &mut State) {
        if state.running && !state.draining && !state.queue.is_empty() {
            state.draining = true;
            tokio::spawn(drain(self.inner.clone()));
        }
    }
}

async fn drain(inner: Arc<Inner>) {
    loop {
        let (produce, runtime_id, epoch) = {
            let mut state = inner.state.lock().expect("mutex lock");

            if !state.running {
                state.draining = false;
                return;
            }

            let Some(item) = state.queue.pop_front() else {
                state.draining = false;
                return;
            };

            let epoch = state.epoch;
            state.current = Some(Current {
                op_id: item.operation.op_id,
                runtime_id: item.runtime_id,
                epoch,
            });

            (item.operation.produce, item.runtime_id, epoch)
        };

        let result = (produce)().await;

        let mut state = inner.state.lock().expect("mutex lock");

        state.current = None;
        let cancelled = state.epoch != epoch;

        match result {
            Ok(follow_ons) if !cancelled => {
                if let Some(pending) = state.pending.get_mut(&runtime_id) {
                    pending.outstanding += follow_ons.len();
                }
                for operation in follow_ons.into_iter().rev() {
                    state.queue.push_front(Item {
                        operation,
                        runtime_id,
                    });
                }
                complete_one(&mut state, runtime_id);
            }
            Ok(_) => {
                reject(&mut state, runtime_id, Error::Cancelled);
            }
            Err(error) => {
                // Queued follow-ons of a failed chain are abandoned
                state.queue.retain(|item| item.runtime_id != runtime_id);
                let error = if cancelled {
                    Error::Cancelled
                } else {
                    Error::Failed(Arc::from(error))
                };
                reject(&mut state, runtime_id, error);
            }
        }
    }
}

fn complete_one(state: &mut State, runtime_id: u64) {
    let finished = match state.pending.get_mut(&runtime_id) {
        Some(pending) => {
            pending.outstanding -= 1;
            pending.outstanding == 0
        }
        None => false,
    };

    if finished {
        if let Some(mut pending) = state.pending.remove(&runtime_id) {
            if let Some(sender) = pending.sender.take() {
                let _ = sender.send(Ok(()));
            }
        }
    }
}

fn reject(state: &mut State, runtime_id: u64, error: Error) {
    if let Some(mut pending) = state.pending.remove(&runtime_id) {
        if let Some(sender) = pending.sender.take() {
            let _ = sender.send(Err(error));
        }
    }
}
