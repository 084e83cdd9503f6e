// SPDX-FileCopyrightText: Copyright © 2020-2024 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use futures::future::BoxFuture;
use thiserror::Error;

use super::{OpError, Operation, Promise, Queue};

/// Arguments a command is bound to when queued
pub type Args = Vec<String>;

/// A named asynchronous command.
///
/// Executing a command resolves to a list of follow-on invocations which
/// are bound through the same registry and run ahead of anything else on
/// the queue.
pub trait Command: Send + Sync {
    /// The name the command registers under. Used for dispatch and logging.
    fn name(&self) -> &str;

    /// Execute the command with the specified arguments.
    fn execute(&self, args: Args) -> BoxFuture<'static, Result<Vec<Invocation>, OpError>>;
}

/// A command name bound to its arguments
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub name: String,
    pub args: Args,
}

impl Invocation {
    pub fn new(name: impl ToString, args: impl IntoIterator<Item = impl ToString>) -> Self {
        Self {
            name: name.to_string(),
            args: args.into_iter().map(|arg| arg.to_string()).collect(),
        }
    }
}

/// An operation queue with a registry of named commands.
///
/// Deduplication compares `(name, args)` structurally: queueing a command
/// already pending with the same arguments returns the pending promise.
#[derive(Clone, Default)]
pub struct CommandQueue {
    queue: Queue,
    commands: Arc<Mutex<HashMap<String, Arc<dyn Command>>>>,
}

impl CommandQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a command under its own name
    pub fn register(&self, command: Arc<dyn Command>) {
        self.commands
            .lock()
            .expect("mutex lock")
            .insert(command.name().to_string(), command);
    }

    /// Append a command invocation to the end of the queue
    pub fn enqueue(&self, name: &str, args: Args) -> Result<Promise, Error> {
        let operation = make_operation(&self.commands, &Invocation::new(name, args))?;

        Ok(self.queue.enqueue(operation))
    }

    /// Clear all pending commands; see [`Queue::clear_pending`]
    pub fn clear_pending(&self) {
        self.queue.clear_pending();
    }

    pub fn start(&self) {
        self.queue.start();
    }

    pub fn stop(&self) {
        self.queue.stop();
    }
}

fn make_operation(
    commands: &Arc<Mutex<HashMap<String, Arc<dyn Command>>>>,
    invocation: &Invocation,
) -> Result<Operation, Error> {
    let command = commands
        .lock()
        .expect("mutex lock")
        .get(&invocation.name)
        .cloned()
        .ok_or_else(|| Error::UnknownCommand(invocation.name.clone()))?;

    let registry = commands.clone();
    let args = invocation.args.clone();
    let op_id = op_id(invocation);

    Ok(Operation::new(op_id, move || async move {
        let follow_ons = command.execute(args).await?;

        follow_ons
            .iter()
            .map(|invocation| make_operation(&registry, invocation))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|error| Box::new(error) as OpError)
    }))
}

/// Identifier deduplicating a command and its arguments on the queue
fn op_id(invocation: &Invocation) -> String {
    format!("{}({})", invocation.name, invocation.args.join(","))
}

#[derive(Debug, Clone, Error)]
pub enum Error {
    #[error("unrecognized command: {0}")]
    UnknownCommand(String),
}
