//! Single-slot command mailbox
//!
//! Producers hand a command and its completion to the session; the worker
//! takes them out one at a time. The slot lives inside the state machine's
//! lock so acceptance and the IDLE check are one atomic step.

use crate::error::EnqueueError;
use crate::state::{StateMachine, WorkerState};
use protocol::Command;
use std::fmt;
use tokio::sync::oneshot;
use tracing::debug;

/// One-shot delivery of a finished command back to its producer
pub struct Completion(Box<dyn FnOnce(Command) + Send + 'static>);

impl Completion {
    pub fn new<F>(callback: F) -> Self
    where
        F: FnOnce(Command) + Send + 'static,
    {
        Self(Box::new(callback))
    }

    /// Completion that resolves a oneshot receiver
    pub fn channel() -> (Self, oneshot::Receiver<Command>) {
        let (tx, rx) = oneshot::channel();
        let completion = Self::new(move |cmd| {
            // Receiver dropped means nobody is waiting any more
            let _ = tx.send(cmd);
        });
        (completion, rx)
    }

    pub(crate) fn complete(self, cmd: Command) {
        (self.0)(cmd)
    }
}

impl fmt::Debug for Completion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Completion")
    }
}

/// A command accepted into the slot
#[derive(Debug)]
pub(crate) struct Queued {
    pub command: Command,
    pub completion: Completion,
}

impl Queued {
    pub fn finish(self) {
        self.completion.complete(self.command);
    }
}

pub(crate) struct CommandChannel<'a> {
    machine: &'a StateMachine,
}

impl<'a> CommandChannel<'a> {
    pub fn new(machine: &'a StateMachine) -> Self {
        Self { machine }
    }

    /// Put a command in the slot, or hand it back
    pub fn enqueue(&self, command: Command, completion: Completion) -> Result<(), EnqueueError> {
        let mut inner = self.machine.lock();
        if inner.shutdown {
            return Err(EnqueueError::Disconnected(command));
        }
        if inner.state != WorkerState::Idle || inner.slot.is_some() || inner.reset_pending {
            debug!(state = %inner.state, "Rejecting command, session busy");
            return Err(EnqueueError::Busy(command));
        }
        inner.slot = Some(Queued {
            command,
            completion,
        });
        drop(inner);
        self.machine.notify();
        Ok(())
    }

    /// Block until a command can start
    ///
    /// Moves the session to RUNNING and calls `on_start` in the same critical
    /// section. Returns `None` once the session shuts down.
    pub fn take(&self, on_start: impl FnOnce()) -> Option<Queued> {
        let mut inner = self.machine.lock();
        loop {
            if inner.shutdown {
                return None;
            }
            if inner.state == WorkerState::Idle && !inner.reset_pending {
                if let Some(queued) = inner.slot.take() {
                    inner.state = WorkerState::Running;
                    on_start();
                    drop(inner);
                    self.machine.notify();
                    return Some(queued);
                }
            }
            inner = self.machine.wait(inner);
        }
    }
}
