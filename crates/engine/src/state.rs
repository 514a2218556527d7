//! Worker state machine
//!
//! ```text
//!            take()                 abort()
//!   IDLE ───────────► RUNNING ───────────────► ABORTING
//!    ▲ ▲                 │  │                      │
//!    │ └──── complete ───┘  │ reset() (waits)      │ unwound
//!    │                      ▼                      │
//!    └──────────────── RESETTING ◄──── IDLE ◄──────┘
//! ```
//!
//! All transitions happen under one short-lived mutex that is never held
//! across device I/O. The same mutex guards the single command slot, so
//! "state is IDLE" and "slot is empty" are always observed together.

use crate::channel::Queued;
use crate::error::SessionError;
use std::fmt;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use tracing::{error, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum WorkerState {
    #[default]
    Idle,
    Running,
    Aborting,
    Resetting,
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            WorkerState::Idle => "IDLE",
            WorkerState::Running => "RUNNING",
            WorkerState::Aborting => "ABORTING",
            WorkerState::Resetting => "RESETTING",
        };
        f.write_str(name)
    }
}

pub(crate) struct Inner {
    pub state: WorkerState,
    pub slot: Option<Queued>,
    /// Worker has finished the command being aborted
    pub unwound: bool,
    /// A reset is waiting for the running command to finish
    pub reset_pending: bool,
    pub shutdown: bool,
}

/// What `begin_abort` found
pub(crate) enum AbortTicket {
    /// Nothing to abort
    Idle,
    /// A queued command was pulled out of the slot before it started
    Dequeued(Queued),
    /// A command is running; the caller must cancel it and wait
    InFlight,
}

pub(crate) struct StateMachine {
    inner: Mutex<Inner>,
    changed: Condvar,
}

impl StateMachine {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                state: WorkerState::Idle,
                slot: None,
                unwound: false,
                reset_pending: false,
                shutdown: false,
            }),
            changed: Condvar::new(),
        }
    }

    pub fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn wait<'a>(&self, guard: MutexGuard<'a, Inner>) -> MutexGuard<'a, Inner> {
        self.changed
            .wait(guard)
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn notify(&self) {
        self.changed.notify_all();
    }

    pub fn state(&self) -> WorkerState {
        self.lock().state
    }

    /// Worker finished its command
    ///
    /// Returns true when the command was being aborted; the abort caller is
    /// woken and will move the state back to IDLE.
    pub fn complete(&self) -> bool {
        let mut inner = self.lock();
        let aborted = match inner.state {
            WorkerState::Running => {
                inner.state = WorkerState::Idle;
                false
            }
            WorkerState::Aborting => {
                inner.unwound = true;
                true
            }
            other => {
                error!(state = %other, "Command completed in unexpected state");
                inner.state = WorkerState::Idle;
                false
            }
        };
        drop(inner);
        self.notify();
        aborted
    }

    pub fn begin_abort(&self) -> Result<AbortTicket, SessionError> {
        let mut inner = self.lock();
        match inner.state {
            WorkerState::Idle => Ok(match inner.slot.take() {
                Some(queued) => AbortTicket::Dequeued(queued),
                None => AbortTicket::Idle,
            }),
            WorkerState::Running => {
                inner.state = WorkerState::Aborting;
                inner.unwound = false;
                Ok(AbortTicket::InFlight)
            }
            state @ (WorkerState::Aborting | WorkerState::Resetting) => {
                warn!(%state, "Rejecting abort");
                Err(SessionError::InvalidState {
                    state,
                    operation: "abort",
                })
            }
        }
    }

    /// Block until the aborted command has unwound, then go IDLE
    pub fn wait_unwound(&self) {
        let mut inner = self.lock();
        while !inner.unwound {
            inner = self.wait(inner);
        }
        inner.unwound = false;
        inner.state = WorkerState::Idle;
        drop(inner);
        self.notify();
    }

    /// Enter RESETTING, waiting out a running command first
    pub fn begin_reset(&self) -> Result<(), SessionError> {
        let mut inner = self.lock();
        if inner.shutdown {
            return Err(SessionError::Disconnected);
        }
        if inner.reset_pending {
            warn!("Rejecting reset, another reset is pending");
            return Err(SessionError::InvalidState {
                state: inner.state,
                operation: "reset",
            });
        }
        match inner.state {
            WorkerState::Idle => {}
            WorkerState::Running => {
                inner.reset_pending = true;
                while inner.state != WorkerState::Idle && !inner.shutdown {
                    inner = self.wait(inner);
                }
                inner.reset_pending = false;
                if inner.shutdown {
                    drop(inner);
                    self.notify();
                    return Err(SessionError::Disconnected);
                }
            }
            state @ (WorkerState::Aborting | WorkerState::Resetting) => {
                warn!(%state, "Rejecting reset");
                return Err(SessionError::InvalidState {
                    state,
                    operation: "reset",
                });
            }
        }
        inner.state = WorkerState::Resetting;
        Ok(())
    }

    pub fn finish_reset(&self) {
        let mut inner = self.lock();
        inner.state = WorkerState::Idle;
        drop(inner);
        self.notify();
    }

    /// Stop accepting work; returns a command that never started
    pub fn shutdown(&self) -> Option<Queued> {
        let mut inner = self.lock();
        inner.shutdown = true;
        let leftover = inner.slot.take();
        drop(inner);
        self.notify();
        leftover
    }
}
