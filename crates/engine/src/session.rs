//! Device session
//!
//! One session per attached device. It owns the protocol, the link to the
//! device, the worker thread and the synchronization shared between them,
//! and exposes the producer-facing operations: enqueue, abort and reset.

use crate::backend::{Endpoints, UsbBackend};
use crate::channel::{CommandChannel, Completion};
use crate::config::SessionConfig;
use crate::coordinator::AbortResetCoordinator;
use crate::error::{EnqueueError, SessionError};
use crate::protocols::{Link, Protocol, bulk_only};
use crate::registry::DeviceKey;
use crate::state::{StateMachine, WorkerState};
use crate::worker;
use protocol::{Command, CommandSet, CommandStatus};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use tokio::sync::oneshot;
use tracing::{error, info, warn};

/// Session-wide condition flags
#[derive(Debug, Default)]
pub(crate) struct SessionFlags {
    pub aborting: AtomicBool,
    pub disconnecting: AtomicBool,
    pub timed_out: AtomicBool,
}

/// Point-in-time copy of the session flags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FlagSnapshot {
    pub aborting: bool,
    pub disconnecting: bool,
    /// The last command hit a transfer deadline
    pub timed_out: bool,
}

/// Everything guarded by the per-device I/O lock
pub(crate) struct IoContext {
    pub protocol: Protocol,
    pub link: Link,
}

pub(crate) struct Shared {
    pub key: DeviceKey,
    pub machine: StateMachine,
    pub io: Mutex<IoContext>,
    pub backend: Arc<dyn UsbBackend>,
    pub flags: SessionFlags,
}

impl Shared {
    pub fn lock_io(&self) -> MutexGuard<'_, IoContext> {
        self.io.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// What a session is bound to
#[derive(Debug)]
pub struct DeviceBinding {
    pub key: DeviceKey,
    pub endpoints: Endpoints,
    pub protocol: Protocol,
    pub command_set: CommandSet,
}

pub struct DeviceSession {
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
    protocol_name: String,
    max_lun: u8,
}

impl DeviceSession {
    /// Bind a session to a device and start its worker
    pub fn bind(
        binding: DeviceBinding,
        backend: Arc<dyn UsbBackend>,
        config: &SessionConfig,
    ) -> Result<Self, SessionError> {
        let DeviceBinding {
            key,
            endpoints,
            protocol,
            command_set,
        } = binding;

        let link = Link::new(
            backend.clone(),
            endpoints,
            command_set,
            config.reset_settle(),
        );

        let mut max_lun = 0;
        if matches!(protocol, Protocol::BulkOnly) && config.query_max_lun {
            max_lun = bulk_only::get_max_lun(&link).unwrap_or_else(|err| {
                warn!(session = %key, %err, "Get Max LUN failed, assuming LUN 0");
                0
            });
        }

        let protocol_name = protocol.name().to_string();
        info!(
            session = %key,
            protocol = %protocol_name,
            ?command_set,
            max_lun,
            "Binding session"
        );

        let shared = Arc::new(Shared {
            key,
            machine: StateMachine::new(),
            io: Mutex::new(IoContext { protocol, link }),
            backend,
            flags: SessionFlags::default(),
        });
        let handle = worker::spawn(shared.clone())?;

        Ok(Self {
            shared,
            worker: Mutex::new(Some(handle)),
            protocol_name,
            max_lun,
        })
    }

    pub fn key(&self) -> DeviceKey {
        self.shared.key
    }

    pub fn protocol_name(&self) -> &str {
        &self.protocol_name
    }

    /// Highest LUN reported at bind time
    pub fn max_lun(&self) -> u8 {
        self.max_lun
    }

    pub fn state(&self) -> WorkerState {
        self.shared.machine.state()
    }

    pub fn flags(&self) -> FlagSnapshot {
        let flags = &self.shared.flags;
        FlagSnapshot {
            aborting: flags.aborting.load(Ordering::SeqCst),
            disconnecting: flags.disconnecting.load(Ordering::SeqCst),
            timed_out: flags.timed_out.load(Ordering::SeqCst),
        }
    }

    /// Queue a command; `completion` runs exactly once when it finishes
    pub fn enqueue(&self, command: Command, completion: Completion) -> Result<(), EnqueueError> {
        if self.shared.flags.disconnecting.load(Ordering::SeqCst) {
            return Err(EnqueueError::Disconnected(command));
        }
        CommandChannel::new(&self.shared.machine).enqueue(command, completion)
    }

    /// Queue a command and get a receiver for the finished command
    pub fn submit(&self, command: Command) -> Result<oneshot::Receiver<Command>, EnqueueError> {
        let (completion, rx) = Completion::channel();
        self.enqueue(command, completion)?;
        Ok(rx)
    }

    pub fn abort(&self) -> Result<(), SessionError> {
        AbortResetCoordinator::new(&self.shared).abort()
    }

    pub fn reset_device(&self) -> Result<(), SessionError> {
        AbortResetCoordinator::new(&self.shared).reset_device()
    }

    pub fn reset_bus(&self) -> Result<(), SessionError> {
        AbortResetCoordinator::new(&self.shared).reset_bus()
    }

    /// Stop the worker and complete anything left over
    ///
    /// Safe to call more than once; later calls do nothing.
    pub fn shutdown(&self) {
        let handle = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(handle) = handle else {
            return;
        };

        info!(session = %self.shared.key, "Shutting down session");
        self.shared.flags.disconnecting.store(true, Ordering::SeqCst);
        let leftover = self.shared.machine.shutdown();
        self.shared.backend.cancel();

        // A completion that drops the last session reference runs on the
        // worker itself
        if handle.thread().id() == thread::current().id() {
            warn!(session = %self.shared.key, "Shutdown from worker thread, not joining");
        } else if handle.join().is_err() {
            error!(session = %self.shared.key, "Worker thread panicked");
        }

        if let Some(mut queued) = leftover {
            queued.command.status = CommandStatus::Aborted;
            queued.finish();
        }
        info!(session = %self.shared.key, "Session closed");
    }
}

impl Drop for DeviceSession {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for DeviceSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceSession")
            .field("key", &self.shared.key)
            .field("protocol", &self.protocol_name)
            .field("state", &self.state())
            .finish()
    }
}
