//! Abort and reset requests from outside the worker

use crate::error::SessionError;
use crate::session::Shared;
use crate::state::AbortTicket;
use protocol::CommandStatus;
use std::sync::atomic::Ordering;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ResetScope {
    Device,
    Bus,
}

pub(crate) struct AbortResetCoordinator<'a> {
    shared: &'a Shared,
}

impl<'a> AbortResetCoordinator<'a> {
    pub fn new(shared: &'a Shared) -> Self {
        Self { shared }
    }

    /// Cancel the active command and wait until it has unwound
    pub fn abort(&self) -> Result<(), SessionError> {
        match self.shared.machine.begin_abort()? {
            AbortTicket::Idle => {
                debug!(session = %self.shared.key, "Abort with no active command");
                Ok(())
            }
            AbortTicket::Dequeued(mut queued) => {
                info!(session = %self.shared.key, "Aborting queued command");
                queued.command.status = CommandStatus::Aborted;
                queued.finish();
                Ok(())
            }
            AbortTicket::InFlight => {
                info!(session = %self.shared.key, "Aborting in-flight command");
                self.shared.flags.aborting.store(true, Ordering::SeqCst);
                self.shared.backend.cancel();
                self.shared.machine.wait_unwound();
                self.shared.flags.aborting.store(false, Ordering::SeqCst);
                debug!(session = %self.shared.key, "Abort complete");
                Ok(())
            }
        }
    }

    pub fn reset_device(&self) -> Result<(), SessionError> {
        self.reset(ResetScope::Device)
    }

    /// Port reset; refused when other interfaces share the device
    pub fn reset_bus(&self) -> Result<(), SessionError> {
        let interfaces = self.shared.backend.active_interfaces();
        if interfaces > 1 {
            warn!(
                session = %self.shared.key,
                interfaces,
                "Refusing bus reset on shared device"
            );
            return Err(SessionError::SharedDevice { interfaces });
        }
        self.reset(ResetScope::Bus)
    }

    fn reset(&self, scope: ResetScope) -> Result<(), SessionError> {
        self.shared.machine.begin_reset()?;
        info!(session = %self.shared.key, ?scope, "Resetting");

        let result = {
            let mut io = self.shared.lock_io();
            self.shared.backend.rearm();
            match scope {
                ResetScope::Device => {
                    let io = &mut *io;
                    io.protocol.reset(&mut io.link)
                }
                ResetScope::Bus => self.shared.backend.reset_port(),
            }
        };

        self.shared.machine.finish_reset();
        match result {
            Ok(()) => {
                info!(session = %self.shared.key, ?scope, "Reset complete");
                Ok(())
            }
            Err(err) => {
                warn!(session = %self.shared.key, ?scope, %err, "Reset failed");
                Err(SessionError::Reset(err))
            }
        }
    }
}
