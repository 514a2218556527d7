//! Session-level error types

use crate::backend::TransferError;
use crate::registry::DeviceKey;
use crate::state::WorkerState;
use protocol::Command;
use thiserror::Error;

/// Errors from session lifecycle and control operations
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("cannot {operation} while {state}")]
    InvalidState {
        state: WorkerState,
        operation: &'static str,
    },

    #[error("device exposes {interfaces} active interfaces, refusing bus reset")]
    SharedDevice { interfaces: usize },

    #[error("session is disconnecting")]
    Disconnected,

    #[error("reset handshake failed: {0}")]
    Reset(#[source] TransferError),

    #[error("failed to spawn worker thread: {0}")]
    WorkerSpawn(#[from] std::io::Error),

    #[error("USB error: {0}")]
    Usb(#[from] rusb::Error),

    #[error("no mass-storage interface found")]
    NoStorageInterface,

    #[error("unsupported interface protocol {0:#04x}")]
    UnsupportedProtocol(u8),

    #[error("interface has no {0} endpoint")]
    MissingEndpoint(&'static str),

    #[error("a session for {0} is already registered")]
    AlreadyRegistered(DeviceKey),
}

/// A command the session refused to accept
///
/// The command is handed back untouched.
#[derive(Debug, Error)]
pub enum EnqueueError {
    #[error("session is busy")]
    Busy(Command),

    #[error("session is disconnecting")]
    Disconnected(Command),
}

impl EnqueueError {
    pub fn into_command(self) -> Command {
        match self {
            EnqueueError::Busy(cmd) | EnqueueError::Disconnected(cmd) => cmd,
        }
    }
}

pub type Result<T> = std::result::Result<T, SessionError>;
