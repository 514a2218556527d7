//! Per-session tuning

use protocol::{CommandSet, ProtocolKind};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Session configuration
///
/// Every field has a default so a partial `[session]` table is valid.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Force a wire protocol instead of the one the interface advertises
    pub protocol: Option<ProtocolKind>,
    /// Force a command set instead of the interface subclass
    pub command_set: Option<CommandSet>,
    /// Deadline for a single transfer
    pub transfer_timeout_ms: u64,
    /// How often a blocked transfer checks for cancellation
    pub cancel_poll_ms: u64,
    /// Longest a bulk data chunk may block; a chunk that overruns it fails
    /// the command and resets the device
    pub data_slice_ms: u64,
    /// Delay after a Control/Bulk reset before the device is usable again
    pub reset_settle_ms: u64,
    /// Issue Get Max LUN when a Bulk-Only session binds
    pub query_max_lun: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            protocol: None,
            command_set: None,
            transfer_timeout_ms: 20_000,
            cancel_poll_ms: 100,
            data_slice_ms: 5_000,
            reset_settle_ms: 6_000,
            query_max_lun: true,
        }
    }
}

impl SessionConfig {
    pub fn transfer_timeout(&self) -> Duration {
        Duration::from_millis(self.transfer_timeout_ms)
    }

    /// Poll interval, never zero
    pub fn cancel_poll(&self) -> Duration {
        Duration::from_millis(self.cancel_poll_ms.max(1))
    }

    /// Data chunk timeout, never shorter than the poll interval
    pub fn data_slice(&self) -> Duration {
        Duration::from_millis(self.data_slice_ms).max(self.cancel_poll())
    }

    pub fn reset_settle(&self) -> Duration {
        Duration::from_millis(self.reset_settle_ms)
    }
}
