//! Shared vocabulary types
//!
//! This module defines the small closed enums every layer of the engine
//! agrees on: data direction, transport results, final command status and
//! the protocol / command-set identifiers read from a mass-storage interface
//! descriptor.

use serde::{Deserialize, Serialize};
use std::fmt;

/// USB interface class code for mass storage
pub const MASS_STORAGE_CLASS: u8 = 0x08;

/// Data phase direction of a command
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    /// No data phase
    #[default]
    None,
    /// Device to host
    In,
    /// Host to device
    Out,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::None => "none",
            Direction::In => "in",
            Direction::Out => "out",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of one pass through a wire protocol
///
/// This is the only vocabulary error recovery and the worker reason about.
/// Variants are ordered by severity so two stage results can be combined
/// with [`TransportResult::worst`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TransportResult {
    /// Command completed
    Good,
    /// Less data than requested moved, without an explicit device error
    Short,
    /// Device reported a check condition
    Failed,
    /// Transport malfunction, may need a reset
    Error,
    /// Externally cancelled
    Aborted,
}

impl TransportResult {
    /// Combine two stage results, keeping the more severe one
    pub fn worst(self, other: TransportResult) -> TransportResult {
        self.max(other)
    }

    /// ERROR and ABORTED leave the protocol immediately
    pub fn is_terminal(&self) -> bool {
        matches!(self, TransportResult::Error | TransportResult::Aborted)
    }
}

impl fmt::Display for TransportResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TransportResult::Good => "GOOD",
            TransportResult::Short => "SHORT",
            TransportResult::Failed => "FAILED",
            TransportResult::Error => "ERROR",
            TransportResult::Aborted => "ABORTED",
        };
        f.write_str(name)
    }
}

/// Final status handed back to the command producer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum CommandStatus {
    /// Not yet processed by the engine
    #[default]
    Pending,
    /// Command succeeded
    Good,
    /// Command failed; the sense buffer says why
    CheckCondition,
    /// Transport failure, no sense data available
    Error,
    /// Command was cancelled
    Aborted,
}

impl CommandStatus {
    pub fn is_good(&self) -> bool {
        matches!(self, CommandStatus::Good)
    }
}

/// Wire protocol spoken by a mass-storage interface
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProtocolKind {
    /// Bulk-Only Transport (interface protocol 0x50)
    BulkOnly,
    /// Control/Bulk without command completion interrupt (0x01)
    ControlBulk,
    /// Control/Bulk/Interrupt (0x00)
    ControlBulkInterrupt,
}

impl ProtocolKind {
    /// Map a `bInterfaceProtocol` value
    pub fn from_interface_protocol(code: u8) -> Option<Self> {
        match code {
            0x50 => Some(ProtocolKind::BulkOnly),
            0x01 => Some(ProtocolKind::ControlBulk),
            0x00 => Some(ProtocolKind::ControlBulkInterrupt),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ProtocolKind::BulkOnly => "Bulk-Only",
            ProtocolKind::ControlBulk => "Control/Bulk",
            ProtocolKind::ControlBulkInterrupt => "Control/Bulk/Interrupt",
        }
    }
}

impl fmt::Display for ProtocolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Command set spoken by a mass-storage interface (`bInterfaceSubClass`)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandSet {
    /// Reduced Block Commands (0x01)
    Rbc,
    /// MMC-5 / ATAPI (0x02)
    Mmc5,
    /// QIC-157 tape (0x03)
    Qic157,
    /// UFI floppy (0x04)
    Ufi,
    /// SFF-8070i (0x05)
    Sff8070,
    /// SCSI transparent (0x06)
    #[default]
    Transparent,
}

impl CommandSet {
    /// Map a `bInterfaceSubClass` value
    pub fn from_subclass(code: u8) -> Option<Self> {
        match code {
            0x01 => Some(CommandSet::Rbc),
            0x02 => Some(CommandSet::Mmc5),
            0x03 => Some(CommandSet::Qic157),
            0x04 => Some(CommandSet::Ufi),
            0x05 => Some(CommandSet::Sff8070),
            0x06 => Some(CommandSet::Transparent),
            _ => None,
        }
    }

    /// Fixed command block length on the wire, if the command set has one
    ///
    /// ATAPI-derived command sets always take 12-byte, zero-padded blocks.
    pub fn fixed_command_len(&self) -> Option<usize> {
        match self {
            CommandSet::Mmc5 | CommandSet::Qic157 | CommandSet::Ufi | CommandSet::Sff8070 => {
                Some(12)
            }
            CommandSet::Rbc | CommandSet::Transparent => None,
        }
    }

    pub fn is_ufi(&self) -> bool {
        matches!(self, CommandSet::Ufi)
    }
}
