//! Protocol library for the USB mass-storage engine
//!
//! This crate defines everything the engine exchanges with a producer or a
//! device, without performing any I/O: block commands and their final
//! status, the fixed-format sense buffer, the Bulk-Only wire frames, and the
//! identifiers read from a mass-storage interface descriptor.
//!
//! # Example
//!
//! ```
//! use protocol::{Command, CommandWrapper, CswStatus, StatusWrapper, scsi};
//!
//! let cmd = Command::read(&scsi::read_10(0, 1), 512).unwrap();
//! let cbw = CommandWrapper::new(7, &cmd, cmd.cdb()).unwrap();
//! assert_eq!(cbw.encode().len(), 31);
//!
//! let csw = StatusWrapper { tag: 7, residue: 0, status: CswStatus::Passed };
//! let parsed = StatusWrapper::decode_for(&csw.encode(), 7).unwrap();
//! assert_eq!(parsed.status, CswStatus::Passed);
//! ```

pub mod command;
pub mod error;
pub mod scsi;
pub mod types;
pub mod wire;

pub use command::{Command, DataBuffer, MAX_CDB_LEN};
pub use error::{ProtocolError, Result};
pub use scsi::{SENSE_LEN, SenseData, SenseKey};
pub use types::{
    CommandSet, CommandStatus, Direction, MASS_STORAGE_CLASS, ProtocolKind, TransportResult,
};
pub use wire::{
    CBW_LEN, CBW_SIGNATURE, CSW_LEN, CSW_SIGNATURE, CommandWrapper, CswStatus, StatusWrapper,
};
