//! USB mass-storage command engine
//!
//! Accepts block commands from a producer, runs them one at a time on a
//! per-device worker thread through the device's wire protocol (Bulk-Only,
//! Control/Bulk or Control/Bulk/Interrupt), resolves failures with automatic
//! REQUEST SENSE, and supports aborting the in-flight command and resetting
//! the device at any time.
//!
//! # Example
//!
//! ```no_run
//! use engine::{SessionConfig, usb};
//! use protocol::{Command, scsi};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let context = rusb::Context::new()?;
//! let device = rusb::UsbContext::devices(&context)?
//!     .iter()
//!     .next()
//!     .ok_or("no device")?;
//! let session = usb::open_session(&device, &SessionConfig::default())?;
//!
//! let rx = session
//!     .submit(Command::read(&scsi::inquiry(36), 36)?)
//!     .map_err(|e| e.to_string())?;
//! let done = rx.blocking_recv()?;
//! println!("{:?}", done.status);
//! # Ok(())
//! # }
//! ```

pub mod backend;
pub mod channel;
pub mod config;
mod coordinator;
pub mod data_stage;
pub mod error;
pub mod protocols;
pub mod recovery;
pub mod registry;
pub mod session;
pub mod state;
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;
pub mod usb;
mod worker;

pub use backend::{ControlRequest, Endpoints, TransferError, UsbBackend};
pub use channel::Completion;
pub use config::SessionConfig;
pub use error::{EnqueueError, Result, SessionError};
pub use protocols::{CustomProtocol, Link, Protocol, SensePolicy};
pub use registry::{DeviceKey, SessionRegistry};
pub use session::{DeviceBinding, DeviceSession, FlagSnapshot};
pub use state::WorkerState;
