//! Common utilities for usb-storage
//!
//! Shared application plumbing: the application error type, logging setup
//! and `VID:PID` device filters.

pub mod error;
pub mod filter;
pub mod logging;

pub use error::{Error, Result};
pub use filter::DeviceFilter;
pub use logging::setup_logging;
