//! Host USB stack via `rusb`
//!
//! - `device`: find mass-storage interfaces and open sessions on them
//! - `backend`: the [`crate::UsbBackend`] implementation over a libusb handle

pub mod backend;
pub mod device;

pub use backend::{RusbBackend, map_rusb_error};
pub use device::{StorageDeviceInfo, StorageInterface, list_storage_devices, open_session};
