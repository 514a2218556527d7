//! Transfer primitive boundary
//!
//! The engine never talks to a USB stack directly. Every device-touching
//! call goes through [`UsbBackend`], which offers blocking control, bulk and
//! interrupt transfers plus the few endpoint-management operations the
//! protocols need. The `rusb` implementation lives in [`crate::usb`]; tests
//! use [`crate::test_utils::MockBackend`].

use thiserror::Error;

/// Classified failure of a single transfer call
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransferError {
    /// Endpoint halted; must be cleared before reuse
    #[error("endpoint stalled")]
    Stall,

    /// Transfer was cancelled on behalf of an abort or shutdown
    #[error("transfer cancelled")]
    Cancelled,

    /// Transfer deadline expired
    #[error("transfer timed out")]
    Timeout,

    /// Device is gone
    #[error("device disconnected")]
    NoDevice,

    #[error("transfer failed: {0}")]
    Other(String),
}

/// Setup fields of a control request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlRequest {
    pub request_type: u8,
    pub request: u8,
    pub value: u16,
    pub index: u16,
}

impl ControlRequest {
    /// Class request to an interface, host-to-device
    pub fn class_out(request: u8, interface: u8) -> Self {
        Self {
            request_type: 0x21,
            request,
            value: 0,
            index: interface as u16,
        }
    }

    /// Class request to an interface, device-to-host
    pub fn class_in(request: u8, interface: u8) -> Self {
        Self {
            request_type: 0xa1,
            request,
            value: 0,
            index: interface as u16,
        }
    }
}

/// Blocking transfer primitive for one device
///
/// Implementations must be safe to call `cancel` from any thread while
/// another thread is blocked inside a transfer. Cancellation is sticky: once
/// `cancel` is called every transfer fails with [`TransferError::Cancelled`]
/// until `rearm` is called.
pub trait UsbBackend: Send + Sync {
    fn control_out(&self, request: ControlRequest, data: &[u8]) -> Result<usize, TransferError>;

    fn control_in(&self, request: ControlRequest, buf: &mut [u8])
    -> Result<usize, TransferError>;

    fn bulk_out(&self, endpoint: u8, data: &[u8]) -> Result<usize, TransferError>;

    fn bulk_in(&self, endpoint: u8, buf: &mut [u8]) -> Result<usize, TransferError>;

    fn interrupt_in(&self, endpoint: u8, buf: &mut [u8]) -> Result<usize, TransferError>;

    /// Clear a halt condition on an endpoint
    fn clear_halt(&self, endpoint: u8) -> Result<(), TransferError>;

    /// Break any in-flight transfer and fail all later ones
    fn cancel(&self);

    /// Undo a previous `cancel`
    fn rearm(&self);

    /// Port-level reset of the whole device
    fn reset_port(&self) -> Result<(), TransferError>;

    /// Interfaces in the active configuration
    fn active_interfaces(&self) -> usize;
}

/// Endpoint addresses of a mass-storage interface
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Endpoints {
    pub interface: u8,
    pub bulk_in: u8,
    pub bulk_out: u8,
    pub interrupt_in: Option<u8>,
}

impl Default for Endpoints {
    fn default() -> Self {
        Self {
            interface: 0,
            bulk_in: 0x81,
            bulk_out: 0x02,
            interrupt_in: None,
        }
    }
}
