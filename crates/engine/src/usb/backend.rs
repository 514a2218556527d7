//! `UsbBackend` over a claimed libusb device handle
//!
//! libusb's synchronous transfers cannot be interrupted from another thread,
//! so each transfer is issued in bounded slices with the cancel flag and the
//! overall deadline checked in between.
//!
//! Only transfers that fit in a single packet are resubmitted after a slice
//! times out: a timeout there means nothing moved. Larger data transfers are
//! issued chunk by chunk, and a chunk that times out fails the transfer,
//! since libusb does not report how much of it reached the device.

use crate::backend::{ControlRequest, TransferError, UsbBackend};
use crate::config::SessionConfig;
use rusb::{Context, DeviceHandle};
use std::ops::Range;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

pub struct RusbBackend {
    handle: DeviceHandle<Context>,
    interface: u8,
    detached_driver: bool,
    interfaces: usize,
    cancelled: AtomicBool,
    transfer_timeout: Duration,
    poll: Duration,
    data_slice: Duration,
}

/// Largest transfer that fits in one full-speed packet
pub const REPLAYABLE_LEN: usize = 64;
/// Bytes submitted per data chunk, a multiple of every bulk packet size
pub const DATA_CHUNK_LEN: usize = 64 * 1024;

impl RusbBackend {
    /// Take over `interface` on an open handle
    ///
    /// Detaches an active kernel driver first; it is reattached on drop.
    pub fn claim(
        handle: DeviceHandle<Context>,
        interface: u8,
        alt_setting: u8,
        interfaces: usize,
        config: &SessionConfig,
    ) -> Result<Self, rusb::Error> {
        let detached_driver = match handle.kernel_driver_active(interface) {
            Ok(true) => {
                debug!(interface, "Detaching kernel driver");
                handle.detach_kernel_driver(interface)?;
                true
            }
            Ok(false) => false,
            Err(e) => {
                debug!(interface, "Could not check kernel driver status: {}", e);
                false
            }
        };

        if let Err(e) = handle.claim_interface(interface) {
            warn!(interface, "Failed to claim interface: {}", e);
            if detached_driver {
                let _ = handle.attach_kernel_driver(interface);
            }
            return Err(e);
        }
        if alt_setting != 0 {
            handle.set_alternate_setting(interface, alt_setting)?;
        }
        debug!(interface, alt_setting, "Claimed interface");

        Ok(Self {
            handle,
            interface,
            detached_driver,
            interfaces,
            cancelled: AtomicBool::new(false),
            transfer_timeout: config.transfer_timeout(),
            poll: config.cancel_poll(),
            data_slice: config.data_slice(),
        })
    }

    fn pacing(&self) -> Pacing<'_> {
        Pacing {
            cancelled: &self.cancelled,
            deadline: Instant::now() + self.transfer_timeout,
        }
    }
}

/// Deadline and cancel flag governing one transfer
struct Pacing<'a> {
    cancelled: &'a AtomicBool,
    deadline: Instant,
}

impl Pacing<'_> {
    /// Time left before the deadline, or why the transfer has to stop
    fn remaining(&self, op: &'static str) -> Result<Duration, TransferError> {
        if self.cancelled.load(Ordering::SeqCst) {
            return Err(TransferError::Cancelled);
        }
        let now = Instant::now();
        if now >= self.deadline {
            debug!(op, "Transfer deadline expired");
            return Err(TransferError::Timeout);
        }
        Ok(self.deadline - now)
    }
}

/// Run a single-packet `attempt` in poll-sized slices until it completes,
/// fails, is cancelled or runs out of time
fn replayed<F>(
    pacing: &Pacing<'_>,
    op: &'static str,
    poll: Duration,
    mut attempt: F,
) -> Result<usize, TransferError>
where
    F: FnMut(Duration) -> rusb::Result<usize>,
{
    loop {
        let slice = pacing.remaining(op)?.min(poll);
        match attempt(slice) {
            Ok(len) => return Ok(len),
            Err(rusb::Error::Timeout) | Err(rusb::Error::Interrupted) => {
                trace!(op, "Slice elapsed, resubmitting");
            }
            Err(err) => return Err(map_rusb_error(err)),
        }
    }
}

/// Move `len` bytes in `DATA_CHUNK_LEN` pieces, each submitted exactly once
///
/// A short chunk ends the transfer. A chunk that times out fails it with
/// `Timeout`; the caller has to resynchronise the device before reuse.
fn chunked<F>(
    pacing: &Pacing<'_>,
    op: &'static str,
    len: usize,
    slice: Duration,
    mut attempt: F,
) -> Result<usize, TransferError>
where
    F: FnMut(Range<usize>, Duration) -> rusb::Result<usize>,
{
    let mut done = 0;
    while done < len {
        let timeout = pacing.remaining(op)?.min(slice);
        let end = (done + DATA_CHUNK_LEN).min(len);
        let requested = end - done;
        match attempt(done..end, timeout) {
            Ok(moved) => {
                done += moved;
                if moved < requested {
                    trace!(op, done, "Short chunk ends transfer");
                    break;
                }
            }
            Err(rusb::Error::Timeout) => {
                warn!(op, done, len, "Data chunk timed out");
                return Err(TransferError::Timeout);
            }
            Err(err) => return Err(map_rusb_error(err)),
        }
    }
    Ok(done)
}

impl UsbBackend for RusbBackend {
    fn control_out(&self, request: ControlRequest, data: &[u8]) -> Result<usize, TransferError> {
        replayed(&self.pacing(), "control-out", self.poll, |timeout| {
            self.handle.write_control(
                request.request_type,
                request.request,
                request.value,
                request.index,
                data,
                timeout,
            )
        })
    }

    fn control_in(
        &self,
        request: ControlRequest,
        buf: &mut [u8],
    ) -> Result<usize, TransferError> {
        replayed(&self.pacing(), "control-in", self.poll, |timeout| {
            self.handle.read_control(
                request.request_type,
                request.request,
                request.value,
                request.index,
                &mut *buf,
                timeout,
            )
        })
    }

    fn bulk_out(&self, endpoint: u8, data: &[u8]) -> Result<usize, TransferError> {
        let pacing = self.pacing();
        if data.len() <= REPLAYABLE_LEN {
            return replayed(&pacing, "bulk-out", self.poll, |timeout| {
                self.handle.write_bulk(endpoint, data, timeout)
            });
        }
        chunked(&pacing, "bulk-out", data.len(), self.data_slice, |range, timeout| {
            self.handle.write_bulk(endpoint, &data[range], timeout)
        })
    }

    fn bulk_in(&self, endpoint: u8, buf: &mut [u8]) -> Result<usize, TransferError> {
        let pacing = self.pacing();
        let len = buf.len();
        if len <= REPLAYABLE_LEN {
            return replayed(&pacing, "bulk-in", self.poll, |timeout| {
                self.handle.read_bulk(endpoint, &mut *buf, timeout)
            });
        }
        chunked(&pacing, "bulk-in", len, self.data_slice, |range, timeout| {
            self.handle.read_bulk(endpoint, &mut buf[range], timeout)
        })
    }

    fn interrupt_in(&self, endpoint: u8, buf: &mut [u8]) -> Result<usize, TransferError> {
        replayed(&self.pacing(), "interrupt-in", self.poll, |timeout| {
            self.handle.read_interrupt(endpoint, &mut *buf, timeout)
        })
    }

    fn clear_halt(&self, endpoint: u8) -> Result<(), TransferError> {
        self.handle.clear_halt(endpoint).map_err(map_rusb_error)
    }

    fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    fn rearm(&self) {
        self.cancelled.store(false, Ordering::SeqCst);
    }

    fn reset_port(&self) -> Result<(), TransferError> {
        debug!(interface = self.interface, "Port reset");
        self.handle.reset().map_err(map_rusb_error)
    }

    fn active_interfaces(&self) -> usize {
        self.interfaces
    }
}

impl Drop for RusbBackend {
    fn drop(&mut self) {
        if let Err(e) = self.handle.release_interface(self.interface) {
            warn!(interface = self.interface, "Failed to release interface: {}", e);
        }
        if self.detached_driver {
            match self.handle.attach_kernel_driver(self.interface) {
                Ok(()) => debug!(interface = self.interface, "Reattached kernel driver"),
                Err(e) => debug!(
                    interface = self.interface,
                    "Could not reattach kernel driver: {}", e
                ),
            }
        }
    }
}

/// Classify a libusb error for the protocols
pub fn map_rusb_error(err: rusb::Error) -> TransferError {
    match err {
        rusb::Error::Pipe => TransferError::Stall,
        rusb::Error::Timeout => TransferError::Timeout,
        rusb::Error::NoDevice => TransferError::NoDevice,
        rusb::Error::Interrupted => TransferError::Cancelled,
        _ => TransferError::Other(err.to_string()),
    }
}
