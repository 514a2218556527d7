//! Test utilities for engine tests
//!
//! [`MockBackend`] is a scripted [`UsbBackend`]: every transfer call is
//! recorded and answered from a FIFO of [`Reply`] values. An empty script
//! answers every transfer in full. Halt clears and port resets are recorded
//! but never consume a reply.

use crate::backend::{ControlRequest, Endpoints, TransferError, UsbBackend};
use crate::config::SessionConfig;
use crate::protocols::Protocol;
use crate::registry::DeviceKey;
use crate::session::{DeviceBinding, DeviceSession};
use protocol::{CBW_LEN, CBW_SIGNATURE, Command, CommandSet, CswStatus, SENSE_LEN, StatusWrapper};
use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tokio::sync::oneshot;

/// Default timeout for test operations
pub const DEFAULT_TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// A recorded backend call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    ControlOut { request: ControlRequest, data: Vec<u8> },
    ControlIn { request: ControlRequest, len: usize },
    BulkOut { endpoint: u8, data: Vec<u8> },
    BulkIn { endpoint: u8, len: usize },
    InterruptIn { endpoint: u8, len: usize },
    ClearHalt(u8),
    ResetPort,
}

/// Scripted answer to the next transfer
#[derive(Debug, Clone)]
pub enum Reply {
    /// Move the full requested length
    Accept,
    /// Reads receive these bytes (truncated to the buffer); writes move all
    Data(Vec<u8>),
    /// Report exactly this many bytes moved
    Partial(usize),
    /// StatusWrapper echoing the tag of the most recent CommandWrapper
    Csw { status: CswStatus, residue: u32 },
    Fail(TransferError),
    /// Block until the backend is cancelled, then fail with `Cancelled`
    Block,
    /// Wait, then answer with the inner reply
    Delayed(Duration, Box<Reply>),
}

#[derive(Default)]
struct MockState {
    calls: Vec<Call>,
    replies: VecDeque<Reply>,
    cancelled: bool,
    blocked: usize,
    active: usize,
    overlaps: usize,
    last_tag: u32,
    interfaces: usize,
}

pub struct MockBackend {
    state: Mutex<MockState>,
    signal: Condvar,
}

impl MockBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(MockState {
                interfaces: 1,
                ..Default::default()
            }),
            signal: Condvar::new(),
        })
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn push(&self, reply: Reply) {
        self.lock().replies.push_back(reply);
    }

    pub fn push_all(&self, replies: impl IntoIterator<Item = Reply>) {
        self.lock().replies.extend(replies);
    }

    pub fn set_active_interfaces(&self, count: usize) {
        self.lock().interfaces = count;
    }

    pub fn calls(&self) -> Vec<Call> {
        self.lock().calls.clone()
    }

    /// Payloads written to bulk-out, in order
    pub fn bulk_out_payloads(&self) -> Vec<Vec<u8>> {
        self.lock()
            .calls
            .iter()
            .filter_map(|call| match call {
                Call::BulkOut { data, .. } => Some(data.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn halts_cleared(&self) -> Vec<u8> {
        self.lock()
            .calls
            .iter()
            .filter_map(|call| match call {
                Call::ClearHalt(endpoint) => Some(*endpoint),
                _ => None,
            })
            .collect()
    }

    pub fn remaining_replies(&self) -> usize {
        self.lock().replies.len()
    }

    pub fn is_cancelled(&self) -> bool {
        self.lock().cancelled
    }

    /// Calls that started while another call was still in progress
    pub fn overlapping_calls(&self) -> usize {
        self.lock().overlaps
    }

    /// Wait until some transfer is parked on a [`Reply::Block`]
    pub fn wait_until_blocked(&self, timeout: Duration) -> bool {
        let state = self.lock();
        let (state, _) = self
            .signal
            .wait_timeout_while(state, timeout, |state| state.blocked == 0)
            .unwrap_or_else(PoisonError::into_inner);
        state.blocked > 0
    }

    fn begin(&self, call: Call) -> Result<Reply, TransferError> {
        let mut state = self.lock();
        if let Call::BulkOut { data, .. } = &call {
            if data.len() == CBW_LEN && data[0..4] == CBW_SIGNATURE.to_le_bytes() {
                state.last_tag = u32::from_le_bytes([data[4], data[5], data[6], data[7]]);
            }
        }
        if state.active > 0 {
            state.overlaps += 1;
        }
        state.calls.push(call);
        if state.cancelled {
            return Err(TransferError::Cancelled);
        }
        state.active += 1;
        Ok(state.replies.pop_front().unwrap_or(Reply::Accept))
    }

    fn end(&self) {
        let mut state = self.lock();
        state.active = state.active.saturating_sub(1);
    }

    fn block_until_cancelled(&self) -> TransferError {
        let mut state = self.lock();
        state.blocked += 1;
        self.signal.notify_all();
        while !state.cancelled {
            state = self
                .signal
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
        state.blocked -= 1;
        TransferError::Cancelled
    }

    fn read(&self, call: Call, buf: &mut [u8]) -> Result<usize, TransferError> {
        let reply = self.begin(call)?;
        let result = self.resolve_read(reply, buf);
        self.end();
        result
    }

    fn write(&self, call: Call, len: usize) -> Result<usize, TransferError> {
        let reply = self.begin(call)?;
        let result = self.resolve_write(reply, len);
        self.end();
        result
    }

    fn resolve_read(&self, reply: Reply, buf: &mut [u8]) -> Result<usize, TransferError> {
        match reply {
            Reply::Accept => Ok(buf.len()),
            Reply::Data(bytes) => {
                let len = bytes.len().min(buf.len());
                buf[..len].copy_from_slice(&bytes[..len]);
                Ok(len)
            }
            Reply::Partial(len) => Ok(len),
            Reply::Csw { status, residue } => {
                let tag = self.lock().last_tag;
                let frame = StatusWrapper {
                    tag,
                    residue,
                    status,
                }
                .encode();
                let len = frame.len().min(buf.len());
                buf[..len].copy_from_slice(&frame[..len]);
                Ok(len)
            }
            Reply::Fail(err) => Err(err),
            Reply::Block => Err(self.block_until_cancelled()),
            Reply::Delayed(delay, inner) => {
                thread::sleep(delay);
                self.resolve_read(*inner, buf)
            }
        }
    }

    fn resolve_write(&self, reply: Reply, len: usize) -> Result<usize, TransferError> {
        match reply {
            Reply::Accept | Reply::Data(_) | Reply::Csw { .. } => Ok(len),
            Reply::Partial(moved) => Ok(moved),
            Reply::Fail(err) => Err(err),
            Reply::Block => Err(self.block_until_cancelled()),
            Reply::Delayed(delay, inner) => {
                thread::sleep(delay);
                self.resolve_write(*inner, len)
            }
        }
    }
}

impl UsbBackend for MockBackend {
    fn control_out(&self, request: ControlRequest, data: &[u8]) -> Result<usize, TransferError> {
        self.write(
            Call::ControlOut {
                request,
                data: data.to_vec(),
            },
            data.len(),
        )
    }

    fn control_in(
        &self,
        request: ControlRequest,
        buf: &mut [u8],
    ) -> Result<usize, TransferError> {
        self.read(
            Call::ControlIn {
                request,
                len: buf.len(),
            },
            buf,
        )
    }

    fn bulk_out(&self, endpoint: u8, data: &[u8]) -> Result<usize, TransferError> {
        self.write(
            Call::BulkOut {
                endpoint,
                data: data.to_vec(),
            },
            data.len(),
        )
    }

    fn bulk_in(&self, endpoint: u8, buf: &mut [u8]) -> Result<usize, TransferError> {
        self.read(
            Call::BulkIn {
                endpoint,
                len: buf.len(),
            },
            buf,
        )
    }

    fn interrupt_in(&self, endpoint: u8, buf: &mut [u8]) -> Result<usize, TransferError> {
        self.read(
            Call::InterruptIn {
                endpoint,
                len: buf.len(),
            },
            buf,
        )
    }

    fn clear_halt(&self, endpoint: u8) -> Result<(), TransferError> {
        self.lock().calls.push(Call::ClearHalt(endpoint));
        Ok(())
    }

    fn cancel(&self) {
        self.lock().cancelled = true;
        self.signal.notify_all();
    }

    fn rearm(&self) {
        self.lock().cancelled = false;
    }

    fn reset_port(&self) -> Result<(), TransferError> {
        self.lock().calls.push(Call::ResetPort);
        Ok(())
    }

    fn active_interfaces(&self) -> usize {
        self.lock().interfaces
    }
}

/// Fixed-format sense data with the given key, ASC and ASCQ
pub fn sense_bytes(key: u8, asc: u8, ascq: u8) -> Vec<u8> {
    let mut sense = vec![0u8; SENSE_LEN];
    sense[0] = 0x70;
    sense[2] = key & 0x0f;
    sense[7] = (SENSE_LEN - 8) as u8;
    sense[12] = asc;
    sense[13] = ascq;
    sense
}

/// Session config with delays short enough for tests
pub fn fast_config() -> SessionConfig {
    SessionConfig {
        reset_settle_ms: 1,
        query_max_lun: false,
        ..Default::default()
    }
}

/// Bind a session to a fresh mock
pub fn mock_session(
    protocol: Protocol,
    command_set: CommandSet,
) -> (DeviceSession, Arc<MockBackend>) {
    let mock = MockBackend::new();
    let endpoints = Endpoints {
        interrupt_in: Some(0x83),
        ..Default::default()
    };
    let session = DeviceSession::bind(
        DeviceBinding {
            key: DeviceKey::new(1, 1),
            endpoints,
            protocol,
            command_set,
        },
        mock.clone(),
        &fast_config(),
    )
    .expect("bind mock session");
    (session, mock)
}

/// Wait for a completion without hanging the test
pub fn recv_within(mut rx: oneshot::Receiver<Command>, timeout: Duration) -> Option<Command> {
    let deadline = Instant::now() + timeout;
    loop {
        match rx.try_recv() {
            Ok(cmd) => return Some(cmd),
            Err(oneshot::error::TryRecvError::Closed) => return None,
            Err(oneshot::error::TryRecvError::Empty) => {}
        }
        if Instant::now() >= deadline {
            return None;
        }
        thread::sleep(Duration::from_millis(2));
    }
}

/// Join a thread, giving up after `deadline`
pub fn with_deadline<T>(handle: JoinHandle<T>, deadline: Duration) -> Option<T> {
    let start = Instant::now();
    while !handle.is_finished() {
        if start.elapsed() >= deadline {
            return None;
        }
        thread::sleep(Duration::from_millis(2));
    }
    handle.join().ok()
}
