//! Wire protocol variants
//!
//! A session speaks exactly one of the mass-storage transports. The variant
//! is a closed enum dispatched through [`Protocol::execute`]; device-specific
//! command-translation backends plug in as [`Protocol::Custom`] behind the
//! same contract.
//!
//! Everything a protocol needs from the device lives in [`Link`], which is
//! only ever reachable while holding the session's I/O lock.

pub mod bulk_only;
pub mod control_bulk;

use crate::backend::{Endpoints, TransferError, UsbBackend};
use protocol::{Command, CommandSet, ProtocolKind, TransportResult, scsi};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Device-side state shared by every protocol call of one session
pub struct Link {
    backend: Arc<dyn UsbBackend>,
    endpoints: Endpoints,
    command_set: CommandSet,
    reset_settle: Duration,
    next_tag: u32,
    reset_required: bool,
    timed_out: bool,
}

impl Link {
    pub fn new(
        backend: Arc<dyn UsbBackend>,
        endpoints: Endpoints,
        command_set: CommandSet,
        reset_settle: Duration,
    ) -> Self {
        Self {
            backend,
            endpoints,
            command_set,
            reset_settle,
            next_tag: 1,
            reset_required: false,
            timed_out: false,
        }
    }

    pub fn backend(&self) -> &dyn UsbBackend {
        self.backend.as_ref()
    }

    pub fn endpoints(&self) -> &Endpoints {
        &self.endpoints
    }

    pub fn command_set(&self) -> CommandSet {
        self.command_set
    }

    pub fn reset_settle(&self) -> Duration {
        self.reset_settle
    }

    /// Allocate the tag for the next CommandWrapper
    pub fn next_tag(&mut self) -> u32 {
        let tag = self.next_tag;
        self.next_tag = self.next_tag.wrapping_add(1);
        tag
    }

    /// Command block as it goes on the wire
    ///
    /// ATAPI-derived command sets get their block zero-padded to 12 bytes.
    pub fn wire_cdb(&self, cmd: &Command) -> Vec<u8> {
        let mut cdb = cmd.cdb().to_vec();
        if let Some(fixed) = self.command_set.fixed_command_len() {
            if cdb.len() < fixed {
                cdb.resize(fixed, 0);
            }
        }
        cdb
    }

    /// Clear a halted endpoint after a stall
    ///
    /// A failed clear is logged; the caller's classification stands.
    pub fn clear_halt(&self, endpoint: u8) -> bool {
        match self.backend.clear_halt(endpoint) {
            Ok(()) => {
                debug!(endpoint = format_args!("{:#04x}", endpoint), "Cleared halt");
                true
            }
            Err(err) => {
                warn!(
                    endpoint = format_args!("{:#04x}", endpoint),
                    %err,
                    "Failed to clear halt"
                );
                false
            }
        }
    }

    /// Record a transfer failure that is not a stall or cancellation
    pub fn note_failure(&mut self, stage: &'static str, err: &TransferError) {
        if *err == TransferError::Timeout {
            self.timed_out = true;
        }
        warn!(stage, %err, "Transfer failed");
    }

    /// Ask the worker to run reset recovery before the next command
    pub fn request_reset(&mut self) {
        self.reset_required = true;
    }

    pub fn take_reset_required(&mut self) -> bool {
        std::mem::take(&mut self.reset_required)
    }

    pub fn take_timed_out(&mut self) -> bool {
        std::mem::take(&mut self.timed_out)
    }
}

impl fmt::Debug for Link {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Link")
            .field("endpoints", &self.endpoints)
            .field("command_set", &self.command_set)
            .field("next_tag", &self.next_tag)
            .finish_non_exhaustive()
    }
}

/// When error recovery issues REQUEST SENSE on its own
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SensePolicy {
    /// After every command; the wire carries no status
    Always,
    /// Only after FAILED or an intolerable SHORT
    OnFailure,
}

/// Device-specific command-translation backend
///
/// Implementors frame commands their own way but report the same
/// [`TransportResult`] vocabulary, so error recovery and the worker treat
/// them like any built-in transport.
pub trait CustomProtocol: Send {
    fn name(&self) -> &str;

    fn execute(&mut self, link: &mut Link, cmd: &mut Command) -> TransportResult;

    fn reset(&mut self, link: &mut Link) -> Result<(), TransferError>;

    fn sense_policy(&self) -> SensePolicy {
        SensePolicy::OnFailure
    }
}

/// The transport a session speaks
pub enum Protocol {
    BulkOnly,
    ControlBulk,
    ControlBulkInterrupt,
    Custom(Box<dyn CustomProtocol>),
}

impl Protocol {
    pub fn from_kind(kind: ProtocolKind) -> Self {
        match kind {
            ProtocolKind::BulkOnly => Protocol::BulkOnly,
            ProtocolKind::ControlBulk => Protocol::ControlBulk,
            ProtocolKind::ControlBulkInterrupt => Protocol::ControlBulkInterrupt,
        }
    }

    pub fn kind(&self) -> Option<ProtocolKind> {
        match self {
            Protocol::BulkOnly => Some(ProtocolKind::BulkOnly),
            Protocol::ControlBulk => Some(ProtocolKind::ControlBulk),
            Protocol::ControlBulkInterrupt => Some(ProtocolKind::ControlBulkInterrupt),
            Protocol::Custom(_) => None,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Protocol::Custom(custom) => custom.name(),
            builtin => builtin.kind().map(|kind| kind.name()).unwrap_or("unknown"),
        }
    }

    /// Run one command through the wire protocol
    pub fn execute(&mut self, link: &mut Link, cmd: &mut Command) -> TransportResult {
        debug!(
            protocol = self.name(),
            opcode = scsi::opcode_name(cmd.opcode()),
            len = cmd.transfer_len(),
            direction = %cmd.direction,
            "Executing command"
        );
        match self {
            Protocol::BulkOnly => bulk_only::execute(link, cmd),
            Protocol::ControlBulk => control_bulk::execute(link, cmd, false),
            Protocol::ControlBulkInterrupt => control_bulk::execute(link, cmd, true),
            Protocol::Custom(custom) => custom.execute(link, cmd),
        }
    }

    /// Variant-specific device reset handshake
    pub fn reset(&mut self, link: &mut Link) -> Result<(), TransferError> {
        match self {
            Protocol::BulkOnly => bulk_only::reset(link),
            Protocol::ControlBulk | Protocol::ControlBulkInterrupt => control_bulk::reset(link),
            Protocol::Custom(custom) => custom.reset(link),
        }
    }

    pub fn sense_policy(&self) -> SensePolicy {
        match self {
            Protocol::ControlBulk => SensePolicy::Always,
            Protocol::BulkOnly | Protocol::ControlBulkInterrupt => SensePolicy::OnFailure,
            Protocol::Custom(custom) => custom.sense_policy(),
        }
    }

    /// REQUEST SENSE and INQUIRY outcomes are taken as-is on CB/CBI
    pub fn trusts_sense_and_inquiry(&self) -> bool {
        matches!(self, Protocol::ControlBulk | Protocol::ControlBulkInterrupt)
    }
}

impl fmt::Debug for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Protocol").field(&self.name()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::MockBackend;

    #[test]
    fn test_tags_increment_and_wrap() {
        let mut link = Link::new(
            MockBackend::new(),
            Endpoints::default(),
            CommandSet::Transparent,
            Duration::ZERO,
        );
        assert_eq!(link.next_tag(), 1);
        assert_eq!(link.next_tag(), 2);
        link.next_tag = u32::MAX;
        assert_eq!(link.next_tag(), u32::MAX);
        assert_eq!(link.next_tag(), 0);
    }

    #[test]
    fn test_wire_cdb_padding() {
        let cmd = Command::no_data(&scsi::test_unit_ready()).unwrap();

        let ufi = Link::new(
            MockBackend::new(),
            Endpoints::default(),
            CommandSet::Ufi,
            Duration::ZERO,
        );
        assert_eq!(ufi.wire_cdb(&cmd).len(), 12);

        let scsi_link = Link::new(
            MockBackend::new(),
            Endpoints::default(),
            CommandSet::Transparent,
            Duration::ZERO,
        );
        assert_eq!(scsi_link.wire_cdb(&cmd).len(), 6);
    }

    #[test]
    fn test_sense_policy_per_variant() {
        assert_eq!(Protocol::ControlBulk.sense_policy(), SensePolicy::Always);
        assert_eq!(Protocol::BulkOnly.sense_policy(), SensePolicy::OnFailure);
        assert!(Protocol::ControlBulkInterrupt.trusts_sense_and_inquiry());
        assert!(!Protocol::BulkOnly.trusts_sense_and_inquiry());
        assert_eq!(Protocol::ControlBulkInterrupt.name(), "Control/Bulk/Interrupt");
    }

    #[test]
    fn test_timeout_marks_link() {
        let mut link = Link::new(
            MockBackend::new(),
            Endpoints::default(),
            CommandSet::Transparent,
            Duration::ZERO,
        );
        link.note_failure("data", &TransferError::Other("babble".into()));
        assert!(!link.take_timed_out());
        link.note_failure("data", &TransferError::Timeout);
        assert!(link.take_timed_out());
        assert!(!link.take_timed_out());
    }
}
