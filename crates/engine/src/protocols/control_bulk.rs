//! Control/Bulk and Control/Bulk/Interrupt transports
//!
//! The command block travels as an Accept Device-Specific Command class
//! request on the default pipe, the payload on the bulk endpoints. Plain CB
//! has no status phase at all; CBI reads a two-byte status block from the
//! interrupt endpoint.

use super::Link;
use crate::backend::{ControlRequest, TransferError};
use crate::data_stage;
use protocol::{Command, CommandSet, TransportResult, scsi};
use std::thread;
use tracing::{debug, info, warn};

/// Class request: Accept Device-Specific Command
pub const ACCEPT_DEVICE_SPECIFIC_COMMAND: u8 = 0x00;

pub fn execute(link: &mut Link, cmd: &mut Command, with_interrupt: bool) -> TransportResult {
    let interface = link.endpoints().interface;
    let cdb = link.wire_cdb(cmd);

    match link.backend().control_out(
        ControlRequest::class_out(ACCEPT_DEVICE_SPECIFIC_COMMAND, interface),
        &cdb,
    ) {
        Ok(_) => {}
        Err(TransferError::Cancelled) => return TransportResult::Aborted,
        Err(TransferError::Stall) => {
            // Command rejected; the device has sense data for it
            debug!("Control/Bulk: command stalled");
            link.clear_halt(0);
            return TransportResult::Failed;
        }
        Err(err) => {
            link.note_failure("command", &err);
            return TransportResult::Error;
        }
    }

    let mut data_result = TransportResult::Good;
    if cmd.transfer_len() > 0 {
        data_result = data_stage::run(link, cmd);
        if data_result.is_terminal() {
            return data_result;
        }
    }

    if !with_interrupt {
        // No status phase; a data-stage failure stands and auto-sense
        // supplies the rest
        return data_result;
    }

    read_interrupt_status(link, cmd).worst(data_result)
}

fn read_interrupt_status(link: &mut Link, cmd: &Command) -> TransportResult {
    let Some(endpoint) = link.endpoints().interrupt_in else {
        warn!("Control/Bulk/Interrupt: no interrupt endpoint");
        return TransportResult::Error;
    };

    let mut status = [0u8; 2];
    match link.backend().interrupt_in(endpoint, &mut status) {
        Ok(2) => {}
        Ok(len) => {
            warn!(len, "Control/Bulk/Interrupt: short status block");
            return TransportResult::Error;
        }
        Err(TransferError::Cancelled) => return TransportResult::Aborted,
        Err(TransferError::Stall) => {
            debug!("Control/Bulk/Interrupt: status stalled");
            link.clear_halt(endpoint);
            return TransportResult::Error;
        }
        Err(err) => {
            link.note_failure("status", &err);
            return TransportResult::Error;
        }
    }

    debug!(
        b0 = format_args!("{:#04x}", status[0]),
        b1 = format_args!("{:#04x}", status[1]),
        "Control/Bulk/Interrupt: status"
    );
    interpret_status(link.command_set(), cmd.opcode(), status)
}

/// Classify a CBI interrupt status block
///
/// UFI devices report ASC/ASCQ; anything else reports a type byte and a
/// value byte whose low nibble carries the status.
pub fn interpret_status(command_set: CommandSet, opcode: u8, status: [u8; 2]) -> TransportResult {
    if command_set.is_ufi() {
        // UFI leaves sense pending for these two; their status is meaningless
        if opcode == scsi::REQUEST_SENSE || opcode == scsi::INQUIRY {
            return TransportResult::Good;
        }
        return if status[0] != 0 {
            TransportResult::Failed
        } else {
            TransportResult::Good
        };
    }

    // Some devices put a nonzero type byte on failure instead of a proper
    // status code
    if status[0] != 0 {
        return TransportResult::Failed;
    }
    match status[1] & 0x0f {
        0x00 => TransportResult::Good,
        0x01 => TransportResult::Failed,
        _ => TransportResult::Error,
    }
}

/// Soft reset via SEND DIAGNOSTIC, then clear both bulk halts
pub fn reset(link: &mut Link) -> Result<(), TransferError> {
    let endpoints = *link.endpoints();
    info!(interface = endpoints.interface, "Control/Bulk: reset");

    link.backend().control_out(
        ControlRequest::class_out(ACCEPT_DEVICE_SPECIFIC_COMMAND, endpoints.interface),
        &scsi::send_diagnostic_reset(),
    )?;

    // Devices need a long time to come back from the self-test
    thread::sleep(link.reset_settle());

    link.backend().clear_halt(endpoints.bulk_in)?;
    link.backend().clear_halt(endpoints.bulk_out)?;
    Ok(())
}
