//! Bulk-Only transport
//!
//! Every command is a CommandWrapper on bulk-out, an optional data phase and
//! a StatusWrapper on bulk-in. The status frame is authoritative: its tag has
//! to echo the CBW tag and its signature, length and status byte have to be
//! well formed, otherwise the device is out of sync and the command is an
//! ERROR.

use super::Link;
use crate::backend::{ControlRequest, TransferError};
use crate::data_stage;
use protocol::{CBW_LEN, CSW_LEN, Command, CommandWrapper, CswStatus, StatusWrapper, TransportResult};
use tracing::{debug, info, warn};

/// Class request: Bulk-Only Mass Storage Reset
pub const BULK_ONLY_RESET: u8 = 0xff;
/// Class request: Get Max LUN
pub const GET_MAX_LUN: u8 = 0xfe;

pub fn execute(link: &mut Link, cmd: &mut Command) -> TransportResult {
    let endpoints = *link.endpoints();
    let tag = link.next_tag();
    let cdb = link.wire_cdb(cmd);
    let cbw = match CommandWrapper::new(tag, cmd, &cdb) {
        Ok(cbw) => cbw,
        Err(err) => {
            warn!(%err, "Bulk-Only: cannot frame command");
            return TransportResult::Error;
        }
    };

    debug!(
        tag,
        len = cbw.data_transfer_length,
        lun = cbw.lun,
        "Bulk-Only: sending CBW"
    );

    // A stalled CBW skips the data phase but still collects the CSW
    let mut send_data = true;
    match link.backend().bulk_out(endpoints.bulk_out, &cbw.encode()) {
        Ok(CBW_LEN) => {}
        Ok(sent) => {
            warn!(sent, "Bulk-Only: short CBW");
            return TransportResult::Error;
        }
        Err(TransferError::Cancelled) => return TransportResult::Aborted,
        Err(TransferError::Stall) => {
            debug!("Bulk-Only: CBW stalled");
            link.clear_halt(endpoints.bulk_out);
            send_data = false;
        }
        Err(err) => {
            link.note_failure("command", &err);
            return TransportResult::Error;
        }
    }

    let mut data_result = TransportResult::Good;
    if send_data && cmd.transfer_len() > 0 {
        data_result = data_stage::run(link, cmd);
        if data_result.is_terminal() {
            return data_result;
        }
    } else {
        cmd.residue = cmd.transfer_len();
    }

    let csw = match read_status(link, tag) {
        Ok(csw) => csw,
        Err(result) => return result,
    };

    let reported = csw.residue as usize;
    if reported > cmd.residue {
        debug!(
            reported,
            observed = cmd.residue,
            "Bulk-Only: device reports larger residue"
        );
        cmd.residue = reported.min(cmd.transfer_len());
    }
    if data_result == TransportResult::Good && cmd.residue > 0 {
        data_result = TransportResult::Short;
    }

    match csw.status {
        CswStatus::Passed => data_result,
        CswStatus::Failed => TransportResult::Failed,
        CswStatus::PhaseError => {
            warn!(tag, "Bulk-Only: phase error");
            link.request_reset();
            TransportResult::Error
        }
    }
}

/// Collect the StatusWrapper for `tag`
///
/// A stall or an empty frame gets one more attempt.
fn read_status(link: &mut Link, tag: u32) -> Result<StatusWrapper, TransportResult> {
    let endpoint = link.endpoints().bulk_in;
    let mut retried = false;
    loop {
        let mut frame = [0u8; CSW_LEN];
        match link.backend().bulk_in(endpoint, &mut frame) {
            Ok(0) if !retried => {
                debug!("Bulk-Only: zero-length CSW, retrying");
                retried = true;
            }
            Ok(len) => {
                return StatusWrapper::decode_for(&frame[..len.min(CSW_LEN)], tag).map_err(|err| {
                    warn!(%err, "Bulk-Only: invalid CSW");
                    TransportResult::Error
                });
            }
            Err(TransferError::Cancelled) => return Err(TransportResult::Aborted),
            Err(TransferError::Stall) => {
                debug!(retried, "Bulk-Only: CSW stalled");
                link.clear_halt(endpoint);
                if retried {
                    return Err(TransportResult::Error);
                }
                retried = true;
            }
            Err(err) => {
                link.note_failure("status", &err);
                return Err(TransportResult::Error);
            }
        }
    }
}

/// Reset recovery: class reset, then clear both bulk halts
pub fn reset(link: &mut Link) -> Result<(), TransferError> {
    let endpoints = *link.endpoints();
    info!(interface = endpoints.interface, "Bulk-Only: reset recovery");

    link.backend()
        .control_out(ControlRequest::class_out(BULK_ONLY_RESET, endpoints.interface), &[])?;
    link.backend().clear_halt(endpoints.bulk_in)?;
    link.backend().clear_halt(endpoints.bulk_out)?;
    Ok(())
}

/// Highest LUN the device exposes
///
/// Devices that stall the request have a single LUN.
pub fn get_max_lun(link: &Link) -> Result<u8, TransferError> {
    let interface = link.endpoints().interface;
    let mut buf = [0u8; 1];
    match link
        .backend()
        .control_in(ControlRequest::class_in(GET_MAX_LUN, interface), &mut buf)
    {
        Ok(1) => Ok(buf[0] & 0x0f),
        Ok(_) | Err(TransferError::Stall) => {
            debug!("Bulk-Only: Get Max LUN unsupported, assuming LUN 0");
            Ok(0)
        }
        Err(err) => Err(err),
    }
}
