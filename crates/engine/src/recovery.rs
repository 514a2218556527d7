//! Auto-sense error recovery
//!
//! Runs a command through its protocol and, when the outcome leaves the
//! real status unknown, follows up with REQUEST SENSE so the caller always
//! gets a final status and a sense buffer that agree with each other.

use crate::protocols::{Link, Protocol, SensePolicy};
use protocol::{Command, CommandStatus, DataBuffer, Direction, SENSE_LEN, TransportResult, scsi};
use tracing::{debug, warn};

/// Execute `cmd` and settle its final status
///
/// Returns the transport result of the command itself; the caller-visible
/// outcome is written to `cmd.status` and `cmd.sense`.
pub fn run(protocol: &mut Protocol, link: &mut Link, cmd: &mut Command) -> TransportResult {
    cmd.sense.clear();
    cmd.residue = 0;

    let result = protocol.execute(link, cmd);
    debug!(
        opcode = scsi::opcode_name(cmd.opcode()),
        %result,
        residue = cmd.residue,
        "Transport finished"
    );

    match result {
        TransportResult::Aborted => {
            cmd.status = CommandStatus::Aborted;
            return result;
        }
        TransportResult::Error => {
            cmd.status = CommandStatus::Error;
            return result;
        }
        _ => {}
    }

    if needs_auto_sense(protocol, cmd, result) {
        auto_sense(protocol, link, cmd, result);
    } else {
        cmd.status = CommandStatus::Good;
    }
    result
}

/// Whether the outcome of `cmd` has to be resolved with REQUEST SENSE
pub fn needs_auto_sense(protocol: &Protocol, cmd: &Command, result: TransportResult) -> bool {
    let opcode = cmd.opcode();
    if protocol.trusts_sense_and_inquiry()
        && (opcode == scsi::REQUEST_SENSE || opcode == scsi::INQUIRY)
    {
        return false;
    }
    if protocol.sense_policy() == SensePolicy::Always {
        return true;
    }
    match result {
        TransportResult::Failed => true,
        TransportResult::Short => cmd.transferred() < cmd.min_transfer_len,
        _ => false,
    }
}

/// Fields of the original command parked while REQUEST SENSE borrows it
struct Parked {
    cdb: Vec<u8>,
    direction: Direction,
    data: DataBuffer,
    min_transfer_len: usize,
    residue: usize,
}

impl Parked {
    fn park(cmd: &mut Command) -> Self {
        Self {
            cdb: cmd.cdb().to_vec(),
            direction: cmd.direction,
            data: std::mem::take(&mut cmd.data),
            min_transfer_len: cmd.min_transfer_len,
            residue: cmd.residue,
        }
    }

    fn restore(self, cmd: &mut Command) {
        // The block came out of a valid command, so it fits
        if let Err(err) = cmd.set_cdb(&self.cdb) {
            warn!(%err, "Failed to restore command block");
        }
        cmd.direction = self.direction;
        cmd.data = self.data;
        cmd.min_transfer_len = self.min_transfer_len;
        cmd.residue = self.residue;
    }
}

/// Whether the command itself moved everything it had to
fn completed_cleanly(cmd: &Command, result: TransportResult) -> bool {
    match result {
        TransportResult::Good => true,
        TransportResult::Short => cmd.transferred() >= cmd.min_transfer_len,
        _ => false,
    }
}

fn auto_sense(protocol: &mut Protocol, link: &mut Link, cmd: &mut Command, result: TransportResult) {
    let lun_bits = cmd.cdb().get(1).copied().unwrap_or(0);
    let parked = Parked::park(cmd);

    let sense_cdb = scsi::request_sense(lun_bits, SENSE_LEN as u8);
    let sense_result = match cmd.set_cdb(&sense_cdb) {
        Ok(()) => {
            cmd.direction = Direction::In;
            cmd.data = DataBuffer::Contiguous(vec![0; SENSE_LEN]);
            cmd.min_transfer_len = 0;
            cmd.residue = 0;
            debug!(lun = cmd.lun, "Issuing auto-sense");
            protocol.execute(link, cmd)
        }
        Err(err) => {
            warn!(%err, "Cannot build REQUEST SENSE");
            TransportResult::Error
        }
    };

    let received = cmd.transferred();
    let sense_bytes = std::mem::take(&mut cmd.data).to_vec();
    parked.restore(cmd);

    match sense_result {
        TransportResult::Aborted => {
            debug!("Auto-sense aborted");
            cmd.status = CommandStatus::Aborted;
        }
        TransportResult::Good | TransportResult::Short => {
            cmd.sense.fill_from(&sense_bytes[..received.min(sense_bytes.len())]);
            debug!(
                key = %cmd.sense.key(),
                asc = format_args!("{:#04x}", cmd.sense.asc()),
                ascq = format_args!("{:#04x}", cmd.sense.ascq()),
                "Auto-sense result"
            );
            cmd.status = CommandStatus::CheckCondition;
            if cmd.sense.key_code() == 0 {
                cmd.sense.clear_response_code();
                // An empty sense cannot vouch for a failed or truncated transfer
                if completed_cleanly(cmd, result) {
                    cmd.status = CommandStatus::Good;
                }
            }
        }
        TransportResult::Failed | TransportResult::Error => {
            warn!(%sense_result, "Auto-sense failed");
            cmd.sense.clear();
            cmd.status = CommandStatus::Error;
        }
    }
}
