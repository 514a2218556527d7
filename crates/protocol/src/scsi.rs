//! SCSI command blocks and sense data
//!
//! The engine does not interpret most opcodes. It only needs to recognize
//! the handful that change transport behavior (REQUEST SENSE and INQUIRY),
//! to synthesize REQUEST SENSE and SEND DIAGNOSTIC, and to decode the
//! fixed-format sense buffer. The builders for common commands exist for
//! producers such as the CLI.

use std::fmt;

pub const TEST_UNIT_READY: u8 = 0x00;
pub const REQUEST_SENSE: u8 = 0x03;
pub const INQUIRY: u8 = 0x12;
pub const MODE_SELECT_6: u8 = 0x15;
pub const MODE_SENSE_6: u8 = 0x1a;
pub const START_STOP_UNIT: u8 = 0x1b;
pub const SEND_DIAGNOSTIC: u8 = 0x1d;
pub const ALLOW_MEDIUM_REMOVAL: u8 = 0x1e;
pub const READ_FORMAT_CAPACITIES: u8 = 0x23;
pub const READ_CAPACITY_10: u8 = 0x25;
pub const READ_10: u8 = 0x28;
pub const WRITE_10: u8 = 0x2a;
pub const VERIFY_10: u8 = 0x2f;
pub const SYNCHRONIZE_CACHE_10: u8 = 0x35;
pub const LOG_SENSE: u8 = 0x4d;
pub const MODE_SELECT_10: u8 = 0x55;
pub const MODE_SENSE_10: u8 = 0x5a;

/// Size of the fixed-format sense buffer
pub const SENSE_LEN: usize = 18;

/// Standard INQUIRY allocation length
pub const INQUIRY_LEN: usize = 36;

/// Human-readable opcode name for logging
pub fn opcode_name(opcode: u8) -> &'static str {
    match opcode {
        TEST_UNIT_READY => "TEST_UNIT_READY",
        REQUEST_SENSE => "REQUEST_SENSE",
        INQUIRY => "INQUIRY",
        MODE_SELECT_6 => "MODE_SELECT_6",
        MODE_SENSE_6 => "MODE_SENSE_6",
        START_STOP_UNIT => "START_STOP_UNIT",
        SEND_DIAGNOSTIC => "SEND_DIAGNOSTIC",
        ALLOW_MEDIUM_REMOVAL => "ALLOW_MEDIUM_REMOVAL",
        READ_FORMAT_CAPACITIES => "READ_FORMAT_CAPACITIES",
        READ_CAPACITY_10 => "READ_CAPACITY_10",
        READ_10 => "READ_10",
        WRITE_10 => "WRITE_10",
        VERIFY_10 => "VERIFY_10",
        SYNCHRONIZE_CACHE_10 => "SYNCHRONIZE_CACHE_10",
        LOG_SENSE => "LOG_SENSE",
        MODE_SELECT_10 => "MODE_SELECT_10",
        MODE_SENSE_10 => "MODE_SENSE_10",
        _ => "UNKNOWN",
    }
}

/// Commands whose response is routinely shorter than the allocation length
pub fn tolerates_short_data(opcode: u8) -> bool {
    matches!(
        opcode,
        REQUEST_SENSE
            | INQUIRY
            | MODE_SENSE_6
            | MODE_SENSE_10
            | LOG_SENSE
            | READ_FORMAT_CAPACITIES
    )
}

/// Build a REQUEST SENSE block
///
/// `lun_bits` are the upper three bits of byte 1, copied from the command
/// being sensed so that pre-SCSI-3 devices see the same LUN.
pub fn request_sense(lun_bits: u8, allocation_len: u8) -> [u8; 6] {
    [REQUEST_SENSE, lun_bits & 0xe0, 0, 0, allocation_len, 0]
}

/// Build the SEND DIAGNOSTIC self-test block used as a Control/Bulk reset
///
/// The block is 12 bytes with every unused byte set to 0xff, the pattern
/// CB/CBI devices treat as a soft reset request.
pub fn send_diagnostic_reset() -> [u8; 12] {
    let mut cdb = [0xff; 12];
    cdb[0] = SEND_DIAGNOSTIC;
    cdb[1] = 0x04;
    cdb
}

pub fn test_unit_ready() -> [u8; 6] {
    [TEST_UNIT_READY, 0, 0, 0, 0, 0]
}

pub fn inquiry(allocation_len: u8) -> [u8; 6] {
    [INQUIRY, 0, 0, 0, allocation_len, 0]
}

pub fn read_capacity_10() -> [u8; 10] {
    [READ_CAPACITY_10, 0, 0, 0, 0, 0, 0, 0, 0, 0]
}

pub fn read_10(lba: u32, blocks: u16) -> [u8; 10] {
    rw_10(READ_10, lba, blocks)
}

pub fn write_10(lba: u32, blocks: u16) -> [u8; 10] {
    rw_10(WRITE_10, lba, blocks)
}

fn rw_10(opcode: u8, lba: u32, blocks: u16) -> [u8; 10] {
    let lba = lba.to_be_bytes();
    let blocks = blocks.to_be_bytes();
    [
        opcode, 0, lba[0], lba[1], lba[2], lba[3], 0, blocks[0], blocks[1], 0,
    ]
}

/// Sense key (byte 2, low nibble)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SenseKey {
    NoSense,
    RecoveredError,
    NotReady,
    MediumError,
    HardwareError,
    IllegalRequest,
    UnitAttention,
    DataProtect,
    BlankCheck,
    VendorSpecific,
    CopyAborted,
    AbortedCommand,
    Obsolete,
    VolumeOverflow,
    Miscompare,
    Reserved,
}

impl SenseKey {
    pub fn from_nibble(value: u8) -> Self {
        match value & 0x0f {
            0x0 => SenseKey::NoSense,
            0x1 => SenseKey::RecoveredError,
            0x2 => SenseKey::NotReady,
            0x3 => SenseKey::MediumError,
            0x4 => SenseKey::HardwareError,
            0x5 => SenseKey::IllegalRequest,
            0x6 => SenseKey::UnitAttention,
            0x7 => SenseKey::DataProtect,
            0x8 => SenseKey::BlankCheck,
            0x9 => SenseKey::VendorSpecific,
            0xa => SenseKey::CopyAborted,
            0xb => SenseKey::AbortedCommand,
            0xc => SenseKey::Obsolete,
            0xd => SenseKey::VolumeOverflow,
            0xe => SenseKey::Miscompare,
            _ => SenseKey::Reserved,
        }
    }
}

impl fmt::Display for SenseKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SenseKey::NoSense => "No Sense",
            SenseKey::RecoveredError => "Recovered Error",
            SenseKey::NotReady => "Not Ready",
            SenseKey::MediumError => "Medium Error",
            SenseKey::HardwareError => "Hardware Error",
            SenseKey::IllegalRequest => "Illegal Request",
            SenseKey::UnitAttention => "Unit Attention",
            SenseKey::DataProtect => "Data Protect",
            SenseKey::BlankCheck => "Blank Check",
            SenseKey::VendorSpecific => "Vendor Specific",
            SenseKey::CopyAborted => "Copy Aborted",
            SenseKey::AbortedCommand => "Aborted Command",
            SenseKey::Obsolete => "Obsolete",
            SenseKey::VolumeOverflow => "Volume Overflow",
            SenseKey::Miscompare => "Miscompare",
            SenseKey::Reserved => "Reserved",
        };
        f.write_str(name)
    }
}

/// Fixed-format sense buffer
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct SenseData([u8; SENSE_LEN]);

impl SenseData {
    pub fn from_bytes(bytes: &[u8]) -> Self {
        let mut sense = SenseData::default();
        sense.fill_from(bytes);
        sense
    }

    /// Overwrite the buffer; bytes beyond `bytes.len()` are zeroed
    pub fn fill_from(&mut self, bytes: &[u8]) {
        self.0 = [0; SENSE_LEN];
        let len = bytes.len().min(SENSE_LEN);
        self.0[..len].copy_from_slice(&bytes[..len]);
    }

    pub fn clear(&mut self) {
        self.0 = [0; SENSE_LEN];
    }

    pub fn as_bytes(&self) -> &[u8; SENSE_LEN] {
        &self.0
    }

    pub fn response_code(&self) -> u8 {
        self.0[0] & 0x7f
    }

    /// Mark the buffer as carrying no error
    pub fn clear_response_code(&mut self) {
        self.0[0] = 0;
    }

    pub fn key_code(&self) -> u8 {
        self.0[2] & 0x0f
    }

    pub fn key(&self) -> SenseKey {
        SenseKey::from_nibble(self.0[2])
    }

    pub fn asc(&self) -> u8 {
        self.0[12]
    }

    pub fn ascq(&self) -> u8 {
        self.0[13]
    }

    pub fn is_empty(&self) -> bool {
        self.0.iter().all(|b| *b == 0)
    }
}

impl fmt::Debug for SenseData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SenseData")
            .field("response_code", &format_args!("{:#04x}", self.response_code()))
            .field("key", &self.key())
            .field("asc", &format_args!("{:#04x}", self.asc()))
            .field("ascq", &format_args!("{:#04x}", self.ascq()))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_sense_keeps_lun_bits() {
        let cdb = request_sense(0x25, 18);
        assert_eq!(cdb[0], REQUEST_SENSE);
        assert_eq!(cdb[1], 0x20);
        assert_eq!(cdb[4], 18);
    }

    #[test]
    fn test_send_diagnostic_padding() {
        let cdb = send_diagnostic_reset();
        assert_eq!(cdb[0], SEND_DIAGNOSTIC);
        assert_eq!(cdb[1], 0x04);
        assert!(cdb[2..].iter().all(|b| *b == 0xff));
    }

    #[test]
    fn test_read_10_layout() {
        let cdb = read_10(0x0102_0304, 0x0506);
        assert_eq!(cdb, [READ_10, 0, 1, 2, 3, 4, 0, 5, 6, 0]);
    }

    #[test]
    fn test_sense_accessors() {
        let mut raw = [0u8; SENSE_LEN];
        raw[0] = 0x70;
        raw[2] = 0x05;
        raw[12] = 0x24;
        raw[13] = 0x01;
        let sense = SenseData::from_bytes(&raw);
        assert_eq!(sense.response_code(), 0x70);
        assert_eq!(sense.key(), SenseKey::IllegalRequest);
        assert_eq!(sense.asc(), 0x24);
        assert_eq!(sense.ascq(), 0x01);
    }

    #[test]
    fn test_short_sense_is_zero_filled() {
        let mut sense = SenseData::from_bytes(&[0xff; SENSE_LEN]);
        sense.fill_from(&[0x70, 0x00, 0x02]);
        assert_eq!(sense.key(), SenseKey::NotReady);
        assert_eq!(sense.asc(), 0);
        assert!(!sense.is_empty());
        sense.clear();
        assert!(sense.is_empty());
    }
}
