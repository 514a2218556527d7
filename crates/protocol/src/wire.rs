//! Bulk-Only Transport wire frames
//!
//! Every Bulk-Only exchange is bracketed by two fixed-size frames: a 31-byte
//! CommandWrapper (CBW) sent on the bulk-out endpoint, and a 13-byte
//! StatusWrapper (CSW) read back on the bulk-in endpoint.
//!
//! # Frame Format
//!
//! ```text
//! CBW: [Signature "USBC"][Tag][DataTransferLength LE][Flags][LUN][CB length][CB x16]
//! CSW: [Signature "USBS"][Tag][Residue LE][Status]
//! ```
//!
//! All multi-byte fields are little-endian. The tag is opaque to the device,
//! which echoes it back in the CSW.

use crate::command::{Command, MAX_CDB_LEN};
use crate::error::{ProtocolError, Result};
use crate::types::Direction;
use bytes::{Buf, BufMut};

/// "USBC" read as a little-endian u32
pub const CBW_SIGNATURE: u32 = 0x4342_5355;
/// "USBS" read as a little-endian u32
pub const CSW_SIGNATURE: u32 = 0x5342_5355;

pub const CBW_LEN: usize = 31;
pub const CSW_LEN: usize = 13;

/// Flags bit 7: data flows device-to-host
pub const CBW_FLAG_DATA_IN: u8 = 0x80;

/// CommandWrapper contents
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandWrapper {
    pub tag: u32,
    pub data_transfer_length: u32,
    pub flags: u8,
    pub lun: u8,
    pub cb_length: u8,
    pub cb: [u8; MAX_CDB_LEN],
}

impl CommandWrapper {
    /// Wrap a command block for the wire
    ///
    /// `cdb` is the block exactly as it should appear on the wire (already
    /// padded for command sets with a fixed block length).
    pub fn new(tag: u32, command: &Command, cdb: &[u8]) -> Result<Self> {
        if cdb.is_empty() || cdb.len() > MAX_CDB_LEN {
            return Err(ProtocolError::InvalidCommandLength(cdb.len()));
        }
        let data_transfer_length = u32::try_from(command.transfer_len())
            .map_err(|_| ProtocolError::PayloadTooLarge(command.transfer_len()))?;
        let flags = match command.direction {
            Direction::In => CBW_FLAG_DATA_IN,
            Direction::Out | Direction::None => 0,
        };
        let mut cb = [0u8; MAX_CDB_LEN];
        cb[..cdb.len()].copy_from_slice(cdb);

        Ok(Self {
            tag,
            data_transfer_length,
            flags,
            lun: command.lun & 0x0f,
            cb_length: cdb.len() as u8,
            cb,
        })
    }

    pub fn encode(&self) -> [u8; CBW_LEN] {
        let mut frame = [0u8; CBW_LEN];
        let mut buf = &mut frame[..];
        buf.put_u32_le(CBW_SIGNATURE);
        buf.put_u32_le(self.tag);
        buf.put_u32_le(self.data_transfer_length);
        buf.put_u8(self.flags);
        buf.put_u8(self.lun & 0x0f);
        buf.put_u8(self.cb_length);
        buf.put_slice(&self.cb);
        frame
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != CBW_LEN {
            return Err(ProtocolError::InvalidLength {
                expected: CBW_LEN,
                actual: bytes.len(),
            });
        }
        let mut buf = bytes;
        let signature = buf.get_u32_le();
        if signature != CBW_SIGNATURE {
            return Err(ProtocolError::BadSignature {
                found: signature,
                expected: CBW_SIGNATURE,
            });
        }
        let tag = buf.get_u32_le();
        let data_transfer_length = buf.get_u32_le();
        let flags = buf.get_u8();
        let lun = buf.get_u8() & 0x0f;
        let cb_length = buf.get_u8();
        if cb_length == 0 || cb_length as usize > MAX_CDB_LEN {
            return Err(ProtocolError::InvalidCommandLength(cb_length as usize));
        }
        let mut cb = [0u8; MAX_CDB_LEN];
        buf.copy_to_slice(&mut cb);

        Ok(Self {
            tag,
            data_transfer_length,
            flags,
            lun,
            cb_length,
            cb,
        })
    }

    pub fn is_data_in(&self) -> bool {
        self.flags & CBW_FLAG_DATA_IN != 0
    }

    pub fn command_block(&self) -> &[u8] {
        &self.cb[..self.cb_length as usize]
    }
}

/// `bCSWStatus` values
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CswStatus {
    Passed,
    Failed,
    PhaseError,
}

impl CswStatus {
    pub fn from_byte(value: u8) -> Result<Self> {
        match value {
            0x00 => Ok(CswStatus::Passed),
            0x01 => Ok(CswStatus::Failed),
            0x02 => Ok(CswStatus::PhaseError),
            other => Err(ProtocolError::ReservedStatus(other)),
        }
    }

    pub fn as_byte(&self) -> u8 {
        match self {
            CswStatus::Passed => 0x00,
            CswStatus::Failed => 0x01,
            CswStatus::PhaseError => 0x02,
        }
    }
}

/// StatusWrapper contents
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusWrapper {
    pub tag: u32,
    pub residue: u32,
    pub status: CswStatus,
}

impl StatusWrapper {
    /// Parse a status frame
    ///
    /// Fails on a wrong length, wrong signature or reserved status byte.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != CSW_LEN {
            return Err(ProtocolError::InvalidLength {
                expected: CSW_LEN,
                actual: bytes.len(),
            });
        }
        let mut buf = bytes;
        let signature = buf.get_u32_le();
        if signature != CSW_SIGNATURE {
            return Err(ProtocolError::BadSignature {
                found: signature,
                expected: CSW_SIGNATURE,
            });
        }
        let tag = buf.get_u32_le();
        let residue = buf.get_u32_le();
        let status = CswStatus::from_byte(buf.get_u8())?;

        Ok(Self {
            tag,
            residue,
            status,
        })
    }

    /// Parse a status frame and check it answers the command tagged `expected_tag`
    pub fn decode_for(bytes: &[u8], expected_tag: u32) -> Result<Self> {
        let csw = Self::decode(bytes)?;
        if csw.tag != expected_tag {
            return Err(ProtocolError::TagMismatch {
                found: csw.tag,
                expected: expected_tag,
            });
        }
        Ok(csw)
    }

    pub fn encode(&self) -> [u8; CSW_LEN] {
        let mut frame = [0u8; CSW_LEN];
        let mut buf = &mut frame[..];
        buf.put_u32_le(CSW_SIGNATURE);
        buf.put_u32_le(self.tag);
        buf.put_u32_le(self.residue);
        buf.put_u8(self.status.as_byte());
        frame
    }
}
