//! Diagnostic commands and their output decoding

use anyhow::{Result, anyhow};
use protocol::scsi::{self, INQUIRY_LEN};
use protocol::{Command, CommandStatus};

/// Standard INQUIRY fields worth printing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InquiryData {
    pub peripheral_type: u8,
    pub removable: bool,
    pub vendor: String,
    pub product: String,
    pub revision: String,
}

impl InquiryData {
    pub fn parse(data: &[u8]) -> Option<Self> {
        if data.len() < INQUIRY_LEN {
            return None;
        }
        let text = |range: std::ops::Range<usize>| {
            String::from_utf8_lossy(&data[range]).trim().to_string()
        };
        Some(Self {
            peripheral_type: data[0] & 0x1f,
            removable: data[1] & 0x80 != 0,
            vendor: text(8..16),
            product: text(16..32),
            revision: text(32..36),
        })
    }

    pub fn peripheral_name(&self) -> &'static str {
        match self.peripheral_type {
            0x00 => "direct-access block device",
            0x01 => "sequential-access device",
            0x05 => "CD/DVD device",
            0x07 => "optical memory device",
            0x0e => "simplified direct-access device",
            _ => "other device",
        }
    }
}

/// READ CAPACITY (10) response
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capacity {
    pub last_lba: u32,
    pub block_size: u32,
}

impl Capacity {
    pub fn parse(data: &[u8]) -> Option<Self> {
        let last_lba = u32::from_be_bytes(data.get(0..4)?.try_into().ok()?);
        let block_size = u32::from_be_bytes(data.get(4..8)?.try_into().ok()?);
        Some(Self {
            last_lba,
            block_size,
        })
    }

    pub fn blocks(&self) -> u64 {
        self.last_lba as u64 + 1
    }

    pub fn total_bytes(&self) -> u64 {
        self.blocks() * self.block_size as u64
    }
}

pub fn inquiry(lun: u8) -> Result<Command> {
    Ok(Command::read(&scsi::inquiry(INQUIRY_LEN as u8), INQUIRY_LEN)?.with_lun(lun))
}

pub fn test_unit_ready(lun: u8) -> Result<Command> {
    Ok(Command::no_data(&scsi::test_unit_ready())?.with_lun(lun))
}

pub fn read_capacity(lun: u8) -> Result<Command> {
    Ok(Command::read(&scsi::read_capacity_10(), 8)?
        .with_lun(lun)
        .require_exact_length())
}

pub fn read_blocks(lun: u8, lba: u32, blocks: u16, block_size: u32) -> Result<Command> {
    if blocks == 0 {
        return Err(anyhow!("--blocks must be at least 1"));
    }
    let len = blocks as usize * block_size as usize;
    Ok(Command::read(&scsi::read_10(lba, blocks), len)?.with_lun(lun))
}

/// One-line summary of how a command ended
pub fn describe(cmd: &Command) -> String {
    match cmd.status {
        CommandStatus::CheckCondition => format!(
            "CHECK CONDITION: {} (asc {:#04x}, ascq {:#04x})",
            cmd.sense.key(),
            cmd.sense.asc(),
            cmd.sense.ascq()
        ),
        CommandStatus::Good if cmd.residue > 0 => {
            format!("GOOD ({} of {} bytes)", cmd.transferred(), cmd.transfer_len())
        }
        status => format!("{:?}", status).to_uppercase(),
    }
}

/// Classic 16-bytes-per-row hex dump
pub fn hexdump(data: &[u8]) -> String {
    let mut out = String::new();
    for (row, chunk) in data.chunks(16).enumerate() {
        let hex: Vec<String> = chunk.iter().map(|b| format!("{:02x}", b)).collect();
        let ascii: String = chunk
            .iter()
            .map(|&b| if b.is_ascii_graphic() || b == b' ' { b as char } else { '.' })
            .collect();
        out.push_str(&format!("{:08x}  {:<47}  |{}|\n", row * 16, hex.join(" "), ascii));
    }
    out
}
