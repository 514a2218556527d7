//! Block commands as exchanged between a producer and the engine

use crate::error::{ProtocolError, Result};
use crate::scsi::{self, SenseData};
use crate::types::{CommandStatus, Direction};

/// Longest command block a CommandWrapper can carry
pub const MAX_CDB_LEN: usize = 16;

/// Payload of a command
///
/// Either one contiguous buffer or an ordered list of segments. For
/// device-to-host commands the buffers are overwritten in place.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum DataBuffer {
    #[default]
    None,
    Contiguous(Vec<u8>),
    Segments(Vec<Vec<u8>>),
}

impl DataBuffer {
    /// Total payload length across all segments
    pub fn len(&self) -> usize {
        match self {
            DataBuffer::None => 0,
            DataBuffer::Contiguous(buf) => buf.len(),
            DataBuffer::Segments(segments) => segments.iter().map(Vec::len).sum(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn segment_count(&self) -> usize {
        match self {
            DataBuffer::None => 0,
            DataBuffer::Contiguous(_) => 1,
            DataBuffer::Segments(segments) => segments.len(),
        }
    }

    /// Segments in transfer order
    pub fn segments_mut(&mut self) -> &mut [Vec<u8>] {
        match self {
            DataBuffer::None => &mut [],
            DataBuffer::Contiguous(buf) => std::slice::from_mut(buf),
            DataBuffer::Segments(segments) => segments.as_mut_slice(),
        }
    }

    /// Flatten the payload into one buffer
    pub fn to_vec(&self) -> Vec<u8> {
        match self {
            DataBuffer::None => Vec::new(),
            DataBuffer::Contiguous(buf) => buf.clone(),
            DataBuffer::Segments(segments) => segments.concat(),
        }
    }
}

/// One block command and everything the engine records about it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    cdb: [u8; MAX_CDB_LEN],
    cdb_len: u8,
    /// Logical unit the command is addressed to (low 4 bits are used)
    pub lun: u8,
    pub direction: Direction,
    pub data: DataBuffer,
    /// Fewest bytes the command can tolerate moving; a shorter transfer
    /// triggers auto-sense
    pub min_transfer_len: usize,
    /// Requested minus transferred bytes
    pub residue: usize,
    pub status: CommandStatus,
    pub sense: SenseData,
}

impl Command {
    /// Build a command from a raw command block
    pub fn new(cdb: &[u8], direction: Direction, data: DataBuffer) -> Result<Self> {
        if cdb.is_empty() || cdb.len() > MAX_CDB_LEN {
            return Err(ProtocolError::InvalidCommandLength(cdb.len()));
        }
        // An In/Out command with an empty payload simply has no data phase
        if direction == Direction::None && !data.is_empty() {
            return Err(ProtocolError::DirectionMismatch {
                direction: direction.as_str(),
                len: data.len(),
            });
        }
        if u32::try_from(data.len()).is_err() {
            return Err(ProtocolError::PayloadTooLarge(data.len()));
        }

        let mut block = [0u8; MAX_CDB_LEN];
        block[..cdb.len()].copy_from_slice(cdb);
        let min_transfer_len = if scsi::tolerates_short_data(cdb[0]) {
            0
        } else {
            data.len()
        };
        Ok(Self {
            cdb: block,
            cdb_len: cdb.len() as u8,
            lun: 0,
            direction,
            data,
            min_transfer_len,
            residue: 0,
            status: CommandStatus::Pending,
            sense: SenseData::default(),
        })
    }

    /// Command without a data phase
    pub fn no_data(cdb: &[u8]) -> Result<Self> {
        Self::new(cdb, Direction::None, DataBuffer::None)
    }

    /// Device-to-host command reading into a zeroed buffer of `len` bytes
    pub fn read(cdb: &[u8], len: usize) -> Result<Self> {
        Self::new(cdb, Direction::In, DataBuffer::Contiguous(vec![0; len]))
    }

    /// Host-to-device command
    pub fn write(cdb: &[u8], data: Vec<u8>) -> Result<Self> {
        Self::new(cdb, Direction::Out, DataBuffer::Contiguous(data))
    }

    pub fn with_lun(mut self, lun: u8) -> Self {
        self.lun = lun & 0x0f;
        self
    }

    /// Accept any amount of data without auto-sense
    pub fn allow_short(mut self) -> Self {
        self.min_transfer_len = 0;
        self
    }

    pub fn with_min_transfer_len(mut self, len: usize) -> Self {
        self.min_transfer_len = len;
        self
    }

    /// Any short transfer of this command triggers auto-sense
    pub fn require_exact_length(mut self) -> Self {
        self.min_transfer_len = self.data.len();
        self
    }

    pub fn opcode(&self) -> u8 {
        self.cdb[0]
    }

    pub fn cdb(&self) -> &[u8] {
        &self.cdb[..self.cdb_len as usize]
    }

    /// Replace the command block, keeping everything else
    pub fn set_cdb(&mut self, cdb: &[u8]) -> Result<()> {
        if cdb.is_empty() || cdb.len() > MAX_CDB_LEN {
            return Err(ProtocolError::InvalidCommandLength(cdb.len()));
        }
        self.cdb = [0; MAX_CDB_LEN];
        self.cdb[..cdb.len()].copy_from_slice(cdb);
        self.cdb_len = cdb.len() as u8;
        Ok(())
    }

    /// Requested payload length
    pub fn transfer_len(&self) -> usize {
        self.data.len()
    }

    /// Bytes actually moved
    pub fn transferred(&self) -> usize {
        self.transfer_len().saturating_sub(self.residue)
    }
}
