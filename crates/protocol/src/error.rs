//! Protocol error types

use thiserror::Error;

/// Errors raised while building commands or parsing wire frames
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    /// Frame has the wrong size for its type
    #[error("Invalid frame length: expected {expected} bytes, got {actual}")]
    InvalidLength { expected: usize, actual: usize },

    /// Frame signature does not match the expected constant
    #[error("Bad signature: {found:#010x} (expected {expected:#010x})")]
    BadSignature { found: u32, expected: u32 },

    /// Status frame answers a different command
    #[error("Tag mismatch: status carries {found:#x}, command was {expected:#x}")]
    TagMismatch { found: u32, expected: u32 },

    /// Status byte outside the defined range
    #[error("Reserved status code {0:#04x}")]
    ReservedStatus(u8),

    /// Command block length must be 1..=16
    #[error("Invalid command block length: {0}")]
    InvalidCommandLength(usize),

    /// Payload does not agree with the declared direction
    #[error("Direction {direction} does not match a {len}-byte payload")]
    DirectionMismatch { direction: &'static str, len: usize },

    /// Payload does not fit the 32-bit length field
    #[error("Payload too large: {0} bytes")]
    PayloadTooLarge(usize),
}

/// Type alias for protocol results
pub type Result<T> = std::result::Result<T, ProtocolError>;
