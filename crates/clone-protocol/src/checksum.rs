//! Modular-sum checksums used by clone protocols
//!
//! Two checksums appear on the wire:
//!
//! - **Checkblock framing**: `[sequence][payload...][sum]`, where `sum` is
//!   the low 8 bits of the payload byte sum and `sequence` is the block's
//!   position in the transfer (the header is position 0).
//! - **Whole-transfer checksum**: one trailing byte equal to the low 8 bits
//!   of the sum of every byte sent for the header and data blocks,
//!   checkblock framing included.

use crate::block::Block;
use crate::error::CloneError;

/// Low 8 bits of the sum of `bytes`
pub fn modular_sum(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0u8, |acc, b| acc.wrapping_add(*b))
}

/// Frame a payload with a sequence byte and a trailing payload checksum
pub fn frame_checkblock(sequence: u8, payload: &[u8]) -> Vec<u8> {
    let mut framed = Vec::with_capacity(payload.len() + 2);
    framed.push(sequence);
    framed.extend_from_slice(payload);
    framed.push(modular_sum(payload));
    framed
}

/// Validate and strip checkblock framing in place
///
/// `block_count` is the number of blocks in the transfer so far, including
/// the one being checked, so the expected sequence byte is
/// `block_count - 1`.
pub fn validate_checkblock(block: &mut Block, block_count: usize) -> Result<(), CloneError> {
    let bytes = block.payload();
    if bytes.len() < 2 {
        return Err(CloneError::ProtocolViolation(format!(
            "checkblock of {} bytes is too short",
            bytes.len()
        )));
    }

    let expected_seq = block_count.wrapping_sub(1) as u8;
    if bytes[0] != expected_seq {
        return Err(CloneError::ProtocolViolation(format!(
            "block sequence 0x{:02X}, expected 0x{:02X}",
            bytes[0], expected_seq
        )));
    }

    let last = bytes.len() - 1;
    let expected = modular_sum(&bytes[1..last]);
    if bytes[last] != expected {
        return Err(CloneError::ChecksumMismatch {
            expected,
            actual: bytes[last],
        });
    }

    block.strip_framing();
    Ok(())
}

/// Whole-transfer checksum accumulator
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunningSum(u8);

impl RunningSum {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, bytes: &[u8]) {
        self.0 = self.0.wrapping_add(modular_sum(bytes));
    }

    /// Take back a byte that turned out not to be part of the data
    pub fn remove(&mut self, byte: u8) {
        self.0 = self.0.wrapping_sub(byte);
    }

    pub fn value(&self) -> u8 {
        self.0
    }
}
