//! Radio profiles: per-model clone framing rules
//!
//! A [`RadioProfile`] says how one radio model frames its memory image: the
//! header bytes that identify it, how many bytes follow, the block-size
//! schedule, and which echo, checksum and pacing quirks the radio has.

use std::time::Duration;

use crate::block::BlockSizes;

/// Image length assumed when no profile matches; large enough that the
/// transfer only ends by timeout
pub const FALLBACK_DATA_LEN: usize = 1_000_000;

/// Block size assumed when no profile matches
pub const FALLBACK_BLOCK_SIZE: usize = 64;

/// Framing rules for one radio model
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct RadioProfile {
    /// Model name, as written in the registry
    pub name: String,
    /// Bytes compared against the start of a received header
    pub header: Vec<u8>,
    /// Full header length; at least `header.len()`
    pub header_len: usize,
    /// Payload bytes after the header, with checkblock framing removed
    pub data_len: usize,
    /// Sizes of data blocks on the wire
    pub block_sizes: BlockSizes,
    /// Radio echoes every byte it receives; `None` leaves it to detection
    pub recv_echo: Option<bool>,
    /// Host must echo every byte it receives
    pub send_echo: bool,
    /// The final ack of a read is not echoed back
    pub no_end_echo: bool,
    /// A whole-transfer checksum byte follows the data
    pub has_checksum: bool,
    /// Writer waits for the last block's ack before sending the checksum
    pub wait_for_ack_before_checksum: bool,
    /// Delay before an unacknowledged checksum is sent
    pub checksum_delay: Duration,
    /// Each data block carries a sequence byte and a checksum byte
    pub has_checkblock: bool,
    /// Largest burst written before pausing; zero is unlimited
    pub chunk_size: usize,
    /// Pause after the output queue drains between bursts
    pub inter_chunk_wait: Duration,
    /// Pause before every physical write
    pub pre_write_delay: Duration,
    /// Delay the final ack of a read
    pub delay_final_ack: bool,
}

impl RadioProfile {
    /// Create a profile with registry defaults for every optional field
    pub fn new(
        name: impl Into<String>,
        header: Vec<u8>,
        data_len: usize,
        block_sizes: BlockSizes,
    ) -> Self {
        let header_len = header.len();
        Self {
            name: name.into(),
            header,
            header_len,
            data_len,
            block_sizes,
            recv_echo: None,
            send_echo: false,
            no_end_echo: false,
            has_checksum: false,
            wait_for_ack_before_checksum: true,
            checksum_delay: Duration::ZERO,
            has_checkblock: false,
            chunk_size: 0,
            inter_chunk_wait: Duration::ZERO,
            pre_write_delay: Duration::ZERO,
            delay_final_ack: true,
        }
    }

    /// Best-effort profile used when a header matches nothing
    pub fn fallback() -> Self {
        Self::new(
            "unknown",
            Vec::new(),
            FALLBACK_DATA_LEN,
            BlockSizes::Fixed(FALLBACK_BLOCK_SIZE),
        )
    }

    /// Whether `candidate` is a complete header for this radio
    pub fn matches(&self, candidate: &[u8]) -> bool {
        candidate.len() == self.header_len && candidate.starts_with(&self.header)
    }
}
