//! Memory image blocks and block-size schedules
//!
//! A clone transfer moves the radio's memory image as a header block
//! followed by data blocks. Data block sizes come from the radio profile:
//! either a single fixed size, or a list of `(count, size)` runs where the
//! last run has a count of zero and repeats for the rest of the transfer.
//!
//! # Example
//!
//! ```rust
//! use clone_protocol::block::{BlockRun, BlockSizes};
//!
//! let sizes = BlockSizes::Runs(vec![
//!     BlockRun { count: 2, size: 8 },
//!     BlockRun { count: 0, size: 4 },
//! ]);
//! let first: Vec<usize> = sizes.schedule().take(5).collect();
//! assert_eq!(first, vec![8, 8, 4, 4, 4]);
//! ```

use crate::error::CloneError;

/// Largest number of bytes a single block may hold
pub const MAX_BLOCK_SIZE: usize = 256;

/// One protocol-level chunk of the memory image
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Block {
    payload: Vec<u8>,
}

impl Block {
    /// Create an empty block
    pub fn new() -> Self {
        Self::default()
    }

    /// Bytes held by this block
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    /// Append bytes, failing if the block would exceed [`MAX_BLOCK_SIZE`]
    pub fn append(&mut self, bytes: &[u8]) -> Result<(), CloneError> {
        let new_len = self.payload.len() + bytes.len();
        if new_len > MAX_BLOCK_SIZE {
            return Err(CloneError::BufferOverflow(format!(
                "block would grow to {} bytes (max {})",
                new_len, MAX_BLOCK_SIZE
            )));
        }
        self.payload.extend_from_slice(bytes);
        Ok(())
    }

    /// Remove and return the final byte
    pub fn pop_last(&mut self) -> Option<u8> {
        self.payload.pop()
    }

    /// Drop the leading sequence byte and trailing checksum byte
    pub(crate) fn strip_framing(&mut self) {
        if self.payload.len() >= 2 {
            self.payload.pop();
            self.payload.remove(0);
        }
    }
}

/// One `(count, size)` entry of a block-size list
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct BlockRun {
    /// Number of blocks of this size; zero repeats forever
    pub count: usize,
    /// Block size in bytes, as seen on the wire
    pub size: usize,
}

/// Data block sizes declared by a radio profile
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum BlockSizes {
    /// Every data block has the same size
    Fixed(usize),
    /// Runs of sizes; the final run's count is zero
    Runs(Vec<BlockRun>),
}

impl BlockSizes {
    /// Iterator over successive data block sizes
    pub fn schedule(&self) -> BlockSchedule {
        let runs = match self {
            BlockSizes::Fixed(size) => vec![BlockRun {
                count: 0,
                size: *size,
            }],
            BlockSizes::Runs(runs) => runs.clone(),
        };
        BlockSchedule {
            runs,
            index: 0,
            used: 0,
        }
    }

    /// Largest size any data block can have
    pub fn max_size(&self) -> usize {
        match self {
            BlockSizes::Fixed(size) => *size,
            BlockSizes::Runs(runs) => runs.iter().map(|r| r.size).max().unwrap_or(0),
        }
    }

    /// Payload carried by `wire_len` bytes of data blocks when every block
    /// spends `framing` bytes on checkblock overhead
    ///
    /// The last block may be short. Returns `None` when some block would be
    /// left with no payload at all.
    pub fn payload_len(&self, wire_len: usize, framing: usize) -> Option<usize> {
        let mut remaining = wire_len;
        let mut payload = 0;
        for size in self.schedule() {
            if remaining == 0 {
                break;
            }
            let take = size.min(remaining);
            if take <= framing {
                return None;
            }
            payload += take - framing;
            remaining -= take;
        }
        Some(payload)
    }
}

/// Endless iterator over the sizes of a [`BlockSizes`] declaration
///
/// Once a run with count zero is reached, its size repeats forever. A list
/// that never reaches such a run keeps repeating its last size.
#[derive(Debug, Clone)]
pub struct BlockSchedule {
    runs: Vec<BlockRun>,
    index: usize,
    used: usize,
}

impl Iterator for BlockSchedule {
    type Item = usize;

    fn next(&mut self) -> Option<usize> {
        loop {
            let Some(run) = self.runs.get(self.index) else {
                return self.runs.last().map(|r| r.size);
            };
            if run.count == 0 {
                return Some(run.size);
            }
            if self.used < run.count {
                self.used += 1;
                return Some(run.size);
            }
            self.index += 1;
            self.used = 0;
        }
    }
}

/// Ordered blocks of one transfer, header first
///
/// Blocks are only ever added at the tail. Each call to [`new_block`]
/// advances the size schedule by one step, so the schedule must be set
/// (once the header has identified the radio) before the first data block
/// is opened.
///
/// [`new_block`]: BlockList::new_block
#[derive(Debug, Clone)]
pub struct BlockList {
    blocks: Vec<Block>,
    schedule: Option<BlockSchedule>,
    block_len: usize,
}

impl BlockList {
    /// Create an empty list; the first block may hold up to [`MAX_BLOCK_SIZE`]
    pub fn new() -> Self {
        Self {
            blocks: Vec::new(),
            schedule: None,
            block_len: MAX_BLOCK_SIZE,
        }
    }

    /// Install the size schedule used for blocks opened from now on
    pub fn set_schedule(&mut self, sizes: &BlockSizes) {
        self.schedule = Some(sizes.schedule());
    }

    /// Open a new empty block at the tail
    pub fn new_block(&mut self) -> &mut Block {
        if let Some(len) = self.schedule.as_mut().and_then(Iterator::next) {
            self.block_len = len;
        }
        self.blocks.push(Block::new());
        let last = self.blocks.len() - 1;
        &mut self.blocks[last]
    }

    /// Scheduled size of the most recently opened block
    pub fn current_block_len(&self) -> usize {
        self.block_len
    }

    /// Append bytes to the tail block
    pub fn append_to_last(&mut self, bytes: &[u8]) -> Result<(), CloneError> {
        match self.blocks.last_mut() {
            Some(block) => block.append(bytes),
            None => Err(CloneError::ProtocolViolation(
                "data arrived with no open block".into(),
            )),
        }
    }

    pub fn last(&self) -> Option<&Block> {
        self.blocks.last()
    }

    pub fn last_mut(&mut self) -> Option<&mut Block> {
        self.blocks.last_mut()
    }

    pub fn get(&self, index: usize) -> Option<&Block> {
        self.blocks.get(index)
    }

    /// Number of blocks, header included
    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Block> {
        self.blocks.iter()
    }

    /// Sizes of every block, in order
    pub fn block_sizes(&self) -> Vec<usize> {
        self.blocks.iter().map(Block::len).collect()
    }

    /// Concatenation of every block: the on-disk image format
    pub fn to_image(&self) -> Vec<u8> {
        let total = self.blocks.iter().map(Block::len).sum();
        let mut image = Vec::with_capacity(total);
        for block in &self.blocks {
            image.extend_from_slice(block.payload());
        }
        image
    }
}

impl Default for BlockList {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_schedule_repeats() {
        let sizes: Vec<usize> = BlockSizes::Fixed(64).schedule().take(4).collect();
        assert_eq!(sizes, vec![64, 64, 64, 64]);
    }

    #[test]
    fn test_runs_schedule() {
        let sizes = BlockSizes::Runs(vec![
            BlockRun { count: 1, size: 10 },
            BlockRun { count: 2, size: 8 },
            BlockRun { count: 0, size: 4 },
        ]);
        let got: Vec<usize> = sizes.schedule().take(6).collect();
        assert_eq!(got, vec![10, 8, 8, 4, 4, 4]);
        assert_eq!(sizes.max_size(), 10);
    }

    #[test]
    fn test_unterminated_runs_repeat_last() {
        let sizes = BlockSizes::Runs(vec![BlockRun { count: 1, size: 3 }]);
        let got: Vec<usize> = sizes.schedule().take(3).collect();
        assert_eq!(got, vec![3, 3, 3]);
    }

    #[test]
    fn test_payload_len_strips_framing_per_block() {
        assert_eq!(BlockSizes::Fixed(6).payload_len(12, 2), Some(8));
        assert_eq!(BlockSizes::Fixed(6).payload_len(12, 0), Some(12));
        // short tail block still carries framing
        assert_eq!(BlockSizes::Fixed(6).payload_len(10, 2), Some(6));

        let runs = BlockSizes::Runs(vec![
            BlockRun { count: 1, size: 10 },
            BlockRun { count: 0, size: 8 },
        ]);
        assert_eq!(runs.payload_len(10 + 8 + 8 + 5, 2), Some(8 + 6 + 6 + 3));
    }

    #[test]
    fn test_payload_len_rejects_empty_tail() {
        assert_eq!(BlockSizes::Fixed(6).payload_len(8, 2), None);
        assert_eq!(BlockSizes::Fixed(6).payload_len(0, 2), Some(0));
        assert_eq!(BlockSizes::Fixed(0).payload_len(4, 0), None);
    }

    #[test]
    fn test_append_overflow() {
        let mut block = Block::new();
        block.append(&[0u8; 200]).unwrap();
        let err = block.append(&[0u8; 57]).unwrap_err();
        assert!(matches!(err, CloneError::BufferOverflow(_)));
        assert_eq!(block.len(), 200);
        block.append(&[0u8; 56]).unwrap();
        assert_eq!(block.len(), MAX_BLOCK_SIZE);
    }

    #[test]
    fn test_pop_last() {
        let mut block = Block::new();
        block.append(&[1, 2, 3]).unwrap();
        assert_eq!(block.pop_last(), Some(3));
        assert_eq!(block.payload(), &[1, 2]);
    }

    #[test]
    fn test_list_header_then_schedule() {
        let mut list = BlockList::new();
        list.new_block();
        assert_eq!(list.current_block_len(), MAX_BLOCK_SIZE);

        list.set_schedule(&BlockSizes::Runs(vec![
            BlockRun { count: 2, size: 8 },
            BlockRun { count: 0, size: 4 },
        ]));
        let mut seen = Vec::new();
        for _ in 0..4 {
            list.new_block();
            seen.push(list.current_block_len());
        }
        assert_eq!(seen, vec![8, 8, 4, 4]);
        assert_eq!(list.len(), 5);
    }

    #[test]
    fn test_append_without_block() {
        let mut list = BlockList::new();
        assert!(list.append_to_last(&[1]).is_err());
    }

    #[test]
    fn test_to_image_concatenates() {
        let mut list = BlockList::new();
        list.new_block();
        list.append_to_last(&[0xAA, 0xBB]).unwrap();
        list.new_block();
        list.append_to_last(&[0x01]).unwrap();
        assert_eq!(list.to_image(), vec![0xAA, 0xBB, 0x01]);
        assert_eq!(list.block_sizes(), vec![2, 1]);
    }

    #[test]
    fn test_strip_framing() {
        let mut block = Block::new();
        block.append(&[0x00, 0xAA, 0xBB, 0x65]).unwrap();
        block.strip_framing();
        assert_eq!(block.payload(), &[0xAA, 0xBB]);
    }
}
