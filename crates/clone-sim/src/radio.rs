//! Virtual clone-mode radio
//!
//! Plays the radio's side of a clone transfer. As a sender it streams a
//! memory image block by block, waiting for an ack before each one. As a
//! receiver it checks every block the host writes, acknowledges it, and
//! keeps the reassembled image for inspection.

use std::collections::VecDeque;

use clone_protocol::block::{Block, BlockSchedule};
use clone_protocol::checksum::{validate_checkblock, RunningSum};
use clone_protocol::{
    split_image, BlockList, BlockSizes, CloneError, ProfileRegistry, RadioProfile, SessionConfig,
    ACK,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, trace, warn};

/// Faults the virtual radio detects in what the host sends
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SimError {
    #[error("cannot load image: {0}")]
    Image(#[from] CloneError),

    #[error("unexpected byte 0x{byte:02X} while {phase}")]
    Unexpected { byte: u8, phase: &'static str },

    #[error("header {0:02X?} does not belong to this radio")]
    BadHeader(Vec<u8>),

    #[error("block {block} rejected: {reason}")]
    BadBlock { block: usize, reason: String },

    #[error("checksum mismatch: computed 0x{expected:02X}, host sent 0x{actual:02X}")]
    Checksum { expected: u8, actual: u8 },
}

/// Which end of the transfer the radio plays
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RadioRole {
    /// Radio transmits its memory; the host reads
    Sender,
    /// Radio accepts a memory image; the host writes
    Receiver,
}

/// Configuration for creating a virtual clone radio
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VirtualCloneRadioConfig {
    /// Framing rules the radio follows
    pub profile: RadioProfile,
    pub role: RadioRole,
    /// Single-wire cable: every host byte comes back to the host
    pub echo: bool,
    /// Split each transmission into pieces of at most this many bytes;
    /// zero sends whole blocks
    pub fragment_size: usize,
    /// Transmit a wrong checksum byte
    pub corrupt_checksum: bool,
}

impl Default for VirtualCloneRadioConfig {
    fn default() -> Self {
        let mut profile = RadioProfile::new("SIM-1", b"SIM1".to_vec(), 64, BlockSizes::Fixed(16));
        profile.delay_final_ack = false;
        Self {
            profile,
            role: RadioRole::Sender,
            echo: false,
            fragment_size: 0,
            corrupt_checksum: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    /// Sender waiting for the ack of block `n - 1` before sending block `n`
    AwaitAck(usize),
    /// Sender sent its checksum and wants the host's last ack
    AwaitFinalAck,
    RecvHeader,
    RecvBlock,
    RecvChecksum,
    RecvFinalAck,
    Complete,
    Failed,
}

/// A simulated radio in clone mode
#[derive(Debug)]
pub struct VirtualCloneRadio {
    config: VirtualCloneRadioConfig,
    phase: Phase,
    /// Wire blocks to send, header first
    outgoing: BlockList,
    /// Image reassembled from received blocks, framing removed
    received: Vec<u8>,
    /// Block being received
    current: Vec<u8>,
    current_len: usize,
    blocks_received: usize,
    remaining: usize,
    schedule: BlockSchedule,
    sum: RunningSum,
    /// Bytes the host will echo back before answering
    host_echo_pending: usize,
    acks_received: usize,
    /// Pending output to the host
    pending_output: VecDeque<Vec<u8>>,
    error: Option<SimError>,
}

impl VirtualCloneRadio {
    /// Create a radio that will transmit `image` once [`start`](Self::start)ed
    pub fn sender(config: VirtualCloneRadioConfig, image: &[u8]) -> Result<Self, SimError> {
        let registry = ProfileRegistry::from_profiles(vec![config.profile.clone()]);
        let split = split_image(&registry, &SessionConfig::default(), image)?;
        let config = VirtualCloneRadioConfig {
            role: RadioRole::Sender,
            ..config
        };
        Ok(Self::with_blocks(config, split.blocks))
    }

    /// Create a radio waiting for the host to write an image
    pub fn receiver(config: VirtualCloneRadioConfig) -> Self {
        let config = VirtualCloneRadioConfig {
            role: RadioRole::Receiver,
            ..config
        };
        Self::with_blocks(config, BlockList::new())
    }

    fn with_blocks(config: VirtualCloneRadioConfig, outgoing: BlockList) -> Self {
        let phase = match config.role {
            RadioRole::Sender => Phase::AwaitAck(0),
            RadioRole::Receiver => Phase::RecvHeader,
        };
        Self {
            phase,
            outgoing,
            received: Vec::new(),
            current: Vec::new(),
            current_len: config.profile.header_len,
            blocks_received: 0,
            remaining: config.profile.data_len,
            schedule: config.profile.block_sizes.schedule(),
            sum: RunningSum::new(),
            host_echo_pending: 0,
            acks_received: 0,
            pending_output: VecDeque::new(),
            error: None,
            config,
        }
    }

    pub fn config(&self) -> &VirtualCloneRadioConfig {
        &self.config
    }

    pub fn role(&self) -> RadioRole {
        self.config.role
    }

    /// Sender: transmit the header, as when the user starts a clone send
    pub fn start(&mut self) {
        if self.phase == Phase::AwaitAck(0) {
            self.send_block(0);
        }
    }

    /// Transfer finished cleanly from the radio's point of view
    pub fn is_complete(&self) -> bool {
        self.phase == Phase::Complete
    }

    /// First fault detected, after which the radio goes silent
    pub fn error(&self) -> Option<&SimError> {
        self.error.as_ref()
    }

    /// Image written by the host so far, header included
    pub fn received_image(&self) -> &[u8] {
        &self.received
    }

    pub fn blocks_received(&self) -> usize {
        self.blocks_received
    }

    /// Acks seen from the host
    pub fn acks_received(&self) -> usize {
        self.acks_received
    }

    /// Whole-transfer checksum over everything sent or received so far
    pub fn checksum(&self) -> u8 {
        self.sum.value()
    }

    /// Get the next pending transmission, if any
    pub fn take_output(&mut self) -> Option<Vec<u8>> {
        self.pending_output.pop_front()
    }

    pub fn has_output(&self) -> bool {
        !self.pending_output.is_empty()
    }

    pub fn output_count(&self) -> usize {
        self.pending_output.len()
    }

    pub fn clear_output(&mut self) {
        self.pending_output.clear();
    }

    /// Process bytes written by the host
    pub fn on_host_bytes(&mut self, bytes: &[u8]) {
        trace!("Radio got {:02X?} in {:?}", bytes, self.phase);
        let mut echo = Vec::new();
        for &byte in bytes {
            if self.host_echo_pending > 0 {
                self.host_echo_pending -= 1;
                continue;
            }
            if self.config.echo && !self.suppress_echo() {
                echo.push(byte);
            }
            let before = self.pending_output.len();
            self.on_byte(byte);
            if self.pending_output.len() > before && !echo.is_empty() {
                // echo reaches the host ahead of the reply it provoked
                let replies: Vec<_> = self.pending_output.drain(before..).collect();
                self.emit(std::mem::take(&mut echo), false);
                self.pending_output.extend(replies);
            }
            if self.phase == Phase::Failed {
                break;
            }
        }
        if !echo.is_empty() {
            self.emit(echo, false);
        }
    }

    /// Last block's ack is swallowed by radios with `noendecho`
    fn suppress_echo(&self) -> bool {
        self.config.profile.no_end_echo
            && matches!(self.phase, Phase::AwaitAck(n) if n == self.outgoing.len())
    }

    fn on_byte(&mut self, byte: u8) {
        match self.phase {
            Phase::AwaitAck(next) => {
                if byte != ACK {
                    return self.fail(SimError::Unexpected {
                        byte,
                        phase: "waiting for an ack",
                    });
                }
                self.acks_received += 1;
                if next < self.outgoing.len() {
                    self.send_block(next);
                } else if self.config.profile.has_checksum {
                    let sum = if self.config.corrupt_checksum {
                        self.sum.value().wrapping_add(1)
                    } else {
                        self.sum.value()
                    };
                    debug!("Radio sending checksum 0x{:02X}", sum);
                    self.emit(vec![sum], true);
                    self.phase = Phase::AwaitFinalAck;
                } else {
                    self.phase = Phase::Complete;
                }
            }
            Phase::AwaitFinalAck | Phase::RecvFinalAck => {
                if byte != ACK {
                    return self.fail(SimError::Unexpected {
                        byte,
                        phase: "waiting for the final ack",
                    });
                }
                self.acks_received += 1;
                self.phase = Phase::Complete;
            }
            Phase::RecvHeader | Phase::RecvBlock => self.receive_byte(byte),
            Phase::RecvChecksum => {
                let expected = self.sum.value();
                if byte != expected {
                    return self.fail(SimError::Checksum {
                        expected,
                        actual: byte,
                    });
                }
                if self.config.profile.wait_for_ack_before_checksum {
                    self.emit(vec![ACK], true);
                    self.phase = Phase::RecvFinalAck;
                } else {
                    self.phase = Phase::Complete;
                }
            }
            Phase::Complete => {
                if self.config.role == RadioRole::Receiver {
                    self.fail(SimError::Unexpected {
                        byte,
                        phase: "idle after the transfer",
                    });
                } else {
                    // timing-mode hosts ack the checksum as a block
                    trace!("Radio ignoring 0x{:02X} after transfer", byte);
                }
            }
            Phase::Failed => {}
        }
    }

    fn receive_byte(&mut self, byte: u8) {
        self.current.push(byte);
        if self.current.len() < self.current_len {
            return;
        }
        let wire = std::mem::take(&mut self.current);
        self.sum.add(&wire);

        if self.phase == Phase::RecvHeader {
            if !self.config.profile.matches(&wire) {
                return self.fail(SimError::BadHeader(wire));
            }
            self.received.extend_from_slice(&wire);
        } else {
            let index = self.blocks_received;
            let mut block = Block::new();
            if let Err(err) = block.append(&wire) {
                return self.fail(SimError::BadBlock {
                    block: index,
                    reason: err.to_string(),
                });
            }
            if self.config.profile.has_checkblock {
                if let Err(err) = validate_checkblock(&mut block, index + 1) {
                    return self.fail(SimError::BadBlock {
                        block: index,
                        reason: err.to_string(),
                    });
                }
            }
            self.remaining = self.remaining.saturating_sub(block.len());
            self.received.extend_from_slice(block.payload());
        }
        self.blocks_received += 1;
        debug!(
            "Radio accepted block {} ({} bytes), {} to go",
            self.blocks_received - 1,
            wire.len(),
            self.remaining
        );
        self.emit(vec![ACK], true);

        if self.remaining == 0 {
            self.phase = if self.config.profile.has_checksum {
                Phase::RecvChecksum
            } else {
                Phase::Complete
            };
        } else {
            self.phase = Phase::RecvBlock;
            self.current_len = self.next_block_len();
        }
    }

    /// Wire length of the next data block; the last one may be short
    fn next_block_len(&mut self) -> usize {
        let size = self.schedule.next().unwrap_or(0);
        if self.config.profile.has_checkblock {
            size.saturating_sub(2).min(self.remaining) + 2
        } else {
            size.min(self.remaining)
        }
    }

    fn send_block(&mut self, index: usize) {
        let Some(block) = self.outgoing.get(index) else {
            return;
        };
        let bytes = block.payload().to_vec();
        self.sum.add(&bytes);
        debug!("Radio sending block {} ({} bytes)", index, bytes.len());
        // the host cannot echo a header it has not matched yet
        self.emit(bytes, index > 0);
        self.phase = Phase::AwaitAck(index + 1);
    }

    /// Queue bytes for the host; `own` marks radio traffic the host may echo
    fn emit(&mut self, bytes: Vec<u8>, own: bool) {
        if own && self.config.profile.send_echo {
            self.host_echo_pending += bytes.len();
        }
        match self.config.fragment_size {
            0 => self.pending_output.push_back(bytes),
            n => self
                .pending_output
                .extend(bytes.chunks(n).map(<[u8]>::to_vec)),
        }
    }

    fn fail(&mut self, err: SimError) {
        warn!("Virtual radio fault: {}", err);
        self.phase = Phase::Failed;
        self.error = Some(err);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clone_protocol::checksum::{frame_checkblock, modular_sum};

    fn config() -> VirtualCloneRadioConfig {
        let mut profile = RadioProfile::new("SIM-1", b"SIM1".to_vec(), 6, BlockSizes::Fixed(4));
        profile.delay_final_ack = false;
        VirtualCloneRadioConfig {
            profile,
            ..Default::default()
        }
    }

    fn image() -> Vec<u8> {
        let mut image = b"SIM1".to_vec();
        image.extend([1, 2, 3, 4, 5, 6]);
        image
    }

    #[test]
    fn test_sender_waits_for_acks() {
        let mut radio = VirtualCloneRadio::sender(config(), &image()).unwrap();
        radio.start();
        assert_eq!(radio.take_output(), Some(b"SIM1".to_vec()));
        assert!(!radio.has_output());

        radio.on_host_bytes(&[ACK]);
        assert_eq!(radio.take_output(), Some(vec![1, 2, 3, 4]));
        radio.on_host_bytes(&[ACK]);
        assert_eq!(radio.take_output(), Some(vec![5, 6]));
        radio.on_host_bytes(&[ACK]);
        assert!(radio.is_complete());
        assert_eq!(radio.acks_received(), 3);
    }

    #[test]
    fn test_sender_checksum_follows_last_ack() {
        let mut cfg = config();
        cfg.profile.has_checksum = true;
        let mut radio = VirtualCloneRadio::sender(cfg, &image()).unwrap();
        radio.start();
        for _ in 0..3 {
            radio.on_host_bytes(&[ACK]);
        }
        let sent: Vec<_> = std::iter::from_fn(|| radio.take_output()).collect();
        assert_eq!(sent.last(), Some(&vec![modular_sum(&image())]));
        assert!(!radio.is_complete());
        radio.on_host_bytes(&[ACK]);
        assert!(radio.is_complete());
    }

    #[test]
    fn test_sender_rejects_garbage() {
        let mut radio = VirtualCloneRadio::sender(config(), &image()).unwrap();
        radio.start();
        radio.on_host_bytes(&[0x15]);
        assert!(matches!(
            radio.error(),
            Some(SimError::Unexpected { byte: 0x15, .. })
        ));
    }

    #[test]
    fn test_echo_precedes_reply() {
        let mut cfg = config();
        cfg.echo = true;
        let mut radio = VirtualCloneRadio::sender(cfg, &image()).unwrap();
        radio.start();
        radio.take_output();
        radio.on_host_bytes(&[ACK]);
        assert_eq!(radio.take_output(), Some(vec![ACK]));
        assert_eq!(radio.take_output(), Some(vec![1, 2, 3, 4]));
    }

    #[test]
    fn test_fragmented_output() {
        let mut cfg = config();
        cfg.fragment_size = 3;
        let mut radio = VirtualCloneRadio::sender(cfg, &image()).unwrap();
        radio.start();
        assert_eq!(radio.output_count(), 2);
        assert_eq!(radio.take_output(), Some(b"SIM".to_vec()));
        assert_eq!(radio.take_output(), Some(b"1".to_vec()));
    }

    #[test]
    fn test_receiver_reassembles_image() {
        let mut radio = VirtualCloneRadio::receiver(config());
        radio.on_host_bytes(b"SIM1");
        assert_eq!(radio.take_output(), Some(vec![ACK]));
        radio.on_host_bytes(&[1, 2, 3, 4]);
        radio.on_host_bytes(&[5, 6]);
        assert!(radio.is_complete());
        assert_eq!(radio.received_image(), &image()[..]);
        assert_eq!(radio.blocks_received(), 3);
    }

    #[test]
    fn test_receiver_checkblock() {
        let mut cfg = config();
        cfg.profile.has_checkblock = true;
        let mut radio = VirtualCloneRadio::receiver(cfg);
        radio.on_host_bytes(b"SIM1");
        radio.on_host_bytes(&frame_checkblock(1, &[1, 2]));
        radio.on_host_bytes(&frame_checkblock(2, &[3, 4]));
        radio.on_host_bytes(&frame_checkblock(4, &[5, 6]));
        assert!(matches!(
            radio.error(),
            Some(SimError::BadBlock { block: 3, .. })
        ));
        assert_eq!(radio.received_image(), &image()[..8]);
    }

    #[test]
    fn test_receiver_bad_header() {
        let mut radio = VirtualCloneRadio::receiver(config());
        radio.on_host_bytes(b"XXXX");
        assert_eq!(radio.error(), Some(&SimError::BadHeader(b"XXXX".to_vec())));
    }

    #[test]
    fn test_receiver_checksum_and_final_ack() {
        let mut cfg = config();
        cfg.profile.has_checksum = true;
        let mut radio = VirtualCloneRadio::receiver(cfg);
        radio.on_host_bytes(&image());
        radio.clear_output();
        radio.on_host_bytes(&[modular_sum(&image())]);
        assert_eq!(radio.take_output(), Some(vec![ACK]));
        radio.on_host_bytes(&[ACK]);
        assert!(radio.is_complete());
    }

    #[test]
    fn test_receiver_checksum_mismatch() {
        let mut cfg = config();
        cfg.profile.has_checksum = true;
        let mut radio = VirtualCloneRadio::receiver(cfg);
        radio.on_host_bytes(&image());
        radio.on_host_bytes(&[0]);
        assert!(matches!(radio.error(), Some(SimError::Checksum { actual: 0, .. })));
    }

    #[test]
    fn test_config_serializes() {
        let json = serde_json::to_string(&config()).unwrap();
        let back: VirtualCloneRadioConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.profile, config().profile);
        assert_eq!(back.role, RadioRole::Sender);
    }
}
