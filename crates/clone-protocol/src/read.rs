//! Receiving a memory image from the radio
//!
//! # Architecture
//!
//! ```text
//! WaitFirstBlock -> InFirstBlock -> WaitBlock <-> InBlock
//!                                      |           |
//!                                      |           +-> WaitChecksum -> Checksum -+
//!                                      |           +-> DelayAck ----------------+-> Done
//!                                      +-(timing mode timeout)------------------+
//! ```
//!
//! The radio starts by sending its header. Once the header matches a
//! profile the host acknowledges it and the radio sends data blocks, each
//! acknowledged in turn. Block boundaries come from the profile's block
//! schedule. When no profile matches, the header is accepted on timeout and
//! the session runs in *timing mode*: a pause in the byte stream ends a
//! block, and a pause after an acknowledgement ends the transfer, with the
//! last byte received taken as the whole-transfer checksum.

use std::time::Duration;

use tracing::{debug, info, trace};

use crate::block::BlockList;
use crate::checksum::{validate_checkblock, RunningSum};
use crate::config::{EffectiveSettings, SessionConfig, TimeoutConfig};
use crate::error::CloneError;
use crate::flow::Outbound;
use crate::profile::RadioProfile;
use crate::registry::{ProfileMatch, ProfileRegistry};
use crate::transport::Transport;
use crate::ACK;

/// Protocol state while reading
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadState {
    /// Nothing received yet
    WaitFirstBlock,
    /// Accumulating header bytes until a profile matches
    InFirstBlock,
    /// Acknowledged a block, waiting for the next one
    WaitBlock,
    /// Accumulating a data block
    InBlock,
    /// All data received and acknowledged, waiting for the checksum
    WaitChecksum,
    /// Expecting the checksum byte itself
    Checksum,
    /// Waiting briefly before the final acknowledgement
    DelayAck,
    /// Transfer complete
    Done,
}

/// Read-side clone protocol state machine
#[derive(Debug)]
pub struct ReadStateMachine {
    state: ReadState,
    registry: ProfileRegistry,
    config: SessionConfig,
    settings: EffectiveSettings,
    profile: Option<RadioProfile>,
    timing_mode: bool,
    blocks: BlockList,
    sum: RunningSum,
    /// Payload bytes of completed data blocks, checkblock framing removed
    data_count: usize,
    bytes_received: usize,
}

impl ReadStateMachine {
    /// Create a machine that identifies the radio from `registry`
    pub fn new(registry: ProfileRegistry, config: SessionConfig) -> Self {
        let settings = EffectiveSettings::unmatched(&config);
        Self {
            state: ReadState::WaitFirstBlock,
            registry,
            config,
            settings,
            profile: None,
            timing_mode: false,
            blocks: BlockList::new(),
            sum: RunningSum::new(),
            data_count: 0,
            bytes_received: 0,
        }
    }

    pub fn state(&self) -> ReadState {
        self.state
    }

    pub fn is_done(&self) -> bool {
        self.state == ReadState::Done
    }

    pub fn settings(&self) -> &EffectiveSettings {
        &self.settings
    }

    /// Matched profile, once the header has been identified
    pub fn profile(&self) -> Option<&RadioProfile> {
        self.profile.as_ref()
    }

    pub fn timing_mode(&self) -> bool {
        self.timing_mode
    }

    pub fn blocks(&self) -> &BlockList {
        &self.blocks
    }

    pub fn data_count(&self) -> usize {
        self.data_count
    }

    pub fn bytes_received(&self) -> usize {
        self.bytes_received
    }

    /// Timer to arm for the current state
    pub fn timeout(&self, timeouts: &TimeoutConfig) -> Option<Duration> {
        match self.state {
            ReadState::WaitFirstBlock => Some(timeouts.start),
            ReadState::InFirstBlock | ReadState::WaitChecksum | ReadState::Checksum => {
                Some(timeouts.character)
            }
            ReadState::WaitBlock | ReadState::InBlock if self.timing_mode => Some(timeouts.timing),
            ReadState::WaitBlock | ReadState::InBlock => Some(timeouts.character),
            ReadState::DelayAck => Some(timeouts.write_poll),
            ReadState::Done => None,
        }
    }

    /// Handle bytes from the radio
    pub fn on_data<T: Transport>(
        &mut self,
        out: &mut Outbound<'_, T>,
        bytes: &[u8],
    ) -> Result<(), CloneError> {
        if bytes.is_empty() {
            return Ok(());
        }
        trace!("Read ({:?}): {:02X?}", self.state, bytes);

        match self.state {
            ReadState::WaitFirstBlock => {
                self.blocks.new_block();
                self.state = ReadState::InFirstBlock;
                self.header_bytes(out, bytes)
            }
            ReadState::InFirstBlock => self.header_bytes(out, bytes),
            ReadState::WaitBlock => {
                let rest = if self.settings.recv_echo {
                    expect_ack_echo(bytes)?
                } else {
                    bytes
                };
                self.blocks.new_block();
                self.state = ReadState::InBlock;
                if rest.is_empty() {
                    return Ok(());
                }
                self.block_bytes(out, rest)
            }
            ReadState::InBlock => self.block_bytes(out, bytes),
            ReadState::WaitChecksum => {
                let rest = if self.settings.recv_echo && !self.settings.no_end_echo {
                    expect_ack_echo(bytes)?
                } else {
                    bytes
                };
                self.state = ReadState::Checksum;
                if rest.is_empty() {
                    return Ok(());
                }
                self.checksum_byte(out, rest)
            }
            ReadState::Checksum => self.checksum_byte(out, bytes),
            ReadState::DelayAck | ReadState::Done => {
                trace!("Ignoring {} bytes after end of data", bytes.len());
                Ok(())
            }
        }
    }

    /// Handle the armed timer firing
    pub fn on_timeout<T: Transport>(&mut self, out: &mut Outbound<'_, T>) -> Result<(), CloneError> {
        match self.state {
            ReadState::InFirstBlock => self.header_timeout(out),
            ReadState::InBlock if self.timing_mode => {
                let len = self.blocks.last().map_or(0, |b| b.len());
                info!("Block size {}", len);
                self.data_count += len;
                self.state = ReadState::WaitBlock;
                out.send(&[ACK])
            }
            ReadState::WaitBlock if self.timing_mode => self.end_of_data(),
            ReadState::DelayAck => {
                self.state = ReadState::Done;
                out.send(&[ACK])
            }
            ReadState::Done => Ok(()),
            state => Err(CloneError::Timeout(format!("in read state {:?}", state))),
        }
    }

    fn header_bytes<T: Transport>(
        &mut self,
        out: &mut Outbound<'_, T>,
        bytes: &[u8],
    ) -> Result<(), CloneError> {
        self.blocks.append_to_last(bytes)?;
        self.sum.add(bytes);
        self.bytes_received += bytes.len();

        let header = self.blocks.last().map(|b| b.payload()).unwrap_or_default();
        if let Some(found) = self.registry.select(header, false) {
            self.apply_profile(out, found);
            self.state = ReadState::WaitBlock;
            out.send(&[ACK])?;
        }
        Ok(())
    }

    fn header_timeout<T: Transport>(&mut self, out: &mut Outbound<'_, T>) -> Result<(), CloneError> {
        let header = self
            .blocks
            .last()
            .map(|b| b.payload().to_vec())
            .unwrap_or_default();
        if let Some(found) = self.registry.select(&header, true) {
            self.apply_profile(out, found);
        }
        info!("Going into timer mode, dumping block information");
        info!("Header size = {}", header.len());
        info!("Header data is: {:02X?}", header);
        self.state = ReadState::WaitBlock;
        out.send(&[ACK])
    }

    fn apply_profile<T: Transport>(&mut self, out: &mut Outbound<'_, T>, found: ProfileMatch) {
        self.settings = EffectiveSettings::resolve(&found.profile, &self.config);
        self.timing_mode = found.timing_mode;
        self.blocks.set_schedule(&found.profile.block_sizes);
        out.flow
            .configure(self.settings.flow_config(&self.config.timeouts));
        debug!(
            "Expecting {} data bytes, settings {:?}",
            found.profile.data_len, self.settings
        );
        self.profile = Some(found.profile);
    }

    fn expected_len(&self) -> usize {
        self.profile.as_ref().map_or(0, |p| p.data_len)
    }

    fn block_bytes<T: Transport>(
        &mut self,
        out: &mut Outbound<'_, T>,
        bytes: &[u8],
    ) -> Result<(), CloneError> {
        let scheduled = self.blocks.current_block_len();
        let current = self.blocks.last().map_or(0, |b| b.len());
        if !self.timing_mode && current + bytes.len() > scheduled {
            return Err(CloneError::ProtocolViolation(format!(
                "block {} overran its size of {} bytes",
                self.blocks.len() - 1,
                scheduled
            )));
        }

        self.blocks.append_to_last(bytes)?;
        self.sum.add(bytes);
        self.bytes_received += bytes.len();

        let raw = current + bytes.len();
        let payload = if self.settings.has_checkblock {
            raw.saturating_sub(2)
        } else {
            raw
        };
        let total = self.data_count + payload;
        let expected = self.expected_len();

        if total > expected {
            return Err(CloneError::ProtocolViolation(format!(
                "received {} data bytes, expected {}",
                total, expected
            )));
        }

        if total == expected {
            self.finish_block()?;
            if self.settings.has_checksum {
                self.state = ReadState::WaitChecksum;
                out.send(&[ACK])
            } else if self.settings.delay_final_ack {
                self.state = ReadState::DelayAck;
                Ok(())
            } else {
                self.state = ReadState::Done;
                out.send(&[ACK])
            }
        } else if !self.timing_mode && raw == scheduled {
            self.finish_block()?;
            self.state = ReadState::WaitBlock;
            out.send(&[ACK])
        } else {
            Ok(())
        }
    }

    /// Validate the tail block and count its payload
    fn finish_block(&mut self) -> Result<(), CloneError> {
        let count = self.blocks.len();
        let Some(block) = self.blocks.last_mut() else {
            return Ok(());
        };
        if self.settings.has_checkblock {
            validate_checkblock(block, count)?;
        }
        self.data_count += block.len();
        debug!(
            "Block {} complete: {} bytes, {} of {} received",
            count - 1,
            block.len(),
            self.data_count,
            self.profile.as_ref().map_or(0, |p| p.data_len)
        );
        Ok(())
    }

    fn checksum_byte<T: Transport>(
        &mut self,
        out: &mut Outbound<'_, T>,
        bytes: &[u8],
    ) -> Result<(), CloneError> {
        let [received] = bytes else {
            return Err(CloneError::ProtocolViolation(format!(
                "expected one checksum byte, got {}",
                bytes.len()
            )));
        };
        let expected = self.sum.value();
        if *received != expected {
            return Err(CloneError::ChecksumMismatch {
                expected,
                actual: *received,
            });
        }
        debug!("Checksum 0x{:02X} verified", expected);

        if self.settings.delay_final_ack {
            self.state = ReadState::DelayAck;
            Ok(())
        } else {
            self.state = ReadState::Done;
            out.send(&[ACK])
        }
    }

    /// Quiet line after an acknowledgement: the last byte was the checksum
    fn end_of_data(&mut self) -> Result<(), CloneError> {
        let is_data_block = self.blocks.len() > 1;
        let Some(block) = self.blocks.last_mut() else {
            return Err(CloneError::ProtocolViolation("no data received".into()));
        };
        let Some(received) = block.pop_last() else {
            return Err(CloneError::ProtocolViolation(
                "last data block was 0 bytes, not a checksum".into(),
            ));
        };
        self.sum.remove(received);
        if is_data_block {
            self.data_count = self.data_count.saturating_sub(1);
        }

        let expected = self.sum.value();
        if self.settings.has_checksum && received != expected {
            return Err(CloneError::ChecksumMismatch {
                expected,
                actual: received,
            });
        }
        info!("End of data, {} bytes", self.data_count);
        self.state = ReadState::Done;
        Ok(())
    }
}

/// Strip the echoed acknowledgement from the front of `bytes`
fn expect_ack_echo(bytes: &[u8]) -> Result<&[u8], CloneError> {
    match bytes.split_first() {
        Some((&ACK, rest)) => Ok(rest),
        Some((other, _)) => Err(CloneError::ProtocolViolation(format!(
            "expected echoed ack, got 0x{:02X}",
            other
        ))),
        None => Ok(bytes),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::{BlockRun, BlockSizes};
    use crate::checksum::{frame_checkblock, modular_sum};
    use crate::flow::WriteFlowController;
    use std::io;

    #[derive(Default)]
    struct Wire {
        sent: Vec<u8>,
    }

    impl Transport for Wire {
        fn write(&mut self, bytes: &[u8]) -> io::Result<usize> {
            self.sent.extend_from_slice(bytes);
            Ok(bytes.len())
        }
        fn set_write_interest(&mut self, _enabled: bool) {}
        fn set_read_interest(&mut self, _enabled: bool) {}
        fn output_queue_len(&mut self) -> io::Result<usize> {
            Ok(0)
        }
    }

    struct Harness {
        machine: ReadStateMachine,
        flow: WriteFlowController,
        wire: Wire,
    }

    impl Harness {
        fn new(profile: RadioProfile, config: SessionConfig) -> Self {
            Self {
                machine: ReadStateMachine::new(ProfileRegistry::from_profiles(vec![profile]), config),
                flow: WriteFlowController::new(),
                wire: Wire::default(),
            }
        }

        fn data(&mut self, bytes: &[u8]) -> Result<(), CloneError> {
            let mut out = Outbound::new(&mut self.flow, &mut self.wire);
            self.machine.on_data(&mut out, bytes)
        }

        fn timeout(&mut self) -> Result<(), CloneError> {
            let mut out = Outbound::new(&mut self.flow, &mut self.wire);
            self.machine.on_timeout(&mut out)
        }

        fn acks(&self) -> usize {
            self.wire.sent.iter().filter(|b| **b == ACK).count()
        }
    }

    fn profile(data_len: usize) -> RadioProfile {
        let mut p = RadioProfile::new("TEST", vec![0x41, 0x42], data_len, BlockSizes::Fixed(8));
        p.delay_final_ack = false;
        p
    }

    #[test]
    fn test_fixed_blocks_no_checksum() {
        let mut h = Harness::new(profile(16), SessionConfig::default());
        h.data(&[0x41]).unwrap();
        assert_eq!(h.machine.state(), ReadState::InFirstBlock);
        h.data(&[0x42]).unwrap();
        assert_eq!(h.machine.state(), ReadState::WaitBlock);
        assert_eq!(h.acks(), 1);

        h.data(&[1, 2, 3, 4, 5, 6, 7, 8]).unwrap();
        assert_eq!(h.machine.state(), ReadState::WaitBlock);
        assert_eq!(h.acks(), 2);

        h.data(&[9, 10, 11, 12]).unwrap();
        assert_eq!(h.machine.state(), ReadState::InBlock);
        h.data(&[13, 14, 15, 16]).unwrap();
        assert_eq!(h.machine.state(), ReadState::Done);
        assert_eq!(h.acks(), 3);
        assert_eq!(h.machine.data_count(), 16);
        assert_eq!(h.machine.blocks().block_sizes(), vec![2, 8, 8]);
    }

    #[test]
    fn test_short_last_block_completes() {
        let mut h = Harness::new(profile(10), SessionConfig::default());
        h.data(&[0x41, 0x42]).unwrap();
        h.data(&[0; 8]).unwrap();
        h.data(&[0; 2]).unwrap();
        assert!(h.machine.is_done());
    }

    #[test]
    fn test_block_overrun() {
        let mut h = Harness::new(profile(32), SessionConfig::default());
        h.data(&[0x41, 0x42]).unwrap();
        h.data(&[0; 6]).unwrap();
        let err = h.data(&[0; 3]).unwrap_err();
        assert!(matches!(err, CloneError::ProtocolViolation(_)));
    }

    #[test]
    fn test_too_much_data() {
        let mut h = Harness::new(profile(4), SessionConfig::default());
        h.data(&[0x41, 0x42]).unwrap();
        assert!(matches!(
            h.data(&[0; 5]),
            Err(CloneError::ProtocolViolation(_))
        ));
    }

    #[test]
    fn test_checksum_path() {
        let mut p = profile(8);
        p.has_checksum = true;
        let mut h = Harness::new(p, SessionConfig::default());
        h.data(&[0x41, 0x42]).unwrap();
        let data = [1, 2, 3, 4, 5, 6, 7, 8];
        h.data(&data).unwrap();
        assert_eq!(h.machine.state(), ReadState::WaitChecksum);
        assert_eq!(h.acks(), 2);

        let sum = modular_sum(&[0x41, 0x42]).wrapping_add(modular_sum(&data));
        h.data(&[sum]).unwrap();
        assert!(h.machine.is_done());
        assert_eq!(h.acks(), 3);
    }

    #[test]
    fn test_checksum_mismatch() {
        let mut p = profile(8);
        p.has_checksum = true;
        let mut h = Harness::new(p, SessionConfig::default());
        h.data(&[0x41, 0x42]).unwrap();
        h.data(&[0; 8]).unwrap();
        let err = h.data(&[0x00]).unwrap_err();
        assert_eq!(
            err,
            CloneError::ChecksumMismatch {
                expected: 0x83,
                actual: 0x00
            }
        );
    }

    #[test]
    fn test_delayed_final_ack() {
        let mut p = profile(8);
        p.delay_final_ack = true;
        let mut h = Harness::new(p, SessionConfig::default());
        h.data(&[0x41, 0x42]).unwrap();
        h.data(&[0; 8]).unwrap();
        assert_eq!(h.machine.state(), ReadState::DelayAck);
        assert_eq!(h.acks(), 1);
        assert_eq!(
            h.machine.timeout(&TimeoutConfig::default()),
            Some(Duration::from_millis(5))
        );
        h.timeout().unwrap();
        assert!(h.machine.is_done());
        assert_eq!(h.acks(), 2);
    }

    #[test]
    fn test_recv_echo_consumes_ack() {
        let mut p = profile(8);
        p.recv_echo = Some(true);
        p.has_checksum = true;
        let mut h = Harness::new(p, SessionConfig::default());
        h.data(&[0x41, 0x42]).unwrap();

        // Echoed ack arrives with the block
        let mut bytes = vec![ACK];
        bytes.extend_from_slice(&[1; 8]);
        h.data(&bytes).unwrap();
        assert_eq!(h.machine.state(), ReadState::WaitChecksum);
        assert_eq!(h.machine.blocks().last().unwrap().len(), 8);

        let sum = 0x41u8.wrapping_add(0x42).wrapping_add(8);
        h.data(&[ACK, sum]).unwrap();
        assert!(h.machine.is_done());
    }

    #[test]
    fn test_recv_echo_wrong_byte() {
        let mut p = profile(8);
        p.recv_echo = Some(true);
        let mut h = Harness::new(p, SessionConfig::default());
        h.data(&[0x41, 0x42]).unwrap();
        assert!(matches!(
            h.data(&[0x15, 0x00]),
            Err(CloneError::ProtocolViolation(_))
        ));
    }

    #[test]
    fn test_no_end_echo() {
        let mut p = profile(8);
        p.recv_echo = Some(true);
        p.no_end_echo = true;
        p.has_checksum = true;
        let mut h = Harness::new(p, SessionConfig::default());
        h.data(&[0x41, 0x42]).unwrap();
        h.data(&[ACK]).unwrap();
        h.data(&[0; 8]).unwrap();
        assert_eq!(h.machine.state(), ReadState::WaitChecksum);
        h.data(&[0x83]).unwrap();
        assert!(h.machine.is_done());
    }

    #[test]
    fn test_checkblock_strips_framing() {
        let mut p = profile(5);
        p.has_checkblock = true;
        p.block_sizes = BlockSizes::Runs(vec![
            BlockRun { count: 1, size: 5 },
            BlockRun { count: 0, size: 4 },
        ]);
        let mut h = Harness::new(p, SessionConfig::default());
        h.data(&[0x41, 0x42]).unwrap();
        h.data(&frame_checkblock(1, &[1, 2, 3])).unwrap();
        assert_eq!(h.machine.state(), ReadState::WaitBlock);
        assert_eq!(h.machine.data_count(), 3);

        h.data(&frame_checkblock(2, &[4, 5])).unwrap();
        assert!(h.machine.is_done());
        assert_eq!(h.machine.blocks().to_image(), vec![0x41, 0x42, 1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_checkblock_bad_sequence() {
        let mut p = profile(8);
        p.has_checkblock = true;
        p.block_sizes = BlockSizes::Fixed(6);
        let mut h = Harness::new(p, SessionConfig::default());
        h.data(&[0x41, 0x42]).unwrap();
        assert!(matches!(
            h.data(&frame_checkblock(5, &[1, 2, 3, 4])),
            Err(CloneError::ProtocolViolation(_))
        ));
    }

    #[test]
    fn test_timing_mode() {
        let mut h = Harness::new(profile(16), SessionConfig::default());
        h.data(&[0x10, 0x20, 0x30]).unwrap();
        assert_eq!(h.machine.state(), ReadState::InFirstBlock);

        h.timeout().unwrap();
        assert!(h.machine.timing_mode());
        assert_eq!(h.machine.state(), ReadState::WaitBlock);
        assert_eq!(
            h.machine.timeout(&TimeoutConfig::default()),
            Some(Duration::from_millis(200))
        );

        // Larger than the fallback block size; timing mode does not care
        h.data(&[1; 70]).unwrap();
        h.timeout().unwrap();
        assert_eq!(h.machine.state(), ReadState::WaitBlock);

        let sum = modular_sum(&[0x10, 0x20, 0x30]).wrapping_add(70).wrapping_add(5);
        h.data(&[5, sum]).unwrap();
        h.timeout().unwrap();
        assert_eq!(h.machine.state(), ReadState::WaitBlock);

        h.timeout().unwrap();
        assert!(h.machine.is_done());
        assert_eq!(h.machine.blocks().block_sizes(), vec![3, 70, 1]);
        assert_eq!(h.machine.data_count(), 71);
        assert_eq!(h.acks(), 3);
    }

    #[test]
    fn test_timing_mode_bad_checksum_only_fatal_with_checksum() {
        let config = SessionConfig {
            has_checksum: Some(true),
            ..Default::default()
        };
        let mut h = Harness::new(profile(16), config);
        h.data(&[0x10]).unwrap();
        h.timeout().unwrap();
        h.data(&[1, 2, 0xEE]).unwrap();
        h.timeout().unwrap();
        assert!(matches!(
            h.timeout(),
            Err(CloneError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn test_timeout_while_waiting_is_fatal() {
        let mut h = Harness::new(profile(16), SessionConfig::default());
        assert!(matches!(h.timeout(), Err(CloneError::Timeout(_))));

        let mut h = Harness::new(profile(16), SessionConfig::default());
        h.data(&[0x41, 0x42]).unwrap();
        assert!(matches!(h.timeout(), Err(CloneError::Timeout(_))));
    }

    #[test]
    fn test_header_overflow() {
        let mut h = Harness::new(profile(16), SessionConfig::default());
        h.data(&[0x00; 200]).unwrap();
        assert!(matches!(
            h.data(&[0x00; 60]),
            Err(CloneError::BufferOverflow(_))
        ));
    }

    #[test]
    fn test_extra_checksum_bytes() {
        let mut p = profile(8);
        p.has_checksum = true;
        let mut h = Harness::new(p, SessionConfig::default());
        h.data(&[0x41, 0x42]).unwrap();
        h.data(&[0; 8]).unwrap();
        assert!(matches!(
            h.data(&[0x83, 0x00]),
            Err(CloneError::ProtocolViolation(_))
        ));
    }
}
