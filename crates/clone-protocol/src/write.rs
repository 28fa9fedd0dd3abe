//! Sending a memory image to the radio
//!
//! The image is split into blocks before the session starts (see
//! [`crate::image`]). Each block is written and then acknowledged by the
//! radio with a single ACK byte. On links that echo, the echoed block bytes
//! arrive first and must match what was sent. After the last block a
//! whole-transfer checksum byte may follow, either after the last ack
//! (`waitchecksum`) or straight after the last block has been sent,
//! optionally after a delay.

use std::time::Duration;

use tracing::{debug, trace};

use crate::block::BlockList;
use crate::checksum::RunningSum;
use crate::config::{EffectiveSettings, TimeoutConfig};
use crate::error::CloneError;
use crate::flow::Outbound;
use crate::transport::Transport;
use crate::ACK;

/// Protocol state while writing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteState {
    /// Sending the current block and waiting for its echo and ack
    Block,
    /// Waiting before sending an unacknowledged checksum
    DelayChecksum,
    /// Checksum could not be staged yet; retried when writable
    SendChecksum,
    /// Checksum sent on an echoing link; its echo comes first
    WaitForEchoThenAck,
    /// Checksum sent; waiting for the radio's ack
    WaitForAckOnly,
    /// Transfer complete
    Done,
}

/// Write-side clone protocol state machine
#[derive(Debug)]
pub struct WriteStateMachine {
    state: WriteState,
    settings: EffectiveSettings,
    blocks: BlockList,
    current: usize,
    submitted: bool,
    echo_pos: usize,
    sum: RunningSum,
    /// Payload bytes of data blocks sent, checkblock framing removed
    data_count: usize,
    bytes_sent: usize,
}

impl WriteStateMachine {
    /// Create a machine that sends `blocks`, header first
    pub fn new(blocks: BlockList, settings: EffectiveSettings) -> Self {
        Self {
            state: WriteState::Block,
            settings,
            blocks,
            current: 0,
            submitted: false,
            echo_pos: 0,
            sum: RunningSum::new(),
            data_count: 0,
            bytes_sent: 0,
        }
    }

    pub fn state(&self) -> WriteState {
        self.state
    }

    pub fn is_done(&self) -> bool {
        self.state == WriteState::Done
    }

    pub fn settings(&self) -> &EffectiveSettings {
        &self.settings
    }

    pub fn blocks(&self) -> &BlockList {
        &self.blocks
    }

    /// Index of the block being sent
    pub fn current_block(&self) -> usize {
        self.current
    }

    pub fn data_count(&self) -> usize {
        self.data_count
    }

    pub fn bytes_sent(&self) -> usize {
        self.bytes_sent
    }

    /// Running whole-transfer checksum
    pub fn checksum(&self) -> u8 {
        self.sum.value()
    }

    /// Timer to arm for the current state
    pub fn timeout(&self, timeouts: &TimeoutConfig) -> Option<Duration> {
        match self.state {
            WriteState::DelayChecksum => Some(self.settings.checksum_delay),
            WriteState::Done => None,
            _ => Some(timeouts.character),
        }
    }

    /// Send the header block
    pub fn start<T: Transport>(&mut self, out: &mut Outbound<'_, T>) -> Result<(), CloneError> {
        if self.blocks.is_empty() {
            self.state = WriteState::Done;
            return Ok(());
        }
        self.begin_block(out, 0)
    }

    /// Continue writing when the transport can take more
    pub fn on_write_ready<T: Transport>(
        &mut self,
        out: &mut Outbound<'_, T>,
    ) -> Result<(), CloneError> {
        out.drain()?;
        match self.state {
            WriteState::Block if !self.submitted => self.submit_current(out),
            WriteState::Block => self.check_drained(out),
            WriteState::SendChecksum => self.send_checksum(out),
            _ => Ok(()),
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
            WriteState::Block => self.block_response(out, bytes),
            WriteState::WaitForEchoThenAck => {
                let expected = self.sum.value();
                if bytes[0] != expected {
                    return Err(CloneError::ProtocolViolation(format!(
                        "checksum echo 0x{:02X}, sent 0x{:02X}",
                        bytes[0], expected
                    )));
                }
                self.state = WriteState::WaitForAckOnly;
                match &bytes[1..] {
                    [] => Ok(()),
                    rest => self.final_ack(out, rest),
                }
            }
            WriteState::WaitForAckOnly => self.final_ack(out, bytes),
            WriteState::DelayChecksum | WriteState::SendChecksum | WriteState::Done => {
                trace!("Ignoring {} bytes", bytes.len());
                Ok(())
            }
        }
    }

    /// Handle the armed timer firing
    pub fn on_timeout<T: Transport>(&mut self, out: &mut Outbound<'_, T>) -> Result<(), CloneError> {
        match self.state {
            WriteState::DelayChecksum => self.send_checksum(out),
            WriteState::Done => Ok(()),
            state => Err(CloneError::Timeout(format!(
                "in write state {:?} on block {}",
                state, self.current
            ))),
        }
    }

    fn is_last(&self) -> bool {
        self.current + 1 >= self.blocks.len()
    }

    /// Checksum goes out without waiting for the last block's ack
    fn checksum_without_ack(&self) -> bool {
        self.settings.has_checksum && !self.settings.wait_for_ack_before_checksum
    }

    fn begin_block<T: Transport>(
        &mut self,
        out: &mut Outbound<'_, T>,
        index: usize,
    ) -> Result<(), CloneError> {
        self.current = index;
        self.echo_pos = 0;
        self.submitted = false;
        if let Some(block) = self.blocks.get(index) {
            self.sum.add(block.payload());
        }
        self.submit_current(out)
    }

    fn submit_current<T: Transport>(&mut self, out: &mut Outbound<'_, T>) -> Result<(), CloneError> {
        let Some(block) = self.blocks.get(self.current) else {
            return Ok(());
        };
        if !out.try_send(block.payload())? {
            return Ok(());
        }
        self.submitted = true;
        self.bytes_sent += block.len();
        if self.current > 0 {
            self.data_count += if self.settings.has_checkblock {
                block.len().saturating_sub(2)
            } else {
                block.len()
            };
        }
        debug!("Sent block {} ({} bytes)", self.current, block.len());
        self.check_drained(out)
    }

    /// Without echo, the last block is complete once it has left the buffer
    fn check_drained<T: Transport>(&mut self, out: &mut Outbound<'_, T>) -> Result<(), CloneError> {
        if self.state == WriteState::Block
            && self.submitted
            && !self.settings.recv_echo
            && self.is_last()
            && self.checksum_without_ack()
            && out.flow.is_empty()
        {
            return self.begin_checksum(out);
        }
        Ok(())
    }

    fn block_response<T: Transport>(
        &mut self,
        out: &mut Outbound<'_, T>,
        bytes: &[u8],
    ) -> Result<(), CloneError> {
        if !self.submitted {
            return Err(CloneError::ProtocolViolation(format!(
                "data received before block {} was sent",
                self.current
            )));
        }

        let mut rest = bytes;
        if self.settings.recv_echo {
            let payload = self.blocks.get(self.current).map_or(&[][..], |b| b.payload());
            while self.echo_pos < payload.len() {
                let Some((&byte, tail)) = rest.split_first() else {
                    // More echo to come
                    return Ok(());
                };
                if byte != payload[self.echo_pos] {
                    return Err(CloneError::ProtocolViolation(format!(
                        "echo mismatch at byte {} of block {}: got 0x{:02X}, sent 0x{:02X}",
                        self.echo_pos, self.current, byte, payload[self.echo_pos]
                    )));
                }
                self.echo_pos += 1;
                rest = tail;
            }
            if self.is_last() && self.checksum_without_ack() {
                return self.begin_checksum(out);
            }
        }

        if rest.is_empty() {
            return Ok(());
        }
        if rest != [ACK] {
            return Err(CloneError::ProtocolViolation(format!(
                "expected ack for block {}, got {:02X?}",
                self.current, rest
            )));
        }
        debug!("Block {} acknowledged", self.current);

        if !self.is_last() {
            return self.begin_block(out, self.current + 1);
        }
        if self.settings.has_checksum {
            self.begin_checksum(out)
        } else {
            self.state = WriteState::Done;
            Ok(())
        }
    }

    fn begin_checksum<T: Transport>(&mut self, out: &mut Outbound<'_, T>) -> Result<(), CloneError> {
        if !self.settings.wait_for_ack_before_checksum && !self.settings.checksum_delay.is_zero() {
            self.state = WriteState::DelayChecksum;
            return Ok(());
        }
        self.send_checksum(out)
    }

    fn send_checksum<T: Transport>(&mut self, out: &mut Outbound<'_, T>) -> Result<(), CloneError> {
        let sum = self.sum.value();
        if !out.try_send(&[sum])? {
            self.state = WriteState::SendChecksum;
            return Ok(());
        }
        debug!("Sent checksum 0x{:02X}", sum);
        self.state = if !self.settings.wait_for_ack_before_checksum {
            WriteState::Done
        } else if self.settings.recv_echo {
            WriteState::WaitForEchoThenAck
        } else {
            WriteState::WaitForAckOnly
        };
        Ok(())
    }

    /// Any reply to the checksum ends the transfer
    fn final_ack<T: Transport>(
        &mut self,
        out: &mut Outbound<'_, T>,
        bytes: &[u8],
    ) -> Result<(), CloneError> {
        if bytes != [ACK] {
            debug!("Radio answered the checksum with {:02X?}", bytes);
        }
        self.state = WriteState::Done;
        out.send(&[ACK])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checksum::modular_sum;
    use crate::config::SessionConfig;
    use crate::flow::WriteFlowController;
    use crate::profile::RadioProfile;
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
        machine: WriteStateMachine,
        flow: WriteFlowController,
        wire: Wire,
    }

    impl Harness {
        fn new(blocks: &[&[u8]], tweak: impl FnOnce(&mut RadioProfile)) -> Self {
            let mut list = BlockList::new();
            for b in blocks {
                list.new_block();
                list.append_to_last(b).unwrap();
            }
            let mut profile = RadioProfile::fallback();
            tweak(&mut profile);
            let settings = EffectiveSettings::resolve(&profile, &SessionConfig::default());
            let mut h = Self {
                machine: WriteStateMachine::new(list, settings),
                flow: WriteFlowController::new(),
                wire: Wire::default(),
            };
            let mut out = Outbound::new(&mut h.flow, &mut h.wire);
            h.machine.start(&mut out).unwrap();
            h
        }

        fn data(&mut self, bytes: &[u8]) -> Result<(), CloneError> {
            let mut out = Outbound::new(&mut self.flow, &mut self.wire);
            self.machine.on_data(&mut out, bytes)
        }

        fn timeout(&mut self) -> Result<(), CloneError> {
            let mut out = Outbound::new(&mut self.flow, &mut self.wire);
            self.machine.on_timeout(&mut out)
        }

        fn take_sent(&mut self) -> Vec<u8> {
            std::mem::take(&mut self.wire.sent)
        }
    }

    #[test]
    fn test_plain_write() {
        let mut h = Harness::new(&[&[0x41, 0x42], &[1, 2, 3]], |_| {});
        assert_eq!(h.take_sent(), vec![0x41, 0x42]);
        h.data(&[ACK]).unwrap();
        assert_eq!(h.take_sent(), vec![1, 2, 3]);
        assert_eq!(h.machine.current_block(), 1);
        h.data(&[ACK]).unwrap();
        assert!(h.machine.is_done());
        assert!(h.take_sent().is_empty());
        assert_eq!(h.machine.data_count(), 3);
        assert_eq!(h.machine.bytes_sent(), 5);
    }

    #[test]
    fn test_bad_ack() {
        let mut h = Harness::new(&[&[0x41], &[1]], |_| {});
        assert!(matches!(
            h.data(&[0x15]),
            Err(CloneError::ProtocolViolation(_))
        ));

        let mut h = Harness::new(&[&[0x41], &[1]], |_| {});
        assert!(matches!(
            h.data(&[ACK, ACK]),
            Err(CloneError::ProtocolViolation(_))
        ));
    }

    #[test]
    fn test_echo_then_ack_across_reads() {
        let mut h = Harness::new(&[&[0x41, 0x42], &[1, 2, 3]], |p| p.recv_echo = Some(true));
        h.data(&[0x41]).unwrap();
        h.data(&[0x42, ACK]).unwrap();
        assert_eq!(h.machine.current_block(), 1);
        h.data(&[1, 2]).unwrap();
        h.data(&[3]).unwrap();
        assert_eq!(h.machine.state(), WriteState::Block);
        h.data(&[ACK]).unwrap();
        assert!(h.machine.is_done());
    }

    #[test]
    fn test_echo_mismatch() {
        let mut h = Harness::new(&[&[0x41, 0x42], &[1]], |p| p.recv_echo = Some(true));
        assert!(matches!(
            h.data(&[0x41, 0x43]),
            Err(CloneError::ProtocolViolation(_))
        ));
    }

    #[test]
    fn test_checksum_after_ack() {
        let mut h = Harness::new(&[&[0x41], &[1, 2]], |p| p.has_checksum = true);
        h.data(&[ACK]).unwrap();
        h.take_sent();
        h.data(&[ACK]).unwrap();
        assert_eq!(h.take_sent(), vec![modular_sum(&[0x41, 1, 2])]);
        assert_eq!(h.machine.state(), WriteState::WaitForAckOnly);

        h.data(&[ACK]).unwrap();
        assert!(h.machine.is_done());
        assert_eq!(h.take_sent(), vec![ACK]);
    }

    #[test]
    fn test_checksum_echo_then_ack() {
        let mut h = Harness::new(&[&[0x41], &[1, 2]], |p| {
            p.has_checksum = true;
            p.recv_echo = Some(true);
        });
        h.data(&[0x41, ACK]).unwrap();
        h.data(&[1, 2, ACK]).unwrap();
        assert_eq!(h.machine.state(), WriteState::WaitForEchoThenAck);

        let sum = modular_sum(&[0x41, 1, 2]);
        h.data(&[sum]).unwrap();
        assert_eq!(h.machine.state(), WriteState::WaitForAckOnly);
        h.data(&[ACK]).unwrap();
        assert!(h.machine.is_done());
    }

    #[test]
    fn test_checksum_echo_and_ack_together() {
        let mut h = Harness::new(&[&[0x41], &[1, 2]], |p| {
            p.has_checksum = true;
            p.recv_echo = Some(true);
        });
        h.data(&[0x41, ACK]).unwrap();
        h.data(&[1, 2, ACK]).unwrap();
        h.take_sent();

        let sum = modular_sum(&[0x41, 1, 2]);
        h.data(&[sum, ACK]).unwrap();
        assert!(h.machine.is_done());
        assert_eq!(h.take_sent(), vec![ACK]);
    }

    #[test]
    fn test_any_reply_to_checksum_is_acked() {
        let mut h = Harness::new(&[&[0x41], &[1, 2]], |p| p.has_checksum = true);
        h.data(&[ACK]).unwrap();
        h.data(&[ACK]).unwrap();
        assert_eq!(h.machine.state(), WriteState::WaitForAckOnly);
        h.take_sent();

        h.data(&[0x15]).unwrap();
        assert!(h.machine.is_done());
        assert_eq!(h.take_sent(), vec![ACK]);
    }

    #[test]
    fn test_checksum_echo_mismatch() {
        let mut h = Harness::new(&[&[0x41]], |p| {
            p.has_checksum = true;
            p.recv_echo = Some(true);
        });
        h.data(&[0x41, ACK]).unwrap();
        assert!(matches!(
            h.data(&[0x00, ACK]),
            Err(CloneError::ProtocolViolation(_))
        ));
    }

    #[test]
    fn test_checksum_without_ack_no_echo() {
        let mut h = Harness::new(&[&[0x41], &[1, 2]], |p| {
            p.has_checksum = true;
            p.wait_for_ack_before_checksum = false;
        });
        h.data(&[ACK]).unwrap();
        // Last block drained: checksum follows immediately
        assert_eq!(h.take_sent(), vec![0x41, 1, 2, modular_sum(&[0x41, 1, 2])]);
        assert!(h.machine.is_done());

        // Late ack for the last block is ignored
        h.data(&[ACK]).unwrap();
    }

    #[test]
    fn test_delayed_checksum_with_echo() {
        let mut h = Harness::new(&[&[0x41], &[1, 2]], |p| {
            p.has_checksum = true;
            p.wait_for_ack_before_checksum = false;
            p.checksum_delay = Duration::from_millis(50);
            p.recv_echo = Some(true);
        });
        h.data(&[0x41, ACK]).unwrap();
        h.data(&[1, 2]).unwrap();
        assert_eq!(h.machine.state(), WriteState::DelayChecksum);
        assert_eq!(
            h.machine.timeout(&TimeoutConfig::default()),
            Some(Duration::from_millis(50))
        );
        h.data(&[ACK]).unwrap();
        h.take_sent();

        h.timeout().unwrap();
        assert_eq!(h.take_sent(), vec![modular_sum(&[0x41, 1, 2])]);
        assert!(h.machine.is_done());
    }

    #[test]
    fn test_timeout_waiting_for_ack() {
        let mut h = Harness::new(&[&[0x41], &[1]], |_| {});
        assert!(matches!(h.timeout(), Err(CloneError::Timeout(_))));
    }

    #[test]
    fn test_checkblock_data_count() {
        let mut h = Harness::new(&[&[0x41], &[1, 9, 8, 17]], |p| p.has_checkblock = true);
        h.data(&[ACK]).unwrap();
        h.data(&[ACK]).unwrap();
        assert_eq!(h.machine.data_count(), 2);
        assert_eq!(h.machine.bytes_sent(), 5);
    }
}
