//! In-memory transport for driving a session without a serial port

use std::io;
use std::time::Duration;

use clone_protocol::Transport;

/// Transport that records everything the engine does
#[derive(Debug, Default, Clone)]
pub struct MockTransport {
    /// Every byte ever accepted
    history: Vec<u8>,
    /// Accepted bytes not yet collected by [`take_written`](Self::take_written)
    pending: Vec<u8>,
    /// Size of every write call, including refused ones
    write_calls: Vec<usize>,
    write_limit: Option<usize>,
    fail_writes: Option<io::ErrorKind>,
    write_interest: bool,
    read_interest: bool,
    drain_polls: usize,
    queued_polls: usize,
    pauses: Vec<Duration>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Accept at most `limit` bytes per write call
    pub fn with_write_limit(mut self, limit: usize) -> Self {
        self.write_limit = Some(limit);
        self
    }

    /// Report a non-empty output queue for `polls` checks after each write
    pub fn with_drain_polls(mut self, polls: usize) -> Self {
        self.drain_polls = polls;
        self
    }

    /// Make every following write fail with `kind`
    pub fn fail_writes(&mut self, kind: io::ErrorKind) {
        self.fail_writes = Some(kind);
    }

    /// Collect bytes accepted since the last call
    pub fn take_written(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.pending)
    }

    /// Every byte accepted so far
    pub fn history(&self) -> &[u8] {
        &self.history
    }

    /// Length of each write call, in order
    pub fn write_calls(&self) -> &[usize] {
        &self.write_calls
    }

    pub fn write_interest(&self) -> bool {
        self.write_interest
    }

    pub fn read_interest(&self) -> bool {
        self.read_interest
    }

    /// Pre-write pauses requested so far
    pub fn pauses(&self) -> &[Duration] {
        &self.pauses
    }
}

impl Transport for MockTransport {
    fn write(&mut self, bytes: &[u8]) -> io::Result<usize> {
        if let Some(kind) = self.fail_writes {
            return Err(io::Error::new(kind, "simulated write failure"));
        }
        self.write_calls.push(bytes.len());
        let n = self.write_limit.map_or(bytes.len(), |l| l.min(bytes.len()));
        self.history.extend_from_slice(&bytes[..n]);
        self.pending.extend_from_slice(&bytes[..n]);
        if n > 0 {
            self.queued_polls = self.drain_polls;
        }
        Ok(n)
    }

    fn set_write_interest(&mut self, enabled: bool) {
        self.write_interest = enabled;
    }

    fn set_read_interest(&mut self, enabled: bool) {
        self.read_interest = enabled;
    }

    fn output_queue_len(&mut self) -> io::Result<usize> {
        if self.queued_polls > 0 {
            self.queued_polls -= 1;
            return Ok(1);
        }
        Ok(0)
    }

    fn pause(&mut self, duration: Duration) {
        self.pauses.push(duration);
    }
}
