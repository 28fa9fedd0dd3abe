//! Paced output for slow receivers
//!
//! Some radios drop bytes if they arrive too quickly. The
//! [`WriteFlowController`] stages outgoing bytes in a bounded buffer and
//! writes them in bursts of at most `chunk_size` bytes. After a full burst
//! it stops asking for write readiness and polls until the transport's
//! output queue is empty, waits `inter_chunk_wait`, then resumes.
//!
//! ```text
//! Idle --(full chunk written, more pending)--> Draining
//! Draining --(poll: output queue empty)--> Delaying
//! Delaying --(inter_chunk_wait elapsed)--> Idle (write interest back on)
//! ```

use std::collections::VecDeque;
use std::io;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, trace};

use crate::error::CloneError;
use crate::transport::Transport;

/// Capacity of the staging buffer
pub const WRITE_BUFFER_CAPACITY: usize = 65536;

/// Output pacing parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlowConfig {
    /// Largest burst; zero is unlimited
    pub chunk_size: usize,
    /// Pause between bursts once the output queue has drained
    pub inter_chunk_wait: Duration,
    /// Pause before every physical write
    pub pre_write_delay: Duration,
    /// How often to check the output queue while draining
    pub poll_interval: Duration,
}

impl Default for FlowConfig {
    fn default() -> Self {
        Self {
            chunk_size: 0,
            inter_chunk_wait: Duration::ZERO,
            pre_write_delay: Duration::ZERO,
            poll_interval: Duration::from_millis(5),
        }
    }
}

/// Throttle state of the flow controller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FlowState {
    /// Writing freely
    #[default]
    Idle,
    /// Waiting for the transport's output queue to empty
    Draining,
    /// Waiting out the inter-chunk pause
    Delaying,
}

/// Staging buffer cannot take more bytes right now
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("write buffer full: {pending} bytes pending, {requested} more requested")]
pub struct BufferFull {
    pub pending: usize,
    pub requested: usize,
}

/// Bounded, chunked, rate-limited output stage
#[derive(Debug)]
pub struct WriteFlowController {
    buffer: VecDeque<u8>,
    config: FlowConfig,
    state: FlowState,
}

impl WriteFlowController {
    /// Create a controller with unlimited chunk size
    pub fn new() -> Self {
        Self::with_config(FlowConfig::default())
    }

    pub fn with_config(config: FlowConfig) -> Self {
        Self {
            buffer: VecDeque::with_capacity(WRITE_BUFFER_CAPACITY),
            config,
            state: FlowState::Idle,
        }
    }

    /// Replace the pacing parameters; pending bytes are kept
    pub fn configure(&mut self, config: FlowConfig) {
        self.config = config;
    }

    pub fn config(&self) -> &FlowConfig {
        &self.config
    }

    pub fn state(&self) -> FlowState {
        self.state
    }

    /// Bytes staged but not yet accepted by the transport
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn is_throttled(&self) -> bool {
        self.state != FlowState::Idle
    }

    /// Timer the controller needs while throttled
    pub fn timeout(&self) -> Option<Duration> {
        match self.state {
            FlowState::Idle => None,
            FlowState::Draining => Some(self.config.poll_interval),
            FlowState::Delaying => Some(self.config.inter_chunk_wait),
        }
    }

    /// Stage bytes for output
    pub fn submit(&mut self, bytes: &[u8]) -> Result<(), BufferFull> {
        if self.buffer.len() + bytes.len() > WRITE_BUFFER_CAPACITY {
            return Err(BufferFull {
                pending: self.buffer.len(),
                requested: bytes.len(),
            });
        }
        self.buffer.extend(bytes);
        Ok(())
    }

    /// Write as much as pacing and the transport allow
    ///
    /// Returns the number of bytes the transport accepted. Does nothing
    /// while throttled.
    pub fn drain_attempt<T: Transport>(&mut self, transport: &mut T) -> io::Result<usize> {
        if self.is_throttled() {
            return Ok(0);
        }

        let chunk_size = self.config.chunk_size;
        let mut total = 0;

        while !self.buffer.is_empty() {
            let budget = if chunk_size > 0 {
                chunk_size - total
            } else {
                usize::MAX
            };
            let (front, _) = self.buffer.as_slices();
            let len = front.len().min(budget);

            if !self.config.pre_write_delay.is_zero() {
                transport.pause(self.config.pre_write_delay);
            }
            let written = transport.write(&front[..len])?.min(len);
            if written > 0 {
                trace!("Write: {:02X?}", &front[..written]);
            }
            self.buffer.drain(..written);
            total += written;

            if chunk_size > 0 && total >= chunk_size {
                if self.buffer.is_empty() {
                    break;
                }
                debug!(
                    "Chunk of {} bytes written, {} pending; waiting for output to drain",
                    total,
                    self.buffer.len()
                );
                transport.set_write_interest(false);
                self.state = FlowState::Draining;
                return Ok(total);
            }

            if written < len {
                transport.set_write_interest(true);
                return Ok(total);
            }
        }

        transport.set_write_interest(false);
        Ok(total)
    }

    /// Advance the throttle when its timer fires
    pub fn on_timeout<T: Transport>(&mut self, transport: &mut T) -> io::Result<()> {
        match self.state {
            FlowState::Idle => {}
            FlowState::Draining => {
                let left = transport.output_queue_len()?;
                if left == 0 {
                    trace!("Output queue drained");
                    self.state = FlowState::Delaying;
                }
            }
            FlowState::Delaying => {
                self.state = FlowState::Idle;
                transport.set_write_interest(true);
            }
        }
        Ok(())
    }
}

impl Default for WriteFlowController {
    fn default() -> Self {
        Self::new()
    }
}

/// A flow controller paired with its transport for the duration of one
/// event
pub struct Outbound<'a, T: Transport> {
    pub flow: &'a mut WriteFlowController,
    pub transport: &'a mut T,
}

impl<'a, T: Transport> Outbound<'a, T> {
    pub fn new(flow: &'a mut WriteFlowController, transport: &'a mut T) -> Self {
        Self { flow, transport }
    }

    /// Stage and start writing; a full buffer is fatal
    pub fn send(&mut self, bytes: &[u8]) -> Result<(), CloneError> {
        if !self.try_send(bytes)? {
            return Err(CloneError::BufferOverflow(format!(
                "no room for {} bytes in the write buffer",
                bytes.len()
            )));
        }
        Ok(())
    }

    /// Stage and start writing; returns false if the buffer is full
    pub fn try_send(&mut self, bytes: &[u8]) -> Result<bool, CloneError> {
        match self.flow.submit(bytes) {
            Ok(()) => {
                self.drain()?;
                Ok(true)
            }
            Err(full) => {
                debug!("{}", full);
                Ok(false)
            }
        }
    }

    /// Continue writing staged bytes
    pub fn drain(&mut self) -> Result<(), CloneError> {
        self.flow.drain_attempt(&mut *self.transport)?;
        Ok(())
    }
}
