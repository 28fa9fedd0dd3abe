//! One clone transfer bound to one transport
//!
//! [`SessionEngine`] wraps the read or write state machine together with
//! the output flow controller and the transport. The caller's event loop
//! asks it for the next timer with [`next_timeout`], then feeds back
//! whatever happened first: bytes from the radio ([`on_data`]), the
//! transport becoming writable ([`on_write_ready`]) or the timer expiring
//! ([`on_timeout`]). The loop ends when [`is_done`] reports true.
//!
//! The first error is sticky: the engine stops asking for I/O, keeps the
//! blocks received so far, and returns the same error from every later
//! call.
//!
//! # Example
//!
//! ```rust,no_run
//! use clone_protocol::{ProfileRegistry, SessionConfig, SessionEngine, Transport};
//!
//! fn read_image<T: Transport>(transport: T) -> Vec<u8> {
//!     let registry = ProfileRegistry::from_config_dir("/etc/radioconf").unwrap();
//!     let mut engine = SessionEngine::new_read(registry, SessionConfig::default(), transport);
//!     engine.start().unwrap();
//!     // ... drive on_data / on_write_ready / on_timeout until engine.is_done() ...
//!     engine.image()
//! }
//! ```
//!
//! [`next_timeout`]: SessionEngine::next_timeout
//! [`on_data`]: SessionEngine::on_data
//! [`on_write_ready`]: SessionEngine::on_write_ready
//! [`on_timeout`]: SessionEngine::on_timeout
//! [`is_done`]: SessionEngine::is_done

use std::time::Duration;

use tracing::{info, warn};

use crate::block::BlockList;
use crate::config::{EffectiveSettings, SessionConfig, TimeoutConfig};
use crate::error::CloneError;
use crate::flow::{Outbound, WriteFlowController};
use crate::image::{split_image, WriteImage};
use crate::profile::RadioProfile;
use crate::read::{ReadState, ReadStateMachine};
use crate::registry::ProfileRegistry;
use crate::transport::Transport;
use crate::write::{WriteState, WriteStateMachine};

/// Which way the image moves
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Direction {
    /// Radio to host
    Read,
    /// Host to radio
    Write,
}

#[derive(Debug)]
enum Machine {
    Read(ReadStateMachine),
    Write {
        machine: WriteStateMachine,
        profile: RadioProfile,
    },
}

impl Machine {
    fn settings(&self) -> &EffectiveSettings {
        match self {
            Machine::Read(m) => m.settings(),
            Machine::Write { machine, .. } => machine.settings(),
        }
    }

    fn is_done(&self) -> bool {
        match self {
            Machine::Read(m) => m.is_done(),
            Machine::Write { machine, .. } => machine.is_done(),
        }
    }
}

/// Clone protocol engine for one transfer
#[derive(Debug)]
pub struct SessionEngine<T: Transport> {
    machine: Machine,
    flow: WriteFlowController,
    transport: T,
    timeouts: TimeoutConfig,
    error: Option<CloneError>,
}

impl<T: Transport> SessionEngine<T> {
    /// Prepare to receive an image; the radio is identified from its header
    pub fn new_read(registry: ProfileRegistry, config: SessionConfig, transport: T) -> Self {
        let settings = EffectiveSettings::unmatched(&config);
        let flow = WriteFlowController::with_config(settings.flow_config(&config.timeouts));
        Self {
            timeouts: config.timeouts,
            machine: Machine::Read(ReadStateMachine::new(registry, config)),
            flow,
            transport,
            error: None,
        }
    }

    /// Prepare to send an already-split image
    pub fn new_write(image: WriteImage, config: SessionConfig, transport: T) -> Self {
        let settings = EffectiveSettings::resolve(&image.profile, &config);
        let flow = WriteFlowController::with_config(settings.flow_config(&config.timeouts));
        Self {
            timeouts: config.timeouts,
            machine: Machine::Write {
                machine: WriteStateMachine::new(image.blocks, settings),
                profile: image.profile,
            },
            flow,
            transport,
            error: None,
        }
    }

    /// Split a saved image and prepare to send it
    pub fn for_image(
        registry: &ProfileRegistry,
        config: SessionConfig,
        image: &[u8],
        transport: T,
    ) -> Result<Self, CloneError> {
        let split = split_image(registry, &config, image)?;
        info!("Found a {}", split.profile.name);
        Ok(Self::new_write(split, config, transport))
    }

    pub fn direction(&self) -> Direction {
        match self.machine {
            Machine::Read(_) => Direction::Read,
            Machine::Write { .. } => Direction::Write,
        }
    }

    /// Begin the transfer: enable reads and, when writing, send the header
    pub fn start(&mut self) -> Result<(), CloneError> {
        self.transport.set_read_interest(true);
        self.dispatch(|machine, out| match machine {
            Machine::Read(_) => Ok(()),
            Machine::Write { machine, .. } => machine.start(out),
        })
    }

    /// Finished, successfully or not
    pub fn is_done(&self) -> bool {
        self.error.is_some() || (self.machine.is_done() && self.flow.is_empty())
    }

    /// How long to wait for the next event before calling [`on_timeout`]
    ///
    /// `None` means no timer is needed.
    ///
    /// [`on_timeout`]: SessionEngine::on_timeout
    pub fn next_timeout(&self) -> Option<Duration> {
        if self.error.is_some() {
            return None;
        }
        if self.flow.is_throttled() {
            return self.flow.timeout();
        }
        match &self.machine {
            Machine::Read(m) => m.timeout(&self.timeouts),
            Machine::Write { machine, .. } => machine.timeout(&self.timeouts),
        }
    }

    /// Bytes arrived from the radio
    pub fn on_data(&mut self, bytes: &[u8]) -> Result<(), CloneError> {
        let send_echo = self.machine.settings().send_echo;
        self.dispatch(|machine, out| {
            if send_echo {
                out.send(bytes)?;
            }
            match machine {
                Machine::Read(m) => m.on_data(out, bytes),
                Machine::Write { machine, .. } => machine.on_data(out, bytes),
            }
        })
    }

    /// The transport can accept more output
    pub fn on_write_ready(&mut self) -> Result<(), CloneError> {
        self.dispatch(|machine, out| match machine {
            Machine::Read(_) => out.drain(),
            Machine::Write { machine, .. } => machine.on_write_ready(out),
        })
    }

    /// The timer from [`next_timeout`] expired
    ///
    /// [`next_timeout`]: SessionEngine::next_timeout
    pub fn on_timeout(&mut self) -> Result<(), CloneError> {
        self.dispatch(|machine, out| {
            if out.flow.is_throttled() {
                out.flow.on_timeout(&mut *out.transport)?;
                return Ok(());
            }
            match machine {
                Machine::Read(m) => m.on_timeout(out),
                Machine::Write { machine, .. } => machine.on_timeout(out),
            }
        })
    }

    fn dispatch<F>(&mut self, event: F) -> Result<(), CloneError>
    where
        F: FnOnce(&mut Machine, &mut Outbound<'_, T>) -> Result<(), CloneError>,
    {
        if let Some(err) = &self.error {
            return Err(err.clone());
        }
        let mut out = Outbound::new(&mut self.flow, &mut self.transport);
        let result = event(&mut self.machine, &mut out);
        if let Err(err) = &result {
            self.fail(err.clone());
        }
        result
    }

    fn fail(&mut self, err: CloneError) {
        warn!("Clone session failed: {}", err);
        self.transport.set_read_interest(false);
        self.transport.set_write_interest(false);
        self.error = Some(err);
    }

    /// The sticky error, if the session failed
    pub fn error(&self) -> Option<&CloneError> {
        self.error.as_ref()
    }

    pub fn read_state(&self) -> Option<ReadState> {
        match &self.machine {
            Machine::Read(m) => Some(m.state()),
            Machine::Write { .. } => None,
        }
    }

    pub fn write_state(&self) -> Option<WriteState> {
        match &self.machine {
            Machine::Read(_) => None,
            Machine::Write { machine, .. } => Some(machine.state()),
        }
    }

    /// Blocks received or being sent
    pub fn blocks(&self) -> &BlockList {
        match &self.machine {
            Machine::Read(m) => m.blocks(),
            Machine::Write { machine, .. } => machine.blocks(),
        }
    }

    /// Every block concatenated, as saved to disk
    pub fn image(&self) -> Vec<u8> {
        self.blocks().to_image()
    }

    /// Data payload bytes moved so far, header and framing excluded
    pub fn data_count(&self) -> usize {
        match &self.machine {
            Machine::Read(m) => m.data_count(),
            Machine::Write { machine, .. } => machine.data_count(),
        }
    }

    /// Blocks fully received, or fully sent and acknowledged
    pub fn blocks_transferred(&self) -> usize {
        match &self.machine {
            Machine::Read(m) => m.blocks().len(),
            Machine::Write { machine, .. } if machine.state() == WriteState::Block => {
                machine.current_block()
            }
            Machine::Write { machine, .. } => machine.blocks().len(),
        }
    }

    /// Raw header and block bytes moved so far
    pub fn bytes_transferred(&self) -> usize {
        match &self.machine {
            Machine::Read(m) => m.bytes_received(),
            Machine::Write { machine, .. } => machine.bytes_sent(),
        }
    }

    /// Profile in use, once known
    pub fn profile(&self) -> Option<&RadioProfile> {
        match &self.machine {
            Machine::Read(m) => m.profile(),
            Machine::Write { profile, .. } => Some(profile),
        }
    }

    pub fn settings(&self) -> &EffectiveSettings {
        self.machine.settings()
    }

    /// Blocks are being delimited by timeouts
    pub fn timing_mode(&self) -> bool {
        match &self.machine {
            Machine::Read(m) => m.timing_mode(),
            Machine::Write { .. } => false,
        }
    }

    pub fn flow(&self) -> &WriteFlowController {
        &self.flow
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Release the transport
    pub fn into_transport(self) -> T {
        self.transport
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::BlockSizes;
    use crate::ACK;
    use std::io;

    #[derive(Debug, Default)]
    struct Wire {
        sent: Vec<u8>,
        read_interest: bool,
        write_interest: bool,
        limit: Option<usize>,
    }

    impl Transport for Wire {
        fn write(&mut self, bytes: &[u8]) -> io::Result<usize> {
            let n = self.limit.map_or(bytes.len(), |l| l.min(bytes.len()));
            self.sent.extend_from_slice(&bytes[..n]);
            Ok(n)
        }
        fn set_write_interest(&mut self, enabled: bool) {
            self.write_interest = enabled;
        }
        fn set_read_interest(&mut self, enabled: bool) {
            self.read_interest = enabled;
        }
        fn output_queue_len(&mut self) -> io::Result<usize> {
            Ok(0)
        }
    }

    fn registry() -> ProfileRegistry {
        let mut p = RadioProfile::new("TEST", vec![0x41], 4, BlockSizes::Fixed(4));
        p.delay_final_ack = false;
        ProfileRegistry::from_profiles(vec![p])
    }

    #[test]
    fn test_read_session_lifecycle() {
        let mut engine = SessionEngine::new_read(registry(), SessionConfig::default(), Wire::default());
        engine.start().unwrap();
        assert!(engine.transport().read_interest);
        assert_eq!(engine.next_timeout(), Some(Duration::from_secs(10)));

        engine.on_data(&[0x41]).unwrap();
        assert_eq!(engine.read_state(), Some(ReadState::WaitBlock));
        assert_eq!(engine.profile().unwrap().name, "TEST");
        engine.on_data(&[1, 2, 3, 4]).unwrap();
        assert!(engine.is_done());
        assert_eq!(engine.image(), vec![0x41, 1, 2, 3, 4]);
        assert_eq!(engine.transport().sent, vec![ACK, ACK]);
        assert_eq!(engine.data_count(), 4);
        assert_eq!(engine.bytes_transferred(), 5);
        assert_eq!(engine.next_timeout(), None);
    }

    #[test]
    fn test_error_is_sticky() {
        let mut engine = SessionEngine::new_read(registry(), SessionConfig::default(), Wire::default());
        engine.start().unwrap();
        let err = engine.on_timeout().unwrap_err();
        assert!(matches!(err, CloneError::Timeout(_)));
        assert!(engine.is_done());
        assert!(!engine.transport().read_interest);
        assert_eq!(engine.on_data(&[0x41]), Err(err.clone()));
        assert_eq!(engine.error(), Some(&err));
        assert_eq!(engine.read_state(), Some(ReadState::WaitFirstBlock));
    }

    #[test]
    fn test_send_echo_echoes_input() {
        let config = SessionConfig {
            send_echo: Some(true),
            ..Default::default()
        };
        let mut engine = SessionEngine::new_read(registry(), config, Wire::default());
        engine.start().unwrap();
        engine.on_data(&[0x41]).unwrap();
        assert_eq!(engine.transport().sent, vec![0x41, ACK]);
    }

    #[test]
    fn test_not_done_until_flushed() {
        let mut engine = SessionEngine::new_read(registry(), SessionConfig::default(), Wire::default());
        engine.start().unwrap();
        engine.on_data(&[0x41]).unwrap();
        engine.transport_mut().limit = Some(0);
        engine.on_data(&[1, 2, 3, 4]).unwrap();
        assert_eq!(engine.read_state(), Some(ReadState::Done));
        assert!(!engine.is_done());
        assert!(engine.transport().write_interest);

        engine.transport_mut().limit = None;
        engine.on_write_ready().unwrap();
        assert!(engine.is_done());
    }

    #[test]
    fn test_write_session_from_image() {
        let mut engine = SessionEngine::for_image(
            &registry(),
            SessionConfig::default(),
            &[0x41, 9, 8, 7, 6],
            Wire::default(),
        )
        .unwrap();
        assert_eq!(engine.direction(), Direction::Write);
        engine.start().unwrap();
        assert_eq!(engine.transport().sent, vec![0x41]);
        assert_eq!(engine.blocks_transferred(), 0);
        engine.on_data(&[ACK]).unwrap();
        assert_eq!(engine.blocks_transferred(), 1);
        engine.on_data(&[ACK]).unwrap();
        assert!(engine.is_done());
        assert_eq!(engine.blocks_transferred(), 2);
        assert_eq!(engine.transport().sent, vec![0x41, 9, 8, 7, 6]);
    }

    #[test]
    fn test_chunked_timeouts_route_to_flow() {
        let config = SessionConfig {
            chunk_size: Some(2),
            ..Default::default()
        };
        let mut engine = SessionEngine::for_image(&registry(), config, &[0x41, 9, 8, 7, 6], Wire::default())
            .unwrap();
        engine.start().unwrap();
        engine.on_data(&[ACK]).unwrap();
        assert!(engine.flow().is_throttled());
        assert_eq!(engine.next_timeout(), Some(Duration::from_millis(5)));

        engine.on_timeout().unwrap();
        engine.on_timeout().unwrap();
        assert!(!engine.flow().is_throttled());
        assert!(engine.transport().write_interest);
        engine.on_write_ready().unwrap();
        assert_eq!(engine.transport().sent, vec![0x41, 9, 8, 7, 6]);
    }
}
