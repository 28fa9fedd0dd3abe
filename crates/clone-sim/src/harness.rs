//! Lock-step loopback between a session engine and a virtual radio
//!
//! Stands in for the serial event loop. Each step delivers one thing,
//! in priority order: host output to the radio, one radio transmission to
//! the host, a write-ready event, or an expired timer.

use clone_protocol::{CloneError, SessionEngine};
use tracing::debug;

use crate::mock::MockTransport;
use crate::radio::VirtualCloneRadio;

/// What happened during a loopback run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopbackOutcome {
    pub steps: usize,
    /// Timers that fired; each one stands for a quiet line
    pub timeouts: usize,
    /// Engine finished within the step limit
    pub finished: bool,
    /// The engine's error, if it failed
    pub error: Option<CloneError>,
}

impl LoopbackOutcome {
    /// Engine finished without an error
    pub fn is_ok(&self) -> bool {
        self.finished && self.error.is_none()
    }
}

/// Run `engine` against `radio` until the engine is done, nothing is left
/// to do, or `max_steps` events have been delivered
///
/// The engine is started first; a sending radio is started right after so
/// the engine is listening when the header arrives.
pub fn run_loopback(
    engine: &mut SessionEngine<MockTransport>,
    radio: &mut VirtualCloneRadio,
    max_steps: usize,
) -> LoopbackOutcome {
    let mut outcome = LoopbackOutcome {
        steps: 0,
        timeouts: 0,
        finished: false,
        error: None,
    };
    if let Err(err) = engine.start() {
        outcome.error = Some(err);
        outcome.finished = true;
        return outcome;
    }
    radio.start();

    while outcome.steps < max_steps && !engine.is_done() {
        outcome.steps += 1;

        let written = engine.transport_mut().take_written();
        if !written.is_empty() {
            radio.on_host_bytes(&written);
            continue;
        }

        let result = if let Some(bytes) = radio.take_output() {
            engine.on_data(&bytes)
        } else if engine.transport().write_interest() {
            engine.on_write_ready()
        } else if engine.next_timeout().is_some() {
            outcome.timeouts += 1;
            engine.on_timeout()
        } else {
            debug!("Loopback stalled after {} steps", outcome.steps);
            break;
        };
        if let Err(err) = result {
            outcome.error = Some(err);
        }
    }

    // hand the radio whatever the engine wrote on its way out
    let written = engine.transport_mut().take_written();
    if !written.is_empty() {
        radio.on_host_bytes(&written);
    }

    outcome.finished = engine.is_done();
    outcome
}
