//! Session configuration and settings resolution
//!
//! Settings for a session come from three places, highest priority first:
//!
//! 1. [`SessionConfig`] overrides (command line flags)
//! 2. the matched [`RadioProfile`]
//! 3. values detected at runtime (receive echo only) or built-in defaults
//!
//! [`EffectiveSettings::resolve`] flattens them into plain values that the
//! state machines read.

use std::time::Duration;

use crate::flow::FlowConfig;
use crate::profile::RadioProfile;

/// Timer lengths used by the clone state machines
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct TimeoutConfig {
    /// Wait for the radio to begin sending a read
    pub start: Duration,
    /// Wait between characters or for a response
    pub character: Duration,
    /// Inter-character gap that ends a block in timing mode
    pub timing: Duration,
    /// Poll interval while draining output, also the delayed-ack pause
    pub write_poll: Duration,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            start: Duration::from_secs(10),
            character: Duration::from_secs(5),
            timing: Duration::from_millis(200),
            write_poll: Duration::from_millis(5),
        }
    }
}

/// Per-session overrides; `None` defers to the radio profile
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SessionConfig {
    pub recv_echo: Option<bool>,
    pub send_echo: Option<bool>,
    pub no_end_echo: Option<bool>,
    pub has_checksum: Option<bool>,
    pub wait_for_ack_before_checksum: Option<bool>,
    pub checksum_delay: Option<Duration>,
    pub has_checkblock: Option<bool>,
    pub chunk_size: Option<usize>,
    pub inter_chunk_wait: Option<Duration>,
    pub pre_write_delay: Option<Duration>,
    pub delay_final_ack: Option<bool>,
    /// Receive echo found by probing the link, used when neither the
    /// overrides nor the profile say
    pub detected_echo: Option<bool>,
    pub timeouts: TimeoutConfig,
}

/// Fully resolved settings for one session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct EffectiveSettings {
    pub recv_echo: bool,
    pub send_echo: bool,
    pub no_end_echo: bool,
    pub has_checksum: bool,
    pub wait_for_ack_before_checksum: bool,
    pub checksum_delay: Duration,
    pub has_checkblock: bool,
    pub chunk_size: usize,
    pub inter_chunk_wait: Duration,
    pub pre_write_delay: Duration,
    pub delay_final_ack: bool,
}

impl EffectiveSettings {
    /// Merge overrides over a profile
    pub fn resolve(profile: &RadioProfile, config: &SessionConfig) -> Self {
        Self {
            recv_echo: config
                .recv_echo
                .or(profile.recv_echo)
                .or(config.detected_echo)
                .unwrap_or(false),
            send_echo: config.send_echo.unwrap_or(profile.send_echo),
            no_end_echo: config.no_end_echo.unwrap_or(profile.no_end_echo),
            has_checksum: config.has_checksum.unwrap_or(profile.has_checksum),
            wait_for_ack_before_checksum: config
                .wait_for_ack_before_checksum
                .unwrap_or(profile.wait_for_ack_before_checksum),
            checksum_delay: config.checksum_delay.unwrap_or(profile.checksum_delay),
            has_checkblock: config.has_checkblock.unwrap_or(profile.has_checkblock),
            chunk_size: config.chunk_size.unwrap_or(profile.chunk_size),
            inter_chunk_wait: config.inter_chunk_wait.unwrap_or(profile.inter_chunk_wait),
            pre_write_delay: config.pre_write_delay.unwrap_or(profile.pre_write_delay),
            delay_final_ack: config.delay_final_ack.unwrap_or(profile.delay_final_ack),
        }
    }

    /// Settings in force before a header has identified the radio
    pub fn unmatched(config: &SessionConfig) -> Self {
        Self::resolve(&RadioProfile::fallback(), config)
    }

    /// Output pacing derived from these settings
    pub fn flow_config(&self, timeouts: &TimeoutConfig) -> FlowConfig {
        FlowConfig {
            chunk_size: self.chunk_size,
            inter_chunk_wait: self.inter_chunk_wait,
            pre_write_delay: self.pre_write_delay,
            poll_interval: timeouts.write_poll,
        }
    }
}
