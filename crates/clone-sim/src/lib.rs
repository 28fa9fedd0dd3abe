//! Clone-mode simulation library
//!
//! This crate provides a simulation layer for exercising clone transfers
//! without a radio or a serial port. It includes:
//!
//! - **MockTransport**: records everything a session writes
//! - **VirtualCloneRadio**: plays the radio's side, sending or receiving
//! - **run_loopback**: drives a session against a virtual radio
//!
//! # Example
//!
//! ```rust
//! use clone_protocol::{ProfileRegistry, SessionConfig, SessionEngine};
//! use clone_sim::{run_loopback, MockTransport, VirtualCloneRadio, VirtualCloneRadioConfig};
//!
//! let config = VirtualCloneRadioConfig::default();
//! let registry = ProfileRegistry::from_profiles(vec![config.profile.clone()]);
//!
//! let mut image = b"SIM1".to_vec();
//! image.extend(0..64u8);
//! let mut radio = VirtualCloneRadio::sender(config, &image).unwrap();
//!
//! let mut engine = SessionEngine::new_read(registry, SessionConfig::default(), MockTransport::new());
//! let outcome = run_loopback(&mut engine, &mut radio, 1000);
//! assert!(outcome.is_ok());
//! assert_eq!(engine.image(), image);
//! ```

pub mod harness;
pub mod mock;
pub mod radio;

pub use harness::{run_loopback, LoopbackOutcome};
pub use mock::MockTransport;
pub use radio::{RadioRole, SimError, VirtualCloneRadio, VirtualCloneRadioConfig};
