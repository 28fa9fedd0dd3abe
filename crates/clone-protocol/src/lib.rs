//! Clone-mode protocol engine
//!
//! This crate reads and writes the memory image of amateur radio
//! transceivers that use Yaesu-style *clone mode*: the radio streams its
//! whole memory as a header followed by data blocks, and the receiving side
//! acknowledges each block with a single `0x06` byte.
//!
//! Radios differ in the details, described per model by a [`RadioProfile`]:
//!
//! - **Block schedule**: one fixed block size, or runs of sizes
//! - **Checkblock**: each block framed as `[sequence][payload][sum]`
//! - **Whole-transfer checksum**: one trailing byte, the sum of all data
//! - **Echo**: single-wire cables that echo every byte back to the sender
//! - **Pacing**: chunked output with pauses for radios that drop bytes
//!
//! # Architecture
//!
//! - [`block`]: blocks, block lists and size schedules
//! - [`checksum`]: checkblock framing and the running transfer checksum
//! - [`profile`] / [`registry`]: radio profiles and the `radios` file format
//! - [`config`]: per-session overrides and settings resolution
//! - [`flow`]: paced output staging
//! - [`read`] / [`write`]: the two protocol state machines
//! - [`image`]: splitting saved images into blocks for writing
//! - [`session`]: the [`SessionEngine`] façade driven by an event loop
//!
//! The engine performs no I/O of its own. It writes through a
//! [`Transport`] and is driven by `on_data`, `on_write_ready` and
//! `on_timeout` calls from the caller's event loop.
//!
//! # Example
//!
//! ```rust
//! use clone_protocol::{ProfileRegistry, SessionConfig, SessionEngine, Transport};
//! use std::io;
//!
//! #[derive(Default)]
//! struct Wire(Vec<u8>);
//!
//! impl Transport for Wire {
//!     fn write(&mut self, bytes: &[u8]) -> io::Result<usize> {
//!         self.0.extend_from_slice(bytes);
//!         Ok(bytes.len())
//!     }
//!     fn set_write_interest(&mut self, _: bool) {}
//!     fn set_read_interest(&mut self, _: bool) {}
//!     fn output_queue_len(&mut self) -> io::Result<usize> { Ok(0) }
//! }
//!
//! let registry = ProfileRegistry::parse(
//!     "radio DEMO\n headercmp 41\n filesize 5\n blocksize 4\n nodelayack\nendradio\n",
//! ).unwrap();
//! let mut engine = SessionEngine::new_read(registry, SessionConfig::default(), Wire::default());
//! engine.start().unwrap();
//! engine.on_data(b"A").unwrap();
//! engine.on_data(&[1, 2, 3, 4]).unwrap();
//! assert!(engine.is_done());
//! assert_eq!(engine.image(), vec![0x41, 1, 2, 3, 4]);
//! ```

pub mod block;
pub mod checksum;
pub mod config;
pub mod error;
pub mod flow;
pub mod image;
pub mod profile;
pub mod read;
pub mod registry;
pub mod session;
pub mod transport;
pub mod write;

pub use block::{Block, BlockList, BlockRun, BlockSizes, MAX_BLOCK_SIZE};
pub use config::{EffectiveSettings, SessionConfig, TimeoutConfig};
pub use error::{CloneError, ConfigError};
pub use flow::{FlowConfig, FlowState, WriteFlowController};
pub use image::{split_image, WriteImage};
pub use profile::RadioProfile;
pub use read::ReadState;
pub use registry::{ProfileMatch, ProfileRegistry};
pub use session::{Direction, SessionEngine};
pub use transport::Transport;
pub use write::WriteState;

/// Acknowledgement byte sent after every block
pub const ACK: u8 = 0x06;
