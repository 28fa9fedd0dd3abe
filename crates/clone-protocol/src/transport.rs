//! The I/O surface a clone session drives
//!
//! The engine never owns a file descriptor or an event loop. It asks a
//! [`Transport`] to write bytes without blocking and to switch read and
//! write readiness notifications on or off; the caller's event loop turns
//! those notifications back into `on_data`, `on_write_ready` and
//! `on_timeout` calls.

use std::io;
use std::time::Duration;

/// Non-blocking byte link to the radio
pub trait Transport {
    /// Write as many bytes as the link accepts right now
    ///
    /// Returns the number accepted, which may be less than `bytes.len()`
    /// (including zero).
    fn write(&mut self, bytes: &[u8]) -> io::Result<usize>;

    /// Ask for (or stop asking for) write-ready notifications
    fn set_write_interest(&mut self, enabled: bool);

    /// Ask for (or stop asking for) incoming-data notifications
    fn set_read_interest(&mut self, enabled: bool);

    /// Bytes written but not yet sent on the wire by the driver
    fn output_queue_len(&mut self) -> io::Result<usize>;

    /// Block for a short, configured pause before a physical write
    fn pause(&mut self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

impl<T: Transport + ?Sized> Transport for &mut T {
    fn write(&mut self, bytes: &[u8]) -> io::Result<usize> {
        (**self).write(bytes)
    }

    fn set_write_interest(&mut self, enabled: bool) {
        (**self).set_write_interest(enabled)
    }

    fn set_read_interest(&mut self, enabled: bool) {
        (**self).set_read_interest(enabled)
    }

    fn output_queue_len(&mut self) -> io::Result<usize> {
        (**self).output_queue_len()
    }

    fn pause(&mut self, duration: Duration) {
        (**self).pause(duration)
    }
}
