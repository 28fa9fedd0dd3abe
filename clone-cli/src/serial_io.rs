//! Serial port plumbing for clone sessions
//!
//! The session engine writes into a [`PortBuffer`], which owns the open
//! port; [`drive`] moves staged bytes to the wire, feeds received bytes
//! back in, and fires the engine's timers.

use std::fmt;
use std::io::{self, Write as _};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clone_protocol::{SessionEngine, Transport};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_serial::{ClearBuffer, SerialPort, SerialPortBuilderExt, SerialStream};
use tracing::{debug, info, trace};

/// Most bytes the engine may stage between two flushes
pub const STAGE_CAPACITY: usize = 4096;

/// How long the echo probe waits for its byte to come back
const ECHO_PROBE_WAIT: Duration = Duration::from_millis(200);

/// Longest wait for the port to drain after the session
const DRAIN_LIMIT: Duration = Duration::from_secs(2);
const DRAIN_POLL: Duration = Duration::from_millis(5);

/// An open serial port to the radio, before a session takes it over
pub struct SerialLink {
    name: String,
    stream: SerialStream,
}

impl SerialLink {
    /// Open `port` at `baud`, 8N1
    pub fn open(port: &str, baud: u32) -> Result<Self> {
        let stream = tokio_serial::new(port, baud)
            .timeout(Duration::from_millis(100))
            .open_native_async()
            .with_context(|| format!("failed to open serial port {port}"))?;
        info!("Opened {} @ {}", port, baud);
        Ok(Self {
            name: port.to_string(),
            stream,
        })
    }

    /// Find out whether the cable echoes what we send
    ///
    /// Writes a single `A` and waits briefly: silence means no echo, the
    /// same byte back means echo.
    pub async fn probe_echo(&mut self) -> Result<bool> {
        self.stream
            .clear(ClearBuffer::Input)
            .context("flushing serial input")?;
        AsyncWriteExt::write_all(&mut self.stream, b"A").await?;
        AsyncWriteExt::flush(&mut self.stream).await?;

        let mut byte = [0u8; 1];
        let echo = match tokio::time::timeout(ECHO_PROBE_WAIT, self.stream.read(&mut byte)).await {
            Err(_) => false,
            Ok(Ok(0)) => bail!("serial port {} closed during echo probe", self.name),
            Ok(Ok(_)) if byte[0] == b'A' => true,
            Ok(Ok(_)) => bail!("unexpected 0x{:02X} while probing for echo", byte[0]),
            Ok(Err(e)) => return Err(anyhow::Error::new(e).context("reading echo probe")),
        };
        debug!("Echo probe: {}", if echo { "echo on" } else { "echo off" });
        Ok(echo)
    }

    /// Hand the port to a session
    pub fn into_port(self) -> PortBuffer {
        PortBuffer {
            name: self.name,
            port: Some(self.stream),
            ..Default::default()
        }
    }
}

/// Engine-facing side of the serial link
///
/// Writes are staged until the driver loop flushes them. Without a port
/// nothing is queued beyond the stage.
#[derive(Default)]
pub struct PortBuffer {
    name: String,
    port: Option<SerialStream>,
    staged: Vec<u8>,
    pause: Duration,
    read_interest: bool,
    write_interest: bool,
}

impl fmt::Debug for PortBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PortBuffer")
            .field("name", &self.name)
            .field("attached", &self.port.is_some())
            .field("staged", &self.staged.len())
            .field("pause", &self.pause)
            .finish()
    }
}

impl PortBuffer {
    pub fn wants_read(&self) -> bool {
        self.read_interest
    }

    pub fn wants_write(&self) -> bool {
        self.write_interest
    }

    /// Wait for bytes from the radio
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let Some(port) = self.port.as_mut() else {
            return std::future::pending().await;
        };
        let n = port.read(buf).await.context("reading from the radio")?;
        if n == 0 {
            bail!("serial port {} closed", self.name);
        }
        Ok(n)
    }

    /// Move staged bytes to the port
    async fn flush(&mut self) -> Result<()> {
        if self.staged.is_empty() {
            return Ok(());
        }
        let pause = std::mem::take(&mut self.pause);
        if !pause.is_zero() {
            tokio::time::sleep(pause).await;
        }
        let Some(port) = self.port.as_mut() else {
            bail!("no serial port to write {} bytes to", self.staged.len());
        };
        trace!("Write: {:02X?}", self.staged);
        AsyncWriteExt::write_all(port, &self.staged)
            .await
            .context("writing to the radio")?;
        AsyncWriteExt::flush(port).await?;
        self.staged.clear();
        Ok(())
    }

    async fn wait_drained(&mut self) -> Result<()> {
        let mut waited = Duration::ZERO;
        while self.output_queue_len()? > 0 && waited < DRAIN_LIMIT {
            tokio::time::sleep(DRAIN_POLL).await;
            waited += DRAIN_POLL;
        }
        Ok(())
    }
}

impl Transport for PortBuffer {
    fn write(&mut self, bytes: &[u8]) -> io::Result<usize> {
        let room = STAGE_CAPACITY - self.staged.len();
        let n = bytes.len().min(room);
        self.staged.extend_from_slice(&bytes[..n]);
        Ok(n)
    }

    fn set_write_interest(&mut self, enabled: bool) {
        self.write_interest = enabled;
    }

    fn set_read_interest(&mut self, enabled: bool) {
        self.read_interest = enabled;
    }

    fn output_queue_len(&mut self) -> io::Result<usize> {
        let queued = match &self.port {
            Some(port) => port.bytes_to_write().map_err(io::Error::from)? as usize,
            None => 0,
        };
        Ok(self.staged.len() + queued)
    }

    fn pause(&mut self, duration: Duration) {
        self.pause += duration;
    }
}

/// Run `engine` until it is done
///
/// Session failures stay in the engine; only link failures are returned.
pub async fn drive(engine: &mut SessionEngine<PortBuffer>, hash: bool) -> Result<()> {
    let mut progress = Progress::new(hash);
    let mut buf = [0u8; 256];

    if let Err(e) = engine.start() {
        debug!("Session stopped at start: {}", e);
    }
    loop {
        engine.transport_mut().flush().await?;
        progress.update(engine.blocks_transferred());
        if engine.is_done() {
            break;
        }

        let readable = engine.transport().wants_read();
        let writable = engine.transport().wants_write();
        let timer = engine.next_timeout();

        let event = tokio::select! {
            biased;
            read = engine.transport_mut().read(&mut buf), if readable => {
                let n = read?;
                engine.on_data(&buf[..n])
            }
            _ = std::future::ready(()), if writable => engine.on_write_ready(),
            _ = tokio::time::sleep(timer.unwrap_or_default()), if timer.is_some() => {
                engine.on_timeout()
            }
            else => bail!("clone session has nothing left to wait for"),
        };
        if let Err(e) = event {
            debug!("Session stopped: {}", e);
        }
    }
    progress.finish();
    engine.transport_mut().wait_drained().await
}

/// `--hash` progress marks
struct Progress {
    enabled: bool,
    shown: usize,
}

impl Progress {
    fn new(enabled: bool) -> Self {
        Self { enabled, shown: 0 }
    }

    fn update(&mut self, blocks: usize) {
        if !self.enabled || blocks <= self.shown {
            return;
        }
        let mut stdout = io::stdout().lock();
        for _ in self.shown..blocks {
            let _ = write!(stdout, ".");
        }
        let _ = stdout.flush();
        self.shown = blocks;
    }

    fn finish(&self) {
        if self.enabled && self.shown > 0 {
            println!();
        }
    }
}
