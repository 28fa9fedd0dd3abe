//! Command line options

use std::path::PathBuf;
use std::time::Duration;

use clap::{ArgGroup, Parser};
use clone_protocol::SessionConfig;

/// Read and write radio memory images using clone mode.
///
/// Flags that come in on/off pairs override the radio definition; leave
/// both off to use what the definition says.
#[derive(Parser, Debug)]
#[command(name = "radioclone", version, about)]
#[command(group(ArgGroup::new("direction").required(true).args(["read", "write"])))]
pub struct Cli {
    /// Serial device the radio is connected to (e.g. /dev/ttyUSB0)
    pub port: String,

    /// Read data from the radio
    #[arg(short, long)]
    pub read: bool,

    /// Write data to the radio
    #[arg(short, long)]
    pub write: bool,

    /// The file to read into or write from
    #[arg(short, long, default_value = "yaesu.rfile")]
    pub file: PathBuf,

    /// If an error occurs on read, still save as much data as possible
    #[arg(short = 'I', long)]
    pub ignerr: bool,

    /// Expect transmitted data to be echoed back
    #[arg(short = 'e', long = "rcv-echo", overrides_with = "norcv_echo")]
    pub rcv_echo: bool,

    /// Do not expect transmitted data to be echoed back
    #[arg(short = 'm', long = "norcv-echo", overrides_with = "rcv_echo")]
    pub norcv_echo: bool,

    /// No echo for the final ack
    #[arg(short = 'u', long)]
    pub noendecho: bool,

    /// Echo every received character
    #[arg(short = 'y', long = "send-echo")]
    pub send_echo: bool,

    /// Send or expect a checksum at the end
    #[arg(short = 'c', long, overrides_with = "nochecksum")]
    pub checksum: bool,

    /// Do not send or expect a checksum at the end
    #[arg(short = 'g', long, overrides_with = "checksum")]
    pub nochecksum: bool,

    /// Wait for the last ack before sending the checksum
    #[arg(short = 'j', long, overrides_with = "nowaitchecksum")]
    pub waitchecksum: bool,

    /// Send the checksum without waiting for the last ack
    #[arg(short = 'k', long, overrides_with = "waitchecksum")]
    pub nowaitchecksum: bool,

    /// Send or expect per-block checksums
    #[arg(short = 'p', long, overrides_with = "nocheckblock")]
    pub checkblock: bool,

    /// Do not send or expect per-block checksums
    #[arg(short = 'q', long, overrides_with = "checkblock")]
    pub nocheckblock: bool,

    /// Send data in bursts of this many bytes
    #[arg(short = 'a', long)]
    pub chunksize: Option<usize>,

    /// Microseconds to wait between bursts
    #[arg(short = 'b', long, value_name = "USEC")]
    pub waitchunk: Option<u64>,

    /// Microseconds to wait before writing an unacknowledged checksum
    #[arg(short = 'x', long, value_name = "USEC")]
    pub csumdelay: Option<u64>,

    /// Delay before sending the last ack
    #[arg(short = 'l', long, overrides_with = "nodelayack")]
    pub delayack: bool,

    /// Send the last ack immediately
    #[arg(short = 'n', long, overrides_with = "delayack")]
    pub nodelayack: bool,

    /// Microseconds to pause before every write
    #[arg(short = 't', long, value_name = "USEC")]
    pub prewritedelay: Option<u64>,

    /// Directory holding the `radios` definition file
    #[arg(short = 'F', long, default_value = "/etc/radioconf")]
    pub configdir: PathBuf,

    /// Serial line speed
    #[arg(long, default_value_t = 9600)]
    pub baud: u32,

    /// Print a mark for every block transferred
    #[arg(long)]
    pub hash: bool,

    /// More logging; repeat for wire traces
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Write a JSON summary of the transfer to this file
    #[arg(long, value_name = "PATH")]
    pub report: Option<PathBuf>,
}

/// Collapse an on/off flag pair into an override
fn pair(on: bool, off: bool) -> Option<bool> {
    match (on, off) {
        (true, _) => Some(true),
        (_, true) => Some(false),
        _ => None,
    }
}

impl Cli {
    /// Session overrides from the flags given
    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            recv_echo: pair(self.rcv_echo, self.norcv_echo),
            send_echo: self.send_echo.then_some(true),
            no_end_echo: self.noendecho.then_some(true),
            has_checksum: pair(self.checksum, self.nochecksum),
            wait_for_ack_before_checksum: pair(self.waitchecksum, self.nowaitchecksum),
            checksum_delay: self.csumdelay.map(Duration::from_micros),
            has_checkblock: pair(self.checkblock, self.nocheckblock),
            chunk_size: self.chunksize,
            inter_chunk_wait: self.waitchunk.map(Duration::from_micros),
            pre_write_delay: self.prewritedelay.map(Duration::from_micros),
            delay_final_ack: pair(self.delayack, self.nodelayack),
            ..Default::default()
        }
    }

    /// Log filter for the requested verbosity
    pub fn log_filter(&self) -> &'static str {
        match self.verbose {
            0 => "radioclone=info,clone_protocol=info",
            1 => "radioclone=debug,clone_protocol=debug",
            _ => "radioclone=trace,clone_protocol=trace",
        }
    }
}
