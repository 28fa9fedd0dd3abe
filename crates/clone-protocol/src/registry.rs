//! Radio profile registry and its text format
//!
//! Profiles are loaded from a `radios` file made of `radio` / `endradio`
//! blocks:
//!
//! ```text
//! # Yaesu FT-60
//! radio FT-60
//!   headercmp 41 48 30 31 37
//!   headerlen 8
//!   filesize 28617
//!   blocksize 64
//!   checksum
//! endradio
//! ```
//!
//! `filesize` is the number of bytes the radio sends, header included. For
//! `checkblock` radios that count includes the sequence and checksum byte of
//! every block, so the profile's data length is what is left after walking
//! the block schedule and dropping that framing; otherwise it is simply
//! `filesize - headerlen`. Numbers are decimal
//! (leading zeros do not mean octal) unless prefixed with `0x`. Time values
//! (`waitchunk`, `csumdelay`, `prewritedelay`) are in microseconds. A line
//! ending in `\` continues on the next line and lines starting with `#`
//! are comments.
//!
//! # Example
//!
//! ```rust
//! use clone_protocol::ProfileRegistry;
//!
//! let registry = ProfileRegistry::parse(
//!     "radio VX-3\n headercmp 41 48 30 32 38\n filesize 32595\n blocksize 64\nendradio\n",
//! ).unwrap();
//! assert_eq!(registry.len(), 1);
//! assert!(registry.match_header(b"AH028").is_some());
//! ```

use std::fs;
use std::path::Path;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::block::{BlockRun, BlockSizes};
use crate::error::ConfigError;
use crate::profile::RadioProfile;

/// Name of the registry file inside the configuration directory
pub const REGISTRY_FILE: &str = "radios";

/// Result of selecting a profile for a received header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProfileMatch {
    pub profile: RadioProfile,
    /// No profile matched; blocks must be delimited by inter-byte gaps
    pub timing_mode: bool,
}

/// Ordered collection of known radio profiles
#[derive(Debug, Clone, Default)]
pub struct ProfileRegistry {
    profiles: Vec<RadioProfile>,
}

impl ProfileRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a registry from already-built profiles
    pub fn from_profiles(profiles: Vec<RadioProfile>) -> Self {
        Self { profiles }
    }

    /// Add a profile after the existing ones
    pub fn add(&mut self, profile: RadioProfile) {
        self.profiles.push(profile);
    }

    pub fn profiles(&self) -> &[RadioProfile] {
        &self.profiles
    }

    pub fn len(&self) -> usize {
        self.profiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.profiles.is_empty()
    }

    /// First profile whose header matches `candidate` exactly
    pub fn match_header(&self, candidate: &[u8]) -> Option<&RadioProfile> {
        self.profiles.iter().find(|p| p.matches(candidate))
    }

    /// Pick the profile for a header, optionally falling back to the
    /// best-effort default
    pub fn select(&self, candidate: &[u8], allow_fallback: bool) -> Option<ProfileMatch> {
        if let Some(profile) = self.match_header(candidate) {
            info!("Found a {}", profile.name);
            return Some(ProfileMatch {
                profile: profile.clone(),
                timing_mode: false,
            });
        }

        if !allow_fallback {
            return None;
        }

        warn!("Unable to find the device, going ahead, but it probably won't work");
        Some(ProfileMatch {
            profile: RadioProfile::fallback(),
            timing_mode: true,
        })
    }

    /// Longest header any profile declares
    pub fn max_header_len(&self) -> usize {
        self.profiles.iter().map(|p| p.header_len).max().unwrap_or(0)
    }

    /// Find the header at the start of a saved image
    ///
    /// Every prefix length from 1 up to [`max_header_len`] is tried in turn;
    /// the first that matches wins.
    ///
    /// [`max_header_len`]: ProfileRegistry::max_header_len
    pub fn detect_header(&self, image: &[u8]) -> Option<(&RadioProfile, usize)> {
        let limit = self.max_header_len().min(image.len());
        (1..=limit).find_map(|len| self.match_header(&image[..len]).map(|p| (p, len)))
    }

    /// Load `<dir>/radios`
    pub fn from_config_dir(dir: impl AsRef<Path>) -> Result<Self, ConfigError> {
        Self::from_file(dir.as_ref().join(REGISTRY_FILE))
    }

    /// Load a registry file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
        let registry = Self::parse(&text)?;
        debug!(
            "Loaded {} radio profiles from {}",
            registry.len(),
            path.display()
        );
        Ok(registry)
    }

    /// Parse registry text
    ///
    /// Profiles come back last definition first, so a radio defined later
    /// in the file takes precedence over an earlier one with the same
    /// header.
    pub fn parse(text: &str) -> Result<Self, ConfigError> {
        let mut registry = Self::new();
        let mut current: Option<ProfileBuilder> = None;

        for (line, content) in logical_lines(text) {
            let mut tokens = content.split_whitespace();
            let Some(keyword) = tokens.next() else {
                continue;
            };
            if keyword.starts_with('#') {
                continue;
            }

            let Some(builder) = current.as_mut() else {
                if keyword != "radio" {
                    return Err(ConfigError::syntax(
                        line,
                        "expected 'radio' to start defining a radio's config",
                    ));
                }
                let name = tokens
                    .next()
                    .ok_or_else(|| ConfigError::syntax(line, "expected name"))?;
                current = Some(ProfileBuilder::new(name));
                continue;
            };

            if keyword == "endradio" {
                if let Some(builder) = current.take() {
                    registry.add(builder.finish(line)?);
                }
                continue;
            }

            builder.directive(line, keyword, &content, tokens)?;
        }

        if let Some(builder) = current {
            return Err(ConfigError::UnterminatedRadio(builder.name));
        }
        // later definitions override earlier ones with the same header
        registry.profiles.reverse();
        Ok(registry)
    }
}

/// Join continuation lines and drop blank ones, keeping the line number of
/// the last physical line of each logical line
fn logical_lines(text: &str) -> Vec<(usize, String)> {
    let mut out = Vec::new();
    let mut pending = String::new();

    for (index, raw) in text.lines().enumerate() {
        let line_no = index + 1;
        if let Some(head) = raw.strip_suffix('\\') {
            pending.push_str(head);
            continue;
        }
        pending.push_str(raw);
        let joined = std::mem::take(&mut pending);
        let trimmed = joined.trim_end();
        if !trimmed.is_empty() {
            out.push((line_no, trimmed.to_string()));
        }
    }

    let trimmed = pending.trim_end();
    if !trimmed.is_empty() {
        out.push((text.lines().count(), trimmed.to_string()));
    }
    out
}

/// Parse a number; `0x` means hex, otherwise leading zeros are ignored
fn parse_number(token: &str) -> Option<usize> {
    if let Some(hex) = token
        .strip_prefix("0x")
        .or_else(|| token.strip_prefix("0X"))
    {
        return usize::from_str_radix(hex, 16).ok();
    }
    let digits = token.trim_start_matches('0');
    if digits.is_empty() {
        return (!token.is_empty()).then_some(0);
    }
    digits.parse().ok()
}

fn parse_hex_byte(token: &str) -> Option<u8> {
    let digits = token
        .strip_prefix("0x")
        .or_else(|| token.strip_prefix("0X"))
        .unwrap_or(token);
    u8::from_str_radix(digits, 16).ok()
}

/// Profile fields collected between `radio` and `endradio`
#[derive(Debug, Default)]
struct ProfileBuilder {
    name: String,
    header: Option<Vec<u8>>,
    header_len: Option<usize>,
    file_size: Option<usize>,
    block_sizes: Option<BlockSizes>,
    recv_echo: Option<bool>,
    send_echo: Option<bool>,
    no_end_echo: bool,
    has_checksum: Option<bool>,
    wait_for_ack_before_checksum: Option<bool>,
    has_checkblock: Option<bool>,
    chunk_size: Option<usize>,
    inter_chunk_wait: Option<Duration>,
    checksum_delay: Option<Duration>,
    pre_write_delay: Option<Duration>,
    delay_final_ack: Option<bool>,
}

fn set_once<T>(slot: &mut Option<T>, value: T, line: usize, what: &str) -> Result<(), ConfigError> {
    if slot.is_some() {
        return Err(ConfigError::syntax(line, format!("{} already specified", what)));
    }
    *slot = Some(value);
    Ok(())
}

fn number_arg<'a>(
    mut tokens: impl Iterator<Item = &'a str>,
    line: usize,
    what: &str,
) -> Result<usize, ConfigError> {
    let token = tokens
        .next()
        .ok_or_else(|| ConfigError::syntax(line, "expected number"))?;
    parse_number(token).ok_or_else(|| ConfigError::syntax(line, format!("invalid {}", what)))
}

impl ProfileBuilder {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Default::default()
        }
    }

    fn directive<'a>(
        &mut self,
        line: usize,
        keyword: &str,
        content: &str,
        tokens: impl Iterator<Item = &'a str>,
    ) -> Result<(), ConfigError> {
        match keyword {
            "headercmp" => {
                let bytes = tokens
                    .map(|t| {
                        parse_hex_byte(t)
                            .ok_or_else(|| ConfigError::syntax(line, "invalid hex char"))
                    })
                    .collect::<Result<Vec<u8>, _>>()?;
                if bytes.is_empty() {
                    return Err(ConfigError::syntax(line, "header compare cannot be empty"));
                }
                if self.header_len.is_some_and(|len| len < bytes.len()) {
                    return Err(ConfigError::syntax(
                        line,
                        "header length cannot be less than header compare",
                    ));
                }
                set_once(&mut self.header, bytes, line, "header")
            }
            "headerlen" => {
                let len = number_arg(tokens, line, "header length")?;
                if len == 0 {
                    return Err(ConfigError::syntax(line, "header length cannot be zero"));
                }
                if self.header.as_ref().is_some_and(|h| len < h.len()) {
                    return Err(ConfigError::syntax(
                        line,
                        "header length cannot be less than header compare",
                    ));
                }
                set_once(&mut self.header_len, len, line, "header length")
            }
            "filesize" => {
                let size = number_arg(tokens, line, "file size")?;
                if size == 0 {
                    return Err(ConfigError::syntax(line, "file size cannot be zero"));
                }
                set_once(&mut self.file_size, size, line, "file size")
            }
            "blocksize" => {
                let size = number_arg(tokens, line, "block size")?;
                if size == 0 {
                    return Err(ConfigError::syntax(line, "block size cannot be zero"));
                }
                set_once(&mut self.block_sizes, BlockSizes::Fixed(size), line, "block size")
            }
            "blocksizelist" => {
                let rest = content
                    .trim_start()
                    .strip_prefix("blocksizelist")
                    .unwrap_or_default();
                let runs = parse_block_list(rest, line)?;
                set_once(&mut self.block_sizes, BlockSizes::Runs(runs), line, "block size")
            }
            "chunksize" => {
                let size = number_arg(tokens, line, "chunk size")?;
                set_once(&mut self.chunk_size, size, line, "chunk size")
            }
            "waitchunk" => {
                let us = number_arg(tokens, line, "chunk wait")?;
                set_once(
                    &mut self.inter_chunk_wait,
                    Duration::from_micros(us as u64),
                    line,
                    "chunk wait",
                )
            }
            "csumdelay" => {
                let us = number_arg(tokens, line, "checksum delay")?;
                set_once(
                    &mut self.checksum_delay,
                    Duration::from_micros(us as u64),
                    line,
                    "checksum delay",
                )
            }
            "prewritedelay" => {
                let us = number_arg(tokens, line, "prewritedelay")?;
                set_once(
                    &mut self.pre_write_delay,
                    Duration::from_micros(us as u64),
                    line,
                    "prewritedelay",
                )
            }
            "recv_echo" | "norecv_echo" => {
                set_once(&mut self.recv_echo, keyword == "recv_echo", line, "recv_echo")
            }
            "send_echo" | "nosend_echo" => {
                set_once(&mut self.send_echo, keyword == "send_echo", line, "send_echo")
            }
            "checksum" | "nochecksum" => {
                set_once(&mut self.has_checksum, keyword == "checksum", line, "checksum")
            }
            "waitchecksum" | "nowaitchecksum" => set_once(
                &mut self.wait_for_ack_before_checksum,
                keyword == "waitchecksum",
                line,
                "waitchecksum",
            ),
            "checkblock" | "nocheckblock" => {
                set_once(&mut self.has_checkblock, keyword == "checkblock", line, "checkblock")
            }
            "delayack" | "nodelayack" => {
                set_once(&mut self.delay_final_ack, keyword == "delayack", line, "delayack")
            }
            "noendecho" => {
                self.no_end_echo = true;
                Ok(())
            }
            other => Err(ConfigError::syntax(
                line,
                format!("unknown directive '{}'", other),
            )),
        }
    }

    fn finish(self, line: usize) -> Result<RadioProfile, ConfigError> {
        let header = self
            .header
            .ok_or_else(|| ConfigError::syntax(line, "radio has no header"))?;
        let file_size = self
            .file_size
            .ok_or_else(|| ConfigError::syntax(line, "radio has no file length"))?;
        let block_sizes = self
            .block_sizes
            .ok_or_else(|| ConfigError::syntax(line, "radio has no block size"))?;
        let header_len = self.header_len.unwrap_or(header.len());
        if file_size <= header_len {
            return Err(ConfigError::syntax(
                line,
                "file size must be larger than the header",
            ));
        }

        let wire_len = file_size - header_len;
        let data_len = if self.has_checkblock == Some(true) {
            block_sizes.payload_len(wire_len, 2).ok_or_else(|| {
                ConfigError::syntax(line, "file size leaves a checkblock block with no data")
            })?
        } else {
            wire_len
        };

        let mut profile = RadioProfile::new(self.name, header, data_len, block_sizes);
        profile.header_len = header_len;
        profile.recv_echo = self.recv_echo;
        profile.no_end_echo = self.no_end_echo;
        if let Some(v) = self.send_echo {
            profile.send_echo = v;
        }
        if let Some(v) = self.has_checksum {
            profile.has_checksum = v;
        }
        if let Some(v) = self.wait_for_ack_before_checksum {
            profile.wait_for_ack_before_checksum = v;
        }
        if let Some(v) = self.has_checkblock {
            profile.has_checkblock = v;
        }
        if let Some(v) = self.chunk_size {
            profile.chunk_size = v;
        }
        if let Some(v) = self.inter_chunk_wait {
            profile.inter_chunk_wait = v;
        }
        if let Some(v) = self.checksum_delay {
            profile.checksum_delay = v;
        }
        if let Some(v) = self.pre_write_delay {
            profile.pre_write_delay = v;
        }
        if let Some(v) = self.delay_final_ack {
            profile.delay_final_ack = v;
        }
        Ok(profile)
    }
}

/// Parse `(count,size)(count,size)...`
fn parse_block_list(spec: &str, line: usize) -> Result<Vec<BlockRun>, ConfigError> {
    let mut chars = spec.chars().peekable();
    let mut runs = Vec::new();

    loop {
        while chars.next_if(|c| c.is_whitespace()).is_some() {}
        match chars.next() {
            None => break,
            Some('(') => {}
            Some(_) => return Err(ConfigError::syntax(line, "expected '('")),
        }
        let count = list_number(&mut chars, line)?;
        list_punct(&mut chars, ',', line)?;
        let size = list_number(&mut chars, line)?;
        list_punct(&mut chars, ')', line)?;
        runs.push(BlockRun { count, size });
    }

    let Some((last, rest)) = runs.split_last_mut() else {
        return Err(ConfigError::syntax(line, "must specify some block lengths"));
    };
    if rest.iter().any(|r| r.count == 0) {
        return Err(ConfigError::syntax(
            line,
            "all but the last block count must be non-zero",
        ));
    }
    if last.size == 0 || rest.iter().any(|r| r.size == 0) {
        return Err(ConfigError::syntax(line, "block sizes must be non-zero"));
    }
    last.count = 0;
    Ok(runs)
}

fn list_number(
    chars: &mut std::iter::Peekable<std::str::Chars<'_>>,
    line: usize,
) -> Result<usize, ConfigError> {
    while chars.next_if(|c| c.is_whitespace()).is_some() {}
    let mut token = String::new();
    while let Some(c) = chars.next_if(|c| c.is_ascii_alphanumeric()) {
        token.push(c);
    }
    if token.is_empty() {
        return Err(match chars.peek() {
            None => ConfigError::syntax(line, "end of line in a block spec"),
            Some(c) => ConfigError::syntax(line, format!("invalid number at '{}'", c)),
        });
    }
    parse_number(&token)
        .ok_or_else(|| ConfigError::syntax(line, format!("invalid number: {}", token)))
}

fn list_punct(
    chars: &mut std::iter::Peekable<std::str::Chars<'_>>,
    expected: char,
    line: usize,
) -> Result<(), ConfigError> {
    while chars.next_if(|c| c.is_whitespace()).is_some() {}
    match chars.next() {
        Some(c) if c == expected => Ok(()),
        Some(_) => Err(ConfigError::syntax(line, format!("expected '{}'", expected))),
        None => Err(ConfigError::syntax(line, "end of line in a block spec")),
    }
}
