//! Error types for clone-mode transfers and profile loading

use std::io;

use thiserror::Error;

/// Errors raised while running a clone session
///
/// Every variant is fatal to the session that produced it. The engine keeps
/// the first one it sees and reports it again on every later event.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CloneError {
    /// The peer sent bytes that do not fit the expected framing
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// A block or whole-transfer checksum did not match
    #[error("checksum mismatch: expected 0x{expected:02X}, got 0x{actual:02X}")]
    ChecksumMismatch { expected: u8, actual: u8 },

    /// A block grew beyond the largest size the protocol allows
    #[error("buffer overflow: {0}")]
    BufferOverflow(String),

    /// A timer fired in a state that has no timeout transition
    #[error("timed out {0}")]
    Timeout(String),

    /// The underlying transport reported an I/O failure
    #[error("transport error ({kind:?}): {message}")]
    Transport { kind: io::ErrorKind, message: String },

    /// No usable profile or settings
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// A memory image could not be split into blocks
    #[error("invalid image: {0}")]
    InvalidImage(String),
}

impl From<io::Error> for CloneError {
    fn from(err: io::Error) -> Self {
        CloneError::Transport {
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

/// Errors raised while loading the radio profile registry
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// A line of the registry file could not be understood
    #[error("line {line}: {message}")]
    Syntax { line: usize, message: String },

    /// The registry file ended inside a `radio` block
    #[error("end of file in radio '{0}'")]
    UnterminatedRadio(String),

    /// The registry file could not be read
    #[error("unable to read {path}: {message}")]
    Io { path: String, message: String },

    /// The image header did not match any known radio
    #[error("unable to find radio type")]
    UnknownRadio,
}

impl ConfigError {
    pub(crate) fn syntax(line: usize, message: impl Into<String>) -> Self {
        ConfigError::Syntax {
            line,
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checksum_display() {
        let err = CloneError::ChecksumMismatch {
            expected: 0x66,
            actual: 0x0F,
        };
        assert_eq!(
            err.to_string(),
            "checksum mismatch: expected 0x66, got 0x0F"
        );
    }

    #[test]
    fn test_io_error_conversion() {
        let err: CloneError = io::Error::new(io::ErrorKind::BrokenPipe, "gone").into();
        assert!(matches!(
            err,
            CloneError::Transport {
                kind: io::ErrorKind::BrokenPipe,
                ..
            }
        ));
    }

    #[test]
    fn test_config_error_line() {
        let err = ConfigError::syntax(12, "duplicate filesize");
        assert_eq!(err.to_string(), "line 12: duplicate filesize");
    }
}
