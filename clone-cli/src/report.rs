//! JSON summary of a finished transfer

use std::fs::File;
use std::io::BufWriter;
use std::path::Path;

use anyhow::{Context, Result};
use clone_protocol::{Direction, SessionEngine, Transport};
use serde::{Deserialize, Serialize};

/// What a transfer did, for `--report`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TransferReport {
    /// Matched radio, `unknown` in timing mode
    pub radio: Option<String>,
    pub direction: Direction,
    pub timing_mode: bool,
    /// Stripped size of every block, header first
    pub block_sizes: Vec<usize>,
    /// Raw bytes on the wire, framing included
    pub bytes_transferred: usize,
    /// Payload bytes after the header
    pub data_bytes: usize,
    /// Image was written to the output file
    pub saved: bool,
    #[serde(default)]
    pub error: Option<String>,
}

impl TransferReport {
    pub fn from_engine<T: Transport>(engine: &SessionEngine<T>, saved: bool) -> Self {
        Self {
            radio: engine.profile().map(|p| p.name.clone()),
            direction: engine.direction(),
            timing_mode: engine.timing_mode(),
            block_sizes: engine.blocks().block_sizes(),
            bytes_transferred: engine.bytes_transferred(),
            data_bytes: engine.data_count(),
            saved,
            error: engine.error().map(|e| e.to_string()),
        }
    }

    pub fn write_to(&self, path: &Path) -> Result<()> {
        let file = File::create(path)
            .with_context(|| format!("failed to create report {}", path.display()))?;
        serde_json::to_writer_pretty(BufWriter::new(file), self)
            .with_context(|| format!("failed to write report {}", path.display()))?;
        Ok(())
    }
}
