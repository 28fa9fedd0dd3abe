//! Converting between saved images and block lists
//!
//! A saved image is the concatenation of every block payload, header first,
//! with checkblock framing removed. Writing it back to a radio means finding
//! the header, then cutting the rest into blocks along the profile's block
//! schedule and re-adding checkblock framing where the radio wants it.

use tracing::debug;

use crate::block::BlockList;
use crate::checksum::frame_checkblock;
use crate::config::{EffectiveSettings, SessionConfig};
use crate::error::{CloneError, ConfigError};
use crate::profile::RadioProfile;
use crate::registry::ProfileRegistry;

/// A saved image split into wire blocks, ready to write
#[derive(Debug, Clone)]
pub struct WriteImage {
    pub profile: RadioProfile,
    pub blocks: BlockList,
}

/// Identify the radio an image belongs to and split it into blocks
pub fn split_image(
    registry: &ProfileRegistry,
    config: &SessionConfig,
    image: &[u8],
) -> Result<WriteImage, CloneError> {
    if image.is_empty() {
        return Err(CloneError::InvalidImage("image is empty".into()));
    }
    let (profile, header_len) = registry
        .detect_header(image)
        .ok_or(CloneError::Config(ConfigError::UnknownRadio))?;
    let settings = EffectiveSettings::resolve(profile, config);

    let (header, data) = image.split_at(header_len);
    if data.len() < profile.data_len {
        return Err(CloneError::InvalidImage(format!(
            "not enough data in image: {} bytes after the header, expected {}",
            data.len(),
            profile.data_len
        )));
    }
    if data.len() > profile.data_len {
        return Err(CloneError::InvalidImage(format!(
            "extra data at the end of the image ({} bytes), probably not a valid image",
            data.len() - profile.data_len
        )));
    }

    let mut blocks = BlockList::new();
    blocks.new_block();
    blocks.append_to_last(header)?;
    blocks.set_schedule(&profile.block_sizes);

    let mut rest = data;
    while !rest.is_empty() {
        blocks.new_block();
        let wire_len = blocks.current_block_len();
        let room = if settings.has_checkblock {
            wire_len.saturating_sub(2)
        } else {
            wire_len
        };
        if room == 0 {
            return Err(CloneError::InvalidImage(format!(
                "block size {} leaves no room for data",
                wire_len
            )));
        }

        let (chunk, tail) = rest.split_at(room.min(rest.len()));
        if settings.has_checkblock {
            let sequence = (blocks.len() - 1) as u8;
            blocks.append_to_last(&frame_checkblock(sequence, chunk))?;
        } else {
            blocks.append_to_last(chunk)?;
        }
        rest = tail;
    }

    debug!(
        "Split {} byte image for {} into {} blocks",
        image.len(),
        profile.name,
        blocks.len()
    );
    Ok(WriteImage {
        profile: profile.clone(),
        blocks,
    })
}
