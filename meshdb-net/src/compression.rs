//! Payload compression for sync batches: gzip or zlib, as flagged in the
//! envelope.

use flate2::read::{GzDecoder, ZlibDecoder};
use flate2::write::{GzEncoder, ZlibEncoder};
use flate2::Compression;
use meshdb_core::{Error, Result};
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressionKind {
    None,
    #[default]
    Gzip,
    Zlib,
}

pub fn compress(data: &[u8], kind: CompressionKind, level: u32) -> Result<Vec<u8>> {
    let level = Compression::new(level.min(9));
    match kind {
        CompressionKind::None => Ok(data.to_vec()),
        CompressionKind::Gzip => {
            let mut encoder = GzEncoder::new(Vec::new(), level);
            encoder
                .write_all(data)
                .and_then(|_| encoder.finish())
                .map_err(|e| Error::internal(format!("gzip: {e}")))
        }
        CompressionKind::Zlib => {
            let mut encoder = ZlibEncoder::new(Vec::new(), level);
            encoder
                .write_all(data)
                .and_then(|_| encoder.finish())
                .map_err(|e| Error::internal(format!("zlib: {e}")))
        }
    }
}

pub fn decompress(data: &[u8], kind: CompressionKind) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    match kind {
        CompressionKind::None => out.extend_from_slice(data),
        CompressionKind::Gzip => {
            GzDecoder::new(data)
                .read_to_end(&mut out)
                .map_err(|e| Error::malformed("compressed payload", e.to_string()))?;
        }
        CompressionKind::Zlib => {
            ZlibDecoder::new(data)
                .read_to_end(&mut out)
                .map_err(|e| Error::malformed("compressed payload", e.to_string()))?;
        }
    }
    Ok(out)
}
