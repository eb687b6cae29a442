//! Binaries travel and rest gzip-compressed. Workers inflate them before
//! handing them to the device tool.

use std::io::{Read, Write};

use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;

use super::Binaries;

const MAGIC: [u8; 2] = [0x1f, 0x8b];

pub fn compress(bytes: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(bytes)?;
    encoder.finish()
}

pub fn is_compressed(bytes: &[u8]) -> bool {
    bytes.starts_with(&MAGIC)
}

/// Inflates gzip payloads. Anything without the gzip header is returned as is.
pub fn decompress(bytes: Vec<u8>) -> std::io::Result<Vec<u8>> {
    if !is_compressed(&bytes) {
        return Ok(bytes);
    }
    let mut inflated = Vec::new();
    GzDecoder::new(bytes.as_slice()).read_to_end(&mut inflated)?;
    Ok(inflated)
}

pub fn decompress_all(binaries: Binaries) -> std::io::Result<Binaries> {
    binaries
        .into_iter()
        .map(|(name, bytes)| Ok((name, decompress(bytes)?)))
        .collect()
}
