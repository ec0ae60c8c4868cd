//! gzip + base64 encoding for cloud-init `encoding: gz+b64` blocks.

use std::io::{Read, Write};

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;

/// Compresses `data` with gzip and encodes the result as standard base64.
///
/// The gzip header carries no timestamp, so equal input gives equal output.
pub fn gzip_base64(data: &[u8]) -> std::io::Result<String> {
    let mut encoder = GzEncoder::new(Vec::with_capacity(data.len() / 2), Compression::best());
    encoder.write_all(data)?;
    let compressed = encoder.finish()?;
    Ok(STANDARD.encode(compressed))
}

/// Reverses [`gzip_base64`].
pub fn gunzip_base64(encoded: &str) -> std::io::Result<Vec<u8>> {
    let compressed = STANDARD
        .decode(encoded.trim())
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    let mut out = Vec::new();
    GzDecoder::new(compressed.as_slice()).read_to_end(&mut out)?;
    Ok(out)
}
