//! Compressed option payload transport.
//!
//! Large serialized sub-documents are shipped through the option map as a
//! length-prefixed raw byte payload, gzip-compressed, then base64-encoded
//! for safe transport as a string option value:
//!
//! ```text
//! base64( gzip( [u32 big-endian length][payload bytes] ) )
//! ```
//!
//! Decoding is strict: malformed base64, a truncated gzip stream, or a
//! length prefix that disagrees with the payload all fail with a decode
//! error rather than silently returning garbage.

use std::io::{Read, Write};

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;

use crate::error::{QuarryError, Result};

/// Compress an option value for transport.
pub fn compress_option(data: &str) -> Result<String> {
    let bytes = data.as_bytes();

    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_u32::<BigEndian>(bytes.len() as u32)?;
    encoder.write_all(bytes)?;
    let compressed = encoder.finish()?;

    Ok(STANDARD.encode(compressed))
}

/// Decompress an option value produced by [`compress_option`].
pub fn decompress_option(encoded: &str) -> Result<String> {
    let compressed = STANDARD
        .decode(encoded)
        .map_err(|e| QuarryError::decode(format!("malformed base64 option value: {e}")))?;

    let mut decoder = GzDecoder::new(compressed.as_slice());

    let length = decoder
        .read_u32::<BigEndian>()
        .map_err(|e| QuarryError::decode(format!("unreadable option length prefix: {e}")))?
        as usize;

    let mut payload = vec![0u8; length];
    decoder
        .read_exact(&mut payload)
        .map_err(|e| QuarryError::decode(format!("truncated option payload: {e}")))?;

    // A trailing surplus means the length prefix lied about the payload.
    let mut surplus = [0u8; 1];
    match decoder.read(&mut surplus) {
        Ok(0) => {}
        Ok(_) => {
            return Err(QuarryError::decode(
                "option payload longer than its length prefix",
            ));
        }
        Err(e) => return Err(QuarryError::decode(format!("corrupt gzip stream: {e}"))),
    }

    String::from_utf8(payload)
        .map_err(|e| QuarryError::decode(format!("option payload is not valid UTF-8: {e}")))
}
