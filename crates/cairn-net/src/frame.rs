//! Frame encoding: magic, length, optional compression.
//!
//! On-wire layout (all fields little-endian):
//!
//! ```text
//! plain:      [magic:u32 = 0x14fbc137][payload_len:u32][payload...]
//! compressed: [magic:u32 = 0x14fbc138][payload_len:u32][original_len:u32][payload...]
//! ```
//!
//! For compressed frames `payload_len` counts the compressed bytes on the
//! wire and `original_len` the decompressed size, so the receiver can
//! allocate exactly once and verify the inflate. Compression is lz4 block
//! format and is applied only when it is enabled, the payload exceeds
//! [`COMPRESSION_THRESHOLD`], and the compressed form is actually smaller —
//! otherwise the frame goes out plain under the plain magic, so the peer
//! never has to guess.

use cairn_error::{CairnError, Result};

/// Magic marking an uncompressed frame.
pub const PLAIN_MAGIC: u32 = 0x14fb_c137;

/// Magic marking an lz4-compressed frame.
pub const COMPRESSED_MAGIC: u32 = 0x14fb_c138;

/// Payloads at or below this size are never compressed.
pub const COMPRESSION_THRESHOLD: usize = 512;

/// Hard cap on a single frame's payload; anything larger is a protocol
/// violation, not a message.
pub const MAX_PAYLOAD_BYTES: usize = 256 * 1024 * 1024;

/// Header of a decoded frame, before the payload is read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Bytes of payload on the wire.
    pub wire_len: u32,
    /// Decompressed size, present only under [`COMPRESSED_MAGIC`].
    pub original_len: Option<u32>,
}

impl FrameHeader {
    #[must_use]
    pub const fn is_compressed(&self) -> bool {
        self.original_len.is_some()
    }
}

/// Encode `payload` into a complete wire frame.
///
/// `allow_compress` is the caller's policy bit (configuration AND not
/// loopback); the threshold and did-it-shrink rules are applied here.
///
/// # Errors
/// `PayloadTooLarge` if the payload exceeds [`MAX_PAYLOAD_BYTES`].
pub fn encode(payload: &[u8], allow_compress: bool) -> Result<Vec<u8>> {
    if payload.len() > MAX_PAYLOAD_BYTES {
        return Err(CairnError::PayloadTooLarge {
            len: payload.len(),
            max: MAX_PAYLOAD_BYTES,
        });
    }
    if allow_compress && payload.len() > COMPRESSION_THRESHOLD {
        let compressed = lz4_flex::block::compress(payload);
        if compressed.len() < payload.len() {
            let mut frame = Vec::with_capacity(12 + compressed.len());
            frame.extend_from_slice(&COMPRESSED_MAGIC.to_le_bytes());
            frame.extend_from_slice(&(compressed.len() as u32).to_le_bytes());
            frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
            frame.extend_from_slice(&compressed);
            return Ok(frame);
        }
        // Compression did not shrink the payload; fall through to plain.
    }
    let mut frame = Vec::with_capacity(8 + payload.len());
    frame.extend_from_slice(&PLAIN_MAGIC.to_le_bytes());
    frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    frame.extend_from_slice(payload);
    Ok(frame)
}

/// Inflate a compressed payload, verifying the declared original length.
///
/// # Errors
/// `CompressionFailure` if lz4 rejects the input or the inflated size does
/// not match `original_len` — the message is corrupt and the caller must
/// discard the connection.
pub fn decompress(payload: &[u8], original_len: u32) -> Result<Vec<u8>> {
    let out = lz4_flex::block::decompress(payload, original_len as usize)
        .map_err(|e| CairnError::compression(e.to_string()))?;
    if out.len() != original_len as usize {
        return Err(CairnError::compression(format!(
            "inflated to {} bytes, header declared {original_len}",
            out.len()
        )));
    }
    Ok(out)
}

/// Whether `magic` is one of the two frame magics.
#[must_use]
pub const fn is_magic(magic: u32) -> bool {
    magic == PLAIN_MAGIC || magic == COMPRESSED_MAGIC
}
