//! Byte-level wire encoding helpers.
//!
//! All fixed-width wire primitives in CairnStore are **little-endian**. This
//! module is the single place that fact is encoded; every codec in the engine
//! goes through these helpers so the byte order can never vary by platform
//! or by call site.
//!
//! Writers append to a `Vec<u8>`; readers take a slice and return `None` on
//! short input so codecs can propagate truncation with `?` instead of
//! panicking on malformed peers.

/// Append a single byte.
#[inline]
pub fn append_u8(buf: &mut Vec<u8>, v: u8) {
    buf.push(v);
}

/// Append a `u16` little-endian.
#[inline]
pub fn append_u16_le(buf: &mut Vec<u8>, v: u16) {
    buf.extend_from_slice(&v.to_le_bytes());
}

/// Append a `u32` little-endian.
#[inline]
pub fn append_u32_le(buf: &mut Vec<u8>, v: u32) {
    buf.extend_from_slice(&v.to_le_bytes());
}

/// Append a `u64` little-endian.
#[inline]
pub fn append_u64_le(buf: &mut Vec<u8>, v: u64) {
    buf.extend_from_slice(&v.to_le_bytes());
}

/// Append a length-prefixed byte string: `len:u32_le` then the raw bytes.
///
/// Embedded NUL bytes are preserved; the empty string encodes as four zero
/// bytes.
///
/// # Panics
/// Panics if `bytes.len()` does not fit in a `u32`.
#[inline]
pub fn append_bytes(buf: &mut Vec<u8>, bytes: &[u8]) {
    let len = u32::try_from(bytes.len()).expect("byte string length fits u32");
    append_u32_le(buf, len);
    buf.extend_from_slice(bytes);
}

/// Read a single byte; `None` on empty input.
#[inline]
#[must_use]
pub fn read_u8(src: &[u8]) -> Option<u8> {
    src.first().copied()
}

/// Read a `u16` little-endian; `None` on short input.
#[inline]
#[must_use]
pub fn read_u16_le(src: &[u8]) -> Option<u16> {
    Some(u16::from_le_bytes(src.get(..2)?.try_into().ok()?))
}

/// Read a `u32` little-endian; `None` on short input.
#[inline]
#[must_use]
pub fn read_u32_le(src: &[u8]) -> Option<u32> {
    Some(u32::from_le_bytes(src.get(..4)?.try_into().ok()?))
}

/// Read a `u64` little-endian; `None` on short input.
#[inline]
#[must_use]
pub fn read_u64_le(src: &[u8]) -> Option<u64> {
    Some(u64::from_le_bytes(src.get(..8)?.try_into().ok()?))
}

/// Read a length-prefixed byte string written by [`append_bytes`].
///
/// Returns the bytes and the total number of wire bytes consumed
/// (4 + payload length); `None` on short input.
#[must_use]
pub fn read_bytes(src: &[u8]) -> Option<(&[u8], usize)> {
    let len = read_u32_le(src)? as usize;
    let payload = src.get(4..4 + len)?;
    Some((payload, 4 + len))
}
