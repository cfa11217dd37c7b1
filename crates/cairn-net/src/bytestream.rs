//! `ByteStream`: the growable binary buffer every engine message is built
//! in and parsed out of.
//!
//! Independent read and write cursors: writes append at the end, reads
//! advance from the front. A stream is always single-owner — it moves
//! across queue and connection boundaries, never aliases. Reading past the
//! written length is [`CairnError::Underflow`]; in contexts where a peer
//! may send truncated or corrupt payloads, callers wrap every extraction.
//!
//! Fixed-width accessors follow the engine-wide little-endian convention
//! from `cairn_types::encoding`.

use cairn_error::{CairnError, Result};
use cairn_types::encoding::{read_u16_le, read_u32_le, read_u64_le};

/// Growable owned byte buffer with independent read/write cursors.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ByteStream {
    buf: Vec<u8>,
    read_pos: usize,
}

impl ByteStream {
    /// An empty stream.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// An empty stream with reserved capacity.
    #[must_use]
    pub fn with_capacity(cap: usize) -> Self {
        Self {
            buf: Vec::with_capacity(cap),
            read_pos: 0,
        }
    }

    /// Wrap an already-filled buffer; the read cursor starts at the front.
    #[must_use]
    pub fn from_vec(buf: Vec<u8>) -> Self {
        Self { buf, read_pos: 0 }
    }

    /// Unread bytes remaining.
    #[must_use]
    pub fn len(&self) -> usize {
        self.buf.len() - self.read_pos
    }

    /// Whether no unread bytes remain.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Allocated capacity (pooling decisions key off this).
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.buf.capacity()
    }

    /// Reset both cursors, keeping capacity.
    pub fn restart(&mut self) {
        self.buf.clear();
        self.read_pos = 0;
    }

    /// Ensure at least `n` more bytes can be written without reallocation.
    pub fn reserve(&mut self, n: usize) {
        self.buf.reserve(n);
    }

    /// The unread bytes as a slice (bulk I/O output path).
    #[must_use]
    pub fn unread(&self) -> &[u8] {
        &self.buf[self.read_pos..]
    }

    /// Append raw bytes (bulk I/O input path).
    pub fn put_raw(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    // -- fixed-width writes -------------------------------------------------

    pub fn put_u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    pub fn put_u16(&mut self, v: u16) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn put_u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn put_u64(&mut self, v: u64) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    /// Length-prefixed byte string: `len:u32_le` + raw bytes. Embedded NULs
    /// are preserved; the empty string is four zero bytes.
    ///
    /// # Panics
    /// Panics if `bytes.len()` exceeds `u32::MAX`.
    pub fn put_bytes(&mut self, bytes: &[u8]) {
        let len = u32::try_from(bytes.len()).expect("byte string length fits u32");
        self.put_u32(len);
        self.buf.extend_from_slice(bytes);
    }

    // -- fixed-width reads --------------------------------------------------

    /// # Errors
    /// `Underflow` if no unread byte remains.
    pub fn get_u8(&mut self) -> Result<u8> {
        let v = *self
            .unread()
            .first()
            .ok_or_else(|| self.underflow(1))?;
        self.read_pos += 1;
        Ok(v)
    }

    /// # Errors
    /// `Underflow` on short input.
    pub fn get_u16(&mut self) -> Result<u16> {
        let v = read_u16_le(self.unread()).ok_or_else(|| self.underflow(2))?;
        self.read_pos += 2;
        Ok(v)
    }

    /// # Errors
    /// `Underflow` on short input.
    pub fn get_u32(&mut self) -> Result<u32> {
        let v = read_u32_le(self.unread()).ok_or_else(|| self.underflow(4))?;
        self.read_pos += 4;
        Ok(v)
    }

    /// # Errors
    /// `Underflow` on short input.
    pub fn get_u64(&mut self) -> Result<u64> {
        let v = read_u64_le(self.unread()).ok_or_else(|| self.underflow(8))?;
        self.read_pos += 8;
        Ok(v)
    }

    /// Read a length-prefixed byte string written by [`ByteStream::put_bytes`].
    ///
    /// # Errors
    /// `Underflow` if the prefix or payload is truncated. The read cursor
    /// does not advance on failure, so the caller can inspect the remains.
    pub fn get_bytes(&mut self) -> Result<Vec<u8>> {
        let len = read_u32_le(self.unread()).ok_or_else(|| self.underflow(4))? as usize;
        let total = 4 + len;
        let unread = self.unread();
        if unread.len() < total {
            return Err(self.underflow(total));
        }
        let out = unread[4..total].to_vec();
        self.read_pos += total;
        Ok(out)
    }

    /// Consume the stream into its remaining unread bytes.
    #[must_use]
    pub fn into_vec(mut self) -> Vec<u8> {
        if self.read_pos > 0 {
            self.buf.drain(..self.read_pos);
        }
        self.buf
    }

    fn underflow(&self, needed: usize) -> CairnError {
        CairnError::Underflow {
            needed,
            available: self.len(),
        }
    }
}
