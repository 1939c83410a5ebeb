#![forbid(unsafe_code)]
//! Fixed-width value page payloads.
//!
//! A [`PageBuffer`] holds the in-memory image of one page: a sequence of
//! `(time, value)` rows where every value is exactly `value_size` bytes.
//! The wire image is self-delimiting so that a decoder can ignore the
//! trailing slack of an over-sized disk extent.

use std::convert::TryInto;

use crate::error::{BrasaError, Result};

/// Row timestamp width plus the fixed value width gives the row stride.
const TIME_LEN: usize = 8;

const HDR_COUNT: std::ops::Range<usize> = 0..4;
const HDR_CRC32: std::ops::Range<usize> = 4..8;
const HDR_LEN: usize = 8;

/// In-memory contents of a single page.
///
/// Rows are kept in two parallel flat buffers (timestamps and raw value
/// bytes). The buffer is copied by value when a reader asks for a page
/// snapshot, so it carries no locks or shared state of its own.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PageBuffer {
    value_size: usize,
    times: Vec<u64>,
    values: Vec<u8>,
}

impl PageBuffer {
    /// Creates an empty buffer whose rows carry `value_size`-byte values.
    pub fn new(value_size: usize) -> Self {
        Self {
            value_size,
            times: Vec::new(),
            values: Vec::new(),
        }
    }

    pub fn value_size(&self) -> usize {
        self.value_size
    }

    pub fn len(&self) -> usize {
        self.times.len()
    }

    pub fn is_empty(&self) -> bool {
        self.times.is_empty()
    }

    /// Appends a row. The value slice must be exactly `value_size` bytes.
    pub fn append(&mut self, time: u64, value: &[u8]) {
        assert_eq!(value.len(), self.value_size, "value width mismatch");
        self.times.push(time);
        self.values.extend_from_slice(value);
    }

    /// Overwrites the value of an existing row in place.
    pub fn update(&mut self, pos: usize, value: &[u8]) {
        assert_eq!(value.len(), self.value_size, "value width mismatch");
        let start = pos * self.value_size;
        self.values[start..start + self.value_size].copy_from_slice(value);
    }

    pub fn time_at(&self, pos: usize) -> u64 {
        self.times[pos]
    }

    pub fn value_at(&self, pos: usize) -> &[u8] {
        let start = pos * self.value_size;
        &self.values[start..start + self.value_size]
    }

    fn row_crc32(&self) -> u32 {
        let mut hasher = crc32fast::Hasher::new();
        for (pos, time) in self.times.iter().enumerate() {
            hasher.update(&time.to_be_bytes());
            hasher.update(self.value_at(pos));
        }
        hasher.finalize()
    }

    /// Appends the full wire image to `dst`.
    pub fn encode(&self, dst: &mut Vec<u8>) {
        dst.reserve(HDR_LEN + self.times.len() * (TIME_LEN + self.value_size));
        dst.extend_from_slice(&(self.times.len() as u32).to_be_bytes());
        dst.extend_from_slice(&self.row_crc32().to_be_bytes());
        for (pos, time) in self.times.iter().enumerate() {
            dst.extend_from_slice(&time.to_be_bytes());
            dst.extend_from_slice(self.value_at(pos));
        }
    }

    /// Number of bytes [`encode`](Self::encode) will produce.
    pub fn encoded_len(&self) -> usize {
        HDR_LEN + self.times.len() * (TIME_LEN + self.value_size)
    }

    /// Replaces the contents with the rows decoded from `src`.
    ///
    /// `src` may be longer than the encoded payload; bytes past the row
    /// region are ignored. The row width is taken from this buffer's
    /// `value_size`, so the buffer must have been constructed with the
    /// width the image was encoded with.
    pub fn decode(&mut self, src: &[u8]) -> Result<()> {
        if src.len() < HDR_LEN {
            return Err(BrasaError::Corruption("page image shorter than header"));
        }
        let count = u32::from_be_bytes(src[HDR_COUNT].try_into().unwrap()) as usize;
        let crc = u32::from_be_bytes(src[HDR_CRC32].try_into().unwrap());
        let stride = TIME_LEN + self.value_size;
        let end = count
            .checked_mul(stride)
            .and_then(|row_bytes| row_bytes.checked_add(HDR_LEN))
            .ok_or(BrasaError::Corruption("page row count overflows"))?;
        let body = src
            .get(HDR_LEN..end)
            .ok_or(BrasaError::Corruption("page image truncated"))?;
        if crc32fast::hash(body) != crc {
            return Err(BrasaError::Corruption("page image crc mismatch"));
        }

        self.times.clear();
        self.values.clear();
        self.times.reserve(count);
        self.values.reserve(count * self.value_size);
        for row in body.chunks_exact(stride) {
            let time = u64::from_be_bytes(row[..TIME_LEN].try_into().unwrap());
            self.times.push(time);
            self.values.extend_from_slice(&row[TIME_LEN..]);
        }
        Ok(())
    }
}
