//! # Metadata Field Encoding
//!
//! This module provides the little-endian, length-prefixed field codec for
//! zonefs metadata records. File snapshots and deltas are sequences of
//! fixed-width integers and length-prefixed byte strings; nothing here is
//! self-describing beyond the record version tag that leads every record.
//!
//! ## Wire Format
//!
//! | Field kind      | Encoding                                  |
//! |-----------------|-------------------------------------------|
//! | `u8`            | 1 byte                                    |
//! | `u32` / `i32`   | 4 bytes, little-endian                    |
//! | `u64`           | 8 bytes, little-endian                    |
//! | `bytes`/`string`| `u32` length (LE) followed by raw payload |
//!
//! Strings are UTF-8; decoding a string validates it. A truncated or
//! malformed input surfaces as [`ZoneFsError::Corruption`] so callers can
//! distinguish decode failures from device I/O errors.
//!
//! ## Zero-Copy Design
//!
//! Encoding appends to a caller-owned `Vec<u8>`. Decoding reads through a
//! [`Reader`] that advances a cursor over a borrowed slice and never
//! allocates except to materialise byte-string payloads.
//!
//! ## Thread Safety
//!
//! All functions are pure and stateless.

use eyre::Result;

use crate::error::ZoneFsError;

pub fn put_u8(out: &mut Vec<u8>, v: u8) {
    out.push(v);
}

pub fn put_u32(out: &mut Vec<u8>, v: u32) {
    out.extend_from_slice(&v.to_le_bytes());
}

pub fn put_i32(out: &mut Vec<u8>, v: i32) {
    out.extend_from_slice(&v.to_le_bytes());
}

pub fn put_u64(out: &mut Vec<u8>, v: u64) {
    out.extend_from_slice(&v.to_le_bytes());
}

/// Appends a `u32` length prefix followed by the payload bytes.
pub fn put_bytes(out: &mut Vec<u8>, v: &[u8]) {
    put_u32(out, v.len() as u32);
    out.extend_from_slice(v);
}

pub fn put_string(out: &mut Vec<u8>, v: &str) {
    put_bytes(out, v.as_bytes());
}

/// Cursor over an encoded record.
pub struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.remaining() < n {
            return Err(ZoneFsError::Corruption(format!(
                "record truncated: need {} bytes at offset {}, have {}",
                n,
                self.pos,
                self.remaining()
            ))
            .into());
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    pub fn get_u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn get_u32(&mut self) -> Result<u32> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes(b.try_into().unwrap()))
    }

    pub fn get_i32(&mut self) -> Result<i32> {
        let b = self.take(4)?;
        Ok(i32::from_le_bytes(b.try_into().unwrap()))
    }

    pub fn get_u64(&mut self) -> Result<u64> {
        let b = self.take(8)?;
        Ok(u64::from_le_bytes(b.try_into().unwrap()))
    }

    pub fn get_bytes(&mut self) -> Result<Vec<u8>> {
        let len = self.get_u32()? as usize;
        Ok(self.take(len)?.to_vec())
    }

    pub fn get_string(&mut self) -> Result<String> {
        let bytes = self.get_bytes()?;
        String::from_utf8(bytes)
            .map_err(|e| ZoneFsError::Corruption(format!("invalid UTF-8 in string field: {e}")).into())
    }
}
