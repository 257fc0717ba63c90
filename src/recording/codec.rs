// src/recording/codec.rs
//! Compact integer and string primitives
//!
//! Every binary format in this crate (trace files, socket messages, counter
//! snapshots) is built from two primitives:
//!
//! - **compact int**: values below 192 take one byte. Larger values start with
//!   `192 + (v & 0x3F)` and continue with the remaining bits 7 at a time, the
//!   high bit flagging that another byte follows.
//! - **string**: compact byte length followed by the UTF-8 bytes.

use crate::utils::errors::{DiscoveryError, Result};

const SINGLE_BYTE_LIMIT: u32 = 192;

/// Append a compact-encoded integer
#[inline]
pub fn write_compact(out: &mut Vec<u8>, value: u32) {
    if value < SINGLE_BYTE_LIMIT {
        out.push(value as u8);
        return;
    }

    out.push((SINGLE_BYTE_LIMIT + (value & 0x3F)) as u8);
    let mut rest = value >> 6;
    while rest >= 0x80 {
        out.push(((rest & 0x7F) | 0x80) as u8);
        rest >>= 7;
    }
    out.push(rest as u8);
}

/// Append a length-prefixed UTF-8 string
#[inline]
pub fn write_str(out: &mut Vec<u8>, value: &str) -> Result<()> {
    write_len(out, value.len())?;
    out.extend_from_slice(value.as_bytes());
    Ok(())
}

/// Append a collection length, rejecting counts the format cannot carry
pub fn write_len(out: &mut Vec<u8>, len: usize) -> Result<()> {
    let len = u32::try_from(len).map_err(|_| {
        DiscoveryError::ContractViolation(format!("collection of {} items is too large", len))
    })?;
    write_compact(out, len);
    Ok(())
}

/// Cursor over an encoded byte slice
#[derive(Debug, Clone)]
pub struct ByteReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    /// Reader positioned at `pos`
    pub fn at(data: &'a [u8], pos: usize) -> Result<Self> {
        if pos > data.len() {
            return Err(DiscoveryError::MalformedTrace(format!(
                "offset {} is past the end of a {} byte stream",
                pos,
                data.len()
            )));
        }
        Ok(Self { data, pos })
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        let byte = *self.data.get(self.pos).ok_or_else(|| self.truncated(1))?;
        self.pos += 1;
        Ok(byte)
    }

    pub fn read_bytes(&mut self, len: usize) -> Result<&'a [u8]> {
        if self.remaining() < len {
            return Err(self.truncated(len));
        }
        let bytes = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Ok(bytes)
    }

    pub fn read_u64_be(&mut self) -> Result<u64> {
        let bytes = self.read_bytes(8)?;
        let mut buf = [0u8; 8];
        buf.copy_from_slice(bytes);
        Ok(u64::from_be_bytes(buf))
    }

    pub fn read_compact(&mut self) -> Result<u32> {
        let first = u32::from(self.read_u8()?);
        if first < SINGLE_BYTE_LIMIT {
            return Ok(first);
        }

        let mut value = first - SINGLE_BYTE_LIMIT;
        let mut shift = 6;
        loop {
            let next = u32::from(self.read_u8()?);
            let payload = next & 0x7F;
            if shift >= 32 || payload >> (32 - shift) != 0 {
                return Err(DiscoveryError::MalformedTrace(format!(
                    "compact integer overflows 32 bits at offset {}",
                    self.pos - 1
                )));
            }
            value |= payload << shift;
            if next & 0x80 == 0 {
                return Ok(value);
            }
            shift += 7;
        }
    }

    pub fn read_str(&mut self) -> Result<&'a str> {
        let len = self.read_compact()? as usize;
        let start = self.pos;
        let bytes = self.read_bytes(len)?;
        std::str::from_utf8(bytes).map_err(|e| {
            DiscoveryError::MalformedTrace(format!("invalid UTF-8 at offset {}: {}", start, e))
        })
    }

    fn truncated(&self, wanted: usize) -> DiscoveryError {
        DiscoveryError::MalformedTrace(format!(
            "unexpected end of stream: wanted {} bytes at offset {}, {} left",
            wanted,
            self.pos,
            self.remaining()
        ))
    }
}
