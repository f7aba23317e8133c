// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Bounded cursor over a borrowed byte slice.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use super::{BufferError, ADDRESS_FAMILY_IPV6, ADDRESS_PUBLIC};

/// Bounded big-endian reader over a borrowed slice.
///
/// All reads fail with [`BufferError::Underflow`] when fewer bytes remain
/// than requested; the cursor is left unchanged on failure.
#[derive(Debug, Clone)]
pub struct PacketReader<'a> {
    buf: &'a [u8],
    pos: usize,
    end: usize,
}

impl<'a> PacketReader<'a> {
    /// Wrap a full slice.
    #[must_use]
    pub fn new(buf: &'a [u8]) -> Self {
        Self {
            buf,
            pos: 0,
            end: buf.len(),
        }
    }

    /// Bytes remaining before the logical end.
    #[must_use]
    pub fn available(&self) -> usize {
        self.end - self.pos
    }

    /// Absolute cursor position from the start of the slice.
    #[must_use]
    pub fn position(&self) -> usize {
        self.pos
    }

    /// The unread portion of the buffer.
    #[must_use]
    pub fn current(&self) -> &'a [u8] {
        &self.buf[self.pos..self.end]
    }

    /// Move the cursor to an absolute position (clamped to the end).
    pub fn reset(&mut self, pos: usize) {
        self.pos = pos.min(self.end);
    }

    /// Truncate the logical end so that exactly `rest` bytes remain.
    ///
    /// A `rest` larger than what is available leaves the reader unchanged.
    pub fn shrink(&mut self, rest: usize) {
        if rest <= self.available() {
            self.end = self.pos + rest;
        }
    }

    /// Advance the cursor without reading.
    pub fn next(&mut self, size: usize) -> Result<(), BufferError> {
        self.check(size)?;
        self.pos += size;
        Ok(())
    }

    fn check(&self, needed: usize) -> Result<(), BufferError> {
        let available = self.available();
        if needed > available {
            return Err(BufferError::Underflow { needed, available });
        }
        Ok(())
    }

    /// Read one byte.
    pub fn read8(&mut self) -> Result<u8, BufferError> {
        self.check(1)?;
        let value = self.buf[self.pos];
        self.pos += 1;
        Ok(value)
    }

    /// Read a big-endian u16.
    pub fn read16(&mut self) -> Result<u16, BufferError> {
        self.check(2)?;
        let value = u16::from_be_bytes([self.buf[self.pos], self.buf[self.pos + 1]]);
        self.pos += 2;
        Ok(value)
    }

    /// Read a big-endian u32.
    pub fn read32(&mut self) -> Result<u32, BufferError> {
        self.check(4)?;
        let value = u32::from_be_bytes([
            self.buf[self.pos],
            self.buf[self.pos + 1],
            self.buf[self.pos + 2],
            self.buf[self.pos + 3],
        ]);
        self.pos += 4;
        Ok(value)
    }

    /// Read an IEEE-754 double, big-endian.
    pub fn read_number(&mut self) -> Result<f64, BufferError> {
        self.check(8)?;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(&self.buf[self.pos..self.pos + 8]);
        self.pos += 8;
        Ok(f64::from_bits(u64::from_be_bytes(raw)))
    }

    /// Read a 7-bit varint (big-endian group order, at most 5 bytes).
    ///
    /// The fifth byte may only contribute the low 4 bits; anything else
    /// would overflow u32 and fails as an underflow of sane input.
    pub fn read7_bit_value(&mut self) -> Result<u32, BufferError> {
        let mut result: u32 = 0;
        for i in 0..5 {
            let byte = self.read8()?;
            result = (result << 7) | u32::from(byte & 0x7F);
            if byte & 0x80 == 0 {
                return Ok(result);
            }
            // 5th byte with continuation set cannot happen for 32-bit values
            if i == 4 {
                break;
            }
        }
        Err(BufferError::Underflow {
            needed: 1,
            available: 0,
        })
    }

    /// Copy exactly `dst.len()` bytes into the caller's buffer.
    pub fn read_raw(&mut self, dst: &mut [u8]) -> Result<(), BufferError> {
        self.check(dst.len())?;
        dst.copy_from_slice(&self.buf[self.pos..self.pos + dst.len()]);
        self.pos += dst.len();
        Ok(())
    }

    /// Read `size` bytes into a fresh vector.
    pub fn read_raw_vec(&mut self, size: usize) -> Result<Vec<u8>, BufferError> {
        self.check(size)?;
        let out = self.buf[self.pos..self.pos + size].to_vec();
        self.pos += size;
        Ok(out)
    }

    /// Read an 8-bit length-prefixed string (lossy UTF-8).
    pub fn read_string8(&mut self) -> Result<String, BufferError> {
        let len = self.read8()? as usize;
        let raw = self.read_raw_vec(len)?;
        Ok(String::from_utf8_lossy(&raw).into_owned())
    }

    /// Read a 16-bit length-prefixed string (lossy UTF-8).
    pub fn read_string16(&mut self) -> Result<String, BufferError> {
        let len = self.read16()? as usize;
        let raw = self.read_raw_vec(len)?;
        Ok(String::from_utf8_lossy(&raw).into_owned())
    }

    /// Read a socket address; returns the address and its "public" bit.
    pub fn read_address(&mut self) -> Result<(SocketAddr, bool), BufferError> {
        let flags = self.read8()?;
        let public = flags & ADDRESS_PUBLIC != 0;
        let ip = if flags & 0x7F == ADDRESS_FAMILY_IPV6 {
            let mut octets = [0u8; 16];
            self.read_raw(&mut octets)?;
            IpAddr::V6(Ipv6Addr::from(octets))
        } else {
            let mut octets = [0u8; 4];
            self.read_raw(&mut octets)?;
            IpAddr::V4(Ipv4Addr::from(octets))
        };
        let port = self.read16()?;
        Ok((SocketAddr::new(ip, port), public))
    }
}
