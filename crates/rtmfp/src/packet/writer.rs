// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Bounded cursor writer over a caller-owned fixed buffer.

use super::{BinaryWriter, BufferError};

/// Bounded big-endian writer over a caller-owned mutable slice.
///
/// Writes fail with [`BufferError::Overflow`] when the remaining capacity
/// is exceeded; the cursor is left unchanged on failure. The encoding
/// primitives come from [`BinaryWriter`].
#[derive(Debug)]
pub struct PacketWriter<'a> {
    buf: &'a mut [u8],
    pos: usize,
}

impl<'a> PacketWriter<'a> {
    /// Wrap a buffer, cursor at the start.
    pub fn new(buf: &'a mut [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    /// Wrap a buffer with the cursor at `pos` (e.g. to skip a header that
    /// is patched in later).
    pub fn with_position(buf: &'a mut [u8], pos: usize) -> Self {
        let pos = pos.min(buf.len());
        Self { buf, pos }
    }

    /// Bytes written so far (absolute cursor position).
    #[must_use]
    pub fn position(&self) -> usize {
        self.pos
    }

    /// Remaining capacity.
    #[must_use]
    pub fn available(&self) -> usize {
        self.buf.len() - self.pos
    }

    /// Move the cursor to an absolute position (clamped to capacity).
    pub fn reset(&mut self, pos: usize) {
        self.pos = pos.min(self.buf.len());
    }

    /// The written prefix of the buffer.
    #[must_use]
    pub fn written(&self) -> &[u8] {
        &self.buf[..self.pos]
    }
}

impl BinaryWriter for PacketWriter<'_> {
    fn write_raw(&mut self, bytes: &[u8]) -> Result<(), BufferError> {
        let available = self.available();
        if bytes.len() > available {
            return Err(BufferError::Overflow {
                needed: bytes.len(),
                available,
            });
        }
        self.buf[self.pos..self.pos + bytes.len()].copy_from_slice(bytes);
        self.pos += bytes.len();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bounded_writes() {
        let mut buf = [0u8; 4];
        let mut writer = PacketWriter::new(&mut buf);

        writer.write16(0xBEEF).expect("write16");
        assert_eq!(writer.available(), 2);

        // u32 does not fit: cursor must not move.
        assert_eq!(
            writer.write32(1),
            Err(BufferError::Overflow {
                needed: 4,
                available: 2
            })
        );
        assert_eq!(writer.position(), 2);

        writer.write16(0xCAFE).expect("write16");
        assert_eq!(buf, [0xBE, 0xEF, 0xCA, 0xFE]);
    }

    #[test]
    fn test_with_position_skips_header() {
        let mut buf = [0u8; 8];
        let mut writer = PacketWriter::with_position(&mut buf, 4);
        writer.write8(0xAA).expect("write8");
        assert_eq!(writer.position(), 5);
        assert_eq!(buf[4], 0xAA);
        assert_eq!(&buf[..4], &[0, 0, 0, 0]);
    }

    #[test]
    fn test_number_encoding() {
        let mut buf = [0u8; 8];
        let mut writer = PacketWriter::new(&mut buf);
        writer.write_number(1.0).expect("number");
        assert_eq!(buf, [0x3F, 0xF0, 0, 0, 0, 0, 0, 0]);
    }
}
