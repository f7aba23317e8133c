// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Outbound application message.
//!
//! A message accumulates bytes through the [`BinaryWriter`] primitives,
//! then `flush_messages` cuts it into fragments that fit the session's
//! datagram buffer. The recorded fragment offsets drive retransmission and
//! acknowledgement accounting; when the last fragment is acknowledged the
//! message is dropped.

use std::collections::VecDeque;

use crate::packet::{BinaryWriter, BufferError};

/// A to-be-sent message queued on a flow.
#[derive(Debug, Default)]
pub struct Message {
    payload: Vec<u8>,
    read_pos: usize,
    /// Protocol stage of the first not-yet-acknowledged fragment.
    /// Zero until the message is flushed for the first time.
    pub start_stage: u32,
    /// Byte offsets at which fragments were cut. Empty means the message
    /// has never been flushed.
    pub fragments: VecDeque<u32>,
    discard: bool,
}

impl Message {
    /// New empty message.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The discard sink handed out by completed flows: every write
    /// silently vanishes, nothing is ever queued.
    #[must_use]
    pub fn null() -> Self {
        Self {
            discard: true,
            ..Self::default()
        }
    }

    /// Whether this is the discard sink.
    #[must_use]
    pub fn is_null(&self) -> bool {
        self.discard
    }

    /// Total payload length.
    #[must_use]
    pub fn len(&self) -> usize {
        self.payload.len()
    }

    /// Whether the payload is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    /// Bytes left behind the sequential read cursor.
    #[must_use]
    pub fn available(&self) -> usize {
        self.payload.len() - self.read_pos
    }

    /// The whole payload.
    #[must_use]
    pub fn bytes(&self) -> &[u8] {
        &self.payload
    }

    /// Rewind the read cursor (before re-emitting fragments).
    pub fn reset_read(&mut self) {
        self.read_pos = 0;
    }

    /// Position the read cursor on an absolute payload offset.
    pub fn seek_read(&mut self, pos: usize) {
        self.read_pos = pos.min(self.payload.len());
    }

    /// Copy the next `size` bytes into `out`, advancing the cursor.
    pub fn read_into<W: BinaryWriter>(
        &mut self,
        out: &mut W,
        size: usize,
    ) -> Result<(), BufferError> {
        let size = size.min(self.available());
        out.write_raw(&self.payload[self.read_pos..self.read_pos + size])?;
        self.read_pos += size;
        Ok(())
    }
}

impl BinaryWriter for Message {
    fn write_raw(&mut self, bytes: &[u8]) -> Result<(), BufferError> {
        if !self.discard {
            self.payload.extend_from_slice(bytes);
        }
        Ok(())
    }
}
