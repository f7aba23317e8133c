// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Session write half: one outbound datagram under assembly.
//!
//! Flows and the session itself append messages through the
//! [`BinaryWriter`] primitives; `flush` frames whatever accumulated into a
//! single datagram (marker, timestamps, checksum, AES, id scramble) and
//! sends it. Splitting the write half out of the session breaks the
//! session/flow ownership cycle: flows receive `&mut SessionSender` for
//! the duration of a call and never hold a session reference.

use std::net::{SocketAddr, UdpSocket};
use std::sync::Arc;
use std::time::Instant;

use crate::config::{PACKETSEND_SIZE, RTMFP_HEADER_SIZE};
use crate::crypto::AesEngine;
use crate::error::Result;
use crate::packet::{BinaryWriter, BufferError};
use crate::protocol::{
    pack_id, timestamp_now, timestamp_of, MARKER_HANDSHAKE, MARKER_SERVER, MARKER_TIME_ECHO,
    SYMMETRIC_ENCODING, WITHOUT_ECHO_TIME,
};

/// Capacity usable for messages: the tail 16 bytes stay reserved for CBC
/// padding so a full buffer can still be encrypted.
const SEND_LIMIT: usize = PACKETSEND_SIZE - 16;

/// Assembles, frames, encrypts and sends one datagram at a time.
pub struct SessionSender {
    socket: Arc<UdpSocket>,
    address: SocketAddr,
    far_id: u32,
    encrypt: AesEngine,
    buffer: Box<[u8; PACKETSEND_SIZE]>,
    pos: usize,
    /// Last timestamp received from the peer and when, for the time echo.
    peer_time: Option<(u16, Instant)>,
}

impl SessionSender {
    /// New sender addressed at `address`, labeling datagrams with the
    /// peer-allocated `far_id`.
    #[must_use]
    pub fn new(
        socket: Arc<UdpSocket>,
        address: SocketAddr,
        far_id: u32,
        encrypt: AesEngine,
    ) -> Self {
        Self {
            socket,
            address,
            far_id,
            encrypt,
            buffer: Box::new([0u8; PACKETSEND_SIZE]),
            pos: RTMFP_HEADER_SIZE,
            peer_time: None,
        }
    }

    /// Destination address of the next flush.
    #[must_use]
    pub fn address(&self) -> SocketAddr {
        self.address
    }

    /// Follow the peer across NAT rebinding.
    pub fn set_address(&mut self, address: SocketAddr) {
        self.address = address;
    }

    /// Far session id used to label outbound datagrams.
    #[must_use]
    pub fn far_id(&self) -> u32 {
        self.far_id
    }

    /// Shared socket handle (sessions created by the handshake reuse it).
    #[must_use]
    pub fn socket(&self) -> Arc<UdpSocket> {
        Arc::clone(&self.socket)
    }

    /// Record the peer's timestamp for the next time echo.
    pub fn record_peer_time(&mut self, time: u16) {
        self.peer_time = Some((time, Instant::now()));
    }

    /// Room left for message bytes in the current datagram.
    #[must_use]
    pub fn available(&self) -> usize {
        SEND_LIMIT - self.pos
    }

    /// Message bytes accumulated so far (after the framing header).
    #[must_use]
    pub fn pending(&self) -> &[u8] {
        &self.buffer[RTMFP_HEADER_SIZE..self.pos]
    }

    /// Whether anything is waiting to be flushed.
    #[must_use]
    pub fn has_pending(&self) -> bool {
        self.pos > RTMFP_HEADER_SIZE
    }

    /// Begin a message: type byte plus declared length. Flushes the
    /// current datagram first when the message cannot fit.
    pub fn write_message(&mut self, type_: u8, length: u16) -> Result<()> {
        if length as usize + 3 > self.available() {
            self.flush(0)?;
        }
        self.write8(type_)?;
        self.write16(length)?;
        Ok(())
    }

    /// Frame, checksum, encrypt and send the accumulated datagram.
    ///
    /// Does nothing when no message bytes accumulated. Send failures are
    /// logged and swallowed: the transport is lossy anyway and the flow
    /// triggers take care of retransmission.
    pub fn flush(&mut self, flags: u8) -> Result<()> {
        if !self.has_pending() {
            return Ok(());
        }

        let echo = flags & WITHOUT_ECHO_TIME == 0 && self.peer_time.is_some();
        let mut marker = if flags & SYMMETRIC_ENCODING != 0 {
            MARKER_HANDSHAKE
        } else {
            MARKER_SERVER
        };

        // The header is packed right-aligned against the payload so the
        // message bytes never move: without the echo field the datagram
        // simply starts two bytes further in.
        let id_off = if echo { 0 } else { 2 };
        let ck = id_off + 4;
        let mut header = crate::packet::PacketWriter::with_position(&mut self.buffer[..], ck + 2);

        let time_sent = timestamp_now();
        if echo {
            marker |= MARKER_TIME_ECHO;
        }
        header.write8(marker)?;
        header.write16(time_sent)?;
        if echo {
            if let Some((peer_time, received_at)) = self.peer_time {
                let elapsed = timestamp_of(received_at.elapsed().as_millis() as u64);
                header.write16(peer_time.wrapping_add(elapsed))?;
            }
        }

        // Pad the plaintext (checksum field included) to the AES block.
        let mut end = self.pos;
        while (end - ck) % 16 != 0 {
            self.buffer[end] = 0xFF;
            end += 1;
        }

        let sum = crate::protocol::checksum(&self.buffer[ck + 2..end]);
        self.buffer[ck..ck + 2].copy_from_slice(&sum.to_be_bytes());

        self.encrypt.process(&mut self.buffer[ck..end])?;
        pack_id(&mut self.buffer[id_off..end], self.far_id);

        if let Err(err) = self.socket.send_to(&self.buffer[id_off..end], self.address) {
            log::warn!("[session] send to {} failed: {}", self.address, err);
        }

        self.pos = RTMFP_HEADER_SIZE;
        Ok(())
    }
}

impl BinaryWriter for SessionSender {
    fn write_raw(&mut self, bytes: &[u8]) -> std::result::Result<(), BufferError> {
        let available = self.available();
        if bytes.len() > available {
            return Err(BufferError::Overflow {
                needed: bytes.len(),
                available,
            });
        }
        self.buffer[self.pos..self.pos + bytes.len()].copy_from_slice(bytes);
        self.pos += bytes.len();
        Ok(())
    }
}

impl std::fmt::Debug for SessionSender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionSender")
            .field("address", &self.address)
            .field("far_id", &self.far_id)
            .field("pending", &(self.pos - RTMFP_HEADER_SIZE))
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RTMFP_MIN_PACKET_SIZE;
    use crate::crypto::Direction;
    use crate::protocol::{unpack_id, verify_checksum};

    fn sender_pair() -> (SessionSender, UdpSocket) {
        let receive = UdpSocket::bind("127.0.0.1:0").expect("bind");
        let send = UdpSocket::bind("127.0.0.1:0").expect("bind");
        let sender = SessionSender::new(
            Arc::new(send),
            receive.local_addr().expect("addr"),
            0x1122_3344,
            AesEngine::symmetric(Direction::Encrypt),
        );
        (sender, receive)
    }

    #[test]
    fn test_flush_roundtrips_on_the_wire() {
        let (mut sender, receive) = sender_pair();
        sender.write_message(0x41, 2).expect("message");
        sender.write16(0xABCD).expect("payload");
        assert!(sender.has_pending());
        sender.flush(WITHOUT_ECHO_TIME).expect("flush");
        assert!(!sender.has_pending());

        let mut buf = [0u8; 256];
        receive
            .set_read_timeout(Some(std::time::Duration::from_secs(2)))
            .expect("timeout");
        let (size, _) = receive.recv_from(&mut buf).expect("recv");
        assert!(size >= RTMFP_MIN_PACKET_SIZE);
        assert_eq!((size - 4) % 16, 0);

        assert_eq!(unpack_id(&buf[..size]), 0x1122_3344);

        // Decrypt and verify the frame the way a receiving session does.
        AesEngine::symmetric(Direction::Decrypt)
            .process(&mut buf[4..size])
            .expect("decrypt");
        let sum = u16::from_be_bytes([buf[4], buf[5]]);
        assert!(verify_checksum(&buf[6..size], sum));

        // marker, time(2), then the message: type 0x41, length 2, payload.
        assert_eq!(buf[6] & MARKER_TIME_ECHO, 0);
        assert_eq!(buf[9], 0x41);
        assert_eq!(u16::from_be_bytes([buf[10], buf[11]]), 2);
        assert_eq!(&buf[12..14], &[0xAB, 0xCD]);
    }

    #[test]
    fn test_time_echo_present_after_receive() {
        let (mut sender, receive) = sender_pair();
        sender.record_peer_time(1000);
        sender.write_message(0x41, 0).expect("message");
        sender.flush(0).expect("flush");

        let mut buf = [0u8; 256];
        receive
            .set_read_timeout(Some(std::time::Duration::from_secs(2)))
            .expect("timeout");
        let (size, _) = receive.recv_from(&mut buf).expect("recv");
        AesEngine::symmetric(Direction::Decrypt)
            .process(&mut buf[4..size])
            .expect("decrypt");

        assert_ne!(buf[6] & MARKER_TIME_ECHO, 0);
        let echoed = u16::from_be_bytes([buf[9], buf[10]]);
        // Echo = peer time + elapsed ticks; elapsed is ~0 here.
        assert!(echoed.wrapping_sub(1000) < 4);
    }

    #[test]
    fn test_empty_flush_is_a_no_op() {
        let (mut sender, receive) = sender_pair();
        sender.flush(0).expect("flush");

        receive
            .set_read_timeout(Some(std::time::Duration::from_millis(50)))
            .expect("timeout");
        let mut buf = [0u8; 64];
        assert!(receive.recv_from(&mut buf).is_err());
    }

    #[test]
    fn test_write_message_autoflushes_when_full() {
        let (mut sender, receive) = sender_pair();
        receive
            .set_read_timeout(Some(std::time::Duration::from_secs(2)))
            .expect("timeout");

        let chunk = vec![0u8; 1000];
        sender.write_message(0x10, 1000).expect("first");
        sender.write_raw(&chunk).expect("payload");
        // Second large message cannot fit: the first datagram goes out.
        sender.write_message(0x10, 1000).expect("second");
        sender.write_raw(&chunk).expect("payload");

        let mut buf = [0u8; 2048];
        let (size, _) = receive.recv_from(&mut buf).expect("recv");
        assert!(size > 1000);
        assert!(sender.has_pending());
    }
}
