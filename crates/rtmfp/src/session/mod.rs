// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Per-peer session: decrypt context, flow table, keep-alive and failure
//! lifecycle.
//!
//! A session is created by the handshake with fresh keys and a fresh id,
//! mutated only by the dispatcher thread, and reaped by the session table
//! sweep once it died. Inbound datagrams pass `decode` (decrypt + checksum)
//! then `packet_handler` (the message parse loop); outbound bytes leave
//! through the embedded [`SessionSender`].
//!
//! # Message types
//!
//! | Type | Meaning |
//! |------|---------|
//! | `0x10` | flow fragment with header (flags, id, stage, nack count) |
//! | `0x11` | flow fragment continuation (flags only, stage increments) |
//! | `0x51` | cumulative acknowledgement |
//! | `0x18` | peer reports a protocol failure |
//! | `0x01` | keep-alive probe (answered with `0x41`) |
//! | `0x41` | keep-alive answer |
//! | `0x4C` | peer killed the session |

mod sender;
mod table;

pub use sender::SessionSender;
pub use table::Sessions;

use std::collections::HashMap;
use std::net::{SocketAddr, UdpSocket};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::{ServerConfig, KEY_SIZE, MAX_TIMES_FAILED, MAX_TIMES_KEEPALIVE};
use crate::crypto::{AesEngine, Direction};
use crate::error::{Error, Result};
use crate::flow::{Flow, FlowContext, MESSAGE_HEADER, SIGNATURE_CONNECTION, SIGNATURE_GROUP};
use crate::handler::ClientHandler;
use crate::packet::{get_7bit_value_size, BinaryWriter, PacketReader};
use crate::peer::Peer;
use crate::protocol::{verify_checksum, MARKER_TIME_ECHO};

/// One established client session.
pub struct Session {
    id: u32,
    peer: Peer,
    decrypt: AesEngine,
    sender: SessionSender,
    flows: HashMap<u8, Flow>,
    /// Sentinel for fragments addressed to unknown flows: completed from
    /// birth, it swallows traffic without failing the session.
    flow_null: Flow,
    recv_timestamp: Instant,
    times_failed: u8,
    times_keepalive: u8,
    failed: bool,
    died: bool,
    /// Rendezvous attempts per tag, used to rotate through the
    /// requester's candidate addresses.
    p2p_handshake_attempts: HashMap<Vec<u8>, u8>,
}

impl Session {
    /// Create a session with the keys derived during the handshake.
    #[must_use]
    pub fn new(
        id: u32,
        far_id: u32,
        peer: Peer,
        decrypt_key: &[u8; KEY_SIZE],
        encrypt_key: &[u8; KEY_SIZE],
        socket: Arc<UdpSocket>,
    ) -> Self {
        let address = peer.address;
        let mut flow_null = Flow::new(0, &[], "");
        flow_null.complete();
        Self {
            id,
            peer,
            decrypt: AesEngine::new(decrypt_key, Direction::Decrypt),
            sender: SessionSender::new(
                socket,
                address,
                far_id,
                AesEngine::new(encrypt_key, Direction::Encrypt),
            ),
            flows: HashMap::new(),
            flow_null,
            recv_timestamp: Instant::now(),
            times_failed: 0,
            times_keepalive: 0,
            failed: false,
            died: false,
            p2p_handshake_attempts: HashMap::new(),
        }
    }

    /// Session id (our allocation).
    #[must_use]
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Far session id (the peer's allocation).
    #[must_use]
    pub fn far_id(&self) -> u32 {
        self.sender.far_id()
    }

    /// The connected peer.
    #[must_use]
    pub fn peer(&self) -> &Peer {
        &self.peer
    }

    /// Whether the session died and awaits reaping.
    #[must_use]
    pub fn died(&self) -> bool {
        self.died
    }

    /// Whether the session entered the failure ramp.
    #[must_use]
    pub fn failed(&self) -> bool {
        self.failed
    }

    /// Decrypt a datagram in place and verify its checksum.
    ///
    /// `datagram` is the full wire packet (4-byte scrambled id included).
    /// On success the plaintext sits at `datagram[6..]` onward and the
    /// peer's public address follows `sender` if it rebound.
    pub fn decode(&mut self, datagram: &mut [u8], sender: SocketAddr) -> Result<()> {
        let body = &mut datagram[4..];
        if body.len() % 16 != 0 {
            return Err(Error::Protocol(format!(
                "datagram body of {} bytes cannot be AES-decrypted",
                body.len()
            )));
        }
        self.decrypt.process(body)?;

        let sum = u16::from_be_bytes([datagram[4], datagram[5]]);
        if !verify_checksum(&datagram[6..], sum) {
            return Err(Error::ChecksumMismatch);
        }

        if self.peer.address != sender {
            log::info!(
                "[session] session '{}' peer rebound from {} to {}",
                self.id,
                self.peer.address,
                sender
            );
            self.peer.address = sender;
            self.sender.set_address(sender);
        }
        Ok(())
    }

    /// Consume one decrypted datagram: timestamps, then the message loop.
    pub fn packet_handler(
        &mut self,
        reader: &mut PacketReader<'_>,
        handler: &dyn ClientHandler,
        config: &ServerConfig,
    ) -> Result<()> {
        self.recv_timestamp = Instant::now();
        self.times_keepalive = 0;

        let marker = reader.read8()?;
        let time_sent = reader.read16()?;
        self.sender.record_peer_time(time_sent);
        if marker & MARKER_TIME_ECHO != 0 {
            // The peer's echo of our own timestamp; we do not track RTT.
            let _time_echo = reader.read16()?;
        }

        // Continuation fragments (0x11) implicitly reuse the last header's
        // flow and advance its stage by one.
        let mut current_flow_id: u8 = 0;
        let mut current_stage: u32 = 0;

        while reader.available() > 0 {
            let type_ = reader.read8()?;
            if type_ == 0xFF {
                // Padding reached.
                break;
            }
            let size = reader.read16()? as usize;
            let mut message = reader.clone();
            message.shrink(size);
            reader.next(size)?;

            match type_ {
                0x10 => {
                    let flags = message.read8()?;
                    current_flow_id = message.read8()?;
                    current_stage = message.read7_bit_value()?;
                    let _nb_stage_nack = message.read7_bit_value()?;
                    self.fragment_handler(
                        current_flow_id,
                        current_stage,
                        flags,
                        &mut message,
                        handler,
                        config,
                    )?;
                }
                0x11 => {
                    let flags = message.read8()?;
                    current_stage += 1;
                    self.fragment_handler(
                        current_flow_id,
                        current_stage,
                        flags,
                        &mut message,
                        handler,
                        config,
                    )?;
                }
                0x51 => {
                    let flow_id = message.read8()?;
                    let _buffers_available = message.read7_bit_value()?;
                    let stage = message.read7_bit_value()?;
                    if let Some(flow) = self.flows.get_mut(&flow_id) {
                        flow.acknowledgment(stage);
                    } else {
                        log::warn!(
                            "[session] ack for unknown flow '{:02x}' on session '{}'",
                            flow_id,
                            self.id
                        );
                    }
                }
                0x18 => {
                    self.fail("failure reported by peer");
                }
                0x01 => {
                    // Keep-alive probe from the peer: answer immediately.
                    self.sender.write_message(0x41, 0)?;
                }
                0x41 => {
                    // Answer to one of our probes; the receive timestamp
                    // reset above is all the bookkeeping needed.
                }
                0x4C => {
                    self.kill(handler);
                    return Ok(());
                }
                0x30 => {
                    log::error!(
                        "[session] handshake message on established session '{}'",
                        self.id
                    );
                }
                other => {
                    log::error!(
                        "[session] message type '{:02x}' unknown on session '{}'",
                        other,
                        self.id
                    );
                }
            }
        }

        self.flush_flows()
    }

    /// Hand one fragment to its flow, vivifying the flow on a header
    /// fragment carrying the signature preamble.
    fn fragment_handler(
        &mut self,
        flow_id: u8,
        stage: u32,
        flags: u8,
        message: &mut PacketReader<'_>,
        handler: &dyn ClientHandler,
        config: &ServerConfig,
    ) -> Result<()> {
        if flags & MESSAGE_HEADER != 0 {
            // First fragment of the flow's first message: the payload is
            // prefixed with the signature and length-prefixed fields that
            // end on a zero length.
            let signature_len = message.read8()? as usize;
            let signature = message.read_raw_vec(signature_len)?;
            loop {
                let len = message.read8()? as usize;
                if len == 0 {
                    break;
                }
                message.next(len)?;
            }
            self.flows
                .entry(flow_id)
                .or_insert_with(|| create_flow(flow_id, &signature));
        }

        let flow = match self.flows.get_mut(&flow_id) {
            Some(flow) => flow,
            None => {
                log::warn!(
                    "[session] fragment for unknown flow '{:02x}' on session '{}'",
                    flow_id,
                    self.id
                );
                &mut self.flow_null
            }
        };

        let mut ctx = FlowContext {
            sender: &mut self.sender,
            peer: &mut self.peer,
            handler,
            config,
        };
        let result = flow.message_handler(stage, message, flags, &mut ctx);
        let acked_stage = flow.stage_rcv();

        // Acknowledge the consumed stage so the peer releases its
        // fragments; duplicates re-ack, which is what stops a resend loop.
        if self.flows.contains_key(&flow_id) && acked_stage > 0 {
            let size = 2 + get_7bit_value_size(acked_stage);
            self.sender.write_message(0x51, size as u16)?;
            self.sender.write8(flow_id)?;
            self.sender.write7_bit_value(0x3F)?; // reception window
            self.sender.write7_bit_value(acked_stage)?;
        }
        result
    }

    /// Flush every flow's queued responses, then the datagram itself.
    fn flush_flows(&mut self) -> Result<()> {
        let mut failure: Option<Error> = None;
        for flow in self.flows.values_mut() {
            if let Err(err) = flow.flush_messages(&mut self.sender) {
                failure = Some(err);
            }
        }
        self.sender.flush(0)?;
        match failure {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Management tick: failure ramp, keep-alive probing, retransmission.
    pub fn manage(&mut self, handler: &dyn ClientHandler, config: &ServerConfig) {
        if self.died {
            return;
        }

        if self.failed {
            // Keep notifying the peer until the ramp runs out.
            self.times_failed += 1;
            let _ = self.sender.write_message(0x0C, 0);
            let _ = self.sender.flush(crate::protocol::WITHOUT_ECHO_TIME);
            if self.times_failed > MAX_TIMES_FAILED {
                self.kill(handler);
            }
            return;
        }

        let silence = Duration::from_secs(u64::from(config.keep_alive_server));
        if self.recv_timestamp.elapsed() > silence {
            self.keep_alive();
        }

        // Raise retransmission triggers.
        let mut exhausted = false;
        for flow in self.flows.values_mut() {
            match flow.raise(&mut self.sender) {
                Ok(()) => {}
                Err(Error::RepeatFailed) => exhausted = true,
                Err(err) => log::warn!(
                    "[session] raise on flow '{:02x}' failed: {}",
                    flow.id(),
                    err
                ),
            }
        }
        if exhausted {
            self.fail("repeat trigger exhausted");
        }
        let _ = self.sender.flush(0);
    }

    fn keep_alive(&mut self) {
        log::debug!("[session] keepalive session '{}'", self.id);
        self.times_keepalive += 1;
        if self.times_keepalive > MAX_TIMES_KEEPALIVE {
            self.fail("keepalive timeout");
            return;
        }
        let _ = self.sender.write_message(0x01, 0);
        let _ = self.sender.flush(0);
    }

    /// Queue a rendezvous redirect: tell this session's peer that
    /// `requester` (public address plus announced private ones) wants a
    /// direct link, rotating the advertised address across attempts.
    pub fn p2p_handshake(
        &mut self,
        requester: SocketAddr,
        tag: &[u8],
        requester_private: &[SocketAddr],
    ) -> Result<()> {
        let attempts = self
            .p2p_handshake_attempts
            .entry(tag.to_vec())
            .or_insert(0);
        let index = usize::from(*attempts) % (1 + requester_private.len());
        *attempts = attempts.wrapping_add(1);

        let (address, public) = if index == 0 {
            (requester, true)
        } else {
            (requester_private[index - 1], false)
        };

        let address_size = match address {
            SocketAddr::V4(_) => 7,
            SocketAddr::V6(_) => 19,
        };
        let size = 3 + address_size + tag.len();
        self.sender.write_message(0x0F, size as u16)?;
        self.sender.write8(0x22)?;
        self.sender.write8(0x21)?;
        self.sender.write8(0x0F)?;
        self.sender.write_address(&address, public)?;
        self.sender.write_raw(tag)?;
        self.sender.flush(0)?;
        Ok(())
    }

    /// Force the session onto the failure ramp.
    pub fn fail(&mut self, reason: &str) {
        if self.failed {
            return;
        }
        self.set_failed(reason);
        // First notification goes out immediately; manage() repeats it.
        let _ = self.sender.write_message(0x0C, 0);
        let _ = self.sender.flush(crate::protocol::WITHOUT_ECHO_TIME);
    }

    fn set_failed(&mut self, reason: &str) {
        if self.failed {
            return;
        }
        log::warn!("[session] session '{}' failed: {}", self.id, reason);
        self.failed = true;
        self.times_failed = 0;
    }

    /// Terminal state: release flows and notify the application. The table
    /// sweep removes died sessions.
    pub fn kill(&mut self, handler: &dyn ClientHandler) {
        if self.died {
            return;
        }
        self.died = true;
        self.flows.clear();
        handler.on_disconnect(&self.peer);
    }

    /// Direct access to a flow (tests and the dispatcher's rendezvous).
    #[must_use]
    pub fn flow(&mut self, id: u8) -> Option<&mut Flow> {
        self.flows.get_mut(&id)
    }
}

/// Map a wire signature to a flow kind.
fn create_flow(id: u8, signature: &[u8]) -> Flow {
    let name = if signature == SIGNATURE_CONNECTION {
        "NetConnection"
    } else if signature.starts_with(SIGNATURE_GROUP) {
        "NetGroup"
    } else {
        log::warn!("[session] new flow '{:02x}' with unknown signature", id);
        ""
    };
    log::debug!("[session] new flow '{:02x}' ({})", id, name);
    Flow::new(id, signature, name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PACKETSEND_SIZE;
    use crate::handler::DefaultClientHandler;
    use crate::packet::PacketWriter;

    fn test_session() -> Session {
        let socket = UdpSocket::bind("127.0.0.1:0").expect("bind");
        let address = socket.local_addr().expect("addr");
        Session::new(
            1,
            7,
            Peer::new([3u8; 32], address),
            &[0x0Au8; KEY_SIZE],
            &[0x0Bu8; KEY_SIZE],
            Arc::new(socket),
        )
    }

    /// Frame a plaintext message list the way a peer would (no echo).
    fn plain_packet(messages: &[u8]) -> Vec<u8> {
        let mut buf = vec![0u8; PACKETSEND_SIZE];
        let len = {
            let mut writer = PacketWriter::new(&mut buf);
            writer.write8(0x89).expect("marker");
            writer.write16(100).expect("time");
            writer.write_raw(messages).expect("messages");
            writer.position()
        };
        buf.truncate(len);
        buf
    }

    #[test]
    fn test_keepalive_probe_answered() {
        let mut session = test_session();
        let packet = plain_packet(&[0x01, 0x00, 0x00]);
        let mut reader = PacketReader::new(&packet);
        session
            .packet_handler(&mut reader, &DefaultClientHandler, &ServerConfig::default())
            .expect("handler");
        // The 0x41 answer was queued and flushed (buffer drained).
        assert!(!session.sender.has_pending());
    }

    #[test]
    fn test_keepalive_ramp_fails_session() {
        let mut session = test_session();
        let mut config = ServerConfig::default();
        config.keep_alive_server = 0; // every tick counts as silence

        for _ in 0..=MAX_TIMES_KEEPALIVE {
            session.manage(&DefaultClientHandler, &config);
        }
        assert!(session.failed());

        // The failure ramp eventually kills the session.
        for _ in 0..=MAX_TIMES_FAILED {
            session.manage(&DefaultClientHandler, &config);
        }
        assert!(session.died());
    }

    #[test]
    fn test_kill_message_kills_session() {
        let mut session = test_session();
        let packet = plain_packet(&[0x4C, 0x00, 0x00]);
        let mut reader = PacketReader::new(&packet);
        session
            .packet_handler(&mut reader, &DefaultClientHandler, &ServerConfig::default())
            .expect("handler");
        assert!(session.died());
    }

    #[test]
    fn test_flow_vivified_from_header_fragment() {
        let mut session = test_session();

        // Build a 0x10 fragment: flags MESSAGE_HEADER, flow 2, stage 1,
        // nack 1, signature preamble, then an empty AMF-less payload.
        let mut inner = vec![0u8; 64];
        let inner_len = {
            let mut writer = PacketWriter::new(&mut inner);
            writer.write8(MESSAGE_HEADER).expect("flags");
            writer.write8(2).expect("flow id");
            writer.write7_bit_value(1).expect("stage");
            writer.write8(1).expect("nack");
            writer
                .write8(SIGNATURE_CONNECTION.len() as u8)
                .expect("sig len");
            writer.write_raw(SIGNATURE_CONNECTION).expect("sig");
            writer.write8(0x02).expect("part len");
            writer.write_raw(&[0x0A, 0x02]).expect("part");
            writer.write8(0).expect("end");
            writer.position()
        };

        let mut messages = vec![0x10u8];
        messages.extend_from_slice(&(inner_len as u16).to_be_bytes());
        messages.extend_from_slice(&inner[..inner_len]);

        let packet = plain_packet(&messages);
        let mut reader = PacketReader::new(&packet);
        session
            .packet_handler(&mut reader, &DefaultClientHandler, &ServerConfig::default())
            .expect("handler");

        let flow = session.flow(2).expect("flow created");
        assert_eq!(flow.name(), "NetConnection");
        assert_eq!(flow.stage_rcv(), 1);
    }

    #[test]
    fn test_unknown_flow_fragment_is_non_fatal() {
        let mut session = test_session();
        // Continuation fragment for a flow that never sent a header.
        let packet = plain_packet(&[0x11, 0x00, 0x01, 0x00]);
        let mut reader = PacketReader::new(&packet);
        session
            .packet_handler(&mut reader, &DefaultClientHandler, &ServerConfig::default())
            .expect("handler");
        assert!(!session.failed());
        assert!(!session.died());
    }

    #[test]
    fn test_decode_rejects_bad_checksum() {
        let mut session = test_session();
        let mut datagram = vec![0u8; 4 + 32];
        // Body decrypts to garbage: checksum cannot match.
        let address = session.peer().address;
        assert!(matches!(
            session.decode(&mut datagram, address),
            Err(Error::ChecksumMismatch) | Err(Error::Protocol(_))
        ));
    }
}
