// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Flow: a reliable, ordered message substream within a session.
//!
//! Flows carry the application traffic. Each is identified by an 8-bit id
//! and sequences its fragments with 1-based *stages*. Inbound, the flow
//! reassembles fragments split across datagrams and dispatches complete
//! messages; outbound, it cuts queued messages into fragments that fit the
//! session's datagram buffer, accounts cumulative acknowledgements and
//! re-emits unacknowledged fragments when its trigger raises.
//!
//! # Fragment flags
//!
//! | Bit | Meaning |
//! |-----|---------|
//! | `0x80` | first fragment of the flow's first message |
//! | `0x20` | payload continues a previous fragment |
//! | `0x10` | more fragments follow |
//! | `0x02` | abandon the pending reassembly |
//! | `0x01` | flow ends after this message |

mod message;
mod trigger;

pub use message::Message;
pub use trigger::Trigger;

use std::collections::VecDeque;

use crate::amf::{AmfReader, AmfWriter};
use crate::config::ServerConfig;
use crate::error::{Error, Result};
use crate::handler::ClientHandler;
use crate::packet::{get_7bit_value_size, BinaryWriter, PacketReader};
use crate::peer::Peer;
use crate::session::SessionSender;

/// First fragment of the flow's first message.
pub const MESSAGE_HEADER: u8 = 0x80;
/// Payload continues the pending reassembly buffer.
pub const MESSAGE_WITH_BEFOREPART: u8 = 0x20;
/// More fragments of this message follow.
pub const MESSAGE_WITH_AFTERPART: u8 = 0x10;
/// Abandon the pending reassembly buffer.
pub const MESSAGE_ABANDONMENT: u8 = 0x02;
/// The flow completes after this message.
pub const MESSAGE_END: u8 = 0x01;

/// Signature of the NetConnection control flow.
pub const SIGNATURE_CONNECTION: &[u8] = b"\x00\x54\x43\x04\x00";
/// Signature prefix of NetGroup flows.
pub const SIGNATURE_GROUP: &[u8] = b"\x00\x47\x43";

/// What a reassembled payload turned out to contain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Unpacked {
    /// Nothing to dispatch.
    Empty,
    /// AMF invoke (method name, callback handle, arguments).
    Amf,
    /// Audio payload.
    Audio,
    /// Video payload.
    Video,
    /// Raw tagged payload.
    Raw(u8),
}

/// Borrowed surroundings a flow needs while handling traffic.
///
/// Flows never own or hold their session; the session lends out its write
/// half and peer state for the duration of each call.
pub struct FlowContext<'a> {
    /// The session's datagram assembler.
    pub sender: &'a mut SessionSender,
    /// The session's peer (mutable: `setPeerInfo` updates it).
    pub peer: &'a mut Peer,
    /// Application callbacks.
    pub handler: &'a dyn ClientHandler,
    /// Server configuration (keep-alive periods for `setPeerInfo`).
    pub config: &'a ServerConfig,
}

/// A reliable ordered message substream.
pub struct Flow {
    id: u8,
    signature: Vec<u8>,
    name: String,
    stage_rcv: u32,
    stage_snd: u32,
    /// Partial reassembly of a fragmented inbound message.
    buffer: Option<Vec<u8>>,
    /// Outbound messages, oldest first; the head holds the lowest
    /// unacknowledged stage.
    messages: VecDeque<Message>,
    trigger: Trigger,
    callback_handle: f64,
    /// Cached code root, `<flow name>.<Method>`, for response codes.
    code: String,
    completed: bool,
    /// Discard sink handed out once the flow completed.
    message_null: Message,
}

impl Flow {
    /// New flow. The name is derived from the signature by the session
    /// (`NetConnection`, `NetGroup`, or empty for unknown kinds).
    #[must_use]
    pub fn new(id: u8, signature: &[u8], name: &str) -> Self {
        Self {
            id,
            signature: signature.to_vec(),
            name: name.to_owned(),
            stage_rcv: 0,
            stage_snd: 0,
            buffer: None,
            messages: VecDeque::new(),
            trigger: Trigger::new(),
            callback_handle: 0.0,
            code: name.to_owned(),
            completed: false,
            message_null: Message::null(),
        }
    }

    /// Flow id.
    #[must_use]
    pub fn id(&self) -> u8 {
        self.id
    }

    /// Flow kind name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Highest inbound stage consumed.
    #[must_use]
    pub fn stage_rcv(&self) -> u32 {
        self.stage_rcv
    }

    /// Highest outbound stage assigned.
    #[must_use]
    pub fn stage_snd(&self) -> u32 {
        self.stage_snd
    }

    /// Whether the flow has completed.
    #[must_use]
    pub fn completed(&self) -> bool {
        self.completed
    }

    /// Outbound messages still queued (unacknowledged or unflushed).
    #[must_use]
    pub fn queued_messages(&self) -> usize {
        self.messages.len()
    }

    /// Mark the flow completed: inbound is dropped from now on and no new
    /// message can be created, but the outbound queue keeps draining.
    pub fn complete(&mut self) {
        if self.completed {
            return;
        }
        log::debug!("[flow] flow '{:02x}' consumed", self.id);
        self.completed = true;
        self.buffer = None;
    }

    // ===================================================================
    // Inbound: reassembly and dispatch
    // ===================================================================

    /// Handle one inbound fragment at `stage`.
    pub fn message_handler(
        &mut self,
        stage: u32,
        reader: &mut PacketReader<'_>,
        flags: u8,
        ctx: &mut FlowContext<'_>,
    ) -> Result<()> {
        if self.completed {
            return Ok(());
        }

        if stage <= self.stage_rcv {
            log::debug!(
                "[flow] flow '{:02x}' stage '{}' has already been received",
                self.id,
                stage
            );
            return Ok(());
        }
        self.stage_rcv = stage;

        if flags & MESSAGE_ABANDONMENT != 0 {
            self.buffer = None;
        }

        if flags & MESSAGE_WITH_BEFOREPART != 0 {
            let Some(mut buffer) = self.buffer.take() else {
                return Err(Error::Protocol(
                    "fragment claims a 'beforepart' but the reassembly buffer is empty".into(),
                ));
            };
            buffer.extend_from_slice(reader.current());
            if flags & MESSAGE_WITH_AFTERPART != 0 {
                // Middle fragment: keep accumulating, nothing to dispatch.
                self.buffer = Some(buffer);
                return Ok(());
            }
            let mut composite = PacketReader::new(&buffer);
            let result = self.dispatch(&mut composite, ctx);
            self.finish_message(flags);
            return result;
        }

        if flags & MESSAGE_WITH_AFTERPART != 0 {
            if self.buffer.take().is_some() {
                // A stale partial message can only mean lost fragments;
                // drop it and restart with this one.
                log::error!(
                    "[flow] flow '{:02x}' fragment without 'beforepart' while a partial \
                     message is pending",
                    self.id
                );
            }
            self.buffer = Some(reader.current().to_vec());
            return Ok(());
        }

        let result = self.dispatch(reader, ctx);
        self.finish_message(flags);
        result
    }

    /// Common epilogue of a dispatched message: honor `MESSAGE_END` and
    /// guarantee the reassembly buffer never survives a dispatch, error
    /// paths included.
    fn finish_message(&mut self, flags: u8) {
        if flags & MESSAGE_END != 0 {
            self.complete();
        }
        self.buffer = None;
    }

    /// Classify a payload by its leading tag.
    fn unpack(reader: &mut PacketReader<'_>) -> Result<Unpacked> {
        if reader.available() == 0 {
            return Ok(Unpacked::Empty);
        }
        let type_ = reader.read8()?;
        match type_ {
            // AMF invoke, both encodings: the 0x11 variant carries one
            // extra byte before the usual four.
            0x11 => {
                reader.next(1)?;
                reader.next(4)?;
                Ok(Unpacked::Amf)
            }
            0x14 => {
                reader.next(4)?;
                Ok(Unpacked::Amf)
            }
            0x08 => Ok(Unpacked::Audio),
            0x09 => Ok(Unpacked::Video),
            0x04 => {
                reader.next(4)?;
                Ok(Unpacked::Raw(type_))
            }
            0x01 => Ok(Unpacked::Raw(type_)),
            _ => {
                log::error!("[flow] unpacking type '{:02x}' unknown", type_);
                Ok(Unpacked::Raw(type_))
            }
        }
    }

    /// Dispatch one complete message.
    fn dispatch(&mut self, reader: &mut PacketReader<'_>, ctx: &mut FlowContext<'_>) -> Result<()> {
        let kind = Self::unpack(reader)?;
        if kind == Unpacked::Empty {
            return Ok(());
        }

        self.callback_handle = 0.0;
        let mut name = String::new();
        if kind == Unpacked::Amf {
            let mut amf = AmfReader::new(reader);
            name = amf.read_string()?;
            self.callback_handle = amf.read_number()?;
            amf.skip_null()?;
        }

        // Cache the code root for responses: "<flow>.<Method>".
        self.code.clear();
        self.code.push_str(&self.name);
        if !name.is_empty() {
            self.code.push('.');
            let mut chars = name.chars();
            if let Some(first) = chars.next() {
                self.code.extend(first.to_uppercase());
                self.code.push_str(chars.as_str());
            }
        }

        match kind {
            Unpacked::Amf => self.amf_handler(&name, reader, ctx),
            Unpacked::Audio => {
                ctx.handler.on_audio(ctx.peer, reader.current());
                Ok(())
            }
            Unpacked::Video => {
                ctx.handler.on_video(ctx.peer, reader.current());
                Ok(())
            }
            Unpacked::Raw(type_) => {
                log::error!(
                    "[flow] raw message '{:02x}' untreated for flow '{:02x}'",
                    type_,
                    self.id
                );
                Ok(())
            }
            Unpacked::Empty => Ok(()),
        }
    }

    /// Route an AMF invoke: built-in connection methods first, then the
    /// application handler.
    fn amf_handler(
        &mut self,
        name: &str,
        reader: &mut PacketReader<'_>,
        ctx: &mut FlowContext<'_>,
    ) -> Result<()> {
        match name {
            "connect" if self.name == "NetConnection" => self.connect_handler(reader, ctx),
            "setPeerInfo" if self.name == "NetConnection" => self.set_peer_info_handler(reader, ctx),
            _ => {
                let mut amf = AmfReader::new(reader);
                if !ctx.handler.on_message(ctx.peer, &self.name, name, &mut amf) {
                    log::error!(
                        "[flow] message '{}' unknown for flow '{:02x}'",
                        name,
                        self.id
                    );
                }
                Ok(())
            }
        }
    }

    /// `connect`: ask the application, then answer `_result` or `_error`.
    fn connect_handler(
        &mut self,
        reader: &mut PacketReader<'_>,
        ctx: &mut FlowContext<'_>,
    ) -> Result<()> {
        let mut amf = AmfReader::new(reader);
        let params = amf.read_object().unwrap_or_default();

        if ctx.handler.on_connect(ctx.peer, &params) {
            let handle = self.callback_handle;
            let code = format!("{}.Success", self.code);
            let message = self.create_message();
            let mut amf = AmfWriter::new(message);
            amf.write_response_header("_result", handle)?;
            let mut object = amf.begin_object()?;
            object.write_string("level", "status")?;
            object.write_string("code", &code)?;
            object.write_string("description", "Connection succeeded")?;
            object.write_number("objectEncoding", 3.0)?;
            object.end()?;
            Ok(())
        } else {
            self.write_error_response("Connection rejected", "Rejected")
        }
    }

    /// `setPeerInfo`: record announced private addresses, reply with the
    /// keep-alive periods.
    fn set_peer_info_handler(
        &mut self,
        reader: &mut PacketReader<'_>,
        ctx: &mut FlowContext<'_>,
    ) -> Result<()> {
        ctx.peer.private_address.clear();
        let mut amf = AmfReader::new(reader);
        while amf.available() > 0 {
            let raw = amf.read_string()?;
            match raw.parse() {
                Ok(address) => ctx.peer.private_address.push(address),
                Err(_) => log::warn!("[flow] unparsable private address '{}'", raw),
            }
        }

        let (server, peer) = ctx.config.keep_alive_wire();
        let message = self.write_raw_message(true);
        message.write16(0x29)?;
        message.write32(u32::from(server))?;
        message.write32(u32::from(peer))?;
        Ok(())
    }

    // ===================================================================
    // Outbound: authoring
    // ===================================================================

    /// Append a new message to the outbound queue.
    ///
    /// The first message of a flow is prefixed with the flow signature
    /// preamble. A completed flow hands out the discard sink instead.
    pub fn create_message(&mut self) -> &mut Message {
        if self.completed {
            return &mut self.message_null;
        }
        let mut message = Message::new();
        if self.stage_snd == 0 && self.messages.is_empty() {
            // Preamble cannot fail: messages grow on demand.
            let _ = message.write8(self.signature.len() as u8);
            let _ = message.write_raw(&self.signature);
            let _ = message.write8(0x02); // following size
            let _ = message.write8(0x0A); // unknown, kept as on the wire
            let _ = message.write8(self.id);
            let _ = message.write8(0); // end marker of this part
        }
        self.messages.push_back(message);
        self.messages.back_mut().expect("just pushed")
    }

    /// Author a raw message; unless `without_header`, the standard raw
    /// prefix (tag `0x04` + four zero bytes) is included.
    pub fn write_raw_message(&mut self, without_header: bool) -> &mut Message {
        let message = self.create_message();
        if !without_header {
            let _ = message.write8(0x04);
            let _ = message.write32(0);
        }
        message
    }

    /// Author an AMF `_result` response to the last received invoke.
    pub fn write_amf_message(&mut self) -> Result<AmfWriter<'_, Message>> {
        let handle = self.callback_handle;
        let message = self.create_message();
        let mut amf = AmfWriter::new(message);
        amf.write_response_header("_result", handle)?;
        Ok(amf)
    }

    /// `_result` carrying a status object `<code root>.<name>`.
    pub fn write_success_response(&mut self, description: &str, name: &str) -> Result<()> {
        self.write_response("_result", "status", name, description)
    }

    /// `onStatus` carrying a status object.
    pub fn write_status_response(&mut self, name: &str, description: &str) -> Result<()> {
        self.write_response("onStatus", "status", name, description)
    }

    /// `_error` carrying an error object.
    pub fn write_error_response(&mut self, description: &str, name: &str) -> Result<()> {
        let code = self.response_code(name);
        log::warn!("[flow] '{}' response error: {}", code, description);
        self.write_response("_error", "error", name, description)
    }

    fn response_code(&self, name: &str) -> String {
        if name.is_empty() {
            self.code.clone()
        } else {
            format!("{}.{}", self.code, name)
        }
    }

    fn write_response(
        &mut self,
        key: &str,
        level: &str,
        name: &str,
        description: &str,
    ) -> Result<()> {
        let handle = self.callback_handle;
        let code = self.response_code(name);
        let message = self.create_message();
        let mut amf = AmfWriter::new(message);
        amf.write_response_header(key, handle)?;
        let mut object = amf.begin_object()?;
        object.write_string("level", level)?;
        object.write_string("code", &code)?;
        if !description.is_empty() {
            object.write_string("description", description)?;
        }
        object.end()?;
        Ok(())
    }

    // ===================================================================
    // Outbound: fragmentation, retransmission, acknowledgement
    // ===================================================================

    /// Cut never-flushed messages into fragments and place them in the
    /// session's write buffer, assigning stages as we go.
    pub fn flush_messages(&mut self, sender: &mut SessionSender) -> Result<()> {
        let mut header = true;
        let mut nb_stage_nack: u8 = 0;

        for message in &mut self.messages {
            if !message.fragments.is_empty() {
                // Already flushed, still awaiting acks: only counts.
                nb_stage_nack = nb_stage_nack.saturating_add(message.fragments.len() as u8);
                continue;
            }

            self.trigger.start();
            message.start_stage = self.stage_snd;
            message.reset_read();
            let mut fragment_offset: u32 = 0;

            loop {
                // Too little room even for a minimal fragment: emit the
                // datagram and start fresh with a header fragment.
                if sender.available() < 12 {
                    sender.flush(crate::protocol::WITHOUT_ECHO_TIME)?;
                    header = true;
                }

                let head = header;
                let stage_size = get_7bit_value_size(self.stage_snd + 1);
                let mut size = message.available() + 4;
                if head {
                    size += 2 + stage_size;
                }

                let mut flags = if self.stage_snd == 0 { MESSAGE_HEADER } else { 0 };
                if self.completed {
                    flags |= MESSAGE_END;
                }
                if fragment_offset > 0 {
                    flags |= MESSAGE_WITH_BEFOREPART;
                }
                if size > sender.available() {
                    flags |= MESSAGE_WITH_AFTERPART;
                    size = sender.available();
                    header = true;
                } else {
                    header = false;
                }

                size -= 3;
                sender.write_message(if head { 0x10 } else { 0x11 }, size as u16)?;
                size -= 1;
                sender.write8(flags)?;

                self.stage_snd += 1;
                if head {
                    sender.write8(self.id)?;
                    sender.write7_bit_value(self.stage_snd)?;
                    nb_stage_nack = nb_stage_nack.saturating_add(1);
                    sender.write8(nb_stage_nack)?;
                    size -= 2 + stage_size;
                }

                message.read_into(sender, size)?;
                message.fragments.push_back(fragment_offset);
                fragment_offset += size as u32;

                if message.available() == 0 {
                    break;
                }
            }
        }
        Ok(())
    }

    /// Management tick: re-emit unacknowledged fragments when the trigger
    /// raises. At most one datagram is filled per raise.
    pub fn raise(&mut self, sender: &mut SessionSender) -> Result<()> {
        if !self.trigger.raise()? {
            return Ok(());
        }
        self.raise_message(sender)
    }

    /// Re-emit recorded fragments of flushed messages (read-only pass:
    /// stages were assigned at flush time and are not consumed again).
    fn raise_message(&mut self, sender: &mut SessionSender) -> Result<()> {
        if self.messages.is_empty() {
            self.trigger.stop();
            return Ok(());
        }

        let mut header = true;
        let mut nb_stage_nack: u8 = 0;

        for message in &mut self.messages {
            if message.fragments.is_empty() {
                // Not flushed yet; everything behind is not either.
                return Ok(());
            }

            let mut stage = message.start_stage;
            message.reset_read();
            let offsets: Vec<u32> = message.fragments.iter().copied().collect();
            let total = message.len() as u32;
            let first_offset = offsets[0];
            message.seek_read(first_offset as usize);

            for (index, &offset) in offsets.iter().enumerate() {
                let end = index + 1 == offsets.len();
                let payload_size = if end {
                    total - offset
                } else {
                    offsets[index + 1] - offset
                } as usize;

                let stage_size = get_7bit_value_size(stage + 1);
                let mut size = payload_size + 4;
                if header {
                    size += 2 + stage_size;
                }

                // One datagram per raise: a continuation that does not fit
                // ends the pass instead of opening a second datagram.
                if !header && size > sender.available() {
                    return Ok(());
                }

                let mut flags = if stage == 0 { MESSAGE_HEADER } else { 0 };
                if self.completed {
                    flags |= MESSAGE_END;
                }
                if stage > message.start_stage {
                    flags |= MESSAGE_WITH_BEFOREPART;
                }
                if !end {
                    flags |= MESSAGE_WITH_AFTERPART;
                }

                size -= 3;
                let head = header;
                sender.write_message(if head { 0x10 } else { 0x11 }, size as u16)?;
                size -= 1;
                sender.write8(flags)?;
                stage += 1;
                if head {
                    sender.write8(self.id)?;
                    sender.write7_bit_value(stage)?;
                    nb_stage_nack = nb_stage_nack.saturating_add(1);
                    sender.write8(nb_stage_nack)?;
                    size -= 2 + stage_size;
                }

                message.read_into(sender, size)?;
                header = false;
            }
        }
        Ok(())
    }

    /// Cumulative acknowledgement up to (but excluding) `stage`'s
    /// successor: every fragment with a stage below or equal is released.
    pub fn acknowledgment(&mut self, stage: u32) {
        if stage > self.stage_snd {
            log::error!(
                "[flow] acknowledgment received superior to the current sending stage: \
                 '{}' instead of '{}'",
                stage,
                self.stage_snd
            );
            return;
        }

        let obsolete = match self.messages.front() {
            None => true,
            Some(head) => stage <= head.start_stage,
        };
        if obsolete {
            log::warn!(
                "[flow] acknowledgment of stage '{}' lower than all repeating messages of \
                 flow '{:02x}', certainly an obsolete ack packet",
                stage,
                self.id
            );
            return;
        }

        let mut count = stage
            - self
                .messages
                .front()
                .map(|m| m.start_stage)
                .unwrap_or_default();

        while count > 0 {
            match self.messages.front_mut() {
                Some(message) if !message.fragments.is_empty() => {
                    while count > 0 && message.fragments.pop_front().is_some() {
                        count -= 1;
                        message.start_stage += 1;
                    }
                    if message.fragments.is_empty() {
                        // Fully acknowledged.
                        self.messages.pop_front();
                    }
                }
                _ => break,
            }
        }

        let in_flight = self
            .messages
            .front()
            .is_some_and(|m| !m.fragments.is_empty());
        if in_flight {
            self.trigger.reset();
        } else {
            self.trigger.stop();
        }
    }

    /// Emulated close: the far side gets an empty terminal message.
    pub fn fail(&mut self, sender: &mut SessionSender) -> Result<()> {
        log::warn!("[flow] the flow '{:02x}' has failed", self.id);
        if self.completed {
            return Ok(());
        }
        self.create_message();
        self.complete();
        self.flush_messages(sender)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{AesEngine, Direction};
    use std::net::UdpSocket;
    use std::sync::{Arc, Mutex};

    fn test_sender() -> SessionSender {
        let socket = UdpSocket::bind("127.0.0.1:0").expect("bind");
        let address = socket.local_addr().expect("addr");
        SessionSender::new(
            Arc::new(socket),
            address,
            1,
            AesEngine::symmetric(Direction::Encrypt),
        )
    }

    fn test_peer() -> Peer {
        Peer::new([0u8; 32], "127.0.0.1:2000".parse().expect("addr"))
    }

    struct Capture {
        audio: Mutex<Vec<Vec<u8>>>,
        messages: Mutex<Vec<String>>,
    }

    impl Capture {
        fn new() -> Self {
            Self {
                audio: Mutex::new(Vec::new()),
                messages: Mutex::new(Vec::new()),
            }
        }
    }

    impl ClientHandler for Capture {
        fn on_message(
            &self,
            _peer: &Peer,
            _flow_name: &str,
            name: &str,
            amf: &mut AmfReader,
        ) -> bool {
            // Swallow the payload so its size is observable.
            let available = amf.available();
            self.messages
                .lock()
                .expect("lock")
                .push(format!("{}:{}", name, available));
            true
        }

        fn on_audio(&self, _peer: &Peer, packet: &[u8]) {
            self.audio.lock().expect("lock").push(packet.to_vec());
        }
    }

    /// Build an AMF invoke payload: tag, name, handle, null, then `extra`
    /// null markers standing in for arguments. `write_response_header`
    /// emits the tag + 4 zero bytes first, exactly the invoke framing
    /// `unpack()` expects.
    fn amf_invoke(name: &str, extra: usize) -> Vec<u8> {
        let mut message = Message::new();
        {
            let mut amf = AmfWriter::new(&mut message);
            amf.write_response_header(name, 1.0).expect("header");
        }
        message.write_raw(&vec![0x05u8; extra]).expect("extra");
        message.bytes().to_vec()
    }

    fn run_handler(flow: &mut Flow, stage: u32, payload: &[u8], flags: u8, capture: &Capture) {
        let mut sender = test_sender();
        let mut peer = test_peer();
        let config = ServerConfig::default();
        let mut ctx = FlowContext {
            sender: &mut sender,
            peer: &mut peer,
            handler: capture,
            config: &config,
        };
        let mut reader = PacketReader::new(payload);
        flow.message_handler(stage, &mut reader, flags, &mut ctx)
            .expect("message_handler");
    }

    #[test]
    fn test_duplicate_stage_not_redispatched() {
        let capture = Capture::new();
        let mut flow = Flow::new(2, SIGNATURE_CONNECTION, "NetConnection");
        let payload = amf_invoke("ping", 0);

        run_handler(&mut flow, 5, &payload, 0, &capture);
        run_handler(&mut flow, 5, &payload, 0, &capture);
        run_handler(&mut flow, 4, &payload, 0, &capture);

        assert_eq!(capture.messages.lock().expect("lock").len(), 1);
        assert_eq!(flow.stage_rcv(), 5);
    }

    #[test]
    fn test_fragment_reassembly_conserves_payload() {
        let capture = Capture::new();
        let mut flow = Flow::new(2, SIGNATURE_CONNECTION, "NetConnection");
        let payload = amf_invoke("call", 3000 - 16);
        let third = payload.len() / 3;

        run_handler(
            &mut flow,
            1,
            &payload[..third],
            MESSAGE_WITH_AFTERPART,
            &capture,
        );
        run_handler(
            &mut flow,
            2,
            &payload[third..2 * third],
            MESSAGE_WITH_BEFOREPART | MESSAGE_WITH_AFTERPART,
            &capture,
        );
        run_handler(
            &mut flow,
            3,
            &payload[2 * third..],
            MESSAGE_WITH_BEFOREPART,
            &capture,
        );

        let messages = capture.messages.lock().expect("lock");
        assert_eq!(messages.len(), 1);
        // name "call" + framing consumed; the argument bytes survive whole.
        assert_eq!(messages[0], format!("call:{}", 3000 - 16));
    }

    #[test]
    fn test_beforepart_without_pending_buffer_is_protocol_error() {
        let capture = Capture::new();
        let mut flow = Flow::new(2, SIGNATURE_CONNECTION, "NetConnection");

        let mut sender = test_sender();
        let mut peer = test_peer();
        let config = ServerConfig::default();
        let mut ctx = FlowContext {
            sender: &mut sender,
            peer: &mut peer,
            handler: &capture,
            config: &config,
        };
        let mut reader = PacketReader::new(b"rest");
        let result = flow.message_handler(1, &mut reader, MESSAGE_WITH_BEFOREPART, &mut ctx);
        assert!(result.is_err());
    }

    #[test]
    fn test_message_end_completes_flow() {
        let capture = Capture::new();
        let mut flow = Flow::new(2, SIGNATURE_CONNECTION, "NetConnection");
        let payload = amf_invoke("close", 0);

        run_handler(&mut flow, 1, &payload, MESSAGE_END, &capture);
        assert!(flow.completed());

        // Completed flows drop further inbound silently.
        run_handler(&mut flow, 2, &payload, 0, &capture);
        assert_eq!(capture.messages.lock().expect("lock").len(), 1);
    }

    #[test]
    fn test_audio_routing() {
        let capture = Capture::new();
        let mut flow = Flow::new(3, SIGNATURE_GROUP, "NetGroup");
        let mut payload = vec![0x08u8];
        payload.extend_from_slice(&[1, 2, 3, 4]);

        run_handler(&mut flow, 1, &payload, 0, &capture);
        let audio = capture.audio.lock().expect("lock");
        assert_eq!(audio.as_slice(), &[vec![1, 2, 3, 4]]);
    }

    #[test]
    fn test_first_message_carries_signature_preamble() {
        let mut flow = Flow::new(2, SIGNATURE_CONNECTION, "NetConnection");
        let message = flow.create_message();
        assert!(!message.is_null());
        let mut expected = vec![SIGNATURE_CONNECTION.len() as u8];
        expected.extend_from_slice(SIGNATURE_CONNECTION);
        expected.extend_from_slice(&[0x02, 0x0A, 2, 0x00]);
        assert_eq!(message.len(), expected.len());
    }

    #[test]
    fn test_completed_flow_hands_out_discard_sink() {
        let mut flow = Flow::new(2, SIGNATURE_CONNECTION, "NetConnection");
        flow.complete();
        let message = flow.create_message();
        message.write32(7).expect("write");
        assert!(message.is_null());
        assert_eq!(flow.queued_messages(), 0);
    }

    #[test]
    fn test_flush_assigns_stages_and_fragments() {
        let mut flow = Flow::new(2, SIGNATURE_CONNECTION, "NetConnection");
        let mut sender = test_sender();

        flow.write_success_response("Connection succeeded", "Success")
            .expect("response");
        flow.flush_messages(&mut sender).expect("flush");

        assert_eq!(flow.stage_snd(), 1);
        assert_eq!(flow.queued_messages(), 1);
        // The fragment sits in the session buffer as a 0x10 header shell.
        assert_eq!(sender.pending()[0], 0x10);
        // flags byte carries MESSAGE_HEADER for the flow's first stage.
        assert_eq!(sender.pending()[3] & MESSAGE_HEADER, MESSAGE_HEADER);
    }

    #[test]
    fn test_large_message_fragments_across_datagrams() {
        let mut flow = Flow::new(2, SIGNATURE_CONNECTION, "NetConnection");
        let mut sender = test_sender();

        let message = flow.create_message();
        message.write_raw(&vec![0xAAu8; 3000]).expect("payload");
        flow.flush_messages(&mut sender).expect("flush");

        // 3000 bytes cannot fit one ~1200-byte datagram.
        let fragments = flow.messages.front().expect("message").fragments.len();
        assert!(fragments >= 3, "expected >= 3 fragments, got {}", fragments);
        assert_eq!(flow.stage_snd(), fragments as u32);
        // Offsets are strictly increasing from zero.
        let offsets: Vec<u32> = flow.messages.front().expect("message").fragments.iter().copied().collect();
        assert_eq!(offsets[0], 0);
        assert!(offsets.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_ack_clears_prefix() {
        let mut flow = Flow::new(2, SIGNATURE_CONNECTION, "NetConnection");
        let mut sender = test_sender();

        // Five one-fragment messages at stages 1..=5.
        for i in 0..5 {
            let message = flow.create_message();
            message.write_raw(&[i as u8; 8]).expect("payload");
        }
        flow.flush_messages(&mut sender).expect("flush");
        assert_eq!(flow.stage_snd(), 5);

        flow.acknowledgment(3);
        assert_eq!(flow.queued_messages(), 2);
        assert_eq!(
            flow.messages.front().expect("head").start_stage,
            3,
            "head start_stage must equal the lowest unacknowledged stage"
        );
        assert!(flow.trigger.is_running());

        flow.acknowledgment(5);
        assert_eq!(flow.queued_messages(), 0);
        assert!(!flow.trigger.is_running());
    }

    #[test]
    fn test_ack_beyond_stage_snd_dropped() {
        let mut flow = Flow::new(2, SIGNATURE_CONNECTION, "NetConnection");
        let mut sender = test_sender();
        let message = flow.create_message();
        message.write8(1).expect("payload");
        flow.flush_messages(&mut sender).expect("flush");

        flow.acknowledgment(99);
        // Nothing released, nothing crashed.
        assert_eq!(flow.queued_messages(), 1);
    }

    #[test]
    fn test_obsolete_ack_dropped() {
        let mut flow = Flow::new(2, SIGNATURE_CONNECTION, "NetConnection");
        let mut sender = test_sender();
        let message = flow.create_message();
        message.write8(1).expect("payload");
        flow.flush_messages(&mut sender).expect("flush");
        flow.acknowledgment(1);
        assert_eq!(flow.queued_messages(), 0);

        // A second ack for the same stage has nothing left to clear.
        flow.acknowledgment(1);
        assert_eq!(flow.queued_messages(), 0);
    }

    #[test]
    fn test_raise_reemits_without_consuming_stages() {
        let mut flow = Flow::new(2, SIGNATURE_CONNECTION, "NetConnection");
        let mut sender = test_sender();
        let message = flow.create_message();
        message.write_raw(&[7u8; 16]).expect("payload");
        flow.flush_messages(&mut sender).expect("flush");
        sender.flush(0).expect("wire flush");
        let stage_before = flow.stage_snd();

        // First trigger raise happens on the first tick after start.
        flow.raise(&mut sender).expect("raise");
        assert_eq!(flow.stage_snd(), stage_before);
        assert!(sender.has_pending(), "raise must re-emit the fragment");
        assert_eq!(sender.pending()[0], 0x10);
    }

    #[test]
    fn test_no_leak_on_flow_drop() {
        let capture = Capture::new();
        let mut flow = Flow::new(2, SIGNATURE_CONNECTION, "NetConnection");
        run_handler(&mut flow, 1, b"partial", MESSAGE_WITH_AFTERPART, &capture);
        assert!(flow.buffer.is_some());
        flow.complete();
        assert!(flow.buffer.is_none(), "complete() releases the reassembly buffer");
    }
}
