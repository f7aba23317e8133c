// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Session-id-0 handshake: cookies, key derivation, session allocation,
//! peer-to-peer rendezvous.
//!
//! All handshake traffic is encrypted with the well-known symmetric key.
//! The exchange is two-staged:
//!
//! ```text
//! client                              server
//!   | -- 0x30 epd(0x0A url) + tag ----> |
//!   | <- 0x70 tag, cookie, responder -- |   (cookie remembered 120 s)
//!   | -- 0x38 far id, cookie, nonce --> |
//!   | <- 0x78 new session id, nonce --- |   (session created, keys derived)
//! ```
//!
//! A `0x30` carrying epd type `0x0F` is a rendezvous request instead: the
//! server answers `0x71` with the wanted peer's addresses and redirects
//! the wanted session toward the requester.
//!
//! Session keys are derived without a bignum exchange: each side
//! contributes a random nonce and the two are mixed through HMAC-SHA256
//! keyed with the cookie, yielding one 16-byte key per direction.

use std::collections::HashMap;
use std::net::{SocketAddr, UdpSocket};
use std::sync::Arc;
use std::time::Instant;

use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::{Digest, Sha256};

use crate::config::{COOKIE_SIZE, COOKIE_TIMEOUT, KEY_SIZE, PEER_ID_SIZE};
use crate::crypto::{AesEngine, Direction};
use crate::error::{Error, Result};
use crate::packet::{BinaryWriter, PacketReader};
use crate::peer::Peer;
use crate::protocol::{verify_checksum, MARKER_TIME_ECHO, SYMMETRIC_ENCODING, WITHOUT_ECHO_TIME};
use crate::session::{Session, SessionSender, Sessions};

type HmacSha256 = Hmac<Sha256>;

/// Normal endpoint discriminator: the client names the server by URL.
const EPD_URL: u8 = 0x0A;
/// Rendezvous endpoint discriminator: the client names a wanted peer id.
const EPD_RENDEZVOUS: u8 = 0x0F;

/// Pending stage-1 state, waiting for the cookie echo.
struct Cookie {
    responder_nonce: [u8; COOKIE_SIZE],
    created: Instant,
}

/// Handshake endpoint (session id 0).
pub struct Handshake {
    sender: SessionSender,
    decrypt: AesEngine,
    cookies: HashMap<Vec<u8>, Cookie>,
}

impl Handshake {
    /// New handshake endpoint sending through `socket`.
    #[must_use]
    pub fn new(socket: Arc<UdpSocket>) -> Self {
        // The destination is set per datagram before each response.
        let placeholder: SocketAddr = ([0, 0, 0, 0], 0).into();
        Self {
            sender: SessionSender::new(
                socket,
                placeholder,
                0,
                AesEngine::symmetric(Direction::Encrypt),
            ),
            decrypt: AesEngine::symmetric(Direction::Decrypt),
            cookies: HashMap::new(),
        }
    }

    /// Handle one datagram addressed to session id 0.
    pub fn process(
        &mut self,
        datagram: &mut [u8],
        sender_addr: SocketAddr,
        sessions: &mut Sessions,
    ) -> Result<()> {
        let body = &mut datagram[4..];
        if body.len() % 16 != 0 {
            return Err(Error::Protocol(format!(
                "handshake body of {} bytes cannot be AES-decrypted",
                body.len()
            )));
        }
        self.decrypt.process(body)?;

        let sum = u16::from_be_bytes([datagram[4], datagram[5]]);
        if !verify_checksum(&datagram[6..], sum) {
            return Err(Error::ChecksumMismatch);
        }

        self.sender.set_address(sender_addr);

        let mut reader = PacketReader::new(&datagram[6..]);
        let marker = reader.read8()?;
        let _time_sent = reader.read16()?;
        if marker & MARKER_TIME_ECHO != 0 {
            let _time_echo = reader.read16()?;
        }

        while reader.available() > 0 {
            let type_ = reader.read8()?;
            if type_ == 0xFF {
                break;
            }
            let size = reader.read16()? as usize;
            let mut message = reader.clone();
            message.shrink(size);
            reader.next(size)?;

            match type_ {
                0x30 => self.hello_handler(&mut message, sender_addr, sessions)?,
                0x38 => self.cookie_handler(&mut message, sender_addr, sessions)?,
                other => {
                    log::error!("[handshake] message type '{:02x}' unknown", other);
                }
            }
        }
        Ok(())
    }

    /// Stage 1 (`0x30`): URL hello or rendezvous request.
    fn hello_handler(
        &mut self,
        message: &mut PacketReader<'_>,
        sender_addr: SocketAddr,
        sessions: &mut Sessions,
    ) -> Result<()> {
        let epd_len = message.read7_bit_value()? as usize;
        if epd_len == 0 {
            return Err(Error::Protocol("empty endpoint discriminator".into()));
        }
        let epd_type = message.read8()?;
        let epd = message.read_raw_vec(epd_len - 1)?;
        let tag = message.read_raw_vec(message.available())?;

        match epd_type {
            EPD_URL => {
                let url = String::from_utf8_lossy(&epd);
                log::debug!("[handshake] hello from {} for '{}'", sender_addr, url);
                self.send_cookie(&tag)
            }
            EPD_RENDEZVOUS => {
                if epd.len() < PEER_ID_SIZE {
                    return Err(Error::Protocol("short peer id in rendezvous".into()));
                }
                let mut peer_id = [0u8; PEER_ID_SIZE];
                peer_id.copy_from_slice(&epd[..PEER_ID_SIZE]);
                self.rendezvous_handler(&peer_id, &tag, sender_addr, sessions)
            }
            other => Err(Error::Protocol(format!(
                "endpoint discriminator type '{:02x}' unknown",
                other
            ))),
        }
    }

    /// Issue a cookie and the server's key material (`0x70`).
    fn send_cookie(&mut self, tag: &[u8]) -> Result<()> {
        let mut cookie = [0u8; COOKIE_SIZE];
        rand::thread_rng().fill_bytes(&mut cookie);
        let mut responder_nonce = [0u8; COOKIE_SIZE];
        rand::thread_rng().fill_bytes(&mut responder_nonce);

        self.cookies.insert(
            cookie.to_vec(),
            Cookie {
                responder_nonce,
                created: Instant::now(),
            },
        );

        let size = 1 + tag.len() + 1 + COOKIE_SIZE + 1 + COOKIE_SIZE;
        self.sender.write_message(0x70, size as u16)?;
        self.sender.write8(tag.len() as u8)?;
        self.sender.write_raw(tag)?;
        self.sender.write8(COOKIE_SIZE as u8)?;
        self.sender.write_raw(&cookie)?;
        self.sender.write8(COOKIE_SIZE as u8)?;
        self.sender.write_raw(&responder_nonce)?;
        self.sender.flush(SYMMETRIC_ENCODING | WITHOUT_ECHO_TIME)
    }

    /// UDP hole punching: answer the requester with the wanted peer's
    /// addresses (`0x71`) and redirect the wanted session toward the
    /// requester.
    fn rendezvous_handler(
        &mut self,
        peer_id: &[u8; PEER_ID_SIZE],
        tag: &[u8],
        requester_addr: SocketAddr,
        sessions: &mut Sessions,
    ) -> Result<()> {
        // The requester's own session (for its private addresses); it may
        // legitimately be absent when punching from an unconnected client.
        let requester_private: Vec<SocketAddr> = sessions
            .find_by_address(requester_addr)
            .map(|session| session.peer().private_address.clone())
            .unwrap_or_default();

        let Some(wanted) = sessions.find_by_peer(peer_id) else {
            log::debug!("[handshake] hole punching: session wanted not found, must be dead");
            return Ok(());
        };
        if wanted.failed() {
            log::debug!("[handshake] hole punching: session wanted is deleting");
            return Ok(());
        }

        // Address list for the requester: public first, then the distinct
        // private ones.
        let public = wanted.peer().address;
        let privates: Vec<SocketAddr> = wanted
            .peer()
            .private_address
            .iter()
            .copied()
            .filter(|address| *address != requester_addr)
            .collect();

        wanted.p2p_handshake(requester_addr, tag, &requester_private)?;

        let mut size = 1 + tag.len();
        size += address_size(&public);
        for address in &privates {
            size += address_size(address);
        }
        self.sender.write_message(0x71, size as u16)?;
        self.sender.write8(tag.len() as u8)?;
        self.sender.write_raw(tag)?;
        self.sender.write_address(&public, true)?;
        for address in &privates {
            self.sender.write_address(address, false)?;
        }
        self.sender.flush(SYMMETRIC_ENCODING | WITHOUT_ECHO_TIME)
    }

    /// Stage 2 (`0x38`): cookie echo, key derivation, session creation.
    fn cookie_handler(
        &mut self,
        message: &mut PacketReader<'_>,
        sender_addr: SocketAddr,
        sessions: &mut Sessions,
    ) -> Result<()> {
        let far_id = message.read32()?;
        let cookie_len = message.read7_bit_value()? as usize;
        let cookie = message.read_raw_vec(cookie_len)?;
        let initiator_nonce = message.read_raw_vec(message.available())?;
        if initiator_nonce.is_empty() {
            return Err(Error::Protocol("empty initiator nonce".into()));
        }

        let Some(pending) = self.cookies.remove(&cookie) else {
            log::warn!(
                "[handshake] unknown or expired cookie from {}, client must retry",
                sender_addr
            );
            return Ok(());
        };

        let peer_id = peer_id_of(&initiator_nonce);

        let (decrypt_key, encrypt_key) =
            compute_session_keys(&cookie, &initiator_nonce, &pending.responder_nonce);

        let id = sessions.next_id();
        let session = Session::new(
            id,
            far_id,
            Peer::new(peer_id, sender_addr),
            &decrypt_key,
            &encrypt_key,
            self.sender_socket(),
        );
        log::info!(
            "[handshake] session '{}' created for peer {} (far id {})",
            id,
            session.peer().id_hex(),
            far_id
        );
        sessions.add(session);

        let size = 4 + 1 + COOKIE_SIZE + 1;
        self.sender.write_message(0x78, size as u16)?;
        self.sender.write32(id)?;
        self.sender.write8(COOKIE_SIZE as u8)?;
        self.sender.write_raw(&pending.responder_nonce)?;
        self.sender.write8(0x58)?;
        self.sender.flush(SYMMETRIC_ENCODING | WITHOUT_ECHO_TIME)
    }

    /// Prune cookies a client never came back for.
    pub fn manage(&mut self) {
        self.cookies
            .retain(|_, cookie| cookie.created.elapsed() < COOKIE_TIMEOUT);
    }

    /// Drop all pending handshake state (shutdown).
    pub fn clear(&mut self) {
        self.cookies.clear();
    }

    /// Pending cookie count (diagnostics).
    #[must_use]
    pub fn pending_cookies(&self) -> usize {
        self.cookies.len()
    }

    fn sender_socket(&self) -> Arc<UdpSocket> {
        self.sender.socket()
    }
}

fn address_size(address: &SocketAddr) -> usize {
    match address {
        SocketAddr::V4(_) => 7,
        SocketAddr::V6(_) => 19,
    }
}

/// Peer id of a certificate: its SHA-256 digest. Clients derive their own
/// id the same way to hand it to rendezvous partners.
#[must_use]
pub fn peer_id_of(certificate: &[u8]) -> [u8; PEER_ID_SIZE] {
    let digest = Sha256::digest(certificate);
    let mut peer_id = [0u8; PEER_ID_SIZE];
    peer_id.copy_from_slice(&digest);
    peer_id
}

/// Derive the two per-direction session keys.
///
/// From the server's point of view: `decrypt` handles client-to-server
/// traffic, `encrypt` server-to-client. A client derives the same pair and
/// uses it swapped.
#[must_use]
pub fn compute_session_keys(
    shared: &[u8],
    initiator_nonce: &[u8],
    responder_nonce: &[u8],
) -> ([u8; KEY_SIZE], [u8; KEY_SIZE]) {
    let mut decrypt = [0u8; KEY_SIZE];
    let mut encrypt = [0u8; KEY_SIZE];
    decrypt.copy_from_slice(&mix(shared, &mix(responder_nonce, initiator_nonce))[..KEY_SIZE]);
    encrypt.copy_from_slice(&mix(shared, &mix(initiator_nonce, responder_nonce))[..KEY_SIZE]);
    (decrypt, encrypt)
}

fn mix(key: &[u8], data: &[u8]) -> [u8; 32] {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC accepts any key length");
    mac.update(data);
    let mut out = [0u8; 32];
    out.copy_from_slice(&mac.finalize().into_bytes());
    out
}
