// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! RTMFP Global Configuration - Single Source of Truth
//!
//! This module centralizes ALL protocol constants and runtime configuration.
//! **NEVER hardcode elsewhere!**
//!
//! # Architecture
//!
//! - **Level 1 (Static)**: Compile-time constants (wire sizes, default port,
//!   timing defaults)
//! - **Level 2 (Dynamic)**: [`ServerConfig`] for runtime config (port,
//!   keep-alive periods, packet dumping)

use std::net::SocketAddr;
use std::time::Duration;

// =======================================================================
// Wire Sizes
// =======================================================================

/// Default RTMFP/RTMP port.
///
/// Flash clients connect to `rtmfp://host:1935/<app>` unless told otherwise.
pub const RTMFP_DEFAULT_PORT: u16 = 1935;

/// Receive buffer size per datagram.
///
/// Stack-allocated in the dispatcher frame; never escapes it.
pub const PACKETRECV_SIZE: usize = 2048;

/// Send buffer size embedded in each session.
///
/// One outbound datagram is assembled here before encrypt + send. The usable
/// payload is this minus the 11-byte framing header and the AES padding.
pub const PACKETSEND_SIZE: usize = 1215;

/// Smallest datagram the protocol can produce.
///
/// 4 bytes scrambled id + 2 checksum + 1 marker + 2 time + at least one
/// message shell. Anything shorter is noise and dropped.
pub const RTMFP_MIN_PACKET_SIZE: usize = 12;

/// Framing header bytes reserved at the front of the send buffer:
/// `id(4) + checksum(2) + marker(1) + time(2) + time_echo(2)`.
pub const RTMFP_HEADER_SIZE: usize = 11;

/// AES key size. RTMFP uses AES-128 exclusively.
pub const KEY_SIZE: usize = 16;

/// Handshake cookie size.
pub const COOKIE_SIZE: usize = 64;

/// Peer id size (SHA-256 of the peer certificate).
pub const PEER_ID_SIZE: usize = 32;

// =======================================================================
// Timing Defaults
// =======================================================================

/// Default interval between two session-table management sweeps.
///
/// The sweep drives keep-alives, the failure ramp, cookie expiry and
/// retransmission triggers.
pub const MANAGE_INTERVAL: Duration = Duration::from_secs(2);

/// Seconds of inbound silence before the server probes a client.
pub const DEFAULT_KEEPALIVE_SERVER: u16 = 15;

/// Seconds between keep-alive probes on a direct peer-to-peer link,
/// advertised to clients during connection setup.
pub const DEFAULT_KEEPALIVE_PEER: u16 = 10;

/// Unanswered keep-alive probes tolerated before a session is failed.
pub const MAX_TIMES_KEEPALIVE: u8 = 3;

/// Management ticks a failed session keeps re-sending its fail
/// notification before it is reaped.
pub const MAX_TIMES_FAILED: u8 = 10;

/// Lifetime of an unconsumed handshake cookie.
pub const COOKIE_TIMEOUT: Duration = Duration::from_secs(120);

/// Socket poll quantum of the dispatcher loop.
pub const POLL_TIMEOUT: Duration = Duration::from_millis(250);

// =======================================================================
// Runtime Configuration
// =======================================================================

/// Runtime server configuration.
///
/// Built with [`Default`] or [`ServerConfig::from_env`], then handed to
/// `RtmfpServer::start`.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// UDP port to bind.
    pub port: u16,
    /// Seconds of silence before the server sends a keep-alive probe.
    pub keep_alive_server: u16,
    /// Seconds between peer-to-peer keep-alive probes (advertised to clients).
    pub keep_alive_peer: u16,
    /// Optional upstream rendezvous address enabling middle-proxy mode.
    ///
    /// The proxy itself is an external collaborator; within the core this
    /// only forces the management sweep to run on every loop iteration.
    pub cirrus: Option<SocketAddr>,
    /// Hex-dump decrypted request packets.
    pub dump: bool,
    /// Hex-dump every packet in both directions, encrypted included.
    pub dump_all: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: RTMFP_DEFAULT_PORT,
            keep_alive_server: DEFAULT_KEEPALIVE_SERVER,
            keep_alive_peer: DEFAULT_KEEPALIVE_PEER,
            cirrus: None,
            dump: false,
            dump_all: false,
        }
    }
}

impl ServerConfig {
    /// Build a configuration from `RTMFP_*` environment variables,
    /// falling back to defaults for anything unset or unparsable.
    ///
    /// Recognized: `RTMFP_PORT`, `RTMFP_KEEPALIVE_SERVER`,
    /// `RTMFP_KEEPALIVE_PEER`, `RTMFP_CIRRUS`, `RTMFP_DUMP` (`1` or `all`).
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(port) = env_parse::<u16>("RTMFP_PORT") {
            config.port = port;
        }
        if let Some(secs) = env_parse::<u16>("RTMFP_KEEPALIVE_SERVER") {
            config.keep_alive_server = secs;
        }
        if let Some(secs) = env_parse::<u16>("RTMFP_KEEPALIVE_PEER") {
            config.keep_alive_peer = secs;
        }
        if let Some(addr) = env_parse::<SocketAddr>("RTMFP_CIRRUS") {
            config.cirrus = Some(addr);
        }
        match std::env::var("RTMFP_DUMP").as_deref() {
            Ok("all") => {
                config.dump = true;
                config.dump_all = true;
            }
            Ok("1") | Ok("true") => config.dump = true,
            _ => {}
        }

        config
    }

    /// Interval between management sweeps for this configuration.
    ///
    /// Middle-proxy mode needs direct processing and gets a zero interval.
    #[must_use]
    pub fn freq_manage(&self) -> Duration {
        if self.cirrus.is_some() {
            Duration::ZERO
        } else {
            MANAGE_INTERVAL
        }
    }

    /// Keep-alive periods as transmitted on the wire (seconds x 10).
    #[must_use]
    pub fn keep_alive_wire(&self) -> (u16, u16) {
        (
            self.keep_alive_server.saturating_mul(10),
            self.keep_alive_peer.saturating_mul(10),
        )
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    let raw = std::env::var(name).ok()?;
    match raw.parse() {
        Ok(value) => Some(value),
        Err(_) => {
            log::warn!("[config] ignoring unparsable {}={}", name, raw);
            None
        }
    }
}
