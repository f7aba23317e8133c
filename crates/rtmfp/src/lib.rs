// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Pure-Rust RTMFP (Real-Time Media Flow Protocol) server.
//!
//! RTMFP is the UDP-based session protocol Flash-era clients use for
//! low-latency messaging and peer-to-peer rendezvous. This crate
//! implements the server side:
//!
//! - **Framing + crypto** ([`protocol`], [`crypto`]): checksum, scrambled
//!   session ids, AES-128-CBC with per-session keys.
//! - **Flows** ([`flow`]): reliable ordered message substreams with
//!   fragmentation, cumulative acks and triggered retransmission.
//! - **Sessions** ([`session`]): per-peer state, keep-alive and failure
//!   lifecycle, management sweep.
//! - **Handshake** ([`handshake`]): cookie exchange, key derivation,
//!   session allocation on id 0.
//! - **Dispatcher** ([`server`]): the single-threaded UDP loop and the
//!   peer-to-peer rendezvous.
//!
//! # Quick start
//!
//! ```no_run
//! use rtmfp::{RtmfpServer, ServerConfig};
//!
//! let server = RtmfpServer::new(ServerConfig::default());
//! server.start().expect("bind failed");
//! // ... run until shutdown ...
//! server.stop();
//! ```
//!
//! Application behavior (accepting connections, routing messages, audio
//! and video) is injected through [`ClientHandler`].

pub mod amf;
pub mod config;
pub mod crypto;
pub mod dump;
pub mod error;
pub mod flow;
pub mod handler;
pub mod handshake;
pub mod packet;
pub mod peer;
pub mod protocol;
pub mod server;
pub mod session;

pub use config::ServerConfig;
pub use error::{Error, Result};
pub use handler::{ClientHandler, DefaultClientHandler};
pub use peer::Peer;
pub use server::RtmfpServer;
