// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Application collaborator interface.
//!
//! The core owns sessions, flows and the wire; everything application-
//! specific is routed through [`ClientHandler`]. All callbacks run on the
//! dispatcher thread, so implementations must not block.

use crate::amf::{AmfObject, AmfReader};
use crate::peer::Peer;

/// Application callbacks for client lifecycle and payloads.
///
/// Every method has a reasonable default so simple servers can implement
/// only what they care about.
pub trait ClientHandler: Send + Sync {
    /// A client finished its handshake and sent `connect`. Return `false`
    /// to reject it; the server then answers `_error` instead of `_result`.
    fn on_connect(&self, peer: &Peer, params: &AmfObject) -> bool {
        let _ = (peer, params);
        true
    }

    /// A session died (keep-alive timeout, failure ramp, or shutdown).
    fn on_disconnect(&self, peer: &Peer) {
        let _ = peer;
    }

    /// An AMF message the core does not handle itself. Return `true` when
    /// consumed; unconsumed messages are logged and dropped.
    fn on_message(&self, peer: &Peer, flow_name: &str, name: &str, amf: &mut AmfReader) -> bool {
        let _ = (peer, flow_name, name, amf);
        false
    }

    /// An audio packet arrived on a flow.
    fn on_audio(&self, peer: &Peer, packet: &[u8]) {
        let _ = (peer, packet);
    }

    /// A video packet arrived on a flow.
    fn on_video(&self, peer: &Peer, packet: &[u8]) {
        let _ = (peer, packet);
    }
}

/// Accept-everything handler used when the embedder does not provide one.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultClientHandler;

impl ClientHandler for DefaultClientHandler {}
