// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Session table: id allocation, lookups, management sweep.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use crate::config::{ServerConfig, PEER_ID_SIZE};
use crate::handler::ClientHandler;

use super::Session;

/// All live sessions, keyed by the id we allocated.
///
/// An auxiliary index maps peer ids to session ids (peer ids are immutable
/// after the handshake). Address lookups scan, since the public address
/// can rebind under NAT.
pub struct Sessions {
    sessions: HashMap<u32, Session>,
    by_peer: HashMap<[u8; PEER_ID_SIZE], u32>,
    freq_manage: Duration,
    last_manage: Instant,
    last_id: u32,
}

impl Sessions {
    /// Empty table sweeping at most every `freq_manage`.
    #[must_use]
    pub fn new(freq_manage: Duration) -> Self {
        Self {
            sessions: HashMap::new(),
            by_peer: HashMap::new(),
            freq_manage,
            last_manage: Instant::now(),
            last_id: 0,
        }
    }

    /// Number of live sessions.
    #[must_use]
    pub fn count(&self) -> usize {
        self.sessions.len()
    }

    /// Allocate the next session id: dense from 1, wrapping, skipping
    /// everything still alive. Id 0 stays reserved for the handshake.
    pub fn next_id(&mut self) -> u32 {
        loop {
            self.last_id = self.last_id.wrapping_add(1);
            if self.last_id != 0 && !self.sessions.contains_key(&self.last_id) {
                return self.last_id;
            }
        }
    }

    /// Insert a session under its own id.
    pub fn add(&mut self, session: Session) {
        self.by_peer.insert(session.peer().id, session.id());
        self.sessions.insert(session.id(), session);
    }

    /// Look up by session id.
    pub fn find(&mut self, id: u32) -> Option<&mut Session> {
        self.sessions.get_mut(&id)
    }

    /// Look up by peer id.
    pub fn find_by_peer(&mut self, peer_id: &[u8; PEER_ID_SIZE]) -> Option<&mut Session> {
        let id = *self.by_peer.get(peer_id)?;
        self.sessions.get_mut(&id)
    }

    /// Look up by the peer's current public address.
    pub fn find_by_address(&mut self, address: SocketAddr) -> Option<&mut Session> {
        let id = self
            .sessions
            .values()
            .find(|session| session.peer().address == address)
            .map(Session::id)?;
        self.sessions.get_mut(&id)
    }

    /// Iterate sessions mutably.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Session> {
        self.sessions.values_mut()
    }

    /// Management sweep, honoring the configured interval: ticks every
    /// session and reaps the died ones.
    pub fn manage(&mut self, handler: &dyn ClientHandler, config: &ServerConfig) {
        if self.last_manage.elapsed() < self.freq_manage {
            return;
        }
        self.last_manage = Instant::now();

        for session in self.sessions.values_mut() {
            session.manage(handler, config);
        }
        self.reap();
    }

    fn reap(&mut self) {
        let died: Vec<u32> = self
            .sessions
            .values()
            .filter(|session| session.died())
            .map(Session::id)
            .collect();
        for id in died {
            if let Some(session) = self.sessions.remove(&id) {
                log::info!("[sessions] session '{}' removed", id);
                self.by_peer.remove(&session.peer().id);
            }
        }
    }

    /// Shutdown: synthetically fail and kill every session, then clear.
    pub fn terminate(&mut self, handler: &dyn ClientHandler) {
        for session in self.sessions.values_mut() {
            session.fail("server shutdown");
            session.kill(handler);
        }
        self.sessions.clear();
        self.by_peer.clear();
    }
}
