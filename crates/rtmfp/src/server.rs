// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! The RTMFP server: UDP socket, dispatcher thread, session routing.
//!
//! One dispatcher thread owns the socket, the session table and the
//! handshake state; every session and flow is mutated only there. The
//! public control surface (`start`/`stop`) is serialized by a mutex and
//! talks to the dispatcher through an atomic terminate flag, never
//! touching session state while the loop runs.

use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::Mutex;
use socket2::{Domain, Protocol, Socket, Type};

use crate::config::{ServerConfig, PACKETRECV_SIZE, POLL_TIMEOUT, RTMFP_MIN_PACKET_SIZE};
use crate::dump::hex_dump;
use crate::error::Result;
use crate::handler::{ClientHandler, DefaultClientHandler};
use crate::handshake::Handshake;
use crate::packet::PacketReader;
use crate::protocol::unpack_id;
use crate::session::Sessions;

/// RTMFP server front: owns the dispatcher thread.
pub struct RtmfpServer {
    config: ServerConfig,
    handler: Arc<dyn ClientHandler>,
    control: Mutex<Control>,
    terminate: Arc<AtomicBool>,
}

#[derive(Default)]
struct Control {
    thread: Option<JoinHandle<()>>,
}

impl RtmfpServer {
    /// Server with the accept-everything handler.
    #[must_use]
    pub fn new(config: ServerConfig) -> Self {
        Self::with_handler(config, Arc::new(DefaultClientHandler))
    }

    /// Server with application callbacks.
    #[must_use]
    pub fn with_handler(config: ServerConfig, handler: Arc<dyn ClientHandler>) -> Self {
        Self {
            config,
            handler,
            control: Mutex::new(Control::default()),
            terminate: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Bind the socket and start the dispatcher thread.
    ///
    /// Returns the bound address (useful with port 0 in tests). Starting a
    /// running server is an error and leaves it untouched.
    pub fn start(&self) -> Result<SocketAddr> {
        let mut control = self.control.lock();
        if control.thread.is_some() {
            log::error!("RTMFP server is already running, call stop before");
            return Err(crate::error::Error::Protocol(
                "server already running".into(),
            ));
        }

        let socket = bind_socket(self.config.port)?;
        let local = socket.local_addr()?;

        self.terminate.store(false, Ordering::SeqCst);
        let terminate = Arc::clone(&self.terminate);
        let config = self.config.clone();
        let handler = Arc::clone(&self.handler);
        let thread = std::thread::Builder::new()
            .name("rtmfp-dispatcher".into())
            .spawn(move || dispatcher(socket, config, handler, terminate))?;
        control.thread = Some(thread);

        log::info!("RTMFP server starts on port {}", local.port());
        Ok(local)
    }

    /// Signal the dispatcher to terminate and join it.
    ///
    /// The loop exits within one poll quantum; the session table emits a
    /// synthetic fail to every live session before clearing.
    pub fn stop(&self) {
        let mut control = self.control.lock();
        self.terminate.store(true, Ordering::SeqCst);
        if let Some(thread) = control.thread.take() {
            if thread.join().is_err() {
                log::error!("dispatcher thread panicked");
            }
        }
    }

    /// Whether the dispatcher is running.
    #[must_use]
    pub fn running(&self) -> bool {
        self.control.lock().thread.is_some()
    }
}

impl Drop for RtmfpServer {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Build the UDP socket: reuse-addr, bounded poll quantum.
fn bind_socket(port: u16) -> Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    let bind_addr: SocketAddr = ([0, 0, 0, 0], port).into();
    socket.bind(&bind_addr.into())?;

    let socket: UdpSocket = socket.into();
    // The dispatcher must notice the terminate flag and run the
    // management sweep even when no traffic arrives.
    socket.set_read_timeout(Some(POLL_TIMEOUT))?;
    Ok(socket)
}

/// The dispatcher main loop.
fn dispatcher(
    socket: UdpSocket,
    config: ServerConfig,
    handler: Arc<dyn ClientHandler>,
    terminate: Arc<AtomicBool>,
) {
    let socket = Arc::new(socket);
    let mut sessions = Sessions::new(config.freq_manage());
    let mut handshake = Handshake::new(Arc::clone(&socket));
    let mut buffer = [0u8; PACKETRECV_SIZE];

    while !terminate.load(Ordering::SeqCst) {
        sessions.manage(&*handler, &config);
        handshake.manage();

        let (size, sender_addr) = match socket.recv_from(&mut buffer) {
            Ok(received) => received,
            Err(err)
                if err.kind() == std::io::ErrorKind::WouldBlock
                    || err.kind() == std::io::ErrorKind::TimedOut =>
            {
                continue;
            }
            Err(err) => {
                log::warn!("main socket reception: {}", err);
                continue;
            }
        };

        log::debug!("[server] {} bytes from {}", size, sender_addr);

        // One-byte datagrams are the port test protocol: echo and move on.
        if size == 1 {
            let _ = socket.send_to(&buffer[..1], sender_addr);
            continue;
        }
        if size < RTMFP_MIN_PACKET_SIZE || (size - 4) % 16 != 0 {
            log::error!("[server] invalid packet of {} bytes from {}", size, sender_addr);
            continue;
        }

        let datagram = &mut buffer[..size];
        if config.dump_all {
            hex_dump("packet crypted", datagram);
        }

        let id = unpack_id(datagram);
        if id == 0 {
            log::debug!("[server] handshaking");
            if let Err(err) = handshake.process(datagram, sender_addr, &mut sessions) {
                log::error!("[server] handshake error: {}", err);
            }
            continue;
        }

        let Some(session) = sessions.find(id) else {
            log::warn!("[server] unknown session '{}'", id);
            continue;
        };

        if let Err(err) = session.decode(datagram, sender_addr) {
            log::error!("[server] decrypt error on session '{}': {}", id, err);
            continue;
        }
        if config.dump {
            hex_dump("request", &datagram[6..]);
        }

        let mut reader = PacketReader::new(&datagram[6..]);
        if let Err(err) = session.packet_handler(&mut reader, &*handler, &config) {
            log::error!("[server] session '{}' packet error: {}", id, err);
        }
    }

    log::info!("RTMFP server stopping");
    sessions.terminate(&*handler);
    handshake.clear();
    log::info!("RTMFP server stops");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_start_stop_lifecycle() {
        let mut config = ServerConfig::default();
        config.port = 0;
        let server = RtmfpServer::new(config);

        let address = server.start().expect("start");
        assert_ne!(address.port(), 0);
        assert!(server.running());

        // Starting twice is refused.
        assert!(server.start().is_err());

        server.stop();
        assert!(!server.running());
    }

    #[test]
    fn test_one_byte_ping_echo() {
        let mut config = ServerConfig::default();
        config.port = 0;
        let server = RtmfpServer::new(config);
        let address = server.start().expect("start");

        let client = UdpSocket::bind("127.0.0.1:0").expect("bind");
        client
            .set_read_timeout(Some(Duration::from_secs(2)))
            .expect("timeout");
        let target = SocketAddr::from(([127, 0, 0, 1], address.port()));
        client.send_to(&[0x42], target).expect("send");

        let mut buf = [0u8; 16];
        let (size, _) = client.recv_from(&mut buf).expect("echo");
        assert_eq!(&buf[..size], &[0x42]);

        server.stop();
    }

    #[test]
    fn test_garbage_is_dropped_silently() {
        let mut config = ServerConfig::default();
        config.port = 0;
        let server = RtmfpServer::new(config);
        let address = server.start().expect("start");

        let client = UdpSocket::bind("127.0.0.1:0").expect("bind");
        let target = SocketAddr::from(([127, 0, 0, 1], address.port()));
        // Too short, and not block-aligned: both dropped without reply.
        client.send_to(&[1, 2, 3, 4, 5], target).expect("send");
        client.send_to(&[0u8; 21], target).expect("send");

        client
            .set_read_timeout(Some(Duration::from_millis(100)))
            .expect("timeout");
        let mut buf = [0u8; 64];
        assert!(client.recv_from(&mut buf).is_err());

        server.stop();
    }
}
