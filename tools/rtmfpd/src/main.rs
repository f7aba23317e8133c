// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! rtmfpd - standalone RTMFP rendezvous server.
//!
//! # Usage
//!
//! ```bash
//! # Default port (1935)
//! rtmfpd
//!
//! # Custom port, verbose wire logging with packet dumps
//! rtmfpd --port 10000 --log-level debug --dump
//! ```

use clap::Parser;
use rtmfp::{RtmfpServer, ServerConfig};
use std::time::Duration;

/// Standalone RTMFP rendezvous server.
#[derive(Parser, Debug)]
#[command(name = "rtmfpd")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// UDP port to listen on.
    #[arg(short, long, default_value = "1935")]
    port: u16,

    /// Seconds of client silence before a keep-alive probe.
    #[arg(long, default_value = "15")]
    keep_alive_server: u16,

    /// Peer-to-peer keep-alive period advertised to clients, in seconds.
    #[arg(long, default_value = "10")]
    keep_alive_peer: u16,

    /// Upstream rendezvous address for middle-proxy deployments.
    #[arg(long)]
    cirrus: Option<std::net::SocketAddr>,

    /// Hex-dump decrypted request packets.
    #[arg(long, default_value = "false")]
    dump: bool,

    /// Hex-dump every packet, encrypted included.
    #[arg(long, default_value = "false")]
    dump_all: bool,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn main() {
    let args = Args::parse();

    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(args.log_level.as_str()),
    )
    .init();

    let config = ServerConfig {
        port: args.port,
        keep_alive_server: args.keep_alive_server,
        keep_alive_peer: args.keep_alive_peer,
        cirrus: args.cirrus,
        dump: args.dump || args.dump_all,
        dump_all: args.dump_all,
    };

    let server = RtmfpServer::new(config);
    match server.start() {
        Ok(address) => log::info!("rtmfpd listening on {}", address),
        Err(err) => {
            log::error!("rtmfpd failed to start: {}", err);
            std::process::exit(1);
        }
    }

    // The dispatcher runs on its own thread; park here until the process
    // is terminated.
    loop {
        std::thread::sleep(Duration::from_secs(60));
    }
}
