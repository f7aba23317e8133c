// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Error taxonomy for the RTMFP core.
//!
//! Failure propagation is local by design: a malformed message drops that
//! message or datagram, a failing flow never terminates its session unless
//! it explicitly fails it, and socket errors are transient (the dispatcher
//! rebinds and continues).

use std::io;

use crate::packet::BufferError;

/// Errors surfaced by the RTMFP core.
#[derive(Debug)]
pub enum Error {
    /// Fewer bytes remained than a bounded read requested.
    Underflow {
        /// Bytes the caller asked for.
        needed: usize,
        /// Bytes actually remaining.
        available: usize,
    },
    /// A bounded write exceeded the fixed buffer.
    Overflow {
        /// Bytes the caller asked to write.
        needed: usize,
        /// Bytes of room actually remaining.
        available: usize,
    },
    /// Decrypted datagram failed checksum verification; the datagram is
    /// dropped without failing the session.
    ChecksumMismatch,
    /// Malformed framing, bad stage arithmetic, or an invalid flag
    /// combination. Drops the offending message or datagram.
    Protocol(String),
    /// Datagram addressed to a session id the table does not know.
    UnknownSession(u32),
    /// A session went silent past the keep-alive budget; fatal to the
    /// session, which enters the teardown ramp.
    KeepaliveTimeout,
    /// The retransmission trigger exhausted its back-off schedule.
    RepeatFailed,
    /// Transport-level failure. Transient for the dispatcher loop.
    Io(io::Error),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Underflow { needed, available } => write!(
                f,
                "buffer underflow: needed {} bytes, {} available",
                needed, available
            ),
            Self::Overflow { needed, available } => write!(
                f,
                "buffer overflow: needed {} bytes, {} available",
                needed, available
            ),
            Self::ChecksumMismatch => write!(f, "packet checksum mismatch"),
            Self::Protocol(reason) => write!(f, "protocol error: {}", reason),
            Self::UnknownSession(id) => write!(f, "unknown session '{}'", id),
            Self::KeepaliveTimeout => write!(f, "keepalive timeout"),
            Self::RepeatFailed => write!(f, "repeat trigger exhausted"),
            Self::Io(err) => write!(f, "socket error: {}", err),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Self::Io(err)
    }
}

impl From<BufferError> for Error {
    fn from(err: BufferError) -> Self {
        match err {
            BufferError::Underflow { needed, available } => Self::Underflow { needed, available },
            BufferError::Overflow { needed, available } => Self::Overflow { needed, available },
        }
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_messages() {
        let err = Error::Underflow {
            needed: 4,
            available: 1,
        };
        assert_eq!(
            err.to_string(),
            "buffer underflow: needed 4 bytes, 1 available"
        );

        assert_eq!(
            Error::UnknownSession(42).to_string(),
            "unknown session '42'"
        );
        assert_eq!(
            Error::ChecksumMismatch.to_string(),
            "packet checksum mismatch"
        );
    }

    #[test]
    fn test_buffer_error_conversion() {
        let err: Error = BufferError::Overflow {
            needed: 10,
            available: 2,
        }
        .into();
        assert!(matches!(err, Error::Overflow { needed: 10, available: 2 }));
    }
}
