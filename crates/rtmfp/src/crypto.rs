// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! AES-128-CBC engine for datagram encryption.
//!
//! Every datagram body is encrypted with AES-128 in CBC mode and an
//! all-zero IV; there is no chaining across datagrams. Handshake traffic
//! (session id 0) uses the well-known symmetric key in both directions,
//! established sessions use the two per-direction keys derived during the
//! handshake.
//!
//! Callers pad the framed packet to a multiple of 16 before encrypting and
//! verify the checksum after decrypting.

use aes::cipher::{
    generic_array::GenericArray, BlockDecryptMut, BlockEncryptMut, KeyIvInit,
};
use aes::Aes128;

use crate::config::KEY_SIZE;
use crate::error::{Error, Result};

/// Well-known key for symmetric (handshake) encryption.
pub const RTMFP_SYMMETRIC_KEY: &[u8; KEY_SIZE] = b"Adobe Systems 02";

/// Direction the engine processes in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Inbound: ciphertext to plaintext.
    Decrypt,
    /// Outbound: plaintext to ciphertext.
    Encrypt,
}

/// AES-128-CBC engine bound to one key and one direction.
#[derive(Clone)]
pub struct AesEngine {
    key: [u8; KEY_SIZE],
    direction: Direction,
}

impl AesEngine {
    /// Build an engine for a 16-byte key.
    #[must_use]
    pub fn new(key: &[u8; KEY_SIZE], direction: Direction) -> Self {
        Self {
            key: *key,
            direction,
        }
    }

    /// Build the symmetric engine used for session-id-0 traffic.
    #[must_use]
    pub fn symmetric(direction: Direction) -> Self {
        Self::new(RTMFP_SYMMETRIC_KEY, direction)
    }

    /// Direction this engine was built for.
    #[must_use]
    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Process `data` in place. The length must be a multiple of 16.
    ///
    /// A fresh zero IV is used per call, matching the per-datagram CBC
    /// state of the protocol.
    pub fn process(&self, data: &mut [u8]) -> Result<()> {
        if data.len() % 16 != 0 {
            return Err(Error::Protocol(format!(
                "AES block length {} not a multiple of 16",
                data.len()
            )));
        }

        let key = GenericArray::from_slice(&self.key);
        let iv = GenericArray::from_slice(&[0u8; 16]);

        match self.direction {
            Direction::Encrypt => {
                let mut cipher = cbc::Encryptor::<Aes128>::new(key, iv);
                for block in data.chunks_exact_mut(16) {
                    cipher.encrypt_block_mut(GenericArray::from_mut_slice(block));
                }
            }
            Direction::Decrypt => {
                let mut cipher = cbc::Decryptor::<Aes128>::new(key, iv);
                for block in data.chunks_exact_mut(16) {
                    cipher.decrypt_block_mut(GenericArray::from_mut_slice(block));
                }
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for AesEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Key material stays out of logs.
        f.debug_struct("AesEngine")
            .field("direction", &self.direction)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_symmetric_roundtrip() {
        let plaintext: Vec<u8> = (0u8..64).collect();
        let mut data = plaintext.clone();

        AesEngine::symmetric(Direction::Encrypt)
            .process(&mut data)
            .expect("encrypt");
        assert_ne!(data, plaintext);

        AesEngine::symmetric(Direction::Decrypt)
            .process(&mut data)
            .expect("decrypt");
        assert_eq!(data, plaintext);
    }

    #[test]
    fn test_per_direction_keys() {
        let dkey = [0x11u8; KEY_SIZE];
        let ekey = [0x22u8; KEY_SIZE];

        let mut data = [0u8; 32];
        AesEngine::new(&ekey, Direction::Encrypt)
            .process(&mut data)
            .expect("encrypt");

        // Decrypting with the wrong key does not restore the plaintext.
        let mut wrong = data;
        AesEngine::new(&dkey, Direction::Decrypt)
            .process(&mut wrong)
            .expect("decrypt");
        assert_ne!(wrong, [0u8; 32]);

        AesEngine::new(&ekey, Direction::Decrypt)
            .process(&mut data)
            .expect("decrypt");
        assert_eq!(data, [0u8; 32]);
    }

    #[test]
    fn test_rejects_partial_block() {
        let mut data = [0u8; 15];
        let engine = AesEngine::symmetric(Direction::Encrypt);
        assert!(engine.process(&mut data).is_err());
    }

    #[test]
    fn test_fresh_iv_per_call() {
        // Two identical datagrams encrypt identically: no chaining between
        // calls, the IV restarts at zero.
        let mut a = [0x5Au8; 16];
        let mut b = [0x5Au8; 16];
        let engine = AesEngine::symmetric(Direction::Encrypt);
        engine.process(&mut a).expect("encrypt a");
        engine.process(&mut b).expect("encrypt b");
        assert_eq!(a, b);
    }
}
