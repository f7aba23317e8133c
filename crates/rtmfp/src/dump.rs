// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Hex + ASCII packet dumps for wire-level debugging.
//!
//! Enabled with `ServerConfig::dump` (decrypted requests) or `dump_all`
//! (everything, encrypted included). Output goes through the normal `log`
//! backend at debug level.

/// Log `data` as 16-byte hex rows with an ASCII gutter.
pub fn hex_dump(label: &str, data: &[u8]) {
    log::debug!("[dump] {} ({} bytes)", label, data.len());
    for chunk in data.chunks(16) {
        let hex: String = chunk.iter().map(|b| format!("{:02X} ", b)).collect();
        let ascii: String = chunk
            .iter()
            .map(|&b| if (32..127).contains(&b) { b as char } else { '.' })
            .collect();
        log::debug!("[dump]   {:<48} {}", hex, ascii);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dump_does_not_panic_on_empty_or_odd_sizes() {
        hex_dump("empty", &[]);
        hex_dump("short", &[0x41]);
        hex_dump("row-and-a-half", &(0u8..24).collect::<Vec<_>>());
    }
}
