//! Lowercase hex rendering of captured buffers.

use std::fmt::Write;

/// Render `bytes` as two lowercase, zero-padded hex digits per byte, in order,
/// with no separators.
pub fn encode(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        // Writing into a String cannot fail.
        let _ = write!(out, "{:02x}", b);
    }
    out
}

/// Inverse of [`encode`]. Accepts either case; returns `None` on odd length
/// or a non-hex digit.
pub fn decode(hex: &str) -> Option<Vec<u8>> {
    let digits = hex.as_bytes();
    if digits.len() % 2 != 0 || !digits.iter().all(u8::is_ascii_hexdigit) {
        return None;
    }
    digits
        .chunks(2)
        .map(|pair| {
            let pair = std::str::from_utf8(pair).ok()?;
            u8::from_str_radix(pair, 16).ok()
        })
        .collect()
}
