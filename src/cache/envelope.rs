//! Expiry envelope for stored values.
//!
//! When the store has a TTL, every value is prefixed with the instant it
//! expires: an 8-byte big-endian unsigned millisecond Unix timestamp.  This
//! layout is a storage-format contract; entries written by a running
//! deployment must keep decoding after an upgrade.

/// Width of the expiry prefix in bytes.
pub const EXPIRY_PREFIX_LEN: usize = 8;

/// Outcome of decoding a stored value.
#[derive(Debug, PartialEq, Eq)]
pub enum Decoded<'a> {
    /// The entry has not expired; carries the payload without the prefix.
    Live(&'a [u8]),
    /// The entry's expiry instant is in the past.
    Expired,
    /// The stored bytes are too short to carry an expiry prefix.
    Malformed,
}

/// Prefix `value` with `expires_at_ms`.
pub fn encode(value: &[u8], expires_at_ms: u64) -> Vec<u8> {
    let mut buf = Vec::with_capacity(EXPIRY_PREFIX_LEN + value.len());
    buf.extend_from_slice(&expires_at_ms.to_be_bytes());
    buf.extend_from_slice(value);
    buf
}

/// Split a stored value into its expiry instant and payload.
pub fn split(stored: &[u8]) -> Option<(u64, &[u8])> {
    if stored.len() < EXPIRY_PREFIX_LEN {
        return None;
    }
    let (prefix, payload) = stored.split_at(EXPIRY_PREFIX_LEN);
    let mut raw = [0u8; EXPIRY_PREFIX_LEN];
    raw.copy_from_slice(prefix);
    Some((u64::from_be_bytes(raw), payload))
}

/// Decode a stored value as seen at `now_ms`.
///
/// An entry is live up to and including its expiry instant.
pub fn decode(stored: &[u8], now_ms: u64) -> Decoded<'_> {
    match split(stored) {
        None => Decoded::Malformed,
        Some((expires_at, _)) if now_ms > expires_at => Decoded::Expired,
        Some((_, payload)) => Decoded::Live(payload),
    }
}

/// Current wall-clock time in milliseconds since the Unix epoch.
pub fn now_millis() -> u64 {
    u64::try_from(chrono::Utc::now().timestamp_millis()).unwrap_or(0)
}
