use std::fmt;
use std::hash::{Hash, Hasher};

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use rand::RngCore;

use crate::clock;

/// Version character of the identifier wire format.
const VERSION: char = '0';

/// Number of random bytes in the identifier payload.
///
/// 24 bytes encode to exactly 32 base64 characters without padding.
const PAYLOAD_BYTES: usize = 24;

/// Session / party identifier.
///
/// The wire form is `version:timestamp:payload`, where the timestamp is the
/// generation time in base-36 milliseconds since epoch and the payload is
/// 24 bytes of randomness in URL-safe unpadded base64. Sorting the wire
/// form groups identifiers by version and then by time.
///
/// Equality and hashing are defined on the wire form, so an identifier
/// survives a round trip through `try_parse` unchanged.
#[derive(Debug, Clone)]
pub struct EventId {
    /// Canonical wire form.
    pub value: String,

    /// Format version, currently always `'0'`.
    pub version: char,

    /// Milliseconds since epoch at generation time.
    pub timestamp: u64,
}

impl EventId {
    /// Generate a fresh identifier stamped with the current time.
    pub fn generate() -> Self {
        Self::generate_at(clock::system_now_ms())
    }

    /// Generate a fresh identifier with a caller-supplied timestamp.
    pub fn generate_at(timestamp: u64) -> Self {
        let mut payload = [0u8; PAYLOAD_BYTES];
        rand::rng().fill_bytes(&mut payload);

        let value = format!(
            "{}:{}:{}",
            VERSION,
            to_base36(timestamp),
            URL_SAFE_NO_PAD.encode(payload)
        );

        Self {
            value,
            version: VERSION,
            timestamp,
        }
    }

    /// Parse the wire form. Total: malformed or wrong-version input yields
    /// `None`, never an error.
    pub fn try_parse(s: &str) -> Option<Self> {
        let mut parts = s.splitn(3, ':');

        let version = parts.next()?;
        let timestamp = parts.next()?;
        let payload = parts.next()?;

        if version.len() != 1 || !version.starts_with(VERSION) {
            return None;
        }

        let timestamp = u64::from_str_radix(timestamp, 36).ok()?;

        let decoded = URL_SAFE_NO_PAD.decode(payload).ok()?;
        if decoded.len() != PAYLOAD_BYTES {
            return None;
        }

        Some(Self {
            value: s.to_string(),
            version: VERSION,
            timestamp,
        })
    }
}

impl PartialEq for EventId {
    fn eq(&self, other: &Self) -> bool {
        self.value == other.value
    }
}

impl Eq for EventId {}

impl Hash for EventId {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.value.hash(state);
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.value)
    }
}

/// Unsigned base-36 with lowercase digits, matching the wire form.
fn to_base36(mut n: u64) -> String {
    const DIGITS: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";

    // u64::MAX needs 13 base-36 digits.
    let mut buf = [0u8; 13];
    let mut pos = buf.len();

    loop {
        pos -= 1;
        buf[pos] = DIGITS[(n % 36) as usize];
        n /= 36;

        if n == 0 {
            break;
        }
    }

    String::from_utf8_lossy(&buf[pos..]).into_owned()
}
