//! Single-use registration and password-reset tokens.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use rand::{rngs::OsRng, RngCore};
use time::{Duration, OffsetDateTime};

const TOKEN_BYTES: usize = 32;

pub fn generate() -> String {
    let mut buf = [0u8; TOKEN_BYTES];
    OsRng.fill_bytes(&mut buf);
    URL_SAFE_NO_PAD.encode(buf)
}

pub fn expiry_after(now: OffsetDateTime, ttl: Duration) -> OffsetDateTime {
    now + ttl
}

/// A token is live only while it has an expiry strictly in the future.
pub fn is_live(expires: Option<OffsetDateTime>, now: OffsetDateTime) -> bool {
    matches!(expires, Some(at) if at > now)
}
