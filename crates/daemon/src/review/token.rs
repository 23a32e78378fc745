//! Opaque client-held encoding of a [`ReviewSession`].
//!
//! The token is URL-safe base64 over a JSON payload. Decoding is lenient by
//! contract: anything unreadable or from another payload version yields
//! `None` and the caller starts over with a fresh session.

use engine::session::SESSION_VERSION;
use engine::ReviewSession;

pub fn encode(session: &ReviewSession) -> String {
    // Serialising a plain struct of integers cannot fail.
    let json = serde_json::to_vec(session).unwrap_or_default();
    base64::encode_config(json, base64::URL_SAFE_NO_PAD)
}

pub fn decode(token: &str) -> Option<ReviewSession> {
    let token = token.trim();
    if token.is_empty() {
        return None;
    }
    let bytes = base64::decode_config(token, base64::URL_SAFE_NO_PAD).ok()?;
    let session: ReviewSession = serde_json::from_slice(&bytes).ok()?;
    (session.version == SESSION_VERSION).then_some(session)
}
