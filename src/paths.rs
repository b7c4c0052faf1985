//! URL-safe encodings shared by the Store's HTTP surface and the client library.
//!
//! Carried over from the teacher's `paths.rs`, trimmed to just the cookie codec: the
//! teacher's hand-rolled `StorePath` route-segment parser is replaced by axum's typed
//! path extractors in `store::routes`.

use crate::types::Cookie;
use base64::Engine;
use std::mem::size_of;

const COOKIE_SIZE: usize = size_of::<Cookie>();

/// A validated, URL-safe-base64-decodable cookie value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CookieBuf(Cookie);

impl CookieBuf {
    pub fn generate() -> CookieBuf {
        use rand::RngCore;
        let mut buf = [0u8; COOKIE_SIZE];
        rand::thread_rng().fill_bytes(&mut buf);
        CookieBuf(buf)
    }

    pub fn from_bytes(data: Cookie) -> CookieBuf {
        CookieBuf(data)
    }

    pub fn data(&self) -> &Cookie {
        &self.0
    }
}

impl std::fmt::Display for CookieBuf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", serialize_urlbase64(&self.0))
    }
}

impl std::str::FromStr for CookieBuf {
    type Err = base64::DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let buf = parse_urlbase64(s)?;
        if buf.len() != COOKIE_SIZE {
            return Err(base64::DecodeError::InvalidLength);
        }
        let mut out = [0u8; COOKIE_SIZE];
        out.copy_from_slice(&buf);
        Ok(CookieBuf(out))
    }
}

pub fn parse_urlbase64(s: &str) -> Result<Vec<u8>, base64::DecodeError> {
    base64::engine::general_purpose::URL_SAFE_NO_PAD.decode(s)
}

pub fn serialize_urlbase64(data: &[u8]) -> String {
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(data)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cookie_round_trips_through_its_string_form() {
        let cookie = CookieBuf::generate();
        let s = cookie.to_string();
        let parsed: CookieBuf = s.parse().unwrap();
        assert_eq!(cookie, parsed);
    }

    #[test]
    fn rejects_wrong_length() {
        let s = serialize_urlbase64(&[1, 2, 3]);
        assert!(s.parse::<CookieBuf>().is_err());
    }
}
