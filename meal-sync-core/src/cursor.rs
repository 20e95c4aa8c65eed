//! Opaque pull cursors.
//!
//! A cursor encodes the last change-feed sequence a client has seen.
//! Clients treat it as an opaque token; the encoding is versioned so
//! the layout can change without breaking stored cursors.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;

use crate::error::SyncError;

const CURSOR_VERSION: &str = "v1";

/// Decoded position in the change feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Cursor {
    /// Last feed sequence the client has acknowledged.
    pub feed_seq: i64,
}

impl Cursor {
    /// The position before any change; a full pull starts here.
    pub fn start() -> Self {
        Cursor { feed_seq: 0 }
    }

    pub fn new(feed_seq: i64) -> Self {
        Cursor { feed_seq }
    }

    /// Encode as an opaque token.
    pub fn encode(&self) -> String {
        URL_SAFE_NO_PAD.encode(format!("{}:{}", CURSOR_VERSION, self.feed_seq))
    }

    /// Decode a client-supplied token. Any malformed or foreign token
    /// is a validation error, never a silent reset.
    pub fn decode(token: &str) -> Result<Self, SyncError> {
        let bytes = URL_SAFE_NO_PAD
            .decode(token)
            .map_err(|_| SyncError::validation("malformed cursor"))?;
        let text =
            String::from_utf8(bytes).map_err(|_| SyncError::validation("malformed cursor"))?;
        let (version, seq) = text
            .split_once(':')
            .ok_or_else(|| SyncError::validation("malformed cursor"))?;
        if version != CURSOR_VERSION {
            return Err(SyncError::validation(format!(
                "unsupported cursor version '{}'",
                version
            )));
        }
        let feed_seq: i64 = seq
            .parse()
            .map_err(|_| SyncError::validation("malformed cursor"))?;
        if feed_seq < 0 {
            return Err(SyncError::validation("malformed cursor"));
        }
        Ok(Cursor { feed_seq })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip() {
        let cursor = Cursor::new(42);
        let token = cursor.encode();
        assert_eq!(Cursor::decode(&token).unwrap(), cursor);
    }

    #[test]
    fn test_start_is_before_everything() {
        assert_eq!(Cursor::start().feed_seq, 0);
        assert!(Cursor::start() < Cursor::new(1));
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(Cursor::decode("not base64 ???").is_err());
        assert!(Cursor::decode(&URL_SAFE_NO_PAD.encode("nocolon")).is_err());
        assert!(Cursor::decode(&URL_SAFE_NO_PAD.encode("v9:17")).is_err());
        assert!(Cursor::decode(&URL_SAFE_NO_PAD.encode("v1:banana")).is_err());
        assert!(Cursor::decode(&URL_SAFE_NO_PAD.encode("v1:-3")).is_err());
    }

    #[test]
    fn test_token_is_opaque() {
        let token = Cursor::new(7).encode();
        assert!(!token.contains('7'));
        assert!(!token.contains(':'));
    }
}
