//! Nostr event model.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// A single tag, stored verbatim as its array of strings.
///
/// The first element names the tag (`e`, `p`, `d`, `t`, ...) and the rest
/// carry its values, so `["t", "news"]` becomes
/// `Tag(vec!["t".into(), "news".into()])`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Tag(pub Vec<String>);

impl Tag {
    /// Tag name, e.g. `t` for `["t", "news"]`.
    pub fn name(&self) -> Option<&str> {
        self.0.first().map(String::as_str)
    }

    /// First value after the name.
    pub fn value(&self) -> Option<&str> {
        self.0.get(1).map(String::as_str)
    }
}

/// Immutable event as received from clients and upstream relays.
///
/// ```json
/// {
///   "id": "<64 hex>",
///   "pubkey": "<64 hex>",
///   "kind": 1,
///   "created_at": 1700000000,
///   "tags": [["t", "news"]],
///   "content": "hello",
///   "sig": "<128 hex>"
/// }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Event {
    /// Content-derived identity (hex of the SHA-256 event hash).
    pub id: String,
    /// Author public key (hex).
    pub pubkey: String,
    pub kind: u32,
    /// Unix timestamp of creation.
    pub created_at: u64,
    pub tags: Vec<Tag>,
    pub content: String,
    /// Schnorr signature over the event hash (hex).
    pub sig: String,
}

impl Event {
    /// Check the field shapes the cache relies on: a 64-hex `id` and
    /// `pubkey`, and a 128-hex `sig`. This does not verify the hash or the
    /// signature.
    pub fn validate_shape(&self) -> Result<()> {
        if !is_hex_of_len(&self.id, 64) {
            return Err(Error::InvalidEvent(format!("malformed id {:?}", self.id)));
        }
        if !is_hex_of_len(&self.pubkey, 64) {
            return Err(Error::InvalidEvent(format!(
                "malformed pubkey {:?}",
                self.pubkey
            )));
        }
        if !is_hex_of_len(&self.sig, 128) {
            return Err(Error::InvalidEvent(format!("malformed sig on {}", self.id)));
        }
        Ok(())
    }

    /// Value of the first `d` tag, used to collapse parameterized-replaceable
    /// events.
    pub fn d_tag(&self) -> Option<&str> {
        self.tags
            .iter()
            .find(|t| t.name() == Some("d"))
            .and_then(Tag::value)
    }
}

pub(crate) fn is_hex_of_len(s: &str, len: usize) -> bool {
    s.len() == len && s.bytes().all(|b| b.is_ascii_hexdigit())
}
