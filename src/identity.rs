//! Public-key identities and their NIP-19 `npub` encoding.

use bech32::{Bech32, Hrp};

use crate::{
    error::{Error, Result},
    event::is_hex_of_len,
};

const NPUB_HRP: Hrp = Hrp::parse_unchecked("npub");

/// Encode a 64-hex public key as its canonical `npub1...` form.
pub fn encode_npub(pubkey_hex: &str) -> Result<String> {
    if !is_hex_of_len(pubkey_hex, 64) {
        return Err(Error::Identity(format!(
            "public key must be 64 hex chars, got {:?}",
            pubkey_hex
        )));
    }
    let bytes = hex::decode(pubkey_hex).map_err(|e| Error::Identity(e.to_string()))?;
    bech32::encode::<Bech32>(NPUB_HRP, &bytes).map_err(|e| Error::Identity(e.to_string()))
}

/// Decode an `npub1...` string into the lowercase hex public key.
pub fn decode_npub(npub: &str) -> Result<String> {
    let (hrp, data) = bech32::decode(npub).map_err(|e| Error::Identity(e.to_string()))?;
    if !hrp.to_string().eq_ignore_ascii_case("npub") {
        return Err(Error::Identity(format!("expected npub prefix, got {hrp}")));
    }
    if data.len() != 32 {
        return Err(Error::Identity(format!(
            "npub payload must be 32 bytes, got {}",
            data.len()
        )));
    }
    Ok(hex::encode(data))
}

/// Canonical form of a configured allow-list entry: hex keys are encoded to
/// `npub`, anything else is kept as written.
pub fn canonical_entry(entry: &str) -> String {
    let trimmed = entry.trim();
    match encode_npub(&trimmed.to_ascii_lowercase()) {
        Ok(npub) => npub,
        Err(_) => trimmed.to_string(),
    }
}
