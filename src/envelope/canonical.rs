//! Canonical encoding and hashing of unsigned envelopes.
//!
//! The canonical form is RFC 8785 JSON Canonicalization over the envelope's
//! serde representation: sorted object keys, no insignificant whitespace,
//! fixed number formatting. Only declared fields participate — an
//! `EnvelopeBody` variant with unknown extra data cannot exist because the
//! type itself is a closed `serde(tag = "kind")` enum, so there is nothing
//! for an attacker to smuggle past the hash.

use super::UnsignedEnvelope;
use crate::error::{EngineError, Result};
use serde::Serialize;
use sha2::{Digest, Sha256};

/// Canonical UTF-8 bytes of any serializable value, the same RFC 8785
/// encoding used for envelopes. Shared with invite payloads, which are
/// signed independently of any envelope.
pub fn canonical_bytes_of<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    let value = serde_json::to_value(value)?;
    serde_jcs::to_string(&value)
        .map(|s| s.into_bytes())
        .map_err(|e| EngineError::Internal(format!("canonicalization failed: {e}")))
}

/// Canonical UTF-8 bytes of an unsigned envelope.
pub fn canonical_bytes(unsigned: &UnsignedEnvelope) -> Result<Vec<u8>> {
    canonical_bytes_of(unsigned)
}

/// `hash(unsigned)`: a 32-byte digest of the canonical encoding.
pub fn hash(unsigned: &UnsignedEnvelope) -> Result<[u8; 32]> {
    let bytes = canonical_bytes(unsigned)?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    Ok(hasher.finalize().into())
}

/// `hash(unsigned)` rendered as lowercase hex, the form used to reference a
/// prior envelope (`rfq_id`, `quote_id`, `terms_hash`).
pub fn hash_hex(unsigned: &UnsignedEnvelope) -> Result<String> {
    Ok(hex::encode(hash(unsigned)?))
}
