//! Signing and verification of unsigned envelopes (C1).

use super::canonical::{canonical_bytes, canonical_bytes_of};
use super::{Envelope, UnsignedEnvelope};
use crate::error::{EngineError, Result};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use serde::Serialize;

/// `sign(unsigned, sk) -> sig_hex`.
pub fn sign(unsigned: &UnsignedEnvelope, sk: &SigningKey) -> Result<String> {
    let bytes = canonical_bytes(unsigned)?;
    let sig: Signature = sk.sign(&bytes);
    Ok(hex::encode(sig.to_bytes()))
}

/// Sign any canonicalizable payload (e.g. an invite) independent of the
/// envelope machinery, returning the lowercase-hex signature.
pub fn sign_payload<T: Serialize>(value: &T, sk: &SigningKey) -> Result<String> {
    let bytes = canonical_bytes_of(value)?;
    let sig: Signature = sk.sign(&bytes);
    Ok(hex::encode(sig.to_bytes()))
}

/// Verify a signature produced by [`sign_payload`] against a hex-encoded
/// Ed25519 public key.
pub fn verify_payload<T: Serialize>(value: &T, signer_pubhex: &str, sig_hex: &str) -> bool {
    (|| -> Result<bool> {
        let signer_bytes = hex::decode(signer_pubhex)
            .map_err(|e| EngineError::SchemaInvalid(format!("signer not hex: {e}")))?;
        let signer_bytes: [u8; 32] = signer_bytes
            .try_into()
            .map_err(|_| EngineError::SchemaInvalid("signer must be 32 bytes".into()))?;
        let vk = VerifyingKey::from_bytes(&signer_bytes)
            .map_err(|e| EngineError::SchemaInvalid(format!("invalid signer key: {e}")))?;
        let sig_bytes = hex::decode(sig_hex)
            .map_err(|e| EngineError::SchemaInvalid(format!("sig not hex: {e}")))?;
        let sig_bytes: [u8; 64] = sig_bytes
            .try_into()
            .map_err(|_| EngineError::SchemaInvalid("sig must be 64 bytes".into()))?;
        let sig = Signature::from_bytes(&sig_bytes);
        let bytes = canonical_bytes_of(value)?;
        Ok(vk.verify(&bytes, &sig).is_ok())
    })()
    .unwrap_or(false)
}

/// `attach(unsigned, signer_pubhex, sig_hex) -> signed`.
pub fn attach(unsigned: UnsignedEnvelope, signer_pubhex: &str, sig_hex: &str) -> Envelope {
    Envelope {
        v: unsigned.v,
        trade_id: unsigned.trade_id,
        ts: unsigned.ts,
        nonce: unsigned.nonce,
        body: unsigned.body,
        signer: signer_pubhex.to_string(),
        sig: sig_hex.to_string(),
    }
}

/// Convenience: sign and attach in one call, the common path for an engine
/// emitting a fresh envelope.
pub fn sign_and_attach(unsigned: UnsignedEnvelope, sk: &SigningKey) -> Result<Envelope> {
    let pubhex = hex::encode(sk.verifying_key().to_bytes());
    let sig = sign(&unsigned, sk)?;
    Ok(attach(unsigned, &pubhex, &sig))
}

/// `verify(signed) -> bool`: cryptographically checks `sig` against
/// `signer` over the canonical encoding of the unsigned fields.
pub fn verify(signed: &Envelope) -> bool {
    verify_inner(signed).unwrap_or(false)
}

fn verify_inner(signed: &Envelope) -> Result<bool> {
    let signer_bytes = hex::decode(&signed.signer)
        .map_err(|e| EngineError::SchemaInvalid(format!("signer not hex: {e}")))?;
    let signer_bytes: [u8; 32] = signer_bytes
        .try_into()
        .map_err(|_| EngineError::SchemaInvalid("signer must be 32 bytes".into()))?;
    let vk = VerifyingKey::from_bytes(&signer_bytes)
        .map_err(|e| EngineError::SchemaInvalid(format!("invalid signer key: {e}")))?;

    let sig_bytes = hex::decode(&signed.sig)
        .map_err(|e| EngineError::SchemaInvalid(format!("sig not hex: {e}")))?;
    let sig_bytes: [u8; 64] = sig_bytes
        .try_into()
        .map_err(|_| EngineError::SchemaInvalid("sig must be 64 bytes".into()))?;
    let sig = Signature::from_bytes(&sig_bytes);

    let bytes = canonical_bytes(&signed.unsigned())?;
    Ok(vk.verify(&bytes, &sig).is_ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::{EnvelopeBody, UnsignedEnvelope};
    use rand::rngs::OsRng;

    fn sample_unsigned() -> UnsignedEnvelope {
        UnsignedEnvelope {
            v: 1,
            trade_id: "trade-1".into(),
            ts: 1_700_000_000_000,
            nonce: "nonce-1".into(),
            body: EnvelopeBody::Cancel { reason: None },
        }
    }

    #[test]
    fn round_trip_verifies() {
        let sk = SigningKey::generate(&mut OsRng);
        let unsigned = sample_unsigned();
        let pubhex = hex::encode(sk.verifying_key().to_bytes());
        let sig = sign(&unsigned, &sk).unwrap();
        let signed = attach(unsigned, &pubhex, &sig);
        assert!(verify(&signed));
    }

    #[test]
    fn tampering_invalidates_signature() {
        let sk = SigningKey::generate(&mut OsRng);
        let signed = sign_and_attach(sample_unsigned(), &sk).unwrap();
        let mut tampered = signed;
        tampered.ts += 1;
        assert!(!verify(&tampered));
    }

    #[test]
    fn wrong_signer_fails() {
        let sk = SigningKey::generate(&mut OsRng);
        let other = SigningKey::generate(&mut OsRng);
        let unsigned = sample_unsigned();
        let sig = sign(&unsigned, &sk).unwrap();
        let wrong_pub = hex::encode(other.verifying_key().to_bytes());
        let signed = attach(unsigned, &wrong_pub, &sig);
        assert!(!verify(&signed));
    }
}
