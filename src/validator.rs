//! Validator (C2): shape, value-range and mutual-coherence checks per
//! envelope kind, independent of trade state.

use crate::envelope::canonical::hash_hex;
use crate::envelope::sign::verify;
use crate::envelope::{Envelope, EnvelopeBody};
use crate::error::{EngineError, Result};

/// Floor below which a refund window is rejected outright, regardless of a
/// caller's configured `min_sol_refund_window_sec`.
pub const MIN_REFUND_WINDOW_FLOOR_SEC: i64 = 30;

fn check_bps(name: &str, bps: u16) -> Result<()> {
    if bps > 10_000 {
        return Err(EngineError::SchemaInvalid(format!(
            "{name} out of range [0, 10000]: {bps}"
        )));
    }
    Ok(())
}

fn check_usdt_amount(amount: &str) -> Result<()> {
    if amount.is_empty() || !amount.bytes().all(|b| b.is_ascii_digit()) {
        return Err(EngineError::SchemaInvalid(format!(
            "usdt_amount is not a non-negative integer string: {amount:?}"
        )));
    }
    Ok(())
}

fn check_refund_after(ts_ms: i64, refund_after_unix: i64) -> Result<()> {
    let now_unix = ts_ms / 1000;
    if refund_after_unix < now_unix + MIN_REFUND_WINDOW_FLOOR_SEC {
        return Err(EngineError::RefundWindowViolation);
    }
    Ok(())
}

/// Validate an envelope's shape, value ranges, signature and (where
/// applicable) coherence against a prior envelope it references. Returns
/// `Ok(())` or the first violated check's `EngineError`.
pub fn validate(envelope: &Envelope) -> Result<()> {
    if !verify(envelope) {
        return Err(EngineError::SignatureInvalid);
    }
    if envelope.trade_id.is_empty() || !envelope.trade_id.is_ascii() {
        return Err(EngineError::SchemaInvalid("trade_id must be non-empty ASCII".into()));
    }

    match &envelope.body {
        EnvelopeBody::Rfq {
            btc_sats,
            usdt_amount,
            max_platform_fee_bps,
            max_trade_fee_bps,
            max_total_fee_bps,
            min_sol_refund_window_sec,
            max_sol_refund_window_sec,
            valid_until_unix,
            ..
        } => {
            if *btc_sats < 1 {
                return Err(EngineError::SchemaInvalid("btc_sats must be >= 1".into()));
            }
            check_usdt_amount(usdt_amount)?;
            check_bps("max_platform_fee_bps", *max_platform_fee_bps)?;
            check_bps("max_trade_fee_bps", *max_trade_fee_bps)?;
            check_bps("max_total_fee_bps", *max_total_fee_bps)?;
            if min_sol_refund_window_sec > max_sol_refund_window_sec {
                return Err(EngineError::SchemaInvalid(
                    "min_sol_refund_window_sec > max_sol_refund_window_sec".into(),
                ));
            }
            if *valid_until_unix <= envelope.ts / 1000 {
                return Err(EngineError::ExpiredEnvelope);
            }
        }
        EnvelopeBody::Quote {
            btc_sats,
            usdt_amount,
            platform_fee_bps,
            trade_fee_bps,
            quote_valid_until_unix,
            ..
        } => {
            if *btc_sats < 1 {
                return Err(EngineError::SchemaInvalid("btc_sats must be >= 1".into()));
            }
            check_usdt_amount(usdt_amount)?;
            check_bps("platform_fee_bps", *platform_fee_bps)?;
            check_bps("trade_fee_bps", *trade_fee_bps)?;
            if *quote_valid_until_unix <= envelope.ts / 1000 {
                return Err(EngineError::ExpiredEnvelope);
            }
        }
        EnvelopeBody::QuoteAccept { quote_id } => {
            if quote_id.len() != 64 || !quote_id.bytes().all(|b| b.is_ascii_hexdigit()) {
                return Err(EngineError::SchemaInvalid("quote_id must be 32-byte hex".into()));
            }
        }
        EnvelopeBody::SwapInvite { invite, .. } => {
            if invite.payload.expires_at <= envelope.ts / 1000 {
                return Err(EngineError::InviteExpired);
            }
        }
        EnvelopeBody::Terms {
            btc_sats,
            usdt_amount,
            platform_fee_bps,
            trade_fee_bps,
            sol_refund_after_unix,
            terms_valid_until_unix,
            ..
        } => {
            if *btc_sats < 1 {
                return Err(EngineError::SchemaInvalid("btc_sats must be >= 1".into()));
            }
            check_usdt_amount(usdt_amount)?;
            check_bps("platform_fee_bps", *platform_fee_bps)?;
            check_bps("trade_fee_bps", *trade_fee_bps)?;
            check_refund_after(envelope.ts, *sol_refund_after_unix)?;
            if *terms_valid_until_unix <= envelope.ts / 1000 {
                return Err(EngineError::ExpiredEnvelope);
            }
        }
        EnvelopeBody::Accept { terms_hash } => {
            if terms_hash.len() != 64 || !terms_hash.bytes().all(|b| b.is_ascii_hexdigit()) {
                return Err(EngineError::SchemaInvalid("terms_hash must be 32-byte hex".into()));
            }
        }
        EnvelopeBody::LnInvoice {
            payment_hash_hex,
            amount_msat,
            expires_at_unix,
            ..
        } => {
            if payment_hash_hex.len() != 64 || !payment_hash_hex.bytes().all(|b| b.is_ascii_hexdigit())
            {
                return Err(EngineError::SchemaInvalid(
                    "payment_hash_hex must be 32-byte hex".into(),
                ));
            }
            if *amount_msat == 0 {
                return Err(EngineError::SchemaInvalid("amount_msat must be > 0".into()));
            }
            if *expires_at_unix <= envelope.ts / 1000 {
                return Err(EngineError::ExpiredEnvelope);
            }
        }
        EnvelopeBody::SolEscrowCreated {
            amount,
            payment_hash,
            refund_after_unix,
            ..
        } => {
            if payment_hash.len() != 64 || !payment_hash.bytes().all(|b| b.is_ascii_hexdigit()) {
                return Err(EngineError::SchemaInvalid("payment_hash must be 32-byte hex".into()));
            }
            if *amount == 0 {
                return Err(EngineError::SchemaInvalid("amount must be > 0".into()));
            }
            check_refund_after(envelope.ts, *refund_after_unix)?;
        }
        EnvelopeBody::Status { .. } | EnvelopeBody::Cancel { .. } | EnvelopeBody::SvcAnnounce { .. } => {}
    }

    Ok(())
}

/// Check that a `QUOTE.body.rfq_id` equals `hash(RFQ_unsigned)`.
pub fn coherent_quote_against_rfq(quote: &Envelope, rfq: &Envelope) -> Result<()> {
    if let EnvelopeBody::Quote { rfq_id, .. } = &quote.body {
        let expected = hash_hex(&rfq.unsigned())?;
        if rfq_id != &expected {
            return Err(EngineError::SchemaInvalid("rfq_id does not match hash(RFQ)".into()));
        }
        Ok(())
    } else {
        Err(EngineError::Internal("coherent_quote_against_rfq called on non-Quote".into()))
    }
}

/// Check that a `QUOTE_ACCEPT.body.quote_id` equals `hash(QUOTE_unsigned)`.
pub fn coherent_accept_against_quote(accept: &Envelope, quote: &Envelope) -> Result<()> {
    if let EnvelopeBody::QuoteAccept { quote_id } = &accept.body {
        let expected = hash_hex(&quote.unsigned())?;
        if quote_id != &expected {
            return Err(EngineError::SchemaInvalid(
                "quote_id does not match hash(QUOTE)".into(),
            ));
        }
        Ok(())
    } else {
        Err(EngineError::Internal(
            "coherent_accept_against_quote called on non-QuoteAccept".into(),
        ))
    }
}

/// Drop an envelope whose `app_hash` does not match this deployment's
/// binding (protocol version + Solana program id), per spec.md §9.
pub fn check_app_hash(body_app_hash: &str, expected_app_hash: &str) -> Result<()> {
    if body_app_hash != expected_app_hash {
        return Err(EngineError::SchemaInvalid("app_hash mismatch".into()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::sign::sign_and_attach;
    use crate::envelope::UnsignedEnvelope;
    use ed25519_dalek::SigningKey;
    use rand::rngs::OsRng;

    fn signed_cancel(trade_id: &str, ts: i64) -> Envelope {
        let sk = SigningKey::generate(&mut OsRng);
        sign_and_attach(
            UnsignedEnvelope {
                v: 1,
                trade_id: trade_id.into(),
                ts,
                nonce: "n1".into(),
                body: EnvelopeBody::Cancel { reason: None },
            },
            &sk,
        )
        .unwrap()
    }

    #[test]
    fn rejects_empty_trade_id() {
        let e = signed_cancel("", 1_700_000_000_000);
        assert!(matches!(validate(&e), Err(EngineError::SchemaInvalid(_))));
    }

    #[test]
    fn accepts_well_formed_cancel() {
        let e = signed_cancel("trade-42", 1_700_000_000_000);
        assert!(validate(&e).is_ok());
    }
}
