//! Trade state machine (C3): a deterministic, total function from
//! `(state, envelope)` to a new state or a rejection.

mod terms;

pub use terms::TermsSnapshot;

use crate::envelope::canonical::hash_hex;
use crate::envelope::{Envelope, EnvelopeBody, EnvelopeKind};
use crate::error::{EngineError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// The trade's coarse lifecycle state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum State {
    New,
    Terms,
    Accepted,
    Invoice,
    Escrow,
    Claimed,
    Refunded,
    Canceled,
}

impl State {
    pub fn is_terminal(&self) -> bool {
        matches!(self, State::Claimed | State::Refunded | State::Canceled)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LnInvoiceInfo {
    pub bolt11: String,
    pub payment_hash_hex: String,
    pub amount_msat: u64,
    pub expires_at_unix: i64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SolEscrowInfo {
    pub program_id: String,
    pub escrow_pda: String,
    pub vault_ata: String,
    pub mint: String,
    pub amount: u64,
    pub payment_hash: String,
    pub refund_after_unix: i64,
    pub recipient: String,
    pub refund: String,
    pub tx_sig: String,
}

/// Per-trade record. Constructed with [`initial`] and advanced with
/// [`apply`]; both are pure functions, matching the spec's functional
/// signature for the state machine.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TradeState {
    pub trade_id: String,
    pub state: State,
    pub terms: Option<TermsSnapshot>,
    /// Canonical hash of the applied TERMS envelope, needed to validate a
    /// later ACCEPT's `terms_hash` reference.
    terms_envelope_hash: Option<String>,
    pub ln_invoice: Option<LnInvoiceInfo>,
    pub sol_escrow: Option<SolEscrowInfo>,
    pub ln_paid: bool,
    pub claim_tx_sig: Option<String>,
    pub refund_tx_sig: Option<String>,
    pub last_error: Option<String>,
    /// Last applied envelope's canonical hash per kind, for idempotent
    /// replay detection and conflicting-replay rejection.
    applied: HashMap<EnvelopeKind, String>,
}

/// `initial(trade_id) -> TradeState` with `state = NEW`.
pub fn initial(trade_id: impl Into<String>) -> TradeState {
    TradeState {
        trade_id: trade_id.into(),
        state: State::New,
        terms: None,
        terms_envelope_hash: None,
        ln_invoice: None,
        sol_escrow: None,
        ln_paid: false,
        claim_tx_sig: None,
        refund_tx_sig: None,
        last_error: None,
        applied: HashMap::new(),
    }
}

fn envelope_fingerprint(envelope: &Envelope) -> Result<String> {
    hash_hex(&envelope.unsigned())
}

/// `apply(state, envelope) -> {ok, new_state} | {err, reason}`.
///
/// Returns the *new* state on success (the spec's functional signature);
/// callers own replacing their stored `TradeState` with the result.
/// Idempotent replay of the most recently applied envelope of a kind is a
/// no-op that returns the state unchanged; a *different* envelope of an
/// already-applied kind is `conflicting_replay`; anything not named in the
/// transition table is `wrong_state`.
pub fn apply(state: &TradeState, envelope: &Envelope) -> Result<TradeState> {
    if envelope.trade_id != state.trade_id {
        return Err(EngineError::Internal(
            "apply called with mismatched trade_id".into(),
        ));
    }
    if state.state.is_terminal() {
        // Once terminal, no further transitions, but a byte-identical
        // replay of the envelope that made it terminal is still a no-op.
        let fp = envelope_fingerprint(envelope)?;
        if state.applied.get(&envelope.kind()) == Some(&fp) {
            return Ok(state.clone());
        }
        return Err(EngineError::WrongState);
    }

    let kind = envelope.kind();
    let fp = envelope_fingerprint(envelope)?;
    // `Status` is special: the ESCROW state legitimately accepts a sequence
    // of distinct STATUS bodies (ln_paid, then claimed or refunded), so a
    // kind-level "already saw this kind" guard would make the second and
    // third unreachable. Dedup it only against byte-identical replay; any
    // other STATUS is left to the transition match below, which rejects
    // bodies that don't name a valid next step.
    if kind == EnvelopeKind::Status {
        if state.applied.get(&kind) == Some(&fp) {
            return Ok(state.clone());
        }
    } else if let Some(prior) = state.applied.get(&kind) {
        if prior == &fp {
            return Ok(state.clone());
        }
        return Err(EngineError::ConflictingReplay);
    }

    let mut next = state.clone();
    match (state.state, &envelope.body) {
        (State::New, EnvelopeBody::Terms { .. }) => {
            next.terms = Some(TermsSnapshot::from_body(&envelope.body)?);
            next.terms_envelope_hash = Some(fp.clone());
            next.state = State::Terms;
        }
        (State::Terms, EnvelopeBody::Accept { terms_hash }) => {
            let expected = next
                .terms_envelope_hash
                .as_ref()
                .ok_or_else(|| EngineError::Internal("terms applied without recorded hash".into()))?;
            if terms_hash != expected {
                return Err(EngineError::WrongState);
            }
            next.state = State::Accepted;
        }
        (State::Accepted, EnvelopeBody::LnInvoice { bolt11, payment_hash_hex, amount_msat, expires_at_unix }) => {
            next.ln_invoice = Some(LnInvoiceInfo {
                bolt11: bolt11.clone(),
                payment_hash_hex: payment_hash_hex.clone(),
                amount_msat: *amount_msat,
                expires_at_unix: *expires_at_unix,
            });
            next.state = State::Invoice;
        }
        (
            State::Invoice,
            EnvelopeBody::SolEscrowCreated {
                program_id,
                escrow_pda,
                vault_ata,
                mint,
                amount,
                payment_hash,
                refund_after_unix,
                recipient,
                refund,
                tx_sig,
            },
        ) => {
            let invoice = next
                .ln_invoice
                .as_ref()
                .ok_or_else(|| EngineError::Internal("INVOICE state without ln_invoice".into()))?;
            if &invoice.payment_hash_hex != payment_hash {
                return Err(EngineError::EscrowMismatch(
                    "escrow payment_hash does not match invoice".into(),
                ));
            }
            if let Some(terms) = &next.terms {
                if terms.usdt_amount_u64()? != *amount {
                    return Err(EngineError::EscrowMismatch(
                        "escrow amount does not match terms.usdt_amount".into(),
                    ));
                }
            }
            next.sol_escrow = Some(SolEscrowInfo {
                program_id: program_id.clone(),
                escrow_pda: escrow_pda.clone(),
                vault_ata: vault_ata.clone(),
                mint: mint.clone(),
                amount: *amount,
                payment_hash: payment_hash.clone(),
                refund_after_unix: *refund_after_unix,
                recipient: recipient.clone(),
                refund: refund.clone(),
                tx_sig: tx_sig.clone(),
            });
            next.state = State::Escrow;
        }
        (State::Escrow, EnvelopeBody::Status { ln_paid, claimed, refunded, tx_sig }) => {
            match (ln_paid, claimed, refunded) {
                (Some(true), None, None) => {
                    next.ln_paid = true;
                }
                (_, Some(true), _) => {
                    next.claim_tx_sig = tx_sig.clone();
                    next.state = State::Claimed;
                }
                (_, _, Some(true)) => {
                    next.refund_tx_sig = tx_sig.clone();
                    next.state = State::Refunded;
                }
                _ => return Err(EngineError::WrongState),
            }
        }
        (State::New, EnvelopeBody::Cancel { .. })
        | (State::Terms, EnvelopeBody::Cancel { .. })
        | (State::Accepted, EnvelopeBody::Cancel { .. }) => {
            next.state = State::Canceled;
        }
        _ => return Err(EngineError::WrongState),
    }

    next.applied.insert(kind, fp);
    Ok(next)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::sign::sign_and_attach;
    use crate::envelope::{Direction, UnsignedEnvelope};
    use ed25519_dalek::SigningKey;
    use rand::rngs::OsRng;

    fn sk() -> SigningKey {
        SigningKey::generate(&mut OsRng)
    }

    fn terms_body() -> EnvelopeBody {
        EnvelopeBody::Terms {
            pair: "BTC/USDT".into(),
            direction: Direction::MakerSellsBtc,
            app_hash: "a".repeat(64),
            btc_sats: 10_000,
            usdt_amount: "1000000".into(),
            usdt_decimals: 6,
            sol_mint: "Es9vMFrzaCERz...".into(),
            sol_recipient: "recipient".into(),
            sol_refund: "refund".into(),
            sol_refund_after_unix: 2_000_000_000,
            platform_fee_bps: 50,
            platform_fee_collector: "platform".into(),
            trade_fee_bps: 50,
            trade_fee_collector: "trade".into(),
            ln_receiver_peer: "maker".into(),
            ln_payer_peer: "taker".into(),
            terms_valid_until_unix: 2_000_000_000,
        }
    }

    fn env(trade_id: &str, ts: i64, nonce: &str, body: EnvelopeBody, signer: &SigningKey) -> Envelope {
        sign_and_attach(
            UnsignedEnvelope {
                v: 1,
                trade_id: trade_id.into(),
                ts,
                nonce: nonce.into(),
                body,
            },
            signer,
        )
        .unwrap()
    }

    #[test]
    fn happy_path_transitions() {
        let maker = sk();
        let taker = sk();
        let s0 = initial("t1");

        let terms_env = env("t1", 1_700_000_000_000, "n1", terms_body(), &maker);
        let s1 = apply(&s0, &terms_env).unwrap();
        assert_eq!(s1.state, State::Terms);

        let terms_hash = hash_hex(&terms_env.unsigned()).unwrap();
        let accept_env = env(
            "t1",
            1_700_000_001_000,
            "n2",
            EnvelopeBody::Accept { terms_hash },
            &taker,
        );
        let s2 = apply(&s1, &accept_env).unwrap();
        assert_eq!(s2.state, State::Accepted);

        let invoice_env = env(
            "t1",
            1_700_000_002_000,
            "n3",
            EnvelopeBody::LnInvoice {
                bolt11: "lnbc1...".into(),
                payment_hash_hex: "b".repeat(64),
                amount_msat: 10_000_000,
                expires_at_unix: 2_000_000_000,
            },
            &maker,
        );
        let s3 = apply(&s2, &invoice_env).unwrap();
        assert_eq!(s3.state, State::Invoice);

        let escrow_env = env(
            "t1",
            1_700_000_003_000,
            "n4",
            EnvelopeBody::SolEscrowCreated {
                program_id: "prog".into(),
                escrow_pda: "pda".into(),
                vault_ata: "vault".into(),
                mint: "mint".into(),
                amount: 1_000_000,
                payment_hash: "b".repeat(64),
                refund_after_unix: 2_000_000_000,
                recipient: "recipient".into(),
                refund: "refund".into(),
                tx_sig: "sig1".into(),
            },
            &maker,
        );
        let s4 = apply(&s3, &escrow_env).unwrap();
        assert_eq!(s4.state, State::Escrow);

        let claimed_env = env(
            "t1",
            1_700_000_004_000,
            "n5",
            EnvelopeBody::Status {
                ln_paid: None,
                claimed: Some(true),
                refunded: None,
                tx_sig: Some("claim_sig".into()),
            },
            &taker,
        );
        let s5 = apply(&s4, &claimed_env).unwrap();
        assert_eq!(s5.state, State::Claimed);
        assert_eq!(s5.claim_tx_sig.as_deref(), Some("claim_sig"));

        // terminal: further transitions rejected
        let cancel_env = env("t1", 1_700_000_005_000, "n6", EnvelopeBody::Cancel { reason: None }, &maker);
        assert!(matches!(apply(&s5, &cancel_env), Err(EngineError::WrongState)));
    }

    #[test]
    fn ln_paid_status_does_not_block_claimed_status() {
        let maker = sk();
        let taker = sk();
        let s0 = initial("t5");
        let terms_env = env("t5", 1_700_000_000_000, "n1", terms_body(), &maker);
        let s1 = apply(&s0, &terms_env).unwrap();
        let terms_hash = hash_hex(&terms_env.unsigned()).unwrap();
        let accept_env = env("t5", 1_700_000_001_000, "n2", EnvelopeBody::Accept { terms_hash }, &taker);
        let s2 = apply(&s1, &accept_env).unwrap();
        let invoice_env = env(
            "t5",
            1_700_000_002_000,
            "n3",
            EnvelopeBody::LnInvoice {
                bolt11: "lnbc1...".into(),
                payment_hash_hex: "d".repeat(64),
                amount_msat: 1,
                expires_at_unix: 2_000_000_000,
            },
            &maker,
        );
        let s3 = apply(&s2, &invoice_env).unwrap();
        let escrow_env = env(
            "t5",
            1_700_000_003_000,
            "n4",
            EnvelopeBody::SolEscrowCreated {
                program_id: "prog".into(),
                escrow_pda: "pda".into(),
                vault_ata: "vault".into(),
                mint: "mint".into(),
                amount: 1_000_000,
                payment_hash: "d".repeat(64),
                refund_after_unix: 2_000_000_000,
                recipient: "recipient".into(),
                refund: "refund".into(),
                tx_sig: "sig1".into(),
            },
            &maker,
        );
        let s4 = apply(&s3, &escrow_env).unwrap();
        assert_eq!(s4.state, State::Escrow);

        let ln_paid_env = env(
            "t5",
            1_700_000_004_000,
            "n5",
            EnvelopeBody::Status {
                ln_paid: Some(true),
                claimed: None,
                refunded: None,
                tx_sig: None,
            },
            &taker,
        );
        let s5 = apply(&s4, &ln_paid_env).unwrap();
        assert_eq!(s5.state, State::Escrow);
        assert!(s5.ln_paid);

        // a distinct STATUS{claimed} must still apply after ln_paid flipped,
        // not be rejected as a conflicting replay of the Status kind.
        let claimed_env = env(
            "t5",
            1_700_000_005_000,
            "n6",
            EnvelopeBody::Status {
                ln_paid: None,
                claimed: Some(true),
                refunded: None,
                tx_sig: Some("claim_sig".into()),
            },
            &taker,
        );
        let s6 = apply(&s5, &claimed_env).unwrap();
        assert_eq!(s6.state, State::Claimed);
        assert_eq!(s6.claim_tx_sig.as_deref(), Some("claim_sig"));

        // exact replay of the ln_paid STATUS while still in ESCROW is an
        // idempotent no-op, not a conflicting replay.
        let s5_again = apply(&s4, &ln_paid_env).unwrap();
        assert_eq!(s5_again.state, State::Escrow);
    }

    #[test]
    fn replay_is_idempotent_and_conflict_is_rejected() {
        let maker = sk();
        let s0 = initial("t2");
        let terms_env = env("t2", 1_700_000_000_000, "n1", terms_body(), &maker);
        let s1 = apply(&s0, &terms_env).unwrap();
        let s1_again = apply(&s1, &terms_env).unwrap();
        assert_eq!(s1.state, s1_again.state);
        assert_eq!(s1.terms, s1_again.terms);

        let mut different_body = terms_body();
        if let EnvelopeBody::Terms { btc_sats, .. } = &mut different_body {
            *btc_sats = 99;
        }
        let other_terms_env = env("t2", 1_700_000_000_500, "n1b", different_body, &maker);
        assert!(matches!(
            apply(&s1, &other_terms_env),
            Err(EngineError::ConflictingReplay)
        ));
    }

    #[test]
    fn out_of_order_future_envelope_rejected() {
        let maker = sk();
        let s0 = initial("t3");
        let status_env = env(
            "t3",
            1_700_000_000_000,
            "n1",
            EnvelopeBody::Status {
                ln_paid: Some(true),
                claimed: None,
                refunded: None,
                tx_sig: None,
            },
            &maker,
        );
        assert!(matches!(apply(&s0, &status_env), Err(EngineError::WrongState)));
    }

    #[test]
    fn cancel_rejected_post_escrow() {
        let maker = sk();
        let taker = sk();
        let s0 = initial("t4");
        let terms_env = env("t4", 1_700_000_000_000, "n1", terms_body(), &maker);
        let s1 = apply(&s0, &terms_env).unwrap();
        let terms_hash = hash_hex(&terms_env.unsigned()).unwrap();
        let accept_env = env("t4", 1_700_000_001_000, "n2", EnvelopeBody::Accept { terms_hash }, &taker);
        let s2 = apply(&s1, &accept_env).unwrap();
        let invoice_env = env(
            "t4",
            1_700_000_002_000,
            "n3",
            EnvelopeBody::LnInvoice {
                bolt11: "lnbc1...".into(),
                payment_hash_hex: "c".repeat(64),
                amount_msat: 1,
                expires_at_unix: 2_000_000_000,
            },
            &maker,
        );
        let s3 = apply(&s2, &invoice_env).unwrap();
        let escrow_env = env(
            "t4",
            1_700_000_003_000,
            "n4",
            EnvelopeBody::SolEscrowCreated {
                program_id: "prog".into(),
                escrow_pda: "pda".into(),
                vault_ata: "vault".into(),
                mint: "mint".into(),
                amount: 1_000_000,
                payment_hash: "c".repeat(64),
                refund_after_unix: 2_000_000_000,
                recipient: "recipient".into(),
                refund: "refund".into(),
                tx_sig: "sig1".into(),
            },
            &maker,
        );
        let s4 = apply(&s3, &escrow_env).unwrap();
        let cancel_env = env("t4", 1_700_000_004_000, "n5", EnvelopeBody::Cancel { reason: None }, &maker);
        assert!(matches!(apply(&s4, &cancel_env), Err(EngineError::WrongState)));
    }
}
