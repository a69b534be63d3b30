//! RFQ-lock table (maker-side, in-memory): serializes concurrent
//! acceptances on the same RFQ and enables idempotent quote re-emission.

use crate::envelope::{Direction, Envelope, EnvelopeBody};

/// Canonical key identifying "the same RFQ" for locking purposes.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct RfqLockKey {
    pub signer: String,
    pub trade_id: String,
    pub pair: String,
    pub direction_tag: u8,
    pub btc_sats: u64,
    pub usdt_amount: String,
    pub max_platform_fee_bps: u16,
    pub max_trade_fee_bps: u16,
    pub max_total_fee_bps: u16,
    pub min_sol_refund_window_sec: u64,
    pub max_sol_refund_window_sec: u64,
    pub sol_recipient: Option<String>,
    pub sol_mint: String,
    pub app_hash: String,
}

impl RfqLockKey {
    pub fn from_rfq(envelope: &Envelope) -> Option<Self> {
        match &envelope.body {
            EnvelopeBody::Rfq {
                pair,
                direction,
                app_hash,
                btc_sats,
                usdt_amount,
                sol_mint,
                sol_recipient,
                max_platform_fee_bps,
                max_trade_fee_bps,
                max_total_fee_bps,
                min_sol_refund_window_sec,
                max_sol_refund_window_sec,
                ..
            } => Some(RfqLockKey {
                signer: envelope.signer.clone(),
                trade_id: envelope.trade_id.clone(),
                pair: pair.clone(),
                direction_tag: match direction {
                    Direction::MakerSellsBtc => 0,
                    Direction::MakerSellsSpl => 1,
                },
                btc_sats: *btc_sats,
                usdt_amount: usdt_amount.clone(),
                max_platform_fee_bps: *max_platform_fee_bps,
                max_trade_fee_bps: *max_trade_fee_bps,
                max_total_fee_bps: *max_total_fee_bps,
                min_sol_refund_window_sec: *min_sol_refund_window_sec,
                max_sol_refund_window_sec: *max_sol_refund_window_sec,
                sol_recipient: sol_recipient.clone(),
                sol_mint: sol_mint.clone(),
                app_hash: app_hash.clone(),
            }),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LockState {
    Quoted,
    Accepting,
    Swapping,
}

#[derive(Clone, Debug)]
pub struct RfqLock {
    pub state: LockState,
    pub signed_quote: Envelope,
    pub quote_valid_until_unix: i64,
    pub swap_channel: Option<String>,
    pub invitee_pubkey: Option<String>,
    pub lock_deadline_ms: i64,
    pub created_at_ms: i64,
    pub last_seen_ms: i64,
    /// Stored for idempotent resend on a `QUOTE_ACCEPT` retry once the
    /// swap has already started.
    pub swap_invite_envelope: Option<Envelope>,
    pub terms_envelope: Option<Envelope>,
}

impl RfqLock {
    pub fn quoted(signed_quote: Envelope, quote_valid_until_unix: i64, now_ms: i64) -> Self {
        RfqLock {
            state: LockState::Quoted,
            signed_quote,
            quote_valid_until_unix,
            swap_channel: None,
            invitee_pubkey: None,
            lock_deadline_ms: now_ms,
            created_at_ms: now_ms,
            last_seen_ms: now_ms,
            swap_invite_envelope: None,
            terms_envelope: None,
        }
    }
}
