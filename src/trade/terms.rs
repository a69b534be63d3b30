//! The immutable, agreed terms snapshot frozen once `TERMS` is applied.

use crate::envelope::{Direction, EnvelopeBody};
use crate::error::{EngineError, Result};
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TermsSnapshot {
    pub pair: String,
    pub direction: Direction,
    pub app_hash: String,
    pub btc_sats: u64,
    pub usdt_amount: String,
    pub usdt_decimals: u8,
    pub sol_mint: String,
    pub sol_recipient: String,
    pub sol_refund: String,
    pub sol_refund_after_unix: i64,
    pub platform_fee_bps: u16,
    pub platform_fee_collector: String,
    pub trade_fee_bps: u16,
    pub trade_fee_collector: String,
    pub ln_receiver_peer: String,
    pub ln_payer_peer: String,
    pub terms_valid_until_unix: i64,
}

impl TermsSnapshot {
    pub fn from_body(body: &EnvelopeBody) -> Result<Self> {
        match body {
            EnvelopeBody::Terms {
                pair,
                direction,
                app_hash,
                btc_sats,
                usdt_amount,
                usdt_decimals,
                sol_mint,
                sol_recipient,
                sol_refund,
                sol_refund_after_unix,
                platform_fee_bps,
                platform_fee_collector,
                trade_fee_bps,
                trade_fee_collector,
                ln_receiver_peer,
                ln_payer_peer,
                terms_valid_until_unix,
            } => Ok(TermsSnapshot {
                pair: pair.clone(),
                direction: *direction,
                app_hash: app_hash.clone(),
                btc_sats: *btc_sats,
                usdt_amount: usdt_amount.clone(),
                usdt_decimals: *usdt_decimals,
                sol_mint: sol_mint.clone(),
                sol_recipient: sol_recipient.clone(),
                sol_refund: sol_refund.clone(),
                sol_refund_after_unix: *sol_refund_after_unix,
                platform_fee_bps: *platform_fee_bps,
                platform_fee_collector: platform_fee_collector.clone(),
                trade_fee_bps: *trade_fee_bps,
                trade_fee_collector: trade_fee_collector.clone(),
                ln_receiver_peer: ln_receiver_peer.clone(),
                ln_payer_peer: ln_payer_peer.clone(),
                terms_valid_until_unix: *terms_valid_until_unix,
            }),
            _ => Err(EngineError::Internal(
                "TermsSnapshot::from_body called on non-Terms body".into(),
            )),
        }
    }

    /// `terms.usdt_amount` parsed as `u64`, the net amount the escrow must
    /// hold.
    pub fn usdt_amount_u64(&self) -> Result<u64> {
        self.usdt_amount
            .parse()
            .map_err(|_| EngineError::SchemaInvalid(format!("bad usdt_amount: {}", self.usdt_amount)))
    }

    pub fn total_fee_bps(&self) -> u32 {
        self.platform_fee_bps as u32 + self.trade_fee_bps as u32
    }
}
