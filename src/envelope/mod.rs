//! Signed envelope type, the unit of exchange between peers (C1).
//!
//! An [`Envelope`] is a value object: once constructed via [`attach`] it is
//! immutable. The canonical encoding used for hashing and signing lives in
//! [`canonical`]; key generation, signing and verification live in [`sign`].

pub mod canonical;
pub mod sign;

use serde::{Deserialize, Serialize};
use std::fmt;

/// The closed set of envelope variants carried over the sidechannel.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EnvelopeKind {
    Rfq,
    Quote,
    QuoteAccept,
    SwapInvite,
    Terms,
    Accept,
    LnInvoice,
    SolEscrowCreated,
    Status,
    Cancel,
    SvcAnnounce,
}

impl fmt::Display for EnvelopeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = serde_json::to_value(self).unwrap_or_default();
        write!(f, "{}", s.as_str().unwrap_or("UNKNOWN"))
    }
}

/// Direction of the trade from the maker's perspective.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    /// Maker sells BTC-Lightning, receives Solana SPL.
    MakerSellsBtc,
    /// Maker sells Solana SPL, receives BTC-Lightning.
    MakerSellsSpl,
}

/// The invite payload gating membership in a `swap:{trade_id}` channel.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvitePayload {
    pub invitee_pub_key: String,
    pub inviter_pub_key: String,
    pub expires_at: i64,
}

/// A signed invite: the payload plus the inviter's signature over its
/// canonical encoding.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedInvite {
    pub payload: InvitePayload,
    pub sig: String,
}

/// Variant-specific message bodies, one per [`EnvelopeKind`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EnvelopeBody {
    Rfq {
        pair: String,
        direction: Direction,
        app_hash: String,
        btc_sats: u64,
        usdt_amount: String,
        usdt_decimals: u8,
        sol_mint: String,
        sol_recipient: Option<String>,
        max_platform_fee_bps: u16,
        max_trade_fee_bps: u16,
        max_total_fee_bps: u16,
        min_sol_refund_window_sec: u64,
        max_sol_refund_window_sec: u64,
        valid_until_unix: i64,
    },
    Quote {
        rfq_id: String,
        app_hash: String,
        btc_sats: u64,
        usdt_amount: String,
        usdt_decimals: u8,
        sol_mint: String,
        sol_recipient: String,
        platform_fee_bps: u16,
        trade_fee_bps: u16,
        quote_valid_until_unix: i64,
    },
    QuoteAccept {
        quote_id: String,
    },
    SwapInvite {
        swap_channel: String,
        invite: SignedInvite,
    },
    Terms {
        pair: String,
        direction: Direction,
        app_hash: String,
        btc_sats: u64,
        usdt_amount: String,
        usdt_decimals: u8,
        sol_mint: String,
        sol_recipient: String,
        sol_refund: String,
        sol_refund_after_unix: i64,
        platform_fee_bps: u16,
        platform_fee_collector: String,
        trade_fee_bps: u16,
        trade_fee_collector: String,
        ln_receiver_peer: String,
        ln_payer_peer: String,
        terms_valid_until_unix: i64,
    },
    Accept {
        terms_hash: String,
    },
    LnInvoice {
        bolt11: String,
        payment_hash_hex: String,
        amount_msat: u64,
        expires_at_unix: i64,
    },
    SolEscrowCreated {
        program_id: String,
        escrow_pda: String,
        vault_ata: String,
        mint: String,
        amount: u64,
        payment_hash: String,
        refund_after_unix: i64,
        recipient: String,
        refund: String,
        tx_sig: String,
    },
    Status {
        ln_paid: Option<bool>,
        claimed: Option<bool>,
        refunded: Option<bool>,
        tx_sig: Option<String>,
    },
    Cancel {
        reason: Option<String>,
    },
    SvcAnnounce {
        maker_pub_key: String,
        pairs: Vec<String>,
        rfq_channel: String,
    },
}

impl EnvelopeBody {
    pub fn kind(&self) -> EnvelopeKind {
        match self {
            EnvelopeBody::Rfq { .. } => EnvelopeKind::Rfq,
            EnvelopeBody::Quote { .. } => EnvelopeKind::Quote,
            EnvelopeBody::QuoteAccept { .. } => EnvelopeKind::QuoteAccept,
            EnvelopeBody::SwapInvite { .. } => EnvelopeKind::SwapInvite,
            EnvelopeBody::Terms { .. } => EnvelopeKind::Terms,
            EnvelopeBody::Accept { .. } => EnvelopeKind::Accept,
            EnvelopeBody::LnInvoice { .. } => EnvelopeKind::LnInvoice,
            EnvelopeBody::SolEscrowCreated { .. } => EnvelopeKind::SolEscrowCreated,
            EnvelopeBody::Status { .. } => EnvelopeKind::Status,
            EnvelopeBody::Cancel { .. } => EnvelopeKind::Cancel,
            EnvelopeBody::SvcAnnounce { .. } => EnvelopeKind::SvcAnnounce,
        }
    }
}

/// The unsigned form of an envelope: every field that the signature covers.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct UnsignedEnvelope {
    pub v: u32,
    pub trade_id: String,
    pub ts: i64,
    pub nonce: String,
    pub body: EnvelopeBody,
}

impl UnsignedEnvelope {
    pub fn kind(&self) -> EnvelopeKind {
        self.body.kind()
    }
}

/// A fully signed, immutable envelope.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub v: u32,
    pub trade_id: String,
    pub ts: i64,
    pub nonce: String,
    pub body: EnvelopeBody,
    pub signer: String,
    pub sig: String,
}

impl Envelope {
    pub fn kind(&self) -> EnvelopeKind {
        self.body.kind()
    }

    /// Recover the unsigned form, e.g. to recompute its hash.
    pub fn unsigned(&self) -> UnsignedEnvelope {
        UnsignedEnvelope {
            v: self.v,
            trade_id: self.trade_id.clone(),
            ts: self.ts,
            nonce: self.nonce.clone(),
            body: self.body.clone(),
        }
    }
}
