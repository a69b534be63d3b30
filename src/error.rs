//! Crate-wide error model.
//!
//! Variants map one-to-one onto the error kinds named in the protocol
//! specification; the `#[from]` leaves cover ambient I/O and RPC failures
//! that the spec treats as `chain_submit_failed` / `chain_timeout` /
//! `transport_unavailable` at the call site.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("signature invalid")]
    SignatureInvalid,

    #[error("schema invalid: {0}")]
    SchemaInvalid(String),

    #[error("wrong state: expected transition not valid from current state")]
    WrongState,

    #[error("conflicting replay: a different envelope of this kind was already applied")]
    ConflictingReplay,

    #[error("envelope expired")]
    ExpiredEnvelope,

    #[error("fee cap exceeded")]
    FeeCapExceeded,

    #[error("refund window violation")]
    RefundWindowViolation,

    #[error("on-chain escrow state does not match claimed terms: {0}")]
    EscrowMismatch(String),

    #[error("lightning payment failed: {0}")]
    LnPayFailed(String),

    #[error("lightning invoice creation failed: {0}")]
    LnInvoiceFailed(String),

    #[error("on-chain transaction submission failed: {0}")]
    ChainSubmitFailed(String),

    #[error("on-chain RPC timed out")]
    ChainTimeout,

    #[error("transport unavailable: {0}")]
    TransportUnavailable(String),

    #[error("invite expired")]
    InviteExpired,

    #[error("waiting-terms timed out")]
    WaitingTermsTimeout,

    #[error("swap timed out")]
    SwapTimeout,

    #[error("internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Serde(#[from] serde_json::Error),

    #[error(transparent)]
    Sled(#[from] sled::Error),
}

impl EngineError {
    /// Error kinds that must never change state or propagate past the call
    /// site that produced them (spec.md §7: local-drop kinds).
    pub fn is_local_drop(&self) -> bool {
        matches!(
            self,
            EngineError::SignatureInvalid
                | EngineError::SchemaInvalid(_)
                | EngineError::WrongState
                | EngineError::ConflictingReplay
                | EngineError::ExpiredEnvelope
                | EngineError::InviteExpired
        )
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
