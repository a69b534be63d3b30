//! Shared test doubles for the integration suite: a fake on-chain escrow
//! and a fake Lightning node, both in-memory.

use async_trait::async_trait;
use intercom_swap_core::error::{EngineError, Result};
use intercom_swap_core::escrow::layout::{ConfigAccount, EscrowAccount};
use intercom_swap_core::escrow::{ClaimedEscrow, EscrowClient, EscrowVerification};
use intercom_swap_core::lightning::{DecodedInvoice, LightningClient, LnInvoiceCreated, LnPaymentResult};
use solana_sdk::pubkey::Pubkey;
use solana_sdk::signature::{Keypair, Signature, Signer};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

pub fn now_unix() -> i64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_secs() as i64
}

fn sha256(data: &[u8]) -> [u8; 32] {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum MockEscrowStatus {
    Active,
    Claimed,
    Refunded,
}

struct MockEscrow {
    recipient: Pubkey,
    mint: Pubkey,
    net_amount: u64,
    refund_after_unix: i64,
    status: MockEscrowStatus,
}

/// A fake escrow program: keeps one account per `payment_hash` in memory
/// and enforces the same claimant/preimage/timelock rules the real program
/// would, without talking to any RPC.
#[derive(Default)]
pub struct MockEscrowClient {
    escrows: Mutex<HashMap<[u8; 32], MockEscrow>>,
}

impl MockEscrowClient {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl EscrowClient for MockEscrowClient {
    fn derive_escrow_pda(&self, payment_hash_32: &[u8; 32], _program_id: &Pubkey) -> (Pubkey, u8) {
        (Pubkey::new_from_array(*payment_hash_32), 255)
    }

    fn derive_config_pda(&self, _program_id: &Pubkey) -> (Pubkey, u8) {
        (Pubkey::new_unique(), 255)
    }

    fn derive_vault_ata(&self, escrow_pda: &Pubkey, _mint: &Pubkey) -> Pubkey {
        *escrow_pda
    }

    async fn create_escrow_tx(
        &self,
        _payer: &Keypair,
        _payer_token_account: &Pubkey,
        mint: &Pubkey,
        payment_hash: &[u8; 32],
        recipient: &Pubkey,
        _refund: &Pubkey,
        refund_after_unix: i64,
        net_amount: u64,
        _expected_platform_fee_bps: u16,
        _expected_trade_fee_bps: u16,
        _trade_fee_collector: &Pubkey,
    ) -> Result<(Signature, Pubkey, Pubkey)> {
        let escrow_pda = Pubkey::new_from_array(*payment_hash);
        self.escrows.lock().unwrap().insert(
            *payment_hash,
            MockEscrow {
                recipient: *recipient,
                mint: *mint,
                net_amount,
                refund_after_unix,
                status: MockEscrowStatus::Active,
            },
        );
        Ok((Signature::default(), escrow_pda, escrow_pda))
    }

    async fn claim_escrow_tx(
        &self,
        recipient_signer: &Keypair,
        _recipient_token_account: &Pubkey,
        mint: &Pubkey,
        payment_hash: &[u8; 32],
        preimage: &[u8; 32],
        _trade_fee_collector: &Pubkey,
    ) -> Result<Signature> {
        let mut escrows = self.escrows.lock().unwrap();
        let escrow = escrows
            .get_mut(payment_hash)
            .ok_or_else(|| EngineError::ChainSubmitFailed("no such escrow".into()))?;
        if escrow.status != MockEscrowStatus::Active {
            return Err(EngineError::ChainSubmitFailed("escrow not active".into()));
        }
        if &sha256(preimage) != payment_hash {
            return Err(EngineError::ChainSubmitFailed("preimage does not hash to payment_hash".into()));
        }
        if escrow.recipient != recipient_signer.pubkey() {
            return Err(EngineError::ChainSubmitFailed("signer is not the escrow recipient".into()));
        }
        if &escrow.mint != mint {
            return Err(EngineError::ChainSubmitFailed("mint mismatch".into()));
        }
        escrow.status = MockEscrowStatus::Claimed;
        Ok(Signature::default())
    }

    async fn refund_escrow_tx(
        &self,
        _refund_signer: &Keypair,
        _refund_token_account: &Pubkey,
        mint: &Pubkey,
        payment_hash: &[u8; 32],
    ) -> Result<Signature> {
        let mut escrows = self.escrows.lock().unwrap();
        let escrow = escrows
            .get_mut(payment_hash)
            .ok_or_else(|| EngineError::ChainSubmitFailed("no such escrow".into()))?;
        if escrow.status != MockEscrowStatus::Active {
            return Err(EngineError::ChainSubmitFailed("escrow not active".into()));
        }
        if &escrow.mint != mint {
            return Err(EngineError::ChainSubmitFailed("mint mismatch".into()));
        }
        if now_unix() < escrow.refund_after_unix {
            return Err(EngineError::ChainSubmitFailed("refund_after_unix not yet reached".into()));
        }
        escrow.status = MockEscrowStatus::Refunded;
        Ok(Signature::default())
    }

    async fn get_escrow_state(&self, _payment_hash: &[u8; 32], _program_id: &Pubkey) -> Result<EscrowAccount> {
        Err(EngineError::Internal("get_escrow_state not modeled by the mock".into()))
    }

    async fn get_config_state(&self, _program_id: &Pubkey) -> Result<ConfigAccount> {
        Err(EngineError::Internal("get_config_state not modeled by the mock".into()))
    }

    async fn verify_escrow_on_chain(&self, claim: &ClaimedEscrow<'_>) -> Result<EscrowVerification> {
        let payment_hash_bytes = hex::decode(claim.payment_hash)
            .map_err(|e| EngineError::SchemaInvalid(format!("bad payment_hash: {e}")))?;
        let payment_hash: [u8; 32] = payment_hash_bytes
            .try_into()
            .map_err(|_| EngineError::SchemaInvalid("payment_hash must be 32 bytes".into()))?;
        let escrows = self.escrows.lock().unwrap();
        let Some(escrow) = escrows.get(&payment_hash) else {
            return Ok(EscrowVerification { ok: false, state: None, error: Some("escrow not found".into()) });
        };
        if escrow.status != MockEscrowStatus::Active {
            return Ok(EscrowVerification { ok: false, state: None, error: Some("escrow not active".into()) });
        }
        if escrow.net_amount != claim.net_amount || escrow.refund_after_unix != claim.refund_after_unix {
            return Ok(EscrowVerification { ok: false, state: None, error: Some("terms mismatch".into()) });
        }
        Ok(EscrowVerification { ok: true, state: None, error: None })
    }
}

/// A fake Lightning node: `create_invoice` mints a preimage and remembers
/// it under an opaque invoice id; `pay_invoice` reveals it back.
#[derive(Default)]
pub struct MockLightningClient {
    preimages: Mutex<HashMap<String, [u8; 32]>>,
}

impl MockLightningClient {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LightningClient for MockLightningClient {
    async fn create_invoice(&self, amount_msat: u64, _description: &str, expiry_secs: u32) -> Result<LnInvoiceCreated> {
        let mut preimage = [0u8; 32];
        use rand::RngCore;
        rand::rngs::OsRng.fill_bytes(&mut preimage);
        let payment_hash = sha256(&preimage);
        let bolt11 = format!("lnmock1{}{}", hex::encode(payment_hash), amount_msat);
        self.preimages.lock().unwrap().insert(bolt11.clone(), preimage);
        Ok(LnInvoiceCreated {
            bolt11,
            payment_hash_hex: hex::encode(payment_hash),
            expires_at_unix: now_unix() + expiry_secs as i64,
        })
    }

    async fn pay_invoice(&self, bolt11: &str) -> Result<LnPaymentResult> {
        let preimage = self
            .preimages
            .lock()
            .unwrap()
            .get(bolt11)
            .copied()
            .ok_or_else(|| EngineError::LnPayFailed("unknown invoice".into()))?;
        Ok(LnPaymentResult {
            preimage_hex: hex::encode(preimage),
            payment_hash_hex: hex::encode(sha256(&preimage)),
        })
    }

    fn decode_invoice(&self, _bolt11: &str) -> Result<DecodedInvoice> {
        Err(EngineError::Internal("decode_invoice not modeled by the mock".into()))
    }
}
