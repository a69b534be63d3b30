//! Escrow client (C4): PDA derivation, transaction construction and
//! on-chain state decoding for the hash-time-locked SPL escrow.

pub mod layout;

use crate::error::{EngineError, Result};
use async_trait::async_trait;
use layout::{
    encode_instruction_data, ClaimArgs, ConfigAccount, EscrowAccount, EscrowStatus, InitArgs,
    InstructionTag, RefundArgs, CONFIG_SEED, ESCROW_SEED,
};
use sha2::{Digest, Sha256};
use solana_client::nonblocking::rpc_client::RpcClient;
use solana_client::rpc_config::RpcSendTransactionConfig;
use solana_sdk::commitment_config::CommitmentConfig;
use solana_sdk::instruction::{AccountMeta, Instruction};
use solana_sdk::pubkey::Pubkey;
use solana_sdk::signature::{Keypair, Signature, Signer};
use solana_sdk::system_program;
use solana_sdk::transaction::Transaction;
use std::str::FromStr;

/// Result of [`EscrowClient::verify_escrow_on_chain`]: the taker-side guard
/// before paying the Lightning invoice.
pub struct EscrowVerification {
    pub ok: bool,
    pub state: Option<EscrowAccount>,
    pub error: Option<String>,
}

/// Parameters the taker asserts match the on-chain escrow, taken from the
/// `SOL_ESCROW_CREATED` envelope and the agreed terms.
pub struct ClaimedEscrow<'a> {
    pub program_id: &'a str,
    pub mint: &'a str,
    pub recipient: &'a str,
    pub refund: &'a str,
    pub payment_hash: &'a str,
    pub refund_after_unix: i64,
    pub net_amount: u64,
}

#[async_trait]
pub trait EscrowClient: Send + Sync {
    fn derive_escrow_pda(&self, payment_hash_32: &[u8; 32], program_id: &Pubkey) -> (Pubkey, u8);
    fn derive_config_pda(&self, program_id: &Pubkey) -> (Pubkey, u8);
    fn derive_vault_ata(&self, escrow_pda: &Pubkey, mint: &Pubkey) -> Pubkey;

    #[allow(clippy::too_many_arguments)]
    async fn create_escrow_tx(
        &self,
        payer: &Keypair,
        payer_token_account: &Pubkey,
        mint: &Pubkey,
        payment_hash: &[u8; 32],
        recipient: &Pubkey,
        refund: &Pubkey,
        refund_after_unix: i64,
        net_amount: u64,
        expected_platform_fee_bps: u16,
        expected_trade_fee_bps: u16,
        trade_fee_collector: &Pubkey,
    ) -> Result<(Signature, Pubkey, Pubkey)>;

    async fn claim_escrow_tx(
        &self,
        recipient_signer: &Keypair,
        recipient_token_account: &Pubkey,
        mint: &Pubkey,
        payment_hash: &[u8; 32],
        preimage: &[u8; 32],
        trade_fee_collector: &Pubkey,
    ) -> Result<Signature>;

    async fn refund_escrow_tx(
        &self,
        refund_signer: &Keypair,
        refund_token_account: &Pubkey,
        mint: &Pubkey,
        payment_hash: &[u8; 32],
    ) -> Result<Signature>;

    async fn get_escrow_state(&self, payment_hash: &[u8; 32], program_id: &Pubkey) -> Result<EscrowAccount>;

    async fn get_config_state(&self, program_id: &Pubkey) -> Result<ConfigAccount>;

    async fn verify_escrow_on_chain(&self, claim: &ClaimedEscrow<'_>) -> Result<EscrowVerification>;
}

/// Default `EscrowClient` backed by the Solana JSON-RPC, bound to a single
/// escrow program deployment (the `app_hash` binding in spec.md §9 fixes
/// the program id for the life of a maker/taker process).
pub struct SolanaEscrowClient {
    rpc: RpcClient,
    program_id: Pubkey,
}

impl SolanaEscrowClient {
    pub fn new(rpc_url: impl Into<String>, program_id: Pubkey) -> Self {
        Self {
            rpc: RpcClient::new_with_commitment(rpc_url.into(), CommitmentConfig::confirmed()),
            program_id,
        }
    }

    pub fn program_id(&self) -> Pubkey {
        self.program_id
    }

    fn total_transfer_amount(net_amount: u64, platform_fee_bps: u16, trade_fee_bps: u16) -> u64 {
        let platform_fee = net_amount.saturating_mul(platform_fee_bps as u64) / 10_000;
        let trade_fee = net_amount.saturating_mul(trade_fee_bps as u64) / 10_000;
        net_amount + platform_fee + trade_fee
    }

    async fn send(&self, ix: Instruction, payer: &Keypair, signers: &[&Keypair]) -> Result<Signature> {
        let recent_blockhash = self
            .rpc
            .get_latest_blockhash()
            .await
            .map_err(|e| EngineError::ChainSubmitFailed(e.to_string()))?;
        let tx = Transaction::new_signed_with_payer(&[ix], Some(&payer.pubkey()), signers, recent_blockhash);
        self.rpc
            .send_and_confirm_transaction_with_spinner_and_config(
                &tx,
                CommitmentConfig::confirmed(),
                RpcSendTransactionConfig::default(),
            )
            .await
            .map_err(|e| EngineError::ChainSubmitFailed(e.to_string()))
    }
}

#[async_trait]
impl EscrowClient for SolanaEscrowClient {
    fn derive_escrow_pda(&self, payment_hash_32: &[u8; 32], program_id: &Pubkey) -> (Pubkey, u8) {
        Pubkey::find_program_address(&[ESCROW_SEED, payment_hash_32], program_id)
    }

    fn derive_config_pda(&self, program_id: &Pubkey) -> (Pubkey, u8) {
        Pubkey::find_program_address(&[CONFIG_SEED], program_id)
    }

    fn derive_vault_ata(&self, escrow_pda: &Pubkey, mint: &Pubkey) -> Pubkey {
        spl_associated_token_account::get_associated_token_address(escrow_pda, mint)
    }

    async fn create_escrow_tx(
        &self,
        payer: &Keypair,
        payer_token_account: &Pubkey,
        mint: &Pubkey,
        payment_hash: &[u8; 32],
        recipient: &Pubkey,
        refund: &Pubkey,
        refund_after_unix: i64,
        net_amount: u64,
        expected_platform_fee_bps: u16,
        expected_trade_fee_bps: u16,
        trade_fee_collector: &Pubkey,
    ) -> Result<(Signature, Pubkey, Pubkey)> {
        let (escrow_pda, _bump) = self.derive_escrow_pda(payment_hash, &self.program_id);
        let vault_ata = self.derive_vault_ata(&escrow_pda, mint);

        let args = InitArgs {
            payment_hash: *payment_hash,
            recipient: recipient.to_bytes(),
            refund: refund.to_bytes(),
            refund_after_unix,
            net_amount,
            expected_platform_fee_bps,
            expected_trade_fee_bps,
            trade_fee_collector: trade_fee_collector.to_bytes(),
        };
        let data = encode_instruction_data(InstructionTag::Init, &args);
        // Transfer amount is enforced on-chain; computed here only so
        // callers can pre-check the payer's token balance before sending.
        let _transfer_amount =
            Self::total_transfer_amount(net_amount, expected_platform_fee_bps, expected_trade_fee_bps);

        let accounts = vec![
            AccountMeta::new(payer.pubkey(), true),
            AccountMeta::new(*payer_token_account, false),
            AccountMeta::new(escrow_pda, false),
            AccountMeta::new(vault_ata, false),
            AccountMeta::new_readonly(*mint, false),
            AccountMeta::new_readonly(spl_token::id(), false),
            AccountMeta::new_readonly(spl_associated_token_account::id(), false),
            AccountMeta::new_readonly(system_program::id(), false),
        ];
        let ix = Instruction {
            program_id: self.program_id,
            accounts,
            data,
        };
        let sig = self.send(ix, payer, &[payer]).await?;
        Ok((sig, escrow_pda, vault_ata))
    }

    async fn claim_escrow_tx(
        &self,
        recipient_signer: &Keypair,
        recipient_token_account: &Pubkey,
        mint: &Pubkey,
        payment_hash: &[u8; 32],
        preimage: &[u8; 32],
        trade_fee_collector: &Pubkey,
    ) -> Result<Signature> {
        let (escrow_pda, _bump) = self.derive_escrow_pda(payment_hash, &self.program_id);
        let vault_ata = self.derive_vault_ata(&escrow_pda, mint);
        let args = ClaimArgs {
            payment_hash: *payment_hash,
            preimage: *preimage,
        };
        let data = encode_instruction_data(InstructionTag::Claim, &args);
        let accounts = vec![
            AccountMeta::new(recipient_signer.pubkey(), true),
            AccountMeta::new(*recipient_token_account, false),
            AccountMeta::new(escrow_pda, false),
            AccountMeta::new(vault_ata, false),
            AccountMeta::new(*trade_fee_collector, false),
            AccountMeta::new_readonly(*mint, false),
            AccountMeta::new_readonly(spl_token::id(), false),
        ];
        let ix = Instruction {
            program_id: self.program_id,
            accounts,
            data,
        };
        self.send(ix, recipient_signer, &[recipient_signer]).await
    }

    async fn refund_escrow_tx(
        &self,
        refund_signer: &Keypair,
        refund_token_account: &Pubkey,
        mint: &Pubkey,
        payment_hash: &[u8; 32],
    ) -> Result<Signature> {
        let (escrow_pda, _bump) = self.derive_escrow_pda(payment_hash, &self.program_id);
        let vault_ata = self.derive_vault_ata(&escrow_pda, mint);
        let args = RefundArgs {
            payment_hash: *payment_hash,
        };
        let data = encode_instruction_data(InstructionTag::Refund, &args);
        let accounts = vec![
            AccountMeta::new(refund_signer.pubkey(), true),
            AccountMeta::new(*refund_token_account, false),
            AccountMeta::new(escrow_pda, false),
            AccountMeta::new(vault_ata, false),
            AccountMeta::new_readonly(*mint, false),
            AccountMeta::new_readonly(spl_token::id(), false),
        ];
        let ix = Instruction {
            program_id: self.program_id,
            accounts,
            data,
        };
        self.send(ix, refund_signer, &[refund_signer]).await
    }

    async fn get_escrow_state(&self, payment_hash: &[u8; 32], program_id: &Pubkey) -> Result<EscrowAccount> {
        let (escrow_pda, _bump) = self.derive_escrow_pda(payment_hash, program_id);
        let account = self
            .rpc
            .get_account(&escrow_pda)
            .await
            .map_err(|e| EngineError::ChainSubmitFailed(e.to_string()))?;
        EscrowAccount::decode(&account.data)
    }

    async fn get_config_state(&self, program_id: &Pubkey) -> Result<ConfigAccount> {
        let (config_pda, _bump) = self.derive_config_pda(program_id);
        let account = self
            .rpc
            .get_account(&config_pda)
            .await
            .map_err(|e| EngineError::ChainSubmitFailed(e.to_string()))?;
        ConfigAccount::decode(&account.data)
    }

    async fn verify_escrow_on_chain(&self, claim: &ClaimedEscrow<'_>) -> Result<EscrowVerification> {
        let program_id = Pubkey::from_str(claim.program_id)
            .map_err(|e| EngineError::SchemaInvalid(format!("bad program_id: {e}")))?;
        let mint = Pubkey::from_str(claim.mint)
            .map_err(|e| EngineError::SchemaInvalid(format!("bad mint: {e}")))?;
        let recipient = Pubkey::from_str(claim.recipient)
            .map_err(|e| EngineError::SchemaInvalid(format!("bad recipient: {e}")))?;
        let refund = Pubkey::from_str(claim.refund)
            .map_err(|e| EngineError::SchemaInvalid(format!("bad refund: {e}")))?;
        let payment_hash_bytes = hex::decode(claim.payment_hash)
            .map_err(|e| EngineError::SchemaInvalid(format!("bad payment_hash: {e}")))?;
        let payment_hash: [u8; 32] = payment_hash_bytes
            .try_into()
            .map_err(|_| EngineError::SchemaInvalid("payment_hash must be 32 bytes".into()))?;

        let (escrow_pda, _bump) = self.derive_escrow_pda(&payment_hash, &program_id);
        let vault_ata = self.derive_vault_ata(&escrow_pda, &mint);

        let state = match self.get_escrow_state(&payment_hash, &program_id).await {
            Ok(s) => s,
            Err(e) => {
                return Ok(EscrowVerification {
                    ok: false,
                    state: None,
                    error: Some(e.to_string()),
                })
            }
        };

        let mut mismatches = Vec::new();
        if program_id != self.program_id {
            mismatches.push("program_id".to_string());
        }
        if state.payment_hash != payment_hash {
            mismatches.push("payment_hash".to_string());
        }
        if state.mint != mint.to_bytes() {
            mismatches.push("mint".to_string());
        }
        if state.recipient != recipient.to_bytes() {
            mismatches.push("recipient".to_string());
        }
        if state.refund != refund.to_bytes() {
            mismatches.push("refund".to_string());
        }
        if state.vault != vault_ata.to_bytes() {
            mismatches.push("vault".to_string());
        }
        if state.refund_after != claim.refund_after_unix {
            mismatches.push("refund_after".to_string());
        }
        if state.net_amount != claim.net_amount {
            mismatches.push("net_amount".to_string());
        }
        if state.status != EscrowStatus::Active {
            mismatches.push("status".to_string());
        }

        let vault_account = self
            .rpc
            .get_token_account_balance(&vault_ata)
            .await
            .map_err(|e| EngineError::ChainSubmitFailed(e.to_string()))?;
        let vault_amount: u64 = vault_account
            .amount
            .parse()
            .map_err(|_| EngineError::Internal("vault balance not numeric".into()))?;
        if vault_amount < state.net_amount + state.fee_amount {
            mismatches.push("vault_balance".to_string());
        }

        if mismatches.is_empty() {
            Ok(EscrowVerification {
                ok: true,
                state: Some(state),
                error: None,
            })
        } else {
            Ok(EscrowVerification {
                ok: false,
                state: Some(state),
                error: Some(format!("mismatched fields: {}", mismatches.join(", "))),
            })
        }
    }
}

/// `sha256(preimage)` as used by the escrow program's `Claim` validity
/// check and by the Lightning HTLC; exposed so callers can pre-check a
/// preimage before submitting `claim_escrow_tx`.
pub fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::layout::*;

    #[test]
    fn escrow_account_round_trip_len() {
        let mut data = vec![2u8, 0u8];
        data.extend_from_slice(&[1u8; 32]); // payment_hash
        data.extend_from_slice(&[2u8; 32]); // recipient
        data.extend_from_slice(&[3u8; 32]); // refund
        data.extend_from_slice(&2_000_000_000i64.to_le_bytes()); // refund_after
        data.extend_from_slice(&[4u8; 32]); // mint
        data.extend_from_slice(&1_000_000u64.to_le_bytes()); // net_amount
        data.extend_from_slice(&10_000u64.to_le_bytes()); // fee_amount
        data.extend_from_slice(&100u16.to_le_bytes()); // fee_bps
        data.extend_from_slice(&[5u8; 32]); // fee_collector
        data.extend_from_slice(&[6u8; 32]); // vault
        data.push(255); // bump
        assert_eq!(data.len(), ESCROW_ACCOUNT_V2_LEN);

        let decoded = EscrowAccount::decode(&data).unwrap();
        assert_eq!(decoded.v, 2);
        assert_eq!(decoded.status, EscrowStatus::Claimed);
        assert_eq!(decoded.net_amount, 1_000_000);
        assert_eq!(decoded.fee_amount, 10_000);
        assert_eq!(decoded.bump, 255);
    }
}
