//! Escrow-chain invariants from spec.md §8, exercised directly against the
//! mock program rather than through a full maker/taker engine pair:
//! claim only succeeds for the right claimant with the right preimage,
//! and refund only succeeds once the timelock has elapsed.

mod common;

use common::MockEscrowClient;
use intercom_swap_core::escrow::EscrowClient;
use solana_sdk::pubkey::Pubkey;
use solana_sdk::signature::{Keypair, Signer};

fn sha256(data: &[u8]) -> [u8; 32] {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

async fn open_escrow(
    client: &MockEscrowClient,
    mint: &Pubkey,
    recipient: &Pubkey,
    refund: &Pubkey,
    refund_after_unix: i64,
) -> [u8; 32] {
    let preimage = [7u8; 32];
    let payment_hash = sha256(&preimage);
    let payer = Keypair::new();
    client
        .create_escrow_tx(
            &payer,
            &Pubkey::new_unique(),
            mint,
            &payment_hash,
            recipient,
            refund,
            refund_after_unix,
            1_000_000,
            50,
            50,
            &Pubkey::new_unique(),
        )
        .await
        .unwrap();
    payment_hash
}

/// Scenario 3: wrong preimage is rejected; the right preimage then claims.
#[tokio::test]
async fn claim_rejects_wrong_preimage_then_succeeds_with_right_one() {
    let client = MockEscrowClient::new();
    let mint = Pubkey::new_unique();
    let recipient = Keypair::new();
    let refund = Pubkey::new_unique();
    let now = common::now_unix();
    let payment_hash = open_escrow(&client, &mint, &recipient.pubkey(), &refund, now + 3600).await;

    let wrong_preimage = [9u8; 32];
    let err = client
        .claim_escrow_tx(
            &recipient,
            &Pubkey::new_unique(),
            &mint,
            &payment_hash,
            &wrong_preimage,
            &Pubkey::new_unique(),
        )
        .await;
    assert!(err.is_err());

    let right_preimage = [7u8; 32];
    client
        .claim_escrow_tx(
            &recipient,
            &Pubkey::new_unique(),
            &mint,
            &payment_hash,
            &right_preimage,
            &Pubkey::new_unique(),
        )
        .await
        .unwrap();
}

/// Scenario 4: a party other than the escrow's recipient cannot claim it,
/// even with the correct preimage.
#[tokio::test]
async fn claim_rejects_wrong_claimant() {
    let client = MockEscrowClient::new();
    let mint = Pubkey::new_unique();
    let recipient = Keypair::new();
    let impostor = Keypair::new();
    let refund = Pubkey::new_unique();
    let now = common::now_unix();
    let payment_hash = open_escrow(&client, &mint, &recipient.pubkey(), &refund, now + 3600).await;

    let preimage = [7u8; 32];
    let err = client
        .claim_escrow_tx(&impostor, &Pubkey::new_unique(), &mint, &payment_hash, &preimage, &Pubkey::new_unique())
        .await;
    assert!(err.is_err());
}

/// Scenario 2: refund is rejected before the timelock elapses and succeeds
/// after, and a claimed escrow can no longer be refunded.
#[tokio::test]
async fn refund_requires_elapsed_timelock_and_is_blocked_after_claim() {
    let client = MockEscrowClient::new();
    let mint = Pubkey::new_unique();
    let recipient = Keypair::new();
    let refund_signer = Keypair::new();
    let now = common::now_unix();

    let payment_hash = open_escrow(&client, &mint, &recipient.pubkey(), &refund_signer.pubkey(), now + 2).await;

    let too_early = client
        .refund_escrow_tx(&refund_signer, &Pubkey::new_unique(), &mint, &payment_hash)
        .await;
    assert!(too_early.is_err());

    tokio::time::sleep(std::time::Duration::from_secs(3)).await;
    client
        .refund_escrow_tx(&refund_signer, &Pubkey::new_unique(), &mint, &payment_hash)
        .await
        .unwrap();

    let preimage = [7u8; 32];
    let claim_after_refund = client
        .claim_escrow_tx(&recipient, &Pubkey::new_unique(), &mint, &payment_hash, &preimage, &Pubkey::new_unique())
        .await;
    assert!(claim_after_refund.is_err());
}
