//! On-chain account layouts and instruction encoding for the escrow
//! program (spec.md §6). These types describe the program's external ABI;
//! the program itself is out of scope.

use crate::error::{EngineError, Result};
use borsh::{BorshDeserialize, BorshSerialize};

/// Escrow account status byte.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum EscrowStatus {
    Active = 0,
    Claimed = 1,
    Refunded = 2,
}

impl EscrowStatus {
    fn from_u8(v: u8) -> Result<Self> {
        match v {
            0 => Ok(EscrowStatus::Active),
            1 => Ok(EscrowStatus::Claimed),
            2 => Ok(EscrowStatus::Refunded),
            other => Err(EngineError::SchemaInvalid(format!("unknown escrow status {other}"))),
        }
    }
}

/// Decoded escrow account, versions 1 (no platform/trade fee split, single
/// `fee_bps`/`fee_collector`) and 2 (this spec's layout, 221 bytes) are both
/// representable; v2 additionally carries `fee_amount` broken into platform
/// and trade fee.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EscrowAccount {
    pub v: u8,
    pub status: EscrowStatus,
    pub payment_hash: [u8; 32],
    pub recipient: [u8; 32],
    pub refund: [u8; 32],
    pub refund_after: i64,
    pub mint: [u8; 32],
    pub net_amount: u64,
    pub fee_amount: u64,
    pub fee_bps: u16,
    pub fee_collector: [u8; 32],
    pub vault: [u8; 32],
    pub bump: u8,
}

/// Layout v2 is exactly 221 bytes: see spec.md §6.
pub const ESCROW_ACCOUNT_V2_LEN: usize = 221;

impl EscrowAccount {
    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < ESCROW_ACCOUNT_V2_LEN {
            return Err(EngineError::SchemaInvalid(format!(
                "escrow account too short: {} < {}",
                data.len(),
                ESCROW_ACCOUNT_V2_LEN
            )));
        }
        let mut cur = data;
        let v = take_u8(&mut cur)?;
        let status = EscrowStatus::from_u8(take_u8(&mut cur)?)?;
        let payment_hash = take_array_32(&mut cur)?;
        let recipient = take_array_32(&mut cur)?;
        let refund = take_array_32(&mut cur)?;
        let refund_after = take_i64_le(&mut cur)?;
        let mint = take_array_32(&mut cur)?;
        let net_amount = take_u64_le(&mut cur)?;
        let fee_amount = take_u64_le(&mut cur)?;
        let fee_bps = take_u16_le(&mut cur)?;
        let fee_collector = take_array_32(&mut cur)?;
        let vault = take_array_32(&mut cur)?;
        let bump = take_u8(&mut cur)?;
        Ok(EscrowAccount {
            v,
            status,
            payment_hash,
            recipient,
            refund,
            refund_after,
            mint,
            net_amount,
            fee_amount,
            fee_bps,
            fee_collector,
            vault,
            bump,
        })
    }
}

/// Decoded config account, layout v1 (68 bytes).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConfigAccount {
    pub v: u8,
    pub authority: [u8; 32],
    pub fee_collector: [u8; 32],
    pub fee_bps: u16,
    pub bump: u8,
}

pub const CONFIG_ACCOUNT_V1_LEN: usize = 68;

impl ConfigAccount {
    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < CONFIG_ACCOUNT_V1_LEN {
            return Err(EngineError::SchemaInvalid(format!(
                "config account too short: {} < {}",
                data.len(),
                CONFIG_ACCOUNT_V1_LEN
            )));
        }
        let mut cur = data;
        let v = take_u8(&mut cur)?;
        let authority = take_array_32(&mut cur)?;
        let fee_collector = take_array_32(&mut cur)?;
        let fee_bps = take_u16_le(&mut cur)?;
        let bump = take_u8(&mut cur)?;
        Ok(ConfigAccount {
            v,
            authority,
            fee_collector,
            fee_bps,
            bump,
        })
    }
}

fn take_u8(cur: &mut &[u8]) -> Result<u8> {
    let (b, rest) = cur
        .split_first()
        .ok_or_else(|| EngineError::SchemaInvalid("unexpected end of account data".into()))?;
    *cur = rest;
    Ok(*b)
}

fn take_array_32(cur: &mut &[u8]) -> Result<[u8; 32]> {
    if cur.len() < 32 {
        return Err(EngineError::SchemaInvalid("unexpected end of account data".into()));
    }
    let (head, rest) = cur.split_at(32);
    *cur = rest;
    let mut out = [0u8; 32];
    out.copy_from_slice(head);
    Ok(out)
}

fn take_u64_le(cur: &mut &[u8]) -> Result<u64> {
    if cur.len() < 8 {
        return Err(EngineError::SchemaInvalid("unexpected end of account data".into()));
    }
    let (head, rest) = cur.split_at(8);
    *cur = rest;
    Ok(u64::from_le_bytes(head.try_into().unwrap()))
}

fn take_i64_le(cur: &mut &[u8]) -> Result<i64> {
    take_u64_le(cur).map(|v| v as i64)
}

fn take_u16_le(cur: &mut &[u8]) -> Result<u16> {
    if cur.len() < 2 {
        return Err(EngineError::SchemaInvalid("unexpected end of account data".into()));
    }
    let (head, rest) = cur.split_at(2);
    *cur = rest;
    Ok(u16::from_le_bytes(head.try_into().unwrap()))
}

/// Instruction tags, spec.md §6.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum InstructionTag {
    Init = 0,
    Claim = 1,
    Refund = 2,
    InitConfig = 3,
    SetConfig = 4,
    WithdrawFees = 5,
}

#[derive(BorshSerialize, BorshDeserialize)]
pub struct InitArgs {
    pub payment_hash: [u8; 32],
    pub recipient: [u8; 32],
    pub refund: [u8; 32],
    pub refund_after_unix: i64,
    pub net_amount: u64,
    pub expected_platform_fee_bps: u16,
    pub expected_trade_fee_bps: u16,
    pub trade_fee_collector: [u8; 32],
}

#[derive(BorshSerialize, BorshDeserialize)]
pub struct ClaimArgs {
    pub payment_hash: [u8; 32],
    pub preimage: [u8; 32],
}

#[derive(BorshSerialize, BorshDeserialize)]
pub struct RefundArgs {
    pub payment_hash: [u8; 32],
}

/// Encode an instruction's Borsh-serialized data with its leading tag byte.
pub fn encode_instruction_data<T: BorshSerialize>(tag: InstructionTag, args: &T) -> Vec<u8> {
    let mut data = vec![tag as u8];
    data.extend(borsh::to_vec(args).expect("borsh serialization of escrow args is infallible"));
    data
}

/// PDA seed prefixes.
pub const ESCROW_SEED: &[u8] = b"escrow";
pub const CONFIG_SEED: &[u8] = b"config";
