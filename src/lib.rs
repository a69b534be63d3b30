//! intercom-swap-core: peer-to-peer BTC-Lightning <-> Solana-SPL atomic
//! swap negotiation and settlement engine.

pub mod config;
pub mod engine;
pub mod envelope;
pub mod error;
pub mod escrow;
pub mod hygiene;
pub mod lightning;
pub mod maker;
pub mod receipts;
pub mod taker;
pub mod telemetry;
pub mod trade;
pub mod transport;
pub mod util;
pub mod validator;
