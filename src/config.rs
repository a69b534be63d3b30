//! Engine configuration (C0, ambient): typed, layered load via the
//! `config` crate — embedded defaults, then an optional file, then
//! `INTERCOM_*` environment overrides.

use crate::error::{EngineError, Result};
use serde::Deserialize;

const DEFAULTS_TOML: &str = r#"
rfq_channel = "0000intercomswapbtcusdt"
app_hash = ""
enable_settlement = true

max_platform_fee_bps = 100
max_trade_fee_bps = 100
max_total_fee_bps = 150
min_sol_refund_window_sec = 600
max_sol_refund_window_sec = 172800

platform_fee_bps = 50
trade_fee_bps = 50
maker_refund_window_sec = 3600
terms_valid_sec = 120
invoice_expiry_sec = 1800
accepting_lock_deadline_ms = 30000

quote_valid_sec = 30
retry_resend_min_ms = 5000
resend_baseline_ms = 10000
resend_widened_ms = 22500
resend_widen_after_silence_ms = 30000
swap_timeout_sec = 900
rfq_lock_prune_interval_ms = 5000

waiting_terms_ping_cooldown_ms = 5000
waiting_terms_max_pings = 10
waiting_terms_max_wait_ms = 60000
waiting_terms_leave_on_timeout = true

hygiene_interval_ms = 5000
swap_auto_leave_cooldown_ms = 10000

solana_rpc_url = "http://127.0.0.1:8899"
escrow_program_id = ""

lightning_rpc_url = "http://127.0.0.1:9835"
lightning_rune = ""

receipts_store_path = "./intercom-swap-receipts"
"#;

/// Layered engine configuration. Every duration named in spec.md §4.8–§4.10
/// lives here so the maker/taker/hygiene loops never hard-code a constant.
#[derive(Clone, Debug, Deserialize)]
pub struct EngineConfig {
    pub rfq_channel: String,
    pub app_hash: String,
    pub enable_settlement: bool,

    pub max_platform_fee_bps: u16,
    pub max_trade_fee_bps: u16,
    pub max_total_fee_bps: u16,
    pub min_sol_refund_window_sec: u64,
    pub max_sol_refund_window_sec: u64,

    pub platform_fee_bps: u16,
    pub trade_fee_bps: u16,
    pub maker_refund_window_sec: u64,
    pub terms_valid_sec: u64,
    pub invoice_expiry_sec: u32,
    pub accepting_lock_deadline_ms: i64,

    pub quote_valid_sec: u64,
    pub retry_resend_min_ms: u64,
    pub resend_baseline_ms: u64,
    pub resend_widened_ms: u64,
    pub resend_widen_after_silence_ms: u64,
    pub swap_timeout_sec: u64,
    pub rfq_lock_prune_interval_ms: u64,

    pub waiting_terms_ping_cooldown_ms: u64,
    pub waiting_terms_max_pings: u32,
    pub waiting_terms_max_wait_ms: u64,
    pub waiting_terms_leave_on_timeout: bool,

    pub hygiene_interval_ms: u64,
    pub swap_auto_leave_cooldown_ms: u64,

    pub solana_rpc_url: String,
    pub escrow_program_id: String,

    pub lightning_rpc_url: String,
    pub lightning_rune: String,

    pub receipts_store_path: String,
}

impl EngineConfig {
    /// Load defaults, then `path` (if it exists), then `INTERCOM_*` env
    /// overrides (e.g. `INTERCOM_SWAP_TIMEOUT_SEC=1800`).
    pub fn load(path: Option<&str>) -> Result<Self> {
        let mut builder = config::Config::builder()
            .add_source(config::File::from_str(DEFAULTS_TOML, config::FileFormat::Toml));
        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path).required(false));
        }
        builder = builder.add_source(
            config::Environment::with_prefix("INTERCOM")
                .separator("_")
                .try_parsing(true),
        );
        let cfg = builder
            .build()
            .map_err(|e| EngineError::SchemaInvalid(format!("config load failed: {e}")))?;
        cfg.try_deserialize()
            .map_err(|e| EngineError::SchemaInvalid(format!("config shape invalid: {e}")))
    }

    /// Defaults only, no file or environment — used by tests.
    pub fn defaults() -> Self {
        Self::load(None).expect("embedded defaults are always well-formed")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_parse() {
        let cfg = EngineConfig::defaults();
        assert_eq!(cfg.rfq_channel, "0000intercomswapbtcusdt");
        assert_eq!(cfg.swap_timeout_sec, 900);
    }

    #[test]
    fn env_override_applies() {
        std::env::set_var("INTERCOM_SWAP_TIMEOUT_SEC", "120");
        let cfg = EngineConfig::load(None).unwrap();
        assert_eq!(cfg.swap_timeout_sec, 120);
        std::env::remove_var("INTERCOM_SWAP_TIMEOUT_SEC");
    }
}
