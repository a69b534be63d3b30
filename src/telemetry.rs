//! Telemetry (C11, ambient): structured `tracing` setup and the event
//! helpers engines call at each entry point. No `println!`, no console
//! cosmetics — per spec.md §9 this process emits structured events only.

use tracing_subscriber::{fmt, EnvFilter};

/// Install a `tracing` subscriber reading its filter from `RUST_LOG`,
/// defaulting to `info`. Call once at process start.
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(filter).with_target(true).init();
}

/// Emit the structured event for an envelope having been applied to a
/// trade's state machine.
pub fn envelope_applied(trade_id: &str, kind: &str, from: &str, to: &str) {
    tracing::info!(trade_id, kind, from, to, "envelope applied");
}

/// Emit the structured event for an envelope dropped before reaching the
/// state machine (local-drop error kinds per spec.md §7).
pub fn envelope_dropped(trade_id: &str, kind: &str, reason: &str) {
    tracing::warn!(trade_id, kind, reason, "envelope dropped");
}

/// Emit the structured event for a side effect (escrow tx, LN pay,
/// transport send) succeeding or failing.
pub fn side_effect(trade_id: &str, effect: &str, ok: bool, detail: &str) {
    if ok {
        tracing::info!(trade_id, effect, detail, "side effect completed");
    } else {
        tracing::error!(trade_id, effect, detail, "side effect failed");
    }
}

/// Emit the structured event for a resend tick or hygiene sweep action.
pub fn periodic_action(task: &str, detail: &str) {
    tracing::debug!(task, detail, "periodic task tick");
}
