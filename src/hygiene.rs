//! Hygiene / leave controller (C10): periodically evicts `swap:*` channel
//! membership the maker/taker engines no longer need, so a restarted relay
//! connection or a long-lived process doesn't accumulate stale joins.

use crate::receipts::ReceiptsStore;
use crate::telemetry;
use crate::transport::Transport;
use crate::util;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

/// Runs the periodic sweep described in spec.md §4.10: for every `swap:*`
/// channel the transport reports as joined, leave it once the trade it
/// belongs to is terminal (or untracked), subject to a per-channel cooldown
/// so a channel can't be left and rejoined in a tight loop.
pub struct HygieneController {
    transport: Arc<dyn Transport>,
    receipts: Arc<dyn ReceiptsStore>,
    interval_ms: u64,
    leave_cooldown_ms: i64,
    last_left_ms: Mutex<HashMap<String, i64>>,
}

impl HygieneController {
    pub fn new(
        transport: Arc<dyn Transport>,
        receipts: Arc<dyn ReceiptsStore>,
        interval_ms: u64,
        leave_cooldown_ms: u64,
    ) -> Arc<Self> {
        Arc::new(Self {
            transport,
            receipts,
            interval_ms,
            leave_cooldown_ms: leave_cooldown_ms as i64,
            last_left_ms: Mutex::new(HashMap::new()),
        })
    }

    pub async fn run(self: Arc<Self>) {
        let mut interval = tokio::time::interval(Duration::from_millis(self.interval_ms));
        loop {
            interval.tick().await;
            self.sweep().await;
        }
    }

    async fn sweep(&self) {
        let stats = match self.transport.stats().await {
            Ok(s) => s,
            Err(_) => return,
        };
        let now = util::now_ms();

        for channel in stats.channels {
            let Some(trade_id) = channel.strip_prefix("swap:") else { continue };

            let mut cooldowns = self.last_left_ms.lock().await;
            if let Some(last) = cooldowns.get(&channel) {
                if now - last < self.leave_cooldown_ms {
                    continue;
                }
            }
            drop(cooldowns);

            let stale = match self.receipts.get(trade_id).await {
                Ok(Some(trade)) => trade.state.is_terminal(),
                Ok(None) => true, // nothing engine-side tracks this trade anymore
                Err(_) => false,
            };
            if !stale {
                continue;
            }

            if self.transport.leave(&channel).await.is_ok() {
                telemetry::periodic_action("hygiene_sweep", &format!("left stale channel {channel}"));
                self.last_left_ms.lock().await.insert(channel, now);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::receipts::MemoryReceiptsStore;
    use crate::transport::LoopbackHub;
    use crate::transport::LoopbackTransport;

    #[tokio::test]
    async fn sweep_leaves_untracked_swap_channel() {
        let hub = LoopbackHub::new();
        let (transport, _rx) = LoopbackTransport::new(hub);
        transport.join("swap:unknown-trade", None).await.unwrap();
        let transport: Arc<dyn Transport> = Arc::new(transport);
        let receipts: Arc<dyn ReceiptsStore> = Arc::new(MemoryReceiptsStore::new());

        let controller = HygieneController::new(transport.clone(), receipts, 1000, 0);
        controller.sweep().await;

        let stats = transport.stats().await.unwrap();
        assert!(stats.channels.is_empty());
    }

    #[tokio::test]
    async fn sweep_leaves_terminal_trade_channel() {
        let hub = LoopbackHub::new();
        let (transport, _rx) = LoopbackTransport::new(hub);
        transport.join("swap:t1", None).await.unwrap();
        let transport: Arc<dyn Transport> = Arc::new(transport);
        let receipts: Arc<dyn ReceiptsStore> = Arc::new(MemoryReceiptsStore::new());

        let mut terminal = crate::trade::initial("t1");
        // Drive straight to a terminal state is awkward without a full
        // envelope chain; a cancel-from-new transition is the shortest path
        // and is enough to exercise the sweep's terminal-state check.
        let sk = ed25519_dalek::SigningKey::generate(&mut rand::rngs::OsRng);
        let cancel = crate::envelope::sign::sign_and_attach(
            crate::envelope::UnsignedEnvelope {
                v: 1,
                trade_id: "t1".into(),
                ts: 1_700_000_000_000,
                nonce: "n1".into(),
                body: crate::envelope::EnvelopeBody::Cancel { reason: None },
            },
            &sk,
        )
        .unwrap();
        terminal = crate::trade::apply(&terminal, &cancel).unwrap();
        receipts_insert(&receipts, terminal).await;

        let controller = HygieneController::new(transport.clone(), receipts, 1000, 0);
        controller.sweep().await;

        let stats = transport.stats().await.unwrap();
        assert!(stats.channels.is_empty());
    }

    async fn receipts_insert(receipts: &Arc<dyn ReceiptsStore>, state: crate::trade::TradeState) {
        receipts.upsert_trade(&state).await.unwrap();
    }
}
