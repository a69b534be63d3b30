//! Top-level process wiring: picks a role (maker or taker), runs it
//! alongside the hygiene sweep, and implements `stop(reason)` graceful
//! shutdown (spec.md §5).

use crate::hygiene::HygieneController;
use crate::maker::MakerEngine;
use crate::receipts::{ReceiptsStore, TradeEvent};
use crate::taker::TakerEngine;
use crate::telemetry;
use crate::transport::{Inbound, Transport};
use crate::util;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::info;

enum Role {
    Maker(Arc<MakerEngine>),
    Taker(Arc<TakerEngine>),
}

/// A running engine process: one role (maker xor taker — a peer plays a
/// single side of the protocol per spec.md §5's single-threaded-per-process
/// scheduling model), plus the hygiene sweep that both roles share.
pub struct Engine {
    role: Role,
    hygiene: Arc<HygieneController>,
    transport: Arc<dyn Transport>,
    receipts: Arc<dyn ReceiptsStore>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    handles: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl Engine {
    pub fn new_maker(
        maker: Arc<MakerEngine>,
        hygiene: Arc<HygieneController>,
        transport: Arc<dyn Transport>,
        receipts: Arc<dyn ReceiptsStore>,
    ) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Self {
            role: Role::Maker(maker),
            hygiene,
            transport,
            receipts,
            shutdown_tx,
            shutdown_rx,
            handles: std::sync::Mutex::new(Vec::new()),
        }
    }

    pub fn new_taker(
        taker: Arc<TakerEngine>,
        hygiene: Arc<HygieneController>,
        transport: Arc<dyn Transport>,
        receipts: Arc<dyn ReceiptsStore>,
    ) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Self {
            role: Role::Taker(taker),
            hygiene,
            transport,
            receipts,
            shutdown_tx,
            shutdown_rx,
            handles: std::sync::Mutex::new(Vec::new()),
        }
    }

    /// Drive the configured role and the hygiene sweep from a single
    /// inbound stream until [`Engine::stop`] is called.
    pub async fn run(&self, inbound: mpsc::UnboundedReceiver<Inbound>) {
        let hygiene = self.hygiene.clone();
        let hygiene_handle = tokio::spawn(async move { hygiene.run().await });
        self.handles.lock().unwrap().push(hygiene_handle);

        let shutdown_rx = self.shutdown_rx.clone();
        match &self.role {
            Role::Maker(m) => m.clone().run(inbound, shutdown_rx).await,
            Role::Taker(t) => t.clone().run(inbound, shutdown_rx).await,
        }
    }

    /// Graceful shutdown: clear timers, best-effort leave every `swap:*`
    /// channel, persist a terminal `shutdown` event per active trade,
    /// close the receipts store, close the transport.
    pub async fn stop(&self, reason: &str) -> crate::error::Result<()> {
        info!(reason, "engine stopping");
        let _ = self.shutdown_tx.send(true);
        for handle in self.handles.lock().unwrap().drain(..) {
            handle.abort();
        }

        let active = match &self.role {
            Role::Maker(m) => m.active_trade_ids().await,
            Role::Taker(t) => t.active_trade_ids().await,
        };
        for trade_id in &active {
            let _ = self.transport.leave(&format!("swap:{trade_id}")).await;
            let _ = self
                .receipts
                .append_event(TradeEvent {
                    trade_id: trade_id.clone(),
                    seq: 0,
                    ts_unix_ms: util::now_ms(),
                    kind: "shutdown".to_string(),
                    envelope: None,
                    note: Some(reason.to_string()),
                })
                .await;
            telemetry::periodic_action("shutdown", &format!("trade {trade_id} recorded shutdown: {reason}"));
        }

        if let Ok(stats) = self.transport.stats().await {
            for channel in stats.channels {
                if channel.starts_with("swap:") {
                    let _ = self.transport.leave(&channel).await;
                }
            }
        }

        self.receipts.close().await?;
        self.transport.close().await?;
        Ok(())
    }
}
