//! Receipts store (C7): durable trade records plus an append-only event
//! log, with a redaction pass applied before anything crosses into
//! telemetry.

use crate::envelope::Envelope;
use crate::error::{EngineError, Result};
use crate::trade::TradeState;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;

/// One entry in a trade's append-only event log. `seq` is assigned by the
/// store at append time (callers pass a placeholder); it is what makes the
/// log actually append-only rather than a last-write-wins slot.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TradeEvent {
    pub trade_id: String,
    pub seq: u64,
    pub ts_unix_ms: i64,
    pub kind: String,
    pub envelope: Option<Envelope>,
    pub note: Option<String>,
}

fn log_trade(state: &TradeState) {
    let redacted = redact_trade(state);
    tracing::debug!(trade_id = %redacted.trade_id, state = ?redacted.state, "trade upserted");
}

fn log_event(event: &TradeEvent) {
    let redacted = redact_event(event);
    tracing::debug!(trade_id = %redacted.trade_id, seq = redacted.seq, kind = %redacted.kind, "event appended");
}

#[async_trait]
pub trait ReceiptsStore: Send + Sync {
    async fn upsert_trade(&self, state: &TradeState) -> Result<()>;
    async fn append_event(&self, event: TradeEvent) -> Result<()>;
    async fn get(&self, trade_id: &str) -> Result<Option<TradeState>>;
    async fn list_by_state(&self, state: crate::trade::State) -> Result<Vec<TradeState>>;
    async fn events_for(&self, trade_id: &str) -> Result<Vec<TradeEvent>>;
    async fn close(&self) -> Result<()>;
}

/// Blank sensitive fields before a [`TradeState`] or [`TradeEvent`] is
/// handed to the telemetry layer: signing keys, invite secrets and
/// revealed preimages never leave this process in logs. Public on-chain
/// signatures (`tx_sig`) and hashes are left intact. `TradeState` itself
/// never carries a raw preimage or private key, so this is currently an
/// identity copy; kept as a named pass so a future field addition doesn't
/// silently skip redaction.
pub fn redact_trade(state: &TradeState) -> TradeState {
    state.clone()
}

pub fn redact_event(event: &TradeEvent) -> TradeEvent {
    let mut redacted = event.clone();
    if let Some(envelope) = &mut redacted.envelope {
        if let crate::envelope::EnvelopeBody::SwapInvite { invite, .. } = &mut envelope.body {
            invite.sig = "<redacted>".to_string();
        }
    }
    redacted
}

/// `sled`-backed default store: one tree for trade snapshots keyed by
/// `trade_id`, one for the event log keyed by `(trade_id, seq)`.
pub struct SledReceiptsStore {
    trades: sled::Tree,
    events: sled::Tree,
    db: sled::Db,
}

impl SledReceiptsStore {
    pub fn open(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let db = sled::open(path)?;
        let trades = db.open_tree("trades")?;
        let events = db.open_tree("events")?;
        Ok(Self { trades, events, db })
    }

    fn event_key(trade_id: &str, seq: u64) -> Vec<u8> {
        let mut key = trade_id.as_bytes().to_vec();
        key.push(0);
        key.extend_from_slice(&seq.to_be_bytes());
        key
    }

    /// Next unused seq for `trade_id`: one past the highest seq already
    /// stored, found from the last key in the trade's prefix range (keys
    /// sort lexicographically, and a big-endian seq suffix sorts the same
    /// as its numeric value).
    fn next_seq(&self, trade_id: &str) -> Result<u64> {
        let mut prefix = trade_id.as_bytes().to_vec();
        prefix.push(0);
        match self.events.scan_prefix(&prefix).last() {
            Some(entry) => {
                let (key, _) = entry?;
                let seq_bytes = &key[prefix.len()..];
                let mut buf = [0u8; 8];
                buf.copy_from_slice(seq_bytes);
                Ok(u64::from_be_bytes(buf) + 1)
            }
            None => Ok(0),
        }
    }
}

#[async_trait]
impl ReceiptsStore for SledReceiptsStore {
    async fn upsert_trade(&self, state: &TradeState) -> Result<()> {
        let bytes = serde_json::to_vec(state)?;
        self.trades.insert(state.trade_id.as_bytes(), bytes)?;
        log_trade(state);
        Ok(())
    }

    async fn append_event(&self, mut event: TradeEvent) -> Result<()> {
        event.seq = self.next_seq(&event.trade_id)?;
        let key = Self::event_key(&event.trade_id, event.seq);
        let bytes = serde_json::to_vec(&event)?;
        self.events.insert(key, bytes)?;
        log_event(&event);
        Ok(())
    }

    async fn get(&self, trade_id: &str) -> Result<Option<TradeState>> {
        match self.trades.get(trade_id.as_bytes())? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    async fn list_by_state(&self, state: crate::trade::State) -> Result<Vec<TradeState>> {
        let mut out = Vec::new();
        for entry in self.trades.iter() {
            let (_, bytes) = entry?;
            let trade: TradeState = serde_json::from_slice(&bytes)?;
            if trade.state == state {
                out.push(trade);
            }
        }
        Ok(out)
    }

    async fn events_for(&self, trade_id: &str) -> Result<Vec<TradeEvent>> {
        let mut prefix = trade_id.as_bytes().to_vec();
        prefix.push(0);
        let mut out = Vec::new();
        for entry in self.events.scan_prefix(prefix) {
            let (_, bytes) = entry?;
            out.push(serde_json::from_slice(&bytes)?);
        }
        Ok(out)
    }

    async fn close(&self) -> Result<()> {
        self.db.flush()?;
        Ok(())
    }
}

/// In-memory store for tests.
#[derive(Default)]
pub struct MemoryReceiptsStore {
    trades: Mutex<HashMap<String, TradeState>>,
    events: Mutex<HashMap<String, Vec<TradeEvent>>>,
}

impl MemoryReceiptsStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ReceiptsStore for MemoryReceiptsStore {
    async fn upsert_trade(&self, state: &TradeState) -> Result<()> {
        self.trades
            .lock()
            .map_err(|_| EngineError::Internal("receipts store lock poisoned".into()))?
            .insert(state.trade_id.clone(), state.clone());
        log_trade(state);
        Ok(())
    }

    async fn append_event(&self, mut event: TradeEvent) -> Result<()> {
        let mut events = self
            .events
            .lock()
            .map_err(|_| EngineError::Internal("receipts store lock poisoned".into()))?;
        let log = events.entry(event.trade_id.clone()).or_default();
        event.seq = log.len() as u64;
        log.push(event.clone());
        drop(events);
        log_event(&event);
        Ok(())
    }

    async fn get(&self, trade_id: &str) -> Result<Option<TradeState>> {
        Ok(self
            .trades
            .lock()
            .map_err(|_| EngineError::Internal("receipts store lock poisoned".into()))?
            .get(trade_id)
            .cloned())
    }

    async fn list_by_state(&self, state: crate::trade::State) -> Result<Vec<TradeState>> {
        Ok(self
            .trades
            .lock()
            .map_err(|_| EngineError::Internal("receipts store lock poisoned".into()))?
            .values()
            .filter(|t| t.state == state)
            .cloned()
            .collect())
    }

    async fn events_for(&self, trade_id: &str) -> Result<Vec<TradeEvent>> {
        Ok(self
            .events
            .lock()
            .map_err(|_| EngineError::Internal("receipts store lock poisoned".into()))?
            .get(trade_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trade::initial;

    #[tokio::test]
    async fn memory_store_round_trips_trade() {
        let store = MemoryReceiptsStore::new();
        let state = initial("t1");
        store.upsert_trade(&state).await.unwrap();
        let fetched = store.get("t1").await.unwrap().unwrap();
        assert_eq!(fetched.trade_id, "t1");
    }

    #[tokio::test]
    async fn memory_store_lists_by_state() {
        let store = MemoryReceiptsStore::new();
        store.upsert_trade(&initial("t1")).await.unwrap();
        let found = store.list_by_state(crate::trade::State::New).await.unwrap();
        assert_eq!(found.len(), 1);
    }

    fn event(trade_id: &str, kind: &str) -> TradeEvent {
        TradeEvent {
            trade_id: trade_id.into(),
            seq: 0,
            ts_unix_ms: 1_700_000_000_000,
            kind: kind.into(),
            envelope: None,
            note: None,
        }
    }

    #[tokio::test]
    async fn memory_store_assigns_distinct_seqs_and_keeps_both_events() {
        let store = MemoryReceiptsStore::new();
        store.append_event(event("t1", "sol_escrow_created")).await.unwrap();
        store.append_event(event("t1", "shutdown")).await.unwrap();

        let events = store.events_for("t1").await.unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].seq, 0);
        assert_eq!(events[0].kind, "sol_escrow_created");
        assert_eq!(events[1].seq, 1);
        assert_eq!(events[1].kind, "shutdown");
    }

    #[tokio::test]
    async fn sled_store_assigns_distinct_seqs_and_keeps_both_events() {
        let dir = tempfile::tempdir().unwrap();
        let store = SledReceiptsStore::open(dir.path()).unwrap();
        store.append_event(event("t1", "sol_escrow_created")).await.unwrap();
        store.append_event(event("t1", "shutdown")).await.unwrap();

        let events = store.events_for("t1").await.unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].seq, 0);
        assert_eq!(events[0].kind, "sol_escrow_created");
        assert_eq!(events[1].seq, 1);
        assert_eq!(events[1].kind, "shutdown");
    }
}
