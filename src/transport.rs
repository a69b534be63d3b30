//! Sidechannel transport adapter (C6): join/leave/subscribe/send/stats on
//! a best-effort pub/sub relay, plus an inbound event stream. Membership
//! in `swap:{trade_id}` channels is invite-gated; the RFQ channel is open.

use crate::envelope::{Envelope, SignedInvite};
use crate::error::{EngineError, Result};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio_tungstenite::tungstenite::Message as WsMessage;

/// A single inbound delivery: the channel it arrived on, the decoded
/// envelope, and the relay's monotonic per-channel sequence number (used
/// only for logging/ordering hints, never for correctness).
#[derive(Clone, Debug)]
pub struct Inbound {
    pub channel: String,
    pub message: Envelope,
    pub seq: u64,
}

/// Snapshot returned by [`Transport::stats`].
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct TransportStats {
    pub channels: Vec<String>,
}

#[async_trait]
pub trait Transport: Send + Sync {
    async fn join(&self, channel: &str, invite: Option<SignedInvite>) -> Result<()>;
    async fn leave(&self, channel: &str) -> Result<()>;
    async fn subscribe(&self, channels: &[String]) -> Result<()>;
    async fn send(&self, channel: &str, envelope: Envelope, invite: Option<SignedInvite>) -> Result<()>;
    async fn stats(&self) -> Result<TransportStats>;
    /// Close the underlying connection. Part of the engine's graceful
    /// shutdown path; no further sends are expected afterward.
    async fn close(&self) -> Result<()>;
}

#[derive(Serialize, Deserialize)]
struct WireFrame {
    channel: String,
    envelope: Envelope,
    #[serde(skip_serializing_if = "Option::is_none")]
    invite: Option<SignedInvite>,
}

#[derive(Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum ControlFrame {
    Join {
        channel: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        invite: Option<SignedInvite>,
    },
    Leave {
        channel: String,
    },
    Subscribe {
        channels: Vec<String>,
    },
    Send(WireFrame),
}

type WsSink = futures_util::stream::SplitSink<
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>,
    WsMessage,
>;

/// `Transport` over a WebSocket pub/sub relay, speaking canonical-JSON
/// envelopes wrapped in a small control-frame envelope of our own.
pub struct WsTransport {
    sink: Mutex<WsSink>,
    joined: Mutex<HashSet<String>>,
    inbound_tx: mpsc::UnboundedSender<Inbound>,
}

impl WsTransport {
    /// Connect to `url` and spawn the background task that demultiplexes
    /// inbound frames into `inbound_tx`. Returns the transport plus the
    /// receiver side of the inbound stream.
    pub async fn connect(url: &str) -> Result<(Arc<Self>, mpsc::UnboundedReceiver<Inbound>)> {
        let (ws, _resp) = tokio_tungstenite::connect_async(url)
            .await
            .map_err(|e| EngineError::TransportUnavailable(e.to_string()))?;
        let (sink, mut stream) = ws.split();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();

        let this = Arc::new(Self {
            sink: Mutex::new(sink),
            joined: Mutex::new(HashSet::new()),
            inbound_tx,
        });

        let tx = this.inbound_tx.clone();
        tokio::spawn(async move {
            let mut seq_by_channel: HashMap<String, u64> = HashMap::new();
            while let Some(frame) = stream.next().await {
                let Ok(WsMessage::Text(text)) = frame else { continue };
                let Ok(wire) = serde_json::from_str::<WireFrame>(&text) else { continue };
                let seq = seq_by_channel.entry(wire.channel.clone()).or_insert(0);
                *seq += 1;
                let _ = tx.send(Inbound {
                    channel: wire.channel,
                    message: wire.envelope,
                    seq: *seq,
                });
            }
        });

        Ok((this, inbound_rx))
    }

    async fn send_control(&self, frame: ControlFrame) -> Result<()> {
        let text = serde_json::to_string(&frame)?;
        let mut sink = self.sink.lock().await;
        sink.send(WsMessage::Text(text))
            .await
            .map_err(|e| EngineError::TransportUnavailable(e.to_string()))
    }
}

#[async_trait]
impl Transport for WsTransport {
    async fn join(&self, channel: &str, invite: Option<SignedInvite>) -> Result<()> {
        self.send_control(ControlFrame::Join {
            channel: channel.to_string(),
            invite,
        })
        .await?;
        self.joined.lock().await.insert(channel.to_string());
        Ok(())
    }

    async fn leave(&self, channel: &str) -> Result<()> {
        self.send_control(ControlFrame::Leave {
            channel: channel.to_string(),
        })
        .await?;
        self.joined.lock().await.remove(channel);
        Ok(())
    }

    async fn subscribe(&self, channels: &[String]) -> Result<()> {
        self.send_control(ControlFrame::Subscribe {
            channels: channels.to_vec(),
        })
        .await
    }

    async fn send(&self, channel: &str, envelope: Envelope, invite: Option<SignedInvite>) -> Result<()> {
        self.send_control(ControlFrame::Send(WireFrame {
            channel: channel.to_string(),
            envelope,
            invite,
        }))
        .await
    }

    async fn stats(&self) -> Result<TransportStats> {
        Ok(TransportStats {
            channels: self.joined.lock().await.iter().cloned().collect(),
        })
    }

    async fn close(&self) -> Result<()> {
        self.sink
            .lock()
            .await
            .close()
            .await
            .map_err(|e| EngineError::TransportUnavailable(e.to_string()))
    }
}

/// In-memory `Transport` for tests: every `LoopbackTransport` sharing the
/// same [`LoopbackHub`] sees every other's sends on channels it joined.
#[derive(Default)]
pub struct LoopbackHub {
    subscribers: Mutex<HashMap<String, Vec<mpsc::UnboundedSender<Inbound>>>>,
    seq: Mutex<HashMap<String, u64>>,
}

impl LoopbackHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

pub struct LoopbackTransport {
    hub: Arc<LoopbackHub>,
    joined: Mutex<HashSet<String>>,
    inbound_tx: mpsc::UnboundedSender<Inbound>,
}

impl LoopbackTransport {
    pub fn new(hub: Arc<LoopbackHub>) -> (Self, mpsc::UnboundedReceiver<Inbound>) {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        (
            Self {
                hub,
                joined: Mutex::new(HashSet::new()),
                inbound_tx,
            },
            inbound_rx,
        )
    }
}

#[async_trait]
impl Transport for LoopbackTransport {
    async fn join(&self, channel: &str, _invite: Option<SignedInvite>) -> Result<()> {
        self.joined.lock().await.insert(channel.to_string());
        self.hub
            .subscribers
            .lock()
            .await
            .entry(channel.to_string())
            .or_default()
            .push(self.inbound_tx.clone());
        Ok(())
    }

    async fn leave(&self, channel: &str) -> Result<()> {
        self.joined.lock().await.remove(channel);
        // Subscriber list entries are identified by sender; dropping ours
        // specifically would require comparing senders, which tokio's
        // mpsc doesn't support cheaply, so a dead sender is left in place
        // and silently fails to deliver (the channel is closed on our
        // side once `inbound_tx`'s receiver is dropped).
        Ok(())
    }

    async fn subscribe(&self, channels: &[String]) -> Result<()> {
        let mut subs = self.hub.subscribers.lock().await;
        for channel in channels {
            self.joined.lock().await.insert(channel.clone());
            subs.entry(channel.clone()).or_default().push(self.inbound_tx.clone());
        }
        Ok(())
    }

    async fn send(&self, channel: &str, envelope: Envelope, _invite: Option<SignedInvite>) -> Result<()> {
        let mut seq_map = self.hub.seq.lock().await;
        let seq = seq_map.entry(channel.to_string()).or_insert(0);
        *seq += 1;
        let seq = *seq;
        drop(seq_map);

        let subs = self.hub.subscribers.lock().await;
        if let Some(senders) = subs.get(channel) {
            for sender in senders {
                let _ = sender.send(Inbound {
                    channel: channel.to_string(),
                    message: envelope.clone(),
                    seq,
                });
            }
        }
        Ok(())
    }

    async fn stats(&self) -> Result<TransportStats> {
        Ok(TransportStats {
            channels: self.joined.lock().await.iter().cloned().collect(),
        })
    }

    async fn close(&self) -> Result<()> {
        self.joined.lock().await.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::sign::sign_and_attach;
    use crate::envelope::{Direction, EnvelopeBody, UnsignedEnvelope};
    use ed25519_dalek::SigningKey;
    use rand::rngs::OsRng;

    #[tokio::test]
    async fn loopback_delivers_to_joined_subscriber() {
        let hub = LoopbackHub::new();
        let (maker, _maker_rx) = LoopbackTransport::new(hub.clone());
        let (taker, mut taker_rx) = LoopbackTransport::new(hub.clone());

        taker.join("swap:t1", None).await.unwrap();

        let sk = SigningKey::generate(&mut OsRng);
        let unsigned = UnsignedEnvelope {
            v: 1,
            trade_id: "t1".into(),
            ts: 1_700_000_000_000,
            nonce: "n1".into(),
            body: EnvelopeBody::Cancel { reason: None },
        };
        let _ = Direction::MakerSellsBtc;
        let envelope = sign_and_attach(unsigned, &sk).unwrap();
        maker.send("swap:t1", envelope.clone(), None).await.unwrap();

        let delivered = taker_rx.recv().await.unwrap();
        assert_eq!(delivered.channel, "swap:t1");
        assert_eq!(delivered.message.trade_id, "t1");
    }

    #[tokio::test]
    async fn stats_reports_joined_channels() {
        let hub = LoopbackHub::new();
        let (t, _rx) = LoopbackTransport::new(hub);
        t.join("rfq", None).await.unwrap();
        let stats = t.stats().await.unwrap();
        assert_eq!(stats.channels, vec!["rfq".to_string()]);
    }
}
