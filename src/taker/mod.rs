//! Taker engine (C9): join-invite -> accept-terms -> pay -> claim, with a
//! waiting-terms recovery loop covering a missed `QUOTE_ACCEPT`.

use crate::config::EngineConfig;
use crate::envelope::canonical::hash_hex;
use crate::envelope::sign::sign_and_attach;
use crate::envelope::{Envelope, EnvelopeBody, SignedInvite, UnsignedEnvelope};
use crate::error::{EngineError, Result};
use crate::escrow::{ClaimedEscrow, EscrowClient};
use crate::lightning::LightningClient;
use crate::receipts::{ReceiptsStore, TradeEvent};
use crate::telemetry;
use crate::trade::{self, State, TradeState};
use crate::transport::{Inbound, Transport};
use crate::util;
use crate::validator;
use ed25519_dalek::SigningKey;
use solana_sdk::pubkey::Pubkey;
use solana_sdk::signature::Keypair;
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};

/// Key material and on-chain addresses this taker process settles with.
pub struct TakerIdentity {
    pub signer: SigningKey,
    pub sol_claim_recipient: String,
    pub solana_claimant: Keypair,
    pub claimant_token_account: Pubkey,
    pub mint: Pubkey,
}

impl TakerIdentity {
    pub fn pubkey_hex(&self) -> String {
        hex::encode(self.signer.verifying_key().to_bytes())
    }
}

/// The span between sending `QUOTE_ACCEPT` and observing `TERMS`, tracked
/// independent of whether `SWAP_INVITE` (and the per-trade task it starts)
/// has arrived yet — the replay target is always the RFQ channel.
struct WaitingTerms {
    quote_accept_envelope: Envelope,
    started_ms: i64,
    last_ping_ms: i64,
    pings_sent: u32,
}

pub struct TakerEngine {
    cfg: EngineConfig,
    identity: TakerIdentity,
    transport: Arc<dyn Transport>,
    escrow: Arc<dyn EscrowClient>,
    lightning: Arc<dyn LightningClient>,
    receipts: Arc<dyn ReceiptsStore>,
    trade_channels: Mutex<HashMap<String, mpsc::UnboundedSender<Envelope>>>,
    waiting: Mutex<HashMap<String, WaitingTerms>>,
}

impl TakerEngine {
    pub fn new(
        cfg: EngineConfig,
        identity: TakerIdentity,
        transport: Arc<dyn Transport>,
        escrow: Arc<dyn EscrowClient>,
        lightning: Arc<dyn LightningClient>,
        receipts: Arc<dyn ReceiptsStore>,
    ) -> Arc<Self> {
        Arc::new(Self {
            cfg,
            identity,
            transport,
            escrow,
            lightning,
            receipts,
            trade_channels: Mutex::new(HashMap::new()),
            waiting: Mutex::new(HashMap::new()),
        })
    }

    /// Drive the engine from an inbound event stream until the channel
    /// closes or `shutdown` fires. Spawns the waiting-terms ping loop
    /// alongside.
    pub async fn run(self: Arc<Self>, mut inbound: mpsc::UnboundedReceiver<Inbound>, mut shutdown: watch::Receiver<bool>) {
        let pinger = self.clone();
        tokio::spawn(async move { pinger.waiting_terms_loop().await });

        loop {
            tokio::select! {
                event = inbound.recv() => {
                    let Some(event) = event else { break };
                    if event.channel == self.cfg.rfq_channel {
                        self.clone().handle_rfq_channel(event.message).await;
                    } else if let Some(trade_id) = event.channel.strip_prefix("swap:") {
                        let senders = self.trade_channels.lock().await;
                        if let Some(tx) = senders.get(trade_id) {
                            let _ = tx.send(event.message);
                        }
                        // Unknown trade_id: not ours, or arrived before our
                        // own join completed; nothing to route it to yet.
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    }

    /// Trade ids with an active per-trade task, used by [`crate::engine`]'s
    /// shutdown path to persist a terminal event per trade still in flight.
    pub async fn active_trade_ids(&self) -> Vec<String> {
        self.trade_channels.lock().await.keys().cloned().collect()
    }

    async fn waiting_terms_loop(self: Arc<Self>) {
        let mut interval = tokio::time::interval(Duration::from_millis(self.cfg.waiting_terms_ping_cooldown_ms));
        loop {
            interval.tick().await;
            let now = util::now_ms();
            let mut timed_out = Vec::new();
            let mut to_ping = Vec::new();
            {
                let mut waiting = self.waiting.lock().await;
                for (trade_id, w) in waiting.iter_mut() {
                    if now - w.started_ms >= self.cfg.waiting_terms_max_wait_ms as i64 {
                        timed_out.push(trade_id.clone());
                    } else if w.pings_sent < self.cfg.waiting_terms_max_pings
                        && now - w.last_ping_ms >= self.cfg.waiting_terms_ping_cooldown_ms as i64
                    {
                        w.last_ping_ms = now;
                        w.pings_sent += 1;
                        to_ping.push((trade_id.clone(), w.quote_accept_envelope.clone()));
                    }
                }
                for trade_id in &timed_out {
                    waiting.remove(trade_id);
                }
            }
            for (trade_id, envelope) in to_ping {
                let _ = self.transport.send(&self.cfg.rfq_channel, envelope, None).await;
                telemetry::periodic_action("waiting_terms_ping", &format!("trade {trade_id} re-sent QUOTE_ACCEPT"));
            }
            for trade_id in timed_out {
                telemetry::periodic_action("waiting_terms_timeout", &format!("trade {trade_id} gave up waiting for TERMS"));
                self.on_waiting_terms_timeout(trade_id).await;
            }
        }
    }

    async fn on_waiting_terms_timeout(&self, trade_id: String) {
        let mut state = self
            .receipts
            .get(&trade_id)
            .await
            .ok()
            .flatten()
            .unwrap_or_else(|| trade::initial(trade_id.clone()));
        state.last_error = Some(EngineError::WaitingTermsTimeout.to_string());
        let _ = self.receipts.upsert_trade(&state).await;

        if self.cfg.waiting_terms_leave_on_timeout {
            let swap_channel = format!("swap:{trade_id}");
            // Dropping the trade's sender ends its run_trade_task, which
            // performs the actual `leave`; if no task exists yet there is
            // nothing joined to leave.
            if self.trade_channels.lock().await.remove(&trade_id).is_none() {
                let _ = self.transport.leave(&swap_channel).await;
            }
        }
    }

    async fn handle_rfq_channel(self: Arc<Self>, envelope: Envelope) {
        if envelope.signer == self.identity.pubkey_hex() {
            return; // echo of our own broadcast
        }
        if validator::validate(&envelope).is_err() {
            return;
        }
        let EnvelopeBody::SwapInvite { swap_channel, invite } = &envelope.body else {
            return;
        };
        if invite.payload.invitee_pub_key != self.identity.pubkey_hex() {
            return; // invite addressed to someone else
        }
        self.join_invited_swap(envelope.trade_id.clone(), swap_channel.clone(), invite.clone())
            .await;
    }

    async fn join_invited_swap(self: Arc<Self>, trade_id: String, swap_channel: String, invite: SignedInvite) {
        if self.trade_channels.lock().await.contains_key(&trade_id) {
            return; // already running a task for this trade
        }
        let state = match self.receipts.get(&trade_id).await {
            Ok(Some(existing)) if existing.state.is_terminal() => return,
            Ok(Some(existing)) => existing,
            _ => trade::initial(trade_id.clone()),
        };
        let _ = self.receipts.upsert_trade(&state).await;

        let (tx, rx) = mpsc::unbounded_channel();
        self.trade_channels.lock().await.insert(trade_id.clone(), tx);
        let engine = self.clone();
        tokio::spawn(async move { engine.run_trade_task(trade_id, state, swap_channel, invite, rx).await });
    }

    fn sign_envelope(&self, trade_id: &str, body: EnvelopeBody) -> Result<Envelope> {
        let unsigned = UnsignedEnvelope {
            v: 1,
            trade_id: trade_id.to_string(),
            ts: util::now_ms(),
            nonce: util::random_hex_32(),
            body,
        };
        sign_and_attach(unsigned, &self.identity.signer)
    }

    /// Choose a quote and send `QUOTE_ACCEPT`, arming the waiting-terms
    /// replay loop for this trade. The caller (the negotiation surface
    /// that received and selected a `QUOTE`) supplies `quote_id`.
    pub async fn accept_quote(self: Arc<Self>, trade_id: &str, quote_id: String) -> Result<()> {
        let envelope = self.sign_envelope(trade_id, EnvelopeBody::QuoteAccept { quote_id })?;
        self.transport.send(&self.cfg.rfq_channel, envelope.clone(), None).await?;
        let now = util::now_ms();
        self.waiting.lock().await.insert(
            trade_id.to_string(),
            WaitingTerms {
                quote_accept_envelope: envelope,
                started_ms: now,
                last_ping_ms: now,
                pings_sent: 0,
            },
        );
        Ok(())
    }

    async fn run_trade_task(
        self: Arc<Self>,
        trade_id: String,
        mut state: TradeState,
        swap_channel: String,
        invite: SignedInvite,
        mut rx: mpsc::UnboundedReceiver<Envelope>,
    ) {
        if self.transport.join(&swap_channel, Some(invite)).await.is_ok() {
            let _ = self.transport.subscribe(&[swap_channel.clone()]).await;
        }

        while let Some(envelope) = rx.recv().await {
            self.handle_swap_envelope(&mut state, &swap_channel, envelope).await;
            if state.state.is_terminal() {
                break;
            }
        }

        let _ = self.transport.leave(&swap_channel).await;
        self.trade_channels.lock().await.remove(&trade_id);
    }

    async fn handle_swap_envelope(&self, state: &mut TradeState, swap_channel: &str, envelope: Envelope) {
        if envelope.signer == self.identity.pubkey_hex() {
            return;
        }
        if validator::validate(&envelope).is_err() {
            return;
        }

        let prev_state = state.state;
        let kind = envelope.kind();
        let terms_unsigned_hash = match kind {
            crate::envelope::EnvelopeKind::Terms => hash_hex(&envelope.unsigned()).ok(),
            _ => None,
        };
        let kind = kind.to_string();
        let applied = match trade::apply(state, &envelope) {
            Ok(s) => s,
            Err(e) => {
                telemetry::envelope_dropped(&state.trade_id, &kind, &e.to_string());
                return;
            }
        };
        *state = applied;
        telemetry::envelope_applied(
            &state.trade_id,
            &kind,
            &format!("{prev_state:?}"),
            &format!("{:?}", state.state),
        );
        let _ = self.receipts.upsert_trade(state).await;

        if prev_state == State::New && state.state == State::Terms {
            self.waiting.lock().await.remove(&state.trade_id);
            if let Some(terms_hash) = terms_unsigned_hash {
                self.on_terms(state, swap_channel, terms_hash).await;
            }
            return;
        }
        if prev_state == State::Invoice && state.state == State::Escrow {
            self.on_escrow(state, swap_channel).await;
        }
    }

    /// Validate `TERMS` against this taker's caps and, if acceptable, sign
    /// and send `ACCEPT` carrying `terms_hash = hash(TERMS_unsigned)`.
    async fn on_terms(&self, state: &mut TradeState, swap_channel: &str, terms_hash: String) {
        let Some(terms) = state.terms.clone() else { return };

        if terms.total_fee_bps() > self.cfg.max_total_fee_bps as u32 {
            self.cancel(state, swap_channel, "fee_cap_exceeded").await;
            return;
        }
        if terms.sol_recipient != self.identity.sol_claim_recipient {
            self.cancel(state, swap_channel, "recipient_mismatch").await;
            return;
        }
        if terms.sol_mint != self.identity.mint.to_string() {
            self.cancel(state, swap_channel, "mint_mismatch").await;
            return;
        }
        let now_unix = util::now_unix();
        if terms.sol_refund_after_unix < now_unix + self.cfg.min_sol_refund_window_sec as i64
            || terms.sol_refund_after_unix > now_unix + self.cfg.max_sol_refund_window_sec as i64
        {
            self.cancel(state, swap_channel, "refund_window_violation").await;
            return;
        }

        let accept_body = EnvelopeBody::Accept { terms_hash };
        let Ok(accept_envelope) = self.sign_envelope(&state.trade_id, accept_body) else { return };
        *state = match trade::apply(state, &accept_envelope) {
            Ok(s) => s,
            Err(_) => return,
        };
        let _ = self.receipts.upsert_trade(state).await;
        let _ = self.transport.send(swap_channel, accept_envelope, None).await;
    }

    async fn on_escrow(&self, state: &mut TradeState, swap_channel: &str) {
        let (Some(terms), Some(escrow), Some(invoice)) =
            (state.terms.clone(), state.sol_escrow.clone(), state.ln_invoice.clone())
        else {
            return;
        };

        let claim = ClaimedEscrow {
            program_id: &escrow.program_id,
            mint: &escrow.mint,
            recipient: &escrow.recipient,
            refund: &escrow.refund,
            payment_hash: &escrow.payment_hash,
            refund_after_unix: escrow.refund_after_unix,
            net_amount: escrow.amount,
        };
        let verification = match self.escrow.verify_escrow_on_chain(&claim).await {
            Ok(v) => v,
            Err(e) => {
                telemetry::side_effect(&state.trade_id, "sol_verify_escrow", false, &e.to_string());
                state.last_error = Some(e.to_string());
                let _ = self.receipts.upsert_trade(state).await;
                return;
            }
        };
        if !verification.ok {
            telemetry::side_effect(
                &state.trade_id,
                "sol_verify_escrow",
                false,
                verification.error.as_deref().unwrap_or("mismatch"),
            );
            state.last_error = verification.error.clone();
            let _ = self.receipts.upsert_trade(state).await;
            self.cancel(state, swap_channel, "escrow_mismatch").await;
            return;
        }
        telemetry::side_effect(&state.trade_id, "sol_verify_escrow", true, "ok");

        let payment = match self.lightning.pay_invoice(&invoice.bolt11).await {
            Ok(p) => p,
            Err(e) => {
                // Retried within the swap timeout budget: the maker's
                // resend cadence keeps re-delivering SOL_ESCROW_CREATED,
                // which re-enters this function on the next tick.
                telemetry::side_effect(&state.trade_id, "ln_pay_invoice", false, &e.to_string());
                state.last_error = Some(e.to_string());
                let _ = self.receipts.upsert_trade(state).await;
                return;
            }
        };
        telemetry::side_effect(&state.trade_id, "ln_pay_invoice", true, &payment.payment_hash_hex);
        let _ = self
            .receipts
            .append_event(TradeEvent {
                trade_id: state.trade_id.clone(),
                seq: 0,
                ts_unix_ms: util::now_ms(),
                kind: "ln_paid".to_string(),
                envelope: None,
                note: Some(payment.payment_hash_hex.clone()),
            })
            .await;

        let Ok(preimage_bytes) = hex::decode(&payment.preimage_hex) else { return };
        let Ok(preimage): std::result::Result<[u8; 32], _> = preimage_bytes.try_into() else { return };
        let Ok(payment_hash_bytes) = hex::decode(&escrow.payment_hash) else { return };
        let Ok(payment_hash): std::result::Result<[u8; 32], _> = payment_hash_bytes.try_into() else {
            return;
        };
        let Ok(trade_fee_collector) = Pubkey::from_str(&terms.trade_fee_collector) else { return };

        let claim_sig = match self
            .escrow
            .claim_escrow_tx(
                &self.identity.solana_claimant,
                &self.identity.claimant_token_account,
                &self.identity.mint,
                &payment_hash,
                &preimage,
                &trade_fee_collector,
            )
            .await
        {
            Ok(sig) => sig,
            Err(e) => {
                // Retryable up to refund_after_unix; beyond that this is
                // the fatal "paid LN but cannot claim SPL" case, flagged
                // for operator attention via last_error.
                telemetry::side_effect(&state.trade_id, "sol_claim_escrow", false, &e.to_string());
                state.last_error = Some(e.to_string());
                let _ = self.receipts.upsert_trade(state).await;
                return;
            }
        };
        telemetry::side_effect(&state.trade_id, "sol_claim_escrow", true, &claim_sig.to_string());

        let status_body = EnvelopeBody::Status {
            ln_paid: None,
            claimed: Some(true),
            refunded: None,
            tx_sig: Some(claim_sig.to_string()),
        };
        let Ok(status_envelope) = self.sign_envelope(&state.trade_id, status_body) else { return };
        *state = match trade::apply(state, &status_envelope) {
            Ok(s) => s,
            Err(_) => return,
        };
        let _ = self.receipts.upsert_trade(state).await;
        let _ = self.transport.send(swap_channel, status_envelope, None).await;
    }

    async fn cancel(&self, state: &mut TradeState, swap_channel: &str, reason: &str) {
        let Ok(cancel_envelope) = self.sign_envelope(
            &state.trade_id,
            EnvelopeBody::Cancel { reason: Some(reason.to_string()) },
        ) else {
            return;
        };
        if let Ok(applied) = trade::apply(state, &cancel_envelope) {
            *state = applied;
        }
        let _ = self.receipts.upsert_trade(state).await;
        let _ = self.transport.send(swap_channel, cancel_envelope, None).await;
    }
}
