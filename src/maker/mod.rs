//! Maker engine (C8): RFQ -> quote -> invite -> terms -> invoice -> escrow,
//! with RFQ locks serializing concurrent acceptances and a bounded resend
//! cadence per swap.

pub mod lock;

use crate::config::EngineConfig;
use crate::envelope::canonical::hash_hex;
use crate::envelope::sign::{sign_and_attach, sign_payload};
use crate::envelope::{Direction, Envelope, EnvelopeBody, InvitePayload, SignedInvite, UnsignedEnvelope};
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
use lock::{LockState, RfqLock, RfqLockKey};
use solana_sdk::pubkey::Pubkey;
use solana_sdk::signature::Keypair;
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};

/// Key material and on-chain addresses this maker process settles with.
pub struct MakerIdentity {
    pub signer: SigningKey,
    pub sol_refund: String,
    pub platform_fee_collector: String,
    pub trade_fee_collector: String,
    pub ln_receiver_peer: String,
    pub solana_payer: Keypair,
    pub payer_token_account: Pubkey,
    pub mint: Pubkey,
}

impl MakerIdentity {
    pub fn pubkey_hex(&self) -> String {
        hex::encode(self.signer.verifying_key().to_bytes())
    }
}

pub struct MakerEngine {
    cfg: EngineConfig,
    identity: MakerIdentity,
    transport: Arc<dyn Transport>,
    escrow: Arc<dyn EscrowClient>,
    lightning: Arc<dyn LightningClient>,
    receipts: Arc<dyn ReceiptsStore>,
    locks: Mutex<HashMap<RfqLockKey, RfqLock>>,
    lock_by_trade: Mutex<HashMap<String, RfqLockKey>>,
    trade_channels: Mutex<HashMap<String, mpsc::UnboundedSender<Envelope>>>,
}

impl MakerEngine {
    pub fn new(
        cfg: EngineConfig,
        identity: MakerIdentity,
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
            locks: Mutex::new(HashMap::new()),
            lock_by_trade: Mutex::new(HashMap::new()),
            trade_channels: Mutex::new(HashMap::new()),
        })
    }

    /// Drive the engine from an inbound event stream until the channel
    /// closes or `shutdown` fires. Spawns the RFQ-lock pruning task
    /// alongside.
    pub async fn run(self: Arc<Self>, mut inbound: mpsc::UnboundedReceiver<Inbound>, mut shutdown: watch::Receiver<bool>) {
        let pruner = self.clone();
        tokio::spawn(async move { pruner.prune_locks_loop().await });

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
                        // Unknown trade_id: this maker did not originate it, drop.
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

    async fn prune_locks_loop(self: Arc<Self>) {
        let mut interval = tokio::time::interval(Duration::from_millis(self.cfg.rfq_lock_prune_interval_ms));
        loop {
            interval.tick().await;
            let now_unix = util::now_unix();
            let now_ms = util::now_ms();
            let mut locks = self.locks.lock().await;
            let before = locks.len();
            locks.retain(|_, lock| match lock.state {
                LockState::Quoted => lock.quote_valid_until_unix > now_unix,
                LockState::Accepting | LockState::Swapping => lock.lock_deadline_ms > now_ms,
            });
            let pruned = before - locks.len();
            drop(locks);
            if pruned > 0 {
                telemetry::periodic_action("prune_locks", &format!("pruned {pruned} expired rfq lock(s)"));
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
        match &envelope.body {
            EnvelopeBody::Rfq { app_hash, .. } => {
                if validator::check_app_hash(app_hash, &self.cfg.app_hash).is_err() {
                    return;
                }
                self.handle_rfq(envelope).await;
            }
            EnvelopeBody::QuoteAccept { .. } => self.handle_quote_accept(envelope).await,
            _ => {}
        }
    }

    async fn handle_rfq(self: Arc<Self>, rfq: Envelope) {
        let Some(key) = RfqLockKey::from_rfq(&rfq) else { return };
        let EnvelopeBody::Rfq {
            sol_recipient,
            max_platform_fee_bps,
            max_trade_fee_bps,
            max_total_fee_bps,
            min_sol_refund_window_sec,
            max_sol_refund_window_sec,
            ..
        } = &rfq.body
        else {
            return;
        };

        if self.cfg.enable_settlement && sol_recipient.is_none() {
            return;
        }
        if self.cfg.platform_fee_bps > *max_platform_fee_bps
            || self.cfg.trade_fee_bps > *max_trade_fee_bps
            || (self.cfg.platform_fee_bps + self.cfg.trade_fee_bps) as u16 > *max_total_fee_bps
        {
            return;
        }
        if self.cfg.maker_refund_window_sec < *min_sol_refund_window_sec
            || self.cfg.maker_refund_window_sec > *max_sol_refund_window_sec
        {
            return;
        }

        let mut locks = self.locks.lock().await;
        if let Some(existing) = locks.get_mut(&key) {
            match existing.state {
                LockState::Quoted if existing.quote_valid_until_unix > util::now_unix() => {
                    let _ = self
                        .transport
                        .send(&self.cfg.rfq_channel, existing.signed_quote.clone(), None)
                        .await;
                    return;
                }
                LockState::Quoted => {}
                LockState::Accepting | LockState::Swapping => return,
            }
        }
        drop(locks);

        let quote = match self.build_quote(&rfq, &key).await {
            Ok(q) => q,
            Err(_) => return,
        };
        if validator::coherent_quote_against_rfq(&quote, &rfq).is_err() {
            return;
        }
        let quote_valid_until_unix = match &quote.body {
            EnvelopeBody::Quote { quote_valid_until_unix, .. } => *quote_valid_until_unix,
            _ => return,
        };
        let _ = self.transport.send(&self.cfg.rfq_channel, quote.clone(), None).await;

        let lock = RfqLock::quoted(quote, quote_valid_until_unix, util::now_ms());
        self.locks.lock().await.insert(key.clone(), lock);
        self.lock_by_trade.lock().await.insert(key.trade_id.clone(), key);
    }

    async fn build_quote(&self, rfq: &Envelope, key: &RfqLockKey) -> Result<Envelope> {
        let rfq_id = hash_hex(&rfq.unsigned())?;
        let body = EnvelopeBody::Quote {
            rfq_id,
            app_hash: key.app_hash.clone(),
            btc_sats: key.btc_sats,
            usdt_amount: key.usdt_amount.clone(),
            usdt_decimals: 6,
            sol_mint: key.sol_mint.clone(),
            sol_recipient: key.sol_recipient.clone().unwrap_or_default(),
            platform_fee_bps: self.cfg.platform_fee_bps,
            trade_fee_bps: self.cfg.trade_fee_bps,
            quote_valid_until_unix: util::now_unix() + self.cfg.quote_valid_sec as i64,
        };
        self.sign_envelope(&key.trade_id, body)
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

    async fn handle_quote_accept(self: Arc<Self>, accept: Envelope) {
        let trade_id = accept.trade_id.clone();
        let key = match self.lock_by_trade.lock().await.get(&trade_id).cloned() {
            Some(k) => k,
            None => return,
        };
        if accept.signer != key.signer {
            return; // not the original RFQ signer: quote hijack attempt
        }
        if !matches!(&accept.body, EnvelopeBody::QuoteAccept { .. }) {
            return;
        }

        let mut locks = self.locks.lock().await;
        let Some(lock) = locks.get_mut(&key) else { return };
        if validator::coherent_accept_against_quote(&accept, &lock.signed_quote).is_err() {
            return;
        }

        match lock.state {
            LockState::Accepting | LockState::Swapping => {
                let now = util::now_ms();
                if now - lock.last_seen_ms < self.cfg.retry_resend_min_ms as i64 {
                    return;
                }
                lock.last_seen_ms = now;
                let invite = lock.swap_invite_envelope.clone();
                let terms = lock.terms_envelope.clone();
                let swap_channel = lock.swap_channel.clone();
                drop(locks);
                if let Some(invite) = invite {
                    let _ = self.transport.send(&self.cfg.rfq_channel, invite, None).await;
                }
                if let (Some(terms), Some(swap_channel)) = (terms, swap_channel) {
                    let _ = self.transport.send(&swap_channel, terms, None).await;
                }
            }
            LockState::Quoted => {
                lock.state = LockState::Accepting;
                lock.last_seen_ms = util::now_ms();
                lock.lock_deadline_ms = util::now_ms() + self.cfg.accepting_lock_deadline_ms;
                let quote = lock.signed_quote.clone();
                drop(locks);
                self.start_swap(key, accept, quote).await;
            }
        }
    }

    async fn start_swap(self: Arc<Self>, key: RfqLockKey, accept: Envelope, quote: Envelope) {
        let trade_id = key.trade_id.clone();
        let swap_channel = format!("swap:{trade_id}");

        let invite_payload = InvitePayload {
            invitee_pub_key: accept.signer.clone(),
            inviter_pub_key: self.identity.pubkey_hex(),
            expires_at: util::now_unix() + self.cfg.swap_timeout_sec as i64,
        };
        let sig = match sign_payload(&invite_payload, &self.identity.signer) {
            Ok(s) => s,
            Err(_) => return,
        };
        let invite = SignedInvite { payload: invite_payload, sig };

        let swap_invite_body = EnvelopeBody::SwapInvite {
            swap_channel: swap_channel.clone(),
            invite: invite.clone(),
        };
        let swap_invite_envelope = match self.sign_envelope(&trade_id, swap_invite_body) {
            Ok(e) => e,
            Err(_) => return,
        };
        let _ = self
            .transport
            .send(&self.cfg.rfq_channel, swap_invite_envelope.clone(), None)
            .await;
        if self.transport.join(&swap_channel, Some(invite)).await.is_err() {
            return;
        }
        let _ = self.transport.subscribe(&[swap_channel.clone()]).await;

        let Some(sol_recipient) = key.sol_recipient.clone() else { return };
        let EnvelopeBody::Quote { platform_fee_bps, trade_fee_bps, .. } = &quote.body else {
            return;
        };
        let terms_body = EnvelopeBody::Terms {
            pair: key.pair.clone(),
            direction: if key.direction_tag == 0 {
                Direction::MakerSellsBtc
            } else {
                Direction::MakerSellsSpl
            },
            app_hash: key.app_hash.clone(),
            btc_sats: key.btc_sats,
            usdt_amount: key.usdt_amount.clone(),
            usdt_decimals: 6,
            sol_mint: key.sol_mint.clone(),
            sol_recipient,
            sol_refund: self.identity.sol_refund.clone(),
            sol_refund_after_unix: util::now_unix() + self.cfg.maker_refund_window_sec as i64,
            platform_fee_bps: *platform_fee_bps,
            platform_fee_collector: self.identity.platform_fee_collector.clone(),
            trade_fee_bps: *trade_fee_bps,
            trade_fee_collector: self.identity.trade_fee_collector.clone(),
            ln_receiver_peer: self.identity.ln_receiver_peer.clone(),
            ln_payer_peer: accept.signer.clone(),
            terms_valid_until_unix: util::now_unix() + self.cfg.terms_valid_sec as i64,
        };
        let terms_envelope = match self.sign_envelope(&trade_id, terms_body) {
            Ok(e) => e,
            Err(_) => return,
        };
        let _ = self.transport.send(&swap_channel, terms_envelope.clone(), None).await;

        let mut state = trade::initial(trade_id.clone());
        state = match trade::apply(&state, &terms_envelope) {
            Ok(s) => s,
            Err(_) => return,
        };
        let _ = self.receipts.upsert_trade(&state).await;

        {
            let mut locks = self.locks.lock().await;
            if let Some(lock) = locks.get_mut(&key) {
                lock.state = LockState::Swapping;
                lock.swap_channel = Some(swap_channel.clone());
                lock.invitee_pubkey = Some(accept.signer.clone());
                lock.swap_invite_envelope = Some(swap_invite_envelope);
                lock.terms_envelope = Some(terms_envelope.clone());
            }
        }

        let (tx, rx) = mpsc::unbounded_channel();
        self.trade_channels.lock().await.insert(trade_id.clone(), tx);
        let engine = self.clone();
        tokio::spawn(async move { engine.run_trade_task(trade_id, state, swap_channel, terms_envelope, rx).await });
    }

    async fn run_trade_task(
        self: Arc<Self>,
        trade_id: String,
        mut state: TradeState,
        swap_channel: String,
        terms_envelope: Envelope,
        mut rx: mpsc::UnboundedReceiver<Envelope>,
    ) {
        let deadline_ms = util::now_ms() + self.cfg.swap_timeout_sec as i64 * 1000;
        let mut last_peer_seen_ms = util::now_ms();
        let mut last_sent = terms_envelope;
        let mut resend_interval = tokio::time::interval(Duration::from_millis(self.cfg.resend_baseline_ms));

        loop {
            tokio::select! {
                maybe = rx.recv() => {
                    match maybe {
                        Some(envelope) => {
                            last_peer_seen_ms = util::now_ms();
                            if let Some(sent) = self.handle_swap_envelope(&mut state, &swap_channel, envelope).await {
                                last_sent = sent;
                            }
                            if state.state.is_terminal() {
                                break;
                            }
                        }
                        None => break,
                    }
                }
                _ = resend_interval.tick() => {
                    if state.state.is_terminal() {
                        break;
                    }
                    if util::now_ms() >= deadline_ms {
                        self.on_swap_timeout(&mut state, &swap_channel).await;
                        break;
                    }
                    let _ = self.transport.send(&swap_channel, last_sent.clone(), None).await;
                    telemetry::periodic_action("resend", &format!("trade {trade_id} resent last envelope"));
                    if util::now_ms() - last_peer_seen_ms > self.cfg.resend_widen_after_silence_ms as i64 {
                        resend_interval = tokio::time::interval(Duration::from_millis(self.cfg.resend_widened_ms));
                    }
                }
            }
        }

        let _ = self.transport.leave(&swap_channel).await;
        self.trade_channels.lock().await.remove(&trade_id);
    }

    /// Apply an inbound swap-channel envelope and run any side effects it
    /// triggers. Returns the latest outbound envelope the resend cadence
    /// should keep re-sending, if this call produced one.
    async fn handle_swap_envelope(
        &self,
        state: &mut TradeState,
        swap_channel: &str,
        envelope: Envelope,
    ) -> Option<Envelope> {
        if envelope.signer == self.identity.pubkey_hex() {
            return None;
        }
        if validator::validate(&envelope).is_err() {
            return None;
        }

        if matches!(state.state, State::Terms) && matches!(envelope.body, EnvelopeBody::Status { .. }) {
            // Taker joined before observing TERMS: the resend cadence
            // already retransmits the last outbound envelope (TERMS, at
            // this point) on its next tick, converging without a special
            // reply here.
            return None;
        }

        let prev_state = state.state;
        let kind = envelope.kind().to_string();
        let applied = match trade::apply(state, &envelope) {
            Ok(s) => s,
            Err(e) => {
                telemetry::envelope_dropped(&state.trade_id, &kind, &e.to_string());
                return None;
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

        if prev_state == State::Terms && state.state == State::Accepted {
            return self.on_accept(state, swap_channel).await;
        }
        None
    }

    async fn on_accept(&self, state: &mut TradeState, swap_channel: &str) -> Option<Envelope> {
        let terms = state.terms.clone()?;
        let net_amount = terms.usdt_amount_u64().ok()?;

        let invoice = match self
            .lightning
            .create_invoice(
                terms.btc_sats * 1000,
                &format!("intercom-swap {}", state.trade_id),
                self.cfg.invoice_expiry_sec,
            )
            .await
        {
            Ok(inv) => inv,
            Err(e) => {
                telemetry::side_effect(&state.trade_id, "ln_create_invoice", false, &e.to_string());
                state.last_error = Some(e.to_string());
                let _ = self.receipts.upsert_trade(state).await;
                return None;
            }
        };
        telemetry::side_effect(&state.trade_id, "ln_create_invoice", true, &invoice.payment_hash_hex);

        let invoice_body = EnvelopeBody::LnInvoice {
            bolt11: invoice.bolt11.clone(),
            payment_hash_hex: invoice.payment_hash_hex.clone(),
            amount_msat: terms.btc_sats * 1000,
            expires_at_unix: invoice.expires_at_unix,
        };
        let invoice_envelope = self.sign_envelope(&state.trade_id, invoice_body).ok()?;
        *state = trade::apply(state, &invoice_envelope).ok()?;
        let _ = self.receipts.upsert_trade(state).await;
        let _ = self.transport.send(swap_channel, invoice_envelope.clone(), None).await;

        let payment_hash_bytes = hex::decode(&invoice.payment_hash_hex).ok()?;
        let payment_hash: [u8; 32] = payment_hash_bytes.try_into().ok()?;
        let recipient = Pubkey::from_str(&terms.sol_recipient).ok()?;
        let refund = Pubkey::from_str(&terms.sol_refund).ok()?;
        let trade_fee_collector = Pubkey::from_str(&terms.trade_fee_collector).ok()?;

        let result = self
            .escrow
            .create_escrow_tx(
                &self.identity.solana_payer,
                &self.identity.payer_token_account,
                &self.identity.mint,
                &payment_hash,
                &recipient,
                &refund,
                terms.sol_refund_after_unix,
                net_amount,
                terms.platform_fee_bps,
                terms.trade_fee_bps,
                &trade_fee_collector,
            )
            .await;
        let (sig, escrow_pda, vault_ata) = match result {
            Ok(triple) => triple,
            Err(e) => {
                telemetry::side_effect(&state.trade_id, "sol_create_escrow", false, &e.to_string());
                state.last_error = Some(e.to_string());
                let _ = self.receipts.upsert_trade(state).await;
                // Resend cadence keeps re-broadcasting the invoice until a
                // future tick; roll forward is retried by the operator via
                // the receipts store in the meantime.
                return Some(invoice_envelope);
            }
        };
        telemetry::side_effect(&state.trade_id, "sol_create_escrow", true, &sig.to_string());

        let escrow_body = EnvelopeBody::SolEscrowCreated {
            program_id: self.escrow_program_id(),
            escrow_pda: escrow_pda.to_string(),
            vault_ata: vault_ata.to_string(),
            mint: self.identity.mint.to_string(),
            amount: net_amount,
            payment_hash: invoice.payment_hash_hex,
            refund_after_unix: terms.sol_refund_after_unix,
            recipient: terms.sol_recipient.clone(),
            refund: terms.sol_refund.clone(),
            tx_sig: sig.to_string(),
        };
        let escrow_envelope = self.sign_envelope(&state.trade_id, escrow_body).ok()?;
        *state = trade::apply(state, &escrow_envelope).ok()?;
        let _ = self.receipts.upsert_trade(state).await;
        let _ = self
            .receipts
            .append_event(TradeEvent {
                trade_id: state.trade_id.clone(),
                seq: 0,
                ts_unix_ms: util::now_ms(),
                kind: "sol_escrow_created".to_string(),
                envelope: Some(escrow_envelope.clone()),
                note: None,
            })
            .await;
        let _ = self.transport.send(swap_channel, escrow_envelope.clone(), None).await;
        Some(escrow_envelope)
    }

    fn escrow_program_id(&self) -> String {
        self.cfg.escrow_program_id.clone()
    }

    async fn on_swap_timeout(&self, state: &mut TradeState, swap_channel: &str) {
        if matches!(state.state, State::New | State::Terms | State::Accepted) {
            if let Ok(cancel) = self.sign_envelope(&state.trade_id, EnvelopeBody::Cancel { reason: Some("swap_timeout".into()) }) {
                let _ = self.transport.send(swap_channel, cancel, None).await;
            }
        }
        state.last_error = Some(EngineError::SwapTimeout.to_string());
        let _ = self.receipts.upsert_trade(state).await;
    }

    /// Surface the verification guard used by takers, re-exported here so
    /// a maker-side recovery tool can double-check its own escrow before
    /// retrying a claim/refund.
    pub async fn verify_own_escrow(&self, claim: &ClaimedEscrow<'_>) -> Result<bool> {
        Ok(self.escrow.verify_escrow_on_chain(claim).await?.ok)
    }
}
