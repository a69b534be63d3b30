//! Lightning client (C5): invoice issuance, payment and BOLT-11 decoding.
//! The Lightning node itself is out of scope; this talks to it over its
//! HTTP JSON-RPC surface (Core-Lightning's `commando`/REST style API).

use crate::error::{EngineError, Result};
use async_trait::async_trait;
use lightning_invoice::Bolt11Invoice;
use serde::Deserialize;
use std::str::FromStr;
use std::time::Duration;

/// A freshly minted hold/plain invoice.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LnInvoiceCreated {
    pub bolt11: String,
    pub payment_hash_hex: String,
    pub expires_at_unix: i64,
}

/// Outcome of paying a BOLT-11 invoice.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LnPaymentResult {
    pub preimage_hex: String,
    pub payment_hash_hex: String,
}

/// Fields recovered by decoding a BOLT-11 string, independent of whether
/// this node issued or will pay it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DecodedInvoice {
    pub payment_hash_hex: String,
    pub amount_msat: Option<u64>,
    pub expires_at_unix: i64,
    pub description: Option<String>,
}

#[async_trait]
pub trait LightningClient: Send + Sync {
    /// Issue an invoice for `amount_msat` with the given description and
    /// expiry, returning its BOLT-11 encoding and payment hash.
    async fn create_invoice(
        &self,
        amount_msat: u64,
        description: &str,
        expiry_secs: u32,
    ) -> Result<LnInvoiceCreated>;

    /// Pay a BOLT-11 invoice, blocking until settlement or failure.
    async fn pay_invoice(&self, bolt11: &str) -> Result<LnPaymentResult>;

    /// Decode a BOLT-11 string without contacting the node (pure parse).
    fn decode_invoice(&self, bolt11: &str) -> Result<DecodedInvoice>;
}

/// Decode a BOLT-11 invoice using `lightning-invoice`; shared by the RPC
/// client and tests so both agree on what "decode" means.
pub fn decode_bolt11(bolt11: &str) -> Result<DecodedInvoice> {
    let invoice = Bolt11Invoice::from_str(bolt11)
        .map_err(|e| EngineError::SchemaInvalid(format!("invalid bolt11: {e}")))?;
    let payment_hash_hex = hex::encode(invoice.payment_hash().as_ref());
    let amount_msat = invoice.amount_milli_satoshis();
    let expires_at_unix = invoice
        .timestamp()
        .checked_add(invoice.expiry_time())
        .map(|t| t.as_secs() as i64)
        .ok_or_else(|| EngineError::SchemaInvalid("bolt11 expiry overflow".into()))?;
    let description = match invoice.description() {
        lightning_invoice::Bolt11InvoiceDescription::Direct(d) => Some(d.to_string()),
        lightning_invoice::Bolt11InvoiceDescription::Hash(_) => None,
    };
    Ok(DecodedInvoice {
        payment_hash_hex,
        amount_msat,
        expires_at_unix,
        description,
    })
}

#[derive(Deserialize)]
struct InvoiceResponse {
    bolt11: String,
    payment_hash: String,
    expires_at: i64,
}

#[derive(Deserialize)]
struct PayResponse {
    payment_preimage: String,
    payment_hash: String,
}

/// `LightningClient` backed by a Core-Lightning-style REST/JSON-RPC node,
/// authenticating with a rune/macaroon bearer token.
pub struct CoreLightningRpcClient {
    base_url: String,
    rune: String,
    http: reqwest::Client,
}

impl CoreLightningRpcClient {
    pub fn new(base_url: impl Into<String>, rune: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            rune: rune.into(),
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(30))
                .build()
                .expect("reqwest client construction is infallible with these options"),
        }
    }
}

#[async_trait]
impl LightningClient for CoreLightningRpcClient {
    async fn create_invoice(
        &self,
        amount_msat: u64,
        description: &str,
        expiry_secs: u32,
    ) -> Result<LnInvoiceCreated> {
        let body = serde_json::json!({
            "amount_msat": amount_msat,
            "description": description,
            "expiry": expiry_secs,
        });
        let resp = self
            .http
            .post(format!("{}/v1/invoice", self.base_url))
            .header("Rune", &self.rune)
            .json(&body)
            .send()
            .await
            .map_err(|e| EngineError::LnInvoiceFailed(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(EngineError::LnInvoiceFailed(format!(
                "node returned {}",
                resp.status()
            )));
        }
        let parsed: InvoiceResponse = resp
            .json()
            .await
            .map_err(|e| EngineError::LnInvoiceFailed(e.to_string()))?;
        Ok(LnInvoiceCreated {
            bolt11: parsed.bolt11,
            payment_hash_hex: parsed.payment_hash,
            expires_at_unix: parsed.expires_at,
        })
    }

    async fn pay_invoice(&self, bolt11: &str) -> Result<LnPaymentResult> {
        let body = serde_json::json!({ "bolt11": bolt11 });
        let resp = self
            .http
            .post(format!("{}/v1/pay", self.base_url))
            .header("Rune", &self.rune)
            .json(&body)
            .send()
            .await
            .map_err(|e| EngineError::LnPayFailed(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(EngineError::LnPayFailed(format!(
                "node returned {}",
                resp.status()
            )));
        }
        let parsed: PayResponse = resp
            .json()
            .await
            .map_err(|e| EngineError::LnPayFailed(e.to_string()))?;
        Ok(LnPaymentResult {
            preimage_hex: parsed.payment_preimage,
            payment_hash_hex: parsed.payment_hash,
        })
    }

    fn decode_invoice(&self, bolt11: &str) -> Result<DecodedInvoice> {
        decode_bolt11(bolt11)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_garbage_bolt11() {
        assert!(decode_bolt11("not-an-invoice").is_err());
    }
}
