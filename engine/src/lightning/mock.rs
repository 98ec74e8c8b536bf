//! # MockNode — In-Memory Payment Network
//!
//! A deterministic, regtest-flavored implementation of [`LightningNode`]
//! for tests and local development. It hosts invoices, simulates inbound
//! HTLC acceptance, resolves outgoing payments (immediately or on demand),
//! and feeds the same event streams the reconciliation worker consumes in
//! production.
//!
//! Everything lives behind one mutex. This is a test double, not a
//! throughput machine — clarity beats cleverness here.
//!
//! ## Driving the network from tests
//!
//! - [`receive_payment`](MockNode::receive_payment) — a payer settles one
//!   of our plain invoices.
//! - [`receive_htlc`](MockNode::receive_htlc) — a payer's HTLCs are
//!   accepted against one of our hold invoices (the invoice becomes held).
//! - [`expire_invoice`](MockNode::expire_invoice) — the network gives up
//!   on an unpaid invoice.
//! - [`resolve_payment`](MockNode::resolve_payment) — finish an in-flight
//!   outgoing payment when `hold_payments(true)` is set.
//! - [`kill_subscriptions`](MockNode::kill_subscriptions) — drop every
//!   live event stream, as a flaky transport would.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use tokio::sync::mpsc;

use super::{
    Bolt11, CreatedInvoice, InvoiceParams, InvoiceState, LightningError, LightningNode,
    ParsedInvoice, PayRequest, PaymentFailure, PaymentHash, PaymentState, Preimage,
    RouteFeeEstimate,
};

/// Default final-hop cltv delta for mock invoices, in blocks.
const DEFAULT_CLTV_DELTA: u64 = 40;

/// Default routing fee returned by the mock estimator.
const DEFAULT_ROUTING_FEE_MSATS: u64 = 1_000;

/// Hex-encode the sha256 of a hex-encoded preimage.
pub fn preimage_hash(preimage: &str) -> Result<PaymentHash, LightningError> {
    let bytes = hex::decode(preimage)
        .map_err(|e| LightningError::Rejected(format!("bad preimage hex: {e}")))?;
    Ok(hex::encode(Sha256::digest(&bytes)))
}

struct MockInvoice {
    state: InvoiceState,
    /// Known for invoices we generated ourselves; absent for hold invoices
    /// issued under an external hash.
    preimage: Option<Preimage>,
    is_hold: bool,
    cltv_delta: u64,
}

#[derive(Default)]
struct MockState {
    height: u64,
    seq: u64,
    confirmed_counter: u64,
    invoices: HashMap<PaymentHash, MockInvoice>,
    /// bolt11 -> decoded request, for everything this node can parse.
    requests: HashMap<Bolt11, ParsedInvoice>,
    /// Preimages of externally hosted requests, for simulating payment.
    external_preimages: HashMap<PaymentHash, Preimage>,
    payments: HashMap<PaymentHash, PaymentState>,
    scripted_failures: HashMap<PaymentHash, PaymentFailure>,
    /// When true, outgoing payments stay in flight until resolved by hand.
    hold_payments: bool,
    /// When true, invoice issuance fails, as a dead node would.
    fail_invoice_creation: bool,
    fee_estimate: Option<RouteFeeEstimate>,
    fee_estimate_error: Option<String>,
    invoice_subs: Vec<mpsc::UnboundedSender<InvoiceState>>,
    single_subs: Vec<(PaymentHash, mpsc::UnboundedSender<InvoiceState>)>,
    payment_subs: Vec<mpsc::UnboundedSender<PaymentState>>,
}

/// In-memory payment network. Cheap to clone via `Arc`.
pub struct MockNode {
    state: Mutex<MockState>,
}

impl Default for MockNode {
    fn default() -> Self {
        Self::new()
    }
}

impl MockNode {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MockState {
                height: 800_000,
                ..MockState::default()
            }),
        }
    }

    // -- Test drivers -------------------------------------------------------

    /// Set the mock chain height.
    pub fn set_height(&self, height: u64) {
        self.state.lock().height = height;
    }

    /// Script the next route-fee estimate.
    pub fn set_fee_estimate(&self, estimate: RouteFeeEstimate) {
        let mut s = self.state.lock();
        s.fee_estimate = Some(estimate);
        s.fee_estimate_error = None;
    }

    /// Make route-fee estimation fail with the given message.
    pub fn fail_fee_estimate(&self, message: &str) {
        self.state.lock().fee_estimate_error = Some(message.to_string());
    }

    /// Keep outgoing payments in flight until [`resolve_payment`](Self::resolve_payment).
    pub fn hold_payments(&self, hold: bool) {
        self.state.lock().hold_payments = hold;
    }

    /// Make invoice issuance fail, as a dead node would.
    pub fn fail_invoice_creation(&self, fail: bool) {
        self.state.lock().fail_invoice_creation = fail;
    }

    /// Script a terminal failure for the payment of the given hash.
    pub fn script_payment_failure(&self, hash: &str, failure: PaymentFailure) {
        self.state
            .lock()
            .scripted_failures
            .insert(hash.to_string(), failure);
    }

    /// Register a payment request hosted by some other node, so this node
    /// can parse and pay it. Returns the encoded request.
    pub fn register_payment_request(
        &self,
        parsed: ParsedInvoice,
        preimage: Option<Preimage>,
    ) -> Bolt11 {
        let mut s = self.state.lock();
        s.seq += 1;
        let bolt11 = format!("lnmock1ext{}{}", s.seq, &parsed.hash[..8]);
        if let Some(p) = preimage {
            s.external_preimages.insert(parsed.hash.clone(), p);
        }
        s.requests.insert(bolt11.clone(), parsed);
        bolt11
    }

    /// Issue an invoice that lives on a *remote* node: parseable and
    /// payable from here, but not hosted here. This is what a recipient's
    /// wallet hands us on the peer-relay path.
    pub fn issue_external_invoice(
        &self,
        msats: u64,
        description: Option<String>,
        expiry_secs: i64,
    ) -> Bolt11 {
        let bytes: [u8; 32] = rand::random();
        let preimage = hex::encode(bytes);
        let hash = hex::encode(Sha256::digest(bytes));
        self.register_payment_request(
            ParsedInvoice {
                hash,
                msats: Some(msats),
                expires_at: Utc::now() + ChronoDuration::seconds(expiry_secs),
                cltv_delta: DEFAULT_CLTV_DELTA,
                destination: "mock-peer".to_string(),
                features: vec![8, 14, 16],
                description,
                description_hash: None,
            },
            Some(preimage),
        )
    }

    /// A payer settles one of our plain invoices.
    pub fn receive_payment(&self, hash: &str) {
        let snapshot = {
            let mut s = self.state.lock();
            let counter = {
                s.confirmed_counter += 1;
                s.confirmed_counter
            };
            let inv = s.invoices.get_mut(hash).expect("unknown invoice");
            inv.state.is_confirmed = true;
            inv.state.is_held = false;
            inv.state.msats_received = inv.state.msats_requested;
            inv.state.confirmed_at = Some(Utc::now());
            inv.state.confirmed_index = Some(counter);
            inv.state.clone()
        };
        self.emit_invoice(snapshot);
    }

    /// A payer's HTLCs are accepted against one of our hold invoices.
    pub fn receive_htlc(&self, hash: &str) {
        let snapshot = {
            let mut s = self.state.lock();
            let height = s.height;
            let inv = s.invoices.get_mut(hash).expect("unknown invoice");
            inv.state.is_held = true;
            inv.state.msats_received = inv.state.msats_requested;
            inv.state.accept_height = Some(height);
            inv.state.expiry_height = Some(height + inv.cltv_delta);
            inv.state.clone()
        };
        self.emit_invoice(snapshot);
    }

    /// The network gives up on an unpaid (or held) invoice.
    pub fn expire_invoice(&self, hash: &str) {
        let snapshot = {
            let mut s = self.state.lock();
            let inv = s.invoices.get_mut(hash).expect("unknown invoice");
            assert!(!inv.state.is_confirmed, "cannot expire a settled invoice");
            inv.state.is_canceled = true;
            inv.state.is_held = false;
            inv.state.clone()
        };
        self.emit_invoice(snapshot);
    }

    /// Resolve an in-flight outgoing payment. `Ok(())` confirms it using
    /// the destination invoice's preimage; `Err` fails it.
    pub fn resolve_payment(&self, hash: &str, outcome: Result<(), PaymentFailure>) {
        match outcome {
            Ok(()) => self.confirm_payment(hash),
            Err(failure) => self.fail_payment(hash, failure),
        }
    }

    /// Drop every live event stream, as a flaky transport would.
    pub fn kill_subscriptions(&self) {
        let mut s = self.state.lock();
        s.invoice_subs.clear();
        s.single_subs.clear();
        s.payment_subs.clear();
    }

    /// The preimage of an invoice this node generated. Test-only peek.
    pub fn invoice_preimage(&self, hash: &str) -> Option<Preimage> {
        self.state
            .lock()
            .invoices
            .get(hash)
            .and_then(|i| i.preimage.clone())
    }

    // -- Internals ----------------------------------------------------------

    fn emit_invoice(&self, state: InvoiceState) {
        let mut s = self.state.lock();
        s.invoice_subs.retain(|tx| tx.send(state.clone()).is_ok());
        s.single_subs
            .retain(|(hash, tx)| hash != &state.hash || tx.send(state.clone()).is_ok());
    }

    fn emit_payment(&self, state: PaymentState) {
        let mut s = self.state.lock();
        s.payment_subs.retain(|tx| tx.send(state.clone()).is_ok());
    }

    fn new_invoice(
        &self,
        params: &InvoiceParams,
        is_hold: bool,
    ) -> Result<CreatedInvoice, LightningError> {
        let mut s = self.state.lock();
        if s.fail_invoice_creation {
            return Err(LightningError::Unavailable(
                "scripted invoice-creation failure".to_string(),
            ));
        }

        let (hash, preimage) = match &params.hash {
            Some(hash) => (hash.clone(), None),
            None => {
                let bytes: [u8; 32] = rand::random();
                let preimage = hex::encode(bytes);
                (hex::encode(Sha256::digest(bytes)), Some(preimage))
            }
        };
        if s.invoices.contains_key(&hash) {
            return Err(LightningError::Rejected(format!(
                "duplicate invoice hash {hash}"
            )));
        }

        s.seq += 1;
        let bolt11 = format!("lnmock1{}{}", s.seq, &hash[..8]);
        let cltv_delta = params.cltv_delta.unwrap_or(DEFAULT_CLTV_DELTA);
        let expires_at = params
            .expires_at
            .unwrap_or_else(|| Utc::now() + ChronoDuration::seconds(600));

        s.requests.insert(
            bolt11.clone(),
            ParsedInvoice {
                hash: hash.clone(),
                msats: Some(params.msats),
                expires_at,
                cltv_delta,
                destination: "mock-node".to_string(),
                features: vec![8, 14, 16],
                description: params.description.clone(),
                description_hash: params.description_hash.clone(),
            },
        );
        s.invoices.insert(
            hash.clone(),
            MockInvoice {
                state: InvoiceState {
                    hash: hash.clone(),
                    bolt11: bolt11.clone(),
                    msats_requested: params.msats,
                    msats_received: 0,
                    is_held: false,
                    is_confirmed: false,
                    is_canceled: false,
                    confirmed_at: None,
                    confirmed_index: None,
                    accept_height: None,
                    expiry_height: None,
                    expires_at,
                },
                preimage: preimage.clone(),
                is_hold,
                cltv_delta,
            },
        );

        Ok(CreatedInvoice {
            hash,
            bolt11,
            preimage,
        })
    }

    fn confirm_payment(&self, hash: &str) {
        let (payment, hosted) = {
            let mut s = self.state.lock();
            let preimage = s
                .invoices
                .get(hash)
                .and_then(|i| i.preimage.clone())
                .or_else(|| s.external_preimages.get(hash).cloned())
                .unwrap_or_else(|| hex::encode(rand::random::<[u8; 32]>()));
            // Paying a plain invoice we host settles it, like a payment
            // looping back through the same node would.
            let hosted = s
                .invoices
                .get(hash)
                .map(|i| !i.is_hold && !i.state.is_confirmed)
                .unwrap_or(false);
            let payment = s.payments.get_mut(hash).expect("payment not in flight");
            payment.is_confirmed = true;
            payment.fee_msats_paid = DEFAULT_ROUTING_FEE_MSATS;
            payment.preimage = Some(preimage);
            (payment.clone(), hosted)
        };
        if hosted {
            self.receive_payment(hash);
        }
        self.emit_payment(payment);
    }

    fn fail_payment(&self, hash: &str, failure: PaymentFailure) {
        let payment = {
            let mut s = self.state.lock();
            let payment = s.payments.get_mut(hash).expect("payment not in flight");
            payment.is_failed = true;
            payment.failure = Some(failure);
            payment.clone()
        };
        self.emit_payment(payment);
    }
}

#[async_trait]
impl LightningNode for MockNode {
    async fn create_invoice(
        &self,
        params: &InvoiceParams,
    ) -> Result<CreatedInvoice, LightningError> {
        self.new_invoice(params, false)
    }

    async fn create_hold_invoice(
        &self,
        params: &InvoiceParams,
    ) -> Result<CreatedInvoice, LightningError> {
        self.new_invoice(params, true)
    }

    async fn cancel_hold_invoice(&self, hash: &str) -> Result<(), LightningError> {
        let snapshot = {
            let mut s = self.state.lock();
            let inv = s
                .invoices
                .get_mut(hash)
                .ok_or_else(|| LightningError::InvoiceNotFound(hash.to_string()))?;
            if inv.state.is_confirmed {
                return Err(LightningError::Rejected(
                    "invoice is already settled".to_string(),
                ));
            }
            if inv.state.is_canceled {
                return Ok(());
            }
            inv.state.is_canceled = true;
            inv.state.is_held = false;
            inv.state.clone()
        };
        self.emit_invoice(snapshot);
        Ok(())
    }

    async fn settle_hold_invoice(&self, preimage: &str) -> Result<(), LightningError> {
        let hash = preimage_hash(preimage)?;
        let snapshot = {
            let mut s = self.state.lock();
            let counter = s.confirmed_counter + 1;
            let inv = s
                .invoices
                .get_mut(&hash)
                .ok_or_else(|| LightningError::InvoiceNotFound(hash.clone()))?;
            if inv.state.is_confirmed {
                return Ok(());
            }
            if inv.state.is_canceled {
                return Err(LightningError::Rejected(
                    "invoice is canceled".to_string(),
                ));
            }
            if !inv.state.is_held {
                return Err(LightningError::Rejected(
                    "invoice is not held".to_string(),
                ));
            }
            inv.state.is_confirmed = true;
            inv.state.is_held = false;
            inv.state.confirmed_at = Some(Utc::now());
            inv.state.confirmed_index = Some(counter);
            inv.preimage = Some(preimage.to_string());
            s.confirmed_counter = counter;
            s.invoices.get(&hash).unwrap().state.clone()
        };
        self.emit_invoice(snapshot);
        Ok(())
    }

    async fn get_invoice(&self, hash: &str) -> Result<InvoiceState, LightningError> {
        self.state
            .lock()
            .invoices
            .get(hash)
            .map(|i| i.state.clone())
            .ok_or_else(|| LightningError::InvoiceNotFound(hash.to_string()))
    }

    async fn subscribe_invoices(
        &self,
        confirmed_after: Option<u64>,
    ) -> Result<mpsc::UnboundedReceiver<InvoiceState>, LightningError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut s = self.state.lock();
        // Replay confirmations past the checkpoint so a restarted consumer
        // catches up before live events flow.
        let mut missed: Vec<InvoiceState> = s
            .invoices
            .values()
            .filter(|i| i.state.confirmed_index > confirmed_after.or(Some(0)))
            .map(|i| i.state.clone())
            .collect();
        missed.sort_by_key(|i| i.confirmed_index);
        for state in missed {
            let _ = tx.send(state);
        }
        s.invoice_subs.push(tx);
        Ok(rx)
    }

    async fn subscribe_invoice(
        &self,
        hash: &str,
    ) -> Result<mpsc::UnboundedReceiver<InvoiceState>, LightningError> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.state.lock().single_subs.push((hash.to_string(), tx));
        Ok(rx)
    }

    async fn pay_payment_request(&self, request: &PayRequest) -> Result<(), LightningError> {
        let (hash, hold) = {
            let mut s = self.state.lock();
            let parsed = s.requests.get(&request.bolt11).cloned().ok_or_else(|| {
                LightningError::InvalidPaymentRequest(request.bolt11.clone())
            })?;
            if s.payments.contains_key(&parsed.hash) {
                return Err(LightningError::Rejected(format!(
                    "payment already in flight for {}",
                    parsed.hash
                )));
            }
            s.payments.insert(
                parsed.hash.clone(),
                PaymentState {
                    hash: parsed.hash.clone(),
                    is_confirmed: false,
                    is_failed: false,
                    not_sent: false,
                    msats_paid: parsed.msats.unwrap_or(0),
                    fee_msats_paid: 0,
                    preimage: None,
                    failure: None,
                },
            );
            (parsed.hash, s.hold_payments)
        };

        let scripted = self.state.lock().scripted_failures.remove(&hash);
        match scripted {
            Some(failure) => self.fail_payment(&hash, failure),
            None if !hold => self.confirm_payment(&hash),
            None => {}
        }
        Ok(())
    }

    async fn subscribe_payments(
        &self,
    ) -> Result<mpsc::UnboundedReceiver<PaymentState>, LightningError> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.state.lock().payment_subs.push(tx);
        Ok(rx)
    }

    async fn get_payment(&self, hash: &str) -> Result<PaymentState, LightningError> {
        Ok(self
            .state
            .lock()
            .payments
            .get(hash)
            .cloned()
            .unwrap_or_else(|| PaymentState {
                hash: hash.to_string(),
                is_confirmed: false,
                is_failed: false,
                not_sent: true,
                msats_paid: 0,
                fee_msats_paid: 0,
                preimage: None,
                failure: None,
            }))
    }

    async fn estimate_route_fee(
        &self,
        _bolt11: &str,
        _max_fee_msats: u64,
        _timeout: Duration,
    ) -> Result<RouteFeeEstimate, LightningError> {
        let s = self.state.lock();
        if let Some(message) = &s.fee_estimate_error {
            return Err(LightningError::Unavailable(message.clone()));
        }
        Ok(s.fee_estimate.unwrap_or(RouteFeeEstimate {
            routing_fee_msats: DEFAULT_ROUTING_FEE_MSATS,
            timelock_delay: s.height + DEFAULT_CLTV_DELTA,
        }))
    }

    async fn get_block_height(&self) -> Result<u64, LightningError> {
        Ok(self.state.lock().height)
    }

    async fn parse_payment_request(
        &self,
        bolt11: &str,
    ) -> Result<ParsedInvoice, LightningError> {
        self.state
            .lock()
            .requests
            .get(bolt11)
            .cloned()
            .ok_or_else(|| LightningError::InvalidPaymentRequest(bolt11.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(msats: u64) -> InvoiceParams {
        InvoiceParams {
            msats,
            ..InvoiceParams::default()
        }
    }

    #[tokio::test]
    async fn created_invoice_is_parseable() {
        let node = MockNode::new();
        let created = node.create_invoice(&params(5_000)).await.unwrap();

        let parsed = node.parse_payment_request(&created.bolt11).await.unwrap();
        assert_eq!(parsed.hash, created.hash);
        assert_eq!(parsed.msats, Some(5_000));
    }

    #[tokio::test]
    async fn hold_invoice_becomes_held_on_htlc_accept() {
        let node = MockNode::new();
        let hold = node
            .create_hold_invoice(&InvoiceParams {
                msats: 2_000,
                hash: Some("ab".repeat(32)),
                ..InvoiceParams::default()
            })
            .await
            .unwrap();
        node.receive_htlc(&hold.hash);

        let state = node.get_invoice(&hold.hash).await.unwrap();
        assert!(state.is_held);
        assert_eq!(state.msats_received, 2_000);
        assert!(state.settlement_window().unwrap() > 0);
    }

    #[tokio::test]
    async fn settle_requires_held_state() {
        let node = MockNode::new();
        let created = node.create_hold_invoice(&params(1_000)).await.unwrap();
        let preimage = node.invoice_preimage(&created.hash).unwrap();

        // Not held yet: settle must be rejected.
        assert!(node.settle_hold_invoice(&preimage).await.is_err());

        node.receive_htlc(&created.hash);
        node.settle_hold_invoice(&preimage).await.unwrap();

        // Idempotent once settled.
        node.settle_hold_invoice(&preimage).await.unwrap();

        let state = node.get_invoice(&created.hash).await.unwrap();
        assert!(state.is_confirmed);
        assert!(state.confirmed_index.is_some());
    }

    #[tokio::test]
    async fn cancel_is_idempotent_but_not_after_settle() {
        let node = MockNode::new();
        let created = node.create_hold_invoice(&params(1_000)).await.unwrap();
        node.cancel_hold_invoice(&created.hash).await.unwrap();
        node.cancel_hold_invoice(&created.hash).await.unwrap();

        let other = node.create_hold_invoice(&params(1_000)).await.unwrap();
        let preimage = node.invoice_preimage(&other.hash).unwrap();
        node.receive_htlc(&other.hash);
        node.settle_hold_invoice(&preimage).await.unwrap();
        assert!(node.cancel_hold_invoice(&other.hash).await.is_err());
    }

    #[tokio::test]
    async fn payment_confirms_with_destination_preimage() {
        let node = MockNode::new();
        let created = node.create_invoice(&params(7_000)).await.unwrap();
        let preimage = node.invoice_preimage(&created.hash).unwrap();

        node.pay_payment_request(&PayRequest {
            bolt11: created.bolt11.clone(),
            max_fee_msats: 10_000,
            pathfinding_timeout: Duration::from_secs(30),
            max_timeout_height: None,
        })
        .await
        .unwrap();

        let payment = node.get_payment(&created.hash).await.unwrap();
        assert!(payment.is_confirmed);
        assert_eq!(payment.preimage, Some(preimage));
        assert_eq!(preimage_hash(payment.preimage.as_ref().unwrap()).unwrap(), created.hash);
    }

    #[tokio::test]
    async fn scripted_payment_failure_is_reported() {
        let node = MockNode::new();
        let created = node.create_invoice(&params(7_000)).await.unwrap();
        node.script_payment_failure(&created.hash, PaymentFailure::RouteNotFound);

        node.pay_payment_request(&PayRequest {
            bolt11: created.bolt11.clone(),
            max_fee_msats: 10_000,
            pathfinding_timeout: Duration::from_secs(30),
            max_timeout_height: None,
        })
        .await
        .unwrap();

        let payment = node.get_payment(&created.hash).await.unwrap();
        assert!(payment.is_failed);
        assert_eq!(payment.failure, Some(PaymentFailure::RouteNotFound));
    }

    #[tokio::test]
    async fn paying_twice_is_rejected() {
        let node = MockNode::new();
        let created = node.create_invoice(&params(7_000)).await.unwrap();
        let req = PayRequest {
            bolt11: created.bolt11.clone(),
            max_fee_msats: 10_000,
            pathfinding_timeout: Duration::from_secs(30),
            max_timeout_height: None,
        };
        node.pay_payment_request(&req).await.unwrap();
        assert!(node.pay_payment_request(&req).await.is_err());
    }

    #[tokio::test]
    async fn unknown_payment_reports_not_sent() {
        let node = MockNode::new();
        let payment = node.get_payment("deadbeef").await.unwrap();
        assert!(payment.not_sent);
        assert!(!payment.is_confirmed);
        assert!(!payment.is_failed);
    }

    #[tokio::test]
    async fn subscription_replays_past_checkpoint() {
        let node = MockNode::new();
        let a = node.create_invoice(&params(1_000)).await.unwrap();
        let b = node.create_invoice(&params(2_000)).await.unwrap();
        node.receive_payment(&a.hash);
        node.receive_payment(&b.hash);

        // Resume after the first confirmation: only the second replays.
        let mut rx = node.subscribe_invoices(Some(1)).await.unwrap();
        let replayed = rx.recv().await.unwrap();
        assert_eq!(replayed.hash, b.hash);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn killed_subscriptions_close_the_stream() {
        let node = MockNode::new();
        let mut rx = node.subscribe_invoices(None).await.unwrap();
        node.kill_subscriptions();
        assert!(rx.recv().await.is_none());
    }
}
