//! # Payment-Network Interface
//!
//! Everything SLUICE asks of the underlying Lightning-style network goes
//! through the [`LightningNode`] trait: issuing and cancelling hold
//! invoices, dispatching outgoing payments, estimating routes, and
//! subscribing to invoice/payment lifecycle events.
//!
//! The engine never talks to a node library directly. Keeping the surface
//! behind one trait means the whole orchestration pipeline — ledger,
//! pay-ins, forwards, reconciliation — can run against the in-memory
//! [`mock::MockNode`] in tests, and against a real backend in production,
//! without either side knowing the difference.
//!
//! ## Event model
//!
//! Subscriptions deliver full state snapshots, not deltas. An event is a
//! hint that something changed, carrying everything the reconciliation
//! functions need to re-derive the correct next transition. Handlers must
//! tolerate duplicates, reordering, and replays — the network owes us
//! nothing about delivery.

pub mod mock;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;

/// Hex-encoded payment hash. Identifies an invoice or an outgoing payment.
pub type PaymentHash = String;

/// Hex-encoded preimage — the secret that both proves and authorizes
/// claiming a hold invoice.
pub type Preimage = String;

/// An encoded payment request.
pub type Bolt11 = String;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors surfaced by the payment-network interface.
#[derive(Debug, Error)]
pub enum LightningError {
    /// The payment request could not be decoded.
    #[error("unable to decode payment request: {0}")]
    InvalidPaymentRequest(String),

    /// No invoice with the given hash is known to the node.
    #[error("invoice not found: {0}")]
    InvoiceNotFound(PaymentHash),

    /// The node rejected the operation (duplicate hash, wrong state, etc.).
    #[error("node rejected operation: {0}")]
    Rejected(String),

    /// The subscription transport failed. The caller is expected to back
    /// off and resubscribe.
    #[error("subscription failed: {0}")]
    Subscription(String),

    /// The node could not be reached or the call timed out. Transient.
    #[error("node unavailable: {0}")]
    Unavailable(String),
}

// ---------------------------------------------------------------------------
// Requests
// ---------------------------------------------------------------------------

/// Parameters for issuing an invoice (plain or hold).
#[derive(Debug, Clone, Default)]
pub struct InvoiceParams {
    /// Amount requested in millisatoshis.
    pub msats: u64,
    /// Invoice description. `None` keeps the invoice memo-less.
    pub description: Option<String>,
    /// Description hash, mutually exclusive with `description`.
    pub description_hash: Option<String>,
    /// Absolute expiration time.
    pub expires_at: Option<DateTime<Utc>>,
    /// Final-hop time-lock window, in blocks. `None` uses the node default.
    pub cltv_delta: Option<u64>,
    /// Payment hash to issue the invoice under. Required for hold invoices
    /// that wrap an external request — the inbound hash must match the
    /// outgoing leg so one preimage claims both.
    pub hash: Option<PaymentHash>,
}

/// A freshly issued invoice.
#[derive(Debug, Clone)]
pub struct CreatedInvoice {
    /// Payment hash of the invoice.
    pub hash: PaymentHash,
    /// The encoded payment request to hand to the payer.
    pub bolt11: Bolt11,
    /// The settlement secret, when the node generated it. Hold invoices
    /// issued under an external hash have no preimage on our side — the
    /// outgoing payment reveals it.
    pub preimage: Option<Preimage>,
}

/// Parameters for dispatching an outgoing payment.
#[derive(Debug, Clone)]
pub struct PayRequest {
    /// The payment request to pay.
    pub bolt11: Bolt11,
    /// Routing-fee budget in millisatoshis. The node must not exceed it.
    pub max_fee_msats: u64,
    /// How long pathfinding may run before the attempt is abandoned.
    pub pathfinding_timeout: Duration,
    /// Absolute block height the payment's HTLCs must resolve by. Derived
    /// from the inbound settlement deadline on the forward path.
    pub max_timeout_height: Option<u64>,
}

// ---------------------------------------------------------------------------
// Observations
// ---------------------------------------------------------------------------

/// A decoded payment request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParsedInvoice {
    /// Payment hash.
    pub hash: PaymentHash,
    /// Requested amount in millisatoshis. Amountless requests carry `None`.
    pub msats: Option<u64>,
    /// Absolute expiration time of the request.
    pub expires_at: DateTime<Utc>,
    /// Final-hop cltv delta, in blocks.
    pub cltv_delta: u64,
    /// Destination node id.
    pub destination: String,
    /// Advertised feature bits.
    pub features: Vec<u32>,
    /// Description, if the request carries one.
    pub description: Option<String>,
    /// Description hash, if the request carries one instead.
    pub description_hash: Option<String>,
}

/// Point-in-time state of an invoice as the network sees it.
///
/// This is what subscriptions deliver and what `get_invoice` returns. The
/// three booleans are mutually exclusive in practice but are kept separate
/// so a snapshot mirrors the node's own report rather than our
/// interpretation of it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvoiceState {
    pub hash: PaymentHash,
    pub bolt11: Bolt11,
    pub msats_requested: u64,
    /// Millisatoshis actually received, once held or settled.
    pub msats_received: u64,
    /// Funds are committed but not yet claimed (hold invoice accepted).
    pub is_held: bool,
    /// The invoice settled; funds are irrevocably ours.
    pub is_confirmed: bool,
    pub is_canceled: bool,
    pub confirmed_at: Option<DateTime<Utc>>,
    /// Monotonic settle index assigned by the node. Used as the resume
    /// checkpoint for invoice subscriptions.
    pub confirmed_index: Option<u64>,
    /// Block height at which the inbound HTLCs were accepted.
    pub accept_height: Option<u64>,
    /// Block height at which the inbound HTLCs time out.
    pub expiry_height: Option<u64>,
    pub expires_at: DateTime<Utc>,
}

impl InvoiceState {
    /// Blocks remaining between HTLC acceptance and timeout — the window
    /// we have to settle the inbound leg. `None` until the invoice is held.
    pub fn settlement_window(&self) -> Option<u64> {
        match (self.accept_height, self.expiry_height) {
            (Some(accept), Some(expiry)) => Some(expiry.saturating_sub(accept)),
            _ => None,
        }
    }
}

/// Terminal failure classification for an outgoing payment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PaymentFailure {
    /// Our own liquidity could not cover amount + fees.
    InsufficientBalance,
    /// The destination rejected the payment or the request is unpayable.
    InvalidPayment,
    /// Pathfinding exceeded its deadline.
    PathfindingTimeout,
    /// No route to the destination within the fee/time-lock budget.
    RouteNotFound,
    /// Anything the node reported that we don't classify more precisely.
    Unknown,
}

/// Point-in-time state of an outgoing payment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentState {
    pub hash: PaymentHash,
    pub is_confirmed: bool,
    pub is_failed: bool,
    /// The node has no record of this payment. Either it was never
    /// dispatched or the attempt died before the node persisted it.
    pub not_sent: bool,
    /// Millisatoshis delivered to the destination, once confirmed.
    pub msats_paid: u64,
    /// Routing fee actually paid, once confirmed.
    pub fee_msats_paid: u64,
    /// Proof of payment, once confirmed.
    pub preimage: Option<Preimage>,
    pub failure: Option<PaymentFailure>,
}

/// Worst-case routing estimate for paying a request.
#[derive(Debug, Clone, Copy)]
pub struct RouteFeeEstimate {
    /// Estimated routing fee in millisatoshis.
    pub routing_fee_msats: u64,
    /// Absolute block height the route is estimated to expire at in the
    /// worst case, excluding the final hop's cltv delta.
    pub timelock_delay: u64,
}

// ---------------------------------------------------------------------------
// The node trait
// ---------------------------------------------------------------------------

/// The full set of payment-network operations the engine consumes.
///
/// Implementations must be safe to share across tasks. Every method is
/// fallible and bounded — implementations are expected to enforce their
/// own transport deadlines on top of whatever the caller passes.
#[async_trait]
pub trait LightningNode: Send + Sync {
    /// Issue a plain invoice. Settles automatically on payment.
    async fn create_invoice(&self, params: &InvoiceParams)
        -> Result<CreatedInvoice, LightningError>;

    /// Issue a hold invoice. Inbound funds are committed on acceptance but
    /// claimable only via [`settle_hold_invoice`](Self::settle_hold_invoice).
    async fn create_hold_invoice(
        &self,
        params: &InvoiceParams,
    ) -> Result<CreatedInvoice, LightningError>;

    /// Release the inbound hold without claiming it. Idempotent: cancelling
    /// an already-cancelled invoice is not an error.
    async fn cancel_hold_invoice(&self, hash: &str) -> Result<(), LightningError>;

    /// Claim a held invoice with its preimage. Idempotent on the node side.
    async fn settle_hold_invoice(&self, preimage: &str) -> Result<(), LightningError>;

    /// Look up the current state of an invoice.
    async fn get_invoice(&self, hash: &str) -> Result<InvoiceState, LightningError>;

    /// Subscribe to lifecycle events for all invoices. `confirmed_after`
    /// resumes delivery from a settle-index checkpoint so restarts don't
    /// miss confirmations that happened while we were down.
    async fn subscribe_invoices(
        &self,
        confirmed_after: Option<u64>,
    ) -> Result<mpsc::UnboundedReceiver<InvoiceState>, LightningError>;

    /// Subscribe to lifecycle events for a single invoice, including hold
    /// and cancel transitions.
    async fn subscribe_invoice(
        &self,
        hash: &str,
    ) -> Result<mpsc::UnboundedReceiver<InvoiceState>, LightningError>;

    /// Dispatch an outgoing payment. Returns once the attempt is in
    /// flight; resolution arrives via [`subscribe_payments`](Self::subscribe_payments)
    /// or [`get_payment`](Self::get_payment).
    async fn pay_payment_request(&self, request: &PayRequest) -> Result<(), LightningError>;

    /// Subscribe to outgoing-payment resolutions (confirmed and failed).
    async fn subscribe_payments(
        &self,
    ) -> Result<mpsc::UnboundedReceiver<PaymentState>, LightningError>;

    /// Look up the current state of an outgoing payment. Unknown hashes
    /// report `not_sent` rather than an error — "we never paid this" is an
    /// answer, not a failure.
    async fn get_payment(&self, hash: &str) -> Result<PaymentState, LightningError>;

    /// Estimate the worst-case routing fee and time-lock for paying a
    /// request, bounded by `timeout`.
    async fn estimate_route_fee(
        &self,
        bolt11: &str,
        max_fee_msats: u64,
        timeout: Duration,
    ) -> Result<RouteFeeEstimate, LightningError>;

    /// Current chain height as the node sees it.
    async fn get_block_height(&self) -> Result<u64, LightningError>;

    /// Decode a payment request without touching the chain.
    async fn parse_payment_request(&self, bolt11: &str)
        -> Result<ParsedInvoice, LightningError>;
}
