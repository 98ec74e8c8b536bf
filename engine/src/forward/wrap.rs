//! # Invoice Wrapping
//!
//! Wrapping turns someone else's payment request (the outgoing leg) into
//! an inbound hold invoice we issue under the *same payment hash*. The
//! payer pays us; we pay the inner request; the preimage revealed by the
//! outgoing payment is the only thing that can claim the inbound hold.
//! Funds can never leave before funds have arrived.
//!
//! Everything in this module is validation. A wrapped invoice that is too
//! cheap, too slow, or too exotic creates risk we can't hedge, so each
//! check rejects with a precise reason. All rejections are permanent for
//! that specific inner request — the caller must obtain a fresh one; we
//! never retry here.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use thiserror::Error;

use crate::config::{
    CLTV_DELTA_BUFFER, FEE_ESTIMATE_TIMEOUT, INCOMING_EXPIRATION_BUFFER_MSECS,
    MAX_EXPIRATION_INCOMING_MSECS, MAX_FEE_ESTIMATE_PERCENT, MAX_OUTGOING_CLTV_DELTA,
    MAX_OUTGOING_MSATS, MIN_OUTGOING_MSATS, MIN_SETTLEMENT_CLTV_DELTA,
    ROUTING_FEE_PAD_PERCENT, SUPPORTED_FEATURE_BITS,
};
use crate::lightning::{
    Bolt11, CreatedInvoice, InvoiceParams, LightningError, LightningNode,
};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Why an inner request cannot be wrapped. Every variant is permanent for
/// the request that produced it.
#[derive(Debug, Error)]
pub enum WrapError {
    #[error("fee percent must be below 100, got {0}")]
    FeePercentOutOfRange(u64),

    #[error("outgoing invoice is missing an amount")]
    AmountMissing,

    #[error("outgoing amount is too low: {0}")]
    AmountTooLow(u64),

    #[error("outgoing amount is too high: {0}")]
    AmountTooHigh(u64),

    /// The committed incoming amount doesn't clear the fee floor. Letting
    /// this through would let anyone relay for free.
    #[error("incoming amount is too low: {got} < {required}")]
    IncomingTooLow { required: u64, got: u64 },

    #[error("outgoing invoice advertises no features")]
    FeaturesMissing,

    #[error("unsupported feature bit: {0}")]
    UnsupportedFeature(u32),

    /// The inner request expires before we could settle anything.
    #[error("outgoing invoice expiration is too soon: {0}")]
    ExpiryTooSoon(DateTime<Utc>),

    /// The predicted time-lock for the incoming invoice exceeds the cap.
    #[error("predicted incoming cltv delta is too high: {0}")]
    CltvDeltaTooHigh(u64),

    /// The predicted time-lock leaves no settlement buffer.
    #[error("predicted incoming cltv delta is too low: {0}")]
    CltvDeltaTooLow(u64),

    /// The estimated routing fee busts the percent-of-incoming cap.
    #[error("estimated routing fee is too high: {estimate} > {cap}")]
    FeeEstimateTooHigh { estimate: u64, cap: u64 },

    #[error(transparent)]
    Lightning(#[from] LightningError),
}

impl WrapError {
    /// Whether the rejection was one of the predictive (fee / time-lock)
    /// checks, which callers report differently from malformed requests.
    pub fn is_predictive(&self) -> bool {
        matches!(
            self,
            WrapError::CltvDeltaTooHigh(_)
                | WrapError::CltvDeltaTooLow(_)
                | WrapError::FeeEstimateTooHigh { .. }
        )
    }
}

// ---------------------------------------------------------------------------
// Request / result
// ---------------------------------------------------------------------------

/// What the caller wants wrapped.
#[derive(Debug, Clone)]
pub struct WrapRequest {
    /// The amount the inbound hold invoice must commit, in millisatoshis.
    pub incoming_msats: u64,
    /// The inner (outgoing-leg) payment request.
    pub bolt11: Bolt11,
    /// Relay fee percentage. The incoming amount must satisfy
    /// `incoming >= ceil(outgoing * 100 / (100 - fee_percent))`.
    pub fee_percent: u64,
    /// Memo for the inbound invoice, unless the inner request pins a
    /// description hash or the payer hides memos.
    pub description: Option<String>,
    pub hide_description: bool,
}

/// A successfully wrapped invoice.
#[derive(Debug, Clone)]
pub struct WrappedInvoice {
    /// The inbound hold invoice, issued under the inner request's hash.
    pub invoice: CreatedInvoice,
    /// Routing-fee budget for the outgoing leg.
    pub max_fee_msats: u64,
    pub msats_requested: u64,
    pub expires_at: DateTime<Utc>,
    /// Final-hop time-lock window of the inbound invoice, in blocks.
    pub cltv_delta: u64,
}

/// Minimum incoming msats for a given outgoing amount and fee percent:
/// `ceil(outgoing * 100 / (100 - fee_percent))`.
pub fn required_incoming_msats(outgoing_msats: u64, fee_percent: u64) -> u64 {
    (outgoing_msats * 100).div_ceil(100 - fee_percent)
}

// ---------------------------------------------------------------------------
// Wrapping
// ---------------------------------------------------------------------------

/// Validate an inner payment request and issue the inbound hold invoice
/// that wraps it. Returns the created invoice and the outgoing max-fee
/// budget, or the first violated check.
pub async fn wrap_invoice(
    node: &dyn LightningNode,
    request: &WrapRequest,
) -> Result<WrappedInvoice, WrapError> {
    if request.fee_percent >= 100 {
        return Err(WrapError::FeePercentOutOfRange(request.fee_percent));
    }

    let inner = node.parse_payment_request(&request.bolt11).await?;
    tracing::debug!(
        hash = %inner.hash,
        msats = ?inner.msats,
        cltv_delta = inner.cltv_delta,
        "wrapping inner payment request"
    );

    // Outgoing amount bounds.
    let outgoing_msats = inner.msats.ok_or(WrapError::AmountMissing)?;
    if outgoing_msats < MIN_OUTGOING_MSATS {
        return Err(WrapError::AmountTooLow(outgoing_msats));
    }
    if outgoing_msats > MAX_OUTGOING_MSATS {
        return Err(WrapError::AmountTooHigh(outgoing_msats));
    }

    // Fee floor: below this the relay pays the sender to use us.
    let required = required_incoming_msats(outgoing_msats, request.fee_percent);
    if request.incoming_msats < required {
        return Err(WrapError::IncomingTooLow {
            required,
            got: request.incoming_msats,
        });
    }

    // Feature allow-list. Forwarding a request whose features we don't
    // understand means taking on settlement semantics we can't verify.
    if inner.features.is_empty() {
        return Err(WrapError::FeaturesMissing);
    }
    for bit in &inner.features {
        if !SUPPORTED_FEATURE_BITS.contains(bit) {
            return Err(WrapError::UnsupportedFeature(*bit));
        }
    }

    // Description passthrough: an inner description hash wins (lnurl-pay
    // verifiers recompute it), then our memo, then the inner memo.
    let mut description = None;
    let mut description_hash = None;
    if let Some(hash) = &inner.description_hash {
        description_hash = Some(hash.clone());
    } else if !request.hide_description {
        description = request
            .description
            .clone()
            .or_else(|| inner.description.clone());
    }

    // Expiration: the inner request must leave a settlement buffer, and
    // the wrapping invoice always expires earlier than the inner one.
    let now = Utc::now();
    let buffer = ChronoDuration::milliseconds(INCOMING_EXPIRATION_BUFFER_MSECS);
    let max_expiry = now + ChronoDuration::milliseconds(MAX_EXPIRATION_INCOMING_MSECS);
    if inner.expires_at < now + buffer {
        return Err(WrapError::ExpiryTooSoon(inner.expires_at));
    }
    let expires_at = inner.expires_at.min(max_expiry) - buffer;

    // Routing estimates, bounded. `timelock_delay` is the absolute height
    // the outgoing route is estimated to expire at in the worst case,
    // excluding the final hop's cltv delta.
    let estimate = node
        .estimate_route_fee(
            &request.bolt11,
            request.incoming_msats.saturating_sub(outgoing_msats),
            FEE_ESTIMATE_TIMEOUT,
        )
        .await?;
    let height = node.get_block_height().await?;

    // The incoming invoice needs a final cltv delta that outlives the
    // outgoing route's worst case by the settlement reserve, plus a pad
    // for estimator error.
    let cltv_delta = (estimate.timelock_delay + inner.cltv_delta + MIN_SETTLEMENT_CLTV_DELTA
        + CLTV_DELTA_BUFFER)
        .saturating_sub(height);
    if cltv_delta > MAX_OUTGOING_CLTV_DELTA {
        return Err(WrapError::CltvDeltaTooHigh(cltv_delta));
    }
    if cltv_delta < inner.cltv_delta + MIN_SETTLEMENT_CLTV_DELTA {
        return Err(WrapError::CltvDeltaTooLow(cltv_delta));
    }

    // Fee budget: the estimate must clear the percent-of-incoming cap;
    // the budget pads it for estimator drift.
    let fee_cap = request.incoming_msats * MAX_FEE_ESTIMATE_PERCENT / 100;
    if estimate.routing_fee_msats > fee_cap {
        return Err(WrapError::FeeEstimateTooHigh {
            estimate: estimate.routing_fee_msats,
            cap: fee_cap,
        });
    }
    let max_fee_msats = (estimate.routing_fee_msats * ROUTING_FEE_PAD_PERCENT).div_ceil(100);

    let invoice = node
        .create_hold_invoice(&InvoiceParams {
            msats: request.incoming_msats,
            description,
            description_hash,
            expires_at: Some(expires_at),
            cltv_delta: Some(cltv_delta),
            hash: Some(inner.hash.clone()),
        })
        .await?;

    tracing::info!(
        hash = %invoice.hash,
        incoming_msats = request.incoming_msats,
        outgoing_msats,
        max_fee_msats,
        cltv_delta,
        "wrapped invoice created"
    );

    Ok(WrappedInvoice {
        invoice,
        max_fee_msats,
        msats_requested: request.incoming_msats,
        expires_at,
        cltv_delta,
    })
}
