//! # Engine Configuration & Constants
//!
//! Every magic number in SLUICE lives here. If you're hardcoding a constant
//! somewhere else, you're doing it wrong and you owe the team coffee.
//!
//! Most of these values shape how much risk we take while money is in
//! flight — how long invoices live, how many blocks we reserve to claim an
//! inbound hold, how large a routing-fee budget we tolerate. Loosening them
//! after launch is somewhere between "difficult" and "expensive", so choose
//! wisely during testing.

use std::time::Duration;

// ---------------------------------------------------------------------------
// Invoice Lifetimes
// ---------------------------------------------------------------------------

/// How long an invoice we issue stays payable. Ten minutes is generous for
/// a human with a wallet and short enough that abandoned requests don't
/// clutter the pending set for hours.
pub const INVOICE_EXPIRY_SECS: i64 = 600;

/// The maximum expiration we'll allow for the incoming leg of a wrapped
/// invoice, in milliseconds.
pub const MAX_EXPIRATION_INCOMING_MSECS: i64 = 600_000;

/// The buffer we enforce on the incoming invoice expiration, in
/// milliseconds. An inner invoice expiring sooner than this leaves us no
/// room to settle and is rejected outright.
pub const INCOMING_EXPIRATION_BUFFER_MSECS: i64 = 120_000;

// ---------------------------------------------------------------------------
// Wrapped Invoice Limits
// ---------------------------------------------------------------------------

/// The minimum msats we'll allow for the outgoing invoice. Below this the
/// forward isn't worth the HTLC it rides in on.
pub const MIN_OUTGOING_MSATS: u64 = 700;

/// The maximum msats we'll allow for the outgoing invoice.
pub const MAX_OUTGOING_MSATS: u64 = 700_000_000;

/// The maximum cltv delta we'll allow for the outgoing invoice's route.
pub const MAX_OUTGOING_CLTV_DELTA: u64 = 1000;

/// The minimum blocks we'll leave ourselves for settling the incoming
/// invoice after the outgoing payment resolves. If the accepted window is
/// smaller than this, we abandon the forward rather than race the chain.
pub const MIN_SETTLEMENT_CLTV_DELTA: u64 = 80;

/// The buffer in case we underestimated the cltv delta with our probe.
/// Route-fee estimation is exactly that — an estimate.
pub const CLTV_DELTA_BUFFER: u64 = 10;

/// The timeout for the route-fee estimate request.
pub const FEE_ESTIMATE_TIMEOUT: Duration = Duration::from_secs(5);

/// The maximum estimated routing fee we'll tolerate, as a percentage of
/// the incoming amount. Above this the relay economics don't close.
pub const MAX_FEE_ESTIMATE_PERCENT: u64 = 2;

/// Padding multiplier applied to the routing-fee estimate when computing
/// the outgoing max-fee budget, in percent. 110 = pad by 10%.
pub const ROUTING_FEE_PAD_PERCENT: u64 = 110;

/// Supported feature bits for inner payment requests. Anything outside
/// this list is rejected — we don't forward what we can't reason about.
pub const SUPPORTED_FEATURE_BITS: &[u32] = &[
    8, 9, // variable length routing onion
    14, 15, // payment secret
    16, 17, // basic multi-part payment
    25, // blinded paths
    48, 49, // TLV payment data
    149, // trampoline routing
    151, // electrum trampoline routing
    262, 263, // bolt11 blinded paths
];

// ---------------------------------------------------------------------------
// Outgoing Payments
// ---------------------------------------------------------------------------

/// Pathfinding timeout for the outgoing leg of a forward. Thirty seconds
/// of pathfinding that hasn't found a route isn't going to.
pub const PATHFINDING_TIMEOUT: Duration = Duration::from_secs(30);

/// How long after recording a withdrawal we keep treating "the node has
/// no such payment" as dispatch-in-flight rather than dispatch-never-
/// happened. Must exceed the pathfinding timeout, or a sweep could
/// cancel the inbound leg while the outgoing payment is still leaving.
pub const WITHDRAWAL_NOT_SENT_GRACE: Duration = Duration::from_secs(60);

// ---------------------------------------------------------------------------
// Jobs & Reconciliation
// ---------------------------------------------------------------------------

/// Delay before the verify job first checks that a pending pay-in actually
/// acquired its invoice. Long enough for wrapped-invoice creation, short
/// enough that a crashed creation path is noticed promptly.
pub const CHECK_PAY_IN_DELAY: Duration = Duration::from_secs(10);

/// Delay before retrying a settle/confirm step that lost a race or hit a
/// transient node error.
pub const RECONCILE_RETRY_DELAY: Duration = Duration::from_secs(60);

/// Priority for payment-critical jobs. Higher runs first.
pub const JOB_PRIORITY_PAYMENT: u8 = 100;

/// How often the worker polls the durable job queue.
pub const JOB_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// How often the full sweep re-checks every non-terminal record against
/// network truth. This is the redundancy mechanism for missed events, not
/// the primary delivery path — it can afford to be lazy.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Pacing between individual records during a sweep, so a large backlog
/// doesn't hammer the node with lookups.
pub const SWEEP_ITEM_DELAY: Duration = Duration::from_millis(10);

// ---------------------------------------------------------------------------
// Subscription Backoff
// ---------------------------------------------------------------------------

/// Minimum backoff after a subscription drops.
pub const SUBSCRIBE_BACKOFF_MIN: Duration = Duration::from_millis(100);

/// Maximum backoff between resubscription attempts. We reconnect forever;
/// this only bounds how hard we hammer a node that keeps refusing us.
pub const SUBSCRIBE_BACKOFF_MAX: Duration = Duration::from_secs(10);

// ---------------------------------------------------------------------------
// Ledger
// ---------------------------------------------------------------------------

/// Millisatoshis per whole currency unit. Partial debits are floored to a
/// multiple of this so a drained balance never strands sub-unit dust.
pub const MSATS_PER_UNIT: u64 = 1000;

// ---------------------------------------------------------------------------
// Peer Relay
// ---------------------------------------------------------------------------

/// Relay fee charged on the peer-to-peer path, in percent of the incoming
/// amount. The recipient's inner invoice requests the remainder.
pub const P2P_FEE_PERCENT: u64 = 10;

/// How long we give a recipient's wallet to produce an inner invoice.
pub const WALLET_INVOICE_TIMEOUT: Duration = Duration::from_secs(15);

// ---------------------------------------------------------------------------
// Runtime Configuration
// ---------------------------------------------------------------------------

/// Tunable engine parameters. Defaults mirror the constants above; tests
/// shrink the intervals to keep the clock honest.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Relay fee percent applied when wrapping peer-to-peer payouts.
    pub p2p_fee_percent: u64,
    /// Lifetime of invoices we issue, in seconds.
    pub invoice_expiry_secs: i64,
    /// Deadline for inner-invoice creation through a wallet adapter.
    pub wallet_invoice_timeout: Duration,
    /// Delay before the verify job checks a fresh pay-in.
    pub check_pay_in_delay: Duration,
    /// Delay before retrying a lost settle/confirm step.
    pub reconcile_retry_delay: Duration,
    /// Cadence of the full non-terminal sweep.
    pub sweep_interval: Duration,
    /// Cadence of the durable-job poll.
    pub job_poll_interval: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            p2p_fee_percent: P2P_FEE_PERCENT,
            invoice_expiry_secs: INVOICE_EXPIRY_SECS,
            wallet_invoice_timeout: WALLET_INVOICE_TIMEOUT,
            check_pay_in_delay: CHECK_PAY_IN_DELAY,
            reconcile_retry_delay: RECONCILE_RETRY_DELAY,
            sweep_interval: SWEEP_INTERVAL,
            job_poll_interval: JOB_POLL_INTERVAL,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invoice_expiry_exceeds_incoming_buffer() {
        // If the buffer eats the whole expiry there is nothing left to pay.
        assert!(INVOICE_EXPIRY_SECS * 1000 > INCOMING_EXPIRATION_BUFFER_MSECS);
        assert!(MAX_EXPIRATION_INCOMING_MSECS > INCOMING_EXPIRATION_BUFFER_MSECS);
    }

    #[test]
    fn outgoing_bounds_are_ordered() {
        assert!(MIN_OUTGOING_MSATS < MAX_OUTGOING_MSATS);
    }

    #[test]
    fn settlement_window_fits_outgoing_delta() {
        // The settlement reserve must leave room under the outgoing cap,
        // otherwise no forward could ever validate.
        assert!(MIN_SETTLEMENT_CLTV_DELTA + CLTV_DELTA_BUFFER < MAX_OUTGOING_CLTV_DELTA);
    }

    #[test]
    fn supported_feature_bits_are_sorted_and_unique() {
        let mut sorted = SUPPORTED_FEATURE_BITS.to_vec();
        sorted.sort_unstable();
        sorted.dedup();
        assert_eq!(sorted.as_slice(), SUPPORTED_FEATURE_BITS);
    }

    #[test]
    fn backoff_bounds_are_ordered() {
        assert!(SUBSCRIBE_BACKOFF_MIN < SUBSCRIBE_BACKOFF_MAX);
    }

    #[test]
    fn not_sent_grace_covers_pathfinding() {
        assert!(WITHDRAWAL_NOT_SENT_GRACE > PATHFINDING_TIMEOUT);
    }

    #[test]
    fn fee_pad_actually_pads() {
        assert!(ROUTING_FEE_PAD_PERCENT > 100);
    }
}
