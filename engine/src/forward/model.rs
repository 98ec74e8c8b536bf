//! Persistent records for invoice forwards: the forward itself and the
//! outbound withdrawal it pays.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::lightning::{Bolt11, PaymentFailure, PaymentHash, Preimage};

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

/// Lifecycle of a held inbound invoice being relayed to an outgoing
/// payment.
///
/// ```text
/// CREATED ──> HELD ──> FORWARD_PENDING ──> FORWARD_CONFIRMED ──> SETTLED ──> CONFIRMED
///               │             │
///               │             └──> FORWARD_FAILED ──> CANCELLED
///               └──> CANCELLED   (window too small to settle safely)
///
/// Any non-terminal state ──> CANCELLED when the inbound invoice is
/// independently observed canceled or expired.
/// ```
///
/// The ordering encodes the one rule that matters: the inbound hold is
/// claimed (`SETTLED`) only after the outgoing payment is certain
/// (`FORWARD_CONFIRMED`), never before.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ForwardStatus {
    /// The wrapped invoice exists; nothing has arrived yet.
    Created,
    /// The inbound invoice is held — funds committed, not yet claimable.
    Held,
    /// The outgoing payment is in flight.
    ForwardPending,
    /// The outgoing payment definitively failed; nothing was paid out.
    ForwardFailed,
    /// The outgoing payment confirmed; we hold the preimage.
    ForwardConfirmed,
    /// The inbound hold has been claimed with the preimage.
    Settled,
    /// Terminal: the claim confirmed on the network; bookkeeping done.
    Confirmed,
    /// Terminal: the relay was abandoned and the inbound hold released.
    Cancelled,
}

impl ForwardStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, ForwardStatus::Confirmed | ForwardStatus::Cancelled)
    }
}

impl std::fmt::Display for ForwardStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ForwardStatus::Created => "CREATED",
            ForwardStatus::Held => "HELD",
            ForwardStatus::ForwardPending => "FORWARD_PENDING",
            ForwardStatus::ForwardFailed => "FORWARD_FAILED",
            ForwardStatus::ForwardConfirmed => "FORWARD_CONFIRMED",
            ForwardStatus::Settled => "SETTLED",
            ForwardStatus::Confirmed => "CONFIRMED",
            ForwardStatus::Cancelled => "CANCELLED",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// Status of an outbound payment leg.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WithdrawalStatus {
    /// Dispatched, not yet resolved.
    Pending,
    Confirmed,
    InsufficientBalance,
    InvalidPayment,
    PathfindingTimeout,
    RouteNotFound,
    UnknownFailure,
}

impl From<PaymentFailure> for WithdrawalStatus {
    fn from(failure: PaymentFailure) -> Self {
        match failure {
            PaymentFailure::InsufficientBalance => WithdrawalStatus::InsufficientBalance,
            PaymentFailure::InvalidPayment => WithdrawalStatus::InvalidPayment,
            PaymentFailure::PathfindingTimeout => WithdrawalStatus::PathfindingTimeout,
            PaymentFailure::RouteNotFound => WithdrawalStatus::RouteNotFound,
            PaymentFailure::Unknown => WithdrawalStatus::UnknownFailure,
        }
    }
}

/// The outbound payment leg of a forward.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Withdrawal {
    /// Payment hash — identical to the inbound invoice's hash, so one
    /// preimage resolves both legs.
    pub hash: PaymentHash,
    pub bolt11: Bolt11,
    /// Amount being paid to the destination.
    pub msats_paying: u64,
    /// Amount actually delivered, once confirmed.
    pub msats_paid: u64,
    /// The routing-fee budget the payment was dispatched with.
    pub msats_fee_paying: u64,
    /// Routing fee actually paid, once confirmed.
    pub msats_fee_paid: u64,
    pub status: WithdrawalStatus,
    /// Proof of payment, once confirmed.
    pub preimage: Option<Preimage>,
    pub created_at: DateTime<Utc>,
}

/// Relay record: a held inbound invoice that must be forwarded to an
/// outgoing payment before it can be claimed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvoiceForward {
    pub id: Uuid,
    pub status: ForwardStatus,
    pub status_changed_at: DateTime<Utc>,
    /// The outgoing payment request this forward pays.
    pub bolt11: Bolt11,
    /// Routing-fee budget computed at wrap time.
    pub max_fee_msats: u64,
    /// Block height at which the inbound HTLCs were accepted.
    pub accept_height: Option<u64>,
    /// Block height at which the inbound HTLCs time out.
    pub expiry_height: Option<u64>,
    /// The inbound hold invoice (and, once dispatched, the withdrawal)
    /// share this hash.
    pub invoice_hash: PaymentHash,
    /// Set once the outgoing payment has been dispatched.
    pub withdrawal_hash: Option<PaymentHash>,
    /// The pay-in this forward covers, when it was born from one.
    pub payin_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

impl InvoiceForward {
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Move to a new status, stamping the change time. The guarded write
    /// in the store decides whether the move is allowed.
    pub fn advance(&mut self, status: ForwardStatus) {
        self.status = status;
        self.status_changed_at = Utc::now();
    }
}
