//! Persistent records for pay-ins: the pay-in itself, its payouts, and
//! the inbound invoice attached to it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::ledger::{CustodialDebit, TokenKind, UserId};
use crate::lightning::{Bolt11, PaymentHash};

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

/// Lifecycle state of a pay-in.
///
/// Transitions are monotonic. `Paid` and `Failed` are terminal — once a
/// pay-in lands in either, no reconciliation pass may move it again.
///
/// ```text
/// PENDING_INVOICE_CREATION ──> PENDING ───────┐
///          │                                  ├──> PAID
///          ├────────────────> PENDING_HELD ───┘
///          │
///          └──> PAID   (fully covered by custodial tokens)
///
/// FAILED is reachable from every non-terminal state.
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PayInState {
    /// Row exists, money may be debited, but the invoice covering the
    /// remainder has not been issued yet.
    PendingInvoiceCreation,
    /// A plain invoice is out, waiting to be paid.
    Pending,
    /// A hold invoice is out; execution waits for funds to be committed.
    PendingHeld,
    /// Terminal: cost fully covered, action executed, payouts settled.
    Paid,
    /// Terminal: the pay-in did not complete; debited tokens refunded.
    Failed,
}

impl PayInState {
    pub fn is_terminal(self) -> bool {
        matches!(self, PayInState::Paid | PayInState::Failed)
    }
}

impl std::fmt::Display for PayInState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            PayInState::PendingInvoiceCreation => "PENDING_INVOICE_CREATION",
            PayInState::Pending => "PENDING",
            PayInState::PendingHeld => "PENDING_HELD",
            PayInState::Paid => "PAID",
            PayInState::Failed => "FAILED",
        };
        f.write_str(s)
    }
}

/// Why a pay-in reached `Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PayInFailureReason {
    /// Issuing the invoice for the uncovered remainder failed.
    InvoiceCreationFailed,
    /// The invoice expired before anyone paid it.
    InvoiceExpired,
    /// The invoice was canceled by us or by the network.
    InvoiceCanceled,
    /// Wrapping was rejected: the predicted routing fee was too high.
    WrapFailedHighFee,
    /// Wrapping was rejected: the predicted time-lock was too high.
    WrapFailedHighExpiry,
    /// The outgoing leg of the forward definitively failed.
    ForwardFailed,
    /// The action's own execution hook failed.
    ActionFailed,
}

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// A recorded distribution of settled funds to a recipient.
///
/// Specified by the action up front; `msats_before` is filled in at
/// settlement time, when the credit actually lands.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PayOut {
    /// Receiving user. `None` marks a system payout (kept for the books,
    /// no balance to credit).
    pub recipient: Option<UserId>,
    /// Which balance receives the amount. `None` means the payout must
    /// leave over the payment network — the peer-to-peer leg.
    pub kind: Option<TokenKind>,
    /// Amount in millisatoshis.
    pub msats: u64,
    /// The recipient's balance of `kind` immediately before settlement.
    pub msats_before: Option<u64>,
}

impl PayOut {
    /// A payout that cannot be satisfied custodially.
    pub fn is_p2p(&self) -> bool {
        self.kind.is_none()
    }
}

/// A free-form JSON payload (action arguments or results), stored as
/// canonical JSON text. The binary record codec refuses self-describing
/// values, so the payload carries its own encoding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JsonPayload(String);

impl JsonPayload {
    pub fn new(value: &Value) -> Self {
        Self(value.to_string())
    }

    pub fn value(&self) -> Value {
        serde_json::from_str(&self.0).unwrap_or(Value::Null)
    }
}

/// Record of one requested paid action and how its cost is covered.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PayIn {
    pub id: Uuid,
    /// Action-type tag, resolved through the action registry.
    pub action: String,
    /// Total cost in millisatoshis.
    pub cost_msats: u64,
    pub state: PayInState,
    pub state_changed_at: DateTime<Utc>,
    pub failure_reason: Option<PayInFailureReason>,
    /// Paying user. `None` is an anonymous request.
    pub payer: Option<UserId>,
    /// Custodial tokens taken from the payer, with audit balances.
    pub debits: Vec<CustodialDebit>,
    /// Distributions owed once the pay-in settles.
    pub pay_outs: Vec<PayOut>,
    /// Inbound invoice covering the uncovered remainder, once attached.
    pub invoice_hash: Option<PaymentHash>,
    /// Link to the relay record when the cost leaves peer-to-peer.
    pub forward_id: Option<Uuid>,
    /// Action arguments, retained only when execution is deferred until
    /// payment is certain.
    pub pessimistic_args: Option<JsonPayload>,
    /// The action's result payload, once it has executed.
    pub result: Option<JsonPayload>,
    pub created_at: DateTime<Utc>,
}

impl PayIn {
    /// Millisatoshis covered by custodial debits.
    pub fn custodial_paid(&self) -> u64 {
        self.debits.iter().map(|d| d.msats).sum()
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Move to a new state, stamping the change time. Callers are expected
    /// to have checked the transition is legal — this is bookkeeping only.
    pub fn advance(&mut self, state: PayInState) {
        self.state = state;
        self.state_changed_at = Utc::now();
    }
}

/// The inbound invoice attached to a pay-in or a forward.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Invoice {
    pub hash: PaymentHash,
    pub bolt11: Bolt11,
    pub msats_requested: u64,
    pub msats_received: u64,
    pub confirmed_at: Option<DateTime<Utc>>,
    /// Settle index reported by the node; the subscription checkpoint.
    pub confirmed_index: Option<u64>,
    pub is_held: bool,
    pub is_canceled: bool,
    pub expires_at: DateTime<Utc>,
    /// Memo shown to the payer. Suppressed when the payer hides invoice
    /// descriptions.
    pub description: Option<String>,
    /// The settlement secret for hold invoices we generated ourselves.
    /// Wrapped invoices carry `None` — their secret arrives with the
    /// outgoing payment's confirmation.
    pub preimage: Option<String>,
    pub created_at: DateTime<Utc>,
}
