// Copyright (c) 2026 ALAS Technology. MIT License.
// See LICENSE for details.

//! # SLUICE — Payment Orchestration Engine
//!
//! SLUICE turns a "paid action" request into a durable record of how its
//! cost was covered — custodial balance debits, a Lightning-style hold
//! invoice, or both — and guarantees the action executes exactly once
//! relative to payment. Its hardest job is the relay: accepting a held
//! inbound invoice and forwarding it into an outgoing payment without
//! ever paying out before the inbound funds are irrevocably committed.
//!
//! ## Architecture
//!
//! The engine is split into modules that mirror the actual concerns of a
//! payment pipeline:
//!
//! - **ledger** — Custodial balances. Credits first, currency second,
//!   never negative, every move audited.
//! - **action** — Capability records for paid-action types, resolved
//!   through an explicit registry.
//! - **payin** — The orchestrator: cost, debits, optimistic/pessimistic
//!   execution, settlement, compensation.
//! - **forward** — Invoice wrapping and the relay state machine.
//! - **lightning** — The payment-network trait and its in-memory mock.
//! - **wallet** — Pluggable `createInvoice` adapters for the peer path.
//! - **store** — sled-backed durable state, conditional writes, jobs.
//! - **worker** — Event subscriptions, job dispatch, the redundancy sweep.
//! - **config** — Engine constants and runtime parameters.
//!
//! ## Design Philosophy
//!
//! 1. Money moves inside transactions; networks are talked to outside.
//! 2. Every reconciliation function is idempotent. Run it twice, run it
//!    out of order, run it after a crash — same result.
//! 3. A lost conditional write means a colleague got there first. That's
//!    the system working, not failing.
//! 4. If it touches money, it has tests. Plural.

pub mod action;
pub mod config;
pub mod forward;
pub mod ledger;
pub mod lightning;
pub mod payin;
pub mod store;
pub mod wallet;
pub mod worker;

#[cfg(test)]
pub(crate) mod testing;

use std::sync::Arc;

use thiserror::Error;

use crate::action::{ActionError, ActionRegistry};
use crate::config::EngineConfig;
use crate::forward::wrap::WrapError;
use crate::ledger::LedgerError;
use crate::lightning::{LightningError, LightningNode};
use crate::store::{Store, StoreError};
use crate::wallet::{WalletDirectory, WalletError};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors surfaced by orchestration and reconciliation.
///
/// The first three variants are synchronous validation failures — nothing
/// was committed when they're raised. The rest wrap the failing
/// subsystem; callers decide between retrying, compensating, and logging
/// based on the variant.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The action-type tag resolves to no registered capability.
    #[error("invalid pay-in type: {0}")]
    UnknownAction(String),

    /// The requester is anonymous and the action does not allow that.
    #[error("you must be logged in to perform this action")]
    LoginRequired,

    /// The cost cannot be covered and the action accepts no invoice.
    #[error("insufficient funds")]
    InsufficientFunds,

    /// The action's declared payouts exceed its declared cost.
    #[error("pay-outs exceed cost: {pay_outs} > {cost}")]
    PayOutsExceedCost { pay_outs: u64, cost: u64 },

    /// The pay-in advanced (usually: was compensated) before its invoice
    /// could be attached. The freshly issued invoice is left to expire.
    #[error("pay-in is no longer awaiting an invoice")]
    StalePayIn,

    #[error(transparent)]
    Action(#[from] ActionError),

    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Lightning(#[from] LightningError),

    #[error(transparent)]
    Wallet(#[from] WalletError),

    #[error(transparent)]
    Wrap(#[from] WrapError),
}

// ---------------------------------------------------------------------------
// Shared context
// ---------------------------------------------------------------------------

/// Everything the orchestrator, state machines, and worker need to do
/// their jobs. Cheap to clone; pass it around freely.
#[derive(Clone)]
pub struct Deps {
    pub store: Arc<Store>,
    pub node: Arc<dyn LightningNode>,
    pub actions: Arc<ActionRegistry>,
    pub wallets: Arc<dyn WalletDirectory>,
    pub config: EngineConfig,
}

impl Deps {
    pub fn new(
        store: Arc<Store>,
        node: Arc<dyn LightningNode>,
        actions: Arc<ActionRegistry>,
        wallets: Arc<dyn WalletDirectory>,
        config: EngineConfig,
    ) -> Self {
        Self {
            store,
            node,
            actions,
            wallets,
            config,
        }
    }
}
