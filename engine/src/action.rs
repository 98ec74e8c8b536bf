//! # Paid Actions — Capability Records & Registry
//!
//! Every kind of paid action the engine can orchestrate is described by
//! one [`PaidAction`] implementation: what it costs, who gets paid, how it
//! executes, and what happens on settlement or failure. The engine itself
//! knows nothing about tips, purchases, or whatever else the product
//! invents next — it resolves the action-type tag through an explicit
//! [`ActionRegistry`] and drives the capability through its hooks.
//!
//! ## Hook timing
//!
//! - `cost` / `pay_outs` / `describe` run outside any transaction and may
//!   do slow work.
//! - `perform`, `on_paid`, and `on_fail` run inside the orchestrator's
//!   store transaction. They are synchronous, must act only through the
//!   [`StoreTx`] handle, and may run more than once if the transaction
//!   retries — sled rolls back the losing attempt, so that is invisible
//!   as long as the hook has no effects outside the handle.
//! - `non_critical_side_effects` runs after a successful settlement
//!   commit, best-effort. Failures are logged and dropped.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

use crate::ledger::{LedgerError, UserId};
use crate::payin::model::{PayIn, PayOut};
use crate::store::{StoreError, StoreTx};

// ---------------------------------------------------------------------------
// Payment methods
// ---------------------------------------------------------------------------

/// How a paid action is willing to be paid.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaymentMethod {
    /// Spendable credits may cover (part of) the cost.
    FeeCredits,
    /// The action may execute before the invoice settles.
    Optimistic,
    /// The action executes only after funds are committed.
    Pessimistic,
    /// The cost is relayed peer-to-peer through a wrapped invoice.
    P2P,
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors raised by action capability hooks.
#[derive(Debug, Error)]
pub enum ActionError {
    /// The arguments don't describe a performable action.
    #[error("invalid action arguments: {0}")]
    InvalidArgs(String),

    /// The action's own execution logic failed.
    #[error("action hook failed: {0}")]
    Hook(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

// ---------------------------------------------------------------------------
// The capability trait
// ---------------------------------------------------------------------------

/// Capability record for one paid-action type.
#[async_trait]
pub trait PaidAction: Send + Sync {
    /// The action-type tag this capability answers to.
    fn kind(&self) -> &'static str;

    /// Whether anonymous requesters may perform this action.
    fn anonable(&self) -> bool {
        false
    }

    /// The payment methods this action accepts.
    fn payment_methods(&self) -> &'static [PaymentMethod];

    fn supports(&self, method: PaymentMethod) -> bool {
        self.payment_methods().contains(&method)
    }

    /// Total cost of the action in millisatoshis.
    async fn cost(&self, args: &Value, payer: Option<UserId>) -> Result<u64, ActionError>;

    /// The distributions owed when the action settles. Payouts without a
    /// token kind must leave over the payment network.
    async fn pay_outs(
        &self,
        args: &Value,
        payer: Option<UserId>,
    ) -> Result<Vec<PayOut>, ActionError>;

    /// Execute the action. Runs inside the orchestrator's transaction.
    fn perform(
        &self,
        tx: &mut StoreTx<'_>,
        payin: &PayIn,
        args: &Value,
    ) -> Result<Value, ActionError>;

    /// Settlement hook, run in the same transaction that credits payouts.
    fn on_paid(&self, _tx: &mut StoreTx<'_>, _payin: &PayIn) -> Result<(), ActionError> {
        Ok(())
    }

    /// Compensation hook, run in the same transaction that refunds debits.
    fn on_fail(&self, _tx: &mut StoreTx<'_>, _payin: &PayIn) -> Result<(), ActionError> {
        Ok(())
    }

    /// Invoice memo for this pay-in. `None` leaves the invoice memo-less.
    async fn describe(&self, _payin: &PayIn) -> Option<String> {
        None
    }

    /// Best-effort effects after settlement commits (notifications,
    /// denormalized counters). Never blocks or fails the settlement.
    async fn non_critical_side_effects(&self, _payin: &PayIn) -> Result<(), ActionError> {
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Explicit action-type → capability lookup.
#[derive(Default)]
pub struct ActionRegistry {
    actions: HashMap<&'static str, Arc<dyn PaidAction>>,
}

impl ActionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a capability. Last registration for a tag wins — useful in
    /// tests, suspicious in production.
    pub fn register(&mut self, action: Arc<dyn PaidAction>) {
        self.actions.insert(action.kind(), action);
    }

    pub fn get(&self, kind: &str) -> Option<Arc<dyn PaidAction>> {
        self.actions.get(kind).cloned()
    }

    pub fn with(mut self, action: Arc<dyn PaidAction>) -> Self {
        self.register(action);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Noop;

    #[async_trait]
    impl PaidAction for Noop {
        fn kind(&self) -> &'static str {
            "noop"
        }

        fn payment_methods(&self) -> &'static [PaymentMethod] {
            &[PaymentMethod::FeeCredits, PaymentMethod::Optimistic]
        }

        async fn cost(&self, _args: &Value, _payer: Option<UserId>) -> Result<u64, ActionError> {
            Ok(1_000)
        }

        async fn pay_outs(
            &self,
            _args: &Value,
            _payer: Option<UserId>,
        ) -> Result<Vec<PayOut>, ActionError> {
            Ok(Vec::new())
        }

        fn perform(
            &self,
            _tx: &mut StoreTx<'_>,
            _payin: &PayIn,
            _args: &Value,
        ) -> Result<Value, ActionError> {
            Ok(Value::Null)
        }
    }

    #[test]
    fn registry_resolves_registered_kinds() {
        let registry = ActionRegistry::new().with(Arc::new(Noop));
        assert!(registry.get("noop").is_some());
        assert!(registry.get("zap").is_none());
    }

    #[test]
    fn supports_checks_the_method_list() {
        let action = Noop;
        assert!(action.supports(PaymentMethod::Optimistic));
        assert!(!action.supports(PaymentMethod::P2P));
    }
}
