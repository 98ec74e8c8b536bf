//! Shared test fixtures: a configurable paid action with hook counters
//! and a harness that wires a temporary store, mock node, registry, and
//! wallet directory into a [`Deps`].

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::action::{ActionError, ActionRegistry, PaidAction, PaymentMethod};
use crate::config::EngineConfig;
use crate::ledger::{UserBalance, UserId};
use crate::lightning::mock::MockNode;
use crate::payin::model::{PayIn, PayOut};
use crate::store::{Store, StoreError, StoreTx};
use crate::wallet::{MockWalletAdapter, StaticWalletDirectory};
use crate::Deps;

/// A paid action whose behavior is dialed in per test, counting every
/// hook invocation so assertions can check exactly-once semantics.
pub(crate) struct TestAction {
    kind: &'static str,
    methods: &'static [PaymentMethod],
    anonable: bool,
    cost: u64,
    pay_outs: Vec<PayOut>,
    pub performed: AtomicU64,
    pub paid: AtomicU64,
    pub failed: AtomicU64,
    pub side_effects: AtomicU64,
    pub fail_perform: AtomicBool,
}

impl TestAction {
    pub fn new(kind: &'static str, cost: u64, methods: &'static [PaymentMethod]) -> Self {
        Self {
            kind,
            methods,
            anonable: false,
            cost,
            pay_outs: Vec::new(),
            performed: AtomicU64::new(0),
            paid: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            side_effects: AtomicU64::new(0),
            fail_perform: AtomicBool::new(false),
        }
    }

    pub fn with_pay_out(mut self, pay_out: PayOut) -> Self {
        self.pay_outs.push(pay_out);
        self
    }
}

#[async_trait]
impl PaidAction for TestAction {
    fn kind(&self) -> &'static str {
        self.kind
    }

    fn anonable(&self) -> bool {
        self.anonable
    }

    fn payment_methods(&self) -> &'static [PaymentMethod] {
        self.methods
    }

    async fn cost(&self, _args: &Value, _payer: Option<UserId>) -> Result<u64, ActionError> {
        Ok(self.cost)
    }

    async fn pay_outs(
        &self,
        _args: &Value,
        _payer: Option<UserId>,
    ) -> Result<Vec<PayOut>, ActionError> {
        Ok(self.pay_outs.clone())
    }

    fn perform(
        &self,
        _tx: &mut StoreTx<'_>,
        _payin: &PayIn,
        args: &Value,
    ) -> Result<Value, ActionError> {
        if self.fail_perform.load(Ordering::SeqCst) {
            return Err(ActionError::Hook("perform blew up".to_string()));
        }
        self.performed.fetch_add(1, Ordering::SeqCst);
        Ok(json!({ "performed": true, "args": args }))
    }

    fn on_paid(&self, _tx: &mut StoreTx<'_>, _payin: &PayIn) -> Result<(), ActionError> {
        self.paid.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn on_fail(&self, _tx: &mut StoreTx<'_>, _payin: &PayIn) -> Result<(), ActionError> {
        self.failed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn describe(&self, _payin: &PayIn) -> Option<String> {
        Some(format!("{} via sluice", self.kind))
    }

    async fn non_critical_side_effects(&self, _payin: &PayIn) -> Result<(), ActionError> {
        self.side_effects.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Wire a full engine context around a temporary store and a mock node.
/// `wallet_users` get a mock receiving wallet attached.
pub(crate) fn harness(
    actions: Vec<Arc<dyn PaidAction>>,
    wallet_users: &[UserId],
) -> (Deps, Arc<MockNode>) {
    let node = Arc::new(MockNode::new());
    let mut registry = ActionRegistry::new();
    for action in actions {
        registry.register(action);
    }
    let mut wallets = StaticWalletDirectory::new();
    for user in wallet_users {
        wallets.attach(*user, Arc::new(MockWalletAdapter::new(Arc::clone(&node))));
    }
    let deps = Deps::new(
        Arc::new(Store::open_temporary().expect("temp store")),
        node.clone(),
        Arc::new(registry),
        Arc::new(wallets),
        EngineConfig::default(),
    );
    (deps, node)
}

/// Seed a user's balances.
pub(crate) fn fund(deps: &Deps, user: UserId, msats: u64, mcredits: u64) {
    deps.store
        .transact::<_, StoreError, _>(|tx| tx.put_balance(user, &UserBalance { msats, mcredits }))
        .expect("fund user");
}
