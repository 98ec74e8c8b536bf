//! # Wallet-Protocol Adapters
//!
//! On the peer-relay path, the recipient's own wallet issues the inner
//! invoice that we wrap. The engine doesn't care which protocol that
//! wallet speaks — it only needs the [`WalletAdapter`] capability: "give
//! me a payment request for this amount, within this deadline".
//!
//! Resolving which adapter serves which user is the [`WalletDirectory`]'s
//! job. Production wires a real directory backed by user configuration;
//! tests use [`StaticWalletDirectory`] and [`MockWalletAdapter`].

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::ledger::UserId;
use crate::lightning::Bolt11;

/// Errors from wallet-invoice issuance. All of them fail the pay-in's
/// invoice-creation step; none are retried against the same adapter.
#[derive(Debug, Error)]
pub enum WalletError {
    /// The recipient has no wallet capable of receiving.
    #[error("no receiving wallet for user {0}")]
    NoWallet(UserId),

    /// The adapter failed to produce an invoice.
    #[error("wallet adapter failed: {0}")]
    Adapter(String),

    /// The adapter did not answer within its deadline.
    #[error("wallet adapter timed out after {0:?}")]
    Timeout(Duration),
}

/// What we ask a wallet for.
#[derive(Debug, Clone)]
pub struct WalletInvoiceParams {
    /// Amount the recipient's invoice should request, in millisatoshis.
    pub msats: u64,
    pub description: Option<String>,
    /// Requested invoice lifetime in seconds.
    pub expiry_secs: u64,
}

/// A pluggable `createInvoice` capability, one per wallet protocol.
#[async_trait]
pub trait WalletAdapter: Send + Sync {
    /// Request an invoice from the wallet. Implementations must respect
    /// the deadline — a stuck wallet must not stall orchestration.
    async fn create_invoice(
        &self,
        params: &WalletInvoiceParams,
        timeout: Duration,
    ) -> Result<Bolt11, WalletError>;

    /// Probe the wallet with a throwaway invoice request. Used when a
    /// wallet is attached, not on the payment path.
    async fn test_create_invoice(&self, timeout: Duration) -> Result<Bolt11, WalletError>;
}

/// Resolves the receiving wallet for a user and issues the inner invoice.
#[async_trait]
pub trait WalletDirectory: Send + Sync {
    async fn create_invoice_for(
        &self,
        recipient: UserId,
        params: &WalletInvoiceParams,
        timeout: Duration,
    ) -> Result<Bolt11, WalletError>;
}

// ---------------------------------------------------------------------------
// Static directory
// ---------------------------------------------------------------------------

/// A fixed user → adapter map. Enough for tests and single-tenant setups.
#[derive(Default)]
pub struct StaticWalletDirectory {
    wallets: HashMap<UserId, Arc<dyn WalletAdapter>>,
}

impl StaticWalletDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attach(&mut self, user: UserId, adapter: Arc<dyn WalletAdapter>) {
        self.wallets.insert(user, adapter);
    }

    pub fn with(mut self, user: UserId, adapter: Arc<dyn WalletAdapter>) -> Self {
        self.attach(user, adapter);
        self
    }
}

#[async_trait]
impl WalletDirectory for StaticWalletDirectory {
    async fn create_invoice_for(
        &self,
        recipient: UserId,
        params: &WalletInvoiceParams,
        timeout: Duration,
    ) -> Result<Bolt11, WalletError> {
        let adapter = self
            .wallets
            .get(&recipient)
            .ok_or(WalletError::NoWallet(recipient))?;
        adapter.create_invoice(params, timeout).await
    }
}

// ---------------------------------------------------------------------------
// Mock adapter
// ---------------------------------------------------------------------------

/// A wallet backed by the in-memory [`mock::MockNode`](crate::lightning::mock::MockNode):
/// its invoices are *external* to the engine's node — parseable and
/// payable, but not hosted — exactly like a real recipient's wallet, so
/// the outgoing leg of a forward can actually resolve in tests.
pub struct MockWalletAdapter {
    node: Arc<crate::lightning::mock::MockNode>,
    /// When set, invoice creation fails with this message.
    broken: parking_lot::Mutex<Option<String>>,
}

impl MockWalletAdapter {
    pub fn new(node: Arc<crate::lightning::mock::MockNode>) -> Self {
        Self {
            node,
            broken: parking_lot::Mutex::new(None),
        }
    }

    /// Make every subsequent invoice request fail.
    pub fn break_with(&self, message: &str) {
        *self.broken.lock() = Some(message.to_string());
    }
}

#[async_trait]
impl WalletAdapter for MockWalletAdapter {
    async fn create_invoice(
        &self,
        params: &WalletInvoiceParams,
        _timeout: Duration,
    ) -> Result<Bolt11, WalletError> {
        if let Some(message) = self.broken.lock().clone() {
            return Err(WalletError::Adapter(message));
        }
        Ok(self.node.issue_external_invoice(
            params.msats,
            params.description.clone(),
            params.expiry_secs as i64,
        ))
    }

    async fn test_create_invoice(&self, timeout: Duration) -> Result<Bolt11, WalletError> {
        self.create_invoice(
            &WalletInvoiceParams {
                msats: 1_000,
                description: Some("test invoice".to_string()),
                expiry_secs: 60,
            },
            timeout,
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lightning::mock::MockNode;
    use crate::lightning::LightningNode;

    #[tokio::test]
    async fn directory_resolves_attached_wallets() {
        let node = Arc::new(MockNode::new());
        let directory = StaticWalletDirectory::new()
            .with(1, Arc::new(MockWalletAdapter::new(Arc::clone(&node))));

        let bolt11 = directory
            .create_invoice_for(
                1,
                &WalletInvoiceParams {
                    msats: 5_000,
                    description: None,
                    expiry_secs: 600,
                },
                Duration::from_secs(5),
            )
            .await
            .unwrap();

        let parsed = node.parse_payment_request(&bolt11).await.unwrap();
        assert_eq!(parsed.msats, Some(5_000));
    }

    #[tokio::test]
    async fn missing_wallet_is_an_error() {
        let directory = StaticWalletDirectory::new();
        let err = directory
            .create_invoice_for(
                9,
                &WalletInvoiceParams {
                    msats: 5_000,
                    description: None,
                    expiry_secs: 600,
                },
                Duration::from_secs(5),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, WalletError::NoWallet(9)));
    }

    #[tokio::test]
    async fn broken_wallet_surfaces_adapter_error() {
        let node = Arc::new(MockNode::new());
        let adapter = MockWalletAdapter::new(node);
        adapter.break_with("socket hung up");

        let err = adapter
            .test_create_invoice(Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, WalletError::Adapter(_)));
    }

    #[tokio::test]
    async fn test_invoice_probe_works() {
        let node = Arc::new(MockNode::new());
        let adapter = MockWalletAdapter::new(node);
        let bolt11 = adapter
            .test_create_invoice(Duration::from_secs(5))
            .await
            .unwrap();
        assert!(bolt11.starts_with("lnmock1"));
    }
}
