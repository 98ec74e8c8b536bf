//! # PayIn Reconciliation
//!
//! Everything here re-derives pay-in progress from observed network
//! facts. The worker calls these functions for every invoice/payment
//! event, for every due job, and for every record the sweep touches —
//! the same fact observed five times must land in the same place it
//! would have landed observed once.

use chrono::Utc;
use tracing::{debug, warn};

use crate::forward::machine;
use crate::lightning::{InvoiceState, LightningError, PaymentState};
use crate::payin::model::{PayInFailureReason, PayInState};
use crate::payin::orchestrator::{pay_in_failed, pay_in_paid, perform_held};
use crate::store::jobs::JobKind;
use crate::{Deps, EngineError};

/// Reconcile an inbound invoice by hash. `hint` carries the event's
/// snapshot when we have one, saving a node round-trip.
pub async fn check_payin_invoice(
    deps: &Deps,
    hash: &str,
    hint: Option<InvoiceState>,
) -> Result<(), EngineError> {
    let inv = match hint {
        Some(inv) => inv,
        None => match deps.node.get_invoice(hash).await {
            Ok(inv) => inv,
            // The node forgot it or never had it; nothing to drive.
            Err(LightningError::InvoiceNotFound(_)) => return Ok(()),
            Err(e) => return Err(e.into()),
        },
    };

    // Wrapped invoices belong to the relay machine.
    if let Some(forward) = deps.store.forward_by_invoice(hash)? {
        return machine::reconcile_incoming(deps, &forward, &inv).await;
    }

    let Some(payin) = deps.store.payin_by_invoice(hash)? else {
        // The invoice exists on the node but isn't recorded yet — the
        // attach transaction is still in flight. A later pass catches it.
        debug!(hash, "invoice not recorded yet, skipping");
        return Ok(());
    };

    if payin.is_terminal() {
        if let Some(index) = inv.confirmed_index {
            deps.store.note_confirmed_index(index)?;
        }
        return Ok(());
    }

    if inv.is_confirmed {
        pay_in_paid(deps, &payin.id, Some(&inv)).await?;
    } else if inv.is_held {
        if let Err(e) = perform_held(deps, &payin.id, &inv).await {
            match e {
                EngineError::Action(err) => {
                    // The action can't execute; release the committed
                    // funds and compensate instead of taking the money.
                    warn!(payin = %payin.id, error = %err, "held execution failed, compensating");
                    pay_in_failed(deps, &payin.id, PayInFailureReason::ActionFailed).await?;
                }
                other => return Err(other),
            }
        }
    } else if inv.is_canceled {
        let reason = if Utc::now() >= inv.expires_at {
            PayInFailureReason::InvoiceExpired
        } else {
            PayInFailureReason::InvoiceCanceled
        };
        pay_in_failed(deps, &payin.id, reason).await?;
    }

    Ok(())
}

/// Reconcile an outbound payment by hash.
pub async fn check_payout_payment(
    deps: &Deps,
    hash: &str,
    hint: Option<PaymentState>,
) -> Result<(), EngineError> {
    let Some(forward) = deps.store.forward_by_withdrawal(hash)? else {
        return Ok(());
    };
    if forward.is_terminal() {
        return Ok(());
    }
    let payment = match hint {
        Some(payment) => payment,
        None => deps.node.get_payment(hash).await?,
    };
    machine::reconcile_outgoing(deps, &forward, &payment).await
}

/// Dispatch one durable job. Safe to run any number of times.
pub async fn run_job(deps: &Deps, kind: &JobKind) -> Result<(), EngineError> {
    match kind {
        JobKind::CheckPayIn { payin_id } => {
            let Some(payin) = deps.store.get_payin(payin_id)? else {
                return Ok(());
            };
            match payin.state {
                // Still waiting for an invoice past the verify delay:
                // creation crashed after commit. Compensate.
                PayInState::PendingInvoiceCreation => {
                    pay_in_failed(deps, payin_id, PayInFailureReason::InvoiceCreationFailed)
                        .await?;
                }
                PayInState::Pending | PayInState::PendingHeld => {
                    if let Some(hash) = &payin.invoice_hash {
                        check_payin_invoice(deps, hash, None).await?;
                    }
                }
                PayInState::Paid | PayInState::Failed => {}
            }
            Ok(())
        }
        JobKind::FailPayIn { payin_id, reason } => {
            pay_in_failed(deps, payin_id, *reason).await?;
            Ok(())
        }
        JobKind::CheckInvoice { hash } => check_payin_invoice(deps, hash, None).await,
        JobKind::CheckWithdrawal { hash } => check_payout_payment(deps, hash, None).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::PaymentMethod;
    use crate::forward::model::ForwardStatus;
    use crate::ledger::TokenKind;
    use crate::payin::model::PayOut;
    use crate::payin::orchestrator::request_pay_in;
    use crate::payin::PayInRequest;
    use crate::testing::{fund, harness, TestAction};
    use crate::lightning::{LightningNode, RouteFeeEstimate};
    use serde_json::json;
    use std::sync::atomic::Ordering;
    use std::sync::Arc;

    fn request(action: &str, payer: Option<u64>) -> PayInRequest {
        PayInRequest {
            action: action.to_string(),
            args: json!({ "target": 42 }),
            payer,
            hide_invoice_desc: false,
        }
    }

    async fn drain_jobs(deps: &crate::Deps) {
        let due = deps
            .store
            .due_jobs(Utc::now() + chrono::Duration::seconds(3600), 100)
            .unwrap();
        for job in due {
            deps.store.take_job(&job).unwrap();
            run_job(deps, &job.kind).await.unwrap();
        }
    }

    // -----------------------------------------------------------------------
    // 1. Fully covered by custodial tokens: immediate PAID, no invoice
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn custodial_cover_pays_immediately() {
        let action = Arc::new(TestAction::new(
            "tip",
            1_000_000,
            &[PaymentMethod::FeeCredits, PaymentMethod::Optimistic],
        ));
        let (deps, _node) = harness(vec![action.clone()], &[]);
        fund(&deps, 1, 0, 1_500_000);

        let receipt = request_pay_in(&deps, &request("tip", Some(1))).await.unwrap();

        assert_eq!(receipt.payin.state, PayInState::Paid);
        assert!(receipt.invoice.is_none());
        assert!(receipt.payin.invoice_hash.is_none());
        assert!(receipt.result.is_some());

        // One debit: 1_000_000 mcredits with the audit balance.
        assert_eq!(receipt.payin.debits.len(), 1);
        assert_eq!(receipt.payin.debits[0].kind, TokenKind::Credits);
        assert_eq!(receipt.payin.debits[0].msats, 1_000_000);
        assert_eq!(receipt.payin.debits[0].msats_before, 1_500_000);
        assert_eq!(deps.store.get_balance(1).unwrap().mcredits, 500_000);

        // Perform and settlement ran exactly once, atomically.
        assert_eq!(action.performed.load(Ordering::SeqCst), 1);
        assert_eq!(action.paid.load(Ordering::SeqCst), 1);

        // Re-running reconciliation against the settled pay-in is a no-op.
        drain_jobs(&deps).await;
        assert_eq!(action.paid.load(Ordering::SeqCst), 1);
    }

    // -----------------------------------------------------------------------
    // 2. Optimistic shortfall: perform now, invoice out, onPaid on confirm
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn optimistic_shortfall_performs_then_settles_on_confirmation() {
        let action = Arc::new(
            TestAction::new(
                "boost",
                5_000_000,
                &[PaymentMethod::FeeCredits, PaymentMethod::Optimistic],
            )
            .with_pay_out(PayOut {
                recipient: Some(2),
                kind: Some(TokenKind::Sats),
                msats: 4_000_000,
                msats_before: None,
            }),
        );
        let (deps, node) = harness(vec![action.clone()], &[]);

        let receipt = request_pay_in(&deps, &request("boost", Some(1)))
            .await
            .unwrap();

        // Balance was zero: the whole cost rides on the invoice.
        assert_eq!(receipt.payin.state, PayInState::Pending);
        assert!(receipt.payin.debits.is_empty());
        let bolt11 = receipt.invoice.clone().unwrap();
        let parsed = node.parse_payment_request(&bolt11).await.unwrap();
        assert_eq!(parsed.msats, Some(5_000_000));

        // Optimistic: the action already ran, settlement hasn't.
        assert_eq!(action.performed.load(Ordering::SeqCst), 1);
        assert_eq!(action.paid.load(Ordering::SeqCst), 0);

        // Payment arrives; reconciliation settles and distributes.
        let hash = receipt.payin.invoice_hash.clone().unwrap();
        node.receive_payment(&hash);
        check_payin_invoice(&deps, &hash, None).await.unwrap();

        let payin = deps.store.get_payin(&receipt.payin.id).unwrap().unwrap();
        assert_eq!(payin.state, PayInState::Paid);
        assert_eq!(action.performed.load(Ordering::SeqCst), 1);
        assert_eq!(action.paid.load(Ordering::SeqCst), 1);

        // The recipient got the payout with its audit balance recorded.
        assert_eq!(deps.store.get_balance(2).unwrap().msats, 4_000_000);
        assert_eq!(payin.pay_outs[0].msats_before, Some(0));

        // Replayed confirmation events change nothing further.
        check_payin_invoice(&deps, &hash, None).await.unwrap();
        assert_eq!(action.paid.load(Ordering::SeqCst), 1);
        assert_eq!(deps.store.get_balance(2).unwrap().msats, 4_000_000);
    }

    // -----------------------------------------------------------------------
    // 3. Invoice creation fails: compensation restores every debit
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn failed_invoice_creation_compensates_exactly_once() {
        let action = Arc::new(TestAction::new(
            "post",
            5_000_000,
            &[PaymentMethod::FeeCredits, PaymentMethod::Optimistic],
        ));
        let (deps, node) = harness(vec![action.clone()], &[]);
        fund(&deps, 1, 2_000_000, 0);
        node.fail_invoice_creation(true);

        let err = request_pay_in(&deps, &request("post", Some(1)))
            .await
            .unwrap_err();
        assert!(matches!(err, crate::EngineError::Lightning(_)));

        // The debit is committed; the refund is owed by the scheduled
        // compensation, not by the failed call.
        assert_eq!(deps.store.get_balance(1).unwrap().msats, 0);

        drain_jobs(&deps).await;

        let payins = deps.store.non_terminal_payins().unwrap();
        assert!(payins.is_empty());
        assert_eq!(deps.store.get_balance(1).unwrap().msats, 2_000_000);
        assert_eq!(action.failed.load(Ordering::SeqCst), 1);

        // Compensation is one-shot: replaying the job changes nothing.
        drain_jobs(&deps).await;
        assert_eq!(deps.store.get_balance(1).unwrap().msats, 2_000_000);
        assert_eq!(action.failed.load(Ordering::SeqCst), 1);
    }

    // -----------------------------------------------------------------------
    // 4. Pessimistic hold: perform only once funds are committed
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn pessimistic_hold_performs_after_funds_commit() {
        let action = Arc::new(TestAction::new(
            "purchase",
            1_000_000,
            &[PaymentMethod::Pessimistic],
        ));
        let (deps, node) = harness(vec![action.clone()], &[]);

        let receipt = request_pay_in(&deps, &request("purchase", Some(1)))
            .await
            .unwrap();
        assert_eq!(receipt.payin.state, PayInState::PendingHeld);
        assert!(receipt.result.is_none());
        assert_eq!(action.performed.load(Ordering::SeqCst), 0);

        let hash = receipt.payin.invoice_hash.clone().unwrap();
        node.receive_htlc(&hash);
        check_payin_invoice(&deps, &hash, None).await.unwrap();

        // Held: the action ran and the hold was claimed with our secret.
        assert_eq!(action.performed.load(Ordering::SeqCst), 1);
        let inv = node.get_invoice(&hash).await.unwrap();
        assert!(inv.is_confirmed);

        // The claim's confirmation settles the pay-in.
        check_payin_invoice(&deps, &hash, None).await.unwrap();
        let payin = deps.store.get_payin(&receipt.payin.id).unwrap().unwrap();
        assert_eq!(payin.state, PayInState::Paid);
        assert_eq!(action.performed.load(Ordering::SeqCst), 1);
        assert_eq!(action.paid.load(Ordering::SeqCst), 1);
    }

    // -----------------------------------------------------------------------
    // 5. Canceled invoice fails the pay-in and refunds
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn canceled_invoice_fails_and_refunds() {
        let action = Arc::new(TestAction::new(
            "post",
            5_000_000,
            &[PaymentMethod::FeeCredits, PaymentMethod::Optimistic],
        ));
        let (deps, node) = harness(vec![action.clone()], &[]);
        fund(&deps, 1, 0, 3_000_000);

        let receipt = request_pay_in(&deps, &request("post", Some(1)))
            .await
            .unwrap();
        assert_eq!(deps.store.get_balance(1).unwrap().mcredits, 0);

        let hash = receipt.payin.invoice_hash.clone().unwrap();
        node.expire_invoice(&hash);
        check_payin_invoice(&deps, &hash, None).await.unwrap();

        let payin = deps.store.get_payin(&receipt.payin.id).unwrap().unwrap();
        assert_eq!(payin.state, PayInState::Failed);
        assert_eq!(
            payin.failure_reason,
            Some(PayInFailureReason::InvoiceCanceled)
        );
        assert_eq!(deps.store.get_balance(1).unwrap().mcredits, 3_000_000);
        assert_eq!(action.failed.load(Ordering::SeqCst), 1);
    }

    // -----------------------------------------------------------------------
    // 6. Validation failures commit nothing
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn validation_failures_have_no_side_effects() {
        let action = Arc::new(TestAction::new(
            "members-only",
            1_000_000,
            &[PaymentMethod::FeeCredits],
        ));
        let (deps, _node) = harness(vec![action.clone()], &[]);
        fund(&deps, 1, 500_000, 0);

        // Unknown action.
        let err = request_pay_in(&deps, &request("nope", Some(1)))
            .await
            .unwrap_err();
        assert!(matches!(err, crate::EngineError::UnknownAction(_)));

        // Anonymous where login is required.
        let err = request_pay_in(&deps, &request("members-only", None))
            .await
            .unwrap_err();
        assert!(matches!(err, crate::EngineError::LoginRequired));

        // Short on funds with no invoiceable payment method: the debit
        // taken inside the transaction must be rolled back with it.
        let err = request_pay_in(&deps, &request("members-only", Some(1)))
            .await
            .unwrap_err();
        assert!(matches!(err, crate::EngineError::InsufficientFunds));
        assert_eq!(deps.store.get_balance(1).unwrap().msats, 500_000);
        assert!(deps.store.non_terminal_payins().unwrap().is_empty());
        assert_eq!(action.performed.load(Ordering::SeqCst), 0);
    }

    // -----------------------------------------------------------------------
    // 7. Peer relay end to end: request -> held -> forwarded -> paid
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn p2p_pay_in_relays_and_settles() {
        let action = Arc::new(
            TestAction::new("zap", 1_000_000, &[PaymentMethod::P2P]).with_pay_out(PayOut {
                recipient: Some(2),
                kind: None,
                msats: 1_000_000,
                msats_before: None,
            }),
        );
        let (deps, node) = harness(vec![action.clone()], &[2]);
        node.set_fee_estimate(RouteFeeEstimate {
            routing_fee_msats: 1_000,
            timelock_delay: 800_000 + 60,
        });

        let receipt = request_pay_in(&deps, &request("zap", Some(1)))
            .await
            .unwrap();
        assert_eq!(receipt.payin.state, PayInState::PendingHeld);
        let forward_id = receipt.payin.forward_id.unwrap();
        let hash = receipt.payin.invoice_hash.clone().unwrap();

        // The inner invoice requests the remainder less the relay fee.
        let forward = deps.store.get_forward(&forward_id).unwrap().unwrap();
        let inner = node.parse_payment_request(&forward.bolt11).await.unwrap();
        assert_eq!(inner.msats, Some(900_000));

        // Payer's HTLCs are accepted; the relay takes over.
        node.receive_htlc(&hash);
        check_payin_invoice(&deps, &hash, None).await.unwrap();
        check_payout_payment(&deps, &hash, None).await.unwrap();

        // The outgoing payment confirmed and claimed the inbound hold.
        let inv = node.get_invoice(&hash).await.unwrap();
        assert!(inv.is_confirmed);

        check_payin_invoice(&deps, &hash, None).await.unwrap();
        let forward = deps.store.get_forward(&forward_id).unwrap().unwrap();
        assert_eq!(forward.status, ForwardStatus::Confirmed);

        let payin = deps.store.get_payin(&receipt.payin.id).unwrap().unwrap();
        assert_eq!(payin.state, PayInState::Paid);
        // Deferred execution ran exactly once, at settlement.
        assert_eq!(action.performed.load(Ordering::SeqCst), 1);
        assert_eq!(action.paid.load(Ordering::SeqCst), 1);
    }

    // -----------------------------------------------------------------------
    // 8. Held execution failure releases the hold and compensates
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn failing_held_execution_compensates() {
        let action = Arc::new(TestAction::new(
            "purchase",
            1_000_000,
            &[PaymentMethod::FeeCredits, PaymentMethod::Pessimistic],
        ));
        let (deps, node) = harness(vec![action.clone()], &[]);
        fund(&deps, 1, 0, 400_000);
        action.fail_perform.store(true, Ordering::SeqCst);

        let receipt = request_pay_in(&deps, &request("purchase", Some(1)))
            .await
            .unwrap();
        let hash = receipt.payin.invoice_hash.clone().unwrap();
        node.receive_htlc(&hash);
        check_payin_invoice(&deps, &hash, None).await.unwrap();

        let payin = deps.store.get_payin(&receipt.payin.id).unwrap().unwrap();
        assert_eq!(payin.state, PayInState::Failed);
        assert_eq!(payin.failure_reason, Some(PayInFailureReason::ActionFailed));
        // Partial debit refunded; the hold was never claimed.
        assert_eq!(deps.store.get_balance(1).unwrap().mcredits, 400_000);
        let inv = node.get_invoice(&hash).await.unwrap();
        assert!(!inv.is_confirmed);
        assert!(inv.is_canceled);
    }

    // -----------------------------------------------------------------------
    // 9. Stalled invoice creation is failed by the verify job
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn verify_job_fails_stalled_pay_in() {
        let action = Arc::new(TestAction::new(
            "post",
            1_000_000,
            &[PaymentMethod::FeeCredits, PaymentMethod::Optimistic],
        ));
        let (deps, node) = harness(vec![action.clone()], &[]);
        fund(&deps, 1, 400_000, 0);
        node.fail_invoice_creation(true);

        // The failed call schedules FailPayIn immediately; drop that job
        // to simulate a crash racing the scheduler, leaving only the
        // transactional CheckPayIn verify job.
        let _ = request_pay_in(&deps, &request("post", Some(1))).await;
        for job in deps.store.due_jobs(Utc::now(), 10).unwrap() {
            if matches!(job.kind, JobKind::FailPayIn { .. }) {
                deps.store.take_job(&job).unwrap();
            }
        }

        drain_jobs(&deps).await;

        assert!(deps.store.non_terminal_payins().unwrap().is_empty());
        assert_eq!(deps.store.get_balance(1).unwrap().msats, 400_000);
    }
}
