//! # Invoice-Forward State Machine
//!
//! Multiple workers observe the same network facts and race to advance
//! the same forward. Every transition here is a conditional write guarded
//! by "current status == expected prior status"; whoever commits first
//! performs the transition's effects, everyone else silently no-ops.
//!
//! Things this machine must never do:
//!
//! 1. cancel an inbound payment that has a forward in progress
//! 2. forward an inbound payment that has been cancelled
//! 3. forward an inbound payment more than once
//! 4. miss claiming an inbound payment that forwarded successfully
//! 5. miss the effects of a successful claim
//!
//! The two reconciliation entry points — [`reconcile_incoming`] and
//! [`reconcile_outgoing`] — re-derive the correct next transition purely
//! from the observed invoice/payment state, so they are safe to invoke
//! repeatedly, out of order, and after restarts.

use chrono::{Duration as ChronoDuration, Utc};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::{
    JOB_PRIORITY_PAYMENT, MIN_SETTLEMENT_CLTV_DELTA, PATHFINDING_TIMEOUT,
    WITHDRAWAL_NOT_SENT_GRACE,
};
use crate::forward::model::{ForwardStatus, InvoiceForward, Withdrawal, WithdrawalStatus};
use crate::lightning::{InvoiceState, PayRequest, PaymentState};
use crate::payin::model::PayInFailureReason;
use crate::payin::orchestrator::{pay_in_failed, pay_in_paid};
use crate::store::jobs::{Job, JobKind};
use crate::store::StoreTx;
use crate::{Deps, EngineError};

// ---------------------------------------------------------------------------
// The guarded edge
// ---------------------------------------------------------------------------

/// Advance a forward from `from` to `to`, applying `extra` writes in the
/// same transaction. Returns the updated forward if this caller won the
/// edge, `None` if another worker already advanced it.
fn advance(
    deps: &Deps,
    id: &Uuid,
    from: ForwardStatus,
    to: ForwardStatus,
    extra: impl Fn(&mut InvoiceForward, &mut StoreTx<'_>) -> Result<(), EngineError>,
) -> Result<Option<InvoiceForward>, EngineError> {
    let won = deps.store.transact::<_, EngineError, _>(|tx| {
        let Some(mut forward) = tx.get_forward(id)? else {
            return Ok(None);
        };
        if forward.status != from {
            return Ok(None);
        }
        extra(&mut forward, tx)?;
        forward.advance(to);
        tx.put_forward(&forward)?;
        Ok(Some(forward))
    })?;
    if let Some(forward) = &won {
        info!(forward = %forward.id, %from, %to, "forward transitioned");
    }
    Ok(won)
}

// ---------------------------------------------------------------------------
// Inbound reconciliation
// ---------------------------------------------------------------------------

/// Drive a forward from the observed state of its inbound invoice.
pub async fn reconcile_incoming(
    deps: &Deps,
    forward: &InvoiceForward,
    inv: &InvoiceState,
) -> Result<(), EngineError> {
    if inv.is_held {
        on_inbound_held(deps, forward, inv).await?;
    }

    if inv.is_confirmed {
        // Our claim settled. Finalize bookkeeping and pay the pay-in out;
        // both halves are guarded, so replays cost nothing.
        if let Err(e) = settled_to_confirmed(deps, &forward.id, inv) {
            warn!(forward = %forward.id, error = %e, "confirm bookkeeping failed, scheduling retry");
            deps.store.enqueue_job(&Job::new(
                JobKind::CheckInvoice {
                    hash: forward.invoice_hash.clone(),
                },
                Utc::now() + retry_delay(deps),
                JOB_PRIORITY_PAYMENT,
            ))?;
            return Ok(());
        }
        if let Some(index) = inv.confirmed_index {
            deps.store.note_confirmed_index(index)?;
        }
        if let Some(payin_id) = forward.payin_id {
            pay_in_paid(deps, &payin_id, Some(inv)).await?;
        }
    }

    if inv.is_canceled {
        cancel_abandoned(deps, forward).await?;
    }

    Ok(())
}

async fn on_inbound_held(
    deps: &Deps,
    forward: &InvoiceForward,
    inv: &InvoiceState,
) -> Result<(), EngineError> {
    created_to_held(deps, &forward.id, inv)?;

    // Re-read: we may have just won HELD, or a colleague may have moved
    // further already.
    let Some(current) = deps.store.get_forward(&forward.id)? else {
        return Ok(());
    };
    if current.status != ForwardStatus::Held {
        return Ok(());
    }

    let window = inv.settlement_window().unwrap_or(0);
    if window < MIN_SETTLEMENT_CLTV_DELTA {
        // The accepted window can't fit our settlement reserve. Abandon
        // before any money leaves.
        debug!(forward = %current.id, window, "settlement window too small, abandoning");
        if advance(deps, &current.id, ForwardStatus::Held, ForwardStatus::Cancelled, |_, _| {
            Ok(())
        })?
        .is_some()
        {
            release_inbound(deps, &current).await;
            if let Some(payin_id) = current.payin_id {
                pay_in_failed(deps, &payin_id, PayInFailureReason::ForwardFailed).await?;
            }
        }
        return Ok(());
    }

    held_to_forward_pending(deps, &current).await
}

fn created_to_held(
    deps: &Deps,
    id: &Uuid,
    inv: &InvoiceState,
) -> Result<Option<InvoiceForward>, EngineError> {
    advance(deps, id, ForwardStatus::Created, ForwardStatus::Held, |forward, tx| {
        forward.accept_height = inv.accept_height;
        forward.expiry_height = inv.expiry_height;
        if let Some(mut record) = tx.get_invoice(&forward.invoice_hash)? {
            record.is_held = true;
            record.msats_received = inv.msats_received;
            tx.put_invoice(&record)?;
        }
        Ok(())
    })
}

/// Record the withdrawal and dispatch the outgoing payment. The status
/// write commits before the dispatch, so losing workers can't double-pay;
/// a crash between commit and dispatch surfaces as a not-sent payment and
/// cascades into cancellation.
async fn held_to_forward_pending(
    deps: &Deps,
    forward: &InvoiceForward,
) -> Result<(), EngineError> {
    let parsed = deps.node.parse_payment_request(&forward.bolt11).await?;
    let msats_paying = parsed.msats.unwrap_or(0);

    let won = advance(
        deps,
        &forward.id,
        ForwardStatus::Held,
        ForwardStatus::ForwardPending,
        |forward, tx| {
            forward.withdrawal_hash = Some(forward.invoice_hash.clone());
            tx.put_withdrawal(&Withdrawal {
                hash: forward.invoice_hash.clone(),
                bolt11: forward.bolt11.clone(),
                msats_paying,
                msats_paid: 0,
                msats_fee_paying: forward.max_fee_msats,
                msats_fee_paid: 0,
                status: WithdrawalStatus::Pending,
                preimage: None,
                created_at: Utc::now(),
            })?;
            let id = forward.id;
            let hash = forward.invoice_hash.clone();
            tx.index_forward_withdrawal(&hash, &id)?;
            Ok(())
        },
    )?;

    let Some(current) = won else {
        return Ok(());
    };

    // The outgoing HTLCs must resolve while we still have blocks left to
    // claim the inbound leg.
    let max_timeout_height = current
        .expiry_height
        .map(|h| h.saturating_sub(MIN_SETTLEMENT_CLTV_DELTA));
    if let Err(e) = deps
        .node
        .pay_payment_request(&PayRequest {
            bolt11: current.bolt11.clone(),
            max_fee_msats: current.max_fee_msats,
            pathfinding_timeout: PATHFINDING_TIMEOUT,
            max_timeout_height,
        })
        .await
    {
        // The payment record (or its absence) is the source of truth from
        // here; the sweep will observe not-sent and cancel.
        warn!(forward = %current.id, error = %e, "outgoing payment dispatch failed");
    }
    Ok(())
}

/// The inbound invoice was independently canceled or expired. Attempted
/// against each state with no outgoing payment outstanding; the first
/// edge that matches wins. Everything else must route through the
/// outgoing-leg transitions.
async fn cancel_abandoned(deps: &Deps, forward: &InvoiceForward) -> Result<(), EngineError> {
    for from in [
        ForwardStatus::Created,
        ForwardStatus::Held,
        ForwardStatus::ForwardFailed,
    ] {
        if advance(deps, &forward.id, from, ForwardStatus::Cancelled, |forward, tx| {
            if let Some(mut record) = tx.get_invoice(&forward.invoice_hash)? {
                record.is_canceled = true;
                record.is_held = false;
                tx.put_invoice(&record)?;
            }
            Ok(())
        })?
        .is_some()
        {
            if let Some(payin_id) = forward.payin_id {
                pay_in_failed(deps, &payin_id, PayInFailureReason::InvoiceExpired).await?;
            }
            return Ok(());
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Outbound reconciliation
// ---------------------------------------------------------------------------

/// Drive a forward from the observed state of its outgoing payment.
pub async fn reconcile_outgoing(
    deps: &Deps,
    forward: &InvoiceForward,
    payment: &PaymentState,
) -> Result<(), EngineError> {
    if payment.is_failed || payment.not_sent {
        // "No such payment" right after the FORWARD_PENDING commit may
        // just mean the dispatch hasn't reached the node yet. Give it a
        // grace window before concluding it never happened.
        if payment.not_sent && !payment.is_failed && dispatch_may_be_in_flight(deps, forward)? {
            return Ok(());
        }
        let status = payment
            .failure
            .map(WithdrawalStatus::from)
            .unwrap_or(WithdrawalStatus::UnknownFailure);
        forward_pending_to_failed(deps, &forward.id, status)?;

        if advance(
            deps,
            &forward.id,
            ForwardStatus::ForwardFailed,
            ForwardStatus::Cancelled,
            |_, _| Ok(()),
        )?
        .is_some()
        {
            // Nothing was ever paid out; release the inbound hold and
            // compensate the pay-in.
            release_inbound(deps, forward).await;
            if let Some(payin_id) = forward.payin_id {
                pay_in_failed(deps, &payin_id, PayInFailureReason::ForwardFailed).await?;
            }
        }
    }

    if payment.is_confirmed {
        let Some(preimage) = payment.preimage.clone() else {
            warn!(forward = %forward.id, "confirmed payment carries no preimage");
            return Ok(());
        };

        // Claim the inbound hold FIRST. Recording the confirmation is
        // made dependent on the settle call succeeding, so we can never
        // believe we were paid while the inbound leg is still releasable.
        if let Err(e) = deps.node.settle_hold_invoice(&preimage).await {
            warn!(forward = %forward.id, error = %e, "inbound settle failed, scheduling retry");
            deps.store.enqueue_job(&Job::new(
                JobKind::CheckWithdrawal {
                    hash: forward.invoice_hash.clone(),
                },
                Utc::now() + retry_delay(deps),
                JOB_PRIORITY_PAYMENT,
            ))?;
            return Ok(());
        }

        forward_pending_to_confirmed(deps, &forward.id, payment)?;
        advance(
            deps,
            &forward.id,
            ForwardStatus::ForwardConfirmed,
            ForwardStatus::Settled,
            |_, _| Ok(()),
        )?;
        // The claim's own confirmation arrives as an inbound invoice
        // event and finishes the job: SETTLED -> CONFIRMED -> pay-in paid.
    }

    Ok(())
}

fn forward_pending_to_failed(
    deps: &Deps,
    id: &Uuid,
    status: WithdrawalStatus,
) -> Result<Option<InvoiceForward>, EngineError> {
    let won = advance(
        deps,
        id,
        ForwardStatus::ForwardPending,
        ForwardStatus::ForwardFailed,
        |forward, tx| {
            if let Some(hash) = &forward.withdrawal_hash {
                if let Some(mut withdrawal) = tx.get_withdrawal(hash)? {
                    withdrawal.status = status;
                    tx.put_withdrawal(&withdrawal)?;
                }
            }
            Ok(())
        },
    )?;
    if won.is_some() {
        info!(forward = %id, ?status, "outgoing payment failed");
    }
    Ok(won)
}

fn forward_pending_to_confirmed(
    deps: &Deps,
    id: &Uuid,
    payment: &PaymentState,
) -> Result<Option<InvoiceForward>, EngineError> {
    advance(
        deps,
        id,
        ForwardStatus::ForwardPending,
        ForwardStatus::ForwardConfirmed,
        |forward, tx| {
            if let Some(hash) = &forward.withdrawal_hash {
                if let Some(mut withdrawal) = tx.get_withdrawal(hash)? {
                    withdrawal.status = WithdrawalStatus::Confirmed;
                    withdrawal.msats_paid = payment.msats_paid;
                    withdrawal.msats_fee_paid = payment.fee_msats_paid;
                    withdrawal.preimage = payment.preimage.clone();
                    tx.put_withdrawal(&withdrawal)?;
                }
            }
            Ok(())
        },
    )
}

fn settled_to_confirmed(
    deps: &Deps,
    id: &Uuid,
    inv: &InvoiceState,
) -> Result<Option<InvoiceForward>, EngineError> {
    advance(
        deps,
        id,
        ForwardStatus::Settled,
        ForwardStatus::Confirmed,
        |forward, tx| {
            if let Some(mut record) = tx.get_invoice(&forward.invoice_hash)? {
                record.is_held = false;
                record.msats_received = inv.msats_received;
                record.confirmed_at = inv.confirmed_at;
                record.confirmed_index = inv.confirmed_index;
                tx.put_invoice(&record)?;
            }
            Ok(())
        },
    )
}

/// Whether the outgoing dispatch might still be on its way to the node:
/// a withdrawal record exists and is younger than the grace window.
fn dispatch_may_be_in_flight(
    deps: &Deps,
    forward: &InvoiceForward,
) -> Result<bool, EngineError> {
    let Some(hash) = &forward.withdrawal_hash else {
        return Ok(false);
    };
    let Some(withdrawal) = deps.store.get_withdrawal(hash)? else {
        return Ok(false);
    };
    let grace = ChronoDuration::from_std(WITHDRAWAL_NOT_SENT_GRACE)
        .unwrap_or_else(|_| ChronoDuration::seconds(60));
    Ok(Utc::now() < withdrawal.created_at + grace)
}

/// Best-effort release of the inbound hold. The invoice may already be
/// canceled or expired on the node side — that's fine, the goal state is
/// "not held", not "we canceled it".
async fn release_inbound(deps: &Deps, forward: &InvoiceForward) {
    if let Err(e) = deps.node.cancel_hold_invoice(&forward.invoice_hash).await {
        debug!(forward = %forward.id, error = %e, "inbound release skipped");
    }
}

fn retry_delay(deps: &Deps) -> ChronoDuration {
    ChronoDuration::from_std(deps.config.reconcile_retry_delay)
        .unwrap_or_else(|_| ChronoDuration::seconds(60))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::forward::wrap::{wrap_invoice, WrapRequest};
    use crate::lightning::mock::MockNode;
    use crate::lightning::{LightningNode, PaymentFailure, RouteFeeEstimate};
    use crate::payin::model::Invoice;
    use crate::store::StoreError;
    use crate::testing::harness;
    use std::sync::Arc;

    const HEIGHT: u64 = 800_000;

    /// Wrap an external inner invoice and persist the forward + invoice
    /// records, as the orchestrator would.
    async fn seed_forward(deps: &crate::Deps, node: &Arc<MockNode>) -> InvoiceForward {
        node.set_height(HEIGHT);
        node.set_fee_estimate(RouteFeeEstimate {
            routing_fee_msats: 1_000,
            timelock_delay: HEIGHT + 60,
        });

        let inner = node.issue_external_invoice(900_000, Some("relay me".to_string()), 540);
        let wrapped = wrap_invoice(
            node.as_ref(),
            &WrapRequest {
                incoming_msats: 1_000_000,
                bolt11: inner.clone(),
                fee_percent: 10,
                description: None,
                hide_description: false,
            },
        )
        .await
        .unwrap();

        let forward = InvoiceForward {
            id: Uuid::new_v4(),
            status: ForwardStatus::Created,
            status_changed_at: Utc::now(),
            bolt11: inner,
            max_fee_msats: wrapped.max_fee_msats,
            accept_height: None,
            expiry_height: None,
            invoice_hash: wrapped.invoice.hash.clone(),
            withdrawal_hash: None,
            payin_id: None,
            created_at: Utc::now(),
        };
        let invoice = Invoice {
            hash: wrapped.invoice.hash.clone(),
            bolt11: wrapped.invoice.bolt11.clone(),
            msats_requested: wrapped.msats_requested,
            msats_received: 0,
            confirmed_at: None,
            confirmed_index: None,
            is_held: false,
            is_canceled: false,
            expires_at: wrapped.expires_at,
            description: None,
            preimage: None,
            created_at: Utc::now(),
        };
        deps.store
            .transact::<_, StoreError, _>(|tx| {
                tx.put_forward(&forward)?;
                tx.put_invoice(&invoice)?;
                let id = forward.id;
                tx.index_forward_invoice(&forward.invoice_hash, &id)
            })
            .unwrap();
        forward
    }

    async fn drive_until_settled(
        deps: &crate::Deps,
        node: &Arc<MockNode>,
        forward: &InvoiceForward,
    ) {
        node.receive_htlc(&forward.invoice_hash);
        let inv = node.get_invoice(&forward.invoice_hash).await.unwrap();
        reconcile_incoming(deps, forward, &inv).await.unwrap();

        // The mock resolves the outgoing payment synchronously.
        let payment = node.get_payment(&forward.invoice_hash).await.unwrap();
        assert!(payment.is_confirmed);
        let current = deps.store.get_forward(&forward.id).unwrap().unwrap();
        reconcile_outgoing(deps, &current, &payment).await.unwrap();
    }

    #[tokio::test]
    async fn happy_path_reaches_confirmed_without_early_payout() {
        let (deps, node) = harness(vec![], &[]);
        let forward = seed_forward(&deps, &node).await;

        drive_until_settled(&deps, &node, &forward).await;

        // The inbound hold was claimed with the outgoing preimage.
        let inv = node.get_invoice(&forward.invoice_hash).await.unwrap();
        assert!(inv.is_confirmed);

        let current = deps.store.get_forward(&forward.id).unwrap().unwrap();
        assert_eq!(current.status, ForwardStatus::Settled);

        // The claim's confirmation event finishes the machine.
        reconcile_incoming(&deps, &current, &inv).await.unwrap();
        let done = deps.store.get_forward(&forward.id).unwrap().unwrap();
        assert_eq!(done.status, ForwardStatus::Confirmed);

        let withdrawal = deps
            .store
            .get_withdrawal(&forward.invoice_hash)
            .unwrap()
            .unwrap();
        assert_eq!(withdrawal.status, WithdrawalStatus::Confirmed);
        assert!(withdrawal.preimage.is_some());
        assert_eq!(withdrawal.msats_paid, 900_000);
    }

    #[tokio::test]
    async fn small_settlement_window_cancels_without_forwarding() {
        let (deps, node) = harness(vec![], &[]);
        let forward = seed_forward(&deps, &node).await;

        // Accept the HTLCs, then shrink the observed window below the
        // settlement reserve.
        node.receive_htlc(&forward.invoice_hash);
        let mut inv = node.get_invoice(&forward.invoice_hash).await.unwrap();
        inv.expiry_height = Some(inv.accept_height.unwrap() + MIN_SETTLEMENT_CLTV_DELTA - 1);

        reconcile_incoming(&deps, &forward, &inv).await.unwrap();

        let current = deps.store.get_forward(&forward.id).unwrap().unwrap();
        assert_eq!(current.status, ForwardStatus::Cancelled);
        // No outgoing payment was ever attempted.
        let payment = node.get_payment(&forward.invoice_hash).await.unwrap();
        assert!(payment.not_sent);
        // The inbound hold was released.
        let inv = node.get_invoice(&forward.invoice_hash).await.unwrap();
        assert!(inv.is_canceled);
    }

    #[tokio::test]
    async fn outgoing_failure_cascades_to_cancellation() {
        let (deps, node) = harness(vec![], &[]);
        let forward = seed_forward(&deps, &node).await;
        node.script_payment_failure(&forward.invoice_hash, PaymentFailure::RouteNotFound);

        node.receive_htlc(&forward.invoice_hash);
        let inv = node.get_invoice(&forward.invoice_hash).await.unwrap();
        reconcile_incoming(&deps, &forward, &inv).await.unwrap();

        let payment = node.get_payment(&forward.invoice_hash).await.unwrap();
        assert!(payment.is_failed);
        let current = deps.store.get_forward(&forward.id).unwrap().unwrap();
        assert_eq!(current.status, ForwardStatus::ForwardPending);

        reconcile_outgoing(&deps, &current, &payment).await.unwrap();

        let done = deps.store.get_forward(&forward.id).unwrap().unwrap();
        assert_eq!(done.status, ForwardStatus::Cancelled);
        let withdrawal = deps
            .store
            .get_withdrawal(&forward.invoice_hash)
            .unwrap()
            .unwrap();
        assert_eq!(withdrawal.status, WithdrawalStatus::RouteNotFound);
        // The inbound hold was released, nothing was claimed.
        let inv = node.get_invoice(&forward.invoice_hash).await.unwrap();
        assert!(inv.is_canceled);
        assert!(!inv.is_confirmed);
    }

    #[tokio::test]
    async fn crash_before_dispatch_reconciles_as_not_sent() {
        let (deps, node) = harness(vec![], &[]);
        let forward = seed_forward(&deps, &node).await;

        node.receive_htlc(&forward.invoice_hash);
        // Simulate "committed FORWARD_PENDING, crashed before paying":
        // transition by hand without dispatching.
        deps.store
            .advance_forward_if(&forward.id, ForwardStatus::Created, |f| {
                f.advance(ForwardStatus::Held)
            })
            .unwrap();
        deps.store
            .advance_forward_if(&forward.id, ForwardStatus::Held, |f| {
                f.withdrawal_hash = Some(f.invoice_hash.clone());
                f.advance(ForwardStatus::ForwardPending)
            })
            .unwrap();

        let payment = node.get_payment(&forward.invoice_hash).await.unwrap();
        assert!(payment.not_sent);

        let current = deps.store.get_forward(&forward.id).unwrap().unwrap();
        reconcile_outgoing(&deps, &current, &payment).await.unwrap();
        let done = deps.store.get_forward(&forward.id).unwrap().unwrap();
        assert_eq!(done.status, ForwardStatus::Cancelled);
    }

    #[tokio::test]
    async fn duplicate_confirmations_transition_once() {
        let (deps, node) = harness(vec![], &[]);
        let forward = seed_forward(&deps, &node).await;

        drive_until_settled(&deps, &node, &forward).await;

        // A second worker observes the same confirmed payment.
        let payment = node.get_payment(&forward.invoice_hash).await.unwrap();
        let current = deps.store.get_forward(&forward.id).unwrap().unwrap();
        reconcile_outgoing(&deps, &current, &payment).await.unwrap();

        let done = deps.store.get_forward(&forward.id).unwrap().unwrap();
        assert_eq!(done.status, ForwardStatus::Settled);

        // And replays the confirmed inbound invoice twice.
        let inv = node.get_invoice(&forward.invoice_hash).await.unwrap();
        reconcile_incoming(&deps, &done, &inv).await.unwrap();
        let done = deps.store.get_forward(&forward.id).unwrap().unwrap();
        reconcile_incoming(&deps, &done, &inv).await.unwrap();
        assert_eq!(
            deps.store.get_forward(&forward.id).unwrap().unwrap().status,
            ForwardStatus::Confirmed
        );
    }

    #[tokio::test]
    async fn cancel_only_from_states_without_outgoing_payment() {
        let (deps, node) = harness(vec![], &[]);
        let forward = seed_forward(&deps, &node).await;

        drive_until_settled(&deps, &node, &forward).await;
        // Settled: an inbound "canceled" observation must NOT cancel.
        let mut inv = node.get_invoice(&forward.invoice_hash).await.unwrap();
        inv.is_confirmed = false;
        inv.is_canceled = true;
        let current = deps.store.get_forward(&forward.id).unwrap().unwrap();
        reconcile_incoming(&deps, &current, &inv).await.unwrap();

        assert_eq!(
            deps.store.get_forward(&forward.id).unwrap().unwrap().status,
            ForwardStatus::Settled
        );
    }
}
