//! # PayIn Orchestrator
//!
//! The entry point for paid actions. One call to [`request_pay_in`]
//! resolves the action's capability, computes cost and payouts, debits
//! the custodial ledger as far as it reaches, persists the pay-in, and —
//! when a shortfall remains — issues the invoice that covers it.
//!
//! ## Transaction boundaries
//!
//! The money-touching half runs in a single store transaction under the
//! payer's lock: debits, the pay-in row, optimistic execution, and (when
//! fully covered) settlement. Invoice issuance talks to wallets and the
//! node, so it runs strictly *after* commit; if it fails, a durable
//! compensation job fails the pay-in and refunds the debits. A crash
//! between commit and invoice creation leaves a `PENDING_INVOICE_CREATION`
//! row that the verify job resolves the same way — there is no window
//! where money is silently lost.

use chrono::{Duration as ChronoDuration, Utc};
use serde_json::Value;
use tracing::{info, warn};
use uuid::Uuid;

use crate::action::{ActionError, PaidAction, PaymentMethod};
use crate::config::JOB_PRIORITY_PAYMENT;
use crate::forward::model::{ForwardStatus, InvoiceForward};
use crate::forward::wrap::{self, WrapRequest};
use crate::ledger::{self, UserId};
use crate::lightning::{Bolt11, InvoiceParams, InvoiceState};
use crate::payin::model::{Invoice, JsonPayload, PayIn, PayInFailureReason, PayInState};
use crate::store::jobs::{Job, JobKind};
use crate::store::StoreTx;
use crate::wallet::WalletInvoiceParams;
use crate::{Deps, EngineError};

// ---------------------------------------------------------------------------
// Request / receipt
// ---------------------------------------------------------------------------

/// A paid-action request as the API layer hands it to us.
#[derive(Debug, Clone)]
pub struct PayInRequest {
    /// Action-type tag, resolved through the registry.
    pub action: String,
    /// Action arguments, opaque to the engine.
    pub args: Value,
    /// Requesting user. `None` is an anonymous request.
    pub payer: Option<UserId>,
    /// Whether the payer hides invoice descriptions.
    pub hide_invoice_desc: bool,
}

/// What the caller gets back: a completed result, a pending invoice to
/// pay, or both (optimistic execution with an outstanding invoice).
#[derive(Debug, Clone)]
pub struct PayInReceipt {
    pub payin: PayIn,
    /// The invoice covering the uncovered remainder, when one was needed.
    pub invoice: Option<Bolt11>,
    /// The action's result, when it has already executed.
    pub result: Option<Value>,
}

/// Users whose balances a settlement of this pay-in will touch.
fn settlement_users(payin: &PayIn) -> Vec<UserId> {
    let mut users: Vec<UserId> = payin.payer.into_iter().collect();
    users.extend(
        payin
            .pay_outs
            .iter()
            .filter(|p| p.kind.is_some())
            .filter_map(|p| p.recipient),
    );
    users
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

/// Orchestrate one paid action.
pub async fn request_pay_in(
    deps: &Deps,
    request: &PayInRequest,
) -> Result<PayInReceipt, EngineError> {
    let action = deps
        .actions
        .get(&request.action)
        .ok_or_else(|| EngineError::UnknownAction(request.action.clone()))?;
    if request.payer.is_none() && !action.anonable() {
        return Err(EngineError::LoginRequired);
    }

    let cost = action.cost(&request.args, request.payer).await?;
    let pay_outs = action.pay_outs(&request.args, request.payer).await?;

    let pay_outs_total: u64 = pay_outs.iter().map(|p| p.msats).sum();
    if pay_outs_total > cost {
        return Err(EngineError::PayOutsExceedCost {
            pay_outs: pay_outs_total,
            cost,
        });
    }
    // Payouts with no token kind must leave over the network; the rest of
    // the cost can be covered custodially.
    let cost_p2p: u64 = pay_outs.iter().filter(|p| p.is_p2p()).map(|p| p.msats).sum();
    let custodial_cost = cost - cost_p2p;

    let use_credits = action.supports(PaymentMethod::FeeCredits);
    let invoiceable = action.supports(PaymentMethod::Optimistic)
        || action.supports(PaymentMethod::Pessimistic)
        || action.supports(PaymentMethod::P2P);
    let defer_execution = request.payer.is_none() || !action.supports(PaymentMethod::Optimistic);

    let payin = PayIn {
        id: Uuid::new_v4(),
        action: request.action.clone(),
        cost_msats: cost,
        state: PayInState::PendingInvoiceCreation,
        state_changed_at: Utc::now(),
        failure_reason: None,
        payer: request.payer,
        debits: Vec::new(),
        pay_outs,
        invoice_hash: None,
        forward_id: None,
        pessimistic_args: None,
        result: None,
        created_at: Utc::now(),
    };

    let lock_ids = settlement_users(&payin);
    let check_at = Utc::now()
        + ChronoDuration::from_std(deps.config.check_pay_in_delay)
            .unwrap_or_else(|_| ChronoDuration::seconds(10));

    let (payin, remaining, result) = deps.store.lock_users(&lock_ids, || {
        deps.store.transact::<_, EngineError, _>(|tx| {
            let mut payin = payin.clone();

            if let Some(payer) = request.payer {
                if custodial_cost > 0 {
                    payin.debits = ledger::debit_user(tx, payer, custodial_cost, use_credits)?;
                }
            }
            let custodial_paid = payin.custodial_paid();
            let remaining = custodial_cost - custodial_paid + cost_p2p;

            if remaining > 0 && !invoiceable {
                return Err(EngineError::InsufficientFunds);
            }

            let mut result = None;
            if remaining > 0 && defer_execution {
                // Pessimistic: keep the args, perform once payment is sure.
                payin.pessimistic_args = Some(JsonPayload::new(&request.args));
            } else {
                let r = action.perform(tx, &payin, &request.args)?;
                payin.result = Some(JsonPayload::new(&r));
                result = Some(r);
            }

            if remaining == 0 {
                settle_in_tx(tx, action.as_ref(), &mut payin)?;
                payin.advance(PayInState::Paid);
            } else {
                // The verify job is committed with the row: if invoice
                // creation dies after this transaction, the job notices.
                tx.enqueue_job(&Job::new(
                    JobKind::CheckPayIn { payin_id: payin.id },
                    check_at,
                    JOB_PRIORITY_PAYMENT,
                ))?;
            }

            tx.put_payin(&payin)?;
            Ok((payin, remaining, result))
        })
    })?;

    info!(
        payin = %payin.id,
        action = %payin.action,
        cost,
        remaining,
        state = %payin.state,
        "pay-in created"
    );

    if remaining == 0 {
        spawn_side_effects(&action, &payin);
        return Ok(PayInReceipt {
            payin,
            invoice: None,
            result,
        });
    }

    match add_invoice(deps, action.as_ref(), &payin, remaining, request).await {
        Ok((payin, bolt11)) => Ok(PayInReceipt {
            payin,
            invoice: Some(bolt11),
            result,
        }),
        Err(e) => {
            warn!(payin = %payin.id, error = %e, "invoice creation failed, scheduling compensation");
            let reason = failure_reason_for(&e);
            deps.store.enqueue_job(&Job::new(
                JobKind::FailPayIn {
                    payin_id: payin.id,
                    reason,
                },
                Utc::now(),
                JOB_PRIORITY_PAYMENT,
            ))?;
            Err(e)
        }
    }
}

fn failure_reason_for(e: &EngineError) -> PayInFailureReason {
    match e {
        EngineError::Wrap(w) if w.is_predictive() => match w {
            crate::forward::wrap::WrapError::FeeEstimateTooHigh { .. } => {
                PayInFailureReason::WrapFailedHighFee
            }
            _ => PayInFailureReason::WrapFailedHighExpiry,
        },
        _ => PayInFailureReason::InvoiceCreationFailed,
    }
}

// ---------------------------------------------------------------------------
// Invoice issuance (post-commit)
// ---------------------------------------------------------------------------

async fn add_invoice(
    deps: &Deps,
    action: &dyn PaidAction,
    payin: &PayIn,
    remaining: u64,
    request: &PayInRequest,
) -> Result<(PayIn, Bolt11), EngineError> {
    let description = if request.hide_invoice_desc {
        None
    } else {
        action.describe(payin).await
    };

    let p2p = payin.pay_outs.iter().find(|p| p.is_p2p() && p.msats > 0);
    if let Some(p2p) = p2p {
        let recipient = p2p.recipient.ok_or_else(|| {
            EngineError::Action(ActionError::InvalidArgs(
                "peer-to-peer payout requires a recipient".to_string(),
            ))
        })?;

        // The recipient's invoice requests the remainder less our relay
        // fee; the wrap validates the fee floor against what we commit.
        let fee_percent = deps.config.p2p_fee_percent;
        let inner_msats = remaining * (100 - fee_percent) / 100;
        let inner_bolt11 = deps
            .wallets
            .create_invoice_for(
                recipient,
                &WalletInvoiceParams {
                    msats: inner_msats,
                    description: description.clone(),
                    expiry_secs: deps.config.invoice_expiry_secs as u64,
                },
                deps.config.wallet_invoice_timeout,
            )
            .await?;

        let wrapped = wrap::wrap_invoice(
            deps.node.as_ref(),
            &WrapRequest {
                incoming_msats: remaining,
                bolt11: inner_bolt11.clone(),
                fee_percent,
                description,
                hide_description: request.hide_invoice_desc,
            },
        )
        .await?;

        let forward = InvoiceForward {
            id: Uuid::new_v4(),
            status: ForwardStatus::Created,
            status_changed_at: Utc::now(),
            bolt11: inner_bolt11,
            max_fee_msats: wrapped.max_fee_msats,
            accept_height: None,
            expiry_height: None,
            invoice_hash: wrapped.invoice.hash.clone(),
            withdrawal_hash: None,
            payin_id: Some(payin.id),
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

        let bolt11 = invoice.bolt11.clone();
        let payin = attach_invoice(
            deps,
            &payin.id,
            invoice,
            Some(forward),
            PayInState::PendingHeld,
        )?;
        return Ok((payin, bolt11));
    }

    // Direct invoice: a hold invoice when execution is deferred, a plain
    // invoice when the action already ran optimistically.
    let hold = payin.pessimistic_args.is_some();
    let params = InvoiceParams {
        msats: remaining,
        description: description.clone(),
        expires_at: Some(Utc::now() + ChronoDuration::seconds(deps.config.invoice_expiry_secs)),
        ..InvoiceParams::default()
    };
    let created = if hold {
        deps.node.create_hold_invoice(&params).await?
    } else {
        deps.node.create_invoice(&params).await?
    };

    let invoice = Invoice {
        hash: created.hash.clone(),
        bolt11: created.bolt11.clone(),
        msats_requested: remaining,
        msats_received: 0,
        confirmed_at: None,
        confirmed_index: None,
        is_held: false,
        is_canceled: false,
        expires_at: params.expires_at.unwrap_or_else(Utc::now),
        description,
        preimage: created.preimage.clone(),
        created_at: Utc::now(),
    };

    let state = if hold {
        PayInState::PendingHeld
    } else {
        PayInState::Pending
    };
    let bolt11 = created.bolt11.clone();
    let payin = attach_invoice(deps, &payin.id, invoice, None, state)?;
    Ok((payin, bolt11))
}

/// Attach an issued invoice to its pay-in, guarded on the pay-in still
/// awaiting one. If compensation already failed the pay-in, the attach
/// loses and the orphaned invoice simply expires on the node.
fn attach_invoice(
    deps: &Deps,
    payin_id: &Uuid,
    invoice: Invoice,
    forward: Option<InvoiceForward>,
    state: PayInState,
) -> Result<PayIn, EngineError> {
    deps.store.transact::<_, EngineError, _>(|tx| {
        let mut payin = tx.get_payin(payin_id)?.ok_or(EngineError::StalePayIn)?;
        if payin.state != PayInState::PendingInvoiceCreation {
            return Err(EngineError::StalePayIn);
        }

        payin.invoice_hash = Some(invoice.hash.clone());
        tx.put_invoice(&invoice)?;
        tx.index_payin_invoice(&invoice.hash, payin_id)?;

        if let Some(forward) = &forward {
            payin.forward_id = Some(forward.id);
            tx.put_forward(forward)?;
            tx.index_forward_invoice(&forward.invoice_hash, &forward.id)?;
        }

        payin.advance(state);
        tx.put_payin(&payin)?;
        Ok(payin)
    })
}

// ---------------------------------------------------------------------------
// Settlement & compensation
// ---------------------------------------------------------------------------

/// Credit every custodial payout and run the action's settlement hook.
/// Runs inside the caller's transaction; the caller holds the user locks
/// and sets the terminal state.
pub(crate) fn settle_in_tx(
    tx: &mut StoreTx<'_>,
    action: &dyn PaidAction,
    payin: &mut PayIn,
) -> Result<(), EngineError> {
    for pay_out in payin.pay_outs.iter_mut() {
        if let (Some(user), Some(kind)) = (pay_out.recipient, pay_out.kind) {
            let before = ledger::credit_user(tx, user, kind, pay_out.msats)?;
            pay_out.msats_before = Some(before);
        }
    }
    action.on_paid(tx, payin)?;
    Ok(())
}

/// Fire the action's best-effort side effects on a fresh task. Failures
/// are logged and dropped; settlement has already committed.
pub(crate) fn spawn_side_effects(action: &std::sync::Arc<dyn PaidAction>, payin: &PayIn) {
    let action = std::sync::Arc::clone(action);
    let payin = payin.clone();
    tokio::spawn(async move {
        if let Err(e) = action.non_critical_side_effects(&payin).await {
            warn!(payin = %payin.id, error = %e, "non-critical side effects failed");
        }
    });
}

/// Drive a pending pay-in to `PAID`: perform deferred execution, credit
/// payouts, run the settlement hook, finalize the invoice record — one
/// transaction, exactly one winner. Returns the settled pay-in, or `None`
/// if another worker already handled it.
pub async fn pay_in_paid(
    deps: &Deps,
    payin_id: &Uuid,
    inv: Option<&InvoiceState>,
) -> Result<Option<PayIn>, EngineError> {
    let Some(current) = deps.store.get_payin(payin_id)? else {
        return Ok(None);
    };
    if current.is_terminal() {
        return Ok(None);
    }
    let action = deps
        .actions
        .get(&current.action)
        .ok_or_else(|| EngineError::UnknownAction(current.action.clone()))?;

    let lock_ids = settlement_users(&current);
    let settled = deps.store.lock_users(&lock_ids, || {
        deps.store.transact::<_, EngineError, _>(|tx| {
            let Some(mut payin) = tx.get_payin(payin_id)? else {
                return Ok(None);
            };
            if !matches!(payin.state, PayInState::Pending | PayInState::PendingHeld) {
                return Ok(None);
            }

            if payin.result.is_none() {
                if let Some(args) = payin.pessimistic_args.clone() {
                    let result = action.perform(tx, &payin, &args.value())?;
                    payin.result = Some(JsonPayload::new(&result));
                }
            }

            settle_in_tx(tx, action.as_ref(), &mut payin)?;
            payin.advance(PayInState::Paid);

            if let (Some(hash), Some(inv)) = (payin.invoice_hash.clone(), inv) {
                if let Some(mut record) = tx.get_invoice(&hash)? {
                    record.msats_received = inv.msats_received;
                    record.confirmed_at = inv.confirmed_at;
                    record.confirmed_index = inv.confirmed_index;
                    record.is_held = false;
                    tx.put_invoice(&record)?;
                }
            }

            tx.put_payin(&payin)?;
            Ok(Some(payin))
        })
    })?;

    if let Some(payin) = &settled {
        info!(payin = %payin.id, action = %payin.action, "pay-in paid");
        if let Some(index) = inv.and_then(|i| i.confirmed_index) {
            deps.store.note_confirmed_index(index)?;
        }
        spawn_side_effects(&action, payin);
    }
    Ok(settled)
}

/// Drive a pay-in to `FAILED`: refund every debit, run the compensation
/// hook, record the reason — one transaction, exactly one winner.
pub async fn pay_in_failed(
    deps: &Deps,
    payin_id: &Uuid,
    reason: PayInFailureReason,
) -> Result<Option<PayIn>, EngineError> {
    let Some(current) = deps.store.get_payin(payin_id)? else {
        return Ok(None);
    };
    if current.is_terminal() {
        return Ok(None);
    }
    let action = deps
        .actions
        .get(&current.action)
        .ok_or_else(|| EngineError::UnknownAction(current.action.clone()))?;

    let lock_ids: Vec<UserId> = current.payer.into_iter().collect();
    let failed = deps.store.lock_users(&lock_ids, || {
        deps.store.transact::<_, EngineError, _>(|tx| {
            let Some(mut payin) = tx.get_payin(payin_id)? else {
                return Ok(None);
            };
            if payin.is_terminal() {
                return Ok(None);
            }

            if let Some(payer) = payin.payer {
                ledger::refund_debits(tx, payer, &payin.debits)?;
            }
            action.on_fail(tx, &payin)?;
            payin.failure_reason = Some(reason);
            payin.advance(PayInState::Failed);

            if let Some(hash) = payin.invoice_hash.clone() {
                if let Some(mut record) = tx.get_invoice(&hash)? {
                    record.is_canceled = true;
                    record.is_held = false;
                    tx.put_invoice(&record)?;
                }
            }

            tx.put_payin(&payin)?;
            Ok(Some(payin))
        })
    })?;

    if let Some(payin) = &failed {
        info!(payin = %payin.id, action = %payin.action, ?reason, "pay-in failed");
        // Release a direct hold invoice if one is outstanding. Forwards
        // release their own inbound leg through the relay machine.
        if payin.forward_id.is_none() {
            if let Some(hash) = &payin.invoice_hash {
                if let Err(e) = deps.node.cancel_hold_invoice(hash).await {
                    tracing::debug!(hash = %hash, error = %e, "hold-invoice cancel skipped");
                }
            }
        }
    }
    Ok(failed)
}

/// Execute a pessimistic pay-in whose direct hold invoice just went held:
/// perform the action with the committed funds, then settle the hold with
/// the preimage we generated at issuance. Exactly one worker performs;
/// every worker may settle, the node makes that idempotent.
pub async fn perform_held(
    deps: &Deps,
    payin_id: &Uuid,
    inv: &InvoiceState,
) -> Result<(), EngineError> {
    let Some(current) = deps.store.get_payin(payin_id)? else {
        return Ok(());
    };
    if current.state != PayInState::PendingHeld || current.forward_id.is_some() {
        return Ok(());
    }
    let action = deps
        .actions
        .get(&current.action)
        .ok_or_else(|| EngineError::UnknownAction(current.action.clone()))?;

    deps.store.transact::<_, EngineError, _>(|tx| {
        let Some(mut payin) = tx.get_payin(payin_id)? else {
            return Ok(());
        };
        if payin.state != PayInState::PendingHeld || payin.result.is_some() {
            return Ok(());
        }
        let Some(args) = payin.pessimistic_args.clone() else {
            return Ok(());
        };
        let result = action.perform(tx, &payin, &args.value())?;
        payin.result = Some(JsonPayload::new(&result));

        if let Some(hash) = payin.invoice_hash.clone() {
            if let Some(mut record) = tx.get_invoice(&hash)? {
                record.is_held = true;
                record.msats_received = inv.msats_received;
                tx.put_invoice(&record)?;
            }
        }
        tx.put_payin(&payin)?;
        Ok(())
    })?;

    // Claim the committed funds. Safe after a crash between perform and
    // settle: re-running lands here again and the node deduplicates.
    if let Some(hash) = &current.invoice_hash {
        if let Some(record) = deps.store.get_invoice(hash)? {
            if let Some(preimage) = &record.preimage {
                deps.node.settle_hold_invoice(preimage).await?;
            }
        }
    }
    Ok(())
}
