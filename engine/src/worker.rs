//! # Event Reconciliation Worker
//!
//! The background half of the engine. Four supervised loops run until
//! shutdown:
//!
//! 1. **Invoice subscription** — long-lived stream of inbound-invoice
//!    lifecycle events, resumed from the last durable settle-index
//!    checkpoint so confirmations that happened while we were down are
//!    replayed, not lost.
//! 2. **Payment subscription** — outgoing-payment resolutions.
//! 3. **Job poller** — drains the durable job queue: compensations,
//!    deferred verifications, settle retries.
//! 4. **Sweep** — periodically re-checks every non-terminal pay-in and
//!    forward against network truth. This is the redundancy mechanism:
//!    anything the event paths missed, the sweep eventually catches.
//!
//! Subscriptions fail; that's their nature. Each one is supervised the
//! same way: subscribe, consume until the stream ends or errors, back
//! off (bounded, jittered), resubscribe, forever. Event handler errors
//! are logged and dropped — a poisoned event must not kill the stream
//! that delivers the healthy ones.

use std::time::Duration;

use chrono::{Duration as ChronoDuration, Utc};
use rand::Rng;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::config::{SUBSCRIBE_BACKOFF_MAX, SUBSCRIBE_BACKOFF_MIN, SWEEP_ITEM_DELAY};
use crate::payin::reconcile;
use crate::store::jobs::Job;
use crate::Deps;

/// Drives pending pay-ins and forwards to their terminal states from
/// network events, durable jobs, and periodic sweeps.
pub struct ReconcileWorker {
    deps: Deps,
}

impl ReconcileWorker {
    pub fn new(deps: Deps) -> Self {
        Self { deps }
    }

    /// Run all four loops until the shutdown signal fires. Returns only
    /// after every loop has exited.
    pub async fn run(self, shutdown: watch::Receiver<bool>) {
        info!("reconcile worker starting");
        tokio::join!(
            self.subscribe_invoices_forever(shutdown.clone()),
            self.subscribe_payments_forever(shutdown.clone()),
            self.poll_jobs(shutdown.clone()),
            self.sweep(shutdown),
        );
        info!("reconcile worker stopped");
    }

    // -- Subscriptions ------------------------------------------------------

    async fn subscribe_invoices_forever(&self, mut shutdown: watch::Receiver<bool>) {
        let mut backoff = SUBSCRIBE_BACKOFF_MIN;
        loop {
            if *shutdown.borrow() {
                return;
            }

            let checkpoint = match self.deps.store.confirmed_index() {
                Ok(checkpoint) => checkpoint,
                Err(e) => {
                    warn!(error = %e, "could not load subscription checkpoint");
                    None
                }
            };

            match self.deps.node.subscribe_invoices(checkpoint).await {
                Ok(mut events) => {
                    info!(?checkpoint, "subscribed to invoices");
                    backoff = SUBSCRIBE_BACKOFF_MIN;
                    loop {
                        tokio::select! {
                            event = events.recv() => match event {
                                Some(inv) => {
                                    debug!(hash = %inv.hash, "invoice event");
                                    let hash = inv.hash.clone();
                                    if let Err(e) = reconcile::check_payin_invoice(
                                        &self.deps,
                                        &hash,
                                        Some(inv),
                                    )
                                    .await
                                    {
                                        warn!(hash = %hash, error = %e, "invoice event handling failed");
                                    }
                                }
                                None => {
                                    warn!("invoice subscription ended");
                                    break;
                                }
                            },
                            _ = shutdown.changed() => return,
                        }
                    }
                }
                Err(e) => warn!(error = %e, "invoice subscription failed"),
            }

            if !sleep_with_shutdown(jittered(backoff), &mut shutdown).await {
                return;
            }
            backoff = (backoff * 2).min(SUBSCRIBE_BACKOFF_MAX);
        }
    }

    async fn subscribe_payments_forever(&self, mut shutdown: watch::Receiver<bool>) {
        let mut backoff = SUBSCRIBE_BACKOFF_MIN;
        loop {
            if *shutdown.borrow() {
                return;
            }

            match self.deps.node.subscribe_payments().await {
                Ok(mut events) => {
                    info!("subscribed to payments");
                    backoff = SUBSCRIBE_BACKOFF_MIN;
                    loop {
                        tokio::select! {
                            event = events.recv() => match event {
                                Some(payment) => {
                                    debug!(hash = %payment.hash, "payment event");
                                    let hash = payment.hash.clone();
                                    if let Err(e) = reconcile::check_payout_payment(
                                        &self.deps,
                                        &hash,
                                        Some(payment),
                                    )
                                    .await
                                    {
                                        warn!(hash = %hash, error = %e, "payment event handling failed");
                                    }
                                }
                                None => {
                                    warn!("payment subscription ended");
                                    break;
                                }
                            },
                            _ = shutdown.changed() => return,
                        }
                    }
                }
                Err(e) => warn!(error = %e, "payment subscription failed"),
            }

            if !sleep_with_shutdown(jittered(backoff), &mut shutdown).await {
                return;
            }
            backoff = (backoff * 2).min(SUBSCRIBE_BACKOFF_MAX);
        }
    }

    // -- Durable jobs -------------------------------------------------------

    async fn poll_jobs(&self, mut shutdown: watch::Receiver<bool>) {
        loop {
            if *shutdown.borrow() {
                return;
            }

            let due = match self.deps.store.due_jobs(Utc::now(), 32) {
                Ok(due) => due,
                Err(e) => {
                    warn!(error = %e, "job poll failed");
                    Vec::new()
                }
            };

            for job in due {
                // Claim before running; losers of the claim skip. The
                // handlers are idempotent either way.
                match self.deps.store.take_job(&job) {
                    Ok(true) => {}
                    Ok(false) => continue,
                    Err(e) => {
                        warn!(job = job.kind.name(), error = %e, "job claim failed");
                        continue;
                    }
                }
                debug!(job = job.kind.name(), "running job");
                if let Err(e) = reconcile::run_job(&self.deps, &job.kind).await {
                    warn!(job = job.kind.name(), error = %e, "job failed, rescheduling");
                    let retry = Job::new(
                        job.kind.clone(),
                        Utc::now() + retry_delay(&self.deps),
                        job.priority,
                    );
                    if let Err(e) = self.deps.store.enqueue_job(&retry) {
                        warn!(error = %e, "could not reschedule failed job");
                    }
                }
            }

            if !sleep_with_shutdown(self.deps.config.job_poll_interval, &mut shutdown).await {
                return;
            }
        }
    }

    // -- Sweep --------------------------------------------------------------

    async fn sweep(&self, mut shutdown: watch::Receiver<bool>) {
        loop {
            if *shutdown.borrow() {
                return;
            }
            if let Err(e) = self.sweep_once(&mut shutdown).await {
                warn!(error = %e, "sweep pass failed");
            }
            if !sleep_with_shutdown(self.deps.config.sweep_interval, &mut shutdown).await {
                return;
            }
        }
    }

    /// One full pass over everything non-terminal. Every item is checked
    /// in isolation: one bad record must not starve the rest.
    async fn sweep_once(
        &self,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<(), crate::store::StoreError> {
        for payin in self.deps.store.non_terminal_payins()? {
            if *shutdown.borrow() {
                return Ok(());
            }
            if let Some(hash) = &payin.invoice_hash {
                if let Err(e) = reconcile::check_payin_invoice(&self.deps, hash, None).await {
                    warn!(payin = %payin.id, error = %e, "sweep: invoice check failed");
                }
                tokio::time::sleep(SWEEP_ITEM_DELAY).await;
            }
        }

        for forward in self.deps.store.non_terminal_forwards()? {
            if *shutdown.borrow() {
                return Ok(());
            }
            if let Err(e) =
                reconcile::check_payin_invoice(&self.deps, &forward.invoice_hash, None).await
            {
                warn!(forward = %forward.id, error = %e, "sweep: inbound check failed");
            }
            if let Some(hash) = &forward.withdrawal_hash {
                if let Err(e) = reconcile::check_payout_payment(&self.deps, hash, None).await {
                    warn!(forward = %forward.id, error = %e, "sweep: outbound check failed");
                }
            }
            tokio::time::sleep(SWEEP_ITEM_DELAY).await;
        }
        Ok(())
    }
}

fn retry_delay(deps: &Deps) -> ChronoDuration {
    ChronoDuration::from_std(deps.config.reconcile_retry_delay)
        .unwrap_or_else(|_| ChronoDuration::seconds(60))
}

fn jittered(backoff: Duration) -> Duration {
    backoff + Duration::from_millis(rand::thread_rng().gen_range(0..100))
}

/// Sleep, waking early on shutdown. Returns `false` when shutting down.
async fn sleep_with_shutdown(duration: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(duration) => true,
        _ = shutdown.changed() => false,
    }
}
