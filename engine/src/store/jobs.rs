//! # Durable Deferred Jobs
//!
//! Work that must survive a crash — compensations, deferred verifications,
//! settle retries — is written to the store as a named job with a payload
//! of ids, a scheduled time, and a priority. The reconciliation worker
//! polls for due jobs and dispatches them.
//!
//! Every handler is idempotent: a job observed twice, or a job whose work
//! was already done by an event, falls through to a guarded transition
//! that no-ops. The queue only schedules; it never guards correctness.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::lightning::PaymentHash;
use crate::payin::model::PayInFailureReason;

/// The work a deferred job carries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobKind {
    /// Verify that a pending pay-in acquired its invoice, and fail it if
    /// invoice creation crashed after the row was committed.
    CheckPayIn { payin_id: Uuid },
    /// Compensate a pay-in: transition to FAILED and refund its debits.
    FailPayIn {
        payin_id: Uuid,
        reason: PayInFailureReason,
    },
    /// Re-check an inbound invoice against network truth.
    CheckInvoice { hash: PaymentHash },
    /// Re-check an outbound payment against network truth.
    CheckWithdrawal { hash: PaymentHash },
}

impl JobKind {
    /// Stable name, for logs.
    pub fn name(&self) -> &'static str {
        match self {
            JobKind::CheckPayIn { .. } => "check-payin",
            JobKind::FailPayIn { .. } => "fail-payin",
            JobKind::CheckInvoice { .. } => "check-invoice",
            JobKind::CheckWithdrawal { .. } => "check-withdrawal",
        }
    }
}

/// A scheduled, durable, idempotent unit of work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub kind: JobKind,
    pub run_at: DateTime<Utc>,
    /// Higher runs first among jobs due at the same time.
    pub priority: u8,
}

impl Job {
    pub fn new(kind: JobKind, run_at: DateTime<Utc>, priority: u8) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            run_at,
            priority,
        }
    }

    /// Store key: `job/` + run-at millis (BE) + inverted priority + id.
    /// Lexicographic order over these keys is exactly dispatch order —
    /// earliest first, then highest priority, then insertion id.
    pub(super) fn key(&self) -> Vec<u8> {
        let mut k = Vec::with_capacity(4 + 8 + 1 + 16);
        k.extend_from_slice(b"job/");
        let millis = self.run_at.timestamp_millis().max(0) as u64;
        k.extend_from_slice(&millis.to_be_bytes());
        k.push(u8::MAX - self.priority);
        k.extend_from_slice(self.id.as_bytes());
        k
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    #[test]
    fn key_orders_by_time_then_priority() {
        let now = Utc::now();
        let early = Job::new(
            JobKind::CheckInvoice {
                hash: "ab".repeat(32),
            },
            now,
            0,
        );
        let later = Job::new(
            JobKind::CheckInvoice {
                hash: "ab".repeat(32),
            },
            now + ChronoDuration::seconds(1),
            255,
        );
        assert!(early.key() < later.key());

        let urgent = Job::new(
            JobKind::CheckWithdrawal {
                hash: "cd".repeat(32),
            },
            now,
            100,
        );
        assert!(urgent.key() < early.key());
    }

    #[test]
    fn kind_names_are_stable() {
        let job = JobKind::FailPayIn {
            payin_id: Uuid::new_v4(),
            reason: PayInFailureReason::InvoiceCreationFailed,
        };
        assert_eq!(job.name(), "fail-payin");
    }
}
