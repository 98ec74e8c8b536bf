//! # Custodial Ledger
//!
//! Every user carries two non-negative balances: spendable credits and
//! real currency units, both tracked in millisatoshis. This module owns
//! the rules for moving them.
//!
//! Debits drain credits first, then currency, and never take more than is
//! available — a partial debit is normal, the orchestrator computes the
//! shortfall and covers it with an invoice. When a balance cannot cover
//! the rest of a request in full, the partial take is floored to a
//! whole-unit multiple so a drained balance never strands sub-unit dust.
//!
//! All mutations run inside the caller's store transaction and record the
//! balance before the change, so a refund can restore exactly what was
//! taken and an auditor can replay the books.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::MSATS_PER_UNIT;
use crate::store::{StoreError, StoreTx};

/// Internal user identifier.
pub type UserId = u64;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// The two custodial token kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TokenKind {
    /// Spendable credits. Earned or granted, spent before real currency.
    Credits,
    /// Real currency units.
    Sats,
}

/// A user's custodial balances, in millisatoshis.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserBalance {
    pub msats: u64,
    pub mcredits: u64,
}

impl UserBalance {
    pub fn of(&self, kind: TokenKind) -> u64 {
        match kind {
            TokenKind::Credits => self.mcredits,
            TokenKind::Sats => self.msats,
        }
    }

    fn set(&mut self, kind: TokenKind, value: u64) {
        match kind {
            TokenKind::Credits => self.mcredits = value,
            TokenKind::Sats => self.msats = value,
        }
    }
}

/// One balance deduction, with the audit value needed to undo it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustodialDebit {
    pub kind: TokenKind,
    /// Millisatoshis actually taken.
    pub msats: u64,
    /// The balance of `kind` immediately before the debit.
    pub msats_before: u64,
}

/// Errors from ledger mutations. These abort the enclosing transaction.
#[derive(Debug, Error)]
pub enum LedgerError {
    /// A credit would overflow the balance counter. Either a bug or an
    /// attack; both deserve an abort.
    #[error("balance overflow for user {user}: {current} + {credit}")]
    Overflow {
        user: UserId,
        current: u64,
        credit: u64,
    },

    #[error(transparent)]
    Store(#[from] StoreError),
}

// ---------------------------------------------------------------------------
// Debit planning
// ---------------------------------------------------------------------------

/// How much to take from one balance toward a requested amount: the full
/// remainder when covered, otherwise the largest whole-unit multiple.
fn takeable(available: u64, wanted: u64) -> u64 {
    if available >= wanted {
        wanted
    } else {
        (available / MSATS_PER_UNIT) * MSATS_PER_UNIT
    }
}

/// Compute the debits that cover as much of `requested` as the balance
/// allows, credits first. Pure — the transaction applies the result.
pub fn plan_debit(
    balance: &UserBalance,
    requested: u64,
    use_credits: bool,
) -> Vec<CustodialDebit> {
    let mut remaining = requested;
    let mut debits = Vec::new();

    if use_credits && remaining > 0 {
        let take = takeable(balance.mcredits, remaining);
        if take > 0 {
            debits.push(CustodialDebit {
                kind: TokenKind::Credits,
                msats: take,
                msats_before: balance.mcredits,
            });
            remaining -= take;
        }
    }

    if remaining > 0 {
        let take = takeable(balance.msats, remaining);
        if take > 0 {
            debits.push(CustodialDebit {
                kind: TokenKind::Sats,
                msats: take,
                msats_before: balance.msats,
            });
        }
    }

    debits
}

// ---------------------------------------------------------------------------
// Transactional mutations
// ---------------------------------------------------------------------------

/// Debit up to `requested` from a user's balances inside the caller's
/// transaction. Returns the audit records; their sum never exceeds
/// `requested`. The caller must hold the user's lock.
pub fn debit_user(
    tx: &mut StoreTx<'_>,
    user: UserId,
    requested: u64,
    use_credits: bool,
) -> Result<Vec<CustodialDebit>, LedgerError> {
    if requested == 0 {
        return Ok(Vec::new());
    }
    let mut balance = tx.get_balance(user)?;
    let debits = plan_debit(&balance, requested, use_credits);
    for debit in &debits {
        balance.set(debit.kind, debit.msats_before - debit.msats);
    }
    tx.put_balance(user, &balance)?;
    Ok(debits)
}

/// Credit a user's balance of `kind` inside the caller's transaction.
/// Returns the balance before the credit, for the payout audit record.
/// The caller must hold the user's lock.
pub fn credit_user(
    tx: &mut StoreTx<'_>,
    user: UserId,
    kind: TokenKind,
    msats: u64,
) -> Result<u64, LedgerError> {
    let mut balance = tx.get_balance(user)?;
    let before = balance.of(kind);
    let after = before.checked_add(msats).ok_or(LedgerError::Overflow {
        user,
        current: before,
        credit: msats,
    })?;
    balance.set(kind, after);
    tx.put_balance(user, &balance)?;
    Ok(before)
}

/// Restore previously taken debits. Part of the one-time compensation
/// path; the guard on the pay-in transition ensures it runs exactly once.
pub fn refund_debits(
    tx: &mut StoreTx<'_>,
    user: UserId,
    debits: &[CustodialDebit],
) -> Result<(), LedgerError> {
    for debit in debits {
        credit_user(tx, user, debit.kind, debit.msats)?;
    }
    Ok(())
}
