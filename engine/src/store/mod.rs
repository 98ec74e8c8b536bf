//! # Store — Durable State & Conditional Writes
//!
//! The persistence layer for the engine, built on sled's embedded
//! key-value store. All durable state flows through this module.
//!
//! ## Key Layout
//!
//! Everything lives in one tree under prefixed keys, so multi-record
//! commits are a single atomic transaction:
//!
//! | Prefix          | Key suffix                   | Value                      |
//! |-----------------|------------------------------|----------------------------|
//! | `payin/`        | pay-in id (16B)              | `bincode(PayIn)`           |
//! | `fwd/`          | forward id (16B)             | `bincode(InvoiceForward)`  |
//! | `inv/`          | payment hash (UTF-8)         | `bincode(Invoice)`         |
//! | `wd/`           | payment hash (UTF-8)         | `bincode(Withdrawal)`      |
//! | `bal/`          | user id (8B BE)              | `bincode(UserBalance)`     |
//! | `job/`          | run-at ms BE + prio + id     | `bincode(Job)`             |
//! | `idx/pi/`       | invoice hash                 | pay-in id (16B)            |
//! | `idx/fi/`       | invoice hash                 | forward id (16B)           |
//! | `idx/fw/`       | withdrawal hash              | forward id (16B)           |
//! | `meta/`         | name (UTF-8)                 | bytes                      |
//!
//! ## Concurrency
//!
//! Two primitives cover every mutation in the engine:
//!
//! - **Guarded single-record transitions** ([`Store::advance_payin_if`],
//!   [`Store::advance_forward_if`]) are compare-and-swap loops. When the
//!   guard fails because another worker already advanced the record, the
//!   result is `Ok(None)` — "already handled", a normal branch, never an
//!   error.
//! - **Multi-record commits** ([`Store::transact`]) run a closure against
//!   a serializable sled transaction. Either every write lands or none
//!   does; conflicting transactions retry. Balance-touching transactions
//!   additionally serialize per user through [`Store::lock_users`], which
//!   acquires locks in ascending user-id order so multi-user settlements
//!   cannot deadlock.
//!
//! Transactions are synchronous and short. Slow network calls happen
//! strictly outside of them.

pub mod jobs;

use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use sled::transaction::{
    ConflictableTransactionError, TransactionError, TransactionalTree,
    UnabortableTransactionError,
};
use sled::{IVec, Tree};
use uuid::Uuid;

use crate::forward::model::{ForwardStatus, InvoiceForward, Withdrawal};
use crate::ledger::{UserBalance, UserId};
use crate::payin::model::{Invoice, PayIn, PayInState};
use self::jobs::Job;

// ---------------------------------------------------------------------------
// Error Type
// ---------------------------------------------------------------------------

/// Errors that can occur during store operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("sled error: {0}")]
    Backend(#[from] sled::Error),

    #[error("codec error: {0}")]
    Codec(String),

    /// Internal marker: the enclosing transaction hit a conflict and will
    /// be retried. Never escapes [`Store::transact`].
    #[error("transaction conflict")]
    Conflict,
}

pub type StoreResult<T> = Result<T, StoreError>;

fn decode<T: DeserializeOwned>(bytes: &IVec) -> StoreResult<T> {
    bincode::deserialize(bytes).map_err(|e| StoreError::Codec(e.to_string()))
}

fn encode<T: Serialize>(value: &T) -> StoreResult<IVec> {
    bincode::serialize(value)
        .map(IVec::from)
        .map_err(|e| StoreError::Codec(e.to_string()))
}

// ---------------------------------------------------------------------------
// Keys
// ---------------------------------------------------------------------------

const P_PAYIN: &[u8] = b"payin/";
const P_FORWARD: &[u8] = b"fwd/";
const P_INVOICE: &[u8] = b"inv/";
const P_WITHDRAWAL: &[u8] = b"wd/";
const P_BALANCE: &[u8] = b"bal/";
const P_JOB: &[u8] = b"job/";
const P_IDX_PAYIN_INVOICE: &[u8] = b"idx/pi/";
const P_IDX_FORWARD_INVOICE: &[u8] = b"idx/fi/";
const P_IDX_FORWARD_WITHDRAWAL: &[u8] = b"idx/fw/";
const META_CONFIRMED_INDEX: &[u8] = b"meta/confirmed_index";

fn key(prefix: &[u8], suffix: &[u8]) -> Vec<u8> {
    let mut k = Vec::with_capacity(prefix.len() + suffix.len());
    k.extend_from_slice(prefix);
    k.extend_from_slice(suffix);
    k
}

fn payin_key(id: &Uuid) -> Vec<u8> {
    key(P_PAYIN, id.as_bytes())
}

fn forward_key(id: &Uuid) -> Vec<u8> {
    key(P_FORWARD, id.as_bytes())
}

fn balance_key(user: UserId) -> Vec<u8> {
    key(P_BALANCE, &user.to_be_bytes())
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

/// Durable engine state. Clone-free sharing via `Arc<Store>`.
pub struct Store {
    #[allow(dead_code)]
    db: sled::Db,
    tree: Tree,
    /// Per-user exclusive locks serializing balance mutations.
    user_locks: DashMap<UserId, Arc<Mutex<()>>>,
}

impl Store {
    /// Open or create a store at the given filesystem path.
    pub fn open<P: AsRef<Path>>(path: P) -> StoreResult<Self> {
        let db = sled::open(path)?;
        Self::from_db(db)
    }

    /// Create a temporary store cleaned up on drop. Ideal for tests.
    pub fn open_temporary() -> StoreResult<Self> {
        let db = sled::Config::new().temporary(true).open()?;
        Self::from_db(db)
    }

    fn from_db(db: sled::Db) -> StoreResult<Self> {
        let tree = db.open_tree("sluice")?;
        Ok(Self {
            db,
            tree,
            user_locks: DashMap::new(),
        })
    }

    // -- Locks --------------------------------------------------------------

    /// Run `f` while holding the exclusive locks of every listed user,
    /// acquired in ascending id order. The closure is synchronous on
    /// purpose: nothing slow belongs under a user lock.
    pub fn lock_users<R>(&self, users: &[UserId], f: impl FnOnce() -> R) -> R {
        let mut ids: Vec<UserId> = users.to_vec();
        ids.sort_unstable();
        ids.dedup();
        let locks: Vec<Arc<Mutex<()>>> = ids
            .iter()
            .map(|u| self.user_locks.entry(*u).or_default().clone())
            .collect();
        let guards: Vec<_> = locks.iter().map(|l| l.lock()).collect();
        let out = f();
        drop(guards);
        out
    }

    // -- Transactions -------------------------------------------------------

    /// Run a closure against a serializable transaction. All writes commit
    /// atomically; a returned error aborts with no effect. The closure may
    /// run more than once on contention — it must only act through the
    /// [`StoreTx`] handle.
    pub fn transact<R, E, F>(&self, f: F) -> Result<R, E>
    where
        E: From<StoreError>,
        F: Fn(&mut StoreTx<'_>) -> Result<R, E>,
    {
        let result = self.tree.transaction(|ttree| {
            let mut tx = StoreTx {
                tree: ttree,
                conflicted: false,
            };
            match f(&mut tx) {
                Ok(r) => Ok(r),
                Err(_) if tx.conflicted => Err(ConflictableTransactionError::Conflict),
                Err(e) => Err(ConflictableTransactionError::Abort(e)),
            }
        });
        match result {
            Ok(r) => Ok(r),
            Err(TransactionError::Abort(e)) => Err(e),
            Err(TransactionError::Storage(e)) => Err(E::from(StoreError::Backend(e))),
        }
    }

    // -- Guarded transitions ------------------------------------------------

    /// Conditionally advance a pay-in: if its current state is one of
    /// `expected`, apply `f` and commit via compare-and-swap. Returns the
    /// updated record, or `None` if another worker got there first.
    pub fn advance_payin_if(
        &self,
        id: &Uuid,
        expected: &[PayInState],
        f: impl Fn(&mut PayIn),
    ) -> StoreResult<Option<PayIn>> {
        let k = payin_key(id);
        loop {
            let Some(cur_bytes) = self.tree.get(&k)? else {
                return Ok(None);
            };
            let cur: PayIn = decode(&cur_bytes)?;
            if !expected.contains(&cur.state) {
                return Ok(None);
            }
            let mut next = cur;
            f(&mut next);
            match self
                .tree
                .compare_and_swap(&k, Some(cur_bytes), Some(encode(&next)?))?
            {
                Ok(()) => return Ok(Some(next)),
                // Lost the race; re-read and re-check the guard.
                Err(_) => continue,
            }
        }
    }

    /// Conditionally advance a forward, same contract as
    /// [`advance_payin_if`](Self::advance_payin_if).
    pub fn advance_forward_if(
        &self,
        id: &Uuid,
        expected: ForwardStatus,
        f: impl Fn(&mut InvoiceForward),
    ) -> StoreResult<Option<InvoiceForward>> {
        let k = forward_key(id);
        loop {
            let Some(cur_bytes) = self.tree.get(&k)? else {
                return Ok(None);
            };
            let cur: InvoiceForward = decode(&cur_bytes)?;
            if cur.status != expected {
                return Ok(None);
            }
            let mut next = cur;
            f(&mut next);
            match self
                .tree
                .compare_and_swap(&k, Some(cur_bytes), Some(encode(&next)?))?
            {
                Ok(()) => return Ok(Some(next)),
                Err(_) => continue,
            }
        }
    }

    // -- Point reads --------------------------------------------------------

    pub fn get_payin(&self, id: &Uuid) -> StoreResult<Option<PayIn>> {
        self.tree.get(payin_key(id))?.map(|b| decode(&b)).transpose()
    }

    pub fn get_forward(&self, id: &Uuid) -> StoreResult<Option<InvoiceForward>> {
        self.tree
            .get(forward_key(id))?
            .map(|b| decode(&b))
            .transpose()
    }

    pub fn get_invoice(&self, hash: &str) -> StoreResult<Option<Invoice>> {
        self.tree
            .get(key(P_INVOICE, hash.as_bytes()))?
            .map(|b| decode(&b))
            .transpose()
    }

    pub fn get_withdrawal(&self, hash: &str) -> StoreResult<Option<Withdrawal>> {
        self.tree
            .get(key(P_WITHDRAWAL, hash.as_bytes()))?
            .map(|b| decode(&b))
            .transpose()
    }

    pub fn get_balance(&self, user: UserId) -> StoreResult<UserBalance> {
        Ok(self
            .tree
            .get(balance_key(user))?
            .map(|b| decode(&b))
            .transpose()?
            .unwrap_or_default())
    }

    fn id_by_index(&self, prefix: &[u8], hash: &str) -> StoreResult<Option<Uuid>> {
        Ok(self
            .tree
            .get(key(prefix, hash.as_bytes()))?
            .and_then(|b| Uuid::from_slice(&b).ok()))
    }

    /// The pay-in whose inbound invoice carries this hash.
    pub fn payin_by_invoice(&self, hash: &str) -> StoreResult<Option<PayIn>> {
        match self.id_by_index(P_IDX_PAYIN_INVOICE, hash)? {
            Some(id) => self.get_payin(&id),
            None => Ok(None),
        }
    }

    /// The forward whose inbound invoice carries this hash.
    pub fn forward_by_invoice(&self, hash: &str) -> StoreResult<Option<InvoiceForward>> {
        match self.id_by_index(P_IDX_FORWARD_INVOICE, hash)? {
            Some(id) => self.get_forward(&id),
            None => Ok(None),
        }
    }

    /// The forward whose outbound withdrawal carries this hash.
    pub fn forward_by_withdrawal(&self, hash: &str) -> StoreResult<Option<InvoiceForward>> {
        match self.id_by_index(P_IDX_FORWARD_WITHDRAWAL, hash)? {
            Some(id) => self.get_forward(&id),
            None => Ok(None),
        }
    }

    // -- Scans --------------------------------------------------------------

    /// Every pay-in not yet in a terminal state. Sweep input.
    pub fn non_terminal_payins(&self) -> StoreResult<Vec<PayIn>> {
        let mut out = Vec::new();
        for item in self.tree.scan_prefix(P_PAYIN) {
            let (_, bytes) = item?;
            let payin: PayIn = decode(&bytes)?;
            if !payin.is_terminal() {
                out.push(payin);
            }
        }
        Ok(out)
    }

    /// Every forward not yet in a terminal state. Sweep input.
    pub fn non_terminal_forwards(&self) -> StoreResult<Vec<InvoiceForward>> {
        let mut out = Vec::new();
        for item in self.tree.scan_prefix(P_FORWARD) {
            let (_, bytes) = item?;
            let forward: InvoiceForward = decode(&bytes)?;
            if !forward.is_terminal() {
                out.push(forward);
            }
        }
        Ok(out)
    }

    // -- Jobs ---------------------------------------------------------------

    /// Enqueue a job outside any transaction.
    pub fn enqueue_job(&self, job: &Job) -> StoreResult<()> {
        self.tree.insert(job.key(), encode(job)?)?;
        Ok(())
    }

    /// Jobs whose scheduled time has passed, ordered by (time, priority).
    pub fn due_jobs(&self, now: DateTime<Utc>, limit: usize) -> StoreResult<Vec<Job>> {
        let mut out = Vec::new();
        for item in self.tree.scan_prefix(P_JOB) {
            let (_, bytes) = item?;
            let job: Job = decode(&bytes)?;
            if job.run_at > now {
                // Keys sort by run-at first; everything later is in the future.
                break;
            }
            out.push(job);
            if out.len() >= limit {
                break;
            }
        }
        Ok(out)
    }

    /// Claim a due job. Exactly one concurrent claimant wins; losers see
    /// `false` and move on. Handlers are idempotent regardless — this only
    /// avoids duplicate work, it doesn't guard correctness.
    pub fn take_job(&self, job: &Job) -> StoreResult<bool> {
        Ok(self.tree.remove(job.key())?.is_some())
    }

    // -- Subscription checkpoint --------------------------------------------

    /// The highest settle index we've durably recorded.
    pub fn confirmed_index(&self) -> StoreResult<Option<u64>> {
        Ok(self
            .tree
            .get(META_CONFIRMED_INDEX)?
            .map(|b| decode(&b))
            .transpose()?)
    }

    /// Record a settle index, keeping the maximum seen so far.
    pub fn note_confirmed_index(&self, index: u64) -> StoreResult<()> {
        loop {
            let cur_bytes = self.tree.get(META_CONFIRMED_INDEX)?;
            let cur: u64 = match &cur_bytes {
                Some(b) => decode(b)?,
                None => 0,
            };
            if index <= cur {
                return Ok(());
            }
            match self.tree.compare_and_swap(
                META_CONFIRMED_INDEX,
                cur_bytes,
                Some(encode(&index)?),
            )? {
                Ok(()) => return Ok(()),
                Err(_) => continue,
            }
        }
    }
}

// ---------------------------------------------------------------------------
// StoreTx
// ---------------------------------------------------------------------------

/// Handle passed into [`Store::transact`] closures. Every accessor either
/// succeeds or poisons the attempt; sled retries conflicted attempts
/// transparently.
pub struct StoreTx<'a> {
    tree: &'a TransactionalTree,
    conflicted: bool,
}

impl StoreTx<'_> {
    fn raw_get<T: DeserializeOwned>(&mut self, k: &[u8]) -> StoreResult<Option<T>> {
        match self.tree.get(k) {
            Ok(Some(bytes)) => decode(&bytes).map(Some),
            Ok(None) => Ok(None),
            Err(e) => Err(self.classify(e)),
        }
    }

    fn raw_put<T: Serialize>(&mut self, k: Vec<u8>, value: &T) -> StoreResult<()> {
        let bytes = encode(value)?;
        match self.tree.insert(k, bytes) {
            Ok(_) => Ok(()),
            Err(e) => Err(self.classify(e)),
        }
    }

    fn raw_remove(&mut self, k: Vec<u8>) -> StoreResult<()> {
        match self.tree.remove(k) {
            Ok(_) => Ok(()),
            Err(e) => Err(self.classify(e)),
        }
    }

    fn classify(&mut self, e: UnabortableTransactionError) -> StoreError {
        match e {
            UnabortableTransactionError::Conflict => {
                self.conflicted = true;
                StoreError::Conflict
            }
            UnabortableTransactionError::Storage(e) => StoreError::Backend(e),
        }
    }

    // -- Typed accessors ----------------------------------------------------

    pub fn get_payin(&mut self, id: &Uuid) -> StoreResult<Option<PayIn>> {
        self.raw_get(&payin_key(id))
    }

    pub fn put_payin(&mut self, payin: &PayIn) -> StoreResult<()> {
        self.raw_put(payin_key(&payin.id), payin)
    }

    pub fn get_forward(&mut self, id: &Uuid) -> StoreResult<Option<InvoiceForward>> {
        self.raw_get(&forward_key(id))
    }

    pub fn put_forward(&mut self, forward: &InvoiceForward) -> StoreResult<()> {
        self.raw_put(forward_key(&forward.id), forward)
    }

    pub fn get_invoice(&mut self, hash: &str) -> StoreResult<Option<Invoice>> {
        self.raw_get(&key(P_INVOICE, hash.as_bytes()))
    }

    pub fn put_invoice(&mut self, invoice: &Invoice) -> StoreResult<()> {
        self.raw_put(key(P_INVOICE, invoice.hash.as_bytes()), invoice)
    }

    pub fn get_withdrawal(&mut self, hash: &str) -> StoreResult<Option<Withdrawal>> {
        self.raw_get(&key(P_WITHDRAWAL, hash.as_bytes()))
    }

    pub fn put_withdrawal(&mut self, withdrawal: &Withdrawal) -> StoreResult<()> {
        self.raw_put(key(P_WITHDRAWAL, withdrawal.hash.as_bytes()), withdrawal)
    }

    pub fn get_balance(&mut self, user: UserId) -> StoreResult<UserBalance> {
        Ok(self.raw_get(&balance_key(user))?.unwrap_or_default())
    }

    pub fn put_balance(&mut self, user: UserId, balance: &UserBalance) -> StoreResult<()> {
        self.raw_put(balance_key(user), balance)
    }

    /// Enqueue a job atomically with the surrounding writes.
    pub fn enqueue_job(&mut self, job: &Job) -> StoreResult<()> {
        self.raw_put(job.key(), job)
    }

    pub fn remove_job(&mut self, job: &Job) -> StoreResult<()> {
        self.raw_remove(job.key())
    }

    pub fn index_payin_invoice(&mut self, hash: &str, id: &Uuid) -> StoreResult<()> {
        let bytes = id.as_bytes().to_vec();
        match self
            .tree
            .insert(key(P_IDX_PAYIN_INVOICE, hash.as_bytes()), bytes)
        {
            Ok(_) => Ok(()),
            Err(e) => Err(self.classify(e)),
        }
    }

    pub fn index_forward_invoice(&mut self, hash: &str, id: &Uuid) -> StoreResult<()> {
        let bytes = id.as_bytes().to_vec();
        match self
            .tree
            .insert(key(P_IDX_FORWARD_INVOICE, hash.as_bytes()), bytes)
        {
            Ok(_) => Ok(()),
            Err(e) => Err(self.classify(e)),
        }
    }

    pub fn index_forward_withdrawal(&mut self, hash: &str, id: &Uuid) -> StoreResult<()> {
        let bytes = id.as_bytes().to_vec();
        match self
            .tree
            .insert(key(P_IDX_FORWARD_WITHDRAWAL, hash.as_bytes()), bytes)
        {
            Ok(_) => Ok(()),
            Err(e) => Err(self.classify(e)),
        }
    }
}
