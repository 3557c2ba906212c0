//! Durable store trait
//!
//! The two `*_locked` operations are transactional composites: each one
//! acquires the exclusive row lock on the account and holds it across the
//! whole body, so fallback admission and settlement on the same account are
//! serialised by the store and never interleave.

use async_trait::async_trait;
use rust_decimal::Decimal;

use crate::models::{Account, EntryStatus, LedgerError, SubEntry};

/// Signed pending sums recomputed from sub-entry truth.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PendingTotals {
    pub debit: Decimal,
    pub credit: Decimal,
}

impl PendingTotals {
    /// Net pending counter value: debits minus credits.
    pub fn net(&self) -> Decimal {
        self.debit - self.credit
    }
}

/// Result of the fallback admission transaction.
#[derive(Debug, Clone, PartialEq)]
pub enum AdmitOutcome {
    /// Entry inserted, pending fields bumped.
    Admitted,
    /// Debit would overdraw the true available balance; nothing written.
    InsufficientFunds { available: Decimal },
    /// Account does not exist; nothing written.
    NotFound,
}

/// Result of the per-account settlement transaction.
#[derive(Debug, Clone, PartialEq)]
pub enum SettleOutcome {
    /// Delta folded into the settled balance, batch marked settled.
    Settled { new_balance: Decimal },
    /// Folding the batch would have driven the settled balance negative:
    /// the whole batch was marked rejected and balances were left untouched
    /// (pending fields are still zeroed since the intent is now terminal).
    BatchRejected { candidate: Decimal },
}

#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Insert a fresh account row. Fails with `InvalidInput` on duplicate id.
    async fn create_account(&self, account: Account) -> Result<(), LedgerError>;

    async fn get_account(&self, id: &str) -> Result<Option<Account>, LedgerError>;

    /// Optimistic update keyed on `account.version`: the write applies only
    /// if the stored version still matches, and bumps it by one. A mismatch
    /// yields `ConcurrentUpdate`; the caller reloads and retries. The stored
    /// `available_balance` projection is recomputed as part of the write.
    async fn update_account(&self, account: &Account) -> Result<(), LedgerError>;

    async fn create_sub_entry(&self, entry: &SubEntry) -> Result<(), LedgerError>;

    /// Pending entries for one account, oldest first.
    async fn list_pending_for_account(&self, account_id: &str) -> Result<Vec<SubEntry>, LedgerError>;

    /// All pending entries, ordered by account then creation time.
    async fn list_all_pending(&self) -> Result<Vec<SubEntry>, LedgerError>;

    /// Batch status transition. Only `pending` rows are affected; terminal
    /// entries are never rewound.
    async fn update_sub_entries_status(
        &self,
        ids: &[String],
        status: EntryStatus,
    ) -> Result<(), LedgerError>;

    /// Signed pending sums for one account, recomputed from sub-entries.
    async fn pending_totals(&self, account_id: &str) -> Result<PendingTotals, LedgerError>;

    async fn list_accounts(&self) -> Result<Vec<Account>, LedgerError>;

    async fn list_account_ids(&self) -> Result<Vec<String>, LedgerError>;

    /// Fallback admission: under the account row lock, recompute pending
    /// truth from sub-entries, check the overdraft rule for debits, insert
    /// the entry and bump the account's pending fields in one transaction.
    async fn admit_pending_locked(&self, entry: SubEntry) -> Result<AdmitOutcome, LedgerError>;

    /// Per-account settlement: under the account row lock, fold `delta`
    /// (credits minus debits of the batch) into the settled balance and mark
    /// the batch settled, or reject the whole batch if the fold would
    /// overdraw. One transaction either way.
    async fn settle_batch_locked(
        &self,
        account_id: &str,
        entry_ids: &[String],
        delta: Decimal,
    ) -> Result<SettleOutcome, LedgerError>;
}
