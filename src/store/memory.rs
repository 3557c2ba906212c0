//! In-memory ledger store
//!
//! Mirrors the Postgres adapter's semantics for tests and local runs. The
//! row lock is modelled as one async mutex per account id, held across the
//! body of the two transactional composites.

use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::Mutex;

use crate::models::{Account, Direction, EntryStatus, LedgerError, SubEntry};
use crate::store::traits::{AdmitOutcome, LedgerStore, PendingTotals, SettleOutcome};

#[derive(Default)]
pub struct MemoryLedgerStore {
    accounts: Mutex<HashMap<String, Account>>,
    entries: Mutex<Vec<SubEntry>>,
    row_locks: StdMutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl MemoryLedgerStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a row verbatim, skipping the optimistic check and
    /// the projection recompute. Test hook for manufacturing divergence.
    pub async fn force_put_account(&self, account: Account) {
        self.accounts.lock().await.insert(account.id.clone(), account);
    }

    fn row_lock(&self, account_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.row_locks.lock().unwrap();
        locks.entry(account_id.to_string()).or_insert_with(|| Arc::new(Mutex::new(()))).clone()
    }

    async fn totals_for(&self, account_id: &str) -> PendingTotals {
        let entries = self.entries.lock().await;
        let mut totals = PendingTotals { debit: Decimal::ZERO, credit: Decimal::ZERO };
        for entry in entries.iter() {
            if entry.account_id == account_id && entry.status == EntryStatus::Pending {
                match entry.direction {
                    Direction::Debit => totals.debit += entry.amount,
                    Direction::Credit => totals.credit += entry.amount,
                }
            }
        }
        totals
    }

    async fn mark_entries(&self, ids: &[String], status: EntryStatus) {
        let now = Utc::now();
        let mut entries = self.entries.lock().await;
        for entry in entries.iter_mut() {
            if ids.contains(&entry.id) && entry.status.can_transition_to(status) {
                entry.status = status;
                entry.updated_at = now;
            }
        }
    }
}

#[async_trait]
impl LedgerStore for MemoryLedgerStore {
    async fn create_account(&self, account: Account) -> Result<(), LedgerError> {
        let mut accounts = self.accounts.lock().await;
        if accounts.contains_key(&account.id) {
            return Err(LedgerError::InvalidInput(format!(
                "account already exists: {}",
                account.id
            )));
        }
        accounts.insert(account.id.clone(), account);
        Ok(())
    }

    async fn get_account(&self, id: &str) -> Result<Option<Account>, LedgerError> {
        Ok(self.accounts.lock().await.get(id).cloned())
    }

    async fn update_account(&self, account: &Account) -> Result<(), LedgerError> {
        let mut accounts = self.accounts.lock().await;
        let stored = accounts
            .get_mut(&account.id)
            .ok_or_else(|| LedgerError::NotFound(account.id.clone()))?;

        if stored.version != account.version {
            return Err(LedgerError::ConcurrentUpdate { account_id: account.id.clone() });
        }

        let mut next = account.clone();
        next.version = account.version + 1;
        next.updated_at = Utc::now();
        next.refresh_projection();
        *stored = next;
        Ok(())
    }

    async fn create_sub_entry(&self, entry: &SubEntry) -> Result<(), LedgerError> {
        self.entries.lock().await.push(entry.clone());
        Ok(())
    }

    async fn list_pending_for_account(&self, account_id: &str) -> Result<Vec<SubEntry>, LedgerError> {
        let entries = self.entries.lock().await;
        let mut pending: Vec<SubEntry> = entries
            .iter()
            .filter(|e| e.account_id == account_id && e.status == EntryStatus::Pending)
            .cloned()
            .collect();
        pending.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(pending)
    }

    async fn list_all_pending(&self) -> Result<Vec<SubEntry>, LedgerError> {
        let entries = self.entries.lock().await;
        let mut pending: Vec<SubEntry> =
            entries.iter().filter(|e| e.status == EntryStatus::Pending).cloned().collect();
        pending.sort_by(|a, b| {
            a.account_id
                .cmp(&b.account_id)
                .then_with(|| a.created_at.cmp(&b.created_at))
                .then_with(|| a.id.cmp(&b.id))
        });
        Ok(pending)
    }

    async fn update_sub_entries_status(
        &self,
        ids: &[String],
        status: EntryStatus,
    ) -> Result<(), LedgerError> {
        self.mark_entries(ids, status).await;
        Ok(())
    }

    async fn pending_totals(&self, account_id: &str) -> Result<PendingTotals, LedgerError> {
        Ok(self.totals_for(account_id).await)
    }

    async fn list_accounts(&self) -> Result<Vec<Account>, LedgerError> {
        let accounts = self.accounts.lock().await;
        let mut all: Vec<Account> = accounts.values().cloned().collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(all)
    }

    async fn list_account_ids(&self) -> Result<Vec<String>, LedgerError> {
        let accounts = self.accounts.lock().await;
        let mut ids: Vec<String> = accounts.keys().cloned().collect();
        ids.sort();
        Ok(ids)
    }

    async fn admit_pending_locked(&self, entry: SubEntry) -> Result<AdmitOutcome, LedgerError> {
        let lock = self.row_lock(&entry.account_id);
        let _guard = lock.lock().await;

        let account = match self.get_account(&entry.account_id).await? {
            Some(account) => account,
            None => return Ok(AdmitOutcome::NotFound),
        };

        // Pending truth from sub-entries, not the row fields: the row only
        // reflects fallback-acknowledged intent and would undercount.
        let totals = self.totals_for(&entry.account_id).await;
        let true_available = account.settled_balance + totals.credit - totals.debit;

        if entry.direction == Direction::Debit && entry.amount > true_available {
            return Ok(AdmitOutcome::InsufficientFunds { available: true_available });
        }

        self.entries.lock().await.push(entry.clone());

        let mut accounts = self.accounts.lock().await;
        let stored = accounts
            .get_mut(&entry.account_id)
            .ok_or_else(|| LedgerError::NotFound(entry.account_id.clone()))?;
        match entry.direction {
            Direction::Debit => stored.pending_debit += entry.amount,
            Direction::Credit => stored.pending_credit += entry.amount,
        }
        stored.refresh_projection();
        stored.version += 1;
        stored.updated_at = Utc::now();

        Ok(AdmitOutcome::Admitted)
    }

    async fn settle_batch_locked(
        &self,
        account_id: &str,
        entry_ids: &[String],
        delta: Decimal,
    ) -> Result<SettleOutcome, LedgerError> {
        let lock = self.row_lock(account_id);
        let _guard = lock.lock().await;

        let settled = {
            let accounts = self.accounts.lock().await;
            accounts
                .get(account_id)
                .ok_or_else(|| LedgerError::NotFound(account_id.to_string()))?
                .settled_balance
        };

        let candidate = settled + delta;
        let now = Utc::now();

        if candidate < Decimal::ZERO {
            // Whole-batch rejection: the settled balance is untouched, the
            // intent is terminal so the pending fields are zeroed.
            self.mark_entries(entry_ids, EntryStatus::Rejected).await;
            let mut accounts = self.accounts.lock().await;
            let stored = accounts
                .get_mut(account_id)
                .ok_or_else(|| LedgerError::NotFound(account_id.to_string()))?;
            stored.pending_debit = Decimal::ZERO;
            stored.pending_credit = Decimal::ZERO;
            stored.refresh_projection();
            stored.version += 1;
            stored.updated_at = now;
            return Ok(SettleOutcome::BatchRejected { candidate });
        }

        self.mark_entries(entry_ids, EntryStatus::Settled).await;
        let mut accounts = self.accounts.lock().await;
        let stored = accounts
            .get_mut(account_id)
            .ok_or_else(|| LedgerError::NotFound(account_id.to_string()))?;
        stored.settled_balance = candidate;
        stored.pending_debit = Decimal::ZERO;
        stored.pending_credit = Decimal::ZERO;
        stored.refresh_projection();
        stored.last_settlement_at = Some(now);
        stored.version += 1;
        stored.updated_at = now;

        Ok(SettleOutcome::Settled { new_balance: candidate })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn debit(account_id: &str, amount: Decimal) -> SubEntry {
        SubEntry::new_pending(account_id, amount, Direction::Debit)
    }

    fn credit(account_id: &str, amount: Decimal) -> SubEntry {
        SubEntry::new_pending(account_id, amount, Direction::Credit)
    }

    #[tokio::test]
    async fn test_create_account_rejects_duplicate() {
        let store = MemoryLedgerStore::new();
        store.create_account(Account::new("A", dec!(100))).await.unwrap();
        let err = store.create_account(Account::new("A", dec!(50))).await.unwrap_err();
        assert_eq!(err.error_code(), "INVALID_INPUT");
    }

    #[tokio::test]
    async fn test_optimistic_update_conflict() {
        let store = MemoryLedgerStore::new();
        store.create_account(Account::new("A", dec!(100))).await.unwrap();

        let mut first = store.get_account("A").await.unwrap().unwrap();
        let second = store.get_account("A").await.unwrap().unwrap();

        first.settled_balance = dec!(90);
        store.update_account(&first).await.unwrap();

        // Second copy still carries the old version.
        let err = store.update_account(&second).await.unwrap_err();
        assert_eq!(err.error_code(), "CONCURRENT_UPDATE");

        let stored = store.get_account("A").await.unwrap().unwrap();
        assert_eq!(stored.settled_balance, dec!(90));
        assert_eq!(stored.version, 2);
    }

    #[tokio::test]
    async fn test_admit_locked_debit_and_reject() {
        let store = MemoryLedgerStore::new();
        store.create_account(Account::new("A", dec!(100))).await.unwrap();

        let outcome = store.admit_pending_locked(debit("A", dec!(60))).await.unwrap();
        assert_eq!(outcome, AdmitOutcome::Admitted);

        // Second debit sees the first one in the pending truth.
        let outcome = store.admit_pending_locked(debit("A", dec!(60))).await.unwrap();
        assert_eq!(outcome, AdmitOutcome::InsufficientFunds { available: dec!(40) });

        let account = store.get_account("A").await.unwrap().unwrap();
        assert_eq!(account.pending_debit, dec!(60));
        assert_eq!(account.available_balance, dec!(40));
        assert_eq!(store.list_pending_for_account("A").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_admit_locked_credit_skips_overdraft_check() {
        let store = MemoryLedgerStore::new();
        store.create_account(Account::new("A", dec!(0))).await.unwrap();

        let outcome = store.admit_pending_locked(credit("A", dec!(500))).await.unwrap();
        assert_eq!(outcome, AdmitOutcome::Admitted);

        let account = store.get_account("A").await.unwrap().unwrap();
        assert_eq!(account.pending_credit, dec!(500));
        assert_eq!(account.available_balance, dec!(500));
    }

    #[tokio::test]
    async fn test_admit_locked_unknown_account() {
        let store = MemoryLedgerStore::new();
        let outcome = store.admit_pending_locked(debit("ghost", dec!(1))).await.unwrap();
        assert_eq!(outcome, AdmitOutcome::NotFound);
    }

    #[tokio::test]
    async fn test_settle_batch_folds_delta() {
        let store = MemoryLedgerStore::new();
        store.create_account(Account::new("A", dec!(1000))).await.unwrap();

        let d = debit("A", dec!(300));
        let c = credit("A", dec!(100));
        store.create_sub_entry(&d).await.unwrap();
        store.create_sub_entry(&c).await.unwrap();

        let outcome = store
            .settle_batch_locked("A", &[d.id.clone(), c.id.clone()], dec!(-200))
            .await
            .unwrap();
        assert_eq!(outcome, SettleOutcome::Settled { new_balance: dec!(800) });

        let account = store.get_account("A").await.unwrap().unwrap();
        assert_eq!(account.settled_balance, dec!(800));
        assert_eq!(account.pending_debit, dec!(0));
        assert_eq!(account.available_balance, dec!(800));
        assert!(account.last_settlement_at.is_some());
        assert!(store.list_all_pending().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_settle_batch_rejects_overdraw() {
        let store = MemoryLedgerStore::new();
        store.create_account(Account::new("A", dec!(1000))).await.unwrap();

        let d1 = debit("A", dec!(600));
        let d2 = debit("A", dec!(600));
        store.create_sub_entry(&d1).await.unwrap();
        store.create_sub_entry(&d2).await.unwrap();

        let outcome = store
            .settle_batch_locked("A", &[d1.id.clone(), d2.id.clone()], dec!(-1200))
            .await
            .unwrap();
        assert_eq!(outcome, SettleOutcome::BatchRejected { candidate: dec!(-200) });

        let account = store.get_account("A").await.unwrap().unwrap();
        assert_eq!(account.settled_balance, dec!(1000));
        assert!(account.last_settlement_at.is_none());
        assert!(store.list_all_pending().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_terminal_entries_are_never_rewound() {
        let store = MemoryLedgerStore::new();
        store.create_account(Account::new("A", dec!(100))).await.unwrap();

        let d = debit("A", dec!(10));
        store.create_sub_entry(&d).await.unwrap();
        store.update_sub_entries_status(&[d.id.clone()], EntryStatus::Settled).await.unwrap();
        store.update_sub_entries_status(&[d.id.clone()], EntryStatus::Rejected).await.unwrap();

        let entries = store.entries.lock().await;
        assert_eq!(entries[0].status, EntryStatus::Settled);
    }

    #[tokio::test]
    async fn test_list_all_pending_ordering() {
        let store = MemoryLedgerStore::new();
        store.create_account(Account::new("B", dec!(100))).await.unwrap();
        store.create_account(Account::new("A", dec!(100))).await.unwrap();

        store.create_sub_entry(&debit("B", dec!(1))).await.unwrap();
        store.create_sub_entry(&debit("A", dec!(2))).await.unwrap();
        store.create_sub_entry(&debit("A", dec!(3))).await.unwrap();

        let pending = store.list_all_pending().await.unwrap();
        let accounts: Vec<&str> = pending.iter().map(|e| e.account_id.as_str()).collect();
        assert_eq!(accounts, vec!["A", "A", "B"]);
        assert!(pending[0].created_at <= pending[1].created_at);
    }

    #[tokio::test]
    async fn test_pending_totals_signed() {
        let store = MemoryLedgerStore::new();
        store.create_account(Account::new("A", dec!(100))).await.unwrap();
        store.create_sub_entry(&debit("A", dec!(30))).await.unwrap();
        store.create_sub_entry(&credit("A", dec!(10))).await.unwrap();

        let totals = store.pending_totals("A").await.unwrap();
        assert_eq!(totals.debit, dec!(30));
        assert_eq!(totals.credit, dec!(10));
        assert_eq!(totals.net(), dec!(20));
    }
}
