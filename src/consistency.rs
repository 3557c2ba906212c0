//! Consistency engine
//!
//! Recomputes the volatile counter and the stored balance projection from
//! sub-entry truth. The durable side is authoritative and repaired first;
//! the counter side is best-effort — it is overwritten, never decremented,
//! so a brief disagreement with concurrent admissions is acceptable.

use rust_decimal::Decimal;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::interval;

use crate::counter::PendingCounter;
use crate::models::{Account, LedgerError};
use crate::store::LedgerStore;

#[derive(Debug, Default, Clone, Copy)]
pub struct RepairReport {
    pub accounts_checked: usize,
    pub accounts_repaired: usize,
}

pub struct ConsistencyEngine {
    store: Arc<dyn LedgerStore>,
    counter: Arc<dyn PendingCounter>,
    check_interval: Duration,
}

impl ConsistencyEngine {
    pub fn new(
        store: Arc<dyn LedgerStore>,
        counter: Arc<dyn PendingCounter>,
        check_interval: Duration,
    ) -> Self {
        Self { store, counter, check_interval }
    }

    /// Validate every account against sub-entry truth and repair the ones
    /// that diverged. Per-account failures are logged and skipped.
    pub async fn validate_and_repair(&self) -> Result<RepairReport, LedgerError> {
        let accounts = self.store.list_accounts().await?;
        let mut report = RepairReport { accounts_checked: accounts.len(), ..Default::default() };

        for account in &accounts {
            match self.validate_account(account).await {
                Ok(true) => report.accounts_repaired += 1,
                Ok(false) => {}
                Err(e) => log::warn!("consistency check failed for account {}: {}", account.id, e),
            }
        }

        if report.accounts_repaired > 0 {
            log::info!(
                "consistency pass repaired {}/{} accounts",
                report.accounts_repaired,
                report.accounts_checked
            );
        }
        Ok(report)
    }

    async fn validate_account(&self, account: &Account) -> Result<bool, LedgerError> {
        let totals = self.store.pending_totals(&account.id).await?;
        let pending_truth = totals.net();
        // The counter floors at zero, so a credit-heavy truth reads as zero.
        let expected_counter = pending_truth.max(Decimal::ZERO);

        let counter_diverged = match self.counter.get(&account.id).await {
            Ok(value) => {
                if value != expected_counter {
                    log::warn!(
                        "counter divergence on account {}: counter={}, truth={}",
                        account.id,
                        value,
                        expected_counter
                    );
                    true
                } else {
                    false
                }
            }
            Err(e) => {
                // Counter down: validate the durable side only.
                log::debug!("counter unreachable during consistency check: {}", e);
                false
            }
        };

        let projection_diverged = account.available_balance != account.available();
        if projection_diverged {
            log::warn!(
                "projection divergence on account {}: stored={}, computed={}",
                account.id,
                account.available_balance,
                account.available()
            );
        }

        if !counter_diverged && !projection_diverged {
            return Ok(false);
        }

        self.repair_account(account, expected_counter).await?;
        Ok(true)
    }

    /// Durable projection first (optimistic write, one reload-and-retry),
    /// then overwrite the counter. Counter failures are non-fatal; the next
    /// pass or the post-settlement recovery picks them up.
    async fn repair_account(
        &self,
        account: &Account,
        expected_counter: Decimal,
    ) -> Result<(), LedgerError> {
        match self.store.update_account(account).await {
            Ok(()) => {}
            Err(LedgerError::ConcurrentUpdate { .. }) => {
                let fresh = self
                    .store
                    .get_account(&account.id)
                    .await?
                    .ok_or_else(|| LedgerError::NotFound(account.id.clone()))?;
                self.store.update_account(&fresh).await?;
            }
            Err(e) => return Err(e),
        }

        if let Err(e) = self.counter.clear(&account.id).await {
            log::warn!("failed to clear counter for account {}: {}", account.id, e);
            return Ok(());
        }
        if expected_counter > Decimal::ZERO {
            if let Err(e) =
                self.counter.add_bounded(&account.id, expected_counter, expected_counter).await
            {
                log::warn!("failed to restore counter for account {}: {}", account.id, e);
            }
        }

        log::info!("repaired account {}: counter set to {}", account.id, expected_counter);
        Ok(())
    }

    /// Rebuild every counter key from pending sub-entries, grouped per
    /// account. Called after the backend returns from an outage and after
    /// each settlement cycle.
    pub async fn recover_counter_from_store(&self) -> Result<(), LedgerError> {
        let pending = self.store.list_all_pending().await?;

        let mut by_account: BTreeMap<String, Decimal> = BTreeMap::new();
        for entry in &pending {
            *by_account.entry(entry.account_id.clone()).or_default() +=
                entry.direction.counter_delta(entry.amount);
        }

        for (account_id, net) in &by_account {
            if let Err(e) = self.counter.clear(account_id).await {
                log::warn!("counter recovery: failed to clear key for {}: {}", account_id, e);
                continue;
            }
            if *net <= Decimal::ZERO {
                continue;
            }

            let account = match self.store.get_account(account_id).await? {
                Some(account) => account,
                None => {
                    log::warn!("counter recovery: pending entries for unknown account {}", account_id);
                    continue;
                }
            };

            match self.counter.add_bounded(account_id, *net, account.available_balance).await {
                Ok(res) if !res.accepted => {
                    // Fallback admissions are already reflected in the
                    // available balance, so the net can exceed the ceiling.
                    // Leaving the key cleared only makes the fast path more
                    // conservative.
                    log::warn!(
                        "counter recovery for {} not applied: pending {} exceeds ceiling {} ({})",
                        account_id,
                        net,
                        account.available_balance,
                        res.reason
                    );
                }
                Ok(_) => log::debug!("recovered counter for {}: {}", account_id, net),
                Err(e) => log::warn!("counter recovery failed for {}: {}", account_id, e),
            }
        }

        for account_id in self.store.list_account_ids().await? {
            if !by_account.contains_key(&account_id) {
                if let Err(e) = self.counter.clear(&account_id).await {
                    log::debug!("counter recovery: failed to clear idle key {}: {}", account_id, e);
                }
            }
        }

        Ok(())
    }

    /// Periodic repair loop with graceful shutdown.
    pub async fn run_with_shutdown(&self, mut shutdown: watch::Receiver<bool>) {
        log::info!("consistency engine started (interval={}s)", self.check_interval.as_secs());

        let mut ticker = interval(self.check_interval);
        loop {
            tokio::select! {
                biased;

                _ = shutdown.changed() => {
                    log::info!("consistency engine received shutdown signal");
                    break;
                }

                _ = ticker.tick() => {
                    if let Err(e) = self.validate_and_repair().await {
                        log::error!("consistency pass failed: {}", e);
                    }
                }
            }
        }

        log::info!("consistency engine stopped");
    }
}
