//! Settlement worker
//!
//! Periodic drain of pending sub-entries: batches are grouped per account
//! and folded into the settled balance under the account row lock, one
//! account per transaction — locks are never nested across accounts. After
//! each cycle the volatile counter layer is re-established from durable
//! truth if the backend is healthy.

use rust_decimal::Decimal;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::interval;

use crate::consistency::ConsistencyEngine;
use crate::counter::PendingCounter;
use crate::health::CounterHealthProbe;
use crate::models::{LedgerError, SubEntry};
use crate::store::{LedgerStore, SettleOutcome};

#[derive(Debug, Clone)]
pub struct SettlementConfig {
    /// Cycle period.
    pub interval: Duration,
    /// Maximum sub-entries per batch slice.
    pub batch_size: usize,
}

impl Default for SettlementConfig {
    fn default() -> Self {
        Self { interval: Duration::from_secs(5), batch_size: 100 }
    }
}

/// Counts for one settlement cycle.
#[derive(Debug, Default, Clone, Copy)]
pub struct CycleStats {
    pub entries_seen: usize,
    pub accounts_settled: usize,
    pub accounts_rejected: usize,
    pub accounts_failed: usize,
}

pub struct SettlementWorker {
    store: Arc<dyn LedgerStore>,
    counter: Arc<dyn PendingCounter>,
    probe: Arc<CounterHealthProbe>,
    consistency: Arc<ConsistencyEngine>,
    config: SettlementConfig,
}

impl SettlementWorker {
    pub fn new(
        store: Arc<dyn LedgerStore>,
        counter: Arc<dyn PendingCounter>,
        probe: Arc<CounterHealthProbe>,
        consistency: Arc<ConsistencyEngine>,
        config: SettlementConfig,
    ) -> Self {
        Self { store, counter, probe, consistency, config }
    }

    /// Worker loop with graceful shutdown, checked between cycles and
    /// between batches. No durable transaction spans a checkpoint.
    pub async fn run_with_shutdown(&self, mut shutdown: watch::Receiver<bool>) {
        log::info!(
            "settlement worker started (interval={}ms, batch_size={})",
            self.config.interval.as_millis(),
            self.config.batch_size
        );

        let mut ticker = interval(self.config.interval);
        loop {
            tokio::select! {
                biased;

                _ = shutdown.changed() => {
                    log::info!("settlement worker received shutdown signal");
                    break;
                }

                _ = ticker.tick() => {
                    if let Err(e) = self.run_cycle_inner(Some(&shutdown)).await {
                        log::error!("settlement cycle failed: {}", e);
                    }
                }
            }
        }

        log::info!("settlement worker stopped");
    }

    /// One full settlement cycle. Exposed so tests and operators can drive
    /// settlement on demand.
    pub async fn run_cycle(&self) -> Result<CycleStats, LedgerError> {
        self.run_cycle_inner(None).await
    }

    async fn run_cycle_inner(
        &self,
        shutdown: Option<&watch::Receiver<bool>>,
    ) -> Result<CycleStats, LedgerError> {
        // 1. All pending entries, ordered by account then creation time.
        let pending = self.store.list_all_pending().await?;
        let mut stats = CycleStats { entries_seen: pending.len(), ..Default::default() };
        if pending.is_empty() {
            return Ok(stats);
        }

        // 2. Bounded slices, grouped per account within each slice.
        let batch_size = self.config.batch_size.max(1);
        'cycle: for batch in pending.chunks(batch_size) {
            let mut groups: BTreeMap<&str, Vec<&SubEntry>> = BTreeMap::new();
            for entry in batch {
                groups.entry(entry.account_id.as_str()).or_default().push(entry);
            }

            for (account_id, entries) in groups {
                if shutdown.map(|rx| *rx.borrow()).unwrap_or(false) {
                    log::info!("settlement cycle interrupted by shutdown");
                    break 'cycle;
                }

                // 3. A failing account is logged and skipped; the rest of
                //    the batch continues.
                match self.settle_account(account_id, &entries).await {
                    Ok(SettleOutcome::Settled { .. }) => stats.accounts_settled += 1,
                    Ok(SettleOutcome::BatchRejected { .. }) => stats.accounts_rejected += 1,
                    Err(e) => {
                        stats.accounts_failed += 1;
                        log::error!("failed to settle account {}: {}", account_id, e);
                    }
                }
            }
        }

        // 4. Re-establish the volatile layer from durable truth.
        if self.probe.is_healthy() {
            if let Err(e) = self.consistency.recover_counter_from_store().await {
                log::warn!("post-settlement counter recovery failed: {}", e);
            }
        }

        log::info!(
            "settlement cycle: {} entries, {} accounts settled, {} rejected, {} failed",
            stats.entries_seen,
            stats.accounts_settled,
            stats.accounts_rejected,
            stats.accounts_failed
        );
        Ok(stats)
    }

    async fn settle_account(
        &self,
        account_id: &str,
        entries: &[&SubEntry],
    ) -> Result<SettleOutcome, LedgerError> {
        // Signed fold of the batch: credits add, debits subtract.
        let delta: Decimal =
            entries.iter().map(|e| e.direction.settled_delta(e.amount)).sum();
        let entry_ids: Vec<String> = entries.iter().map(|e| e.id.clone()).collect();

        let outcome = self.store.settle_batch_locked(account_id, &entry_ids, delta).await?;

        match &outcome {
            SettleOutcome::Settled { new_balance } => {
                log::info!(
                    "settled {} entries for account {}: delta={}, balance={}",
                    entry_ids.len(),
                    account_id,
                    delta,
                    new_balance
                );
                // Best effort: the next admission recreates the key and the
                // recovery pass rebuilds it from truth anyway.
                if let Err(e) = self.counter.clear(account_id).await {
                    log::warn!("failed to clear counter for account {}: {}", account_id, e);
                }
            }
            SettleOutcome::BatchRejected { candidate } => {
                log::warn!(
                    "rejected {} entries for account {}: folding delta {} would settle to {}",
                    entry_ids.len(),
                    account_id,
                    delta,
                    candidate
                );
                if let Err(e) = self.counter.subtract(account_id, delta.abs()).await {
                    log::warn!(
                        "failed to drain counter after batch rejection on {}: {}",
                        account_id,
                        e
                    );
                }
            }
        }

        Ok(outcome)
    }
}
