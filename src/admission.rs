//! Admission path
//!
//! Per-request decision: accept (create a pending sub-entry) or reject.
//! The fast path reserves headroom through the atomic counter without
//! touching the account row; the fallback path takes the row lock when the
//! counter is unhealthy, the breaker is open, or the backend errored.

use rust_decimal::Decimal;
use std::sync::Arc;

use crate::breaker::CircuitBreaker;
use crate::counter::{self, PendingCounter};
use crate::health::CounterHealthProbe;
use crate::models::{
    Account, BalanceResponse, Direction, LedgerError, PendingResponse, SubEntry,
    TransactionRequest,
};
use crate::store::{AdmitOutcome, LedgerStore};

/// Which route served an admission. Surfaces in the response message for
/// observability; clients are not expected to branch on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmissionPath {
    Counter,
    RowLock,
}

impl AdmissionPath {
    pub fn as_str(&self) -> &'static str {
        match self {
            AdmissionPath::Counter => "counter",
            AdmissionPath::RowLock => "row-lock",
        }
    }
}

/// Tagged admission outcome.
#[derive(Debug, Clone)]
pub enum Admission {
    Accepted {
        account_id: String,
        amount: Decimal,
        direction: Direction,
        entry_id: String,
        path: AdmissionPath,
    },
    Rejected {
        account_id: String,
        amount: Decimal,
        direction: Direction,
        reason: String,
    },
}

pub struct AdmissionService {
    store: Arc<dyn LedgerStore>,
    counter: Arc<dyn PendingCounter>,
    probe: Arc<CounterHealthProbe>,
    breaker: Arc<CircuitBreaker>,
}

impl AdmissionService {
    pub fn new(
        store: Arc<dyn LedgerStore>,
        counter: Arc<dyn PendingCounter>,
        probe: Arc<CounterHealthProbe>,
        breaker: Arc<CircuitBreaker>,
    ) -> Self {
        Self { store, counter, probe, breaker }
    }

    pub async fn process(&self, req: &TransactionRequest) -> Result<Admission, LedgerError> {
        let direction = Direction::from_str(&req.tx_type).ok_or_else(|| {
            LedgerError::InvalidInput(format!("unknown transaction type: {}", req.tx_type))
        })?;
        if req.amount <= Decimal::ZERO {
            return Err(LedgerError::InvalidInput("amount must be greater than zero".into()));
        }
        // Precision guard up front so the counter conversion cannot fail
        // after a reservation is already placed.
        counter::to_minor(req.amount)?;

        if self.probe.is_healthy() {
            match self.process_fast_path(&req.account_id, req.amount, direction).await {
                Ok(admission) => return Ok(admission),
                Err(e) if e.is_retryable() => {
                    log::warn!(
                        "fast path unavailable for account {} ({}), taking row-lock fallback",
                        req.account_id,
                        e
                    );
                }
                Err(e) => return Err(e),
            }
        }

        self.process_fallback(&req.account_id, req.amount, direction).await
    }

    async fn process_fast_path(
        &self,
        account_id: &str,
        amount: Decimal,
        direction: Direction,
    ) -> Result<Admission, LedgerError> {
        // 1. Account snapshot, no lock.
        let account = self
            .store
            .get_account(account_id)
            .await?
            .ok_or_else(|| LedgerError::NotFound(account_id.to_string()))?;
        let available = account.available();

        // 2. Advisory pre-check: spares the backend round trip on hopeless
        //    debits. The atomic reservation below is the actual gate.
        if direction == Direction::Debit {
            if let Ok(counter_value) = self.counter.get(account_id).await {
                let remaining = available - counter_value;
                if remaining < amount {
                    return Ok(rejected(account_id, amount, direction, remaining));
                }
            }
        }

        // 3. Atomic reservation through the breaker. Any backend error here
        //    bubbles up as retryable and sends the caller to the fallback.
        let delta = direction.counter_delta(amount);
        let ceiling = match direction {
            Direction::Debit => available,
            Direction::Credit => counter::credit_ceiling(),
        };
        let reservation =
            self.breaker.call(self.counter.add_bounded(account_id, delta, ceiling)).await?;

        if !reservation.accepted {
            if direction == Direction::Credit && reservation.rejected_negative() {
                // Pending credits outrun pending debits; the counter floors
                // at zero instead of going negative, and repair re-syncs it
                // from sub-entry truth.
                self.counter.subtract(account_id, amount).await?;
            } else {
                // new_total is the unchanged counter value on rejection.
                return Ok(rejected(account_id, amount, direction, available - reservation.new_total));
            }
        }

        // 4. Durable insert, spawned so a dropped request future cannot
        //    abandon the reservation between the two writes: the insert and
        //    its compensation run to completion either way.
        let entry = SubEntry::new_pending(account_id, amount, direction);
        let insert = {
            let store = self.store.clone();
            let cnt = self.counter.clone();
            let entry = entry.clone();
            tokio::spawn(async move {
                match store.create_sub_entry(&entry).await {
                    Ok(()) => Ok(()),
                    Err(e) => {
                        log::error!(
                            "sub-entry insert failed after reservation on {}: {}",
                            entry.account_id,
                            e
                        );
                        rollback_reservation(cnt.as_ref(), &entry).await;
                        Err(e)
                    }
                }
            })
        };
        insert.await.map_err(|e| LedgerError::Io(format!("admission task failed: {}", e)))??;

        Ok(Admission::Accepted {
            account_id: account_id.to_string(),
            amount,
            direction,
            entry_id: entry.id,
            path: AdmissionPath::Counter,
        })
    }

    async fn process_fallback(
        &self,
        account_id: &str,
        amount: Decimal,
        direction: Direction,
    ) -> Result<Admission, LedgerError> {
        let entry = SubEntry::new_pending(account_id, amount, direction);
        let entry_id = entry.id.clone();

        match self.store.admit_pending_locked(entry).await? {
            AdmitOutcome::Admitted => Ok(Admission::Accepted {
                account_id: account_id.to_string(),
                amount,
                direction,
                entry_id,
                path: AdmissionPath::RowLock,
            }),
            AdmitOutcome::InsufficientFunds { available } => {
                Ok(rejected(account_id, amount, direction, available))
            }
            AdmitOutcome::NotFound => Err(LedgerError::NotFound(account_id.to_string())),
        }
    }

    /// Query path: projected row fields at the moment of read. Eventually
    /// consistent — in-flight fast-path reservations are not included.
    pub async fn get_balance(&self, account_id: &str) -> Result<BalanceResponse, LedgerError> {
        let account = self
            .store
            .get_account(account_id)
            .await?
            .ok_or_else(|| LedgerError::NotFound(account_id.to_string()))?;

        Ok(BalanceResponse {
            account_id: account.id,
            settled_balance: account.settled_balance,
            pending_debit: account.pending_debit,
            pending_credit: account.pending_credit,
            available_balance: account.available_balance,
            last_updated: account.updated_at,
        })
    }

    /// Query path: pending sub-entries for the account and their sum.
    pub async fn get_pending(&self, account_id: &str) -> Result<PendingResponse, LedgerError> {
        if self.store.get_account(account_id).await?.is_none() {
            return Err(LedgerError::NotFound(account_id.to_string()));
        }

        let items = self.store.list_pending_for_account(account_id).await?;
        let total: Decimal = items.iter().map(|e| e.amount).sum();
        Ok(PendingResponse { account_id: account_id.to_string(), count: items.len(), total, items })
    }

    /// Account bootstrap. Duplicate ids are rejected by the store.
    pub async fn create_account(
        &self,
        account_id: &str,
        initial_balance: Decimal,
    ) -> Result<Account, LedgerError> {
        if account_id.trim().is_empty() {
            return Err(LedgerError::InvalidInput("account_id is required".into()));
        }
        if initial_balance < Decimal::ZERO {
            return Err(LedgerError::InvalidInput("initial balance cannot be negative".into()));
        }
        counter::to_minor(initial_balance)?;

        let account = Account::new(account_id, initial_balance);
        self.store.create_account(account.clone()).await?;
        log::info!("created account {} with initial balance {}", account_id, initial_balance);
        Ok(account)
    }
}

fn rejected(account_id: &str, amount: Decimal, direction: Direction, available: Decimal) -> Admission {
    let reason = LedgerError::InsufficientFunds { available, requested: amount };
    Admission::Rejected {
        account_id: account_id.to_string(),
        amount,
        direction,
        reason: reason.to_string(),
    }
}

/// Undo a fast-path reservation after the durable insert failed. Best
/// effort: a failure here is logged and left to the consistency engine.
async fn rollback_reservation(cnt: &dyn PendingCounter, entry: &SubEntry) {
    let result = match entry.direction {
        Direction::Debit => cnt.subtract(&entry.account_id, entry.amount).await,
        Direction::Credit => cnt
            .add_bounded(&entry.account_id, entry.amount, counter::credit_ceiling())
            .await
            .map(|_| ()),
    };
    if let Err(e) = result {
        log::warn!(
            "counter rollback failed for account {}: {} (repair will resync)",
            entry.account_id,
            e
        );
    }
}
