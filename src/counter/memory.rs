//! In-memory pending counter
//!
//! Same semantics as the Redis adapter, under one mutex. Supports outage
//! injection so tests can drive the fallback path and the health probe.

use async_trait::async_trait;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;

use crate::counter::traits::{BoundedAdd, PendingCounter};
use crate::models::LedgerError;

#[derive(Default)]
pub struct MemoryPendingCounter {
    values: Mutex<HashMap<String, Decimal>>,
    available: AtomicBool,
    add_calls: AtomicU64,
}

impl MemoryPendingCounter {
    pub fn new() -> Self {
        Self {
            values: Mutex::new(HashMap::new()),
            available: AtomicBool::new(true),
            add_calls: AtomicU64::new(0),
        }
    }

    /// Simulate the backend going down (`false`) or coming back (`true`).
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Overwrite a key directly, bypassing the bounded-add contract. Test
    /// hook for manufacturing divergence.
    pub fn force_set(&self, account_id: &str, value: Decimal) {
        self.values.lock().unwrap().insert(account_id.to_string(), value);
    }

    /// Raw stored value, `None` when the key is absent.
    pub fn raw(&self, account_id: &str) -> Option<Decimal> {
        self.values.lock().unwrap().get(account_id).copied()
    }

    /// Number of `add_bounded` attempts, including failed ones.
    pub fn add_calls(&self) -> u64 {
        self.add_calls.load(Ordering::SeqCst)
    }

    fn check_available(&self) -> Result<(), LedgerError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(LedgerError::CounterUnavailable("backend offline (injected)".into()))
        }
    }
}

#[async_trait]
impl PendingCounter for MemoryPendingCounter {
    async fn get(&self, account_id: &str) -> Result<Decimal, LedgerError> {
        self.check_available()?;
        Ok(self.raw(account_id).unwrap_or(Decimal::ZERO))
    }

    async fn add_bounded(
        &self,
        account_id: &str,
        delta: Decimal,
        ceiling: Decimal,
    ) -> Result<BoundedAdd, LedgerError> {
        self.add_calls.fetch_add(1, Ordering::SeqCst);
        self.check_available()?;

        let mut values = self.values.lock().unwrap();
        let current = values.get(account_id).copied().unwrap_or(Decimal::ZERO);
        let candidate = current + delta;

        if candidate > ceiling {
            return Ok(BoundedAdd {
                accepted: false,
                new_total: current,
                reason: "overspend".into(),
            });
        }
        if candidate < Decimal::ZERO {
            return Ok(BoundedAdd { accepted: false, new_total: current, reason: "negative".into() });
        }

        values.insert(account_id.to_string(), candidate);
        Ok(BoundedAdd { accepted: true, new_total: candidate, reason: "ok".into() })
    }

    async fn subtract(&self, account_id: &str, amount: Decimal) -> Result<(), LedgerError> {
        self.check_available()?;
        let mut values = self.values.lock().unwrap();
        let current = values.get(account_id).copied().unwrap_or(Decimal::ZERO);
        let next = (current - amount).max(Decimal::ZERO);
        values.insert(account_id.to_string(), next);
        Ok(())
    }

    async fn clear(&self, account_id: &str) -> Result<(), LedgerError> {
        self.check_available()?;
        self.values.lock().unwrap().remove(account_id);
        Ok(())
    }

    async fn ping(&self) -> Result<(), LedgerError> {
        self.check_available()
    }
}
