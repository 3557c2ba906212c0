use async_trait::async_trait;
use rust_decimal::Decimal;

use crate::models::LedgerError;

/// Result of an atomic bounded add.
#[derive(Debug, Clone, PartialEq)]
pub struct BoundedAdd {
    pub accepted: bool,
    /// Counter value after the call: the new total when accepted, the
    /// unchanged current value when not.
    pub new_total: Decimal,
    /// Backend reason: "ok", "overspend" or "negative".
    pub reason: String,
}

impl BoundedAdd {
    pub fn rejected_negative(&self) -> bool {
        !self.accepted && self.reason == "negative"
    }
}

/// Keyed volatile counter with an atomic compare-and-add primitive.
///
/// All operations may fail with `CounterUnavailable`; callers treat that as
/// a signal to take the row-lock fallback, never as a business failure. The
/// check-and-set in `add_bounded` executes atomically on the backend — it is
/// never decomposed into a client-side get/check/set.
#[async_trait]
pub trait PendingCounter: Send + Sync {
    /// Current value for the account; an absent key reads as zero.
    async fn get(&self, account_id: &str) -> Result<Decimal, LedgerError>;

    /// Atomically add `delta` if the result stays within `[0, ceiling]`,
    /// refreshing the key TTL on success.
    async fn add_bounded(
        &self,
        account_id: &str,
        delta: Decimal,
        ceiling: Decimal,
    ) -> Result<BoundedAdd, LedgerError>;

    /// Atomically subtract `amount`, flooring at zero. Used to roll back a
    /// reservation after a failed durable insert and to drain rejected
    /// settlement batches.
    async fn subtract(&self, account_id: &str, amount: Decimal) -> Result<(), LedgerError>;

    /// Delete the key for the account.
    async fn clear(&self, account_id: &str) -> Result<(), LedgerError>;

    /// Lightweight liveness check of the backend.
    async fn ping(&self) -> Result<(), LedgerError>;
}
