//! Volatile pending counter
//!
//! The fast admission gate: one scalar per account, mutated only through an
//! atomic compare-and-add bounded by a caller-supplied ceiling. Amounts cross
//! the backend as minor units (scaled i64, two fractional digits) so the
//! backend script does integer arithmetic only.

pub mod memory;
pub mod redis;
pub mod traits;

pub use self::memory::MemoryPendingCounter;
pub use self::redis::RedisPendingCounter;
pub use self::traits::{BoundedAdd, PendingCounter};

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;

use crate::models::LedgerError;

/// Scale factor between ledger decimals and counter minor units.
const MINOR_UNITS_PER_UNIT: i64 = 100;

/// Sentinel ceiling for reservations that cannot overdraw (credits).
const CREDIT_CEILING_MINOR: i64 = i64::MAX / 2;

/// Ceiling passed to `add_bounded` for credit reservations.
pub fn credit_ceiling() -> Decimal {
    from_minor(CREDIT_CEILING_MINOR)
}

/// Convert a ledger decimal to counter minor units. Rejects values with more
/// than two fractional digits; balances are fixed-point throughout.
pub fn to_minor(value: Decimal) -> Result<i64, LedgerError> {
    let scaled = value * Decimal::from(MINOR_UNITS_PER_UNIT);
    if scaled.fract() != Decimal::ZERO {
        return Err(LedgerError::InvalidInput(format!(
            "amount has more than two fractional digits: {}",
            value
        )));
    }
    scaled
        .to_i64()
        .ok_or_else(|| LedgerError::InvalidInput(format!("amount out of range: {}", value)))
}

/// Convert counter minor units back to a ledger decimal.
pub fn from_minor(value: i64) -> Decimal {
    Decimal::new(value, 2)
}
