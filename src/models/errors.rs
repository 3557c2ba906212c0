// Error taxonomy for the sub-ledger core.
use rust_decimal::Decimal;
use std::fmt;

#[derive(Debug, Clone)]
pub enum LedgerError {
    /// Unknown account id on query or admission.
    NotFound(String),

    /// Non-positive amount, unknown direction, bad precision.
    InvalidInput(String),

    /// Fast-path ceiling rejected or fallback computed an overdraft.
    InsufficientFunds { available: Decimal, requested: Decimal },

    /// Counter backend error; internal signal that triggers the fallback path.
    CounterUnavailable(String),

    /// Circuit breaker refused the call without touching the backend.
    BreakerOpen,

    /// Optimistic version mismatch without a held row lock.
    ConcurrentUpdate { account_id: String },

    /// Durable store failure.
    Io(String),
}

impl fmt::Display for LedgerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound(id) => write!(f, "account not found: {}", id),
            Self::InvalidInput(msg) => write!(f, "invalid input: {}", msg),
            Self::InsufficientFunds { available, requested } => {
                write!(f, "insufficient funds: available {}, requested {}", available, requested)
            }
            Self::CounterUnavailable(msg) => write!(f, "counter unavailable: {}", msg),
            Self::BreakerOpen => write!(f, "circuit breaker is open"),
            Self::ConcurrentUpdate { account_id } => {
                write!(f, "concurrent update on account {}", account_id)
            }
            Self::Io(msg) => write!(f, "storage error: {}", msg),
        }
    }
}

impl std::error::Error for LedgerError {}

impl LedgerError {
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "NOT_FOUND",
            Self::InvalidInput(_) => "INVALID_INPUT",
            Self::InsufficientFunds { .. } => "INSUFFICIENT_FUNDS",
            Self::CounterUnavailable(_) => "COUNTER_UNAVAILABLE",
            Self::BreakerOpen => "BREAKER_OPEN",
            Self::ConcurrentUpdate { .. } => "CONCURRENT_UPDATE",
            Self::Io(_) => "STORAGE_ERROR",
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::CounterUnavailable(_) | Self::BreakerOpen | Self::ConcurrentUpdate { .. }
        )
    }

    pub fn is_user_error(&self) -> bool {
        matches!(
            self,
            Self::NotFound(_) | Self::InvalidInput(_) | Self::InsufficientFunds { .. }
        )
    }
}
