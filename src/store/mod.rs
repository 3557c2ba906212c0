pub mod memory;
pub mod postgres;
pub mod traits;

pub use memory::MemoryLedgerStore;
pub use postgres::PostgresLedgerStore;
pub use traits::{AdmitOutcome, LedgerStore, PendingTotals, SettleOutcome};
