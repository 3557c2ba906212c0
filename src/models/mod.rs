pub mod account;
pub mod errors;
pub mod requests;

pub use account::{Account, Direction, EntryStatus, SubEntry};
pub use errors::LedgerError;
pub use requests::{
    BalanceResponse, CreateAccountRequest, CreateAccountResponse, ErrorBody, HealthResponse,
    PendingResponse, TransactionRequest, TransactionResponse,
};
