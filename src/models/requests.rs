//! Wire types for the HTTP surface.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::models::account::SubEntry;

/// Body of `POST /transaction`. The direction arrives as a raw string so the
/// admission path can reject unknown values as invalid input rather than a
/// deserialization failure.
#[derive(Debug, Clone, Deserialize)]
pub struct TransactionRequest {
    pub account_id: String,
    pub amount: Decimal,
    #[serde(rename = "type")]
    pub tx_type: String,
}

/// Response of `POST /transaction`.
#[derive(Debug, Serialize)]
pub struct TransactionResponse {
    pub success: bool,
    pub message: String,
    pub account_id: String,
    pub amount: Decimal,
    #[serde(rename = "type")]
    pub tx_type: String,
    pub status: String,
    pub timestamp: DateTime<Utc>,
}

/// Body of `POST /account`.
#[derive(Debug, Deserialize)]
pub struct CreateAccountRequest {
    pub account_id: String,
    pub balance: Option<Decimal>,
}

#[derive(Debug, Serialize)]
pub struct CreateAccountResponse {
    pub success: bool,
    pub message: String,
    pub account_id: String,
    pub balance: Decimal,
}

/// Response of `GET /balance/{account_id}`.
#[derive(Debug, Serialize)]
pub struct BalanceResponse {
    pub account_id: String,
    pub settled_balance: Decimal,
    pub pending_debit: Decimal,
    pub pending_credit: Decimal,
    pub available_balance: Decimal,
    pub last_updated: DateTime<Utc>,
}

/// Response of `GET /pending/{account_id}`.
#[derive(Debug, Serialize)]
pub struct PendingResponse {
    pub account_id: String,
    pub count: usize,
    pub total: Decimal,
    pub items: Vec<SubEntry>,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub service: String,
    pub version: String,
}

/// Plain error body for validation and lookup failures.
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: String,
}
