//! Core ledger types: account rows, sub-entries, and their state machine.
//!
//! An `Account` carries the settled balance plus projections of pending
//! intent; a `SubEntry` is one admitted transaction that settles later.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Transaction direction. Debits reduce the settled balance at settlement,
/// credits increase it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Debit,
    Credit,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Debit => "debit",
            Direction::Credit => "credit",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "debit" => Some(Direction::Debit),
            "credit" => Some(Direction::Credit),
            _ => None,
        }
    }

    /// Signed contribution of `amount` to the settled balance at settlement.
    pub fn settled_delta(&self, amount: Decimal) -> Decimal {
        match self {
            Direction::Debit => -amount,
            Direction::Credit => amount,
        }
    }

    /// Signed contribution of `amount` to the pending counter
    /// (pending debits minus pending credits).
    pub fn counter_delta(&self, amount: Decimal) -> Decimal {
        match self {
            Direction::Debit => amount,
            Direction::Credit => -amount,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Sub-entry lifecycle states.
///
/// Entries start `Pending` and end in exactly one of the terminal states;
/// there is no way back out of a terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryStatus {
    Pending,
    Settled,
    Rejected,
}

impl EntryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryStatus::Pending => "pending",
            EntryStatus::Settled => "settled",
            EntryStatus::Rejected => "rejected",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(EntryStatus::Pending),
            "settled" => Some(EntryStatus::Settled),
            "rejected" => Some(EntryStatus::Rejected),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, EntryStatus::Settled | EntryStatus::Rejected)
    }

    /// Valid transitions: `pending -> settled` and `pending -> rejected`.
    pub fn can_transition_to(&self, next: EntryStatus) -> bool {
        matches!(self, EntryStatus::Pending) && next.is_terminal()
    }
}

impl fmt::Display for EntryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Durable account row. `settled_balance` is the authoritative balance;
/// `pending_debit` / `pending_credit` reflect intent acknowledged on the
/// row-lock fallback path and are zeroed at each settlement.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    pub id: String,
    pub settled_balance: Decimal,
    pub pending_debit: Decimal,
    pub pending_credit: Decimal,
    /// Stored projection of `available()`; recomputable at any time.
    pub available_balance: Decimal,
    /// Bumped on every write; optimistic updates compare against it.
    pub version: i64,
    pub last_settlement_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Account {
    pub fn new(id: impl Into<String>, initial_balance: Decimal) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            settled_balance: initial_balance,
            pending_debit: Decimal::ZERO,
            pending_credit: Decimal::ZERO,
            available_balance: initial_balance,
            version: 1,
            last_settlement_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Available balance derived from the durable fields:
    /// `settled + pending_credit - pending_debit`.
    pub fn available(&self) -> Decimal {
        self.settled_balance + self.pending_credit - self.pending_debit
    }

    /// Recompute the stored projection from the durable fields.
    pub fn refresh_projection(&mut self) {
        self.available_balance = self.available();
    }
}

/// One admitted transaction, waiting to be folded into the settled balance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubEntry {
    pub id: String,
    pub account_id: String,
    pub amount: Decimal,
    pub direction: Direction,
    pub status: EntryStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SubEntry {
    /// Fresh pending entry with a generated id.
    pub fn new_pending(account_id: impl Into<String>, amount: Decimal, direction: Direction) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            account_id: account_id.into(),
            amount,
            direction,
            status: EntryStatus::Pending,
            created_at: now,
            updated_at: now,
        }
    }
}
