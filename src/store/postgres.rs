//! Postgres ledger store
//!
//! One `tokio_postgres` client behind an async mutex; the connection driver
//! runs on its own task. The transactional composites open an explicit
//! transaction and take the account row lock with `SELECT ... FOR UPDATE`.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_postgres::{Client, NoTls, Row, Transaction};

use crate::models::{Account, Direction, EntryStatus, LedgerError, SubEntry};
use crate::store::traits::{AdmitOutcome, LedgerStore, PendingTotals, SettleOutcome};

const ACCOUNT_COLUMNS: &str = "id, settled_balance, pending_debit, pending_credit, \
     available_balance, version, last_settlement_at, created_at, updated_at";

const ENTRY_COLUMNS: &str = "id, account_id, amount, direction, status, created_at, updated_at";

const SCHEMA_SQL: &str = "
    CREATE TABLE IF NOT EXISTS accounts (
        id                 TEXT PRIMARY KEY,
        settled_balance    NUMERIC(20,2) NOT NULL,
        pending_debit      NUMERIC(20,2) NOT NULL DEFAULT 0,
        pending_credit     NUMERIC(20,2) NOT NULL DEFAULT 0,
        available_balance  NUMERIC(20,2) NOT NULL,
        version            BIGINT NOT NULL DEFAULT 1,
        last_settlement_at TIMESTAMPTZ,
        created_at         TIMESTAMPTZ NOT NULL,
        updated_at         TIMESTAMPTZ NOT NULL
    );

    CREATE TABLE IF NOT EXISTS sub_entries (
        id         TEXT PRIMARY KEY,
        account_id TEXT NOT NULL REFERENCES accounts(id),
        amount     NUMERIC(20,2) NOT NULL,
        direction  TEXT NOT NULL,
        status     TEXT NOT NULL,
        created_at TIMESTAMPTZ NOT NULL,
        updated_at TIMESTAMPTZ NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_sub_entries_account_status
        ON sub_entries (account_id, status, created_at);
    CREATE INDEX IF NOT EXISTS idx_sub_entries_status_account
        ON sub_entries (status, account_id, created_at);
";

pub struct PostgresLedgerStore {
    client: Arc<Mutex<Client>>,
}

impl PostgresLedgerStore {
    pub async fn connect(database_url: &str) -> Result<Self> {
        let (client, connection) =
            tokio_postgres::connect(database_url, NoTls).await.context("connect to postgres")?;

        tokio::spawn(async move {
            if let Err(e) = connection.await {
                log::error!("postgres connection error: {}", e);
            }
        });

        Ok(Self { client: Arc::new(Mutex::new(client)) })
    }

    /// Create the two tables and their composite indexes if absent.
    pub async fn ensure_schema(&self) -> Result<()> {
        let client = self.client.lock().await;
        client.batch_execute(SCHEMA_SQL).await.context("create ledger schema")?;
        Ok(())
    }
}

fn io(e: tokio_postgres::Error) -> LedgerError {
    LedgerError::Io(e.to_string())
}

fn account_from_row(row: &Row) -> Result<Account, LedgerError> {
    Ok(Account {
        id: row.try_get(0).map_err(io)?,
        settled_balance: row.try_get(1).map_err(io)?,
        pending_debit: row.try_get(2).map_err(io)?,
        pending_credit: row.try_get(3).map_err(io)?,
        available_balance: row.try_get(4).map_err(io)?,
        version: row.try_get(5).map_err(io)?,
        last_settlement_at: row.try_get(6).map_err(io)?,
        created_at: row.try_get(7).map_err(io)?,
        updated_at: row.try_get(8).map_err(io)?,
    })
}

fn entry_from_row(row: &Row) -> Result<SubEntry, LedgerError> {
    let direction: String = row.try_get(3).map_err(io)?;
    let status: String = row.try_get(4).map_err(io)?;
    Ok(SubEntry {
        id: row.try_get(0).map_err(io)?,
        account_id: row.try_get(1).map_err(io)?,
        amount: row.try_get(2).map_err(io)?,
        direction: Direction::from_str(&direction)
            .ok_or_else(|| LedgerError::Io(format!("unknown direction in row: {}", direction)))?,
        status: EntryStatus::from_str(&status)
            .ok_or_else(|| LedgerError::Io(format!("unknown status in row: {}", status)))?,
        created_at: row.try_get(5).map_err(io)?,
        updated_at: row.try_get(6).map_err(io)?,
    })
}

/// Signed pending sums for one account inside an open transaction, so the
/// composites read truth under the row lock they already hold.
async fn totals_in_tx(tx: &Transaction<'_>, account_id: &str) -> Result<PendingTotals, LedgerError> {
    let row = tx
        .query_one(
            "SELECT \
                 COALESCE(SUM(CASE WHEN direction = 'debit' THEN amount ELSE 0 END), 0)::numeric(20,2), \
                 COALESCE(SUM(CASE WHEN direction = 'credit' THEN amount ELSE 0 END), 0)::numeric(20,2) \
             FROM sub_entries WHERE account_id = $1 AND status = 'pending'",
            &[&account_id],
        )
        .await
        .map_err(io)?;
    Ok(PendingTotals { debit: row.try_get(0).map_err(io)?, credit: row.try_get(1).map_err(io)? })
}

async fn insert_entry_in_tx(tx: &Transaction<'_>, entry: &SubEntry) -> Result<(), LedgerError> {
    tx.execute(
        "INSERT INTO sub_entries (id, account_id, amount, direction, status, created_at, updated_at) \
         VALUES ($1, $2, $3, $4, $5, $6, $7)",
        &[
            &entry.id,
            &entry.account_id,
            &entry.amount,
            &entry.direction.as_str(),
            &entry.status.as_str(),
            &entry.created_at,
            &entry.updated_at,
        ],
    )
    .await
    .map_err(io)?;
    Ok(())
}

#[async_trait]
impl LedgerStore for PostgresLedgerStore {
    async fn create_account(&self, account: Account) -> Result<(), LedgerError> {
        let client = self.client.lock().await;
        let inserted = client
            .execute(
                "INSERT INTO accounts (id, settled_balance, pending_debit, pending_credit, \
                     available_balance, version, last_settlement_at, created_at, updated_at) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9) \
                 ON CONFLICT (id) DO NOTHING",
                &[
                    &account.id,
                    &account.settled_balance,
                    &account.pending_debit,
                    &account.pending_credit,
                    &account.available_balance,
                    &account.version,
                    &account.last_settlement_at,
                    &account.created_at,
                    &account.updated_at,
                ],
            )
            .await
            .map_err(io)?;

        if inserted == 0 {
            return Err(LedgerError::InvalidInput(format!(
                "account already exists: {}",
                account.id
            )));
        }
        Ok(())
    }

    async fn get_account(&self, id: &str) -> Result<Option<Account>, LedgerError> {
        let client = self.client.lock().await;
        let row = client
            .query_opt(
                &format!("SELECT {} FROM accounts WHERE id = $1", ACCOUNT_COLUMNS),
                &[&id],
            )
            .await
            .map_err(io)?;
        row.map(|r| account_from_row(&r)).transpose()
    }

    async fn update_account(&self, account: &Account) -> Result<(), LedgerError> {
        let available = account.available();
        let client = self.client.lock().await;
        let updated = client
            .execute(
                "UPDATE accounts SET settled_balance = $2, pending_debit = $3, \
                     pending_credit = $4, available_balance = $5, version = version + 1, \
                     last_settlement_at = $6, updated_at = $7 \
                 WHERE id = $1 AND version = $8",
                &[
                    &account.id,
                    &account.settled_balance,
                    &account.pending_debit,
                    &account.pending_credit,
                    &available,
                    &account.last_settlement_at,
                    &Utc::now(),
                    &account.version,
                ],
            )
            .await
            .map_err(io)?;

        if updated == 0 {
            return Err(LedgerError::ConcurrentUpdate { account_id: account.id.clone() });
        }
        Ok(())
    }

    async fn create_sub_entry(&self, entry: &SubEntry) -> Result<(), LedgerError> {
        let client = self.client.lock().await;
        client
            .execute(
                "INSERT INTO sub_entries (id, account_id, amount, direction, status, \
                     created_at, updated_at) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7)",
                &[
                    &entry.id,
                    &entry.account_id,
                    &entry.amount,
                    &entry.direction.as_str(),
                    &entry.status.as_str(),
                    &entry.created_at,
                    &entry.updated_at,
                ],
            )
            .await
            .map_err(io)?;
        Ok(())
    }

    async fn list_pending_for_account(&self, account_id: &str) -> Result<Vec<SubEntry>, LedgerError> {
        let client = self.client.lock().await;
        let rows = client
            .query(
                &format!(
                    "SELECT {} FROM sub_entries \
                     WHERE account_id = $1 AND status = 'pending' \
                     ORDER BY created_at, id",
                    ENTRY_COLUMNS
                ),
                &[&account_id],
            )
            .await
            .map_err(io)?;
        rows.iter().map(entry_from_row).collect()
    }

    async fn list_all_pending(&self) -> Result<Vec<SubEntry>, LedgerError> {
        let client = self.client.lock().await;
        let rows = client
            .query(
                &format!(
                    "SELECT {} FROM sub_entries WHERE status = 'pending' \
                     ORDER BY account_id, created_at, id",
                    ENTRY_COLUMNS
                ),
                &[],
            )
            .await
            .map_err(io)?;
        rows.iter().map(entry_from_row).collect()
    }

    async fn update_sub_entries_status(
        &self,
        ids: &[String],
        status: EntryStatus,
    ) -> Result<(), LedgerError> {
        let client = self.client.lock().await;
        client
            .execute(
                "UPDATE sub_entries SET status = $1, updated_at = $2 \
                 WHERE id = ANY($3) AND status = 'pending'",
                &[&status.as_str(), &Utc::now(), &ids],
            )
            .await
            .map_err(io)?;
        Ok(())
    }

    async fn pending_totals(&self, account_id: &str) -> Result<PendingTotals, LedgerError> {
        let client = self.client.lock().await;
        let row = client
            .query_one(
                "SELECT \
                     COALESCE(SUM(CASE WHEN direction = 'debit' THEN amount ELSE 0 END), 0)::numeric(20,2), \
                     COALESCE(SUM(CASE WHEN direction = 'credit' THEN amount ELSE 0 END), 0)::numeric(20,2) \
                 FROM sub_entries WHERE account_id = $1 AND status = 'pending'",
                &[&account_id],
            )
            .await
            .map_err(io)?;
        Ok(PendingTotals {
            debit: row.try_get(0).map_err(io)?,
            credit: row.try_get(1).map_err(io)?,
        })
    }

    async fn list_accounts(&self) -> Result<Vec<Account>, LedgerError> {
        let client = self.client.lock().await;
        let rows = client
            .query(&format!("SELECT {} FROM accounts ORDER BY id", ACCOUNT_COLUMNS), &[])
            .await
            .map_err(io)?;
        rows.iter().map(account_from_row).collect()
    }

    async fn list_account_ids(&self) -> Result<Vec<String>, LedgerError> {
        let client = self.client.lock().await;
        let rows = client.query("SELECT id FROM accounts ORDER BY id", &[]).await.map_err(io)?;
        rows.iter().map(|r| r.try_get(0).map_err(io)).collect()
    }

    async fn admit_pending_locked(&self, entry: SubEntry) -> Result<AdmitOutcome, LedgerError> {
        let mut client = self.client.lock().await;
        let tx = client.transaction().await.map_err(io)?;

        let row = tx
            .query_opt(
                &format!("SELECT {} FROM accounts WHERE id = $1 FOR UPDATE", ACCOUNT_COLUMNS),
                &[&entry.account_id],
            )
            .await
            .map_err(io)?;
        // Dropping the transaction rolls back; nothing has been written yet.
        let account = match row {
            Some(row) => account_from_row(&row)?,
            None => return Ok(AdmitOutcome::NotFound),
        };

        let totals = totals_in_tx(&tx, &entry.account_id).await?;
        let true_available = account.settled_balance + totals.credit - totals.debit;

        if entry.direction == Direction::Debit && entry.amount > true_available {
            return Ok(AdmitOutcome::InsufficientFunds { available: true_available });
        }

        insert_entry_in_tx(&tx, &entry).await?;

        let (pending_debit, pending_credit) = match entry.direction {
            Direction::Debit => (account.pending_debit + entry.amount, account.pending_credit),
            Direction::Credit => (account.pending_debit, account.pending_credit + entry.amount),
        };
        let available = account.settled_balance + pending_credit - pending_debit;
        tx.execute(
            "UPDATE accounts SET pending_debit = $2, pending_credit = $3, \
                 available_balance = $4, version = version + 1, updated_at = $5 \
             WHERE id = $1",
            &[&entry.account_id, &pending_debit, &pending_credit, &available, &Utc::now()],
        )
        .await
        .map_err(io)?;

        tx.commit().await.map_err(io)?;
        Ok(AdmitOutcome::Admitted)
    }

    async fn settle_batch_locked(
        &self,
        account_id: &str,
        entry_ids: &[String],
        delta: Decimal,
    ) -> Result<SettleOutcome, LedgerError> {
        let mut client = self.client.lock().await;
        let tx = client.transaction().await.map_err(io)?;

        let row = tx
            .query_opt(
                &format!("SELECT {} FROM accounts WHERE id = $1 FOR UPDATE", ACCOUNT_COLUMNS),
                &[&account_id],
            )
            .await
            .map_err(io)?;
        let account = match row {
            Some(row) => account_from_row(&row)?,
            None => return Err(LedgerError::NotFound(account_id.to_string())),
        };

        let candidate = account.settled_balance + delta;
        let now = Utc::now();

        if candidate < Decimal::ZERO {
            tx.execute(
                "UPDATE sub_entries SET status = 'rejected', updated_at = $1 \
                 WHERE id = ANY($2) AND status = 'pending'",
                &[&now, &entry_ids],
            )
            .await
            .map_err(io)?;
            tx.execute(
                "UPDATE accounts SET pending_debit = 0, pending_credit = 0, \
                     available_balance = settled_balance, version = version + 1, updated_at = $2 \
                 WHERE id = $1",
                &[&account_id, &now],
            )
            .await
            .map_err(io)?;
            tx.commit().await.map_err(io)?;
            return Ok(SettleOutcome::BatchRejected { candidate });
        }

        tx.execute(
            "UPDATE sub_entries SET status = 'settled', updated_at = $1 \
             WHERE id = ANY($2) AND status = 'pending'",
            &[&now, &entry_ids],
        )
        .await
        .map_err(io)?;
        tx.execute(
            "UPDATE accounts SET settled_balance = $2, pending_debit = 0, pending_credit = 0, \
                 available_balance = $2, version = version + 1, \
                 last_settlement_at = $3, updated_at = $3 \
             WHERE id = $1",
            &[&account_id, &candidate, &now],
        )
        .await
        .map_err(io)?;

        tx.commit().await.map_err(io)?;
        Ok(SettleOutcome::Settled { new_balance: candidate })
    }
}
