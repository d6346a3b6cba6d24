//! Append-only coin ledger backed by SQLite.
//!
//! The `ledger_entries` table is the source of truth for every balance.
//! `wallets.balance` is a cached projection updated in the same
//! transaction as each append, guarded by `CHECK (balance >= 0)`.
//!
//! ## Design
//! - `r2d2` pool over WAL-mode connections: reads run in parallel,
//!   writers serialise on SQLite's lock (`BEGIN IMMEDIATE` + busy timeout)
//! - Uniqueness of `external_reference` is a storage-level constraint, so
//!   two racing appends with the same reference cannot both commit
//! - Triggers reject UPDATE/DELETE on entries and usage records

use super::clock::Clock;
use super::error::BillingError;
use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, Connection, OptionalExtension, Transaction, TransactionBehavior};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// Database file name inside a workspace directory.
pub const DB_FILE_NAME: &str = "wallet.db";

/// How long a writer waits for SQLite's lock before giving up.
const BUSY_TIMEOUT: Duration = Duration::from_secs(10);

/// Row id of a ledger entry.
pub type EntryId = i64;

// ── Entry types ──────────────────────────────────────────────────

/// Whether an entry adds to or removes from a balance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Credit,
    Debit,
}

impl Direction {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Credit => "credit",
            Self::Debit => "debit",
        }
    }

    fn from_db(s: &str) -> Self {
        match s {
            "credit" => Self::Credit,
            _ => Self::Debit,
        }
    }

    /// Signed contribution of `amount` to a balance.
    fn signed(self, amount: i64) -> i64 {
        match self {
            Self::Credit => amount,
            Self::Debit => -amount,
        }
    }
}

/// An immutable, committed ledger entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub id: EntryId,
    pub account_id: String,
    pub direction: Direction,
    /// Always positive.
    pub amount: i64,
    pub description: String,
    /// Payment-gateway reference; unique across all accounts.
    pub external_reference: Option<String>,
    /// Amount paid in the gateway's minor currency unit (e.g. kobo).
    pub external_amount_minor: Option<i64>,
    /// Exchange-rate version used to convert `external_amount_minor`.
    pub rate_version: Option<String>,
    /// Epoch milliseconds.
    pub created_at: i64,
}

/// An entry about to be appended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewEntry {
    pub account_id: String,
    pub direction: Direction,
    pub amount: i64,
    pub description: String,
    pub external_reference: Option<String>,
    pub external_amount_minor: Option<i64>,
    pub rate_version: Option<String>,
}

impl NewEntry {
    pub fn credit(account_id: &str, amount: i64, description: &str) -> Self {
        Self::new(account_id, Direction::Credit, amount, description)
    }

    pub fn debit(account_id: &str, amount: i64, description: &str) -> Self {
        Self::new(account_id, Direction::Debit, amount, description)
    }

    fn new(account_id: &str, direction: Direction, amount: i64, description: &str) -> Self {
        Self {
            account_id: account_id.to_string(),
            direction,
            amount,
            description: description.to_string(),
            external_reference: None,
            external_amount_minor: None,
            rate_version: None,
        }
    }

    pub fn with_reference(mut self, reference: impl Into<String>) -> Self {
        self.external_reference = Some(reference.into());
        self
    }

    pub fn with_external_amount(mut self, amount_minor: i64, rate_version: &str) -> Self {
        self.external_amount_minor = Some(amount_minor);
        self.rate_version = Some(rate_version.to_string());
        self
    }
}

/// Cached wallet balance compared against the entry sum.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BalanceAudit {
    pub cached_balance: i64,
    pub ledger_balance: i64,
}

impl BalanceAudit {
    pub fn is_consistent(&self) -> bool {
        self.cached_balance == self.ledger_balance
    }
}

// ── Incidents ────────────────────────────────────────────────────

/// Category of an operator-visible incident.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IncidentKind {
    /// External operation delivered but the debit failed.
    BillingAnomaly,
    /// Verified payment whose payer matches no account.
    UnmatchedPayment,
    /// Reservation hold released by the stale sweep.
    StaleReservation,
}

impl IncidentKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::BillingAnomaly => "billing_anomaly",
            Self::UnmatchedPayment => "unmatched_payment",
            Self::StaleReservation => "stale_reservation",
        }
    }

    fn from_db(s: &str) -> Self {
        match s {
            "unmatched_payment" => Self::UnmatchedPayment,
            "stale_reservation" => Self::StaleReservation,
            _ => Self::BillingAnomaly,
        }
    }
}

/// A record requiring manual reconciliation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Incident {
    /// Auto-generated; ignored on insert.
    #[serde(default)]
    pub id: i64,
    pub kind: IncidentKind,
    pub account_id: Option<String>,
    pub reference: Option<String>,
    pub amount: Option<i64>,
    pub detail: String,
    #[serde(default)]
    pub created_at: i64,
}

// ── Store ────────────────────────────────────────────────────────

/// SQLite-backed ledger store shared by every billing component.
pub struct LedgerStore {
    pool: Pool<SqliteConnectionManager>,
    clock: Arc<dyn Clock>,
}

impl LedgerStore {
    /// Open (or create) the ledger at `db_path` with up to `pool_size` connections.
    pub fn open(db_path: &Path, pool_size: u32, clock: Arc<dyn Clock>) -> Result<Self, BillingError> {
        let manager = SqliteConnectionManager::file(db_path).with_init(|conn| {
            conn.busy_timeout(BUSY_TIMEOUT)?;
            // WAL mode for concurrent reads + crash safety
            conn.execute_batch(
                "PRAGMA journal_mode = WAL;
                 PRAGMA synchronous = NORMAL;
                 PRAGMA foreign_keys = ON;",
            )
        });
        let pool = Pool::builder()
            .max_size(pool_size.max(1))
            .min_idle(Some(1))
            .build(manager)?;

        let conn = pool.get()?;
        init_schema(&conn)?;
        drop(conn);

        tracing::debug!(path = %db_path.display(), pool_size, "Ledger store opened");
        Ok(Self { pool, clock })
    }

    /// Open `wallet.db` inside a workspace directory.
    pub fn open_in(workspace_dir: &Path, pool_size: u32, clock: Arc<dyn Clock>) -> Result<Self, BillingError> {
        Self::open(&workspace_dir.join(DB_FILE_NAME), pool_size, clock)
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn now_millis(&self) -> i64 {
        self.clock.now_millis()
    }

    /// A pooled connection for read-only queries.
    pub(crate) fn conn(&self) -> Result<PooledConnection<SqliteConnectionManager>, BillingError> {
        Ok(self.pool.get()?)
    }

    /// Run `f` inside one `BEGIN IMMEDIATE` transaction.
    ///
    /// Commits when `f` returns `Ok`; any `Err` rolls everything back.
    pub fn transaction<T, F>(&self, f: F) -> Result<T, BillingError>
    where
        F: FnOnce(&Transaction<'_>) -> Result<T, BillingError>,
    {
        let mut conn = self.pool.get()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let out = f(&tx)?;
        tx.commit()?;
        Ok(out)
    }

    /// Append one entry in its own transaction.
    pub fn append(&self, entry: &NewEntry) -> Result<EntryId, BillingError> {
        self.transaction(|tx| self.append_in(tx, entry))
    }

    /// Append one entry inside the caller's transaction.
    ///
    /// Fails with `DuplicateReference` when the reference is already
    /// recorded, `AccountNotFound` without a wallet, and
    /// `InsufficientBalance` when a debit would drive the wallet negative.
    pub fn append_in(&self, tx: &Transaction<'_>, entry: &NewEntry) -> Result<EntryId, BillingError> {
        if entry.amount <= 0 {
            return Err(BillingError::InvalidAmount(entry.amount));
        }

        let cached = require_wallet_in(tx, &entry.account_id)?;

        let now = self.now_millis();
        let inserted = tx.execute(
            "INSERT INTO ledger_entries
                (account_id, direction, amount, description, external_reference,
                 external_amount_minor, rate_version, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                entry.account_id,
                entry.direction.as_str(),
                entry.amount,
                entry.description,
                entry.external_reference,
                entry.external_amount_minor,
                entry.rate_version,
                now,
            ],
        );
        match inserted {
            Ok(_) => {}
            Err(e) if is_constraint(&e, rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE) => {
                return Err(BillingError::DuplicateReference(
                    entry.external_reference.clone().unwrap_or_default(),
                ));
            }
            Err(e) => return Err(e.into()),
        }
        let id = tx.last_insert_rowid();

        let updated = tx.execute(
            "UPDATE wallets SET balance = balance + ?1, updated_at = ?2 WHERE account_id = ?3",
            params![entry.direction.signed(entry.amount), now, entry.account_id],
        );
        match updated {
            Ok(_) => Ok(id),
            Err(e) if is_constraint(&e, rusqlite::ffi::SQLITE_CONSTRAINT_CHECK) => {
                Err(BillingError::InsufficientBalance {
                    required: entry.amount,
                    available: cached,
                })
            }
            Err(e) => Err(e.into()),
        }
    }

    /// `credits - debits` over every committed entry of the account.
    pub fn sum_balance(&self, account_id: &str) -> Result<i64, BillingError> {
        let conn = self.conn()?;
        sum_balance_in(&conn, account_id)
    }

    /// The entry carrying `reference`, if any.
    pub fn find_by_reference(&self, reference: &str) -> Result<Option<LedgerEntry>, BillingError> {
        let conn = self.conn()?;
        let entry = conn
            .query_row(
                &format!("SELECT {ENTRY_COLUMNS} FROM ledger_entries WHERE external_reference = ?1"),
                params![reference],
                entry_from_row,
            )
            .optional()?;
        Ok(entry)
    }

    /// Most recent entries for an account, newest first.
    pub fn entries(&self, account_id: &str, limit: usize) -> Result<Vec<LedgerEntry>, BillingError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {ENTRY_COLUMNS} FROM ledger_entries
             WHERE account_id = ?1 ORDER BY id DESC LIMIT ?2"
        ))?;
        let entries = stmt
            .query_map(params![account_id, limit as i64], entry_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(entries)
    }

    /// Compare the wallet's cached balance with the entry sum.
    pub fn audit(&self, account_id: &str) -> Result<BalanceAudit, BillingError> {
        let conn = self.conn()?;
        Ok(BalanceAudit {
            cached_balance: require_wallet_in(&conn, account_id)?,
            ledger_balance: sum_balance_in(&conn, account_id)?,
        })
    }

    /// Persist an incident for manual reconciliation.
    pub fn record_incident(&self, incident: &Incident) -> Result<(), BillingError> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO incidents (kind, account_id, reference, amount, detail, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                incident.kind.as_str(),
                incident.account_id,
                incident.reference,
                incident.amount,
                incident.detail,
                self.now_millis(),
            ],
        )?;
        Ok(())
    }

    /// Persist an incident unless one of the same kind already carries its
    /// reference. Returns whether a row was written.
    pub fn record_incident_once(&self, incident: &Incident) -> Result<bool, BillingError> {
        let conn = self.conn()?;
        let inserted = conn.execute(
            "INSERT INTO incidents (kind, account_id, reference, amount, detail, created_at)
             SELECT ?1, ?2, ?3, ?4, ?5, ?6
             WHERE NOT EXISTS (SELECT 1 FROM incidents WHERE kind = ?1 AND reference = ?3)",
            params![
                incident.kind.as_str(),
                incident.account_id,
                incident.reference,
                incident.amount,
                incident.detail,
                self.now_millis(),
            ],
        )?;
        Ok(inserted > 0)
    }

    /// Most recent incidents, newest first.
    pub fn incidents(&self, limit: usize) -> Result<Vec<Incident>, BillingError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, kind, account_id, reference, amount, detail, created_at
             FROM incidents ORDER BY id DESC LIMIT ?1",
        )?;
        let incidents = stmt
            .query_map(params![limit as i64], |row| {
                let kind: String = row.get(1)?;
                Ok(Incident {
                    id: row.get(0)?,
                    kind: IncidentKind::from_db(&kind),
                    account_id: row.get(2)?,
                    reference: row.get(3)?,
                    amount: row.get(4)?,
                    detail: row.get(5)?,
                    created_at: row.get(6)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(incidents)
    }
}

/// The wallet's cached balance, or `AccountNotFound` when it has no wallet.
pub fn require_wallet_in(conn: &Connection, account_id: &str) -> Result<i64, BillingError> {
    let cached: Option<i64> = conn
        .query_row(
            "SELECT balance FROM wallets WHERE account_id = ?1",
            params![account_id],
            |row| row.get(0),
        )
        .optional()?;
    cached.ok_or_else(|| BillingError::AccountNotFound(account_id.to_string()))
}

/// Entry sum on an existing connection or transaction.
pub fn sum_balance_in(conn: &Connection, account_id: &str) -> Result<i64, BillingError> {
    let balance = conn.query_row(
        "SELECT COALESCE(SUM(CASE direction WHEN 'credit' THEN amount ELSE -amount END), 0)
         FROM ledger_entries WHERE account_id = ?1",
        params![account_id],
        |row| row.get(0),
    )?;
    Ok(balance)
}

const ENTRY_COLUMNS: &str = "id, account_id, direction, amount, description, external_reference,
     external_amount_minor, rate_version, created_at";

fn entry_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<LedgerEntry> {
    let direction: String = row.get(2)?;
    Ok(LedgerEntry {
        id: row.get(0)?,
        account_id: row.get(1)?,
        direction: Direction::from_db(&direction),
        amount: row.get(3)?,
        description: row.get(4)?,
        external_reference: row.get(5)?,
        external_amount_minor: row.get(6)?,
        rate_version: row.get(7)?,
        created_at: row.get(8)?,
    })
}

pub(crate) fn is_constraint(err: &rusqlite::Error, extended_code: std::os::raw::c_int) -> bool {
    matches!(err, rusqlite::Error::SqliteFailure(e, _) if e.extended_code == extended_code)
}

fn init_schema(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS accounts (
            id TEXT PRIMARY KEY,
            payer_identity TEXT NOT NULL UNIQUE COLLATE NOCASE,
            daily_limit INTEGER NOT NULL,
            monthly_limit INTEGER NOT NULL,
            created_at INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS wallets (
            account_id TEXT PRIMARY KEY REFERENCES accounts(id),
            balance INTEGER NOT NULL DEFAULT 0 CHECK (balance >= 0),
            updated_at INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS ledger_entries (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            account_id TEXT NOT NULL REFERENCES wallets(account_id),
            direction TEXT NOT NULL CHECK (direction IN ('credit', 'debit')),
            amount INTEGER NOT NULL CHECK (amount > 0),
            description TEXT NOT NULL,
            external_reference TEXT UNIQUE,
            external_amount_minor INTEGER,
            rate_version TEXT,
            created_at INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_entries_account ON ledger_entries(account_id, id);

        CREATE TRIGGER IF NOT EXISTS ledger_entries_no_update
        BEFORE UPDATE ON ledger_entries
        BEGIN SELECT RAISE(ABORT, 'ledger entries are immutable'); END;
        CREATE TRIGGER IF NOT EXISTS ledger_entries_no_delete
        BEFORE DELETE ON ledger_entries
        BEGIN SELECT RAISE(ABORT, 'ledger entries are immutable'); END;

        CREATE TABLE IF NOT EXISTS usage_records (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            account_id TEXT NOT NULL REFERENCES accounts(id),
            action TEXT NOT NULL,
            coins_charged INTEGER NOT NULL,
            entry_id INTEGER NOT NULL REFERENCES ledger_entries(id),
            created_at INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_usage_account_time ON usage_records(account_id, created_at);

        CREATE TRIGGER IF NOT EXISTS usage_records_no_update
        BEFORE UPDATE ON usage_records
        BEGIN SELECT RAISE(ABORT, 'usage records are immutable'); END;
        CREATE TRIGGER IF NOT EXISTS usage_records_no_delete
        BEFORE DELETE ON usage_records
        BEGIN SELECT RAISE(ABORT, 'usage records are immutable'); END;

        CREATE TABLE IF NOT EXISTS reservations (
            id TEXT PRIMARY KEY,
            account_id TEXT NOT NULL REFERENCES accounts(id),
            action TEXT NOT NULL,
            amount INTEGER NOT NULL,
            hold_entry_id INTEGER NOT NULL REFERENCES ledger_entries(id),
            status TEXT NOT NULL DEFAULT 'pending',
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_reservations_status ON reservations(status, created_at);
        CREATE INDEX IF NOT EXISTS idx_reservations_account ON reservations(account_id, status);

        CREATE TABLE IF NOT EXISTS incidents (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            kind TEXT NOT NULL,
            account_id TEXT,
            reference TEXT,
            amount INTEGER,
            detail TEXT NOT NULL,
            created_at INTEGER NOT NULL
        );",
    )
}
