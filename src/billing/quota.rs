//! Per-account quota enforcement for metered operations.
//!
//! Counts usage records inside the current calendar day and month and
//! compares them with the account's limits. Limits count operations, not
//! coins.

use super::clock::WindowZone;
use super::error::BillingError;
use super::ledger::{EntryId, LedgerStore};
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Default operations allowed per calendar day.
pub const DEFAULT_DAILY_LIMIT: u32 = 20;

/// Default operations allowed per calendar month.
pub const DEFAULT_MONTHLY_LIMIT: u32 = 300;

/// Daily and monthly operation limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaLimits {
    pub daily: u32,
    pub monthly: u32,
}

impl Default for QuotaLimits {
    fn default() -> Self {
        Self {
            daily: DEFAULT_DAILY_LIMIT,
            monthly: DEFAULT_MONTHLY_LIMIT,
        }
    }
}

/// Result of a quota check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Allowance {
    Allowed,
    DailyExceeded { used: u32, limit: u32 },
    MonthlyExceeded { used: u32, limit: u32 },
}

impl Allowance {
    pub fn is_allowed(self) -> bool {
        self == Self::Allowed
    }

    /// Map an exceeded window to its rejection.
    pub fn into_result(self) -> Result<(), BillingError> {
        match self {
            Self::Allowed => Ok(()),
            Self::DailyExceeded { used, limit } => Err(BillingError::DailyLimitExceeded { limit, used }),
            Self::MonthlyExceeded { used, limit } => {
                Err(BillingError::MonthlyLimitExceeded { limit, used })
            }
        }
    }
}

/// One billed metered operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageRecord {
    pub id: i64,
    pub account_id: String,
    pub action: String,
    pub coins_charged: i64,
    pub entry_id: EntryId,
    pub created_at: i64,
}

/// Counts usage records in day/month windows.
pub struct QuotaTracker {
    ledger: Arc<LedgerStore>,
    zone: WindowZone,
}

impl QuotaTracker {
    pub fn new(ledger: Arc<LedgerStore>, zone: WindowZone) -> Self {
        Self { ledger, zone }
    }

    /// Operations billed in the current calendar day.
    pub fn current_daily_count(&self, account_id: &str) -> Result<u32, BillingError> {
        let conn = self.ledger.conn()?;
        let (start, end) = self.zone.day_bounds(self.ledger.clock().now());
        count_usage_in(&conn, account_id, start, end, false)
    }

    /// Operations billed in the current calendar month.
    pub fn current_monthly_count(&self, account_id: &str) -> Result<u32, BillingError> {
        let conn = self.ledger.conn()?;
        let (start, end) = self.zone.month_bounds(self.ledger.clock().now());
        count_usage_in(&conn, account_id, start, end, false)
    }

    /// Compare current usage with explicit limits. Daily is checked first.
    pub fn check_allowance(
        &self,
        account_id: &str,
        daily_limit: u32,
        monthly_limit: u32,
    ) -> Result<Allowance, BillingError> {
        let conn = self.ledger.conn()?;
        self.check_allowance_in(
            &conn,
            account_id,
            QuotaLimits {
                daily: daily_limit,
                monthly: monthly_limit,
            },
            false,
        )
    }

    /// Quota check on an existing connection or transaction.
    ///
    /// With `count_pending`, holds that are still pending count as usage;
    /// reservation billing relies on this to keep concurrent holds inside
    /// the limits.
    pub fn check_allowance_in(
        &self,
        conn: &Connection,
        account_id: &str,
        limits: QuotaLimits,
        count_pending: bool,
    ) -> Result<Allowance, BillingError> {
        let now = self.ledger.clock().now();

        let (start, end) = self.zone.day_bounds(now);
        let daily = count_usage_in(conn, account_id, start, end, count_pending)?;
        if daily >= limits.daily {
            return Ok(Allowance::DailyExceeded {
                used: daily,
                limit: limits.daily,
            });
        }

        let (start, end) = self.zone.month_bounds(now);
        let monthly = count_usage_in(conn, account_id, start, end, count_pending)?;
        if monthly >= limits.monthly {
            return Ok(Allowance::MonthlyExceeded {
                used: monthly,
                limit: limits.monthly,
            });
        }

        Ok(Allowance::Allowed)
    }

    /// Configured limits for the account.
    pub fn limits_for(&self, account_id: &str) -> Result<QuotaLimits, BillingError> {
        let conn = self.ledger.conn()?;
        limits_for_in(&conn, account_id)
    }

    /// Append a usage record inside the caller's (debit) transaction.
    pub fn record(
        &self,
        tx: &Transaction<'_>,
        account_id: &str,
        action: &str,
        coins_charged: i64,
        entry_id: EntryId,
    ) -> Result<(), BillingError> {
        tx.execute(
            "INSERT INTO usage_records (account_id, action, coins_charged, entry_id, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![account_id, action, coins_charged, entry_id, self.ledger.now_millis()],
        )?;
        Ok(())
    }

    /// Most recent usage records, newest first.
    pub fn usage(&self, account_id: &str, limit: usize) -> Result<Vec<UsageRecord>, BillingError> {
        let conn = self.ledger.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, account_id, action, coins_charged, entry_id, created_at
             FROM usage_records WHERE account_id = ?1 ORDER BY id DESC LIMIT ?2",
        )?;
        let records = stmt
            .query_map(params![account_id, limit as i64], |row| {
                Ok(UsageRecord {
                    id: row.get(0)?,
                    account_id: row.get(1)?,
                    action: row.get(2)?,
                    coins_charged: row.get(3)?,
                    entry_id: row.get(4)?,
                    created_at: row.get(5)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(records)
    }
}

/// Limits stored on the account row.
pub fn limits_for_in(conn: &Connection, account_id: &str) -> Result<QuotaLimits, BillingError> {
    let limits = conn
        .query_row(
            "SELECT daily_limit, monthly_limit FROM accounts WHERE id = ?1",
            params![account_id],
            |row| {
                Ok(QuotaLimits {
                    daily: row.get(0)?,
                    monthly: row.get(1)?,
                })
            },
        )
        .optional()?;
    limits.ok_or_else(|| BillingError::AccountNotFound(account_id.to_string()))
}

fn count_usage_in(
    conn: &Connection,
    account_id: &str,
    start_ms: i64,
    end_ms: i64,
    count_pending: bool,
) -> Result<u32, BillingError> {
    let mut count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM usage_records
         WHERE account_id = ?1 AND created_at >= ?2 AND created_at < ?3",
        params![account_id, start_ms, end_ms],
        |row| row.get(0),
    )?;
    if count_pending {
        let pending: i64 = conn.query_row(
            "SELECT COUNT(*) FROM reservations
             WHERE account_id = ?1 AND status = 'pending' AND created_at >= ?2 AND created_at < ?3",
            params![account_id, start_ms, end_ms],
            |row| row.get(0),
        )?;
        count += pending;
    }
    Ok(u32::try_from(count).unwrap_or(u32::MAX))
}
