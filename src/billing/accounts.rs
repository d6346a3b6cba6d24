//! Account directory: opening accounts and resolving payers.

use super::error::BillingError;
use super::ledger::{is_constraint, LedgerStore, NewEntry};
use super::quota::QuotaLimits;
use rusqlite::{params, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Coins granted when an account is opened.
pub const DEFAULT_SIGNUP_GRANT: i64 = 1000;

/// Description of the opening grant entry.
pub const SIGNUP_GRANT_DESCRIPTION: &str = "Signup Bonus";

/// A billable account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub id: String,
    /// Email the payment gateway reports for this account's payments.
    pub payer_identity: String,
    pub limits: QuotaLimits,
    pub created_at: i64,
}

pub struct AccountDirectory {
    ledger: Arc<LedgerStore>,
}

impl AccountDirectory {
    pub fn new(ledger: Arc<LedgerStore>) -> Self {
        Self { ledger }
    }

    /// Create an account, its wallet and the opening grant in one transaction.
    ///
    /// Payer identities are unique regardless of case.
    pub fn open_account(
        &self,
        payer_identity: &str,
        initial_grant: i64,
        limits: QuotaLimits,
    ) -> Result<Account, BillingError> {
        let payer = payer_identity.trim();
        if payer.is_empty() || !payer.contains('@') || payer.len() > 254 {
            return Err(BillingError::InvalidPayerIdentity(payer_identity.to_string()));
        }
        if initial_grant < 0 {
            return Err(BillingError::InvalidAmount(initial_grant));
        }

        let account = Account {
            id: uuid::Uuid::new_v4().to_string(),
            payer_identity: payer.to_string(),
            limits,
            created_at: self.ledger.now_millis(),
        };

        self.ledger.transaction(|tx| {
            let inserted = tx.execute(
                "INSERT INTO accounts (id, payer_identity, daily_limit, monthly_limit, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    account.id,
                    account.payer_identity,
                    account.limits.daily,
                    account.limits.monthly,
                    account.created_at,
                ],
            );
            match inserted {
                Ok(_) => {}
                Err(e) if is_constraint(&e, rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE) => {
                    return Err(BillingError::AccountExists(account.payer_identity.clone()));
                }
                Err(e) => return Err(e.into()),
            }

            tx.execute(
                "INSERT INTO wallets (account_id, balance, updated_at) VALUES (?1, 0, ?2)",
                params![account.id, account.created_at],
            )?;

            if initial_grant > 0 {
                self.ledger.append_in(
                    tx,
                    &NewEntry::credit(&account.id, initial_grant, SIGNUP_GRANT_DESCRIPTION),
                )?;
            }
            Ok(())
        })?;

        tracing::info!(
            account_id = %account.id,
            payer = %account.payer_identity,
            initial_grant,
            "Account opened"
        );
        Ok(account)
    }

    pub fn get(&self, account_id: &str) -> Result<Account, BillingError> {
        let conn = self.ledger.conn()?;
        conn.query_row(
            &format!("SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE id = ?1"),
            params![account_id],
            account_from_row,
        )
        .optional()?
        .ok_or_else(|| BillingError::AccountNotFound(account_id.to_string()))
    }

    /// Resolve a payment gateway's payer identity (case-insensitive).
    pub fn find_by_payer(&self, payer_identity: &str) -> Result<Option<Account>, BillingError> {
        let conn = self.ledger.conn()?;
        let account = conn
            .query_row(
                &format!("SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE payer_identity = ?1"),
                params![payer_identity.trim()],
                account_from_row,
            )
            .optional()?;
        Ok(account)
    }

    pub fn set_limits(&self, account_id: &str, limits: QuotaLimits) -> Result<(), BillingError> {
        let conn = self.ledger.conn()?;
        let updated = conn.execute(
            "UPDATE accounts SET daily_limit = ?1, monthly_limit = ?2 WHERE id = ?3",
            params![limits.daily, limits.monthly, account_id],
        )?;
        if updated == 0 {
            return Err(BillingError::AccountNotFound(account_id.to_string()));
        }
        tracing::info!(account_id, daily = limits.daily, monthly = limits.monthly, "Quota limits updated");
        Ok(())
    }
}

const ACCOUNT_COLUMNS: &str = "id, payer_identity, daily_limit, monthly_limit, created_at";

fn account_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Account> {
    Ok(Account {
        id: row.get(0)?,
        payer_identity: row.get(1)?,
        limits: QuotaLimits {
            daily: row.get(2)?,
            monthly: row.get(3)?,
        },
        created_at: row.get(4)?,
    })
}
