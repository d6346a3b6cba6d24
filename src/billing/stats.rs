//! Revenue and usage reporting.
//!
//! Revenue sums the amount actually paid (`external_amount_minor`) on
//! payment credits; it is never back-computed from coins.

use super::error::BillingError;
use super::ledger::LedgerStore;
use rusqlite::params;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Usage totals for one account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountUsage {
    pub account_id: String,
    pub payer_identity: String,
    pub operations: i64,
    pub coins_spent: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevenueReport {
    /// Sum of paid amounts, in minor currency units.
    pub revenue_minor: i64,
    /// Coins credited by payments.
    pub coins_sold: i64,
    /// Billed metered operations.
    pub operations: i64,
    pub accounts: i64,
    /// Accounts with at least one billed operation.
    pub active_accounts: i64,
    /// Busiest accounts first.
    pub per_account: Vec<AccountUsage>,
}

pub struct Reporting {
    ledger: Arc<LedgerStore>,
}

impl Reporting {
    pub fn new(ledger: Arc<LedgerStore>) -> Self {
        Self { ledger }
    }

    /// Build the report; `per_account` holds at most `top` accounts.
    pub fn revenue_report(&self, top: usize) -> Result<RevenueReport, BillingError> {
        let conn = self.ledger.conn()?;

        let (revenue_minor, coins_sold): (i64, i64) = conn.query_row(
            "SELECT COALESCE(SUM(external_amount_minor), 0), COALESCE(SUM(amount), 0)
             FROM ledger_entries
             WHERE direction = 'credit' AND external_reference IS NOT NULL",
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        let operations: i64 = conn.query_row("SELECT COUNT(*) FROM usage_records", [], |row| row.get(0))?;
        let accounts: i64 = conn.query_row("SELECT COUNT(*) FROM accounts", [], |row| row.get(0))?;
        let active_accounts: i64 = conn.query_row(
            "SELECT COUNT(DISTINCT account_id) FROM usage_records",
            [],
            |row| row.get(0),
        )?;

        let mut stmt = conn.prepare(
            "SELECT a.id, a.payer_identity, COUNT(u.id), COALESCE(SUM(u.coins_charged), 0)
             FROM accounts a LEFT JOIN usage_records u ON u.account_id = a.id
             GROUP BY a.id
             ORDER BY COUNT(u.id) DESC, a.created_at
             LIMIT ?1",
        )?;
        let per_account = stmt
            .query_map(params![top as i64], |row| {
                Ok(AccountUsage {
                    account_id: row.get(0)?,
                    payer_identity: row.get(1)?,
                    operations: row.get(2)?,
                    coins_spent: row.get(3)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(RevenueReport {
            revenue_minor,
            coins_sold,
            operations,
            accounts,
            active_accounts,
            per_account,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::billing::accounts::AccountDirectory;
    use crate::billing::clock::WindowZone;
    use crate::billing::ledger::test_support::make_store;
    use crate::billing::ledger::NewEntry;
    use crate::billing::quota::{QuotaLimits, QuotaTracker};
    use crate::billing::wallet::WalletManager;

    #[test]
    fn report_uses_stored_payment_amounts() {
        let (_tmp, store) = make_store();
        let accounts = AccountDirectory::new(Arc::clone(&store));
        let ada = accounts.open_account("ada@example.com", 1000, QuotaLimits::default()).unwrap();
        accounts.open_account("bob@example.com", 1000, QuotaLimits::default()).unwrap();

        let wallet = WalletManager::new(Arc::clone(&store));
        // 1000.50 NGN paid; coins are floored, revenue is not
        wallet
            .credit_entry(
                &NewEntry::credit(&ada.id, 1500, "Top-up: 1000.5 NGN")
                    .with_reference("pay_1")
                    .with_external_amount(100_050, "ngn-v1"),
            )
            .unwrap();

        let quota = QuotaTracker::new(Arc::clone(&store), WindowZone::Local);
        for _ in 0..2 {
            wallet
                .debit_with(&ada.id, 50, "Polish Task with AI", |tx, id| {
                    quota.record(tx, &ada.id, "polish_task", 50, id)
                })
                .unwrap();
        }

        let report = Reporting::new(store).revenue_report(50).unwrap();
        assert_eq!(report.revenue_minor, 100_050);
        assert_eq!(report.coins_sold, 1500);
        assert_eq!(report.operations, 2);
        assert_eq!(report.accounts, 2);
        assert_eq!(report.active_accounts, 1);
        assert_eq!(report.per_account.len(), 2);
        assert_eq!(report.per_account[0].account_id, ada.id);
        assert_eq!(report.per_account[0].coins_spent, 100);
        assert_eq!(report.per_account[1].operations, 0);
    }

    #[test]
    fn empty_ledger_reports_zeroes() {
        let (_tmp, store) = make_store();
        let report = Reporting::new(store).revenue_report(10).unwrap();
        assert_eq!(report.revenue_minor, 0);
        assert_eq!(report.operations, 0);
        assert!(report.per_account.is_empty());
    }
}
