//! Wallet manager: the only path by which balances change.
//!
//! Every debit re-reads the entry sum inside its own `BEGIN IMMEDIATE`
//! transaction, so two spenders racing for the same coins serialise in
//! SQLite and exactly one of them wins. The in-process balance cache only
//! serves [`WalletManager::get_balance`].

use super::error::BillingError;
use super::ledger::{
    require_wallet_in, sum_balance_in, EntryId, Incident, IncidentKind, LedgerEntry, LedgerStore,
    NewEntry,
};
use parking_lot::Mutex;
use rusqlite::{params, OptionalExtension, Transaction};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

// ── Outcomes ─────────────────────────────────────────────────────

/// Result of a credit request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum CreditOutcome {
    /// A new credit entry was appended.
    Applied { entry_id: EntryId, balance: i64 },
    /// The reference was already recorded; nothing changed.
    AlreadyProcessed { balance: i64 },
}

impl CreditOutcome {
    pub fn balance(&self) -> i64 {
        match self {
            Self::Applied { balance, .. } | Self::AlreadyProcessed { balance } => *balance,
        }
    }

    pub fn is_applied(&self) -> bool {
        matches!(self, Self::Applied { .. })
    }
}

/// A committed debit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Debit {
    pub entry_id: EntryId,
    pub balance: i64,
}

/// A pending hold placed by [`WalletManager::reserve_with`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: String,
    pub account_id: String,
    pub action: String,
    pub amount: i64,
    pub hold_entry_id: EntryId,
    pub created_at: i64,
}

// ── Balance cache ────────────────────────────────────────────────

#[derive(Debug, Default)]
struct CacheSlot {
    generation: u64,
    balance: Option<i64>,
}

enum CacheLookup {
    Hit(i64),
    Miss { generation: u64 },
}

/// Per-account read-through cache.
///
/// A fill is dropped if the slot was invalidated after the reader took its
/// generation, so a slow reader cannot resurrect a pre-mutation balance.
#[derive(Debug, Default)]
struct BalanceCache {
    slots: Mutex<HashMap<String, CacheSlot>>,
}

impl BalanceCache {
    fn lookup(&self, account_id: &str) -> CacheLookup {
        match self.slots.lock().get(account_id) {
            Some(CacheSlot {
                balance: Some(balance),
                ..
            }) => CacheLookup::Hit(*balance),
            Some(slot) => CacheLookup::Miss {
                generation: slot.generation,
            },
            None => CacheLookup::Miss { generation: 0 },
        }
    }

    /// Only called after the account was found, so unknown ids never get a slot.
    fn fill(&self, account_id: &str, generation: u64, balance: i64) {
        let mut slots = self.slots.lock();
        let slot = slots.entry(account_id.to_string()).or_default();
        if slot.generation == generation {
            slot.balance = Some(balance);
        }
    }

    fn invalidate(&self, account_id: &str) {
        let mut slots = self.slots.lock();
        let slot = slots.entry(account_id.to_string()).or_default();
        slot.generation = slot.generation.wrapping_add(1);
        slot.balance = None;
    }
}

// ── Wallet manager ───────────────────────────────────────────────

/// Atomic credit/debit primitives over the [`LedgerStore`].
pub struct WalletManager {
    ledger: Arc<LedgerStore>,
    cache: BalanceCache,
    /// Holds placed here and not yet committed or released.
    in_flight: Mutex<HashSet<String>>,
    min_hold_age: Duration,
}

impl WalletManager {
    pub fn new(ledger: Arc<LedgerStore>) -> Self {
        Self {
            ledger,
            cache: BalanceCache::default(),
            in_flight: Mutex::new(HashSet::new()),
            min_hold_age: Duration::ZERO,
        }
    }

    /// Holds younger than `age` are never treated as stale, whatever age
    /// the sweep is asked for. Set it above the operation timeout.
    pub fn with_min_hold_age(mut self, age: Duration) -> Self {
        self.min_hold_age = age;
        self
    }

    pub fn ledger(&self) -> &Arc<LedgerStore> {
        &self.ledger
    }

    /// Credit `amount` coins.
    ///
    /// With a `reference` the call is idempotent: replaying it returns
    /// [`CreditOutcome::AlreadyProcessed`] and the unchanged balance.
    pub fn credit(
        &self,
        account_id: &str,
        amount: i64,
        description: &str,
        reference: Option<&str>,
    ) -> Result<CreditOutcome, BillingError> {
        let mut entry = NewEntry::credit(account_id, amount, description);
        if let Some(reference) = reference {
            entry = entry.with_reference(reference);
        }
        self.credit_entry(&entry)
    }

    /// Credit a fully described entry (payment credits carry the external amount).
    pub fn credit_entry(&self, entry: &NewEntry) -> Result<CreditOutcome, BillingError> {
        if entry.amount <= 0 {
            return Err(BillingError::InvalidAmount(entry.amount));
        }
        let account_id = entry.account_id.as_str();

        let result = self.ledger.transaction(|tx| {
            let entry_id = self.ledger.append_in(tx, entry)?;
            Ok((entry_id, sum_balance_in(tx, account_id)?))
        });

        match result {
            Ok((entry_id, balance)) => {
                self.cache.invalidate(account_id);
                tracing::info!(
                    account_id,
                    amount = entry.amount,
                    reference = entry.external_reference.as_deref().unwrap_or(""),
                    balance,
                    "Wallet credited"
                );
                Ok(CreditOutcome::Applied { entry_id, balance })
            }
            Err(BillingError::DuplicateReference(reference)) => {
                let balance = self.ledger.sum_balance(account_id)?;
                tracing::info!(account_id, reference = %reference, "Credit already processed");
                Ok(CreditOutcome::AlreadyProcessed { balance })
            }
            Err(e) => Err(e),
        }
    }

    /// Debit `amount` coins; returns the new balance.
    pub fn debit(&self, account_id: &str, amount: i64, description: &str) -> Result<i64, BillingError> {
        self.debit_with(account_id, amount, description, |_, _| Ok(()))
            .map(|debit| debit.balance)
    }

    /// Debit and run `also` in the same transaction.
    ///
    /// `also` receives the new entry id; if it fails the debit is rolled
    /// back with it.
    pub fn debit_with<F>(
        &self,
        account_id: &str,
        amount: i64,
        description: &str,
        also: F,
    ) -> Result<Debit, BillingError>
    where
        F: FnOnce(&Transaction<'_>, EntryId) -> Result<(), BillingError>,
    {
        if amount <= 0 {
            return Err(BillingError::InvalidAmount(amount));
        }

        let debit = self.ledger.transaction(|tx| {
            require_wallet_in(tx, account_id)?;
            let available = sum_balance_in(tx, account_id)?;
            if available < amount {
                return Err(BillingError::InsufficientBalance {
                    required: amount,
                    available,
                });
            }
            let entry_id = self
                .ledger
                .append_in(tx, &NewEntry::debit(account_id, amount, description))?;
            also(tx, entry_id)?;
            Ok(Debit {
                entry_id,
                balance: available - amount,
            })
        })?;

        self.cache.invalidate(account_id);
        tracing::info!(account_id, amount, balance = debit.balance, "Wallet debited");
        Ok(debit)
    }

    /// Current balance, served from the cache when possible.
    ///
    /// Never use this to decide a debit; [`Self::debit`] re-reads inside
    /// its transaction.
    pub fn get_balance(&self, account_id: &str) -> Result<i64, BillingError> {
        let generation = match self.cache.lookup(account_id) {
            CacheLookup::Hit(balance) => return Ok(balance),
            CacheLookup::Miss { generation } => generation,
        };

        let conn = self.ledger.conn()?;
        require_wallet_in(&conn, account_id)?;
        let balance = sum_balance_in(&conn, account_id)?;
        self.cache.fill(account_id, generation, balance);
        Ok(balance)
    }

    /// Most recent ledger entries for the account, newest first.
    pub fn ledger_entries(&self, account_id: &str, limit: usize) -> Result<Vec<LedgerEntry>, BillingError> {
        self.ledger.entries(account_id, limit)
    }

    // ── Reservations ─────────────────────────────────────────────

    /// Place a hold of `amount` coins.
    ///
    /// The balance is checked first, then `check` (quota enforcement) runs
    /// inside the same transaction, so the whole authorization is atomic.
    pub fn reserve_with<F>(
        &self,
        account_id: &str,
        amount: i64,
        action: &str,
        description: &str,
        check: F,
    ) -> Result<Reservation, BillingError>
    where
        F: FnOnce(&Transaction<'_>) -> Result<(), BillingError>,
    {
        if amount <= 0 {
            return Err(BillingError::InvalidAmount(amount));
        }

        // Marked before the row exists so a concurrent sweep never sees it unmarked
        let id = uuid::Uuid::new_v4().to_string();
        self.in_flight.lock().insert(id.clone());

        let placed = self.ledger.transaction(|tx| {
            require_wallet_in(tx, account_id)?;

            let available = sum_balance_in(tx, account_id)?;
            if available < amount {
                return Err(BillingError::InsufficientBalance {
                    required: amount,
                    available,
                });
            }
            check(tx)?;

            let hold_entry_id = self.ledger.append_in(
                tx,
                &NewEntry::debit(account_id, amount, &format!("Hold: {description}")),
            )?;
            let reservation = Reservation {
                id: id.clone(),
                account_id: account_id.to_string(),
                action: action.to_string(),
                amount,
                hold_entry_id,
                created_at: self.ledger.now_millis(),
            };
            tx.execute(
                "INSERT INTO reservations
                    (id, account_id, action, amount, hold_entry_id, status, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, 'pending', ?6, ?6)",
                params![
                    reservation.id,
                    reservation.account_id,
                    reservation.action,
                    reservation.amount,
                    reservation.hold_entry_id,
                    reservation.created_at,
                ],
            )?;
            Ok(reservation)
        });
        let reservation = match placed {
            Ok(reservation) => reservation,
            Err(e) => {
                self.in_flight.lock().remove(&id);
                return Err(e);
            }
        };

        self.cache.invalidate(account_id);
        tracing::debug!(account_id, amount, reservation_id = %reservation.id, "Hold placed");
        Ok(reservation)
    }

    /// Turn a pending hold into a final charge, running `also` in the same
    /// transaction. Returns the balance after the charge.
    pub fn commit_reservation_with<F>(&self, reservation: &Reservation, also: F) -> Result<i64, BillingError>
    where
        F: FnOnce(&Transaction<'_>, EntryId) -> Result<(), BillingError>,
    {
        let committed = self.ledger.transaction(|tx| {
            let updated = tx.execute(
                "UPDATE reservations SET status = 'committed', updated_at = ?1
                 WHERE id = ?2 AND status = 'pending'",
                params![self.ledger.now_millis(), reservation.id],
            )?;
            if updated == 0 {
                return Err(BillingError::ReservationNotFound(reservation.id.clone()));
            }
            also(tx, reservation.hold_entry_id)?;
            sum_balance_in(tx, &reservation.account_id)
        });
        self.in_flight.lock().remove(&reservation.id);
        let balance = committed?;

        self.cache.invalidate(&reservation.account_id);
        Ok(balance)
    }

    /// Release a pending hold with a compensating credit.
    ///
    /// The hold stops counting as in flight even if the release fails, so a
    /// later sweep can retry it.
    pub fn release_reservation(&self, reservation_id: &str, reason: &str) -> Result<i64, BillingError> {
        self.in_flight.lock().remove(reservation_id);
        let (account_id, balance) = self.ledger.transaction(|tx| {
            let row: Option<(String, String, i64)> = tx
                .query_row(
                    "SELECT account_id, action, amount FROM reservations
                     WHERE id = ?1 AND status = 'pending'",
                    params![reservation_id],
                    |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
                )
                .optional()?;
            let Some((account_id, action, amount)) = row else {
                return Err(BillingError::ReservationNotFound(reservation_id.to_string()));
            };

            tx.execute(
                "UPDATE reservations SET status = 'released', updated_at = ?1 WHERE id = ?2",
                params![self.ledger.now_millis(), reservation_id],
            )?;
            self.ledger.append_in(
                tx,
                &NewEntry::credit(&account_id, amount, &format!("Release hold: {action} ({reason})")),
            )?;
            let balance = sum_balance_in(tx, &account_id)?;
            Ok((account_id, balance))
        })?;

        self.cache.invalidate(&account_id);
        tracing::info!(account_id = %account_id, reservation_id, reason, "Hold released");
        Ok(balance)
    }

    /// Release holds still pending after `max_age_ms` (crash leftovers).
    ///
    /// The age is raised to the configured minimum hold age, and holds whose
    /// call is still running in this process are skipped. Each release is
    /// recorded as an incident: the external call behind a stale hold may
    /// have delivered before the process died.
    pub fn release_stale_reservations(&self, max_age_ms: i64) -> Result<Vec<String>, BillingError> {
        let floor_ms = i64::try_from(self.min_hold_age.as_millis()).unwrap_or(i64::MAX);
        let cutoff = self.ledger.now_millis().saturating_sub(max_age_ms.max(floor_ms));
        let stale: Vec<(String, String, i64)> = {
            let conn = self.ledger.conn()?;
            let mut stmt = conn.prepare(
                "SELECT id, account_id, amount FROM reservations
                 WHERE status = 'pending' AND created_at < ?1 ORDER BY created_at",
            )?;
            let rows = stmt
                .query_map(params![cutoff], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))?
                .collect::<Result<Vec<_>, _>>()?;
            rows
        };

        let mut released = Vec::with_capacity(stale.len());
        for (id, account_id, amount) in stale {
            if self.in_flight.lock().contains(&id) {
                tracing::debug!(account_id = %account_id, reservation_id = %id, "Skipping hold still in flight");
                continue;
            }
            match self.release_reservation(&id, "stale") {
                Ok(_) => {
                    tracing::warn!(account_id = %account_id, reservation_id = %id, "Released stale hold");
                    self.ledger.record_incident(&Incident {
                        id: 0,
                        kind: IncidentKind::StaleReservation,
                        account_id: Some(account_id),
                        reference: Some(id.clone()),
                        amount: Some(amount),
                        detail: "pending hold released by stale sweep; verify delivery".into(),
                        created_at: 0,
                    })?;
                    released.push(id);
                }
                // Committed or released concurrently
                Err(BillingError::ReservationNotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(released)
    }

    /// Ids of holds still pending for the account.
    pub fn pending_reservations(&self, account_id: &str) -> Result<Vec<String>, BillingError> {
        let conn = self.ledger.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id FROM reservations WHERE account_id = ?1 AND status = 'pending'",
        )?;
        let ids = stmt
            .query_map(params![account_id], |row| row.get(0))?
            .collect::<Result<Vec<String>, _>>()?;
        Ok(ids)
    }
}
