//! Coin wallet, quota and metered-call billing.
//!
//! Account holders spend a prepaid coin balance on paid external
//! operations and top it up through a payment gateway.
//!
//! ## Design
//! - SQLite-based append-only ledger; balances are entry sums
//! - Check-and-append inside one `BEGIN IMMEDIATE` transaction per mutation
//! - External calls bill only on success, never inside a transaction
//! - Payment references are unique ledger keys, so replays credit once

pub mod accounts;
pub mod clock;
pub mod error;
pub mod gateway;
pub mod ledger;
pub mod quota;
pub mod reconciler;
pub mod stats;
pub mod wallet;

pub use accounts::{Account, AccountDirectory, DEFAULT_SIGNUP_GRANT};
pub use clock::{Clock, ManualClock, SystemClock, WindowZone};
pub use error::BillingError;
pub use gateway::{
    BillingMode, MeteredAction, MeteredCallGateway, OperationOutput, OperationRequest,
    PaidOperation, Pricing, Receipt,
};
pub use ledger::{
    BalanceAudit, Direction, EntryId, Incident, IncidentKind, LedgerEntry, LedgerStore, NewEntry,
};
pub use quota::{Allowance, QuotaLimits, QuotaTracker, UsageRecord};
pub use reconciler::{
    ExchangeRate, GatewayError, PaymentFact, PaymentGateway, PaymentReconciler, PaymentStatus,
    ReconcileOutcome, TopUpSession,
};
pub use stats::{AccountUsage, Reporting, RevenueReport};
pub use wallet::{CreditOutcome, Debit, Reservation, WalletManager};
