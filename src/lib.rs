//! Prepaid coin wallet with an append-only ledger, per-account quotas,
//! bill-on-success metering of paid AI calls and exactly-once payment
//! reconciliation.

pub mod app;
pub mod billing;
pub mod config;
pub mod providers;

pub use app::App;
pub use config::Config;
