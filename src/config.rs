//! TOML configuration with environment overrides.
//!
//! Every section is optional. String values of the form `env:VAR` are
//! replaced with the variable's value before decoding, and a fixed set of
//! variables (`COINLEDGER_DB_PATH`, `PAYSTACK_SECRET_KEY`, ...) override
//! the file.

use crate::billing::gateway::{BillingMode, Pricing};
use crate::billing::quota::{QuotaLimits, DEFAULT_DAILY_LIMIT, DEFAULT_MONTHLY_LIMIT};
use crate::billing::reconciler::{ExchangeRate, DEFAULT_MIN_TOP_UP};
use crate::billing::{WindowZone, DEFAULT_SIGNUP_GRANT};
use crate::providers::{OpenAiConfig, PaystackConfig};
use anyhow::{bail, Context, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const CONFIG_FILE_NAME: &str = "config.toml";

/// Slack between the operation timeout and the age at which a hold counts as stale.
pub const STALE_HOLD_MARGIN_SECS: u64 = 60;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub storage: StorageConfig,
    pub billing: BillingConfig,
    pub payments: PaymentsConfig,
    pub openai: OpenAiConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Ledger database file; defaults to the platform data dir.
    pub db_path: Option<PathBuf>,
    pub pool_size: u32,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: None,
            pool_size: 8,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BillingConfig {
    pub mode: BillingMode,
    pub signup_grant: i64,
    pub daily_limit: u32,
    pub monthly_limit: u32,
    /// IANA zone for quota windows; unset means the process-local zone.
    pub time_zone: Option<String>,
    pub operation_timeout_secs: u64,
    /// Pending holds older than this are released by `release-stale`.
    pub stale_reservation_secs: u64,
    pub pricing: Pricing,
}

impl Default for BillingConfig {
    fn default() -> Self {
        Self {
            mode: BillingMode::default(),
            signup_grant: DEFAULT_SIGNUP_GRANT,
            daily_limit: DEFAULT_DAILY_LIMIT,
            monthly_limit: DEFAULT_MONTHLY_LIMIT,
            time_zone: None,
            operation_timeout_secs: 60,
            stale_reservation_secs: 15 * 60,
            pricing: Pricing::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PaymentsConfig {
    pub rate_version: String,
    pub currency: String,
    pub coins_per_unit: f64,
    pub minor_per_major: i64,
    pub min_top_up: i64,
    pub paystack: PaystackConfig,
}

impl Default for PaymentsConfig {
    fn default() -> Self {
        let rate = ExchangeRate::default();
        Self {
            rate_version: rate.version,
            currency: rate.currency,
            coins_per_unit: 1.5,
            minor_per_major: rate.minor_per_major,
            min_top_up: DEFAULT_MIN_TOP_UP,
            paystack: PaystackConfig::default(),
        }
    }
}

impl Config {
    /// Load from `path`, or from the platform config dir when `None`.
    ///
    /// An explicit path must exist; a missing default file yields defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let (path, required) = match path {
            Some(p) => (Some(p.to_path_buf()), true),
            None => (default_config_path(), false),
        };

        let mut config = match path {
            Some(ref p) if p.exists() => {
                let raw = std::fs::read_to_string(p)
                    .with_context(|| format!("failed to read config {}", p.display()))?;
                Self::from_toml_str(&raw).with_context(|| format!("invalid config {}", p.display()))?
            }
            Some(ref p) if required => bail!("config file not found: {}", p.display()),
            _ => Self::default(),
        };

        config.apply_env_overrides(|name| std::env::var(name).ok());
        config.validate()?;
        Ok(config)
    }

    /// Parse TOML, resolving `env:VAR` references from the process environment.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let parsed: toml::Table = toml::from_str(raw).context("failed to parse TOML")?;
        let resolved = resolve_env_refs(toml::Value::Table(parsed))?;
        resolved.try_into::<Self>().context("failed to decode config")
    }

    /// Apply the fixed environment overrides through `lookup`.
    pub fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        if let Some(path) = get("COINLEDGER_DB_PATH") {
            self.storage.db_path = Some(PathBuf::from(path));
        }
        if let Some(key) = get("PAYSTACK_SECRET_KEY") {
            self.payments.paystack.secret_key = key;
        }
        if let Some(url) = get("PAYSTACK_CALLBACK_URL") {
            self.payments.paystack.callback_url = Some(url);
        }
        if let Some(key) = get("OPENAI_API_KEY") {
            self.openai.api_key = key;
        }
        if let Some(url) = get("OPENAI_BASE_URL") {
            self.openai.base_url = url;
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.storage.pool_size == 0 {
            bail!("storage.pool_size must be >= 1");
        }
        if self.billing.signup_grant < 0 {
            bail!("billing.signup_grant must not be negative");
        }
        for (name, price) in [
            ("polish_task", self.billing.pricing.polish_task),
            ("generate_report", self.billing.pricing.generate_report),
            ("edit_report", self.billing.pricing.edit_report),
        ] {
            if price <= 0 {
                bail!("billing.pricing.{name} must be positive, got {price}");
            }
        }
        if self.billing.operation_timeout_secs == 0 {
            bail!("billing.operation_timeout_secs must be >= 1");
        }
        let min_stale = self.min_hold_age().as_secs();
        if self.billing.stale_reservation_secs < min_stale {
            bail!(
                "billing.stale_reservation_secs must be >= {min_stale} \
                 (operation_timeout_secs + {STALE_HOLD_MARGIN_SECS}), got {}",
                self.billing.stale_reservation_secs
            );
        }
        if self.payments.min_top_up <= 0 {
            bail!("payments.min_top_up must be positive");
        }
        self.window_zone()?;
        self.exchange_rate()?;
        Ok(())
    }

    /// Ledger database path.
    pub fn db_path(&self) -> PathBuf {
        if let Some(path) = &self.storage.db_path {
            return path.clone();
        }
        ProjectDirs::from("", "", "coinledger")
            .map(|dirs| dirs.data_dir().join(crate::billing::ledger::DB_FILE_NAME))
            .unwrap_or_else(|| PathBuf::from(crate::billing::ledger::DB_FILE_NAME))
    }

    pub fn window_zone(&self) -> Result<WindowZone> {
        WindowZone::parse(self.billing.time_zone.as_deref())
            .map_err(|e| anyhow::anyhow!("billing.time_zone: {e}"))
    }

    pub fn exchange_rate(&self) -> Result<ExchangeRate> {
        let p = &self.payments;
        ExchangeRate::from_decimal(&p.rate_version, &p.currency, p.coins_per_unit, p.minor_per_major)
            .map_err(|e| anyhow::anyhow!("payments: {e}"))
    }

    pub fn default_limits(&self) -> QuotaLimits {
        QuotaLimits {
            daily: self.billing.daily_limit,
            monthly: self.billing.monthly_limit,
        }
    }

    pub fn operation_timeout(&self) -> Duration {
        Duration::from_secs(self.billing.operation_timeout_secs)
    }

    /// Youngest hold the stale sweep may release: a call can still be
    /// running until its timeout fires.
    pub fn min_hold_age(&self) -> Duration {
        Duration::from_secs(
            self.billing
                .operation_timeout_secs
                .saturating_add(STALE_HOLD_MARGIN_SECS),
        )
    }
}

fn default_config_path() -> Option<PathBuf> {
    ProjectDirs::from("", "", "coinledger").map(|dirs| dirs.config_dir().join(CONFIG_FILE_NAME))
}

fn resolve_env_refs(mut value: toml::Value) -> Result<toml::Value> {
    fn walk(v: &mut toml::Value) -> Result<()> {
        match v {
            toml::Value::String(s) => {
                if let Some(var) = s.strip_prefix("env:") {
                    let var = var.trim();
                    if var.is_empty() {
                        bail!("invalid env: reference (empty variable name)");
                    }
                    *s = std::env::var(var)
                        .with_context(|| format!("missing required environment variable: {var}"))?;
                }
            }
            toml::Value::Array(items) => {
                for item in items {
                    walk(item)?;
                }
            }
            toml::Value::Table(table) => {
                for (_, item) in table.iter_mut() {
                    walk(item)?;
                }
            }
            _ => {}
        }
        Ok(())
    }

    walk(&mut value)?;
    Ok(value)
}
