//! Payment reconciliation: turn verified gateway payments into wallet credits.
//!
//! Callbacks and webhooks are untrusted hints. Every credit is preceded by
//! a server-side `verify` against the gateway, and the payment reference is
//! stored on the ledger entry, where a UNIQUE constraint makes the credit
//! happen at most once no matter how often (or how concurrently) the same
//! reference is replayed.

use super::accounts::AccountDirectory;
use super::error::BillingError;
use super::ledger::{Incident, IncidentKind, NewEntry};
use super::wallet::{CreditOutcome, WalletManager};
use async_trait::async_trait;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha512;
use std::sync::Arc;
use std::time::Duration;

/// Smallest top-up accepted, in major currency units.
pub const DEFAULT_MIN_TOP_UP: i64 = 1000;

/// Default upper bound on a gateway round trip.
pub const DEFAULT_GATEWAY_TIMEOUT: Duration = Duration::from_secs(30);

/// Webhook event that reports a completed charge.
const CHARGE_SUCCESS_EVENT: &str = "charge.success";

// ── Gateway seam ─────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    Success,
    Pending,
    Failed,
    Abandoned,
    Reversed,
    #[serde(other)]
    Unknown,
}

impl PaymentStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Pending => "pending",
            Self::Failed => "failed",
            Self::Abandoned => "abandoned",
            Self::Reversed => "reversed",
            Self::Unknown => "unknown",
        }
    }
}

/// A payment as reported by the gateway's verification endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentFact {
    pub reference: String,
    pub status: PaymentStatus,
    /// Amount in the minor currency unit (kobo).
    pub amount_minor: i64,
    pub currency: String,
    pub payer_identity: String,
}

/// A started checkout the payer completes on the gateway's page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopUpSession {
    pub authorization_url: String,
    pub reference: String,
}

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    /// Network failure, timeout or 5xx.
    #[error("payment gateway unreachable: {0}")]
    Unavailable(String),
    /// The gateway answered and refused the request.
    #[error("payment gateway rejected request: {0}")]
    Rejected(String),
}

/// External oracle of verified payment facts.
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    fn name(&self) -> &str;

    async fn initialize(
        &self,
        payer_identity: &str,
        amount_minor: i64,
        reference: &str,
    ) -> Result<TopUpSession, GatewayError>;

    async fn verify(&self, reference: &str) -> Result<PaymentFact, GatewayError>;
}

// ── Exchange rate ────────────────────────────────────────────────

/// Fixed, versioned conversion from paid currency to coins.
///
/// Rates are held in thousandths of a coin per major unit so conversion
/// stays in integer arithmetic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExchangeRate {
    pub version: String,
    pub currency: String,
    pub coins_per_major_milli: i64,
    pub minor_per_major: i64,
}

impl Default for ExchangeRate {
    fn default() -> Self {
        Self {
            version: "ngn-v1".into(),
            currency: "NGN".into(),
            coins_per_major_milli: 1500,
            minor_per_major: 100,
        }
    }
}

impl ExchangeRate {
    /// Build a rate from a decimal coins-per-unit value (e.g. `1.5`).
    pub fn from_decimal(
        version: &str,
        currency: &str,
        coins_per_major: f64,
        minor_per_major: i64,
    ) -> Result<Self, String> {
        if !coins_per_major.is_finite() || coins_per_major <= 0.0 {
            return Err(format!("exchange rate must be positive, got {coins_per_major}"));
        }
        if minor_per_major <= 0 {
            return Err(format!("minor units per major must be positive, got {minor_per_major}"));
        }
        let milli = (coins_per_major * 1000.0).round();
        if milli < 1.0 || milli > i64::MAX as f64 {
            return Err(format!("exchange rate out of range: {coins_per_major}"));
        }
        Ok(Self {
            version: version.to_string(),
            currency: currency.to_string(),
            coins_per_major_milli: milli as i64,
            minor_per_major,
        })
    }

    /// `floor(amount * rate)` for an amount in minor units.
    pub fn coins_for(&self, amount_minor: i64) -> i64 {
        if amount_minor <= 0 || self.minor_per_major <= 0 {
            return 0;
        }
        let coins = i128::from(amount_minor) * i128::from(self.coins_per_major_milli)
            / (i128::from(self.minor_per_major) * 1000);
        i64::try_from(coins).unwrap_or(i64::MAX)
    }

    /// Minor units for a whole major amount, or `None` on overflow.
    pub fn to_minor(&self, amount_major: i64) -> Option<i64> {
        amount_major.checked_mul(self.minor_per_major)
    }

    /// Render a minor amount in major units, without trailing zeros.
    pub fn format_major(&self, amount_minor: i64) -> String {
        let factor = self.minor_per_major.max(1);
        let major = amount_minor / factor;
        let rem = (amount_minor % factor).abs();
        if rem == 0 {
            return major.to_string();
        }
        let width = (factor - 1).to_string().len();
        let frac = format!("{rem:0width$}");
        format!("{major}.{}", frac.trim_end_matches('0'))
    }
}

// ── Reconciler ───────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ReconcileOutcome {
    Credited {
        account_id: String,
        reference: String,
        coins: i64,
        amount_minor: i64,
        balance: i64,
    },
    /// The reference was already credited; the balance is unchanged.
    AlreadyProcessed {
        account_id: String,
        reference: String,
        balance: i64,
    },
}

impl ReconcileOutcome {
    pub fn balance(&self) -> i64 {
        match self {
            Self::Credited { balance, .. } | Self::AlreadyProcessed { balance, .. } => *balance,
        }
    }

    pub fn is_credited(&self) -> bool {
        matches!(self, Self::Credited { .. })
    }
}

pub struct PaymentReconciler {
    wallet: Arc<WalletManager>,
    accounts: Arc<AccountDirectory>,
    gateway: Arc<dyn PaymentGateway>,
    rate: ExchangeRate,
    min_top_up: i64,
    webhook_secret: Option<String>,
    timeout: Duration,
}

impl PaymentReconciler {
    pub fn new(
        wallet: Arc<WalletManager>,
        accounts: Arc<AccountDirectory>,
        gateway: Arc<dyn PaymentGateway>,
    ) -> Self {
        Self {
            wallet,
            accounts,
            gateway,
            rate: ExchangeRate::default(),
            min_top_up: DEFAULT_MIN_TOP_UP,
            webhook_secret: None,
            timeout: DEFAULT_GATEWAY_TIMEOUT,
        }
    }

    pub fn with_rate(mut self, rate: ExchangeRate) -> Self {
        self.rate = rate;
        self
    }

    pub fn with_min_top_up(mut self, min_top_up: i64) -> Self {
        self.min_top_up = min_top_up;
        self
    }

    /// Secret used to sign webhooks (Paystack signs with the API secret key).
    pub fn with_webhook_secret(mut self, secret: impl Into<String>) -> Self {
        self.webhook_secret = Some(secret.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn rate(&self) -> &ExchangeRate {
        &self.rate
    }

    /// Start a checkout of `amount_major` for the account's payer.
    pub async fn initiate_top_up(
        &self,
        account_id: &str,
        amount_major: i64,
    ) -> Result<TopUpSession, BillingError> {
        if amount_major < self.min_top_up {
            return Err(BillingError::TopUpBelowMinimum {
                minimum: self.min_top_up,
                requested: amount_major,
            });
        }
        let amount_minor = self
            .rate
            .to_minor(amount_major)
            .ok_or(BillingError::InvalidAmount(amount_major))?;
        let account = self.accounts.get(account_id)?;
        let reference = format!("cl_{}", uuid::Uuid::new_v4().simple());

        let session = self
            .call_gateway(self.gateway.initialize(&account.payer_identity, amount_minor, &reference))
            .await
            .map_err(|e| match e {
                GatewayError::Unavailable(m) | GatewayError::Rejected(m) => {
                    BillingError::ExternalServiceUnavailable(m)
                }
            })?;

        tracing::info!(
            account_id,
            reference = %session.reference,
            amount_minor,
            "Top-up initialized"
        );
        Ok(session)
    }

    /// Credit the payment behind `reference` exactly once.
    pub async fn reconcile(&self, reference: &str) -> Result<ReconcileOutcome, BillingError> {
        let reference = reference.trim();
        if reference.is_empty() {
            return Err(BillingError::VerificationFailed {
                reference: String::new(),
                reason: "reference required".into(),
            });
        }

        if let Some(outcome) = self.already_processed(reference)? {
            return Ok(outcome);
        }

        let fact = self
            .call_gateway(self.gateway.verify(reference))
            .await
            .map_err(|e| match e {
                GatewayError::Unavailable(m) => BillingError::ExternalServiceUnavailable(m),
                GatewayError::Rejected(m) => self.verification_failed(reference, m),
            })?;

        if fact.reference != reference {
            return Err(self.verification_failed(
                reference,
                format!("gateway reported reference {}", fact.reference),
            ));
        }
        if fact.status != PaymentStatus::Success {
            return Err(self.verification_failed(
                reference,
                format!("payment status is {}", fact.status.as_str()),
            ));
        }
        if !fact.currency.eq_ignore_ascii_case(&self.rate.currency) {
            return Err(self.verification_failed(
                reference,
                format!("unexpected currency {}", fact.currency),
            ));
        }

        let Some(account) = self.accounts.find_by_payer(&fact.payer_identity)? else {
            tracing::warn!(
                reference,
                payer = %fact.payer_identity,
                amount_minor = fact.amount_minor,
                "Verified payment matches no account"
            );
            // Replayed callbacks for the same payment keep a single incident
            self.wallet.ledger().record_incident_once(&Incident {
                id: 0,
                kind: IncidentKind::UnmatchedPayment,
                account_id: None,
                reference: Some(reference.to_string()),
                amount: Some(fact.amount_minor),
                detail: format!("no account for payer {}", fact.payer_identity),
                created_at: 0,
            })?;
            return Err(BillingError::AccountNotFound(fact.payer_identity));
        };

        let coins = self.rate.coins_for(fact.amount_minor);
        if coins <= 0 {
            return Err(BillingError::InvalidAmount(coins));
        }

        let description = format!(
            "Top-up: {} {}",
            self.rate.format_major(fact.amount_minor),
            self.rate.currency
        );
        let entry = NewEntry::credit(&account.id, coins, &description)
            .with_reference(reference)
            .with_external_amount(fact.amount_minor, &self.rate.version);

        match self.wallet.credit_entry(&entry)? {
            CreditOutcome::Applied { balance, .. } => {
                tracing::info!(
                    account_id = %account.id,
                    reference,
                    coins,
                    amount_minor = fact.amount_minor,
                    rate_version = %self.rate.version,
                    "Payment reconciled"
                );
                Ok(ReconcileOutcome::Credited {
                    account_id: account.id,
                    reference: reference.to_string(),
                    coins,
                    amount_minor: fact.amount_minor,
                    balance,
                })
            }
            // Lost a race with a concurrent reconcile of the same reference
            CreditOutcome::AlreadyProcessed { balance } => Ok(ReconcileOutcome::AlreadyProcessed {
                account_id: account.id,
                reference: reference.to_string(),
                balance,
            }),
        }
    }

    /// Handle a signed gateway webhook.
    ///
    /// Only the reference is taken from the payload; amount and status are
    /// re-read through [`Self::reconcile`]. Events other than a successful
    /// charge are acknowledged with `Ok(None)`.
    pub async fn handle_webhook(
        &self,
        body: &[u8],
        signature: &str,
    ) -> Result<Option<ReconcileOutcome>, BillingError> {
        let Some(secret) = self.webhook_secret.as_deref() else {
            tracing::warn!("Webhook received but no webhook secret is configured");
            return Err(BillingError::InvalidSignature);
        };
        if !verify_webhook_signature(secret, body, signature) {
            tracing::warn!("Webhook signature verification failed");
            return Err(BillingError::InvalidSignature);
        }

        let event: WebhookEvent = serde_json::from_slice(body).map_err(|e| {
            BillingError::VerificationFailed {
                reference: String::new(),
                reason: format!("malformed webhook payload: {e}"),
            }
        })?;
        if event.event != CHARGE_SUCCESS_EVENT {
            tracing::debug!(event = %event.event, "Ignoring webhook event");
            return Ok(None);
        }

        self.reconcile(&event.data.reference).await.map(Some)
    }

    fn already_processed(&self, reference: &str) -> Result<Option<ReconcileOutcome>, BillingError> {
        let ledger = self.wallet.ledger();
        let Some(entry) = ledger.find_by_reference(reference)? else {
            return Ok(None);
        };
        let balance = ledger.sum_balance(&entry.account_id)?;
        tracing::info!(account_id = %entry.account_id, reference, "Payment already processed");
        Ok(Some(ReconcileOutcome::AlreadyProcessed {
            account_id: entry.account_id,
            reference: reference.to_string(),
            balance,
        }))
    }

    fn verification_failed(&self, reference: &str, reason: String) -> BillingError {
        tracing::warn!(reference, gateway = self.gateway.name(), "Payment verification failed: {reason}");
        BillingError::VerificationFailed {
            reference: reference.to_string(),
            reason,
        }
    }

    async fn call_gateway<T>(
        &self,
        call: impl std::future::Future<Output = Result<T, GatewayError>>,
    ) -> Result<T, GatewayError> {
        tokio::time::timeout(self.timeout, call)
            .await
            .map_err(|_| GatewayError::Unavailable(format!("{} timed out", self.gateway.name())))?
    }
}

#[derive(Debug, Deserialize)]
struct WebhookEvent {
    event: String,
    data: WebhookData,
}

#[derive(Debug, Deserialize)]
struct WebhookData {
    reference: String,
}

/// Check a Paystack `x-paystack-signature` header: hex HMAC-SHA512 of the
/// raw body keyed with the secret.
pub fn verify_webhook_signature(secret: &str, body: &[u8], signature_hex: &str) -> bool {
    let Ok(expected) = hex::decode(signature_hex.trim()) else {
        return false;
    };
    let Ok(mut mac) = Hmac::<Sha512>::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(body);
    mac.verify_slice(&expected).is_ok()
}
