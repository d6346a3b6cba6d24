//! Wires configuration into the billing components.

use crate::billing::{
    AccountDirectory, LedgerStore, MeteredCallGateway, PaidOperation, PaymentGateway,
    PaymentReconciler, QuotaTracker, Reporting, SystemClock, WalletManager,
};
use crate::config::Config;
use crate::providers::{OpenAiOperation, PaystackGateway};
use anyhow::{Context, Result};
use std::sync::Arc;

/// Shared handles over one ledger database.
pub struct App {
    pub config: Config,
    pub ledger: Arc<LedgerStore>,
    pub wallet: Arc<WalletManager>,
    pub quota: Arc<QuotaTracker>,
    pub accounts: Arc<AccountDirectory>,
    pub reporting: Reporting,
}

impl App {
    pub fn open(config: Config) -> Result<Self> {
        let db_path = config.db_path();
        if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }

        let ledger = Arc::new(
            LedgerStore::open(&db_path, config.storage.pool_size, Arc::new(SystemClock))
                .with_context(|| format!("failed to open ledger at {}", db_path.display()))?,
        );
        let zone = config.window_zone()?;

        Ok(Self {
            wallet: Arc::new(
                WalletManager::new(Arc::clone(&ledger)).with_min_hold_age(config.min_hold_age()),
            ),
            quota: Arc::new(QuotaTracker::new(Arc::clone(&ledger), zone)),
            accounts: Arc::new(AccountDirectory::new(Arc::clone(&ledger))),
            reporting: Reporting::new(Arc::clone(&ledger)),
            ledger,
            config,
        })
    }

    /// Metered gateway over the configured AI provider.
    pub fn metered_gateway(&self) -> Result<MeteredCallGateway> {
        let operation = OpenAiOperation::new(self.config.openai.clone())?;
        Ok(self.metered_gateway_with(Arc::new(operation)))
    }

    pub fn metered_gateway_with(&self, operation: Arc<dyn PaidOperation>) -> MeteredCallGateway {
        MeteredCallGateway::new(Arc::clone(&self.wallet), Arc::clone(&self.quota), operation)
            .with_pricing(self.config.billing.pricing)
            .with_mode(self.config.billing.mode)
            .with_timeout(self.config.operation_timeout())
    }

    /// Reconciler over Paystack.
    pub fn reconciler(&self) -> Result<PaymentReconciler> {
        let paystack = self.config.payments.paystack.clone();
        let secret = paystack.secret_key.clone();
        let gateway = PaystackGateway::new(paystack)?;
        Ok(self.reconciler_with(Arc::new(gateway))?.with_webhook_secret(secret))
    }

    pub fn reconciler_with(&self, gateway: Arc<dyn PaymentGateway>) -> Result<PaymentReconciler> {
        Ok(
            PaymentReconciler::new(Arc::clone(&self.wallet), Arc::clone(&self.accounts), gateway)
                .with_rate(self.config.exchange_rate()?)
                .with_min_top_up(self.config.payments.min_top_up),
        )
    }
}
