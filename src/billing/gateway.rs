//! Metered call gateway: authorize, invoke the paid operation, bill on success.
//!
//! A request moves through `Requested -> Authorized -> ExternalCallInFlight
//! -> {Billed | Unbilled}`. The external call never runs inside a ledger
//! transaction, and once it has started the invoke+bill phase runs on its
//! own task, so dropping the caller's future cannot leave a delivered
//! result unbilled.
//!
//! ## Billing modes
//! - [`BillingMode::PostDebit`]: point-in-time authorization, debit after
//!   success. Two requests authorized against the same coins can both
//!   deliver; the loser's billing failure comes back as
//!   [`BillingError::OperationalAnomaly`] on the receipt.
//! - [`BillingMode::Reserve`]: authorization places a hold debit in the
//!   same transaction as the quota check (pending holds count as usage).
//!   Failure releases the hold with a compensating credit.

use super::error::BillingError;
use super::ledger::{Incident, IncidentKind};
use super::quota::QuotaTracker;
use super::wallet::{Reservation, WalletManager};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// Default upper bound on a single external call.
pub const DEFAULT_OPERATION_TIMEOUT: Duration = Duration::from_secs(60);

// ── Actions & pricing ────────────────────────────────────────────

/// A billable kind of external operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MeteredAction {
    PolishTask,
    GenerateReport,
    EditReport,
}

impl MeteredAction {
    pub const ALL: [Self; 3] = [Self::PolishTask, Self::GenerateReport, Self::EditReport];

    /// Key stored on usage records.
    pub fn key(self) -> &'static str {
        match self {
            Self::PolishTask => "polish_task",
            Self::GenerateReport => "generate_report",
            Self::EditReport => "edit_report",
        }
    }

    /// Ledger description of the debit.
    pub fn label(self) -> &'static str {
        match self {
            Self::PolishTask => "Polish Task with AI",
            Self::GenerateReport => "Generate Monthly Report",
            Self::EditReport => "Edit Report with AI",
        }
    }

    pub fn from_key(key: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|a| a.key() == key)
    }
}

/// Coin price per action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Pricing {
    pub polish_task: i64,
    pub generate_report: i64,
    pub edit_report: i64,
}

impl Default for Pricing {
    fn default() -> Self {
        Self {
            polish_task: 50,
            generate_report: 200,
            edit_report: 20,
        }
    }
}

impl Pricing {
    pub fn price(&self, action: MeteredAction) -> i64 {
        match action {
            MeteredAction::PolishTask => self.polish_task,
            MeteredAction::GenerateReport => self.generate_report,
            MeteredAction::EditReport => self.edit_report,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BillingMode {
    #[default]
    PostDebit,
    Reserve,
}

// ── Paid operation seam ──────────────────────────────────────────

/// Input to a paid operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationRequest {
    pub action: MeteredAction,
    /// Task text, task list, or report body depending on the action.
    pub input: String,
    /// Edit instruction for [`MeteredAction::EditReport`].
    #[serde(default)]
    pub instruction: Option<String>,
}

impl OperationRequest {
    pub fn new(action: MeteredAction, input: impl Into<String>) -> Self {
        Self {
            action,
            input: input.into(),
            instruction: None,
        }
    }

    pub fn with_instruction(mut self, instruction: impl Into<String>) -> Self {
        self.instruction = Some(instruction.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationOutput {
    pub content: String,
}

/// A slow, failure-prone external call that is paid for per success.
#[async_trait]
pub trait PaidOperation: Send + Sync {
    fn name(&self) -> &str;

    async fn invoke(&self, request: &OperationRequest) -> anyhow::Result<OperationOutput>;
}

// ── Receipt ──────────────────────────────────────────────────────

/// Result of a delivered operation.
#[derive(Debug)]
pub struct Receipt {
    pub account_id: String,
    pub action: MeteredAction,
    pub output: OperationOutput,
    /// Coins actually charged; 0 when billing failed.
    pub coins_charged: i64,
    /// Balance after billing. `None` only on an anomaly receipt whose
    /// balance could not be read back.
    pub balance: Option<i64>,
    /// Set when the output was delivered but could not be billed.
    pub anomaly: Option<BillingError>,
}

impl Receipt {
    pub fn is_billed(&self) -> bool {
        self.anomaly.is_none()
    }
}

// ── Gateway ──────────────────────────────────────────────────────

pub struct MeteredCallGateway {
    wallet: Arc<WalletManager>,
    quota: Arc<QuotaTracker>,
    operation: Arc<dyn PaidOperation>,
    pricing: Pricing,
    mode: BillingMode,
    timeout: Duration,
}

impl MeteredCallGateway {
    pub fn new(
        wallet: Arc<WalletManager>,
        quota: Arc<QuotaTracker>,
        operation: Arc<dyn PaidOperation>,
    ) -> Self {
        Self {
            wallet,
            quota,
            operation,
            pricing: Pricing::default(),
            mode: BillingMode::default(),
            timeout: DEFAULT_OPERATION_TIMEOUT,
        }
    }

    pub fn with_pricing(mut self, pricing: Pricing) -> Self {
        self.pricing = pricing;
        self
    }

    pub fn with_mode(mut self, mode: BillingMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn mode(&self) -> BillingMode {
        self.mode
    }

    pub fn pricing(&self) -> &Pricing {
        &self.pricing
    }

    /// Run `request` at its configured price.
    pub async fn authorize_and_bill(
        &self,
        account_id: &str,
        request: OperationRequest,
    ) -> Result<Receipt, BillingError> {
        let cost = self.pricing.price(request.action);
        self.authorize_and_bill_at(account_id, request.action, cost, request)
            .await
    }

    /// Run `request` billed as `action` for an explicit `cost`.
    pub async fn authorize_and_bill_at(
        &self,
        account_id: &str,
        action: MeteredAction,
        cost: i64,
        request: OperationRequest,
    ) -> Result<Receipt, BillingError> {
        if cost <= 0 {
            return Err(BillingError::InvalidAmount(cost));
        }

        let hold = match self.mode {
            BillingMode::PostDebit => {
                self.authorize(account_id, cost)?;
                None
            }
            BillingMode::Reserve => Some(self.reserve(account_id, action, cost)?),
        };
        tracing::debug!(account_id, action = action.key(), cost, "Metered call authorized");

        let call = BillingCall {
            wallet: Arc::clone(&self.wallet),
            quota: Arc::clone(&self.quota),
            operation: Arc::clone(&self.operation),
            timeout: self.timeout,
            account_id: account_id.to_string(),
            action,
            cost,
        };

        // Detached on drop: the caller going away must not stop billing.
        let handle = tokio::spawn(async move { call.run(request, hold).await });
        handle.await.map_err(|e| {
            tracing::error!(account_id, action = action.key(), "Metered call task failed: {e}");
            BillingError::ExternalServiceUnavailable(format!("operation task failed: {e}"))
        })?
    }

    /// Point-in-time balance and quota check.
    fn authorize(&self, account_id: &str, cost: i64) -> Result<(), BillingError> {
        let limits = self.quota.limits_for(account_id)?;

        let available = self.wallet.ledger().sum_balance(account_id)?;
        if available < cost {
            return Err(BillingError::InsufficientBalance {
                required: cost,
                available,
            });
        }

        self.quota
            .check_allowance(account_id, limits.daily, limits.monthly)?
            .into_result()
    }

    /// Quota check and hold debit in one transaction.
    fn reserve(
        &self,
        account_id: &str,
        action: MeteredAction,
        cost: i64,
    ) -> Result<Reservation, BillingError> {
        let limits = self.quota.limits_for(account_id)?;
        self.wallet
            .reserve_with(account_id, cost, action.key(), action.label(), |tx| {
                self.quota
                    .check_allowance_in(tx, account_id, limits, true)?
                    .into_result()
            })
    }
}

/// The invoke+bill phase, owned by its own task.
struct BillingCall {
    wallet: Arc<WalletManager>,
    quota: Arc<QuotaTracker>,
    operation: Arc<dyn PaidOperation>,
    timeout: Duration,
    account_id: String,
    action: MeteredAction,
    cost: i64,
}

impl BillingCall {
    async fn run(
        self,
        request: OperationRequest,
        hold: Option<Reservation>,
    ) -> Result<Receipt, BillingError> {
        let outcome = tokio::time::timeout(self.timeout, self.operation.invoke(&request)).await;
        let output = match outcome {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => return Err(self.unbilled(hold, format!("{}: {e}", self.operation.name()))),
            Err(_) => {
                return Err(self.unbilled(
                    hold,
                    format!("{} timed out after {:?}", self.operation.name(), self.timeout),
                ))
            }
        };

        let account_id = self.account_id.as_str();
        let key = self.action.key();
        let billed = match &hold {
            None => self
                .wallet
                .debit_with(account_id, self.cost, self.action.label(), |tx, entry_id| {
                    self.quota.record(tx, account_id, key, self.cost, entry_id)
                })
                .map(|debit| debit.balance),
            Some(reservation) => self.wallet.commit_reservation_with(reservation, |tx, entry_id| {
                self.quota.record(tx, account_id, key, self.cost, entry_id)
            }),
        };

        match billed {
            Ok(balance) => {
                tracing::info!(account_id, action = key, cost = self.cost, balance, "Metered call billed");
                Ok(Receipt {
                    account_id: self.account_id.clone(),
                    action: self.action,
                    output,
                    coins_charged: self.cost,
                    balance: Some(balance),
                    anomaly: None,
                })
            }
            Err(e) => Ok(self.anomaly(output, e)),
        }
    }

    /// External call failed: nothing is charged.
    fn unbilled(&self, hold: Option<Reservation>, reason: String) -> BillingError {
        tracing::warn!(
            account_id = %self.account_id,
            action = self.action.key(),
            "External operation failed, not billed: {reason}"
        );
        if let Some(reservation) = hold {
            if let Err(e) = self.wallet.release_reservation(&reservation.id, "external failure") {
                // Left pending; the stale sweep releases it later.
                tracing::error!(
                    account_id = %self.account_id,
                    reservation_id = %reservation.id,
                    "Failed to release hold: {e}"
                );
            }
        }
        BillingError::ExternalServiceUnavailable(reason)
    }

    /// Delivered but not billed: log, record an incident, keep the output.
    fn anomaly(&self, output: OperationOutput, cause: BillingError) -> Receipt {
        tracing::error!(
            account_id = %self.account_id,
            action = self.action.key(),
            cost = self.cost,
            "Operation delivered but billing failed: {cause}"
        );

        let ledger = self.wallet.ledger();
        let incident = Incident {
            id: 0,
            kind: IncidentKind::BillingAnomaly,
            account_id: Some(self.account_id.clone()),
            reference: None,
            amount: Some(self.cost),
            detail: format!("{} delivered but not billed: {cause}", self.action.key()),
            created_at: 0,
        };
        if let Err(e) = ledger.record_incident(&incident) {
            tracing::error!(account_id = %self.account_id, "Failed to record billing incident: {e}");
        }

        let balance = match ledger.sum_balance(&self.account_id) {
            Ok(balance) => Some(balance),
            Err(e) => {
                tracing::error!(account_id = %self.account_id, "Failed to read balance after billing anomaly: {e}");
                None
            }
        };
        Receipt {
            account_id: self.account_id.clone(),
            action: self.action,
            output,
            coins_charged: 0,
            balance,
            anomaly: Some(BillingError::OperationalAnomaly {
                account_id: self.account_id.clone(),
                action: self.action.key().to_string(),
                reason: cause.to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::billing::accounts::AccountDirectory;
    use crate::billing::clock::WindowZone;
    use crate::billing::ledger::test_support::make_store;
    use crate::billing::quota::QuotaLimits;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;
    use tokio::sync::{mpsc, Semaphore};

    /// Echoes the input, or fails when `fail` is set.
    struct EchoOperation {
        fail: bool,
        delay: Duration,
        calls: AtomicUsize,
    }

    impl EchoOperation {
        fn ok() -> Self {
            Self {
                fail: false,
                delay: Duration::ZERO,
                calls: AtomicUsize::new(0),
            }
        }

        fn failing() -> Self {
            Self {
                fail: true,
                ..Self::ok()
            }
        }

        fn slow(delay: Duration) -> Self {
            Self { delay, ..Self::ok() }
        }
    }

    #[async_trait]
    impl PaidOperation for EchoOperation {
        fn name(&self) -> &str {
            "echo"
        }

        async fn invoke(&self, request: &OperationRequest) -> anyhow::Result<OperationOutput> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            if self.fail {
                anyhow::bail!("provider returned 503");
            }
            Ok(OperationOutput {
                content: format!("polished: {}", request.input),
            })
        }
    }

    /// Announces each start and blocks until a permit is released.
    struct GatedOperation {
        started: mpsc::UnboundedSender<()>,
        gate: Arc<Semaphore>,
    }

    #[async_trait]
    impl PaidOperation for GatedOperation {
        fn name(&self) -> &str {
            "gated"
        }

        async fn invoke(&self, request: &OperationRequest) -> anyhow::Result<OperationOutput> {
            let _ = self.started.send(());
            let permit = self.gate.acquire().await?;
            permit.forget();
            Ok(OperationOutput {
                content: request.input.clone(),
            })
        }
    }

    struct Harness {
        _tmp: TempDir,
        wallet: Arc<WalletManager>,
        quota: Arc<QuotaTracker>,
        account_id: String,
    }

    fn harness(grant: i64) -> Harness {
        let (tmp, store) = make_store();
        let account = AccountDirectory::new(Arc::clone(&store))
            .open_account("ada@example.com", grant, QuotaLimits::default())
            .unwrap();
        Harness {
            _tmp: tmp,
            wallet: Arc::new(WalletManager::new(Arc::clone(&store))),
            quota: Arc::new(QuotaTracker::new(store, WindowZone::Local)),
            account_id: account.id,
        }
    }

    impl Harness {
        fn gateway(&self, operation: Arc<dyn PaidOperation>) -> MeteredCallGateway {
            MeteredCallGateway::new(Arc::clone(&self.wallet), Arc::clone(&self.quota), operation)
        }

        fn usage_count(&self) -> u32 {
            self.quota.current_daily_count(&self.account_id).unwrap()
        }
    }

    fn gated() -> (Arc<GatedOperation>, mpsc::UnboundedReceiver<()>, Arc<Semaphore>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let gate = Arc::new(Semaphore::new(0));
        let op = Arc::new(GatedOperation {
            started: tx,
            gate: Arc::clone(&gate),
        });
        (op, rx, gate)
    }

    #[test]
    fn action_keys_and_labels() {
        assert_eq!(MeteredAction::from_key("edit_report"), Some(MeteredAction::EditReport));
        assert_eq!(MeteredAction::from_key("nope"), None);
        assert_eq!(MeteredAction::GenerateReport.label(), "Generate Monthly Report");
        assert_eq!(Pricing::default().price(MeteredAction::PolishTask), 50);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn success_is_billed_once() {
        let h = harness(1000);
        let op = Arc::new(EchoOperation::ok());
        let gateway = h.gateway(op.clone());

        let receipt = gateway
            .authorize_and_bill(&h.account_id, OperationRequest::new(MeteredAction::PolishTask, "fix bug"))
            .await
            .unwrap();

        assert!(receipt.is_billed());
        assert_eq!(receipt.output.content, "polished: fix bug");
        assert_eq!(receipt.coins_charged, 50);
        assert_eq!(receipt.balance, Some(950));
        assert_eq!(h.wallet.get_balance(&h.account_id).unwrap(), 950);
        assert_eq!(h.usage_count(), 1);

        let entries = h.wallet.ledger_entries(&h.account_id, 10).unwrap();
        assert_eq!(entries[0].description, "Polish Task with AI");
        assert_eq!(op.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn failure_is_not_billed() {
        let h = harness(1000);
        let gateway = h.gateway(Arc::new(EchoOperation::failing()));

        let err = gateway
            .authorize_and_bill(&h.account_id, OperationRequest::new(MeteredAction::PolishTask, "x"))
            .await
            .unwrap_err();

        assert!(matches!(err, BillingError::ExternalServiceUnavailable(_)));
        assert_eq!(h.wallet.get_balance(&h.account_id).unwrap(), 1000);
        assert_eq!(h.wallet.ledger_entries(&h.account_id, 10).unwrap().len(), 1);
        assert_eq!(h.usage_count(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn timeout_is_not_billed() {
        let h = harness(1000);
        let gateway = h
            .gateway(Arc::new(EchoOperation::slow(Duration::from_secs(5))))
            .with_timeout(Duration::from_millis(50));

        let err = gateway
            .authorize_and_bill(&h.account_id, OperationRequest::new(MeteredAction::GenerateReport, "x"))
            .await
            .unwrap_err();

        assert!(matches!(err, BillingError::ExternalServiceUnavailable(ref m) if m.contains("timed out")));
        assert_eq!(h.wallet.get_balance(&h.account_id).unwrap(), 1000);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn rejected_requests_never_call_out() {
        let h = harness(40);
        let op = Arc::new(EchoOperation::ok());
        let gateway = h.gateway(op.clone());

        let err = gateway
            .authorize_and_bill(&h.account_id, OperationRequest::new(MeteredAction::PolishTask, "x"))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            BillingError::InsufficientBalance {
                required: 50,
                available: 40
            }
        ));

        let err = gateway
            .authorize_and_bill("ghost", OperationRequest::new(MeteredAction::PolishTask, "x"))
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::AccountNotFound(_)));
        assert_eq!(op.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn daily_limit_blocks_before_call() {
        let h = harness(1000);
        AccountDirectory::new(Arc::clone(h.wallet.ledger()))
            .set_limits(&h.account_id, QuotaLimits { daily: 1, monthly: 300 })
            .unwrap();
        let op = Arc::new(EchoOperation::ok());
        let gateway = h.gateway(op.clone());

        gateway
            .authorize_and_bill(&h.account_id, OperationRequest::new(MeteredAction::EditReport, "x"))
            .await
            .unwrap();
        let err = gateway
            .authorize_and_bill(&h.account_id, OperationRequest::new(MeteredAction::EditReport, "x"))
            .await
            .unwrap_err();

        assert!(matches!(err, BillingError::DailyLimitExceeded { limit: 1, used: 1 }));
        assert_eq!(op.calls.load(Ordering::SeqCst), 1);
        assert_eq!(h.wallet.get_balance(&h.account_id).unwrap(), 980);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn post_debit_race_surfaces_anomaly() {
        let h = harness(50);
        let (op, mut started, gate) = gated();
        let gateway = Arc::new(h.gateway(op));

        let spawn_call = |gateway: Arc<MeteredCallGateway>, account_id: String| {
            tokio::spawn(async move {
                gateway
                    .authorize_and_bill(&account_id, OperationRequest::new(MeteredAction::PolishTask, "x"))
                    .await
            })
        };
        let first = spawn_call(Arc::clone(&gateway), h.account_id.clone());
        let second = spawn_call(Arc::clone(&gateway), h.account_id.clone());

        // Both passed authorization against the same 50 coins
        started.recv().await.unwrap();
        started.recv().await.unwrap();
        gate.add_permits(2);

        let receipts = [first.await.unwrap().unwrap(), second.await.unwrap().unwrap()];
        assert_eq!(receipts.iter().filter(|r| r.is_billed()).count(), 1);
        let loser = receipts.iter().find(|r| !r.is_billed()).unwrap();
        assert!(matches!(loser.anomaly, Some(BillingError::OperationalAnomaly { .. })));
        assert_eq!(loser.coins_charged, 0);
        assert_eq!(loser.output.content, "x");

        assert_eq!(h.wallet.get_balance(&h.account_id).unwrap(), 0);
        assert_eq!(h.usage_count(), 1);
        let incidents = h.wallet.ledger().incidents(10).unwrap();
        assert_eq!(incidents.len(), 1);
        assert_eq!(incidents[0].kind, IncidentKind::BillingAnomaly);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn reserve_mode_rejects_second_request_up_front() {
        let h = harness(50);
        let (op, mut started, gate) = gated();
        let gateway = Arc::new(h.gateway(op).with_mode(BillingMode::Reserve));

        let first = {
            let gateway = Arc::clone(&gateway);
            let account_id = h.account_id.clone();
            tokio::spawn(async move {
                gateway
                    .authorize_and_bill(&account_id, OperationRequest::new(MeteredAction::PolishTask, "x"))
                    .await
            })
        };
        started.recv().await.unwrap();

        let err = gateway
            .authorize_and_bill(&h.account_id, OperationRequest::new(MeteredAction::PolishTask, "y"))
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::InsufficientBalance { available: 0, .. }));

        gate.add_permits(1);
        let receipt = first.await.unwrap().unwrap();
        assert!(receipt.is_billed());
        assert_eq!(receipt.balance, Some(0));
        assert_eq!(h.usage_count(), 1);
        assert!(h.wallet.pending_reservations(&h.account_id).unwrap().is_empty());
        assert!(h.wallet.ledger().incidents(10).unwrap().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn reserve_mode_failure_nets_to_zero() {
        let h = harness(1000);
        let gateway = h
            .gateway(Arc::new(EchoOperation::failing()))
            .with_mode(BillingMode::Reserve);

        let err = gateway
            .authorize_and_bill(&h.account_id, OperationRequest::new(MeteredAction::GenerateReport, "x"))
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::ExternalServiceUnavailable(_)));

        assert_eq!(h.wallet.get_balance(&h.account_id).unwrap(), 1000);
        assert_eq!(h.usage_count(), 0);
        let entries = h.wallet.ledger_entries(&h.account_id, 10).unwrap();
        assert_eq!(entries.len(), 3);
        assert!(entries[0].description.starts_with("Release hold: generate_report"));
        assert!(entries[1].description.starts_with("Hold: "));
        assert!(h.wallet.ledger().audit(&h.account_id).unwrap().is_consistent());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn reserve_mode_counts_pending_holds_against_quota() {
        let h = harness(1000);
        AccountDirectory::new(Arc::clone(h.wallet.ledger()))
            .set_limits(&h.account_id, QuotaLimits { daily: 1, monthly: 300 })
            .unwrap();
        let (op, mut started, gate) = gated();
        let gateway = Arc::new(h.gateway(op).with_mode(BillingMode::Reserve));

        let first = {
            let gateway = Arc::clone(&gateway);
            let account_id = h.account_id.clone();
            tokio::spawn(async move {
                gateway
                    .authorize_and_bill(&account_id, OperationRequest::new(MeteredAction::EditReport, "x"))
                    .await
            })
        };
        started.recv().await.unwrap();

        let err = gateway
            .authorize_and_bill(&h.account_id, OperationRequest::new(MeteredAction::EditReport, "y"))
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::DailyLimitExceeded { limit: 1, used: 1 }));

        gate.add_permits(1);
        assert!(first.await.unwrap().unwrap().is_billed());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn stale_sweep_leaves_running_call_billable() {
        let h = harness(100);
        let (op, mut started, gate) = gated();
        let gateway = Arc::new(h.gateway(op).with_mode(BillingMode::Reserve));

        let call = {
            let gateway = Arc::clone(&gateway);
            let account_id = h.account_id.clone();
            tokio::spawn(async move {
                gateway
                    .authorize_and_bill(&account_id, OperationRequest::new(MeteredAction::PolishTask, "x"))
                    .await
            })
        };
        started.recv().await.unwrap();

        // Every hold is old enough here; the running one must still survive
        assert!(h.wallet.release_stale_reservations(-1).unwrap().is_empty());

        gate.add_permits(1);
        let receipt = call.await.unwrap().unwrap();
        assert!(receipt.is_billed());
        assert_eq!(receipt.coins_charged, 50);
        assert_eq!(receipt.balance, Some(50));
        assert_eq!(h.usage_count(), 1);
        assert!(h.wallet.ledger().incidents(10).unwrap().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn anomaly_without_readable_balance_reports_none() {
        let h = harness(100);
        let (op, mut started, gate) = gated();
        let gateway = Arc::new(h.gateway(op));

        let call = {
            let gateway = Arc::clone(&gateway);
            let account_id = h.account_id.clone();
            tokio::spawn(async move {
                gateway
                    .authorize_and_bill(&account_id, OperationRequest::new(MeteredAction::PolishTask, "x"))
                    .await
            })
        };
        started.recv().await.unwrap();

        // Storage breaks while the call runs: neither debit nor balance read can succeed
        h.wallet
            .ledger()
            .conn()
            .unwrap()
            .execute_batch("DROP TABLE ledger_entries;")
            .unwrap();

        gate.add_permits(1);
        let receipt = call.await.unwrap().unwrap();
        assert!(!receipt.is_billed());
        assert_eq!(receipt.output.content, "x");
        assert_eq!(receipt.coins_charged, 0);
        assert_eq!(receipt.balance, None);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn cancelled_caller_still_bills() {
        let h = harness(1000);
        let (op, mut started, gate) = gated();
        let gateway = Arc::new(h.gateway(op));

        let caller = {
            let gateway = Arc::clone(&gateway);
            let account_id = h.account_id.clone();
            tokio::spawn(async move {
                gateway
                    .authorize_and_bill(&account_id, OperationRequest::new(MeteredAction::PolishTask, "x"))
                    .await
            })
        };
        started.recv().await.unwrap();
        caller.abort();
        assert!(caller.await.unwrap_err().is_cancelled());

        gate.add_permits(1);
        let mut balance = 1000;
        for _ in 0..100 {
            balance = h.wallet.get_balance(&h.account_id).unwrap();
            if balance != 1000 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(balance, 950);
        assert_eq!(h.usage_count(), 1);
    }

    #[tokio::test]
    async fn non_positive_cost_rejected() {
        let h = harness(1000);
        let gateway = h.gateway(Arc::new(EchoOperation::ok()));
        let err = gateway
            .authorize_and_bill_at(
                &h.account_id,
                MeteredAction::PolishTask,
                0,
                OperationRequest::new(MeteredAction::PolishTask, "x"),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::InvalidAmount(0)));
    }
}
