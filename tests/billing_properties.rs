//! End-to-end wallet properties over a real on-disk ledger.

use async_trait::async_trait;
use coinledger::billing::{
    BillingError, BillingMode, GatewayError, MeteredAction, OperationOutput, OperationRequest,
    PaidOperation, PaymentFact, PaymentGateway, PaymentStatus, QuotaLimits, ReconcileOutcome,
    TopUpSession,
};
use coinledger::{App, Config};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

struct CountingOperation {
    calls: AtomicUsize,
    fail: bool,
}

impl CountingOperation {
    fn ok() -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            fail: false,
        })
    }

    fn failing() -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            fail: true,
        })
    }
}

#[async_trait]
impl PaidOperation for CountingOperation {
    fn name(&self) -> &str {
        "counting"
    }

    async fn invoke(&self, request: &OperationRequest) -> anyhow::Result<OperationOutput> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::task::yield_now().await;
        if self.fail {
            anyhow::bail!("provider down");
        }
        Ok(OperationOutput {
            content: request.input.to_uppercase(),
        })
    }
}

#[derive(Default)]
struct StaticGateway {
    facts: Mutex<HashMap<String, PaymentFact>>,
    verify_calls: AtomicUsize,
}

impl StaticGateway {
    fn with_payment(self, reference: &str, payer: &str, amount_minor: i64) -> Self {
        self.facts.lock().unwrap().insert(
            reference.to_string(),
            PaymentFact {
                reference: reference.to_string(),
                status: PaymentStatus::Success,
                amount_minor,
                currency: "NGN".into(),
                payer_identity: payer.to_string(),
            },
        );
        self
    }
}

#[async_trait]
impl PaymentGateway for StaticGateway {
    fn name(&self) -> &str {
        "static"
    }

    async fn initialize(
        &self,
        _payer_identity: &str,
        _amount_minor: i64,
        reference: &str,
    ) -> Result<TopUpSession, GatewayError> {
        Ok(TopUpSession {
            authorization_url: format!("https://checkout.test/{reference}"),
            reference: reference.to_string(),
        })
    }

    async fn verify(&self, reference: &str) -> Result<PaymentFact, GatewayError> {
        self.verify_calls.fetch_add(1, Ordering::SeqCst);
        tokio::task::yield_now().await;
        self.facts
            .lock()
            .unwrap()
            .get(reference)
            .cloned()
            .ok_or_else(|| GatewayError::Rejected("Transaction reference not found".into()))
    }
}

fn open_app(mode: BillingMode) -> (TempDir, App) {
    let tmp = TempDir::new().unwrap();
    let mut config = Config::default();
    config.storage.db_path = Some(tmp.path().join("wallet.db"));
    config.billing.mode = mode;
    let app = App::open(config).unwrap();
    (tmp, app)
}

fn limits(daily: u32, monthly: u32) -> QuotaLimits {
    QuotaLimits { daily, monthly }
}

fn polish(input: &str) -> OperationRequest {
    OperationRequest::new(MeteredAction::PolishTask, input)
}

#[tokio::test]
async fn signup_spend_and_top_up_scenario() {
    let (_tmp, app) = open_app(BillingMode::PostDebit);
    let account = app
        .accounts
        .open_account("ada@example.com", 1000, limits(20, 300))
        .unwrap();
    assert_eq!(app.wallet.get_balance(&account.id).unwrap(), 1000);

    let gateway = app.metered_gateway_with(CountingOperation::ok());
    let receipt = gateway
        .authorize_and_bill(&account.id, polish("fix login"))
        .await
        .unwrap();
    assert_eq!(receipt.output.content, "FIX LOGIN");
    assert_eq!(receipt.coins_charged, 50);
    assert_eq!(receipt.balance, Some(950));

    let payments = Arc::new(StaticGateway::default().with_payment(
        "pay_123",
        "ada@example.com",
        100_000,
    ));
    let reconciler = app.reconciler_with(payments.clone()).unwrap();

    let first = reconciler.reconcile("pay_123").await.unwrap();
    assert!(first.is_credited());
    assert_eq!(first.balance(), 2450);

    let replay = reconciler.reconcile("pay_123").await.unwrap();
    assert!(matches!(replay, ReconcileOutcome::AlreadyProcessed { balance: 2450, .. }));
    assert_eq!(payments.verify_calls.load(Ordering::SeqCst), 1);

    let audit = app.ledger.audit(&account.id).unwrap();
    assert!(audit.is_consistent());
    assert_eq!(audit.ledger_balance, 2450);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_reserved_calls_never_overspend() {
    let (_tmp, app) = open_app(BillingMode::Reserve);
    let account = app
        .accounts
        .open_account("bob@example.com", 120, limits(100, 1000))
        .unwrap();
    let gateway = Arc::new(app.metered_gateway_with(CountingOperation::ok()));

    let mut handles = Vec::new();
    for i in 0..10 {
        let gateway = Arc::clone(&gateway);
        let account_id = account.id.clone();
        handles.push(tokio::spawn(async move {
            gateway
                .authorize_and_bill(&account_id, polish(&format!("task {i}")))
                .await
        }));
    }

    let mut billed = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(receipt) => {
                assert!(receipt.is_billed());
                billed += 1;
            }
            Err(BillingError::InsufficientBalance { .. }) => {}
            Err(other) => panic!("unexpected error: {other}"),
        }
    }

    assert_eq!(billed, 2);
    assert_eq!(app.wallet.get_balance(&account.id).unwrap(), 20);
    assert!(app.wallet.pending_reservations(&account.id).unwrap().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_post_debit_calls_keep_balance_non_negative() {
    let (_tmp, app) = open_app(BillingMode::PostDebit);
    let account = app
        .accounts
        .open_account("cy@example.com", 120, limits(100, 1000))
        .unwrap();
    let gateway = Arc::new(app.metered_gateway_with(CountingOperation::ok()));

    let mut handles = Vec::new();
    for i in 0..10 {
        let gateway = Arc::clone(&gateway);
        let account_id = account.id.clone();
        handles.push(tokio::spawn(async move {
            gateway
                .authorize_and_bill(&account_id, polish(&format!("task {i}")))
                .await
        }));
    }

    let mut billed = 0i64;
    for handle in handles {
        if let Ok(receipt) = handle.await.unwrap() {
            if receipt.is_billed() {
                billed += 1;
            }
        }
    }

    let balance = app.wallet.get_balance(&account.id).unwrap();
    assert!(balance >= 0);
    assert!(billed <= 2);
    assert_eq!(balance, 120 - 50 * billed);
    assert!(app.ledger.audit(&account.id).unwrap().is_consistent());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_reconciles_credit_once() {
    let (_tmp, app) = open_app(BillingMode::PostDebit);
    let account = app
        .accounts
        .open_account("dee@example.com", 0, limits(20, 300))
        .unwrap();
    let payments = Arc::new(StaticGateway::default().with_payment(
        "pay_dup",
        "DEE@example.com",
        200_000,
    ));
    let reconciler = Arc::new(app.reconciler_with(payments).unwrap());

    let mut handles = Vec::new();
    for _ in 0..8 {
        let reconciler = Arc::clone(&reconciler);
        handles.push(tokio::spawn(async move { reconciler.reconcile("pay_dup").await }));
    }

    let mut credited = 0;
    for handle in handles {
        let outcome = handle.await.unwrap().unwrap();
        if outcome.is_credited() {
            credited += 1;
        }
        assert_eq!(outcome.balance(), 3000);
    }

    assert_eq!(credited, 1);
    assert_eq!(app.wallet.get_balance(&account.id).unwrap(), 3000);
}

#[tokio::test]
async fn failed_operation_is_never_billed() {
    for mode in [BillingMode::PostDebit, BillingMode::Reserve] {
        let (_tmp, app) = open_app(mode);
        let account = app
            .accounts
            .open_account("eve@example.com", 500, limits(20, 300))
            .unwrap();
        let operation = CountingOperation::failing();
        let gateway = app.metered_gateway_with(operation.clone());

        let err = gateway
            .authorize_and_bill(&account.id, polish("anything"))
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::ExternalServiceUnavailable(_)));
        assert_eq!(operation.calls.load(Ordering::SeqCst), 1);
        assert_eq!(app.wallet.get_balance(&account.id).unwrap(), 500);
        assert_eq!(app.quota.current_daily_count(&account.id).unwrap(), 0);
    }
}

#[tokio::test]
async fn daily_quota_boundary_rejects_before_calling_out() {
    let (_tmp, app) = open_app(BillingMode::PostDebit);
    let account = app
        .accounts
        .open_account("fay@example.com", 1000, limits(2, 300))
        .unwrap();
    let operation = CountingOperation::ok();
    let gateway = app.metered_gateway_with(operation.clone());

    for _ in 0..2 {
        gateway
            .authorize_and_bill(&account.id, polish("task"))
            .await
            .unwrap();
    }
    let err = gateway
        .authorize_and_bill(&account.id, polish("task"))
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        BillingError::DailyLimitExceeded { limit: 2, used: 2 }
    ));
    assert_eq!(operation.calls.load(Ordering::SeqCst), 2);
    assert_eq!(app.wallet.get_balance(&account.id).unwrap(), 900);
}

#[tokio::test]
async fn insufficient_balance_rejects_before_calling_out() {
    let (_tmp, app) = open_app(BillingMode::PostDebit);
    let account = app
        .accounts
        .open_account("gus@example.com", 100, limits(20, 300))
        .unwrap();
    let operation = CountingOperation::ok();
    let gateway = app.metered_gateway_with(operation.clone());

    let err = gateway
        .authorize_and_bill(
            &account.id,
            OperationRequest::new(MeteredAction::GenerateReport, "- task").with_instruction("May"),
        )
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        BillingError::InsufficientBalance {
            required: 200,
            available: 100
        }
    ));
    assert_eq!(operation.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn top_up_session_carries_generated_reference() {
    let (_tmp, app) = open_app(BillingMode::PostDebit);
    let account = app
        .accounts
        .open_account("hal@example.com", 0, limits(20, 300))
        .unwrap();
    let reconciler = app
        .reconciler_with(Arc::new(StaticGateway::default()))
        .unwrap();

    let session = reconciler.initiate_top_up(&account.id, 1000).await.unwrap();
    assert!(session.reference.starts_with("cl_"));
    assert!(session.authorization_url.ends_with(&session.reference));

    let err = reconciler.initiate_top_up(&account.id, 999).await.unwrap_err();
    assert!(matches!(err, BillingError::TopUpBelowMinimum { .. }));
}
