use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use coinledger::billing::{
    BillingError, Direction, MeteredAction, OperationRequest, QuotaLimits, ReconcileOutcome,
};
use coinledger::{App, Config};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// Prepaid coin wallet: ledger, quotas, metered AI calls and top-ups.
#[derive(Parser, Debug)]
#[command(name = "coinledger", version, about)]
struct Cli {
    /// Config file (defaults to the platform config dir)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Open an account with the signup grant
    OpenAccount {
        /// Payer email used with the payment gateway
        #[arg(long)]
        payer: String,
        /// Override the configured signup grant
        #[arg(long)]
        grant: Option<i64>,
    },
    /// Show an account's balance and quota usage
    Balance { account: String },
    /// List recent ledger entries
    Ledger {
        account: String,
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Credit coins manually (idempotent with --reference)
    Credit {
        account: String,
        amount: i64,
        #[arg(long, default_value = "Manual credit")]
        description: String,
        #[arg(long)]
        reference: Option<String>,
    },
    /// Start a top-up checkout for an amount in major currency units
    TopUp { account: String, amount: i64 },
    /// Verify a payment reference and credit it once
    Reconcile { reference: String },
    /// Run a metered AI action
    Run {
        account: String,
        #[arg(value_enum)]
        action: ActionArg,
        /// Input text (task, task list or report)
        #[arg(long, conflicts_with = "input_file")]
        input: Option<String>,
        #[arg(long)]
        input_file: Option<PathBuf>,
        /// Report period title or edit instruction
        #[arg(long)]
        instruction: Option<String>,
    },
    /// Set an account's daily and monthly operation limits
    SetLimits {
        account: String,
        #[arg(long)]
        daily: u32,
        #[arg(long)]
        monthly: u32,
    },
    /// Revenue and usage statistics
    Stats {
        #[arg(long, default_value_t = 50)]
        top: usize,
    },
    /// Operator incidents needing manual reconciliation
    Incidents {
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Compare cached balance with the ledger sum
    Audit { account: String },
    /// Release reservation holds left pending too long
    ReleaseStale {
        /// Override the configured maximum age
        #[arg(long)]
        max_age_secs: Option<u64>,
    },
}

#[derive(Copy, Clone, Debug, ValueEnum)]
enum ActionArg {
    Polish,
    Report,
    Edit,
}

impl From<ActionArg> for MeteredAction {
    fn from(arg: ActionArg) -> Self {
        match arg {
            ActionArg::Polish => Self::PolishTask,
            ActionArg::Report => Self::GenerateReport,
            ActionArg::Edit => Self::EditReport,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("coinledger=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref())?;
    let app = App::open(config)?;

    match cli.command {
        Commands::OpenAccount { payer, grant } => {
            let grant = grant.unwrap_or(app.config.billing.signup_grant);
            let account = app
                .accounts
                .open_account(&payer, grant, app.config.default_limits())?;
            println!("{}", account.id);
        }
        Commands::Balance { account } => {
            let balance = app.wallet.get_balance(&account)?;
            let limits = app.quota.limits_for(&account)?;
            println!("balance: {balance} coins");
            println!(
                "today:   {}/{} operations",
                app.quota.current_daily_count(&account)?,
                limits.daily
            );
            println!(
                "month:   {}/{} operations",
                app.quota.current_monthly_count(&account)?,
                limits.monthly
            );
        }
        Commands::Ledger { account, limit } => {
            for entry in app.wallet.ledger_entries(&account, limit)? {
                let sign = match entry.direction {
                    Direction::Credit => '+',
                    Direction::Debit => '-',
                };
                println!(
                    "{:>6}  {}  {sign}{:<6}  {}{}",
                    entry.id,
                    format_millis(entry.created_at),
                    entry.amount,
                    entry.description,
                    entry
                        .external_reference
                        .map(|r| format!("  [{r}]"))
                        .unwrap_or_default()
                );
            }
        }
        Commands::Credit {
            account,
            amount,
            description,
            reference,
        } => {
            let outcome = app
                .wallet
                .credit(&account, amount, &description, reference.as_deref())?;
            if outcome.is_applied() {
                println!("credited {amount}; balance {}", outcome.balance());
            } else {
                println!("already processed; balance {}", outcome.balance());
            }
        }
        Commands::TopUp { account, amount } => {
            let session = app.reconciler()?.initiate_top_up(&account, amount).await?;
            println!("reference: {}", session.reference);
            println!("pay at:    {}", session.authorization_url);
        }
        Commands::Reconcile { reference } => match app.reconciler()?.reconcile(&reference).await? {
            ReconcileOutcome::Credited { coins, balance, .. } => {
                println!("credited {coins} coins; balance {balance}");
            }
            ReconcileOutcome::AlreadyProcessed { balance, .. } => {
                println!("already processed; balance {balance}");
            }
        },
        Commands::Run {
            account,
            action,
            input,
            input_file,
            instruction,
        } => {
            let input = match (input, input_file) {
                (Some(text), _) => text,
                (None, Some(path)) => std::fs::read_to_string(&path)
                    .with_context(|| format!("failed to read {}", path.display()))?,
                (None, None) => anyhow::bail!("either --input or --input-file is required"),
            };
            let mut request = OperationRequest::new(action.into(), input);
            if let Some(instruction) = instruction {
                request = request.with_instruction(instruction);
            }

            let receipt = app
                .metered_gateway()?
                .authorize_and_bill(&account, request)
                .await
                .map_err(explain)?;
            println!("{}", receipt.output.content);
            match &receipt.anomaly {
                None => eprintln!(
                    "charged {} coins; balance {}",
                    receipt.coins_charged,
                    receipt.balance.unwrap_or_default()
                ),
                Some(anomaly) => eprintln!("warning: {anomaly}"),
            }
        }
        Commands::SetLimits {
            account,
            daily,
            monthly,
        } => {
            app.accounts
                .set_limits(&account, QuotaLimits { daily, monthly })?;
            println!("limits set: {daily}/day, {monthly}/month");
        }
        Commands::Stats { top } => {
            let report = app.reporting.revenue_report(top)?;
            let rate = app.config.exchange_rate()?;
            println!(
                "revenue:     {} {}",
                rate.format_major(report.revenue_minor),
                rate.currency
            );
            println!("coins sold:  {}", report.coins_sold);
            println!("operations:  {}", report.operations);
            println!("accounts:    {} ({} active)", report.accounts, report.active_accounts);
            for usage in report.per_account {
                println!(
                    "  {:<36}  {:<32}  {:>5} ops  {:>7} coins",
                    usage.account_id, usage.payer_identity, usage.operations, usage.coins_spent
                );
            }
        }
        Commands::Incidents { limit } => {
            for incident in app.ledger.incidents(limit)? {
                println!(
                    "{:>5}  {}  {:<18}  {}  {}",
                    incident.id,
                    format_millis(incident.created_at),
                    incident.kind.as_str(),
                    incident.reference.as_deref().unwrap_or("-"),
                    incident.detail
                );
            }
        }
        Commands::Audit { account } => {
            let audit = app.ledger.audit(&account)?;
            println!("cached: {}", audit.cached_balance);
            println!("ledger: {}", audit.ledger_balance);
            if !audit.is_consistent() {
                anyhow::bail!("balance drift detected for {account}");
            }
            println!("consistent");
        }
        Commands::ReleaseStale { max_age_secs } => {
            let secs = max_age_secs.unwrap_or(app.config.billing.stale_reservation_secs);
            let max_age_ms = i64::try_from(secs.saturating_mul(1000)).unwrap_or(i64::MAX);
            let released = app.wallet.release_stale_reservations(max_age_ms)?;
            println!("released {} stale hold(s)", released.len());
        }
    }

    Ok(())
}

/// Attach the stable error code to billing rejections.
fn explain(err: BillingError) -> anyhow::Error {
    let code = err.code();
    anyhow::Error::new(err).context(format!("request rejected ({code})"))
}

fn format_millis(ms: i64) -> String {
    chrono::DateTime::from_timestamp_millis(ms)
        .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| ms.to_string())
}
