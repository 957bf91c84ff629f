use std::future::Future;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::task::JoinSet;
use tracing::warn;

use crate::application::{BalanceError, BalanceService};
use crate::config::Settings;
use crate::domain::{format_cents, parse_cents, Cents, UserId};
use crate::lock;
use crate::storage::{LedgerStore, Repository};

/// Saldo - per-user balances over an append-only ledger
#[derive(Parser)]
#[command(name = "saldo")]
#[command(about = "Deposit and withdraw against ledger-derived balances with per-user locking")]
#[command(version)]
pub struct Cli {
    #[command(flatten)]
    pub settings: Settings,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Create the ledger schema
    Init,

    /// Credit an amount to a user
    Deposit {
        /// User ID
        user_id: UserId,

        /// Amount (e.g., "50.00" or "50")
        #[arg(allow_hyphen_values = true)]
        amount: String,
    },

    /// Debit an amount from a user, refusing to overdraw
    Withdraw {
        /// User ID
        user_id: UserId,

        /// Amount (e.g., "50.00" or "50")
        #[arg(allow_hyphen_values = true)]
        amount: String,
    },

    /// Show a user's current balance
    Balance {
        /// User ID
        user_id: UserId,
    },

    /// List a user's ledger entries, newest first
    History {
        /// User ID
        user_id: UserId,

        /// Maximum number of entries to show
        #[arg(short, long)]
        limit: Option<usize>,
    },

    /// Export a user's ledger entries to CSV or JSON
    Export {
        /// User ID
        user_id: UserId,

        /// Format: csv, json
        #[arg(short, long, default_value = "csv")]
        format: String,

        /// Output file (stdout if omitted)
        #[arg(short, long)]
        output: Option<String>,

        /// Maximum number of entries to export
        #[arg(short, long)]
        limit: Option<usize>,
    },

    /// Verify that no balance went below zero
    Check,

    /// Fire concurrent withdrawals for one user and report the outcome
    Contend {
        /// User ID
        user_id: UserId,

        /// Amount of each withdrawal
        amount: String,

        /// Number of concurrent withdrawals
        #[arg(short = 'n', long, default_value_t = 10)]
        requests: usize,
    },
}

impl Cli {
    pub async fn run(self) -> Result<()> {
        self.settings.validate()?;
        let settings = &self.settings;

        match self.command {
            Commands::Init => {
                let repo = Repository::init(&settings.database_url()).await?;
                println!("Database initialized: {}", settings.database);
                repo.close().await;
            }

            Commands::Check => {
                let repo = Repository::init(&settings.database_url()).await?;
                let outcome = run_check_command(&repo).await;
                repo.close().await;
                outcome?;
            }

            Commands::Deposit { user_id, amount } => {
                let amount_cents = parse_amount(&amount)?;
                with_service(settings, move |service| {
                    run_deposit_command(service, user_id, amount_cents)
                })
                .await?;
            }

            Commands::Withdraw { user_id, amount } => {
                let amount_cents = parse_amount(&amount)?;
                with_service(settings, move |service| {
                    run_withdraw_command(service, user_id, amount_cents)
                })
                .await?;
            }

            Commands::Balance { user_id } => {
                with_service(settings, move |service| run_balance_command(service, user_id))
                    .await?;
            }

            Commands::History { user_id, limit } => {
                with_service(settings, move |service| {
                    run_history_command(service, user_id, limit)
                })
                .await?;
            }

            Commands::Export {
                user_id,
                format,
                output,
                limit,
            } => {
                with_service(settings, move |service| {
                    run_export_command(service, user_id, format, output, limit)
                })
                .await?;
            }

            Commands::Contend {
                user_id,
                amount,
                requests,
            } => {
                let amount_cents = parse_amount(&amount)?;
                with_service(settings, move |service| {
                    run_contend_command(service, user_id, amount_cents, requests)
                })
                .await?;
            }
        }

        Ok(())
    }
}

/// Wire the ledger store and lock strategy described by `settings` into a service.
pub async fn build_service(settings: &Settings) -> Result<BalanceService> {
    let service_settings = settings.service_settings()?;
    // A write that cannot get the database within the operation budget fails
    // instead of outliving the lock it was started under
    let repo =
        Repository::init_with(&settings.database_url(), service_settings.operation_timeout())
            .await?;
    let locks = lock::connect(&settings.lock_settings())
        .await
        .context("Failed to set up user locks")?;

    Ok(BalanceService::new(Arc::new(repo), locks, service_settings))
}

/// Build a service, run `command` against it, then shut it down.
async fn with_service<F, Fut>(settings: &Settings, command: F) -> Result<()>
where
    F: FnOnce(Arc<BalanceService>) -> Fut,
    Fut: Future<Output = Result<()>>,
{
    let service = Arc::new(build_service(settings).await?);
    let outcome = command(Arc::clone(&service)).await;
    service.shutdown().await;
    outcome
}

async fn run_deposit_command(
    service: Arc<BalanceService>,
    user_id: UserId,
    amount_cents: Cents,
) -> Result<()> {
    let receipt = service.deposit(user_id, amount_cents).await?;
    println!(
        "Deposited {} to user {} (entry {})",
        format_cents(receipt.applied_amount),
        receipt.user_id,
        receipt.entry_id
    );
    Ok(())
}

async fn run_withdraw_command(
    service: Arc<BalanceService>,
    user_id: UserId,
    amount_cents: Cents,
) -> Result<()> {
    let receipt = service.withdraw(user_id, amount_cents).await?;
    println!(
        "Withdrawn {} from user {} (entry {})",
        format_cents(receipt.applied_amount),
        receipt.user_id,
        receipt.entry_id
    );
    Ok(())
}

async fn run_balance_command(service: Arc<BalanceService>, user_id: UserId) -> Result<()> {
    let balance = service.balance(user_id).await?;
    println!("User {}: {}", user_id, format_cents(balance));
    Ok(())
}

fn parse_amount(amount: &str) -> Result<Cents> {
    parse_cents(amount).context("Invalid amount format. Use '50.00' or '50'")
}

async fn run_history_command(
    service: Arc<BalanceService>,
    user_id: UserId,
    limit: Option<usize>,
) -> Result<()> {
    let entries = service.history(user_id, limit).await?;

    if entries.is_empty() {
        println!("No entries for user {}.", user_id);
        return Ok(());
    }

    println!(
        "{:<8} {:<20} {:<10} {:>12}",
        "ID", "CREATED", "KIND", "AMOUNT"
    );
    println!("{}", "-".repeat(53));
    for entry in &entries {
        println!(
            "{:<8} {:<20} {:<10} {:>12}",
            entry.id,
            entry.created_at.format("%Y-%m-%d %H:%M:%S").to_string(),
            entry.kind.as_str(),
            format_cents(entry.signed_amount())
        );
    }
    Ok(())
}

async fn run_export_command(
    service: Arc<BalanceService>,
    user_id: UserId,
    format: String,
    output: Option<String>,
    limit: Option<usize>,
) -> Result<()> {
    use crate::io::Exporter;
    use std::fs::File;
    use std::io::{stdout, Write};

    let exporter = Exporter::new(&service);

    let writer: Box<dyn Write> = match output.as_deref() {
        Some(path) => {
            let file = File::create(path)
                .with_context(|| format!("Failed to create output file: {}", path))?;
            Box::new(file)
        }
        None => Box::new(stdout()),
    };

    match format.as_str() {
        "csv" => {
            let count = exporter.export_history_csv(user_id, limit, writer).await?;
            if output.is_some() {
                eprintln!("Exported {} entries", count);
            }
        }
        "json" => {
            let snapshot = exporter.export_history_json(user_id, limit, writer).await?;
            if output.is_some() {
                eprintln!(
                    "Exported {} entries, balance {}",
                    snapshot.entries.len(),
                    format_cents(snapshot.balance_cents)
                );
            }
        }
        _ => {
            anyhow::bail!("Invalid export format '{}'. Valid formats: csv, json", format);
        }
    }

    Ok(())
}

async fn run_check_command(repo: &Repository) -> Result<()> {
    println!("Checking ledger integrity...\n");

    let stats = repo.integrity_stats().await?;

    println!("Entries: {}", stats.entry_count);
    println!("Users:   {}", stats.user_count);
    println!();

    if stats.is_healthy() {
        println!("Ledger is consistent.");
        return Ok(());
    }

    println!("Issues found:");
    if stats.invalid_amounts > 0 {
        println!("  - {} entries with a non-positive amount", stats.invalid_amounts);
    }
    for (user_id, balance) in &stats.negative_balances {
        println!(
            "  - user {} has a negative balance of {}",
            user_id,
            format_cents(*balance)
        );
    }
    anyhow::bail!("Ledger integrity check failed")
}

/// Tally of a contention run.
#[derive(Debug, Default)]
struct ContentionSummary {
    succeeded: usize,
    insufficient_funds: usize,
    contended: usize,
    failed: usize,
}

async fn run_contend_command(
    service: Arc<BalanceService>,
    user_id: UserId,
    amount_cents: Cents,
    requests: usize,
) -> Result<()> {
    let starting_balance = service.balance(user_id).await?;

    let mut tasks = JoinSet::new();
    for _ in 0..requests {
        let service = Arc::clone(&service);
        tasks.spawn(async move { service.withdraw(user_id, amount_cents).await });
    }

    let mut summary = ContentionSummary::default();
    while let Some(joined) = tasks.join_next().await {
        match joined.context("Withdrawal task panicked")? {
            Ok(_) => summary.succeeded += 1,
            Err(BalanceError::InsufficientFunds { .. }) => summary.insufficient_funds += 1,
            Err(err) if err.is_retryable() => summary.contended += 1,
            Err(err) => {
                warn!(user_id, error = %err, kind = err.kind(), "withdrawal failed");
                summary.failed += 1;
            }
        }
    }

    let final_balance = service.balance(user_id).await?;

    println!(
        "{} concurrent withdrawals of {} for user {} (lock strategy: {})",
        requests,
        format_cents(amount_cents),
        user_id,
        service.lock_strategy()
    );
    println!("  Starting balance:   {:>12}", format_cents(starting_balance));
    println!("  Succeeded:          {:>12}", summary.succeeded);
    println!("  Insufficient funds: {:>12}", summary.insufficient_funds);
    println!("  Lock contention:    {:>12}", summary.contended);
    println!("  Other failures:     {:>12}", summary.failed);
    println!("  Final balance:      {:>12}", format_cents(final_balance));

    if final_balance < 0 {
        println!("\nBalance went negative: withdrawals for this user were not serialized.");
    }
    Ok(())
}
