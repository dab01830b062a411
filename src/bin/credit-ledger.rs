use std::path::PathBuf;

use clap::{Parser, Subcommand};
use credit_ledger::{LedgerConfig, UserLedger, telemetry};
use serde_json::json;

/// Inspect and adjust prepaid credit ledgers.
#[derive(Parser, Debug)]
#[command(name = "credit-ledger", version, about, long_about = None)]
struct Cli {
    /// Ledger config file (`.toml` or `.json`). Defaults to an in-memory store.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Emit logs as JSON lines on stderr.
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the current balance.
    Balance { user_id: String },
    /// Add credits, optionally once per reference (e.g. an invoice id).
    Credit {
        user_id: String,
        amount: u64,
        #[arg(long, default_value = "purchase")]
        source: String,
        #[arg(long)]
        reference: Option<String>,
    },
    /// Charge one tool call.
    Debit {
        user_id: String,
        cost: u64,
        #[arg(long)]
        tool: String,
    },
    /// Refund a failed tool call.
    Rollback {
        user_id: String,
        amount: u64,
        #[arg(long)]
        tool: String,
    },
    /// Print usage records newer than `--since-ms`, plus aggregates.
    Usage {
        user_id: String,
        #[arg(long, default_value_t = 0)]
        since_ms: u64,
    },
    /// Print the durable copy held by the store.
    Export { user_id: String },
    /// Print cache health counters.
    Health,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    telemetry::init_tracing(cli.json_logs)?;

    let config = match &cli.config {
        Some(path) => LedgerConfig::load(path)?,
        None => LedgerConfig::default(),
    };
    let ledger = UserLedger::open(&config).await?;

    let result = run(&ledger, cli.command).await;
    let report = ledger.shutdown().await;
    if report.failed > 0 {
        return Err(format!("{} ledger entries could not be flushed", report.failed).into());
    }

    let output = result?;
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

async fn run(
    ledger: &UserLedger,
    command: Command,
) -> Result<serde_json::Value, Box<dyn std::error::Error>> {
    let output = match command {
        Command::Balance { user_id } => {
            let balance = ledger.check_balance(&user_id).await?;
            let warning = ledger.low_balance_warning(&user_id).await?;
            json!({ "user_id": user_id, "balance": balance, "low_balance": warning })
        }
        Command::Credit {
            user_id,
            amount,
            source,
            reference,
        } => match reference {
            Some(reference) => {
                let outcome = ledger
                    .credit_once(&user_id, amount, &source, &reference)
                    .await?;
                json!({ "user_id": user_id, "reference": reference, "result": outcome })
            }
            None => {
                let balance = ledger.credit(&user_id, amount, &source).await?;
                json!({ "user_id": user_id, "balance": balance })
            }
        },
        Command::Debit {
            user_id,
            cost,
            tool,
        } => {
            let balance = ledger.debit(&user_id, cost, &tool).await?;
            json!({ "user_id": user_id, "tool_id": tool, "balance": balance })
        }
        Command::Rollback {
            user_id,
            amount,
            tool,
        } => {
            let balance = ledger.rollback(&user_id, amount, &tool).await?;
            json!({ "user_id": user_id, "tool_id": tool, "balance": balance })
        }
        Command::Usage { user_id, since_ms } => {
            let log = ledger.usage_log(&user_id, since_ms).await?;
            let records: Vec<_> = log.iter().collect();
            let summary = ledger.usage_summary(&user_id).await?;
            json!({ "summary": summary, "since_ms": since_ms, "records": records })
        }
        Command::Export { user_id } => {
            serde_json::to_value(ledger.export_snapshot(&user_id).await?)?
        }
        Command::Health => serde_json::to_value(ledger.health().await)?,
    };
    Ok(output)
}
