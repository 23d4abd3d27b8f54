//! Fin Alerts - stock alert email delivery.
//!
//! Thin CLI over the alert service: one-shot runs, the cron scheduler loop,
//! a delivery test, and ledger inspection for operators.

use anyhow::{bail, Result};
use chrono::DateTime;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;

use fin_alerts::alert::{AlertEvent, AlertRecord};
use fin_alerts::scheduler::AlertScheduler;
use fin_alerts::{AlertService, RunOptions};
use fin_common::config::{Config, RunMode};
use fin_common::logging::init_logging;

/// Stock alert email delivery with at-most-once semantics per time slot.
#[derive(Parser, Debug)]
#[command(name = "fin-alerts")]
#[command(version = "0.1.0")]
#[command(about = "Generate and deliver stock alert emails, deduplicated per 15-minute slot", long_about = None)]
struct Cli {
    /// Path to the config file (default: ~/.fin-alerts/config.json)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run one dispatch cycle
    Run {
        /// Run mode: INTRADAY, EOD, or BOTH (default from config)
        #[arg(long)]
        mode: Option<String>,

        /// Comma separated recipients overriding the configured list
        #[arg(long)]
        to: Option<String>,

        /// Render and report without reserving or sending
        #[arg(long)]
        dry_run: bool,

        /// Send a single TEST/INFO alert instead of real signals
        #[arg(long)]
        force_test: bool,
    },

    /// Start the cron scheduler loop (runs until Ctrl-C)
    Schedule,

    /// Send a delivery test email through the configured transport
    TestEmail {
        /// Comma separated recipients overriding the configured list
        #[arg(long)]
        to: Option<String>,
    },

    /// Inspect or repair the delivery ledger
    Ledger {
        #[command(subcommand)]
        command: LedgerCommands,
    },
}

#[derive(Subcommand, Debug)]
enum LedgerCommands {
    /// Show the most recently touched ledger rows
    Recent {
        /// Maximum rows to show
        #[arg(long, default_value = "20")]
        limit: usize,
    },

    /// Delete one row so its slot can be re-sent (manual recovery)
    Reset {
        /// Ticker symbol
        #[arg(long)]
        ticker: String,

        /// Event type (BUY_NEW, SELL_TP, SELL_SL, RISK, INFO)
        #[arg(long)]
        event: String,

        /// Any RFC 3339 timestamp inside the slot, e.g. 2025-07-01T09:15:00+07:00
        #[arg(long)]
        slot: String,
    },
}

fn parse_recipients(raw: Option<String>) -> Option<Vec<String>> {
    raw.map(|value| {
        value
            .split(',')
            .map(|token| token.trim().to_string())
            .filter(|token| !token.is_empty())
            .collect()
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = Config::load_with_env(cli.config.as_ref())?;
    init_logging(
        &config.observability.log_level,
        &config.observability.log_format,
    );

    tracing::info!("Fin Alerts v{}", env!("CARGO_PKG_VERSION"));

    let service = AlertService::new(config)?;

    match cli.command {
        Commands::Run {
            mode,
            to,
            dry_run,
            force_test,
        } => {
            let mode = match mode {
                Some(raw) => Some(raw.parse::<RunMode>()?),
                None => None,
            };
            let opts = RunOptions {
                dry_run,
                force_test,
                recipients: parse_recipients(to),
            };

            let report = service.run_once(mode, &opts).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }

        Commands::Schedule => {
            let service = Arc::new(service);
            let scheduler = AlertScheduler::new(Arc::clone(&service))?;

            for (task, at) in scheduler.next_runs() {
                tracing::info!(task = task.name(), next = %at, "Upcoming scheduled run");
            }

            tokio::select! {
                result = scheduler.run() => result?,
                _ = tokio::signal::ctrl_c() => {
                    tracing::info!("Scheduler stopping");
                }
            }
        }

        Commands::TestEmail { to } => {
            let message_id = service.send_test_email(parse_recipients(to)).await?;
            println!("Test email sent message_id={message_id}");
        }

        Commands::Ledger { command } => match command {
            LedgerCommands::Recent { limit } => {
                let entries = service.ledger().recent(limit)?;
                if entries.is_empty() {
                    println!("Ledger is empty");
                }
                for entry in entries {
                    println!(
                        "{} {:8} {:8} {:8} retries={} code={} {}",
                        entry.updated_at.format("%Y-%m-%dT%H:%M:%SZ"),
                        entry.status.to_db_string(),
                        entry.ticker,
                        entry.event.as_str(),
                        entry.retry_count,
                        entry.response_code.as_deref().unwrap_or("-"),
                        entry.key_hash,
                    );
                }
            }

            LedgerCommands::Reset {
                ticker,
                event,
                slot,
            } => {
                let Some(event) = AlertEvent::from_db_string(&event.to_uppercase()) else {
                    bail!("Unknown event type: {event} (expected BUY_NEW, SELL_TP, SELL_SL, RISK, or INFO)");
                };
                let at = DateTime::parse_from_rfc3339(&slot)
                    .map_err(|e| anyhow::anyhow!("Invalid slot timestamp {slot}: {e}"))?
                    .with_timezone(&chrono::Utc);

                let record = AlertRecord::new(&ticker, event, at, "");
                let key = service.key_for(&record);
                let hash = key.hash();

                if service.ledger().reset(&hash)? {
                    println!("Reset {key} ({hash})");
                } else {
                    println!("No ledger row for {key} ({hash})");
                }
            }
        },
    }

    Ok(())
}
