//! Fin Alerts - stock alert delivery service.
//!
//! Takes alert records from an upstream signal engine and delivers them by
//! email, at most once per (ticker, event, time slot). The guarantee rests
//! on two pieces:
//!
//! - a durable SQLite ledger whose atomic insert-if-absent `reserve` makes
//!   one invocation win even when runs overlap, and
//! - a sequential dispatcher that retries transient transport failures with
//!   exponential backoff and isolates each alert's failure from the rest of
//!   the batch.
//!
//! Everything else (signal sourcing, message rendering, SMTP/Gmail
//! transports, the cron trigger, the CLI) is plumbing around those two.

#![warn(clippy::all)]
#![allow(clippy::pedantic)]

pub mod alert;
pub mod compose;
pub mod dispatch;
pub mod ledger;
pub mod scheduler;
pub mod signals;
pub mod transport;

use anyhow::{Context, Result};
use chrono::FixedOffset;
use tracing::{info, warn};

use fin_common::config::{Config, RunMode};

use crate::alert::AlertKey;
use crate::compose::Composer;
use crate::dispatch::{AlertOutcome, DispatchReport, Dispatcher, OutcomeStatus, RetryPolicy};
use crate::ledger::Ledger;
use crate::signals::{force_test_alert, JsonFileSource, SignalSource, StaticSource};
use crate::transport::build_transport;

/// Per-run options from the CLI surface.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Render and report without reserving or sending
    pub dry_run: bool,
    /// Replace the batch with a single TEST/INFO alert
    pub force_test: bool,
    /// Recipient override for this run
    pub recipients: Option<Vec<String>>,
}

/// Alert service state: configuration plus the opened ledger.
pub struct AlertService {
    config: Config,
    ledger: Ledger,
    tz: FixedOffset,
}

impl AlertService {
    /// Create a service, validating configuration and opening the ledger.
    pub fn new(config: Config) -> Result<Self> {
        config
            .validate()
            .context("Invalid configuration, refusing to start")?;

        let tz = FixedOffset::east_opt(config.alerts.tz_offset_hours * 3600)
            .context("Invalid timezone offset")?;
        let ledger = Ledger::open(config.alerts.resolved_db_path())?;

        Ok(Self { config, ledger, tz })
    }

    /// The service configuration.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// The opened delivery ledger.
    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    /// The market timezone used for slot flooring.
    pub fn tz(&self) -> FixedOffset {
        self.tz
    }

    /// Compute the dedup key an alert record would get under this service's
    /// slot policy. Used by the operator CLI for ledger lookups.
    pub fn key_for(&self, record: &crate::alert::AlertRecord) -> AlertKey {
        AlertKey::for_record(record, self.config.alerts.slot_minutes, self.tz)
    }

    fn source(&self) -> Box<dyn SignalSource> {
        match &self.config.alerts.signals_path {
            Some(path) => Box::new(JsonFileSource::new(path.clone())),
            None => Box::new(StaticSource::new(Vec::new())),
        }
    }

    /// Run one dispatch cycle. This is the single entry point the scheduler
    /// and the CLI share; it holds no state between invocations beyond the
    /// ledger.
    pub async fn run_once(&self, mode: Option<RunMode>, opts: &RunOptions) -> Result<DispatchReport> {
        let mode = mode.unwrap_or(self.config.alerts.run_mode);

        let mut mail = self.config.mail.clone();
        if let Some(recipients) = &opts.recipients {
            mail.recipients = recipients.clone();
        }
        mail.validate()
            .context("Mail configuration invalid, aborting run before dispatch")?;

        let source = self.source();
        let alerts = if opts.force_test {
            vec![force_test_alert()]
        } else {
            source
                .fetch(mode)
                .with_context(|| format!("Signal source {} failed", source.name()))?
        };

        if alerts.is_empty() {
            info!(mode = %mode, "No alerts generated, nothing to send");
            return Ok(DispatchReport::new());
        }

        let composer = Composer::new(&mail, self.tz);

        if opts.dry_run {
            let mut report = DispatchReport::new();
            for record in &alerts {
                let key = self.key_for(record);
                let message = composer.render(record, &key);
                info!(key = %key, subject = %message.subject, "Dry-run: would send");
                report.skipped += 1;
                report.outcomes.push(AlertOutcome {
                    ticker: key.ticker.clone(),
                    event: key.event.as_str().to_string(),
                    key_hash: key.hash(),
                    status: OutcomeStatus::Skipped,
                    attempts: 0,
                    detail: Some("dry-run".to_string()),
                });
            }
            return Ok(report);
        }

        let transport = build_transport(&mail)?;
        let dispatcher = Dispatcher::new(
            self.ledger.clone(),
            composer,
            RetryPolicy::from_config(&self.config.retry),
            self.config.alerts.slot_minutes,
            self.tz,
        );

        let report = dispatcher.dispatch(&alerts, transport.as_ref()).await?;

        info!(
            mode = %mode,
            run_id = %report.run_id,
            "Notify run finished: {}",
            report.summary()
        );
        for outcome in report.outcomes.iter().filter(|o| o.status == OutcomeStatus::Failed) {
            warn!(
                ticker = %outcome.ticker,
                event = %outcome.event,
                attempts = outcome.attempts,
                detail = outcome.detail.as_deref().unwrap_or(""),
                "Alert failed this run"
            );
        }

        Ok(report)
    }

    /// Send the fixed test email through the configured transport.
    pub async fn send_test_email(&self, recipients: Option<Vec<String>>) -> Result<String> {
        let mut mail = self.config.mail.clone();
        if let Some(recipients) = recipients {
            mail.recipients = recipients;
        }
        mail.validate().context("Mail configuration invalid")?;

        let composer = Composer::new(&mail, self.tz);
        let transport = build_transport(&mail)?;
        let response = transport
            .send(&composer.render_test())
            .await
            .map_err(|e| anyhow::anyhow!("Test email failed: {e}"))?;

        info!(message_id = %response.message_id, "Test email sent");
        Ok(response.message_id)
    }
}
