//! Batch dispatch with dedup and retry.
//!
//! For each alert: reserve its slot in the ledger, render, send through the
//! injected transport, and settle the ledger row. Transient failures back
//! off exponentially inside the per-alert attempt loop; one alert's failure
//! never aborts the batch. Ledger failures do abort the batch, since dedup
//! cannot be guaranteed without the ledger.

use anyhow::{Context, Result};
use chrono::FixedOffset;
use serde::Serialize;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

use fin_common::config::RetryConfig;

use crate::alert::{AlertKey, AlertRecord};
use crate::compose::Composer;
use crate::ledger::Ledger;
use crate::transport::Transport;

/// Retry budget for transient delivery failures.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Total attempts per alert, including the first
    pub max_attempts: u32,
    /// Backoff base delay
    pub base_delay: Duration,
    /// Backoff cap
    pub max_delay: Duration,
}

impl RetryPolicy {
    /// Build from configuration.
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_delay: Duration::from_millis(config.base_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
        }
    }

    /// Backoff before the attempt after `attempt` (1-based): doubles each
    /// time, capped. Strictly increasing until the cap is hit.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u64 << (attempt.saturating_sub(1)).min(20);
        let delay = self.base_delay.saturating_mul(factor as u32);
        delay.min(self.max_delay)
    }
}

/// Terminal state of one alert within a dispatch run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OutcomeStatus {
    /// Delivery confirmed this run
    Sent,
    /// Already handled (sent, failed, or in flight), not attempted
    Skipped,
    /// Gave up this run
    Failed,
}

/// Per-alert detail in the dispatch report.
#[derive(Debug, Clone, Serialize)]
pub struct AlertOutcome {
    /// Ticker symbol
    pub ticker: String,
    /// Event wire string
    pub event: String,
    /// Ledger key hash
    pub key_hash: String,
    /// Terminal state
    pub status: OutcomeStatus,
    /// Delivery attempts made this run (0 for skipped)
    pub attempts: u32,
    /// Message id on success, error text on failure
    pub detail: Option<String>,
}

/// Result of one dispatch run. Every input alert appears in `outcomes`
/// exactly once.
#[derive(Debug, Clone, Serialize, Default)]
pub struct DispatchReport {
    /// Run identifier for log correlation
    pub run_id: String,
    /// Alerts delivered this run
    pub sent: usize,
    /// Alerts skipped as already handled
    pub skipped: usize,
    /// Alerts that gave up this run
    pub failed: usize,
    /// Per-alert detail
    pub outcomes: Vec<AlertOutcome>,
}

impl DispatchReport {
    pub(crate) fn new() -> Self {
        Self {
            run_id: Uuid::new_v4().to_string(),
            ..Default::default()
        }
    }

    /// One-line summary for logs.
    pub fn summary(&self) -> String {
        format!(
            "sent={} skipped={} failed={}",
            self.sent, self.skipped, self.failed
        )
    }
}

/// Sequential batch dispatcher.
pub struct Dispatcher {
    ledger: Ledger,
    composer: Composer,
    policy: RetryPolicy,
    slot_minutes: u32,
    tz: FixedOffset,
}

impl Dispatcher {
    /// Create a dispatcher.
    pub fn new(
        ledger: Ledger,
        composer: Composer,
        policy: RetryPolicy,
        slot_minutes: u32,
        tz: FixedOffset,
    ) -> Self {
        Self {
            ledger,
            composer,
            policy,
            slot_minutes,
            tz,
        }
    }

    /// Dispatch a batch through the transport.
    ///
    /// Ledger errors abort the whole run; transport errors are contained to
    /// their alert.
    pub async fn dispatch(
        &self,
        alerts: &[AlertRecord],
        transport: &dyn Transport,
    ) -> Result<DispatchReport> {
        let mut report = DispatchReport::new();

        info!(
            run_id = %report.run_id,
            batch = alerts.len(),
            transport = transport.name(),
            "Dispatch run started"
        );

        for record in alerts {
            let key = AlertKey::for_record(record, self.slot_minutes, self.tz);
            let key_hash = key.hash();

            let reserved = self
                .ledger
                .reserve(&key)
                .context("Ledger unavailable, aborting run")?;

            if !reserved {
                debug!(key = %key, "Skip duplicate alert");
                report.skipped += 1;
                report.outcomes.push(AlertOutcome {
                    ticker: key.ticker.clone(),
                    event: key.event.as_str().to_string(),
                    key_hash,
                    status: OutcomeStatus::Skipped,
                    attempts: 0,
                    detail: None,
                });
                continue;
            }

            let message = self.composer.render(record, &key);
            let outcome = self.deliver(&key, key_hash, &message, transport).await?;
            match outcome.status {
                OutcomeStatus::Sent => report.sent += 1,
                OutcomeStatus::Failed => report.failed += 1,
                OutcomeStatus::Skipped => report.skipped += 1,
            }
            report.outcomes.push(outcome);
        }

        info!(run_id = %report.run_id, "Dispatch run finished: {}", report.summary());
        Ok(report)
    }

    /// Attempt delivery of one reserved alert, retrying transient failures.
    async fn deliver(
        &self,
        key: &AlertKey,
        key_hash: String,
        message: &crate::transport::RenderedMessage,
        transport: &dyn Transport,
    ) -> Result<AlertOutcome> {
        let mut attempt = 1u32;

        loop {
            match transport.send(message).await {
                Ok(response) => {
                    let retries = attempt - 1;
                    self.ledger
                        .mark_sent(key, response.code.as_deref(), &response.message_id, retries)
                        .context("Ledger unavailable recording delivery")?;
                    self.ledger
                        .log_attempt(key, "SENT", response.code.as_deref(), "OK", retries)
                        .context("Ledger unavailable recording attempt")?;

                    info!(key = %key, attempt, message_id = %response.message_id, "Alert sent");
                    return Ok(AlertOutcome {
                        ticker: key.ticker.clone(),
                        event: key.event.as_str().to_string(),
                        key_hash,
                        status: OutcomeStatus::Sent,
                        attempts: attempt,
                        detail: Some(response.message_id),
                    });
                }
                Err(error) => {
                    let code = error.code().map(|c| c.to_string());
                    let retries = attempt - 1;
                    self.ledger
                        .log_attempt(key, "ERROR", code.as_deref(), &error.to_string(), retries)
                        .context("Ledger unavailable recording attempt")?;

                    if error.is_transient() && attempt < self.policy.max_attempts {
                        let delay = self.policy.delay_for(attempt);
                        warn!(
                            key = %key,
                            attempt,
                            max_attempts = self.policy.max_attempts,
                            error = %error,
                            delay_ms = delay.as_millis() as u64,
                            "Transient delivery failure, retrying"
                        );
                        tokio::time::sleep(delay).await;
                        attempt += 1;
                        continue;
                    }

                    self.ledger
                        .mark_failed(key, &error.to_string(), retries)
                        .context("Ledger unavailable recording failure")?;

                    warn!(
                        key = %key,
                        attempt,
                        transient = error.is_transient(),
                        error = %error,
                        "Alert delivery gave up"
                    );
                    return Ok(AlertOutcome {
                        ticker: key.ticker.clone(),
                        event: key.event.as_str().to_string(),
                        key_hash,
                        status: OutcomeStatus::Failed,
                        attempts: attempt,
                        detail: Some(error.to_string()),
                    });
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alert::AlertEvent;
    use crate::ledger::EntryStatus;
    use crate::transport::{DeliveryResponse, RenderedMessage, TransportError};
    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use fin_common::config::MailConfig;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    fn tz7() -> FixedOffset {
        FixedOffset::east_opt(7 * 3600).unwrap()
    }

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    fn dispatcher(ledger: Ledger, max_attempts: u32) -> Dispatcher {
        let composer = Composer::new(&MailConfig::default(), tz7());
        Dispatcher::new(ledger, composer, fast_policy(max_attempts), 15, tz7())
    }

    fn record(ticker: &str, event: AlertEvent, at: &str) -> AlertRecord {
        AlertRecord::new(ticker, event, at.parse::<DateTime<Utc>>().unwrap(), "test signal")
    }

    /// Outcome script for the fake transport.
    #[derive(Debug, Clone, Copy)]
    enum Step {
        Ok,
        Busy,
        AuthFail,
    }

    struct ScriptedTransport {
        script: Mutex<Vec<Step>>,
        calls: AtomicU32,
        /// When set, only messages whose subject contains this needle
        /// consume the script; everything else succeeds.
        fail_needle: Option<String>,
    }

    impl ScriptedTransport {
        fn new(script: Vec<Step>) -> Self {
            Self {
                script: Mutex::new(script),
                calls: AtomicU32::new(0),
                fail_needle: None,
            }
        }

        fn failing_for(needle: &str, script: Vec<Step>) -> Self {
            Self {
                script: Mutex::new(script),
                calls: AtomicU32::new(0),
                fail_needle: Some(needle.to_string()),
            }
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Transport for ScriptedTransport {
        fn name(&self) -> &'static str {
            "scripted"
        }

        async fn send(
            &self,
            message: &RenderedMessage,
        ) -> Result<DeliveryResponse, TransportError> {
            self.calls.fetch_add(1, Ordering::SeqCst);

            if let Some(needle) = &self.fail_needle {
                if !message.subject.contains(needle) {
                    return Ok(DeliveryResponse {
                        message_id: "ok".to_string(),
                        code: Some("200".to_string()),
                    });
                }
            }

            let step = {
                let mut script = self.script.lock().unwrap();
                if script.is_empty() {
                    Step::Ok
                } else {
                    script.remove(0)
                }
            };

            match step {
                Step::Ok => Ok(DeliveryResponse {
                    message_id: "ok".to_string(),
                    code: Some("200".to_string()),
                }),
                Step::Busy => Err(TransportError::Busy {
                    code: Some(503),
                    reason: "try later".to_string(),
                }),
                Step::AuthFail => Err(TransportError::Auth("credentials revoked".to_string())),
            }
        }
    }

    #[tokio::test]
    async fn test_single_alert_sent() {
        let ledger = Ledger::in_memory().unwrap();
        let dispatcher = dispatcher(ledger.clone(), 3);
        let transport = ScriptedTransport::new(vec![]);

        let batch = vec![record("VNM", AlertEvent::BuyNew, "2025-07-01T02:22:41Z")];
        let report = dispatcher.dispatch(&batch, &transport).await.unwrap();

        assert_eq!(report.sent, 1);
        assert_eq!(report.skipped, 0);
        assert_eq!(report.failed, 0);
        assert_eq!(transport.calls(), 1);

        // Ledger row lands under the pinned hash for the 09:15 (+07) slot.
        let entry = ledger
            .entry("e5d70407b38f33a904395b2cb9b3b19eaa0ca1d9")
            .unwrap()
            .unwrap();
        assert_eq!(entry.status, EntryStatus::Sent);
        assert_eq!(entry.retry_count, 0);
    }

    #[tokio::test]
    async fn test_redispatch_skips_everything() {
        let ledger = Ledger::in_memory().unwrap();
        let dispatcher = dispatcher(ledger, 3);
        let transport = ScriptedTransport::new(vec![]);

        let batch = vec![
            record("VNM", AlertEvent::BuyNew, "2025-07-01T02:22:41Z"),
            record("HPG", AlertEvent::SellTp, "2025-07-01T02:22:41Z"),
        ];

        let first = dispatcher.dispatch(&batch, &transport).await.unwrap();
        assert_eq!(first.sent, 2);

        let second = dispatcher.dispatch(&batch, &transport).await.unwrap();
        assert_eq!(second.sent, 0);
        assert_eq!(second.skipped, 2);
        // No further transport calls for skipped alerts.
        assert_eq!(transport.calls(), 2);
    }

    #[tokio::test]
    async fn test_duplicate_within_batch_skipped() {
        let ledger = Ledger::in_memory().unwrap();
        let dispatcher = dispatcher(ledger, 3);
        let transport = ScriptedTransport::new(vec![]);

        // Same ticker/event, two timestamps inside one 15-minute slot.
        let batch = vec![
            record("VNM", AlertEvent::BuyNew, "2025-07-01T02:16:00Z"),
            record("VNM", AlertEvent::BuyNew, "2025-07-01T02:29:00Z"),
        ];
        let report = dispatcher.dispatch(&batch, &transport).await.unwrap();

        assert_eq!(report.sent, 1);
        assert_eq!(report.skipped, 1);
        assert_eq!(transport.calls(), 1);
    }

    #[tokio::test]
    async fn test_permanent_failure_single_attempt_and_isolation() {
        let ledger = Ledger::in_memory().unwrap();
        let dispatcher = dispatcher(ledger.clone(), 3);
        // Only the HPG alert fails; the failure is permanent.
        let transport = ScriptedTransport::failing_for("HPG", vec![Step::AuthFail]);

        let batch = vec![
            record("VNM", AlertEvent::BuyNew, "2025-07-01T02:22:41Z"),
            record("HPG", AlertEvent::BuyNew, "2025-07-01T02:22:41Z"),
            record("SSI", AlertEvent::BuyNew, "2025-07-01T02:22:41Z"),
        ];
        let report = dispatcher.dispatch(&batch, &transport).await.unwrap();

        assert_eq!(report.sent, 2);
        assert_eq!(report.failed, 1);
        // Permanent failure: exactly one attempt, no retries.
        assert_eq!(transport.calls(), 3);

        let failed = report
            .outcomes
            .iter()
            .find(|o| o.ticker == "HPG")
            .unwrap();
        assert_eq!(failed.status, OutcomeStatus::Failed);
        assert_eq!(failed.attempts, 1);
        assert!(failed.detail.as_deref().unwrap().contains("credentials revoked"));

        let entry = ledger.entry(&failed.key_hash).unwrap().unwrap();
        assert_eq!(entry.status, EntryStatus::Failed);
        assert_eq!(entry.retry_count, 0);
    }

    #[tokio::test]
    async fn test_transient_then_success_records_retries() {
        let ledger = Ledger::in_memory().unwrap();
        let dispatcher = dispatcher(ledger.clone(), 3);
        let transport = ScriptedTransport::new(vec![Step::Busy, Step::Busy, Step::Ok]);

        let batch = vec![record("VNM", AlertEvent::BuyNew, "2025-07-01T02:22:41Z")];
        let report = dispatcher.dispatch(&batch, &transport).await.unwrap();

        assert_eq!(report.sent, 1);
        assert_eq!(report.outcomes[0].attempts, 3);
        assert_eq!(transport.calls(), 3);

        let entry = ledger.entry(&report.outcomes[0].key_hash).unwrap().unwrap();
        assert_eq!(entry.status, EntryStatus::Sent);
        assert_eq!(entry.retry_count, 2);
        // Every attempt is in the audit log.
        let key = AlertKey {
            ticker: "VNM".to_string(),
            event: AlertEvent::BuyNew,
            slot: "2025-07-01T02:15:00Z".parse().unwrap(),
        };
        assert_eq!(ledger.attempt_count(&key).unwrap(), 3);
    }

    #[tokio::test]
    async fn test_transient_exhaustion_marks_failed() {
        let ledger = Ledger::in_memory().unwrap();
        let dispatcher = dispatcher(ledger.clone(), 3);
        let transport = ScriptedTransport::new(vec![Step::Busy, Step::Busy, Step::Busy, Step::Busy]);

        let batch = vec![record("VNM", AlertEvent::BuyNew, "2025-07-01T02:22:41Z")];
        let report = dispatcher.dispatch(&batch, &transport).await.unwrap();

        assert_eq!(report.failed, 1);
        assert_eq!(report.outcomes[0].attempts, 3);
        // Bounded by max_attempts, not the script length.
        assert_eq!(transport.calls(), 3);

        let entry = ledger.entry(&report.outcomes[0].key_hash).unwrap().unwrap();
        assert_eq!(entry.status, EntryStatus::Failed);
        assert_eq!(entry.retry_count, 2);
    }

    #[tokio::test]
    async fn test_every_alert_accounted_for() {
        let ledger = Ledger::in_memory().unwrap();
        let dispatcher = dispatcher(ledger, 2);
        let transport = ScriptedTransport::failing_for("HPG", vec![Step::AuthFail]);

        let batch = vec![
            record("VNM", AlertEvent::BuyNew, "2025-07-01T02:22:41Z"),
            record("HPG", AlertEvent::SellSl, "2025-07-01T02:22:41Z"),
            record("VNM", AlertEvent::BuyNew, "2025-07-01T02:25:00Z"),
        ];
        let report = dispatcher.dispatch(&batch, &transport).await.unwrap();

        assert_eq!(report.outcomes.len(), batch.len());
        assert_eq!(report.sent + report.skipped + report.failed, batch.len());
    }

    #[test]
    fn test_backoff_strictly_increasing_until_cap() {
        let policy = RetryPolicy {
            max_attempts: 6,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(3),
        };

        let delays: Vec<_> = (1..=5).map(|a| policy.delay_for(a)).collect();
        assert_eq!(delays[0], Duration::from_millis(500));
        assert_eq!(delays[1], Duration::from_millis(1000));
        assert_eq!(delays[2], Duration::from_millis(2000));
        // Capped from here on.
        assert_eq!(delays[3], Duration::from_secs(3));
        assert_eq!(delays[4], Duration::from_secs(3));
        for pair in delays.windows(2).take(3) {
            assert!(pair[1] > pair[0]);
        }
    }

    #[test]
    fn test_policy_from_config() {
        let config = RetryConfig {
            max_attempts: 0,
            base_delay_ms: 250,
            max_delay_ms: 10_000,
        };
        let policy = RetryPolicy::from_config(&config);
        // A zero budget still allows the first attempt.
        assert_eq!(policy.max_attempts, 1);
        assert_eq!(policy.base_delay, Duration::from_millis(250));
    }
}
