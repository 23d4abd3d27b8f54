//! Cron trigger for scheduled alert runs.
//!
//! Parses the configured cron expressions once, then ticks every 10 seconds
//! and fires each schedule at most once per matching time. The scheduler is
//! a pure trigger: it calls [`AlertService::run_once`] and logs the result,
//! and holds no dispatch state of its own; overlap safety belongs to the
//! ledger's `reserve`.
//!
//! Expressions are evaluated in the market timezone
//! (`alerts.tz_offset_hours`), so `0 2 15 * * 1-5` is 15:02 local.

use anyhow::{Context, Result};
use chrono::{DateTime, FixedOffset, Utc};
use cron::Schedule;
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio::time::{interval, Duration};
use tracing::{debug, error, info};

use fin_common::config::RunMode;

use crate::{AlertService, RunOptions};

/// Scheduled run type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScheduledRun {
    /// 15-minute intraday tick during market hours
    Intraday,
    /// End-of-day close run
    Eod,
}

impl ScheduledRun {
    /// Get task name for logging
    pub fn name(&self) -> &'static str {
        match self {
            Self::Intraday => "intraday",
            Self::Eod => "eod",
        }
    }

    /// The run mode this task triggers.
    pub fn mode(&self) -> RunMode {
        match self {
            Self::Intraday => RunMode::Intraday,
            Self::Eod => RunMode::Eod,
        }
    }
}

/// A parsed schedule with its task type
struct ParsedSchedule {
    task: ScheduledRun,
    schedule: Schedule,
}

/// Alert run scheduler.
pub struct AlertScheduler {
    service: Arc<AlertService>,
    schedules: Vec<ParsedSchedule>,
    tz: FixedOffset,
    /// Last execution times for each task
    last_runs: RwLock<HashMap<ScheduledRun, DateTime<Utc>>>,
}

impl AlertScheduler {
    /// Create a scheduler from the service configuration.
    pub fn new(service: Arc<AlertService>) -> Result<Self> {
        let config = service.config().schedule.clone();
        let tz = service.tz();
        let mut schedules = Vec::new();

        if config.enabled {
            schedules.push(ParsedSchedule {
                task: ScheduledRun::Intraday,
                schedule: Schedule::from_str(&config.intraday)
                    .with_context(|| format!("Invalid intraday cron: {}", config.intraday))?,
            });
            schedules.push(ParsedSchedule {
                task: ScheduledRun::Eod,
                schedule: Schedule::from_str(&config.eod)
                    .with_context(|| format!("Invalid eod cron: {}", config.eod))?,
            });

            info!(
                intraday = %config.intraday,
                eod = %config.eod,
                tz_offset = tz.local_minus_utc() / 3600,
                "Scheduler configured"
            );
        }

        Ok(Self {
            service,
            schedules,
            tz,
            last_runs: RwLock::new(HashMap::new()),
        })
    }

    /// Run the scheduler loop until the surrounding task is cancelled.
    pub async fn run(&self) -> Result<()> {
        if self.schedules.is_empty() {
            info!("Scheduler disabled, not starting");
            return Ok(());
        }

        info!("Scheduler started");

        let mut check_interval = interval(Duration::from_secs(10));

        loop {
            check_interval.tick().await;

            for parsed in &self.schedules {
                if self.should_execute(parsed.task, &parsed.schedule).await {
                    self.execute(parsed.task).await;
                }
            }
        }
    }

    /// Check if a task's schedule has a firing time that just passed and has
    /// not been executed yet.
    async fn should_execute(&self, task: ScheduledRun, schedule: &Schedule) -> bool {
        let now = Utc::now();
        let last_run = {
            let runs = self.last_runs.read().await;
            runs.get(&task).copied()
        };

        // Scan forward from the last run (or the last hour on a fresh start).
        let after = last_run
            .unwrap_or_else(|| now - chrono::Duration::hours(1))
            .with_timezone(&self.tz);

        for scheduled in schedule.after(&after).take(10) {
            let scheduled_utc = scheduled.with_timezone(&Utc);
            if scheduled_utc <= now {
                // Fire only for recent matches; older ones are misfires we
                // deliberately coalesce (the next tick covers their alerts).
                let since = now.signed_duration_since(scheduled_utc);
                if since < chrono::Duration::seconds(60) {
                    if let Some(last) = last_run {
                        if last >= scheduled_utc {
                            continue;
                        }
                    }
                    return true;
                }
            } else {
                break;
            }
        }

        false
    }

    /// Execute a scheduled run.
    async fn execute(&self, task: ScheduledRun) {
        info!(task = task.name(), "Executing scheduled run");

        {
            let mut runs = self.last_runs.write().await;
            runs.insert(task, Utc::now());
        }

        // Per-alert retries live inside the dispatcher; a run-level failure
        // here (config, ledger, signal source) waits for the next tick.
        match self
            .service
            .run_once(Some(task.mode()), &RunOptions::default())
            .await
        {
            Ok(report) => {
                debug!(task = task.name(), run_id = %report.run_id, "Scheduled run finished: {}", report.summary());
            }
            Err(e) => {
                error!(task = task.name(), error = %e, "Scheduled run failed");
            }
        }
    }

    /// Get next scheduled times for each task, soonest first.
    pub fn next_runs(&self) -> Vec<(ScheduledRun, DateTime<Utc>)> {
        let mut next_times = Vec::new();

        for parsed in &self.schedules {
            if let Some(next) = parsed.schedule.upcoming(self.tz).next() {
                next_times.push((parsed.task, next.with_timezone(&Utc)));
            }
        }

        next_times.sort_by_key(|(_, time)| *time);
        next_times
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fin_common::config::Config;

    fn service(dir: &tempfile::TempDir, enabled: bool) -> Arc<AlertService> {
        let mut config = Config::default();
        config.alerts.db_path = Some(dir.path().join("alerts.db"));
        config.schedule.enabled = enabled;
        Arc::new(AlertService::new(config).unwrap())
    }

    #[test]
    fn test_task_names_and_modes() {
        assert_eq!(ScheduledRun::Intraday.name(), "intraday");
        assert_eq!(ScheduledRun::Eod.name(), "eod");
        assert_eq!(ScheduledRun::Eod.mode(), RunMode::Eod);
    }

    #[test]
    fn test_default_cron_expressions_parse() {
        let config = fin_common::config::ScheduleConfig::default();
        assert!(Schedule::from_str(&config.intraday).is_ok());
        assert!(Schedule::from_str(&config.eod).is_ok());
    }

    #[test]
    fn test_disabled_scheduler_has_no_schedules() {
        let dir = tempfile::tempdir().unwrap();
        let scheduler = AlertScheduler::new(service(&dir, false)).unwrap();
        assert!(scheduler.next_runs().is_empty());
    }

    #[test]
    fn test_enabled_scheduler_reports_next_runs() {
        let dir = tempfile::tempdir().unwrap();
        let scheduler = AlertScheduler::new(service(&dir, true)).unwrap();
        let next = scheduler.next_runs();
        assert_eq!(next.len(), 2);
        // Soonest first.
        assert!(next[0].1 <= next[1].1);
    }

    #[test]
    fn test_invalid_cron_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.alerts.db_path = Some(dir.path().join("alerts.db"));
        config.schedule.enabled = true;
        config.schedule.intraday = "not a cron".to_string();
        let service = Arc::new(AlertService::new(config).unwrap());

        assert!(AlertScheduler::new(service).is_err());
    }

    #[tokio::test]
    async fn test_should_execute_fires_once_per_match() {
        let dir = tempfile::tempdir().unwrap();
        let scheduler = AlertScheduler::new(service(&dir, true)).unwrap();

        // An every-second schedule always has a fresh match.
        let every_second = Schedule::from_str("* * * * * *").unwrap();
        assert!(
            scheduler
                .should_execute(ScheduledRun::Intraday, &every_second)
                .await
        );

        // Recording an execution suppresses refiring for the same match.
        {
            let mut runs = scheduler.last_runs.write().await;
            runs.insert(ScheduledRun::Intraday, Utc::now());
        }
        assert!(
            !scheduler
                .should_execute(ScheduledRun::Intraday, &every_second)
                .await
        );
    }

    #[tokio::test]
    async fn test_old_misfires_are_coalesced() {
        let dir = tempfile::tempdir().unwrap();
        let scheduler = AlertScheduler::new(service(&dir, true)).unwrap();

        // A schedule that only fired minutes ago (and is long past the
        // 60-second freshness window) must not fire now.
        let now = Utc::now().with_timezone(&scheduler.tz);
        let stale_minute = (now - chrono::Duration::minutes(30)).format("0 %M %H * * *");
        let stale = Schedule::from_str(&stale_minute.to_string()).unwrap();
        assert!(!scheduler.should_execute(ScheduledRun::Eod, &stale).await);
    }
}
