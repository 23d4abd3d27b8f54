//! Upstream signal sources.
//!
//! Signal computation lives outside this service. A source only hands over
//! the alert records a run should consider; the dispatcher owns dedup, so
//! sources are free to re-emit the same alert on consecutive runs.

use anyhow::{Context, Result};
use chrono::Utc;
use std::path::PathBuf;
use tracing::{debug, info};

use fin_common::config::RunMode;

use crate::alert::{AlertEvent, AlertRecord};

/// Producer of alert records for one run.
pub trait SignalSource: Send + Sync {
    /// Source name for logging.
    fn name(&self) -> &'static str;

    /// Fetch the records for a run. The mode describes which timetable tick
    /// triggered the run; sources that don't distinguish may ignore it.
    fn fetch(&self, mode: RunMode) -> Result<Vec<AlertRecord>>;
}

/// Reads the JSON hand-off file dropped by the external signal engine.
///
/// A missing file is a normal quiet run (the engine writes it only when it
/// has something to say); a malformed file is an error worth surfacing.
pub struct JsonFileSource {
    path: PathBuf,
}

impl JsonFileSource {
    /// Create a source reading from the given path.
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }
}

impl SignalSource for JsonFileSource {
    fn name(&self) -> &'static str {
        "json-file"
    }

    fn fetch(&self, mode: RunMode) -> Result<Vec<AlertRecord>> {
        if !self.path.exists() {
            debug!(path = %self.path.display(), "No signal file, nothing to send");
            return Ok(Vec::new());
        }

        let content = std::fs::read_to_string(&self.path)
            .with_context(|| format!("Failed to read signals from {}", self.path.display()))?;
        let records: Vec<AlertRecord> = serde_json::from_str(&content)
            .with_context(|| format!("Malformed signal file {}", self.path.display()))?;

        let records: Vec<AlertRecord> = records.into_iter().map(AlertRecord::normalize).collect();
        info!(
            mode = %mode,
            count = records.len(),
            path = %self.path.display(),
            "Loaded signal batch"
        );
        Ok(records)
    }
}

/// Fixed batch, for tests and forced runs.
pub struct StaticSource {
    records: Vec<AlertRecord>,
}

impl StaticSource {
    /// Create a source returning the given records on every fetch.
    pub fn new(records: Vec<AlertRecord>) -> Self {
        Self { records }
    }
}

impl SignalSource for StaticSource {
    fn name(&self) -> &'static str {
        "static"
    }

    fn fetch(&self, _mode: RunMode) -> Result<Vec<AlertRecord>> {
        Ok(self.records.clone())
    }
}

/// The forced test alert used by `--force-test` runs.
pub fn force_test_alert() -> AlertRecord {
    let mut record = AlertRecord::new("TEST", AlertEvent::Info, Utc::now(), "force-test alert");
    record.price = Some(1234.0);
    record
}
