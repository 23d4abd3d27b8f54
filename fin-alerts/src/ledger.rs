//! SQLite delivery ledger.
//!
//! Durable idempotency store backing the at-most-once guarantee: one row per
//! dedup key, plus an append-only log of every delivery attempt for audit.
//! Rows are never deleted automatically; recovery from FAILED or orphaned
//! PENDING entries is a manual operator action (`reset`).

use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

use crate::alert::{AlertEvent, AlertKey};

/// Maximum response body length kept for audit.
const MAX_RESPONSE_BODY: usize = 768;

/// Delivery status of a ledger entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryStatus {
    /// Reserved, delivery in flight (or interrupted mid-send)
    Pending,
    /// Confirmed delivered
    Sent,
    /// Gave up after exhausting retries or a permanent rejection
    Failed,
}

impl EntryStatus {
    /// Convert to database string
    pub fn to_db_string(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Sent => "sent",
            Self::Failed => "failed",
        }
    }

    /// Parse from database string
    pub fn from_db_string(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "sent" => Some(Self::Sent),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

/// Stored ledger row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerEntry {
    /// Stable hash of (ticker, event, slot)
    pub key_hash: String,
    /// Ticker symbol
    pub ticker: String,
    /// Event type
    pub event: AlertEvent,
    /// Slot start (UTC)
    pub slot: DateTime<Utc>,
    /// Delivery status
    pub status: EntryStatus,
    /// Response code from the transport, if any
    pub response_code: Option<String>,
    /// Response body / error text, truncated for audit
    pub response_body: Option<String>,
    /// Retries performed after the first attempt
    pub retry_count: u32,
    /// Last update timestamp
    pub updated_at: DateTime<Utc>,
}

fn truncate_body(body: &str) -> String {
    if body.len() <= MAX_RESPONSE_BODY {
        return body.to_string();
    }
    let mut end = MAX_RESPONSE_BODY;
    while !body.is_char_boundary(end) {
        end -= 1;
    }
    body[..end].to_string()
}

fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// SQLite-backed delivery ledger.
#[derive(Clone)]
pub struct Ledger {
    conn: Arc<Mutex<Connection>>,
}

impl Ledger {
    /// Open or create a ledger at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create ledger dir {parent:?}"))?;
            }
        }
        let conn = Connection::open(path.as_ref())
            .with_context(|| format!("Failed to open ledger at {:?}", path.as_ref()))?;

        let ledger = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        ledger.init_schema()?;

        info!(path = ?path.as_ref(), "Delivery ledger opened");
        Ok(ledger)
    }

    /// Create an in-memory ledger (for testing).
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let ledger = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        ledger.init_schema()?;

        debug!("In-memory ledger created");
        Ok(ledger)
    }

    /// Initialize database schema
    fn init_schema(&self) -> Result<()> {
        let conn = self.conn.lock().unwrap();

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS alerts_ledger (
                key_hash TEXT PRIMARY KEY,
                ticker TEXT NOT NULL,
                event TEXT NOT NULL,
                slot TEXT NOT NULL,
                status TEXT NOT NULL,
                response_code TEXT,
                response_body TEXT,
                retry_count INTEGER NOT NULL DEFAULT 0,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS alerts_outbox (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                ts TEXT NOT NULL,
                ticker TEXT NOT NULL,
                event TEXT NOT NULL,
                key_hash TEXT NOT NULL,
                status TEXT NOT NULL,
                resp_code TEXT,
                resp_body TEXT,
                retry_count INTEGER NOT NULL DEFAULT 0
            );

            CREATE INDEX IF NOT EXISTS idx_ledger_status ON alerts_ledger(status);
            CREATE INDEX IF NOT EXISTS idx_outbox_hash ON alerts_outbox(key_hash);
            "#,
        )?;

        debug!("Ledger schema initialized");
        Ok(())
    }

    // ========================================================================
    // Idempotency operations
    // ========================================================================

    /// Check whether this key has already been delivered.
    ///
    /// Read-only; safe to call repeatedly.
    pub fn is_already_sent(&self, key: &AlertKey) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let row: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM alerts_ledger WHERE key_hash = ?1 AND status = 'sent'",
                params![key.hash()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(row.is_some())
    }

    /// Atomically reserve a key for delivery.
    ///
    /// Inserts a PENDING row if and only if no row exists for the key. Any
    /// existing row (sent, failed, or a concurrent pending reservation)
    /// means "skip". The insert-if-absent is a single statement, so exactly
    /// one of two racing invocations wins even if a manual run overlaps the
    /// scheduled one.
    pub fn reserve(&self, key: &AlertKey) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let inserted = conn.execute(
            r#"
            INSERT INTO alerts_ledger (key_hash, ticker, event, slot, status, retry_count, updated_at)
            VALUES (?1, ?2, ?3, ?4, 'pending', 0, ?5)
            ON CONFLICT(key_hash) DO NOTHING
            "#,
            params![
                key.hash(),
                key.ticker,
                key.event.as_str(),
                key.slot.to_rfc3339_opts(SecondsFormat::Secs, true),
                now_rfc3339(),
            ],
        )?;

        debug!(key = %key, reserved = inserted == 1, "Ledger reserve");
        Ok(inserted == 1)
    }

    /// Record confirmed delivery.
    ///
    /// Idempotent: a row that is already SENT is left untouched.
    pub fn mark_sent(
        &self,
        key: &AlertKey,
        response_code: Option<&str>,
        response_body: &str,
        retry_count: u32,
    ) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            r#"
            UPDATE alerts_ledger
            SET status = 'sent', response_code = ?2, response_body = ?3, retry_count = ?4, updated_at = ?5
            WHERE key_hash = ?1 AND status != 'sent'
            "#,
            params![
                key.hash(),
                response_code,
                truncate_body(response_body),
                retry_count,
                now_rfc3339(),
            ],
        )?;

        debug!(key = %key, retry_count, "Ledger entry marked sent");
        Ok(())
    }

    /// Record a delivery that gave up.
    ///
    /// Never downgrades a SENT row. FAILED rows keep blocking `reserve`
    /// until an operator resets them.
    pub fn mark_failed(&self, key: &AlertKey, error: &str, retry_count: u32) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            r#"
            UPDATE alerts_ledger
            SET status = 'failed', response_body = ?2, retry_count = ?3, updated_at = ?4
            WHERE key_hash = ?1 AND status != 'sent'
            "#,
            params![key.hash(), truncate_body(error), retry_count, now_rfc3339()],
        )?;

        debug!(key = %key, retry_count, "Ledger entry marked failed");
        Ok(())
    }

    // ========================================================================
    // Attempt audit log
    // ========================================================================

    /// Append one delivery attempt to the outbox audit log.
    pub fn log_attempt(
        &self,
        key: &AlertKey,
        status: &str,
        resp_code: Option<&str>,
        resp_body: &str,
        retry_count: u32,
    ) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            r#"
            INSERT INTO alerts_outbox (ts, ticker, event, key_hash, status, resp_code, resp_body, retry_count)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            "#,
            params![
                now_rfc3339(),
                key.ticker,
                key.event.as_str(),
                key.hash(),
                status,
                resp_code,
                truncate_body(resp_body),
                retry_count,
            ],
        )?;
        Ok(())
    }

    /// Number of attempts logged for a key.
    pub fn attempt_count(&self, key: &AlertKey) -> Result<u32> {
        let conn = self.conn.lock().unwrap();
        let count: u32 = conn.query_row(
            "SELECT COUNT(*) FROM alerts_outbox WHERE key_hash = ?1",
            params![key.hash()],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    // ========================================================================
    // Operational inspection
    // ========================================================================

    /// Fetch a ledger row by key hash.
    pub fn entry(&self, key_hash: &str) -> Result<Option<LedgerEntry>> {
        let conn = self.conn.lock().unwrap();
        let result = conn
            .query_row(
                r#"
                SELECT key_hash, ticker, event, slot, status, response_code, response_body, retry_count, updated_at
                FROM alerts_ledger WHERE key_hash = ?1
                "#,
                params![key_hash],
                |row| Self::row_to_entry(row),
            )
            .optional()?;
        Ok(result)
    }

    /// Most recently touched rows, newest first.
    pub fn recent(&self, limit: usize) -> Result<Vec<LedgerEntry>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            r#"
            SELECT key_hash, ticker, event, slot, status, response_code, response_body, retry_count, updated_at
            FROM alerts_ledger
            ORDER BY updated_at DESC, key_hash
            LIMIT ?1
            "#,
        )?;

        let entries = stmt
            .query_map(params![limit as i64], |row| Self::row_to_entry(row))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(entries)
    }

    /// Manual operator reset: delete the row so a future run may re-reserve.
    ///
    /// Returns true if a row was removed.
    pub fn reset(&self, key_hash: &str) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let deleted = conn.execute(
            "DELETE FROM alerts_ledger WHERE key_hash = ?1",
            params![key_hash],
        )?;

        if deleted > 0 {
            info!(key_hash, "Ledger entry reset");
        }
        Ok(deleted > 0)
    }

    /// Helper to convert a row to a LedgerEntry
    fn row_to_entry(row: &rusqlite::Row) -> std::result::Result<LedgerEntry, rusqlite::Error> {
        let event_str: String = row.get(2)?;
        let slot_str: String = row.get(3)?;
        let status_str: String = row.get(4)?;

        Ok(LedgerEntry {
            key_hash: row.get(0)?,
            ticker: row.get(1)?,
            event: AlertEvent::from_db_string(&event_str).unwrap_or(AlertEvent::Info),
            slot: DateTime::parse_from_rfc3339(&slot_str)
                .map(|dt| dt.with_timezone(&Utc))
                .unwrap_or_else(|_| Utc::now()),
            status: EntryStatus::from_db_string(&status_str).unwrap_or(EntryStatus::Pending),
            response_code: row.get(5)?,
            response_body: row.get(6)?,
            retry_count: row.get(7)?,
            updated_at: DateTime::parse_from_rfc3339(&row.get::<_, String>(8)?)
                .map(|dt| dt.with_timezone(&Utc))
                .unwrap_or_else(|_| Utc::now()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_key() -> AlertKey {
        AlertKey {
            ticker: "VNM".to_string(),
            event: AlertEvent::BuyNew,
            slot: "2025-07-01T02:15:00Z".parse().unwrap(),
        }
    }

    #[test]
    fn test_status_db_roundtrip() {
        for status in [EntryStatus::Pending, EntryStatus::Sent, EntryStatus::Failed] {
            assert_eq!(
                EntryStatus::from_db_string(status.to_db_string()),
                Some(status)
            );
        }
        assert_eq!(EntryStatus::from_db_string("bogus"), None);
    }

    #[test]
    fn test_reserve_is_insert_if_absent() {
        let ledger = Ledger::in_memory().unwrap();
        let key = test_key();

        assert!(ledger.reserve(&key).unwrap());
        // Second reservation loses regardless of entry status.
        assert!(!ledger.reserve(&key).unwrap());

        let entry = ledger.entry(&key.hash()).unwrap().unwrap();
        assert_eq!(entry.status, EntryStatus::Pending);
        assert_eq!(entry.ticker, "VNM");
    }

    #[test]
    fn test_reserve_concurrent_exactly_one_winner() {
        let ledger = Ledger::in_memory().unwrap();
        let key = test_key();

        let mut handles = Vec::new();
        for _ in 0..8 {
            let ledger = ledger.clone();
            let key = key.clone();
            handles.push(std::thread::spawn(move || ledger.reserve(&key).unwrap()));
        }

        let wins: usize = handles
            .into_iter()
            .map(|h| usize::from(h.join().unwrap()))
            .sum();
        assert_eq!(wins, 1);
    }

    #[test]
    fn test_mark_sent_lifecycle() {
        let ledger = Ledger::in_memory().unwrap();
        let key = test_key();

        assert!(!ledger.is_already_sent(&key).unwrap());
        ledger.reserve(&key).unwrap();
        assert!(!ledger.is_already_sent(&key).unwrap());

        ledger.mark_sent(&key, Some("200"), "OK id=abc", 2).unwrap();
        assert!(ledger.is_already_sent(&key).unwrap());

        let entry = ledger.entry(&key.hash()).unwrap().unwrap();
        assert_eq!(entry.status, EntryStatus::Sent);
        assert_eq!(entry.response_code.as_deref(), Some("200"));
        assert_eq!(entry.retry_count, 2);
    }

    #[test]
    fn test_mark_sent_is_idempotent() {
        let ledger = Ledger::in_memory().unwrap();
        let key = test_key();
        ledger.reserve(&key).unwrap();
        ledger.mark_sent(&key, Some("200"), "first", 0).unwrap();
        ledger.mark_sent(&key, Some("250"), "second", 5).unwrap();

        let entry = ledger.entry(&key.hash()).unwrap().unwrap();
        assert_eq!(entry.response_body.as_deref(), Some("first"));
        assert_eq!(entry.retry_count, 0);
    }

    #[test]
    fn test_mark_failed_never_downgrades_sent() {
        let ledger = Ledger::in_memory().unwrap();
        let key = test_key();
        ledger.reserve(&key).unwrap();
        ledger.mark_sent(&key, Some("200"), "OK", 0).unwrap();
        ledger.mark_failed(&key, "late failure", 1).unwrap();

        let entry = ledger.entry(&key.hash()).unwrap().unwrap();
        assert_eq!(entry.status, EntryStatus::Sent);
    }

    #[test]
    fn test_failed_blocks_reserve_until_reset() {
        let ledger = Ledger::in_memory().unwrap();
        let key = test_key();
        ledger.reserve(&key).unwrap();
        ledger.mark_failed(&key, "auth error", 0).unwrap();

        // No automatic retry of FAILED: the slot stays blocked.
        assert!(!ledger.reserve(&key).unwrap());

        assert!(ledger.reset(&key.hash()).unwrap());
        assert!(!ledger.reset(&key.hash()).unwrap());
        assert!(ledger.reserve(&key).unwrap());
    }

    #[test]
    fn test_response_body_truncated() {
        let ledger = Ledger::in_memory().unwrap();
        let key = test_key();
        ledger.reserve(&key).unwrap();
        ledger.mark_failed(&key, &"x".repeat(2000), 0).unwrap();

        let entry = ledger.entry(&key.hash()).unwrap().unwrap();
        assert_eq!(entry.response_body.unwrap().len(), 768);
    }

    #[test]
    fn test_attempt_log() {
        let ledger = Ledger::in_memory().unwrap();
        let key = test_key();
        ledger.log_attempt(&key, "ERROR", Some("503"), "busy", 0).unwrap();
        ledger.log_attempt(&key, "SENT", Some("200"), "OK", 1).unwrap();
        assert_eq!(ledger.attempt_count(&key).unwrap(), 2);
    }

    #[test]
    fn test_recent_ordering_and_limit() {
        let ledger = Ledger::in_memory().unwrap();
        for i in 0..5 {
            let key = AlertKey {
                ticker: format!("T{i}"),
                event: AlertEvent::BuyNew,
                slot: "2025-07-01T02:15:00Z".parse().unwrap(),
            };
            ledger.reserve(&key).unwrap();
        }
        let entries = ledger.recent(3).unwrap();
        assert_eq!(entries.len(), 3);
    }

    #[test]
    fn test_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger.db");
        let key = test_key();

        {
            let ledger = Ledger::open(&path).unwrap();
            ledger.reserve(&key).unwrap();
            ledger.mark_sent(&key, Some("200"), "OK", 0).unwrap();
        }

        let reopened = Ledger::open(&path).unwrap();
        assert!(reopened.is_already_sent(&key).unwrap());
        assert!(!reopened.reserve(&key).unwrap());
    }
}
