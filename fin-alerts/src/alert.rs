//! Alert records and deduplication keys.
//!
//! An [`AlertRecord`] is what the upstream signal engine hands us; an
//! [`AlertKey`] is the (ticker, event, slot) tuple that identifies one
//! notification opportunity. The key hash is the primary key of the delivery
//! ledger and must stay stable across releases so existing ledger rows keep
//! their meaning through migrations.

use chrono::{DateTime, FixedOffset, SecondsFormat, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use std::collections::BTreeMap;

/// Alert event type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AlertEvent {
    /// New buy entry signal
    BuyNew,
    /// Take-profit exit signal
    SellTp,
    /// Stop-loss exit signal
    SellSl,
    /// Risk warning on an open position
    Risk,
    /// Informational (test emails, operational notices)
    Info,
}

impl AlertEvent {
    /// Wire/database string for this event.
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::BuyNew => "BUY_NEW",
            Self::SellTp => "SELL_TP",
            Self::SellSl => "SELL_SL",
            Self::Risk => "RISK",
            Self::Info => "INFO",
        }
    }

    /// Parse from the wire/database string.
    pub fn from_db_string(s: &str) -> Option<Self> {
        match s {
            "BUY_NEW" => Some(Self::BuyNew),
            "SELL_TP" => Some(Self::SellTp),
            "SELL_SL" => Some(Self::SellSl),
            "RISK" => Some(Self::Risk),
            "INFO" => Some(Self::Info),
            _ => None,
        }
    }
}

impl std::fmt::Display for AlertEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One alert produced by the signal engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertRecord {
    /// Stock symbol (uppercased)
    pub ticker: String,
    /// Event type
    pub event: AlertEvent,
    /// When the signal fired
    pub at: DateTime<Utc>,
    /// Human-readable explanation ("RSI14=62, MACD cross up, ...")
    pub reason: String,
    /// Price hint, if the engine supplied one
    #[serde(default)]
    pub price: Option<f64>,
    /// Free-form extras rendered into the message body
    #[serde(default)]
    pub extras: BTreeMap<String, String>,
}

impl AlertRecord {
    /// Create a record with a normalized ticker.
    pub fn new(ticker: &str, event: AlertEvent, at: DateTime<Utc>, reason: &str) -> Self {
        Self {
            ticker: ticker.trim().to_uppercase(),
            event,
            at,
            reason: reason.to_string(),
            price: None,
            extras: BTreeMap::new(),
        }
    }

    /// Uppercase the ticker in place (records arriving from JSON hand-off).
    pub fn normalize(mut self) -> Self {
        self.ticker = self.ticker.trim().to_uppercase();
        self
    }
}

/// Floor a timestamp to the slot boundary in the given market timezone.
///
/// Works on the epoch shifted by the fixed offset, so slot widths that do
/// not divide an hour still bucket against local midnight.
pub fn floor_slot(at: DateTime<Utc>, slot_minutes: u32, tz: FixedOffset) -> DateTime<Utc> {
    let slot = i64::from(slot_minutes) * 60;
    let off = i64::from(tz.local_minus_utc());
    let floored = (at.timestamp() + off).div_euclid(slot) * slot - off;
    Utc.timestamp_opt(floored, 0).single().unwrap_or(at)
}

/// Deduplication key: one notification opportunity.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AlertKey {
    /// Stock symbol (uppercased)
    pub ticker: String,
    /// Event type
    pub event: AlertEvent,
    /// Slot start, floored to the configured boundary
    pub slot: DateTime<Utc>,
}

impl AlertKey {
    /// Compute the key for a record under the given slot policy.
    pub fn for_record(record: &AlertRecord, slot_minutes: u32, tz: FixedOffset) -> Self {
        Self {
            ticker: record.ticker.trim().to_uppercase(),
            event: record.event,
            slot: floor_slot(record.at, slot_minutes, tz),
        }
    }

    /// Stable ledger hash for this key.
    ///
    /// Format: SHA-1 hex of `"{ticker}|{event}|{slot_rfc3339_utc}|v1"`.
    /// Changing this invalidates every existing ledger row; bump the
    /// trailing version tag instead if the composition ever has to change.
    pub fn hash(&self) -> String {
        let slot = self.slot.to_rfc3339_opts(SecondsFormat::Secs, true);
        let content = format!("{}|{}|{}|v1", self.ticker, self.event.as_str(), slot);
        let mut hasher = Sha1::new();
        hasher.update(content.as_bytes());
        hex::encode(hasher.finalize())
    }

    /// Slot start rendered in the given timezone, for display.
    pub fn slot_local(&self, tz: FixedOffset) -> DateTime<FixedOffset> {
        self.slot.with_timezone(&tz)
    }
}

impl std::fmt::Display for AlertKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} {} @ {}",
            self.ticker,
            self.event.as_str(),
            self.slot.to_rfc3339_opts(SecondsFormat::Secs, true)
        )
    }
}
