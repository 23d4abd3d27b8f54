//! Configuration for the Fin alerts stack.
//!
//! Configuration is loaded from a JSON file under the user's config
//! directory, with environment variable overrides applied on top for
//! credentials and deployment knobs:
//!
//! - `ALERT_TO` / `ALERT_FROM` → mail recipients / sender
//! - `SMTP_HOST` / `SMTP_PORT` / `SMTP_USER` / `SMTP_PASS` / `SMTP_SECURITY`
//! - `MAIL_PROVIDER` → "smtp" or "gmail"
//! - `SUBJECT_PREFIX` / `ENV_NAME`
//! - `ALERT_DB_PATH` / `SIGNALS_PATH`
//! - `RUN_MODE` / `TICKERS` / `TZ_OFFSET_HOURS`
//! - `LOG_LEVEL` / `LOG_FORMAT`

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::str::FromStr;

use crate::error::{Error, Result};

/// Get the configuration directory path.
pub fn config_dir() -> PathBuf {
    directories::UserDirs::new().map_or_else(
        || PathBuf::from(".fin-alerts"),
        |dirs| dirs.home_dir().join(".fin-alerts"),
    )
}

/// Get the configuration file path.
pub fn config_path() -> PathBuf {
    config_dir().join("config.json")
}

// ============================================================================
// Run mode
// ============================================================================

/// Which slice of the alert timetable a run covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RunMode {
    /// Intraday slots during market hours
    Intraday,
    /// End-of-day close run
    Eod,
    /// Both intraday and end-of-day alerts
    Both,
}

impl RunMode {
    /// Wire/CLI string for this mode.
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Intraday => "INTRADAY",
            Self::Eod => "EOD",
            Self::Both => "BOTH",
        }
    }
}

impl Default for RunMode {
    fn default() -> Self {
        Self::Both
    }
}

impl FromStr for RunMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_uppercase().as_str() {
            "INTRADAY" => Ok(Self::Intraday),
            "EOD" => Ok(Self::Eod),
            "BOTH" => Ok(Self::Both),
            other => Err(Error::Config(format!("Unknown run mode: {other}"))),
        }
    }
}

impl std::fmt::Display for RunMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Alerts configuration
// ============================================================================

fn default_tickers() -> Vec<String> {
    ["HPG", "SSI", "VCB", "VNM"]
        .iter()
        .map(|t| (*t).to_string())
        .collect()
}

fn default_slot_minutes() -> u32 {
    15
}

fn default_tz_offset_hours() -> i32 {
    7
}

/// Alert generation and deduplication settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertsConfig {
    /// Tickers the upstream signal engine is watching
    #[serde(default = "default_tickers")]
    pub tickers: Vec<String>,
    /// Default run mode when none is given on the command line
    #[serde(default)]
    pub run_mode: RunMode,
    /// Slot width in minutes used to bucket alerts for dedup
    #[serde(default = "default_slot_minutes")]
    pub slot_minutes: u32,
    /// Fixed UTC offset (hours) of the market timezone for slot flooring
    #[serde(default = "default_tz_offset_hours")]
    pub tz_offset_hours: i32,
    /// Path to the JSON hand-off file produced by the signal engine
    #[serde(default)]
    pub signals_path: Option<PathBuf>,
    /// Path to the SQLite ledger database
    #[serde(default)]
    pub db_path: Option<PathBuf>,
}

impl Default for AlertsConfig {
    fn default() -> Self {
        Self {
            tickers: default_tickers(),
            run_mode: RunMode::default(),
            slot_minutes: default_slot_minutes(),
            tz_offset_hours: default_tz_offset_hours(),
            signals_path: None,
            db_path: None,
        }
    }
}

impl AlertsConfig {
    /// The ledger database path, defaulting under the config directory.
    pub fn resolved_db_path(&self) -> PathBuf {
        self.db_path
            .clone()
            .unwrap_or_else(|| config_dir().join("alerts.db"))
    }

    fn validate(&self) -> Result<()> {
        if self.slot_minutes == 0 || self.slot_minutes > 60 || 60 % self.slot_minutes != 0 {
            return Err(Error::Config(format!(
                "slot_minutes must divide 60, got {}",
                self.slot_minutes
            )));
        }
        if !(-12..=14).contains(&self.tz_offset_hours) {
            return Err(Error::Config(format!(
                "tz_offset_hours out of range: {}",
                self.tz_offset_hours
            )));
        }
        Ok(())
    }
}

// ============================================================================
// Mail configuration
// ============================================================================

/// Which transport delivers alert emails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MailProvider {
    /// Direct SMTP submission
    Smtp,
    /// Gmail REST API with OAuth tokens
    Gmail,
}

impl Default for MailProvider {
    fn default() -> Self {
        Self::Smtp
    }
}

impl FromStr for MailProvider {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "smtp" => Ok(Self::Smtp),
            "gmail" => Ok(Self::Gmail),
            other => Err(Error::Config(format!("Unknown mail provider: {other}"))),
        }
    }
}

/// SMTP connection security.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SmtpSecurity {
    /// Implicit TLS (SMTPS, typically port 465)
    Ssl,
    /// STARTTLS upgrade (typically port 587)
    Starttls,
    /// Plaintext, for local relays and tests only
    None,
}

impl Default for SmtpSecurity {
    fn default() -> Self {
        Self::Ssl
    }
}

impl FromStr for SmtpSecurity {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_uppercase().as_str() {
            "SSL" => Ok(Self::Ssl),
            "TLS" | "STARTTLS" => Ok(Self::Starttls),
            "NONE" => Ok(Self::None),
            other => Err(Error::Config(format!("Unknown SMTP security: {other}"))),
        }
    }
}

fn default_smtp_host() -> String {
    "smtp.gmail.com".to_string()
}

fn default_smtp_port() -> u16 {
    465
}

fn default_smtp_timeout_secs() -> u64 {
    30
}

/// SMTP transport settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SmtpConfig {
    /// SMTP server hostname
    #[serde(default = "default_smtp_host")]
    pub host: String,
    /// SMTP server port
    #[serde(default = "default_smtp_port")]
    pub port: u16,
    /// Connection security
    #[serde(default)]
    pub security: SmtpSecurity,
    /// Username for authentication
    #[serde(default)]
    pub username: String,
    /// Password for authentication
    #[serde(default)]
    pub password: String,
    /// Connection timeout in seconds
    #[serde(default = "default_smtp_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for SmtpConfig {
    fn default() -> Self {
        Self {
            host: default_smtp_host(),
            port: default_smtp_port(),
            security: SmtpSecurity::default(),
            username: String::new(),
            password: String::new(),
            timeout_secs: default_smtp_timeout_secs(),
        }
    }
}

fn default_gmail_api_base() -> String {
    "https://gmail.googleapis.com".to_string()
}

fn default_gmail_token_url() -> String {
    "https://oauth2.googleapis.com/token".to_string()
}

/// Gmail API transport settings.
///
/// The token file is produced by the operator's OAuth consent tooling and
/// rotated in place by the runtime refresh.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GmailConfig {
    /// Path to the stored OAuth token file
    #[serde(default)]
    pub token_path: Option<PathBuf>,
    /// Gmail API base URL
    #[serde(default = "default_gmail_api_base")]
    pub api_base: String,
    /// OAuth token refresh endpoint
    #[serde(default = "default_gmail_token_url")]
    pub token_url: String,
}

impl Default for GmailConfig {
    fn default() -> Self {
        Self {
            token_path: None,
            api_base: default_gmail_api_base(),
            token_url: default_gmail_token_url(),
        }
    }
}

impl GmailConfig {
    /// The token file path, defaulting under the config directory.
    pub fn resolved_token_path(&self) -> PathBuf {
        self.token_path
            .clone()
            .unwrap_or_else(|| config_dir().join("token.json"))
    }
}

fn default_subject_prefix() -> String {
    "[Fin Alerts] ".to_string()
}

fn default_env_name() -> String {
    "prod".to_string()
}

/// Outbound mail settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MailConfig {
    /// Transport selection
    #[serde(default)]
    pub provider: MailProvider,
    /// From address for outgoing emails
    #[serde(default)]
    pub sender: String,
    /// Recipient addresses
    #[serde(default)]
    pub recipients: Vec<String>,
    /// Subject prefix for alert emails
    #[serde(default = "default_subject_prefix")]
    pub subject_prefix: String,
    /// Environment tag shown in subjects ("prod", "staging", ...)
    #[serde(default = "default_env_name")]
    pub env_name: String,
    /// SMTP settings (used when provider = "smtp")
    #[serde(default)]
    pub smtp: SmtpConfig,
    /// Gmail settings (used when provider = "gmail")
    #[serde(default)]
    pub gmail: GmailConfig,
}

impl Default for MailConfig {
    fn default() -> Self {
        Self {
            provider: MailProvider::default(),
            sender: String::new(),
            recipients: Vec::new(),
            subject_prefix: default_subject_prefix(),
            env_name: default_env_name(),
            smtp: SmtpConfig::default(),
            gmail: GmailConfig::default(),
        }
    }
}

impl MailConfig {
    /// Validate that the configured provider can actually send.
    ///
    /// Called before dispatch so a broken configuration aborts the run
    /// instead of burning ledger reservations.
    pub fn validate(&self) -> Result<()> {
        if self.recipients.iter().all(|r| r.trim().is_empty()) {
            return Err(Error::Config(
                "At least one mail recipient is required (recipients / ALERT_TO)".to_string(),
            ));
        }
        if self.sender.trim().is_empty() {
            return Err(Error::Config(
                "Mail sender is required (sender / ALERT_FROM)".to_string(),
            ));
        }
        if self.provider == MailProvider::Smtp
            && (self.smtp.username.trim().is_empty() || self.smtp.password.trim().is_empty())
        {
            return Err(Error::Config(
                "SMTP username and password must be configured (SMTP_USER / SMTP_PASS)".to_string(),
            ));
        }
        Ok(())
    }
}

// ============================================================================
// Retry configuration
// ============================================================================

fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    1000
}

fn default_max_delay_ms() -> u64 {
    60_000
}

/// Retry budget for transient delivery failures.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Total attempts per alert, including the first
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Backoff base delay in milliseconds
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    /// Backoff cap in milliseconds
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

impl RetryConfig {
    fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(Error::Config("max_attempts must be at least 1".to_string()));
        }
        Ok(())
    }
}

// ============================================================================
// Schedule configuration
// ============================================================================

fn default_intraday_cron() -> String {
    // Every 15 minutes through the morning and afternoon sessions, weekdays.
    "0 */15 9-11,13-14 * * Mon-Fri".to_string()
}

fn default_eod_cron() -> String {
    "0 2 15 * * Mon-Fri".to_string()
}

/// Cron timetable for the built-in scheduler, evaluated in the market
/// timezone (`alerts.tz_offset_hours`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleConfig {
    /// Enable the scheduler loop
    #[serde(default)]
    pub enabled: bool,
    /// Cron expression for intraday runs
    #[serde(default = "default_intraday_cron")]
    pub intraday: String,
    /// Cron expression for the end-of-day run
    #[serde(default = "default_eod_cron")]
    pub eod: String,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            intraday: default_intraday_cron(),
            eod: default_eod_cron(),
        }
    }
}

// ============================================================================
// Observability configuration
// ============================================================================

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

/// Logging settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// Base log level
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Output format: "json" or "pretty"
    #[serde(default = "default_log_format")]
    pub log_format: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_format: default_log_format(),
        }
    }
}

// ============================================================================
// Top-level configuration
// ============================================================================

/// Top-level configuration for the alerts service.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Alert generation and dedup settings
    #[serde(default)]
    pub alerts: AlertsConfig,
    /// Outbound mail settings
    #[serde(default)]
    pub mail: MailConfig,
    /// Retry budget
    #[serde(default)]
    pub retry: RetryConfig,
    /// Scheduler timetable
    #[serde(default)]
    pub schedule: ScheduleConfig,
    /// Logging settings
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

fn read_csv_env(name: &str) -> Option<Vec<String>> {
    std::env::var(name).ok().map(|raw| {
        raw.split(',')
            .map(|item| item.trim().to_string())
            .filter(|item| !item.is_empty())
            .collect()
    })
}

impl Config {
    /// Load configuration from the default path.
    pub fn load() -> Result<Self> {
        let path = config_path();
        if !path.exists() {
            tracing::info!("Config file not found, using defaults");
            return Ok(Self::default());
        }
        Self::load_from(&path)
    }

    /// Load configuration from a specific path.
    pub fn load_from(path: &PathBuf) -> Result<Self> {
        let content = fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("Failed to read config from {}: {e}", path.display()))
        })?;

        serde_json::from_str(&content).map_err(|e| {
            Error::Config(format!("Failed to parse config from {}: {e}", path.display()))
        })
    }

    /// Load configuration with environment variable overrides applied.
    pub fn load_with_env(path: Option<&PathBuf>) -> Result<Self> {
        let mut config = match path {
            Some(p) => Self::load_from(p)?,
            None => Self::load()?,
        };
        config.apply_env_overrides();
        Ok(config)
    }

    /// Apply environment variable overrides to the configuration.
    pub fn apply_env_overrides(&mut self) {
        if let Some(recipients) = read_csv_env("ALERT_TO") {
            self.mail.recipients = recipients;
        }
        if let Ok(sender) = std::env::var("ALERT_FROM") {
            self.mail.sender = sender;
        }
        if let Ok(prefix) = std::env::var("SUBJECT_PREFIX") {
            self.mail.subject_prefix = prefix;
        }
        if let Ok(env_name) = std::env::var("ENV_NAME") {
            self.mail.env_name = env_name;
        }
        if let Ok(provider) = std::env::var("MAIL_PROVIDER") {
            if let Ok(p) = provider.parse() {
                self.mail.provider = p;
            }
        }

        if let Ok(host) = std::env::var("SMTP_HOST") {
            self.mail.smtp.host = host;
        }
        if let Ok(port) = std::env::var("SMTP_PORT") {
            if let Ok(p) = port.parse() {
                self.mail.smtp.port = p;
            }
        }
        if let Ok(user) = std::env::var("SMTP_USER") {
            self.mail.smtp.username = user;
        }
        if let Ok(pass) = std::env::var("SMTP_PASS") {
            self.mail.smtp.password = pass;
        }
        if let Ok(security) = std::env::var("SMTP_SECURITY") {
            if let Ok(s) = security.parse() {
                self.mail.smtp.security = s;
            }
        }

        if let Ok(path) = std::env::var("ALERT_DB_PATH") {
            self.alerts.db_path = Some(PathBuf::from(path));
        }
        if let Ok(path) = std::env::var("SIGNALS_PATH") {
            self.alerts.signals_path = Some(PathBuf::from(path));
        }
        if let Ok(mode) = std::env::var("RUN_MODE") {
            if let Ok(m) = mode.parse() {
                self.alerts.run_mode = m;
            }
        }
        if let Some(tickers) = read_csv_env("TICKERS") {
            self.alerts.tickers = tickers.iter().map(|t| t.to_uppercase()).collect();
        }
        if let Ok(offset) = std::env::var("TZ_OFFSET_HOURS") {
            if let Ok(o) = offset.parse() {
                self.alerts.tz_offset_hours = o;
            }
        }

        if let Ok(level) = std::env::var("LOG_LEVEL") {
            self.observability.log_level = level;
        }
        if let Ok(format) = std::env::var("LOG_FORMAT") {
            self.observability.log_format = format;
        }
    }

    /// Validate the parts of the configuration that every run depends on.
    ///
    /// Mail credentials are validated separately (`MailConfig::validate`)
    /// so ledger-only commands work without a mail setup.
    pub fn validate(&self) -> Result<()> {
        self.alerts.validate()?;
        self.retry.validate()?;
        Ok(())
    }
}
