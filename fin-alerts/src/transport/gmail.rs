//! Gmail API mail transport.
//!
//! Sends through `POST /gmail/v1/users/me/messages/send` with a bearer token
//! read from a stored token file. The token file is produced by the
//! operator's OAuth consent tooling; this transport only performs the
//! runtime half: using the cached access token while it is fresh, and
//! refreshing it against the OAuth endpoint (rotating the file in place)
//! when it is not.

use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE;
use base64::Engine as _;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, warn};

use fin_common::config::MailConfig;

use super::{DeliveryResponse, RenderedMessage, Transport, TransportError};

/// Access tokens expiring within this window are refreshed eagerly.
const EXPIRY_SLACK_SECS: i64 = 60;

/// Stored OAuth token file.
///
/// Field aliases keep compatibility with token files written by Google's
/// own client tooling.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredToken {
    client_id: String,
    client_secret: String,
    refresh_token: String,
    #[serde(default, alias = "token")]
    access_token: Option<String>,
    #[serde(default)]
    expiry: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
struct RefreshResponse {
    access_token: String,
    #[serde(default = "default_expires_in")]
    expires_in: i64,
}

fn default_expires_in() -> i64 {
    3600
}

#[derive(Debug, Deserialize)]
struct SendResponse {
    id: Option<String>,
}

/// Gmail REST transport.
pub struct GmailMailer {
    client: reqwest::Client,
    sender: String,
    recipients: Vec<String>,
    token_path: PathBuf,
    api_base: String,
    token_url: String,
}

impl GmailMailer {
    /// Create a new Gmail mailer from the mail configuration.
    pub fn new(mail: &MailConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());

        Ok(Self {
            client,
            sender: mail.sender.clone(),
            recipients: mail.recipients.clone(),
            token_path: mail.gmail.resolved_token_path(),
            api_base: mail.gmail.api_base.trim_end_matches('/').to_string(),
            token_url: mail.gmail.token_url.clone(),
        })
    }

    fn read_token(&self) -> Result<StoredToken, TransportError> {
        let content = std::fs::read_to_string(&self.token_path).map_err(|e| {
            TransportError::Auth(format!(
                "Missing or unreadable token file {}: {e}; run the OAuth init tooling",
                self.token_path.display()
            ))
        })?;
        serde_json::from_str(&content).map_err(|e| {
            TransportError::Auth(format!(
                "Malformed token file {}: {e}",
                self.token_path.display()
            ))
        })
    }

    fn write_token(&self, token: &StoredToken) {
        // Best effort: a failed write only costs an extra refresh next run.
        match serde_json::to_string_pretty(token) {
            Ok(content) => {
                if let Err(e) = std::fs::write(&self.token_path, content) {
                    warn!(path = %self.token_path.display(), error = %e, "Failed to persist rotated token");
                }
            }
            Err(e) => warn!(error = %e, "Failed to serialize rotated token"),
        }
    }

    fn map_request_error(error: reqwest::Error) -> TransportError {
        if error.is_timeout() {
            TransportError::Timeout
        } else {
            TransportError::Connection(error.to_string())
        }
    }

    /// Return a usable bearer token, refreshing and rotating the stored file
    /// when the cached one is missing or stale.
    async fn ensure_access_token(&self) -> Result<String, TransportError> {
        let mut token = self.read_token()?;

        if let (Some(access), Some(expiry)) = (&token.access_token, token.expiry) {
            if expiry > Utc::now() + ChronoDuration::seconds(EXPIRY_SLACK_SECS) {
                return Ok(access.clone());
            }
        }

        let params = [
            ("grant_type", "refresh_token"),
            ("client_id", token.client_id.as_str()),
            ("client_secret", token.client_secret.as_str()),
            ("refresh_token", token.refresh_token.as_str()),
        ];

        let response = self
            .client
            .post(self.token_url.as_str())
            .form(&params)
            .send()
            .await
            .map_err(Self::map_request_error)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            if status.is_server_error() {
                return Err(TransportError::Busy {
                    code: Some(status.as_u16()),
                    reason: body,
                });
            }
            // invalid_grant and friends: the refresh token itself is dead.
            return Err(TransportError::Auth(format!(
                "Token refresh rejected ({status}): {body}; re-run OAuth consent"
            )));
        }

        let refreshed: RefreshResponse = response
            .json()
            .await
            .map_err(|e| TransportError::Auth(format!("Malformed token response: {e}")))?;

        token.access_token = Some(refreshed.access_token.clone());
        token.expiry = Some(Utc::now() + ChronoDuration::seconds(refreshed.expires_in));
        self.write_token(&token);

        info!("Gmail access token refreshed");
        Ok(refreshed.access_token)
    }

    fn encode_raw_message(&self, message: &RenderedMessage) -> Result<String, TransportError> {
        let mime = super::build_mime(&self.sender, &self.recipients, message)?;
        Ok(URL_SAFE.encode(mime.formatted()))
    }
}

#[async_trait]
impl Transport for GmailMailer {
    fn name(&self) -> &'static str {
        "gmail"
    }

    async fn send(&self, message: &RenderedMessage) -> Result<DeliveryResponse, TransportError> {
        let access_token = self.ensure_access_token().await?;
        let raw = self.encode_raw_message(message)?;

        let url = format!("{}/gmail/v1/users/me/messages/send", self.api_base);
        let response = self
            .client
            .post(url)
            .bearer_auth(access_token)
            .json(&serde_json::json!({ "raw": raw }))
            .send()
            .await
            .map_err(Self::map_request_error)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(TransportError::from_http_status(status.as_u16(), body));
        }

        let sent: SendResponse = response.json().await.unwrap_or(SendResponse { id: None });
        let message_id = sent.id.unwrap_or_default();

        info!(
            recipients = self.recipients.len(),
            %message_id,
            "Email sent via Gmail API"
        );

        Ok(DeliveryResponse {
            message_id,
            code: Some(status.as_u16().to_string()),
        })
    }
}
