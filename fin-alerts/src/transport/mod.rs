//! Mail transports.
//!
//! A transport delivers one rendered message and reports failures through a
//! taxonomy the dispatcher can act on: transient failures are retried with
//! backoff, permanent failures mark the alert FAILED after a single attempt.

mod gmail;
mod smtp;

pub use gmail::GmailMailer;
pub use smtp::SmtpMailer;

use async_trait::async_trait;
use fin_common::config::{MailConfig, MailProvider};

/// A message ready for delivery. Addressing lives in the transport
/// configuration; the dispatcher only supplies content.
#[derive(Debug, Clone)]
pub struct RenderedMessage {
    /// Subject line
    pub subject: String,
    /// Plain text body
    pub text: String,
    /// HTML body
    pub html: String,
}

/// Confirmation metadata from a successful delivery.
#[derive(Debug, Clone)]
pub struct DeliveryResponse {
    /// Provider message id (Gmail) or a synthetic id (SMTP)
    pub message_id: String,
    /// Response code, when the provider reports one
    pub code: Option<String>,
}

/// Transport failure, classified for retry policy.
///
/// The classification is the contract: `Busy`, `Connection`, and `Timeout`
/// are worth retrying, everything else is not.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// Credential problem; retrying cannot help until an operator acts
    #[error("authentication failed: {0}")]
    Auth(String),

    /// The message itself could not be constructed or was rejected as malformed
    #[error("invalid message: {0}")]
    InvalidMessage(String),

    /// The server refused delivery and will keep refusing (permanent 4xx/5xx reply)
    #[error("rejected (code {code:?}): {reason}")]
    Rejected {
        /// Provider status code, if reported
        code: Option<u16>,
        /// Provider error text
        reason: String,
    },

    /// The server is temporarily unable to accept (rate limit, overload, 5xx)
    #[error("server busy (code {code:?}): {reason}")]
    Busy {
        /// Provider status code, if reported
        code: Option<u16>,
        /// Provider error text
        reason: String,
    },

    /// Could not reach the server
    #[error("connection failed: {0}")]
    Connection(String),

    /// The request timed out
    #[error("request timed out")]
    Timeout,
}

impl TransportError {
    /// Whether the dispatcher should retry after backoff.
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Busy { .. } | Self::Connection(_) | Self::Timeout)
    }

    /// Provider status code, when one was reported.
    pub const fn code(&self) -> Option<u16> {
        match self {
            Self::Rejected { code, .. } | Self::Busy { code, .. } => *code,
            _ => None,
        }
    }

    /// Classify an HTTP status from a REST mail API.
    ///
    /// 401 is an expired/revoked credential; 403 and 429 are quota/rate
    /// limiting (Gmail reports quota exhaustion as 403); remaining 4xx are
    /// malformed requests that will not improve on retry; 5xx is the server's
    /// problem and worth another attempt.
    pub fn from_http_status(status: u16, body: String) -> Self {
        match status {
            401 => Self::Auth(body),
            403 | 429 => Self::Busy {
                code: Some(status),
                reason: body,
            },
            400..=499 => Self::Rejected {
                code: Some(status),
                reason: body,
            },
            _ => Self::Busy {
                code: Some(status),
                reason: body,
            },
        }
    }
}

/// Assemble the MIME message shared by both transports: multipart
/// alternative with plain text and HTML bodies.
pub(crate) fn build_mime(
    sender: &str,
    recipients: &[String],
    message: &RenderedMessage,
) -> Result<lettre::Message, TransportError> {
    use lettre::message::{Mailbox, MultiPart};

    let from: Mailbox = sender
        .parse()
        .map_err(|e| TransportError::InvalidMessage(format!("Invalid sender address: {e}")))?;

    let mut builder = lettre::Message::builder()
        .from(from)
        .subject(message.subject.clone());
    for recipient in recipients {
        let to: Mailbox = recipient.parse().map_err(|e| {
            TransportError::InvalidMessage(format!("Invalid recipient {recipient}: {e}"))
        })?;
        builder = builder.to(to);
    }

    builder
        .multipart(MultiPart::alternative_plain_html(
            message.text.clone(),
            message.html.clone(),
        ))
        .map_err(|e| TransportError::InvalidMessage(format!("Failed to build email: {e}")))
}

/// Mail transport capability.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Transport name for logging.
    fn name(&self) -> &'static str;

    /// Deliver one message to the configured recipients.
    async fn send(&self, message: &RenderedMessage) -> Result<DeliveryResponse, TransportError>;
}

/// Build the configured transport.
///
/// Selection happens once at construction time; the dispatcher only ever
/// sees the trait object.
pub fn build_transport(mail: &MailConfig) -> anyhow::Result<Box<dyn Transport>> {
    match mail.provider {
        MailProvider::Smtp => Ok(Box::new(SmtpMailer::new(mail)?)),
        MailProvider::Gmail => Ok(Box::new(GmailMailer::new(mail)?)),
    }
}
