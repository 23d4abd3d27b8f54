//! SMTP mail transport over lettre.

use async_trait::async_trait;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{Message, SmtpTransport, Transport as LettreTransport};
use std::time::Duration;
use tracing::info;
use uuid::Uuid;

use fin_common::config::{MailConfig, SmtpConfig, SmtpSecurity};

use super::{DeliveryResponse, RenderedMessage, Transport, TransportError};

/// SMTP submission transport.
///
/// Connects per send; a fresh connection sidesteps relay idle-timeout
/// surprises between slots.
pub struct SmtpMailer {
    smtp: SmtpConfig,
    sender: String,
    recipients: Vec<String>,
}

impl SmtpMailer {
    /// Create a new SMTP mailer from the mail configuration.
    pub fn new(mail: &MailConfig) -> anyhow::Result<Self> {
        Ok(Self {
            smtp: mail.smtp.clone(),
            sender: mail.sender.clone(),
            recipients: mail.recipients.clone(),
        })
    }

    fn create_transport(&self) -> Result<SmtpTransport, TransportError> {
        let creds = Credentials::new(self.smtp.username.clone(), self.smtp.password.clone());
        let timeout = Some(Duration::from_secs(self.smtp.timeout_secs));

        let transport = match self.smtp.security {
            SmtpSecurity::Ssl => SmtpTransport::relay(&self.smtp.host)
                .map_err(|e| TransportError::Connection(format!("SMTP setup failed: {e}")))?
                .port(self.smtp.port)
                .credentials(creds)
                .timeout(timeout)
                .build(),
            SmtpSecurity::Starttls => SmtpTransport::starttls_relay(&self.smtp.host)
                .map_err(|e| TransportError::Connection(format!("SMTP setup failed: {e}")))?
                .port(self.smtp.port)
                .credentials(creds)
                .timeout(timeout)
                .build(),
            SmtpSecurity::None => SmtpTransport::builder_dangerous(&self.smtp.host)
                .port(self.smtp.port)
                .credentials(creds)
                .timeout(timeout)
                .build(),
        };
        Ok(transport)
    }

    fn build_message(&self, message: &RenderedMessage) -> Result<Message, TransportError> {
        super::build_mime(&self.sender, &self.recipients, message)
    }

    fn classify(error: &lettre::transport::smtp::Error) -> TransportError {
        if error.is_transient() {
            // 421/450/451/452-style replies: the relay asked us to come back.
            TransportError::Busy {
                code: None,
                reason: error.to_string(),
            }
        } else if error.is_permanent() {
            TransportError::Rejected {
                code: None,
                reason: error.to_string(),
            }
        } else {
            // No SMTP reply at all: connect/TLS/read failures.
            TransportError::Connection(error.to_string())
        }
    }
}

#[async_trait]
impl Transport for SmtpMailer {
    fn name(&self) -> &'static str {
        "smtp"
    }

    async fn send(&self, message: &RenderedMessage) -> Result<DeliveryResponse, TransportError> {
        let email = self.build_message(message)?;
        let transport = self.create_transport()?;

        let response = transport.send(&email).map_err(|e| Self::classify(&e))?;
        let code = response.code().to_string();

        let message_id = format!("smtp-{}", Uuid::new_v4());
        info!(
            recipients = self.recipients.len(),
            code = %code,
            %message_id,
            "Email sent via SMTP"
        );

        Ok(DeliveryResponse {
            message_id,
            code: Some(code),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mailer() -> SmtpMailer {
        let mut mail = MailConfig {
            sender: "Fin Alerts <alerts@example.com>".to_string(),
            recipients: vec!["ops@example.com".to_string(), "desk@example.com".to_string()],
            ..Default::default()
        };
        mail.smtp.username = "alerts@example.com".to_string();
        mail.smtp.password = "app-password".to_string();
        SmtpMailer::new(&mail).unwrap()
    }

    fn rendered() -> RenderedMessage {
        RenderedMessage {
            subject: "[Fin Alerts] VNM BUY_NEW [prod]".to_string(),
            text: "Alert VNM BUY_NEW".to_string(),
            html: "<h3>Alert: VNM - BUY_NEW</h3>".to_string(),
        }
    }

    #[test]
    fn test_build_message_multipart() {
        let email = mailer().build_message(&rendered()).unwrap();
        let bytes = email.formatted();
        let raw = String::from_utf8_lossy(&bytes);
        assert!(raw.contains("Subject: [Fin Alerts] VNM BUY_NEW [prod]"));
        assert!(raw.contains("multipart/alternative"));
        assert!(raw.contains("ops@example.com"));
        assert!(raw.contains("desk@example.com"));
    }

    #[test]
    fn test_invalid_sender_is_permanent() {
        let mut mail = MailConfig {
            sender: "not an address".to_string(),
            recipients: vec!["ops@example.com".to_string()],
            ..Default::default()
        };
        mail.smtp.username = "u".to_string();
        mail.smtp.password = "p".to_string();
        let mailer = SmtpMailer::new(&mail).unwrap();

        let err = mailer.build_message(&rendered()).unwrap_err();
        assert!(matches!(err, TransportError::InvalidMessage(_)));
        assert!(!err.is_transient());
    }

    #[test]
    fn test_transport_name() {
        assert_eq!(mailer().name(), "smtp");
    }
}
