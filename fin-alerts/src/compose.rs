//! Alert email rendering.
//!
//! Builds the minimal per-alert subject/text/HTML from AlertRecord fields.
//! The dispatcher hands the result straight to a transport; recipients are
//! the transport's concern.

use chrono::{FixedOffset, SecondsFormat};

use fin_common::config::MailConfig;

use crate::alert::{AlertKey, AlertRecord};
use crate::transport::RenderedMessage;

/// Renders alert messages with the configured subject prefix and
/// environment tag.
#[derive(Debug, Clone)]
pub struct Composer {
    subject_prefix: String,
    env_name: String,
    tz: FixedOffset,
}

impl Composer {
    /// Create a composer from the mail configuration.
    pub fn new(mail: &MailConfig, tz: FixedOffset) -> Self {
        Self {
            subject_prefix: mail.subject_prefix.clone(),
            env_name: mail.env_name.clone(),
            tz,
        }
    }

    /// Render one alert.
    pub fn render(&self, record: &AlertRecord, key: &AlertKey) -> RenderedMessage {
        let subject = format!(
            "{}{} {} [{}]",
            self.subject_prefix,
            key.ticker,
            record.event.as_str(),
            self.env_name
        );

        let slot_local = key
            .slot_local(self.tz)
            .to_rfc3339_opts(SecondsFormat::Secs, false);
        let at_local = record
            .at
            .with_timezone(&self.tz)
            .to_rfc3339_opts(SecondsFormat::Secs, false);
        let price_text = record
            .price
            .map_or_else(|| "-".to_string(), |p| format!("{p:.2}"));
        let extras_json = if record.extras.is_empty() {
            "{}".to_string()
        } else {
            serde_json::to_string(&record.extras).unwrap_or_else(|_| "{}".to_string())
        };

        let text = format!(
            "Alert {} {}\nSlot: {}\nAt: {}\nPrice: {}\nReason: {}\nExtras: {}",
            key.ticker,
            record.event.as_str(),
            slot_local,
            at_local,
            price_text,
            record.reason,
            extras_json
        );

        let html = format!(
            r#"<html>
  <body>
    <h3>Alert: {ticker} - {event}</h3>
    <p><strong>Slot:</strong> {slot}</p>
    <p><strong>At:</strong> {at}</p>
    <p><strong>Price:</strong> {price}</p>
    <p><strong>Reason:</strong> {reason}</p>
    <pre style="background-color:#f4f4f4;padding:8px;border-radius:4px;">{extras}</pre>
  </body>
</html>"#,
            ticker = html_escape::encode_text(&key.ticker),
            event = record.event.as_str(),
            slot = slot_local,
            at = at_local,
            price = price_text,
            reason = html_escape::encode_text(&record.reason),
            extras = html_escape::encode_text(&extras_json),
        );

        RenderedMessage { subject, text, html }
    }

    /// Render the fixed test email used by `fin-alerts test-email`.
    pub fn render_test(&self) -> RenderedMessage {
        let subject = format!("{}Test alert [{}]", self.subject_prefix, self.env_name);
        let text = "Delivery test from fin-alerts. If you can read this, the \
                    mail transport is configured correctly."
            .to_string();
        let html = format!(
            "<html><body><h3>Delivery test</h3><p>{}</p></body></html>",
            html_escape::encode_text(&text)
        );
        RenderedMessage { subject, text, html }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alert::{AlertEvent, AlertKey};
    use chrono::DateTime;

    fn composer() -> Composer {
        let mail = MailConfig {
            subject_prefix: "[Fin Alerts] ".to_string(),
            env_name: "staging".to_string(),
            ..Default::default()
        };
        Composer::new(&mail, FixedOffset::east_opt(7 * 3600).unwrap())
    }

    fn sample() -> (AlertRecord, AlertKey) {
        let mut record = AlertRecord::new(
            "HPG",
            AlertEvent::BuyNew,
            "2025-07-01T02:22:41Z".parse::<DateTime<chrono::Utc>>().unwrap(),
            "RSI14=62, MACD cross up, Close>SMA20, vol_spike=+55%",
        );
        record.price = Some(32500.0);
        record
            .extras
            .insert("env".to_string(), "staging".to_string());
        let key = AlertKey::for_record(&record, 15, FixedOffset::east_opt(7 * 3600).unwrap());
        (record, key)
    }

    #[test]
    fn test_subject_format() {
        let (record, key) = sample();
        let message = composer().render(&record, &key);
        assert_eq!(message.subject, "[Fin Alerts] HPG BUY_NEW [staging]");
    }

    #[test]
    fn test_bodies_carry_alert_fields() {
        let (record, key) = sample();
        let message = composer().render(&record, &key);

        // Slot is displayed in market-local time (+07).
        assert!(message.text.contains("Slot: 2025-07-01T09:15:00+07:00"));
        assert!(message.text.contains("Price: 32500.00"));
        assert!(message.text.contains("RSI14=62"));
        assert!(message.html.contains("<h3>Alert: HPG - BUY_NEW</h3>"));
        assert!(message.html.contains("32500.00"));
    }

    #[test]
    fn test_missing_price_renders_dash() {
        let (mut record, key) = sample();
        record.price = None;
        let message = composer().render(&record, &key);
        assert!(message.text.contains("Price: -"));
    }

    #[test]
    fn test_html_is_escaped() {
        let (mut record, key) = sample();
        record.reason = "<script>alert(1)</script>".to_string();
        let message = composer().render(&record, &key);
        assert!(!message.html.contains("<script>"));
        assert!(message.html.contains("&lt;script&gt;"));
    }

    #[test]
    fn test_render_test_email() {
        let message = composer().render_test();
        assert_eq!(message.subject, "[Fin Alerts] Test alert [staging]");
        assert!(message.text.contains("Delivery test"));
    }
}
