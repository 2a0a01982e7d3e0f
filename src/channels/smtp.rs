//! HTML digest delivery over SMTP via lettre.

use async_trait::async_trait;
use lettre::message::header::ContentType;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{Message, SmtpTransport, Transport};
use secrecy::{ExposeSecret, SecretString};
use tracing::info;

use crate::error::{ChannelError, ConfigError, PipelineError};
use crate::pipeline::types::DeliverySink;

/// SMTP settings.
#[derive(Debug, Clone)]
pub struct SmtpConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: SecretString,
    pub from_address: String,
}

impl SmtpConfig {
    /// Build from `EMAIL_SMTP_HOST` (defaults from `EMAIL_IMAP_HOST`),
    /// `EMAIL_SMTP_PORT`, `EMAIL_USERNAME`, `EMAIL_PASSWORD`, `EMAIL_FROM_ADDRESS`.
    pub fn from_env() -> Result<Self, ConfigError> {
        let host = std::env::var("EMAIL_SMTP_HOST")
            .ok()
            .or_else(|| {
                std::env::var("EMAIL_IMAP_HOST")
                    .ok()
                    .map(|h| h.replace("imap", "smtp"))
            })
            .ok_or_else(|| ConfigError::MissingRequired {
                key: "EMAIL_SMTP_HOST".into(),
                hint: "Set EMAIL_SMTP_HOST or DIGEST_HTML_OUT for a dry run".into(),
            })?;
        let port: u16 = std::env::var("EMAIL_SMTP_PORT")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(587);
        let username = std::env::var("EMAIL_USERNAME")
            .map_err(|_| ConfigError::MissingEnvVar("EMAIL_USERNAME".into()))?;
        let password = std::env::var("EMAIL_PASSWORD")
            .map_err(|_| ConfigError::MissingEnvVar("EMAIL_PASSWORD".into()))?;
        let from_address =
            std::env::var("EMAIL_FROM_ADDRESS").unwrap_or_else(|_| username.clone());

        Ok(Self {
            host,
            port,
            username,
            password: SecretString::from(password),
            from_address,
        })
    }
}

/// Sends the rendered digest as an HTML email.
pub struct SmtpSink {
    config: SmtpConfig,
    recipient: String,
}

impl SmtpSink {
    pub fn new(config: SmtpConfig, recipient: impl Into<String>) -> Self {
        Self {
            config,
            recipient: recipient.into(),
        }
    }
}

fn send_error(reason: String) -> ChannelError {
    ChannelError::SendFailed {
        name: "smtp".into(),
        reason,
    }
}

/// Build the MIME message for a digest.
fn build_message(from: &str, to: &str, subject: &str, html: &str) -> Result<Message, ChannelError> {
    Message::builder()
        .from(
            from.parse()
                .map_err(|e| send_error(format!("Invalid from address: {e}")))?,
        )
        .to(to
            .parse()
            .map_err(|e| send_error(format!("Invalid to address: {e}")))?)
        .subject(subject)
        .header(ContentType::TEXT_HTML)
        .body(html.to_string())
        .map_err(|e| send_error(format!("Failed to build email: {e}")))
}

fn send_blocking(config: &SmtpConfig, message: &Message) -> Result<(), ChannelError> {
    let creds = Credentials::new(
        config.username.clone(),
        config.password.expose_secret().to_string(),
    );
    let builder = if config.port == 465 {
        SmtpTransport::relay(&config.host)
    } else {
        SmtpTransport::starttls_relay(&config.host)
    }
    .map_err(|e| send_error(format!("SMTP relay error: {e}")))?;

    let transport = builder.port(config.port).credentials(creds).build();
    transport
        .send(message)
        .map_err(|e| send_error(format!("SMTP send failed: {e}")))?;
    Ok(())
}

#[async_trait]
impl DeliverySink for SmtpSink {
    fn name(&self) -> &str {
        "smtp"
    }

    async fn deliver(&self, subject: &str, html_body: &str) -> Result<(), PipelineError> {
        let message = build_message(&self.config.from_address, &self.recipient, subject, html_body)
            .map_err(|e| PipelineError::Delivery(e.to_string()))?;
        let config = self.config.clone();
        tokio::task::spawn_blocking(move || send_blocking(&config, &message))
            .await
            .map_err(|e| PipelineError::Delivery(format!("SMTP task failed: {e}")))?
            .map_err(|e| PipelineError::Delivery(e.to_string()))?;
        info!(to = %self.recipient, subject, "Digest sent");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_html_message() {
        let message = build_message(
            "digest@example.com",
            "me@example.com",
            "Newsletter digest: Mar 1, 2026",
            "<h1>Hi</h1>",
        )
        .unwrap();
        let raw = String::from_utf8(message.formatted()).unwrap();
        assert!(raw.contains("Subject: Newsletter digest: Mar 1, 2026"));
        assert!(raw.contains("Content-Type: text/html"));
        assert!(raw.contains("<h1>Hi</h1>"));
    }

    #[test]
    fn rejects_bad_recipient() {
        let err = build_message("digest@example.com", "not an address", "s", "b").unwrap_err();
        assert!(err.to_string().contains("Invalid to address"));
    }
}
