//! SMTP email provider.

use super::{
    render_reminder_text, SendOutcome, Sender, ERR_INVALID_RECIPIENT, ERR_PROVIDER_DISABLED,
    ERR_RECIPIENT_MISSING, ERR_SEND_FAILED,
};
use crate::config::SmtpConfig;
use crate::models::OutboxMessage;
use async_trait::async_trait;
use lettre::{
    message::{header::ContentType, Mailbox},
    transport::smtp::authentication::Credentials,
    AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor,
};
use service_core::error::AppError;

pub struct SmtpSender {
    config: SmtpConfig,
    transport: Option<AsyncSmtpTransport<Tokio1Executor>>,
}

impl SmtpSender {
    pub fn new(config: SmtpConfig) -> Result<Self, AppError> {
        if !config.enabled {
            return Ok(Self {
                config,
                transport: None,
            });
        }

        let creds = Credentials::new(config.user.clone(), config.password.clone());

        let transport = AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&config.host)
            .map_err(|e| {
                AppError::ConfigError(anyhow::anyhow!("Failed to create SMTP relay: {}", e))
            })?
            .port(config.port)
            .credentials(creds)
            .build();

        Ok(Self {
            config,
            transport: Some(transport),
        })
    }
}

#[async_trait]
impl Sender for SmtpSender {
    async fn send(&self, message: &OutboxMessage, dry_run: bool) -> SendOutcome {
        if dry_run {
            return SendOutcome::DryRun;
        }

        let Some(transport) = self.transport.as_ref() else {
            return SendOutcome::failed(
                ERR_PROVIDER_DISABLED,
                "SMTP email provider is not enabled",
                true,
            );
        };

        let Some(recipient) = message.recipient.as_deref() else {
            return SendOutcome::failed(ERR_RECIPIENT_MISSING, "No email recipient", true);
        };

        let from_mailbox: Mailbox = match format!(
            "{} <{}>",
            self.config.from_name, self.config.from_email
        )
        .parse()
        {
            Ok(mb) => mb,
            Err(e) => {
                return SendOutcome::failed(
                    ERR_SEND_FAILED,
                    format!("Invalid from address: {}", e),
                    true,
                );
            }
        };

        let to_mailbox: Mailbox = match recipient.parse() {
            Ok(mb) => mb,
            Err(e) => {
                return SendOutcome::failed(
                    ERR_INVALID_RECIPIENT,
                    format!("Invalid recipient '{}': {}", recipient, e),
                    true,
                );
            }
        };

        let subject = format!("Payment reminder: invoice {}", message.invoice_id);
        let body = render_reminder_text(message);

        let email = match Message::builder()
            .from(from_mailbox)
            .to(to_mailbox)
            .subject(subject)
            .header(ContentType::TEXT_PLAIN)
            .body(body)
        {
            Ok(email) => email,
            Err(e) => {
                return SendOutcome::failed(
                    ERR_SEND_FAILED,
                    format!("Failed to build message: {}", e),
                    true,
                );
            }
        };

        match transport.send(email).await {
            Ok(response) => SendOutcome::Sent {
                provider_message_id: response.message().next().map(|s| s.to_string()),
            },
            Err(e) => SendOutcome::failed(
                ERR_SEND_FAILED,
                format!("Failed to send email: {}", e),
                false,
            ),
        }
    }
}
