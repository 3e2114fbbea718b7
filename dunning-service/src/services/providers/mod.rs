//! Send providers: one per contact channel, behind a common trait.
//!
//! Providers must be safe to call repeatedly with the same payload — the
//! outbox gives at-least-once delivery, not exactly-once. Failures come back
//! as data (`SendOutcome::Failed`), not errors, so the delivery engine can
//! route them through retry or dead-letter; a `permanent` failure skips the
//! retry budget entirely.

pub mod email;
pub mod log;
pub mod sms;

use crate::models::{ContactChannel, OutboxMessage};
use async_trait::async_trait;
use std::sync::Arc;

pub use email::SmtpSender;
pub use log::LogSender;
pub use sms::HttpSmsSender;

pub const ERR_PROVIDER_DISABLED: &str = "provider_disabled";
pub const ERR_INVALID_RECIPIENT: &str = "invalid_recipient";
pub const ERR_CONNECTION_FAILED: &str = "connection_failed";
pub const ERR_SEND_FAILED: &str = "send_failed";
pub const ERR_UNKNOWN_CHANNEL: &str = "unknown_channel";
pub const ERR_RECIPIENT_MISSING: &str = "recipient_missing";

/// Result of one send call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    Sent {
        provider_message_id: Option<String>,
    },
    DryRun,
    Failed {
        error_code: String,
        error_message: String,
        permanent: bool,
    },
}

impl SendOutcome {
    pub fn failed(code: &str, message: impl Into<String>, permanent: bool) -> Self {
        SendOutcome::Failed {
            error_code: code.to_string(),
            error_message: message.into(),
            permanent,
        }
    }
}

#[async_trait]
pub trait Sender: Send + Sync {
    async fn send(&self, message: &OutboxMessage, dry_run: bool) -> SendOutcome;
}

/// Routes a message to the provider for its channel.
pub struct SenderRouter {
    email: Arc<dyn Sender>,
    sms: Arc<dyn Sender>,
}

impl SenderRouter {
    pub fn new(email: Arc<dyn Sender>, sms: Arc<dyn Sender>) -> Self {
        Self { email, sms }
    }
}

#[async_trait]
impl Sender for SenderRouter {
    async fn send(&self, message: &OutboxMessage, dry_run: bool) -> SendOutcome {
        match message.channel.as_str() {
            c if c == ContactChannel::Email.as_str() => self.email.send(message, dry_run).await,
            c if c == ContactChannel::Sms.as_str() => self.sms.send(message, dry_run).await,
            other => SendOutcome::failed(
                ERR_UNKNOWN_CHANNEL,
                format!("No provider for channel '{}'", other),
                true,
            ),
        }
    }
}

/// Human-readable reminder text rendered from the outbox payload. Shared by
/// the email and SMS providers.
pub(crate) fn render_reminder_text(message: &OutboxMessage) -> String {
    let payload = &message.payload;
    let creator = payload
        .get("creator_name")
        .and_then(|v| v.as_str())
        .unwrap_or("your counterparty");
    let currency = payload.get("currency").and_then(|v| v.as_str()).unwrap_or("");
    let balance = payload
        .get("balance_due")
        .map(|v| v.to_string())
        .unwrap_or_default();
    let due_date = payload
        .get("due_date")
        .and_then(|v| v.as_str())
        .unwrap_or("");

    format!(
        "Invoice {} from {} is due. Outstanding balance: {} {}. Due date: {}.",
        message.invoice_id, creator, balance, currency, due_date
    )
}
