//! Logging sender for development and dry environments: every send
//! "succeeds" and is written to the log instead of a wire.

use super::{SendOutcome, Sender};
use crate::models::OutboxMessage;
use async_trait::async_trait;
use uuid::Uuid;

#[derive(Default)]
pub struct LogSender;

impl LogSender {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Sender for LogSender {
    async fn send(&self, message: &OutboxMessage, dry_run: bool) -> SendOutcome {
        if dry_run {
            return SendOutcome::DryRun;
        }

        tracing::info!(
            message_id = %message.message_id,
            invoice_id = %message.invoice_id,
            channel = %message.channel,
            recipient = message.masked_recipient.as_deref().unwrap_or("-"),
            "Log sender delivering reminder"
        );

        SendOutcome::Sent {
            provider_message_id: Some(format!("log-{}", Uuid::new_v4())),
        }
    }
}
