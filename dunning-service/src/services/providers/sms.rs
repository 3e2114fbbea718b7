//! HTTP SMS gateway provider.

use super::{
    render_reminder_text, SendOutcome, Sender, ERR_CONNECTION_FAILED, ERR_INVALID_RECIPIENT,
    ERR_PROVIDER_DISABLED, ERR_RECIPIENT_MISSING, ERR_SEND_FAILED,
};
use crate::config::SmsConfig;
use crate::models::OutboxMessage;
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

pub struct HttpSmsSender {
    config: SmsConfig,
    client: Client,
}

#[derive(Debug, Serialize)]
struct SmsGatewayRequest {
    sender: String,
    sms: Vec<SmsPart>,
}

#[derive(Debug, Serialize)]
struct SmsPart {
    message: String,
    to: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct SmsGatewayResponse {
    #[serde(rename = "type")]
    response_type: String,
    message: String,
    #[serde(default)]
    request_id: Option<String>,
}

impl HttpSmsSender {
    pub fn new(config: SmsConfig) -> Self {
        Self {
            config,
            client: Client::new(),
        }
    }
}

#[async_trait]
impl Sender for HttpSmsSender {
    async fn send(&self, message: &OutboxMessage, dry_run: bool) -> SendOutcome {
        if dry_run {
            return SendOutcome::DryRun;
        }

        if !self.config.enabled {
            return SendOutcome::failed(
                ERR_PROVIDER_DISABLED,
                "SMS provider is not enabled",
                true,
            );
        }

        let Some(recipient) = message.recipient.as_deref() else {
            return SendOutcome::failed(ERR_RECIPIENT_MISSING, "No SMS recipient", true);
        };

        // Normalize phone number (strip everything but digits and leading +).
        let normalized: String = recipient
            .chars()
            .filter(|c| c.is_ascii_digit() || *c == '+')
            .collect();

        if normalized.is_empty() {
            return SendOutcome::failed(
                ERR_INVALID_RECIPIENT,
                format!("Phone number '{}' has no digits", recipient),
                true,
            );
        }

        let request = SmsGatewayRequest {
            sender: self.config.sender_id.clone(),
            sms: vec![SmsPart {
                message: render_reminder_text(message),
                to: vec![normalized],
            }],
        };

        let response = match self
            .client
            .post(&self.config.api_url)
            .header("authkey", &self.config.auth_key)
            .header("Content-Type", "application/json")
            .json(&request)
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) => {
                return SendOutcome::failed(
                    ERR_CONNECTION_FAILED,
                    format!("Failed to reach SMS gateway: {}", e),
                    false,
                );
            }
        };

        if !response.status().is_success() {
            let status = response.status();
            return SendOutcome::failed(
                ERR_SEND_FAILED,
                format!("SMS gateway returned {}", status),
                false,
            );
        }

        match response.json::<SmsGatewayResponse>().await {
            Ok(body) if body.response_type == "success" => SendOutcome::Sent {
                provider_message_id: body.request_id,
            },
            Ok(body) => SendOutcome::failed(
                ERR_SEND_FAILED,
                format!("SMS gateway rejected send: {}", body.message),
                false,
            ),
            Err(e) => SendOutcome::failed(
                ERR_SEND_FAILED,
                format!("Invalid SMS gateway response: {}", e),
                false,
            ),
        }
    }
}
