#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use dunning_service::config::{
    DunningConfig, ReminderPolicy, RepositoryBackend, RepositoryConfig, SmsConfig, SmtpConfig,
};
use dunning_service::models::{
    ContactChannel, DispatchRequest, OutboxMessage, StartRunRequest, UpsertInvoice,
};
use dunning_service::services::providers::{SendOutcome, Sender};
use dunning_service::services::{InMemoryStore, ReminderEngine};
use dunning_service::startup::Application;
use rust_decimal::Decimal;
use service_core::config::Config as CoreConfig;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

/// Scripted sender: pops the next outcome per send, succeeding once the
/// script runs out. Records every call for assertions.
pub struct StubSender {
    script: Mutex<VecDeque<SendOutcome>>,
    calls: Mutex<Vec<(String, String)>>,
}

impl StubSender {
    pub fn always_ok() -> Self {
        Self::with_script(vec![])
    }

    pub fn with_script(outcomes: Vec<SendOutcome>) -> Self {
        Self {
            script: Mutex::new(outcomes.into()),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn transient_failure() -> SendOutcome {
        SendOutcome::Failed {
            error_code: "send_failed".to_string(),
            error_message: "provider unavailable".to_string(),
            permanent: false,
        }
    }

    /// Calls seen so far, as (invoice_id, channel) pairs.
    pub fn calls(&self) -> Vec<(String, String)> {
        self.calls.lock().expect("calls lock").clone()
    }
}

#[async_trait]
impl Sender for StubSender {
    async fn send(&self, message: &OutboxMessage, _dry_run: bool) -> SendOutcome {
        self.calls
            .lock()
            .expect("calls lock")
            .push((message.invoice_id.clone(), message.channel.clone()));
        self.script
            .lock()
            .expect("script lock")
            .pop_front()
            .unwrap_or(SendOutcome::Sent {
                provider_message_id: Some("stub-message".to_string()),
            })
    }
}

pub fn engine_with_sender(sender: Arc<dyn Sender>) -> ReminderEngine {
    ReminderEngine::new(
        Arc::new(InMemoryStore::new()),
        sender,
        ReminderPolicy::default(),
    )
}

pub fn engine_with_memory() -> ReminderEngine {
    engine_with_sender(Arc::new(StubSender::always_ok()))
}

pub fn at(year: i32, month: u32, day: u32, hour: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(year, month, day, hour, 0, 0)
        .single()
        .expect("valid timestamp")
}

pub fn date(year: i32, month: u32, day: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(year, month, day).expect("valid date")
}

pub fn upsert_invoice(invoice_id: &str, due_date: NaiveDate) -> UpsertInvoice {
    UpsertInvoice {
        invoice_id: invoice_id.to_string(),
        creator_id: "creator-1".to_string(),
        creator_name: "Ada Lovelace".to_string(),
        contact_channel: ContactChannel::Email,
        contact_target: Some("ada@example.com".to_string()),
        currency: "USD".to_string(),
        amount_due: Decimal::new(15000, 2),
        amount_paid: Decimal::ZERO,
        issued_at: None,
        due_date,
        creator_timezone: None,
        opt_out: false,
    }
}

pub fn dispatch_request(invoice_id: &str, channels: Vec<ContactChannel>) -> DispatchRequest {
    let mut recipients = HashMap::new();
    for channel in &channels {
        match channel {
            ContactChannel::Email => {
                recipients.insert("email".to_string(), "ada@example.com".to_string());
            }
            ContactChannel::Sms => {
                recipients.insert("sms".to_string(), "+14155551234".to_string());
            }
        }
    }
    DispatchRequest {
        invoice_id: invoice_id.to_string(),
        channels,
        recipients,
        idempotency_key: None,
    }
}

/// Upsert one email-contact invoice and register its dispatch.
pub async fn seed_dispatched_invoice(
    engine: &ReminderEngine,
    invoice_id: &str,
    due_date: NaiveDate,
    now: DateTime<Utc>,
) {
    engine
        .upsert_invoices(vec![upsert_invoice(invoice_id, due_date)], now)
        .await
        .expect("Failed to upsert invoice");
    engine
        .dispatch(dispatch_request(invoice_id, vec![ContactChannel::Email]), now)
        .await
        .expect("Failed to dispatch invoice");
}

pub fn run_request(now: DateTime<Utc>) -> StartRunRequest {
    StartRunRequest {
        dry_run: false,
        now: Some(now),
        limit: None,
        triggered_by: Some("test".to_string()),
        idempotency_key: None,
    }
}

pub struct TestApp {
    pub address: String,
    pub port: u16,
}

impl TestApp {
    pub async fn spawn() -> Self {
        // Port 0 binds an ephemeral port; memory backend keeps tests hermetic.
        let config = DunningConfig {
            common: CoreConfig { port: 0 },
            service_name: "dunning-service".to_string(),
            log_level: "info".to_string(),
            otlp_endpoint: None,
            repository: RepositoryConfig {
                backend: RepositoryBackend::Memory,
                url: String::new(),
                max_connections: 5,
                min_connections: 1,
            },
            smtp: SmtpConfig {
                host: "smtp.test.local".to_string(),
                port: 587,
                user: "test".to_string(),
                password: "test".to_string(),
                from_email: "test@example.com".to_string(),
                from_name: "Test Service".to_string(),
                enabled: false,
            },
            sms: SmsConfig {
                api_url: "http://sms.test.local".to_string(),
                auth_key: "test-key".to_string(),
                sender_id: "TEST".to_string(),
                enabled: false,
            },
            reminder: ReminderPolicy::default(),
        };

        let app = Application::build(config)
            .await
            .expect("Failed to build test application");
        let port = app.port();

        tokio::spawn(async move {
            app.run_until_stopped().await.ok();
        });

        let client = reqwest::Client::new();
        let health_url = format!("http://127.0.0.1:{}/health", port);
        for _ in 0..50 {
            if client.get(&health_url).send().await.is_ok() {
                break;
            }
            tokio::time::sleep(tokio::time::Duration::from_millis(50)).await;
        }

        TestApp {
            address: format!("http://127.0.0.1:{}", port),
            port,
        }
    }
}
