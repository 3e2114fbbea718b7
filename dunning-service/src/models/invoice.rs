//! Invoice ledger models.

use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use chrono_tz::Tz;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::collections::HashMap;
use uuid::Uuid;
use validator::Validate;

/// Contact channel a reminder can go out on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContactChannel {
    Email,
    Sms,
}

impl ContactChannel {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContactChannel::Email => "email",
            ContactChannel::Sms => "sms",
        }
    }

    pub fn from_string(s: &str) -> Self {
        match s {
            "sms" => ContactChannel::Sms,
            _ => ContactChannel::Email,
        }
    }
}

impl std::fmt::Display for ContactChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Invoice status. Always derivable from the amounts, the reminder count,
/// and the due instant; the stored value is a cache that gets recomputed on
/// every read/write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvoiceStatus {
    Open,
    Partial,
    Overdue,
    Escalated,
    Paid,
}

impl InvoiceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InvoiceStatus::Open => "open",
            InvoiceStatus::Partial => "partial",
            InvoiceStatus::Overdue => "overdue",
            InvoiceStatus::Escalated => "escalated",
            InvoiceStatus::Paid => "paid",
        }
    }

    pub fn from_string(s: &str) -> Self {
        match s {
            "partial" => InvoiceStatus::Partial,
            "overdue" => InvoiceStatus::Overdue,
            "escalated" => InvoiceStatus::Escalated,
            "paid" => InvoiceStatus::Paid,
            _ => InvoiceStatus::Open,
        }
    }
}

/// Invoice ledger row.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Invoice {
    pub invoice_id: String,
    pub creator_id: String,
    pub creator_name: String,
    pub contact_channel: String,
    pub contact_target: Option<String>,
    pub currency: String,
    pub amount_due: Decimal,
    pub amount_paid: Decimal,
    pub balance_due: Decimal,
    pub issued_at: Option<NaiveDate>,
    pub due_date: NaiveDate,
    pub creator_timezone: Option<String>,
    pub opt_out: bool,
    pub reminder_count: i32,
    pub last_reminder_at: Option<DateTime<Utc>>,
    pub last_payment_at: Option<DateTime<Utc>>,
    pub status: String,
    pub created_utc: DateTime<Utc>,
    pub updated_utc: DateTime<Utc>,
}

impl Invoice {
    /// The instant this invoice becomes due: midnight on `due_date` in the
    /// creator's timezone, converted to UTC. Falls back to UTC when the
    /// timezone is unset or unresolvable, so "overdue" follows the creator's
    /// calendar rather than the server clock.
    pub fn due_instant(&self) -> DateTime<Utc> {
        // Midnight always exists for a calendar date.
        let midnight = self.due_date.and_hms_opt(0, 0, 0).unwrap_or_default();

        let tz: Option<Tz> = self
            .creator_timezone
            .as_deref()
            .and_then(|name| name.parse().ok());

        match tz {
            Some(tz) => tz
                .from_local_datetime(&midnight)
                .earliest()
                .map(|dt| dt.with_timezone(&Utc))
                .unwrap_or_else(|| Utc.from_utc_datetime(&midnight)),
            None => Utc.from_utc_datetime(&midnight),
        }
    }

    /// Recompute the derived fields: `balance_due` and the cached status.
    /// Order of the status rules is significant and matches the eligibility
    /// rules: paid, escalated, overdue, partial, open.
    pub fn recompute(&mut self, now: DateTime<Utc>, max_attempts: i32) {
        self.balance_due = (self.amount_due - self.amount_paid).max(Decimal::ZERO);

        let status = if self.balance_due <= Decimal::ZERO {
            InvoiceStatus::Paid
        } else if self.reminder_count >= max_attempts {
            InvoiceStatus::Escalated
        } else if now >= self.due_instant() {
            InvoiceStatus::Overdue
        } else if self.amount_paid > Decimal::ZERO {
            InvoiceStatus::Partial
        } else {
            InvoiceStatus::Open
        };
        self.status = status.as_str().to_string();
        self.updated_utc = now;
    }
}

/// Input for creating or replacing an invoice. Upserts are idempotent per
/// `invoice_id`: an upsert on an existing id replaces the mutable fields.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct UpsertInvoice {
    #[validate(length(min = 1, max = 128))]
    pub invoice_id: String,
    #[validate(length(min = 1, max = 128))]
    pub creator_id: String,
    #[validate(length(min = 1, max = 256))]
    pub creator_name: String,
    pub contact_channel: ContactChannel,
    pub contact_target: Option<String>,
    #[validate(length(min = 3, max = 3))]
    pub currency: String,
    pub amount_due: Decimal,
    #[serde(default)]
    pub amount_paid: Decimal,
    pub issued_at: Option<NaiveDate>,
    pub due_date: NaiveDate,
    pub creator_timezone: Option<String>,
    #[serde(default)]
    pub opt_out: bool,
}

/// The one-time association of contact channels/recipients with an invoice.
/// No reminder can fire until this record exists.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Dispatch {
    pub dispatch_id: Uuid,
    pub invoice_id: String,
    pub channels: Vec<String>,
    pub recipients: serde_json::Value,
    pub idempotency_key: Option<String>,
    pub created_utc: DateTime<Utc>,
}

impl Dispatch {
    pub fn channel_list(&self) -> Vec<ContactChannel> {
        self.channels
            .iter()
            .map(|c| ContactChannel::from_string(c))
            .collect()
    }

    /// Recipient registered for a channel at dispatch time, if any.
    pub fn recipient_for(&self, channel: ContactChannel) -> Option<String> {
        self.recipients
            .get(channel.as_str())
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
    }
}

/// Input for recording a dispatch.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct DispatchRequest {
    #[validate(length(min = 1, max = 128))]
    pub invoice_id: String,
    #[validate(length(min = 1))]
    pub channels: Vec<ContactChannel>,
    #[serde(default)]
    pub recipients: HashMap<String, String>,
    pub idempotency_key: Option<String>,
}

/// Append-only payment event, deduplicated by the caller-supplied event id.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct PaymentEvent {
    pub event_id: String,
    pub invoice_id: String,
    pub amount: Decimal,
    pub paid_at: DateTime<Utc>,
    pub source: Option<String>,
    pub created_utc: DateTime<Utc>,
}

/// Input for applying a payment.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct PaymentRequest {
    #[validate(length(min = 1, max = 128))]
    pub event_id: String,
    #[validate(length(min = 1, max = 128))]
    pub invoice_id: String,
    pub amount: Decimal,
    pub paid_at: DateTime<Utc>,
    pub source: Option<String>,
}
