//! Reminder run and per-invoice attempt models.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;
use validator::Validate;

/// Run mode: synchronous plan-and-drain versus asynchronous
/// evaluate-then-send.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    RunOnce,
    Evaluate,
}

impl RunMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunMode::RunOnce => "run_once",
            RunMode::Evaluate => "evaluate",
        }
    }

    pub fn from_string(s: &str) -> Self {
        match s {
            "evaluate" => RunMode::Evaluate,
            _ => RunMode::RunOnce,
        }
    }
}

/// Run status. A run never claims `completed` while any outbox row is
/// non-terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Planned,
    Processing,
    Completed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Planned => "planned",
            RunStatus::Processing => "processing",
            RunStatus::Completed => "completed",
        }
    }

    pub fn from_string(s: &str) -> Self {
        match s {
            "processing" => RunStatus::Processing,
            "completed" => RunStatus::Completed,
            _ => RunStatus::Planned,
        }
    }
}

/// Why an invoice was or was not selected for a reminder. The evaluator
/// checks these in a fixed order; the first match wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EligibilityReason {
    Eligible,
    NotDispatched,
    OptOut,
    Paid,
    MaxRemindersReached,
    NotDueYet,
    CooldownActive,
    LimitReached,
}

impl EligibilityReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            EligibilityReason::Eligible => "eligible",
            EligibilityReason::NotDispatched => "not_dispatched",
            EligibilityReason::OptOut => "opt_out",
            EligibilityReason::Paid => "paid",
            EligibilityReason::MaxRemindersReached => "max_reminders_reached",
            EligibilityReason::NotDueYet => "not_due_yet",
            EligibilityReason::CooldownActive => "cooldown_active",
            EligibilityReason::LimitReached => "limit_reached",
        }
    }

    pub fn from_string(s: &str) -> Self {
        match s {
            "not_dispatched" => EligibilityReason::NotDispatched,
            "opt_out" => EligibilityReason::OptOut,
            "paid" => EligibilityReason::Paid,
            "max_reminders_reached" => EligibilityReason::MaxRemindersReached,
            "not_due_yet" => EligibilityReason::NotDueYet,
            "cooldown_active" => EligibilityReason::CooldownActive,
            "limit_reached" => EligibilityReason::LimitReached,
            _ => EligibilityReason::Eligible,
        }
    }
}

/// Outcome status of a single attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptStatus {
    Planned,
    Sent,
    Failed,
    Skipped,
}

impl AttemptStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttemptStatus::Planned => "planned",
            AttemptStatus::Sent => "sent",
            AttemptStatus::Failed => "failed",
            AttemptStatus::Skipped => "skipped",
        }
    }

    pub fn from_string(s: &str) -> Self {
        match s {
            "sent" => AttemptStatus::Sent,
            "failed" => AttemptStatus::Failed,
            "skipped" => AttemptStatus::Skipped,
            _ => AttemptStatus::Planned,
        }
    }
}

/// One planning/execution episode over the whole ledger.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ReminderRun {
    pub run_id: Uuid,
    pub mode: String,
    pub dry_run: bool,
    pub triggered_by: Option<String>,
    pub request_hash: String,
    pub idempotency_key: Option<String>,
    pub run_at: DateTime<Utc>,
    pub status: String,
    pub evaluated_count: i32,
    pub eligible_count: i32,
    pub sent_count: i32,
    pub failed_count: i32,
    pub skipped_count: i32,
    pub escalated_count: i32,
    pub created_utc: DateTime<Utc>,
    pub completed_utc: Option<DateTime<Utc>>,
}

/// One row per invoice evaluated in a run. Created once at plan time and
/// mutated as the outbox jobs for it reach terminal states.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ReminderAttempt {
    pub attempt_id: Uuid,
    pub run_id: Uuid,
    pub invoice_id: String,
    pub eligible: bool,
    pub reason: String,
    pub next_eligible_at: Option<DateTime<Utc>>,
    pub channels_planned: i32,
    pub status: String,
    pub error_message: Option<String>,
    pub provider_message_id: Option<String>,
    pub channel_outcomes: serde_json::Value,
    pub outcome_applied: bool,
    pub created_utc: DateTime<Utc>,
    pub completed_utc: Option<DateTime<Utc>>,
}

/// Request to plan/execute a reminder run. The serialized form of this body
/// (minus the idempotency key) is what the idempotency hash covers.
#[derive(Debug, Clone, Serialize, Deserialize, Validate, Default)]
pub struct StartRunRequest {
    #[serde(default)]
    pub dry_run: bool,
    pub now: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
    pub triggered_by: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,
}

/// Response assembled from Run/Attempt state; also the replayed body for
/// idempotent retries, so it must serialize deterministically.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunResponse {
    pub run: ReminderRun,
    pub attempts: Vec<ReminderAttempt>,
}
