//! Outbox delivery transitions.
//!
//! Per-message state machine: `pending -> processing -> {sent |
//! pending(retry) | dead_letter}`. The engine claims rows, calls the
//! provider outside any store lock, and routes the outcome through
//! [`apply_send_outcome`]. Permanent failures skip the retry budget.

use crate::config::ReminderPolicy;
use crate::models::{OutboxMessage, OutboxStatus};
use crate::services::metrics;
use crate::services::providers::SendOutcome;
use chrono::{DateTime, Duration, Utc};

/// Backoff before the next try: `base * 2^(tries-1)`, capped. `tries` is the
/// post-increment try count, so the first retry waits one base interval.
pub fn retry_delay(policy: &ReminderPolicy, tries: i32) -> Duration {
    let exponent = (tries - 1).clamp(0, 30) as u32;
    let secs = policy
        .retry_base_secs
        .saturating_mul(1i64 << exponent)
        .min(policy.retry_cap_secs);
    Duration::seconds(secs)
}

/// Fold a provider outcome into the claimed message. The message leaves
/// `processing` for exactly one of: `sent`, `pending` (with a later
/// `available_at`), or `dead_letter`.
pub fn apply_send_outcome(
    message: &mut OutboxMessage,
    outcome: &SendOutcome,
    now: DateTime<Utc>,
    policy: &ReminderPolicy,
) {
    message.tries += 1;
    message.updated_utc = now;

    match outcome {
        SendOutcome::Sent {
            provider_message_id,
        } => {
            message.status = OutboxStatus::Sent.as_str().to_string();
            message.provider_message_id = provider_message_id.clone();
            message.error_code = None;
            message.error_message = None;
        }
        SendOutcome::DryRun => {
            message.status = OutboxStatus::Sent.as_str().to_string();
            message.error_code = None;
            message.error_message = None;
        }
        SendOutcome::Failed {
            error_code,
            error_message,
            permanent,
        } => {
            message.error_code = Some(error_code.clone());
            message.error_message = Some(error_message.clone());

            if *permanent || message.tries >= policy.max_retries {
                message.status = OutboxStatus::DeadLetter.as_str().to_string();
                metrics::record_dead_letter(&message.channel, error_code);
            } else {
                message.status = OutboxStatus::Pending.as_str().to_string();
                message.available_at = now + retry_delay(policy, message.tries);
            }
        }
    }

    metrics::record_outbox_transition(&message.channel, &message.status);
}
