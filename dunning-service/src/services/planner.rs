//! Run planner: snapshots the ledger, evaluates every invoice, and lays out
//! the per-channel send jobs for the eligible ones. The returned plan is the
//! single source of truth the engine persists as Run/Attempt/Outbox rows.

use crate::config::ReminderPolicy;
use crate::models::{ContactChannel, Dispatch, EligibilityReason, Invoice};
use crate::services::eligibility::{self, Evaluation};
use chrono::{DateTime, Utc};
use serde_json::json;

/// One send job for one (invoice, channel) pair.
#[derive(Debug, Clone)]
pub struct PlannedJob {
    pub channel: ContactChannel,
    pub recipient: Option<String>,
    pub masked_recipient: Option<String>,
    pub payload: serde_json::Value,
}

/// Evaluation result plus the jobs to enqueue when eligible.
#[derive(Debug, Clone)]
pub struct PlannedAttempt {
    pub invoice_id: String,
    pub verdict: Evaluation,
    pub jobs: Vec<PlannedJob>,
}

/// Whole-ledger plan for one run.
#[derive(Debug, Clone, Default)]
pub struct RunPlan {
    pub evaluated: i32,
    pub eligible: i32,
    pub skipped: i32,
    pub escalated: i32,
    pub attempts: Vec<PlannedAttempt>,
}

/// Plan a run over a ledger snapshot. `invoices` must already be ordered by
/// (due_date, invoice_id); eligible invoices beyond `limit` are demoted to
/// ineligible with reason `limit_reached`.
pub fn plan(
    invoices: &[(Invoice, Option<Dispatch>)],
    now: DateTime<Utc>,
    limit: Option<usize>,
    policy: &ReminderPolicy,
) -> RunPlan {
    let mut run_plan = RunPlan::default();

    for (invoice, dispatch) in invoices {
        run_plan.evaluated += 1;
        let mut verdict = eligibility::evaluate(invoice, dispatch.is_some(), now, policy);

        if verdict.eligible {
            if let Some(limit) = limit {
                if run_plan.eligible as usize >= limit {
                    verdict = Evaluation {
                        eligible: false,
                        reason: EligibilityReason::LimitReached,
                        next_eligible_at: None,
                    };
                }
            }
        }

        let jobs = if verdict.eligible {
            run_plan.eligible += 1;
            match dispatch {
                Some(dispatch) => build_jobs(invoice, dispatch),
                None => Vec::new(),
            }
        } else {
            run_plan.skipped += 1;
            if verdict.reason == EligibilityReason::MaxRemindersReached {
                run_plan.escalated += 1;
            }
            Vec::new()
        };

        run_plan.attempts.push(PlannedAttempt {
            invoice_id: invoice.invoice_id.clone(),
            verdict,
            jobs,
        });
    }

    run_plan
}

fn build_jobs(invoice: &Invoice, dispatch: &Dispatch) -> Vec<PlannedJob> {
    let payload = json!({
        "invoice_id": invoice.invoice_id,
        "creator_id": invoice.creator_id,
        "creator_name": invoice.creator_name,
        "currency": invoice.currency,
        "amount_due": invoice.amount_due,
        "balance_due": invoice.balance_due,
        "due_date": invoice.due_date,
    });

    dispatch
        .channel_list()
        .into_iter()
        .map(|channel| {
            let recipient = resolve_recipient(invoice, dispatch, channel);
            PlannedJob {
                channel,
                masked_recipient: recipient.as_deref().map(|r| mask_recipient(channel, r)),
                recipient,
                payload: payload.clone(),
            }
        })
        .collect()
}

/// Recipient for a channel: dispatch-time registration first, falling back
/// to the invoice's own contact when the channel matches.
fn resolve_recipient(
    invoice: &Invoice,
    dispatch: &Dispatch,
    channel: ContactChannel,
) -> Option<String> {
    dispatch.recipient_for(channel).or_else(|| {
        if invoice.contact_channel == channel.as_str() {
            invoice.contact_target.clone()
        } else {
            None
        }
    })
}

/// Mask a recipient for audit display. Emails keep the first character of
/// the local part and the domain's TLD; phone numbers keep the last four
/// digits.
pub fn mask_recipient(channel: ContactChannel, recipient: &str) -> String {
    match channel {
        ContactChannel::Email => match recipient.split_once('@') {
            Some((local, domain)) => {
                let head = local.chars().next().map(String::from).unwrap_or_default();
                let tld = domain.rsplit_once('.').map(|(_, t)| t).unwrap_or("");
                format!("{}***@***.{}", head, tld)
            }
            None => "***".to_string(),
        },
        ContactChannel::Sms => {
            let digits: Vec<char> = recipient.chars().filter(|c| c.is_ascii_digit()).collect();
            if digits.len() >= 4 {
                let tail: String = digits[digits.len() - 4..].iter().collect();
                format!("***{}", tail)
            } else {
                "***".to_string()
            }
        }
    }
}
