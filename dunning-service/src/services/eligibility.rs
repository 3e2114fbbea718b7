//! Reminder eligibility evaluator.
//!
//! A pure function of (invoice, dispatch-on-file, now). The rules run in a
//! fixed order and the first match wins; tests pin the ordering.

use crate::config::ReminderPolicy;
use crate::models::{EligibilityReason, Invoice};
use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;

/// Verdict for a single invoice at a given instant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Evaluation {
    pub eligible: bool,
    pub reason: EligibilityReason,
    pub next_eligible_at: Option<DateTime<Utc>>,
}

impl Evaluation {
    fn ineligible(reason: EligibilityReason, next_eligible_at: Option<DateTime<Utc>>) -> Self {
        Self {
            eligible: false,
            reason,
            next_eligible_at,
        }
    }
}

/// Evaluate whether an invoice should receive a reminder at `now`.
pub fn evaluate(
    invoice: &Invoice,
    dispatched: bool,
    now: DateTime<Utc>,
    policy: &ReminderPolicy,
) -> Evaluation {
    if !dispatched {
        return Evaluation::ineligible(EligibilityReason::NotDispatched, None);
    }

    if invoice.opt_out {
        return Evaluation::ineligible(EligibilityReason::OptOut, None);
    }

    if invoice.balance_due <= Decimal::ZERO {
        return Evaluation::ineligible(EligibilityReason::Paid, None);
    }

    if invoice.reminder_count >= policy.max_attempts {
        return Evaluation::ineligible(EligibilityReason::MaxRemindersReached, None);
    }

    let due_instant = invoice.due_instant();
    if now < due_instant {
        return Evaluation::ineligible(EligibilityReason::NotDueYet, Some(due_instant));
    }

    if let Some(last_reminder_at) = invoice.last_reminder_at {
        let cooldown_until = last_reminder_at + Duration::hours(policy.cooldown_hours);
        if now < cooldown_until {
            return Evaluation::ineligible(EligibilityReason::CooldownActive, Some(cooldown_until));
        }
    }

    Evaluation {
        eligible: true,
        reason: EligibilityReason::Eligible,
        next_eligible_at: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ContactChannel, InvoiceStatus};
    use chrono::{NaiveDate, TimeZone};
    use rust_decimal::Decimal;

    fn invoice(due: NaiveDate) -> Invoice {
        let created = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        Invoice {
            invoice_id: "inv-1".to_string(),
            creator_id: "creator-1".to_string(),
            creator_name: "Ada".to_string(),
            contact_channel: ContactChannel::Email.as_str().to_string(),
            contact_target: Some("ada@example.com".to_string()),
            currency: "USD".to_string(),
            amount_due: Decimal::new(10000, 2),
            amount_paid: Decimal::ZERO,
            balance_due: Decimal::new(10000, 2),
            issued_at: None,
            due_date: due,
            creator_timezone: None,
            opt_out: false,
            reminder_count: 0,
            last_reminder_at: None,
            last_payment_at: None,
            status: InvoiceStatus::Open.as_str().to_string(),
            created_utc: created,
            updated_utc: created,
        }
    }

    fn policy() -> ReminderPolicy {
        ReminderPolicy::default()
    }

    #[test]
    fn undispatched_invoice_is_never_eligible() {
        let inv = invoice(NaiveDate::from_ymd_opt(2026, 2, 10).unwrap());
        let now = Utc.with_ymd_and_hms(2026, 3, 1, 0, 0, 0).unwrap();
        let verdict = evaluate(&inv, false, now, &policy());
        assert!(!verdict.eligible);
        assert_eq!(verdict.reason, EligibilityReason::NotDispatched);
    }

    #[test]
    fn opt_out_wins_over_everything_but_dispatch() {
        let mut inv = invoice(NaiveDate::from_ymd_opt(2026, 2, 10).unwrap());
        inv.opt_out = true;
        inv.balance_due = Decimal::ZERO;
        inv.reminder_count = 99;
        let now = Utc.with_ymd_and_hms(2026, 3, 1, 0, 0, 0).unwrap();
        let verdict = evaluate(&inv, true, now, &policy());
        assert_eq!(verdict.reason, EligibilityReason::OptOut);
    }

    #[test]
    fn paid_wins_over_max_reminders() {
        let mut inv = invoice(NaiveDate::from_ymd_opt(2026, 2, 10).unwrap());
        inv.balance_due = Decimal::ZERO;
        inv.reminder_count = 6;
        let now = Utc.with_ymd_and_hms(2026, 3, 1, 0, 0, 0).unwrap();
        let verdict = evaluate(&inv, true, now, &policy());
        assert_eq!(verdict.reason, EligibilityReason::Paid);
    }

    #[test]
    fn exhausted_reminders_report_max_reached_at_any_instant() {
        let mut inv = invoice(NaiveDate::from_ymd_opt(2026, 2, 10).unwrap());
        inv.reminder_count = 6;
        // Not yet due, but the escalation rule fires first.
        let now = Utc.with_ymd_and_hms(2026, 1, 2, 0, 0, 0).unwrap();
        let verdict = evaluate(&inv, true, now, &policy());
        assert_eq!(verdict.reason, EligibilityReason::MaxRemindersReached);
    }

    #[test]
    fn not_due_yet_reports_the_due_instant() {
        let inv = invoice(NaiveDate::from_ymd_opt(2026, 2, 10).unwrap());
        let now = Utc.with_ymd_and_hms(2026, 2, 9, 12, 0, 0).unwrap();
        let verdict = evaluate(&inv, true, now, &policy());
        assert_eq!(verdict.reason, EligibilityReason::NotDueYet);
        assert_eq!(
            verdict.next_eligible_at,
            Some(Utc.with_ymd_and_hms(2026, 2, 10, 0, 0, 0).unwrap())
        );
    }

    #[test]
    fn due_instant_follows_creator_timezone() {
        let mut inv = invoice(NaiveDate::from_ymd_opt(2026, 2, 10).unwrap());
        inv.creator_timezone = Some("America/New_York".to_string());
        // Midnight Feb 10 in New York is 05:00 UTC; 02:00 UTC is still Feb 9
        // for the creator.
        let now = Utc.with_ymd_and_hms(2026, 2, 10, 2, 0, 0).unwrap();
        let verdict = evaluate(&inv, true, now, &policy());
        assert_eq!(verdict.reason, EligibilityReason::NotDueYet);
        assert_eq!(
            verdict.next_eligible_at,
            Some(Utc.with_ymd_and_hms(2026, 2, 10, 5, 0, 0).unwrap())
        );

        let later = Utc.with_ymd_and_hms(2026, 2, 10, 5, 0, 0).unwrap();
        assert!(evaluate(&inv, true, later, &policy()).eligible);
    }

    #[test]
    fn unresolvable_timezone_falls_back_to_utc() {
        let mut inv = invoice(NaiveDate::from_ymd_opt(2026, 2, 10).unwrap());
        inv.creator_timezone = Some("Mars/Olympus_Mons".to_string());
        let now = Utc.with_ymd_and_hms(2026, 2, 10, 0, 0, 0).unwrap();
        assert!(evaluate(&inv, true, now, &policy()).eligible);
    }

    #[test]
    fn cooldown_blocks_until_48_hours_after_last_reminder() {
        let mut inv = invoice(NaiveDate::from_ymd_opt(2026, 2, 10).unwrap());
        let last = Utc.with_ymd_and_hms(2026, 2, 10, 0, 0, 0).unwrap();
        inv.last_reminder_at = Some(last);

        let blocked = Utc.with_ymd_and_hms(2026, 2, 11, 23, 59, 59).unwrap();
        let verdict = evaluate(&inv, true, blocked, &policy());
        assert_eq!(verdict.reason, EligibilityReason::CooldownActive);
        assert_eq!(verdict.next_eligible_at, Some(last + Duration::hours(48)));

        let open = Utc.with_ymd_and_hms(2026, 2, 12, 0, 0, 0).unwrap();
        assert!(evaluate(&inv, true, open, &policy()).eligible);
    }

    #[test]
    fn overdue_unpaid_dispatched_invoice_is_eligible() {
        let inv = invoice(NaiveDate::from_ymd_opt(2026, 2, 10).unwrap());
        let now = Utc.with_ymd_and_hms(2026, 2, 10, 0, 0, 0).unwrap();
        let verdict = evaluate(&inv, true, now, &policy());
        assert!(verdict.eligible);
        assert_eq!(verdict.reason, EligibilityReason::Eligible);
        assert_eq!(verdict.next_eligible_at, None);
    }
}
