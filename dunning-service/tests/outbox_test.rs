//! Outbox delivery tests: retry backoff, dead-lettering, resumption, and
//! partial channel failures.

mod common;

use chrono::Duration;
use common::{
    at, date, dispatch_request, engine_with_sender, run_request, seed_dispatched_invoice,
    upsert_invoice, StubSender,
};
use dunning_service::models::{ContactChannel, OutboxStatus};
use dunning_service::services::providers::SendOutcome;
use std::sync::Arc;

#[tokio::test]
async fn transient_failure_backs_off_and_stays_pending() {
    let sender = Arc::new(StubSender::with_script(vec![
        StubSender::transient_failure(),
    ]));
    let engine = engine_with_sender(sender.clone());
    let now = at(2026, 2, 10, 12);

    seed_dispatched_invoice(&engine, "inv-1", date(2026, 2, 10), now).await;

    let response = engine
        .run_once(run_request(now))
        .await
        .expect("Failed to run");
    // One failed try, retry scheduled in the future: the run stays open.
    assert_eq!(response.run.status, "processing");
    assert_eq!(response.run.sent_count, 0);
    assert_eq!(response.run.failed_count, 1);
    assert_eq!(sender.calls().len(), 1);

    let outbox = engine
        .store()
        .list_outbox(response.run.run_id)
        .await
        .expect("Failed to list outbox");
    assert_eq!(outbox.len(), 1);
    assert_eq!(outbox[0].status_enum(), OutboxStatus::Pending);
    assert_eq!(outbox[0].tries, 1);
    assert_eq!(outbox[0].available_at, now + Duration::seconds(15));

    // The invoice ledger is untouched while retries are in flight.
    let invoice = engine
        .get_invoice("inv-1", now)
        .await
        .expect("Failed to read invoice");
    assert_eq!(invoice.reminder_count, 0);
}

#[tokio::test]
async fn retry_schedule_doubles_until_dead_letter() {
    let sender = Arc::new(StubSender::with_script(vec![
        StubSender::transient_failure(),
        StubSender::transient_failure(),
        StubSender::transient_failure(),
        StubSender::transient_failure(),
        StubSender::transient_failure(),
    ]));
    let engine = engine_with_sender(sender.clone());
    let mut now = at(2026, 2, 10, 12);

    seed_dispatched_invoice(&engine, "inv-1", date(2026, 2, 10), now).await;

    let response = engine
        .run_once(run_request(now))
        .await
        .expect("Failed to run");
    let run_id = response.run.run_id;

    // Drive the retries by advancing past each back-off window. The delays
    // double from the base: 15s, 30s, 60s, 120s, then the budget is gone.
    let mut delays_seen = Vec::new();
    for _ in 0..4 {
        let outbox = engine
            .store()
            .list_outbox(run_id)
            .await
            .expect("Failed to list outbox");
        assert_eq!(outbox[0].status_enum(), OutboxStatus::Pending);
        delays_seen.push(outbox[0].available_at - outbox[0].updated_utc);

        now = outbox[0].available_at + Duration::seconds(1);
        engine
            .send_run(run_id, None, now)
            .await
            .expect("Failed to send");
    }

    assert_eq!(
        delays_seen,
        vec![
            Duration::seconds(15),
            Duration::seconds(30),
            Duration::seconds(60),
            Duration::seconds(120),
        ]
    );

    let outbox = engine
        .store()
        .list_outbox(run_id)
        .await
        .expect("Failed to list outbox");
    assert_eq!(outbox[0].status_enum(), OutboxStatus::DeadLetter);
    assert_eq!(outbox[0].tries, 5);
    assert_eq!(outbox[0].error_code.as_deref(), Some("send_failed"));
    assert_eq!(sender.calls().len(), 5);

    let run = engine.get_run(run_id).await.expect("Failed to read run");
    assert_eq!(run.run.status, "completed");
    assert_eq!(run.run.sent_count, 0);
    assert_eq!(run.run.failed_count, 1);
    assert_eq!(run.attempts[0].status, "failed");

    // A dead-lettered reminder never counts against the invoice.
    let invoice = engine
        .get_invoice("inv-1", now)
        .await
        .expect("Failed to read invoice");
    assert_eq!(invoice.reminder_count, 0);
}

#[tokio::test]
async fn missing_recipient_dead_letters_without_calling_the_provider() {
    let sender = Arc::new(StubSender::always_ok());
    let engine = engine_with_sender(sender.clone());
    let now = at(2026, 2, 10, 12);

    // SMS-only dispatch with no SMS recipient registered and an email-only
    // contact on the invoice.
    engine
        .upsert_invoices(vec![upsert_invoice("inv-1", date(2026, 2, 10))], now)
        .await
        .expect("Failed to upsert");
    let mut request = dispatch_request("inv-1", vec![ContactChannel::Sms]);
    request.recipients.clear();
    engine
        .dispatch(request, now)
        .await
        .expect("Failed to dispatch");

    let response = engine
        .run_once(run_request(now))
        .await
        .expect("Failed to run");
    assert_eq!(response.run.status, "completed");
    assert_eq!(response.run.eligible_count, 1);
    assert_eq!(response.run.sent_count, 0);
    assert_eq!(response.run.failed_count, 1);
    assert_eq!(response.attempts[0].status, "failed");
    assert!(sender.calls().is_empty(), "Provider must not be called");

    let outbox = engine
        .store()
        .list_outbox(response.run.run_id)
        .await
        .expect("Failed to list outbox");
    assert_eq!(outbox[0].status_enum(), OutboxStatus::DeadLetter);
    assert_eq!(outbox[0].error_code.as_deref(), Some("recipient_missing"));
}

#[tokio::test]
async fn permanent_failure_skips_the_retry_budget() {
    let sender = Arc::new(StubSender::with_script(vec![SendOutcome::Failed {
        error_code: "invalid_recipient".to_string(),
        error_message: "rejected address".to_string(),
        permanent: true,
    }]));
    let engine = engine_with_sender(sender.clone());
    let now = at(2026, 2, 10, 12);

    seed_dispatched_invoice(&engine, "inv-1", date(2026, 2, 10), now).await;

    let response = engine
        .run_once(run_request(now))
        .await
        .expect("Failed to run");
    assert_eq!(response.run.status, "completed");
    assert_eq!(response.run.failed_count, 1);
    assert_eq!(sender.calls().len(), 1);

    let outbox = engine
        .store()
        .list_outbox(response.run.run_id)
        .await
        .expect("Failed to list outbox");
    assert_eq!(outbox[0].status_enum(), OutboxStatus::DeadLetter);
    assert_eq!(outbox[0].tries, 1);
}

#[tokio::test]
async fn mixed_sent_and_dead_letter_does_not_count_the_reminder() {
    // Email delivers, SMS is rejected permanently: the cycle did not reach
    // the creator on every channel, so the attempt fails and the invoice
    // keeps its full reminder budget.
    let sender = Arc::new(StubSender::with_script(vec![
        SendOutcome::Sent {
            provider_message_id: Some("email-1".to_string()),
        },
        SendOutcome::Failed {
            error_code: "invalid_recipient".to_string(),
            error_message: "rejected number".to_string(),
            permanent: true,
        },
    ]));
    let engine = engine_with_sender(sender.clone());
    let now = at(2026, 2, 10, 12);

    engine
        .upsert_invoices(vec![upsert_invoice("inv-1", date(2026, 2, 10))], now)
        .await
        .expect("Failed to upsert");
    engine
        .dispatch(
            dispatch_request("inv-1", vec![ContactChannel::Email, ContactChannel::Sms]),
            now,
        )
        .await
        .expect("Failed to dispatch");

    let response = engine
        .run_once(run_request(now))
        .await
        .expect("Failed to run");
    assert_eq!(response.run.status, "completed");
    assert_eq!(response.run.sent_count, 0);
    assert_eq!(response.run.failed_count, 1);
    assert_eq!(response.attempts[0].status, "failed");

    let outbox = engine
        .store()
        .list_outbox(response.run.run_id)
        .await
        .expect("Failed to list outbox");
    let statuses: Vec<_> = outbox.iter().map(|m| m.status_enum()).collect();
    assert!(statuses.contains(&OutboxStatus::Sent));
    assert!(statuses.contains(&OutboxStatus::DeadLetter));

    let invoice = engine
        .get_invoice("inv-1", now)
        .await
        .expect("Failed to read invoice");
    assert_eq!(invoice.reminder_count, 0);
    assert_eq!(invoice.last_reminder_at, None);
}

#[tokio::test]
async fn resuming_a_settled_run_changes_nothing() {
    let sender = Arc::new(StubSender::always_ok());
    let engine = engine_with_sender(sender.clone());
    let now = at(2026, 2, 10, 12);

    seed_dispatched_invoice(&engine, "inv-1", date(2026, 2, 10), now).await;

    let first = engine
        .run_once(run_request(now))
        .await
        .expect("Failed to run");
    assert_eq!(first.run.status, "completed");

    let resumed = engine
        .send_run(first.run.run_id, None, now + Duration::hours(1))
        .await
        .expect("Failed to resume");
    assert_eq!(resumed.run.sent_count, 1);
    assert_eq!(resumed.run.failed_count, 0);
    assert_eq!(sender.calls().len(), 1, "No additional sends");

    let invoice = engine
        .get_invoice("inv-1", now)
        .await
        .expect("Failed to read invoice");
    assert_eq!(invoice.reminder_count, 1, "No double counting");
}

#[tokio::test]
async fn partial_channel_failure_holds_the_attempt_open() {
    // Email succeeds, SMS fails once, then succeeds on retry.
    let sender = Arc::new(StubSender::with_script(vec![
        SendOutcome::Sent {
            provider_message_id: Some("email-1".to_string()),
        },
        StubSender::transient_failure(),
    ]));
    let engine = engine_with_sender(sender.clone());
    let now = at(2026, 2, 10, 12);

    engine
        .upsert_invoices(vec![upsert_invoice("inv-1", date(2026, 2, 10))], now)
        .await
        .expect("Failed to upsert");
    engine
        .dispatch(
            dispatch_request("inv-1", vec![ContactChannel::Email, ContactChannel::Sms]),
            now,
        )
        .await
        .expect("Failed to dispatch");

    let response = engine
        .run_once(run_request(now))
        .await
        .expect("Failed to run");
    assert_eq!(response.run.status, "processing");
    assert_eq!(response.run.sent_count, 0, "Attempt not settled yet");
    assert_eq!(response.attempts[0].status, "planned");

    // The invoice is untouched until every channel settles.
    let invoice = engine
        .get_invoice("inv-1", now)
        .await
        .expect("Failed to read invoice");
    assert_eq!(invoice.reminder_count, 0);

    // Retry window passes; the scripted sender now succeeds.
    let later = now + Duration::seconds(16);
    let settled = engine
        .send_run(response.run.run_id, None, later)
        .await
        .expect("Failed to send");
    assert_eq!(settled.run.status, "completed");
    assert_eq!(settled.run.sent_count, 1);
    assert_eq!(settled.run.failed_count, 0);
    assert_eq!(settled.attempts[0].status, "sent");

    let invoice = engine
        .get_invoice("inv-1", later)
        .await
        .expect("Failed to read invoice");
    assert_eq!(invoice.reminder_count, 1);
}

#[tokio::test]
async fn send_budget_limits_messages_per_call() {
    let sender = Arc::new(StubSender::always_ok());
    let engine = engine_with_sender(sender.clone());
    let now = at(2026, 2, 10, 12);

    seed_dispatched_invoice(&engine, "inv-1", date(2026, 2, 9), now).await;
    seed_dispatched_invoice(&engine, "inv-2", date(2026, 2, 10), now).await;

    let planned = engine
        .evaluate_run(run_request(now))
        .await
        .expect("Failed to evaluate");
    assert_eq!(planned.run.eligible_count, 2);

    let partial = engine
        .send_run(planned.run.run_id, Some(1), now)
        .await
        .expect("Failed to send");
    assert_eq!(partial.run.sent_count, 1);
    assert_eq!(partial.run.status, "processing");
    assert_eq!(sender.calls().len(), 1);

    let complete = engine
        .send_run(planned.run.run_id, None, now)
        .await
        .expect("Failed to send");
    assert_eq!(complete.run.sent_count, 2);
    assert_eq!(complete.run.status, "completed");
    assert_eq!(sender.calls().len(), 2);
}
