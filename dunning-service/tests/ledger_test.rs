//! Invoice ledger integration tests: upserts, status derivation, dispatch
//! registration, and payment events.

mod common;

use common::{at, date, dispatch_request, engine_with_memory, upsert_invoice};
use dunning_service::models::{ContactChannel, PaymentRequest};
use rust_decimal::Decimal;
use service_core::error::AppError;

fn payment(event_id: &str, invoice_id: &str, amount: Decimal) -> PaymentRequest {
    PaymentRequest {
        event_id: event_id.to_string(),
        invoice_id: invoice_id.to_string(),
        amount,
        paid_at: at(2026, 2, 11, 9),
        source: Some("webhook".to_string()),
    }
}

#[tokio::test]
async fn upsert_derives_status_from_due_date() {
    let engine = engine_with_memory();

    let before_due = at(2026, 2, 9, 12);
    let invoices = engine
        .upsert_invoices(vec![upsert_invoice("inv-1", date(2026, 2, 10))], before_due)
        .await
        .expect("Failed to upsert");
    assert_eq!(invoices[0].status, "open");
    assert_eq!(invoices[0].balance_due, Decimal::new(15000, 2));

    let after_due = at(2026, 2, 10, 12);
    let invoice = engine
        .get_invoice("inv-1", after_due)
        .await
        .expect("Failed to read invoice");
    assert_eq!(invoice.status, "overdue");
}

#[tokio::test]
async fn upsert_is_idempotent_and_preserves_reminder_history() {
    let engine = engine_with_memory();
    let now = at(2026, 2, 9, 12);

    engine
        .upsert_invoices(vec![upsert_invoice("inv-1", date(2026, 2, 10))], now)
        .await
        .expect("Failed to upsert");

    // Simulate delivered reminders, then replay the same upsert.
    let store = engine.store();
    let mut stored = store
        .get_invoice("inv-1")
        .await
        .expect("Failed to read")
        .expect("Missing invoice");
    stored.reminder_count = 2;
    stored.last_reminder_at = Some(now);
    store.put_invoice(&stored).await.expect("Failed to write");

    let replayed = engine
        .upsert_invoices(vec![upsert_invoice("inv-1", date(2026, 2, 10))], now)
        .await
        .expect("Failed to upsert");
    assert_eq!(replayed[0].reminder_count, 2);
    assert_eq!(replayed[0].last_reminder_at, Some(now));
}

#[tokio::test]
async fn upsert_rejects_amount_paid_exceeding_amount_due() {
    let engine = engine_with_memory();
    let now = at(2026, 2, 9, 12);

    let mut input = upsert_invoice("inv-1", date(2026, 2, 10));
    input.amount_paid = Decimal::new(20000, 2);

    let err = engine
        .upsert_invoices(vec![input], now)
        .await
        .expect_err("Overpaid upsert must be rejected");
    assert!(matches!(err, AppError::BadRequest(_)));

    let err = engine
        .get_invoice("inv-1", now)
        .await
        .expect_err("Rejected upsert must not persist");
    assert!(matches!(err, AppError::NotFound(_)));
}

#[tokio::test]
async fn partial_payment_moves_status_and_full_payment_closes() {
    let engine = engine_with_memory();
    let now = at(2026, 2, 9, 12);

    engine
        .upsert_invoices(vec![upsert_invoice("inv-1", date(2026, 2, 10))], now)
        .await
        .expect("Failed to upsert");

    let (invoice, applied) = engine
        .apply_payment(payment("evt-1", "inv-1", Decimal::new(5000, 2)), now)
        .await
        .expect("Failed to apply payment");
    assert!(applied);
    assert_eq!(invoice.status, "partial");
    assert_eq!(invoice.balance_due, Decimal::new(10000, 2));

    let (invoice, applied) = engine
        .apply_payment(payment("evt-2", "inv-1", Decimal::new(10000, 2)), now)
        .await
        .expect("Failed to apply payment");
    assert!(applied);
    assert_eq!(invoice.status, "paid");
    assert_eq!(invoice.balance_due, Decimal::ZERO);
}

#[tokio::test]
async fn duplicate_payment_event_is_not_applied_twice() {
    let engine = engine_with_memory();
    let now = at(2026, 2, 9, 12);

    engine
        .upsert_invoices(vec![upsert_invoice("inv-1", date(2026, 2, 10))], now)
        .await
        .expect("Failed to upsert");

    let (_, applied) = engine
        .apply_payment(payment("evt-1", "inv-1", Decimal::new(5000, 2)), now)
        .await
        .expect("Failed to apply payment");
    assert!(applied);

    let (invoice, applied) = engine
        .apply_payment(payment("evt-1", "inv-1", Decimal::new(5000, 2)), now)
        .await
        .expect("Failed to apply payment");
    assert!(!applied, "Replayed event must be acknowledged, not applied");
    assert_eq!(invoice.amount_paid, Decimal::new(5000, 2));
}

#[tokio::test]
async fn payment_for_unknown_invoice_is_rejected() {
    let engine = engine_with_memory();
    let now = at(2026, 2, 9, 12);

    let err = engine
        .apply_payment(payment("evt-1", "missing", Decimal::new(100, 2)), now)
        .await
        .expect_err("Expected payment to fail");
    assert!(matches!(err, AppError::NotFound(_)));
}

#[tokio::test]
async fn redispatch_returns_the_existing_record() {
    let engine = engine_with_memory();
    let now = at(2026, 2, 9, 12);

    engine
        .upsert_invoices(vec![upsert_invoice("inv-1", date(2026, 2, 10))], now)
        .await
        .expect("Failed to upsert");

    let first = engine
        .dispatch(dispatch_request("inv-1", vec![ContactChannel::Email]), now)
        .await
        .expect("Failed to dispatch");

    // A second dispatch, even with different channels and no key, is
    // acknowledged with the original record instead of creating another.
    let second = engine
        .dispatch(dispatch_request("inv-1", vec![ContactChannel::Sms]), now)
        .await
        .expect("Re-dispatch must succeed");
    assert_eq!(second.dispatch_id, first.dispatch_id);
    assert_eq!(second.channels, vec!["email".to_string()]);
}

#[tokio::test]
async fn dispatch_key_reused_for_another_invoice_conflicts() {
    let engine = engine_with_memory();
    let now = at(2026, 2, 9, 12);

    engine
        .upsert_invoices(
            vec![
                upsert_invoice("inv-1", date(2026, 2, 10)),
                upsert_invoice("inv-2", date(2026, 2, 10)),
            ],
            now,
        )
        .await
        .expect("Failed to upsert");

    let mut request = dispatch_request("inv-1", vec![ContactChannel::Email]);
    request.idempotency_key = Some("disp-key-1".to_string());
    engine.dispatch(request, now).await.expect("Failed to dispatch");

    let mut request = dispatch_request("inv-2", vec![ContactChannel::Email]);
    request.idempotency_key = Some("disp-key-1".to_string());
    let err = engine
        .dispatch(request, now)
        .await
        .expect_err("Key reuse across invoices must conflict");
    assert!(matches!(err, AppError::Conflict(_)));
}

#[tokio::test]
async fn dispatch_replays_through_idempotency_key() {
    let engine = engine_with_memory();
    let now = at(2026, 2, 9, 12);

    engine
        .upsert_invoices(vec![upsert_invoice("inv-1", date(2026, 2, 10))], now)
        .await
        .expect("Failed to upsert");

    let mut request = dispatch_request("inv-1", vec![ContactChannel::Email]);
    request.idempotency_key = Some("disp-key-1".to_string());

    let first = engine
        .dispatch(request.clone(), now)
        .await
        .expect("Failed to dispatch");
    let replay = engine
        .dispatch(request, now)
        .await
        .expect("Replay must succeed");
    assert_eq!(first.dispatch_id, replay.dispatch_id);
}

#[tokio::test]
async fn dispatch_for_unknown_invoice_is_rejected() {
    let engine = engine_with_memory();
    let now = at(2026, 2, 9, 12);

    let err = engine
        .dispatch(dispatch_request("missing", vec![ContactChannel::Email]), now)
        .await
        .expect_err("Expected dispatch to fail");
    assert!(matches!(err, AppError::NotFound(_)));
}
