//! Metrics module for dunning-service.
//! Prometheus metrics for ledger, run, and outbox activity.

use once_cell::sync::Lazy;
use prometheus::{
    histogram_opts, opts, register_histogram_vec, register_int_counter_vec, Encoder, HistogramVec,
    IntCounterVec, TextEncoder,
};
use std::sync::OnceLock;

/// Database query duration histogram
pub static DB_QUERY_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        histogram_opts!(
            "dunning_db_query_duration_seconds",
            "Database query duration"
        ),
        &["operation"]
    )
    .expect("Failed to register DB_QUERY_DURATION")
});

/// Invoice ledger operations counter
pub static INVOICE_OPERATIONS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Payment applications counter
pub static PAYMENTS_APPLIED_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Reminder runs counter
pub static REMINDER_RUNS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Outbox message transitions counter
pub static OUTBOX_MESSAGES_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Dead-lettered messages counter
pub static DEAD_LETTERS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Error counter for alerting
pub static ERRORS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Initialize all metrics. Call once at startup.
pub fn init_metrics() {
    INVOICE_OPERATIONS_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!(
                "dunning_invoice_operations_total",
                "Total invoice ledger operations by type"
            ),
            &["operation"]
        )
        .expect("Failed to register INVOICE_OPERATIONS_TOTAL")
    });

    PAYMENTS_APPLIED_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!(
                "dunning_payments_applied_total",
                "Total payment events by outcome (applied or duplicate)"
            ),
            &["result"]
        )
        .expect("Failed to register PAYMENTS_APPLIED_TOTAL")
    });

    REMINDER_RUNS_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!(
                "dunning_reminder_runs_total",
                "Total reminder runs by mode and status"
            ),
            &["mode", "status"]
        )
        .expect("Failed to register REMINDER_RUNS_TOTAL")
    });

    OUTBOX_MESSAGES_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!(
                "dunning_outbox_messages_total",
                "Outbox message transitions by channel and resulting status"
            ),
            &["channel", "status"]
        )
        .expect("Failed to register OUTBOX_MESSAGES_TOTAL")
    });

    DEAD_LETTERS_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!(
                "dunning_dead_letters_total",
                "Dead-lettered outbox messages by channel and error code"
            ),
            &["channel", "error_code"]
        )
        .expect("Failed to register DEAD_LETTERS_TOTAL")
    });

    ERRORS_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!("dunning_errors_total", "Total errors by type for alerting"),
            &["error_type", "operation"]
        )
        .expect("Failed to register ERRORS_TOTAL")
    });

    // Force initialization of lazy statics
    let _ = &*DB_QUERY_DURATION;
}

/// Get metrics in Prometheus text format.
pub fn get_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .expect("Failed to encode metrics");
    String::from_utf8(buffer).expect("Failed to convert metrics to string")
}

/// Record an invoice ledger operation.
pub fn record_invoice_operation(operation: &str) {
    if let Some(counter) = INVOICE_OPERATIONS_TOTAL.get() {
        counter.with_label_values(&[operation]).inc();
    }
}

/// Record a payment event outcome.
pub fn record_payment_applied(result: &str) {
    if let Some(counter) = PAYMENTS_APPLIED_TOTAL.get() {
        counter.with_label_values(&[result]).inc();
    }
}

/// Record a reminder run.
pub fn record_reminder_run(mode: &str, status: &str) {
    if let Some(counter) = REMINDER_RUNS_TOTAL.get() {
        counter.with_label_values(&[mode, status]).inc();
    }
}

/// Record an outbox message transition.
pub fn record_outbox_transition(channel: &str, status: &str) {
    if let Some(counter) = OUTBOX_MESSAGES_TOTAL.get() {
        counter.with_label_values(&[channel, status]).inc();
    }
}

/// Record a dead-lettered message.
pub fn record_dead_letter(channel: &str, error_code: &str) {
    if let Some(counter) = DEAD_LETTERS_TOTAL.get() {
        counter.with_label_values(&[channel, error_code]).inc();
    }
}

/// Record an error for alerting.
pub fn record_error(error_type: &str, operation: &str) {
    if let Some(counter) = ERRORS_TOTAL.get() {
        counter.with_label_values(&[error_type, operation]).inc();
    }
}
