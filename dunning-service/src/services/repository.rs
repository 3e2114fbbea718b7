//! Storage-agnostic repository contract.
//!
//! Everything the engine persists goes through this trait. Two backends
//! implement it — the volatile [`InMemoryStore`](crate::services::memory)
//! and the durable [`Database`](crate::services::database) — and both must
//! pass the same behavioral suite. The trait exposes a handful of atomic
//! primitives (conditional insert, test-and-set, claim) so the backends get
//! identical semantics under concurrent callers without the engine knowing
//! how each one achieves mutual exclusion.

use crate::models::{
    Dispatch, IdempotencyRecord, Invoice, OutboxMessage, PaymentEvent, ReminderAttempt,
    ReminderRun,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use service_core::error::AppError;
use uuid::Uuid;

#[async_trait]
pub trait ReminderStore: Send + Sync {
    async fn health_check(&self) -> Result<(), AppError>;

    // =========================================================================
    // Invoice Ledger
    // =========================================================================

    async fn get_invoice(&self, invoice_id: &str) -> Result<Option<Invoice>, AppError>;

    /// Insert-or-replace the full invoice row.
    async fn put_invoice(&self, invoice: &Invoice) -> Result<(), AppError>;

    /// Snapshot of all invoices ordered by (due_date, invoice_id) for
    /// deterministic planning.
    async fn list_invoices(&self) -> Result<Vec<Invoice>, AppError>;

    // =========================================================================
    // Dispatches
    // =========================================================================

    async fn get_dispatch(&self, invoice_id: &str) -> Result<Option<Dispatch>, AppError>;

    async fn find_dispatch_by_key(
        &self,
        idempotency_key: &str,
    ) -> Result<Option<Dispatch>, AppError>;

    async fn insert_dispatch(&self, dispatch: &Dispatch) -> Result<(), AppError>;

    // =========================================================================
    // Payment Events
    // =========================================================================

    /// Insert the event unless its `event_id` is already recorded. Returns
    /// `false` on the duplicate path; the amount must not be re-applied.
    async fn insert_payment_event(&self, event: &PaymentEvent) -> Result<bool, AppError>;

    // =========================================================================
    // Reminder Runs
    // =========================================================================

    async fn insert_run(&self, run: &ReminderRun) -> Result<(), AppError>;

    async fn get_run(&self, run_id: Uuid) -> Result<Option<ReminderRun>, AppError>;

    async fn update_run(&self, run: &ReminderRun) -> Result<(), AppError>;

    /// Remove a run with its attempts and outbox rows (the run owns both).
    async fn delete_run(&self, run_id: Uuid) -> Result<(), AppError>;

    // =========================================================================
    // Attempts
    // =========================================================================

    async fn insert_attempts(&self, attempts: &[ReminderAttempt]) -> Result<(), AppError>;

    /// Attempts for a run in creation order.
    async fn list_attempts(&self, run_id: Uuid) -> Result<Vec<ReminderAttempt>, AppError>;

    async fn get_attempt(&self, attempt_id: Uuid) -> Result<Option<ReminderAttempt>, AppError>;

    async fn update_attempt(&self, attempt: &ReminderAttempt) -> Result<(), AppError>;

    /// Atomically flip `outcome_applied` from false to true. Returns whether
    /// this caller won; the reminder outcome is folded into the ledger only
    /// by the winner, so repeat drains never double-count.
    async fn mark_attempt_outcome_applied(&self, attempt_id: Uuid) -> Result<bool, AppError>;

    // =========================================================================
    // Outbox
    // =========================================================================

    async fn insert_outbox(&self, messages: &[OutboxMessage]) -> Result<(), AppError>;

    /// Atomically select up to `max_messages` pending rows of the run with
    /// `available_at <= now`, flip them to `processing`, and return them.
    /// Claims are mutually exclusive per row under concurrent callers.
    async fn claim_outbox(
        &self,
        run_id: Uuid,
        max_messages: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<OutboxMessage>, AppError>;

    async fn update_outbox(&self, message: &OutboxMessage) -> Result<(), AppError>;

    async fn list_outbox(&self, run_id: Uuid) -> Result<Vec<OutboxMessage>, AppError>;

    async fn list_outbox_for_attempt(
        &self,
        attempt_id: Uuid,
    ) -> Result<Vec<OutboxMessage>, AppError>;

    /// Number of rows still pending/processing for a run. Zero means the run
    /// may be marked completed.
    async fn count_open_outbox(&self, run_id: Uuid) -> Result<i64, AppError>;

    // =========================================================================
    // Idempotency
    // =========================================================================

    async fn get_idempotency(&self, key: &str) -> Result<Option<IdempotencyRecord>, AppError>;

    async fn put_idempotency(&self, record: &IdempotencyRecord) -> Result<(), AppError>;
}
