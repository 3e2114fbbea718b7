//! Data models for the dunning engine.

pub mod idempotency;
pub mod invoice;
pub mod outbox;
pub mod run;

pub use idempotency::IdempotencyRecord;
pub use invoice::{
    ContactChannel, Dispatch, DispatchRequest, Invoice, InvoiceStatus, PaymentEvent,
    PaymentRequest, UpsertInvoice,
};
pub use outbox::{OutboxMessage, OutboxStatus};
pub use run::{
    AttemptStatus, EligibilityReason, ReminderAttempt, ReminderRun, RunMode, RunResponse,
    RunStatus, StartRunRequest,
};
