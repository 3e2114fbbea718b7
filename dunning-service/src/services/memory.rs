//! Volatile in-memory store.
//!
//! One process-wide mutex guards all state; every trait operation locks,
//! mutates, and releases before returning, so each operation is atomic with
//! respect to concurrent callers. Coarse but sufficient for modest invoice
//! volumes, and the lock is never held across an await point.

use crate::models::{
    Dispatch, IdempotencyRecord, Invoice, OutboxMessage, OutboxStatus, PaymentEvent,
    ReminderAttempt, ReminderRun,
};
use crate::services::repository::ReminderStore;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use service_core::error::AppError;
use std::collections::HashMap;
use std::sync::Mutex;
use uuid::Uuid;

#[derive(Default)]
struct State {
    invoices: HashMap<String, Invoice>,
    dispatches: HashMap<String, Dispatch>,
    dispatch_keys: HashMap<String, String>,
    payment_events: HashMap<String, PaymentEvent>,
    runs: HashMap<Uuid, ReminderRun>,
    attempts: HashMap<Uuid, ReminderAttempt>,
    run_attempts: HashMap<Uuid, Vec<Uuid>>,
    outbox: HashMap<Uuid, OutboxMessage>,
    run_outbox: HashMap<Uuid, Vec<Uuid>>,
    idempotency: HashMap<String, IdempotencyRecord>,
}

#[derive(Default)]
pub struct InMemoryStore {
    state: Mutex<State>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        // Poisoning only happens if another holder panicked; the data is
        // plain-old-state so continuing is still coherent.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl ReminderStore for InMemoryStore {
    async fn health_check(&self) -> Result<(), AppError> {
        Ok(())
    }

    async fn get_invoice(&self, invoice_id: &str) -> Result<Option<Invoice>, AppError> {
        Ok(self.lock().invoices.get(invoice_id).cloned())
    }

    async fn put_invoice(&self, invoice: &Invoice) -> Result<(), AppError> {
        self.lock()
            .invoices
            .insert(invoice.invoice_id.clone(), invoice.clone());
        Ok(())
    }

    async fn list_invoices(&self) -> Result<Vec<Invoice>, AppError> {
        let mut invoices: Vec<Invoice> = self.lock().invoices.values().cloned().collect();
        invoices.sort_by(|a, b| {
            a.due_date
                .cmp(&b.due_date)
                .then_with(|| a.invoice_id.cmp(&b.invoice_id))
        });
        Ok(invoices)
    }

    async fn get_dispatch(&self, invoice_id: &str) -> Result<Option<Dispatch>, AppError> {
        Ok(self.lock().dispatches.get(invoice_id).cloned())
    }

    async fn find_dispatch_by_key(
        &self,
        idempotency_key: &str,
    ) -> Result<Option<Dispatch>, AppError> {
        let state = self.lock();
        Ok(state
            .dispatch_keys
            .get(idempotency_key)
            .and_then(|invoice_id| state.dispatches.get(invoice_id))
            .cloned())
    }

    async fn insert_dispatch(&self, dispatch: &Dispatch) -> Result<(), AppError> {
        let mut state = self.lock();
        if let Some(key) = &dispatch.idempotency_key {
            state
                .dispatch_keys
                .insert(key.clone(), dispatch.invoice_id.clone());
        }
        state
            .dispatches
            .insert(dispatch.invoice_id.clone(), dispatch.clone());
        Ok(())
    }

    async fn insert_payment_event(&self, event: &PaymentEvent) -> Result<bool, AppError> {
        let mut state = self.lock();
        if state.payment_events.contains_key(&event.event_id) {
            return Ok(false);
        }
        state
            .payment_events
            .insert(event.event_id.clone(), event.clone());
        Ok(true)
    }

    async fn insert_run(&self, run: &ReminderRun) -> Result<(), AppError> {
        self.lock().runs.insert(run.run_id, run.clone());
        Ok(())
    }

    async fn get_run(&self, run_id: Uuid) -> Result<Option<ReminderRun>, AppError> {
        Ok(self.lock().runs.get(&run_id).cloned())
    }

    async fn update_run(&self, run: &ReminderRun) -> Result<(), AppError> {
        let mut state = self.lock();
        if !state.runs.contains_key(&run.run_id) {
            return Err(AppError::NotFound(anyhow::anyhow!(
                "Run {} not found",
                run.run_id
            )));
        }
        state.runs.insert(run.run_id, run.clone());
        Ok(())
    }

    async fn delete_run(&self, run_id: Uuid) -> Result<(), AppError> {
        let mut state = self.lock();
        state.runs.remove(&run_id);
        if let Some(attempt_ids) = state.run_attempts.remove(&run_id) {
            for attempt_id in attempt_ids {
                state.attempts.remove(&attempt_id);
            }
        }
        if let Some(message_ids) = state.run_outbox.remove(&run_id) {
            for message_id in message_ids {
                state.outbox.remove(&message_id);
            }
        }
        Ok(())
    }

    async fn insert_attempts(&self, attempts: &[ReminderAttempt]) -> Result<(), AppError> {
        let mut state = self.lock();
        for attempt in attempts {
            state
                .run_attempts
                .entry(attempt.run_id)
                .or_default()
                .push(attempt.attempt_id);
            state.attempts.insert(attempt.attempt_id, attempt.clone());
        }
        Ok(())
    }

    async fn list_attempts(&self, run_id: Uuid) -> Result<Vec<ReminderAttempt>, AppError> {
        let state = self.lock();
        let ids = state.run_attempts.get(&run_id).cloned().unwrap_or_default();
        Ok(ids
            .iter()
            .filter_map(|id| state.attempts.get(id))
            .cloned()
            .collect())
    }

    async fn get_attempt(&self, attempt_id: Uuid) -> Result<Option<ReminderAttempt>, AppError> {
        Ok(self.lock().attempts.get(&attempt_id).cloned())
    }

    async fn update_attempt(&self, attempt: &ReminderAttempt) -> Result<(), AppError> {
        let mut state = self.lock();
        if !state.attempts.contains_key(&attempt.attempt_id) {
            return Err(AppError::NotFound(anyhow::anyhow!(
                "Attempt {} not found",
                attempt.attempt_id
            )));
        }
        state.attempts.insert(attempt.attempt_id, attempt.clone());
        Ok(())
    }

    async fn mark_attempt_outcome_applied(&self, attempt_id: Uuid) -> Result<bool, AppError> {
        let mut state = self.lock();
        match state.attempts.get_mut(&attempt_id) {
            Some(attempt) if !attempt.outcome_applied => {
                attempt.outcome_applied = true;
                Ok(true)
            }
            Some(_) => Ok(false),
            None => Err(AppError::NotFound(anyhow::anyhow!(
                "Attempt {} not found",
                attempt_id
            ))),
        }
    }

    async fn insert_outbox(&self, messages: &[OutboxMessage]) -> Result<(), AppError> {
        let mut state = self.lock();
        for message in messages {
            state
                .run_outbox
                .entry(message.run_id)
                .or_default()
                .push(message.message_id);
            state.outbox.insert(message.message_id, message.clone());
        }
        Ok(())
    }

    async fn claim_outbox(
        &self,
        run_id: Uuid,
        max_messages: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<OutboxMessage>, AppError> {
        let mut state = self.lock();
        let ids = state.run_outbox.get(&run_id).cloned().unwrap_or_default();
        let mut claimed = Vec::new();
        for id in ids {
            if claimed.len() >= max_messages {
                break;
            }
            if let Some(message) = state.outbox.get_mut(&id) {
                if message.status_enum() == OutboxStatus::Pending && message.available_at <= now {
                    message.status = OutboxStatus::Processing.as_str().to_string();
                    message.updated_utc = now;
                    claimed.push(message.clone());
                }
            }
        }
        Ok(claimed)
    }

    async fn update_outbox(&self, message: &OutboxMessage) -> Result<(), AppError> {
        let mut state = self.lock();
        if !state.outbox.contains_key(&message.message_id) {
            return Err(AppError::NotFound(anyhow::anyhow!(
                "Outbox message {} not found",
                message.message_id
            )));
        }
        state.outbox.insert(message.message_id, message.clone());
        Ok(())
    }

    async fn list_outbox(&self, run_id: Uuid) -> Result<Vec<OutboxMessage>, AppError> {
        let state = self.lock();
        let ids = state.run_outbox.get(&run_id).cloned().unwrap_or_default();
        Ok(ids
            .iter()
            .filter_map(|id| state.outbox.get(id))
            .cloned()
            .collect())
    }

    async fn list_outbox_for_attempt(
        &self,
        attempt_id: Uuid,
    ) -> Result<Vec<OutboxMessage>, AppError> {
        let state = self.lock();
        let mut messages: Vec<OutboxMessage> = state
            .outbox
            .values()
            .filter(|m| m.attempt_id == attempt_id)
            .cloned()
            .collect();
        messages.sort_by_key(|m| m.created_utc);
        Ok(messages)
    }

    async fn count_open_outbox(&self, run_id: Uuid) -> Result<i64, AppError> {
        let state = self.lock();
        let ids = state.run_outbox.get(&run_id).cloned().unwrap_or_default();
        Ok(ids
            .iter()
            .filter_map(|id| state.outbox.get(id))
            .filter(|m| !m.is_terminal())
            .count() as i64)
    }

    async fn get_idempotency(&self, key: &str) -> Result<Option<IdempotencyRecord>, AppError> {
        Ok(self.lock().idempotency.get(key).cloned())
    }

    async fn put_idempotency(&self, record: &IdempotencyRecord) -> Result<(), AppError> {
        self.lock()
            .idempotency
            .insert(record.idempotency_key.clone(), record.clone());
        Ok(())
    }
}
