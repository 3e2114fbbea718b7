//! The reminder engine: the one entry point for ledger writes, run
//! planning, and outbox draining. Every operation goes through the
//! [`ReminderStore`] trait, so the engine behaves identically over the
//! in-memory and Postgres backends.

use crate::config::ReminderPolicy;
use crate::models::{
    AttemptStatus, Dispatch, DispatchRequest, EligibilityReason, IdempotencyRecord, Invoice,
    OutboxMessage, OutboxStatus, PaymentEvent, PaymentRequest, ReminderAttempt, ReminderRun,
    RunMode, RunResponse, RunStatus, StartRunRequest, UpsertInvoice,
};
use crate::services::providers::{Sender, ERR_RECIPIENT_MISSING};
use crate::services::repository::ReminderStore;
use crate::services::{delivery, idempotency, metrics, planner};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde_json::json;
use service_core::error::AppError;
use std::sync::Arc;
use tracing::instrument;
use uuid::Uuid;
use validator::Validate;

pub struct ReminderEngine {
    store: Arc<dyn ReminderStore>,
    sender: Arc<dyn Sender>,
    policy: ReminderPolicy,
}

impl ReminderEngine {
    pub fn new(
        store: Arc<dyn ReminderStore>,
        sender: Arc<dyn Sender>,
        policy: ReminderPolicy,
    ) -> Self {
        Self {
            store,
            sender,
            policy,
        }
    }

    pub fn store(&self) -> &Arc<dyn ReminderStore> {
        &self.store
    }

    pub fn policy(&self) -> &ReminderPolicy {
        &self.policy
    }

    // =========================================================================
    // Invoice Ledger
    // =========================================================================

    /// Create or replace invoices. An upsert on an existing id replaces the
    /// caller-owned fields and preserves the reminder history and payment
    /// trail the engine owns.
    #[instrument(skip(self, inputs), fields(count = inputs.len()))]
    pub async fn upsert_invoices(
        &self,
        inputs: Vec<UpsertInvoice>,
        now: DateTime<Utc>,
    ) -> Result<Vec<Invoice>, AppError> {
        let mut saved = Vec::with_capacity(inputs.len());

        for input in inputs {
            input.validate()?;
            if input.amount_due < Decimal::ZERO || input.amount_paid < Decimal::ZERO {
                return Err(AppError::BadRequest(anyhow::anyhow!(
                    "Invoice '{}' has a negative amount",
                    input.invoice_id
                )));
            }
            if input.amount_paid > input.amount_due {
                return Err(AppError::BadRequest(anyhow::anyhow!(
                    "Invoice '{}' has amount_paid exceeding amount_due",
                    input.invoice_id
                )));
            }

            let existing = self.store.get_invoice(&input.invoice_id).await?;
            let mut invoice = match existing {
                Some(current) => Invoice {
                    creator_id: input.creator_id,
                    creator_name: input.creator_name,
                    contact_channel: input.contact_channel.as_str().to_string(),
                    contact_target: input.contact_target,
                    currency: input.currency,
                    amount_due: input.amount_due,
                    amount_paid: input.amount_paid.max(current.amount_paid),
                    issued_at: input.issued_at,
                    due_date: input.due_date,
                    creator_timezone: input.creator_timezone,
                    opt_out: input.opt_out,
                    ..current
                },
                None => Invoice {
                    invoice_id: input.invoice_id,
                    creator_id: input.creator_id,
                    creator_name: input.creator_name,
                    contact_channel: input.contact_channel.as_str().to_string(),
                    contact_target: input.contact_target,
                    currency: input.currency,
                    amount_due: input.amount_due,
                    amount_paid: input.amount_paid,
                    balance_due: Decimal::ZERO,
                    issued_at: input.issued_at,
                    due_date: input.due_date,
                    creator_timezone: input.creator_timezone,
                    opt_out: input.opt_out,
                    reminder_count: 0,
                    last_reminder_at: None,
                    last_payment_at: None,
                    status: String::new(),
                    created_utc: now,
                    updated_utc: now,
                },
            };

            invoice.recompute(now, self.policy.max_attempts);
            self.store.put_invoice(&invoice).await?;
            metrics::record_invoice_operation("upsert");
            saved.push(invoice);
        }

        Ok(saved)
    }

    #[instrument(skip(self))]
    pub async fn get_invoice(
        &self,
        invoice_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Invoice, AppError> {
        let mut invoice = self
            .store
            .get_invoice(invoice_id)
            .await?
            .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("Invoice '{}' not found", invoice_id)))?;
        invoice.recompute(now, self.policy.max_attempts);
        Ok(invoice)
    }

    #[instrument(skip(self))]
    pub async fn list_invoices(&self, now: DateTime<Utc>) -> Result<Vec<Invoice>, AppError> {
        let mut invoices = self.store.list_invoices().await?;
        for invoice in &mut invoices {
            invoice.recompute(now, self.policy.max_attempts);
        }
        Ok(invoices)
    }

    // =========================================================================
    // Dispatches
    // =========================================================================

    /// Register the contact channels for an invoice. At most one dispatch per
    /// invoice; re-dispatching, with or without the original idempotency key,
    /// returns the existing record.
    #[instrument(skip(self, request), fields(invoice_id = %request.invoice_id))]
    pub async fn dispatch(
        &self,
        request: DispatchRequest,
        now: DateTime<Utc>,
    ) -> Result<Dispatch, AppError> {
        request.validate()?;

        if self.store.get_invoice(&request.invoice_id).await?.is_none() {
            return Err(AppError::NotFound(anyhow::anyhow!(
                "Invoice '{}' not found",
                request.invoice_id
            )));
        }

        if let Some(key) = request.idempotency_key.as_deref() {
            if let Some(existing) = self.store.find_dispatch_by_key(key).await? {
                if existing.invoice_id == request.invoice_id {
                    return Ok(existing);
                }
                return Err(AppError::Conflict(anyhow::anyhow!(
                    "Idempotency key '{}' was used for a different invoice",
                    key
                )));
            }
        }

        if let Some(existing) = self.store.get_dispatch(&request.invoice_id).await? {
            return Ok(existing);
        }

        let dispatch = Dispatch {
            dispatch_id: Uuid::new_v4(),
            invoice_id: request.invoice_id,
            channels: request
                .channels
                .iter()
                .map(|c| c.as_str().to_string())
                .collect(),
            recipients: json!(request.recipients),
            idempotency_key: request.idempotency_key,
            created_utc: now,
        };
        self.store.insert_dispatch(&dispatch).await?;
        metrics::record_invoice_operation("dispatch");
        Ok(dispatch)
    }

    // =========================================================================
    // Payments
    // =========================================================================

    /// Apply a payment event. Duplicate event ids are acknowledged without
    /// touching the balance; the boolean reports whether the amount was
    /// applied.
    #[instrument(skip(self, request), fields(invoice_id = %request.invoice_id, event_id = %request.event_id))]
    pub async fn apply_payment(
        &self,
        request: PaymentRequest,
        now: DateTime<Utc>,
    ) -> Result<(Invoice, bool), AppError> {
        request.validate()?;
        if request.amount <= Decimal::ZERO {
            return Err(AppError::BadRequest(anyhow::anyhow!(
                "Payment amount must be positive"
            )));
        }

        let mut invoice = self
            .store
            .get_invoice(&request.invoice_id)
            .await?
            .ok_or_else(|| {
                AppError::NotFound(anyhow::anyhow!("Invoice '{}' not found", request.invoice_id))
            })?;

        let event = PaymentEvent {
            event_id: request.event_id,
            invoice_id: request.invoice_id,
            amount: request.amount,
            paid_at: request.paid_at,
            source: request.source,
            created_utc: now,
        };

        let applied = self.store.insert_payment_event(&event).await?;
        if applied {
            invoice.amount_paid += event.amount;
            invoice.last_payment_at = Some(match invoice.last_payment_at {
                Some(existing) => existing.max(event.paid_at),
                None => event.paid_at,
            });
            invoice.recompute(now, self.policy.max_attempts);
            self.store.put_invoice(&invoice).await?;
            metrics::record_payment_applied("applied");
        } else {
            invoice.recompute(now, self.policy.max_attempts);
            metrics::record_payment_applied("duplicate");
        }

        Ok((invoice, applied))
    }

    // =========================================================================
    // Runs
    // =========================================================================

    /// Plan only: evaluate the whole ledger without sending or mutating it.
    pub async fn plan_run(&self, mut request: StartRunRequest) -> Result<RunResponse, AppError> {
        request.dry_run = true;
        self.start_run(request, RunMode::RunOnce).await
    }

    /// Plan and synchronously drain the outbox in one call.
    pub async fn run_once(&self, request: StartRunRequest) -> Result<RunResponse, AppError> {
        self.start_run(request, RunMode::RunOnce).await
    }

    /// Plan and enqueue, leaving the outbox for later [`send_run`] calls.
    pub async fn evaluate_run(&self, request: StartRunRequest) -> Result<RunResponse, AppError> {
        self.start_run(request, RunMode::Evaluate).await
    }

    #[instrument(skip(self, request), fields(mode = mode.as_str(), dry_run = request.dry_run))]
    async fn start_run(
        &self,
        request: StartRunRequest,
        mode: RunMode,
    ) -> Result<RunResponse, AppError> {
        request.validate()?;
        let hash = idempotency::request_hash(&request)?;

        if let Some(key) = request.idempotency_key.as_deref() {
            if let Some(record) = self.store.get_idempotency(key).await? {
                if record.request_hash != hash {
                    return Err(AppError::Conflict(anyhow::anyhow!(
                        "Idempotency key '{}' was used with a different request body",
                        key
                    )));
                }
                let response: RunResponse =
                    serde_json::from_value(record.response.clone()).map_err(|e| {
                        AppError::InternalError(anyhow::anyhow!(
                            "Stored idempotent response is unreadable: {}",
                            e
                        ))
                    })?;
                tracing::info!(run_id = %response.run.run_id, "Replaying idempotent run response");
                return Ok(response);
            }
        }

        let now = request.now.unwrap_or_else(Utc::now);

        // Ledger snapshot with derived state as of `now`. Planning never
        // writes invoices; only applied reminder outcomes do.
        let mut snapshot = Vec::new();
        for mut invoice in self.store.list_invoices().await? {
            invoice.recompute(now, self.policy.max_attempts);
            let dispatch = self.store.get_dispatch(&invoice.invoice_id).await?;
            snapshot.push((invoice, dispatch));
        }

        let plan = planner::plan(&snapshot, now, request.limit, &self.policy);

        let run_id = Uuid::new_v4();
        let mut run = ReminderRun {
            run_id,
            mode: mode.as_str().to_string(),
            dry_run: request.dry_run,
            triggered_by: request.triggered_by.clone(),
            request_hash: hash.clone(),
            idempotency_key: request.idempotency_key.clone(),
            run_at: now,
            status: RunStatus::Planned.as_str().to_string(),
            evaluated_count: plan.evaluated,
            eligible_count: plan.eligible,
            sent_count: 0,
            failed_count: 0,
            skipped_count: plan.skipped,
            escalated_count: plan.escalated,
            created_utc: now,
            completed_utc: None,
        };

        let mut attempts = Vec::with_capacity(plan.attempts.len());
        let mut outbox = Vec::new();
        for planned in &plan.attempts {
            let attempt_id = Uuid::new_v4();
            let status = if planned.verdict.eligible {
                AttemptStatus::Planned
            } else {
                AttemptStatus::Skipped
            };
            attempts.push(ReminderAttempt {
                attempt_id,
                run_id,
                invoice_id: planned.invoice_id.clone(),
                eligible: planned.verdict.eligible,
                reason: planned.verdict.reason.as_str().to_string(),
                next_eligible_at: planned.verdict.next_eligible_at,
                channels_planned: planned.jobs.len() as i32,
                status: status.as_str().to_string(),
                error_message: None,
                provider_message_id: None,
                channel_outcomes: json!([]),
                outcome_applied: false,
                created_utc: now,
                completed_utc: Some(now).filter(|_| !planned.verdict.eligible),
            });

            if request.dry_run || !planned.verdict.eligible {
                continue;
            }
            for job in &planned.jobs {
                outbox.push(self.build_message(run_id, attempt_id, planned, job, now));
            }
        }

        self.store.insert_run(&run).await?;
        self.store.insert_attempts(&attempts).await?;

        if request.dry_run {
            run.status = RunStatus::Completed.as_str().to_string();
            run.completed_utc = Some(now);
            self.store.update_run(&run).await?;
            metrics::record_reminder_run(&run.mode, "dry_run");
            let response = RunResponse { run, attempts };
            self.record_idempotent(&request, &hash, &response, now)
                .await?;
            return Ok(response);
        }

        self.store.insert_outbox(&outbox).await?;

        // Jobs dead-lettered at enqueue time (missing recipient) can leave an
        // attempt terminal before any drain runs.
        for attempt in &attempts {
            if attempt.eligible {
                self.terminalize_attempt(attempt.attempt_id, now).await?;
            }
        }

        if mode == RunMode::RunOnce {
            self.drain(run_id, None, now).await?;
        }

        let run = self.finalize_run(run_id, now).await?;
        let attempts = self.store.list_attempts(run_id).await?;
        let response = RunResponse { run, attempts };
        self.record_idempotent(&request, &hash, &response, now)
            .await?;
        Ok(response)
    }

    /// Drain an evaluated run's outbox. Idempotent: a completed run returns
    /// its final state unchanged, and claims never hand the same message to
    /// two callers.
    #[instrument(skip(self))]
    pub async fn send_run(
        &self,
        run_id: Uuid,
        budget: Option<usize>,
        now: DateTime<Utc>,
    ) -> Result<RunResponse, AppError> {
        let run = self
            .store
            .get_run(run_id)
            .await?
            .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("Run '{}' not found", run_id)))?;

        if RunStatus::from_string(&run.status) != RunStatus::Completed && !run.dry_run {
            self.drain(run_id, budget, now).await?;
        }

        let run = self.finalize_run(run_id, now).await?;
        let attempts = self.store.list_attempts(run_id).await?;
        Ok(RunResponse { run, attempts })
    }

    #[instrument(skip(self))]
    pub async fn get_run(&self, run_id: Uuid) -> Result<RunResponse, AppError> {
        let run = self
            .store
            .get_run(run_id)
            .await?
            .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("Run '{}' not found", run_id)))?;
        let attempts = self.store.list_attempts(run_id).await?;
        Ok(RunResponse { run, attempts })
    }

    // =========================================================================
    // Internals
    // =========================================================================

    fn build_message(
        &self,
        run_id: Uuid,
        attempt_id: Uuid,
        planned: &planner::PlannedAttempt,
        job: &planner::PlannedJob,
        now: DateTime<Utc>,
    ) -> OutboxMessage {
        let mut message = OutboxMessage {
            message_id: Uuid::new_v4(),
            run_id,
            attempt_id,
            invoice_id: planned.invoice_id.clone(),
            channel: job.channel.as_str().to_string(),
            recipient: job.recipient.clone(),
            masked_recipient: job.masked_recipient.clone(),
            payload: job.payload.clone(),
            status: OutboxStatus::Pending.as_str().to_string(),
            tries: 0,
            available_at: now,
            provider_message_id: None,
            error_code: None,
            error_message: None,
            created_utc: now,
            updated_utc: now,
        };

        // No recipient on file for the channel: nothing to retry, straight
        // to the dead letter queue.
        if message.recipient.is_none() {
            message.status = OutboxStatus::DeadLetter.as_str().to_string();
            message.error_code = Some(ERR_RECIPIENT_MISSING.to_string());
            message.error_message = Some(format!(
                "No {} recipient on file for invoice '{}'",
                job.channel, planned.invoice_id
            ));
            metrics::record_dead_letter(&message.channel, ERR_RECIPIENT_MISSING);
            metrics::record_outbox_transition(&message.channel, &message.status);
        }

        message
    }

    /// Claim-send-apply loop. Retried messages back off into the future, so
    /// a single drain pass never spins on a failing provider.
    async fn drain(
        &self,
        run_id: Uuid,
        budget: Option<usize>,
        now: DateTime<Utc>,
    ) -> Result<(), AppError> {
        let mut remaining = budget;

        loop {
            let batch = match remaining {
                Some(left) => left.min(self.policy.claim_batch),
                None => self.policy.claim_batch,
            };
            if batch == 0 {
                break;
            }

            let claimed = self.store.claim_outbox(run_id, batch, now).await?;
            if claimed.is_empty() {
                break;
            }

            for mut message in claimed {
                let outcome = self.sender.send(&message, false).await;
                delivery::apply_send_outcome(&mut message, &outcome, now, &self.policy);
                self.store.update_outbox(&message).await?;
                if let Some(left) = remaining.as_mut() {
                    *left -= 1;
                }
                self.terminalize_attempt(message.attempt_id, now).await?;
            }
        }

        Ok(())
    }

    /// Fold terminal outbox state back into the attempt and, exactly once per
    /// attempt with every channel delivered, into the invoice ledger. A
    /// partially delivered attempt is failed and leaves the reminder counters
    /// alone, so the invoice stays eligible for the next cycle.
    async fn terminalize_attempt(
        &self,
        attempt_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<(), AppError> {
        let Some(mut attempt) = self.store.get_attempt(attempt_id).await? else {
            return Ok(());
        };
        if AttemptStatus::from_string(&attempt.status) != AttemptStatus::Planned {
            return Ok(());
        }

        let messages = self.store.list_outbox_for_attempt(attempt_id).await?;
        attempt.channel_outcomes = channel_outcomes(&messages);

        let all_terminal = !messages.is_empty() && messages.iter().all(|m| m.is_terminal());
        if !all_terminal {
            self.store.update_attempt(&attempt).await?;
            return Ok(());
        }

        let all_sent = messages
            .iter()
            .all(|m| m.status_enum() == OutboxStatus::Sent);
        let first_error = messages.iter().find_map(|m| m.error_message.clone());

        if all_sent {
            attempt.status = AttemptStatus::Sent.as_str().to_string();
            attempt.provider_message_id = messages
                .iter()
                .find_map(|m| m.provider_message_id.clone());
        } else {
            attempt.status = AttemptStatus::Failed.as_str().to_string();
        }
        attempt.error_message = first_error;
        attempt.completed_utc = Some(now);
        self.store.update_attempt(&attempt).await?;

        if all_sent && self.store.mark_attempt_outcome_applied(attempt_id).await? {
            if let Some(mut invoice) = self.store.get_invoice(&attempt.invoice_id).await? {
                invoice.reminder_count += 1;
                invoice.last_reminder_at = Some(now);
                invoice.recompute(now, self.policy.max_attempts);
                self.store.put_invoice(&invoice).await?;
                tracing::info!(
                    invoice_id = %invoice.invoice_id,
                    reminder_count = invoice.reminder_count,
                    "Reminder delivered"
                );
            }
        }

        Ok(())
    }

    /// Recompute the run counters from attempt/outbox state and mark the run
    /// completed once nothing is left pending. Counters are derived, never
    /// incremented, so re-running this on a settled run is a no-op.
    async fn finalize_run(
        &self,
        run_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<ReminderRun, AppError> {
        let mut run = self
            .store
            .get_run(run_id)
            .await?
            .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("Run '{}' not found", run_id)))?;
        let attempts = self.store.list_attempts(run_id).await?;
        let outbox = self.store.list_outbox(run_id).await?;

        run.sent_count = attempts
            .iter()
            .filter(|a| AttemptStatus::from_string(&a.status) == AttemptStatus::Sent)
            .count() as i32;
        run.skipped_count = attempts.iter().filter(|a| !a.eligible).count() as i32;
        run.escalated_count = attempts
            .iter()
            .filter(|a| {
                EligibilityReason::from_string(&a.reason)
                    == EligibilityReason::MaxRemindersReached
            })
            .count() as i32;
        run.failed_count = attempts
            .iter()
            .filter(|a| {
                a.eligible
                    && AttemptStatus::from_string(&a.status) != AttemptStatus::Sent
                    && outbox.iter().any(|m| {
                        m.attempt_id == a.attempt_id
                            && (m.status_enum() == OutboxStatus::DeadLetter || m.tries > 0)
                    })
            })
            .count() as i32;

        let open = self.store.count_open_outbox(run_id).await?;
        let status = RunStatus::from_string(&run.status);
        if open == 0 {
            if status != RunStatus::Completed {
                run.status = RunStatus::Completed.as_str().to_string();
                run.completed_utc = Some(now);
                metrics::record_reminder_run(&run.mode, "completed");
            }
        } else if status == RunStatus::Planned {
            run.status = RunStatus::Processing.as_str().to_string();
        }

        self.store.update_run(&run).await?;
        Ok(run)
    }

    async fn record_idempotent(
        &self,
        request: &StartRunRequest,
        hash: &str,
        response: &RunResponse,
        now: DateTime<Utc>,
    ) -> Result<(), AppError> {
        let Some(key) = request.idempotency_key.as_deref() else {
            return Ok(());
        };
        let record = IdempotencyRecord {
            idempotency_key: key.to_string(),
            request_hash: hash.to_string(),
            run_id: response.run.run_id,
            response: serde_json::to_value(response).map_err(|e| {
                AppError::InternalError(anyhow::anyhow!("Failed to store response: {}", e))
            })?,
            created_utc: now,
        };
        self.store.put_idempotency(&record).await
    }
}

fn channel_outcomes(messages: &[OutboxMessage]) -> serde_json::Value {
    json!(messages
        .iter()
        .map(|m| {
            json!({
                "channel": m.channel,
                "status": m.status,
                "tries": m.tries,
                "masked_recipient": m.masked_recipient,
                "provider_message_id": m.provider_message_id,
                "error_code": m.error_code,
                "error_message": m.error_message,
            })
        })
        .collect::<Vec<_>>())
}
