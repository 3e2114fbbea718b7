//! Durable PostgreSQL store for dunning-service.

use crate::models::{
    Dispatch, IdempotencyRecord, Invoice, OutboxMessage, PaymentEvent, ReminderAttempt,
    ReminderRun,
};
use crate::services::metrics::DB_QUERY_DURATION;
use crate::services::repository::ReminderStore;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use service_core::error::AppError;
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::time::Duration;
use tracing::{info, instrument};
use uuid::Uuid;

const INVOICE_COLUMNS: &str = "invoice_id, creator_id, creator_name, contact_channel, contact_target, currency, amount_due, amount_paid, balance_due, issued_at, due_date, creator_timezone, opt_out, reminder_count, last_reminder_at, last_payment_at, status, created_utc, updated_utc";

const ATTEMPT_COLUMNS: &str = "attempt_id, run_id, invoice_id, eligible, reason, next_eligible_at, channels_planned, status, error_message, provider_message_id, channel_outcomes, outcome_applied, created_utc, completed_utc";

const OUTBOX_COLUMNS: &str = "message_id, run_id, attempt_id, invoice_id, channel, recipient, masked_recipient, payload, status, tries, available_at, provider_message_id, error_code, error_message, created_utc, updated_utc";

const RUN_COLUMNS: &str = "run_id, mode, dry_run, triggered_by, request_hash, idempotency_key, run_at, status, evaluated_count, eligible_count, sent_count, failed_count, skipped_count, escalated_count, created_utc, completed_utc";

/// Database connection pool wrapper.
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    /// Create a new database connection pool.
    #[instrument(skip(database_url), fields(service = "dunning-service"))]
    pub async fn new(
        database_url: &str,
        max_connections: u32,
        min_connections: u32,
    ) -> Result<Self, AppError> {
        info!(
            max_connections = max_connections,
            min_connections = min_connections,
            "Connecting to PostgreSQL"
        );

        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .min_connections(min_connections)
            .acquire_timeout(Duration::from_secs(30))
            .idle_timeout(Duration::from_secs(600))
            .connect(database_url)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to connect: {}", e)))?;

        info!("PostgreSQL connection pool established");

        Ok(Self { pool })
    }

    /// Get a reference to the connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Run database migrations.
    #[instrument(skip(self))]
    pub async fn run_migrations(&self) -> Result<(), AppError> {
        info!("Running database migrations");
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Migration failed: {}", e)))?;
        info!("Database migrations completed");
        Ok(())
    }
}

#[async_trait]
impl ReminderStore for Database {
    #[instrument(skip(self))]
    async fn health_check(&self) -> Result<(), AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["health_check"])
            .start_timer();

        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Health check failed: {}", e)))?;

        timer.observe_duration();
        Ok(())
    }

    // =========================================================================
    // Invoice Ledger
    // =========================================================================

    #[instrument(skip(self), fields(invoice_id = %invoice_id))]
    async fn get_invoice(&self, invoice_id: &str) -> Result<Option<Invoice>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_invoice"])
            .start_timer();

        let invoice = sqlx::query_as::<_, Invoice>(&format!(
            "SELECT {} FROM invoices WHERE invoice_id = $1",
            INVOICE_COLUMNS
        ))
        .bind(invoice_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to get invoice: {}", e)))?;

        timer.observe_duration();
        Ok(invoice)
    }

    #[instrument(skip(self, invoice), fields(invoice_id = %invoice.invoice_id))]
    async fn put_invoice(&self, invoice: &Invoice) -> Result<(), AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["put_invoice"])
            .start_timer();

        sqlx::query(
            r#"
            INSERT INTO invoices (invoice_id, creator_id, creator_name, contact_channel, contact_target, currency, amount_due, amount_paid, balance_due, issued_at, due_date, creator_timezone, opt_out, reminder_count, last_reminder_at, last_payment_at, status, created_utc, updated_utc)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19)
            ON CONFLICT (invoice_id) DO UPDATE SET
                creator_id = EXCLUDED.creator_id,
                creator_name = EXCLUDED.creator_name,
                contact_channel = EXCLUDED.contact_channel,
                contact_target = EXCLUDED.contact_target,
                currency = EXCLUDED.currency,
                amount_due = EXCLUDED.amount_due,
                amount_paid = EXCLUDED.amount_paid,
                balance_due = EXCLUDED.balance_due,
                issued_at = EXCLUDED.issued_at,
                due_date = EXCLUDED.due_date,
                creator_timezone = EXCLUDED.creator_timezone,
                opt_out = EXCLUDED.opt_out,
                reminder_count = EXCLUDED.reminder_count,
                last_reminder_at = EXCLUDED.last_reminder_at,
                last_payment_at = EXCLUDED.last_payment_at,
                status = EXCLUDED.status,
                updated_utc = EXCLUDED.updated_utc
            "#,
        )
        .bind(&invoice.invoice_id)
        .bind(&invoice.creator_id)
        .bind(&invoice.creator_name)
        .bind(&invoice.contact_channel)
        .bind(&invoice.contact_target)
        .bind(&invoice.currency)
        .bind(invoice.amount_due)
        .bind(invoice.amount_paid)
        .bind(invoice.balance_due)
        .bind(invoice.issued_at)
        .bind(invoice.due_date)
        .bind(&invoice.creator_timezone)
        .bind(invoice.opt_out)
        .bind(invoice.reminder_count)
        .bind(invoice.last_reminder_at)
        .bind(invoice.last_payment_at)
        .bind(&invoice.status)
        .bind(invoice.created_utc)
        .bind(invoice.updated_utc)
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to upsert invoice: {}", e)))?;

        timer.observe_duration();
        Ok(())
    }

    #[instrument(skip(self))]
    async fn list_invoices(&self) -> Result<Vec<Invoice>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["list_invoices"])
            .start_timer();

        let invoices = sqlx::query_as::<_, Invoice>(&format!(
            "SELECT {} FROM invoices ORDER BY due_date, invoice_id",
            INVOICE_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to list invoices: {}", e)))?;

        timer.observe_duration();
        Ok(invoices)
    }

    // =========================================================================
    // Dispatches
    // =========================================================================

    #[instrument(skip(self), fields(invoice_id = %invoice_id))]
    async fn get_dispatch(&self, invoice_id: &str) -> Result<Option<Dispatch>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_dispatch"])
            .start_timer();

        let dispatch = sqlx::query_as::<_, Dispatch>(
            "SELECT dispatch_id, invoice_id, channels, recipients, idempotency_key, created_utc FROM dispatches WHERE invoice_id = $1",
        )
        .bind(invoice_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to get dispatch: {}", e)))?;

        timer.observe_duration();
        Ok(dispatch)
    }

    #[instrument(skip(self))]
    async fn find_dispatch_by_key(
        &self,
        idempotency_key: &str,
    ) -> Result<Option<Dispatch>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["find_dispatch_by_key"])
            .start_timer();

        let dispatch = sqlx::query_as::<_, Dispatch>(
            "SELECT dispatch_id, invoice_id, channels, recipients, idempotency_key, created_utc FROM dispatches WHERE idempotency_key = $1",
        )
        .bind(idempotency_key)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to find dispatch by key: {}", e))
        })?;

        timer.observe_duration();
        Ok(dispatch)
    }

    #[instrument(skip(self, dispatch), fields(invoice_id = %dispatch.invoice_id))]
    async fn insert_dispatch(&self, dispatch: &Dispatch) -> Result<(), AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["insert_dispatch"])
            .start_timer();

        sqlx::query(
            r#"
            INSERT INTO dispatches (dispatch_id, invoice_id, channels, recipients, idempotency_key, created_utc)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(dispatch.dispatch_id)
        .bind(&dispatch.invoice_id)
        .bind(&dispatch.channels)
        .bind(&dispatch.recipients)
        .bind(&dispatch.idempotency_key)
        .bind(dispatch.created_utc)
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to insert dispatch: {}", e)))?;

        timer.observe_duration();
        Ok(())
    }

    // =========================================================================
    // Payment Events
    // =========================================================================

    #[instrument(skip(self, event), fields(event_id = %event.event_id))]
    async fn insert_payment_event(&self, event: &PaymentEvent) -> Result<bool, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["insert_payment_event"])
            .start_timer();

        let result = sqlx::query(
            r#"
            INSERT INTO payment_events (event_id, invoice_id, amount, paid_at, source, created_utc)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (event_id) DO NOTHING
            "#,
        )
        .bind(&event.event_id)
        .bind(&event.invoice_id)
        .bind(event.amount)
        .bind(event.paid_at)
        .bind(&event.source)
        .bind(event.created_utc)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to insert payment event: {}", e))
        })?;

        timer.observe_duration();
        Ok(result.rows_affected() == 1)
    }

    // =========================================================================
    // Reminder Runs
    // =========================================================================

    #[instrument(skip(self, run), fields(run_id = %run.run_id))]
    async fn insert_run(&self, run: &ReminderRun) -> Result<(), AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["insert_run"])
            .start_timer();

        sqlx::query(
            r#"
            INSERT INTO reminder_runs (run_id, mode, dry_run, triggered_by, request_hash, idempotency_key, run_at, status, evaluated_count, eligible_count, sent_count, failed_count, skipped_count, escalated_count, created_utc, completed_utc)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
            "#,
        )
        .bind(run.run_id)
        .bind(&run.mode)
        .bind(run.dry_run)
        .bind(&run.triggered_by)
        .bind(&run.request_hash)
        .bind(&run.idempotency_key)
        .bind(run.run_at)
        .bind(&run.status)
        .bind(run.evaluated_count)
        .bind(run.eligible_count)
        .bind(run.sent_count)
        .bind(run.failed_count)
        .bind(run.skipped_count)
        .bind(run.escalated_count)
        .bind(run.created_utc)
        .bind(run.completed_utc)
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to insert run: {}", e)))?;

        timer.observe_duration();
        Ok(())
    }

    #[instrument(skip(self), fields(run_id = %run_id))]
    async fn get_run(&self, run_id: Uuid) -> Result<Option<ReminderRun>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_run"])
            .start_timer();

        let run = sqlx::query_as::<_, ReminderRun>(&format!(
            "SELECT {} FROM reminder_runs WHERE run_id = $1",
            RUN_COLUMNS
        ))
        .bind(run_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to get run: {}", e)))?;

        timer.observe_duration();
        Ok(run)
    }

    #[instrument(skip(self, run), fields(run_id = %run.run_id))]
    async fn update_run(&self, run: &ReminderRun) -> Result<(), AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["update_run"])
            .start_timer();

        let result = sqlx::query(
            r#"
            UPDATE reminder_runs
            SET status = $2, evaluated_count = $3, eligible_count = $4, sent_count = $5,
                failed_count = $6, skipped_count = $7, escalated_count = $8, completed_utc = $9
            WHERE run_id = $1
            "#,
        )
        .bind(run.run_id)
        .bind(&run.status)
        .bind(run.evaluated_count)
        .bind(run.eligible_count)
        .bind(run.sent_count)
        .bind(run.failed_count)
        .bind(run.skipped_count)
        .bind(run.escalated_count)
        .bind(run.completed_utc)
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to update run: {}", e)))?;

        timer.observe_duration();
        if result.rows_affected() == 0 {
            return Err(AppError::NotFound(anyhow::anyhow!(
                "Run {} not found",
                run.run_id
            )));
        }
        Ok(())
    }

    #[instrument(skip(self), fields(run_id = %run_id))]
    async fn delete_run(&self, run_id: Uuid) -> Result<(), AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["delete_run"])
            .start_timer();

        // Attempts and outbox rows cascade via foreign keys.
        sqlx::query("DELETE FROM reminder_runs WHERE run_id = $1")
            .bind(run_id)
            .execute(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to delete run: {}", e)))?;

        timer.observe_duration();
        Ok(())
    }

    // =========================================================================
    // Attempts
    // =========================================================================

    #[instrument(skip(self, attempts))]
    async fn insert_attempts(&self, attempts: &[ReminderAttempt]) -> Result<(), AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["insert_attempts"])
            .start_timer();

        let mut tx = self.pool.begin().await.map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to begin transaction: {}", e))
        })?;

        for attempt in attempts {
            sqlx::query(
                r#"
                INSERT INTO reminder_attempts (attempt_id, run_id, invoice_id, eligible, reason, next_eligible_at, channels_planned, status, error_message, provider_message_id, channel_outcomes, outcome_applied, created_utc, completed_utc)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
                "#,
            )
            .bind(attempt.attempt_id)
            .bind(attempt.run_id)
            .bind(&attempt.invoice_id)
            .bind(attempt.eligible)
            .bind(&attempt.reason)
            .bind(attempt.next_eligible_at)
            .bind(attempt.channels_planned)
            .bind(&attempt.status)
            .bind(&attempt.error_message)
            .bind(&attempt.provider_message_id)
            .bind(&attempt.channel_outcomes)
            .bind(attempt.outcome_applied)
            .bind(attempt.created_utc)
            .bind(attempt.completed_utc)
            .execute(&mut *tx)
            .await
            .map_err(|e| {
                AppError::DatabaseError(anyhow::anyhow!("Failed to insert attempt: {}", e))
            })?;
        }

        tx.commit().await.map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to commit attempts: {}", e))
        })?;

        timer.observe_duration();
        Ok(())
    }

    #[instrument(skip(self), fields(run_id = %run_id))]
    async fn list_attempts(&self, run_id: Uuid) -> Result<Vec<ReminderAttempt>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["list_attempts"])
            .start_timer();

        let attempts = sqlx::query_as::<_, ReminderAttempt>(&format!(
            "SELECT {} FROM reminder_attempts WHERE run_id = $1 ORDER BY created_utc, attempt_id",
            ATTEMPT_COLUMNS
        ))
        .bind(run_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to list attempts: {}", e)))?;

        timer.observe_duration();
        Ok(attempts)
    }

    #[instrument(skip(self), fields(attempt_id = %attempt_id))]
    async fn get_attempt(&self, attempt_id: Uuid) -> Result<Option<ReminderAttempt>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_attempt"])
            .start_timer();

        let attempt = sqlx::query_as::<_, ReminderAttempt>(&format!(
            "SELECT {} FROM reminder_attempts WHERE attempt_id = $1",
            ATTEMPT_COLUMNS
        ))
        .bind(attempt_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to get attempt: {}", e)))?;

        timer.observe_duration();
        Ok(attempt)
    }

    #[instrument(skip(self, attempt), fields(attempt_id = %attempt.attempt_id))]
    async fn update_attempt(&self, attempt: &ReminderAttempt) -> Result<(), AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["update_attempt"])
            .start_timer();

        let result = sqlx::query(
            r#"
            UPDATE reminder_attempts
            SET status = $2, error_message = $3, provider_message_id = $4,
                channel_outcomes = $5, completed_utc = $6
            WHERE attempt_id = $1
            "#,
        )
        .bind(attempt.attempt_id)
        .bind(&attempt.status)
        .bind(&attempt.error_message)
        .bind(&attempt.provider_message_id)
        .bind(&attempt.channel_outcomes)
        .bind(attempt.completed_utc)
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to update attempt: {}", e)))?;

        timer.observe_duration();
        if result.rows_affected() == 0 {
            return Err(AppError::NotFound(anyhow::anyhow!(
                "Attempt {} not found",
                attempt.attempt_id
            )));
        }
        Ok(())
    }

    #[instrument(skip(self), fields(attempt_id = %attempt_id))]
    async fn mark_attempt_outcome_applied(&self, attempt_id: Uuid) -> Result<bool, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["mark_attempt_outcome_applied"])
            .start_timer();

        let result = sqlx::query(
            "UPDATE reminder_attempts SET outcome_applied = TRUE WHERE attempt_id = $1 AND outcome_applied = FALSE",
        )
        .bind(attempt_id)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to mark attempt outcome: {}", e))
        })?;

        timer.observe_duration();

        if result.rows_affected() == 1 {
            return Ok(true);
        }

        let exists: Option<i32> =
            sqlx::query_scalar("SELECT 1 FROM reminder_attempts WHERE attempt_id = $1")
                .bind(attempt_id)
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| {
                    AppError::DatabaseError(anyhow::anyhow!("Failed to check attempt: {}", e))
                })?;

        match exists {
            Some(_) => Ok(false),
            None => Err(AppError::NotFound(anyhow::anyhow!(
                "Attempt {} not found",
                attempt_id
            ))),
        }
    }

    // =========================================================================
    // Outbox
    // =========================================================================

    #[instrument(skip(self, messages))]
    async fn insert_outbox(&self, messages: &[OutboxMessage]) -> Result<(), AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["insert_outbox"])
            .start_timer();

        let mut tx = self.pool.begin().await.map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to begin transaction: {}", e))
        })?;

        for message in messages {
            sqlx::query(
                r#"
                INSERT INTO reminder_outbox (message_id, run_id, attempt_id, invoice_id, channel, recipient, masked_recipient, payload, status, tries, available_at, provider_message_id, error_code, error_message, created_utc, updated_utc)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
                "#,
            )
            .bind(message.message_id)
            .bind(message.run_id)
            .bind(message.attempt_id)
            .bind(&message.invoice_id)
            .bind(&message.channel)
            .bind(&message.recipient)
            .bind(&message.masked_recipient)
            .bind(&message.payload)
            .bind(&message.status)
            .bind(message.tries)
            .bind(message.available_at)
            .bind(&message.provider_message_id)
            .bind(&message.error_code)
            .bind(&message.error_message)
            .bind(message.created_utc)
            .bind(message.updated_utc)
            .execute(&mut *tx)
            .await
            .map_err(|e| {
                AppError::DatabaseError(anyhow::anyhow!("Failed to insert outbox message: {}", e))
            })?;
        }

        tx.commit().await.map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to commit outbox: {}", e))
        })?;

        timer.observe_duration();
        Ok(())
    }

    #[instrument(skip(self), fields(run_id = %run_id))]
    async fn claim_outbox(
        &self,
        run_id: Uuid,
        max_messages: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<OutboxMessage>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["claim_outbox"])
            .start_timer();

        // The claim predicate plus SKIP LOCKED gives per-row mutual
        // exclusion from the storage engine itself.
        let messages = sqlx::query_as::<_, OutboxMessage>(&format!(
            r#"
            UPDATE reminder_outbox
            SET status = 'processing', updated_utc = $3
            WHERE message_id IN (
                SELECT message_id FROM reminder_outbox
                WHERE run_id = $1 AND status = 'pending' AND available_at <= $3
                ORDER BY created_utc, message_id
                LIMIT $2
                FOR UPDATE SKIP LOCKED
            )
            RETURNING {}
            "#,
            OUTBOX_COLUMNS
        ))
        .bind(run_id)
        .bind(max_messages as i64)
        .bind(now)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to claim outbox: {}", e)))?;

        timer.observe_duration();
        Ok(messages)
    }

    #[instrument(skip(self, message), fields(message_id = %message.message_id))]
    async fn update_outbox(&self, message: &OutboxMessage) -> Result<(), AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["update_outbox"])
            .start_timer();

        let result = sqlx::query(
            r#"
            UPDATE reminder_outbox
            SET status = $2, tries = $3, available_at = $4, provider_message_id = $5,
                error_code = $6, error_message = $7, updated_utc = $8
            WHERE message_id = $1
            "#,
        )
        .bind(message.message_id)
        .bind(&message.status)
        .bind(message.tries)
        .bind(message.available_at)
        .bind(&message.provider_message_id)
        .bind(&message.error_code)
        .bind(&message.error_message)
        .bind(message.updated_utc)
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to update outbox: {}", e)))?;

        timer.observe_duration();
        if result.rows_affected() == 0 {
            return Err(AppError::NotFound(anyhow::anyhow!(
                "Outbox message {} not found",
                message.message_id
            )));
        }
        Ok(())
    }

    #[instrument(skip(self), fields(run_id = %run_id))]
    async fn list_outbox(&self, run_id: Uuid) -> Result<Vec<OutboxMessage>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["list_outbox"])
            .start_timer();

        let messages = sqlx::query_as::<_, OutboxMessage>(&format!(
            "SELECT {} FROM reminder_outbox WHERE run_id = $1 ORDER BY created_utc, message_id",
            OUTBOX_COLUMNS
        ))
        .bind(run_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to list outbox: {}", e)))?;

        timer.observe_duration();
        Ok(messages)
    }

    #[instrument(skip(self), fields(attempt_id = %attempt_id))]
    async fn list_outbox_for_attempt(
        &self,
        attempt_id: Uuid,
    ) -> Result<Vec<OutboxMessage>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["list_outbox_for_attempt"])
            .start_timer();

        let messages = sqlx::query_as::<_, OutboxMessage>(&format!(
            "SELECT {} FROM reminder_outbox WHERE attempt_id = $1 ORDER BY created_utc, message_id",
            OUTBOX_COLUMNS
        ))
        .bind(attempt_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to list outbox for attempt: {}", e))
        })?;

        timer.observe_duration();
        Ok(messages)
    }

    #[instrument(skip(self), fields(run_id = %run_id))]
    async fn count_open_outbox(&self, run_id: Uuid) -> Result<i64, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["count_open_outbox"])
            .start_timer();

        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM reminder_outbox WHERE run_id = $1 AND status IN ('pending', 'processing')",
        )
        .bind(run_id)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to count open outbox: {}", e))
        })?;

        timer.observe_duration();
        Ok(count)
    }

    // =========================================================================
    // Idempotency
    // =========================================================================

    #[instrument(skip(self))]
    async fn get_idempotency(&self, key: &str) -> Result<Option<IdempotencyRecord>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_idempotency"])
            .start_timer();

        let record = sqlx::query_as::<_, IdempotencyRecord>(
            "SELECT idempotency_key, request_hash, run_id, response, created_utc FROM idempotency_records WHERE idempotency_key = $1",
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to get idempotency record: {}", e))
        })?;

        timer.observe_duration();
        Ok(record)
    }

    #[instrument(skip(self, record))]
    async fn put_idempotency(&self, record: &IdempotencyRecord) -> Result<(), AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["put_idempotency"])
            .start_timer();

        sqlx::query(
            r#"
            INSERT INTO idempotency_records (idempotency_key, request_hash, run_id, response, created_utc)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (idempotency_key) DO NOTHING
            "#,
        )
        .bind(&record.idempotency_key)
        .bind(&record.request_hash)
        .bind(record.run_id)
        .bind(&record.response)
        .bind(record.created_utc)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to put idempotency record: {}", e))
        })?;

        timer.observe_duration();
        Ok(())
    }
}
