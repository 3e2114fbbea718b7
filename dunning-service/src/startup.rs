//! Application startup and lifecycle management.

use crate::config::{DunningConfig, RepositoryBackend};
use crate::handlers;
use crate::services::providers::{HttpSmsSender, LogSender, Sender, SenderRouter, SmtpSender};
use crate::services::{Database, InMemoryStore, ReminderEngine, ReminderStore};
use axum::{
    middleware,
    routing::{get, post, put},
    Router,
};
use service_core::error::AppError;
use service_core::middleware::tracing::request_id_middleware;
use std::future::IntoFuture;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub config: DunningConfig,
    pub engine: Arc<ReminderEngine>,
}

pub struct Application {
    port: u16,
    server: Box<dyn std::future::Future<Output = std::io::Result<()>> + Send + Unpin>,
    state: AppState,
}

impl Application {
    pub async fn build(config: DunningConfig) -> Result<Self, AppError> {
        let store = build_store(&config).await?;
        let sender = build_sender(&config)?;
        let engine = Arc::new(ReminderEngine::new(
            store,
            sender,
            config.reminder.clone(),
        ));

        let state = AppState {
            config: config.clone(),
            engine,
        };

        let app = Router::new()
            .route("/health", get(handlers::health_check))
            .route("/ready", get(handlers::readiness_check))
            .route("/metrics", get(handlers::metrics_endpoint))
            .route(
                "/invoices",
                put(handlers::upsert_invoices).get(handlers::list_invoices),
            )
            .route("/invoices/:invoice_id", get(handlers::get_invoice))
            .route("/dispatches", post(handlers::create_dispatch))
            .route("/payments", post(handlers::apply_payment))
            .route("/runs", post(handlers::run_once))
            .route("/runs/evaluate", post(handlers::evaluate_run))
            .route("/runs/:run_id", get(handlers::get_run))
            .route("/runs/:run_id/send", post(handlers::send_run))
            .layer(middleware::from_fn(request_id_middleware))
            .layer(TraceLayer::new_for_http())
            .with_state(state.clone());

        // Port 0 binds an ephemeral port, which the tests rely on.
        let addr = SocketAddr::from(([0, 0, 0, 0], config.common.port));
        let listener = TcpListener::bind(addr).await.map_err(|e| {
            tracing::error!("Failed to bind TCP listener to {}: {}", addr, e);
            AppError::from(e)
        })?;
        let port = listener.local_addr()?.port();

        tracing::info!("Listening on {}", port);

        let server = axum::serve(listener, app);

        Ok(Self {
            port,
            server: Box::new(server.into_future()),
            state,
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn engine(&self) -> &Arc<ReminderEngine> {
        &self.state.engine
    }

    pub async fn run_until_stopped(self) -> std::io::Result<()> {
        self.server.await
    }
}

async fn build_store(config: &DunningConfig) -> Result<Arc<dyn ReminderStore>, AppError> {
    match config.repository.backend {
        RepositoryBackend::Memory => {
            tracing::info!("Using in-memory repository backend");
            Ok(Arc::new(InMemoryStore::new()))
        }
        RepositoryBackend::Postgres => {
            let db = Database::new(
                &config.repository.url,
                config.repository.max_connections,
                config.repository.min_connections,
            )
            .await
            .map_err(|e| {
                tracing::error!("Failed to connect to PostgreSQL: {}", e);
                e
            })?;
            db.run_migrations().await?;
            Ok(Arc::new(db))
        }
    }
}

fn build_sender(config: &DunningConfig) -> Result<Arc<dyn Sender>, AppError> {
    let email: Arc<dyn Sender> = if config.smtp.enabled {
        tracing::info!("SMTP email provider initialized");
        Arc::new(SmtpSender::new(config.smtp.clone())?)
    } else {
        tracing::info!("SMTP provider disabled, using log sender for email");
        Arc::new(LogSender::new())
    };

    let sms: Arc<dyn Sender> = if config.sms.enabled {
        tracing::info!("HTTP SMS provider initialized");
        Arc::new(HttpSmsSender::new(config.sms.clone()))
    } else {
        tracing::info!("SMS provider disabled, using log sender for SMS");
        Arc::new(LogSender::new())
    };

    Ok(Arc::new(SenderRouter::new(email, sms)))
}
