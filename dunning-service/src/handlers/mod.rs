//! HTTP handlers for dunning-service.

pub mod health;
pub mod invoices;
pub mod runs;

pub use health::{health_check, metrics_endpoint, readiness_check};
pub use invoices::{apply_payment, create_dispatch, get_invoice, list_invoices, upsert_invoices};
pub use runs::{evaluate_run, get_run, run_once, send_run};
