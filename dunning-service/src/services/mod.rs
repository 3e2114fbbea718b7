pub mod database;
pub mod delivery;
pub mod eligibility;
pub mod engine;
pub mod idempotency;
pub mod memory;
pub mod metrics;
pub mod planner;
pub mod providers;
pub mod repository;

pub use database::Database;
pub use engine::ReminderEngine;
pub use memory::InMemoryStore;
pub use metrics::{get_metrics, init_metrics};
pub use repository::ReminderStore;
