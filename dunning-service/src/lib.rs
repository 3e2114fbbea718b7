//! dunning-service: invoice lifecycle tracking and reminder dispatch.

pub mod config;
pub mod handlers;
pub mod models;
pub mod services;
pub mod startup;
