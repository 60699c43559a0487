//! REST API server module.
//!
//! HTTP endpoints for submitting triggers, inspecting and controlling
//! executions, and streaming pipeline events.

pub mod error;
pub mod models;
pub mod routes;
pub mod server;

pub use server::{ApiServer, ApiServerConfig, AppState};
