//! Repository layer for database access.
//!
//! Repositories hide the SQL behind traits so the pipeline components can be
//! exercised against any store implementation.

pub mod execution;

pub use execution::*;
