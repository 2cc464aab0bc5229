//! HTTP layer for the name resolution cache.
//!
//! Serves cached records, evaluation status, the admin trigger, health and
//! metrics over axum.

pub mod handler;

pub use handler::{create_router, AppError};
