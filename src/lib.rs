//! PennyBot Backend Library
//!
//! Exposes the core modules for the server binary and integration tests.

pub mod analytics;
pub mod api;
pub mod auth;
pub mod categorize;
pub mod config;
pub mod error;
pub mod ingest;
pub mod llm;
pub mod middleware;
pub mod models;
pub mod rules;
pub mod splits;
pub mod store;

pub use api::{router, AppState};
pub use config::Config;
pub use error::{CoreError, CoreResult};
