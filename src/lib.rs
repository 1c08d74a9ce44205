//! Queue-backed image classification.
//!
//! A gateway bridges synchronous HTTP callers to an asynchronous worker
//! fleet over a request and a response queue, and an autoscaler sizes the
//! fleet from the request-queue backlog.

pub mod app_state;
pub mod config;
pub mod models;
pub mod routes;
pub mod services;

/// Install the JSON log subscriber shared by all binaries.
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();
}
