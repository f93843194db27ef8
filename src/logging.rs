//! # Structured Logging Module
//!
//! Environment-aware tracing setup for the resilience core. Host
//! applications embedding the crate can skip this and install their own
//! subscriber; `init_structured_logging` backs off if one exists.

use std::sync::OnceLock;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

static LOGGER_INITIALIZED: OnceLock<()> = OnceLock::new();

/// Initialize structured logging with environment-specific defaults.
/// Safe to call multiple times; only the first call does anything, and
/// an already-installed global subscriber is left in place.
pub fn init_structured_logging() {
    LOGGER_INITIALIZED.get_or_init(|| {
        let environment = get_environment();
        let filter = EnvFilter::try_from_env("ROOMBRIDGE_LOG")
            .unwrap_or_else(|_| EnvFilter::new(get_log_level(&environment)));
        // JSON in production, human-readable everywhere else
        let layer = if environment == "production" {
            fmt::layer()
                .with_target(true)
                .with_level(true)
                .with_ansi(false)
                .json()
                .with_filter(filter)
                .boxed()
        } else {
            fmt::layer()
                .with_target(true)
                .with_level(true)
                .with_filter(filter)
                .boxed()
        };
        let subscriber = tracing_subscriber::registry().with(layer);

        // Use try_init to avoid panic if a global subscriber already exists
        if subscriber.try_init().is_err() {
            tracing::debug!("global tracing subscriber already initialized");
        } else {
            tracing::info!(environment = %environment, "structured logging initialized");
        }
    });
}

/// Current environment from environment variables.
fn get_environment() -> String {
    std::env::var("ROOMBRIDGE_ENV")
        .or_else(|_| std::env::var("APP_ENV"))
        .unwrap_or_else(|_| "development".to_string())
}

/// Default log level for an environment, overridable via ROOMBRIDGE_LOG.
fn get_log_level(environment: &str) -> String {
    match environment {
        "production" => "info".to_string(),
        _ => "debug".to_string(),
    }
}
