//! Tracing initialization.
//!
//! Engine internals log through `tracing`; user-facing run output flows
//! through the event bus and its file sinks instead. The filter honors
//! `RUST_LOG` when set, falling back to the configured level.

use crate::config::LogLevel;

pub fn init(level: LogLevel) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level.as_filter()));
    // try_init: tests may install their own subscriber first.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .compact()
        .try_init();
}
