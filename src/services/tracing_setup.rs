//! Tracing subscriber setup
//!
//! This module provides the tracing configuration used by the `rods-ls`
//! binary. Library code only emits events; installing a subscriber is left
//! to the application.

use std::fs::File;
use std::path::Path;
use std::sync::Arc;
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

/// Initialize the global tracing subscriber.
///
/// Events go to `log_file_path` when given, otherwise to stderr so they do
/// not mix with listings on stdout. Filtering follows RUST_LOG, falling back
/// to `default_level`.
///
/// Returns false if the log file could not be created or a global
/// subscriber was already installed.
pub fn init_global(log_file_path: Option<&Path>, default_level: tracing::Level) -> bool {
    let writer = match log_file_path {
        Some(path) => match File::create(path) {
            Ok(file) => BoxMakeWriter::new(Arc::new(file)),
            Err(_) => return false,
        },
        None => BoxMakeWriter::new(std::io::stderr),
    };

    build_subscriber(writer, default_level).try_init().is_ok()
}

/// Build a subscriber writing formatted events to `writer`.
///
/// This is the subscriber configuration shared between the binary and tests.
pub fn build_subscriber(
    writer: BoxMakeWriter,
    default_level: tracing::Level,
) -> impl tracing::Subscriber + Send + Sync {
    let env_filter = EnvFilter::builder()
        .with_default_directive(default_level.into())
        .from_env_lossy();

    let fmt_layer = fmt::layer().with_writer(writer).with_target(true);

    tracing_subscriber::registry().with(fmt_layer).with(env_filter)
}
