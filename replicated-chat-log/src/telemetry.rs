//! Logging setup for the node binary.

use std::path::Path;

use anyhow::{Context, Result, anyhow};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, fmt};

/// Keeps the background log writer alive; logs written after it is dropped
/// may be lost.
pub struct TelemetryGuard {
    _guard: Option<WorkerGuard>,
}

/// Installs the global subscriber. `RUST_LOG` overrides the default `info`
/// filter. With `log_file` set, output goes to a daily-rotated file in that
/// file's directory instead of stderr.
pub fn init_tracing(log_file: Option<&Path>) -> Result<TelemetryGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let Some(log_file) = log_file else {
        fmt()
            .with_env_filter(filter)
            .with_target(false)
            .try_init()
            .map_err(|err| anyhow!("failed to install tracing subscriber: {err}"))?;
        return Ok(TelemetryGuard { _guard: None });
    };

    let dir = log_file
        .parent()
        .filter(|dir| !dir.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let prefix = log_file
        .file_name()
        .context("log_file must name a file")?;
    let appender = tracing_appender::rolling::daily(dir, prefix);
    let (writer, guard) = tracing_appender::non_blocking(appender);
    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_ansi(false)
        .with_writer(writer)
        .try_init()
        .map_err(|err| anyhow!("failed to install tracing subscriber: {err}"))?;

    Ok(TelemetryGuard {
        _guard: Some(guard),
    })
}
