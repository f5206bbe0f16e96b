//! ---
//! wm_section: "01-core-functionality"
//! wm_subsection: "module"
//! wm_type: "source"
//! wm_scope: "code"
//! wm_description: "Tracing subscriber setup for the publisher processes."
//! wm_version: "v0.1.0"
//! wm_owner: "tbd"
//! ---
use anyhow::Result;
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::daily;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::layer::{Layer, SubscriberExt};
use tracing_subscriber::util::SubscriberInitExt;

use crate::config::LoggingConfig;

const LOG_ENV: &str = "WATTMETER_LOG";
const DEFAULT_DIRECTIVE: &str = "info";

static INSTALLED: OnceCell<()> = OnceCell::new();

/// Available console log formats.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum LogFormat {
    StructuredJson,
    #[default]
    Pretty,
}

/// Flushes the non-blocking log writers when dropped. Hold it until the
/// last event has been emitted.
#[must_use = "dropping the guards stops the log writers"]
#[derive(Debug, Default)]
pub struct LogGuards {
    stdout: Option<WorkerGuard>,
    file: Option<WorkerGuard>,
}

impl LogGuards {
    /// True when this call did not install any writer.
    pub fn is_empty(&self) -> bool {
        self.stdout.is_none() && self.file.is_none()
    }
}

/// Initialize the tracing subscriber based on configuration and environment variables.
///
/// * `WATTMETER_LOG` overrides the filter (e.g. `debug`, `info,wattmeter_msg=trace`).
///   When unset `RUST_LOG` is honoured, finally defaulting to `info`.
/// * A daily rolling JSON file is only written when `logging.file` is set.
///
/// Only the first call installs a subscriber; later calls return empty guards.
pub fn init_tracing(service_name: &str, config: &LoggingConfig) -> Result<LogGuards> {
    if INSTALLED.get().is_some() {
        return Ok(LogGuards::default());
    }
    let (stdout_writer, stdout_guard) = tracing_appender::non_blocking(std::io::stdout());

    let fmt_layer = match config.format {
        LogFormat::StructuredJson => fmt::layer()
            .with_target(false)
            .with_timer(fmt::time::UtcTime::rfc_3339())
            .json()
            .with_writer(stdout_writer)
            .boxed(),
        LogFormat::Pretty => fmt::layer()
            .with_target(true)
            .with_timer(fmt::time::UtcTime::rfc_3339())
            .with_writer(stdout_writer)
            .boxed(),
    };

    let (file_layer, file_guard) = if config.file {
        std::fs::create_dir_all(&config.directory)?;
        let prefix = config
            .file_prefix
            .clone()
            .unwrap_or_else(|| service_name.to_owned());
        let file_appender = daily(&config.directory, format!("{}.log", prefix));
        let (file_writer, file_guard) = tracing_appender::non_blocking(file_appender);
        let layer = fmt::layer()
            .with_target(true)
            .with_timer(fmt::time::UtcTime::rfc_3339())
            .json()
            .with_writer(file_writer)
            .boxed();
        (Some(layer), Some(file_guard))
    } else {
        (None, None)
    };

    // Another subscriber may already be global (e.g. in tests); the new
    // writers are then unused and their guards are dropped here.
    if tracing_subscriber::registry()
        .with(env_filter())
        .with(fmt_layer)
        .with(file_layer)
        .try_init()
        .is_err()
    {
        return Ok(LogGuards::default());
    }
    let _ = INSTALLED.set(());

    info!(service = %service_name, format = ?config.format, file = config.file, "tracing initialised");
    Ok(LogGuards {
        stdout: Some(stdout_guard),
        file: file_guard,
    })
}

fn env_filter() -> EnvFilter {
    match std::env::var(LOG_ENV) {
        Ok(directive) => EnvFilter::try_new(directive).unwrap_or_else(|err| {
            eprintln!(
                "invalid {} directive ({}); defaulting to {}",
                LOG_ENV, err, DEFAULT_DIRECTIVE
            );
            EnvFilter::new(DEFAULT_DIRECTIVE)
        }),
        Err(_) => EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(DEFAULT_DIRECTIVE)),
    }
}
