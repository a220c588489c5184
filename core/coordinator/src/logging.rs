//! Tracing setup for the coordinator binary.

use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

use crate::config::LoggingConfig;

const LOG_ENV: &str = "TANDEM_LOG";
const LOG_FILE_PREFIX: &str = "tandem-coordinator.log";

/// Keeps the non-blocking file writer alive; dropping it flushes the file.
pub struct LoggingGuard {
    _file: Option<WorkerGuard>,
}

/// Picks the filter directive. An explicit `--level` wins over `TANDEM_LOG`,
/// which wins over `RUST_LOG`, which wins over the config file.
fn filter_directive(
    cli_level: Option<&str>,
    tandem_log: Option<String>,
    rust_log: Option<String>,
    configured: &str,
) -> String {
    [cli_level.map(str::to_string), tandem_log, rust_log]
        .into_iter()
        .flatten()
        .find(|directive| !directive.trim().is_empty())
        .unwrap_or_else(|| configured.to_string())
}

pub fn init(
    config: &LoggingConfig,
    cli_level: Option<&str>,
    log_dir: Option<&Path>,
) -> LoggingGuard {
    let directive = filter_directive(
        cli_level,
        std::env::var(LOG_ENV).ok(),
        std::env::var(EnvFilter::DEFAULT_ENV).ok(),
        &config.level,
    );
    let filter = EnvFilter::try_new(&directive).unwrap_or_else(|err| {
        eprintln!(
            "tandem-coordinator: invalid log filter {:?} ({}); using info",
            directive, err
        );
        EnvFilter::new("info")
    });

    let (file_layer, guard) = match log_dir {
        Some(dir) if config.file => {
            let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_thread_names(true);
            (Some(layer), Some(guard))
        }
        _ => (None, None),
    };

    let result = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false))
        .with(file_layer)
        .try_init();
    if let Err(err) = result {
        eprintln!("tandem-coordinator: logging already initialized: {}", err);
    }

    LoggingGuard { _file: guard }
}
