//! Structured logging with JSON/pretty output and file rotation

use std::io;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::{Layered, SubscriberExt},
    util::SubscriberInitExt,
    EnvFilter, Layer, Registry,
};

use crate::config::{FileLoggingConfig, LogFormat, LoggingConfig, RotationStrategy};
use crate::error::{ObservabilityError, Result};

type FilteredRegistry = Layered<EnvFilter, Registry>;
type BoxedLayer = Box<dyn Layer<FilteredRegistry> + Send + Sync>;

/// Guard that must be held to keep the async file writer running
pub struct LogGuard {
    _guard: Option<WorkerGuard>,
}

impl LogGuard {
    fn new(guard: Option<WorkerGuard>) -> Self {
        Self { _guard: guard }
    }
}

/// Initialize logging with the given configuration
///
/// `RUST_LOG` takes precedence over the configured level and directives.
/// Returns a guard that must be held for the lifetime of the application
/// to ensure logs are flushed properly.
pub fn init_logging(config: &LoggingConfig) -> Result<LogGuard> {
    let env_filter = build_env_filter(config);

    let mut layers: Vec<BoxedLayer> = vec![console_layer(config)];

    let guard = match &config.file {
        Some(file_config) => {
            let (writer, guard) = create_file_writer(file_config)?;
            layers.push(
                fmt::layer()
                    .with_writer(writer)
                    .with_target(config.include_target)
                    .with_file(config.include_location)
                    .with_line_number(config.include_location)
                    .with_span_events(FmtSpan::CLOSE)
                    .with_ansi(false)
                    .json()
                    .boxed(),
            );
            Some(guard)
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(layers)
        .try_init()
        .map_err(|e| ObservabilityError::LoggingInit(e.to_string()))?;

    Ok(LogGuard::new(guard))
}

fn build_env_filter(config: &LoggingConfig) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        match config.filter_directives.as_deref() {
            Some(directives) => {
                EnvFilter::new(format!("{},{}", config.level.as_str(), directives))
            }
            None => EnvFilter::new(config.level.as_str()),
        }
    })
}

fn console_layer(config: &LoggingConfig) -> BoxedLayer {
    let layer = fmt::layer()
        .with_writer(io::stderr)
        .with_target(config.include_target)
        .with_file(config.include_location)
        .with_line_number(config.include_location);

    match config.format {
        LogFormat::Pretty => layer.pretty().boxed(),
        LogFormat::Json => layer.json().boxed(),
        LogFormat::Compact => layer.compact().boxed(),
    }
}

fn create_file_writer(
    config: &FileLoggingConfig,
) -> Result<(tracing_appender::non_blocking::NonBlocking, WorkerGuard)> {
    std::fs::create_dir_all(&config.directory)?;

    let file_appender = match config.rotation {
        RotationStrategy::Daily => {
            tracing_appender::rolling::daily(&config.directory, &config.prefix)
        }
        RotationStrategy::Hourly => {
            tracing_appender::rolling::hourly(&config.directory, &config.prefix)
        }
        RotationStrategy::Never => {
            tracing_appender::rolling::never(&config.directory, &config.prefix)
        }
    };

    Ok(tracing_appender::non_blocking(file_appender))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LogLevel;

    #[test]
    fn test_log_guard_creation() {
        let guard = LogGuard::new(None);
        assert!(guard._guard.is_none());
    }

    #[test]
    fn test_env_filter_uses_directives() {
        if std::env::var_os("RUST_LOG").is_some() {
            return;
        }
        let config = LoggingConfig {
            level: LogLevel::Warn,
            filter_directives: Some("awg_protocol=debug".to_string()),
            ..Default::default()
        };
        let filter = build_env_filter(&config).to_string();
        assert!(filter.contains("warn"));
        assert!(filter.contains("awg_protocol=debug"));
    }

    #[test]
    fn test_file_writer_creates_directory_and_file() {
        use std::io::Write;

        let dir = tempfile::tempdir().unwrap();
        let directory = dir.path().join("logs");
        let config = FileLoggingConfig {
            directory: directory.clone(),
            prefix: "awg-test.log".to_string(),
            rotation: RotationStrategy::Never,
        };

        let (mut writer, guard) = create_file_writer(&config).unwrap();
        writer.write_all(b"{\"message\":\"hello\"}\n").unwrap();
        drop(guard);

        let content = std::fs::read_to_string(directory.join("awg-test.log")).unwrap();
        assert_eq!(content, "{\"message\":\"hello\"}\n");
    }

    #[test]
    fn test_file_writer_reports_unusable_directory() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("not-a-dir");
        std::fs::write(&blocker, "").unwrap();
        let config = FileLoggingConfig {
            directory: blocker.join("logs"),
            prefix: "awg".to_string(),
            rotation: RotationStrategy::Daily,
        };
        assert!(create_file_writer(&config).is_err());
    }
}
