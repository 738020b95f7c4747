use std::borrow::Cow;
use std::fs::OpenOptions;
use std::path::PathBuf;
use std::str::FromStr;

use anyhow::{bail, Context, Result};
use tracing::Level;
use tracing_subscriber::prelude::*;

const LOG_LEVEL_ENV_NAME: &str = "SPOCKER_LOG_LEVEL";
const LOG_FORMAT_TEXT: &str = "text";
const LOG_FORMAT_JSON: &str = "json";

/// If in debug mode, default level is debug to get maximum logging
#[cfg(debug_assertions)]
const DEFAULT_LOG_LEVEL: &str = "debug";

/// If not in debug mode, default level is warn to get important logs
#[cfg(not(debug_assertions))]
const DEFAULT_LOG_LEVEL: &str = "warn";

enum LogFormat {
    Text,
    Json,
}

fn detect_log_format(log_format: Option<&str>) -> Result<LogFormat> {
    match log_format {
        None | Some(LOG_FORMAT_TEXT) => Ok(LogFormat::Text),
        Some(LOG_FORMAT_JSON) => Ok(LogFormat::Json),
        Some(unknown) => bail!("unknown log format: {}", unknown),
    }
}

fn detect_log_level(is_debug: bool) -> Result<Level> {
    let filter: Cow<str> = if is_debug {
        "debug".into()
    } else if let Ok(level) = std::env::var(LOG_LEVEL_ENV_NAME) {
        level.into()
    } else {
        DEFAULT_LOG_LEVEL.into()
    };
    Ok(Level::from_str(filter.as_ref())?)
}

#[derive(Debug, Default)]
pub struct ObservabilityConfig {
    pub debug: bool,
    pub log_file: Option<PathBuf>,
    pub log_format: Option<String>,
}

impl From<&crate::GlobalOpts> for ObservabilityConfig {
    fn from(opts: &crate::GlobalOpts) -> Self {
        Self {
            debug: opts.debug,
            log_file: opts.log_file.to_owned(),
            log_format: opts.log_format.to_owned(),
        }
    }
}

/// Initializes the tracing subscriber. Diagnostics default to stderr; a log
/// file and json formatting are opt-in.
pub fn init<T>(config: T) -> Result<()>
where
    T: Into<ObservabilityConfig>,
{
    let config = config.into();
    let level =
        detect_log_level(config.debug).with_context(|| "failed to parse log level")?;
    let level_filter = tracing_subscriber::filter::LevelFilter::from(level);
    let format = detect_log_format(config.log_format.as_deref())
        .with_context(|| "failed to detect log format")?;
    let subscriber = tracing_subscriber::registry().with(level_filter);

    match (config.log_file.as_ref(), format) {
        (None, LogFormat::Text) => {
            subscriber
                .with(
                    tracing_subscriber::fmt::layer()
                        .without_time()
                        .with_writer(std::io::stderr),
                )
                .try_init()
                .map_err(|err| anyhow::anyhow!("failed to init logger: {}", err))?;
        }
        (None, LogFormat::Json) => {
            subscriber
                .with(
                    tracing_subscriber::fmt::layer()
                        .json()
                        .flatten_event(true)
                        .with_span_list(false)
                        .with_writer(std::io::stderr),
                )
                .try_init()
                .map_err(|err| anyhow::anyhow!("failed to init logger: {}", err))?;
        }
        (Some(path), LogFormat::Text) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| "failed to open log file")?;
            subscriber
                .with(tracing_subscriber::fmt::layer().with_writer(file))
                .try_init()
                .map_err(|err| anyhow::anyhow!("failed to init logger: {}", err))?;
        }
        (Some(path), LogFormat::Json) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| "failed to open log file")?;
            subscriber
                .with(
                    tracing_subscriber::fmt::layer()
                        .json()
                        .flatten_event(true)
                        .with_span_list(false)
                        .with_writer(file),
                )
                .try_init()
                .map_err(|err| anyhow::anyhow!("failed to init logger: {}", err))?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use libcontainer::test_utils::test_in_child_process;

    use super::*;

    #[test]
    fn test_detect_log_level_is_debug() {
        assert_eq!(detect_log_level(true).unwrap(), Level::DEBUG);
    }

    #[test]
    fn test_detect_log_level_default() {
        // Isolated in a child process because it clears the env.
        test_in_child_process(|| {
            std::env::remove_var(LOG_LEVEL_ENV_NAME);
            let level = detect_log_level(false).map_err(|err| err.to_string())?;
            let expected = if cfg!(debug_assertions) {
                Level::DEBUG
            } else {
                Level::WARN
            };
            if level != expected {
                return Err(format!("expected {expected}, got {level}"));
            }
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_detect_log_level_from_env() {
        test_in_child_process(|| {
            std::env::set_var(LOG_LEVEL_ENV_NAME, "error");
            let level = detect_log_level(false).map_err(|err| err.to_string())?;
            if level != Level::ERROR {
                return Err(format!("expected error level, got {level}"));
            }
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_detect_log_format_rejects_unknown() {
        assert!(detect_log_format(Some("yaml")).is_err());
        assert!(matches!(detect_log_format(None), Ok(LogFormat::Text)));
    }

    #[test]
    fn test_init_writes_to_log_file() {
        test_in_child_process(|| {
            let dir = tempfile::tempdir().map_err(|err| err.to_string())?;
            let log_file = dir.path().join("test.log");
            let config = ObservabilityConfig {
                log_file: Some(log_file.clone()),
                ..Default::default()
            };
            init(config).map_err(|err| err.to_string())?;

            tracing::warn!("logged line");
            let data = std::fs::read_to_string(&log_file).map_err(|err| err.to_string())?;
            if !data.contains("logged line") {
                return Err(format!("log file missing the line: {data:?}"));
            }
            Ok(())
        })
        .unwrap();
    }
}
