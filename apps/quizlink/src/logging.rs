use clap::ValueEnum;
use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::OnceLock;
use tracing::level_filters::LevelFilter;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

#[derive(Clone, Copy, Debug, Default, ValueEnum, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Error,
    #[default]
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub fn to_filter(self) -> LevelFilter {
        match self {
            LogLevel::Error => LevelFilter::ERROR,
            LogLevel::Warn => LevelFilter::WARN,
            LogLevel::Info => LevelFilter::INFO,
            LogLevel::Debug => LevelFilter::DEBUG,
            LogLevel::Trace => LevelFilter::TRACE,
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct LogConfig {
    pub level: LogLevel,
    pub file: Option<PathBuf>,
}

#[derive(thiserror::Error, Debug)]
pub enum InitError {
    #[error("failed to open log file {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to configure logger: {0}")]
    Configure(String),
}

// Keeps the non-blocking writer flushing until exit.
static GUARD: OnceLock<WorkerGuard> = OnceLock::new();

pub fn init(config: &LogConfig) -> Result<(), InitError> {
    if GUARD.get().is_some() {
        return Ok(());
    }

    let (env_filter, throttled_deps) = build_env_filter(config.level.to_filter());

    let (writer, guard) = match &config.file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|source| InitError::Io {
                    path: path.clone(),
                    source,
                })?;
            tracing_appender::non_blocking(file)
        }
        None => tracing_appender::non_blocking(std::io::stderr()),
    };

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(config.level >= LogLevel::Debug)
        .with_thread_names(config.level >= LogLevel::Trace)
        .with_ansi(config.file.is_none())
        .with_writer(writer)
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .map_err(|err| InitError::Configure(err.to_string()))?;

    let _ = GUARD.set(guard);
    if throttled_deps {
        eprintln!(
            "[quizlink] suppressing dependency trace noise; set QUIZLINK_TRACE_DEPS=1 or QUIZLINK_LOG_FILTER to override"
        );
    }
    Ok(())
}

fn build_env_filter(level: LevelFilter) -> (EnvFilter, bool) {
    if let Ok(filter) = std::env::var("QUIZLINK_LOG_FILTER") {
        return (EnvFilter::new(filter), false);
    }
    let allow_deps = std::env::var("QUIZLINK_TRACE_DEPS")
        .map(|value| value != "0" && !value.is_empty())
        .unwrap_or(false);
    let (filter, throttled) = default_filter_for(level, allow_deps);
    (EnvFilter::new(filter), throttled)
}

const NOISY_DEPENDENCIES: &[&str] = &[
    "webrtc",
    "webrtc_ice",
    "webrtc_sctp",
    "webrtc_dtls",
    "webrtc_mdns",
    "hyper",
    "reqwest",
    "rustls",
    "h2",
];

fn default_filter_for(level: LevelFilter, allow_deps: bool) -> (String, bool) {
    let base = match level {
        LevelFilter::TRACE => "info,quiz_link=trace,quizlink=trace",
        LevelFilter::DEBUG => "info,quiz_link=debug,quizlink=debug",
        LevelFilter::INFO => "info",
        LevelFilter::WARN => "warn",
        LevelFilter::ERROR => "error",
        LevelFilter::OFF => "off",
    };
    if level < LevelFilter::DEBUG || allow_deps {
        return (base.to_owned(), false);
    }
    let mut filter = base.to_owned();
    for target in NOISY_DEPENDENCIES {
        filter.push(',');
        filter.push_str(target);
        filter.push_str("=warn");
    }
    (filter, true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quiet_levels_leave_dependencies_alone() {
        let (filter, throttled) = default_filter_for(LevelFilter::WARN, false);
        assert_eq!(filter, "warn");
        assert!(!throttled);
    }

    #[test]
    fn verbose_levels_throttle_dependencies() {
        let (filter, throttled) = default_filter_for(LevelFilter::TRACE, false);
        assert!(throttled);
        assert!(filter.starts_with("info,quiz_link=trace"));
        assert!(filter.contains("webrtc_ice=warn"));

        let (filter, throttled) = default_filter_for(LevelFilter::DEBUG, true);
        assert!(!throttled);
        assert!(!filter.contains("webrtc"));
    }
}
