use crate::AgentError;
use std::path::{Path, PathBuf};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer, Registry,
};

const CRATES: &[&str] = &["proxy_core", "proxy_gateway", "proxy_agent", "gatewatch"];

/// Where log records go, decided once at startup.
#[derive(Debug, Clone, Default)]
pub struct LoggingConfig {
    pub verbose: bool,
    pub json: bool,
    pub log_file: Option<PathBuf>,
    /// The console dashboard writes to stdout
    pub console_dashboard: bool,
}

impl LoggingConfig {
    /// Our crates log at `info` (`debug` when verbose). With the dashboard on
    /// screen and no log file, only warnings reach stderr.
    pub fn directives(&self) -> String {
        let level = if self.verbose {
            "debug"
        } else if self.console_dashboard && self.log_file.is_none() {
            "warn"
        } else {
            "info"
        };
        let mut directives = vec!["warn".to_string()];
        directives.extend(CRATES.iter().map(|c| format!("{}={}", c, level)));
        directives.join(",")
    }
}

/// Keeps the background file writer alive; dropping it flushes the log file.
#[must_use]
pub struct LogGuard {
    _worker: Option<WorkerGuard>,
}

/// Initialize the global subscriber. Safe to call more than once; later
/// calls leave the first subscriber in place.
pub fn init_logging(config: &LoggingConfig) -> Result<LogGuard, AgentError> {
    let filter = match std::env::var("RUST_LOG") {
        Ok(directives) if !directives.trim().is_empty() => EnvFilter::new(directives),
        _ => EnvFilter::new(config.directives()),
    };

    let (layer, worker) = match &config.log_file {
        Some(path) => {
            let appender = create_file_appender(path)?;
            let (writer, worker) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer().with_writer(writer).with_ansi(false);
            let layer: Box<dyn Layer<Registry> + Send + Sync> = if config.json {
                layer.json().with_filter(filter).boxed()
            } else {
                layer.with_target(true).with_filter(filter).boxed()
            };
            (layer, Some(worker))
        }
        None => {
            let layer = fmt::layer().with_writer(std::io::stderr);
            let layer: Box<dyn Layer<Registry> + Send + Sync> = if config.json {
                layer.json().with_filter(filter).boxed()
            } else {
                layer.with_target(true).with_filter(filter).boxed()
            };
            (layer, None)
        }
    };

    match tracing_subscriber::registry().with(layer).try_init() {
        Ok(_) => tracing::debug!("Logging initialized: {}", config.directives()),
        Err(_) => tracing::debug!("Logging already initialized, skipping"),
    }

    Ok(LogGuard { _worker: worker })
}

/// Daily-rotated appender for `path`, creating its directory.
fn create_file_appender(
    path: &Path,
) -> Result<tracing_appender::rolling::RollingFileAppender, AgentError> {
    use tracing_appender::rolling::{RollingFileAppender, Rotation};

    let directory = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
        _ => PathBuf::from("."),
    };
    let filename = path
        .file_name()
        .ok_or_else(|| AgentError::Logging(format!("invalid log file name: {}", path.display())))?;

    std::fs::create_dir_all(&directory)
        .map_err(|e| AgentError::Logging(format!("failed to create log directory: {}", e)))?;

    Ok(RollingFileAppender::new(Rotation::DAILY, directory, filename))
}
