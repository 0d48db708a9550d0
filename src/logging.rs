use std::{
    fs,
    path::{Path, PathBuf},
    time::{Duration, SystemTime},
};

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use tracing_appender::{
    non_blocking::WorkerGuard,
    rolling::{self, RollingFileAppender},
};
use tracing_error::ErrorLayer;
use tracing_subscriber::{
    EnvFilter, Layer, filter::LevelFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt,
};
use uuid::Uuid;

const LOG_FILE_PREFIX: &str = "predictions.log";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LoggingRotation {
    Daily,
    Hourly,
}

/// `logging` section of the config file. Missing keys take the defaults below.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub dir: PathBuf,
    pub filter: String,
    pub rotation: LoggingRotation,
    pub retention_days: usize,
    pub stderr_warn_enabled: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("./logs"),
            filter: "info".to_string(),
            rotation: LoggingRotation::Daily,
            retention_days: 14,
            stderr_warn_enabled: true,
        }
    }
}

impl LoggingConfig {
    fn validate(&self) -> Result<()> {
        if self.filter.trim().is_empty() {
            return Err(anyhow!("logging.filter must name at least one directive"));
        }
        if self.dir.as_os_str().is_empty() {
            return Err(anyhow!("logging.dir must point at a directory"));
        }
        Ok(())
    }
}

/// Returned by [`init_tracing`]. Dropping it flushes and stops the
/// `predictions.log.*` writer, so `main` holds it until shutdown.
pub struct LoggingGuard {
    _worker_guard: WorkerGuard,
    run_id: String,
}

impl LoggingGuard {
    /// Identifier stamped on the `logging_initialized` event of this process.
    pub fn run_id(&self) -> &str {
        &self.run_id
    }
}

/// Routes store, order and http events into `predictions.log.<period>` JSON
/// files under `logging.dir`, and WARN and above to stderr when enabled.
///
/// Files past `retention_days` are purged first; purge problems are logged as
/// warnings once the subscriber is up rather than failing startup.
pub fn init_tracing(logging: &LoggingConfig) -> Result<LoggingGuard> {
    logging.validate()?;

    let log_dir = absolute_log_dir(&logging.dir)?;
    fs::create_dir_all(&log_dir)
        .with_context(|| format!("cannot create prediction log dir {}", log_dir.display()))?;
    let purge_warnings = purge_expired_logs(
        &log_dir,
        LOG_FILE_PREFIX,
        logging.retention_days,
        SystemTime::now(),
    );

    let (writer, worker_guard) =
        tracing_appender::non_blocking(rolling_appender(&log_dir, logging.rotation));
    let json_file = fmt::layer()
        .json()
        .with_timer(fmt::time::UtcTime::rfc_3339())
        .with_current_span(true)
        .with_span_list(true)
        .with_ansi(false)
        .with_writer(writer)
        .with_filter(env_filter(&logging.filter)?);
    let stderr_warnings = logging
        .stderr_warn_enabled
        .then(|| fmt::layer().with_writer(std::io::stderr).with_filter(LevelFilter::WARN));

    tracing_subscriber::registry()
        .with(ErrorLayer::default())
        .with(json_file)
        .with(stderr_warnings)
        .try_init()
        .context("a global tracing subscriber is already installed")?;

    let guard = LoggingGuard {
        _worker_guard: worker_guard,
        run_id: Uuid::now_v7().to_string(),
    };
    tracing::info!(
        target: "logging",
        run_id = %guard.run_id,
        dir = %log_dir.display(),
        filter = %logging.filter,
        rotation = ?logging.rotation,
        retention_days = logging.retention_days,
        "logging_initialized"
    );
    for warning in purge_warnings {
        tracing::warn!(target: "logging", warning = %warning, "expired_log_purge_failed");
    }

    Ok(guard)
}

fn env_filter(filter: &str) -> Result<EnvFilter> {
    EnvFilter::try_new(filter).with_context(|| format!("failed to parse logging.filter '{filter}'"))
}

fn rolling_appender(log_dir: &Path, rotation: LoggingRotation) -> RollingFileAppender {
    match rotation {
        LoggingRotation::Daily => rolling::daily(log_dir, LOG_FILE_PREFIX),
        LoggingRotation::Hourly => rolling::hourly(log_dir, LOG_FILE_PREFIX),
    }
}

fn absolute_log_dir(dir: &Path) -> Result<PathBuf> {
    if dir.is_absolute() {
        return Ok(dir.to_path_buf());
    }
    let cwd = std::env::current_dir().context("cannot resolve relative logging.dir")?;
    Ok(cwd.join(dir))
}

/// Deletes `prefix*` files last modified before `now - retention_days`.
/// Anything that could not be scanned or removed comes back as a message.
fn purge_expired_logs(
    log_dir: &Path,
    prefix: &str,
    retention_days: usize,
    now: SystemTime,
) -> Vec<String> {
    let retention = Duration::from_secs(retention_days.saturating_mul(24 * 60 * 60) as u64);
    let cutoff = now.checked_sub(retention).unwrap_or(SystemTime::UNIX_EPOCH);

    let entries = match fs::read_dir(log_dir) {
        Ok(entries) => entries,
        Err(err) => return vec![format!("failed to scan {}: {err}", log_dir.display())],
    };

    let mut warnings = Vec::new();
    for entry in entries {
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) => {
                warnings.push(format!("failed to read logging directory entry: {err}"));
                continue;
            }
        };
        if !entry.file_name().to_string_lossy().starts_with(prefix) {
            continue;
        }

        let path = entry.path();
        let modified = entry
            .metadata()
            .and_then(|metadata| {
                if metadata.is_file() {
                    metadata.modified().map(Some)
                } else {
                    Ok(None)
                }
            });
        match modified {
            Ok(Some(modified)) if modified <= cutoff => {
                if let Err(err) = fs::remove_file(&path) {
                    warnings.push(format!("failed to remove {}: {err}", path.display()));
                }
            }
            Ok(_) => {}
            Err(err) => warnings.push(format!("failed to stat {}: {err}", path.display())),
        }
    }

    warnings
}
