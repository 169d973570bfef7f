//! Tracing subscriber setup: stdout layer, optional rolling file layer, and
//! log retention for the file layer.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use tracing::metadata::LevelFilter;
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::layer::{Layer, SubscriberExt};
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Registry};

use crate::config::{FileLoggingConfig, LogFormat, LogRotation, LoggingConfig};
use crate::paths;

const LOG_FILE_PREFIX: &str = "rtxn.log";
const LOG_ENV_VAR: &str = "RTXN_LOG";

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

#[derive(Clone, Debug)]
pub struct TelemetryConfig {
    pub verbosity: u8,
    pub logging: LoggingConfig,
}

impl TelemetryConfig {
    pub fn new(verbosity: u8, logging: LoggingConfig) -> Self {
        Self { verbosity, logging }
    }
}

/// Keeps the non-blocking file writer flushing until dropped.
pub struct TelemetryGuard {
    _guards: Vec<tracing_appender::non_blocking::WorkerGuard>,
}

/// Installs the global subscriber. Fails if one is already set.
pub fn init(config: TelemetryConfig) -> Result<TelemetryGuard, tracing_subscriber::util::TryInitError> {
    let filter = build_filter(config.verbosity, config.logging.filter.as_deref());

    let mut guards = Vec::new();
    let mut layers: Vec<BoxedLayer> = Vec::new();

    if config.logging.stdout {
        layers.push(format_layer(
            config.logging.stdout_format,
            BoxMakeWriter::new(std::io::stderr),
            true,
        ));
    }

    let mut prune_report = None;
    let mut setup_error = None;
    if config.logging.file.enabled {
        let dir = resolve_log_dir(&config.logging.file);
        match fs::create_dir_all(&dir) {
            Ok(()) => {
                let retention = RetentionLimits::from_file_config(&config.logging.file);
                if retention.is_enabled() {
                    match prune_logs(&dir, LOG_FILE_PREFIX, retention, SystemTime::now()) {
                        Ok(report) => prune_report = Some(report),
                        Err(err) => setup_error = Some(format!("log retention failed: {err}")),
                    }
                }
                let appender = tracing_appender::rolling::RollingFileAppender::new(
                    rotation(config.logging.file.rotation),
                    &dir,
                    LOG_FILE_PREFIX,
                );
                let (writer, guard) = tracing_appender::non_blocking(appender);
                layers.push(format_layer(
                    config.logging.file.format,
                    BoxMakeWriter::new(writer),
                    false,
                ));
                guards.push(guard);
            }
            Err(err) => {
                setup_error = Some(format!("log dir init failed for {}: {err}", dir.display()));
            }
        }
    }

    layers.push(Box::new(filter));
    Registry::default().with(layers).try_init()?;

    if let Some(report) = prune_report {
        tracing::info!(
            pruned = report.removed,
            failed = report.failed,
            candidates = report.candidates,
            "log retention applied"
        );
    }
    if let Some(error) = setup_error {
        tracing::warn!("{error}");
    }

    Ok(TelemetryGuard { _guards: guards })
}

/// A configured filter wins over `RTXN_LOG`; otherwise verbosity sets the default level.
fn build_filter(verbosity: u8, configured: Option<&str>) -> EnvFilter {
    let builder = EnvFilter::builder().with_default_directive(level_from_verbosity(verbosity).into());
    match configured {
        Some(directives) => builder.parse_lossy(directives),
        None => builder.with_env_var(LOG_ENV_VAR).from_env_lossy(),
    }
}

fn format_layer(format: LogFormat, writer: BoxMakeWriter, ansi: bool) -> BoxedLayer {
    if format == LogFormat::Tree {
        return Box::new(
            tracing_tree::HierarchicalLayer::new(2)
                .with_ansi(ansi)
                .with_targets(true)
                .with_writer(writer),
        );
    }
    let fmt = tracing_subscriber::fmt::layer()
        .with_writer(writer)
        .with_ansi(ansi)
        .with_target(true)
        .with_thread_ids(true);
    match format {
        LogFormat::Pretty => Box::new(fmt.pretty()),
        LogFormat::Json => Box::new(fmt.json().with_current_span(true).with_span_list(true)),
        LogFormat::Compact | LogFormat::Tree => Box::new(fmt.compact()),
    }
}

fn rotation(rotation: LogRotation) -> tracing_appender::rolling::Rotation {
    match rotation {
        LogRotation::Daily => tracing_appender::rolling::Rotation::DAILY,
        LogRotation::Hourly => tracing_appender::rolling::Rotation::HOURLY,
        LogRotation::Minutely => tracing_appender::rolling::Rotation::MINUTELY,
        LogRotation::Never => tracing_appender::rolling::Rotation::NEVER,
    }
}

fn level_from_verbosity(verbosity: u8) -> LevelFilter {
    match verbosity {
        0 => LevelFilter::WARN,
        1 => LevelFilter::INFO,
        2 => LevelFilter::DEBUG,
        _ => LevelFilter::TRACE,
    }
}

fn resolve_log_dir(config: &FileLoggingConfig) -> PathBuf {
    config.dir.clone().unwrap_or_else(paths::log_dir)
}

#[derive(Clone, Copy, Debug, Default)]
struct RetentionLimits {
    max_age: Option<Duration>,
    max_files: Option<usize>,
}

impl RetentionLimits {
    fn from_file_config(config: &FileLoggingConfig) -> Self {
        Self {
            max_age: config
                .retention_max_age_days
                .map(|days| Duration::from_secs(days.saturating_mul(24 * 60 * 60))),
            max_files: config.retention_max_files,
        }
    }

    fn is_enabled(&self) -> bool {
        self.max_age.is_some() || self.max_files.is_some()
    }
}

#[derive(Clone, Debug)]
struct LogEntry {
    path: PathBuf,
    modified: SystemTime,
}

#[derive(Clone, Debug, Default)]
struct PruneReport {
    candidates: usize,
    removed: usize,
    failed: usize,
}

fn prune_logs(
    dir: &Path,
    prefix: &str,
    retention: RetentionLimits,
    now: SystemTime,
) -> std::io::Result<PruneReport> {
    let mut entries = collect_log_entries(dir, prefix, now)?;
    let mut report = PruneReport {
        candidates: entries.len(),
        ..PruneReport::default()
    };
    for path in select_expired(&mut entries, retention, now) {
        match fs::remove_file(&path) {
            Ok(()) => report.removed += 1,
            Err(_) => report.failed += 1,
        }
    }
    Ok(report)
}

fn collect_log_entries(dir: &Path, prefix: &str, now: SystemTime) -> std::io::Result<Vec<LogEntry>> {
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let mut entries = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        let matches_prefix = path
            .file_name()
            .and_then(|name| name.to_str())
            .is_some_and(|name| name.starts_with(prefix));
        if !matches_prefix {
            continue;
        }
        let meta = entry.metadata()?;
        if meta.is_file() {
            entries.push(LogEntry {
                path,
                modified: meta.modified().unwrap_or(now),
            });
        }
    }
    Ok(entries)
}

/// Removes expired entries from `entries` and returns their paths. Age is
/// applied first, then the newest `max_files` survivors are kept.
fn select_expired(
    entries: &mut Vec<LogEntry>,
    retention: RetentionLimits,
    now: SystemTime,
) -> Vec<PathBuf> {
    let mut expired = Vec::new();

    if let Some(max_age) = retention.max_age {
        let (old, keep): (Vec<_>, Vec<_>) = entries.drain(..).partition(|entry| {
            now.duration_since(entry.modified).unwrap_or(Duration::ZERO) > max_age
        });
        expired.extend(old.into_iter().map(|entry| entry.path));
        *entries = keep;
    }

    if let Some(max_files) = retention.max_files {
        entries.sort_by_key(|entry| entry.modified);
        let excess = entries.len().saturating_sub(max_files);
        expired.extend(entries.drain(..excess).map(|entry| entry.path));
    }

    expired
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(name: &str, age_secs: u64, now: SystemTime) -> LogEntry {
        LogEntry {
            path: PathBuf::from(name),
            modified: now - Duration::from_secs(age_secs),
        }
    }

    #[test]
    fn select_expired_respects_age_and_count() {
        let now = SystemTime::UNIX_EPOCH + Duration::from_secs(10_000);
        let mut entries = vec![
            entry("old.log", 9_000, now),
            entry("mid.log", 500, now),
            entry("new.log", 40, now),
            entry("newest.log", 5, now),
        ];
        let retention = RetentionLimits {
            max_age: Some(Duration::from_secs(1_000)),
            max_files: Some(2),
        };

        let expired = select_expired(&mut entries, retention, now);

        assert_eq!(expired, vec![PathBuf::from("old.log"), PathBuf::from("mid.log")]);
        let kept: Vec<_> = entries.iter().map(|e| e.path.clone()).collect();
        assert_eq!(kept, vec![PathBuf::from("new.log"), PathBuf::from("newest.log")]);
    }

    #[test]
    fn prune_logs_only_touches_prefixed_files() {
        let dir = tempfile::tempdir().expect("tempdir");
        for name in ["rtxn.log.1", "rtxn.log.2", "rtxn.log.3", "other.txt"] {
            fs::write(dir.path().join(name), b"x").unwrap();
        }
        let retention = RetentionLimits {
            max_age: None,
            max_files: Some(1),
        };

        let report = prune_logs(dir.path(), LOG_FILE_PREFIX, retention, SystemTime::now()).unwrap();

        assert_eq!(report.candidates, 3);
        assert_eq!(report.removed, 2);
        assert_eq!(report.failed, 0);
        assert!(dir.path().join("other.txt").exists());
        let remaining = fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with(LOG_FILE_PREFIX))
            .count();
        assert_eq!(remaining, 1);
    }

    #[test]
    fn missing_log_dir_prunes_nothing() {
        let dir = tempfile::tempdir().expect("tempdir");
        let report = prune_logs(
            &dir.path().join("absent"),
            LOG_FILE_PREFIX,
            RetentionLimits {
                max_age: Some(Duration::ZERO),
                max_files: Some(0),
            },
            SystemTime::now(),
        )
        .unwrap();
        assert_eq!(report.candidates, 0);
    }

    #[test]
    fn verbosity_maps_to_levels() {
        assert_eq!(level_from_verbosity(0), LevelFilter::WARN);
        assert_eq!(level_from_verbosity(1), LevelFilter::INFO);
        assert_eq!(level_from_verbosity(2), LevelFilter::DEBUG);
        assert_eq!(level_from_verbosity(7), LevelFilter::TRACE);
    }

    #[test]
    fn configured_filter_is_used() {
        let filter = build_filter(0, Some("rtxn=debug"));
        assert!(filter.to_string().contains("rtxn=debug"));
    }
}
