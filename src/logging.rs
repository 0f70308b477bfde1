use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Once;
use std::time::Duration;
use tokio::time;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::config::LoggingConfig;
use crate::error::RosterError;

static INIT: Once = Once::new();
const LOG_ROTATION_INTERVAL: Duration = Duration::from_secs(86400); // 24 hours
const LOG_PREFIX: &str = "roster";

fn filter(level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level))
}

/// Install the global subscriber. Later calls are no-ops.
pub fn init(config: &LoggingConfig) -> Result<(), RosterError> {
    let mut result = Ok(());
    INIT.call_once(|| {
        result = install(config);
    });
    result
}

fn install(config: &LoggingConfig) -> Result<(), RosterError> {
    let console = config.console.then(|| {
        fmt::Layer::new()
            .with_writer(std::io::stderr)
            .with_thread_ids(true)
            .with_target(true)
            .with_ansi(true)
            .with_filter(filter(&config.level))
    });

    let file = match &config.dir {
        Some(log_dir) => {
            fs::create_dir_all(log_dir)
                .map_err(|e| RosterError::Io(format!("Failed to create log directory: {}", e)))?;

            // Daily rotation, JSON lines
            let file_appender = tracing_appender::rolling::RollingFileAppender::builder()
                .rotation(tracing_appender::rolling::Rotation::DAILY)
                .filename_prefix(LOG_PREFIX)
                .filename_suffix("log")
                .build(log_dir)
                .map_err(|e| RosterError::Io(format!("Failed to create file appender: {}", e)))?;

            Some(
                fmt::Layer::new()
                    .json()
                    .with_writer(file_appender)
                    .with_file(true)
                    .with_line_number(true)
                    .with_thread_ids(true)
                    .with_target(true)
                    .with_ansi(false)
                    .with_filter(filter(&config.level)),
            )
        }
        None => None,
    };

    let subscriber = tracing_subscriber::registry().with(console).with(file);
    tracing::subscriber::set_global_default(subscriber)
        .map_err(|e| RosterError::Config(format!("Failed to set tracing subscriber: {}", e)))?;

    if let Some(log_dir) = &config.dir {
        cleanup_old_logs(log_dir, config.max_files);
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let log_dir = log_dir.clone();
            let max_files = config.max_files;
            handle.spawn(async move {
                let mut interval = time::interval(LOG_ROTATION_INTERVAL);
                loop {
                    interval.tick().await;
                    cleanup_old_logs(&log_dir, max_files);
                }
            });
        }
    }
    Ok(())
}

/// Delete all but the newest `max_files` log files in `log_dir`
pub fn cleanup_old_logs(log_dir: &Path, max_files: usize) -> Vec<PathBuf> {
    let mut removed = Vec::new();
    let Ok(entries) = fs::read_dir(log_dir) else {
        return removed;
    };

    let mut log_files: Vec<_> = entries
        .filter_map(|entry| entry.ok())
        .filter(|entry| {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            name.starts_with(LOG_PREFIX) && name.ends_with(".log")
        })
        .collect();

    // Sort by modification time (newest first)
    log_files.sort_by_key(|entry| {
        std::cmp::Reverse(
            entry
                .metadata()
                .ok()
                .and_then(|m| m.modified().ok())
                .unwrap_or(std::time::SystemTime::UNIX_EPOCH),
        )
    });

    for old_file in log_files.iter().skip(max_files) {
        if fs::remove_file(old_file.path()).is_ok() {
            removed.push(old_file.path());
        }
    }
    removed
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cleanup_keeps_newest() {
        let dir = tempfile::tempdir().unwrap();
        for day in 1..=4 {
            let path = dir.path().join(format!("roster.2024-01-0{}.log", day));
            fs::write(&path, "{}").unwrap();
            let mtime = std::time::SystemTime::UNIX_EPOCH + Duration::from_secs(day * 86400);
            fs::File::options()
                .write(true)
                .open(&path)
                .unwrap()
                .set_modified(mtime)
                .unwrap();
        }
        fs::write(dir.path().join("other.txt"), "x").unwrap();

        let removed = cleanup_old_logs(dir.path(), 2);
        assert_eq!(removed.len(), 2);
        assert!(dir.path().join("roster.2024-01-04.log").exists());
        assert!(dir.path().join("roster.2024-01-03.log").exists());
        assert!(!dir.path().join("roster.2024-01-01.log").exists());
        assert!(dir.path().join("other.txt").exists());
    }
}
