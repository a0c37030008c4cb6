use std::path::PathBuf;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::LogFn;

/// Minimum sync interval accepted; anything configured lower is clamped up to this.
pub const MIN_SYNC_INTERVAL_MS: u64 = 100;

/// Minimum compaction interval accepted; anything configured lower is clamped up to this.
pub const MIN_GC_INTERVAL_SECONDS: u64 = 10;

/// Configuration for a [`crate::Manager`].
///
/// Mirrors the original tool's `Settings` struct: three file paths (the live log, its
/// compaction scratch file, and its write-buffer file) plus the two background-worker
/// intervals and an optional diagnostic log hook. Construct with [`Settings::new`] and
/// override fields with the builder methods before passing to [`crate::Manager::create`].
#[derive(Clone)]
pub struct Settings {
    pub(crate) db_file: PathBuf,
    pub(crate) gc_file: PathBuf,
    pub(crate) write_only_file: PathBuf,
    pub(crate) sync_interval_ms: u64,
    pub(crate) gc_interval_seconds: u64,
    pub(crate) log_fn: LogFn,
}

impl Settings {
    /// Creates settings for the three required file paths, with default intervals and a
    /// no-op log function.
    pub fn new(
        db_file: impl Into<PathBuf>,
        gc_file: impl Into<PathBuf>,
        write_only_file: impl Into<PathBuf>,
    ) -> Self {
        Self {
            db_file: db_file.into(),
            gc_file: gc_file.into(),
            write_only_file: write_only_file.into(),
            sync_interval_ms: MIN_SYNC_INTERVAL_MS,
            gc_interval_seconds: MIN_GC_INTERVAL_SECONDS,
            log_fn: Arc::new(|_msg: &str| {}),
        }
    }

    /// Sets how often each engine's sync worker calls `fsync`. Values below
    /// [`MIN_SYNC_INTERVAL_MS`] are clamped up rather than rejected, matching the
    /// original tool's behavior.
    pub fn with_sync_interval_ms(mut self, millis: u64) -> Self {
        self.sync_interval_ms = millis.max(MIN_SYNC_INTERVAL_MS);
        self
    }

    /// Sets how often the compaction worker checks whether it's time to run. Values below
    /// [`MIN_GC_INTERVAL_SECONDS`] are clamped up rather than rejected.
    pub fn with_gc_interval_seconds(mut self, seconds: u64) -> Self {
        self.gc_interval_seconds = seconds.max(MIN_GC_INTERVAL_SECONDS);
        self
    }

    /// Installs a diagnostic callback invoked with human-readable progress and error
    /// messages, the way the original tool's `LogFunction` hook worked.
    pub fn with_log_fn(mut self, log_fn: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.log_fn = Arc::new(log_fn);
        self
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.db_file.as_os_str().is_empty() {
            return Err(Error::InvalidConfig {
                reason: "db_file must not be empty".to_string(),
            });
        }
        if self.gc_file.as_os_str().is_empty() {
            return Err(Error::InvalidConfig {
                reason: "gc_file must not be empty".to_string(),
            });
        }
        if self.write_only_file.as_os_str().is_empty() {
            return Err(Error::InvalidConfig {
                reason: "write_only_file must not be empty".to_string(),
            });
        }
        if self.db_file == self.gc_file
            || self.db_file == self.write_only_file
            || self.gc_file == self.write_only_file
        {
            return Err(Error::InvalidConfig {
                reason: "db_file, gc_file and write_only_file must be distinct paths".to_string(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clamps_intervals_below_the_minimum_instead_of_rejecting() {
        let settings = Settings::new("a", "b", "c")
            .with_sync_interval_ms(1)
            .with_gc_interval_seconds(1);

        assert_eq!(settings.sync_interval_ms, MIN_SYNC_INTERVAL_MS);
        assert_eq!(settings.gc_interval_seconds, MIN_GC_INTERVAL_SECONDS);
    }

    #[test]
    fn leaves_above_minimum_intervals_untouched() {
        let settings = Settings::new("a", "b", "c")
            .with_sync_interval_ms(5_000)
            .with_gc_interval_seconds(600);

        assert_eq!(settings.sync_interval_ms, 5_000);
        assert_eq!(settings.gc_interval_seconds, 600);
    }

    #[test]
    fn rejects_duplicate_paths() {
        let settings = Settings::new("same", "same", "other");
        assert!(settings.validate().is_err());
    }

    #[test]
    fn accepts_distinct_paths() {
        let settings = Settings::new("a", "b", "c");
        assert!(settings.validate().is_ok());
    }
}
