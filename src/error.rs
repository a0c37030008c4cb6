use std::io;

use snafu::Snafu;

/// Errors surfaced by the record store's public API.
///
/// `Eof` is not a failure in the usual sense — it is how [`crate::Manager::read`] and
/// [`crate::Engine::read`] report "no live record available right now" — but it is still
/// routed through `Result` so callers can't forget to check for it.
#[derive(Debug, Snafu)]
pub enum Error {
    /// No live record was available to read.
    #[snafu(display("no record available"))]
    Eof,

    /// The configuration given to [`crate::Manager::create`] was invalid.
    #[snafu(display("invalid config: {reason}"))]
    InvalidConfig {
        /// Human-readable reason the configuration was rejected.
        reason: String,
    },

    /// An I/O error occurred against a log file.
    #[snafu(display("I/O error: {source}"))]
    Io {
        /// The underlying I/O error.
        source: io::Error,
    },

    /// `close` was called before the manager finished initializing.
    #[snafu(display("database is not running"))]
    NotRunning,

    /// A payload contained a byte that would corrupt the frame encoding.
    #[snafu(display("payload must not contain a newline byte"))]
    InvalidPayload,

    /// Multiple operations failed; carries every underlying error.
    ///
    /// Renders the way the original tool joined per-engine close/truncate errors: a single
    /// semicolon-separated message, so downstream log parsing doesn't need to change.
    #[snafu(display("{}", join_errors(errors)))]
    Multiple {
        /// The errors that occurred, in the order they were observed.
        errors: Vec<Error>,
    },
}

fn join_errors(errors: &[Error]) -> String {
    errors
        .iter()
        .map(|e| format!("{e}; "))
        .collect::<String>()
}

impl Error {
    /// Collapses a list of fallible results into a single [`Error::Multiple`], or `Ok(())` if
    /// every result succeeded. Mirrors the original's `joinErrors` helper used by
    /// `Manager::close` and `Manager::truncate`.
    pub(crate) fn aggregate(results: impl IntoIterator<Item = Result<(), Error>>) -> Result<(), Error> {
        let errors: Vec<Error> = results.into_iter().filter_map(Result::err).collect();
        if errors.is_empty() {
            Ok(())
        } else {
            Err(Error::Multiple { errors })
        }
    }

    /// `true` if this is the EOF marker, not a genuine failure.
    pub fn is_eof(&self) -> bool {
        matches!(self, Error::Eof)
    }
}

impl From<io::Error> for Error {
    fn from(source: io::Error) -> Self {
        Error::Io { source }
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;
