//! A durable, single-node record queue.
//!
//! Records are opaque UTF-8 strings appended to the tail of a log file. Reading a record
//! deletes it: there is no random access, no indexing, and no concept of re-reading something
//! already consumed. A background worker periodically compacts tombstoned space back out of
//! the file so a long-running queue doesn't grow without bound.
//!
//! ```no_run
//! # async fn run() -> chanlog::Result<()> {
//! use chanlog::{Manager, Settings};
//!
//! let settings = Settings::new("queue.db", "queue.db.gc", "queue.db.wo");
//! let manager = Manager::create(settings).await?;
//!
//! manager.write("hello").await?;
//! let record = manager.read().await?;
//! assert_eq!(record, "hello");
//!
//! manager.close().await?;
//! # Ok(())
//! # }
//! ```

#![deny(clippy::all)]
#![allow(clippy::module_name_repetitions)]

#[macro_use]
extern crate tracing;

use std::sync::Arc;

mod config;
mod engine;
mod error;
mod header;
mod internal_events;
mod manager;
mod record;
mod signal;
mod stream;

pub use config::Settings;
pub use error::{Error, Result};
pub use header::HEADER_BYTES;
pub use manager::{Manager, Queue};
pub use stream::Stream;

/// A diagnostic callback, invoked with human-readable progress and error messages from
/// background workers. Analogous to the original tool's `LogFunction` setting; there is no
/// default sink beyond whatever the caller installs via [`Settings::with_log_fn`].
pub type LogFn = Arc<dyn Fn(&str) + Send + Sync>;
