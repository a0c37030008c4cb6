use std::sync::Arc;

use tokio::sync::Mutex as AsyncMutex;

use crate::error::Result;
use crate::manager::Manager;

/// A consuming handle onto a manager's live record stream.
///
/// Backed by a background worker (owned by the main engine) that continuously drains live
/// records and feeds them to every open `Stream` on a first-come basis — the same
/// competing-consumers semantics the original tool's `ReadStream` channel had. Items pulled
/// out of the channel but never consumed, because `Stream` was dropped or explicitly closed,
/// are written back to the log so nothing is lost.
pub struct Stream {
    manager: Arc<Manager>,
    closed: AsyncMutex<bool>,
}

impl Stream {
    pub(crate) fn new(manager: Arc<Manager>) -> Self {
        Self {
            manager,
            closed: AsyncMutex::new(false),
        }
    }

    /// Waits for the next live record, consuming it permanently once returned.
    ///
    /// Returns `None` once the stream has been closed.
    pub async fn next(&self) -> Option<String> {
        if *self.closed.lock().await {
            return None;
        }
        self.manager.stream_next().await
    }

    /// Closes the stream. Idempotent — closing twice is a no-op.
    ///
    /// The background stream worker keeps running for as long as the main engine is open (it is
    /// shared by every `Stream` layered on top of it), but any record it had already pulled out
    /// of the log for this consumer and buffered in the channel — one at most, never handed to a
    /// caller via [`Stream::next`] — is written back to the main log, matching the original
    /// tool's drain-and-requeue close behavior.
    pub async fn close(&self) -> Result<()> {
        let mut closed = self.closed.lock().await;
        if *closed {
            return Ok(());
        }
        *closed = true;

        if let Some(payload) = self.manager.stream_take_buffered().await {
            self.manager.stream_writeback(&payload).await?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;

    #[tokio::test]
    async fn stream_yields_every_written_record_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let settings = Settings::new(
            dir.path().join("db"),
            dir.path().join("gc"),
            dir.path().join("wo"),
        );
        let manager = Manager::create(settings).await.unwrap();

        manager.write("one").await.unwrap();
        manager.write("two").await.unwrap();

        let stream = manager.read_stream().await;
        let first = stream.next().await.unwrap();
        let second = stream.next().await.unwrap();
        assert_eq!(first, "one");
        assert_eq!(second, "two");

        stream.close().await.unwrap();
        manager.close().await.unwrap();
    }

    #[tokio::test]
    async fn close_writes_back_a_buffered_but_unclaimed_record() {
        let dir = tempfile::tempdir().unwrap();
        let settings = Settings::new(
            dir.path().join("db"),
            dir.path().join("gc"),
            dir.path().join("wo"),
        );
        let manager = Manager::create(settings).await.unwrap();

        manager.write("buffered").await.unwrap();

        let stream = manager.read_stream().await;
        // Give the background stream worker a chance to pull the record into its one-slot
        // channel before anyone calls `next()` on it.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        stream.close().await.unwrap();

        assert_eq!(manager.read().await.unwrap(), "buffered");

        manager.close().await.unwrap();
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let settings = Settings::new(
            dir.path().join("db"),
            dir.path().join("gc"),
            dir.path().join("wo"),
        );
        let manager = Manager::create(settings).await.unwrap();

        let stream = manager.read_stream().await;
        stream.close().await.unwrap();
        stream.close().await.unwrap();

        manager.close().await.unwrap();
    }
}
