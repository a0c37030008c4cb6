use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::Settings;
use crate::engine::Engine;
use crate::error::{Error, Result};
use crate::internal_events;
use crate::stream::Stream;

const NORMAL: u8 = 0;
const GC: u8 = 1;

/// A durable, append-only record queue: writes go to the tail, reads consume (delete) the
/// oldest live record, and a background worker periodically compacts tombstoned space out of
/// the file.
///
/// This is the object-safe slice of the capability set every caller programs against — construct
/// a concrete queue with [`Manager::create`] and share it behind an `Arc` (it already is one), or
/// substitute an in-memory double for it in tests. `read_stream` is deliberately left off this
/// trait: it returns a concrete [`Stream`] constructed from `Arc<Manager>` itself (so it can hand
/// the stream a strong reference back to the manager for write-back-on-close), which isn't
/// something a `dyn Queue` trait object can express generically. Callers that need streaming
/// reads program against `Manager` directly.
#[async_trait::async_trait]
pub trait Queue: Send + Sync {
    /// Appends `payload` to the tail of the log.
    async fn write(&self, payload: &str) -> Result<()>;

    /// Consumes and returns the oldest live record, or [`Error::Eof`] if none is available.
    async fn read(&self) -> Result<String>;

    /// Number of live (unconsumed) records.
    async fn length(&self) -> i64;

    /// Empties the queue entirely.
    async fn truncate(&self) -> Result<()>;

    /// Stops background workers and releases every underlying file handle.
    async fn close(&self) -> Result<()>;
}

/// Which file writes currently land in and which file the compaction worker is rewriting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    /// Writes go to the main log; reads are served from it directly.
    Normal,
    /// Compaction is in progress: writes are diverted to the write-buffer file while the main
    /// log is being rewritten from its gc-scratch copy.
    Gc,
}

impl From<Mode> for u8 {
    fn from(mode: Mode) -> Self {
        match mode {
            Mode::Normal => NORMAL,
            Mode::Gc => GC,
        }
    }
}

impl From<u8> for Mode {
    fn from(value: u8) -> Self {
        match value {
            GC => Mode::Gc,
            _ => Mode::Normal,
        }
    }
}

/// Coordinates three [`Engine`] instances (main log, write-buffer, gc-scratch) through a
/// compaction state machine, the way the original tool's `manager` type coordinated
/// `mainDB`/`writeDB`/`gcDB`.
pub struct Manager {
    main: Arc<Engine>,
    write_buffer: Arc<Engine>,
    db_path: std::path::PathBuf,
    gc_scratch_path: std::path::PathBuf,
    sync_interval_ms: u64,

    mode: AtomicU8,

    read_lock: AsyncMutex<()>,
    write_lock: AsyncMutex<()>,

    gc_interval: Duration,
    log_fn: crate::LogFn,

    gc_stop: StdMutex<Option<CancellationToken>>,
    gc_task: StdMutex<Option<JoinHandle<()>>>,
}

impl Manager {
    /// Validates `settings`, opens the main log and write-buffer files, and starts the
    /// background sync and compaction workers.
    pub async fn create(settings: Settings) -> Result<Arc<Self>> {
        settings.validate()?;

        let main = Engine::new(
            settings.db_file.clone(),
            settings.sync_interval_ms,
            Arc::clone(&settings.log_fn),
        );
        let write_buffer = Engine::new(
            settings.write_only_file.clone(),
            settings.sync_interval_ms,
            Arc::clone(&settings.log_fn),
        );

        main.open().await?;
        write_buffer.open().await?;

        let manager = Arc::new(Self {
            main,
            write_buffer,
            db_path: settings.db_file.clone(),
            gc_scratch_path: settings.gc_file.clone(),
            sync_interval_ms: settings.sync_interval_ms,
            mode: AtomicU8::new(NORMAL),
            read_lock: AsyncMutex::new(()),
            write_lock: AsyncMutex::new(()),
            gc_interval: Duration::from_secs(settings.gc_interval_seconds),
            log_fn: Arc::clone(&settings.log_fn),
            gc_stop: StdMutex::new(None),
            gc_task: StdMutex::new(None),
        });

        manager.spawn_gc_worker();

        Ok(manager)
    }

    fn mode(&self) -> Mode {
        Mode::from(self.mode.load(Ordering::SeqCst))
    }

    fn spawn_gc_worker(self: &Arc<Self>) {
        let stop = CancellationToken::new();
        *self.gc_stop.lock().unwrap() = Some(stop.clone());

        let manager = Arc::clone(self);
        let handle = tokio::spawn(async move { manager.gc_worker(stop).await });
        *self.gc_task.lock().unwrap() = Some(handle);
    }

    async fn gc_worker(self: Arc<Self>, stop: CancellationToken) {
        tracing::debug!("starting compaction worker");
        loop {
            tokio::select! {
                _ = stop.cancelled() => break,
                _ = tokio::time::sleep(self.gc_interval) => {
                    if let Err(e) = self.compact().await {
                        (self.log_fn)(&format!("compaction cycle failed: {e}"));
                    }
                }
            }
        }
        tracing::debug!("stopping compaction worker");
    }

    /// Runs one compaction cycle: copies every live record out of the main log into a fresh
    /// scratch file, atomically swaps the scratch file in as the new main log, then drains
    /// whatever accumulated in the write-buffer file while the swap was in progress.
    ///
    /// Grounded directly on the original tool's GC cycle: `switchToGCMode` → copy live records
    /// → rename scratch over main → `switchToNormalMode` → drain the write buffer.
    async fn compact(&self) -> Result<()> {
        let _read_guard = self.read_lock.lock().await;

        let gc_scratch = Engine::new(
            self.gc_scratch_path.clone(),
            self.sync_interval_ms,
            Arc::clone(&self.log_fn),
        );
        gc_scratch.open().await?;
        gc_scratch.truncate().await?;

        {
            let _write_guard = self.write_lock.lock().await;
            self.mode.store(GC, Ordering::SeqCst);
        }

        loop {
            match self.main.read(false).await {
                Ok(payload) => gc_scratch.write(&payload).await?,
                Err(Error::Eof) => break,
                Err(e) => return Err(e),
            }
        }

        self.main.close().await?;
        gc_scratch.close().await?;

        tokio::fs::rename(&self.gc_scratch_path, &self.db_path)
            .await
            .map_err(Error::from)?;

        self.main.open().await?;

        {
            let _write_guard = self.write_lock.lock().await;
            self.mode.store(NORMAL, Ordering::SeqCst);
        }

        drop(_read_guard);

        self.drain_write_buffer().await?;

        internal_events::record_compaction_cycle();
        Ok(())
    }

    /// Moves every record accumulated in the write-buffer file, while compaction was running,
    /// back onto the now-current main log, then empties the write buffer.
    async fn drain_write_buffer(&self) -> Result<()> {
        loop {
            match self.write_buffer.read(false).await {
                Ok(payload) => self.main.write(&payload).await?,
                Err(Error::Eof) => break,
                Err(e) => return Err(e),
            }
        }
        self.write_buffer.truncate().await
    }

    /// Appends `payload` to the tail of the log.
    pub async fn write(&self, payload: &str) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        match self.mode() {
            Mode::Normal => self.main.write(payload).await,
            Mode::Gc => self.write_buffer.write(payload).await,
        }
    }

    /// Consumes and returns the oldest live record, or [`Error::Eof`] if none is available.
    pub async fn read(&self) -> Result<String> {
        let _guard = self.read_lock.lock().await;
        self.main.read(true).await
    }

    /// Number of live (unconsumed) records across the main log and, during compaction, the
    /// write-buffer file.
    pub async fn length(&self) -> i64 {
        match self.mode() {
            Mode::Normal => self.main.length(),
            Mode::Gc => self.main.length() + self.write_buffer.length(),
        }
    }

    /// Empties the queue entirely: both the main log and the write buffer.
    pub async fn truncate(&self) -> Result<()> {
        let _read_guard = self.read_lock.lock().await;
        let _write_guard = self.write_lock.lock().await;

        Error::aggregate([self.main.truncate().await, self.write_buffer.truncate().await])
    }

    /// Opens a new consuming [`Stream`] onto this manager's live records. The first call across
    /// the manager's lifetime lazily spawns the shared stream worker on the main engine; later
    /// calls reuse it.
    pub async fn read_stream(self: &Arc<Self>) -> Stream {
        self.main.ensure_stream_worker();
        Stream::new(Arc::clone(self))
    }

    /// Pulls the next payload off the main engine's shared stream worker.
    pub(crate) async fn stream_next(&self) -> Option<String> {
        self.main.recv_stream_item().await
    }

    /// Non-blocking: takes back whatever payload the stream worker already pulled out of the
    /// log but that no [`Stream`] consumer has claimed yet.
    pub(crate) async fn stream_take_buffered(&self) -> Option<String> {
        self.main.take_buffered_stream_item().await
    }

    /// Writes a payload back onto the main log — used to restore a record a closing [`Stream`]
    /// pulled out of the channel but never handed to a caller.
    pub(crate) async fn stream_writeback(&self, payload: &str) -> Result<()> {
        self.main.write(payload).await
    }

    /// Waits for any in-flight compaction cycle to finish, stops the compaction worker, then
    /// closes both engines.
    pub async fn close(&self) -> Result<()> {
        while self.mode() == Mode::Gc {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        if let Some(stop) = self.gc_stop.lock().unwrap().take() {
            stop.cancel();
        }
        if let Some(handle) = self.gc_task.lock().unwrap().take() {
            let _ = handle.await;
        }

        Error::aggregate([self.main.close().await, self.write_buffer.close().await])
    }
}

#[async_trait::async_trait]
impl Queue for Manager {
    async fn write(&self, payload: &str) -> Result<()> {
        Manager::write(self, payload).await
    }

    async fn read(&self) -> Result<String> {
        Manager::read(self).await
    }

    async fn length(&self) -> i64 {
        Manager::length(self).await
    }

    async fn truncate(&self) -> Result<()> {
        Manager::truncate(self).await
    }

    async fn close(&self) -> Result<()> {
        Manager::close(self).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(dir: &tempfile::TempDir) -> Settings {
        Settings::new(
            dir.path().join("db"),
            dir.path().join("gc"),
            dir.path().join("wo"),
        )
        .with_gc_interval_seconds(10)
    }

    #[tokio::test]
    async fn write_then_read_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let manager = Manager::create(settings(&dir)).await.unwrap();

        manager.write("hello").await.unwrap();
        assert_eq!(manager.length().await, 1);
        assert_eq!(manager.read().await.unwrap(), "hello");
        assert!(manager.read().await.unwrap_err().is_eof());

        manager.close().await.unwrap();
    }

    #[tokio::test]
    async fn truncate_empties_both_files() {
        let dir = tempfile::tempdir().unwrap();
        let manager = Manager::create(settings(&dir)).await.unwrap();

        manager.write("a").await.unwrap();
        manager.write("b").await.unwrap();
        manager.truncate().await.unwrap();

        assert_eq!(manager.length().await, 0);
        assert!(manager.read().await.unwrap_err().is_eof());

        manager.close().await.unwrap();
    }

    #[tokio::test]
    async fn compaction_reclaims_tombstoned_space_and_preserves_order() {
        let dir = tempfile::tempdir().unwrap();
        let manager = Manager::create(settings(&dir)).await.unwrap();

        for i in 0..1000 {
            manager.write(&format!("{i:09}")).await.unwrap();
        }
        for _ in 0..500 {
            manager.read().await.unwrap();
        }

        manager.compact().await.unwrap();

        assert_eq!(manager.length().await, 500);
        for i in 500..1000 {
            assert_eq!(manager.read().await.unwrap(), format!("{i:09}"));
        }
        assert!(manager.read().await.unwrap_err().is_eof());

        manager.close().await.unwrap();
    }

    #[tokio::test]
    async fn rejects_invalid_settings() {
        let dir = tempfile::tempdir().unwrap();
        let bad = Settings::new(dir.path().join("same"), dir.path().join("same"), dir.path().join("wo"));
        assert!(Manager::create(bad).await.is_err());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn writes_during_compaction_land_after_the_survivors() {
        let dir = tempfile::tempdir().unwrap();
        let manager = Manager::create(settings(&dir)).await.unwrap();

        for i in 0..200 {
            manager.write(&format!("base-{i:04}")).await.unwrap();
        }
        for _ in 0..150 {
            manager.read().await.unwrap();
        }

        let compacting = Arc::clone(&manager);
        let compaction = tokio::spawn(async move { compacting.compact().await });

        for i in 0..10 {
            manager.write(&format!("gc-w{i}")).await.unwrap();
        }

        compaction.await.unwrap().unwrap();

        let mut drained = Vec::new();
        while let Ok(payload) = manager.read().await {
            drained.push(payload);
        }

        assert_eq!(drained.len(), 50 + 10);
        for i in 0..50 {
            assert_eq!(drained[i], format!("base-{:04}", 150 + i));
        }
        for i in 0..10 {
            assert_eq!(drained[50 + i], format!("gc-w{i}"));
        }

        manager.close().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn concurrent_consumers_see_every_record_exactly_once() {
        const RECORDS: usize = 2_000;
        const CONSUMERS: usize = 40;

        let dir = tempfile::tempdir().unwrap();
        let manager = Manager::create(settings(&dir)).await.unwrap();

        for i in 0..RECORDS {
            manager.write(&format!("rec-{i:06}")).await.unwrap();
        }

        let mut handles = Vec::with_capacity(CONSUMERS);
        for _ in 0..CONSUMERS {
            let manager = Arc::clone(&manager);
            handles.push(tokio::spawn(async move {
                let mut seen = Vec::new();
                loop {
                    match manager.read().await {
                        Ok(payload) => seen.push(payload),
                        Err(e) if e.is_eof() => break,
                        Err(e) => panic!("unexpected error: {e}"),
                    }
                }
                seen
            }));
        }

        let mut all = Vec::with_capacity(RECORDS);
        for handle in handles {
            all.extend(handle.await.unwrap());
        }

        assert_eq!(all.len(), RECORDS);
        let unique: std::collections::HashSet<_> = all.iter().cloned().collect();
        assert_eq!(unique.len(), RECORDS);

        manager.close().await.unwrap();
    }
}
