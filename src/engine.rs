use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::FileExt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::header::{Header, HEADER_BYTES};
use crate::internal_events;
use crate::record::{self, Classification};
use crate::signal::Signal;
use crate::LogFn;

/// One append-only log file, with in-place tombstoning and scanner-based traversal.
///
/// An `Engine` owns exactly one of the three physical files the [`crate::Manager`] coordinates
/// (main, write-buffer, or compaction-scratch). Its lifecycle — `open`/`close`, re-openable in
/// place — is driven entirely by its owner; the engine itself never decides when it's done.
pub struct Engine {
    path: PathBuf,
    sync_interval: std::time::Duration,
    log_fn: LogFn,

    file: StdMutex<Option<Arc<File>>>,

    db_size: AtomicI64,
    token_position: AtomicI64,
    records_stored: AtomicI64,
    scanner_eof: AtomicBool,

    write_lock: AsyncMutex<()>,
    scan_lock: AsyncMutex<()>,

    signal: Signal,

    sync_stop: StdMutex<Option<CancellationToken>>,
    sync_task: StdMutex<Option<JoinHandle<()>>>,

    stream_spawned: StdMutex<bool>,
    stream_rx: AsyncMutex<Option<mpsc::Receiver<String>>>,
    stream_stop: StdMutex<Option<CancellationToken>>,
    stream_task: StdMutex<Option<JoinHandle<()>>>,
}

impl Engine {
    /// Creates an engine bound to `path`, without touching the filesystem yet. Call
    /// [`Engine::open`] to actually load (and create, if absent) the backing file.
    pub(crate) fn new(path: impl Into<PathBuf>, sync_interval_ms: u64, log_fn: LogFn) -> Arc<Self> {
        Arc::new(Self {
            path: path.into(),
            sync_interval: std::time::Duration::from_millis(sync_interval_ms),
            log_fn,
            file: StdMutex::new(None),
            db_size: AtomicI64::new(0),
            token_position: AtomicI64::new(HEADER_BYTES),
            records_stored: AtomicI64::new(0),
            scanner_eof: AtomicBool::new(false),
            write_lock: AsyncMutex::new(()),
            scan_lock: AsyncMutex::new(()),
            signal: Signal::new(),
            sync_stop: StdMutex::new(None),
            sync_task: StdMutex::new(None),
            stream_spawned: StdMutex::new(false),
            stream_rx: AsyncMutex::new(None),
            stream_stop: StdMutex::new(None),
            stream_task: StdMutex::new(None),
        })
    }

    fn display_path(&self) -> String {
        self.path.display().to_string()
    }

    fn current_file(&self) -> Result<Arc<File>> {
        self.file
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| Error::Io {
                source: io::Error::new(io::ErrorKind::NotConnected, "engine is not open"),
            })
    }

    /// Opens (creating if absent) the backing file, rebuilds or loads the header, and starts the
    /// periodic sync worker. Safe to call again on an engine that was previously [`Engine::close`]d
    /// — this is how compaction re-opens the renamed scratch file as the new main log.
    pub(crate) async fn open(self: &Arc<Self>) -> Result<()> {
        (self.log_fn)(&format!("{}: initializing database", self.display_path()));

        let std_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&self.path)?;
        let file = Arc::new(std_file);

        let stat_size = file.metadata()?.len() as i64;
        self.db_size.store(stat_size, Ordering::SeqCst);
        self.token_position.store(HEADER_BYTES, Ordering::SeqCst);
        self.scanner_eof.store(false, Ordering::SeqCst);
        *self.file.lock().unwrap() = Some(Arc::clone(&file));

        let header_result = {
            let f = Arc::clone(&file);
            tokio::task::spawn_blocking(move || Header::read(&f))
                .await
                .expect("blocking header read panicked")
        };

        match header_result {
            Ok(header) => {
                self.records_stored.store(header.records, Ordering::SeqCst);
            }
            Err(_) => {
                (self.log_fn)(&format!(
                    "{}: header missing or unreadable, rebuilding from a full scan",
                    self.display_path()
                ));
                self.count_records(&file, stat_size).await?;
            }
        }

        let header = Header {
            records: self.records_stored.load(Ordering::SeqCst),
            version: crate::header::CURRENT_VERSION.to_string(),
        };
        let f = Arc::clone(&file);
        tokio::task::spawn_blocking(move || header.write(&f))
            .await
            .expect("blocking header write panicked")?;

        if stat_size < HEADER_BYTES {
            self.db_size.store(HEADER_BYTES, Ordering::SeqCst);
        }

        internal_events::set_engine_gauges(
            &self.display_path(),
            self.records_stored.load(Ordering::SeqCst),
            self.db_size.load(Ordering::SeqCst),
        );

        self.spawn_sync_worker();

        Ok(())
    }

    /// Scans the body from `HEADER_BYTES` to the current `db_size`, counting every live frame.
    async fn count_records(&self, file: &Arc<File>, db_size: i64) -> Result<()> {
        let file = Arc::clone(file);
        let count = tokio::task::spawn_blocking(move || -> io::Result<i64> {
            let mut pos = HEADER_BYTES;
            let mut count = 0i64;
            while let Some((row, next_pos)) = read_line_at(&file, pos, db_size)? {
                if matches!(record::classify(&row), Classification::Live(_)) {
                    count += 1;
                }
                pos = next_pos;
            }
            Ok(count)
        })
        .await
        .expect("blocking scan panicked")?;

        self.records_stored.store(count, Ordering::SeqCst);
        Ok(())
    }

    fn spawn_sync_worker(self: &Arc<Self>) {
        let stop = CancellationToken::new();
        if let Some(previous) = self.sync_stop.lock().unwrap().replace(stop.clone()) {
            previous.cancel();
        }

        let engine = Arc::clone(self);
        let handle = tokio::spawn(async move { engine.sync_worker(stop).await });
        *self.sync_task.lock().unwrap() = Some(handle);
    }

    async fn sync_worker(self: Arc<Self>, stop: CancellationToken) {
        tracing::debug!(path = %self.display_path(), "starting sync worker");
        loop {
            tokio::select! {
                _ = stop.cancelled() => break,
                _ = async {
                    if let Err(e) = self.fsync().await {
                        (self.log_fn)(&format!("{}: sync error: {e}", self.display_path()));
                    }
                    tokio::time::sleep(self.sync_interval).await;
                } => {}
            }
        }
        tracing::debug!(path = %self.display_path(), "stopping sync worker");
    }

    async fn fsync(&self) -> Result<()> {
        let file = self.current_file()?;
        tokio::task::spawn_blocking(move || file.sync_all())
            .await
            .expect("blocking fsync panicked")
            .map_err(Error::from)
    }

    /// Idempotently spawns the background stream worker: a single task, shared by every
    /// consuming [`crate::Stream`] layered on top of this engine, that repeatedly calls
    /// `read(true)` and feeds payloads into a bounded channel, blocking on the new-data signal
    /// at end-of-stream. Calling this more than once is a no-op — the worker and its channel are
    /// created exactly once, on the first caller.
    pub(crate) fn ensure_stream_worker(self: &Arc<Self>) {
        let mut spawned = self.stream_spawned.lock().unwrap();
        if *spawned {
            return;
        }
        *spawned = true;

        // Capacity 1: at most one payload sits "already emitted" ahead of whichever Stream
        // consumer is currently draining it, bounding how much a closing Stream needs to
        // write back.
        let (tx, rx) = mpsc::channel(1);
        *self
            .stream_rx
            .try_lock()
            .expect("stream channel is only initialized once, uncontended, on first spawn") = Some(rx);

        let stop = CancellationToken::new();
        *self.stream_stop.lock().unwrap() = Some(stop.clone());

        let engine = Arc::clone(self);
        let handle = tokio::spawn(async move { engine.stream_worker(tx, stop).await });
        *self.stream_task.lock().unwrap() = Some(handle);
    }

    async fn stream_worker(self: Arc<Self>, tx: mpsc::Sender<String>, stop: CancellationToken) {
        tracing::debug!(path = %self.display_path(), "starting stream worker");
        loop {
            tokio::select! {
                _ = stop.cancelled() => break,
                result = self.read(true) => {
                    match result {
                        Ok(payload) => {
                            tokio::select! {
                                _ = stop.cancelled() => break,
                                send_result = tx.send(payload) => {
                                    if send_result.is_err() {
                                        break;
                                    }
                                }
                            }
                        }
                        Err(Error::Eof) => {
                            tokio::select! {
                                _ = stop.cancelled() => break,
                                _ = self.signal.wait() => {}
                            }
                        }
                        Err(e) => {
                            (self.log_fn)(&format!("{}: stream worker error: {e}", self.display_path()));
                            break;
                        }
                    }
                }
            }
        }
        tracing::debug!(path = %self.display_path(), "stopping stream worker");
    }

    /// Waits for the stream worker's next payload. Returns `None` once the worker has exited
    /// (engine closed, or an unrecoverable I/O error).
    pub(crate) async fn recv_stream_item(&self) -> Option<String> {
        let mut guard = self.stream_rx.lock().await;
        match guard.as_mut() {
            Some(rx) => rx.recv().await,
            None => None,
        }
    }

    /// Pulls out, without blocking, a payload the stream worker already placed in the channel
    /// but that no caller has claimed yet — used by [`crate::Stream::close`] so a closing
    /// consumer doesn't lose a record it will never process.
    pub(crate) async fn take_buffered_stream_item(&self) -> Option<String> {
        let mut guard = self.stream_rx.lock().await;
        match guard.as_mut() {
            Some(rx) => rx.try_recv().ok(),
            None => None,
        }
    }

    /// Scans forward from `token_position`, returning the next live record's payload-with-marker
    /// line and the byte offset it starts at, or `None` on exhaustion.
    ///
    /// This implements the scan contract of spec §4.2 using explicit positional reads instead of
    /// a buffered line scanner — the alternative the design notes call out, which needs no
    /// EOF-rewind dance because every call re-reads straight from disk instead of from a stale
    /// in-memory buffer.
    async fn seek_next_record(&self) -> Result<Option<(String, i64)>> {
        let _guard = self.scan_lock.lock().await;

        let file = self.current_file()?;
        let db_size = self.db_size.load(Ordering::SeqCst);
        let mut pos = self.token_position.load(Ordering::SeqCst);

        loop {
            let f = Arc::clone(&file);
            let read_pos = pos;
            let line = tokio::task::spawn_blocking(move || read_line_at(&f, read_pos, db_size))
                .await
                .expect("blocking scan panicked")?;

            match line {
                None => {
                    self.token_position.store(pos, Ordering::SeqCst);
                    return Ok(None);
                }
                Some((row, next_pos)) => {
                    if row.is_empty() {
                        if db_size > pos + 1 {
                            pos += 1;
                            continue;
                        }
                        pos = next_pos;
                        continue;
                    }

                    match record::classify(&row) {
                        Classification::Live(_) => {
                            self.token_position.store(pos, Ordering::SeqCst);
                            return Ok(Some((row, pos)));
                        }
                        Classification::Dead | Classification::Noise => {
                            pos = next_pos;
                            continue;
                        }
                    }
                }
            }
        }
    }

    /// Scans forward for the next live record, optionally tombstoning it, and advances
    /// `token_position` past it.
    ///
    /// `discard = false` advances the cursor without tombstoning, which leaves it sitting at EOF
    /// until something rewinds it — only [`crate::Manager`]'s compaction cycle relies on that,
    /// draining a file exactly once before it's closed and replaced.
    pub(crate) async fn read(&self, discard: bool) -> Result<String> {
        match self.seek_next_record().await? {
            None => {
                self.scanner_eof.store(true, Ordering::SeqCst);
                Err(Error::Eof)
            }
            Some((row, frame_pos)) => {
                if discard {
                    self.tombstone_at(frame_pos).await?;
                    self.records_stored.fetch_sub(1, Ordering::SeqCst);
                    internal_events::record_read(&self.display_path());
                    internal_events::set_engine_gauges(
                        &self.display_path(),
                        self.records_stored.load(Ordering::SeqCst),
                        self.db_size.load(Ordering::SeqCst),
                    );
                }

                self.token_position
                    .fetch_add(row.len() as i64 + 1, Ordering::SeqCst);

                if row.is_empty() {
                    Ok(String::new())
                } else {
                    Ok(row[1..].to_string())
                }
            }
        }
    }

    async fn tombstone_at(&self, offset: i64) -> Result<()> {
        let file = self.current_file()?;
        tokio::task::spawn_blocking(move || file.write_at(&[record::DEAD_MARKER], offset as u64))
            .await
            .expect("blocking tombstone write panicked")
            .map_err(Error::from)
    }

    /// Appends a live frame at the current end of the file and wakes anyone waiting on new data.
    pub(crate) async fn write(&self, payload: &str) -> Result<()> {
        let frame = record::encode_append(payload)?;

        let _guard = self.write_lock.lock().await;
        let file = self.current_file()?;
        let offset = self.db_size.load(Ordering::SeqCst);
        let written_len = frame.len() as i64;

        let f = Arc::clone(&file);
        tokio::task::spawn_blocking(move || f.write_at(&frame, offset as u64))
            .await
            .expect("blocking write panicked")?;

        self.db_size.fetch_add(written_len, Ordering::SeqCst);
        drop(_guard);

        self.records_stored.fetch_add(1, Ordering::SeqCst);
        self.signal.notify();

        internal_events::record_write(&self.display_path());
        internal_events::set_engine_gauges(
            &self.display_path(),
            self.records_stored.load(Ordering::SeqCst),
            self.db_size.load(Ordering::SeqCst),
        );

        Ok(())
    }

    /// Resets the file to empty, rewrites the header, and resets every counter.
    pub(crate) async fn truncate(&self) -> Result<()> {
        let _write_guard = self.write_lock.lock().await;
        let _scan_guard = self.scan_lock.lock().await;

        let file = self.current_file()?;
        let f = Arc::clone(&file);
        tokio::task::spawn_blocking(move || f.set_len(0))
            .await
            .expect("blocking truncate panicked")?;

        self.token_position.store(HEADER_BYTES, Ordering::SeqCst);
        self.records_stored.store(0, Ordering::SeqCst);
        self.scanner_eof.store(false, Ordering::SeqCst);

        let header = Header {
            records: 0,
            version: crate::header::CURRENT_VERSION.to_string(),
        };
        let f = Arc::clone(&file);
        tokio::task::spawn_blocking(move || header.write(&f))
            .await
            .expect("blocking header write panicked")?;

        // The header write itself re-extends the file to HEADER_BYTES, so that's the true size
        // afterward, not 0 — see DESIGN.md for why this deliberately diverges from the original.
        self.db_size.store(HEADER_BYTES, Ordering::SeqCst);

        internal_events::set_engine_gauges(&self.display_path(), 0, HEADER_BYTES);

        Ok(())
    }

    /// Current live-record count.
    pub(crate) fn length(&self) -> i64 {
        self.records_stored.load(Ordering::SeqCst)
    }

    /// Flushes the header, stops the sync and stream workers, syncs, and releases the file
    /// handle. Idempotent: closing an already-closed engine is a no-op.
    pub(crate) async fn close(&self) -> Result<()> {
        // The stream worker takes `scan_lock` itself (via `read`), so it must be stopped and
        // joined before we acquire that lock below — otherwise a worker parked mid-scan waiting
        // on the lock we're about to hold would deadlock against our own join.
        if let Some(stop) = self.stream_stop.lock().unwrap().take() {
            stop.cancel();
        }
        if let Some(handle) = self.stream_task.lock().unwrap().take() {
            let _ = handle.await;
        }
        *self.stream_rx.lock().await = None;
        *self.stream_spawned.lock().unwrap() = false;

        let _scan_guard = self.scan_lock.lock().await;

        let file = match self.file.lock().unwrap().clone() {
            Some(file) => file,
            None => return Ok(()),
        };

        let header = Header {
            records: self.records_stored.load(Ordering::SeqCst),
            version: crate::header::CURRENT_VERSION.to_string(),
        };
        let f = Arc::clone(&file);
        tokio::task::spawn_blocking(move || header.write(&f))
            .await
            .expect("blocking header write panicked")?;

        if let Some(stop) = self.sync_stop.lock().unwrap().take() {
            stop.cancel();
        }
        if let Some(handle) = self.sync_task.lock().unwrap().take() {
            let _ = handle.await;
        }

        let f = Arc::clone(&file);
        tokio::task::spawn_blocking(move || f.sync_all())
            .await
            .expect("blocking final sync panicked")?;

        *self.file.lock().unwrap() = None;
        Ok(())
    }
}

/// Reads forward from `pos` until a `\n` is found or `db_size` is reached, returning the line
/// with the newline stripped and the offset just past it. Returns `None` at exhaustion.
fn read_line_at(file: &File, mut pos: i64, db_size: i64) -> io::Result<Option<(String, i64)>> {
    const CHUNK: usize = 4096;

    if pos >= db_size {
        return Ok(None);
    }

    let mut buf = Vec::new();
    loop {
        let remaining = (db_size - pos) as usize;
        if remaining == 0 {
            return Ok(None);
        }

        let read_len = remaining.min(CHUNK);
        let mut chunk = vec![0u8; read_len];
        file.read_at(&mut chunk, pos as u64)?;

        if let Some(idx) = chunk.iter().position(|&b| b == b'\n') {
            buf.extend_from_slice(&chunk[..idx]);
            let next_pos = pos + idx as i64 + 1;
            return Ok(Some((String::from_utf8_lossy(&buf).into_owned(), next_pos)));
        }

        buf.extend_from_slice(&chunk);
        pos += read_len as i64;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn log_fn() -> LogFn {
        Arc::new(|_msg: &str| {})
    }

    #[tokio::test]
    async fn empty_db_reads_eof_and_has_zero_length() {
        let dir = tempfile::tempdir().unwrap();
        let engine = Engine::new(dir.path().join("db"), 100, log_fn());
        engine.open().await.unwrap();

        assert_eq!(engine.length(), 0);
        let err = engine.read(true).await.unwrap_err();
        assert!(err.is_eof());

        engine.close().await.unwrap();
    }

    #[tokio::test]
    async fn write_read_fifo_order() {
        let dir = tempfile::tempdir().unwrap();
        let engine = Engine::new(dir.path().join("db"), 100, log_fn());
        engine.open().await.unwrap();

        engine.write("x").await.unwrap();
        engine.write("y").await.unwrap();
        engine.write("z").await.unwrap();

        assert_eq!(engine.read(true).await.unwrap(), "x");
        assert_eq!(engine.read(true).await.unwrap(), "y");
        assert_eq!(engine.read(true).await.unwrap(), "z");
        assert!(engine.read(true).await.unwrap_err().is_eof());
        assert_eq!(engine.length(), 0);

        engine.close().await.unwrap();
    }

    #[tokio::test]
    async fn tombstone_format_matches_spec() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("db");
        let engine = Engine::new(&path, 100, log_fn());
        engine.open().await.unwrap();

        engine.write("abc").await.unwrap();
        engine.read(true).await.unwrap();
        engine.close().await.unwrap();

        let bytes = std::fs::read(&path).unwrap();
        assert_eq!(bytes[HEADER_BYTES as usize], record::DEAD_MARKER);
        assert_eq!(&bytes[HEADER_BYTES as usize + 1..HEADER_BYTES as usize + 4], b"abc");
        assert_eq!(bytes[HEADER_BYTES as usize + 4], b'\n');
    }

    #[tokio::test]
    async fn truncate_resets_size_and_count() {
        let dir = tempfile::tempdir().unwrap();
        let engine = Engine::new(dir.path().join("db"), 100, log_fn());
        engine.open().await.unwrap();

        engine.write("a").await.unwrap();
        engine.write("b").await.unwrap();
        engine.truncate().await.unwrap();

        assert_eq!(engine.db_size.load(Ordering::SeqCst), HEADER_BYTES);
        assert_eq!(engine.length(), 0);

        engine.close().await.unwrap();
    }

    #[tokio::test]
    async fn rejects_payload_with_newline() {
        let dir = tempfile::tempdir().unwrap();
        let engine = Engine::new(dir.path().join("db"), 100, log_fn());
        engine.open().await.unwrap();

        assert!(matches!(
            engine.write("a\nb").await,
            Err(Error::InvalidPayload)
        ));

        engine.close().await.unwrap();
    }

    #[tokio::test]
    async fn reopen_after_close_rebuilds_from_header() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("db");
        let engine = Engine::new(&path, 100, log_fn());
        engine.open().await.unwrap();
        engine.write("a").await.unwrap();
        engine.write("b").await.unwrap();
        engine.close().await.unwrap();

        engine.open().await.unwrap();
        assert_eq!(engine.length(), 2);
        assert_eq!(engine.read(true).await.unwrap(), "a");
        engine.close().await.unwrap();
    }
}
