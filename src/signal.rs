use std::sync::Arc;

use tokio::sync::Notify;

/// One-slot, coalescing "new data may be available" notifier.
///
/// Multiple calls to [`Signal::notify`] before anyone waits collapse into a single wakeup —
/// there's no queueing, no backlog. `tokio::sync::Notify` already gives us exactly that
/// semantics (a permit is stored if nobody is waiting, and at most one is ever stored), so this
/// is a thin wrapper that just makes the intent explicit at call sites.
#[derive(Debug, Clone)]
pub(crate) struct Signal {
    inner: Arc<Notify>,
}

impl Signal {
    pub(crate) fn new() -> Self {
        Self {
            inner: Arc::new(Notify::new()),
        }
    }

    /// Wakes a single waiting consumer, or leaves a permit for the next one to call
    /// [`Signal::wait`] if nobody is currently waiting.
    pub(crate) fn notify(&self) {
        self.inner.notify_one();
    }

    /// Blocks until [`Signal::notify`] has been called at least once since the last time this
    /// resolved (or consumes a pending permit immediately).
    pub(crate) async fn wait(&self) {
        self.inner.notified().await;
    }
}
