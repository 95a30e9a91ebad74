use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Notify;

#[derive(Debug, Default)]
struct Flag {
    raised: AtomicBool,
    notify: Notify,
}

impl Flag {
    fn raise(&self) {
        self.raised.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    fn is_raised(&self) -> bool {
        self.raised.load(Ordering::SeqCst)
    }

    async fn wait(&self) {
        let notified = self.notify.notified();
        tokio::pin!(notified);
        // Register before checking so a raise in between is not lost.
        notified.as_mut().enable();
        if self.is_raised() {
            return;
        }
        notified.await;
    }
}

/// Token for signaling graceful shutdown to background tasks.
#[derive(Clone, Debug, Default)]
pub struct ShutdownToken {
    inner: Arc<Flag>,
}

impl ShutdownToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Signal cancellation.
    pub fn cancel(&self) {
        self.inner.raise();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.is_raised()
    }

    /// Wait until cancelled.
    pub async fn cancelled(&self) {
        self.inner.wait().await;
    }
}

/// Per-execution abort signal. Aborting ends the execution as ABORTED.
#[derive(Clone, Debug, Default)]
pub struct AbortToken {
    inner: Arc<Flag>,
}

impl AbortToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn abort(&self) {
        self.inner.raise();
    }

    pub fn is_aborted(&self) -> bool {
        self.inner.is_raised()
    }

    pub async fn aborted(&self) {
        self.inner.wait().await;
    }
}
