//! Completion counter for requested runs

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::debug;

#[derive(Debug, Default)]
struct Inner {
    pending: AtomicUsize,
    notify: Notify,
}

/// Counts runs that were requested but have not finished yet
///
/// `add` before triggering a run, `done` when it completes, and `wait`
/// resolves once the count drops to zero. Clones share the same counter.
#[derive(Debug, Clone, Default)]
pub struct RunGroup {
    inner: Arc<Inner>,
}

impl RunGroup {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, n: usize) {
        self.inner.pending.fetch_add(n, Ordering::SeqCst);
    }

    /// Mark one run finished; extra calls at zero are ignored
    pub fn done(&self) {
        let previous = self
            .inner
            .pending
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));

        match previous {
            Ok(1) => self.inner.notify.notify_waiters(),
            Ok(_) => {}
            Err(_) => debug!("Run finished without a pending request"),
        }
    }

    pub fn pending(&self) -> usize {
        self.inner.pending.load(Ordering::SeqCst)
    }

    /// Wait until every added run is done
    pub async fn wait(&self) {
        loop {
            let notified = self.inner.notify.notified();
            if self.pending() == 0 {
                return;
            }
            notified.await;
        }
    }
}
