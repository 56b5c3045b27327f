use std::sync::Arc;

use tokio::sync::watch;

use crate::metrics;

/// Counts outstanding discovery / verification / refresh operations.
///
/// Observational only: nothing is gated on it. Operations are tracked with an
/// RAII [`PendingGuard`] so every exit path, including `?` and panics,
/// decrements the count.
#[derive(Debug)]
pub struct PendingOps {
    count: watch::Sender<usize>,
}

impl PendingOps {
    pub fn new() -> Arc<Self> {
        let (count, _) = watch::channel(0);
        Arc::new(Self { count })
    }

    pub fn begin(self: &Arc<Self>) -> PendingGuard {
        self.count.send_modify(|c| *c += 1);
        metrics::set_pending_operations(self.get() as f64);
        PendingGuard { ops: self.clone() }
    }

    pub fn get(&self) -> usize {
        *self.count.borrow()
    }

    /// Resolves once no operation is outstanding.
    pub async fn wait_idle(&self) {
        let mut rx = self.count.subscribe();
        // the sender lives in self, so the channel cannot close while we wait
        let _ = rx.wait_for(|c| *c == 0).await;
    }

    fn end(&self) {
        self.count.send_modify(|c| *c = c.saturating_sub(1));
        metrics::set_pending_operations(self.get() as f64);
    }
}

#[must_use = "the operation is counted only while the guard is alive"]
#[derive(Debug)]
pub struct PendingGuard {
    ops: Arc<PendingOps>,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        self.ops.end();
    }
}
