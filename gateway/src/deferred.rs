//! Per-request deferred-work tracking. Quota accounting that the client does
//! not need to wait on is spawned onto the runtime immediately but its
//! [`JoinHandle`] is kept so the dispatcher can await completion after the
//! response body has been fully written, instead of leaking detached tasks.

use std::future::Future;
use std::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::warn;

#[derive(Default)]
pub struct DeferredWork {
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl DeferredWork {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn spawn<F>(&self, fut: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(fut);
        self.handles.lock().unwrap().push(handle);
    }

    /// Awaits every task spawned so far, clearing the list. Safe to call more
    /// than once; a second call with nothing pending is a no-op.
    pub async fn join_all(&self) {
        let handles = std::mem::take(&mut *self.handles.lock().unwrap());
        for handle in handles {
            if let Err(err) = handle.await {
                warn!(?err, "deferred task panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn join_all_waits_for_spawned_work() {
        let deferred = DeferredWork::new();
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..3 {
            let counter = counter.clone();
            deferred.spawn(async move {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }
        deferred.join_all().await;
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn join_all_is_idempotent_when_nothing_pending() {
        let deferred = DeferredWork::new();
        deferred.join_all().await;
        deferred.join_all().await;
    }
}
