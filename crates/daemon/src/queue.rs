//! FIFO hand-off between job producers and workers.

use crate::job::JobRequest;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};

/// Shared job queue.
///
/// Enqueueing never blocks. Dequeueing waits at most the given timeout so
/// workers can notice a shutdown request between polls. Watchers and manual
/// submissions share one ordering.
#[derive(Clone)]
pub struct JobQueue {
    tx: mpsc::UnboundedSender<JobRequest>,
    rx: Arc<Mutex<mpsc::UnboundedReceiver<JobRequest>>>,
    depth: Arc<AtomicUsize>,
}

impl JobQueue {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: Arc::new(Mutex::new(rx)),
            depth: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Append a request to the back of the queue.
    pub fn enqueue(&self, request: JobRequest) {
        self.depth.fetch_add(1, Ordering::SeqCst);
        // The queue owns its receiver, so the channel cannot be closed here
        if self.tx.send(request).is_err() {
            self.depth.fetch_sub(1, Ordering::SeqCst);
        }
    }

    /// Take the oldest request, waiting up to `wait` for one to arrive.
    pub async fn dequeue(&self, wait: Duration) -> Option<JobRequest> {
        let received = tokio::time::timeout(wait, async {
            let mut rx = self.rx.lock().await;
            rx.recv().await
        })
        .await;

        match received {
            Ok(Some(request)) => {
                self.depth.fetch_sub(1, Ordering::SeqCst);
                Some(request)
            }
            _ => None,
        }
    }

    /// Requests currently waiting.
    pub fn len(&self) -> usize {
        self.depth.load(Ordering::SeqCst)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for JobQueue {
    fn default() -> Self {
        Self::new()
    }
}
