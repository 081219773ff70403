//! # Bounded Selector
//!
//! Fan-out coordinator enforcing a maximum-in-flight cap over child jobs.
//! Children spawned past the cap queue FIFO behind a semaphore; `wait`
//! joins every spawned child and reports the first error observed
//! (completion order, tie-broken by enqueue order).
//!
//! Cancellation is the caller's concern: child futures built on a child
//! [`crate::context::FlowContext`] observe their token and settle with a
//! cancellation error, which `wait` then reports like any other failure.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::{FlowError, Result};

struct Completion {
    seq: u64,
    enqueue_index: usize,
    error: Option<FlowError>,
}

/// Bounded fan-out over child jobs.
pub struct BoundSelector {
    name: String,
    semaphore: Arc<Semaphore>,
    handles: Vec<JoinHandle<()>>,
    completions: Arc<Mutex<Vec<Completion>>>,
    seq: Arc<AtomicU64>,
    in_flight: Arc<AtomicUsize>,
    next_index: usize,
}

impl BoundSelector {
    /// Create a selector running at most `limit` children concurrently.
    pub fn new(name: impl Into<String>, limit: usize) -> Self {
        Self {
            name: name.into(),
            semaphore: Arc::new(Semaphore::new(limit.max(1))),
            handles: Vec::new(),
            completions: Arc::new(Mutex::new(Vec::new())),
            seq: Arc::new(AtomicU64::new(0)),
            in_flight: Arc::new(AtomicUsize::new(0)),
            next_index: 0,
        }
    }

    /// Enqueue a child job. Starts immediately if a slot is free, otherwise
    /// queues FIFO behind earlier children.
    pub fn spawn_child<F>(&mut self, fut: F)
    where
        F: std::future::Future<Output = Result<()>> + Send + 'static,
    {
        let enqueue_index = self.next_index;
        self.next_index += 1;

        let semaphore = self.semaphore.clone();
        let completions = self.completions.clone();
        let seq = self.seq.clone();
        let in_flight = self.in_flight.clone();

        let handle = tokio::spawn(async move {
            let Ok(_permit) = semaphore.acquire_owned().await else {
                completions.lock().await.push(Completion {
                    seq: seq.fetch_add(1, Ordering::SeqCst),
                    enqueue_index,
                    error: Some(FlowError::non_retryable("selector semaphore closed")),
                });
                return;
            };

            in_flight.fetch_add(1, Ordering::SeqCst);
            let result = fut.await;
            in_flight.fetch_sub(1, Ordering::SeqCst);

            completions.lock().await.push(Completion {
                seq: seq.fetch_add(1, Ordering::SeqCst),
                enqueue_index,
                error: result.err(),
            });
        });
        self.handles.push(handle);
    }

    /// Number of children currently executing (excludes queued ones).
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Number of children spawned so far.
    pub fn spawned(&self) -> usize {
        self.next_index
    }

    /// Wait for every spawned child, then report the first observed error.
    pub async fn wait(&mut self) -> Result<()> {
        let total = self.handles.len();
        debug!(selector = %self.name, children = total, "waiting for children");

        for (enqueue_index, handle) in self.handles.drain(..).enumerate() {
            if let Err(join_err) = handle.await {
                warn!(selector = %self.name, enqueue_index, "child task panicked: {join_err}");
                self.completions.lock().await.push(Completion {
                    seq: self.seq.fetch_add(1, Ordering::SeqCst),
                    enqueue_index,
                    error: Some(FlowError::non_retryable(format!(
                        "child task panicked: {join_err}"
                    ))),
                });
            }
        }

        let mut completions = self.completions.lock().await;
        completions.sort_by_key(|c| (c.seq, c.enqueue_index));
        let first_error = completions
            .iter_mut()
            .find_map(|c| c.error.take());
        completions.clear();

        match first_error {
            Some(err) => {
                warn!(selector = %self.name, children = total, "child failed: {err}");
                Err(err)
            }
            None => {
                debug!(selector = %self.name, children = total, "all children completed");
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::sleep;

    #[tokio::test]
    async fn test_all_children_complete() {
        let completed = Arc::new(AtomicUsize::new(0));
        let mut selector = BoundSelector::new("test", 4);

        for _ in 0..10 {
            let completed = completed.clone();
            selector.spawn_child(async move {
                sleep(Duration::from_millis(5)).await;
                completed.fetch_add(1, Ordering::SeqCst);
                Ok(())
            });
        }

        selector.wait().await.unwrap();
        assert_eq!(completed.load(Ordering::SeqCst), 10);
    }

    #[tokio::test]
    async fn test_in_flight_never_exceeds_cap() {
        let concurrent = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let mut selector = BoundSelector::new("test", 2);

        for _ in 0..8 {
            let concurrent = concurrent.clone();
            let peak = peak.clone();
            selector.spawn_child(async move {
                let now = concurrent.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                sleep(Duration::from_millis(20)).await;
                concurrent.fetch_sub(1, Ordering::SeqCst);
                Ok(())
            });
        }

        selector.wait().await.unwrap();
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn test_excess_children_queue_fifo() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let mut selector = BoundSelector::new("test", 1);

        for i in 0..5 {
            let order = order.clone();
            selector.spawn_child(async move {
                order.lock().await.push(i);
                sleep(Duration::from_millis(5)).await;
                Ok(())
            });
        }

        selector.wait().await.unwrap();
        assert_eq!(*order.lock().await, vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn test_first_observed_error_wins() {
        let mut selector = BoundSelector::new("test", 4);

        // enqueued first, fails last
        selector.spawn_child(async {
            sleep(Duration::from_millis(60)).await;
            Err(FlowError::transient("slow failure"))
        });
        // enqueued second, fails first
        selector.spawn_child(async {
            sleep(Duration::from_millis(5)).await;
            Err(FlowError::transient("fast failure"))
        });
        selector.spawn_child(async { Ok(()) });

        let err = selector.wait().await.unwrap_err();
        assert!(err.to_string().contains("fast failure"));
    }

    #[tokio::test]
    async fn test_error_still_awaits_siblings() {
        let completed = Arc::new(AtomicUsize::new(0));
        let mut selector = BoundSelector::new("test", 4);

        selector.spawn_child(async { Err(FlowError::transient("early failure")) });
        for _ in 0..3 {
            let completed = completed.clone();
            selector.spawn_child(async move {
                sleep(Duration::from_millis(30)).await;
                completed.fetch_add(1, Ordering::SeqCst);
                Ok(())
            });
        }

        let err = selector.wait().await.unwrap_err();
        assert!(err.to_string().contains("early failure"));
        assert_eq!(completed.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_zero_limit_is_clamped() {
        let mut selector = BoundSelector::new("test", 0);
        selector.spawn_child(async { Ok(()) });
        selector.wait().await.unwrap();
    }

    #[tokio::test]
    async fn test_wait_with_no_children() {
        let mut selector = BoundSelector::new("test", 3);
        selector.wait().await.unwrap();
        assert_eq!(selector.spawned(), 0);
    }
}
