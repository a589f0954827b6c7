//! Per-key FIFO serialization queues.
//!
//! Sibling subtrees run concurrently and may attempt to create the "same"
//! named resource simultaneously; a queue keyed on the resource's
//! `serial_vars` values provides the only required ordering. A context
//! acquires its key when it reaches the main-request stage and releases it
//! after postRun, so the full waterfall of one holder completes before the
//! next is resumed. Independent keys run in parallel.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::{oneshot, Mutex};

/// Process-wide queue table. Cheap to clone; all clones share state.
#[derive(Clone, Default)]
pub struct SerialQueues {
    inner: Arc<Mutex<HashMap<String, VecDeque<oneshot::Sender<()>>>>>,
}

impl SerialQueues {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Joins the queue for `key`. The first arrival proceeds immediately;
    /// later arrivals suspend until every earlier holder has released.
    pub async fn acquire(&self, key: &str) {
        let waiter = {
            let mut table = self.inner.lock().await;
            match table.get_mut(key) {
                None => {
                    // Empty queue: occupy it and go.
                    table.insert(key.to_string(), VecDeque::new());
                    None
                }
                Some(waiters) => {
                    let (tx, rx) = oneshot::channel();
                    waiters.push_back(tx);
                    Some(rx)
                }
            }
        };
        if let Some(rx) = waiter {
            // The sender is never dropped without sending: release() either
            // signals the head waiter or removes the entry when none wait.
            let _ = rx.await;
        }
    }

    /// Releases `key`, resuming the head waiter if one is suspended.
    pub async fn release(&self, key: &str) {
        let mut table = self.inner.lock().await;
        if let Some(waiters) = table.get_mut(key) {
            match waiters.pop_front() {
                Some(next) => {
                    let _ = next.send(());
                }
                None => {
                    table.remove(key);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn same_key_is_fifo_exclusive() {
        let queues = SerialQueues::new();
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..4 {
            let queues = queues.clone();
            let active = Arc::clone(&active);
            let peak = Arc::clone(&peak);
            handles.push(tokio::spawn(async move {
                queues.acquire("appName=demo").await;
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(10)).await;
                active.fetch_sub(1, Ordering::SeqCst);
                queues.release("appName=demo").await;
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(peak.load(Ordering::SeqCst), 1, "holders overlapped");
    }

    #[tokio::test]
    async fn different_keys_run_in_parallel() {
        let queues = SerialQueues::new();
        queues.acquire("a=1").await;
        // A second, independent key must not block.
        tokio::time::timeout(Duration::from_millis(100), queues.acquire("b=2"))
            .await
            .expect("independent key should not wait");
        queues.release("a=1").await;
        queues.release("b=2").await;
    }

    #[tokio::test]
    async fn release_resumes_head_waiter() {
        let queues = SerialQueues::new();
        queues.acquire("k").await;

        let queues2 = queues.clone();
        let waiter = tokio::spawn(async move {
            queues2.acquire("k").await;
            queues2.release("k").await;
        });

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!waiter.is_finished(), "waiter should be suspended");
        queues.release("k").await;
        tokio::time::timeout(Duration::from_millis(100), waiter)
            .await
            .expect("waiter should resume")
            .unwrap();
    }
}
