//! Per-session lifecycle queues
//!
//! One FIFO of boxed tasks per live session key, drained by a dedicated
//! worker task. The worker runs one task at a time; the next starts only
//! after the previous completes. A queue is created on first enqueue and
//! retires once fully drained; sender lookup and retirement share one
//! critical section so no task can be lost in between.

use futures::future::BoxFuture;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TryRecvError};

pub(crate) type LifecycleTask = BoxFuture<'static, ()>;

pub(crate) struct LifecycleQueues {
    queues: Arc<Mutex<HashMap<String, mpsc::UnboundedSender<LifecycleTask>>>>,
}

impl LifecycleQueues {
    pub fn new() -> Self {
        Self {
            queues: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Number of live (not yet drained) queues.
    pub fn len(&self) -> usize {
        self.queues.lock().len()
    }

    pub fn enqueue(&self, key: &str, task: LifecycleTask) {
        let mut map = self.queues.lock();

        let task = match map.get(key) {
            Some(tx) => match tx.send(task) {
                Ok(()) => return,
                // The worker retired between lookup and send; recover the
                // task and start a fresh queue.
                Err(mpsc::error::SendError(task)) => task,
            },
            None => task,
        };

        let (tx, mut rx) = mpsc::unbounded_channel();
        let _ = tx.send(task);
        map.insert(key.to_string(), tx);
        drop(map);

        let queues = self.queues.clone();
        let key = key.to_string();
        tokio::spawn(async move {
            loop {
                let task = match rx.try_recv() {
                    Ok(task) => Some(task),
                    Err(TryRecvError::Empty) => {
                        // Drained. Re-check under the map lock so a
                        // concurrent enqueue either lands here or sees
                        // the entry gone.
                        let mut map = queues.lock();
                        match rx.try_recv() {
                            Ok(task) => Some(task),
                            Err(_) => {
                                map.remove(&key);
                                None
                            }
                        }
                    }
                    Err(TryRecvError::Disconnected) => {
                        queues.lock().remove(&key);
                        None
                    }
                };

                let Some(task) = task else { break };

                // Run each task on its own spawn: a panicking task must
                // not take the queue down with it.
                if let Err(e) = tokio::spawn(task).await {
                    tracing::error!("Lifecycle task for {} panicked: {}", key, e);
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::Mutex as AsyncMutex;

    async fn drained(queues: &LifecycleQueues) {
        for _ in 0..200 {
            if queues.len() == 0 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("lifecycle queues never drained");
    }

    #[tokio::test]
    async fn tasks_for_one_key_run_in_order_without_overlap() {
        let queues = LifecycleQueues::new();
        let log = Arc::new(AsyncMutex::new(Vec::new()));
        let running = Arc::new(AtomicUsize::new(0));

        for i in 0..5 {
            let log = log.clone();
            let running = running.clone();
            queues.enqueue(
                "k1",
                Box::pin(async move {
                    assert_eq!(running.fetch_add(1, Ordering::SeqCst), 0, "tasks overlapped");
                    // Earlier tasks sleep longer; order must still hold.
                    tokio::time::sleep(Duration::from_millis((20 - i * 4) as u64)).await;
                    log.lock().await.push(i);
                    running.fetch_sub(1, Ordering::SeqCst);
                }),
            );
        }

        drained(&queues).await;
        assert_eq!(*log.lock().await, vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn a_panicking_task_does_not_poison_the_queue() {
        let queues = LifecycleQueues::new();
        let done = Arc::new(AtomicUsize::new(0));

        queues.enqueue("k1", Box::pin(async { panic!("boom") }));
        let done2 = done.clone();
        queues.enqueue(
            "k1",
            Box::pin(async move {
                done2.fetch_add(1, Ordering::SeqCst);
            }),
        );

        drained(&queues).await;
        assert_eq!(done.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn queues_retire_when_drained_and_revive_on_next_enqueue() {
        let queues = LifecycleQueues::new();
        let count = Arc::new(AtomicUsize::new(0));

        let c = count.clone();
        queues.enqueue(
            "k1",
            Box::pin(async move {
                c.fetch_add(1, Ordering::SeqCst);
            }),
        );
        drained(&queues).await;

        let c = count.clone();
        queues.enqueue(
            "k1",
            Box::pin(async move {
                c.fetch_add(1, Ordering::SeqCst);
            }),
        );
        drained(&queues).await;
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn different_keys_progress_independently() {
        let queues = LifecycleQueues::new();
        let slow_started = Arc::new(AtomicUsize::new(0));
        let fast_done = Arc::new(AtomicUsize::new(0));

        let started = slow_started.clone();
        queues.enqueue(
            "slow",
            Box::pin(async move {
                started.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(100)).await;
            }),
        );
        let done = fast_done.clone();
        queues.enqueue(
            "fast",
            Box::pin(async move {
                done.fetch_add(1, Ordering::SeqCst);
            }),
        );

        // The fast key finishes while the slow key is still busy.
        for _ in 0..100 {
            if fast_done.load(Ordering::SeqCst) == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        assert_eq!(fast_done.load(Ordering::SeqCst), 1);
        assert_eq!(slow_started.load(Ordering::SeqCst), 1);
        drained(&queues).await;
    }
}
