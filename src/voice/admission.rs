//! Bounded FIFO admission to a shared engine
//!
//! At most `concurrency` callers hold a permit at once. Others wait in
//! arrival order. When more than `max_waiting` callers are queued, the
//! oldest waiter is rejected with a retryable [`Error::Overloaded`] so the
//! queue never grows without bound.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::Serialize;
use tokio::sync::oneshot;

use crate::{Error, Result};

struct Waiter {
    id: u64,
    tx: oneshot::Sender<Result<()>>,
}

struct QueueState {
    available: usize,
    waiters: VecDeque<Waiter>,
    next_id: u64,
}

struct Inner {
    name: &'static str,
    capacity: usize,
    max_waiting: usize,
    state: Mutex<QueueState>,
    rejected: AtomicU64,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Hand a freed slot to the next live waiter, or return it to the pool
    fn release(&self) {
        let mut state = self.lock();
        while let Some(waiter) = state.waiters.pop_front() {
            if waiter.tx.send(Ok(())).is_ok() {
                return;
            }
        }
        state.available += 1;
    }
}

/// Snapshot of queue occupancy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct AdmissionStats {
    pub in_flight: usize,
    pub waiting: usize,
    pub rejected: u64,
}

/// Concurrency gate with a bounded FIFO wait queue
#[derive(Clone)]
pub struct AdmissionQueue {
    inner: Arc<Inner>,
}

impl AdmissionQueue {
    /// Create a gate named `name` (used in logs and errors)
    #[must_use]
    pub fn new(name: &'static str, concurrency: usize, max_waiting: usize) -> Self {
        let capacity = concurrency.max(1);
        Self {
            inner: Arc::new(Inner {
                name,
                capacity,
                max_waiting,
                state: Mutex::new(QueueState {
                    available: capacity,
                    waiters: VecDeque::new(),
                    next_id: 0,
                }),
                rejected: AtomicU64::new(0),
            }),
        }
    }

    /// Wait for a slot
    ///
    /// # Errors
    ///
    /// Returns [`Error::Overloaded`] if this caller was the oldest waiter
    /// when the queue overflowed
    pub async fn acquire(&self) -> Result<AdmissionPermit> {
        let (id, rx) = {
            let mut state = self.inner.lock();

            if state.available > 0 && state.waiters.is_empty() {
                state.available -= 1;
                return Ok(self.permit());
            }

            if self.inner.max_waiting == 0 {
                drop(state);
                return Err(self.reject_now());
            }

            if state.waiters.len() >= self.inner.max_waiting
                && let Some(oldest) = state.waiters.pop_front()
            {
                self.inner.rejected.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(queue = self.inner.name, "queue full, rejecting oldest waiter");
                let _ = oldest.tx.send(Err(self.overloaded()));
            }

            let id = state.next_id;
            state.next_id += 1;
            let (tx, rx) = oneshot::channel();
            state.waiters.push_back(Waiter { id, tx });

            tracing::trace!(
                queue = self.inner.name,
                waiting = state.waiters.len(),
                "waiting for slot"
            );
            (id, rx)
        };

        let mut guard = WaitGuard {
            inner: &self.inner,
            id,
            rx: Some(rx),
        };

        let outcome = match guard.rx.as_mut() {
            Some(rx) => rx.await,
            None => return Err(self.overloaded()),
        };
        guard.rx = None;

        match outcome {
            Ok(Ok(())) => Ok(self.permit()),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(self.overloaded()),
        }
    }

    /// Current occupancy
    #[must_use]
    pub fn stats(&self) -> AdmissionStats {
        let state = self.inner.lock();
        AdmissionStats {
            in_flight: self.inner.capacity - state.available,
            waiting: state.waiters.len(),
            rejected: self.inner.rejected.load(Ordering::Relaxed),
        }
    }

    fn permit(&self) -> AdmissionPermit {
        AdmissionPermit {
            inner: Arc::clone(&self.inner),
        }
    }

    fn overloaded(&self) -> Error {
        Error::Overloaded(format!("{} queue is full", self.inner.name))
    }

    fn reject_now(&self) -> Error {
        self.inner.rejected.fetch_add(1, Ordering::Relaxed);
        self.overloaded()
    }
}

/// Held while using the engine; the slot is released on drop
pub struct AdmissionPermit {
    inner: Arc<Inner>,
}

impl Drop for AdmissionPermit {
    fn drop(&mut self) {
        self.inner.release();
    }
}

/// Cleans up a waiter whose `acquire` future was dropped mid-wait
struct WaitGuard<'a> {
    inner: &'a Inner,
    id: u64,
    rx: Option<oneshot::Receiver<Result<()>>>,
}

impl Drop for WaitGuard<'_> {
    fn drop(&mut self) {
        let Some(mut rx) = self.rx.take() else {
            return;
        };

        let mut state = self.inner.lock();
        if let Some(pos) = state.waiters.iter().position(|w| w.id == self.id) {
            state.waiters.remove(pos);
            return;
        }
        drop(state);

        // A slot was granted after we stopped listening; pass it on
        if matches!(rx.try_recv(), Ok(Ok(()))) {
            self.inner.release();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio_test::{assert_ready_ok, task};

    use super::*;

    #[tokio::test]
    async fn grants_up_to_concurrency_immediately() {
        let queue = AdmissionQueue::new("test", 2, 4);
        let a = queue.acquire().await.unwrap();
        let _b = queue.acquire().await.unwrap();
        assert_eq!(queue.stats().in_flight, 2);

        drop(a);
        assert_eq!(queue.stats().in_flight, 1);
    }

    #[tokio::test]
    async fn waiters_are_served_in_fifo_order() {
        let queue = AdmissionQueue::new("test", 1, 8);
        let held = queue.acquire().await.unwrap();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();

        for i in 0..3 {
            let queue = queue.clone();
            let tx = tx.clone();
            tokio::spawn(async move {
                let _permit = queue.acquire().await.unwrap();
                tx.send(i).unwrap();
            });
            // Let each task enqueue before the next
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        assert_eq!(queue.stats().waiting, 3);
        drop(held);

        let mut order = Vec::new();
        for _ in 0..3 {
            order.push(rx.recv().await.unwrap());
        }
        assert_eq!(order, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn overflow_rejects_oldest_waiter() {
        let queue = AdmissionQueue::new("stt", 1, 1);
        let held = queue.acquire().await.unwrap();

        let first = tokio::spawn({
            let queue = queue.clone();
            async move { queue.acquire().await.map(|_| ()) }
        });
        tokio::time::sleep(Duration::from_millis(5)).await;

        let second = tokio::spawn({
            let queue = queue.clone();
            async move { queue.acquire().await.map(|_| ()) }
        });
        tokio::time::sleep(Duration::from_millis(5)).await;

        let err = first.await.unwrap().unwrap_err();
        assert!(matches!(err, Error::Overloaded(_)));
        assert!(err.is_retryable());

        drop(held);
        second.await.unwrap().unwrap();
        assert_eq!(queue.stats().rejected, 1);
    }

    #[tokio::test]
    async fn cancelled_waiter_does_not_leak_slot() {
        let queue = AdmissionQueue::new("test", 1, 4);
        let held = queue.acquire().await.unwrap();

        let waiting = tokio::spawn({
            let queue = queue.clone();
            async move { queue.acquire().await.map(|_| ()) }
        });
        tokio::time::sleep(Duration::from_millis(5)).await;
        waiting.abort();
        let _ = waiting.await;

        assert_eq!(queue.stats().waiting, 0);
        drop(held);
        assert_eq!(queue.stats().in_flight, 0);
        let _again = queue.acquire().await.unwrap();
    }

    #[test]
    fn freed_slot_wakes_next_waiter() {
        let queue = AdmissionQueue::new("test", 1, 4);

        let mut first = task::spawn(queue.acquire());
        let held = assert_ready_ok!(first.poll());

        let mut second = task::spawn(queue.acquire());
        assert!(second.poll().is_pending());
        assert_eq!(queue.stats().waiting, 1);

        drop(held);
        assert!(second.is_woken());
        let _permit = assert_ready_ok!(second.poll());
        assert_eq!(queue.stats().in_flight, 1);
    }
}
