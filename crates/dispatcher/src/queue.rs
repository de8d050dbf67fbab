//! Work queue with per-lane FIFO ordering.
//!
//! Jobs are pushed onto a named lane. A lane has at most one job checked out
//! at a time; its next job becomes poppable only after [`KeyedQueue::complete`].
//! Ready lanes are served round-robin in the order they became ready.

use std::collections::{HashMap, VecDeque};
use std::hash::Hash;
use std::sync::Mutex;

use tokio::sync::Notify;

struct Lane<T> {
    jobs: VecDeque<T>,
    checked_out: bool,
}

struct State<L, T> {
    lanes: HashMap<L, Lane<T>>,
    ready: VecDeque<L>,
    closed: bool,
}

pub(crate) struct KeyedQueue<L, T> {
    state: Mutex<State<L, T>>,
    notify: Notify,
}

impl<L, T> KeyedQueue<L, T>
where
    L: Clone + Eq + Hash,
{
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(State {
                lanes: HashMap::new(),
                ready: VecDeque::new(),
                closed: false,
            }),
            notify: Notify::new(),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State<L, T>> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Appends `job` to `lane`. Returns the job back if the queue is closed.
    pub(crate) fn push(&self, lane: L, job: T) -> Result<(), T> {
        let mut state = self.lock();
        if state.closed {
            return Err(job);
        }
        let entry = state.lanes.entry(lane.clone()).or_insert_with(|| Lane {
            jobs: VecDeque::new(),
            checked_out: false,
        });
        let became_ready = entry.jobs.is_empty() && !entry.checked_out;
        entry.jobs.push_back(job);
        if became_ready {
            state.ready.push_back(lane);
            drop(state);
            self.notify.notify_one();
        }
        Ok(())
    }

    /// Waits for the next job from a ready lane. `None` once the queue is closed.
    pub(crate) async fn pop(&self) -> Option<(L, T)> {
        loop {
            let notified = self.notify.notified();
            {
                let mut state = self.lock();
                if state.closed {
                    return None;
                }
                while let Some(lane) = state.ready.pop_front() {
                    let Some(entry) = state.lanes.get_mut(&lane) else {
                        continue;
                    };
                    let Some(job) = entry.jobs.pop_front() else {
                        continue;
                    };
                    entry.checked_out = true;
                    let more_ready = !state.ready.is_empty();
                    drop(state);
                    if more_ready {
                        self.notify.notify_one();
                    }
                    return Some((lane, job));
                }
            }
            notified.await;
        }
    }

    /// Returns `lane`'s checkout, making its next job (if any) poppable.
    pub(crate) fn complete(&self, lane: &L) {
        let mut state = self.lock();
        let Some(entry) = state.lanes.get_mut(lane) else {
            return;
        };
        entry.checked_out = false;
        if entry.jobs.is_empty() {
            state.lanes.remove(lane);
        } else if !state.closed {
            state.ready.push_back(lane.clone());
            drop(state);
            self.notify.notify_one();
        }
    }

    /// Closes the queue and returns every job not yet popped.
    pub(crate) fn close(&self) -> Vec<T> {
        let mut state = self.lock();
        state.closed = true;
        state.ready.clear();
        let abandoned = state
            .lanes
            .values_mut()
            .flat_map(|lane| lane.jobs.drain(..))
            .collect();
        drop(state);
        self.notify.notify_waiters();
        abandoned
    }

    /// Jobs waiting to be popped, across all lanes.
    pub(crate) fn pending(&self) -> usize {
        self.lock().lanes.values().map(|lane| lane.jobs.len()).sum()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn lanes_are_fifo_and_exclusive() {
        let queue: KeyedQueue<&str, u32> = KeyedQueue::new();
        queue.push("a", 1).unwrap();
        queue.push("a", 2).unwrap();
        queue.push("b", 3).unwrap();

        assert_eq!(queue.pop().await, Some(("a", 1)));
        // "a" is checked out, so "b" is next even though "a" has work.
        assert_eq!(queue.pop().await, Some(("b", 3)));
        assert!(
            tokio::time::timeout(Duration::from_millis(50), queue.pop())
                .await
                .is_err(),
            "lane a must stay blocked until its job completes"
        );

        queue.complete(&"a");
        assert_eq!(queue.pop().await, Some(("a", 2)));
        queue.complete(&"a");
        queue.complete(&"b");
        assert_eq!(queue.pending(), 0);
    }

    #[tokio::test]
    async fn waiting_pop_wakes_on_push() {
        let queue = Arc::new(KeyedQueue::<u8, &str>::new());
        let waiter = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.pop().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.push(7, "job").unwrap();

        let popped = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(popped, Some((7, "job")));
    }

    #[tokio::test]
    async fn close_returns_unpopped_jobs_and_releases_waiters() {
        let queue = Arc::new(KeyedQueue::<u8, u8>::new());
        queue.push(1, 10).unwrap();
        queue.push(1, 11).unwrap();
        assert_eq!(queue.pop().await, Some((1, 10)));

        let waiter = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.pop().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        let mut abandoned = queue.close();
        abandoned.sort_unstable();
        assert_eq!(abandoned, vec![11]);
        assert_eq!(waiter.await.unwrap(), None);
        assert_eq!(queue.push(2, 20), Err(20));
    }
}
