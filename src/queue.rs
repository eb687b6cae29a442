//! Pull-based FIFO work queue shared by every connected worker.
//!
//! Tasks are identified by pointer, so the same `Arc` must be used for
//! [`WorkQueue::position`] and [`WorkQueue::remove`] as was pushed.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use thiserror::Error;
use tokio::sync::{Notify, watch};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum QueueError {
    #[error("queue is closed")]
    QueueClosed,
}

/// Where a task currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Position {
    /// 1-based index in the backlog.
    Waiting(usize),
    Running,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueSnapshot {
    pub pending: usize,
    pub running: usize,
    pub workers: usize,
    pub closed: bool,
}

struct State<T> {
    backlog: VecDeque<Arc<T>>,
    running: Vec<Arc<T>>,
    closed: bool,
    workers: usize,
}

impl<T> State<T> {
    fn snapshot(&self) -> QueueSnapshot {
        QueueSnapshot {
            pending: self.backlog.len(),
            running: self.running.len(),
            workers: self.workers,
            closed: self.closed,
        }
    }
}

struct Inner<T> {
    state: Mutex<State<T>>,
    available: Notify,
    status: watch::Sender<QueueSnapshot>,
}

pub struct WorkQueue<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for WorkQueue<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Send + Sync + 'static> Default for WorkQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Send + Sync + 'static> WorkQueue<T> {
    pub fn new() -> Self {
        let (status, _) = watch::channel(QueueSnapshot::default());
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State {
                    backlog: VecDeque::new(),
                    running: Vec::new(),
                    closed: false,
                    workers: 0,
                }),
                available: Notify::new(),
                status,
            }),
        }
    }

    /// Runs `change` under the queue lock and publishes the resulting counts.
    fn update<R>(&self, change: impl FnOnce(&mut State<T>) -> R) -> R {
        let mut state = self.lock();
        let result = change(&mut state);
        let snapshot = state.snapshot();
        self.inner.status.send_if_modified(|current| {
            let changed = *current != snapshot;
            *current = snapshot;
            changed
        });
        result
    }

    fn lock(&self) -> MutexGuard<'_, State<T>> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Appends to the backlog tail.
    pub fn push(&self, task: Arc<T>) -> Result<(), QueueError> {
        self.update(|state| {
            if state.closed {
                return Err(QueueError::QueueClosed);
            }
            state.backlog.push_back(task);
            Ok(())
        })?;
        self.inner.available.notify_waiters();
        Ok(())
    }

    /// Puts a task back at the head of the backlog. Allowed on a closed queue
    /// so that failed work can still drain.
    pub fn unshift(&self, task: Arc<T>) {
        self.update(|state| state.backlog.push_front(task));
        self.inner.available.notify_waiters();
    }

    pub fn position(&self, task: &Arc<T>) -> Option<Position> {
        let state = self.lock();
        if let Some(index) = state.backlog.iter().position(|t| Arc::ptr_eq(t, task)) {
            return Some(Position::Waiting(index + 1));
        }
        state
            .running
            .iter()
            .any(|t| Arc::ptr_eq(t, task))
            .then_some(Position::Running)
    }

    /// Drops a waiting task. Returns false if it was not in the backlog.
    pub fn remove(&self, task: &Arc<T>) -> bool {
        self.update(|state| {
            let before = state.backlog.len();
            state.backlog.retain(|t| !Arc::ptr_eq(t, task));
            state.backlog.len() != before
        })
    }

    pub fn snapshot(&self) -> QueueSnapshot {
        *self.inner.status.borrow()
    }

    /// Notified whenever a count in [`QueueSnapshot`] changes.
    pub fn watch(&self) -> watch::Receiver<QueueSnapshot> {
        self.inner.status.subscribe()
    }

    /// Stops accepting pushes and resolves once nothing is waiting or running.
    pub async fn close(&self) {
        self.update(|state| state.closed = true);
        let mut status = self.watch();
        let _ = status
            .wait_for(|snapshot| snapshot.pending == 0 && snapshot.running == 0)
            .await;
    }

    /// A consumer that counts as one worker until dropped.
    pub fn tasks(&self) -> TaskStream<T> {
        self.update(|state| state.workers += 1);
        TaskStream {
            queue: self.clone(),
            abort: CancellationToken::new(),
        }
    }

    fn take(&self) -> Option<Lease<T>> {
        let task = self.update(|state| {
            let task = state.backlog.pop_front()?;
            state.running.push(Arc::clone(&task));
            Some(task)
        })?;
        Some(Lease {
            queue: self.clone(),
            task,
            settled: false,
        })
    }

    fn finish(&self, task: &Arc<T>, requeue: bool) {
        self.update(|state| {
            if let Some(index) = state.running.iter().position(|t| Arc::ptr_eq(t, task)) {
                let task = state.running.remove(index);
                if requeue {
                    state.backlog.push_front(task);
                }
            }
        });
        if requeue {
            self.inner.available.notify_waiters();
        }
    }
}

/// Cancelable sequence of leased tasks.
pub struct TaskStream<T: Send + Sync + 'static> {
    queue: WorkQueue<T>,
    abort: CancellationToken,
}

impl<T: Send + Sync + 'static> TaskStream<T> {
    /// Waits for the next task. Returns `None` once aborted.
    pub async fn next(&mut self) -> Option<Lease<T>> {
        loop {
            if self.abort.is_cancelled() {
                return None;
            }
            let notified = self.queue.inner.available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if let Some(lease) = self.queue.take() {
                return Some(lease);
            }
            tokio::select! {
                _ = notified => {}
                _ = self.abort.cancelled() => return None,
            }
        }
    }

    /// Handle that makes a pending or future [`TaskStream::next`] return `None`.
    pub fn abort_handle(&self) -> CancellationToken {
        self.abort.clone()
    }

    pub fn abort(&self) {
        self.abort.cancel();
    }
}

impl<T: Send + Sync + 'static> Drop for TaskStream<T> {
    fn drop(&mut self) {
        self.queue.update(|state| state.workers -= 1);
    }
}

/// A task in the running set. Dropping the lease completes it.
pub struct Lease<T: Send + Sync + 'static> {
    queue: WorkQueue<T>,
    task: Arc<T>,
    settled: bool,
}

impl<T: Send + Sync + 'static> Lease<T> {
    pub fn task(&self) -> &Arc<T> {
        &self.task
    }

    /// Moves the task back to the head of the backlog.
    pub fn requeue(mut self) {
        self.settled = true;
        self.queue.finish(&self.task, true);
    }
}

impl<T: Send + Sync + 'static> Drop for Lease<T> {
    fn drop(&mut self) {
        if !self.settled {
            self.queue.finish(&self.task, false);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(2);

    #[tokio::test]
    async fn test_unshift_goes_to_the_head() {
        let queue = WorkQueue::new();
        let (a, b, c) = (Arc::new("a"), Arc::new("b"), Arc::new("c"));
        queue.push(a.clone()).unwrap();
        queue.push(b.clone()).unwrap();
        queue.unshift(c.clone());

        let mut tasks = queue.tasks();
        for expected in [&c, &a, &b] {
            let lease = timeout(WAIT, tasks.next()).await.unwrap().unwrap();
            assert!(Arc::ptr_eq(lease.task(), expected));
        }
    }

    #[tokio::test]
    async fn test_positions_follow_the_backlog() {
        let queue = WorkQueue::new();
        let (a, b, c, other) = (Arc::new(1), Arc::new(2), Arc::new(3), Arc::new(4));
        for task in [&a, &b, &c] {
            queue.push(task.clone()).unwrap();
        }
        assert_eq!(queue.position(&a), Some(Position::Waiting(1)));
        assert_eq!(queue.position(&b), Some(Position::Waiting(2)));
        assert_eq!(queue.position(&c), Some(Position::Waiting(3)));
        assert_eq!(queue.position(&other), None);

        let mut tasks = queue.tasks();
        let first = timeout(WAIT, tasks.next()).await.unwrap().unwrap();
        assert!(Arc::ptr_eq(first.task(), &a));
        assert_eq!(queue.position(&a), Some(Position::Running));
        assert_eq!(queue.position(&b), Some(Position::Waiting(1)));
        assert_eq!(queue.position(&c), Some(Position::Waiting(2)));

        let second = timeout(WAIT, tasks.next()).await.unwrap().unwrap();
        assert!(Arc::ptr_eq(second.task(), &b));
        assert_eq!(queue.position(&b), Some(Position::Running));
        assert_eq!(queue.position(&c), Some(Position::Waiting(1)));
        assert_eq!(queue.snapshot().running, 2);

        drop(first);
        assert_eq!(queue.position(&a), None);
        assert_eq!(queue.position(&c), Some(Position::Waiting(1)));
        drop(second);
        assert_eq!(queue.position(&b), None);
    }

    #[tokio::test]
    async fn test_remove_only_touches_the_backlog() {
        let queue = WorkQueue::new();
        let (a, b) = (Arc::new(1), Arc::new(2));
        queue.push(a.clone()).unwrap();
        queue.push(b.clone()).unwrap();
        let mut tasks = queue.tasks();
        let _running = tasks.next().await.unwrap();

        assert!(!queue.remove(&a));
        assert!(queue.remove(&b));
        assert_eq!(queue.snapshot().pending, 0);
        assert_eq!(queue.snapshot().running, 1);
    }

    #[tokio::test]
    async fn test_requeue_puts_the_task_back_first() {
        let queue = WorkQueue::new();
        let (a, b) = (Arc::new(1), Arc::new(2));
        queue.push(a.clone()).unwrap();
        queue.push(b.clone()).unwrap();
        let mut tasks = queue.tasks();

        tasks.next().await.unwrap().requeue();
        assert_eq!(queue.position(&a), Some(Position::Waiting(1)));
        let lease = tasks.next().await.unwrap();
        assert!(Arc::ptr_eq(lease.task(), &a));
    }

    #[tokio::test]
    async fn test_next_wakes_on_push() {
        let queue = WorkQueue::new();
        let mut tasks = queue.tasks();
        let consumer = tokio::spawn(async move { tasks.next().await.map(|lease| **lease.task()) });
        tokio::time::sleep(Duration::from_millis(50)).await;
        queue.push(Arc::new(7)).unwrap();
        assert_eq!(timeout(WAIT, consumer).await.unwrap().unwrap(), Some(7));
    }

    #[tokio::test]
    async fn test_abort_releases_a_waiting_consumer() {
        let queue: WorkQueue<u32> = WorkQueue::new();
        let mut tasks = queue.tasks();
        let abort = tasks.abort_handle();
        assert_eq!(queue.snapshot().workers, 1);

        let consumer = tokio::spawn(async move { tasks.next().await.is_none() });
        tokio::time::sleep(Duration::from_millis(50)).await;
        abort.cancel();
        assert!(timeout(WAIT, consumer).await.unwrap().unwrap());
        assert_eq!(queue.snapshot().workers, 0);
    }

    #[tokio::test]
    async fn test_close_rejects_pushes_and_waits_for_running_work() {
        let queue = WorkQueue::new();
        queue.push(Arc::new(1)).unwrap();
        let mut tasks = queue.tasks();
        let lease = tasks.next().await.unwrap();

        let closing = tokio::spawn({
            let queue = queue.clone();
            async move { queue.close().await }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(queue.push(Arc::new(2)), Err(QueueError::QueueClosed));
        assert!(!closing.is_finished());

        queue.unshift(Arc::new(3));
        drop(lease);
        let next = tasks.next().await.unwrap();
        assert_eq!(**next.task(), 3);
        drop(next);
        timeout(WAIT, closing).await.unwrap().unwrap();
    }
}
