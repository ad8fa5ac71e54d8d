//! Ordered task queue with a single worker.
//!
//! Tasks run one at a time in insertion order on a driver task spawned with
//! the queue. A worker may enqueue follow-up tasks through the queue handle
//! it is given. A worker error clears every pending task and is reported by
//! the next [`TaskQueue::on_idle`].

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use tokio::sync::Notify;

use chainsync_core::types::LogEvent;

/// Work item of the handler runtime's queue.
#[derive(Debug, Clone, PartialEq)]
pub enum HandlerTask {
    /// Run the setup handler before any event.
    Setup,
    Log(LogEvent),
}

#[async_trait]
pub trait Worker<T, E>: Send + Sync
where
    T: Send + 'static,
    E: Send + 'static,
{
    async fn run(&self, task: T, queue: &TaskQueue<T, E>) -> Result<(), E>;
}

struct QueueState<T, E> {
    pending: VecDeque<T>,
    started: bool,
    executing: bool,
    error: Option<E>,
}

struct Inner<T, E> {
    state: Mutex<QueueState<T, E>>,
    worker: Arc<dyn Worker<T, E>>,
    /// Wakes the driver. Shared with it so dropping the queue can stop it.
    wake: Arc<Notify>,
    idle: Notify,
}

impl<T, E> Drop for Inner<T, E> {
    fn drop(&mut self) {
        self.wake.notify_one();
    }
}

/// Handle to a queue. Clones share the same queue.
pub struct TaskQueue<T, E> {
    inner: Arc<Inner<T, E>>,
}

impl<T, E> Clone for TaskQueue<T, E> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T, E> TaskQueue<T, E>
where
    T: Send + 'static,
    E: Send + 'static,
{
    /// Create a paused queue and spawn its driver on the current runtime.
    pub fn new(worker: Arc<dyn Worker<T, E>>) -> Self {
        let wake = Arc::new(Notify::new());
        let inner = Arc::new(Inner {
            state: Mutex::new(QueueState {
                pending: VecDeque::new(),
                started: false,
                executing: false,
                error: None,
            }),
            worker,
            wake: Arc::clone(&wake),
            idle: Notify::new(),
        });
        tokio::spawn(drive(Arc::downgrade(&inner), wake));
        Self { inner }
    }

    pub fn add_task(&self, task: T) {
        self.state().pending.push_back(task);
        self.inner.wake.notify_one();
    }

    pub fn start(&self) {
        self.state().started = true;
        self.inner.wake.notify_one();
    }

    /// Stop taking new tasks. The task being executed runs to completion.
    pub fn pause(&self) {
        self.state().started = false;
    }

    /// Drop every pending task.
    pub fn clear(&self) {
        let idle = {
            let mut state = self.state();
            state.pending.clear();
            !state.executing
        };
        if idle {
            self.inner.idle.notify_waiters();
        }
    }

    /// Number of pending tasks.
    pub fn len(&self) -> usize {
        self.state().pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Nothing pending and nothing executing.
    pub fn is_idle(&self) -> bool {
        let state = self.state();
        state.pending.is_empty() && !state.executing
    }

    /// Returns `true` if both handles point at the same queue.
    pub fn same_queue(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Wait until the queue is idle. Returns the first worker error raised
    /// since the last call.
    pub async fn on_idle(&self) -> Result<(), E> {
        loop {
            let notified = self.inner.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut state = self.state();
                if state.pending.is_empty() && !state.executing {
                    return match state.error.take() {
                        Some(error) => Err(error),
                        None => Ok(()),
                    };
                }
            }
            notified.await;
        }
    }

    fn next_task(&self) -> Option<T> {
        let mut state = self.state();
        if !state.started || state.executing {
            return None;
        }
        let task = state.pending.pop_front()?;
        state.executing = true;
        Some(task)
    }

    fn finish(&self, result: Result<(), E>) {
        let idle = {
            let mut state = self.state();
            state.executing = false;
            if let Err(error) = result {
                state.pending.clear();
                if state.error.is_none() {
                    state.error = Some(error);
                }
            }
            state.pending.is_empty()
        };
        if idle {
            self.inner.idle.notify_waiters();
        }
    }

    fn state(&self) -> MutexGuard<'_, QueueState<T, E>> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Driver loop. Exits once every handle to the queue is dropped.
async fn drive<T, E>(inner: Weak<Inner<T, E>>, wake: Arc<Notify>)
where
    T: Send + 'static,
    E: Send + 'static,
{
    loop {
        let Some(inner) = inner.upgrade() else {
            return;
        };
        let queue = TaskQueue { inner };
        match queue.next_task() {
            Some(task) => {
                let worker = Arc::clone(&queue.inner.worker);
                let result = worker.run(task, &queue).await;
                queue.finish(result);
            }
            None => {
                drop(queue);
                wake.notified().await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<u32>>,
        active: AtomicUsize,
        max_active: AtomicUsize,
    }

    #[async_trait]
    impl Worker<u32, String> for Recorder {
        async fn run(&self, task: u32, queue: &TaskQueue<u32, String>) -> Result<(), String> {
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_active.fetch_max(now, Ordering::SeqCst);
            if task % 3 == 0 {
                tokio::task::yield_now().await;
            }
            self.seen.lock().unwrap().push(task);
            self.active.fetch_sub(1, Ordering::SeqCst);
            match task {
                // Follow-up tasks go to the back of the queue.
                1_000 => {
                    queue.add_task(1_001);
                    Ok(())
                }
                666 => Err("boom".into()),
                _ => Ok(()),
            }
        }
    }

    fn queue() -> (Arc<Recorder>, TaskQueue<u32, String>) {
        let recorder = Arc::new(Recorder::default());
        let queue = TaskQueue::new(recorder.clone() as Arc<dyn Worker<u32, String>>);
        (recorder, queue)
    }

    #[tokio::test]
    async fn runs_in_order_one_at_a_time() {
        let (recorder, queue) = queue();
        for i in 0..200 {
            queue.add_task(i);
        }
        queue.start();
        queue.on_idle().await.unwrap();

        assert_eq!(*recorder.seen.lock().unwrap(), (0..200).collect::<Vec<_>>());
        assert_eq!(recorder.max_active.load(Ordering::SeqCst), 1);
        assert!(queue.is_idle());
    }

    #[tokio::test]
    async fn paused_queue_holds_tasks() {
        let (recorder, queue) = queue();
        queue.add_task(1);
        queue.add_task(2);
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(queue.len(), 2);
        assert!(recorder.seen.lock().unwrap().is_empty());

        queue.start();
        queue.on_idle().await.unwrap();
        assert_eq!(*recorder.seen.lock().unwrap(), vec![1, 2]);
    }

    #[tokio::test]
    async fn worker_can_enqueue_follow_ups() {
        let (recorder, queue) = queue();
        queue.add_task(1_000);
        queue.add_task(7);
        queue.start();
        queue.on_idle().await.unwrap();
        assert_eq!(*recorder.seen.lock().unwrap(), vec![1_000, 7, 1_001]);
    }

    #[tokio::test]
    async fn error_clears_pending_and_surfaces_once() {
        let (recorder, queue) = queue();
        queue.add_task(1);
        queue.add_task(666);
        queue.add_task(2);
        queue.start();

        assert_eq!(queue.on_idle().await, Err("boom".to_string()));
        assert_eq!(*recorder.seen.lock().unwrap(), vec![1, 666]);
        assert!(queue.is_empty());
        assert_eq!(queue.on_idle().await, Ok(()));
    }

    #[tokio::test]
    async fn clear_drops_pending() {
        let (recorder, queue) = queue();
        for i in 0..10 {
            queue.add_task(i);
        }
        queue.clear();
        queue.start();
        queue.on_idle().await.unwrap();
        assert!(recorder.seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn concurrent_producers_never_overlap() {
        let (recorder, queue) = queue();
        queue.start();
        let mut producers = Vec::new();
        for p in 0..4u32 {
            let queue = queue.clone();
            producers.push(tokio::spawn(async move {
                for i in 0..50 {
                    queue.add_task(p * 100 + i + 1);
                    tokio::task::yield_now().await;
                }
            }));
        }
        for producer in producers {
            producer.await.unwrap();
        }
        queue.on_idle().await.unwrap();
        assert_eq!(recorder.seen.lock().unwrap().len(), 200);
        assert_eq!(recorder.max_active.load(Ordering::SeqCst), 1);
    }
}
