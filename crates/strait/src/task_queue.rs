use std::collections::VecDeque;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};

use parking_lot::{Condvar, Mutex};

use crate::error::QueueClosed;

type Task = Box<dyn FnOnce() + Send + 'static>;

struct QueueState {
    tasks: VecDeque<Task>,
    open: bool,
}

struct Shared {
    label: &'static str,
    state: Mutex<QueueState>,
    ready: Condvar,
}

/// FIFO of closures drained by one dedicated worker thread.
///
/// `submit` never blocks on the work itself. `shutdown` stops intake, lets the
/// worker drain what is already queued, and joins it.
pub struct TaskQueue {
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
    worker_id: ThreadId,
}

impl TaskQueue {
    pub fn new(label: &'static str) -> std::io::Result<Self> {
        let shared = Arc::new(Shared {
            label,
            state: Mutex::new(QueueState {
                tasks: VecDeque::new(),
                open: true,
            }),
            ready: Condvar::new(),
        });
        let worker_shared = Arc::clone(&shared);
        let handle = thread::Builder::new()
            .name(format!("strait-{label}"))
            .spawn(move || worker_loop(worker_shared))?;
        let worker_id = handle.thread().id();
        Ok(Self {
            shared,
            worker: Mutex::new(Some(handle)),
            worker_id,
        })
    }

    pub fn label(&self) -> &'static str {
        self.shared.label
    }

    pub fn submit<F>(&self, task: F) -> Result<(), QueueClosed>
    where
        F: FnOnce() + Send + 'static,
    {
        let mut state = self.shared.state.lock();
        if !state.open {
            return Err(QueueClosed(self.shared.label));
        }
        state.tasks.push_back(Box::new(task));
        drop(state);
        self.shared.ready.notify_one();
        Ok(())
    }

    /// Runs `task` on the worker and waits for its result.
    ///
    /// Called from the worker itself, the task runs inline so a task may use
    /// the same API it is serving without deadlocking.
    pub fn run_sync<T, F>(&self, task: F) -> Result<T, QueueClosed>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        if self.is_worker_thread() {
            return Ok(task());
        }
        let (tx, rx) = crossbeam_channel::bounded(1);
        self.submit(move || {
            let _ = tx.send(task());
        })?;
        rx.recv().map_err(|_| QueueClosed(self.shared.label))
    }

    pub fn pending(&self) -> usize {
        self.shared.state.lock().tasks.len()
    }

    pub fn is_open(&self) -> bool {
        self.shared.state.lock().open
    }

    pub fn is_worker_thread(&self) -> bool {
        thread::current().id() == self.worker_id
    }

    pub fn shutdown(&self) {
        {
            let mut state = self.shared.state.lock();
            state.open = false;
        }
        self.shared.ready.notify_all();
        if self.is_worker_thread() {
            // The worker exits on its own once the queue is empty.
            return;
        }
        if let Some(handle) = self.worker.lock().take() {
            if handle.join().is_err() {
                tracing::error!(
                    target = "strait::task_queue",
                    queue = self.shared.label,
                    "worker thread terminated abnormally"
                );
            }
        }
    }
}

impl Drop for TaskQueue {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for TaskQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskQueue")
            .field("label", &self.shared.label)
            .field("pending", &self.pending())
            .finish()
    }
}

fn worker_loop(shared: Arc<Shared>) {
    loop {
        let task = {
            let mut state = shared.state.lock();
            loop {
                if let Some(task) = state.tasks.pop_front() {
                    break Some(task);
                }
                if !state.open {
                    break None;
                }
                shared.ready.wait(&mut state);
            }
        };
        let Some(task) = task else {
            tracing::trace!(target = "strait::task_queue", queue = shared.label, "worker drained");
            return;
        };
        if catch_unwind(AssertUnwindSafe(task)).is_err() {
            tracing::error!(
                target = "strait::task_queue",
                queue = shared.label,
                "task panicked; continuing with next task"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[test]
    fn runs_tasks_in_submission_order() {
        let queue = TaskQueue::new("order").unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        for i in 0..64 {
            let seen = Arc::clone(&seen);
            queue.submit(move || seen.lock().push(i)).unwrap();
        }
        queue.shutdown();
        assert_eq!(*seen.lock(), (0..64).collect::<Vec<_>>());
    }

    #[test]
    fn shutdown_drains_queued_work_before_joining() {
        let queue = TaskQueue::new("drain").unwrap();
        let done = Arc::new(AtomicUsize::new(0));
        let (gate_tx, gate_rx) = crossbeam_channel::bounded::<()>(0);
        queue
            .submit(move || {
                let _ = gate_rx.recv_timeout(Duration::from_secs(5));
            })
            .unwrap();
        for _ in 0..10 {
            let done = Arc::clone(&done);
            queue
                .submit(move || {
                    done.fetch_add(1, Ordering::SeqCst);
                })
                .unwrap();
        }
        assert_eq!(queue.pending(), 10);
        gate_tx.send(()).unwrap();
        queue.shutdown();
        assert_eq!(done.load(Ordering::SeqCst), 10);
        assert_eq!(queue.submit(|| {}), Err(QueueClosed("drain")));
    }

    #[test]
    fn panicking_task_does_not_stop_worker() {
        let queue = TaskQueue::new("panics").unwrap();
        queue.submit(|| panic!("boom")).unwrap();
        assert_eq!(queue.run_sync(|| 7).unwrap(), 7);
    }

    #[test]
    fn run_sync_from_worker_executes_inline() {
        let queue = Arc::new(TaskQueue::new("inline").unwrap());
        let inner = Arc::clone(&queue);
        let value = queue
            .run_sync(move || inner.run_sync(|| 21).unwrap() * 2)
            .unwrap();
        assert_eq!(value, 42);
        assert!(!queue.is_worker_thread());
    }
}
