//! Run loops that drive a thread's message queue
//!
//! An [`EventLoop`] repeatedly drains the current thread's queue and sleeps
//! on it while idle. [`WorkerThread`] spawns a named OS thread running one.

use crate::config;
use crate::error::{CoreError, Result};
use crate::queue::DrainReport;
use crate::thread::{current_thread, ThreadHandle};
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Cooperative loop over the current thread's queue
///
/// Created on, and bound to, the thread that runs it.
pub struct EventLoop {
    thread: ThreadHandle,
    stop_flag: Arc<AtomicBool>,
    idle_wait: Duration,
    _not_send: PhantomData<*const ()>,
}

impl EventLoop {
    /// Create a loop for the calling thread using the configured idle wait
    pub fn new() -> Self {
        Self::with_idle_wait(config::current().event_loop.idle_wait())
    }

    pub fn with_idle_wait(idle_wait: Duration) -> Self {
        Self {
            thread: current_thread(),
            stop_flag: Arc::new(AtomicBool::new(false)),
            idle_wait,
            _not_send: PhantomData,
        }
    }

    pub fn thread(&self) -> &ThreadHandle {
        &self.thread
    }

    /// A sendable handle for stopping the loop or posting to its thread
    pub fn handle(&self) -> LoopHandle {
        LoopHandle {
            thread: self.thread.clone(),
            stop_flag: Arc::clone(&self.stop_flag),
        }
    }

    /// Drain once without waiting
    pub fn process_pending(&self) -> DrainReport {
        self.thread.drain()
    }

    /// Drain repeatedly until the queue is empty, ignoring the drain budget
    ///
    /// Returns the number of tasks run. Tasks posted while this runs are run
    /// too.
    pub fn finish_pending(&self) -> usize {
        let mut executed = 0;
        loop {
            let report = self.thread.drain();
            executed += report.executed;
            if report.remaining == 0 {
                return executed;
            }
        }
    }

    /// Run until [`LoopHandle::stop`] is called
    pub fn run(&self) {
        self.run_loop(|| false, None);
    }

    /// Run until `done` returns `true` or the loop is stopped
    ///
    /// `done` is checked before the first drain and after each one. Returns
    /// `true` if `done` was satisfied.
    pub fn run_until(&self, done: impl FnMut() -> bool) -> bool {
        self.run_loop(done, None)
    }

    /// Like [`run_until`](Self::run_until), giving up after `timeout`
    pub fn run_until_timeout(&self, done: impl FnMut() -> bool, timeout: Duration) -> bool {
        self.run_loop(done, Some(Instant::now() + timeout))
    }

    fn run_loop(&self, mut done: impl FnMut() -> bool, deadline: Option<Instant>) -> bool {
        let satisfied = loop {
            if done() {
                break true;
            }
            if self.stop_flag.load(Ordering::Acquire) {
                break false;
            }

            let report = self.thread.drain();
            if report.remaining > 0 {
                continue;
            }
            if done() {
                break true;
            }

            let wait = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        break false;
                    }
                    self.idle_wait.min(deadline - now)
                }
                None => self.idle_wait,
            };
            self.thread.wait(wait);
        };

        // Consume the stop request so the loop can be run again.
        self.stop_flag.store(false, Ordering::Release);
        satisfied
    }
}

impl Default for EventLoop {
    fn default() -> Self {
        Self::new()
    }
}

/// Controls an [`EventLoop`] from any thread
#[derive(Clone, Debug)]
pub struct LoopHandle {
    thread: ThreadHandle,
    stop_flag: Arc<AtomicBool>,
}

impl LoopHandle {
    /// Ask the loop to return after its current drain
    pub fn stop(&self) {
        self.stop_flag.store(true, Ordering::Release);
        self.thread.wake();
    }

    pub fn is_stop_requested(&self) -> bool {
        self.stop_flag.load(Ordering::Acquire)
    }

    pub fn thread(&self) -> &ThreadHandle {
        &self.thread
    }

    /// Queue a task on the loop's thread
    pub fn post<F>(&self, task: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        self.thread.post(task)
    }
}

/// A named OS thread running an [`EventLoop`]
///
/// Dropping the worker stops it and joins the thread. Tasks posted before
/// `stop()` still run; anything posted after the thread exits is dropped.
pub struct WorkerThread {
    handle: LoopHandle,
    join_handle: Option<JoinHandle<()>>,
}

impl WorkerThread {
    /// Start a worker; returns once its thread is registered
    pub fn spawn(name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        let (ready_tx, ready_rx) = mpsc::channel();

        let join_handle = thread::Builder::new()
            .name(name.clone())
            .spawn(move || {
                let event_loop = EventLoop::new();
                if ready_tx.send(event_loop.handle()).is_err() {
                    return;
                }
                tracing::debug!(thread = %event_loop.thread().name(), "worker started");

                event_loop.run();
                let executed = event_loop.finish_pending();
                tracing::debug!(
                    thread = %event_loop.thread().name(),
                    executed,
                    "worker stopped"
                );
            })
            .map_err(|e| CoreError::ThreadSpawn {
                name: name.clone(),
                message: e.to_string(),
            })?;

        let handle = ready_rx.recv().map_err(|_| CoreError::ThreadSpawn {
            name,
            message: "worker exited during startup".to_string(),
        })?;

        Ok(Self {
            handle,
            join_handle: Some(join_handle),
        })
    }

    pub fn handle(&self) -> &LoopHandle {
        &self.handle
    }

    pub fn thread(&self) -> &ThreadHandle {
        self.handle.thread()
    }

    /// Queue a task on the worker
    pub fn post<F>(&self, task: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        self.handle.post(task)
    }

    /// Run `f` on the worker and wait for its result
    ///
    /// Runs inline when called from the worker itself. Returns `None` if the
    /// worker has exited or `f` panicked.
    pub fn invoke<R, F>(&self, f: F) -> Option<R>
    where
        R: Send + 'static,
        F: FnOnce() -> R + Send + 'static,
    {
        if self.thread().is_current() {
            return Some(f());
        }
        let (tx, rx) = mpsc::channel();
        let posted = self.post(move || {
            let _ = tx.send(f());
        });
        if !posted {
            return None;
        }
        rx.recv().ok()
    }

    /// Ask the worker to finish its pending tasks and exit
    pub fn stop(&self) {
        self.handle.stop();
    }

    /// Stop the worker and wait for its thread to exit
    ///
    /// Returns `false` if the worker thread panicked.
    pub fn join(mut self) -> bool {
        self.shutdown()
    }

    fn shutdown(&mut self) -> bool {
        self.stop();
        let Some(join_handle) = self.join_handle.take() else {
            return true;
        };
        if self.thread().is_current() {
            // Dropped from one of its own tasks; the loop exits on its own.
            return true;
        }
        join_handle.join().is_ok()
    }
}

impl Drop for WorkerThread {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for WorkerThread {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerThread")
            .field("thread", &self.thread().name())
            .field("running", &self.join_handle.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_run_until_processes_posted_work() {
        let event_loop = EventLoop::with_idle_wait(Duration::from_millis(1));
        let count = Arc::new(AtomicUsize::new(0));

        let handle = event_loop.handle();
        let c = count.clone();
        let poster = thread::spawn(move || {
            for _ in 0..3 {
                let c = c.clone();
                handle.post(move || {
                    c.fetch_add(1, Ordering::SeqCst);
                });
            }
        });

        let done = count.clone();
        assert!(event_loop.run_until_timeout(
            move || done.load(Ordering::SeqCst) == 3,
            Duration::from_secs(5)
        ));
        poster.join().unwrap();
    }

    #[test]
    fn test_run_until_timeout_gives_up() {
        let event_loop = EventLoop::with_idle_wait(Duration::from_millis(1));
        assert!(!event_loop.run_until_timeout(|| false, Duration::from_millis(10)));
    }

    #[test]
    fn test_stop_from_task() {
        let event_loop = EventLoop::with_idle_wait(Duration::from_millis(1));
        let handle = event_loop.handle();
        let stopper = handle.clone();
        handle.post(move || stopper.stop());

        event_loop.run();
        assert!(!handle.is_stop_requested());
    }

    #[test]
    fn test_worker_runs_tasks_on_its_thread() {
        let worker = WorkerThread::spawn("test-worker").unwrap();
        assert_eq!(worker.thread().name(), "test-worker");

        let name = worker.invoke(|| current_thread().name().to_string());
        assert_eq!(name.as_deref(), Some("test-worker"));

        let answer = worker.invoke(|| 6 * 7);
        assert_eq!(answer, Some(42));
    }

    #[test]
    fn test_worker_finishes_pending_tasks_on_stop() {
        let worker = WorkerThread::spawn("draining-worker").unwrap();
        let count = Arc::new(AtomicUsize::new(0));

        for _ in 0..10 {
            let c = count.clone();
            worker.post(move || {
                c.fetch_add(1, Ordering::SeqCst);
            });
        }
        let thread = worker.thread().clone();
        assert!(worker.join());

        assert_eq!(count.load(Ordering::SeqCst), 10);
        assert!(thread.is_terminated());
        assert!(!thread.post(|| {}));
    }

    #[test]
    fn test_worker_finishes_tasks_beyond_drain_budget_on_stop() {
        let worker = WorkerThread::spawn("backlog-worker").unwrap();
        let budget = worker.thread().drain_budget().max_tasks.unwrap_or(1024);
        let total = budget * 2 + 100;

        // Hold the worker inside one task so the whole backlog is queued
        // before it drains again.
        let (release_tx, release_rx) = mpsc::channel::<()>();
        worker.post(move || {
            let _ = release_rx.recv();
        });

        let count = Arc::new(AtomicUsize::new(0));
        for _ in 0..total {
            let c = count.clone();
            worker.post(move || {
                c.fetch_add(1, Ordering::SeqCst);
            });
        }
        worker.stop();
        release_tx.send(()).unwrap();

        assert!(worker.join());
        assert_eq!(count.load(Ordering::SeqCst), total);
    }

    #[test]
    fn test_finish_pending_ignores_budget() {
        let event_loop = EventLoop::with_idle_wait(Duration::from_millis(1));
        let thread = event_loop.thread().clone();
        let previous = thread.drain_budget();
        thread.set_drain_budget(crate::config::DrainBudget::tasks(2));

        let count = Arc::new(AtomicUsize::new(0));
        for _ in 0..5 {
            let c = count.clone();
            thread.post(move || {
                c.fetch_add(1, Ordering::SeqCst);
            });
        }
        assert_eq!(event_loop.finish_pending(), 5);
        assert_eq!(count.load(Ordering::SeqCst), 5);

        thread.set_drain_budget(previous);
    }

    #[test]
    fn test_invoke_after_panic_returns_none() {
        let worker = WorkerThread::spawn("panicky-worker").unwrap();
        let result: Option<()> = worker.invoke(|| panic!("task failed"));
        assert_eq!(result, None);

        // The panic was contained; the worker keeps serving.
        assert_eq!(worker.invoke(|| 1), Some(1));
    }
}
