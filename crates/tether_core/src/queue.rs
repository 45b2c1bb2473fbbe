//! Per-thread message queue
//!
//! Each [`ThreadHandle`](crate::thread::ThreadHandle) owns one queue. Any
//! thread may post; only the owning thread drains. Draining swaps the whole
//! FIFO out under the lock and runs the captured tasks with the lock
//! released, so tasks can post more work (to this queue or any other)
//! without deadlocking. Work posted during a drain waits for the next one.
//!
//! A panicking task is caught, reported through
//! [`crate::error::report`], and draining continues with the next task.

use crate::config::DrainBudget;
use crate::entity::{self, EntityId};
use crate::error::{self, CoreError};
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// A unit of work posted to a thread
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Where a queued task came from, for error reports
#[derive(Debug, Clone, Copy, Default)]
pub struct TaskOrigin {
    /// Name of the signal whose emission produced the task
    pub signal: Option<&'static str>,
    /// Entity the task is delivered to
    pub receiver: Option<EntityId>,
}

impl TaskOrigin {
    fn signal_name(&self) -> String {
        self.signal.unwrap_or("<posted task>").to_string()
    }

    fn receiver_name(&self) -> String {
        match self.receiver {
            Some(id) => entity::describe(id),
            None => "<none>".to_string(),
        }
    }
}

/// A queued task plus its origin
pub(crate) struct Message {
    task: Task,
    origin: TaskOrigin,
}

impl Message {
    pub(crate) fn new(task: Task, origin: TaskOrigin) -> Self {
        Self { task, origin }
    }
}

/// Outcome of a single `drain()` call
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
    /// Tasks run, including those that panicked
    pub executed: usize,
    /// Tasks that panicked
    pub panicked: usize,
    /// Tasks still queued when the drain returned
    pub remaining: usize,
}

/// Lifetime totals for a queue
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub pending: usize,
    pub executed: u64,
    pub panicked: u64,
    pub dropped: u64,
}

struct QueueState {
    messages: VecDeque<Message>,
    /// Set by `wake()`, consumed by `wait()`
    woken: bool,
    /// Set once the owning thread has exited
    closed: bool,
}

/// FIFO of pending cross-thread work
pub struct MessageQueue {
    state: Mutex<QueueState>,
    available: Condvar,
    draining: AtomicBool,
    budget: Mutex<DrainBudget>,
    executed: AtomicU64,
    panicked: AtomicU64,
    dropped: AtomicU64,
}

impl MessageQueue {
    pub(crate) fn new(budget: DrainBudget) -> Self {
        Self {
            state: Mutex::new(QueueState {
                messages: VecDeque::new(),
                woken: false,
                closed: false,
            }),
            available: Condvar::new(),
            draining: AtomicBool::new(false),
            budget: Mutex::new(budget),
            executed: AtomicU64::new(0),
            panicked: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    /// Append a message; never blocks on the consumer
    ///
    /// Returns `false` (and drops the message) if the queue is closed.
    pub(crate) fn post(&self, message: Message) -> bool {
        let rejected = {
            let mut state = self.state.lock();
            if state.closed {
                Some(message)
            } else {
                state.messages.push_back(message);
                None
            }
        };

        match rejected {
            None => {
                self.available.notify_one();
                true
            }
            Some(message) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    signal = %message.origin.signal_name(),
                    "dropping task posted to a terminated thread"
                );
                // Dropped here, outside the lock: captured values may run arbitrary Drop code.
                drop(message);
                false
            }
        }
    }

    /// Run queued tasks, bounded by the drain budget
    pub(crate) fn drain(&self) -> DrainReport {
        if self.draining.swap(true, Ordering::AcqRel) {
            tracing::trace!("nested drain ignored");
            return DrainReport {
                remaining: self.len(),
                ..Default::default()
            };
        }
        let _draining = DrainingGuard(&self.draining);

        let budget = *self.budget.lock();
        let max_tasks = budget.max_tasks.map(|max| max.max(1));
        let max_duration = budget.max_duration();

        let mut batch = {
            let mut state = self.state.lock();
            std::mem::take(&mut state.messages)
        };
        if batch.is_empty() {
            return DrainReport::default();
        }

        tracing::trace!(queued = batch.len(), "drain start");
        let started = Instant::now();
        let mut report = DrainReport::default();

        while let Some(message) = batch.pop_front() {
            let over_count = max_tasks.is_some_and(|max| report.executed >= max);
            let over_time =
                report.executed > 0 && max_duration.is_some_and(|max| started.elapsed() >= max);
            if over_count || over_time {
                batch.push_front(message);
                break;
            }
            self.run(message, &mut report);
        }

        report.remaining = {
            let mut state = self.state.lock();
            if !batch.is_empty() {
                // Leftovers go back ahead of anything posted while we were draining.
                let newer = std::mem::replace(&mut state.messages, batch);
                state.messages.extend(newer);
            }
            state.messages.len()
        };

        tracing::trace!(
            executed = report.executed,
            panicked = report.panicked,
            remaining = report.remaining,
            "drain finished"
        );
        report
    }

    fn run(&self, message: Message, report: &mut DrainReport) {
        let Message { task, origin } = message;
        report.executed += 1;
        self.executed.fetch_add(1, Ordering::Relaxed);

        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(task)) {
            report.panicked += 1;
            self.panicked.fetch_add(1, Ordering::Relaxed);
            error::report(&CoreError::TaskPanicked {
                signal: origin.signal_name(),
                receiver: origin.receiver_name(),
                message: error::panic_message(payload.as_ref()),
            });
        }
    }

    /// Block until a message is queued, `wake()` is called, or `timeout` passes
    ///
    /// Returns `true` if there is something to do.
    pub(crate) fn wait(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        loop {
            if !state.messages.is_empty() || state.woken || state.closed {
                let ready = !state.messages.is_empty() || state.woken;
                state.woken = false;
                return ready;
            }
            if self.available.wait_until(&mut state, deadline).timed_out() {
                let ready = !state.messages.is_empty() || state.woken;
                state.woken = false;
                return ready;
            }
        }
    }

    /// Interrupt a pending `wait()`
    pub(crate) fn wake(&self) {
        self.state.lock().woken = true;
        self.available.notify_all();
    }

    /// Close the queue and drop everything still pending
    pub(crate) fn close(&self) -> usize {
        let pending = {
            let mut state = self.state.lock();
            state.closed = true;
            std::mem::take(&mut state.messages)
        };
        self.available.notify_all();
        let count = pending.len();
        self.dropped.fetch_add(count as u64, Ordering::Relaxed);
        drop(pending);
        count
    }

    pub fn len(&self) -> usize {
        self.state.lock().messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::Acquire)
    }

    pub fn budget(&self) -> DrainBudget {
        *self.budget.lock()
    }

    pub(crate) fn set_budget(&self, budget: DrainBudget) {
        *self.budget.lock() = budget;
    }

    pub fn stats(&self) -> QueueStats {
        QueueStats {
            pending: self.len(),
            executed: self.executed.load(Ordering::Relaxed),
            panicked: self.panicked.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }
}

/// Returns the queue to Idle even if a drain unwinds
struct DrainingGuard<'a>(&'a AtomicBool);

impl Drop for DrainingGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    fn message<F: FnOnce() + Send + 'static>(f: F) -> Message {
        Message::new(Box::new(f), TaskOrigin::default())
    }

    #[test]
    fn test_fifo_order() {
        let queue = MessageQueue::new(DrainBudget::unlimited());
        let order = Arc::new(Mutex::new(Vec::new()));

        for i in 0..5 {
            let order = order.clone();
            queue.post(message(move || order.lock().push(i)));
        }

        let report = queue.drain();
        assert_eq!(report.executed, 5);
        assert_eq!(report.remaining, 0);
        assert_eq!(*order.lock(), vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_budget_keeps_leftovers_in_order() {
        let queue = Arc::new(MessageQueue::new(DrainBudget::tasks(2)));
        let order = Arc::new(Mutex::new(Vec::new()));

        for i in 0..3 {
            let order = order.clone();
            queue.post(message(move || order.lock().push(i)));
        }

        let report = queue.drain();
        assert_eq!(report.executed, 2);
        assert_eq!(report.remaining, 1);

        // Posted after the first drain; must run after the leftover task.
        let late = order.clone();
        queue.post(message(move || late.lock().push(99)));

        let report = queue.drain();
        assert_eq!(report.executed, 2);
        assert_eq!(report.remaining, 0);
        assert_eq!(*order.lock(), vec![0, 1, 2, 99]);
    }

    #[test]
    fn test_nested_post_runs_next_drain() {
        let queue = Arc::new(MessageQueue::new(DrainBudget::unlimited()));
        let runs = Arc::new(AtomicUsize::new(0));

        let inner_queue = queue.clone();
        let inner_runs = runs.clone();
        queue.post(message(move || {
            inner_runs.fetch_add(1, Ordering::SeqCst);
            let runs = inner_runs.clone();
            inner_queue.post(message(move || {
                runs.fetch_add(10, Ordering::SeqCst);
            }));
        }));

        let report = queue.drain();
        assert_eq!(report.executed, 1);
        assert_eq!(report.remaining, 1);
        assert_eq!(runs.load(Ordering::SeqCst), 1);

        queue.drain();
        assert_eq!(runs.load(Ordering::SeqCst), 11);
    }

    #[test]
    fn test_nested_drain_is_ignored() {
        let queue = Arc::new(MessageQueue::new(DrainBudget::unlimited()));
        let nested = Arc::new(Mutex::new(None));

        let inner_queue = queue.clone();
        let seen = nested.clone();
        queue.post(message(move || {
            assert!(inner_queue.is_draining());
            *seen.lock() = Some(inner_queue.drain());
        }));
        queue.post(message(|| {}));

        let report = queue.drain();
        assert_eq!(report.executed, 2);
        assert!(!queue.is_draining());
        assert_eq!(nested.lock().map(|report| report.executed), Some(0));
    }

    #[test]
    fn test_panicking_task_does_not_stall_queue() {
        let queue = MessageQueue::new(DrainBudget::unlimited());
        let ran_after = Arc::new(AtomicUsize::new(0));

        queue.post(message(|| panic!("task failure")));
        let flag = ran_after.clone();
        queue.post(message(move || {
            flag.fetch_add(1, Ordering::SeqCst);
        }));

        let report = queue.drain();
        assert_eq!(report.executed, 2);
        assert_eq!(report.panicked, 1);
        assert_eq!(ran_after.load(Ordering::SeqCst), 1);
        assert_eq!(queue.stats().panicked, 1);
    }

    #[test]
    fn test_closed_queue_drops_posts() {
        let queue = MessageQueue::new(DrainBudget::default());
        queue.post(message(|| {}));
        assert_eq!(queue.close(), 1);
        assert!(queue.is_closed());
        assert!(!queue.post(message(|| {})));
        assert_eq!(queue.stats().dropped, 2);
        assert_eq!(queue.drain(), DrainReport::default());
    }

    #[test]
    fn test_wait_times_out_when_idle() {
        let queue = MessageQueue::new(DrainBudget::default());
        assert!(!queue.wait(Duration::from_millis(5)));

        queue.post(message(|| {}));
        assert!(queue.wait(Duration::from_millis(5)));
    }

    #[test]
    fn test_wake_interrupts_wait() {
        let queue = Arc::new(MessageQueue::new(DrainBudget::default()));
        let waker = queue.clone();
        let thread = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(10));
            waker.wake();
        });

        assert!(queue.wait(Duration::from_secs(5)));
        thread.join().unwrap();
    }
}
