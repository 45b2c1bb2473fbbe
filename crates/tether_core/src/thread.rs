//! Thread handles and the process-wide thread registry
//!
//! Every thread that touches the core gets exactly one [`ThreadHandle`],
//! created lazily the first time [`current_thread()`] runs on it. The handle
//! owns the thread's [`MessageQueue`]; entities remember the handle of the
//! thread they were built on and never move.
//!
//! # Registry lifetime
//!
//! The registry is a lock-protected map from OS thread id to handle. An
//! entry is inserted on first use and removed only when the thread exits
//! (its thread-local registration is torn down). At that point the queue is
//! closed: pending tasks are dropped and later posts are rejected. Handles
//! held elsewhere (by entities, for example) stay valid as identities.

use crate::config::{self, DrainBudget};
use crate::error::{usage_error, CoreError};
use crate::queue::{DrainReport, Message, MessageQueue, QueueStats, Task, TaskOrigin};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, LazyLock};
use std::thread::ThreadId;
use std::time::Duration;

/// Process-wide registry: OS thread id -> handle
static REGISTRY: LazyLock<Mutex<FxHashMap<ThreadId, ThreadHandle>>> =
    LazyLock::new(|| Mutex::new(FxHashMap::default()));

/// Source of the small numeric ordinals used in thread names
static NEXT_ORDINAL: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static REGISTRATION: Registration = Registration::register();
}

/// Owns this thread's registry entry; tears it down at thread exit
struct Registration {
    handle: ThreadHandle,
}

impl Registration {
    fn register() -> Self {
        let handle = ThreadHandle::for_current_os_thread();
        REGISTRY.lock().insert(handle.id(), handle.clone());
        tracing::debug!(thread = %handle.name(), "thread registered");
        Self { handle }
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        REGISTRY.lock().remove(&self.handle.id());
        let dropped = self.handle.inner.queue.close();
        tracing::debug!(
            thread = %self.handle.name(),
            dropped,
            "thread unregistered"
        );
    }
}

/// Return the calling thread's handle, registering the thread on first use
///
/// During thread teardown (after the registration has been destroyed) this
/// returns a fresh, already-terminated handle that matches no other thread.
pub fn current_thread() -> ThreadHandle {
    REGISTRATION
        .try_with(|registration| registration.handle.clone())
        .unwrap_or_else(|_| {
            let handle = ThreadHandle::for_current_os_thread();
            handle.inner.queue.close();
            handle
        })
}

/// Look up a registered thread by OS id
pub fn find_thread(id: ThreadId) -> Option<ThreadHandle> {
    REGISTRY.lock().get(&id).cloned()
}

/// Number of threads currently registered
pub fn registered_thread_count() -> usize {
    REGISTRY.lock().len()
}

struct ThreadInner {
    id: ThreadId,
    ordinal: u64,
    name: String,
    queue: MessageQueue,
}

/// One OS thread's identity and message queue
///
/// Cheap to clone; clones compare equal. Equality is identity: two handles
/// are equal exactly when they refer to the same registration.
#[derive(Clone)]
pub struct ThreadHandle {
    inner: Arc<ThreadInner>,
}

impl ThreadHandle {
    fn for_current_os_thread() -> Self {
        let os_thread = std::thread::current();
        let ordinal = NEXT_ORDINAL.fetch_add(1, Ordering::Relaxed);
        let name = os_thread
            .name()
            .map(str::to_string)
            .unwrap_or_else(|| format!("thread-{}", ordinal));

        Self {
            inner: Arc::new(ThreadInner {
                id: os_thread.id(),
                ordinal,
                name,
                queue: MessageQueue::new(config::current().drain),
            }),
        }
    }

    /// OS thread id
    pub fn id(&self) -> ThreadId {
        self.inner.id
    }

    /// Registration order (1 for the first registered thread)
    pub fn ordinal(&self) -> u64 {
        self.inner.ordinal
    }

    /// Thread name, or `thread-<ordinal>` for unnamed threads
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Whether the calling thread is this thread
    pub fn is_current(&self) -> bool {
        *self == current_thread()
    }

    /// Whether the thread has exited
    pub fn is_terminated(&self) -> bool {
        self.inner.queue.is_closed()
    }

    /// Queue a task to run on this thread's next `drain()`
    ///
    /// Never blocks. Returns `false` if the thread has exited, in which case
    /// the task is dropped.
    pub fn post<F>(&self, task: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        self.post_task(Box::new(task), TaskOrigin::default())
    }

    pub(crate) fn post_task(&self, task: Task, origin: TaskOrigin) -> bool {
        self.inner.queue.post(Message::new(task, origin))
    }

    /// Run queued tasks on this thread, bounded by the drain budget
    ///
    /// Must be called from the thread this handle represents; calling it from
    /// elsewhere is a usage error and runs nothing.
    pub fn drain(&self) -> DrainReport {
        let current = current_thread();
        if *self != current {
            usage_error(CoreError::WrongThread {
                operation: "drain",
                expected: self.name().to_string(),
                actual: current.name().to_string(),
            });
            return DrainReport {
                remaining: self.pending(),
                ..Default::default()
            };
        }
        self.inner.queue.drain()
    }

    /// Block until work arrives, `wake()` is called, or `timeout` passes
    pub fn wait(&self, timeout: Duration) -> bool {
        self.inner.queue.wait(timeout)
    }

    /// Interrupt a `wait()` in progress (or make the next one return at once)
    pub fn wake(&self) {
        self.inner.queue.wake();
    }

    /// Number of queued tasks
    pub fn pending(&self) -> usize {
        self.inner.queue.len()
    }

    pub fn drain_budget(&self) -> DrainBudget {
        self.inner.queue.budget()
    }

    /// Override the drain budget for this thread only
    pub fn set_drain_budget(&self, budget: DrainBudget) {
        self.inner.queue.set_budget(budget);
    }

    pub fn stats(&self) -> QueueStats {
        self.inner.queue.stats()
    }
}

impl PartialEq for ThreadHandle {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for ThreadHandle {}

impl Hash for ThreadHandle {
    fn hash<H: Hasher>(&self, state: &mut H) {
        Arc::as_ptr(&self.inner).hash(state);
    }
}

impl fmt::Debug for ThreadHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadHandle")
            .field("name", &self.inner.name)
            .field("id", &self.inner.id)
            .field("pending", &self.pending())
            .finish()
    }
}
