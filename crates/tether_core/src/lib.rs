//! Tether Core
//!
//! Thread-affine notification and reactive-dependency primitives:
//!
//! - **Entities**: notification participants bound to the thread that
//!   created them
//! - **Signals**: typed notification sources; same-thread receivers are
//!   called synchronously, receivers on other threads get a queued task
//! - **Message Queues**: per-thread FIFOs of cross-thread work, drained
//!   cooperatively by the owning thread
//! - **Properties**: stored values that notify on change
//! - **Computed values**: lazy, cached values that discover their own
//!   dependencies while evaluating
//!
//! Connections hold only weak references to both ends, so destroying either
//! side disconnects silently.
//!
//! # Example
//!
//! ```rust
//! use tether_core::{Computed, Entity, Property};
//!
//! let count = Property::new(1);
//! let doubled = {
//!     let count = count.clone();
//!     Computed::new(move || count.get() * 2)
//! };
//!
//! let view = Entity::named("view");
//! count.observe(&view, |value| println!("count is now {value}"));
//!
//! count.set(5);
//! assert_eq!(doubled.get(), 10);
//! ```
//!
//! # Threads
//!
//! Each thread that uses the core owns one [`ThreadHandle`]. A callback for
//! a receiver on another thread waits in that thread's queue until the
//! thread calls [`ThreadHandle::drain`] (or [`runtime::process_events`], or
//! runs an [`EventLoop`]).
//!
//! ```rust
//! use std::sync::atomic::{AtomicI32, Ordering};
//! use std::sync::Arc;
//! use tether_core::{Entity, Signal, WorkerThread};
//!
//! let worker = WorkerThread::spawn("worker").unwrap();
//! let receiver = worker.invoke(Entity::new).unwrap();
//!
//! let sender = Entity::new();
//! let changed: Signal<i32> = Signal::named(&sender, "changed");
//! let seen = Arc::new(AtomicI32::new(0));
//! let s = seen.clone();
//! changed.connect(&receiver, move |v| s.store(*v, Ordering::SeqCst));
//!
//! sender.emit(&changed, 42);
//! // The worker's loop drains its queue; wait for it to get there.
//! worker.invoke(|| ()).unwrap();
//! assert_eq!(seen.load(Ordering::SeqCst), 42);
//! ```

pub mod computed;
pub mod config;
pub mod connection;
pub mod entity;
pub mod error;
pub mod event_loop;
pub mod observer;
pub mod property;
pub mod queue;
pub mod runtime;
pub mod signal;
pub mod thread;

pub use computed::Computed;
pub use config::{CoreConfig, DrainBudget, EventLoopConfig};
pub use connection::{disconnect_current, ConnectionHandle, ScopedConnection};
pub use entity::{bound_thread, AsEntity, Entity, EntityId, WeakEntity};
pub use error::{
    clear_error_reporter, report, set_error_reporter, usage_error, CoreError, Result,
    UsageErrorPolicy,
};
pub use event_loop::{EventLoop, LoopHandle, WorkerThread};
pub use observer::{
    add_dependency, current_observer, untracked, DependencyObserver, Invalidate, ObserverScope,
};
pub use property::{bind_bidirectional, Property, PropertyWriteScope};
pub use queue::{DrainReport, QueueStats, Task, TaskOrigin};
pub use runtime::RuntimeStats;
pub use signal::{connect, emit, Signal, SignalId};
pub use thread::{current_thread, ThreadHandle};
