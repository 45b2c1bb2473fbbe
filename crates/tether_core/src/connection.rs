//! Connection records and handles
//!
//! A connection binds one signal to one receiving entity and a callback.
//! The signal's list holds the only strong reference to the record; the
//! receiver and any [`ConnectionHandle`] hold weak ones. Disposal is an
//! atomic flag flip plus dropping the callback, so it can race freely with
//! an emission on another thread: every invocation re-checks the flag.

use crate::entity::{Entity, EntityId, WeakEntity};
use crate::signal::SignalId;
use parking_lot::Mutex;
use smallvec::SmallVec;
use std::cell::RefCell;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

/// Something that can be torn down exactly once, from any thread
pub(crate) trait Disposable: Send + Sync {
    fn dispose(&self);
    fn is_disposed(&self) -> bool;
}

pub(crate) type Callback<A> = Arc<dyn Fn(&A) + Send + Sync>;

thread_local! {
    /// Connections whose callbacks are running on this thread, innermost last
    static CURRENT_CONNECTION: RefCell<SmallVec<[Arc<dyn Disposable>; 4]>> =
        RefCell::new(SmallVec::new());
}

pub(crate) struct ConnectionCore<A> {
    signal_id: SignalId,
    signal_name: &'static str,
    receiver: WeakEntity,
    receiver_id: EntityId,
    disposed: AtomicBool,
    callback: Mutex<Option<Callback<A>>>,
}

impl<A> ConnectionCore<A> {
    pub(crate) fn new(
        signal_id: SignalId,
        signal_name: &'static str,
        receiver: &Entity,
        callback: Callback<A>,
    ) -> Self {
        Self {
            signal_id,
            signal_name,
            receiver: receiver.downgrade(),
            receiver_id: receiver.id(),
            disposed: AtomicBool::new(false),
            callback: Mutex::new(Some(callback)),
        }
    }

    pub(crate) fn signal_name(&self) -> &'static str {
        self.signal_name
    }

    pub(crate) fn receiver_id(&self) -> EntityId {
        self.receiver_id
    }

    /// The receiver, or `None` once it has been destroyed
    pub(crate) fn receiver(&self) -> Option<Entity> {
        self.receiver.upgrade()
    }

    /// Whether the connection can still deliver
    pub(crate) fn is_live(&self) -> bool {
        !self.is_disposed() && !self.receiver.is_dead()
    }

    /// Run the callback if the connection is still live
    ///
    /// The receiver is kept alive for the duration of the call. Returns
    /// whether the callback ran.
    pub(crate) fn invoke(self: &Arc<Self>, args: &A) -> bool
    where
        A: 'static,
    {
        if self.is_disposed() {
            return false;
        }
        let Some(_receiver) = self.receiver.upgrade() else {
            self.dispose();
            return false;
        };
        // Clone out so a dispose during the call can't pull the closure from under us.
        let Some(callback) = self.callback.lock().clone() else {
            return false;
        };

        let _current = CurrentConnection::enter(self.clone());
        callback(args);
        true
    }
}

impl<A> Disposable for ConnectionCore<A> {
    fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        let callback = self.callback.lock().take();
        tracing::trace!(
            signal = self.signal_name,
            signal_id = ?self.signal_id,
            "connection disposed"
        );
        // Dropped outside the lock; captured state may run arbitrary Drop code.
        drop(callback);
    }

    fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }
}

/// Marks a connection as the one being invoked on this thread
struct CurrentConnection;

impl CurrentConnection {
    fn enter(connection: Arc<dyn Disposable>) -> Self {
        CURRENT_CONNECTION.with(|stack| stack.borrow_mut().push(connection));
        CurrentConnection
    }
}

impl Drop for CurrentConnection {
    fn drop(&mut self) {
        let popped = CURRENT_CONNECTION.with(|stack| stack.borrow_mut().pop());
        drop(popped);
    }
}

/// Disconnect the connection whose callback is currently running
///
/// Works for synchronous and queued delivery alike. Returns `false` when
/// called outside a callback or when the connection was already
/// disconnected.
pub fn disconnect_current() -> bool {
    let current = CURRENT_CONNECTION.with(|stack| stack.borrow().last().cloned());
    match current {
        Some(connection) if !connection.is_disposed() => {
            connection.dispose();
            true
        }
        _ => false,
    }
}

/// A handle to a connection, returned by `connect`
///
/// Dropping the handle does not disconnect; use [`ConnectionHandle::scoped`]
/// for that.
#[derive(Clone)]
pub struct ConnectionHandle {
    core: Weak<dyn Disposable>,
}

impl ConnectionHandle {
    pub(crate) fn new<A: 'static>(core: &Arc<ConnectionCore<A>>) -> Self {
        let core: Arc<dyn Disposable> = core.clone();
        Self {
            core: Arc::downgrade(&core),
        }
    }

    /// A handle that refers to nothing and reports itself disconnected
    pub fn disposed() -> Self {
        let core: Weak<dyn Disposable> = Weak::<ConnectionCore<()>>::new();
        Self { core }
    }

    /// Dispose the connection; idempotent
    pub fn disconnect(&self) {
        if let Some(core) = self.core.upgrade() {
            core.dispose();
        }
    }

    pub fn is_connected(&self) -> bool {
        self.core
            .upgrade()
            .is_some_and(|core| !core.is_disposed())
    }

    /// Turn into a guard that disconnects when dropped
    pub fn scoped(self) -> ScopedConnection {
        ScopedConnection {
            handle: Some(self),
        }
    }
}

impl fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("connected", &self.is_connected())
            .finish()
    }
}

/// Disconnects its connection when dropped
#[derive(Debug)]
#[must_use = "dropping a ScopedConnection disconnects it immediately"]
pub struct ScopedConnection {
    handle: Option<ConnectionHandle>,
}

impl ScopedConnection {
    pub fn is_connected(&self) -> bool {
        self.handle
            .as_ref()
            .is_some_and(ConnectionHandle::is_connected)
    }

    /// Give up the guard without disconnecting
    pub fn release(mut self) -> ConnectionHandle {
        self.handle.take().unwrap_or_else(ConnectionHandle::disposed)
    }
}

impl Drop for ScopedConnection {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.disconnect();
        }
    }
}
