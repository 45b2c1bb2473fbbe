//! Signals: typed, thread-aware notification sources
//!
//! A [`Signal`] is owned by an entity and keeps an ordered list of
//! connections. Emission works on a snapshot of that list, so callbacks may
//! connect or disconnect freely while it runs. For every live connection:
//!
//! - receiver on the emitting thread (or with direct delivery enabled):
//!   the callback runs synchronously, in connection order, and a panic
//!   propagates to the caller of `emit`
//! - receiver on another thread: the callback and a clone of the arguments
//!   are posted to the receiver's queue and run on its next `drain()`
//!
//! No lock is held while a callback runs.
//!
//! # Example
//!
//! ```
//! use std::sync::atomic::{AtomicI32, Ordering};
//! use std::sync::Arc;
//! use tether_core::{Entity, Signal};
//!
//! let sender = Entity::named("sender");
//! let receiver = Entity::named("receiver");
//! let changed: Signal<i32> = Signal::named(&sender, "changed");
//!
//! let last = Arc::new(AtomicI32::new(0));
//! let seen = last.clone();
//! changed.connect(&receiver, move |value| seen.store(*value, Ordering::SeqCst));
//!
//! sender.emit(&changed, 42);
//! assert_eq!(last.load(Ordering::SeqCst), 42);
//! ```

use crate::connection::{ConnectionCore, ConnectionHandle, Disposable};
use crate::entity::{AsEntity, Entity, EntityId, WeakEntity};
use crate::queue::TaskOrigin;
use crate::thread::current_thread;
use parking_lot::Mutex;
use smallvec::SmallVec;
use std::cell::RefCell;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

/// Unique identifier for a signal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SignalId(u64);

static NEXT_SIGNAL_ID: AtomicU64 = AtomicU64::new(1);

impl SignalId {
    fn next() -> Self {
        SignalId(NEXT_SIGNAL_ID.fetch_add(1, Ordering::Relaxed))
    }
}

thread_local! {
    /// Signals mid-emission on this thread, innermost last
    static EMITTING: RefCell<SmallVec<[SignalId; 8]>> = RefCell::new(SmallVec::new());
}

/// Tracks a signal as mid-emission on this thread until dropped
struct EmissionGuard;

impl EmissionGuard {
    fn enter(id: SignalId) -> Self {
        EMITTING.with(|stack| stack.borrow_mut().push(id));
        EmissionGuard
    }
}

impl Drop for EmissionGuard {
    fn drop(&mut self) {
        EMITTING.with(|stack| {
            stack.borrow_mut().pop();
        });
    }
}

/// Prune disposed entries on connect once the list reaches this length
const PRUNE_THRESHOLD: usize = 8;

type ConnectionRef<A> = Arc<ConnectionCore<A>>;

struct ConnectionList<A> {
    entries: SmallVec<[ConnectionRef<A>; 4]>,
    /// Length at which the next connect prunes; doubles with the live count
    prune_at: usize,
}

impl<A> ConnectionList<A> {
    fn push(&mut self, connection: ConnectionRef<A>) {
        if self.entries.len() >= self.prune_at {
            self.prune();
            self.prune_at = (self.entries.len() * 2).max(PRUNE_THRESHOLD);
        }
        self.entries.push(connection);
    }

    fn prune(&mut self) -> usize {
        let before = self.entries.len();
        self.entries.retain(|connection| !connection.is_disposed());
        before - self.entries.len()
    }
}

pub(crate) struct SignalCore<A> {
    id: SignalId,
    name: &'static str,
    owner: WeakEntity,
    owner_id: EntityId,
    disposed: AtomicBool,
    connections: Mutex<ConnectionList<A>>,
}

impl<A> SignalCore<A> {
    /// Remove disposed connections from the live list
    fn prune(&self) {
        let pruned = self.connections.lock().prune();
        if pruned > 0 {
            tracing::trace!(signal = self.name, pruned, "pruned connections");
        }
    }

    /// Take connections matching `predicate` out of the list and dispose them
    fn remove_where(&self, predicate: impl Fn(&ConnectionCore<A>) -> bool) -> usize {
        let removed: SmallVec<[ConnectionRef<A>; 4]> = {
            let mut list = self.connections.lock();
            let (removed, kept) = std::mem::take(&mut list.entries)
                .into_iter()
                .partition(|connection| predicate(connection));
            list.entries = kept;
            removed
        };
        for connection in &removed {
            connection.dispose();
        }
        removed.len()
    }
}

impl<A> Disposable for SignalCore<A> {
    fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        let removed = self.remove_where(|_| true);
        tracing::trace!(signal = self.name, removed, "signal disposed");
    }

    fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }
}

/// A notification source owned by an entity
///
/// `A` is the argument type handed to every callback by reference. Multiple
/// arguments are expressed as a tuple. Cross-thread delivery clones `A` once
/// per queued connection.
///
/// Dropping the signal disposes all of its connections, as does destroying
/// its owner.
pub struct Signal<A> {
    core: Arc<SignalCore<A>>,
}

impl<A> Signal<A>
where
    A: Clone + Send + 'static,
{
    /// Create an unnamed signal owned by `owner`
    pub fn new(owner: &impl AsEntity) -> Self {
        Self::named(owner, "signal")
    }

    /// Create a signal owned by `owner`; the name appears in logs and error reports
    pub fn named(owner: &impl AsEntity, name: &'static str) -> Self {
        let owner = owner.entity();
        let core = Arc::new(SignalCore {
            id: SignalId::next(),
            name,
            owner: owner.downgrade(),
            owner_id: owner.id(),
            disposed: AtomicBool::new(false),
            connections: Mutex::new(ConnectionList {
                entries: SmallVec::new(),
                prune_at: PRUNE_THRESHOLD,
            }),
        });

        let weak: Weak<SignalCore<A>> = Arc::downgrade(&core);
        let weak: Weak<dyn Disposable> = weak;
        owner.track_signal(weak);

        Self { core }
    }

    pub fn id(&self) -> SignalId {
        self.core.id
    }

    pub fn name(&self) -> &'static str {
        self.core.name
    }

    /// The owning entity, if it is still alive
    pub fn owner(&self) -> Option<Entity> {
        self.core.owner.upgrade()
    }

    pub(crate) fn owner_id(&self) -> EntityId {
        self.core.owner_id
    }

    /// Whether the signal has been disposed (dropped or owner destroyed)
    pub fn is_disposed(&self) -> bool {
        self.core.is_disposed()
    }

    /// Connect `callback` to this signal, delivering on `receiver`'s thread
    ///
    /// Connecting to a disposed signal is not an error: nothing is
    /// registered and the returned handle reports itself disconnected.
    pub fn connect<F>(&self, receiver: &impl AsEntity, callback: F) -> ConnectionHandle
    where
        F: Fn(&A) + Send + Sync + 'static,
    {
        if self.core.is_disposed() {
            tracing::trace!(signal = self.core.name, "connect to disposed signal ignored");
            return ConnectionHandle::disposed();
        }

        let receiver = receiver.entity();
        let connection = Arc::new(ConnectionCore::new(
            self.core.id,
            self.core.name,
            receiver,
            Arc::new(callback),
        ));

        {
            let mut list = self.core.connections.lock();
            // Disposal may have won the race since the check above.
            if self.core.is_disposed() {
                drop(list);
                connection.dispose();
                return ConnectionHandle::disposed();
            }
            list.push(connection.clone());
        }

        let weak: Weak<ConnectionCore<A>> = Arc::downgrade(&connection);
        let weak: Weak<dyn Disposable> = weak;
        receiver.track_incoming(weak);

        tracing::trace!(
            signal = connection.signal_name(),
            receiver = ?connection.receiver_id(),
            "connected"
        );
        ConnectionHandle::new(&connection)
    }

    /// Notify every live connection
    ///
    /// Does nothing if the signal is disposed, its owner is gone, or the
    /// owner has signals disabled.
    pub fn emit(&self, args: A) {
        if self.core.is_disposed() {
            return;
        }
        // Holding the owner keeps it (and so this signal) alive until we return.
        let Some(owner) = self.core.owner.upgrade() else {
            return;
        };
        if !owner.signals_enabled() {
            return;
        }

        let snapshot: SmallVec<[ConnectionRef<A>; 4]> =
            self.core.connections.lock().entries.clone();
        if snapshot.is_empty() {
            return;
        }

        let current = current_thread();
        {
            let _emitting = EmissionGuard::enter(self.core.id);
            for connection in &snapshot {
                if connection.is_disposed() {
                    continue;
                }
                let Some(receiver) = connection.receiver() else {
                    connection.dispose();
                    continue;
                };

                if *receiver.thread() == current || receiver.direct_delivery() {
                    drop(receiver);
                    connection.invoke(&args);
                } else {
                    let queued = connection.clone();
                    let queued_args = args.clone();
                    let origin = TaskOrigin {
                        signal: Some(connection.signal_name()),
                        receiver: Some(connection.receiver_id()),
                    };
                    let posted = receiver.thread().post_task(
                        Box::new(move || {
                            queued.invoke(&queued_args);
                        }),
                        origin,
                    );
                    if !posted && receiver.inline_after_exit() {
                        drop(receiver);
                        connection.invoke(&args);
                    }
                }
            }
        }

        if snapshot.iter().any(|connection| connection.is_disposed()) {
            drop(snapshot);
            self.core.prune();
        }
    }

    /// Whether this signal is being emitted further up the current thread's stack
    pub fn is_emitting(&self) -> bool {
        let id = self.core.id;
        EMITTING.with(|stack| stack.borrow().contains(&id))
    }

    /// Number of connections that can still deliver
    pub fn connection_count(&self) -> usize {
        self.core
            .connections
            .lock()
            .entries
            .iter()
            .filter(|connection| connection.is_live())
            .count()
    }

    pub fn has_connections(&self) -> bool {
        self.connection_count() > 0
    }

    /// Dispose every connection; the signal stays usable
    pub fn disconnect_all(&self) -> usize {
        self.core.remove_where(|_| true)
    }

    /// Dispose every connection delivering to `receiver`
    pub fn disconnect_receiver(&self, receiver: &impl AsEntity) -> usize {
        let id = receiver.entity().id();
        self.core
            .remove_where(|connection| connection.receiver_id() == id)
    }
}

impl<A> Drop for Signal<A> {
    fn drop(&mut self) {
        self.core.dispose();
    }
}

impl<A> fmt::Debug for Signal<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Signal")
            .field("id", &self.core.id)
            .field("name", &self.core.name)
            .field("owner", &self.core.owner_id)
            .finish()
    }
}

/// Connect `callback` to `signal`, delivering on `receiver`'s thread
pub fn connect<A, F>(signal: &Signal<A>, receiver: &impl AsEntity, callback: F) -> ConnectionHandle
where
    A: Clone + Send + 'static,
    F: Fn(&A) + Send + Sync + 'static,
{
    signal.connect(receiver, callback)
}

/// Emit `signal` with `args`
pub fn emit<A>(signal: &Signal<A>, args: A)
where
    A: Clone + Send + 'static,
{
    signal.emit(args);
}
