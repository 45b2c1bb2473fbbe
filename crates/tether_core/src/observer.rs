//! Dependency tracking for computed values
//!
//! While a computed value evaluates, its [`DependencyObserver`] is installed
//! as the current observer of the evaluating thread. Every tracked read
//! (`Property::get`, `Computed::get`) calls [`add_dependency`] with the
//! changed-signal of the value being read, which connects that signal to the
//! observer's invalidate callback. Invalidation only marks the owner stale;
//! nothing is recomputed until the next read.
//!
//! Scopes nest: entering a scope saves the previous observer and dropping
//! the guard restores it, so a computed value may read another computed
//! value while evaluating. Exactly one observer is active per thread.

use crate::connection::ConnectionHandle;
use crate::entity::{AsEntity, Entity};
use crate::signal::{Signal, SignalId};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::cell::RefCell;
use std::fmt;
use std::marker::PhantomData;
use std::sync::{Arc, Weak};

/// Receives invalidation when a tracked dependency changes
pub trait Invalidate: Send + Sync {
    fn invalidate(&self);
}

thread_local! {
    static CURRENT_OBSERVER: RefCell<Option<Arc<DependencyObserver>>> = const { RefCell::new(None) };
}

/// Records which signals were read during an evaluation
///
/// The observer is an entity in its own right: dependency connections use
/// it as their receiver, so invalidations are delivered on the thread the
/// observer was created on. After that thread exits they run on the
/// emitting thread instead.
pub struct DependencyObserver {
    entity: Entity,
    target: Weak<dyn Invalidate>,
    dependencies: Mutex<FxHashMap<SignalId, ConnectionHandle>>,
}

impl DependencyObserver {
    /// Create an observer that invalidates `target`, bound to the calling thread
    pub fn new(target: Weak<dyn Invalidate>) -> Arc<Self> {
        Self::with_entity(Entity::named("observer"), target)
    }

    pub(crate) fn with_entity(entity: Entity, target: Weak<dyn Invalidate>) -> Arc<Self> {
        // Invalidate targets are Send + Sync; once this thread is gone they
        // are invalidated from the emitting thread.
        entity.set_inline_after_exit(true);
        Arc::new(Self {
            entity,
            target,
            dependencies: Mutex::new(FxHashMap::default()),
        })
    }

    /// Connect `signal` to this observer unless it is already tracked
    ///
    /// Returns `true` if a new connection was made.
    pub fn track<A>(&self, signal: &Signal<A>) -> bool
    where
        A: Clone + Send + 'static,
    {
        let mut dependencies = self.dependencies.lock();
        if dependencies
            .get(&signal.id())
            .is_some_and(ConnectionHandle::is_connected)
        {
            return false;
        }

        let target = self.target.clone();
        let handle = signal.connect(&self.entity, move |_| {
            if let Some(target) = target.upgrade() {
                target.invalidate();
            }
        });
        tracing::trace!(signal = signal.name(), "dependency tracked");
        dependencies.insert(signal.id(), handle);
        true
    }

    /// Drop every dependency connection
    pub fn clear(&self) {
        let dependencies = std::mem::take(&mut *self.dependencies.lock());
        for handle in dependencies.values() {
            handle.disconnect();
        }
    }

    /// Number of live dependency connections
    pub fn dependency_count(&self) -> usize {
        self.dependencies
            .lock()
            .values()
            .filter(|handle| handle.is_connected())
            .count()
    }

    pub fn depends_on(&self, signal: SignalId) -> bool {
        self.dependencies
            .lock()
            .get(&signal)
            .is_some_and(ConnectionHandle::is_connected)
    }

    /// Invalidate the target now, as if a dependency had changed
    pub fn invalidate(&self) {
        if let Some(target) = self.target.upgrade() {
            target.invalidate();
        }
    }
}

impl AsEntity for DependencyObserver {
    fn entity(&self) -> &Entity {
        &self.entity
    }
}

impl Drop for DependencyObserver {
    fn drop(&mut self) {
        self.clear();
    }
}

impl fmt::Debug for DependencyObserver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DependencyObserver")
            .field("entity", &self.entity)
            .field("dependencies", &self.dependencies.lock().len())
            .finish()
    }
}

/// Installs an observer (or none) as current until dropped
///
/// Bound to the thread it was created on.
pub struct ObserverScope {
    previous: Option<Arc<DependencyObserver>>,
    _not_send: PhantomData<*const ()>,
}

impl ObserverScope {
    /// Make `observer` the current observer
    pub fn enter(observer: &Arc<DependencyObserver>) -> Self {
        Self::replace(Some(observer.clone()))
    }

    /// Run with no current observer, so reads are not tracked
    pub fn suspend() -> Self {
        Self::replace(None)
    }

    fn replace(observer: Option<Arc<DependencyObserver>>) -> Self {
        let previous = CURRENT_OBSERVER.with(|current| current.replace(observer));
        Self {
            previous,
            _not_send: PhantomData,
        }
    }
}

impl Drop for ObserverScope {
    fn drop(&mut self) {
        let previous = self.previous.take();
        let ours = CURRENT_OBSERVER.with(|current| current.replace(previous));
        drop(ours);
    }
}

/// The observer installed on this thread, if any
pub fn current_observer() -> Option<Arc<DependencyObserver>> {
    CURRENT_OBSERVER.with(|current| current.borrow().clone())
}

/// Record `signal` as a dependency of the current observer
///
/// Does nothing outside an evaluation. Returns `true` if a new dependency
/// was recorded.
pub fn add_dependency<A>(signal: &Signal<A>) -> bool
where
    A: Clone + Send + 'static,
{
    match current_observer() {
        Some(observer) => observer.track(signal),
        None => false,
    }
}

/// Run `f` without recording dependencies
pub fn untracked<R>(f: impl FnOnce() -> R) -> R {
    let _scope = ObserverScope::suspend();
    f()
}
