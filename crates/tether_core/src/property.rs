//! Stored reactive values
//!
//! A [`Property`] holds a value and a `changed` signal. Reads made while a
//! computed value evaluates are recorded as dependencies; writes store the
//! new value and emit `changed` with it.
//!
//! # Write policy
//!
//! - `set`/`update` compare with `PartialEq` and skip the write (and the
//!   notification) when the value is unchanged.
//! - A `set` issued while this property's `changed` signal is mid-emission
//!   on the calling thread is a feedback write. It is dropped with a warning
//!   instead of recursing.
//! - [`PropertyWriteScope`] always notifies when it ends, since the caller
//!   mutated the value in place.
//!
//! # Example
//!
//! ```
//! use tether_core::{Computed, Property};
//!
//! let a = Property::new(1);
//! let b = Property::new(2);
//! let sum = {
//!     let (a, b) = (a.clone(), b.clone());
//!     Computed::new(move || a.get() + b.get())
//! };
//!
//! assert_eq!(sum.get(), 3);
//! a.set(5);
//! assert!(!sum.is_valid());
//! assert_eq!(sum.get(), 8);
//! ```

use crate::connection::ConnectionHandle;
use crate::entity::{AsEntity, Entity};
use crate::observer::add_dependency;
use crate::signal::Signal;
use parking_lot::{RwLock, RwLockWriteGuard};
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Weak};

struct PropertyCore<T> {
    value: RwLock<T>,
    changed: Signal<T>,
    entity: Entity,
}

/// A stored value that notifies on change
///
/// Cheap to clone; clones share the value. The property is bound to the
/// thread it was created on: connections made to it as a receiver (through
/// bindings) deliver there.
pub struct Property<T> {
    core: Arc<PropertyCore<T>>,
}

impl<T> Property<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new(value: T) -> Self {
        Self::with_entity(Entity::new(), value)
    }

    /// Create a property whose name appears in logs and error reports
    pub fn named(name: &str, value: T) -> Self {
        Self::with_entity(Entity::named(name), value)
    }

    fn with_entity(entity: Entity, value: T) -> Self {
        let changed = Signal::named(&entity, "changed");
        Self {
            core: Arc::new(PropertyCore {
                value: RwLock::new(value),
                changed,
                entity,
            }),
        }
    }

    /// Current value; recorded as a dependency inside an evaluation
    pub fn get(&self) -> T {
        add_dependency(&self.core.changed);
        self.core.value.read().clone()
    }

    /// Borrow the current value; recorded as a dependency inside an evaluation
    pub fn with<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        add_dependency(&self.core.changed);
        f(&*self.core.value.read())
    }

    /// Current value, never recorded as a dependency
    pub fn get_untracked(&self) -> T {
        self.core.value.read().clone()
    }

    /// Emitted with the new value after every write
    pub fn changed(&self) -> &Signal<T> {
        &self.core.changed
    }

    /// Mutate in place; `changed` is emitted once when the scope ends
    ///
    /// Other readers block until the scope is dropped.
    pub fn write_scope(&self) -> PropertyWriteScope<'_, T> {
        PropertyWriteScope {
            property: self,
            guard: Some(self.core.value.write()),
        }
    }

    /// Call `callback` with the current value now and with every new value after
    pub fn observe<F>(&self, receiver: &impl AsEntity, callback: F) -> ConnectionHandle
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let callback = Arc::new(callback);
        callback(&self.get_untracked());
        let on_change = callback.clone();
        self.core
            .changed
            .connect(receiver, move |value: &T| on_change(value))
    }

    fn from_core(core: Arc<PropertyCore<T>>) -> Self {
        Self { core }
    }

    fn downgrade(&self) -> Weak<PropertyCore<T>> {
        Arc::downgrade(&self.core)
    }
}

impl<T> Property<T>
where
    T: Clone + PartialEq + Send + Sync + 'static,
{
    /// Store `value` and notify, unless it equals the current value
    ///
    /// Returns whether the value was written. A feedback write (this
    /// property's `changed` is mid-emission on the calling thread) is
    /// dropped and returns `false`.
    pub fn set(&self, value: T) -> bool {
        {
            let mut current = self.core.value.write();
            if *current == value {
                return false;
            }
            if self.core.changed.is_emitting() {
                drop(current);
                tracing::warn!(
                    property = ?self.core.entity.id(),
                    "feedback write during change notification ignored"
                );
                return false;
            }
            *current = value.clone();
        }
        self.core.changed.emit(value);
        true
    }

    /// Set from the current value
    pub fn update(&self, f: impl FnOnce(&T) -> T) -> bool {
        let next = f(&*self.core.value.read());
        self.set(next)
    }

    /// Keep `target` equal to this property
    ///
    /// `target` takes the current value now and every new value after,
    /// delivered on the target's thread.
    pub fn bind_to(&self, target: &Property<T>) -> ConnectionHandle {
        target.set(self.get_untracked());
        let weak = target.downgrade();
        self.core
            .changed
            .connect(&target.core.entity, move |value: &T| {
                if let Some(core) = weak.upgrade() {
                    Property::from_core(core).set(value.clone());
                }
            })
    }
}

impl<T: Default + Clone + Send + Sync + 'static> Default for Property<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T> Clone for Property<T> {
    fn clone(&self) -> Self {
        Self {
            core: self.core.clone(),
        }
    }
}

impl<T> AsEntity for Property<T> {
    fn entity(&self) -> &Entity {
        &self.core.entity
    }
}

impl<T: fmt::Debug> fmt::Debug for Property<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut s = f.debug_struct("Property");
        s.field("entity", &self.core.entity.id());
        match self.core.value.try_read() {
            Some(value) => s.field("value", &*value),
            None => s.field("value", &"<locked>"),
        };
        s.finish()
    }
}

/// Keep two properties equal in both directions
///
/// `b` takes `a`'s current value first. Update cycles stop at the first
/// write that leaves a value unchanged.
pub fn bind_bidirectional<T>(a: &Property<T>, b: &Property<T>) -> (ConnectionHandle, ConnectionHandle)
where
    T: Clone + PartialEq + Send + Sync + 'static,
{
    let forward = a.bind_to(b);
    let backward = b.bind_to(a);
    (forward, backward)
}

/// Exclusive in-place access to a property's value
///
/// Emits `changed` once when dropped, even if nothing was modified.
pub struct PropertyWriteScope<'a, T>
where
    T: Clone + Send + Sync + 'static,
{
    property: &'a Property<T>,
    guard: Option<RwLockWriteGuard<'a, T>>,
}

impl<T> Deref for PropertyWriteScope<'_, T>
where
    T: Clone + Send + Sync + 'static,
{
    type Target = T;

    fn deref(&self) -> &T {
        // The guard is only taken in Drop.
        match &self.guard {
            Some(guard) => &**guard,
            None => unreachable!("write scope used after release"),
        }
    }
}

impl<T> DerefMut for PropertyWriteScope<'_, T>
where
    T: Clone + Send + Sync + 'static,
{
    fn deref_mut(&mut self) -> &mut T {
        match &mut self.guard {
            Some(guard) => &mut **guard,
            None => unreachable!("write scope used after release"),
        }
    }
}

impl<T> Drop for PropertyWriteScope<'_, T>
where
    T: Clone + Send + Sync + 'static,
{
    fn drop(&mut self) {
        let Some(guard) = self.guard.take() else {
            return;
        };
        let value = guard.clone();
        drop(guard);

        let changed = &self.property.core.changed;
        if changed.is_emitting() {
            tracing::warn!(
                property = ?self.property.core.entity.id(),
                "notification from nested write scope skipped"
            );
            return;
        }
        changed.emit(value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn count_changes<T>(property: &Property<T>, receiver: &Entity) -> Arc<AtomicUsize>
    where
        T: Clone + Send + Sync + 'static,
    {
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        property.changed().connect(receiver, move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });
        count
    }

    #[test]
    fn test_set_notifies_with_new_value() {
        let receiver = Entity::new();
        let property = Property::new(1);
        let seen = Arc::new(Mutex::new(Vec::new()));

        let s = seen.clone();
        property
            .changed()
            .connect(&receiver, move |v: &i32| s.lock().push(*v));

        assert!(property.set(2));
        assert!(property.set(3));
        assert_eq!(property.get(), 3);
        assert_eq!(*seen.lock(), vec![2, 3]);
    }

    #[test]
    fn test_equal_value_does_not_notify() {
        let receiver = Entity::new();
        let property = Property::new(String::from("same"));
        let count = count_changes(&property, &receiver);

        assert!(!property.set("same".to_string()));
        assert_eq!(count.load(Ordering::SeqCst), 0);

        assert!(property.update(|v| format!("{v}!")));
        assert!(!property.update(|v| v.clone()));
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(property.get_untracked(), "same!");
    }

    #[test]
    fn test_write_scope_notifies_once() {
        let receiver = Entity::new();
        let property = Property::new(vec![1, 2]);
        let count = count_changes(&property, &receiver);

        {
            let mut items = property.write_scope();
            items.push(3);
            items.push(4);
            assert_eq!(count.load(Ordering::SeqCst), 0);
        }
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(property.get(), vec![1, 2, 3, 4]);

        // Explicit mutation notifies even when nothing changed.
        drop(property.write_scope());
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_feedback_write_is_dropped() {
        let receiver = Entity::new();
        let property = Property::new(0);
        let calls = Arc::new(AtomicUsize::new(0));

        let p = property.clone();
        let c = calls.clone();
        property.changed().connect(&receiver, move |v: &i32| {
            c.fetch_add(1, Ordering::SeqCst);
            // Writes back into the property being notified.
            assert!(!p.set(v + 1));
        });

        assert!(property.set(1));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(property.get(), 1);
    }

    #[test]
    fn test_observe_calls_immediately() {
        let receiver = Entity::new();
        let property = Property::new(10);
        let seen = Arc::new(Mutex::new(Vec::new()));

        let s = seen.clone();
        let handle = property.observe(&receiver, move |v: &i32| s.lock().push(*v));
        property.set(11);
        handle.disconnect();
        property.set(12);

        assert_eq!(*seen.lock(), vec![10, 11]);
    }

    #[test]
    fn test_with_borrows() {
        let property = Property::new(String::from("hello"));
        assert_eq!(property.with(|s| s.len()), 5);
    }

    #[test]
    fn test_bind_to() {
        let source = Property::new(1);
        let target = Property::new(0);

        let handle = source.bind_to(&target);
        assert_eq!(target.get(), 1);

        source.set(5);
        assert_eq!(target.get(), 5);

        handle.disconnect();
        source.set(6);
        assert_eq!(target.get(), 5);
    }

    #[test]
    fn test_bind_bidirectional_terminates() {
        let a = Property::new(1);
        let b = Property::new(2);
        let receiver = Entity::new();
        let a_changes = count_changes(&a, &receiver);
        let b_changes = count_changes(&b, &receiver);

        bind_bidirectional(&a, &b);
        assert_eq!(b.get(), 1);

        a.set(7);
        assert_eq!(b.get(), 7);
        b.set(9);
        assert_eq!(a.get(), 9);

        // b adopted a's value (1), then each set rippled across once.
        assert_eq!(a_changes.load(Ordering::SeqCst), 2);
        assert_eq!(b_changes.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_dropping_property_disposes_connections() {
        let receiver = Entity::new();
        let property = Property::new(1);
        let handle = property.changed().connect(&receiver, |_| {});
        assert!(handle.is_connected());

        drop(property);
        assert!(!handle.is_connected());
        assert_eq!(receiver.incoming_connection_count(), 0);
    }
}
