//! Entities: notification participants bound to one thread
//!
//! An [`Entity`] records the thread it was constructed on and never moves.
//! It owns signals (see [`crate::signal::Signal`]) and is the receiving end
//! of connections. Entities are shared-owned; connections only hold weak
//! references, so dropping the last `Entity` clone tears down every
//! connection it takes part in, on either end.
//!
//! User types become receivers by embedding an `Entity` and implementing
//! [`AsEntity`]:
//!
//! ```ignore
//! struct Label {
//!     entity: Entity,
//!     text: Mutex<String>,
//! }
//!
//! impl AsEntity for Label {
//!     fn entity(&self) -> &Entity {
//!         &self.entity
//!     }
//! }
//! ```

use crate::connection::Disposable;
use crate::error::{usage_error, CoreError};
use crate::signal::Signal;
use crate::thread::{current_thread, ThreadHandle};
use parking_lot::Mutex;
use slotmap::{new_key_type, SlotMap};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, LazyLock, Weak};

new_key_type! {
    /// Unique identifier for an entity
    pub struct EntityId;
}

/// Diagnostic record kept for every live entity
struct EntityRecord {
    name: Option<Arc<str>>,
    thread: String,
}

/// Global entity registry, used for naming entities in logs and error reports
static ENTITIES: LazyLock<Mutex<SlotMap<EntityId, EntityRecord>>> =
    LazyLock::new(|| Mutex::new(SlotMap::with_key()));

/// Human-readable description of an entity, live or not
pub fn describe(id: EntityId) -> String {
    match ENTITIES.lock().get(id) {
        Some(record) => format!(
            "{} ({:?} on {})",
            record.name.as_deref().unwrap_or("entity"),
            id,
            record.thread
        ),
        None => format!("<destroyed entity {:?}>", id),
    }
}

/// Number of live entities in the process
pub fn live_entity_count() -> usize {
    ENTITIES.lock().len()
}

/// Anything that can act as the receiving end of a connection
pub trait AsEntity {
    fn entity(&self) -> &Entity;
}

/// Compact dead weak links once a list grows past this many entries
const COMPACT_THRESHOLD: usize = 16;

/// Weak links to connections (incoming) or signals (owned)
#[derive(Default)]
struct LinkList {
    links: Vec<Weak<dyn Disposable>>,
    compact_at: usize,
}

impl LinkList {
    fn push(&mut self, link: Weak<dyn Disposable>) {
        if self.links.len() >= self.compact_at.max(COMPACT_THRESHOLD) {
            self.links
                .retain(|w| w.upgrade().is_some_and(|link| !link.is_disposed()));
            self.compact_at = self.links.len() * 2;
        }
        self.links.push(link);
    }

    fn live_count(&self) -> usize {
        self.links
            .iter()
            .filter(|w| w.upgrade().is_some_and(|link| !link.is_disposed()))
            .count()
    }
}

pub(crate) struct EntityCore {
    id: EntityId,
    name: Option<Arc<str>>,
    thread: ThreadHandle,
    signals_enabled: AtomicBool,
    direct_delivery: AtomicBool,
    inline_after_exit: AtomicBool,
    /// Connections where this entity is the receiver
    incoming: Mutex<LinkList>,
    /// Signals this entity owns
    signals: Mutex<LinkList>,
}

impl Drop for EntityCore {
    fn drop(&mut self) {
        // Take both lists first; disposing runs Drop code of captured
        // callback state, which must not happen under our locks.
        let incoming = std::mem::take(&mut self.incoming.get_mut().links);
        let signals = std::mem::take(&mut self.signals.get_mut().links);

        for link in incoming.iter().chain(signals.iter()) {
            if let Some(link) = link.upgrade() {
                link.dispose();
            }
        }

        ENTITIES.lock().remove(self.id);
        tracing::trace!(entity = ?self.id, "entity destroyed");
    }
}

/// A notification participant bound to the thread it was created on
///
/// Cloning an `Entity` clones a shared reference; the entity is destroyed
/// when the last clone is dropped.
#[derive(Clone)]
pub struct Entity {
    core: Arc<EntityCore>,
}

impl Entity {
    /// Create an entity bound to the calling thread
    pub fn new() -> Self {
        Self::build(None)
    }

    /// Create a named entity bound to the calling thread
    ///
    /// The name shows up in logs and error reports.
    pub fn named(name: impl Into<Arc<str>>) -> Self {
        Self::build(Some(name.into()))
    }

    fn build(name: Option<Arc<str>>) -> Self {
        let thread = current_thread();
        let id = ENTITIES.lock().insert(EntityRecord {
            name: name.clone(),
            thread: thread.name().to_string(),
        });

        Self {
            core: Arc::new(EntityCore {
                id,
                name,
                thread,
                signals_enabled: AtomicBool::new(true),
                direct_delivery: AtomicBool::new(false),
                inline_after_exit: AtomicBool::new(false),
                incoming: Mutex::new(LinkList::default()),
                signals: Mutex::new(LinkList::default()),
            }),
        }
    }

    pub fn id(&self) -> EntityId {
        self.core.id
    }

    pub fn name(&self) -> Option<&str> {
        self.core.name.as_deref()
    }

    /// The thread this entity was constructed on
    pub fn thread(&self) -> &ThreadHandle {
        &self.core.thread
    }

    /// Whether the calling thread is this entity's thread
    pub fn is_on_own_thread(&self) -> bool {
        self.core.thread.is_current()
    }

    /// Enable or disable emission of every signal this entity owns
    pub fn set_signals_enabled(&self, enabled: bool) {
        self.core.signals_enabled.store(enabled, Ordering::Release);
    }

    pub fn signals_enabled(&self) -> bool {
        self.core.signals_enabled.load(Ordering::Acquire)
    }

    /// Deliver callbacks for this receiver on the emitting thread
    ///
    /// By default a callback whose receiver lives on another thread is
    /// queued to that thread. With direct delivery enabled it runs
    /// synchronously on whichever thread emits, so the callback must be
    /// safe to run anywhere.
    pub fn set_direct_delivery(&self, direct: bool) {
        self.core.direct_delivery.store(direct, Ordering::Release);
    }

    pub fn direct_delivery(&self) -> bool {
        self.core.direct_delivery.load(Ordering::Acquire)
    }

    /// Run callbacks on the emitting thread once this entity's thread has exited
    ///
    /// Queued delivery to an exited thread drops the callback. Entities whose
    /// callbacks are thread-agnostic (dependency observers) opt in here so
    /// they keep receiving after their thread is gone.
    pub(crate) fn set_inline_after_exit(&self, inline: bool) {
        self.core.inline_after_exit.store(inline, Ordering::Release);
    }

    pub(crate) fn inline_after_exit(&self) -> bool {
        self.core.inline_after_exit.load(Ordering::Acquire)
    }

    /// Emit a signal this entity owns
    ///
    /// Emitting a signal owned by another entity is a usage error and
    /// delivers nothing.
    pub fn emit<A>(&self, signal: &Signal<A>, args: A)
    where
        A: Clone + Send + 'static,
    {
        if signal.owner_id() != self.core.id {
            usage_error(CoreError::ForeignSignal {
                entity: describe(self.core.id),
                signal: signal.name().to_string(),
            });
            return;
        }
        signal.emit(args);
    }

    /// Queue a task on this entity's thread
    pub fn post<F>(&self, task: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        self.core.thread.post(task)
    }

    /// Number of live connections where this entity is the receiver
    pub fn incoming_connection_count(&self) -> usize {
        self.core.incoming.lock().live_count()
    }

    pub fn downgrade(&self) -> WeakEntity {
        WeakEntity {
            core: Arc::downgrade(&self.core),
        }
    }

    pub(crate) fn track_incoming(&self, connection: Weak<dyn Disposable>) {
        self.core.incoming.lock().push(connection);
    }

    pub(crate) fn track_signal(&self, signal: Weak<dyn Disposable>) {
        self.core.signals.lock().push(signal);
    }
}

impl Default for Entity {
    fn default() -> Self {
        Self::new()
    }
}

impl AsEntity for Entity {
    fn entity(&self) -> &Entity {
        self
    }
}

impl PartialEq for Entity {
    fn eq(&self, other: &Self) -> bool {
        self.core.id == other.core.id
    }
}

impl Eq for Entity {}

impl fmt::Debug for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Entity")
            .field("id", &self.core.id)
            .field("name", &self.core.name)
            .field("thread", &self.core.thread.name())
            .finish()
    }
}

/// A non-owning reference to an entity
#[derive(Clone, Default)]
pub struct WeakEntity {
    core: Weak<EntityCore>,
}

impl WeakEntity {
    pub fn upgrade(&self) -> Option<Entity> {
        self.core.upgrade().map(|core| Entity { core })
    }

    /// Whether the entity has been destroyed
    pub fn is_dead(&self) -> bool {
        self.core.strong_count() == 0
    }
}

impl fmt::Debug for WeakEntity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WeakEntity")
            .field("alive", &!self.is_dead())
            .finish()
    }
}

/// The thread an entity was constructed on
pub fn bound_thread(entity: &impl AsEntity) -> ThreadHandle {
    entity.entity().thread().clone()
}
