//! Lazily computed reactive values
//!
//! A [`Computed`] caches the result of a closure. The first read evaluates
//! it with the computed value's own [`DependencyObserver`] installed, so
//! every tracked read inside the closure becomes a dependency. A change to
//! any dependency marks the value invalid and nothing more; the closure only
//! runs again on the next read, and the dependency set is rebuilt from
//! scratch each time it does.
//!
//! Computed values can depend on other computed values: reading one records
//! its `changed` signal, which fires when it goes from valid to invalid.

use crate::entity::{self, AsEntity, Entity};
use crate::error::{usage_error, CoreError, Result};
use crate::observer::{add_dependency, DependencyObserver, Invalidate, ObserverScope};
use crate::signal::Signal;
use parking_lot::Mutex;
use smallvec::SmallVec;
use std::cell::RefCell;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

thread_local! {
    /// Computed values evaluating on this thread, innermost last
    static EVALUATING: RefCell<SmallVec<[usize; 4]>> = RefCell::new(SmallVec::new());
}

/// Marks a computed value as evaluating on this thread until dropped
struct EvaluationGuard;

impl EvaluationGuard {
    /// Returns `None` if `key` is already evaluating on this thread
    fn enter(key: usize) -> Option<Self> {
        EVALUATING.with(|stack| {
            let mut stack = stack.borrow_mut();
            if stack.contains(&key) {
                None
            } else {
                stack.push(key);
                Some(EvaluationGuard)
            }
        })
    }
}

impl Drop for EvaluationGuard {
    fn drop(&mut self) {
        EVALUATING.with(|stack| {
            stack.borrow_mut().pop();
        });
    }
}

type ComputeFn<T> = Box<dyn Fn() -> T + Send + Sync>;

struct ComputedCore<T> {
    entity: Entity,
    changed: Signal<()>,
    observer: Arc<DependencyObserver>,
    compute: ComputeFn<T>,
    cache: Mutex<Option<T>>,
    valid: AtomicBool,
    /// Bumped on every invalidation; detects changes racing an evaluation
    generation: AtomicU64,
    recomputations: AtomicU64,
}

impl<T> ComputedCore<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn value(&self) -> Result<T> {
        if self.valid.load(Ordering::Acquire) {
            if let Some(value) = self.cache.lock().clone() {
                return Ok(value);
            }
        }
        self.recompute()
    }

    fn recompute(&self) -> Result<T> {
        let key = self as *const Self as usize;
        let Some(_evaluating) = EvaluationGuard::enter(key) else {
            return Err(CoreError::RecursiveRecompute {
                computed: entity::describe(self.entity.id()),
            });
        };

        let generation = self.generation.load(Ordering::Acquire);
        self.observer.clear();
        let value = {
            let _scope = ObserverScope::enter(&self.observer);
            (self.compute)()
        };
        let count = self.recomputations.fetch_add(1, Ordering::Relaxed) + 1;
        *self.cache.lock() = Some(value.clone());

        if self.generation.load(Ordering::Acquire) == generation {
            self.valid.store(true, Ordering::Release);
            tracing::trace!(
                computed = ?self.entity.id(),
                recomputations = count,
                dependencies = self.observer.dependency_count(),
                "recomputed"
            );
        } else {
            // A dependency changed mid-evaluation: stay invalid and tell
            // dependents that what they just read is already stale.
            tracing::trace!(computed = ?self.entity.id(), "recomputed stale value");
            self.changed.emit(());
        }
        Ok(value)
    }
}

impl<T> Invalidate for ComputedCore<T>
where
    T: Send + Sync,
{
    fn invalidate(&self) {
        self.generation.fetch_add(1, Ordering::AcqRel);
        if self.valid.swap(false, Ordering::AcqRel) {
            tracing::trace!(computed = ?self.entity.id(), "invalidated");
            self.changed.emit(());
        }
    }
}

/// A value derived from other reactive values, recomputed on demand
///
/// Cheap to clone; clones share the cache. Invalidations are delivered on
/// the thread the computed value was created on, so a dependency written on
/// another thread takes effect once this thread drains its queue. If that
/// thread has exited, invalidations run on the writing thread instead.
pub struct Computed<T> {
    core: Arc<ComputedCore<T>>,
}

impl<T> Computed<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new<F>(compute: F) -> Self
    where
        F: Fn() -> T + Send + Sync + 'static,
    {
        Self::with_entity(Entity::new(), Box::new(compute))
    }

    /// Create a computed value whose name appears in logs and error reports
    pub fn named<F>(name: &str, compute: F) -> Self
    where
        F: Fn() -> T + Send + Sync + 'static,
    {
        Self::with_entity(Entity::named(name), Box::new(compute))
    }

    fn with_entity(entity: Entity, compute: ComputeFn<T>) -> Self {
        let core = Arc::new_cyclic(|weak: &Weak<ComputedCore<T>>| {
            let target: Weak<dyn Invalidate> = weak.clone();
            ComputedCore {
                observer: DependencyObserver::with_entity(entity.clone(), target),
                changed: Signal::named(&entity, "changed"),
                entity,
                compute,
                cache: Mutex::new(None),
                valid: AtomicBool::new(false),
                generation: AtomicU64::new(0),
                recomputations: AtomicU64::new(0),
            }
        });
        Self { core }
    }

    /// Current value, evaluating first if invalid
    ///
    /// Recorded as a dependency inside another evaluation.
    ///
    /// Use [`try_get`](Self::try_get) where the value may be read from
    /// inside its own evaluation.
    ///
    /// # Panics
    ///
    /// Reading a computed value from inside its own evaluation is a usage
    /// error and panics under the `Panic` policy. Under the `Log` policy the
    /// error is reported and the last cached value is returned, but the very
    /// first evaluation has no cached value: a self-read there panics under
    /// either policy.
    pub fn get(&self) -> T {
        match self.try_get() {
            Ok(value) => value,
            Err(err) => {
                usage_error(err.clone());
                match self.core.cache.lock().clone() {
                    Some(value) => value,
                    None => panic!("{}", err),
                }
            }
        }
    }

    /// Current value, or an error if read from inside its own evaluation
    pub fn try_get(&self) -> Result<T> {
        add_dependency(&self.core.changed);
        self.core.value()
    }

    /// Whether the cached value is current
    pub fn is_valid(&self) -> bool {
        self.core.valid.load(Ordering::Acquire)
    }

    /// Number of times the closure has run
    pub fn recompute_count(&self) -> u64 {
        self.core.recomputations.load(Ordering::Relaxed)
    }

    /// Mark the value stale, as if a dependency had changed
    pub fn invalidate(&self) {
        self.core.invalidate();
    }

    /// Emitted when the value goes from valid to invalid
    pub fn changed(&self) -> &Signal<()> {
        &self.core.changed
    }

    /// Number of signals the last evaluation depended on
    pub fn dependency_count(&self) -> usize {
        self.core.observer.dependency_count()
    }

    /// Whether the last evaluation read `signal`
    pub fn depends_on<A>(&self, signal: &Signal<A>) -> bool
    where
        A: Clone + Send + 'static,
    {
        self.core.observer.depends_on(signal.id())
    }
}

impl<T> Clone for Computed<T> {
    fn clone(&self) -> Self {
        Self {
            core: self.core.clone(),
        }
    }
}

impl<T> AsEntity for Computed<T> {
    fn entity(&self) -> &Entity {
        &self.core.entity
    }
}

impl<T: fmt::Debug> fmt::Debug for Computed<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Computed")
            .field("entity", &self.core.entity.id())
            .field("valid", &self.core.valid.load(Ordering::Acquire))
            .field("cached", &*self.core.cache.lock())
            .finish()
    }
}
