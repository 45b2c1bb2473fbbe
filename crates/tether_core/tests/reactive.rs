//! Lazy computed values and dependency tracking

mod common;

use common::init_tracing;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tether_core::{bind_bidirectional, untracked, Computed, Entity, Property};

#[test]
fn test_sum_recomputes_once_after_write() {
    init_tracing();
    let a = Property::named("a", 1);
    let b = Property::named("b", 2);
    let runs = Arc::new(AtomicUsize::new(0));

    let sum = {
        let (a, b, runs) = (a.clone(), b.clone(), runs.clone());
        Computed::named("sum", move || {
            runs.fetch_add(1, Ordering::SeqCst);
            a.get() + b.get()
        })
    };

    // Nothing runs until the first read.
    assert_eq!(runs.load(Ordering::SeqCst), 0);
    assert_eq!(sum.get(), 3);
    assert_eq!(runs.load(Ordering::SeqCst), 1);

    a.set(6);
    // Invalidated, but not recomputed.
    assert!(!sum.is_valid());
    assert_eq!(runs.load(Ordering::SeqCst), 1);

    assert_eq!(sum.get(), 8);
    assert_eq!(sum.get(), 8);
    assert_eq!(runs.load(Ordering::SeqCst), 2);
}

#[test]
fn test_dependency_set_switches_from_p_to_q() {
    init_tracing();
    let read_q = Property::new(false);
    let p = Property::named("p", 10);
    let q = Property::named("q", 20);

    let value = {
        let (read_q, p, q) = (read_q.clone(), p.clone(), q.clone());
        Computed::new(move || if read_q.get() { q.get() } else { p.get() })
    };

    assert_eq!(value.get(), 10);
    q.set(21);
    assert!(value.is_valid(), "invalidated by a property it never read");
    p.set(11);
    assert!(!value.is_valid());
    assert_eq!(value.get(), 11);

    read_q.set(true);
    assert_eq!(value.get(), 21);
    assert!(value.depends_on(q.changed()));
    assert!(!value.depends_on(p.changed()));
    assert_eq!(value.dependency_count(), 2);

    // The old connection to p is gone.
    assert_eq!(p.changed().connection_count(), 0);
    p.set(12);
    assert!(value.is_valid());
    q.set(22);
    assert!(!value.is_valid());
}

#[test]
fn test_equal_writes_do_not_invalidate() {
    init_tracing();
    let name = Property::new(String::from("tether"));
    let upper = {
        let name = name.clone();
        Computed::new(move || name.get().to_uppercase())
    };

    assert_eq!(upper.get(), "TETHER");
    assert!(!name.set("tether".to_string()));
    assert!(upper.is_valid());
    assert_eq!(upper.recompute_count(), 1);

    // A write scope always notifies, even without a real change.
    drop(name.write_scope());
    assert!(!upper.is_valid());
}

#[test]
fn test_diamond_evaluates_shared_dependency_once() {
    init_tracing();
    let base = Property::new(1);
    let left = {
        let base = base.clone();
        Computed::new(move || base.get() + 1)
    };
    let right = {
        let base = base.clone();
        Computed::new(move || base.get() * 10)
    };
    let joined = {
        let (left, right) = (left.clone(), right.clone());
        Computed::new(move || format!("{}|{}", left.get(), right.get()))
    };

    assert_eq!(joined.get(), "2|10");
    base.set(2);
    assert!(!joined.is_valid());
    assert_eq!(joined.get(), "3|20");
    assert_eq!(left.recompute_count(), 2);
    assert_eq!(right.recompute_count(), 2);
    assert_eq!(joined.recompute_count(), 2);
}

#[test]
fn test_untracked_reads_inside_evaluation() {
    init_tracing();
    let tracked = Property::new(1);
    let sampled = Property::new(100);
    let value = {
        let (tracked, sampled) = (tracked.clone(), sampled.clone());
        Computed::new(move || tracked.get() + untracked(|| sampled.get()))
    };

    assert_eq!(value.get(), 101);
    assert_eq!(value.dependency_count(), 1);
    sampled.set(200);
    assert!(value.is_valid());
}

#[test]
fn test_dropping_computed_releases_dependencies() {
    init_tracing();
    let source = Property::new(1);
    let value = {
        let source = source.clone();
        Computed::new(move || source.get())
    };
    value.get();
    assert_eq!(source.changed().connection_count(), 1);

    drop(value);
    assert_eq!(source.changed().connection_count(), 0);
    source.set(2);
}

#[test]
fn test_observe_and_bindings() {
    init_tracing();
    let view = Entity::named("view");
    let celsius = Property::new(0);
    let mirror = Property::new(-1);
    let log = Arc::new(parking_lot::Mutex::new(Vec::new()));

    let l = log.clone();
    celsius.observe(&view, move |c| l.lock().push(*c));
    bind_bidirectional(&celsius, &mirror);
    assert_eq!(mirror.get(), 0);

    mirror.set(30);
    assert_eq!(celsius.get(), 30);
    celsius.set(40);
    assert_eq!(mirror.get(), 40);
    assert_eq!(*log.lock(), vec![0, 30, 40]);
}
