#![forbid(unsafe_code)]

//! Implicit dependency collection.
//!
//! A tracked closure runs inside a *frame*. Every observable read consults the
//! innermost frame and, if it is a collecting frame, appends the read
//! property's [`PropertyKey`]. Reads with no frame on the stack (or inside
//! [`untracked`]) register nothing.
//!
//! The stack is thread-local: observation is confined to one serial context
//! per thread.
//!
//! # Invariants
//!
//! 1. Frames are strictly nested; a frame is popped even when the closure
//!    running inside it unwinds.
//! 2. A key appears at most once in a frame's collected set.
//! 3. Reads only ever register with the innermost frame, so a nested
//!    observation never leaks dependencies into the one that created it.

use std::cell::RefCell;
use std::collections::BTreeSet;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_OBJECT_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identity of one observable object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObjectId(u64);

impl ObjectId {
    /// Allocate a fresh identity.
    #[must_use]
    pub fn next() -> Self {
        Self(NEXT_OBJECT_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Wrap a raw value. Hosts that mint their own ids must keep them
    /// disjoint from [`ObjectId::next`].
    #[must_use]
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Address of one observable property: `(object identity, property path)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PropertyKey {
    pub object: ObjectId,
    pub path: &'static str,
}

impl PropertyKey {
    #[must_use]
    pub const fn new(object: ObjectId, path: &'static str) -> Self {
        Self { object, path }
    }
}

impl fmt::Display for PropertyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.object, self.path)
    }
}

thread_local! {
    /// `Some` frames collect reads; `None` frames swallow them.
    static FRAMES: RefCell<Vec<Option<BTreeSet<PropertyKey>>>> = const { RefCell::new(Vec::new()) };
}

/// Pops its frame on drop so unwinding never leaves a frame behind.
struct FrameGuard {
    depth: usize,
}

impl FrameGuard {
    fn push(frame: Option<BTreeSet<PropertyKey>>) -> Self {
        let depth = FRAMES.with(|frames| {
            let mut frames = frames.borrow_mut();
            frames.push(frame);
            frames.len()
        });
        Self { depth }
    }

    fn take(self) -> BTreeSet<PropertyKey> {
        let collected = FRAMES.with(|frames| {
            let mut frames = frames.borrow_mut();
            debug_assert_eq!(frames.len(), self.depth, "tracking frames out of order");
            frames.pop().flatten()
        });
        std::mem::forget(self);
        collected.unwrap_or_default()
    }
}

impl Drop for FrameGuard {
    fn drop(&mut self) {
        // `try_with`: the guard may run during thread-local teardown.
        let _ = FRAMES.try_with(|frames| {
            let mut frames = frames.borrow_mut();
            if frames.len() == self.depth {
                frames.pop();
            }
        });
    }
}

/// Record a read of `key` in the innermost collecting frame, if any.
pub fn track(key: PropertyKey) {
    FRAMES.with(|frames| {
        if let Some(Some(collected)) = frames.borrow_mut().last_mut() {
            collected.insert(key);
        }
    });
}

/// Whether a read right now would be recorded.
#[must_use]
pub fn is_tracking() -> bool {
    FRAMES.with(|frames| matches!(frames.borrow().last(), Some(Some(_))))
}

/// Run `f` with dependency collection switched off.
///
/// Reads inside `f` are not recorded by any enclosing observation.
pub fn untracked<R>(f: impl FnOnce() -> R) -> R {
    let guard = FrameGuard::push(None);
    let result = f();
    drop(guard);
    result
}

/// Run `f` inside a fresh collecting frame.
///
/// Returns the closure's outcome (a caught panic is returned as `Err`) along
/// with every key read up to the point it finished or unwound.
pub(crate) fn collect<R>(f: impl FnOnce() -> R) -> (std::thread::Result<R>, BTreeSet<PropertyKey>) {
    let guard = FrameGuard::push(Some(BTreeSet::new()));
    let outcome = panic::catch_unwind(AssertUnwindSafe(f));
    (outcome, guard.take())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(path: &'static str) -> PropertyKey {
        PropertyKey::new(ObjectId::from_raw(1), path)
    }

    #[test]
    fn reads_outside_frame_are_noops() {
        assert!(!is_tracking());
        track(key("a"));
        let (_, deps) = collect(|| ());
        assert!(deps.is_empty());
    }

    #[test]
    fn collect_dedupes() {
        let (outcome, deps) = collect(|| {
            track(key("a"));
            track(key("b"));
            track(key("a"));
            5
        });
        assert_eq!(outcome.ok(), Some(5));
        assert_eq!(deps.len(), 2);
    }

    #[test]
    fn nested_frames_do_not_leak() {
        let (_, outer) = collect(|| {
            track(key("outer"));
            let (_, inner) = collect(|| track(key("inner")));
            assert_eq!(inner.into_iter().collect::<Vec<_>>(), vec![key("inner")]);
        });
        assert_eq!(outer.into_iter().collect::<Vec<_>>(), vec![key("outer")]);
    }

    #[test]
    fn untracked_swallows_reads() {
        let (_, deps) = collect(|| {
            untracked(|| {
                assert!(!is_tracking());
                track(key("hidden"));
            });
            assert!(is_tracking());
            track(key("seen"));
        });
        assert_eq!(deps.into_iter().collect::<Vec<_>>(), vec![key("seen")]);
    }

    #[test]
    fn panic_keeps_partial_dependencies() {
        let (outcome, deps) = collect(|| {
            track(key("before"));
            panic!("tracked closure failed");
        });
        assert!(outcome.is_err());
        assert!(deps.contains(&key("before")));
        assert!(!is_tracking());
    }

    #[test]
    fn object_ids_are_unique() {
        let a = ObjectId::next();
        let b = ObjectId::next();
        assert_ne!(a, b);
        assert_eq!(format!("{}", PropertyKey::new(a, "x")), format!("#{}.x", a.get()));
    }
}
