#![forbid(unsafe_code)]

//! Observable objects and property cells.
//!
//! # Design
//!
//! A [`Subject`] is the identity and lifecycle root of one observable object.
//! Its properties are [`Observable<T>`] cells keyed by
//! `(subject id, property path)`. A cell can also stand alone
//! ([`Observable::new`]), in which case it gets its own identity and the path
//! `"value"`.
//!
//! Reading a cell with [`Observable::get`] registers its key with the
//! innermost tracked closure. Changing it with [`Observable::set`] (determined
//! by `PartialEq`) bumps its version and reports the key to the registry,
//! which delivers the change under the ambient transaction.
//!
//! ```ignore
//! struct Player {
//!     subject: Subject,
//!     volume: Observable<u8>,
//!     muted: Observable<bool>,
//! }
//!
//! impl Player {
//!     fn new() -> Rc<Self> {
//!         let subject = Subject::new("Player");
//!         Rc::new(Self {
//!             volume: subject.property("volume", 50),
//!             muted: subject.property("muted", false),
//!             subject,
//!         })
//!     }
//! }
//! ```
//!
//! # Performance
//!
//! | Operation     | Complexity                  |
//! |---------------|-----------------------------|
//! | `get()`       | O(log D) with D = keys read in the current frame |
//! | `set()`       | O(1) plus one queue push    |
//! | Memory        | ~40 bytes + sizeof(T)       |
//!
//! # Failure Modes
//!
//! - **Duplicate path**: two properties with the same path on one subject
//!   share a key, so observing either observes both. Debug builds assert.
//! - **Ownership cycles**: an observation retained by a subject must not
//!   hold a strong reference to that subject's object, or neither is ever
//!   dropped. Capture a `Weak` instead.

use std::any::Any;
use std::cell::RefCell;
use std::collections::BTreeSet;
use std::fmt;
use std::rc::{Rc, Weak};

use crate::binding::Binding;
use crate::registry;
use crate::token::{ObservationToken, TokenSet};
use crate::tracking::{self, ObjectId, PropertyKey};
use crate::transaction::Transaction;

/// Implemented by types that own a [`Subject`].
pub trait ObservableObject {
    fn subject(&self) -> &Subject;

    fn object_id(&self) -> ObjectId {
        self.subject().id()
    }
}

/// Identity and token set of one observable object.
///
/// Dropping the subject (or calling [`teardown`](Self::teardown)) cancels
/// every observation it retains.
pub struct Subject {
    id: ObjectId,
    label: &'static str,
    paths: RefCell<BTreeSet<&'static str>>,
    tokens: TokenSet,
}

impl fmt::Debug for Subject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subject")
            .field("id", &self.id)
            .field("label", &self.label)
            .field("properties", &self.paths.borrow().len())
            .field("tokens", &self.tokens.len())
            .finish()
    }
}

impl Subject {
    /// Create a subject with a fresh identity. `label` only appears in
    /// diagnostics.
    #[must_use]
    pub fn new(label: &'static str) -> Self {
        Self {
            id: ObjectId::next(),
            label,
            paths: RefCell::new(BTreeSet::new()),
            tokens: TokenSet::new(),
        }
    }

    #[must_use]
    pub fn id(&self) -> ObjectId {
        self.id
    }

    #[must_use]
    pub fn label(&self) -> &'static str {
        self.label
    }

    /// Key of the property at `path` on this subject.
    #[must_use]
    pub fn key(&self, path: &'static str) -> PropertyKey {
        PropertyKey::new(self.id, path)
    }

    /// Create an observable property at `path`.
    pub fn property<T: Clone + PartialEq + 'static>(
        &self,
        path: &'static str,
        value: T,
    ) -> Observable<T> {
        let fresh = self.paths.borrow_mut().insert(path);
        debug_assert!(fresh, "duplicate property path '{path}' on {}", self.label);
        Observable::with_key(self.key(path), value)
    }

    /// Keep `token` alive until this subject is torn down.
    pub fn retain(&self, token: ObservationToken) {
        self.tokens.insert(token);
    }

    /// Register a tracked closure owned by this subject.
    ///
    /// The returned token is a clone of the retained one; dropping it does
    /// not end the observation, but cancelling it does.
    pub fn observe(&self, f: impl FnMut(Option<&Transaction>) + 'static) -> ObservationToken {
        let token = registry::observe(f);
        self.retain(token.clone());
        token
    }

    /// Tokens currently retained.
    #[must_use]
    pub fn tokens(&self) -> &TokenSet {
        &self.tokens
    }

    /// Cancel every retained observation.
    pub fn teardown(&self) {
        tracing::trace!(subject = %self.id, label = self.label, tokens = self.tokens.len(), "subject teardown");
        self.tokens.cancel_all();
    }
}

impl ObservableObject for Subject {
    fn subject(&self) -> &Subject {
        self
    }
}

/// Shared interior for [`Observable<T>`].
struct ObservableInner<T> {
    value: T,
    version: u64,
}

/// A shared, version-tracked property cell.
///
/// Cloning an `Observable` creates a new handle to the **same** cell: both
/// handles see the same value and the same key.
///
/// # Invariants
///
/// 1. `version` increments by exactly 1 on each value-changing mutation.
/// 2. `set(v)` where `v == current` is a no-op: no version bump, no delivery.
/// 3. Reads register the key only inside a tracked closure.
pub struct Observable<T> {
    key: PropertyKey,
    inner: Rc<RefCell<ObservableInner<T>>>,
}

// Manual Clone: shares the same Rc.
impl<T> Clone for Observable<T> {
    fn clone(&self) -> Self {
        Self {
            key: self.key,
            inner: Rc::clone(&self.inner),
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for Observable<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.borrow();
        f.debug_struct("Observable")
            .field("key", &format_args!("{}", self.key))
            .field("value", &inner.value)
            .field("version", &inner.version)
            .finish()
    }
}

impl<T: Clone + PartialEq + 'static> Observable<T> {
    /// Create a standalone observable with its own identity.
    ///
    /// The initial version is 0.
    #[must_use]
    pub fn new(value: T) -> Self {
        Self::with_key(PropertyKey::new(ObjectId::next(), "value"), value)
    }

    fn with_key(key: PropertyKey, value: T) -> Self {
        Self {
            key,
            inner: Rc::new(RefCell::new(ObservableInner { value, version: 0 })),
        }
    }

    /// The `(object, path)` key of this cell.
    #[must_use]
    pub fn key(&self) -> PropertyKey {
        self.key
    }

    /// Get a clone of the current value, registering the read.
    #[must_use]
    pub fn get(&self) -> T {
        tracking::track(self.key);
        self.inner.borrow().value.clone()
    }

    /// Get a clone of the current value without registering the read.
    #[must_use]
    pub fn get_untracked(&self) -> T {
        self.inner.borrow().value.clone()
    }

    /// Access the current value by reference without cloning. Registers the
    /// read.
    pub fn with<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        tracking::track(self.key);
        f(&self.inner.borrow().value)
    }

    /// Set a new value. If it differs from the current value (by
    /// `PartialEq`), the version is incremented and the change is reported
    /// under the ambient transaction.
    pub fn set(&self, value: T) {
        {
            let mut inner = self.inner.borrow_mut();
            if inner.value == value {
                return;
            }
            inner.value = value;
            inner.version += 1;
        }
        registry::did_change(self.key);
    }

    /// Set a new value under `transaction`.
    pub fn set_with(&self, value: T, transaction: Transaction) {
        registry::with_transaction(transaction, || self.set(value));
    }

    /// Modify the value in place via a closure. If the value changes
    /// (compared by `PartialEq` against a snapshot), the version is
    /// incremented and the change is reported.
    pub fn update(&self, f: impl FnOnce(&mut T)) {
        let changed = {
            let mut inner = self.inner.borrow_mut();
            let old = inner.value.clone();
            f(&mut inner.value);
            if inner.value != old {
                inner.version += 1;
                true
            } else {
                false
            }
        };
        if changed {
            registry::did_change(self.key);
        }
    }

    /// Current version number. Increments by 1 on each value-changing
    /// mutation. Does not register a read.
    #[must_use]
    pub fn version(&self) -> u64 {
        self.inner.borrow().version
    }

    /// Call `callback` with the new value on every delivery that changed
    /// this cell. Not called for the initial value.
    pub fn subscribe(&self, callback: impl Fn(&T) + 'static) -> ObservationToken {
        let cell = self.clone();
        registry::observe(move |txn| {
            let value = cell.get();
            if txn.is_some() {
                callback(&value);
            }
        })
    }

    /// Number of observations currently subscribed to this cell.
    #[must_use]
    pub fn observer_count(&self) -> usize {
        registry::subscriber_count(self.key)
    }

    /// A two-way binding addressing this cell.
    ///
    /// The binding holds the cell weakly: once every `Observable` handle is
    /// dropped, the binding dangles.
    #[must_use]
    pub fn binding(&self) -> Binding<T> {
        let read = Rc::downgrade(&self.inner);
        let write = Rc::downgrade(&self.inner);
        let key = self.key;
        let anchor = Rc::downgrade(&self.inner);
        let anchor: Weak<dyn Any> = anchor;
        Binding::from_parts(
            key,
            anchor,
            move || {
                let inner = read.upgrade()?;
                tracking::track(key);
                let value = inner.borrow().value.clone();
                Some(value)
            },
            move |value| match write.upgrade() {
                Some(inner) => {
                    Self { key, inner }.set(value);
                    true
                }
                None => false,
            },
        )
    }
}
