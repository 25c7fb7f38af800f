#![forbid(unsafe_code)]

//! Two-way bindings.
//!
//! A [`Binding<T>`] addresses one property of one observable object. External
//! consumers (typically a UI control adapter) call [`Binding::get`] to
//! initialise what they display and [`Binding::set`] when their native change
//! event fires. Writes go through the property's normal mutation path under
//! the supplied transaction, so every observation of that property re-runs
//! with that transaction.
//!
//! ```ignore
//! let binding = make_binding(&player, "volume", |p| p.volume.get(), |p, v| p.volume.set(v));
//! slider.set_position(binding.get());
//! slider.on_change(move |v| binding.set_value(v));
//! ```
//!
//! Equality and hashing use only the addressed [`PropertyKey`]: two bindings
//! built independently for the same property of the same object are equal,
//! which lets adapters dedupe registrations against a control property.
//!
//! Bindings hold their root weakly. Using a binding whose root is gone is a
//! lifecycle bug: the `try_*` accessors report [`BindingError::Dangling`],
//! the plain accessors panic.

use std::any::Any;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::rc::{Rc, Weak};

use crate::error::BindingError;
use crate::observable::ObservableObject;
use crate::registry;
use crate::tracking::PropertyKey;
use crate::transaction::Transaction;

type Getter<T> = Rc<dyn Fn() -> Option<T>>;
type Setter<T> = Rc<dyn Fn(T) -> bool>;

/// Read/write access to one property of one object.
pub struct Binding<T> {
    key: PropertyKey,
    root: Weak<dyn Any>,
    getter: Getter<T>,
    setter: Setter<T>,
}

impl<T> Clone for Binding<T> {
    fn clone(&self) -> Self {
        Self {
            key: self.key,
            root: Weak::clone(&self.root),
            getter: Rc::clone(&self.getter),
            setter: Rc::clone(&self.setter),
        }
    }
}

impl<T> fmt::Debug for Binding<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Binding")
            .field("key", &format_args!("{}", self.key))
            .finish_non_exhaustive()
    }
}

impl<T> PartialEq for Binding<T> {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key
    }
}

impl<T> Eq for Binding<T> {}

impl<T> Hash for Binding<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.key.hash(state);
    }
}

impl<T: 'static> Binding<T> {
    /// Build a binding from raw accessors. The getter returns `None` and the
    /// setter `false` once `root` is gone.
    pub(crate) fn from_parts(
        key: PropertyKey,
        root: Weak<dyn Any>,
        getter: impl Fn() -> Option<T> + 'static,
        setter: impl Fn(T) -> bool + 'static,
    ) -> Self {
        Self {
            key,
            root,
            getter: Rc::new(getter),
            setter: Rc::new(setter),
        }
    }

    /// The `(object, path)` this binding addresses.
    #[must_use]
    pub fn key(&self) -> PropertyKey {
        self.key
    }

    /// Read the current value.
    ///
    /// # Errors
    ///
    /// Returns [`BindingError::Dangling`] if the root object is gone.
    pub fn try_get(&self) -> Result<T, BindingError> {
        (self.getter)().ok_or(BindingError::Dangling(self.key))
    }

    /// Write `value` under `transaction`.
    ///
    /// # Errors
    ///
    /// Returns [`BindingError::Dangling`] if the root object is gone; nothing
    /// is written and no delivery is queued.
    pub fn try_set(&self, value: T, transaction: Transaction) -> Result<(), BindingError> {
        if self.is_dangling() {
            return Err(BindingError::Dangling(self.key));
        }
        let written = registry::with_transaction(transaction, || (self.setter)(value));
        if written {
            Ok(())
        } else {
            Err(BindingError::Dangling(self.key))
        }
    }

    /// Read the current value. No caching: every call reads through.
    ///
    /// # Panics
    ///
    /// Panics if the root object is gone.
    #[must_use]
    pub fn get(&self) -> T {
        match self.try_get() {
            Ok(value) => value,
            Err(err) => panic!("{err}"),
        }
    }

    /// Write `value`, delivering the change under `transaction`.
    ///
    /// # Panics
    ///
    /// Panics if the root object is gone.
    pub fn set(&self, value: T, transaction: Transaction) {
        if let Err(err) = self.try_set(value, transaction) {
            panic!("{err}");
        }
    }

    /// Write `value` under the default transaction.
    ///
    /// # Panics
    ///
    /// Panics if the root object is gone.
    pub fn set_value(&self, value: T) {
        self.set(value, Transaction::default());
    }

    /// Whether the root object is gone.
    #[must_use]
    pub fn is_dangling(&self) -> bool {
        self.root.strong_count() == 0
    }
}

/// Build a binding to `root`'s property at `path`.
///
/// `get` and `set` are the property's accessor pair; `set` should perform the
/// mutation through the property's observable cell so it participates in
/// delivery.
pub fn make_binding<R, T>(
    root: &Rc<R>,
    path: &'static str,
    get: impl Fn(&R) -> T + 'static,
    set: impl Fn(&R, T) + 'static,
) -> Binding<T>
where
    R: ObservableObject + 'static,
    T: 'static,
{
    let key = PropertyKey::new(root.object_id(), path);
    let read = Rc::downgrade(root);
    let write = Rc::downgrade(root);
    let anchor = Rc::downgrade(root);
    let anchor: Weak<dyn Any> = anchor;
    Binding::from_parts(
        key,
        anchor,
        move || read.upgrade().map(|root| get(&root)),
        move |value| match write.upgrade() {
            Some(root) => {
                set(&root, value);
                true
            }
            None => false,
        },
    )
}
