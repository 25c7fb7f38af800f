#![forbid(unsafe_code)]

//! Bindings on demand via path lookup.
//!
//! An object type opts in by implementing [`BindableObject`]: it lists one
//! [`Accessor`] per mutable property in an [`AccessorTable`] built once and
//! stored in a `OnceLock`. A [`Bindable`] proxy over an instance then hands
//! out a [`Binding`] for any listed property, either through a typed
//! accessor or by path.
//!
//! ```ignore
//! impl Player {
//!     const VOLUME: Accessor<Self, u8> =
//!         Accessor::new("volume", |p| p.volume.get(), |p, v| p.volume.set(v));
//! }
//!
//! impl BindableObject for Player {
//!     fn accessors() -> &'static AccessorTable<Self> {
//!         static TABLE: OnceLock<AccessorTable<Player>> = OnceLock::new();
//!         TABLE.get_or_init(|| AccessorTable::new().with(Player::VOLUME))
//!     }
//! }
//!
//! let proxy = Bindable::new(player);
//! let volume: Binding<u8> = proxy.lookup("volume")?;
//! ```

use std::any::{Any, type_name};
use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;
use std::rc::Rc;

use crate::binding::{Binding, make_binding};
use crate::error::BindingError;
use crate::observable::ObservableObject;
use crate::tracking::ObjectId;

/// Getter/setter pair for one property of `R`, keyed by its path.
pub struct Accessor<R, T> {
    path: &'static str,
    get: fn(&R) -> T,
    set: fn(&R, T),
}

impl<R, T> Clone for Accessor<R, T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<R, T> Copy for Accessor<R, T> {}

impl<R, T> fmt::Debug for Accessor<R, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Accessor")
            .field("path", &self.path)
            .field("value", &type_name::<T>())
            .finish()
    }
}

impl<R, T> Accessor<R, T> {
    #[must_use]
    pub const fn new(path: &'static str, get: fn(&R) -> T, set: fn(&R, T)) -> Self {
        Self { path, get, set }
    }

    #[must_use]
    pub const fn path(&self) -> &'static str {
        self.path
    }
}

/// Path-indexed accessors of one object type.
///
/// Entries are type-erased; [`Bindable::lookup`] recovers the value type.
pub struct AccessorTable<R> {
    entries: HashMap<&'static str, Entry>,
    _object: PhantomData<fn(&R)>,
}

struct Entry {
    value_type: &'static str,
    accessor: Box<dyn Any + Send + Sync>,
}

impl<R> fmt::Debug for AccessorTable<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut paths: Vec<_> = self
            .entries
            .iter()
            .map(|(path, entry)| (*path, entry.value_type))
            .collect();
        paths.sort_unstable();
        f.debug_struct("AccessorTable")
            .field("object", &type_name::<R>())
            .field("properties", &paths)
            .finish()
    }
}

impl<R: 'static> Default for AccessorTable<R> {
    fn default() -> Self {
        Self::new()
    }
}

impl<R: 'static> AccessorTable<R> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
            _object: PhantomData,
        }
    }

    /// Add `accessor`. Returns `false` (and keeps the existing entry) if its
    /// path is already taken.
    pub fn insert<T: 'static>(&mut self, accessor: Accessor<R, T>) -> bool {
        if self.entries.contains_key(accessor.path) {
            return false;
        }
        self.entries.insert(
            accessor.path,
            Entry {
                value_type: type_name::<T>(),
                accessor: Box::new(accessor),
            },
        );
        true
    }

    /// Builder form of [`insert`](Self::insert).
    ///
    /// # Panics
    ///
    /// Panics on a duplicate path; tables are built once from constants, so
    /// a clash is a programming error.
    #[must_use]
    pub fn with<T: 'static>(mut self, accessor: Accessor<R, T>) -> Self {
        let path = accessor.path;
        assert!(
            self.insert(accessor),
            "duplicate accessor path '{path}' on {}",
            type_name::<R>()
        );
        self
    }

    #[must_use]
    pub fn contains(&self, path: &str) -> bool {
        self.entries.contains_key(path)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Known paths, sorted.
    #[must_use]
    pub fn paths(&self) -> Vec<&'static str> {
        let mut paths: Vec<_> = self.entries.keys().copied().collect();
        paths.sort_unstable();
        paths
    }

    fn get<T: 'static>(&self, path: &str) -> Result<Accessor<R, T>, BindingError> {
        let Some((&path, entry)) = self.entries.get_key_value(path) else {
            return Err(BindingError::UnknownProperty {
                object: type_name::<R>(),
                path: path.to_string(),
            });
        };
        entry
            .accessor
            .downcast_ref::<Accessor<R, T>>()
            .copied()
            .ok_or(BindingError::TypeMismatch {
                path,
                expected: type_name::<T>(),
            })
    }
}

/// An observable object type whose properties can be bound by path.
pub trait BindableObject: ObservableObject + Sized + 'static {
    /// The type's accessor table, built once.
    fn accessors() -> &'static AccessorTable<Self>;
}

/// Proxy producing [`Binding`]s for any listed property of the wrapped
/// object.
///
/// Two proxies over the same instance are equal regardless of what was
/// looked up through them.
pub struct Bindable<R> {
    root: Rc<R>,
}

impl<R> Clone for Bindable<R> {
    fn clone(&self) -> Self {
        Self {
            root: Rc::clone(&self.root),
        }
    }
}

impl<R: BindableObject> fmt::Debug for Bindable<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bindable")
            .field("object", &self.root.object_id())
            .field("type", &type_name::<R>())
            .finish()
    }
}

impl<R: BindableObject> PartialEq for Bindable<R> {
    fn eq(&self, other: &Self) -> bool {
        self.root.object_id() == other.root.object_id()
    }
}

impl<R: BindableObject> Eq for Bindable<R> {}

impl<R: BindableObject> Hash for Bindable<R> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.root.object_id().hash(state);
    }
}

impl<R: BindableObject> Bindable<R> {
    #[must_use]
    pub fn new(root: Rc<R>) -> Self {
        Self { root }
    }

    #[must_use]
    pub fn root(&self) -> &Rc<R> {
        &self.root
    }

    #[must_use]
    pub fn object_id(&self) -> ObjectId {
        self.root.object_id()
    }

    /// A fresh binding through `accessor`. Not cached.
    #[must_use]
    pub fn binding<T: 'static>(&self, accessor: &Accessor<R, T>) -> Binding<T> {
        let Accessor { path, get, set } = *accessor;
        make_binding(&self.root, path, get, set)
    }

    /// A binding for the property at `path`.
    ///
    /// # Errors
    ///
    /// [`BindingError::UnknownProperty`] if no accessor has that path,
    /// [`BindingError::TypeMismatch`] if its value type is not `T`.
    pub fn lookup<T: 'static>(&self, path: &str) -> Result<Binding<T>, BindingError> {
        let accessor = R::accessors().get::<T>(path)?;
        Ok(self.binding(&accessor))
    }

    /// Paths that [`lookup`](Self::lookup) accepts, sorted.
    #[must_use]
    pub fn paths(&self) -> Vec<&'static str> {
        R::accessors().paths()
    }
}
