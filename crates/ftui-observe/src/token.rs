#![forbid(unsafe_code)]

//! Ownership handles for registered observations.
//!
//! An [`ObservationToken`] owns one cancellation action. The action runs when
//! the token is cancelled explicitly or when the last clone of the token is
//! dropped, whichever happens first, and never again afterwards.
//!
//! ```text
//!   Active ──cancel() / last drop──▶ Cancelled (terminal)
//! ```
//!
//! A [`TokenSet`] is the per-subject collection of tokens kept alive on the
//! subject's behalf; dropping or draining it cancels every member.

use std::cell::{Cell, RefCell};
use std::collections::HashSet;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_TOKEN_ID: AtomicU64 = AtomicU64::new(1);

type CancelAction = Box<dyn FnOnce()>;

struct TokenInner {
    id: u64,
    cancelled: Cell<bool>,
    action: RefCell<Option<CancelAction>>,
}

impl TokenInner {
    fn cancel(&self) {
        if self.cancelled.replace(true) {
            return;
        }
        // Release the borrow before running: the action may drop values whose
        // destructors reach back into this token.
        let action = self.action.borrow_mut().take();
        if let Some(action) = action {
            action();
        }
    }
}

impl Drop for TokenInner {
    fn drop(&mut self) {
        self.cancel();
    }
}

/// Handle for one registered observation.
///
/// Clones share state: cancelling any clone cancels all of them, and the
/// action fires automatically once the last clone is dropped. Equality and
/// hashing use reference identity.
#[derive(Clone)]
#[must_use = "dropping the token cancels the observation"]
pub struct ObservationToken {
    inner: Rc<TokenInner>,
}

impl ObservationToken {
    /// Wrap an arbitrary cancellation action.
    pub fn new(action: impl FnOnce() + 'static) -> Self {
        Self::with_id(NEXT_TOKEN_ID.fetch_add(1, Ordering::Relaxed), Box::new(action))
    }

    pub(crate) fn with_id(id: u64, action: CancelAction) -> Self {
        Self {
            inner: Rc::new(TokenInner {
                id,
                cancelled: Cell::new(false),
                action: RefCell::new(Some(action)),
            }),
        }
    }

    /// A token that is already cancelled and owns nothing.
    pub fn cancelled() -> Self {
        let token = Self::new(|| {});
        token.cancel();
        token
    }

    /// Numeric id, shared with the observation it controls.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// Run the cancellation action. Idempotent.
    pub fn cancel(&self) {
        self.inner.cancel();
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.get()
    }

    /// Hand a clone of this token to `set`, tying its lifetime to the set's
    /// owner.
    pub fn store_in(&self, set: &TokenSet) {
        set.insert(self.clone());
    }
}

impl PartialEq for ObservationToken {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for ObservationToken {}

impl Hash for ObservationToken {
    fn hash<H: Hasher>(&self, state: &mut H) {
        std::ptr::hash(Rc::as_ptr(&self.inner), state);
    }
}

impl fmt::Debug for ObservationToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObservationToken")
            .field("id", &self.inner.id)
            .field("cancelled", &self.inner.cancelled.get())
            .finish()
    }
}

/// Set of tokens a subject keeps alive.
///
/// Mutated only from the serial context. Dropping the set cancels every
/// token it still holds, even if clones exist elsewhere.
#[derive(Default)]
pub struct TokenSet {
    tokens: RefCell<HashSet<ObservationToken>>,
}

impl TokenSet {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Keep `token` alive. Returns `false` if it was already present.
    pub fn insert(&self, token: ObservationToken) -> bool {
        self.tokens.borrow_mut().insert(token)
    }

    /// Stop holding `token` without cancelling it.
    pub fn remove(&self, token: &ObservationToken) -> bool {
        self.tokens.borrow_mut().remove(token)
    }

    #[must_use]
    pub fn contains(&self, token: &ObservationToken) -> bool {
        self.tokens.borrow().contains(token)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.tokens.borrow().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tokens.borrow().is_empty()
    }

    /// Drain the set and cancel every token that was in it.
    pub fn cancel_all(&self) {
        let drained: Vec<ObservationToken> = self.tokens.borrow_mut().drain().collect();
        for token in &drained {
            token.cancel();
        }
    }
}

impl Drop for TokenSet {
    fn drop(&mut self) {
        self.cancel_all();
    }
}

impl fmt::Debug for TokenSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenSet").field("len", &self.len()).finish()
    }
}
