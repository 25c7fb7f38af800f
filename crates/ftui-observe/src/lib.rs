#![forbid(unsafe_code)]

//! Dependency-tracked observation, transactions, and two-way bindings for
//! FrankenTUI.
//!
//! - [`observe`]: run a closure now and again whenever anything it read
//!   changes. Reads are tracked implicitly; no subscribe calls.
//! - [`Transaction`]: how a mutation should be presented (animation,
//!   suppression) and who to tell when it settles. Every re-run receives the
//!   transaction of the mutation that triggered it.
//! - [`ObservationToken`]: RAII ownership of one observation. Cancel it, or
//!   drop the last clone, and the closure never runs again.
//! - [`Binding`] / [`Bindable`]: get/set access to one property, for control
//!   adapters that need to push native edits back into the model.
//!
//! # Architecture
//!
//! All observable state is `!Send` (`Rc<RefCell<..>>`) and lives on one
//! serial thread together with a thread-local registry. Mutations do not
//! re-run observers inline: every transaction's changed keys are queued as
//! one delivery, and the host drains the queue with [`run_pending`] or
//! [`step`] (or lets [`DeliveryMode::Immediate`] drain it at the end of each
//! mutation scope). Other threads hand work over with [`handoff`].
//!
//! ```ignore
//! let count = Observable::new(0);
//! let seen = Rc::new(RefCell::new(Vec::new()));
//! let token = observe({
//!     let (count, seen) = (count.clone(), seen.clone());
//!     move |_| seen.borrow_mut().push(count.get())
//! });
//! count.set(1);
//! step();
//! drop(token);
//! count.set(2);
//! run_pending();
//! assert_eq!(*seen.borrow(), [0, 1]);
//! ```
//!
//! # Invariants
//!
//! 1. `observe` runs its closure exactly once before returning.
//! 2. A closure re-runs only for keys it read on its latest run.
//! 3. Each observation re-runs at most once per delivery, after every
//!    mutation of the transaction is applied.
//! 4. Completions run exactly once, through exactly one presentation branch.
//! 5. A cancelled observation never re-runs.

pub mod bindable;
pub mod binding;
pub mod config;
pub mod error;
pub mod handoff;
pub mod observable;
pub mod presentation;
pub mod registry;
pub mod timeline;
pub mod token;
pub mod tracking;
pub mod transaction;

pub use bindable::{Accessor, AccessorTable, Bindable, BindableObject};
pub use binding::{Binding, make_binding};
pub use config::{DeliveryMode, FailurePolicy, ObserveConfig, ObserveConfigParse};
pub use error::{BindingError, ConfigError, HandoffClosed, ObservationFailure};
pub use handoff::{SerialHandle, drain_handoff, handoff};
pub use observable::{Observable, ObservableObject, Subject};
pub use presentation::{
    AnimationDriver, FinishHook, Presentation, animations_suppressed, apply, without_animations,
};
pub use registry::{
    apply_now, config, configure, install_driver, is_delivering, observation_count, observe,
    pending_deliveries, run_pending, set_failure_hook, step, subscriber_count, try_observe,
    with_transaction,
};
pub use timeline::{EffectId, ImmediateDriver, TimelineDriver};
pub use token::{ObservationToken, TokenSet};
pub use tracking::{ObjectId, PropertyKey, is_tracking, track, untracked};
pub use transaction::{Animation, Completion, Curve, Transaction};
