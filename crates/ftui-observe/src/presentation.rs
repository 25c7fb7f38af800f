#![forbid(unsafe_code)]

//! Transaction application policy.
//!
//! [`apply`] runs a delivery body under the presentation semantics of its
//! [`Transaction`]. Exactly one branch executes, evaluated in this order:
//!
//! | Condition | Behavior |
//! |-----------|----------|
//! | `disables_animations`, or an enclosing suppression scope | Body runs with animations suppressed; completions fire with `true` |
//! | `animation` present | Driver runs the body in an animated scope; completions fire once the effect settles, with its finish flag |
//! | otherwise | Body runs immediately; completions fire with `true` |
//!
//! Completions are moved out of the transaction before the body runs and are
//! handed to exactly one place, so they can neither fire twice nor be lost.
//! When there are no completions no finish hook is registered with the
//! driver.

use std::cell::Cell;

use crate::tracking::PropertyKey;
use crate::transaction::{Animation, Completion, Transaction, run_completions};

/// Hook invoked by a driver when an animated effect settles.
pub type FinishHook = Box<dyn FnOnce(bool)>;

/// Presentation backend for animated deliveries.
///
/// Implementations must run `body` synchronously, exactly once, before
/// returning. `on_finish`, when present, must be invoked at most once: with
/// `true` when the effect completes, `false` when it is interrupted.
pub trait AnimationDriver {
    fn animate(
        &self,
        animation: &Animation,
        targets: &[PropertyKey],
        body: &mut dyn FnMut(),
        on_finish: Option<FinishHook>,
    );
}

/// Which branch of the policy ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Presentation {
    Suppressed,
    Animated,
    Immediate,
}

thread_local! {
    static SUPPRESS_DEPTH: Cell<usize> = const { Cell::new(0) };
}

struct SuppressGuard;

impl SuppressGuard {
    fn enter() -> Self {
        SUPPRESS_DEPTH.with(|depth| depth.set(depth.get() + 1));
        Self
    }
}

impl Drop for SuppressGuard {
    fn drop(&mut self) {
        let _ = SUPPRESS_DEPTH.try_with(|depth| depth.set(depth.get().saturating_sub(1)));
    }
}

/// Whether an enclosing scope has suppressed animations.
#[must_use]
pub fn animations_suppressed() -> bool {
    SUPPRESS_DEPTH.with(Cell::get) > 0
}

/// Run `f` with all animated deliveries inside it downgraded to suppressed.
pub fn without_animations<R>(f: impl FnOnce() -> R) -> R {
    let _guard = SuppressGuard::enter();
    f()
}

/// Run `body` under `transaction`'s presentation semantics.
///
/// `targets` names the properties the delivery changed; animated drivers use
/// it to decide which in-flight effects a new effect interrupts.
pub fn apply(
    driver: &dyn AnimationDriver,
    mut transaction: Transaction,
    targets: &[PropertyKey],
    body: impl FnOnce(&Transaction),
) -> Presentation {
    let completions = transaction.take_completions();

    if transaction.disables_animations || animations_suppressed() {
        without_animations(|| body(&transaction));
        run_completions(completions, true);
        return Presentation::Suppressed;
    }

    if let Some(animation) = transaction.animation {
        let hook = finish_hook(completions);
        let mut body = Some(body);
        let txn = &transaction;
        driver.animate(
            &animation,
            targets,
            &mut || {
                if let Some(body) = body.take() {
                    body(txn);
                }
            },
            hook,
        );
        return Presentation::Animated;
    }

    body(&transaction);
    run_completions(completions, true);
    Presentation::Immediate
}

fn finish_hook(completions: Vec<Completion>) -> Option<FinishHook> {
    if completions.is_empty() {
        None
    } else {
        Some(Box::new(move |finished| run_completions(completions, finished)))
    }
}
