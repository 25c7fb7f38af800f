#![forbid(unsafe_code)]

//! Transactions describing how a change should be presented.
//!
//! A [`Transaction`] travels with every mutation from the moment it is made
//! until each affected observation has re-run. It carries:
//!
//! - an optional [`Animation`] (absent means "apply immediately"),
//! - a flag suppressing animations, including any nested ones,
//! - an ordered list of completion callbacks.
//!
//! # Usage
//!
//! ```ignore
//! use std::time::Duration;
//! use ftui_observe::{with_transaction, Animation, Transaction};
//!
//! let txn = Transaction::animated(Animation::ease_in_out(Duration::from_millis(300)))
//!     .on_complete(|finished| tracing::info!(finished, "panel settled"));
//!
//! with_transaction(txn, || {
//!     panel.width.set(40);
//!     panel.height.set(12);
//! });
//! ```
//!
//! # Invariants
//!
//! 1. A transaction is not modified once it has been handed to delivery;
//!    observers only ever see it by shared reference.
//! 2. Completions run at most once each, in registration order. The
//!    delivery path moves them out of the transaction exactly once.

use std::fmt;
use std::time::Duration;

/// Completion callback. Receives `true` if the presentation finished
/// normally and `false` if it was interrupted.
pub type Completion = Box<dyn FnOnce(bool)>;

/// Timing curve for an animated change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum Curve {
    Linear,
    EaseIn,
    EaseOut,
    #[default]
    EaseInOut,
}

impl Curve {
    /// Map linear progress `t` in `[0, 1]` to eased progress in `[0, 1]`.
    ///
    /// Inputs outside the range are clamped.
    #[must_use]
    pub fn sample(self, t: f64) -> f64 {
        let t = if t.is_nan() { 0.0 } else { t.clamp(0.0, 1.0) };
        match self {
            Self::Linear => t,
            Self::EaseIn => t * t,
            Self::EaseOut => 1.0 - (1.0 - t) * (1.0 - t),
            Self::EaseInOut => {
                if t < 0.5 {
                    2.0 * t * t
                } else {
                    1.0 - (-2.0 * t + 2.0).powi(2) / 2.0
                }
            }
        }
    }
}

/// Presentation effect applied while a change is delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Animation {
    pub duration: Duration,
    pub delay: Duration,
    pub curve: Curve,
}

impl Default for Animation {
    fn default() -> Self {
        Self {
            duration: Duration::from_millis(250),
            delay: Duration::ZERO,
            curve: Curve::EaseInOut,
        }
    }
}

impl Animation {
    #[must_use]
    pub fn new(duration: Duration, curve: Curve) -> Self {
        Self {
            duration,
            delay: Duration::ZERO,
            curve,
        }
    }

    #[must_use]
    pub fn linear(duration: Duration) -> Self {
        Self::new(duration, Curve::Linear)
    }

    #[must_use]
    pub fn ease_in_out(duration: Duration) -> Self {
        Self::new(duration, Curve::EaseInOut)
    }

    /// Start the effect after `delay`.
    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    #[must_use]
    pub fn with_curve(mut self, curve: Curve) -> Self {
        self.curve = curve;
        self
    }

    /// Time from start until the effect settles.
    #[must_use]
    pub fn total(&self) -> Duration {
        self.delay.saturating_add(self.duration)
    }
}

/// Metadata describing how one mutation is presented.
///
/// The default transaction has no animation, does not suppress animations,
/// and carries no completions.
#[derive(Default)]
pub struct Transaction {
    /// Effect to run while delivering this change. `None` applies it
    /// immediately.
    pub animation: Option<Animation>,
    /// Suppress every effect, including ones requested by nested deliveries.
    pub disables_animations: bool,
    completions: Vec<Completion>,
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("animation", &self.animation)
            .field("disables_animations", &self.disables_animations)
            .field("completion_count", &self.completions.len())
            .finish()
    }
}

impl Transaction {
    /// An empty transaction.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A transaction presenting its change with `animation`.
    #[must_use]
    pub fn animated(animation: Animation) -> Self {
        Self {
            animation: Some(animation),
            ..Self::default()
        }
    }

    /// A transaction that suppresses all animation.
    #[must_use]
    pub fn without_animation() -> Self {
        Self {
            disables_animations: true,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_animation(mut self, animation: Option<Animation>) -> Self {
        self.animation = animation;
        self
    }

    #[must_use]
    pub fn with_disables_animations(mut self, disables: bool) -> Self {
        self.disables_animations = disables;
        self
    }

    /// Append a completion callback.
    #[must_use]
    pub fn on_complete(mut self, completion: impl FnOnce(bool) + 'static) -> Self {
        self.completions.push(Box::new(completion));
        self
    }

    /// Append a completion callback in place.
    pub fn add_completion(&mut self, completion: impl FnOnce(bool) + 'static) {
        self.completions.push(Box::new(completion));
    }

    #[must_use]
    pub fn completion_count(&self) -> usize {
        self.completions.len()
    }

    /// True when nothing distinguishes this from the default transaction.
    #[must_use]
    pub fn is_plain(&self) -> bool {
        self.animation.is_none() && !self.disables_animations && self.completions.is_empty()
    }

    /// Move the completions out. Only the application policy calls this,
    /// exactly once per delivery.
    pub(crate) fn take_completions(&mut self) -> Vec<Completion> {
        std::mem::take(&mut self.completions)
    }
}

/// Invoke every completion in order with the same outcome.
pub(crate) fn run_completions(completions: Vec<Completion>, finished: bool) {
    for completion in completions {
        completion(finished);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[test]
    fn default_is_plain() {
        let txn = Transaction::default();
        assert!(txn.is_plain());
        assert!(txn.animation.is_none());
        assert!(!txn.disables_animations);
        assert_eq!(txn.completion_count(), 0);
    }

    #[test]
    fn builders_compose() {
        let anim = Animation::linear(Duration::from_millis(300)).with_delay(Duration::from_millis(50));
        let txn = Transaction::animated(anim)
            .on_complete(|_| {})
            .on_complete(|_| {});
        assert_eq!(txn.animation, Some(anim));
        assert_eq!(txn.completion_count(), 2);
        assert_eq!(anim.total(), Duration::from_millis(350));
        assert!(!txn.is_plain());
    }

    #[test]
    fn completions_taken_once_in_order() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let (a, b) = (Rc::clone(&log), Rc::clone(&log));
        let mut txn = Transaction::new()
            .on_complete(move |ok| a.borrow_mut().push(("a", ok)))
            .on_complete(move |ok| b.borrow_mut().push(("b", ok)));

        run_completions(txn.take_completions(), false);
        assert!(txn.take_completions().is_empty());
        assert_eq!(*log.borrow(), vec![("a", false), ("b", false)]);
    }

    #[test]
    fn curves_hit_endpoints() {
        for curve in [Curve::Linear, Curve::EaseIn, Curve::EaseOut, Curve::EaseInOut] {
            assert_eq!(curve.sample(0.0), 0.0, "{curve:?}");
            assert!((curve.sample(1.0) - 1.0).abs() < 1e-12, "{curve:?}");
            assert_eq!(curve.sample(-3.0), 0.0);
            assert!((curve.sample(7.0) - 1.0).abs() < 1e-12);
        }
        assert!((Curve::EaseInOut.sample(0.5) - 0.5).abs() < 1e-12);
        assert!(Curve::EaseIn.sample(0.25) < 0.25);
        assert!(Curve::EaseOut.sample(0.25) > 0.25);
    }

    #[test]
    fn debug_hides_closures() {
        let txn = Transaction::without_animation().on_complete(|_| {});
        let dbg = format!("{txn:?}");
        assert!(dbg.contains("completion_count: 1"));
        assert!(dbg.contains("disables_animations: true"));
    }
}
