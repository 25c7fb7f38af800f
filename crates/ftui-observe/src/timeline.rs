#![forbid(unsafe_code)]

//! Built-in animation drivers.
//!
//! - [`ImmediateDriver`]: no presentation layer. Effects settle as soon as
//!   the body has run. This is the registry's default.
//! - [`TimelineDriver`]: deterministic effect clock. Effects settle when the
//!   host advances time past `delay + duration`, or are interrupted when a
//!   newer effect targets one of the same properties.
//!
//! Neither driver ends an effect on a wall-clock timeout; time only moves
//! when the host calls [`TimelineDriver::advance`].

use std::cell::RefCell;
use std::fmt;
use std::time::Duration;

use tracing::trace;

use crate::presentation::{AnimationDriver, FinishHook};
use crate::tracking::PropertyKey;
use crate::transaction::Animation;

/// Driver for hosts without animation support.
#[derive(Debug, Default, Clone, Copy)]
pub struct ImmediateDriver;

impl AnimationDriver for ImmediateDriver {
    fn animate(
        &self,
        _animation: &Animation,
        _targets: &[PropertyKey],
        body: &mut dyn FnMut(),
        on_finish: Option<FinishHook>,
    ) {
        body();
        if let Some(hook) = on_finish {
            hook(true);
        }
    }
}

/// Identifier of an effect started on a [`TimelineDriver`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EffectId(u64);

struct Effect {
    id: EffectId,
    animation: Animation,
    targets: Vec<PropertyKey>,
    elapsed: Duration,
    on_finish: Option<FinishHook>,
}

impl Effect {
    fn settled(&self) -> bool {
        self.elapsed >= self.animation.total()
    }

    fn overlaps(&self, targets: &[PropertyKey]) -> bool {
        self.targets.iter().any(|key| targets.contains(key))
    }
}

#[derive(Default)]
struct TimelineState {
    next_id: u64,
    effects: Vec<Effect>,
    last_started: Option<EffectId>,
}

/// Deterministic animation clock.
///
/// # Invariants
///
/// 1. Each effect's finish hook runs exactly once: on settle (`true`), on
///    interruption (`false`), or never if the effect had no hook.
/// 2. Effects settle in start order within one [`advance`](Self::advance).
/// 3. Hooks run with no internal borrow held, so they may start new effects.
#[derive(Default)]
pub struct TimelineDriver {
    state: RefCell<TimelineState>,
}

impl fmt::Debug for TimelineDriver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.borrow();
        f.debug_struct("TimelineDriver")
            .field("in_flight", &state.effects.len())
            .field("last_started", &state.last_started)
            .finish()
    }
}

impl TimelineDriver {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of effects that have neither settled nor been interrupted.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.state.borrow().effects.len()
    }

    /// Id of the most recently started effect.
    #[must_use]
    pub fn last_started(&self) -> Option<EffectId> {
        self.state.borrow().last_started
    }

    #[must_use]
    pub fn is_running(&self, id: EffectId) -> bool {
        self.state.borrow().effects.iter().any(|e| e.id == id)
    }

    /// Whether any in-flight effect targets `key`.
    #[must_use]
    pub fn is_animating(&self, key: PropertyKey) -> bool {
        self.state
            .borrow()
            .effects
            .iter()
            .any(|e| e.targets.contains(&key))
    }

    /// Eased progress of a running effect in `[0, 1]`, or `None` once it has
    /// settled or been interrupted. Progress stays at 0 during the delay.
    #[must_use]
    pub fn progress(&self, id: EffectId) -> Option<f64> {
        let state = self.state.borrow();
        let effect = state.effects.iter().find(|e| e.id == id)?;
        let animation = &effect.animation;
        let active = effect.elapsed.saturating_sub(animation.delay);
        let linear = if animation.duration.is_zero() {
            1.0
        } else {
            active.as_secs_f64() / animation.duration.as_secs_f64()
        };
        Some(animation.curve.sample(linear))
    }

    /// Move the clock forward by `dt`, settling every effect whose total time
    /// has elapsed. Returns the number of effects settled.
    pub fn advance(&self, dt: Duration) -> usize {
        let settled: Vec<Effect> = {
            let mut state = self.state.borrow_mut();
            for effect in &mut state.effects {
                effect.elapsed = effect.elapsed.saturating_add(dt);
            }
            let (done, running) = std::mem::take(&mut state.effects)
                .into_iter()
                .partition(Effect::settled);
            state.effects = running;
            done
        };
        let count = settled.len();
        Self::finish(settled, true);
        count
    }

    /// Settle every in-flight effect as finished.
    pub fn finish_all(&self) -> usize {
        let settled = std::mem::take(&mut self.state.borrow_mut().effects);
        let count = settled.len();
        Self::finish(settled, true);
        count
    }

    fn finish(effects: Vec<Effect>, finished: bool) {
        for mut effect in effects {
            trace!(effect = effect.id.0, finished, "animation effect ended");
            if let Some(hook) = effect.on_finish.take() {
                hook(finished);
            }
        }
    }
}

impl AnimationDriver for TimelineDriver {
    fn animate(
        &self,
        animation: &Animation,
        targets: &[PropertyKey],
        body: &mut dyn FnMut(),
        on_finish: Option<FinishHook>,
    ) {
        body();

        let (interrupted, id) = {
            let mut state = self.state.borrow_mut();
            let (interrupted, running): (Vec<Effect>, Vec<Effect>) =
                std::mem::take(&mut state.effects)
                    .into_iter()
                    .partition(|e| e.overlaps(targets));
            state.effects = running;
            state.next_id += 1;
            let id = EffectId(state.next_id);
            state.last_started = Some(id);
            (interrupted, id)
        };
        Self::finish(interrupted, false);

        let effect = Effect {
            id,
            animation: *animation,
            targets: targets.to_vec(),
            elapsed: Duration::ZERO,
            on_finish,
        };
        trace!(effect = id.0, targets = targets.len(), "animation effect started");
        if effect.settled() {
            Self::finish(vec![effect], true);
        } else {
            self.state.borrow_mut().effects.push(effect);
        }
    }
}
