#![forbid(unsafe_code)]

//! The observation registry.
//!
//! Each thread owns one registry; that thread is the serial context for every
//! observable value created on it. The registry:
//!
//! 1. runs a tracked closure once, synchronously, recording what it reads;
//! 2. subscribes the closure to exactly those properties;
//! 3. collects mutations into *deliveries*, one per transaction;
//! 4. on each delivery, re-runs every affected closure once, under the
//!    transaction's presentation policy, re-recording its dependencies.
//!
//! # Delivery
//!
//! ```text
//!   set() ──▶ open transaction scope ──scope ends──▶ queue ──run_pending()/step()──▶ apply(txn, re-runs)
//! ```
//!
//! Mutations outside [`with_transaction`] each form their own delivery under
//! the default transaction. Deliveries are processed in FIFO order; a
//! delivery re-runs affected observations in registration order, and only
//! after every mutation of its transaction has been applied.
//!
//! # Invariants
//!
//! 1. The initial run happens exactly once, before [`observe`] returns.
//! 2. An observation re-runs at most once per delivery.
//! 3. After a re-run the observation is subscribed to exactly the keys that
//!    run read, including when the run failed part-way.
//! 4. A cancelled observation never re-runs; a delivery that reaches it
//!    drops it silently.
//! 5. No registry borrow is held while user code runs (closures, drivers,
//!    completions, hooks, or destructors of removed closures).
//!
//! # Failure Modes
//!
//! | Failure | Behavior |
//! |---------|----------|
//! | Initial run panics | Panic propagates out of [`observe`]; nothing is registered |
//! | Initial run returns `Err` | [`try_observe`] returns it; nothing is registered |
//! | Re-run panics or returns `Err` | Other observations of the delivery still run; then [`FailurePolicy`] decides |
//! | Observation keeps mutating what it reads | Flush stops after `max_deliveries_per_flush`, remainder stays queued |

use std::any::Any;
use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::fmt;
use std::panic;
use std::rc::Rc;

use tracing::{debug, debug_span, error, trace, warn};

use crate::config::{DeliveryMode, FailurePolicy, ObserveConfig};
use crate::error::ObservationFailure;
use crate::handoff;
use crate::presentation::{self, AnimationDriver, Presentation};
use crate::timeline::ImmediateDriver;
use crate::token::ObservationToken;
use crate::tracking::{self, PropertyKey};
use crate::transaction::Transaction;

type TrackedFn = Box<dyn FnMut(Option<&Transaction>) -> Result<(), String>>;
type FailureHook = Rc<dyn Fn(&ObservationFailure)>;

struct Observation {
    run: Rc<RefCell<TrackedFn>>,
    deps: BTreeSet<PropertyKey>,
}

struct Delivery {
    transaction: Transaction,
    changed: BTreeSet<PropertyKey>,
    /// Queued under a disabling transaction or suppression scope; presented
    /// without animation whatever its own transaction says.
    suppressed: bool,
}

struct Registry {
    config: ObserveConfig,
    driver: Rc<dyn AnimationDriver>,
    failure_hook: Option<FailureHook>,
    next_id: u64,
    observations: BTreeMap<u64, Observation>,
    subscribers: HashMap<PropertyKey, BTreeSet<u64>>,
    scopes: Vec<Delivery>,
    queue: VecDeque<Delivery>,
    delivering: bool,
}

impl Default for Registry {
    fn default() -> Self {
        Self {
            config: ObserveConfig::default(),
            driver: Rc::new(ImmediateDriver),
            failure_hook: None,
            next_id: 0,
            observations: BTreeMap::new(),
            subscribers: HashMap::new(),
            scopes: Vec::new(),
            queue: VecDeque::new(),
            delivering: false,
        }
    }
}

impl Registry {
    fn subscribe(&mut self, id: u64, deps: &BTreeSet<PropertyKey>) {
        for key in deps {
            self.subscribers.entry(*key).or_default().insert(id);
        }
    }

    fn unsubscribe(&mut self, id: u64, deps: &BTreeSet<PropertyKey>) {
        for key in deps {
            if let Some(ids) = self.subscribers.get_mut(key) {
                ids.remove(&id);
                if ids.is_empty() {
                    self.subscribers.remove(key);
                }
            }
        }
    }

    fn remove(&mut self, id: u64) -> Option<Observation> {
        let observation = self.observations.remove(&id)?;
        self.unsubscribe(id, &observation.deps);
        Some(observation)
    }

    fn affected(&self, changed: &BTreeSet<PropertyKey>) -> BTreeSet<u64> {
        changed
            .iter()
            .filter_map(|key| self.subscribers.get(key))
            .flatten()
            .copied()
            .collect()
    }

    fn should_flush(&self) -> bool {
        self.config.delivery == DeliveryMode::Immediate && !self.delivering && self.scopes.is_empty()
    }
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("config", &self.config)
            .field("observations", &self.observations.len())
            .field("subscribed_keys", &self.subscribers.len())
            .field("open_scopes", &self.scopes.len())
            .field("queued", &self.queue.len())
            .field("delivering", &self.delivering)
            .finish()
    }
}

thread_local! {
    static REGISTRY: RefCell<Registry> = RefCell::new(Registry::default());
}

fn with<R>(f: impl FnOnce(&mut Registry) -> R) -> R {
    REGISTRY.with(|registry| f(&mut registry.borrow_mut()))
}

// ---------------------------------------------------------------------------
// Registration
// ---------------------------------------------------------------------------

/// Register a tracked closure.
///
/// The closure runs once immediately with `None`, and again with the
/// triggering transaction each time a property it read during its previous
/// run changes. Keep the returned token alive for as long as the observation
/// should stay active.
///
/// # Panics
///
/// A panic in the initial run propagates to the caller and nothing is
/// registered.
pub fn observe(mut f: impl FnMut(Option<&Transaction>) + 'static) -> ObservationToken {
    let id = allocate_id();
    let _span = debug_span!("observe", id).entered();

    let (outcome, deps) = tracking::collect(|| f(None));
    if let Err(payload) = outcome {
        panic::resume_unwind(payload);
    }

    install(
        id,
        Box::new(move |txn: Option<&Transaction>| {
            f(txn);
            Ok(())
        }),
        deps,
    )
}

/// Register a fallible tracked closure.
///
/// An `Err` from the initial run is returned to the caller and nothing is
/// registered. An `Err` from a later re-run is routed through the failure
/// channel as an [`ObservationFailure`].
pub fn try_observe<E, F>(mut f: F) -> Result<ObservationToken, E>
where
    E: fmt::Display + 'static,
    F: FnMut(Option<&Transaction>) -> Result<(), E> + 'static,
{
    let id = allocate_id();
    let _span = debug_span!("try_observe", id).entered();

    let (outcome, deps) = tracking::collect(|| f(None));
    match outcome {
        Err(payload) => panic::resume_unwind(payload),
        Ok(Err(err)) => {
            debug!(id, error = %err, "initial run failed; observation discarded");
            return Err(err);
        }
        Ok(Ok(())) => {}
    }

    Ok(install(
        id,
        Box::new(move |txn: Option<&Transaction>| f(txn).map_err(|err| err.to_string())),
        deps,
    ))
}

fn allocate_id() -> u64 {
    with(|r| {
        r.next_id += 1;
        r.next_id
    })
}

fn install(id: u64, run: TrackedFn, deps: BTreeSet<PropertyKey>) -> ObservationToken {
    trace!(id, deps = deps.len(), "observation registered");
    with(|r| {
        r.subscribe(id, &deps);
        r.observations.insert(
            id,
            Observation {
                run: Rc::new(RefCell::new(run)),
                deps,
            },
        );
    });
    ObservationToken::with_id(id, Box::new(move || cancel_observation(id)))
}

fn cancel_observation(id: u64) {
    // During thread teardown the registry may already be gone.
    let removed = REGISTRY
        .try_with(|registry| registry.borrow_mut().remove(id))
        .ok()
        .flatten();
    if removed.is_some() {
        trace!(id, "observation cancelled");
    }
    // The closure (and everything it captured) is dropped here, outside the
    // borrow.
    drop(removed);
}

// ---------------------------------------------------------------------------
// Mutation
// ---------------------------------------------------------------------------

/// Record that `key` changed under the ambient transaction.
pub(crate) fn did_change(key: PropertyKey) {
    let suppressed = presentation::animations_suppressed();
    let flush = with(|r| {
        if let Some(scope) = r.scopes.last_mut() {
            scope.changed.insert(key);
            false
        } else {
            r.queue.push_back(Delivery {
                transaction: Transaction::default(),
                changed: BTreeSet::from([key]),
                suppressed,
            });
            r.should_flush()
        }
    });
    if flush {
        run_pending();
    }
}

struct ScopeGuard {
    depth: usize,
}

impl Drop for ScopeGuard {
    fn drop(&mut self) {
        let flush = REGISTRY
            .try_with(|registry| {
                let mut r = registry.borrow_mut();
                debug_assert_eq!(r.scopes.len(), self.depth, "transaction scopes out of order");
                if let Some(scope) = r.scopes.pop() {
                    r.queue.push_back(scope);
                }
                r.should_flush()
            })
            .unwrap_or(false);
        if flush && !std::thread::panicking() {
            run_pending();
        }
    }
}

/// Run `body`, delivering every mutation it makes under `transaction`.
///
/// All mutations inside form a single delivery, so each affected observation
/// re-runs once and sees all of the new values. A delivery is queued even if
/// nothing changed, so the transaction's completions always run. Nested
/// scopes form their own deliveries, queued when they end.
///
/// A scope opened inside a disabling transaction, inside
/// [`without_animations`](crate::without_animations), or by a re-run of a
/// suppressed delivery is itself presented without animation.
pub fn with_transaction<R>(transaction: Transaction, body: impl FnOnce() -> R) -> R {
    let ambient = presentation::animations_suppressed();
    let depth = with(|r| {
        let enclosing = r.scopes.last().is_some_and(|scope| scope.suppressed);
        let suppressed = ambient || enclosing || transaction.disables_animations;
        r.scopes.push(Delivery {
            transaction,
            changed: BTreeSet::new(),
            suppressed,
        });
        r.scopes.len()
    });
    let guard = ScopeGuard { depth };
    let result = body();
    drop(guard);
    result
}

// ---------------------------------------------------------------------------
// Delivery
// ---------------------------------------------------------------------------

struct Failed {
    failure: ObservationFailure,
    payload: Option<Box<dyn Any + Send>>,
}

enum Rerun {
    Ran,
    Stale,
    Failed(Failed),
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

fn rerun(id: u64, transaction: &Transaction) -> Rerun {
    let run = with(|r| {
        let observation = r.observations.get_mut(&id)?;
        let run = Rc::clone(&observation.run);
        let old = std::mem::take(&mut observation.deps);
        r.unsubscribe(id, &old);
        Some(run)
    });
    let Some(run) = run else {
        trace!(id, "stale observation dropped");
        return Rerun::Stale;
    };

    let (outcome, deps) = tracking::collect(|| (&mut *run.borrow_mut())(Some(transaction)));

    with(|r| {
        // Cancelled while running: stay unsubscribed.
        if let Some(observation) = r.observations.get_mut(&id) {
            observation.deps = deps.clone();
            r.subscribe(id, &deps);
        }
    });

    match outcome {
        Ok(Ok(())) => Rerun::Ran,
        Ok(Err(message)) => Rerun::Failed(Failed {
            failure: ObservationFailure {
                observation: id,
                message,
            },
            payload: None,
        }),
        Err(payload) => Rerun::Failed(Failed {
            failure: ObservationFailure {
                observation: id,
                message: panic_message(payload.as_ref()),
            },
            payload: Some(payload),
        }),
    }
}

struct DeliveringGuard;

impl DeliveringGuard {
    fn enter() -> Self {
        with(|r| r.delivering = true);
        Self
    }
}

impl Drop for DeliveringGuard {
    fn drop(&mut self) {
        let _ = REGISTRY.try_with(|registry| registry.borrow_mut().delivering = false);
    }
}

/// Process one delivery. Returns `None` if the queue was empty.
fn deliver_next() -> Option<Vec<Failed>> {
    let (delivery, ids, driver, log, hook) = with(|r| {
        let delivery = r.queue.pop_front()?;
        let ids = r.affected(&delivery.changed);
        Some((
            delivery,
            ids,
            Rc::clone(&r.driver),
            r.config.log_deliveries,
            r.failure_hook.clone(),
        ))
    })?;

    let _delivering = DeliveringGuard::enter();
    let targets: Vec<PropertyKey> = delivery.changed.iter().copied().collect();
    let mut failures = Vec::new();
    let mut reran = 0usize;

    let Delivery {
        transaction,
        suppressed,
        ..
    } = delivery;
    let body = |txn: &Transaction| {
        for id in &ids {
            match rerun(*id, txn) {
                Rerun::Ran => reran += 1,
                Rerun::Stale => {}
                Rerun::Failed(failed) => {
                    reran += 1;
                    if let Some(hook) = &hook {
                        hook(&failed.failure);
                    }
                    failures.push(failed);
                }
            }
        }
    };
    let presentation = if suppressed {
        presentation::without_animations(|| {
            presentation::apply(&*driver, transaction, &targets, body)
        })
    } else {
        presentation::apply(&*driver, transaction, &targets, body)
    };

    if log {
        debug!(
            changed = targets.len(),
            affected = ids.len(),
            reran,
            failed = failures.len(),
            presentation = ?presentation,
            "delivery processed"
        );
    } else {
        trace!(changed = targets.len(), reran, "delivery processed");
    }
    Some(failures)
}

fn surface(failures: Vec<Failed>, policy: FailurePolicy) {
    let mut first = None;
    for failed in failures {
        error!(
            observation = failed.failure.observation,
            message = %failed.failure.message,
            "tracked closure failed during re-run"
        );
        if first.is_none() {
            first = Some(failed);
        }
    }
    if policy == FailurePolicy::Propagate {
        if let Some(failed) = first {
            match failed.payload {
                Some(payload) => panic::resume_unwind(payload),
                None => panic!("{}", failed.failure),
            }
        }
    }
}

/// Process queued deliveries (and closures handed off from other threads)
/// until the queue is empty or the runaway guard trips.
///
/// Returns the number of deliveries processed. Calling this from inside a
/// delivery is a no-op; the outer flush picks up anything newly queued.
///
/// # Panics
///
/// Under [`FailurePolicy::Propagate`], re-raises the first re-run failure
/// once the delivery it occurred in has finished. Later deliveries stay
/// queued.
pub fn run_pending() -> usize {
    if with(|r| r.delivering) {
        return 0;
    }
    handoff::drain();

    let (max, policy) = with(|r| (r.config.max_deliveries_per_flush, r.config.failure_policy));
    let mut processed = 0;
    while processed < max {
        let Some(failures) = deliver_next() else {
            break;
        };
        processed += 1;
        if !failures.is_empty() {
            surface(failures, policy);
        }
    }

    let remaining = pending_deliveries();
    if remaining > 0 && processed >= max {
        warn!(
            processed,
            remaining, "delivery budget exhausted; observations may be feeding back into themselves"
        );
    }
    processed
}

/// Process exactly one queued delivery. Returns `false` if there was none.
///
/// Closures handed off from other threads run first, as in [`run_pending`].
///
/// # Panics
///
/// Same as [`run_pending`].
pub fn step() -> bool {
    if with(|r| r.delivering) {
        return false;
    }
    handoff::drain();
    let policy = with(|r| r.config.failure_policy);
    match deliver_next() {
        Some(failures) => {
            surface(failures, policy);
            true
        }
        None => false,
    }
}

// ---------------------------------------------------------------------------
// Configuration & introspection
// ---------------------------------------------------------------------------

/// Replace this thread's registry configuration.
///
/// A zero `max_deliveries_per_flush` would stall the queue, so it is raised
/// to one.
pub fn configure(mut config: ObserveConfig) {
    if let Err(errors) = config.validate() {
        for err in &errors {
            warn!(error = %err, "invalid observation config; clamping");
        }
        config.max_deliveries_per_flush = config.max_deliveries_per_flush.max(1);
    }
    debug!(?config, "observation registry configured");
    with(|r| r.config = config);
}

/// Current configuration of this thread's registry.
#[must_use]
pub fn config() -> ObserveConfig {
    with(|r| r.config.clone())
}

/// Install the driver used for animated deliveries, returning the previous
/// one.
pub fn install_driver(driver: Rc<dyn AnimationDriver>) -> Rc<dyn AnimationDriver> {
    with(|r| std::mem::replace(&mut r.driver, driver))
}

/// Install a hook that receives every re-run failure, regardless of policy.
pub fn set_failure_hook(hook: Option<impl Fn(&ObservationFailure) + 'static>) {
    let hook = hook.map(|h| Rc::new(h) as FailureHook);
    let previous = with(|r| std::mem::replace(&mut r.failure_hook, hook));
    drop(previous);
}

/// Number of active observations.
#[must_use]
pub fn observation_count() -> usize {
    with(|r| r.observations.len())
}

/// Number of observations currently subscribed to `key`.
#[must_use]
pub fn subscriber_count(key: PropertyKey) -> usize {
    with(|r| r.subscribers.get(&key).map_or(0, BTreeSet::len))
}

/// Number of deliveries waiting to be processed.
#[must_use]
pub fn pending_deliveries() -> usize {
    with(|r| r.queue.len())
}

/// Whether a delivery is being processed right now.
#[must_use]
pub fn is_delivering() -> bool {
    with(|r| r.delivering)
}

/// Presentation branch helper for hosts that apply a transaction without a
/// property change (e.g. to run its completions alongside a manual update).
pub fn apply_now(transaction: Transaction, body: impl FnOnce(&Transaction)) -> Presentation {
    let driver = with(|r| Rc::clone(&r.driver));
    presentation::apply(&*driver, transaction, &[], body)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observable::Observable;
    use std::cell::Cell;

    #[test]
    fn initial_run_is_synchronous_and_single() {
        let runs = Rc::new(Cell::new(0));
        let runs_clone = Rc::clone(&runs);
        let _token = observe(move |txn| {
            assert!(txn.is_none());
            runs_clone.set(runs_clone.get() + 1);
        });
        assert_eq!(runs.get(), 1);
        assert_eq!(run_pending(), 0);
        assert_eq!(runs.get(), 1);
    }

    #[test]
    fn rerun_receives_transaction() {
        let value = Observable::new(0);
        let seen = Rc::new(RefCell::new(Vec::new()));
        let (v, s) = (value.clone(), Rc::clone(&seen));
        let _token = observe(move |txn| {
            let disabled = txn.map(|t| t.disables_animations);
            s.borrow_mut().push((v.get(), disabled));
        });

        with_transaction(Transaction::without_animation(), || value.set(5));
        run_pending();
        assert_eq!(*seen.borrow(), vec![(0, None), (5, Some(true))]);
    }

    #[test]
    fn dependencies_follow_latest_run() {
        let flag = Observable::new(true);
        let a = Observable::new(1);
        let b = Observable::new(10);
        let seen = Rc::new(RefCell::new(Vec::new()));
        let (f, ac, bc, s) = (flag.clone(), a.clone(), b.clone(), Rc::clone(&seen));
        let _token = observe(move |_| {
            let v = if f.get() { ac.get() } else { bc.get() };
            s.borrow_mut().push(v);
        });

        b.set(11);
        run_pending();
        assert_eq!(*seen.borrow(), vec![1], "b was not read yet");

        flag.set(false);
        run_pending();
        assert_eq!(*seen.borrow(), vec![1, 11]);

        a.set(2);
        run_pending();
        assert_eq!(*seen.borrow(), vec![1, 11], "a is no longer a dependency");
        assert_eq!(subscriber_count(a.key()), 0);
        assert_eq!(subscriber_count(b.key()), 1);
    }

    #[test]
    fn coalesces_within_transaction() {
        let a = Observable::new(0);
        let b = Observable::new(0);
        let seen = Rc::new(RefCell::new(Vec::new()));
        let (ac, bc, s) = (a.clone(), b.clone(), Rc::clone(&seen));
        let _token = observe(move |_| s.borrow_mut().push((ac.get(), bc.get())));

        with_transaction(Transaction::new(), || {
            a.set(1);
            b.set(2);
        });
        assert_eq!(pending_deliveries(), 1);
        assert_eq!(run_pending(), 1);
        assert_eq!(*seen.borrow(), vec![(0, 0), (1, 2)]);
    }

    #[test]
    fn token_drop_cancels_before_processing() {
        let value = Observable::new(0);
        let runs = Rc::new(Cell::new(0));
        let (v, r) = (value.clone(), Rc::clone(&runs));
        let token = observe(move |_| {
            let _ = v.get();
            r.set(r.get() + 1);
        });
        assert_eq!(observation_count(), 1);

        value.set(1);
        drop(token);
        run_pending();
        assert_eq!(runs.get(), 1);
        assert_eq!(observation_count(), 0);
        assert_eq!(subscriber_count(value.key()), 0);
    }

    #[test]
    fn step_processes_one_delivery() {
        let value = Observable::new(0);
        let _t = value.subscribe(|_| {});
        value.set(1);
        value.set(2);
        assert_eq!(pending_deliveries(), 2);
        assert!(step());
        assert_eq!(pending_deliveries(), 1);
        assert!(step());
        assert!(!step());
    }

    #[test]
    fn immediate_mode_flushes_at_scope_end() {
        configure(ObserveConfig::default().with_delivery(DeliveryMode::Immediate));
        let a = Observable::new(0);
        let b = Observable::new(0);
        let seen = Rc::new(RefCell::new(Vec::new()));
        let (ac, bc, s) = (a.clone(), b.clone(), Rc::clone(&seen));
        let _token = observe(move |_| s.borrow_mut().push(ac.get() + bc.get()));

        a.set(1);
        assert_eq!(*seen.borrow(), vec![0, 1]);

        with_transaction(Transaction::new(), || {
            a.set(2);
            b.set(3);
            assert_eq!(seen.borrow().len(), 2, "nothing delivered mid-scope");
        });
        assert_eq!(*seen.borrow(), vec![0, 1, 5]);
        assert_eq!(pending_deliveries(), 0);
    }

    #[test]
    fn nested_scopes_deliver_separately_inner_first() {
        let a = Observable::new(0);
        let b = Observable::new(0);
        let order = Rc::new(RefCell::new(Vec::new()));
        let (o1, o2) = (Rc::clone(&order), Rc::clone(&order));
        with_transaction(Transaction::new().on_complete(move |_| o1.borrow_mut().push("outer")), || {
            a.set(1);
            with_transaction(Transaction::new().on_complete(move |_| o2.borrow_mut().push("inner")), || {
                b.set(1);
            });
        });
        assert_eq!(pending_deliveries(), 2);
        run_pending();
        assert_eq!(*order.borrow(), vec!["inner", "outer"]);
    }

    #[test]
    fn report_policy_isolates_failures() {
        configure(ObserveConfig::default().with_failure_policy(FailurePolicy::Report));
        let failures = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&failures);
        set_failure_hook(Some(move |f: &ObservationFailure| sink.borrow_mut().push(f.clone())));

        let value = Observable::new(0);
        let after = Rc::new(Cell::new(0));
        let v1 = value.clone();
        let failing = observe(move |txn| {
            let current = v1.get();
            if txn.is_some() && current == 1 {
                panic!("cannot render {current}");
            }
        });
        let (v2, a) = (value.clone(), Rc::clone(&after));
        let _healthy = observe(move |_| a.set(v2.get()));

        value.set(1);
        run_pending();
        assert_eq!(after.get(), 1, "second observer still ran");
        assert_eq!(failures.borrow().len(), 1);
        assert_eq!(failures.borrow()[0].observation, failing.id());
        assert!(failures.borrow()[0].message.contains("cannot render 1"));
        assert_eq!(subscriber_count(value.key()), 2, "partial deps kept");
        set_failure_hook(None::<fn(&ObservationFailure)>);
    }

    #[test]
    fn propagate_policy_reraises_after_delivery() {
        let value = Observable::new(0);
        let after = Rc::new(Cell::new(0));
        let v1 = value.clone();
        let _failing = observe(move |txn| {
            let _ = v1.get();
            if txn.is_some() {
                panic!("re-run failed");
            }
        });
        let (v2, a) = (value.clone(), Rc::clone(&after));
        let _healthy = observe(move |_| a.set(v2.get()));

        value.set(3);
        let result = panic::catch_unwind(panic::AssertUnwindSafe(run_pending));
        assert!(result.is_err());
        assert_eq!(after.get(), 3);
        assert!(!is_delivering(), "delivery flag reset after unwinding");
    }

    #[test]
    fn try_observe_returns_initial_error() {
        let result = try_observe(|_| Err::<(), _>("not ready"));
        assert_eq!(result.unwrap_err(), "not ready");
        assert_eq!(observation_count(), 0);
    }

    #[test]
    fn try_observe_rerun_error_is_reported() {
        configure(ObserveConfig::default().with_failure_policy(FailurePolicy::Report));
        let messages = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&messages);
        set_failure_hook(Some(move |f: &ObservationFailure| sink.borrow_mut().push(f.message.clone())));

        let value = Observable::new(0);
        let v = value.clone();
        let _token = try_observe(move |_| {
            if v.get() > 0 { Err(format!("too big: {}", v.get())) } else { Ok(()) }
        })
        .expect("initial run succeeds");

        value.set(4);
        run_pending();
        assert_eq!(*messages.borrow(), vec!["too big: 4".to_string()]);
        set_failure_hook(None::<fn(&ObservationFailure)>);
    }

    #[test]
    fn initial_panic_propagates_and_registers_nothing() {
        let value = Observable::new(0);
        let v = value.clone();
        let result = panic::catch_unwind(panic::AssertUnwindSafe(|| {
            let _token = observe(move |_| {
                let _ = v.get();
                panic!("initial failure");
            });
        }));
        assert!(result.is_err());
        assert_eq!(observation_count(), 0);
        assert_eq!(subscriber_count(value.key()), 0);
        assert!(!tracking::is_tracking());
    }

    #[test]
    fn runaway_guard_bounds_flush() {
        configure(ObserveConfig::default().with_max_deliveries_per_flush(5));
        let value = Observable::new(0);
        let v = value.clone();
        let _token = observe(move |txn| {
            let current = v.get();
            if txn.is_some() {
                v.set(current + 1);
            }
        });
        value.set(1);
        assert_eq!(run_pending(), 5);
        assert_eq!(pending_deliveries(), 1);
        assert_eq!(value.get_untracked(), 6);
    }

    #[test]
    fn observation_cancelling_itself_mid_run() {
        let value = Observable::new(0);
        let holder: Rc<RefCell<Option<ObservationToken>>> = Rc::new(RefCell::new(None));
        let runs = Rc::new(Cell::new(0));
        let (v, h, r) = (value.clone(), Rc::clone(&holder), Rc::clone(&runs));
        let token = observe(move |txn| {
            let _ = v.get();
            r.set(r.get() + 1);
            if txn.is_some() {
                h.borrow_mut().take();
            }
        });
        *holder.borrow_mut() = Some(token);

        value.set(1);
        run_pending();
        value.set(2);
        run_pending();
        assert_eq!(runs.get(), 2);
        assert_eq!(observation_count(), 0);
    }

    #[test]
    fn rerun_with_nothing_changed_still_fires_completions() {
        let done = Rc::new(Cell::new(None));
        let d = Rc::clone(&done);
        with_transaction(Transaction::new().on_complete(move |ok| d.set(Some(ok))), || {});
        assert_eq!(done.get(), None);
        run_pending();
        assert_eq!(done.get(), Some(true));
    }

    #[test]
    fn apply_now_uses_installed_driver() {
        let done = Rc::new(Cell::new(false));
        let d = Rc::clone(&done);
        let branch = apply_now(
            Transaction::animated(crate::Animation::default()).on_complete(move |ok| d.set(ok)),
            |_| {},
        );
        assert_eq!(branch, Presentation::Animated);
        assert!(done.get(), "immediate driver settles at once");
    }

    fn timeline() -> Rc<crate::timeline::TimelineDriver> {
        let driver = Rc::new(crate::timeline::TimelineDriver::new());
        install_driver(driver.clone());
        driver
    }

    fn animated(done: &Rc<Cell<Option<bool>>>) -> Transaction {
        let d = Rc::clone(done);
        Transaction::animated(crate::Animation::linear(std::time::Duration::from_millis(300)))
            .on_complete(move |ok| d.set(Some(ok)))
    }

    #[test]
    fn animated_scope_nested_in_disabling_scope_is_suppressed() {
        let driver = timeline();
        let a = Observable::new(0);
        let b = Observable::new(0);
        let done = Rc::new(Cell::new(None));
        with_transaction(Transaction::without_animation(), || {
            a.set(1);
            with_transaction(animated(&done), || b.set(1));
        });
        run_pending();
        assert_eq!(driver.in_flight(), 0);
        assert_eq!(done.get(), Some(true));
    }

    #[test]
    fn mutation_inside_without_animations_is_suppressed() {
        let driver = timeline();
        let a = Observable::new(0);
        let done = Rc::new(Cell::new(None));
        presentation::without_animations(|| a.set_with(1, animated(&done)));
        assert!(!presentation::animations_suppressed());
        run_pending();
        assert_eq!(driver.in_flight(), 0);
        assert_eq!(done.get(), Some(true));
    }

    #[test]
    fn rerun_of_suppressed_delivery_suppresses_its_mutations() {
        let driver = timeline();
        let a = Observable::new(0);
        let b = Observable::new(0);
        let done = Rc::new(Cell::new(None));
        let (ac, bc, d) = (a.clone(), b.clone(), Rc::clone(&done));
        let _token = observe(move |txn| {
            let value = ac.get();
            if txn.is_some() {
                bc.set_with(value, animated(&d));
            }
        });

        a.set_with(1, Transaction::without_animation());
        run_pending();
        assert_eq!(b.get_untracked(), 1);
        assert_eq!(driver.in_flight(), 0);
        assert_eq!(done.get(), Some(true));
    }

    #[test]
    fn animated_delivery_outside_suppression_still_animates() {
        let driver = timeline();
        let a = Observable::new(0);
        let done = Rc::new(Cell::new(None));
        a.set_with(1, animated(&done));
        run_pending();
        assert_eq!(driver.in_flight(), 1);
        assert_eq!(done.get(), None);
        driver.finish_all();
        assert_eq!(done.get(), Some(true));
    }

    #[test]
    fn zero_delivery_budget_is_clamped() {
        configure(ObserveConfig {
            max_deliveries_per_flush: 0,
            ..ObserveConfig::default()
        });
        assert_eq!(config().max_deliveries_per_flush, 1);

        let value = Observable::new(0);
        let runs = Rc::new(Cell::new(0));
        let (v, r) = (value.clone(), Rc::clone(&runs));
        let _token = observe(move |_| {
            let _ = v.get();
            r.set(r.get() + 1);
        });
        for i in 1..=3 {
            value.set(i);
        }
        assert_eq!(run_pending(), 1);
        assert_eq!(run_pending(), 1);
        assert_eq!(run_pending(), 1);
        assert_eq!(pending_deliveries(), 0);
        assert_eq!(runs.get(), 4);
    }

    #[test]
    fn step_runs_handed_off_work() {
        let value = Observable::new(0);
        let seen = Rc::new(RefCell::new(Vec::new()));
        let (v, s) = (value.clone(), Rc::clone(&seen));
        let _token = observe(move |_| s.borrow_mut().push(v.get()));

        thread_local! {
            static TARGET: RefCell<Option<Observable<i32>>> = const { RefCell::new(None) };
        }
        TARGET.with(|t| *t.borrow_mut() = Some(value.clone()));
        let handle = handoff::handoff();
        std::thread::spawn(move || {
            handle
                .post(|| {
                    TARGET.with(|t| {
                        if let Some(target) = t.borrow().as_ref() {
                            target.set(7);
                        }
                    });
                })
                .expect("serial thread alive");
        })
        .join()
        .expect("worker");

        assert!(step());
        assert_eq!(*seen.borrow(), vec![0, 7]);
    }
}
