//! Single-assignment futures with cooperative cancellation.
//!
//! A [`CancellableFuture`] is completed once through a [`Completer`] (or the
//! future itself) and consumed once, either by blocking on it or by chaining
//! a continuation. Cancelling runs the cancellation hook and every attached
//! [`Cancelable`] exactly once, then resolves the future as
//! [`Outcome::Cancelled`].

mod delivery;

use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::thread;
use std::time::{Duration, Instant};

use crate::error::Error;
use crate::util::lock_unpoisoned;

pub use delivery::{
    DEFAULT_DELIVERY_THREAD_NAME, DeliveryJob, DeliverySink, DeliveryThread, InlineDelivery,
};

/// Anything that can be asked to stop its work.
pub trait Cancelable: Send + Sync {
    fn cancel(&self);
}

/// Terminal state of a future.
#[derive(Debug)]
pub enum Outcome<T> {
    Value(T),
    Failed(Error),
    Cancelled,
}

impl<T> Outcome<T> {
    pub const fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Cancellation surfaces as [`Error::Cancelled`].
    pub fn into_result(self) -> crate::Result<T> {
        match self {
            Self::Value(value) => Ok(value),
            Self::Failed(error) => Err(error),
            Self::Cancelled => Err(Error::Cancelled),
        }
    }
}

type Continuation<T> = Box<dyn FnOnce(Outcome<T>) + Send>;

struct Cell<T> {
    outcome: Option<Outcome<T>>,
    continuation: Option<Continuation<T>>,
    done: bool,
    cancelled: bool,
}

/// Cancellation hook shared between a future and the futures derived from
/// it, so the action runs once no matter which of them is cancelled.
struct CancelHook {
    action: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

impl CancelHook {
    fn run(&self) {
        let action = lock_unpoisoned(&self.action).take();
        if let Some(action) = action
            && catch_unwind(AssertUnwindSafe(action)).is_err()
        {
            tracing::error!("future cancellation hook panicked");
        }
    }
}

struct AttachedResource {
    resource: Arc<dyn Cancelable>,
    fired: AtomicBool,
}

impl AttachedResource {
    fn cancel(&self) {
        if self.fired.swap(true, Ordering::SeqCst) {
            return;
        }
        if catch_unwind(AssertUnwindSafe(|| self.resource.cancel())).is_err() {
            tracing::error!("attached resource panicked while cancelling");
        }
    }
}

trait CancelTarget: Send + Sync {
    fn cancel_target(&self) -> bool;
    fn target_cancelled(&self) -> bool;
}

struct Shared<T> {
    cell: Mutex<Cell<T>>,
    ready: Condvar,
    work_cancelled: AtomicBool,
    hook: Mutex<Option<Arc<CancelHook>>>,
    resources: Mutex<Vec<Arc<AttachedResource>>>,
    upstream: Mutex<Vec<Weak<dyn CancelTarget>>>,
}

impl<T: Send + 'static> Shared<T> {
    fn new() -> Self {
        Self {
            cell: Mutex::new(Cell {
                outcome: None,
                continuation: None,
                done: false,
                cancelled: false,
            }),
            ready: Condvar::new(),
            work_cancelled: AtomicBool::new(false),
            hook: Mutex::new(None),
            resources: Mutex::new(Vec::new()),
            upstream: Mutex::new(Vec::new()),
        }
    }

    fn settle(&self, outcome: Outcome<T>) -> bool {
        let pending = {
            let mut cell = lock_unpoisoned(&self.cell);
            if cell.done {
                return false;
            }
            cell.done = true;
            cell.cancelled = outcome.is_cancelled();
            match cell.continuation.take() {
                Some(continuation) => Some((continuation, outcome)),
                None => {
                    cell.outcome = Some(outcome);
                    None
                }
            }
        };
        self.ready.notify_all();
        if let Some((continuation, outcome)) = pending {
            continuation(outcome);
        }
        true
    }

    fn complete(&self, value: T) -> bool {
        if self.work_cancelled.load(Ordering::SeqCst) {
            return false;
        }
        self.settle(Outcome::Value(value))
    }

    fn fail(&self, error: Error) -> bool {
        if self.work_cancelled.load(Ordering::SeqCst) {
            return false;
        }
        self.settle(Outcome::Failed(error))
    }

    fn settle_from(&self, outcome: Outcome<T>) {
        match outcome {
            Outcome::Value(value) => {
                self.complete(value);
            }
            Outcome::Failed(error) => {
                self.fail(error);
            }
            Outcome::Cancelled => {
                self.cancel_once();
            }
        }
    }

    /// Returns `true` when this call won the cancellation and the future was
    /// still pending.
    fn cancel_once(&self) -> bool {
        if self
            .work_cancelled
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return false;
        }

        let hook = lock_unpoisoned(&self.hook).take();
        if let Some(hook) = hook {
            hook.run();
        }
        let resources = lock_unpoisoned(&self.resources).clone();
        for resource in resources {
            resource.cancel();
        }
        let marked = self.settle(Outcome::Cancelled);

        let upstream = std::mem::take(&mut *lock_unpoisoned(&self.upstream));
        for link in upstream {
            if let Some(target) = link.upgrade() {
                target.cancel_target();
            }
        }
        marked
    }

    fn attach(&self, resource: Arc<dyn Cancelable>) {
        let attached = Arc::new(AttachedResource {
            resource,
            fired: AtomicBool::new(false),
        });
        lock_unpoisoned(&self.resources).push(Arc::clone(&attached));
        if self.work_cancelled.load(Ordering::SeqCst) {
            attached.cancel();
        }
    }

    fn register(&self, continuation: Continuation<T>) {
        let outcome = {
            let mut cell = lock_unpoisoned(&self.cell);
            match cell.outcome.take() {
                Some(outcome) => outcome,
                None => {
                    if !cell.done {
                        cell.continuation = Some(continuation);
                    }
                    return;
                }
            }
        };
        continuation(outcome);
    }

    fn wait_until(&self, deadline: Option<Instant>) -> Option<Outcome<T>> {
        let mut cell = lock_unpoisoned(&self.cell);
        loop {
            if let Some(outcome) = cell.outcome.take() {
                return Some(outcome);
            }
            match deadline {
                None => {
                    cell = match self.ready.wait(cell) {
                        Ok(cell) => cell,
                        Err(poisoned) => poisoned.into_inner(),
                    };
                }
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return None;
                    }
                    cell = match self.ready.wait_timeout(cell, deadline - now) {
                        Ok((cell, _)) => cell,
                        Err(poisoned) => poisoned.into_inner().0,
                    };
                }
            }
        }
    }
}

impl<T: Send + 'static> CancelTarget for Shared<T> {
    fn cancel_target(&self) -> bool {
        self.cancel_once()
    }

    fn target_cancelled(&self) -> bool {
        lock_unpoisoned(&self.cell).cancelled
    }
}

/// A value that becomes available later, possibly never.
pub struct CancellableFuture<T> {
    shared: Arc<Shared<T>>,
}

impl<T> fmt::Debug for CancellableFuture<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let cell = lock_unpoisoned(&self.shared.cell);
        f.debug_struct("CancellableFuture")
            .field("done", &cell.done)
            .field("cancelled", &cell.cancelled)
            .field(
                "work_cancelled",
                &self.shared.work_cancelled.load(Ordering::SeqCst),
            )
            .finish()
    }
}

impl<T: Send + 'static> Default for CancellableFuture<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Send + 'static> CancellableFuture<T> {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared::new()),
        }
    }

    pub fn completed(value: T) -> Self {
        let future = Self::new();
        future.shared.settle(Outcome::Value(value));
        future
    }

    pub fn failed(error: Error) -> Self {
        let future = Self::new();
        future.shared.settle(Outcome::Failed(error));
        future
    }

    /// Runs `work` on a fresh thread. The work is skipped when the future is
    /// cancelled before the thread gets to it.
    pub fn spawn<F>(work: F) -> Self
    where
        F: FnOnce() -> crate::Result<T> + Send + 'static,
    {
        let future = Self::new();
        let shared = Arc::clone(&future.shared);
        let spawned = thread::Builder::new()
            .name("netq-future".to_owned())
            .spawn(move || {
                if shared.work_cancelled.load(Ordering::SeqCst) {
                    return;
                }
                match work() {
                    Ok(value) => shared.complete(value),
                    Err(error) => shared.fail(error),
                };
            });
        if let Err(error) = spawned {
            future.complete_exceptionally(Error::Internal {
                message: format!("failed to spawn future thread: {error}"),
            });
        }
        future
    }

    pub fn completer(&self) -> Completer<T> {
        Completer {
            shared: Arc::clone(&self.shared),
        }
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle {
            target: self.shared.clone(),
        }
    }

    /// Returns `false` when the future is already done or its work was
    /// cancelled.
    pub fn complete(&self, value: T) -> bool {
        self.shared.complete(value)
    }

    pub fn complete_exceptionally(&self, error: Error) -> bool {
        self.shared.fail(error)
    }

    pub fn cancel(&self) -> bool {
        self.shared.cancel_once()
    }

    /// Same as [`cancel`](Self::cancel); named for callers that only want
    /// the underlying work stopped.
    pub fn cancel_work(&self) -> bool {
        self.shared.cancel_once()
    }

    pub fn is_done(&self) -> bool {
        lock_unpoisoned(&self.shared.cell).done
    }

    pub fn is_cancelled(&self) -> bool {
        lock_unpoisoned(&self.shared.cell).cancelled
    }

    pub fn is_work_cancelled(&self) -> bool {
        self.shared.work_cancelled.load(Ordering::SeqCst)
    }

    /// Replaces the cancellation hook. The hook runs at most once.
    pub fn set_cancel_hook<F>(&self, hook: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let hook = Arc::new(CancelHook {
            action: Mutex::new(Some(Box::new(hook))),
        });
        *lock_unpoisoned(&self.shared.hook) = Some(hook);
    }

    /// Attaches a resource that is cancelled together with this future. A
    /// resource attached after cancellation is cancelled right away.
    pub fn attach(&self, resource: impl Cancelable + 'static) {
        self.shared.attach(Arc::new(resource));
    }

    pub fn attach_arc(&self, resource: Arc<dyn Cancelable>) {
        self.shared.attach(resource);
    }

    /// Runs `continuation` with the outcome once it is known, on the thread
    /// that completes the future (or right away if it already is).
    pub fn on_complete<F>(self, continuation: F)
    where
        F: FnOnce(Outcome<T>) + Send + 'static,
    {
        self.shared.register(Box::new(continuation));
    }

    pub fn map<U, F>(self, map: F) -> CancellableFuture<U>
    where
        U: Send + 'static,
        F: FnOnce(T) -> U + Send + 'static,
    {
        let derived = self.derive::<U>();
        let target = Arc::clone(&derived.shared);
        self.on_complete(move |outcome| match outcome {
            Outcome::Value(value) => {
                target.complete(map(value));
            }
            Outcome::Failed(error) => {
                target.fail(error);
            }
            Outcome::Cancelled => {
                target.cancel_once();
            }
        });
        derived
    }

    pub fn try_map<U, F>(self, map: F) -> CancellableFuture<U>
    where
        U: Send + 'static,
        F: FnOnce(T) -> crate::Result<U> + Send + 'static,
    {
        let derived = self.derive::<U>();
        let target = Arc::clone(&derived.shared);
        self.on_complete(move |outcome| match outcome {
            Outcome::Value(value) => match map(value) {
                Ok(mapped) => {
                    target.complete(mapped);
                }
                Err(error) => {
                    target.fail(error);
                }
            },
            Outcome::Failed(error) => {
                target.fail(error);
            }
            Outcome::Cancelled => {
                target.cancel_once();
            }
        });
        derived
    }

    /// Chains a follow-up future. Cancelling the result also cancels the
    /// follow-up once it exists.
    pub fn compose<U, F>(self, next: F) -> CancellableFuture<U>
    where
        U: Send + 'static,
        F: FnOnce(T) -> CancellableFuture<U> + Send + 'static,
    {
        let derived = self.derive::<U>();
        let target = Arc::clone(&derived.shared);
        self.on_complete(move |outcome| match outcome {
            Outcome::Value(value) => {
                let inner = next(value);
                target.attach(Arc::new(inner.cancel_handle()));
                let forward = Arc::clone(&target);
                inner.on_complete(move |outcome| forward.settle_from(outcome));
            }
            Outcome::Failed(error) => {
                target.fail(error);
            }
            Outcome::Cancelled => {
                target.cancel_once();
            }
        });
        derived
    }

    /// Blocks until the outcome is known.
    pub fn wait_outcome(self) -> Outcome<T> {
        match self.shared.wait_until(None) {
            Some(outcome) => outcome,
            None => Outcome::Cancelled,
        }
    }

    pub fn wait(self) -> crate::Result<T> {
        self.wait_outcome().into_result()
    }

    /// Gives the future back when `timeout` elapses first.
    pub fn wait_timeout(self, timeout: Duration) -> Result<Outcome<T>, Self> {
        match self.shared.wait_until(Instant::now().checked_add(timeout)) {
            Some(outcome) => Ok(outcome),
            None => Err(self),
        }
    }

    fn derive<U: Send + 'static>(&self) -> CancellableFuture<U> {
        let derived = CancellableFuture::<U>::new();
        let hook = lock_unpoisoned(&self.shared.hook).clone();
        *lock_unpoisoned(&derived.shared.hook) = hook;
        let resources = lock_unpoisoned(&self.shared.resources).clone();
        *lock_unpoisoned(&derived.shared.resources) = resources;
        let upstream: Weak<dyn CancelTarget> = Arc::downgrade(&self.shared) as Weak<dyn CancelTarget>;
        lock_unpoisoned(&derived.shared.upstream).push(upstream);
        derived
    }
}

/// Producer side of a [`CancellableFuture`].
pub struct Completer<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for Completer<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T> fmt::Debug for Completer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Completer").finish_non_exhaustive()
    }
}

impl<T: Send + 'static> Completer<T> {
    pub fn complete(&self, value: T) -> bool {
        self.shared.complete(value)
    }

    pub fn complete_exceptionally(&self, error: Error) -> bool {
        self.shared.fail(error)
    }

    pub fn cancel(&self) -> bool {
        self.shared.cancel_once()
    }

    /// Settles the future with a precomputed outcome.
    pub fn resolve(&self, outcome: Outcome<T>) {
        self.shared.settle_from(outcome);
    }

    pub fn is_done(&self) -> bool {
        lock_unpoisoned(&self.shared.cell).done
    }

    pub fn is_work_cancelled(&self) -> bool {
        self.shared.work_cancelled.load(Ordering::SeqCst)
    }
}

/// Type-erased, cloneable way to cancel a future without owning it.
#[derive(Clone)]
pub struct CancelHandle {
    target: Arc<dyn CancelTarget>,
}

impl fmt::Debug for CancelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancelHandle")
            .field("cancelled", &self.target.target_cancelled())
            .finish()
    }
}

impl CancelHandle {
    pub fn cancel(&self) -> bool {
        self.target.cancel_target()
    }

    pub fn is_cancelled(&self) -> bool {
        self.target.target_cancelled()
    }
}

impl Cancelable for CancelHandle {
    fn cancel(&self) {
        self.target.cancel_target();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use super::{Cancelable, CancellableFuture, Outcome};
    use crate::error::Error;

    #[derive(Default)]
    struct Counter(AtomicUsize);

    impl Cancelable for Counter {
        fn cancel(&self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn completes_once() {
        let future = CancellableFuture::new();
        let completer = future.completer();
        assert!(completer.complete(1));
        assert!(!completer.complete(2));
        assert!(!future.complete_exceptionally(Error::Cancelled));
        assert!(future.is_done());
        assert_eq!(future.wait().expect("value"), 1);
    }

    #[test]
    fn cancel_runs_hook_and_resources_once() {
        let hook_runs = Arc::new(AtomicUsize::new(0));
        let resource = Arc::new(Counter::default());
        let future = CancellableFuture::<u32>::new();
        let runs = Arc::clone(&hook_runs);
        future.set_cancel_hook(move || {
            runs.fetch_add(1, Ordering::SeqCst);
        });
        future.attach_arc(resource.clone());

        assert!(future.cancel());
        assert!(!future.cancel_work());
        assert!(!future.complete(3));

        assert_eq!(hook_runs.load(Ordering::SeqCst), 1);
        assert_eq!(resource.0.load(Ordering::SeqCst), 1);
        assert!(future.is_cancelled());
        assert!(future.wait_outcome().is_cancelled());
    }

    #[test]
    fn late_attachment_is_cancelled_immediately() {
        let future = CancellableFuture::<u32>::new();
        future.cancel();
        let resource = Arc::new(Counter::default());
        future.attach_arc(resource.clone());
        assert_eq!(resource.0.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn map_and_try_map_transform_values_and_errors() {
        let source = CancellableFuture::new();
        let completer = source.completer();
        let mapped = source.map(|value: u32| value * 2).try_map(|value| {
            if value > 10 {
                Err(Error::Internal {
                    message: "too big".to_owned(),
                })
            } else {
                Ok(value.to_string())
            }
        });
        completer.complete(4);
        assert_eq!(mapped.wait().expect("mapped value"), "8");

        let failing = CancellableFuture::completed(6_u32)
            .map(|value| value * 2)
            .try_map(|value| {
                if value > 10 {
                    Err(Error::Internal {
                        message: "too big".to_owned(),
                    })
                } else {
                    Ok(value)
                }
            });
        match failing.wait_outcome() {
            Outcome::Failed(Error::Internal { message }) => assert_eq!(message, "too big"),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn compose_chains_and_forwards_cancellation() {
        let inner = CancellableFuture::<u32>::new();
        let inner_handle = inner.cancel_handle();
        let composed = CancellableFuture::completed(1_u32).compose(move |_| inner);

        assert!(composed.cancel());
        assert!(inner_handle.is_cancelled());
    }

    #[test]
    fn wait_timeout_returns_the_pending_future() {
        let future = CancellableFuture::<u32>::new();
        let completer = future.completer();
        let future = match future.wait_timeout(Duration::from_millis(10)) {
            Ok(outcome) => panic!("unexpected outcome: {outcome:?}"),
            Err(future) => future,
        };
        completer.complete(5);
        match future.wait_timeout(Duration::from_secs(5)) {
            Ok(Outcome::Value(value)) => assert_eq!(value, 5),
            Ok(other) => panic!("unexpected outcome: {other:?}"),
            Err(_) => panic!("future should be complete"),
        }
    }

    #[test]
    fn unbounded_wait_timeout_returns_a_completed_value() {
        match CancellableFuture::completed(5_u32).wait_timeout(Duration::MAX) {
            Ok(Outcome::Value(value)) => assert_eq!(value, 5),
            Ok(other) => panic!("unexpected outcome: {other:?}"),
            Err(_) => panic!("future should be complete"),
        }
    }

    #[test]
    fn spawn_runs_work_on_another_thread() {
        let future = CancellableFuture::spawn(|| Ok(thread_name()));
        let name = future.wait().expect("spawned value");
        assert_eq!(name.as_deref(), Some("netq-future"));
    }

    fn thread_name() -> Option<String> {
        std::thread::current().name().map(str::to_owned)
    }

    #[test]
    fn on_complete_runs_immediately_when_done() {
        let seen = Arc::new(AtomicUsize::new(0));
        let observed = Arc::clone(&seen);
        CancellableFuture::completed(7_usize).on_complete(move |outcome| {
            if let Outcome::Value(value) = outcome {
                observed.store(value, Ordering::SeqCst);
            }
        });
        assert_eq!(seen.load(Ordering::SeqCst), 7);
    }
}
