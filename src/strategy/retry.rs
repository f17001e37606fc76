use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::clock::{Clock, SystemClock};
use crate::error::{Error, TransportErrorKind};
use crate::util::lock_unpoisoned;

/// Statuses treated as transient by every policy that does not take its own set.
pub const DEFAULT_RETRYABLE_STATUSES: [u16; 6] = [408, 429, 500, 502, 503, 504];
pub const RATE_LIMIT_STATUSES: [u16; 3] = [429, 503, 408];
pub const LARGE_PAYLOAD_THRESHOLD_BYTES: u64 = 256 * 1024;

/// Decides whether a failed attempt is worth another try.
///
/// Policies take `&mut self` because several of them count attempts or keep
/// breaker state. An instance belongs to one command; wrap it in
/// [`SharedRetryPolicy`] to share it deliberately.
pub trait RetryPolicy: Send {
    fn should_retry_on_status(&mut self, status: u16, idempotent: bool) -> bool;

    fn should_retry_on_error(&mut self, error: &Error, idempotent: bool) -> bool;
}

impl<P: RetryPolicy + ?Sized> RetryPolicy for Box<P> {
    fn should_retry_on_status(&mut self, status: u16, idempotent: bool) -> bool {
        (**self).should_retry_on_status(status, idempotent)
    }

    fn should_retry_on_error(&mut self, error: &Error, idempotent: bool) -> bool {
        (**self).should_retry_on_error(error, idempotent)
    }
}

fn is_default_retryable(status: u16) -> bool {
    DEFAULT_RETRYABLE_STATUSES.contains(&status)
}

#[derive(Clone, Copy, Debug, Default)]
pub struct NeverRetry;

impl RetryPolicy for NeverRetry {
    fn should_retry_on_status(&mut self, _status: u16, _idempotent: bool) -> bool {
        false
    }

    fn should_retry_on_error(&mut self, _error: &Error, _idempotent: bool) -> bool {
        false
    }
}

/// Retries a fixed set of statuses and any transient I/O fault.
#[derive(Clone, Debug)]
pub struct StatusWhitelistRetryPolicy {
    allowed: HashSet<u16>,
    require_idempotent: bool,
}

impl StatusWhitelistRetryPolicy {
    pub fn new<I>(allowed: I, require_idempotent: bool) -> Self
    where
        I: IntoIterator<Item = u16>,
    {
        Self {
            allowed: allowed.into_iter().collect(),
            require_idempotent,
        }
    }

    fn gate(&self, idempotent: bool) -> bool {
        !self.require_idempotent || idempotent
    }
}

impl Default for StatusWhitelistRetryPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_RETRYABLE_STATUSES, true)
    }
}

impl RetryPolicy for StatusWhitelistRetryPolicy {
    fn should_retry_on_status(&mut self, status: u16, idempotent: bool) -> bool {
        self.gate(idempotent) && self.allowed.contains(&status)
    }

    fn should_retry_on_error(&mut self, error: &Error, idempotent: bool) -> bool {
        self.gate(idempotent) && error.is_transient_io()
    }
}

/// Retries idempotent commands on transient statuses and on a chosen set of
/// transport fault kinds.
#[derive(Clone, Debug)]
pub struct ErrorCategoryRetryPolicy {
    kinds: HashSet<TransportErrorKind>,
    retry_timeouts: bool,
}

impl ErrorCategoryRetryPolicy {
    pub fn new() -> Self {
        Self {
            kinds: [
                TransportErrorKind::Dns,
                TransportErrorKind::Connect,
                TransportErrorKind::Tls,
                TransportErrorKind::Read,
                TransportErrorKind::Write,
                TransportErrorKind::Other,
            ]
            .into_iter()
            .collect(),
            retry_timeouts: true,
        }
    }

    pub fn kinds<I>(mut self, kinds: I) -> Self
    where
        I: IntoIterator<Item = TransportErrorKind>,
    {
        self.kinds = kinds.into_iter().collect();
        self
    }

    pub const fn retry_timeouts(mut self, retry_timeouts: bool) -> Self {
        self.retry_timeouts = retry_timeouts;
        self
    }
}

impl Default for ErrorCategoryRetryPolicy {
    fn default() -> Self {
        Self::new()
    }
}

impl RetryPolicy for ErrorCategoryRetryPolicy {
    fn should_retry_on_status(&mut self, status: u16, idempotent: bool) -> bool {
        idempotent && is_default_retryable(status)
    }

    fn should_retry_on_error(&mut self, error: &Error, idempotent: bool) -> bool {
        if !idempotent {
            return false;
        }
        match error {
            Error::Transport { kind, .. } => self.kinds.contains(kind),
            Error::Timeout { .. } => self.retry_timeouts,
            _ => false,
        }
    }
}

/// Stops retrying once an elapsed-time budget, measured from the first
/// retry decision, is spent.
pub struct DeadlineRetryPolicy {
    budget: Duration,
    started_at: Option<Instant>,
    clock: Arc<dyn Clock>,
}

impl DeadlineRetryPolicy {
    pub fn new(budget: Duration) -> Self {
        Self::with_clock(budget, Arc::new(SystemClock))
    }

    pub fn with_clock(budget: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            budget,
            started_at: None,
            clock,
        }
    }

    fn within_budget(&mut self) -> bool {
        let now = self.clock.now();
        let started_at = *self.started_at.get_or_insert(now);
        now.saturating_duration_since(started_at) < self.budget
    }
}

impl RetryPolicy for DeadlineRetryPolicy {
    fn should_retry_on_status(&mut self, status: u16, idempotent: bool) -> bool {
        idempotent && self.within_budget() && is_default_retryable(status)
    }

    fn should_retry_on_error(&mut self, error: &Error, idempotent: bool) -> bool {
        idempotent && self.within_budget() && error.is_transient_io()
    }
}

/// Grants one free retry on `401` so a credential refresh can happen, then
/// defers to a base policy.
pub struct AuthAwareRetryPolicy {
    refreshed: bool,
    base: Box<dyn RetryPolicy>,
}

impl AuthAwareRetryPolicy {
    pub fn new(require_idempotent: bool) -> Self {
        Self::with_base(StatusWhitelistRetryPolicy::new(
            DEFAULT_RETRYABLE_STATUSES,
            require_idempotent,
        ))
    }

    pub fn with_base(base: impl RetryPolicy + 'static) -> Self {
        Self {
            refreshed: false,
            base: Box::new(base),
        }
    }
}

impl RetryPolicy for AuthAwareRetryPolicy {
    fn should_retry_on_status(&mut self, status: u16, idempotent: bool) -> bool {
        if status == 401 && !self.refreshed {
            self.refreshed = true;
            return true;
        }
        self.base.should_retry_on_status(status, idempotent)
    }

    fn should_retry_on_error(&mut self, error: &Error, idempotent: bool) -> bool {
        self.base.should_retry_on_error(error, idempotent)
    }
}

/// Treats non-idempotent commands as safe to retry when they carry an
/// idempotency key.
#[derive(Clone, Copy, Debug)]
pub struct IdempotencyKeyRetryPolicy {
    has_key: bool,
}

impl IdempotencyKeyRetryPolicy {
    pub const fn new(has_key: bool) -> Self {
        Self { has_key }
    }
}

impl RetryPolicy for IdempotencyKeyRetryPolicy {
    fn should_retry_on_status(&mut self, status: u16, idempotent: bool) -> bool {
        (idempotent || self.has_key) && is_default_retryable(status)
    }

    fn should_retry_on_error(&mut self, error: &Error, idempotent: bool) -> bool {
        (idempotent || self.has_key) && error.is_transient_io()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug)]
enum CircuitState {
    Closed { consecutive_failures: usize },
    Open { opened_at: Instant },
    HalfOpen,
}

/// Consecutive retryable failures open the circuit; while open nothing is
/// retried. After the cooldown one trial decision is let through.
pub struct CircuitBreakerRetryPolicy {
    failure_threshold: usize,
    open_timeout: Duration,
    state: CircuitState,
    clock: Arc<dyn Clock>,
}

impl CircuitBreakerRetryPolicy {
    pub fn new(failure_threshold: usize, open_timeout: Duration) -> Self {
        Self::with_clock(failure_threshold, open_timeout, Arc::new(SystemClock))
    }

    pub fn with_clock(
        failure_threshold: usize,
        open_timeout: Duration,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            failure_threshold: failure_threshold.max(1),
            open_timeout,
            state: CircuitState::Closed {
                consecutive_failures: 0,
            },
            clock,
        }
    }

    pub fn state(&self) -> BreakerState {
        match self.state {
            CircuitState::Closed { .. } => BreakerState::Closed,
            CircuitState::Open { .. } => BreakerState::Open,
            CircuitState::HalfOpen => BreakerState::HalfOpen,
        }
    }

    fn allow_trial(&mut self) -> bool {
        if let CircuitState::Open { opened_at } = self.state {
            let elapsed = self.clock.now().saturating_duration_since(opened_at);
            if elapsed < self.open_timeout {
                return false;
            }
            self.state = CircuitState::HalfOpen;
        }
        true
    }

    fn record(&mut self, failed: bool) {
        if !failed {
            self.state = CircuitState::Closed {
                consecutive_failures: 0,
            };
            return;
        }
        match &mut self.state {
            CircuitState::Closed {
                consecutive_failures,
            } => {
                *consecutive_failures = consecutive_failures.saturating_add(1);
                if *consecutive_failures >= self.failure_threshold {
                    self.state = CircuitState::Open {
                        opened_at: self.clock.now(),
                    };
                }
            }
            CircuitState::HalfOpen | CircuitState::Open { .. } => {
                self.state = CircuitState::Open {
                    opened_at: self.clock.now(),
                };
            }
        }
    }
}

impl RetryPolicy for CircuitBreakerRetryPolicy {
    fn should_retry_on_status(&mut self, status: u16, idempotent: bool) -> bool {
        if !self.allow_trial() {
            return false;
        }
        let retry = idempotent && is_default_retryable(status);
        self.record(retry);
        retry
    }

    fn should_retry_on_error(&mut self, error: &Error, idempotent: bool) -> bool {
        if !self.allow_trial() {
            return false;
        }
        let retry = idempotent && error.is_transient_io();
        self.record(retry);
        retry
    }
}

/// Cooperates with server rate limiting: only 429, 503 and 408 are retried.
#[derive(Clone, Copy, Debug, Default)]
pub struct RateLimitAwareRetryPolicy;

impl RetryPolicy for RateLimitAwareRetryPolicy {
    fn should_retry_on_status(&mut self, status: u16, idempotent: bool) -> bool {
        idempotent && RATE_LIMIT_STATUSES.contains(&status)
    }

    fn should_retry_on_error(&mut self, error: &Error, idempotent: bool) -> bool {
        idempotent && error.is_transient_io()
    }
}

/// Caps the number of retries and never retries a non-idempotent command
/// whose body exceeds [`LARGE_PAYLOAD_THRESHOLD_BYTES`].
#[derive(Clone, Copy, Debug)]
pub struct PayloadSensitiveRetryPolicy {
    payload_bytes: u64,
    max_retries: u32,
    tries: u32,
}

impl PayloadSensitiveRetryPolicy {
    pub const fn new(payload_bytes: u64, max_retries: u32) -> Self {
        Self {
            payload_bytes,
            max_retries,
            tries: 0,
        }
    }

    fn too_large(&self, idempotent: bool) -> bool {
        !idempotent && self.payload_bytes > LARGE_PAYLOAD_THRESHOLD_BYTES
    }

    fn take_try(&mut self) -> bool {
        self.tries = self.tries.saturating_add(1);
        self.tries <= self.max_retries
    }
}

impl RetryPolicy for PayloadSensitiveRetryPolicy {
    fn should_retry_on_status(&mut self, status: u16, idempotent: bool) -> bool {
        if self.too_large(idempotent) {
            return false;
        }
        is_default_retryable(status) && self.take_try()
    }

    fn should_retry_on_error(&mut self, error: &Error, idempotent: bool) -> bool {
        if self.too_large(idempotent) {
            return false;
        }
        error.is_transient_io() && self.take_try()
    }
}

/// One fast retry for the first failure of an idempotent read; after that
/// only 429 is retried.
#[derive(Clone, Copy, Debug, Default)]
pub struct CacheFriendlyGetRetryPolicy {
    fast_retry_done: bool,
}

impl RetryPolicy for CacheFriendlyGetRetryPolicy {
    fn should_retry_on_status(&mut self, status: u16, idempotent: bool) -> bool {
        if !idempotent {
            return false;
        }
        if !self.fast_retry_done {
            self.fast_retry_done = true;
            return matches!(status, 500 | 502 | 503 | 504 | 408);
        }
        status == 429
    }

    fn should_retry_on_error(&mut self, error: &Error, idempotent: bool) -> bool {
        if !idempotent || self.fast_retry_done {
            return false;
        }
        self.fast_retry_done = true;
        error.is_transient_io()
    }
}

/// Keeps a sliding window of retry decisions and stops retrying once the
/// share of non-retryable outcomes reaches `max_error_rate`.
pub struct AdaptiveErrorRateRetryPolicy {
    max_events: usize,
    max_error_rate: f64,
    window: Duration,
    events: VecDeque<(Instant, bool)>,
    clock: Arc<dyn Clock>,
}

impl AdaptiveErrorRateRetryPolicy {
    pub fn new(max_events: usize, max_error_rate: f64, window: Duration) -> Self {
        Self::with_clock(max_events, max_error_rate, window, Arc::new(SystemClock))
    }

    pub fn with_clock(
        max_events: usize,
        max_error_rate: f64,
        window: Duration,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            max_events: max_events.max(1),
            max_error_rate: max_error_rate.clamp(0.0, 1.0),
            window,
            events: VecDeque::new(),
            clock,
        }
    }

    pub fn error_rate(&self) -> f64 {
        if self.events.is_empty() {
            return 0.0;
        }
        let errors = self.events.iter().filter(|(_, error)| *error).count();
        errors as f64 / self.events.len() as f64
    }

    fn evict_expired(&mut self, now: Instant) {
        while let Some((at, _)) = self.events.front() {
            if now.saturating_duration_since(*at) <= self.window {
                break;
            }
            self.events.pop_front();
        }
    }

    fn decide(&mut self, transient: bool) -> bool {
        let now = self.clock.now();
        self.evict_expired(now);
        let retry = transient && self.error_rate() < self.max_error_rate;
        self.events.push_back((now, !retry));
        while self.events.len() > self.max_events {
            self.events.pop_front();
        }
        retry
    }
}

impl RetryPolicy for AdaptiveErrorRateRetryPolicy {
    fn should_retry_on_status(&mut self, status: u16, idempotent: bool) -> bool {
        self.decide(idempotent && is_default_retryable(status))
    }

    fn should_retry_on_error(&mut self, error: &Error, idempotent: bool) -> bool {
        self.decide(idempotent && error.is_transient_io())
    }
}

/// Retries only when every member agrees. Members are consulted in order
/// and evaluation stops at the first refusal.
#[derive(Default)]
pub struct CombinedRetryPolicy {
    policies: Vec<Box<dyn RetryPolicy>>,
}

impl CombinedRetryPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, policy: impl RetryPolicy + 'static) -> Self {
        self.policies.push(Box::new(policy));
        self
    }
}

impl RetryPolicy for CombinedRetryPolicy {
    fn should_retry_on_status(&mut self, status: u16, idempotent: bool) -> bool {
        self.policies
            .iter_mut()
            .all(|policy| policy.should_retry_on_status(status, idempotent))
    }

    fn should_retry_on_error(&mut self, error: &Error, idempotent: bool) -> bool {
        self.policies
            .iter_mut()
            .all(|policy| policy.should_retry_on_error(error, idempotent))
    }
}

/// Thread-safe wrapper for a policy whose state should span many commands,
/// such as one circuit breaker per upstream host. Clones share the policy.
pub struct SharedRetryPolicy<P> {
    inner: Arc<Mutex<P>>,
}

impl<P> SharedRetryPolicy<P> {
    pub fn new(policy: P) -> Self {
        Self {
            inner: Arc::new(Mutex::new(policy)),
        }
    }

    pub fn with_policy<R>(&self, inspect: impl FnOnce(&P) -> R) -> R {
        inspect(&lock_unpoisoned(&self.inner))
    }
}

impl<P> Clone for SharedRetryPolicy<P> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<P: RetryPolicy> RetryPolicy for SharedRetryPolicy<P> {
    fn should_retry_on_status(&mut self, status: u16, idempotent: bool) -> bool {
        lock_unpoisoned(&self.inner).should_retry_on_status(status, idempotent)
    }

    fn should_retry_on_error(&mut self, error: &Error, idempotent: bool) -> bool {
        lock_unpoisoned(&self.inner).should_retry_on_error(error, idempotent)
    }
}
