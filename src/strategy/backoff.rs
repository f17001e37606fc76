use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use rand::Rng;

use crate::clock::{Clock, SystemClock};
use crate::util::parse_retry_after;

pub const DEFAULT_BACKOFF_BASE: Duration = Duration::from_millis(300);
pub const DEFAULT_BACKOFF_CAP: Duration = Duration::from_secs(8);

/// Computes the pause between attempts.
///
/// `next_delay` receives the previous delay and the `Retry-After` value of
/// the failed response, if any. Inside a command, HTTP-dates arrive already
/// converted to delta seconds against the command's clock. A positive
/// parseable header always wins over the computed delay.
pub trait BackoffStrategy: Send {
    fn initial_delay(&mut self) -> Duration;

    fn next_delay(&mut self, current: Duration, retry_after: Option<&str>) -> Duration;
}

impl<B: BackoffStrategy + ?Sized> BackoffStrategy for Box<B> {
    fn initial_delay(&mut self) -> Duration {
        (**self).initial_delay()
    }

    fn next_delay(&mut self, current: Duration, retry_after: Option<&str>) -> Duration {
        (**self).next_delay(current, retry_after)
    }
}

/// Source of the current system load in `[0, 1]`.
pub trait LoadProbe: Send + Sync {
    fn load_factor(&self) -> f64;
}

impl<F> LoadProbe for F
where
    F: Fn() -> f64 + Send + Sync,
{
    fn load_factor(&self) -> f64 {
        self()
    }
}

/// Delay requested by a `Retry-After` value. Zero and unparseable values
/// yield `None` so the algorithm decides.
pub fn retry_after_delay(retry_after: Option<&str>) -> Option<Duration> {
    retry_after_delay_at(retry_after, SystemTime::now())
}

/// Same as [`retry_after_delay`] with HTTP-dates measured from `now`.
pub fn retry_after_delay_at(retry_after: Option<&str>, now: SystemTime) -> Option<Duration> {
    let raw_value = retry_after?;
    parse_retry_after(raw_value, now).filter(|delay| !delay.is_zero())
}

fn doubled_with_cap(current: Duration, base: Duration, cap: Duration) -> Duration {
    if current.is_zero() {
        base
    } else {
        current.saturating_mul(2).min(cap)
    }
}

fn random_fraction() -> f64 {
    rand::rng().random::<f64>()
}

#[derive(Clone, Copy, Debug)]
pub struct FixedBackoff {
    delay: Duration,
}

impl FixedBackoff {
    pub const fn new(delay: Duration) -> Self {
        Self { delay }
    }
}

impl BackoffStrategy for FixedBackoff {
    fn initial_delay(&mut self) -> Duration {
        self.delay
    }

    fn next_delay(&mut self, _current: Duration, retry_after: Option<&str>) -> Duration {
        retry_after_delay(retry_after).unwrap_or(self.delay)
    }
}

/// Doubles the previous delay up to `cap`.
#[derive(Clone, Copy, Debug)]
pub struct ExponentialBackoff {
    base: Duration,
    cap: Duration,
}

impl ExponentialBackoff {
    pub const fn new(base: Duration, cap: Duration) -> Self {
        Self { base, cap }
    }
}

impl BackoffStrategy for ExponentialBackoff {
    fn initial_delay(&mut self) -> Duration {
        self.base
    }

    fn next_delay(&mut self, current: Duration, retry_after: Option<&str>) -> Duration {
        retry_after_delay(retry_after)
            .unwrap_or_else(|| doubled_with_cap(current, self.base, self.cap))
    }
}

/// Uniform random delay in `[0, exponential]`.
#[derive(Clone, Copy, Debug)]
pub struct FullJitterBackoff {
    base: Duration,
    cap: Duration,
}

impl FullJitterBackoff {
    pub const fn new(base: Duration, cap: Duration) -> Self {
        Self { base, cap }
    }
}

impl Default for FullJitterBackoff {
    fn default() -> Self {
        Self::new(DEFAULT_BACKOFF_BASE, DEFAULT_BACKOFF_CAP)
    }
}

impl BackoffStrategy for FullJitterBackoff {
    fn initial_delay(&mut self) -> Duration {
        self.base
    }

    fn next_delay(&mut self, current: Duration, retry_after: Option<&str>) -> Duration {
        if let Some(delay) = retry_after_delay(retry_after) {
            return delay;
        }
        doubled_with_cap(current, self.base, self.cap).mul_f64(random_fraction())
    }
}

/// Half of the exponential delay fixed, the other half random.
#[derive(Clone, Copy, Debug)]
pub struct EqualJitterBackoff {
    base: Duration,
    cap: Duration,
}

impl EqualJitterBackoff {
    pub const fn new(base: Duration, cap: Duration) -> Self {
        Self { base, cap }
    }
}

impl BackoffStrategy for EqualJitterBackoff {
    fn initial_delay(&mut self) -> Duration {
        self.base
    }

    fn next_delay(&mut self, current: Duration, retry_after: Option<&str>) -> Duration {
        if let Some(delay) = retry_after_delay(retry_after) {
            return delay;
        }
        let half = doubled_with_cap(current, self.base, self.cap) / 2;
        half + half.mul_f64(random_fraction())
    }
}

/// `min(cap, max(base, random * previous * 3))`.
#[derive(Clone, Copy, Debug)]
pub struct DecorrelatedJitterBackoff {
    base: Duration,
    cap: Duration,
}

impl DecorrelatedJitterBackoff {
    pub const fn new(base: Duration, cap: Duration) -> Self {
        Self { base, cap }
    }
}

impl BackoffStrategy for DecorrelatedJitterBackoff {
    fn initial_delay(&mut self) -> Duration {
        self.base
    }

    fn next_delay(&mut self, current: Duration, retry_after: Option<&str>) -> Duration {
        if let Some(delay) = retry_after_delay(retry_after) {
            return delay;
        }
        let previous = if current.is_zero() { self.base } else { current };
        let spread = previous.saturating_mul(3).mul_f64(random_fraction());
        spread.max(self.base).min(self.cap)
    }
}

/// Delays grow along the Fibonacci sequence in multiples of `unit`.
#[derive(Clone, Copy, Debug)]
pub struct FibonacciBackoff {
    unit: Duration,
    cap: Duration,
    previous: u32,
    current: u32,
}

impl FibonacciBackoff {
    pub const fn new(unit: Duration, cap: Duration) -> Self {
        Self {
            unit,
            cap,
            previous: 0,
            current: 1,
        }
    }
}

impl BackoffStrategy for FibonacciBackoff {
    fn initial_delay(&mut self) -> Duration {
        self.unit
    }

    fn next_delay(&mut self, _current: Duration, retry_after: Option<&str>) -> Duration {
        if let Some(delay) = retry_after_delay(retry_after) {
            return delay;
        }
        let next = self.previous.saturating_add(self.current);
        self.previous = self.current;
        self.current = next;
        self.unit.saturating_mul(next).min(self.cap)
    }
}

/// Shrinks an inner strategy's delays to fit a total time budget: at most a
/// quarter of the remaining budget initially, half of it afterwards.
pub struct DeadlineAwareBackoff {
    budget: Duration,
    started_at: Option<Instant>,
    inner: Box<dyn BackoffStrategy>,
    clock: Arc<dyn Clock>,
}

impl DeadlineAwareBackoff {
    pub fn new(budget: Duration, inner: impl BackoffStrategy + 'static) -> Self {
        Self::with_clock(budget, inner, Arc::new(SystemClock))
    }

    pub fn with_clock(
        budget: Duration,
        inner: impl BackoffStrategy + 'static,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            budget,
            started_at: None,
            inner: Box::new(inner),
            clock,
        }
    }

    fn remaining(&mut self) -> Duration {
        let now = self.clock.now();
        let started_at = *self.started_at.get_or_insert(now);
        self.budget
            .saturating_sub(now.saturating_duration_since(started_at))
    }
}

impl BackoffStrategy for DeadlineAwareBackoff {
    fn initial_delay(&mut self) -> Duration {
        let inner = self.inner.initial_delay();
        inner.min(self.remaining() / 4)
    }

    fn next_delay(&mut self, current: Duration, retry_after: Option<&str>) -> Duration {
        let inner = self.inner.next_delay(current, retry_after);
        inner.min(self.remaining() / 2)
    }
}

/// Adds up to `extra_cap` on top of a base strategy, in proportion to the
/// load reported by a [`LoadProbe`].
pub struct QueueAwareBackoff {
    base: Box<dyn BackoffStrategy>,
    probe: Arc<dyn LoadProbe>,
    extra_cap: Duration,
}

impl QueueAwareBackoff {
    pub fn new(
        base: impl BackoffStrategy + 'static,
        probe: Arc<dyn LoadProbe>,
        extra_cap: Duration,
    ) -> Self {
        Self {
            base: Box::new(base),
            probe,
            extra_cap,
        }
    }
}

impl BackoffStrategy for QueueAwareBackoff {
    fn initial_delay(&mut self) -> Duration {
        self.base.initial_delay()
    }

    fn next_delay(&mut self, current: Duration, retry_after: Option<&str>) -> Duration {
        let delay = self.base.next_delay(current, retry_after);
        let load = self.probe.load_factor();
        let load = if load.is_nan() { 0.0 } else { load.clamp(0.0, 1.0) };
        delay.saturating_add(self.extra_cap.mul_f64(load))
    }
}

/// `short` for the first `switch_after` retries, `long` afterwards.
#[derive(Clone, Copy, Debug)]
pub struct BinaryBackoff {
    short: Duration,
    long: Duration,
    switch_after: u32,
    attempts: u32,
}

impl BinaryBackoff {
    pub const fn new(short: Duration, long: Duration, switch_after: u32) -> Self {
        Self {
            short,
            long,
            switch_after,
            attempts: 0,
        }
    }
}

impl BackoffStrategy for BinaryBackoff {
    fn initial_delay(&mut self) -> Duration {
        self.short
    }

    fn next_delay(&mut self, _current: Duration, retry_after: Option<&str>) -> Duration {
        if let Some(delay) = retry_after_delay(retry_after) {
            return delay;
        }
        self.attempts = self.attempts.saturating_add(1);
        if self.attempts <= self.switch_after {
            self.short
        } else {
            self.long
        }
    }
}

/// Uses `Retry-After` when present, otherwise asks the fallback without the
/// header.
pub struct HeaderFirstBackoff {
    fallback: Box<dyn BackoffStrategy>,
}

impl HeaderFirstBackoff {
    pub fn new(fallback: impl BackoffStrategy + 'static) -> Self {
        Self {
            fallback: Box::new(fallback),
        }
    }
}

impl Default for HeaderFirstBackoff {
    fn default() -> Self {
        Self::new(FullJitterBackoff::default())
    }
}

impl BackoffStrategy for HeaderFirstBackoff {
    fn initial_delay(&mut self) -> Duration {
        self.fallback.initial_delay()
    }

    fn next_delay(&mut self, current: Duration, retry_after: Option<&str>) -> Duration {
        retry_after_delay(retry_after).unwrap_or_else(|| self.fallback.next_delay(current, None))
    }
}
