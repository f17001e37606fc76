use std::sync::Mutex;
use std::time::{Duration, Instant, SystemTime};

use crate::util::lock_unpoisoned;

/// Time source used by deadline, breaker and error-rate strategies.
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;

    /// Wall-clock time, used to resolve `Retry-After` HTTP-dates.
    fn now_system(&self) -> SystemTime;
}

#[derive(Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn now_system(&self) -> SystemTime {
        SystemTime::now()
    }
}

/// Clock that only moves when told to. Useful for exercising time-based
/// strategies deterministically.
#[derive(Debug)]
pub struct ManualClock {
    origin: Instant,
    system_origin: SystemTime,
    elapsed: Mutex<Duration>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::starting_at(SystemTime::now())
    }

    /// Pins the wall-clock reading to `system_origin`.
    pub fn starting_at(system_origin: SystemTime) -> Self {
        Self {
            origin: Instant::now(),
            system_origin,
            elapsed: Mutex::new(Duration::ZERO),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut elapsed = lock_unpoisoned(&self.elapsed);
        *elapsed = elapsed.saturating_add(by);
    }

    pub fn elapsed(&self) -> Duration {
        *lock_unpoisoned(&self.elapsed)
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.origin + self.elapsed()
    }

    fn now_system(&self) -> SystemTime {
        self.system_origin + self.elapsed()
    }
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, SystemTime};

    use super::{Clock, ManualClock};

    #[test]
    fn manual_clock_moves_only_when_advanced() {
        let clock = ManualClock::new();
        let start = clock.now();
        assert_eq!(clock.now(), start);

        clock.advance(Duration::from_millis(250));
        assert_eq!(clock.now().duration_since(start), Duration::from_millis(250));
    }

    #[test]
    fn manual_wall_clock_advances_with_elapsed_time() {
        let origin = SystemTime::UNIX_EPOCH + Duration::from_secs(1_000_000);
        let clock = ManualClock::starting_at(origin);
        assert_eq!(clock.now_system(), origin);

        clock.advance(Duration::from_secs(3));
        assert_eq!(clock.now_system(), origin + Duration::from_secs(3));
        assert_eq!(clock.elapsed(), Duration::from_secs(3));
    }
}
