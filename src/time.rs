use std::sync::atomic::{AtomicI64, Ordering};

use time::OffsetDateTime;

/// Explicit time source, threaded through every operation that compares
/// against "now" (spec §4.4: "all take a caller-provided `now()`"), per the
/// "ambient framework globals → explicit context" guidance in spec §9.
pub trait Clock: Send + Sync + std::fmt::Debug {
    fn now(&self) -> OffsetDateTime;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> OffsetDateTime {
        OffsetDateTime::now_utc()
    }
}

/// Deterministic clock for tests: starts at a fixed instant and only moves
/// when advanced explicitly, so reclamation-cycle and expiry tests never
/// need to sleep for real.
#[derive(Debug)]
pub struct FixedClock {
    unix_nanos: AtomicI64,
}

impl FixedClock {
    pub fn new(at: OffsetDateTime) -> Self {
        Self {
            unix_nanos: AtomicI64::new((at.unix_timestamp_nanos() as i64).max(i64::MIN)),
        }
    }

    pub fn advance(&self, duration: std::time::Duration) {
        self.unix_nanos
            .fetch_add(duration.as_nanos() as i64, Ordering::SeqCst);
    }
}

impl Clock for FixedClock {
    fn now(&self) -> OffsetDateTime {
        let nanos = self.unix_nanos.load(Ordering::SeqCst) as i128;
        OffsetDateTime::from_unix_timestamp_nanos(nanos).expect("fixed clock holds a valid instant")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[test]
    fn fixed_clock_advances_only_when_told() {
        let clock = FixedClock::new(datetime!(2026-01-01 00:00:00 UTC));
        let t0 = clock.now();
        assert_eq!(t0, clock.now());
        clock.advance(std::time::Duration::from_secs(3600));
        assert_eq!(clock.now(), t0 + time::Duration::hours(1));
    }
}
