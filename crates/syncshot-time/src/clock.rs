//! Clock implementations and the deadline spin-wait

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use syncshot_core::Timestamp;

/// Final stretch before a deadline that is polled without sleeping
pub const DEFAULT_SPIN_WINDOW: Duration = Duration::from_millis(2);

/// Source of fleet-clock timestamps
pub trait Clock: Send + Sync {
    fn now(&self) -> Timestamp;
}

/// The host wall clock, kept within the fleet skew bound by the external
/// clock-sync service
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Timestamp {
        // A clock set before 1970 reads as zero: every deadline is then in
        // the future and the agent simply waits.
        let since_epoch = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or(Duration::ZERO);
        Timestamp::from_nanos(syncshot_core::duration_as_nanos(since_epoch))
    }
}

/// A clock running a fixed offset away from another one.
///
/// Models a host whose clock-sync service leaves it `offset_nanos` off the
/// fleet reference.
#[derive(Clone, Debug)]
pub struct OffsetClock<C> {
    inner: C,
    offset_nanos: i64,
}

impl<C: Clock> OffsetClock<C> {
    pub fn new(inner: C, offset_nanos: i64) -> Self {
        OffsetClock {
            inner,
            offset_nanos,
        }
    }

    pub fn offset_nanos(&self) -> i64 {
        self.offset_nanos
    }
}

impl<C: Clock> Clock for OffsetClock<C> {
    fn now(&self) -> Timestamp {
        let base = self.inner.now().as_nanos() as i128;
        let shifted = (base + self.offset_nanos as i128).clamp(0, u64::MAX as i128);
        Timestamp::from_nanos(shifted as u64)
    }
}

impl<C: Clock + ?Sized> Clock for std::sync::Arc<C> {
    fn now(&self) -> Timestamp {
        (**self).now()
    }
}

impl<C: Clock + ?Sized> Clock for &C {
    fn now(&self) -> Timestamp {
        (**self).now()
    }
}

/// When a spin-wait actually returned relative to its deadline
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WakeReport {
    pub deadline: Timestamp,
    pub woke_at: Timestamp,
}

impl WakeReport {
    /// How far past the deadline the wait returned
    pub fn lateness(&self) -> Duration {
        self.woke_at.saturating_duration_since(self.deadline)
    }
}

/// Block the calling thread until `clock` reads at least `deadline`.
///
/// While more than `spin_window` remains the thread sleeps; inside the
/// window it polls the clock in a tight loop, yielding between polls, so the
/// wake-up lands within microseconds of the deadline instead of the
/// scheduler's millisecond granularity. The cost is one busy core for at
/// most `spin_window`. Must not be called on an async executor thread.
pub fn spin_until<C: Clock + ?Sized>(clock: &C, deadline: Timestamp, spin_window: Duration) -> WakeReport {
    loop {
        let now = clock.now();
        if now >= deadline {
            return WakeReport {
                deadline,
                woke_at: now,
            };
        }

        let remaining = deadline.saturating_duration_since(now);
        if remaining > spin_window {
            std::thread::sleep(remaining - spin_window);
        } else {
            std::hint::spin_loop();
            std::thread::yield_now();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn test_system_clock_advances() {
        let clock = SystemClock;
        let t1 = clock.now();
        std::thread::sleep(Duration::from_millis(2));
        let t2 = clock.now();

        assert!(t2 > t1);
    }

    #[test]
    fn test_offset_clock() {
        let ahead = OffsetClock::new(SystemClock, 5_000_000);
        let base = SystemClock.now();
        let shifted = ahead.now();

        let diff = shifted.signed_nanos_since(base);
        // 5ms ahead, give or take the time between the two reads
        assert!(diff >= 5_000_000 && diff < 6_000_000);

        let far_behind = OffsetClock::new(SystemClock, i64::MIN);
        assert_eq!(far_behind.now(), Timestamp::ZERO);
    }

    #[test]
    fn test_spin_until_past_deadline_returns_immediately() {
        let clock = SystemClock;
        let deadline = Timestamp::from_nanos(1);
        let report = spin_until(&clock, deadline, DEFAULT_SPIN_WINDOW);

        assert!(report.woke_at >= deadline);
    }

    #[test]
    fn test_spin_until_hits_deadline() {
        let clock = SystemClock;
        let deadline = clock.now() + Duration::from_millis(20);
        let start = Instant::now();

        let report = spin_until(&clock, deadline, DEFAULT_SPIN_WINDOW);

        assert!(report.woke_at >= deadline);
        assert!(start.elapsed() >= Duration::from_millis(19));
        // Generous bound: CI machines get descheduled
        assert!(report.lateness() < Duration::from_millis(5));
    }
}
